use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use kscope_core::{Session, SessionConfig, UnitOutcome, tokenize};
use tracing_subscriber::EnvFilter;

/// コマンドライン引数を定義するための構造体
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Source file; without it each stdin line is compiled on its own
    #[arg(short, long)]
    input: Option<String>,

    /// Write the emitted text here instead of stdout
    #[arg(short, long)]
    output: Option<String>,

    #[arg(long, value_enum, default_value_t = Emit::Run, help = "What to print")]
    emit: Emit,

    #[arg(long, help = "Print each function's IR on stderr as it is lowered")]
    print_ir: bool,

    #[arg(long, value_name = "N", help = "Instruction budget for one evaluation")]
    step_limit: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Emit {
    /// Token stream
    Tokens,
    /// Parsed declarations
    Ast,
    /// The IR module after the last chunk
    Ir,
    /// Values of top-level expressions
    Run,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    execute(cli)
}

fn execute(cli: Cli) -> Result<()> {
    let chunks = match &cli.input {
        Some(path) => {
            vec![fs::read_to_string(path).with_context(|| format!("failed to read input file {path}"))?]
        }
        None => io::stdin()
            .lock()
            .lines()
            .collect::<io::Result<Vec<_>>>()
            .context("failed to read stdin")?,
    };

    let mut out: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(create_output(path)?),
        None => Box::new(io::stdout().lock()),
    };

    let mut config = SessionConfig {
        print_ir: cli.print_ir,
        ..SessionConfig::default()
    };
    if let Some(limit) = cli.step_limit {
        config.step_limit = limit;
    }
    let mut session = Session::new(config);

    let mut failed = 0usize;
    for chunk in &chunks {
        failed += emit_chunk(&mut session, cli.emit, chunk, &mut out)?;
        for ir in session.take_printed_ir() {
            eprint!("{ir}");
        }
    }
    if cli.emit == Emit::Ir {
        write!(out, "{}", session.module())?;
    }
    out.flush().context("failed to flush output")?;

    if failed > 0 {
        anyhow::bail!("{failed} unit(s) failed");
    }
    Ok(())
}

/// Handle one chunk, returning how many units failed.
fn emit_chunk(session: &mut Session, emit: Emit, chunk: &str, out: &mut dyn Write) -> Result<usize> {
    match emit {
        Emit::Tokens => match tokenize(chunk) {
            Ok(tokens) => {
                for token in tokens {
                    writeln!(out, "{}\t{}", token.position, token.kind)?;
                }
                Ok(0)
            }
            Err(err) => {
                eprintln!("error: {err}");
                Ok(1)
            }
        },
        Emit::Ast => match session.parse(chunk) {
            Ok(declarations) => {
                for decl in declarations {
                    writeln!(out, "{decl}")?;
                }
                Ok(0)
            }
            Err(err) => {
                eprintln!("error: {err}");
                Ok(1)
            }
        },
        Emit::Ir | Emit::Run => {
            let mut failed = 0;
            for outcome in session.process(chunk) {
                match outcome {
                    Ok(UnitOutcome::Evaluated(value)) if emit == Emit::Run => writeln!(out, "{value}")?,
                    Ok(unit) => tracing::info!(%unit),
                    Err(err) => {
                        eprintln!("error: {err}");
                        failed += 1;
                    }
                }
            }
            Ok(failed)
        }
    }
}

fn create_output(path: &str) -> Result<fs::File> {
    if let Some(parent) = PathBuf::from(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {parent:?}"))?;
        }
    }
    fs::File::create(path).with_context(|| format!("failed to create output file {path}"))
}

#[cfg(test)]
mod tests {
    use assert_cmd::Command;
    use predicates::prelude::*;
    use std::fs;
    use tempfile::tempdir;

    fn kscope() -> Command {
        Command::cargo_bin("kscope").expect("binary exists")
    }

    #[test]
    fn runs_a_file_as_one_chunk() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("input.ks");
        fs::write(
            &input_path,
            "# sum of 1..=n\n\
             def sum(n: double) -> double {\n\
                 var acc: double;\n\
                 for (i = 1, i < n) { acc = acc + i; }\n\
                 acc\n\
             }\n\
             exec sum(100)\n",
        )
        .expect("write input");

        kscope()
            .arg("--input")
            .arg(&input_path)
            .assert()
            .success()
            .stdout(predicate::str::contains("5050.000000"));
    }

    #[test]
    fn stdin_lines_are_separate_chunks() {
        kscope()
            .write_stdin("def add1(x: i32) -> i32 { x + 1 }\nexec add1(100)\nexec: double 1 + 2\n")
            .assert()
            .success()
            .stdout("101\n3.000000\n");
    }

    #[test]
    fn errors_go_to_stderr_and_fail_the_run() {
        kscope()
            .write_stdin("exec nope(1)\nexec: double 7\n")
            .assert()
            .failure()
            .stdout(predicate::str::contains("7.000000"))
            .stderr(predicate::str::contains("unknown function `nope`"));
    }

    #[test]
    fn emits_tokens() {
        kscope()
            .arg("--emit")
            .arg("tokens")
            .write_stdin("def f(x: double)\n")
            .assert()
            .success()
            .stdout(predicate::str::contains("0\t`def`"))
            .stdout(predicate::str::contains("4\tidentifier `f`"));
    }

    #[test]
    fn reports_lex_errors() {
        kscope()
            .arg("--emit")
            .arg("tokens")
            .write_stdin("1 $ 2\n")
            .assert()
            .success()
            .stdout(predicate::str::contains("`$`"));

        kscope()
            .write_stdin("exec 1 + é\n")
            .assert()
            .failure()
            .stderr(predicate::str::contains("lex error"));
    }

    #[test]
    fn emits_ast() {
        kscope()
            .arg("--emit")
            .arg("ast")
            .write_stdin("def f(x: double) -> double { x * 2 }\n")
            .assert()
            .success()
            .stdout(predicate::str::contains("(def f(x:double)->double"));
    }

    #[test]
    fn emits_ir_to_output_file() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("input.ks");
        fs::write(
            &input_path,
            "extern sin(x: double) -> double\n\
             def f(x: double) -> double { return if (x < 1) { sin(x) } else { x }; }\n",
        )
        .expect("write input");
        let output_path = dir.path().join("out").join("f.ll");

        kscope()
            .arg("--input")
            .arg(&input_path)
            .arg("--output")
            .arg(&output_path)
            .arg("--emit")
            .arg("ir")
            .assert()
            .success();

        let ir = fs::read_to_string(&output_path).expect("read ir");
        assert!(ir.contains("declare double @sin(double)"), "{ir}");
        assert!(ir.contains("define double @f(double %0)"), "{ir}");
        assert!(ir.contains("phi double"), "{ir}");
    }

    #[test]
    fn print_ir_writes_to_stderr() {
        kscope()
            .arg("--print-ir")
            .write_stdin("def two() -> double { 2 }\nexec two()\n")
            .assert()
            .success()
            .stdout("2.000000\n")
            .stderr(predicate::str::contains("define double @two()"));
    }

    #[test]
    fn step_limit_stops_runaway_loops() {
        kscope()
            .arg("--step-limit")
            .arg("500")
            .write_stdin(
                "def spin(n: double) -> double { var t: double; for (i = 0, i < n) { t = t + 1; } t }\n\
                 exec spin(1000000)\n",
            )
            .assert()
            .failure()
            .stderr(predicate::str::contains("step limit"));
    }

    #[test]
    fn missing_input_file_is_reported() {
        let dir = tempdir().expect("tempdir");
        kscope()
            .arg("--input")
            .arg(dir.path().join("missing.ks"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("failed to read input file"));
    }
}
