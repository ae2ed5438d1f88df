//! Host functions available to `extern` declarations.
//!
//! An `extern` only declares a signature; when the interpreter reaches a
//! call to a function without a body it looks the name up here. All host
//! functions take and return `double`.

use std::io::Write;

/// Metadata about a single host function.
#[derive(Debug, Clone, Copy)]
pub struct HostFunction {
    /// Name the function is declared under (`extern sin(x: double) -> double`).
    pub name: &'static str,
    pub arity: usize,
    pub call: fn(&[f64]) -> f64,
}

/// The complete list of host functions known to the interpreter.
pub const HOST_FUNCTIONS: &[HostFunction] = &[
    HostFunction {
        name: "sin",
        arity: 1,
        call: |args| args[0].sin(),
    },
    HostFunction {
        name: "cos",
        arity: 1,
        call: |args| args[0].cos(),
    },
    HostFunction {
        name: "sqrt",
        arity: 1,
        call: |args| args[0].sqrt(),
    },
    HostFunction {
        name: "exp",
        arity: 1,
        call: |args| args[0].exp(),
    },
    HostFunction {
        name: "log",
        arity: 1,
        call: |args| args[0].ln(),
    },
    HostFunction {
        name: "fabs",
        arity: 1,
        call: |args| args[0].abs(),
    },
    HostFunction {
        name: "pow",
        arity: 2,
        call: |args| args[0].powf(args[1]),
    },
    HostFunction {
        name: "printd",
        arity: 1,
        call: printd,
    },
    HostFunction {
        name: "putchard",
        arity: 1,
        call: putchard,
    },
];

/// Look up a host function by name.
pub fn find_host_function(name: &str) -> Option<&'static HostFunction> {
    HOST_FUNCTIONS.iter().find(|f| f.name == name)
}

// Output goes to stderr so that evaluated results on stdout stay clean.

fn printd(args: &[f64]) -> f64 {
    eprintln!("{:.6}", args[0]);
    0.0
}

fn putchard(args: &[f64]) -> f64 {
    let byte = args[0] as u8;
    let mut stderr = std::io::stderr();
    // Failing to echo a character is not an evaluation error.
    let _ = stderr.write_all(&[byte]);
    0.0
}
