//! End-to-end programs run through a [`Session`], one chunk per line.

use kscope_core::ast::{Declaration, Expr};
use kscope_core::{CoreError, PrecedenceTable, RuntimeValue, Session, parse};

/// Feed each line as its own chunk and render every outcome.
fn run(lines: &[&str]) -> Vec<String> {
    let mut session = Session::default();
    lines
        .iter()
        .flat_map(|line| session.process(line))
        .map(|outcome| match outcome {
            Ok(unit) => unit.to_string(),
            Err(err) => panic!("unexpected failure: {err}"),
        })
        .collect()
}

fn assert_program(lines: &[&str], expected: &[&str]) {
    assert_eq!(run(lines), expected);
}

#[test]
fn single() {
    assert_program(
        &[
            "def f(x: double) -> double { return x + x; }",
            "extern sin(x: double) -> double",
            "exec: double 2 + 3",
        ],
        &["defined `f`", "declared `sin`", "5.000000"],
    );
}

#[test]
fn arithmetic_folds_to_expected_values() {
    assert_program(
        &[
            "def g(x: double) -> double { return 2 + 3 + x; }",
            "def h(x: double, y: double) -> double { return x * y + y * x; }",
            "def i(x: double) -> double {return (1 + 2 + x)*(x + (1 + 2));};",
            "exec g(1)",
            "exec h(2, 3)",
            "exec i(1)",
        ],
        &["defined `g`", "defined `h`", "defined `i`", "6.000000", "12.000000", "16.000000"],
    );
}

#[test]
fn jit() {
    assert_program(
        &[
            "def f(x: double, y: double, z: double) -> double {return x * y + z;}",
            "exec f(4, 2, 3)",
            "exec f(1, 2, 3)",
        ],
        &["defined `f`", "11.000000", "5.000000"],
    );
}

#[test]
fn extern_host_functions() {
    assert_program(
        &[
            "extern sin(x: double) -> double",
            "extern cos(x: double) -> double",
            "def f(x: double) -> double {return sin(x) * sin(x) + cos(x) * cos(x);}",
            "exec f(1.0)",
            "exec f(4.0)",
        ],
        &["declared `sin`", "declared `cos`", "defined `f`", "1.000000", "1.000000"],
    );
}

#[test]
fn if_else_with_returns_in_branches() {
    assert_program(
        &[
            "def double(x: double) -> double {return x + x;}",
            "def triple(x: double) -> double {return x * 3;}",
            "def f(x: double) -> double {if (x < 3) {return double(x);} else {return triple(x);}};",
            "exec f(2)",
            "exec f(5)",
        ],
        &["defined `double`", "defined `triple`", "defined `f`", "4.000000", "15.000000"],
    );
}

#[test]
fn if_else_as_a_value() {
    assert_program(
        &[
            "def double(x: double) -> double {return x + x;}",
            "def triple(x: double) -> double {return x * 3;}",
            "def f(x: double) -> double {return if (x < 3) {double(x)} else {triple(x)}};",
            "exec f(2)",
            "exec f(5)",
        ],
        &["defined `double`", "defined `triple`", "defined `f`", "4.000000", "15.000000"],
    );
}

#[test]
fn loop_sums_inclusive_range() {
    assert_program(
        &[
            "def sum(n: double) -> double {var a: double = 0; var b: double = 0; for (i = 0: double, i < n) {b = a + b; a = a + 1;} return b; }",
            "exec sum(100)",
        ],
        &["defined `sum`", "5050.000000"],
    );
}

#[test]
fn user_defined_operators() {
    assert_program(
        &[
            "def unary ! (v: double) -> double {if (v) {return 0;} else {return 1;}};",
            "exec: double !1",
            "exec: double !0",
            "def binary | 5 (LHS: double, RHS: double) -> double {if (LHS) {return 1;} else {if (RHS) {return 1;} else {return 0;}}};",
            "exec: double 0|0",
            "exec: double 1|0",
            "def binary & 6 (LHS: double, RHS: double) -> double {if (!LHS) {return 0;} else {return !(!RHS);}};",
            "exec: double 1&0",
            "exec: double 1&1",
            "def binary > 10 (LHS: double, RHS: double) -> double {return RHS < LHS;};",
            "exec: double 1 > 2",
            "exec: double 2 > 1",
            "def binary == 9 (LHS: double, RHS: double) -> double {return !(RHS < LHS | RHS > LHS);};",
            "exec: double 1 == 0",
            "exec: double 1 == 1",
        ],
        &[
            "defined `unary!`",
            "0.000000",
            "1.000000",
            "defined `binary|`",
            "0.000000",
            "1.000000",
            "defined `binary&`",
            "0.000000",
            "1.000000",
            "defined `binary>`",
            "0.000000",
            "1.000000",
            "defined `binary==`",
            "0.000000",
            "1.000000",
        ],
    );
}

#[test]
fn loop_carried_variables() {
    assert_program(
        &[
            "def fibi(x: double) -> double {var a: double = 1; var b: double = 1; var c: double; for (i = 3: double, i < x) {c = a + b; a = b; b = c;} return b;};",
            "exec fibi(10)",
        ],
        &["defined `fibi`", "55.000000"],
    );
}

#[test]
fn constant_inside_loop() {
    assert_program(
        &[
            "def exp(x: double, n: double) -> double {val a: double = x; var t: double = 1; for (i = 1: double, i < n) {t = t * a;} return t;};",
            "exec exp(10, 3)",
        ],
        &["defined `exp`", "1000.000000"],
    );
}

#[test]
fn integer_accumulator_with_double_loop() {
    assert_program(
        &[
            "def sum(n: double) -> i32 {var a: i32 = 0; var b: i32 = 0; for (i = 0: double, i < n) {b = a + b; a = a + 1;} return b; }",
            "exec sum(100)",
        ],
        &["defined `sum`", "5050"],
    );
}

#[test]
fn integer_arguments() {
    assert_program(
        &["def myadd(n: i32) -> i32 {return n+1;}", "exec myadd(100)"],
        &["defined `myadd`", "101"],
    );
}

#[test]
fn array_load() {
    assert_program(
        &[
            "def f() -> double {var x:array%double%2 = [2, 3]:double; return x[1];}",
            "exec f()",
        ],
        &["defined `f`", "3.000000"],
    );
}

#[test]
fn array_store() {
    assert_program(
        &[
            "def f() -> double {var x:array%double%2 = [2, 3]:double; x[1] = 4; return x[1] + x[0];}",
            "exec f()",
        ],
        &["defined `f`", "6.000000"],
    );
}

#[test]
fn array_fibonacci() {
    assert_program(
        &[
            "def f(n: double) -> double {var x:array%double%2 = [1, 1]:double; for (i = 1: double, i < n - 2:double) {var tmp:double = x[1];x[1] = x[0] + x[1];x[0] = tmp;}; return x[1];}",
            "exec f(10)",
            "exec f(9)",
            "exec f(11)",
        ],
        &["defined `f`", "55.000000", "34.000000", "89.000000"],
    );
}

#[test]
fn nested_arrays() {
    assert_program(
        &[
            "def f() -> double {var x:array%array%double%2%2 = [[2, 2]:double, [3, 3]:double]:double; x[0][1] = 4; return x[0][1] + x[1][0];}",
            "exec f()",
        ],
        &["defined `f`", "7.000000"],
    );
}

#[test]
fn struct_simple() {
    assert_program(
        &[
            "struct Foo {a: double, b: double,}",
            "def f() -> double {var x: Foo; x.a = 1.0; return x.a;}",
            "exec f()",
        ],
        &["defined struct `Foo`", "defined `f`", "1.000000"],
    );
}

#[test]
fn struct_with_different_field_types() {
    assert_program(
        &[
            "struct Foo {a: i32, b: double,}",
            "def f() -> i32 {var x: Foo; x.a = 1; return x.a;}",
            "def g() -> double {var x: Foo; x.b = 2.0; return x.b;}",
            "exec f()",
            "exec g()",
        ],
        &["defined struct `Foo`", "defined `f`", "defined `g`", "1", "2.000000"],
    );
}

#[test]
fn struct_contains_array() {
    assert_program(
        &[
            "struct Foo { a: double, b: array%double%2, }",
            "def f() -> double { var x: Foo; x.b = [1.0, 2.0]: double; return x.b[1]; }",
            "exec f()",
        ],
        &["defined struct `Foo`", "defined `f`", "2.000000"],
    );
}

#[test]
fn struct_nested_in_array() {
    assert_program(
        &[
            "struct Foo {m: double, n: i32,}",
            "struct Bar {a: double, b: array%Foo%2,}",
            "def f() -> double {var x: Bar; x.b[1].m = 1.0; return x.b[1].m;}",
            "exec f()",
        ],
        &["defined struct `Foo`", "defined struct `Bar`", "defined `f`", "1.000000"],
    );
}

#[test]
fn function_declaration_shape() {
    let mut table = PrecedenceTable::new();
    let decls = parse("def f(x: double) -> double { return x + x; }", &mut table).unwrap();
    let [Declaration::Function(func)] = decls.as_slice() else {
        panic!("expected one function, got {decls:?}");
    };
    assert_eq!(func.prototype.name, "f");
    assert_eq!(func.prototype.args, vec![("x".to_string(), "double".to_string())]);
    assert_eq!(func.prototype.return_type, "double");
    assert!(func.body.has_return_value);
    assert!(matches!(func.body.expressions.as_slice(), [Expr::Return(_)]));
}

#[test]
fn user_or_is_dispatched_to_the_function() {
    let mut session = Session::default();
    session
        .evaluate("def binary | 5 (a: double, b: double) -> double { 42 }")
        .unwrap();
    // A builtin would have rejected `|` outright; the user function answers 42.
    assert_eq!(session.evaluate("exec: double 0 | 0").unwrap(), RuntimeValue::F64(42.0));
}

#[test]
fn unterminated_statements_are_a_parse_error() {
    let mut session = Session::default();
    let err = session
        .evaluate("def f(x: double) -> double { x x }")
        .unwrap_err();
    assert!(matches!(err, CoreError::ParseError(_)), "{err}");
}

#[test]
fn precedence_controls_grouping() {
    let mut session = Session::default();
    session
        .evaluate("def binary @ 50 (a: double, b: double) -> double { a - b }")
        .unwrap();
    // `@` binds tighter than `*`: 2 * (5 @ 3) = 4.
    assert_eq!(session.evaluate("exec: double 2 * 5 @ 3").unwrap(), RuntimeValue::F64(4.0));

    session
        .evaluate("def binary ~ 1 (a: double, b: double) -> double { a - b }")
        .unwrap();
    // `~` binds looser than `*`: (2 * 5) ~ 3 = 7.
    assert_eq!(session.evaluate("exec: double 2 * 5 ~ 3").unwrap(), RuntimeValue::F64(7.0));

    let err = session
        .evaluate("def binary ^ 101 (a: double, b: double) -> double { a }")
        .unwrap_err();
    assert!(matches!(err, CoreError::ParseError(_)), "{err}");
}

#[test]
fn inferred_expression_type_comes_from_the_typed_sub_term() {
    let mut session = Session::default();
    session.evaluate("def one() -> i32 { 1 }").unwrap();
    assert_eq!(session.evaluate("exec 2 + one() * 3").unwrap(), RuntimeValue::I32(5));
    let err = session.evaluate("exec 2 + 3").unwrap_err();
    assert!(err.to_string().contains("cannot infer execution result type"), "{err}");
}
