//! Expression evaluation: operators, precedence, coercion, filters,
//! tests, and literals.

use thatch::{context, Environment, Error, Value};

fn eval(expr: &str) -> String {
    let env = Environment::new();
    env.render_str(&format!("{{{{ {expr} }}}}"), context! {}).unwrap()
}

fn eval_err(expr: &str) -> Error {
    let env = Environment::new();
    env.render_str(&format!("{{{{ {expr} }}}}"), context! {}).unwrap_err()
}

#[test]
fn arithmetic() {
    assert_eq!(eval("3 + 4"), "7");
    assert_eq!(eval("10 - 2 - 3"), "5");
    assert_eq!(eval("5 / 2"), "2.5");
    assert_eq!(eval("5 // 2"), "2");
    assert_eq!(eval("-7 // 2"), "-4");
    assert_eq!(eval("7 % 3"), "1");
    assert_eq!(eval("-7 % 3"), "2");
    assert_eq!(eval("2 ** 3"), "8");
    assert_eq!(eval("2 ** -1"), "0.5");
}

#[test]
fn precedence_and_grouping() {
    assert_eq!(eval("2 + 3 * 4"), "14");
    assert_eq!(eval("(2 + 3) * 4"), "20");
    assert_eq!(eval("2 ** 3 ** 2"), "512");
    assert_eq!(eval("-2 ** 2"), "-4");
}

#[test]
fn unary_minus_applies_before_filters() {
    assert_eq!(eval("-3 | abs"), "3");
    assert_eq!(eval("-1 | abs + 1"), "2");
    assert_eq!(eval("-2.5 | abs"), "2.5");
}

#[test]
fn float_contagion_and_display() {
    assert_eq!(eval("1 + 2.0"), "3.0");
    assert_eq!(eval("2.5 * 2"), "5.0");
    assert_eq!(eval("1.5 + 1.25"), "2.75");
}

#[test]
fn division_by_zero_is_an_error() {
    assert!(matches!(eval_err("1 / 0"), Error::Render { .. }));
    assert!(matches!(eval_err("1 // 0"), Error::Render { .. }));
    assert!(matches!(eval_err("1 % 0"), Error::Render { .. }));
}

#[test]
fn string_concat_and_repeat() {
    assert_eq!(eval("'ab' + 'cd'"), "abcd");
    assert_eq!(eval("'ab' * 3"), "ababab");
    assert_eq!(eval("'n=' ~ 42"), "n=42");
    assert_eq!(eval("1 ~ 2"), "12");
}

#[test]
fn comparisons_chain() {
    assert_eq!(eval("1 < 2"), "true");
    assert_eq!(eval("1 < 2 < 3"), "true");
    assert_eq!(eval("1 < 2 > 3"), "false");
    assert_eq!(eval("1 == 1.0"), "true");
    assert_eq!(eval("'a' < 'b'"), "true");
}

#[test]
fn logic_short_circuits() {
    assert_eq!(eval("true and false"), "false");
    assert_eq!(eval("false or true"), "true");
    assert_eq!(eval("not 0"), "true");
    // The right side must never evaluate when the left decides.
    assert_eq!(eval("false and missing.attr"), "false");
    assert_eq!(eval("true or (1 / 0)"), "true");
}

#[test]
fn logic_yields_the_deciding_operand() {
    assert_eq!(eval("missing or 'anon'"), "anon");
    assert_eq!(eval("'first' or 'second'"), "first");
    assert_eq!(eval("'left' and 'right'"), "right");
    assert_eq!(eval("0 and 'right'"), "0");
}

#[test]
fn membership() {
    assert_eq!(eval("2 in [1, 2, 3]"), "true");
    assert_eq!(eval("4 not in [1, 2, 3]"), "true");
    assert_eq!(eval("'ell' in 'hello'"), "true");
    assert_eq!(eval("'k' in {'k': 1}"), "true");
}

#[test]
fn conditional_expression() {
    assert_eq!(eval("'yes' if 1 > 0 else 'no'"), "yes");
    assert_eq!(eval("'yes' if 0 else 'no'"), "no");
}

#[test]
fn literals_and_indexing() {
    assert_eq!(eval("[1, 2, 3][1]"), "2");
    assert_eq!(eval("[1, 2, 3][-1]"), "3");
    assert_eq!(eval("{'a': 1, 'b': 2}['b']"), "2");
    assert_eq!(eval("'hello'[0]"), "h");
    assert_eq!(eval("(1, 2)[0]"), "1");
}

#[test]
fn container_literals_nest() {
    assert_eq!(eval("{'a': {'b': 2}}['a']['b']"), "2");
    assert_eq!(eval("[[1, 2], [3]][0][1]"), "2");
    assert_eq!(eval("{'xs': [1, 2]}['xs'] | length"), "2");
}

#[test]
fn out_of_range_index_is_undefined() {
    assert_eq!(eval("[1][5]"), "");
    assert_eq!(eval("{'a': 1}['z']"), "");
}

#[test]
fn builtin_filters() {
    assert_eq!(eval("'hi' | upper"), "HI");
    assert_eq!(eval("'HI' | lower"), "hi");
    assert_eq!(eval("'  x  ' | trim"), "x");
    assert_eq!(eval("[1, 2, 3] | length"), "3");
    assert_eq!(eval("['a', 'b'] | join(', ')"), "a, b");
    assert_eq!(eval("'abc' | reverse"), "cba");
    assert_eq!(eval("'hello world' | capitalize"), "Hello world");
    assert_eq!(eval("'a-b' | replace('-', '+')"), "a+b");
    assert_eq!(eval("-3 | abs"), "3");
    assert_eq!(eval("'42' | int + 1"), "43");
}

#[test]
fn filters_chain_left_to_right() {
    assert_eq!(eval("'  hi  ' | trim | upper"), "HI");
}

#[test]
fn default_filter_covers_undefined_and_none() {
    assert_eq!(eval("missing | default('fallback')"), "fallback");
    assert_eq!(eval("none | default('fallback')"), "fallback");
    assert_eq!(eval("0 | default('fallback')"), "0");
    assert_eq!(eval("'' | default('fallback')"), "");
}

#[test]
fn unknown_filter_and_test_are_errors() {
    assert!(matches!(
        eval_err("1 | no_such_filter"),
        Error::UndefinedFilter { name } if name == "no_such_filter"
    ));
    assert!(matches!(
        eval_err("1 is no_such_test"),
        Error::UndefinedTest { name } if name == "no_such_test"
    ));
}

#[test]
fn builtin_tests() {
    assert_eq!(eval("missing is defined"), "false");
    assert_eq!(eval("missing is undefined"), "true");
    assert_eq!(eval("1 is defined"), "true");
    assert_eq!(eval("none is none"), "true");
    assert_eq!(eval("4 is even"), "true");
    assert_eq!(eval("3 is odd"), "true");
    assert_eq!(eval("9 is divisibleby(3)"), "true");
    assert_eq!(eval("3 is not even"), "true");
    assert_eq!(eval("'x' is string"), "true");
    assert_eq!(eval("1.5 is number"), "true");
}

#[test]
fn defined_test_works_under_strict_undefined() {
    let mut env = Environment::new();
    env.set_strict_undefined(true);
    let out = env
        .render_str("{{ 'y' if missing is defined else 'n' }}", context! {})
        .unwrap();
    assert_eq!(out, "n");
}

#[test]
fn truthiness() {
    assert_eq!(eval("'x' if [] else 'empty'"), "empty");
    assert_eq!(eval("'x' if '' else 'empty'"), "empty");
    assert_eq!(eval("'x' if 0.0 else 'empty'"), "empty");
    assert_eq!(eval("'x' if [0] else 'empty'"), "x");
}

#[test]
fn none_and_undefined_render_empty() {
    assert_eq!(eval("none"), "");
    let env = Environment::new();
    assert_eq!(env.render_str("{{ missing }}", context! {}).unwrap(), "");
}

#[test]
fn incompatible_comparison_is_an_error() {
    assert!(matches!(eval_err("1 < 'a'"), Error::Render { .. }));
}

#[test]
fn custom_filter_and_test() {
    let mut env = Environment::new();
    env.add_filter("shout", |value, _args, _kwargs, _ctx| {
        Ok(Value::String(format!("{}!!", value)))
    });
    env.add_test("negative", |value, _args, _ctx| {
        Ok(value.as_f64().is_some_and(|f| f < 0.0))
    });
    assert_eq!(env.render_str("{{ 'go' | shout }}", context! {}).unwrap(), "go!!");
    assert_eq!(
        env.render_str("{{ -1 is negative }}", context! {}).unwrap(),
        "true"
    );
}

#[test]
fn globals_are_visible_but_shadowable() {
    let mut env = Environment::new();
    env.add_global("site", "example.org");
    assert_eq!(env.render_str("{{ site }}", context! {}).unwrap(), "example.org");
    assert_eq!(
        env.render_str("{{ site }}", context! { site => "local" }).unwrap(),
        "local"
    );
}
