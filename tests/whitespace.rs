//! Whitespace control, raw blocks, delimiter configuration, and trailing
//! newline policy as observed through full renders.

use thatch::{context, Environment, Syntax};

#[test]
fn inline_trim_markers_strip_around_tags() {
    let env = Environment::new();
    let out = env
        .render_str("Hello   {%- if true -%}   World{% endif %}", context! {})
        .unwrap();
    assert_eq!(out, "HelloWorld");
}

#[test]
fn leading_trim_eats_preceding_newline() {
    let env = Environment::new();
    let out = env
        .render_str("Hello\n{%- if true %}World{% endif %}", context! {})
        .unwrap();
    assert_eq!(out, "HelloWorld");
    let out = env
        .render_str("Hello{% if true -%}\n\nWorld{% endif %}", context! {})
        .unwrap();
    assert_eq!(out, "HelloWorld");
}

#[test]
fn trim_marker_on_output_tags() {
    let env = Environment::new();
    let out = env.render_str("a  {{- 'b' -}}  c", context! {}).unwrap();
    assert_eq!(out, "abc");
}

#[test]
fn trim_blocks_eats_one_newline_after_block_tags() {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    let out = env
        .render_str("{% if true %}\nline\n{% endif %}\nrest", context! {})
        .unwrap();
    assert_eq!(out, "line\nrest");
}

#[test]
fn lstrip_blocks_strips_indentation_before_block_tags() {
    let mut env = Environment::new();
    env.set_lstrip_blocks(true);
    let out = env
        .render_str("start\n    {% if true %}x{% endif %}", context! {})
        .unwrap();
    assert_eq!(out, "start\nx");
}

#[test]
fn lstrip_blocks_leaves_non_whitespace_prefixes() {
    let mut env = Environment::new();
    env.set_lstrip_blocks(true);
    let out = env
        .render_str("text  {% if true %}x{% endif %}", context! {})
        .unwrap();
    assert_eq!(out, "text  x");
}

#[test]
fn raw_block_is_byte_exact() {
    let env = Environment::new();
    let out = env
        .render_str("{% raw %}{{ not evaluated }} {% if %}{% endraw %}", context! {})
        .unwrap();
    assert_eq!(out, "{{ not evaluated }} {% if %}");
}

#[test]
fn raw_block_ignores_global_trim_flags() {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    let out = env
        .render_str("{% raw %}\n  keep  \n{% endraw %}", context! {})
        .unwrap();
    assert_eq!(out, "\n  keep  \n");
}

#[test]
fn raw_block_honors_explicit_trim_markers() {
    let env = Environment::new();
    let out = env
        .render_str("a  {%- raw -%}  x  {%- endraw -%}  b", context! {})
        .unwrap();
    assert_eq!(out, "axb");
}

#[test]
fn custom_delimiters() {
    let mut env = Environment::new();
    env.set_syntax(Syntax {
        variable_start: "<<".to_string(),
        variable_end: ">>".to_string(),
        block_start: "<%".to_string(),
        block_end: "%>".to_string(),
        comment_start: "<#".to_string(),
        comment_end: "#>".to_string(),
    });
    let out = env
        .render_str(
            "<# hidden #><% if x %><< x >>{{ literal }}<% endif %>",
            context! { x => "v" },
        )
        .unwrap();
    assert_eq!(out, "v{{ literal }}");
}

#[test]
fn comments_disappear_and_support_trim() {
    let env = Environment::new();
    assert_eq!(
        env.render_str("a{# note #}b", context! {}).unwrap(),
        "ab"
    );
    assert_eq!(
        env.render_str("a  {#- note -#}  b", context! {}).unwrap(),
        "ab"
    );
}

#[test]
fn trailing_newline_kept_by_default() {
    let env = Environment::new();
    assert_eq!(env.render_str("hi\n", context! {}).unwrap(), "hi\n");
}

#[test]
fn trailing_newline_stripped_when_disabled() {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(false);
    assert_eq!(env.render_str("hi\n", context! {}).unwrap(), "hi");
    // Only one trailing newline goes away.
    assert_eq!(env.render_str("hi\n\n", context! {}).unwrap(), "hi\n");
}

#[test]
fn error_locations_point_into_the_source() {
    let env = Environment::new();
    let err = env.render_str("line one\n{{ 1 + }}", context! {}).unwrap_err();
    match err {
        thatch::Error::Parse { line, .. } => assert_eq!(line, 2),
        other => panic!("got {other:?}"),
    }
}
