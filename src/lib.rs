//! thatch: a small Jinja-family template engine.
//!
//! Templates are compiled to an AST once and rendered by a tree-walking
//! interpreter. The dialect covers expressions with full operator
//! precedence, `if`/`for` with loop metadata, template inheritance with
//! `{% block %}` and `super()`, macros with default arguments, includes,
//! filters and tests, and opt-in HTML auto-escaping.
//!
//! The [`Environment`] holds configuration and named templates:
//!
//! ```
//! use thatch::{context, Environment};
//!
//! let env = Environment::new();
//! env.add_template("hello", "Hello, {{ name | default('World') }}!").unwrap();
//! let tmpl = env.get_template("hello").unwrap();
//! assert_eq!(tmpl.render(context! { name => "Rust" }).unwrap(), "Hello, Rust!");
//! ```
//!
//! One-shot rendering without naming a template:
//!
//! ```
//! use thatch::{context, Environment};
//!
//! let env = Environment::new();
//! let out = env.render_str("{{ 2 ** 10 }}", context! {}).unwrap();
//! assert_eq!(out, "1024");
//! ```
//!
//! Delimiters, whitespace trimming, undefined handling, and auto-escaping
//! are all configured on the environment; see [`Environment`] and
//! [`Syntax`].

mod ast;
mod builtins;
mod context;
mod environment;
mod error;
mod eval;
mod lexer;
mod loader;
mod parser;
mod value;

pub use crate::environment::{CallContext, Environment, Template};
pub use crate::error::{Error, Result};
pub use crate::lexer::{LexerOptions, Syntax};
pub use crate::loader::{Loader, MemoryLoader};
pub use crate::value::{escape_html, Value, ValueMap};

/// Build a `HashMap<String, Value>` render context from `key => value`
/// pairs. Values go through [`Value::from`].
///
/// ```
/// use thatch::context;
///
/// let vars = context! { name => "World", count => 3 };
/// assert_eq!(vars.len(), 2);
/// ```
#[macro_export]
macro_rules! context {
    () => {
        ::std::collections::HashMap::<::std::string::String, $crate::Value>::new()
    };
    ($($key:ident => $value:expr),+ $(,)?) => {{
        let mut vars = ::std::collections::HashMap::new();
        $(
            vars.insert(
                ::std::string::String::from(stringify!($key)),
                $crate::Value::from($value),
            );
        )+
        vars
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_macro_builds_a_map() {
        let vars = context! { name => "x", n => 7, ok => true };
        assert_eq!(vars["name"], Value::from("x"));
        assert_eq!(vars["n"], Value::Int(7));
        assert_eq!(vars["ok"], Value::Bool(true));
        assert!(context! {}.is_empty());
    }

    #[test]
    fn render_str_round_trip() {
        let env = Environment::new();
        let out = env.render_str("{{ greeting }}, world", context! { greeting => "hi" });
        assert_eq!(out.unwrap(), "hi, world");
    }
}
