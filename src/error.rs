use thiserror::Error;

/// Errors produced anywhere in the compile/render pipeline.
///
/// Lex, parse, and render failures carry the 1-based line/column of the
/// offending construct. The template name is attached by the environment
/// once the failing template is known; the lexer and parser only see a
/// token stream and leave it empty.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("lex error: {message} at line {line}, column {column}")]
    Lex {
        message: String,
        line: u32,
        column: u32,
    },

    #[error("parse error: {message} at line {line}, column {column}{}", fmt_in(template_name))]
    Parse {
        message: String,
        line: u32,
        column: u32,
        template_name: Option<String>,
    },

    #[error("render error: {message} at line {line}, column {column}{}", fmt_in(template_name))]
    Render {
        message: String,
        line: u32,
        column: u32,
        template_name: Option<String>,
    },

    #[error("undefined variable: {name}")]
    UndefinedVariable { name: String },

    #[error("unknown filter: {name}")]
    UndefinedFilter { name: String },

    #[error("unknown test: {name}")]
    UndefinedTest { name: String },

    #[error("template not found: {name}")]
    TemplateNotFound { name: String },
}

pub type Result<T> = std::result::Result<T, Error>;

fn fmt_in(template_name: &Option<String>) -> String {
    match template_name {
        Some(n) => format!(" in template {n:?}"),
        None => String::new(),
    }
}

impl Error {
    pub(crate) fn lex(message: impl Into<String>, line: u32, column: u32) -> Self {
        Error::Lex {
            message: message.into(),
            line,
            column,
        }
    }

    pub(crate) fn parse(message: impl Into<String>, line: u32, column: u32) -> Self {
        Error::Parse {
            message: message.into(),
            line,
            column,
            template_name: None,
        }
    }

    pub(crate) fn render(message: impl Into<String>, line: u32, column: u32) -> Self {
        Error::Render {
            message: message.into(),
            line,
            column,
            template_name: None,
        }
    }

    /// Attach a template name to location-tagged errors that lack one.
    pub(crate) fn with_template_name(mut self, name: &str) -> Self {
        match &mut self {
            Error::Parse { template_name, .. } | Error::Render { template_name, .. } => {
                if template_name.is_none() {
                    *template_name = Some(name.to_string());
                }
            }
            _ => {}
        }
        self
    }
}
