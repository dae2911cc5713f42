use crate::ast::Span;
use crate::error::{Error, Result};

/// Delimiter configuration. All six are free-form strings; the lexer
/// matches them by lookahead rather than hard-coded characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Syntax {
    pub variable_start: String,
    pub variable_end: String,
    pub block_start: String,
    pub block_end: String,
    pub comment_start: String,
    pub comment_end: String,
}

impl Default for Syntax {
    fn default() -> Self {
        Self {
            variable_start: "{{".to_string(),
            variable_end: "}}".to_string(),
            block_start: "{%".to_string(),
            block_end: "%}".to_string(),
            comment_start: "{#".to_string(),
            comment_end: "#}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LexerOptions {
    pub syntax: Syntax,
    pub trim_blocks: bool,
    pub lstrip_blocks: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Text(String),
    VariableStart,
    VariableEnd,
    BlockStart,
    BlockEnd,

    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),

    // Keywords
    If,
    Elif,
    Else,
    EndIf,
    For,
    EndFor,
    In,
    Not,
    And,
    Or,
    Is,
    Block,
    EndBlock,
    Extends,
    Include,
    Import,
    From,
    As,
    Macro,
    EndMacro,
    Call,
    EndCall,
    Set,
    EndSet,
    With,
    EndWith,
    Autoescape,
    EndAutoescape,
    True,
    False,
    None,
    Recursive,
    Continue,
    Break,

    // Operators and punctuation
    Eq,       // ==
    Ne,       // !=
    Le,       // <=
    Ge,       // >=
    Lt,       // <
    Gt,       // >
    Assign,   // =
    Plus,     // +
    Minus,    // -
    Star,     // *
    Slash,    // /
    FloorDiv, // //
    Pow,      // **
    Percent,  // %
    Pipe,     // |
    Dot,      // .
    Comma,    // ,
    Colon,    // :
    Tilde,    // ~
    LParen,   // (
    RParen,   // )
    LBracket, // [
    RBracket, // ]
    LBrace,   // {
    RBrace,   // }

    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub column: u32,
}

impl Token {
    pub fn span(&self) -> Span {
        Span::new(self.line, self.column)
    }
}

/// Whitespace handling owed to the next Text token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    /// `-%}` / `-}}` / `-#}`: consume the entire leading whitespace run.
    TrimAll,
    /// TrimBlocks after a plain `%}`: consume at most one newline.
    TrimNewline,
}

/// Tokenize template source into a complete stream ending in `Eof`, or
/// fail with a located lex error. Never partially succeeds.
pub fn tokenize(source: &str, options: &LexerOptions) -> Result<Vec<Token>> {
    Tokenizer::new(source, options).run()
}

struct Tokenizer<'a> {
    src: &'a str,
    options: &'a LexerOptions,
    pos: usize,
    line: u32,
    column: u32,
    out: Vec<Token>,
    /// Pending text buffer plus the position where it began.
    text: String,
    text_span: Span,
    pending: Pending,
}

impl<'a> Tokenizer<'a> {
    fn new(src: &'a str, options: &'a LexerOptions) -> Self {
        Self {
            src,
            options,
            pos: 0,
            line: 1,
            column: 1,
            out: Vec::new(),
            text: String::new(),
            text_span: Span::new(1, 1),
            pending: Pending::None,
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    /// Consume `n` bytes, keeping line/column counters in step.
    fn bump(&mut self, n: usize) {
        for c in self.src[self.pos..self.pos + n].chars() {
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.pos += n;
    }

    fn push(&mut self, kind: TokenKind, span: Span) {
        self.out.push(Token {
            kind,
            line: span.line,
            column: span.column,
        });
    }

    fn here(&self) -> Span {
        Span::new(self.line, self.column)
    }

    fn run(mut self) -> Result<Vec<Token>> {
        let syntax = self.options.syntax.clone();
        while !self.at_end() {
            let rest = self.rest();
            // Priority at equal offsets: comment, then variable, then block.
            if rest.starts_with(syntax.comment_start.as_str()) {
                self.lex_comment()?;
            } else if rest.starts_with(syntax.variable_start.as_str()) {
                self.lex_variable_tag()?;
            } else if rest.starts_with(syntax.block_start.as_str()) {
                self.lex_block_tag()?;
            } else {
                if self.text.is_empty() {
                    self.text_span = self.here();
                }
                let c = rest.chars().next().unwrap();
                self.text.push(c);
                self.bump(c.len_utf8());
            }
        }
        self.flush_text();
        let span = self.here();
        self.push(TokenKind::Eof, span);
        Ok(self.out)
    }

    /// Apply the pending trim owed by the previous tag, then emit the
    /// buffered text as a single Text token (if anything is left).
    fn flush_text(&mut self) {
        let mut text = std::mem::take(&mut self.text);
        match self.pending {
            Pending::TrimAll => {
                text = text.trim_start().to_string();
            }
            Pending::TrimNewline => {
                if let Some(stripped) =
                    text.strip_prefix("\r\n").or_else(|| text.strip_prefix('\n'))
                {
                    text = stripped.to_string();
                }
            }
            Pending::None => {}
        }
        self.pending = Pending::None;
        if !text.is_empty() {
            let span = self.text_span;
            self.push(TokenKind::Text(text), span);
        }
    }

    /// Right-trim the text buffer for a leading `-` marker.
    fn trim_text_tail(&mut self) {
        let trimmed = self.text.trim_end().len();
        self.text.truncate(trimmed);
    }

    /// LstripBlocks: drop a trailing indentation-only run (spaces/tabs back
    /// to the last newline) from the text buffer. Partial-line content is
    /// left alone.
    fn lstrip_text_tail(&mut self) {
        let cut = match self.text.rfind('\n') {
            Some(idx) => idx + 1,
            None => 0,
        };
        if self.text[cut..].chars().all(|c| c == ' ' || c == '\t') {
            self.text.truncate(cut);
        }
    }

    fn lex_comment(&mut self) -> Result<()> {
        let open_span = self.here();
        let start_len = self.options.syntax.comment_start.len();
        // Leading `-` right inside the delimiter trims the preceding text.
        if self.src[self.pos + start_len..].starts_with('-') {
            self.trim_text_tail();
        }
        self.flush_text();
        self.bump(start_len);
        if self.rest().starts_with('-') {
            self.bump(1);
        }
        let end = self.options.syntax.comment_end.clone();
        match self.rest().find(end.as_str()) {
            Some(idx) => {
                let trims_after = self.rest()[..idx].ends_with('-');
                self.bump(idx + end.len());
                self.pending = if trims_after {
                    Pending::TrimAll
                } else {
                    Pending::None
                };
                Ok(())
            }
            None => Err(Error::lex(
                "unterminated comment",
                open_span.line,
                open_span.column,
            )),
        }
    }

    fn lex_variable_tag(&mut self) -> Result<()> {
        let open_span = self.here();
        let start_len = self.options.syntax.variable_start.len();
        if self.src[self.pos + start_len..].starts_with('-') {
            self.trim_text_tail();
            self.flush_text();
            self.bump(start_len + 1);
        } else {
            self.flush_text();
            self.bump(start_len);
        }
        self.push(TokenKind::VariableStart, open_span);
        self.lex_tag_contents(false, open_span)
    }

    fn lex_block_tag(&mut self) -> Result<()> {
        let open_span = self.here();
        let start_len = self.options.syntax.block_start.len();
        let leading_trim = self.src[self.pos + start_len..].starts_with('-');
        if leading_trim {
            self.trim_text_tail();
        } else if self.options.lstrip_blocks {
            self.lstrip_text_tail();
        }
        self.flush_text();
        self.bump(start_len);
        if leading_trim {
            self.bump(1);
        }

        // Raw blocks never reach the parser: the whole construct collapses
        // to one verbatim Text token here.
        if self.peek_raw_keyword() {
            return self.lex_raw_block(open_span);
        }

        self.push(TokenKind::BlockStart, open_span);
        self.lex_tag_contents(true, open_span)
    }

    /// After a consumed `{%` (and optional `-`), does `raw` follow?
    fn peek_raw_keyword(&self) -> bool {
        let rest = self.rest().trim_start();
        rest.strip_prefix("raw")
            .is_some_and(|after| !after.starts_with(|c: char| c.is_alphanumeric() || c == '_'))
    }

    fn lex_raw_block(&mut self, open_span: Span) -> Result<()> {
        let block_end = self.options.syntax.block_end.clone();
        let block_start = self.options.syntax.block_start.clone();
        self.skip_tag_whitespace();
        self.bump("raw".len());
        self.skip_tag_whitespace();
        let mut trim_body_start = false;
        if self.rest().starts_with('-') && self.rest()[1..].starts_with(block_end.as_str()) {
            trim_body_start = true;
            self.bump(1);
        }
        if !self.rest().starts_with(block_end.as_str()) {
            return Err(Error::lex(
                "expected end of raw tag",
                self.line,
                self.column,
            ));
        }
        self.bump(block_end.len());

        // Verbatim scan: no operator or keyword recognition until the
        // matching endraw tag.
        let body_start = self.pos;
        let body_span = self.here();
        let mut search = self.pos;
        loop {
            let Some(found) = self.src[search..].find(block_start.as_str()) else {
                return Err(Error::lex(
                    "unterminated raw block",
                    open_span.line,
                    open_span.column,
                ));
            };
            let tag_at = search + found;
            if let Some((consumed, trim_before, trim_after)) = self.match_endraw(tag_at) {
                let mut body = &self.src[body_start..tag_at];
                if trim_body_start {
                    body = body.trim_start();
                }
                if trim_before {
                    body = body.trim_end();
                }
                if !body.is_empty() {
                    let text = body.to_string();
                    self.push(TokenKind::Text(text), body_span);
                }
                let advance = tag_at + consumed - self.pos;
                self.bump(advance);
                self.pending = if trim_after {
                    Pending::TrimAll
                } else if self.options.trim_blocks {
                    Pending::TrimNewline
                } else {
                    Pending::None
                };
                return Ok(());
            }
            search = tag_at + block_start.len();
        }
    }

    /// Try to match `{%[-] endraw [-]%}` starting at byte `at`. Returns the
    /// matched length plus the two trim markers.
    fn match_endraw(&self, at: usize) -> Option<(usize, bool, bool)> {
        let syntax = &self.options.syntax;
        let mut rest = &self.src[at..];
        debug_assert!(rest.starts_with(syntax.block_start.as_str()));
        rest = &rest[syntax.block_start.len()..];
        let trim_before = rest.starts_with('-');
        if trim_before {
            rest = &rest[1..];
        }
        rest = rest.trim_start();
        rest = rest.strip_prefix("endraw")?;
        rest = rest.trim_start();
        let trim_after = rest.starts_with('-');
        if trim_after {
            rest = &rest[1..];
        }
        if !rest.starts_with(syntax.block_end.as_str()) {
            return None;
        }
        rest = &rest[syntax.block_end.len()..];
        let consumed = self.src.len() - at - rest.len();
        Some((consumed, trim_before, trim_after))
    }

    fn skip_tag_whitespace(&mut self) {
        while let Some(c) = self.rest().chars().next() {
            if c.is_whitespace() {
                self.bump(c.len_utf8());
            } else {
                break;
            }
        }
    }

    /// Lex expression tokens until the matching closing delimiter.
    fn lex_tag_contents(&mut self, is_block: bool, open_span: Span) -> Result<()> {
        let end = if is_block {
            self.options.syntax.block_end.clone()
        } else {
            self.options.syntax.variable_end.clone()
        };
        // Bracket nesting inside the tag; the closing delimiter only
        // counts at depth zero, so `{{ {'a': {'b': 1}} }}` lexes the inner
        // `}}` as two RBrace tokens.
        let mut depth: usize = 0;
        loop {
            self.skip_tag_whitespace();
            if self.at_end() {
                return Err(Error::lex(
                    if is_block {
                        "unterminated block tag"
                    } else {
                        "unterminated expression"
                    },
                    open_span.line,
                    open_span.column,
                ));
            }
            let span = self.here();
            let rest = self.rest();

            // `-%}` / `-}}` must win over the minus operator.
            if depth == 0 && rest.starts_with('-') && rest[1..].starts_with(end.as_str()) {
                self.bump(1 + end.len());
                self.push(close_token(is_block), span);
                self.pending = Pending::TrimAll;
                return Ok(());
            }
            if depth == 0 && rest.starts_with(end.as_str()) {
                self.bump(end.len());
                self.push(close_token(is_block), span);
                self.pending = if is_block && self.options.trim_blocks {
                    Pending::TrimNewline
                } else {
                    Pending::None
                };
                return Ok(());
            }

            let c = rest.chars().next().unwrap();
            if c == '\'' || c == '"' {
                self.lex_string(c)?;
                continue;
            }
            if c.is_ascii_digit() {
                self.lex_number()?;
                continue;
            }
            if c.is_alphabetic() || c == '_' {
                self.lex_ident();
                continue;
            }

            // Two-character operators before one-character.
            let two = if rest.len() >= 2 && rest.is_char_boundary(2) {
                &rest[..2]
            } else {
                ""
            };
            let kind = match two {
                "==" => Some(TokenKind::Eq),
                "!=" => Some(TokenKind::Ne),
                "<=" => Some(TokenKind::Le),
                ">=" => Some(TokenKind::Ge),
                "//" => Some(TokenKind::FloorDiv),
                "**" => Some(TokenKind::Pow),
                _ => None,
            };
            if let Some(kind) = kind {
                self.bump(2);
                self.push(kind, span);
                continue;
            }
            let kind = match c {
                '<' => TokenKind::Lt,
                '>' => TokenKind::Gt,
                '=' => TokenKind::Assign,
                '+' => TokenKind::Plus,
                '-' => TokenKind::Minus,
                '*' => TokenKind::Star,
                '/' => TokenKind::Slash,
                '%' => TokenKind::Percent,
                '|' => TokenKind::Pipe,
                '.' => TokenKind::Dot,
                ',' => TokenKind::Comma,
                ':' => TokenKind::Colon,
                '~' => TokenKind::Tilde,
                '(' => TokenKind::LParen,
                ')' => TokenKind::RParen,
                '[' => TokenKind::LBracket,
                ']' => TokenKind::RBracket,
                '{' => TokenKind::LBrace,
                '}' => TokenKind::RBrace,
                other => {
                    return Err(Error::lex(
                        format!("unexpected character {other:?}"),
                        span.line,
                        span.column,
                    ));
                }
            };
            match kind {
                TokenKind::LParen | TokenKind::LBracket | TokenKind::LBrace => depth += 1,
                TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => {
                    depth = depth.saturating_sub(1);
                }
                _ => {}
            }
            self.bump(c.len_utf8());
            self.push(kind, span);
        }
    }

    fn lex_string(&mut self, quote: char) -> Result<()> {
        let span = self.here();
        self.bump(1);
        let mut s = String::new();
        loop {
            let Some(c) = self.rest().chars().next() else {
                return Err(Error::lex("unterminated string", span.line, span.column));
            };
            if c == quote {
                self.bump(1);
                self.push(TokenKind::Str(s), span);
                return Ok(());
            }
            if c == '\\' {
                self.bump(1);
                let Some(esc) = self.rest().chars().next() else {
                    return Err(Error::lex("unterminated string", span.line, span.column));
                };
                self.bump(esc.len_utf8());
                match esc {
                    'n' => s.push('\n'),
                    'r' => s.push('\r'),
                    't' => s.push('\t'),
                    '\\' => s.push('\\'),
                    '"' => s.push('"'),
                    '\'' => s.push('\''),
                    other => s.push(other),
                }
            } else {
                self.bump(c.len_utf8());
                s.push(c);
            }
        }
    }

    fn lex_number(&mut self) -> Result<()> {
        let span = self.here();
        let rest = self.rest();
        let bytes = rest.as_bytes();
        let mut i = 0;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let mut is_float = false;
        // A `.` only makes this a float when a digit follows; `1.x` keeps
        // the dot for attribute access.
        if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
            is_float = true;
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
        }
        if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
            let mut j = i + 1;
            if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                j += 1;
            }
            if j < bytes.len() && bytes[j].is_ascii_digit() {
                is_float = true;
                i = j;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
        }
        let literal = &rest[..i];
        self.bump(i);
        if is_float {
            match literal.parse::<f64>() {
                Ok(f) => self.push(TokenKind::Float(f), span),
                Err(_) => {
                    return Err(Error::lex(
                        format!("invalid float literal {literal:?}"),
                        span.line,
                        span.column,
                    ));
                }
            }
        } else {
            match literal.parse::<i64>() {
                Ok(n) => self.push(TokenKind::Int(n), span),
                Err(_) => {
                    return Err(Error::lex(
                        format!("integer literal {literal:?} out of range"),
                        span.line,
                        span.column,
                    ));
                }
            }
        }
        Ok(())
    }

    fn lex_ident(&mut self) {
        let span = self.here();
        let ident: String = self
            .rest()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        self.bump(ident.len());
        let kind = match ident.as_str() {
            "if" => TokenKind::If,
            "elif" => TokenKind::Elif,
            "else" => TokenKind::Else,
            "endif" => TokenKind::EndIf,
            "for" => TokenKind::For,
            "endfor" => TokenKind::EndFor,
            "in" => TokenKind::In,
            "not" => TokenKind::Not,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "is" => TokenKind::Is,
            "block" => TokenKind::Block,
            "endblock" => TokenKind::EndBlock,
            "extends" => TokenKind::Extends,
            "include" => TokenKind::Include,
            "import" => TokenKind::Import,
            "from" => TokenKind::From,
            "as" => TokenKind::As,
            "macro" => TokenKind::Macro,
            "endmacro" => TokenKind::EndMacro,
            "call" => TokenKind::Call,
            "endcall" => TokenKind::EndCall,
            "set" => TokenKind::Set,
            "endset" => TokenKind::EndSet,
            "with" => TokenKind::With,
            "endwith" => TokenKind::EndWith,
            "autoescape" => TokenKind::Autoescape,
            "endautoescape" => TokenKind::EndAutoescape,
            "true" | "True" => TokenKind::True,
            "false" | "False" => TokenKind::False,
            "none" | "None" => TokenKind::None,
            "recursive" => TokenKind::Recursive,
            "continue" => TokenKind::Continue,
            "break" => TokenKind::Break,
            _ => TokenKind::Ident(ident),
        };
        self.push(kind, span);
    }
}

fn close_token(is_block: bool) -> TokenKind {
    if is_block {
        TokenKind::BlockEnd
    } else {
        TokenKind::VariableEnd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<TokenKind> {
        tokenize(src, &LexerOptions::default())
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn plain_text_is_one_token() {
        assert_eq!(
            lex("hello world"),
            vec![TokenKind::Text("hello world".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn variable_tag_tokens() {
        assert_eq!(
            lex("a{{ name }}b"),
            vec![
                TokenKind::Text("a".into()),
                TokenKind::VariableStart,
                TokenKind::Ident("name".into()),
                TokenKind::VariableEnd,
                TokenKind::Text("b".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn comments_vanish_entirely() {
        assert_eq!(
            lex("a{# note #}b"),
            vec![
                TokenKind::Text("a".into()),
                TokenKind::Text("b".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn two_char_operators_win_over_one_char() {
        assert_eq!(
            lex("{{ a // b ** c <= d }}"),
            vec![
                TokenKind::VariableStart,
                TokenKind::Ident("a".into()),
                TokenKind::FloorDiv,
                TokenKind::Ident("b".into()),
                TokenKind::Pow,
                TokenKind::Ident("c".into()),
                TokenKind::Le,
                TokenKind::Ident("d".into()),
                TokenKind::VariableEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn float_needs_digit_after_dot() {
        assert_eq!(
            lex("{{ 1.5 }}{{ x.y }}{{ 2e3 }}"),
            vec![
                TokenKind::VariableStart,
                TokenKind::Float(1.5),
                TokenKind::VariableEnd,
                TokenKind::VariableStart,
                TokenKind::Ident("x".into()),
                TokenKind::Dot,
                TokenKind::Ident("y".into()),
                TokenKind::VariableEnd,
                TokenKind::VariableStart,
                TokenKind::Float(2000.0),
                TokenKind::VariableEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            lex(r#"{{ "a\n\t\"b" }}"#),
            vec![
                TokenKind::VariableStart,
                TokenKind::Str("a\n\t\"b".into()),
                TokenKind::VariableEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn leading_dash_trims_previous_text() {
        assert_eq!(
            lex("Hello\n{%- if true %}{% endif %}"),
            vec![
                TokenKind::Text("Hello".into()),
                TokenKind::BlockStart,
                TokenKind::If,
                TokenKind::True,
                TokenKind::BlockEnd,
                TokenKind::BlockStart,
                TokenKind::EndIf,
                TokenKind::BlockEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn trailing_dash_trims_next_text() {
        assert_eq!(
            lex("{% if true -%}\n\nWorld{% endif %}"),
            vec![
                TokenKind::BlockStart,
                TokenKind::If,
                TokenKind::True,
                TokenKind::BlockEnd,
                TokenKind::Text("World".into()),
                TokenKind::BlockStart,
                TokenKind::EndIf,
                TokenKind::BlockEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn trim_blocks_eats_exactly_one_newline() {
        let options = LexerOptions {
            trim_blocks: true,
            ..LexerOptions::default()
        };
        let kinds: Vec<TokenKind> = tokenize("{% if true %}\n\nHello{% endif %}", &options)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect();
        assert!(kinds.contains(&TokenKind::Text("\nHello".into())));
    }

    #[test]
    fn lstrip_blocks_strips_indentation_only_runs() {
        let options = LexerOptions {
            lstrip_blocks: true,
            ..LexerOptions::default()
        };
        let kinds: Vec<TokenKind> = tokenize("x\n    {% if true %}{% endif %}", &options)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect();
        assert_eq!(kinds[0], TokenKind::Text("x\n".into()));
        // Partial-line content survives.
        let kinds: Vec<TokenKind> = tokenize("x  {% if true %}{% endif %}", &options)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect();
        assert_eq!(kinds[0], TokenKind::Text("x  ".into()));
    }

    #[test]
    fn raw_block_is_verbatim() {
        assert_eq!(
            lex("{% raw %}{{ this will not be processed }}{% endraw %}"),
            vec![
                TokenKind::Text("{{ this will not be processed }}".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn raw_block_ignores_trim_and_lstrip_inside() {
        let options = LexerOptions {
            trim_blocks: true,
            lstrip_blocks: true,
            ..LexerOptions::default()
        };
        let tokens = tokenize("{% raw %}\n  {% keep me %}\n{% endraw %}", &options).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Text("\n  {% keep me %}\n".into()));
    }

    #[test]
    fn custom_delimiters() {
        let options = LexerOptions {
            syntax: Syntax {
                variable_start: "<<".into(),
                variable_end: ">>".into(),
                block_start: "<%".into(),
                block_end: "%>".into(),
                comment_start: "<#".into(),
                comment_end: "#>".into(),
            },
            ..LexerOptions::default()
        };
        let kinds: Vec<TokenKind> = tokenize("a<< name >>b<# gone #>c", &options)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Text("a".into()),
                TokenKind::VariableStart,
                TokenKind::Ident("name".into()),
                TokenKind::VariableEnd,
                TokenKind::Text("b".into()),
                TokenKind::Text("c".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn unterminated_constructs_are_located_errors() {
        assert!(matches!(
            tokenize("{{ 'oops }}", &LexerOptions::default()),
            Err(Error::Lex { .. })
        ));
        assert!(matches!(
            tokenize("{# never closed", &LexerOptions::default()),
            Err(Error::Lex { .. })
        ));
        assert!(matches!(
            tokenize("{% raw %}never closed", &LexerOptions::default()),
            Err(Error::Lex { .. })
        ));
        assert!(matches!(
            tokenize("{{ name", &LexerOptions::default()),
            Err(Error::Lex { .. })
        ));
    }

    #[test]
    fn line_and_column_tracking() {
        let tokens = tokenize("ab\ncd{{ x }}", &LexerOptions::default()).unwrap();
        let var = tokens
            .iter()
            .find(|t| t.kind == TokenKind::VariableStart)
            .unwrap();
        assert_eq!((var.line, var.column), (2, 3));
    }
}
