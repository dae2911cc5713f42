use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;

use crate::ast::{BlockDecl, Stmt};
use crate::error::{Error, Result};
use crate::eval;
use crate::lexer::{self, LexerOptions, Syntax};
use crate::loader::Loader;
use crate::parser;
use crate::value::Value;

/// A parsed template plus the metadata inheritance needs: the extends
/// target and a flat name-to-block index. Immutable once built; cached by
/// name and shared between renders.
pub struct CompiledTemplate {
    pub name: Option<String>,
    pub stmts: Vec<Stmt>,
    pub extends: Option<String>,
    pub blocks: HashMap<String, Arc<BlockDecl>>,
}

/// Read-only view handed to filters and tests: the environment plus the
/// auto-escape flag in effect at the call site.
pub struct CallContext<'a> {
    pub env: &'a Environment,
    pub autoescape: bool,
}

/// Filter contract: `filter(value, positional_args, keyword_args, context)`.
pub type FilterFn = dyn Fn(&Value, &[Value], &HashMap<String, Value>, &CallContext<'_>) -> Result<Value>
    + Send
    + Sync;

/// Test contract: `test(value, positional_args, context)`.
pub type TestFn = dyn Fn(&Value, &[Value], &CallContext<'_>) -> Result<bool> + Send + Sync;

/// Registry of filters, tests, globals, the loader, and configuration
/// flags, plus the compiled-template cache. Cheap to share across
/// threads; concurrent renders only read from it.
///
/// Registering filters or templates while renders are in flight is the
/// caller's responsibility to serialize.
pub struct Environment {
    lexer_options: LexerOptions,
    keep_trailing_newline: bool,
    autoescape: bool,
    strict_undefined: bool,
    undefined_value: Value,
    filters: HashMap<String, Arc<FilterFn>>,
    tests: HashMap<String, Arc<TestFn>>,
    globals: HashMap<String, Value>,
    loader: Option<Arc<dyn Loader>>,
    cache: DashMap<String, Arc<CompiledTemplate>>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// An environment with the default syntax and the built-in filters
    /// and tests registered.
    pub fn new() -> Self {
        let mut env = Self {
            lexer_options: LexerOptions::default(),
            keep_trailing_newline: true,
            autoescape: false,
            strict_undefined: false,
            undefined_value: Value::Undefined,
            filters: HashMap::new(),
            tests: HashMap::new(),
            globals: HashMap::new(),
            loader: None,
            cache: DashMap::new(),
        };
        crate::builtins::register(&mut env);
        env
    }

    // ── Configuration ──

    pub fn set_syntax(&mut self, syntax: Syntax) {
        self.lexer_options.syntax = syntax;
    }

    pub fn set_trim_blocks(&mut self, enabled: bool) {
        self.lexer_options.trim_blocks = enabled;
    }

    pub fn set_lstrip_blocks(&mut self, enabled: bool) {
        self.lexer_options.lstrip_blocks = enabled;
    }

    pub fn set_keep_trailing_newline(&mut self, enabled: bool) {
        self.keep_trailing_newline = enabled;
    }

    pub fn set_autoescape(&mut self, enabled: bool) {
        self.autoescape = enabled;
    }

    pub fn set_strict_undefined(&mut self, enabled: bool) {
        self.strict_undefined = enabled;
    }

    /// The sentinel lenient mode substitutes for missing names.
    pub fn set_undefined_value(&mut self, value: Value) {
        self.undefined_value = value;
    }

    pub fn set_loader(&mut self, loader: impl Loader + 'static) {
        self.loader = Some(Arc::new(loader));
    }

    // ── Registries ──

    pub fn add_filter<F>(&mut self, name: impl Into<String>, filter: F)
    where
        F: Fn(&Value, &[Value], &HashMap<String, Value>, &CallContext<'_>) -> Result<Value>
            + Send
            + Sync
            + 'static,
    {
        self.filters.insert(name.into(), Arc::new(filter));
    }

    pub fn add_test<F>(&mut self, name: impl Into<String>, test: F)
    where
        F: Fn(&Value, &[Value], &CallContext<'_>) -> Result<bool> + Send + Sync + 'static,
    {
        self.tests.insert(name.into(), Arc::new(test));
    }

    pub fn add_global(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.globals.insert(name.into(), value.into());
    }

    // Exact-name lookups; no normalization or fuzzy matching.

    pub(crate) fn filter(&self, name: &str) -> Option<&Arc<FilterFn>> {
        self.filters.get(name)
    }

    pub(crate) fn test(&self, name: &str) -> Option<&Arc<TestFn>> {
        self.tests.get(name)
    }

    pub(crate) fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    pub(crate) fn strict_undefined(&self) -> bool {
        self.strict_undefined
    }

    pub(crate) fn undefined_value(&self) -> &Value {
        &self.undefined_value
    }

    pub(crate) fn initial_autoescape(&self) -> bool {
        self.autoescape
    }

    // ── Compilation and the template cache ──

    /// Compile source text into a template, without caching.
    pub fn compile(&self, source: &str, name: Option<&str>) -> Result<Arc<CompiledTemplate>> {
        let mut source = source;
        if !self.keep_trailing_newline {
            source = source
                .strip_suffix("\r\n")
                .or_else(|| source.strip_suffix('\n'))
                .unwrap_or(source);
        }
        let attach = |err: Error| match name {
            Some(n) => err.with_template_name(n),
            None => err,
        };
        let tokens = lexer::tokenize(source, &self.lexer_options).map_err(attach)?;
        let parsed = parser::parse(tokens).map_err(attach)?;
        debug!(
            "compiled template {:?}: {} top-level statements, {} blocks",
            name.unwrap_or("<string>"),
            parsed.stmts.len(),
            parsed.blocks.len()
        );
        Ok(Arc::new(CompiledTemplate {
            name: name.map(str::to_string),
            stmts: parsed.stmts,
            extends: parsed.extends,
            blocks: parsed.blocks,
        }))
    }

    /// Register a named template directly, compiling it eagerly.
    pub fn add_template(&self, name: &str, source: &str) -> Result<()> {
        let compiled = self.compile(source, Some(name))?;
        self.cache.insert(name.to_string(), compiled);
        Ok(())
    }

    /// Resolve a named template: cache first, then the loader. A racing
    /// duplicate compilation is harmless; the cache entry is always a
    /// fully built template.
    pub(crate) fn get_compiled(&self, name: &str) -> Result<Arc<CompiledTemplate>> {
        if let Some(hit) = self.cache.get(name) {
            return Ok(Arc::clone(hit.value()));
        }
        let source = self
            .loader
            .as_ref()
            .and_then(|loader| loader.get_source(name))
            .ok_or_else(|| Error::TemplateNotFound {
                name: name.to_string(),
            })?;
        let compiled = self.compile(&source, Some(name))?;
        self.cache.insert(name.to_string(), Arc::clone(&compiled));
        Ok(compiled)
    }

    pub fn get_template(&self, name: &str) -> Result<Template<'_>> {
        Ok(Template {
            env: self,
            compiled: self.get_compiled(name)?,
        })
    }

    /// Compile an anonymous template from a string, without caching.
    pub fn template_from_str(&self, source: &str) -> Result<Template<'_>> {
        Ok(Template {
            env: self,
            compiled: self.compile(source, None)?,
        })
    }

    /// One-shot compile and render.
    pub fn render_str(&self, source: &str, vars: HashMap<String, Value>) -> Result<String> {
        self.template_from_str(source)?.render(vars)
    }
}

/// A compiled template bound to its environment, ready to render.
pub struct Template<'env> {
    env: &'env Environment,
    compiled: Arc<CompiledTemplate>,
}

impl Template<'_> {
    pub fn name(&self) -> Option<&str> {
        self.compiled.name.as_deref()
    }

    /// Render against the given variables. Each call owns its own context
    /// and output buffer, so a template may render concurrently from
    /// several threads.
    pub fn render(&self, vars: HashMap<String, Value>) -> Result<String> {
        eval::render(self.env, &self.compiled, vars).map_err(|err| match self.name() {
            Some(name) => err.with_template_name(name),
            None => err,
        })
    }
}
