use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::trace;

use crate::ast::*;
use crate::context::{BlockFrame, Context, RecursiveLoop};
use crate::environment::{CallContext, CompiledTemplate, Environment};
use crate::error::{Error, Result};
use crate::value::{escape_html, Value, ValueMap};

/// Loop control signal threaded through statement execution. Kept apart
/// from the error channel so `break`/`continue` and real errors cannot be
/// confused at catch sites; a for loop is the only consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Normal,
    Break,
    Continue,
}

/// Render a compiled template against a fresh context. The entry point
/// for [`crate::Template::render`].
pub(crate) fn render(
    env: &Environment,
    compiled: &Arc<CompiledTemplate>,
    vars: HashMap<String, Value>,
) -> Result<String> {
    let mut renderer = Renderer {
        env,
        ctx: Context::new(env, vars),
        autoescape: env.initial_autoescape(),
        macros: HashMap::new(),
        block_chains: HashMap::new(),
    };
    let mut out = String::new();
    renderer.render_template(compiled, &mut out)?;
    Ok(out)
}

/// Tree-walking interpreter. One instance per render call; owns the
/// mutable context and the dynamic auto-escape flag.
struct Renderer<'env> {
    env: &'env Environment,
    ctx: Context<'env>,
    autoescape: bool,
    /// Macros visible to the template currently rendering, pre-scanned so
    /// definition order does not matter.
    macros: HashMap<String, Arc<MacroDecl>>,
    /// Override chains per block name, most-derived first. Installed per
    /// template; `super()` walks one step down the chain.
    block_chains: HashMap<String, Vec<Arc<BlockDecl>>>,
}

impl<'env> Renderer<'env> {
    /// Render one template, resolving inheritance. A template with an
    /// extends target contributes only block overrides; the walk happens
    /// over the root ancestor's statements.
    fn render_template(&mut self, compiled: &CompiledTemplate, out: &mut String) -> Result<()> {
        trace!("rendering template {:?}", compiled.name.as_deref().unwrap_or("<string>"));
        let mut chain: Vec<Arc<CompiledTemplate>> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        if let Some(name) = &compiled.name {
            visited.insert(name.clone());
        }
        let mut next = compiled.extends.clone();
        while let Some(target) = next {
            if !visited.insert(target.clone()) {
                return Err(Error::render(
                    format!("inheritance cycle through template {target:?}"),
                    0,
                    0,
                ));
            }
            let parent = self.env.get_compiled(&target)?;
            next = parent.extends.clone();
            chain.push(parent);
        }

        // Merge block overrides child-first: the nearest descendant's
        // block of a given name wins; super() falls through the rest.
        let mut chains: HashMap<String, Vec<Arc<BlockDecl>>> = HashMap::new();
        for (name, decl) in &compiled.blocks {
            chains.entry(name.clone()).or_default().push(Arc::clone(decl));
        }
        for tmpl in &chain {
            for (name, decl) in &tmpl.blocks {
                chains.entry(name.clone()).or_default().push(Arc::clone(decl));
            }
        }

        let saved_chains = std::mem::replace(&mut self.block_chains, chains);
        let saved_macros = std::mem::take(&mut self.macros);
        self.prescan_macros(&compiled.stmts);
        for tmpl in &chain {
            self.prescan_macros(&tmpl.stmts);
        }

        let root_stmts = match chain.last() {
            Some(root) => &root.stmts,
            None => &compiled.stmts,
        };
        let result = self.exec_stmts(root_stmts, out);
        self.block_chains = saved_chains;
        self.macros = saved_macros;
        // The parser rejects break/continue outside loops, so the flow
        // here is always Normal.
        result.map(|_| ())
    }

    /// Register every macro declaration reachable in this statement tree,
    /// making macros visible template-wide regardless of position.
    fn prescan_macros(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            match &stmt.kind {
                StmtKind::Macro(decl) => {
                    self.macros.insert(decl.name.clone(), Arc::clone(decl));
                    self.prescan_macros(&decl.body);
                }
                StmtKind::If { arms, else_body } => {
                    for (_, body) in arms {
                        self.prescan_macros(body);
                    }
                    if let Some(body) = else_body {
                        self.prescan_macros(body);
                    }
                }
                StmtKind::For { body, else_body, .. } => {
                    self.prescan_macros(body);
                    if let Some(body) = else_body {
                        self.prescan_macros(body);
                    }
                }
                StmtKind::Block(decl) => self.prescan_macros(&decl.body),
                StmtKind::With { body, .. }
                | StmtKind::Autoescape { body, .. }
                | StmtKind::SetBlock { body, .. } => self.prescan_macros(body),
                StmtKind::CallBlock { body, .. } => self.prescan_macros(body),
                _ => {}
            }
        }
    }

    fn exec_stmts(&mut self, stmts: &[Stmt], out: &mut String) -> Result<Flow> {
        for stmt in stmts {
            match self.exec_stmt(stmt, out)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    /// Render a nested body into a fresh buffer (macro output, set-block
    /// capture, call bodies) instead of the shared one.
    fn capture(&mut self, stmts: &[Stmt]) -> Result<(String, Flow)> {
        let mut buf = String::new();
        let flow = self.exec_stmts(stmts, &mut buf)?;
        Ok((buf, flow))
    }

    fn exec_stmt(&mut self, stmt: &Stmt, out: &mut String) -> Result<Flow> {
        match &stmt.kind {
            StmtKind::Text(text) => {
                out.push_str(text);
                Ok(Flow::Normal)
            }
            StmtKind::Output(expr) => {
                let value = self.eval(expr)?;
                self.write_value(&value, out);
                Ok(Flow::Normal)
            }
            StmtKind::If { arms, else_body } => {
                for (condition, body) in arms {
                    if self.eval(condition)?.is_truthy() {
                        return self.exec_stmts(body, out);
                    }
                }
                match else_body {
                    Some(body) => self.exec_stmts(body, out),
                    None => Ok(Flow::Normal),
                }
            }
            StmtKind::For {
                targets,
                iter,
                filter,
                recursive,
                body,
                else_body,
            } => {
                let iterable = self.eval(iter)?;
                let items = self.materialize(&iterable, iter.span)?;
                let items = match filter {
                    Some(filter) => self.filter_items(targets, filter, items)?,
                    None => items,
                };
                let rec = recursive.then(|| RecursiveLoop {
                    targets: targets.clone(),
                    filter: filter.clone(),
                    body: Arc::new(body.clone()),
                });
                self.run_loop(targets, body, else_body.as_deref(), items, rec, out)
            }
            StmtKind::Block(decl) => self.exec_block(decl, out),
            // Extends is consumed by render_template; the body of an
            // extending template is never walked directly.
            StmtKind::Extends { .. } => Ok(Flow::Normal),
            StmtKind::Include {
                name,
                with_context,
                ignore_missing,
            } => self.exec_include(name, *with_context, *ignore_missing, out),
            StmtKind::Set { targets, value } => {
                let value = self.eval(value)?;
                self.bind_targets(targets, &value);
                Ok(Flow::Normal)
            }
            StmtKind::SetBlock { name, body } => {
                let (text, flow) = self.capture(body)?;
                self.ctx.set(name, Value::Safe(text));
                Ok(flow)
            }
            StmtKind::Macro(decl) => {
                self.macros.insert(decl.name.clone(), Arc::clone(decl));
                Ok(Flow::Normal)
            }
            StmtKind::CallBlock { call, body } => {
                let ExprKind::Call {
                    callee,
                    args,
                    kwargs,
                } = &call.kind
                else {
                    return Err(Error::render(
                        "call block requires a macro invocation",
                        call.span.line,
                        call.span.column,
                    ));
                };
                let caller = Value::Caller(Arc::clone(body));
                let result = self.eval_call(callee, args, kwargs, Some(caller), call.span)?;
                self.write_value(&result, out);
                Ok(Flow::Normal)
            }
            StmtKind::With { bindings, body } => {
                self.ctx.push_scope();
                let result = self.exec_with_body(bindings, body, out);
                self.ctx.pop_scope();
                result
            }
            StmtKind::Autoescape { enabled, body } => {
                let saved = self.autoescape;
                self.autoescape = *enabled;
                let result = self.exec_stmts(body, out);
                self.autoescape = saved;
                result
            }
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
        }
    }

    fn exec_with_body(
        &mut self,
        bindings: &[(String, Expr)],
        body: &[Stmt],
        out: &mut String,
    ) -> Result<Flow> {
        // Left-to-right, each binding visible to the ones after it.
        for (name, expr) in bindings {
            let value = self.eval(expr)?;
            self.ctx.set(name, value);
        }
        self.exec_stmts(body, out)
    }

    fn exec_block(&mut self, decl: &Arc<BlockDecl>, out: &mut String) -> Result<Flow> {
        let render_decl = match self.block_chains.get(&decl.name) {
            Some(chain) => Arc::clone(&chain[0]),
            None => Arc::clone(decl),
        };
        self.ctx.blocks.push(BlockFrame {
            name: decl.name.clone(),
            chain_index: 0,
        });
        if render_decl.scoped {
            self.ctx.push_scope();
        }
        let result = self.exec_stmts(&render_decl.body, out);
        if render_decl.scoped {
            self.ctx.pop_scope();
        }
        self.ctx.blocks.pop();
        result
    }

    fn exec_include(
        &mut self,
        name: &Expr,
        with_context: bool,
        ignore_missing: bool,
        out: &mut String,
    ) -> Result<Flow> {
        let name_value = self.eval(name)?;
        let Some(template_name) = name_value.as_str() else {
            return Err(Error::render(
                format!("include name must be a string, got {}", name_value.kind_name()),
                name.span.line,
                name.span.column,
            ));
        };
        let compiled = match self.env.get_compiled(template_name) {
            Ok(compiled) => compiled,
            // `ignore missing` converts exactly not-found to empty output;
            // every other error still propagates.
            Err(Error::TemplateNotFound { .. }) if ignore_missing => return Ok(Flow::Normal),
            Err(err) => return Err(err),
        };
        let attach = |err: Error| err.with_template_name(template_name);
        if with_context {
            self.ctx.push_scope();
            let result = self.render_template(&compiled, out);
            self.ctx.pop_scope();
            result.map_err(attach)?;
        } else {
            let saved = self.ctx.replace_scopes(vec![HashMap::new()]);
            let result = self.render_template(&compiled, out);
            self.ctx.replace_scopes(saved);
            result.map_err(attach)?;
        }
        Ok(Flow::Normal)
    }

    // ── Loops ──

    /// Fully materialize an iterable before the loop starts; the loop
    /// context needs the final length up front.
    fn materialize(&self, value: &Value, span: Span) -> Result<Vec<Value>> {
        match value {
            Value::Seq(items) => Ok(items.clone()),
            Value::Map(map) => Ok(map.keys().map(Value::from).collect()),
            Value::String(s) | Value::Safe(s) => {
                Ok(s.chars().map(|c| Value::String(c.to_string())).collect())
            }
            Value::Undefined => Ok(Vec::new()),
            other => Err(Error::render(
                format!("value of type {} is not iterable", other.kind_name()),
                span.line,
                span.column,
            )),
        }
    }

    /// Apply the inline `if` filter before the loop context exists, so
    /// `loop.length` reflects the post-filter count.
    fn filter_items(
        &mut self,
        targets: &[String],
        filter: &Expr,
        items: Vec<Value>,
    ) -> Result<Vec<Value>> {
        self.ctx.push_scope();
        let mut kept = Vec::new();
        let result = (|| {
            for item in &items {
                self.bind_targets(targets, item);
                if self.eval(filter)?.is_truthy() {
                    kept.push(item.clone());
                }
            }
            Ok(())
        })();
        self.ctx.pop_scope();
        result.map(|()| kept)
    }

    fn run_loop(
        &mut self,
        targets: &[String],
        body: &[Stmt],
        else_body: Option<&[Stmt]>,
        items: Vec<Value>,
        recursive: Option<RecursiveLoop>,
        out: &mut String,
    ) -> Result<Flow> {
        if items.is_empty() {
            return match else_body {
                Some(body) => self.exec_stmts(body, out),
                None => Ok(Flow::Normal),
            };
        }
        self.ctx.push_loop(items, recursive);
        // One scope for the whole loop; iterations rebind the targets.
        self.ctx.push_scope();
        let result = self.loop_iterations(targets, body, out);
        self.ctx.pop_scope();
        self.ctx.pop_loop();
        // Break/continue stop here; the loop boundary is where the signal
        // is consumed.
        result.map(|()| Flow::Normal)
    }

    fn loop_iterations(&mut self, targets: &[String], body: &[Stmt], out: &mut String) -> Result<()> {
        let len = self
            .ctx
            .current_loop()
            .map(|frame| frame.len())
            .unwrap_or(0);
        for i in 0..len {
            let item = self
                .ctx
                .current_loop()
                .map(|frame| frame.items[i].clone())
                .unwrap_or(Value::Undefined);
            self.bind_targets(targets, &item);
            match self.exec_stmts(body, out)? {
                Flow::Break => break,
                Flow::Continue | Flow::Normal => {}
            }
            if let Some(frame) = self.ctx.current_loop_mut() {
                frame.index0 = i + 1;
            }
        }
        Ok(())
    }

    /// Bind loop/set targets, tuple-unpacking when more than one name is
    /// declared. Mismatched lengths truncate or fill with undefined.
    fn bind_targets(&mut self, targets: &[String], value: &Value) {
        if targets.len() == 1 {
            self.ctx.set(&targets[0], value.clone());
            return;
        }
        let parts: Vec<Value> = match value {
            Value::Seq(items) => items.clone(),
            other => vec![other.clone()],
        };
        for (i, target) in targets.iter().enumerate() {
            self.ctx
                .set(target, parts.get(i).cloned().unwrap_or(Value::Undefined));
        }
    }

    // ── Output ──

    fn write_value(&self, value: &Value, out: &mut String) {
        if self.autoescape && !value.is_safe() {
            out.push_str(&escape_html(&value.to_string()));
        } else {
            out.push_str(&value.to_string());
        }
    }

    // ── Expressions ──

    fn eval(&mut self, expr: &Expr) -> Result<Value> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Str(s) => Ok(Value::String(s.clone())),
            ExprKind::Int(n) => Ok(Value::Int(*n)),
            ExprKind::Float(f) => Ok(Value::Float(*f)),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::None => Ok(Value::Null),
            ExprKind::Name(name) => self.ctx.get(name),
            ExprKind::Attr { base, name } => {
                let base = self.eval(base)?;
                self.get_attribute(&base, name, span)
            }
            ExprKind::Index { base, index } => {
                let base = self.eval(base)?;
                let index = self.eval(index)?;
                self.get_item(&base, &index, span)
            }
            ExprKind::Call {
                callee,
                args,
                kwargs,
            } => self.eval_call(callee, args, kwargs, None, span),
            ExprKind::Filter {
                base,
                name,
                args,
                kwargs,
            } => {
                let value = self.eval(base)?;
                let args = self.eval_args(args)?;
                let mut kw = HashMap::new();
                for (key, expr) in kwargs {
                    kw.insert(key.clone(), self.eval(expr)?);
                }
                let Some(filter) = self.env.filter(name) else {
                    return Err(Error::UndefinedFilter { name: name.clone() });
                };
                let filter = Arc::clone(filter);
                let call_ctx = CallContext {
                    env: self.env,
                    autoescape: self.autoescape,
                };
                filter(&value, &args, &kw, &call_ctx)
            }
            ExprKind::Test {
                base,
                name,
                args,
                negated,
            } => {
                // `is defined` / `is undefined` must see a missing name
                // rather than trip the strict policy.
                let value = match self.eval(base) {
                    Err(Error::UndefinedVariable { .. })
                        if name == "defined" || name == "undefined" =>
                    {
                        Value::Undefined
                    }
                    other => other?,
                };
                let args = self.eval_args(args)?;
                let Some(test) = self.env.test(name) else {
                    return Err(Error::UndefinedTest { name: name.clone() });
                };
                let test = Arc::clone(test);
                let call_ctx = CallContext {
                    env: self.env,
                    autoescape: self.autoescape,
                };
                let result = test(&value, &args, &call_ctx)?;
                Ok(Value::Bool(result != *negated))
            }
            ExprKind::BinOp { op, left, right } => match op {
                // `and`/`or` yield the deciding operand itself, so
                // `name or 'anon'` is a fallback expression, not a bool.
                BinOp::And => {
                    let left = self.eval(left)?;
                    if !left.is_truthy() {
                        return Ok(left);
                    }
                    self.eval(right)
                }
                BinOp::Or => {
                    let left = self.eval(left)?;
                    if left.is_truthy() {
                        return Ok(left);
                    }
                    self.eval(right)
                }
                BinOp::In | BinOp::NotIn => {
                    let left = self.eval(left)?;
                    let right = self.eval(right)?;
                    let found = self.contains(&right, &left, span)?;
                    Ok(Value::Bool(found == (*op == BinOp::In)))
                }
                BinOp::Concat => {
                    let left = self.eval(left)?;
                    let right = self.eval(right)?;
                    Ok(Value::String(format!("{left}{right}")))
                }
                _ => {
                    let left = self.eval(left)?;
                    let right = self.eval(right)?;
                    self.arith(*op, &left, &right, span)
                }
            },
            ExprKind::Compare { first, rest } => {
                // Left-to-right, short-circuiting; each link's right-hand
                // value carries over as the next link's left.
                let mut prev = self.eval(first)?;
                for (op, expr) in rest {
                    let next = self.eval(expr)?;
                    if !self.compare(*op, &prev, &next, span)? {
                        return Ok(Value::Bool(false));
                    }
                    prev = next;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::Unary { op, expr } => {
                let value = self.eval(expr)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                    UnaryOp::Neg => match value {
                        Value::Int(n) => Ok(Value::Int(-n)),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(Error::render(
                            format!("cannot negate {}", other.kind_name()),
                            span.line,
                            span.column,
                        )),
                    },
                    UnaryOp::Pos => match value {
                        Value::Int(_) | Value::Float(_) => Ok(value),
                        other => Err(Error::render(
                            format!("unary plus on {}", other.kind_name()),
                            span.line,
                            span.column,
                        )),
                    },
                }
            }
            ExprKind::Cond {
                then,
                test,
                otherwise,
            } => {
                if self.eval(test)?.is_truthy() {
                    self.eval(then)
                } else {
                    match otherwise {
                        Some(expr) => self.eval(expr),
                        None => Ok(Value::Undefined),
                    }
                }
            }
            ExprKind::List(items) | ExprKind::Tuple(items) => {
                Ok(Value::Seq(self.eval_args(items)?))
            }
            ExprKind::Dict(entries) => {
                let mut map = ValueMap::new();
                for (key, value) in entries {
                    let key = self.eval(key)?;
                    let key = match key.as_str() {
                        Some(s) => s.to_string(),
                        None => key.to_string(),
                    };
                    let value = self.eval(value)?;
                    map.insert(key, value);
                }
                Ok(Value::Map(map))
            }
        }
    }

    fn eval_args(&mut self, exprs: &[Expr]) -> Result<Vec<Value>> {
        exprs.iter().map(|expr| self.eval(expr)).collect()
    }

    fn get_attribute(&self, base: &Value, name: &str, span: Span) -> Result<Value> {
        match base {
            Value::Map(map) => Ok(map
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.env.undefined_value().clone())),
            Value::Undefined => Ok(Value::Undefined),
            other => Err(Error::render(
                format!("cannot access attribute {name:?} of {}", other.kind_name()),
                span.line,
                span.column,
            )),
        }
    }

    fn get_item(&self, base: &Value, index: &Value, span: Span) -> Result<Value> {
        match (base, index) {
            (Value::Seq(items), Value::Int(i)) => {
                let idx = if *i < 0 { items.len() as i64 + i } else { *i };
                Ok(usize::try_from(idx)
                    .ok()
                    .and_then(|idx| items.get(idx).cloned())
                    .unwrap_or_else(|| self.env.undefined_value().clone()))
            }
            (Value::Map(map), key) if key.as_str().is_some() => Ok(map
                .get(key.as_str().unwrap())
                .cloned()
                .unwrap_or_else(|| self.env.undefined_value().clone())),
            (Value::String(s) | Value::Safe(s), Value::Int(i)) => {
                let chars: Vec<char> = s.chars().collect();
                let idx = if *i < 0 { chars.len() as i64 + i } else { *i };
                Ok(usize::try_from(idx)
                    .ok()
                    .and_then(|idx| chars.get(idx).copied())
                    .map(|c| Value::String(c.to_string()))
                    .unwrap_or_else(|| self.env.undefined_value().clone()))
            }
            (Value::Undefined, _) => Ok(Value::Undefined),
            (base, index) => Err(Error::render(
                format!(
                    "cannot index {} with {}",
                    base.kind_name(),
                    index.kind_name()
                ),
                span.line,
                span.column,
            )),
        }
    }

    // ── Calls: macros, super(), loop(), caller() ──

    fn eval_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        caller: Option<Value>,
        span: Span,
    ) -> Result<Value> {
        if let ExprKind::Name(name) = &callee.kind {
            match name.as_str() {
                "super" => return self.call_super(span),
                "loop" => {
                    if let Some(rec) = self
                        .ctx
                        .current_loop()
                        .and_then(|frame| frame.recursive.clone())
                    {
                        return self.call_recursive_loop(rec, args, span);
                    }
                }
                _ => {
                    if let Some(decl) = self.macros.get(name.as_str()).cloned() {
                        return self.call_macro(&decl, args, kwargs, caller);
                    }
                }
            }
        }
        // loop.cycle(...) reads the live loop frame.
        if let ExprKind::Attr { base, name } = &callee.kind {
            if name == "cycle" && matches!(&base.kind, ExprKind::Name(n) if n == "loop") {
                let choices = self.eval_args(args)?;
                let Some(frame) = self.ctx.current_loop() else {
                    return Err(Error::render(
                        "loop.cycle() outside of a loop",
                        span.line,
                        span.column,
                    ));
                };
                return Ok(frame.cycle(&choices));
            }
        }
        let callee_value = self.eval(callee)?;
        match callee_value {
            Value::Caller(body) => {
                let (text, _flow) = self.capture(&body)?;
                Ok(Value::Safe(text))
            }
            other => Err(Error::render(
                format!("value of type {} is not callable", other.kind_name()),
                span.line,
                span.column,
            )),
        }
    }

    fn call_macro(
        &mut self,
        decl: &MacroDecl,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        caller: Option<Value>,
    ) -> Result<Value> {
        let args = self.eval_args(args)?;
        let mut kw: HashMap<String, Value> = HashMap::new();
        for (name, expr) in kwargs {
            let value = self.eval(expr)?;
            kw.insert(name.clone(), value);
        }
        self.ctx.push_scope();
        let result = self.run_macro(decl, args, kw, caller);
        self.ctx.pop_scope();
        result
    }

    fn run_macro(
        &mut self,
        decl: &MacroDecl,
        args: Vec<Value>,
        mut kwargs: HashMap<String, Value>,
        caller: Option<Value>,
    ) -> Result<Value> {
        let mut positional = args.into_iter();
        for param in &decl.params {
            let value = if let Some(value) = kwargs.remove(&param.name) {
                value
            } else if let Some(value) = positional.next() {
                value
            } else if let Some(default) = &param.default {
                // Defaults evaluate in the invocation scope, not where the
                // macro was defined.
                self.eval(default)?
            } else {
                Value::Undefined
            };
            self.ctx.set(&param.name, value);
        }
        if let Some(caller) = caller {
            self.ctx.set("caller", caller);
        }
        // Macro output is captured separately and returned as a value, so
        // invocations compose inside larger expressions.
        let (text, _flow) = self.capture(&decl.body)?;
        Ok(Value::Safe(text))
    }

    fn call_super(&mut self, span: Span) -> Result<Value> {
        let Some(frame) = self.ctx.blocks.last() else {
            return Err(Error::render(
                "super() outside of a block",
                span.line,
                span.column,
            ));
        };
        let name = frame.name.clone();
        let next_index = frame.chain_index + 1;
        let parent = self
            .block_chains
            .get(&name)
            .and_then(|chain| chain.get(next_index))
            .map(Arc::clone);
        let Some(decl) = parent else {
            return Err(Error::render(
                format!("block {name:?} has no parent block for super()"),
                span.line,
                span.column,
            ));
        };
        self.ctx.blocks.push(BlockFrame {
            name,
            chain_index: next_index,
        });
        let result = self.capture(&decl.body);
        self.ctx.blocks.pop();
        let (text, _flow) = result?;
        Ok(Value::Safe(text))
    }

    /// `{{ loop(children) }}` inside a recursive for: replay the loop body
    /// over a new iterable, one depth deeper.
    fn call_recursive_loop(
        &mut self,
        rec: RecursiveLoop,
        args: &[Expr],
        span: Span,
    ) -> Result<Value> {
        let [iterable] = args else {
            return Err(Error::render(
                "loop() takes exactly one argument",
                span.line,
                span.column,
            ));
        };
        let value = self.eval(iterable)?;
        let items = self.materialize(&value, iterable.span)?;
        let items = match &rec.filter {
            Some(filter) => self.filter_items(&rec.targets, filter, items)?,
            None => items,
        };
        let mut buf = String::new();
        let body = Arc::clone(&rec.body);
        let targets = rec.targets.clone();
        self.run_loop(&targets, &body, None, items, Some(rec), &mut buf)?;
        Ok(Value::Safe(buf))
    }

    // ── Coercion and operators ──

    fn arith(&self, op: BinOp, left: &Value, right: &Value, span: Span) -> Result<Value> {
        let type_err = |msg: String| Error::render(msg, span.line, span.column);

        // String and sequence forms of + and * come first; everything
        // else is numeric with int-to-float promotion.
        match (op, left, right) {
            (BinOp::Add, Value::String(a) | Value::Safe(a), Value::String(b) | Value::Safe(b)) => {
                return Ok(Value::String(format!("{a}{b}")));
            }
            (BinOp::Add, Value::Seq(a), Value::Seq(b)) => {
                let mut items = a.clone();
                items.extend(b.iter().cloned());
                return Ok(Value::Seq(items));
            }
            (BinOp::Mul, Value::String(s) | Value::Safe(s), Value::Int(n))
            | (BinOp::Mul, Value::Int(n), Value::String(s) | Value::Safe(s)) => {
                return Ok(Value::String(s.repeat((*n).max(0) as usize)));
            }
            (BinOp::Mul, Value::Seq(items), Value::Int(n))
            | (BinOp::Mul, Value::Int(n), Value::Seq(items)) => {
                let mut repeated = Vec::new();
                for _ in 0..(*n).max(0) {
                    repeated.extend(items.iter().cloned());
                }
                return Ok(Value::Seq(repeated));
            }
            _ => {}
        }

        if !left.is_number() || !right.is_number() {
            return Err(type_err(format!(
                "unsupported operand types for {}: {} and {}",
                arith_symbol(op),
                left.kind_name(),
                right.kind_name()
            )));
        }

        // Integer arithmetic unless either side is a float; `/` is always
        // true division.
        if let (Value::Int(a), Value::Int(b)) = (left, right) {
            let (a, b) = (*a, *b);
            return match op {
                BinOp::Add => a
                    .checked_add(b)
                    .map(Value::Int)
                    .ok_or_else(|| type_err("integer overflow".into())),
                BinOp::Sub => a
                    .checked_sub(b)
                    .map(Value::Int)
                    .ok_or_else(|| type_err("integer overflow".into())),
                BinOp::Mul => a
                    .checked_mul(b)
                    .map(Value::Int)
                    .ok_or_else(|| type_err("integer overflow".into())),
                BinOp::Div => {
                    if b == 0 {
                        Err(type_err("division by zero".into()))
                    } else {
                        Ok(Value::Float(a as f64 / b as f64))
                    }
                }
                BinOp::FloorDiv => {
                    if b == 0 {
                        Err(type_err("division by zero".into()))
                    } else {
                        let q = a / b;
                        let r = a % b;
                        // Floor semantics: round toward negative infinity.
                        Ok(Value::Int(if r != 0 && (r < 0) != (b < 0) {
                            q - 1
                        } else {
                            q
                        }))
                    }
                }
                BinOp::Mod => {
                    if b == 0 {
                        Err(type_err("modulo by zero".into()))
                    } else {
                        let r = a % b;
                        Ok(Value::Int(if r != 0 && (r < 0) != (b < 0) {
                            r + b
                        } else {
                            r
                        }))
                    }
                }
                BinOp::Pow => {
                    if b >= 0 {
                        u32::try_from(b)
                            .ok()
                            .and_then(|exp| a.checked_pow(exp))
                            .map(Value::Int)
                            .ok_or_else(|| type_err("integer overflow".into()))
                    } else {
                        Ok(Value::Float((a as f64).powf(b as f64)))
                    }
                }
                _ => unreachable!("non-arithmetic op in arith"),
            };
        }

        let a = left.as_f64().unwrap();
        let b = right.as_f64().unwrap();
        match op {
            BinOp::Add => Ok(Value::Float(a + b)),
            BinOp::Sub => Ok(Value::Float(a - b)),
            BinOp::Mul => Ok(Value::Float(a * b)),
            BinOp::Div => {
                if b == 0.0 {
                    Err(type_err("division by zero".into()))
                } else {
                    Ok(Value::Float(a / b))
                }
            }
            BinOp::FloorDiv => {
                if b == 0.0 {
                    Err(type_err("division by zero".into()))
                } else {
                    Ok(Value::Float((a / b).floor()))
                }
            }
            BinOp::Mod => {
                if b == 0.0 {
                    Err(type_err("modulo by zero".into()))
                } else {
                    Ok(Value::Float(a.rem_euclid(b)))
                }
            }
            BinOp::Pow => Ok(Value::Float(a.powf(b))),
            _ => unreachable!("non-arithmetic op in arith"),
        }
    }

    fn compare(&self, op: CmpOp, left: &Value, right: &Value, span: Span) -> Result<bool> {
        match op {
            CmpOp::Eq => return Ok(left == right),
            CmpOp::Ne => return Ok(left != right),
            _ => {}
        }
        let Some(ordering) = left.compare(right) else {
            return Err(Error::render(
                format!(
                    "cannot compare {} with {}",
                    left.kind_name(),
                    right.kind_name()
                ),
                span.line,
                span.column,
            ));
        };
        Ok(match op {
            CmpOp::Lt => ordering.is_lt(),
            CmpOp::Le => ordering.is_le(),
            CmpOp::Gt => ordering.is_gt(),
            CmpOp::Ge => ordering.is_ge(),
            CmpOp::Eq | CmpOp::Ne => unreachable!(),
        })
    }

    /// `in` containment: substring for strings, key presence for
    /// mappings, numeric-aware element scan for sequences.
    fn contains(&self, container: &Value, item: &Value, span: Span) -> Result<bool> {
        match container {
            Value::String(s) | Value::Safe(s) => match item.as_str() {
                Some(needle) => Ok(s.contains(needle)),
                None => Err(Error::render(
                    format!(
                        "cannot search for {} in a string",
                        item.kind_name()
                    ),
                    span.line,
                    span.column,
                )),
            },
            Value::Map(map) => Ok(item.as_str().is_some_and(|key| map.contains_key(key))),
            Value::Seq(items) => Ok(items.iter().any(|candidate| candidate == item)),
            other => Err(Error::render(
                format!("{} is not a container", other.kind_name()),
                span.line,
                span.column,
            )),
        }
    }
}

fn arith_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::FloorDiv => "//",
        BinOp::Mod => "%",
        BinOp::Pow => "**",
        BinOp::Concat => "~",
        BinOp::And => "and",
        BinOp::Or => "or",
        BinOp::In => "in",
        BinOp::NotIn => "not in",
    }
}
