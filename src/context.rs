use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::{Expr, Stmt};
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::value::{Value, ValueMap};

/// Per-loop state for a recursive `{% for %}`; calling `loop(iterable)`
/// replays these statements one depth deeper.
#[derive(Clone)]
pub struct RecursiveLoop {
    pub targets: Vec<String>,
    pub filter: Option<Expr>,
    pub body: Arc<Vec<Stmt>>,
}

/// Metadata for one active loop. Frames stack per nesting level; the
/// frame below the top is the parent loop.
pub struct LoopFrame {
    pub items: Vec<Value>,
    pub index0: usize,
    pub depth: usize,
    pub recursive: Option<RecursiveLoop>,
}

impl LoopFrame {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    fn item_at(&self, index: usize) -> Value {
        self.items.get(index).cloned().unwrap_or(Value::Undefined)
    }

    /// The `loop` object as template authors see it this iteration.
    pub fn snapshot(&self) -> Value {
        let len = self.len();
        let i = self.index0;
        let mut map = ValueMap::new();
        map.insert("index", i + 1);
        map.insert("index0", i);
        map.insert("revindex", len - i);
        map.insert("revindex0", len - i - 1);
        map.insert("first", i == 0);
        map.insert("last", i + 1 == len);
        map.insert("length", len);
        map.insert("depth", self.depth);
        map.insert("depth0", self.depth - 1);
        map.insert(
            "previtem",
            if i == 0 {
                Value::Undefined
            } else {
                self.item_at(i - 1)
            },
        );
        map.insert("nextitem", self.item_at(i + 1));
        Value::Map(map)
    }

    /// `loop.cycle(a, b, ...)`: pick by current index.
    pub fn cycle(&self, choices: &[Value]) -> Value {
        if choices.is_empty() {
            Value::Undefined
        } else {
            choices[self.index0 % choices.len()].clone()
        }
    }
}

/// One entry of the parent-block stack: which block we are inside, and
/// how far down its override chain. `super()` renders the next entry.
pub struct BlockFrame {
    pub name: String,
    pub chain_index: usize,
}

/// Mutable evaluation state for one render call: the scope chain, the
/// loop-context stack, and the parent-block stack. Never shared between
/// renders.
pub struct Context<'env> {
    env: &'env Environment,
    scopes: Vec<HashMap<String, Value>>,
    loops: Vec<LoopFrame>,
    pub blocks: Vec<BlockFrame>,
}

impl<'env> Context<'env> {
    pub fn new(env: &'env Environment, vars: HashMap<String, Value>) -> Self {
        Self {
            env,
            scopes: vec![vars],
            loops: Vec::new(),
            blocks: Vec::new(),
        }
    }

    /// Chain lookup: innermost scope outward, then environment globals,
    /// then the undefined policy. The name `loop` resolves to the active
    /// loop context ahead of any user binding.
    pub fn get(&self, name: &str) -> Result<Value> {
        if name == "loop" {
            if let Some(frame) = self.loops.last() {
                return Ok(frame.snapshot());
            }
        }
        match self.lookup(name) {
            Some(value) => Ok(value),
            None if self.env.strict_undefined() => {
                Err(Error::UndefinedVariable { name: name.to_string() })
            }
            None => Ok(self.env.undefined_value().clone()),
        }
    }

    /// Lookup without the undefined policy applied.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.get(name) {
                return Some(value.clone());
            }
        }
        self.env.global(name)
    }

    /// Bind in the innermost scope only; ancestors are never mutated, so
    /// bindings made inside a loop or `with` body die on scope exit.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.into(), value);
        }
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    /// Swap out the whole scope chain (include `without context`).
    pub fn replace_scopes(
        &mut self,
        scopes: Vec<HashMap<String, Value>>,
    ) -> Vec<HashMap<String, Value>> {
        std::mem::replace(&mut self.scopes, scopes)
    }

    pub fn push_loop(&mut self, items: Vec<Value>, recursive: Option<RecursiveLoop>) {
        let depth = self.loops.last().map(|f| f.depth).unwrap_or(0) + 1;
        self.loops.push(LoopFrame {
            items,
            index0: 0,
            depth,
            recursive,
        });
    }

    pub fn pop_loop(&mut self) {
        self.loops.pop();
    }

    pub fn current_loop(&self) -> Option<&LoopFrame> {
        self.loops.last()
    }

    pub fn current_loop_mut(&mut self) -> Option<&mut LoopFrame> {
        self.loops.last_mut()
    }
}
