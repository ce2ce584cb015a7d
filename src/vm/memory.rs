//! Memory usage estimation
//!
//! Walks everything reachable from the VM's roots and adds up approximate
//! sizes. Shared structures are counted once, keyed by address. The walk
//! uses an explicit worklist, so deep object graphs cannot exhaust the
//! native stack.

use super::{CallFrame, IterSource, IterStackItem, Reference, Stash, StashRef, Vm};
use crate::bytecode::{Instruction, Program};
use crate::object::{FunctionKind, JsObject, ObjectKind, ObjectRef, Property, PropertyKey};
use crate::prelude::*;
use crate::value::{CheapClone, Value};
use std::mem::size_of;
use thiserror::Error;

/// The walk passed the budget given to [`Vm::estimate_memory_usage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("memory limit exceeded: {used} bytes used, limit is {limit}")]
pub struct MemoryLimitExceeded {
    pub used: u64,
    pub limit: u64,
}

enum Node {
    Value(Value),
    Object(ObjectRef),
    Stash(StashRef),
    Program(Rc<Program>),
}

/// Accumulator of one memory walk
pub struct MemUsageContext {
    visited: FxHashSet<usize>,
    pending: Vec<Node>,
    limit: Option<u64>,
    total: u64,
}

impl MemUsageContext {
    pub fn new(limit: Option<u64>) -> Self {
        MemUsageContext {
            visited: FxHashSet::default(),
            pending: Vec::new(),
            limit,
            total: 0,
        }
    }

    /// Bytes counted so far
    pub fn total(&self) -> u64 {
        self.total
    }

    fn add(&mut self, bytes: usize) -> Result<(), MemoryLimitExceeded> {
        self.total = self.total.saturating_add(bytes as u64);
        match self.limit {
            Some(limit) if self.total > limit => Err(MemoryLimitExceeded {
                used: self.total,
                limit,
            }),
            _ => Ok(()),
        }
    }

    /// First visit of the structure at `addr`
    fn first_visit(&mut self, addr: usize) -> bool {
        self.visited.insert(addr)
    }

    pub fn add_value(&mut self, value: &Value) {
        self.pending.push(Node::Value(value.clone()));
    }

    pub fn add_stash(&mut self, stash: &StashRef) {
        self.pending.push(Node::Stash(stash.clone()));
    }

    pub fn add_program(&mut self, program: &Rc<Program>) {
        self.pending.push(Node::Program(program.clone()));
    }

    /// Drain the worklist
    pub fn walk(&mut self) -> Result<u64, MemoryLimitExceeded> {
        while let Some(node) = self.pending.pop() {
            match node {
                Node::Value(value) => self.value(value)?,
                Node::Object(obj) => self.object(&obj)?,
                Node::Stash(stash) => self.stash(&stash)?,
                Node::Program(program) => self.program(&program)?,
            }
        }
        Ok(self.total)
    }

    fn value(&mut self, value: Value) -> Result<(), MemoryLimitExceeded> {
        match value {
            Value::String(s) => self.add(s.heap_size()),
            Value::Unresolved { name, .. } => self.add(name.heap_size()),
            Value::Object(obj) => {
                self.pending.push(Node::Object(obj));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn object(&mut self, obj: &ObjectRef) -> Result<(), MemoryLimitExceeded> {
        if !self.first_visit(obj.addr()) {
            return Ok(());
        }
        let o = obj.borrow();
        self.add(size_of::<JsObject>())?;
        self.add(o.properties.len() * (size_of::<PropertyKey>() + size_of::<Property>()))?;
        if let Some(proto) = &o.prototype {
            self.pending.push(Node::Object(proto.cheap_clone()));
        }
        for (key, prop) in &o.properties {
            if let PropertyKey::String(s) = key {
                self.add(s.heap_size())?;
            }
            self.pending.push(Node::Value(prop.value.clone()));
        }
        match &o.kind {
            ObjectKind::Array(elements) => {
                self.add(elements.len() * size_of::<Value>())?;
                self.pending.extend(elements.iter().cloned().map(Node::Value));
            }
            ObjectKind::Arguments(args) => {
                self.add(args.mapped.len())?;
                self.pending.push(Node::Stash(args.stash.clone()));
            }
            ObjectKind::Primitive(value) => self.pending.push(Node::Value(value.clone())),
            ObjectKind::Function(f) => {
                self.pending.push(Node::Stash(f.stash.clone()));
                self.pending.push(Node::Program(f.template.program.clone()));
                if let FunctionKind::Arrow { this, new_target } = &f.kind {
                    self.pending.push(Node::Value(this.clone()));
                    self.pending.push(Node::Value(new_target.clone()));
                }
            }
            ObjectKind::Bound(b) => {
                self.pending.push(Node::Object(b.target.cheap_clone()));
                self.pending.push(Node::Value(b.this.clone()));
                self.add(b.args.len() * size_of::<Value>())?;
                self.pending.extend(b.args.iter().cloned().map(Node::Value));
            }
            ObjectKind::Proxy(p) => self.pending.push(Node::Object(p.target.cheap_clone())),
            ObjectKind::Ordinary | ObjectKind::Error(_) | ObjectKind::Native(_) | ObjectKind::Lazy(_) => {}
        }
        Ok(())
    }

    fn stash(&mut self, stash: &StashRef) -> Result<(), MemoryLimitExceeded> {
        if !self.first_visit(Rc::as_ptr(stash) as *const u8 as usize) {
            return Ok(());
        }
        let s = stash.borrow();
        self.add(size_of::<Stash>())?;
        self.add((s.values.len() + s.extra_args.len()) * size_of::<Value>())?;
        self.pending.extend(s.values.iter().cloned().map(Node::Value));
        self.pending.extend(s.extra_args.iter().cloned().map(Node::Value));
        if let Some(obj) = &s.obj {
            self.pending.push(Node::Object(obj.cheap_clone()));
        }
        if let Some(outer) = &s.outer {
            self.pending.push(Node::Stash(outer.clone()));
        }
        Ok(())
    }

    fn program(&mut self, program: &Rc<Program>) -> Result<(), MemoryLimitExceeded> {
        if !self.first_visit(Rc::as_ptr(program) as *const u8 as usize) {
            return Ok(());
        }
        self.add(size_of::<Program>())?;
        self.add(program.code.len() * size_of::<Instruction>())?;
        self.add(program.values.len() * size_of::<Value>())?;
        self.pending.extend(program.values.iter().cloned().map(Node::Value));
        for instr in &program.code {
            if let Instruction::NewFunc(t) | Instruction::NewMethod(t) | Instruction::NewArrowFunc(t) = instr {
                self.pending.push(Node::Program(t.program.clone()));
            }
        }
        Ok(())
    }
}

impl Vm {
    /// Approximate bytes held by everything reachable from the stacks,
    /// scopes, frames and the realm's globals. With a limit the walk stops
    /// as soon as the total passes it.
    pub fn estimate_memory_usage(&self, limit: Option<u64>) -> Result<u64, MemoryLimitExceeded> {
        let mut ctx = MemUsageContext::new(limit);
        ctx.add(self.stack.capacity() * size_of::<Value>())?;
        for value in self.stack.live() {
            ctx.add_value(value);
        }
        ctx.add_stash(&self.stash);
        if let Some(program) = &self.program {
            ctx.add_program(program);
        }
        ctx.add_value(&self.result);
        ctx.add_value(&self.new_target);

        ctx.add(self.frames.len() * size_of::<CallFrame>())?;
        for frame in &self.frames {
            ctx.add_stash(&frame.stash);
            if let Some(program) = &frame.program {
                ctx.add_program(program);
            }
            ctx.add_value(&frame.result);
            ctx.add_value(&frame.new_target);
        }

        ctx.add(self.iter_stack.len() * size_of::<IterStackItem>())?;
        for item in &self.iter_stack {
            ctx.add_value(&item.value);
            if let IterSource::Iterator(record) = &item.source {
                let (iterator, next) = record.parts();
                ctx.add_value(iterator);
                ctx.add_value(next);
            }
        }

        ctx.add(self.ref_stack.len() * size_of::<Reference>())?;
        for reference in &self.ref_stack {
            match reference {
                Reference::Stash { stash, .. } => ctx.add_stash(stash),
                Reference::Object { base, .. } => {
                    ctx.add_value(&Value::Object(base.cheap_clone()))
                }
                Reference::Stack { .. } | Reference::Unresolved { .. } => {}
            }
        }

        ctx.add_value(&Value::Object(self.realm.global_object.cheap_clone()));
        ctx.add_stash(&self.realm.global_stash);
        ctx.walk()
    }
}
