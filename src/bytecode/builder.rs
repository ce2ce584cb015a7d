//! ProgramBuilder - helper for assembling bytecode programs
//!
//! Provides constant pooling, source positions and jump patching on top of a
//! plain instruction vector. Jump offsets are computed relative to the jump
//! instruction, so callers only deal in absolute instruction indices.

use super::{Instruction, Program, SourceFile, SourceMapEntry};
use crate::prelude::*;
use crate::value::{JsString, Value};

/// Placeholder for a jump that needs to be patched later
#[derive(Debug, Clone, Copy)]
pub struct JumpPlaceholder {
    /// Index of the jump instruction in the code
    pub instruction_index: usize,
}

/// Placeholder for a `Try` whose section offsets are patched later
#[derive(Debug, Clone, Copy)]
pub struct TryPlaceholder {
    pub instruction_index: usize,
}

/// Builder for [`Program`]s
pub struct ProgramBuilder {
    code: Vec<Instruction>,

    /// Constant pool
    values: Vec<Value>,

    /// String constant deduplication map
    string_map: FxHashMap<JsString, u32>,

    /// Integer constant deduplication map
    int_map: FxHashMap<i64, u32>,

    func_name: JsString,

    source: Option<Rc<SourceFile>>,

    source_map: Vec<SourceMapEntry>,

    /// Source offset attached to newly emitted instructions
    current_offset: Option<u32>,
}

fn relative(from: usize, to: usize) -> i32 {
    (to as i64 - from as i64) as i32
}

impl ProgramBuilder {
    /// Create a builder for a program or function body named `func_name`
    pub fn new(func_name: impl Into<JsString>) -> Self {
        ProgramBuilder {
            code: Vec::new(),
            values: Vec::new(),
            string_map: FxHashMap::default(),
            int_map: FxHashMap::default(),
            func_name: func_name.into(),
            source: None,
            source_map: Vec::new(),
            current_offset: None,
        }
    }

    /// Attach source text for stack-trace positions
    pub fn with_source(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.source = Some(Rc::new(SourceFile::new(name, text)));
        self
    }

    /// Share source text with another program (nested functions)
    pub fn with_source_file(mut self, source: Rc<SourceFile>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the source offset for the instructions emitted next
    pub fn set_position(&mut self, offset: u32) {
        self.current_offset = Some(offset);
    }

    /// Emit an instruction and return its index
    pub fn emit(&mut self, instr: Instruction) -> usize {
        let index = self.code.len();

        if let Some(offset) = self.current_offset {
            let should_add = self.source_map.last().is_none_or(|e| e.offset != offset);
            if should_add {
                self.source_map.push(SourceMapEntry { pc: index, offset });
            }
        }

        self.code.push(instr);
        index
    }

    /// Add a constant to the pool. Strings and exact integers are deduplicated.
    pub fn add_constant(&mut self, value: impl Into<Value>) -> u32 {
        let value = value.into();
        match &value {
            Value::String(s) => {
                if let Some(&idx) = self.string_map.get(s) {
                    return idx;
                }
                let idx = self.push_constant(value.clone());
                self.string_map.insert(s.clone(), idx);
                idx
            }
            Value::Int(i) => {
                if let Some(&idx) = self.int_map.get(i) {
                    return idx;
                }
                let idx = self.push_constant(value.clone());
                self.int_map.insert(*i, idx);
                idx
            }
            _ => self.push_constant(value),
        }
    }

    fn push_constant(&mut self, value: Value) -> u32 {
        let idx = self.values.len() as u32;
        self.values.push(value);
        idx
    }

    /// Emit `LoadVal` for a constant
    pub fn load(&mut self, value: impl Into<Value>) -> usize {
        let idx = self.add_constant(value);
        self.emit(Instruction::LoadVal(idx))
    }

    /// Get the current instruction offset (for jump targets)
    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    /// Emit a forward jump with a placeholder offset
    pub fn emit_jump(&mut self, make: fn(i32) -> Instruction) -> JumpPlaceholder {
        JumpPlaceholder {
            instruction_index: self.emit(make(0)),
        }
    }

    /// Emit a jump to an already known instruction index
    pub fn emit_jump_to(&mut self, make: fn(i32) -> Instruction, target: usize) -> usize {
        let here = self.code.len();
        self.emit(make(relative(here, target)))
    }

    /// Patch a jump placeholder to jump to the current offset
    pub fn patch_jump(&mut self, placeholder: JumpPlaceholder) {
        let target = self.code.len();
        self.patch_jump_to(placeholder, target);
    }

    /// Patch a jump placeholder to jump to a specific target
    pub fn patch_jump_to(&mut self, placeholder: JumpPlaceholder, target: usize) {
        let from = placeholder.instruction_index;
        if let Some(instr) = self.code.get_mut(from) {
            match instr {
                Instruction::Jump(o)
                | Instruction::Jne(o)
                | Instruction::Jeq(o)
                | Instruction::Jeq1(o)
                | Instruction::Jneq1(o)
                | Instruction::Jdef(o)
                | Instruction::JdefP(o)
                | Instruction::EnumNext(o)
                | Instruction::IterNext(o) => *o = relative(from, target),
                _ => {}
            }
        }
    }

    /// Emit a `Try` with no catch or finally section yet
    pub fn emit_try(&mut self) -> TryPlaceholder {
        TryPlaceholder {
            instruction_index: self.emit(Instruction::Try {
                catch_offset: 0,
                finally_offset: 0,
            }),
        }
    }

    /// Mark the current offset as the start of the catch section
    pub fn patch_try_catch(&mut self, placeholder: TryPlaceholder) {
        let from = placeholder.instruction_index;
        let target = self.code.len();
        if let Some(Instruction::Try { catch_offset, .. }) = self.code.get_mut(from) {
            *catch_offset = relative(from, target);
        }
    }

    /// Mark the current offset as the start of the finally section
    pub fn patch_try_finally(&mut self, placeholder: TryPlaceholder) {
        let from = placeholder.instruction_index;
        let target = self.code.len();
        if let Some(Instruction::Try { finally_offset, .. }) = self.code.get_mut(from) {
            *finally_offset = relative(from, target);
        }
    }

    /// Finish building and return the program
    pub fn finish(self) -> Rc<Program> {
        Rc::new(Program {
            code: self.code,
            values: self.values,
            func_name: self.func_name,
            source: self.source,
            source_map: self.source_map,
        })
    }
}
