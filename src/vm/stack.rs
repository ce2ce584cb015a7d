//! Operand stack and call frames
//!
//! The operand stack is one growable vector shared by every function
//! activation. A frame addresses its slots relative to a stack base `sb`:
//!
//! ```text
//!   sb-1      sb      sb+1 .. sb+args      sb+args+1 ..
//! [ callee ][ this ][ arguments ........ ][ locals ........ ]
//! ```
//!
//! Slots at or above the stack pointer are always `Value::Empty`.

use super::Vm;
use super::scope::StashRef;
use crate::bytecode::Program;
use crate::error::VmError;
use crate::prelude::*;
use crate::value::{JsString, Value};

// ═══════════════════════════════════════════════════════════════════════════════
// Operand stack
// ═══════════════════════════════════════════════════════════════════════════════

/// Growable operand stack with an explicit stack pointer
#[derive(Default)]
pub struct ValueStack {
    values: Vec<Value>,
    sp: usize,
}

fn underflow() -> VmError {
    VmError::internal("operand stack underflow")
}

impl ValueStack {
    pub fn new() -> Self {
        ValueStack::default()
    }

    #[inline]
    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn capacity(&self) -> usize {
        self.values.capacity()
    }

    /// Make slot `idx` addressable, growing the storage if needed.
    ///
    /// Small stacks double; past 1024 slots growth is rounded to the next
    /// 1024 boundary.
    pub fn expand(&mut self, idx: usize) {
        if idx < self.values.len() {
            return;
        }
        let needed = idx + 1;
        if needed > self.values.capacity() {
            let new_cap = if needed < 1024 {
                needed * 2
            } else {
                (needed + 1025) & !1023
            };
            self.values.reserve_exact(new_cap - self.values.len());
        }
        self.values.resize(needed, Value::Empty);
    }

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.expand(self.sp);
        if let Some(slot) = self.values.get_mut(self.sp) {
            *slot = value;
        }
        self.sp += 1;
    }

    /// Pop the top value, leaving its slot empty
    #[inline]
    pub fn pop(&mut self) -> Result<Value, VmError> {
        if self.sp == 0 {
            return Err(underflow());
        }
        self.sp -= 1;
        let slot = self.values.get_mut(self.sp).ok_or_else(underflow)?;
        Ok(std::mem::replace(slot, Value::Empty))
    }

    /// Pop `n` values, returned bottom first
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, VmError> {
        let from = self.sp.checked_sub(n).ok_or_else(underflow)?;
        let taken = self
            .values
            .get_mut(from..self.sp)
            .ok_or_else(underflow)?
            .iter_mut()
            .map(|slot| std::mem::replace(slot, Value::Empty))
            .collect();
        self.sp = from;
        Ok(taken)
    }

    /// Value `depth` slots below the top (0 is the top)
    #[inline]
    pub fn peek(&self, depth: usize) -> Result<&Value, VmError> {
        let idx = self
            .sp
            .checked_sub(depth + 1)
            .ok_or_else(underflow)?;
        self.get(idx)
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Result<&Value, VmError> {
        if idx >= self.sp {
            return Err(VmError::internal(format!(
                "stack slot {} above stack pointer {}",
                idx, self.sp
            )));
        }
        self.values.get(idx).ok_or_else(underflow)
    }

    #[inline]
    pub fn set(&mut self, idx: usize, value: Value) -> Result<(), VmError> {
        if idx >= self.sp {
            return Err(VmError::internal(format!(
                "stack slot {} above stack pointer {}",
                idx, self.sp
            )));
        }
        let slot = self.values.get_mut(idx).ok_or_else(underflow)?;
        *slot = value;
        Ok(())
    }

    /// Overwrite the top value
    #[inline]
    pub fn replace_top(&mut self, value: Value) -> Result<(), VmError> {
        let top = self.sp.checked_sub(1).ok_or_else(underflow)?;
        self.set(top, value)
    }

    pub fn swap(&mut self, a: usize, b: usize) -> Result<(), VmError> {
        if a >= self.sp || b >= self.sp {
            return Err(underflow());
        }
        self.values.swap(a, b);
        Ok(())
    }

    /// Move the stack pointer. Moving down empties the abandoned slots.
    pub fn set_sp(&mut self, sp: usize) {
        if sp < self.sp {
            if let Some(abandoned) = self.values.get_mut(sp..self.sp) {
                abandoned.fill(Value::Empty);
            }
        } else if sp > 0 {
            self.expand(sp - 1);
        }
        self.sp = sp;
    }

    /// Reserve `n` empty slots above the stack pointer
    pub fn reserve_slots(&mut self, n: usize) {
        self.set_sp(self.sp + n);
    }

    /// Insert values at `at`, shifting everything above it up
    pub fn insert_at(&mut self, at: usize, items: &[Value]) -> Result<(), VmError> {
        if at > self.sp {
            return Err(underflow());
        }
        let k = items.len();
        if k == 0 {
            return Ok(());
        }
        let old_sp = self.sp;
        self.set_sp(old_sp + k);
        if let Some(region) = self.values.get_mut(at..old_sp + k) {
            region.rotate_right(k);
            for (slot, item) in region.iter_mut().zip(items) {
                *slot = item.clone();
            }
        }
        Ok(())
    }

    pub fn slice(&self, from: usize, to: usize) -> Result<&[Value], VmError> {
        if from > to || to > self.sp {
            return Err(underflow());
        }
        self.values.get(from..to).ok_or_else(underflow)
    }

    /// Values below the stack pointer
    pub fn live(&self) -> &[Value] {
        self.values.get(..self.sp).unwrap_or(&[])
    }

    /// Drop every value and release the storage
    pub fn clear(&mut self) {
        self.values = Vec::new();
        self.sp = 0;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Call frames
// ═══════════════════════════════════════════════════════════════════════════════

/// Saved execution state of a suspended activation.
///
/// A frame with neither a program nor a function name is a boundary frame:
/// returning into it stops the dispatch loop that was started for the call.
#[derive(Clone)]
pub struct CallFrame {
    pub(crate) program: Option<Rc<Program>>,
    /// Set for native activations
    pub(crate) func_name: Option<JsString>,
    pub(crate) stash: StashRef,
    pub(crate) new_target: Value,
    pub(crate) result: Value,
    pub(crate) constructing: bool,
    pub(crate) pc: usize,
    pub(crate) sb: Option<usize>,
    pub(crate) args: usize,
}

impl CallFrame {
    pub(crate) fn is_boundary(&self) -> bool {
        self.program.is_none() && self.func_name.is_none()
    }
}

impl Vm {
    /// Snapshot of the registers, used by frames and guarded regions
    pub(crate) fn save_state(&self) -> CallFrame {
        CallFrame {
            program: self.program.clone(),
            func_name: self.func_name.clone(),
            stash: self.stash.clone(),
            new_target: self.new_target.clone(),
            result: self.result.clone(),
            constructing: self.constructing,
            pc: self.pc,
            sb: self.sb,
            args: self.args,
        }
    }

    pub(crate) fn restore_state(&mut self, frame: CallFrame) {
        self.program = frame.program;
        self.func_name = frame.func_name;
        self.stash = frame.stash;
        self.new_target = frame.new_target;
        self.result = frame.result;
        self.constructing = frame.constructing;
        self.pc = frame.pc;
        self.sb = frame.sb;
        self.args = frame.args;
    }

    /// Save the current activation. Fails with a RangeError at the frame ceiling.
    pub(crate) fn push_frame(&mut self) -> Result<(), VmError> {
        let max = self.config.max_call_stack_size;
        if max != 0 && self.frames.len() + 1 >= max {
            return Err(VmError::range_error("Maximum call stack size exceeded"));
        }
        let frame = self.save_state();
        self.frames.push(frame);
        Ok(())
    }

    /// Restore the most recently saved activation
    pub(crate) fn pop_frame(&mut self) -> Result<(), VmError> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| VmError::internal("call frame underflow"))?;
        self.restore_state(frame);
        Ok(())
    }

    /// Number of saved frames
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Number of open for-in and for-of loops
    pub fn iter_depth(&self) -> usize {
        self.iter_stack.len()
    }
}
