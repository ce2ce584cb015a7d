//! Guarded regions, try/catch/finally and stack traces
//!
//! A guarded region snapshots the VM (frames, registers, stack pointer,
//! iterator and reference stacks) before running. When an error escapes, the
//! snapshot is restored and the iterators the region opened are closed, so
//! the code that observes the error sees the VM as it was at region entry.
//!
//! Try statements take the same snapshot into a [`TryHandler`] and run in
//! the dispatch loop that executed `Try`. An error raised in that loop pops
//! handlers until one can take it; a handler never sees errors from the
//! loops nested inside or around its own.

use super::{CallFrame, IterSource, Vm};
use crate::bytecode::{Instruction, Program};
use crate::error::{ErrorKind, Exception, StackFrame, VmError};
use crate::prelude::*;
use crate::value::{JsString, Value};

/// Instruction index `offset` away from `origin`
fn offset_pc(origin: usize, offset: i32) -> Result<usize, VmError> {
    let target = origin as i64 + i64::from(offset);
    usize::try_from(target)
        .map_err(|_| VmError::internal(format!("try section at {} before program start", target)))
}

fn frame_info(program: Option<&Rc<Program>>, func_name: Option<&JsString>, pc: usize) -> Option<StackFrame> {
    match (program, func_name) {
        (Some(program), _) => {
            let (line, column) = program.source_position(pc).unwrap_or((0, 0));
            Some(StackFrame {
                function_name: (!program.func_name.is_empty()).then(|| program.func_name.to_string()),
                file: program.source_name().map(str::to_string),
                line,
                column,
                native: false,
            })
        }
        (None, Some(name)) => Some(StackFrame {
            function_name: Some(name.to_string()),
            file: None,
            line: 0,
            column: 0,
            native: true,
        }),
        (None, None) => None,
    }
}

/// Part of a try statement a handler is running
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Section {
    Body,
    Catch,
    Finally,
}

/// An active try statement
pub(crate) struct TryHandler {
    catch_pc: Option<usize>,
    finally_pc: Option<usize>,
    section: Section,
    /// Where execution continues after a normal finally completion
    resume: usize,
    /// Error the finally section re-raises on normal completion
    pending: Option<VmError>,
    /// Dispatch loop that owns the handler
    loop_depth: usize,
    frames: usize,
    state: CallFrame,
    sp: usize,
    iters: usize,
    refs: usize,
}

impl Vm {
    /// Run `f` and, if it fails, put the VM back into the state it had
    /// before. Catchable errors come out as `VmError::Thrown` with a stack.
    pub(crate) fn guarded<T, F>(&mut self, f: F) -> Result<T, VmError>
    where
        F: FnOnce(&mut Vm) -> Result<T, VmError>,
    {
        let frames = self.frames.len();
        let state = self.save_state();
        let sp = self.stack.sp();
        let iters = self.iter_stack.len();
        let refs = self.ref_stack.len();

        let err = match f(self) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let err = self.materialize_error(err);

        self.frames.truncate(frames);
        self.restore_state(state);
        self.stack.set_sp(sp);
        let err = self.close_iterators(iters, err);
        self.ref_stack.truncate(refs);
        Err(err)
    }

    /// Turn a catchable error into a thrown script value and give it the
    /// stack of the point where it was raised
    fn materialize_error(&mut self, err: VmError) -> VmError {
        match err {
            VmError::Thrown(mut ex) => {
                if ex.stack().is_empty() {
                    ex.set_stack(self.capture_stack());
                }
                VmError::Thrown(ex)
            }
            VmError::Uncatchable(mut u) => {
                if u.stack().is_empty() {
                    *u.stack_mut() = self.capture_stack();
                }
                VmError::Uncatchable(u)
            }
            other => {
                let mut ex = Exception::new(self.error_to_value(other));
                ex.set_stack(self.capture_stack());
                VmError::Thrown(Box::new(ex))
            }
        }
    }

    /// The error object scripts see for a VM-raised error
    pub fn error_to_value(&self, err: VmError) -> Value {
        let obj = match err {
            VmError::Unresolved { name } => self
                .realm
                .new_error(ErrorKind::Reference, format!("{} is not defined", name)),
            VmError::Uninitialized { name } => {
                let binding = match name {
                    Some(name) => format!("'{}'", name),
                    None => "binding".to_string(),
                };
                self.realm.new_error(
                    ErrorKind::Uninitialized,
                    format!("Cannot access {} before initialization", binding),
                )
            }
            VmError::Type(message) => self.realm.new_error(ErrorKind::Type, message),
            VmError::Range(message) => self.realm.new_error(ErrorKind::Range, message),
            VmError::Syntax(message) => self.realm.new_error(ErrorKind::Syntax, message),
            VmError::Host(error) => self.realm.new_host_error(error),
            VmError::Thrown(ex) => return ex.into_value(),
            VmError::Uncatchable(u) => self.realm.new_error(ErrorKind::Error, u.to_string()),
        };
        Value::Object(obj)
    }

    /// Close, innermost first, the iterators opened above `from`. Close
    /// failures are logged and dropped unless one is uncatchable while the
    /// original error is not.
    fn close_iterators(&mut self, from: usize, mut err: VmError) -> VmError {
        if from >= self.iter_stack.len() {
            return err;
        }
        let opened = self.iter_stack.split_off(from);
        for item in opened.into_iter().rev() {
            let IterSource::Iterator(mut record) = item.source else {
                continue;
            };
            if let Err(close_err) = self.guarded(|vm| record.close(vm)) {
                tracing::warn!(error = %close_err, "iterator close failed during unwind");
                if close_err.is_uncatchable() && !err.is_uncatchable() {
                    err = close_err;
                }
            }
        }
        err
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Try handlers
    // ═══════════════════════════════════════════════════════════════════════════

    /// `Try`: push a handler for the statement and start its body. Each
    /// section ends with `Halt`; a finally section that completes normally
    /// ends with `Halt, RetFinally`.
    pub(crate) fn exec_try(&mut self, catch_offset: i32, finally_offset: i32) -> Result<(), VmError> {
        let origin = self.pc;
        let catch_pc = (catch_offset > 0)
            .then(|| offset_pc(origin, catch_offset))
            .transpose()?;
        let finally_pc = (finally_offset > 0)
            .then(|| offset_pc(origin, finally_offset))
            .transpose()?;
        self.pc += 1;
        let handler = TryHandler {
            catch_pc,
            finally_pc,
            section: Section::Body,
            resume: self.pc,
            pending: None,
            loop_depth: self.native_depth,
            frames: self.frames.len(),
            state: self.save_state(),
            sp: self.stack.sp(),
            iters: self.iter_stack.len(),
            refs: self.ref_stack.len(),
        };
        self.try_stack.push(handler);
        Ok(())
    }

    /// Innermost handler, if the running activation owns it
    fn current_handler(&mut self) -> Option<&mut TryHandler> {
        let (depth, frames) = (self.native_depth, self.frames.len());
        self.try_stack
            .last_mut()
            .filter(|h| h.loop_depth == depth && h.frames == frames)
    }

    /// `Halt` ends the running try section, or the loop when no section runs
    pub(crate) fn exec_halt(&mut self) -> Result<(), VmError> {
        self.pc += 1;
        let pc = self.pc;
        let Some(handler) = self.current_handler() else {
            self.halt = true;
            return Ok(());
        };
        match (handler.section, handler.finally_pc) {
            (Section::Finally, _) => self.end_finally(),
            (_, Some(finally_pc)) => {
                handler.section = Section::Finally;
                handler.resume = pc;
                self.pc = finally_pc;
                Ok(())
            }
            (_, None) => {
                self.try_stack.pop();
                Ok(())
            }
        }
    }

    /// Leave a finally section. Falling through to `RetFinally` resumes where
    /// the try or catch section stopped and re-raises the pending error; any
    /// other exit discards it.
    fn end_finally(&mut self) -> Result<(), VmError> {
        let Some(handler) = self.try_stack.pop() else {
            return Ok(());
        };
        let completed = matches!(
            self.program.as_ref().and_then(|p| p.get(self.pc)),
            Some(Instruction::RetFinally)
        );
        if completed {
            self.pc = handler.resume;
            if let Some(err) = handler.pending {
                return Err(err);
            }
        } else if let Some(discarded) = handler.pending {
            tracing::debug!(error = %discarded, "pending error discarded by finally");
        }
        Ok(())
    }

    /// Hand an error raised in the running loop to its innermost try
    /// handler. The error comes back when no handler of this loop is left.
    pub(crate) fn unwind(&mut self, err: VmError) -> Result<(), VmError> {
        let mut err = self.materialize_error(err);
        loop {
            let depth = self.native_depth;
            let Some(handler) = self.try_stack.last().filter(|h| h.loop_depth == depth) else {
                return Err(err);
            };
            let (frames, state, sp, iters, refs) =
                (handler.frames, handler.state.clone(), handler.sp, handler.iters, handler.refs);
            self.frames.truncate(frames);
            self.restore_state(state);
            self.stack.set_sp(sp);
            err = self.close_iterators(iters, err);
            self.ref_stack.truncate(refs);

            let Some(handler) = self.try_stack.last_mut() else {
                return Err(err);
            };
            match (handler.section, handler.catch_pc, handler.finally_pc, err) {
                (Section::Body, Some(catch_pc), _, VmError::Thrown(ex)) => {
                    tracing::trace!(pc = catch_pc, "entering catch section");
                    handler.section = Section::Catch;
                    self.pc = catch_pc;
                    self.stack.push(ex.into_value());
                    return Ok(());
                }
                (Section::Body | Section::Catch, _, Some(finally_pc), pending) => {
                    handler.section = Section::Finally;
                    handler.pending = Some(pending);
                    self.pc = finally_pc;
                    return Ok(());
                }
                (_, _, _, escaped) => {
                    self.try_stack.pop();
                    err = escaped;
                }
            }
        }
    }

    /// Forget the handlers of activations at or above frame depth `frames`
    /// in the running loop
    pub(crate) fn drop_try_handlers(&mut self, frames: usize) {
        let depth = self.native_depth;
        while self
            .try_stack
            .last()
            .is_some_and(|h| h.loop_depth == depth && h.frames >= frames)
        {
            self.try_stack.pop();
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Stack traces
    // ═══════════════════════════════════════════════════════════════════════════

    /// Frames from the innermost outwards, up to the configured limit.
    /// Boundary frames are skipped.
    pub(crate) fn capture_stack(&self) -> Vec<StackFrame> {
        let limit = self.config.stack_trace_limit;
        let current = frame_info(self.program.as_ref(), self.func_name.as_ref(), self.pc);
        // Saved frames hold the return address
        let saved = self.frames.iter().rev().filter_map(|frame| {
            frame_info(
                frame.program.as_ref(),
                frame.func_name.as_ref(),
                frame.pc.saturating_sub(1),
            )
        });
        current.into_iter().chain(saved).take(limit).collect()
    }

    /// Stack trace of the current position, for natives building their own errors
    pub fn stack_trace(&self) -> Vec<StackFrame> {
        self.capture_stack()
    }

    /// Value of `err` as a script would catch it
    pub fn exception_value(&self, err: VmError) -> Option<Value> {
        (!err.is_uncatchable()).then(|| self.error_to_value(err))
    }
}
