//! Bytecode virtual machine
//!
//! The VM executes [`Program`]s on an operand stack. Script-to-script calls
//! and constructs stay inside one dispatch loop by saving the caller in an
//! explicit frame array, and try statements push a handler instead of
//! recursing. Only calls made from Rust (natives, conversions, the embedder)
//! start a nested loop. A nested loop ends at a boundary frame.
//!
//! Abrupt completions travel as `Err(VmError)` to the innermost try handler
//! of the running loop, or out of the loop to the nearest guarded region
//! (see `unwind`). Both restore the VM state and close iterators.

mod call;
mod interrupt;
mod iter;
mod memory;
mod ops;
mod props;
pub mod scope;
mod stack;
mod unwind;

pub use call::{CallContext, FunctionCall};
pub use interrupt::{Interrupt, InterruptHandle};
pub use iter::{EnumCursor, IterSource, IterStackItem, IteratorRecord};
pub use memory::{MemUsageContext, MemoryLimitExceeded};
pub use ops::{
    Hint, add_numbers, dec_number, div_numbers, inc_number, less_than_numbers, mod_numbers,
    mul_numbers, neg_number, sub_numbers,
};
pub use scope::{Reference, Stash, StashRef};
pub use stack::{CallFrame, ValueStack};
pub(crate) use unwind::TryHandler;

use crate::bytecode::{Instruction, Program, ScriptCompiler};
use crate::config::VmConfig;
use crate::error::{InterruptReason, UncatchableError, VmError};
use crate::prelude::*;
use crate::realm::Realm;
use crate::value::{CheapClone, JsString, Value, to_int32};
use ops::{Arith, BitOp, Relation};

/// The virtual machine: registers, stacks and the realm it runs in
pub struct Vm {
    pub realm: Realm,
    pub(crate) config: VmConfig,

    // Registers of the running activation
    pub(crate) program: Option<Rc<Program>>,
    /// Name of the running native function (native frames only)
    pub(crate) func_name: Option<JsString>,
    pub(crate) pc: usize,
    /// Stack base: index of `this`; the callee sits just below it
    pub(crate) sb: Option<usize>,
    /// Argument count of the running function
    pub(crate) args: usize,
    pub(crate) stash: StashRef,
    pub(crate) new_target: Value,
    /// Completion value of the running program (`SaveResult`)
    pub(crate) result: Value,
    /// The running function was entered by `new`
    pub(crate) constructing: bool,

    pub(crate) stack: ValueStack,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) iter_stack: Vec<IterStackItem>,
    pub(crate) ref_stack: Vec<Reference>,
    pub(crate) try_stack: Vec<TryHandler>,

    pub(crate) halt: bool,
    /// Nested dispatch loops currently running
    pub(crate) native_depth: usize,
    pub(crate) stash_allocs: u64,
    ticks: u32,

    pub(crate) interrupt: InterruptHandle,
    pub(crate) compiler: Option<Rc<dyn ScriptCompiler>>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let realm = Realm::new();
        let stash = realm.global_stash.clone();
        Vm {
            realm,
            config,
            program: None,
            func_name: None,
            pc: 0,
            sb: None,
            args: 0,
            stash,
            new_target: Value::Undefined,
            result: Value::Undefined,
            constructing: false,
            stack: ValueStack::new(),
            frames: Vec::new(),
            iter_stack: Vec::new(),
            ref_stack: Vec::new(),
            try_stack: Vec::new(),
            halt: false,
            native_depth: 0,
            stash_allocs: 0,
            ticks: 0,
            interrupt: InterruptHandle::new(),
            compiler: None,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut VmConfig {
        &mut self.config
    }

    /// Handle that interrupts this VM from any thread
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn set_compiler(&mut self, compiler: Rc<dyn ScriptCompiler>) {
        self.compiler = Some(compiler);
    }

    /// Scope records created so far
    pub fn stash_allocs(&self) -> u64 {
        self.stash_allocs
    }

    /// Drop every activation and return to the top-level state. The realm
    /// (globals and their bindings) is kept.
    pub fn reset(&mut self) {
        tracing::trace!(frames = self.frames.len(), sp = self.stack.sp(), "vm reset");
        self.program = None;
        self.func_name = None;
        self.pc = 0;
        self.sb = None;
        self.args = 0;
        self.stash = self.realm.global_stash.clone();
        self.new_target = Value::Undefined;
        self.result = Value::Undefined;
        self.constructing = false;
        self.stack.clear();
        self.frames.clear();
        self.iter_stack.clear();
        self.ref_stack.clear();
        self.try_stack.clear();
        self.halt = false;
        self.native_depth = 0;
    }

    /// Run a top-level program in the global scope and return its completion
    /// value. `this` is the global object.
    pub fn run_program(&mut self, program: Rc<Program>) -> Result<Value, VmError> {
        tracing::trace!(name = %program.func_name, code = program.code.len(), "run program");
        let base = self.stack.sp();
        self.guarded(|vm| {
            vm.push_frame()?;
            vm.program = Some(program);
            vm.func_name = None;
            vm.pc = 0;
            vm.args = 0;
            vm.stash = vm.realm.global_stash.clone();
            vm.new_target = Value::Undefined;
            vm.result = Value::Undefined;
            vm.constructing = false;
            vm.sb = Some(vm.stack.sp());
            vm.stack.push(Value::Object(vm.realm.global_object.cheap_clone()));

            vm.run()?;
            let result = std::mem::take(&mut vm.result);
            vm.pop_frame()?;
            vm.stack.set_sp(base);
            Ok(result)
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Dispatch loop
    // ═══════════════════════════════════════════════════════════════════════════

    /// Run a nested dispatch loop until `Halt` or a return into a boundary frame
    pub(crate) fn run(&mut self) -> Result<(), VmError> {
        self.native_depth += 1;
        let tries = self.try_stack.len();
        let result = if self.native_depth > self.config.max_native_depth {
            tracing::debug!(depth = self.native_depth, "native depth exhausted");
            Err(UncatchableError::NativeStackOverflow { stack: Vec::new() }.into())
        } else {
            self.run_loop()
        };
        self.try_stack.truncate(tries);
        self.native_depth -= 1;
        self.halt = false;
        result
    }

    /// Errors go to the try handlers of this loop before leaving it
    fn run_loop(&mut self) -> Result<(), VmError> {
        self.halt = false;
        while !self.halt {
            if let Err(err) = self.step() {
                self.unwind(err)?;
            }
        }
        Ok(())
    }

    fn step(&mut self) -> Result<(), VmError> {
        if self.interrupt.is_set() {
            self.handle_interrupt()?;
        }
        let program = self
            .program
            .clone()
            .ok_or_else(|| VmError::internal("dispatch without a program"))?;
        let instr = program
            .get(self.pc)
            .ok_or_else(|| VmError::internal(format!("pc {} outside the program", self.pc)))?;
        self.exec(instr)?;
        self.tick();
        Ok(())
    }

    #[inline]
    fn tick(&mut self) {
        let interval = self.config.yield_interval;
        if interval == 0 {
            return;
        }
        self.ticks += 1;
        if self.ticks >= interval {
            self.ticks = 0;
            std::thread::yield_now();
        }
    }

    fn handle_interrupt(&mut self) -> Result<(), VmError> {
        let Some(interrupt) = self.interrupt.take() else {
            return Ok(());
        };
        let reason = match interrupt {
            Interrupt::Callback(callback) => match callback() {
                Ok(()) => return Ok(()),
                Err(error) => {
                    tracing::debug!(%error, "interrupt callback failed");
                    return Err(UncatchableError::InterruptCallbackFailed {
                        error,
                        stack: self.capture_stack(),
                    }
                    .into());
                }
            },
            Interrupt::Error(error) => InterruptReason::Error(error),
            Interrupt::Data(data) => InterruptReason::Data(data),
        };
        tracing::debug!(%reason, "interrupted");
        Err(UncatchableError::Interrupted {
            reason,
            stack: self.capture_stack(),
        }
        .into())
    }

    fn jump(&mut self, offset: i32) -> Result<(), VmError> {
        let target = self.pc as i64 + i64::from(offset);
        self.pc = usize::try_from(target)
            .map_err(|_| VmError::internal(format!("jump to {} before program start", target)))?;
        Ok(())
    }

    fn jump_if(&mut self, cond: bool, offset: i32) -> Result<(), VmError> {
        if cond {
            self.jump(offset)
        } else {
            self.pc += 1;
            Ok(())
        }
    }

    fn exec(&mut self, instr: &Instruction) -> Result<(), VmError> {
        match instr {
            // ═══════════════════════════════════════════════════════════════════
            // Constants & Stack Operations
            // ═══════════════════════════════════════════════════════════════════
            Instruction::LoadVal(idx) => {
                let value = self
                    .program
                    .as_ref()
                    .and_then(|p| p.constant(*idx))
                    .cloned()
                    .ok_or_else(|| VmError::internal(format!("constant {} out of range", idx)))?;
                self.push_next(value)
            }
            Instruction::LoadUndef => self.push_next(Value::Undefined),
            Instruction::LoadEmpty => self.push_next(Value::Empty),
            Instruction::LoadGlobalObject => {
                self.push_next(Value::Object(self.realm.global_object.cheap_clone()))
            }
            Instruction::LoadCallee => {
                let sb = self.frame_base()?;
                let callee_slot = sb
                    .checked_sub(1)
                    .ok_or_else(|| VmError::internal("frame without a callee slot"))?;
                let callee = self.stack.get(callee_slot)?.clone();
                self.push_next(callee)
            }
            Instruction::LoadNewTarget => self.push_next(self.new_target.clone()),
            Instruction::SaveResult => {
                self.result = self.stack.pop()?;
                self.pc += 1;
                Ok(())
            }
            Instruction::ClearResult => {
                self.result = Value::Undefined;
                self.pc += 1;
                Ok(())
            }
            Instruction::Pop => {
                self.stack.pop()?;
                self.pc += 1;
                Ok(())
            }
            Instruction::Dup => {
                let top = self.stack.peek(0)?.clone();
                self.push_next(top)
            }
            Instruction::DupN(n) => {
                let value = self.stack.peek(*n as usize)?.clone();
                self.push_next(value)
            }
            Instruction::RDupN(n) => {
                let top = self.stack.peek(0)?.clone();
                let idx = self
                    .stack
                    .sp()
                    .checked_sub(*n as usize + 1)
                    .ok_or_else(|| VmError::internal("stack underflow"))?;
                self.stack.set(idx, top)?;
                self.pc += 1;
                Ok(())
            }
            Instruction::Halt => self.exec_halt(),

            // ═══════════════════════════════════════════════════════════════════
            // Stack Slots
            // ═══════════════════════════════════════════════════════════════════
            Instruction::LoadStack(i) => self.exec_load_stack(*i, false, false),
            Instruction::LoadStack1(i) => self.exec_load_stack(*i, true, false),
            Instruction::LoadStackLex(i) => self.exec_load_stack(*i, false, true),
            Instruction::LoadStack1Lex(i) => self.exec_load_stack(*i, true, true),
            Instruction::StoreStack { index, pop } => self.exec_store_stack(*index, false, false, *pop),
            Instruction::StoreStack1 { index, pop } => self.exec_store_stack(*index, true, false, *pop),
            Instruction::StoreStackLex { index, pop } => {
                self.exec_store_stack(*index, false, true, *pop)
            }
            Instruction::StoreStack1Lex { index, pop } => {
                self.exec_store_stack(*index, true, true, *pop)
            }
            Instruction::InitStack(i) => self.exec_init_stack(*i, false),
            Instruction::InitStack1(i) => self.exec_init_stack(*i, true),

            // ═══════════════════════════════════════════════════════════════════
            // Stash Slots
            // ═══════════════════════════════════════════════════════════════════
            Instruction::LoadStash(at) => self.exec_load_stash(*at, false),
            Instruction::LoadStashLex(at) => self.exec_load_stash(*at, true),
            Instruction::StoreStash { at, pop } => self.exec_store_stash(*at, false, *pop),
            Instruction::StoreStashLex { at, pop } => self.exec_store_stash(*at, true, *pop),
            Instruction::InitStash(at) => self.exec_init_stash(*at),
            Instruction::InitGlobal(name) => self.exec_init_global(name),

            // ═══════════════════════════════════════════════════════════════════
            // Dynamic Name Resolution
            // ═══════════════════════════════════════════════════════════════════
            Instruction::LoadMixed(m) => self.exec_load_mixed(m),
            Instruction::LoadMixedStack(m) => self.exec_load_mixed_stack(m),
            Instruction::ResolveMixed(m) => self.exec_resolve_mixed(m),
            Instruction::ResolveMixedStack(m) => self.exec_resolve_mixed_stack(m),
            Instruction::ResolveVar1 { name, strict } => self.exec_resolve_var(name, *strict),
            Instruction::LoadDynamic(name) => self.exec_load_dynamic(name),
            Instruction::LoadDynamicRef(name) => self.exec_load_dynamic_ref(name),
            Instruction::LoadDynamicCallee(name) => self.exec_load_dynamic_callee(name),
            Instruction::DeleteVar(name) => self.exec_delete_var(name),
            Instruction::DeleteGlobal(name) => self.exec_delete_global(name),
            Instruction::SetGlobal { name, strict } => self.exec_set_global(name, *strict),
            Instruction::GetValue => self.exec_get_value(),
            Instruction::PutValue { pop } => self.exec_put_value(*pop),
            Instruction::InitValueP => self.exec_init_value(),

            // ═══════════════════════════════════════════════════════════════════
            // Arithmetic & Bitwise
            // ═══════════════════════════════════════════════════════════════════
            Instruction::ToNumber | Instruction::Plus => self.exec_unary(Value::clone),
            Instruction::Add => self.exec_add(),
            Instruction::Sub => self.exec_arith(Arith::Sub),
            Instruction::Mul => self.exec_arith(Arith::Mul),
            Instruction::Div => self.exec_arith(Arith::Div),
            Instruction::Mod => self.exec_arith(Arith::Mod),
            Instruction::Neg => self.exec_unary(neg_number),
            Instruction::Inc => self.exec_unary(inc_number),
            Instruction::Dec => self.exec_unary(dec_number),
            Instruction::And => self.exec_bitwise(BitOp::And),
            Instruction::Or => self.exec_bitwise(BitOp::Or),
            Instruction::Xor => self.exec_bitwise(BitOp::Xor),
            Instruction::BNot => self.exec_unary(|v| Value::from(!to_int32(v))),
            Instruction::Sal => self.exec_bitwise(BitOp::Sal),
            Instruction::Sar => self.exec_bitwise(BitOp::Sar),
            Instruction::Shr => self.exec_bitwise(BitOp::Shr),

            // ═══════════════════════════════════════════════════════════════════
            // Comparison & Logic
            // ═══════════════════════════════════════════════════════════════════
            Instruction::Not => {
                let truthy = self.stack.peek(0)?.to_boolean();
                self.stack.replace_top(Value::Bool(!truthy))?;
                self.pc += 1;
                Ok(())
            }
            Instruction::Lt => self.exec_relation(Relation::Lt),
            Instruction::Lte => self.exec_relation(Relation::Lte),
            Instruction::Gt => self.exec_relation(Relation::Gt),
            Instruction::Gte => self.exec_relation(Relation::Gte),
            Instruction::Eq => self.exec_equality(false, false),
            Instruction::Neq => self.exec_equality(false, true),
            Instruction::StrictEq => self.exec_equality(true, false),
            Instruction::StrictNeq => self.exec_equality(true, true),
            Instruction::InstanceOf => self.exec_instance_of(),
            Instruction::In => self.exec_in(),
            Instruction::TypeOf => self.exec_type_of(),
            Instruction::ToPropertyKey => self.exec_to_property_key(),
            Instruction::ToString => self.exec_to_string(),
            Instruction::ConcatStrings(n) => self.exec_concat_strings(*n as usize),

            // ═══════════════════════════════════════════════════════════════════
            // Jumps
            // ═══════════════════════════════════════════════════════════════════
            Instruction::Jump(offset) => self.jump(*offset),
            Instruction::Jne(offset) => {
                let cond = self.stack.pop()?.to_boolean();
                self.jump_if(!cond, *offset)
            }
            Instruction::Jeq(offset) => {
                let cond = self.stack.pop()?.to_boolean();
                self.jump_if(cond, *offset)
            }
            Instruction::Jeq1(offset) => {
                if self.stack.peek(0)?.to_boolean() {
                    self.jump(*offset)
                } else {
                    self.stack.pop()?;
                    self.pc += 1;
                    Ok(())
                }
            }
            Instruction::Jneq1(offset) => {
                if self.stack.peek(0)?.to_boolean() {
                    self.stack.pop()?;
                    self.pc += 1;
                    Ok(())
                } else {
                    self.jump(*offset)
                }
            }
            Instruction::Jdef(offset) => {
                if self.stack.peek(0)?.is_undefined() {
                    self.stack.pop()?;
                    self.pc += 1;
                    Ok(())
                } else {
                    self.jump(*offset)
                }
            }
            Instruction::JdefP(offset) => {
                let defined = !self.stack.pop()?.is_undefined();
                self.jump_if(defined, *offset)
            }

            // ═══════════════════════════════════════════════════════════════════
            // Properties & Literals
            // ═══════════════════════════════════════════════════════════════════
            Instruction::GetProp(name) => self.exec_get_prop(name, false),
            Instruction::GetPropCallee(name) => self.exec_get_prop(name, true),
            Instruction::GetElem => self.exec_get_elem(false, false),
            Instruction::GetKey => self.exec_get_elem(true, false),
            Instruction::GetElemCallee => self.exec_get_elem(false, true),
            Instruction::SetProp { name, strict, pop } => self.exec_set_prop(name, *strict, *pop),
            Instruction::SetElem { strict, pop } => self.exec_set_elem(*strict, *pop),
            Instruction::SetElem1 => self.exec_set_elem1(),
            Instruction::SetProp1(name) => self.exec_set_prop1(name),
            Instruction::SetProto => self.exec_set_proto(),
            Instruction::GetPropRef { name, strict } => self.exec_get_prop_ref(name, *strict),
            Instruction::GetElemRef { strict } => self.exec_get_elem_ref(*strict),
            Instruction::DeleteProp { name, strict } => self.exec_delete_prop(name, *strict),
            Instruction::DeleteElem { strict } => self.exec_delete_elem(*strict),
            Instruction::NewObject => self.push_next(Value::Object(self.realm.new_object())),
            Instruction::NewArray(n) => {
                let array = self.realm.new_array(Vec::with_capacity(*n as usize));
                self.push_next(Value::Object(array))
            }
            Instruction::PushArrayItem => self.exec_push_array_item(),
            Instruction::PushArraySpread => self.exec_push_array_spread(),
            Instruction::PushSpread => self.exec_push_spread(),
            Instruction::NewArrayFromIter => self.exec_new_array_from_iter(),
            Instruction::CopySpread => self.exec_copy_spread(),
            Instruction::CopyRest => self.exec_copy_rest(),
            Instruction::CheckObjectCoercible => self.exec_check_object_coercible(),

            // ═══════════════════════════════════════════════════════════════════
            // Calls
            // ═══════════════════════════════════════════════════════════════════
            Instruction::StartVariadic => {
                let marker = Value::Symbol(self.realm.variadic_marker.cheap_clone());
                self.push_next(marker)
            }
            Instruction::CallVariadic => {
                let n = self.variadic_args(2)?;
                self.exec_call(n)
            }
            Instruction::EndVariadic => self.exec_end_variadic(),
            Instruction::NewVariadic => {
                let n = self.variadic_args(1)?;
                self.exec_new(n)
            }
            Instruction::CallEvalVariadic { strict } => {
                let n = self.variadic_args(2)?;
                self.exec_call_eval(n, *strict)
            }
            Instruction::Call(n) => self.exec_call(*n as usize),
            Instruction::CallEval { args, strict } => self.exec_call_eval(*args as usize, *strict),
            Instruction::New(n) => self.exec_new(*n as usize),
            Instruction::Ret => self.exec_ret(),
            Instruction::BoxThis => self.exec_box_this(),

            // ═══════════════════════════════════════════════════════════════════
            // Functions & Scopes
            // ═══════════════════════════════════════════════════════════════════
            Instruction::NewFunc(template) => self.exec_new_func(template, false),
            Instruction::NewMethod(template) => self.exec_new_func(template, true),
            Instruction::NewArrowFunc(template) => self.exec_new_arrow_func(template),
            Instruction::EnterFunc(e) => self.exec_enter_func(e),
            Instruction::EnterFunc1(e) => self.exec_enter_func1(e),
            Instruction::EnterFuncBody(e) => self.exec_enter_func_body(e),
            Instruction::EnterFuncStashless {
                stack_size,
                num_args,
            } => self.exec_enter_func_stashless(*stack_size, *num_args),
            Instruction::EnterBlock(layout) => self.exec_enter_block(layout),
            Instruction::EnterCatchBlock(layout) => self.exec_enter_catch_block(layout),
            Instruction::LeaveBlock {
                stack_size,
                pop_stash,
            } => self.exec_leave_block(*stack_size, *pop_stash),
            Instruction::CopyStash => self.exec_copy_stash(),
            Instruction::BindVars(b) => self.exec_bind_vars(b),
            Instruction::BindGlobal(b) => self.exec_bind_global(b),
            Instruction::CreateArgsMapped(n) => self.exec_create_args(*n as usize, true),
            Instruction::CreateArgsUnmapped(n) => self.exec_create_args(*n as usize, false),
            Instruction::CreateArgsRestStack(n) => self.exec_create_args_rest_stack(*n as usize),
            Instruction::CreateArgsRestStash => self.exec_create_args_rest_stash(),
            Instruction::EnterWith => self.exec_enter_with(),
            Instruction::LeaveWith => {
                self.leave_stash()?;
                self.pc += 1;
                Ok(())
            }

            // ═══════════════════════════════════════════════════════════════════
            // Iteration
            // ═══════════════════════════════════════════════════════════════════
            Instruction::Enumerate => self.exec_enumerate(),
            Instruction::EnumNext(offset) => self.exec_enum_next(*offset),
            Instruction::EnumGet => self.exec_enum_get(),
            Instruction::EnumPop => {
                self.pop_iter()?;
                self.pc += 1;
                Ok(())
            }
            Instruction::EnumPopClose => self.exec_enum_pop_close(),
            Instruction::Iterate => self.exec_iterate(false),
            Instruction::IterateP => self.exec_iterate(true),
            Instruction::IterNext(offset) => self.exec_iter_next(*offset),
            Instruction::IterGetNextOrUndef => self.exec_iter_get_next_or_undef(),

            // ═══════════════════════════════════════════════════════════════════
            // Exceptions
            // ═══════════════════════════════════════════════════════════════════
            Instruction::Try {
                catch_offset,
                finally_offset,
            } => self.exec_try(*catch_offset, *finally_offset),
            Instruction::RetFinally => {
                self.pc += 1;
                Ok(())
            }
            Instruction::Throw => {
                let value = self.stack.pop()?;
                Err(VmError::throw(value))
            }
            Instruction::ThrowAssignToConst(name) => Err(VmError::type_error(format!(
                "Assignment to constant variable '{}'.",
                name
            ))),
        }
    }

    #[inline]
    fn push_next(&mut self, value: Value) -> Result<(), VmError> {
        self.stack.push(value);
        self.pc += 1;
        Ok(())
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("pc", &self.pc)
            .field("sp", &self.stack.sp())
            .field("frames", &self.frames.len())
            .field("try_handlers", &self.try_stack.len())
            .field("native_depth", &self.native_depth)
            .finish()
    }
}
