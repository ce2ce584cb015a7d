//! Stack-based bytecode VM for a dynamic scripting language, built for embedding
//!
//! Programs come from an external compiler, or are assembled with
//! [`ProgramBuilder`]. A [`Runtime`] runs them, calls script functions from
//! Rust and can be interrupted from another thread.
//!
//! # Example
//!
//! ```
//! use stashvm::bytecode::{Instruction, ProgramBuilder};
//! use stashvm::{Runtime, Value};
//!
//! let mut b = ProgramBuilder::new("main");
//! b.load(1);
//! b.load(2);
//! b.load(3);
//! b.emit(Instruction::Mul);
//! b.emit(Instruction::Add);
//! b.emit(Instruction::SaveResult);
//! b.emit(Instruction::Halt);
//!
//! let mut runtime = Runtime::new();
//! let result = runtime.run_program(b.finish()).unwrap();
//! assert_eq!(result, Value::from(7));
//! ```

pub mod bytecode;
pub mod config;
pub mod error;
pub mod object;
pub mod prelude;
pub mod realm;
pub mod value;
pub mod vm;

pub use bytecode::{Program, ProgramBuilder, ScriptCompiler};
pub use config::VmConfig;
pub use error::{
    ErrorKind, Exception, ExceptionKind, HostError, RunError, StackFrame, UncatchableError,
    VmError,
};
pub use object::{ObjectRef, PropertyKey};
pub use realm::WellKnownSymbols;
pub use value::{CheapClone, JsString, JsSymbol, Value};
pub use vm::{CallContext, FunctionCall, Interrupt, InterruptHandle, MemoryLimitExceeded, Vm};

use crate::prelude::*;

/// The embedding entry point: one VM with its realm
pub struct Runtime {
    vm: Vm,
}

impl Runtime {
    /// Create a new runtime with the default configuration
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self { vm: Vm::new(config) }
    }

    /// Run a top-level program and return its completion value (the last
    /// `SaveResult`).
    ///
    /// An uncatchable condition (interrupt, native depth overflow, malformed
    /// bytecode) discards every activation; the runtime stays usable and
    /// keeps its globals.
    pub fn run_program(&mut self, program: Rc<Program>) -> Result<Value, RunError> {
        let result = self.vm.run_program(program);
        result.map_err(|err| self.boundary_error(err))
    }

    /// Call a script or native function from Rust
    ///
    /// ```
    /// use stashvm::{Runtime, Value};
    ///
    /// let mut runtime = Runtime::new();
    /// let twice = runtime.new_native_function("twice", 1, |vm, call| {
    ///     let n = vm.to_number(&call.argument(0))?;
    ///     Ok(stashvm::vm::mul_numbers(&n, &Value::from(2)))
    /// });
    /// let result = runtime
    ///     .call_function(&twice, Value::Undefined, &[Value::from(21)])
    ///     .unwrap();
    /// assert_eq!(result, Value::from(42));
    /// ```
    pub fn call_function(&mut self, func: &Value, this: Value, args: &[Value]) -> Result<Value, RunError> {
        let result = self.vm.call_value(func, this, args);
        result.map_err(|err| self.boundary_error(err))
    }

    /// Turn an error that escaped to the embedder into a [`RunError`]
    fn boundary_error(&mut self, err: VmError) -> RunError {
        match err {
            VmError::Thrown(ex) => RunError::Exception(ex),
            VmError::Uncatchable(u) => {
                tracing::debug!(error = %u, "uncatchable condition reached the embedder");
                self.vm.reset();
                RunError::Uncatchable(u)
            }
            other => {
                let stack = self.vm.stack_trace();
                let mut ex = Exception::new(self.vm.error_to_value(other));
                ex.set_stack(stack);
                RunError::Exception(Box::new(ex))
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Interrupts
    // ═══════════════════════════════════════════════════════════════════════════

    /// Request an interrupt; it is delivered at the next instruction boundary
    pub fn interrupt(&self, reason: Interrupt) {
        self.vm.interrupt_handle().interrupt(reason);
    }

    /// Drop a pending interrupt before it is delivered
    pub fn clear_interrupt(&self) {
        self.vm.interrupt_handle().clear();
    }

    /// Handle for interrupting this runtime from another thread
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.vm.interrupt_handle()
    }

    /// Approximate bytes reachable from the runtime. With a limit the walk
    /// fails as soon as it is exceeded.
    pub fn estimate_memory_usage(&self, limit: Option<u64>) -> Result<u64, MemoryLimitExceeded> {
        self.vm.estimate_memory_usage(limit)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Globals and value creation
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn global_object(&self) -> ObjectRef {
        self.vm.realm.global_object.cheap_clone()
    }

    /// Define or overwrite a property of the global object
    pub fn set_global(&mut self, name: &str, value: impl Into<Value>) {
        self.vm.realm.global_object.put(name, value);
    }

    /// Value of a global name: a top-level `let`/`const` binding first, then
    /// a property of the global object. `None` when neither exists or the
    /// binding is still uninitialised.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let key = JsString::from(name);
        let lexical = self
            .vm
            .realm
            .global_stash
            .borrow()
            .get_by_name(&key, &self.vm.realm.symbols.unscopables);
        match lexical {
            Ok(Some(value)) => Some(value),
            Ok(None) => self.vm.realm.global_object.get(&PropertyKey::from(key)),
            Err(_) => None,
        }
    }

    pub fn new_object(&self) -> Value {
        Value::Object(self.vm.realm.new_object())
    }

    pub fn new_array(&self, elements: Vec<Value>) -> Value {
        Value::Object(self.vm.realm.new_array(elements))
    }

    pub fn new_native_function<F>(&self, name: &str, length: u32, f: F) -> Value
    where
        F: Fn(&mut Vm, FunctionCall) -> Result<Value, VmError> + 'static,
    {
        Value::Object(self.vm.realm.new_native_function(name, length, f))
    }

    pub fn well_known_symbols(&self) -> &WellKnownSymbols {
        &self.vm.realm.symbols
    }

    /// Install the compiler `eval` uses. Without one, `eval` of a string
    /// raises a TypeError.
    pub fn set_compiler(&mut self, compiler: Rc<dyn ScriptCompiler>) {
        self.vm.set_compiler(compiler);
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Set the frame ceiling checked whenever a frame is pushed
    ///
    /// Default is `i32::MAX`. Set to 0 to disable.
    ///
    /// # Example
    ///
    /// ```
    /// use stashvm::Runtime;
    ///
    /// let mut runtime = Runtime::new();
    /// runtime.set_max_call_stack_size(1000);
    /// assert_eq!(runtime.config().max_call_stack_size, 1000);
    /// ```
    pub fn set_max_call_stack_size(&mut self, size: usize) {
        self.vm.config_mut().max_call_stack_size = size;
    }

    /// Set the frame ceiling checked by call instructions. 0 disables it.
    pub fn set_stack_depth_limit(&mut self, limit: usize) {
        self.vm.config_mut().stack_depth_limit = limit;
    }

    /// Set how many frames an exception captures
    pub fn set_stack_trace_limit(&mut self, limit: usize) {
        self.vm.config_mut().stack_trace_limit = limit;
    }

    /// Set how many dispatch loops may nest before the run aborts
    pub fn set_max_native_depth(&mut self, depth: usize) {
        self.vm.config_mut().max_native_depth = depth;
    }

    pub fn config(&self) -> &VmConfig {
        self.vm.config()
    }
}
