//! Call and construct protocol
//!
//! Script-to-script calls and constructs from bytecode never recurse on the
//! Rust stack: the caller's registers go into a frame and the callee starts
//! in the same dispatch loop. Every other call (natives, proxies, calls made
//! from Rust) runs behind a boundary or native frame.
//!
//! A call instruction with `n` arguments consumes `this callee arg0 ..
//! arg(n-1)`. Entering a script function swaps the first two slots so the
//! callee's frame sees:
//!
//! ```text
//!   ... callee this arg0 .. arg(n-1)
//!              ^ sb of the callee
//! ```
//!
//! `Ret` writes the result over the callee slot. `New` on a script function
//! inserts the fresh `this` below the callee and enters it the same way.

use super::{CallFrame, InterruptHandle, Vm};
use crate::bytecode::{CompileOptions, FuncTemplate};
use crate::error::{Exception, VmError};
use crate::object::{
    ArgumentsObject, BoundFunction, FunctionKind, JsObject, NativeFunction, ObjectKind, ObjectRef,
    Property, PropertyKey, ProxyObject, ScriptFunction,
};
use crate::prelude::*;
use crate::value::{CheapClone, JsString, Value};

// ═══════════════════════════════════════════════════════════════════════════════
// Native call arguments
// ═══════════════════════════════════════════════════════════════════════════════

/// Arguments of a native function invocation
pub struct FunctionCall {
    pub this: Value,
    pub arguments: Vec<Value>,
    /// The constructor `new` was applied to; `None` for plain calls
    pub new_target: Option<Value>,
    pub context: CallContext,
}

impl FunctionCall {
    /// Argument `index`, undefined when not passed
    pub fn argument(&self, index: usize) -> Value {
        self.arguments.get(index).cloned().unwrap_or_default()
    }

    pub fn is_construct(&self) -> bool {
        self.new_target.is_some()
    }
}

/// What a native function can see of the VM besides `&mut Vm`
#[derive(Clone, Debug)]
pub struct CallContext {
    interrupt: InterruptHandle,
    function_name: JsString,
}

impl CallContext {
    /// Long-running natives poll this and bail out early
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_set()
    }

    pub fn interrupt_handle(&self) -> &InterruptHandle {
        &self.interrupt
    }

    pub fn function_name(&self) -> &JsString {
        &self.function_name
    }
}

/// Callable kinds, cloned out of the object so no borrow is held during the call
enum Callee {
    Script(ScriptFunction),
    Native(NativeFunction),
    Bound(BoundFunction),
    Proxy(ProxyObject),
}

fn not_a_function(value: &Value) -> VmError {
    VmError::type_error(format!("Not a function: {}", value))
}

fn not_a_constructor(value: &Value) -> VmError {
    VmError::type_error(format!("{} is not a constructor", value))
}

fn callee_of(value: &Value) -> Result<(ObjectRef, Callee), VmError> {
    let obj = match value {
        Value::Object(obj) => obj,
        Value::Unresolved { name, member: false } => {
            return Err(VmError::reference_error(name.cheap_clone()));
        }
        Value::Unresolved { name, member: true } => {
            return Err(VmError::type_error(format!("'{}' is not a function", name)));
        }
        other => return Err(not_a_function(other)),
    };
    obj.materialize();
    let callee = match &obj.borrow().kind {
        ObjectKind::Function(f) => Callee::Script(f.clone()),
        ObjectKind::Native(f) => Callee::Native(f.clone()),
        ObjectKind::Bound(b) => Callee::Bound(b.clone()),
        ObjectKind::Proxy(p) => Callee::Proxy(p.clone()),
        _ => return Err(not_a_function(value)),
    };
    Ok((obj.cheap_clone(), callee))
}

impl Vm {
    fn call_context(&self, function_name: &JsString) -> CallContext {
        CallContext {
            interrupt: self.interrupt.clone(),
            function_name: function_name.cheap_clone(),
        }
    }

    /// Receiver slot of a call with `n` arguments; the callee sits above it
    fn call_base(&self, n: usize) -> Result<usize, VmError> {
        self.stack
            .sp()
            .checked_sub(n + 2)
            .ok_or_else(|| VmError::internal("call operands missing"))
    }

    fn check_depth_limit(&self) -> Result<(), VmError> {
        let limit = self.config.stack_depth_limit;
        if limit != 0 && self.frames.len() + 1 >= limit {
            return Err(VmError::range_error("Maximum call stack size exceeded"));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Call instructions
    // ═══════════════════════════════════════════════════════════════════════════

    /// Arguments above the variadic marker, minus `fixed` non-argument slots
    pub(crate) fn variadic_args(&self, fixed: usize) -> Result<usize, VmError> {
        let marker = &self.realm.variadic_marker;
        let count = self
            .stack
            .live()
            .iter()
            .rev()
            .position(|v| matches!(v, Value::Symbol(s) if s == marker))
            .ok_or_else(|| VmError::internal("variadic call without a marker"))?;
        count
            .checked_sub(fixed)
            .ok_or_else(|| VmError::internal("variadic call operands missing"))
    }

    /// `[marker, result]` → `[result]`
    pub(crate) fn exec_end_variadic(&mut self) -> Result<(), VmError> {
        let result = self.stack.pop()?;
        self.stack.replace_top(result)?;
        self.pc += 1;
        Ok(())
    }

    /// `[this, callee, args...]` → `[result]`
    pub(crate) fn exec_call(&mut self, mut n: usize) -> Result<(), VmError> {
        loop {
            self.check_depth_limit()?;
            let base = self.call_base(n)?;
            let callee_value = self.stack.get(base + 1)?.clone();
            let (_, callee) = callee_of(&callee_value)?;
            match callee {
                Callee::Script(f) => return self.enter_script(f, base, n, None),
                Callee::Native(f) => {
                    let this = self.stack.get(base)?.clone();
                    let args = self.stack.slice(base + 2, self.stack.sp())?.to_vec();
                    let result = self.call_native_in_loop(&f.name, |vm, context| {
                        (f.call)(
                            vm,
                            FunctionCall {
                                this,
                                arguments: args,
                                new_target: None,
                                context,
                            },
                        )
                    })?;
                    return self.finish_native_call(base, result);
                }
                Callee::Proxy(p) => {
                    let this = self.stack.get(base)?.clone();
                    let args = self.stack.slice(base + 2, self.stack.sp())?.to_vec();
                    let result = self.call_native_in_loop(&JsString::from("proxy"), |vm, _| {
                        p.handler.apply(vm, &p.target, this, args)
                    })?;
                    return self.finish_native_call(base, result);
                }
                Callee::Bound(b) => {
                    tracing::trace!(args = n, bound = b.args.len(), "unwrapping bound function");
                    self.stack.set(base, b.this)?;
                    self.stack.set(base + 1, Value::Object(b.target))?;
                    self.stack.insert_at(base + 2, &b.args)?;
                    n += b.args.len();
                }
            }
        }
    }

    /// Enter a script function. The callee moves below `this`, which becomes
    /// the stack base; arrows get their captured `this` instead. A
    /// `new_target` marks a construct call.
    fn enter_script(
        &mut self,
        f: ScriptFunction,
        base: usize,
        n: usize,
        new_target: Option<Value>,
    ) -> Result<(), VmError> {
        self.pc += 1;
        if let Err(e) = self.push_frame() {
            self.pc -= 1;
            return Err(e);
        }
        let sb = base + 1;
        self.new_target = match &f.kind {
            FunctionKind::Arrow { this, new_target } => {
                let callee = self.stack.get(sb)?.clone();
                self.stack.set(base, callee)?;
                self.stack.set(sb, this.clone())?;
                new_target.clone()
            }
            FunctionKind::Normal | FunctionKind::Method => {
                self.stack.swap(base, sb)?;
                new_target.clone().unwrap_or_default()
            }
        };
        self.constructing = new_target.is_some();
        self.args = n;
        self.program = Some(f.template.program.clone());
        self.func_name = None;
        self.stash = f.stash;
        self.sb = Some(sb);
        self.pc = 0;
        Ok(())
    }

    /// Run a native body inside a native frame. On failure the frame stays
    /// for the enclosing guard to unwind, so the trace includes it.
    fn call_native_in_loop<F>(&mut self, name: &JsString, body: F) -> Result<Value, VmError>
    where
        F: FnOnce(&mut Vm, CallContext) -> Result<Value, VmError>,
    {
        self.pc += 1;
        self.push_frame()?;
        self.program = None;
        self.func_name = Some(name.cheap_clone());
        let context = self.call_context(name);
        let result = body(self, context)?;
        self.pop_frame()?;
        Ok(result)
    }

    fn finish_native_call(&mut self, base: usize, result: Value) -> Result<(), VmError> {
        self.stack.set(base, result)?;
        self.stack.set_sp(base + 1);
        Ok(())
    }

    /// Return to the caller with the top of the stack as the result. A
    /// constructor that returns a non-object yields its `this`.
    pub(crate) fn exec_ret(&mut self) -> Result<(), VmError> {
        let mut value = self.stack.pop()?;
        let sb = self.frame_base()?;
        let callee_slot = sb
            .checked_sub(1)
            .ok_or_else(|| VmError::internal("return from a frame without a callee slot"))?;
        if self.constructing && !matches!(value, Value::Object(_)) {
            value = self.stack.get(sb)?.clone();
        }
        self.stack.set_sp(sb);
        self.stack.set(callee_slot, value)?;
        self.drop_try_handlers(self.frames.len());
        let boundary = self.frames.last().is_some_and(CallFrame::is_boundary);
        self.pop_frame()?;
        if boundary {
            self.halt = true;
        }
        Ok(())
    }

    /// The object `new` passes as `this`, inheriting from `new_target.prototype`
    fn construct_this(&self, new_target: &Value) -> Value {
        let proto = match new_target
            .as_object()
            .and_then(|nt| nt.get(&PropertyKey::from("prototype")))
        {
            Some(Value::Object(proto)) => proto,
            _ => self.realm.object_prototype.cheap_clone(),
        };
        Value::Object(ObjectRef::new(JsObject::ordinary(Some(proto))))
    }

    /// `[callee, args...]` → `[object]`
    pub(crate) fn exec_new(&mut self, n: usize) -> Result<(), VmError> {
        self.check_depth_limit()?;
        let base = self
            .stack
            .sp()
            .checked_sub(n + 1)
            .ok_or_else(|| VmError::internal("construct operands missing"))?;
        let callee = self.stack.get(base)?.clone();
        if let Ok((_, Callee::Script(f))) = callee_of(&callee) {
            if matches!(f.kind, FunctionKind::Normal) {
                let this = self.construct_this(&callee);
                self.stack.insert_at(base, &[this])?;
                return self.enter_script(f, base, n, Some(callee));
            }
        }
        let args = self.stack.pop_n(n)?;
        let result = self.construct(&callee, args, None)?;
        self.stack.replace_top(result)?;
        self.pc += 1;
        Ok(())
    }

    /// A call that may be a direct `eval`
    pub(crate) fn exec_call_eval(&mut self, n: usize, strict: bool) -> Result<(), VmError> {
        let base = self.call_base(n)?;
        let is_eval = match self.stack.get(base + 1)? {
            Value::Object(obj) => obj.ptr_eq(&self.realm.eval),
            Value::Unresolved { name, member: false } => {
                return Err(VmError::reference_error(name.cheap_clone()));
            }
            _ => return Err(VmError::type_error("'eval' is not a function")),
        };
        if !is_eval {
            return self.exec_call(n);
        }
        let result = if n == 0 {
            Value::Undefined
        } else {
            match self.stack.get(base + 2)?.clone() {
                Value::String(source) => {
                    let this = match self.sb {
                        Some(sb) => self.stack.get(sb)?.clone(),
                        None => Value::Object(self.realm.global_object.cheap_clone()),
                    };
                    self.eval_source(&source, true, strict, this)?
                }
                other => other,
            }
        };
        self.finish_native_call(base, result)?;
        self.pc += 1;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Function objects
    // ═══════════════════════════════════════════════════════════════════════════

    pub(crate) fn exec_new_func(&mut self, template: &Rc<FuncTemplate>, method: bool) -> Result<(), VmError> {
        let kind = if method {
            FunctionKind::Method
        } else {
            FunctionKind::Normal
        };
        let f = self
            .realm
            .new_script_function(template.clone(), self.stash.clone(), kind);
        self.stack.push(Value::Object(f));
        self.pc += 1;
        Ok(())
    }

    /// Arrow functions capture `this` and new-target of the defining frame
    pub(crate) fn exec_new_arrow_func(&mut self, template: &Rc<FuncTemplate>) -> Result<(), VmError> {
        let this = match self.sb {
            Some(sb) => self.stack.get(sb)?.clone(),
            None => Value::Object(self.realm.global_object.cheap_clone()),
        };
        let kind = FunctionKind::Arrow {
            this,
            new_target: self.new_target.clone(),
        };
        let f = self
            .realm
            .new_script_function(template.clone(), self.stash.clone(), kind);
        self.stack.push(Value::Object(f));
        self.pc += 1;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Arguments objects
    // ═══════════════════════════════════════════════════════════════════════════

    /// `arguments` for a function whose first `n` parameters live in the stash.
    /// A mapped object aliases those slots; an unmapped one copies them.
    pub(crate) fn exec_create_args(&mut self, n: usize, mapped: bool) -> Result<(), VmError> {
        let count = n.min(self.args);
        let (copied, extra) = {
            let s = self.stash.borrow();
            let copied: Vec<Value> = if mapped {
                Vec::new()
            } else {
                s.values
                    .iter()
                    .take(count)
                    .cloned()
                    .map(Value::or_undefined)
                    .collect()
            };
            (copied, s.extra_args.clone())
        };
        let kind = ObjectKind::Arguments(ArgumentsObject {
            stash: self.stash.clone(),
            mapped: if mapped { vec![true; count] } else { Vec::new() },
        });
        let args = ObjectRef::new(JsObject::with_kind(
            Some(self.realm.object_prototype.cheap_clone()),
            kind,
        ));
        let first = if mapped { count } else { 0 };
        for (i, value) in copied.into_iter().chain(extra).enumerate() {
            args.put(first + i, value);
        }
        args.define_own_property(
            PropertyKey::from("length"),
            Property::hidden(Value::from(self.args as i64)),
            false,
        )?;
        if mapped {
            let sb = self.frame_base()?;
            let callee_slot = sb
                .checked_sub(1)
                .ok_or_else(|| VmError::internal("frame without a callee slot"))?;
            let callee = self.stack.get(callee_slot)?.clone();
            args.define_own_property(PropertyKey::from("callee"), Property::hidden(callee), false)?;
        }
        args.define_own_property(
            PropertyKey::from(self.realm.symbols.iterator.cheap_clone()),
            Property::hidden(Value::Object(self.realm.array_values.cheap_clone())),
            false,
        )?;
        self.stack.push(Value::Object(args));
        self.pc += 1;
        Ok(())
    }

    /// Rest parameter from the stack slots past the first `n` arguments
    pub(crate) fn exec_create_args_rest_stack(&mut self, n: usize) -> Result<(), VmError> {
        let rest = if self.args > n {
            let sb = self.frame_base()?;
            self.stack.slice(sb + n + 1, sb + self.args + 1)?.to_vec()
        } else {
            Vec::new()
        };
        let array = self.realm.new_array(rest);
        self.stack.push(Value::Object(array));
        self.pc += 1;
        Ok(())
    }

    /// Rest parameter from the arguments that did not fit the stash
    pub(crate) fn exec_create_args_rest_stash(&mut self) -> Result<(), VmError> {
        let rest = std::mem::take(&mut self.stash.borrow_mut().extra_args);
        let array = self.realm.new_array(rest);
        self.stack.push(Value::Object(array));
        self.pc += 1;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Calls from Rust
    // ═══════════════════════════════════════════════════════════════════════════

    /// Run a script function to completion in a nested dispatch loop. A
    /// plain call; `construct` supplies `this` and patches the result.
    fn call_script(
        &mut self,
        callee: &ObjectRef,
        f: ScriptFunction,
        this: Value,
        args: &[Value],
        new_target: Value,
    ) -> Result<Value, VmError> {
        self.check_depth_limit()?;
        self.guarded(|vm| {
            vm.push_frame()?;
            vm.program = None;
            vm.func_name = None;

            let (this, new_target) = match &f.kind {
                FunctionKind::Arrow {
                    this,
                    new_target: captured,
                } => (this.clone(), captured.clone()),
                FunctionKind::Normal | FunctionKind::Method => (this, new_target),
            };
            vm.stack.push(Value::Object(callee.cheap_clone()));
            let sb = vm.stack.sp();
            vm.stack.push(this);
            for arg in args {
                vm.stack.push(arg.clone());
            }

            vm.push_frame()?;
            vm.args = args.len();
            vm.program = Some(f.template.program.clone());
            vm.stash = f.stash.clone();
            vm.sb = Some(sb);
            vm.pc = 0;
            vm.new_target = new_target;
            vm.constructing = false;

            vm.run()?;
            let result = vm.stack.pop()?;
            vm.pop_frame()?;
            Ok(result)
        })
    }

    /// Run a native body behind a native frame
    fn call_native(
        &mut self,
        name: &JsString,
        body: impl FnOnce(&mut Vm, CallContext) -> Result<Value, VmError>,
    ) -> Result<Value, VmError> {
        self.guarded(|vm| {
            vm.push_frame()?;
            vm.program = None;
            vm.func_name = Some(name.cheap_clone());
            let context = vm.call_context(name);
            let result = body(vm, context)?;
            vm.pop_frame()?;
            Ok(result)
        })
    }

    /// Call any callable value from Rust
    pub fn call_value(&mut self, callee: &Value, this: Value, args: &[Value]) -> Result<Value, VmError> {
        let (obj, kind) = callee_of(callee)?;
        match kind {
            Callee::Script(f) => self.call_script(&obj, f, this, args, Value::Undefined),
            Callee::Native(f) => {
                let arguments = args.to_vec();
                self.call_native(&f.name, |vm, context| {
                    (f.call)(
                        vm,
                        FunctionCall {
                            this,
                            arguments,
                            new_target: None,
                            context,
                        },
                    )
                })
            }
            Callee::Bound(b) => {
                let mut all = b.args;
                all.extend_from_slice(args);
                self.call_value(&Value::Object(b.target), b.this, &all)
            }
            Callee::Proxy(p) => {
                let arguments = args.to_vec();
                self.call_native(&JsString::from("proxy"), |vm, _| {
                    p.handler.apply(vm, &p.target, this, arguments)
                })
            }
        }
    }

    /// Like [`Vm::call_value`], but a script exception comes back as the
    /// inner `Err` with the VM state already restored. Uncatchable conditions
    /// still propagate through the outer `Err`.
    pub fn try_call(
        &mut self,
        callee: &Value,
        this: Value,
        args: &[Value],
    ) -> Result<Result<Value, Exception>, VmError> {
        match self.guarded(|vm| vm.call_value(callee, this, args)) {
            Ok(value) => Ok(Ok(value)),
            Err(VmError::Thrown(ex)) => Ok(Err(*ex)),
            Err(other) => Err(other),
        }
    }

    /// `new callee(...args)`. `new_target` defaults to the callee.
    pub fn construct(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        new_target: Option<Value>,
    ) -> Result<Value, VmError> {
        let new_target = new_target.unwrap_or_else(|| callee.clone());
        let (obj, kind) = callee_of(callee).map_err(|_| not_a_constructor(callee))?;
        match kind {
            Callee::Script(f) => {
                if !matches!(f.kind, FunctionKind::Normal) {
                    return Err(not_a_constructor(callee));
                }
                let this = self.construct_this(&new_target);
                let result = self.call_script(&obj, f, this.clone(), &args, new_target)?;
                Ok(match result {
                    Value::Object(_) => result,
                    _ => this,
                })
            }
            Callee::Native(f) => match f.construct.clone() {
                Some(construct) => {
                    self.call_native(&f.name, |vm, _| construct(vm, args, new_target))
                }
                None => {
                    let this = callee.clone();
                    self.call_native(&f.name, |vm, context| {
                        (f.call)(
                            vm,
                            FunctionCall {
                                this,
                                arguments: args,
                                new_target: Some(new_target),
                                context,
                            },
                        )
                    })
                }
            },
            Callee::Bound(b) => {
                let target = Value::Object(b.target.cheap_clone());
                let new_target = match &new_target {
                    Value::Object(nt) if nt.ptr_eq(&obj) => target.clone(),
                    _ => new_target,
                };
                let mut all = b.args;
                all.extend(args);
                self.construct(&target, all, Some(new_target))
            }
            Callee::Proxy(p) => self.call_native(&JsString::from("proxy"), |vm, _| {
                p.handler.construct(vm, &p.target, args, new_target)
            }),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Eval
    // ═══════════════════════════════════════════════════════════════════════════

    /// Compile and run `source`. A direct eval runs in the caller's scope;
    /// an indirect one in the global scope.
    pub fn eval_source(
        &mut self,
        source: &JsString,
        direct: bool,
        strict: bool,
        this: Value,
    ) -> Result<Value, VmError> {
        let compiler = self
            .compiler
            .clone()
            .ok_or_else(|| VmError::type_error("eval is not supported: no compiler installed"))?;
        let in_function = direct && self.in_function_scope();
        let options = CompileOptions {
            strict,
            direct_eval: direct,
            in_function,
        };
        let program = compiler.compile(source, options).map_err(|message| {
            tracing::debug!(%message, direct, "eval compile error");
            VmError::syntax_error(message)
        })?;

        let base = self.stack.sp();
        self.push_frame()?;
        self.program = Some(program);
        self.pc = 0;
        self.args = 0;
        self.result = Value::Undefined;
        self.func_name = None;
        self.constructing = false;
        if !direct {
            self.stash = self.realm.global_stash.clone();
        }
        self.sb = Some(self.stack.sp());
        self.stack.push(this);

        self.run()?;
        let result = std::mem::take(&mut self.result);
        self.pop_frame()?;
        self.stack.set_sp(base);
        Ok(result)
    }

    /// Whether a function's variable record is on the scope chain
    fn in_function_scope(&self) -> bool {
        let global = &self.realm.global_stash;
        let mut current = Some(self.stash.clone());
        while let Some(stash) = current {
            if Rc::ptr_eq(&stash, global) {
                return false;
            }
            let s = stash.borrow();
            if s.variable {
                return true;
            }
            current = s.outer.clone();
        }
        false
    }
}
