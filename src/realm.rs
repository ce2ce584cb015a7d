//! Realm: the global object, intrinsic prototypes and the few natives the
//! VM relies on (`eval`, the array iterator, error constructors, `bind`).
//!
//! A full standard library is out of scope; embedders add their own natives
//! through [`Realm::new_native_function`] and the global object.

use crate::error::{ErrorData, ErrorKind, HostError, VmError};
use crate::object::{
    BoundFunction, FunctionKind, JsObject, LazyInit, NativeConstructFn, NativeFn, NativeFunction,
    ObjectKind, ObjectRef, Property, PropertyKey, ProxyHandler, ProxyObject, ScriptFunction,
};
use crate::bytecode::FuncTemplate;
use crate::prelude::*;
use crate::value::{CheapClone, JsString, JsSymbol, Value, to_uint32};
use crate::vm::scope::{Stash, StashRef};
use crate::vm::{FunctionCall, Vm};

/// Symbols with VM-level meaning
pub struct WellKnownSymbols {
    pub iterator: JsSymbol,
    pub unscopables: JsSymbol,
}

impl WellKnownSymbols {
    fn new() -> Self {
        WellKnownSymbols {
            iterator: JsSymbol::new(Some(JsString::from("Symbol.iterator"))),
            unscopables: JsSymbol::new(Some(JsString::from("Symbol.unscopables"))),
        }
    }
}

/// Global environment of a [`Vm`]
pub struct Realm {
    pub global_object: ObjectRef,
    /// Lexical global bindings (`let`/`const` at script top level)
    pub global_stash: StashRef,
    /// Names declared with `var` or `function` at global scope
    pub(crate) var_names: FxHashSet<JsString>,

    pub object_prototype: ObjectRef,
    pub function_prototype: ObjectRef,
    pub array_prototype: ObjectRef,
    pub string_prototype: ObjectRef,
    pub number_prototype: ObjectRef,
    pub boolean_prototype: ObjectRef,
    pub symbol_prototype: ObjectRef,
    pub iterator_prototype: ObjectRef,
    error_prototypes: FxHashMap<ErrorKind, ObjectRef>,

    /// The realm's `eval`; a direct eval call is recognised by identity
    pub eval: ObjectRef,
    /// `Array.prototype[Symbol.iterator]`
    pub array_values: ObjectRef,
    pub symbols: WellKnownSymbols,
    /// Stack marker pushed by `StartVariadic`
    pub(crate) variadic_marker: JsSymbol,
}

fn hidden_readonly(value: Value) -> Property {
    Property::with_attributes(value, false, false, true)
}

fn define_hidden(obj: &ObjectRef, key: impl Into<PropertyKey>, value: impl Into<Value>) {
    // intrinsic objects are extensible, so definition cannot fail
    let _ = obj.define_own_property(key.into(), Property::hidden(value.into()), false);
}

fn make_native(
    proto: &ObjectRef,
    name: &str,
    length: u32,
    call: NativeFn,
    construct: Option<NativeConstructFn>,
) -> ObjectRef {
    let name = JsString::from(name);
    let obj = ObjectRef::new(JsObject::with_kind(
        Some(proto.cheap_clone()),
        ObjectKind::Native(NativeFunction {
            name: name.cheap_clone(),
            length,
            call,
            construct,
        }),
    ));
    let _ = obj.define_own_property(PropertyKey::from("length"), hidden_readonly(Value::from(length)), false);
    let _ = obj.define_own_property(PropertyKey::from("name"), hidden_readonly(Value::String(name)), false);
    obj
}

impl Realm {
    pub fn new() -> Self {
        let object_prototype = ObjectRef::new(JsObject::ordinary(None));
        let proto = || Some(object_prototype.cheap_clone());

        let function_prototype = ObjectRef::new(JsObject::ordinary(proto()));
        let array_prototype = ObjectRef::new(JsObject::with_kind(proto(), ObjectKind::Array(Vec::new())));
        let string_prototype = ObjectRef::new(JsObject::with_kind(
            proto(),
            ObjectKind::Primitive(Value::String(JsString::from(""))),
        ));
        let number_prototype =
            ObjectRef::new(JsObject::with_kind(proto(), ObjectKind::Primitive(Value::Int(0))));
        let boolean_prototype =
            ObjectRef::new(JsObject::with_kind(proto(), ObjectKind::Primitive(Value::Bool(false))));
        let symbol_prototype = ObjectRef::new(JsObject::ordinary(proto()));
        let iterator_prototype = ObjectRef::new(JsObject::ordinary(proto()));
        let global_object = ObjectRef::new(JsObject::ordinary(proto()));

        let symbols = WellKnownSymbols::new();
        let array_values = make_native(&function_prototype, "values", 0, Rc::new(array_values), None);
        let eval = make_native(&function_prototype, "eval", 1, Rc::new(indirect_eval), None);

        let global_stash = Stash {
            names: Some(Rc::default()),
            variable: true,
            ..Stash::default()
        }
        .into_ref();

        let mut realm = Realm {
            global_object,
            global_stash,
            var_names: FxHashSet::default(),
            object_prototype,
            function_prototype,
            array_prototype,
            string_prototype,
            number_prototype,
            boolean_prototype,
            symbol_prototype,
            iterator_prototype,
            error_prototypes: FxHashMap::default(),
            eval,
            array_values,
            symbols,
            variadic_marker: JsSymbol::new(Some(JsString::from("variadic"))),
        };
        realm.install_prototypes();
        realm.install_errors();
        realm.install_globals();
        realm
    }

    fn install_prototypes(&mut self) {
        let iterator_key = PropertyKey::from(self.symbols.iterator.cheap_clone());

        let op = self.object_prototype.cheap_clone();
        define_hidden(&op, "toString", self.new_native_function("toString", 0, object_to_string));
        define_hidden(&op, "valueOf", self.new_native_function("valueOf", 0, object_value_of));

        let fp = self.function_prototype.cheap_clone();
        define_hidden(&fp, "call", self.new_native_function("call", 1, function_call));
        define_hidden(&fp, "bind", self.new_native_function("bind", 1, function_bind));

        let ap = self.array_prototype.cheap_clone();
        define_hidden(&ap, "toString", self.new_native_function("toString", 0, array_to_string));
        define_hidden(&ap, "push", self.new_native_function("push", 1, array_push));
        define_hidden(&ap, "values", self.array_values.cheap_clone());
        define_hidden(&ap, iterator_key.clone(), self.array_values.cheap_clone());

        define_hidden(&self.string_prototype, iterator_key.clone(), self.array_values.cheap_clone());

        let ip = self.iterator_prototype.cheap_clone();
        define_hidden(&ip, iterator_key, self.new_native_function("[Symbol.iterator]", 0, |_, call| Ok(call.this)));
    }

    fn install_errors(&mut self) {
        let base = ObjectRef::new(JsObject::ordinary(Some(self.object_prototype.cheap_clone())));
        define_hidden(&base, "name", "Error");
        define_hidden(&base, "message", "");
        self.error_prototypes.insert(ErrorKind::Error, base.cheap_clone());

        for kind in [ErrorKind::Type, ErrorKind::Reference, ErrorKind::Range, ErrorKind::Syntax] {
            let proto = ObjectRef::new(JsObject::ordinary(Some(base.cheap_clone())));
            define_hidden(&proto, "name", kind.name());
            define_hidden(&proto, "message", "");
            self.error_prototypes.insert(kind, proto);
        }

        for kind in [
            ErrorKind::Error,
            ErrorKind::Type,
            ErrorKind::Reference,
            ErrorKind::Range,
            ErrorKind::Syntax,
        ] {
            let proto = self.error_prototype(kind);
            let call: NativeFn = Rc::new(move |vm: &mut Vm, call: FunctionCall| {
                let message = vm.error_message_arg(call.argument(0))?;
                Ok(Value::Object(vm.realm.new_error(kind, message)))
            });
            let construct: NativeConstructFn = Rc::new(move |vm: &mut Vm, args: Vec<Value>, new_target: Value| {
                let message = vm.error_message_arg(args.into_iter().next().unwrap_or_default())?;
                let err = vm.realm.new_error(kind, message);
                if let Some(Value::Object(proto)) = new_target
                    .as_object()
                    .and_then(|nt| nt.get(&PropertyKey::from("prototype")))
                {
                    err.set_prototype(Some(proto));
                }
                Ok(Value::Object(err))
            });
            let ctor = make_native(&self.function_prototype, kind.name(), 1, call, Some(construct));
            let _ = ctor.define_own_property(
                PropertyKey::from("prototype"),
                Property::with_attributes(Value::Object(proto), false, false, false),
                false,
            );
            define_hidden(&self.global_object, kind.name(), ctor);
        }
    }

    fn install_globals(&mut self) {
        let global = self.global_object.cheap_clone();
        define_hidden(&global, "globalThis", global.cheap_clone());
        define_hidden(&global, "eval", self.eval.cheap_clone());
        for (name, value) in [
            ("undefined", Value::Undefined),
            ("NaN", Value::NAN),
            ("Infinity", Value::POSITIVE_INFINITY),
        ] {
            let _ = global.define_own_property(
                PropertyKey::from(name),
                Property::with_attributes(value, false, false, false),
                false,
            );
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Object factories
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn new_object(&self) -> ObjectRef {
        ObjectRef::new(JsObject::ordinary(Some(self.object_prototype.cheap_clone())))
    }

    pub fn new_array(&self, elements: Vec<Value>) -> ObjectRef {
        ObjectRef::new(JsObject::with_kind(
            Some(self.array_prototype.cheap_clone()),
            ObjectKind::Array(elements),
        ))
    }

    pub fn new_native_function<F>(&self, name: &str, length: u32, f: F) -> ObjectRef
    where
        F: Fn(&mut Vm, FunctionCall) -> Result<Value, VmError> + 'static,
    {
        make_native(&self.function_prototype, name, length, Rc::new(f), None)
    }

    /// A native with its own construct behaviour
    pub fn new_native_constructor<F, C>(&self, name: &str, length: u32, call: F, construct: C) -> ObjectRef
    where
        F: Fn(&mut Vm, FunctionCall) -> Result<Value, VmError> + 'static,
        C: Fn(&mut Vm, Vec<Value>, Value) -> Result<Value, VmError> + 'static,
    {
        make_native(&self.function_prototype, name, length, Rc::new(call), Some(Rc::new(construct)))
    }

    /// Closure over `template` capturing the scope chain at `stash`
    pub fn new_script_function(&self, template: Rc<FuncTemplate>, stash: StashRef, kind: FunctionKind) -> ObjectRef {
        let constructible = matches!(kind, FunctionKind::Normal);
        let name = template.name.cheap_clone();
        let length = template.length;
        let obj = ObjectRef::new(JsObject::with_kind(
            Some(self.function_prototype.cheap_clone()),
            ObjectKind::Function(ScriptFunction { template, stash, kind }),
        ));
        let _ = obj.define_own_property(PropertyKey::from("length"), hidden_readonly(Value::from(length)), false);
        let _ = obj.define_own_property(PropertyKey::from("name"), hidden_readonly(Value::String(name)), false);
        if constructible {
            let proto = self.new_object();
            let _ = obj.define_own_property(
                PropertyKey::from("prototype"),
                Property::with_attributes(Value::Object(proto), true, false, false),
                false,
            );
        }
        obj
    }

    pub fn new_bound_function(&self, target: ObjectRef, this: Value, args: Vec<Value>) -> ObjectRef {
        let target_name = target
            .get(&PropertyKey::from("name"))
            .and_then(|v| v.as_string().cloned())
            .unwrap_or_else(|| JsString::from(""));
        let target_length = target
            .get(&PropertyKey::from("length"))
            .and_then(|v| v.as_integer())
            .unwrap_or(0);
        let length = (target_length - args.len() as i64).max(0) as u32;
        let obj = ObjectRef::new(JsObject::with_kind(
            Some(self.function_prototype.cheap_clone()),
            ObjectKind::Bound(BoundFunction { target, this, args }),
        ));
        let name = JsString::from(format!("bound {}", target_name));
        let _ = obj.define_own_property(PropertyKey::from("length"), hidden_readonly(Value::from(length)), false);
        let _ = obj.define_own_property(PropertyKey::from("name"), hidden_readonly(Value::String(name)), false);
        obj
    }

    /// Callable wrapper whose call and construct go through `handler`
    pub fn new_proxy(&self, target: ObjectRef, handler: Rc<dyn ProxyHandler>) -> ObjectRef {
        ObjectRef::new(JsObject::with_kind(
            Some(self.object_prototype.cheap_clone()),
            ObjectKind::Proxy(ProxyObject { target, handler }),
        ))
    }

    /// Object built on first use
    pub fn new_lazy<F>(&self, init: F) -> ObjectRef
    where
        F: Fn() -> JsObject + 'static,
    {
        ObjectRef::new(JsObject::with_kind(None, ObjectKind::Lazy(LazyInit(Rc::new(init)))))
    }

    pub fn error_prototype(&self, kind: ErrorKind) -> ObjectRef {
        let kind = match kind {
            ErrorKind::Uninitialized => ErrorKind::Reference,
            ErrorKind::Host => ErrorKind::Error,
            other => other,
        };
        self.error_prototypes
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| self.object_prototype.cheap_clone())
    }

    fn make_error(&self, kind: ErrorKind, message: JsString, wrapped: Option<HostError>) -> ObjectRef {
        let err = ObjectRef::new(JsObject::with_kind(
            Some(self.error_prototype(kind)),
            ObjectKind::Error(ErrorData { kind, wrapped }),
        ));
        define_hidden(&err, "message", message);
        err
    }

    pub fn new_error(&self, kind: ErrorKind, message: impl Into<JsString>) -> ObjectRef {
        self.make_error(kind, message.into(), None)
    }

    /// Error object carrying a host error; scripts see a plain `Error`
    pub fn new_host_error(&self, error: HostError) -> ObjectRef {
        self.make_error(ErrorKind::Host, JsString::from(error.to_string()), Some(error))
    }

    /// ToObject: wrap primitives, reject null and undefined
    pub fn to_object(&self, value: &Value) -> Result<ObjectRef, VmError> {
        let proto = match value {
            Value::Object(obj) => return Ok(obj.cheap_clone()),
            Value::Undefined | Value::Null | Value::Empty | Value::Unresolved { .. } => {
                return Err(VmError::type_error(format!(
                    "Cannot convert {} to object",
                    value.clone().or_undefined()
                )));
            }
            Value::Bool(_) => &self.boolean_prototype,
            Value::Int(_) | Value::Int64(_) | Value::Float(_) => &self.number_prototype,
            Value::String(_) => &self.string_prototype,
            Value::Symbol(_) => &self.symbol_prototype,
        };
        Ok(ObjectRef::new(JsObject::with_kind(
            Some(proto.cheap_clone()),
            ObjectKind::Primitive(value.clone()),
        )))
    }

    /// `{ value, done }` iterator result object
    pub fn iter_result(&self, value: Value, done: bool) -> ObjectRef {
        let result = self.new_object();
        result.put("value", value);
        result.put("done", done);
        result
    }
}

impl Default for Realm {
    fn default() -> Self {
        Realm::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Natives
// ═══════════════════════════════════════════════════════════════════════════════

fn object_to_string(vm: &mut Vm, call: FunctionCall) -> Result<Value, VmError> {
    let tag = match &call.this {
        Value::Undefined => "Undefined",
        Value::Null => "Null",
        other => vm.to_object(other)?.class_name(),
    };
    Ok(Value::from(format!("[object {}]", tag)))
}

fn object_value_of(vm: &mut Vm, call: FunctionCall) -> Result<Value, VmError> {
    Ok(Value::Object(vm.to_object(&call.this)?))
}

fn function_call(vm: &mut Vm, call: FunctionCall) -> Result<Value, VmError> {
    let mut args = call.arguments.into_iter();
    let this = args.next().unwrap_or_default();
    let rest: Vec<Value> = args.collect();
    vm.call_value(&call.this, this, &rest)
}

fn function_bind(vm: &mut Vm, call: FunctionCall) -> Result<Value, VmError> {
    let target = match &call.this {
        Value::Object(obj) if obj.is_callable() => obj.cheap_clone(),
        _ => return Err(VmError::type_error("Bind must be called on a function")),
    };
    let mut args = call.arguments.into_iter();
    let this = args.next().unwrap_or_default();
    let bound = vm.realm.new_bound_function(target, this, args.collect());
    Ok(Value::Object(bound))
}

/// `length` of an array-like
fn length_of(vm: &mut Vm, obj: &ObjectRef) -> Result<u32, VmError> {
    let len = obj.get(&PropertyKey::from("length")).unwrap_or_default();
    let len = vm.to_number(&len)?;
    Ok(to_uint32(&len))
}

fn array_to_string(vm: &mut Vm, call: FunctionCall) -> Result<Value, VmError> {
    let obj = vm.to_object(&call.this)?;
    let len = length_of(vm, &obj)?;
    let mut units: Vec<u16> = Vec::new();
    for i in 0..len {
        if i > 0 {
            units.push(u16::from(b','));
        }
        let item = obj.get(&PropertyKey::from(i)).unwrap_or_default();
        if !item.is_null_or_undefined() {
            units.extend(vm.to_string(&item)?.code_units());
        }
    }
    Ok(Value::String(JsString::from_code_units(units)))
}

fn array_push(vm: &mut Vm, call: FunctionCall) -> Result<Value, VmError> {
    let obj = vm.to_object(&call.this)?;
    for item in call.arguments {
        obj.array_push(item)?;
    }
    Ok(obj.get(&PropertyKey::from("length")).unwrap_or_default())
}

/// Iterator over the indexed elements of any array-like receiver
fn array_values(vm: &mut Vm, call: FunctionCall) -> Result<Value, VmError> {
    let source = vm.to_object(&call.this)?;
    let index = Rc::new(Cell::new(0u32));
    let exhausted = Rc::new(Cell::new(false));
    let next = vm.realm.new_native_function("next", 0, move |vm, _| {
        if exhausted.get() {
            return Ok(Value::Object(vm.realm.iter_result(Value::Undefined, true)));
        }
        let i = index.get();
        if i >= length_of(vm, &source)? {
            exhausted.set(true);
            return Ok(Value::Object(vm.realm.iter_result(Value::Undefined, true)));
        }
        index.set(i + 1);
        let item = source.get(&PropertyKey::from(i)).unwrap_or_default();
        Ok(Value::Object(vm.realm.iter_result(item, false)))
    });
    let iter = ObjectRef::new(JsObject::ordinary(Some(vm.realm.iterator_prototype.cheap_clone())));
    define_hidden(&iter, "next", next);
    Ok(Value::Object(iter))
}

/// `eval` called indirectly: global scope, sloppy mode
fn indirect_eval(vm: &mut Vm, call: FunctionCall) -> Result<Value, VmError> {
    match call.arguments.into_iter().next() {
        Some(Value::String(source)) => {
            let this = Value::Object(vm.realm.global_object.cheap_clone());
            vm.eval_source(&source, false, false, this)
        }
        Some(other) => Ok(other),
        None => Ok(Value::Undefined),
    }
}
