//! Minimal object model the VM calls into.
//!
//! Objects hold data properties only. The VM relies on a small contract:
//! get, set-own (strict or sloppy), has-own, has-property, delete,
//! define-own-property, own-keys and call/construct classification.

use crate::bytecode::FuncTemplate;
use crate::error::{ErrorData, VmError};
use crate::prelude::*;
use crate::value::{CheapClone, JsString, JsSymbol, Value};
use crate::vm::scope::StashRef;
use crate::vm::{FunctionCall, Vm};
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════════════
// Property keys and properties
// ═══════════════════════════════════════════════════════════════════════════════

/// A property key: a string or a symbol
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    String(JsString),
    Symbol(JsSymbol),
}

impl PropertyKey {
    /// Array index value of a canonical numeric string key
    pub fn as_index(&self) -> Option<u32> {
        match self {
            PropertyKey::String(s) => s.as_array_index(),
            PropertyKey::Symbol(_) => None,
        }
    }

    pub fn is_symbol(&self) -> bool {
        matches!(self, PropertyKey::Symbol(_))
    }

    pub fn as_string(&self) -> Option<&JsString> {
        match self {
            PropertyKey::String(s) => Some(s),
            PropertyKey::Symbol(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            PropertyKey::String(s) => Value::String(s.cheap_clone()),
            PropertyKey::Symbol(s) => Value::Symbol(s.cheap_clone()),
        }
    }
}

impl From<&str> for PropertyKey {
    fn from(s: &str) -> Self {
        PropertyKey::String(JsString::from(s))
    }
}

impl From<JsString> for PropertyKey {
    fn from(s: JsString) -> Self {
        PropertyKey::String(s)
    }
}

impl From<&JsString> for PropertyKey {
    fn from(s: &JsString) -> Self {
        PropertyKey::String(s.cheap_clone())
    }
}

impl From<JsSymbol> for PropertyKey {
    fn from(s: JsSymbol) -> Self {
        PropertyKey::Symbol(s)
    }
}

impl From<u32> for PropertyKey {
    fn from(i: u32) -> Self {
        PropertyKey::String(JsString::from(i.to_string()))
    }
}

impl From<usize> for PropertyKey {
    fn from(i: usize) -> Self {
        PropertyKey::String(JsString::from(i.to_string()))
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyKey::String(s) => write!(f, "{}", s),
            PropertyKey::Symbol(s) => write!(f, "{:?}", s),
        }
    }
}

impl fmt::Debug for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyKey::String(s) => write!(f, "{:?}", s),
            PropertyKey::Symbol(s) => write!(f, "{:?}", s),
        }
    }
}

/// A data property
#[derive(Clone, Debug)]
pub struct Property {
    pub value: Value,
    pub writable: bool,
    pub enumerable: bool,
    pub configurable: bool,
}

impl Property {
    /// Writable, enumerable, configurable
    pub fn data(value: Value) -> Self {
        Property {
            value,
            writable: true,
            enumerable: true,
            configurable: true,
        }
    }

    /// Writable and configurable but skipped by enumeration
    pub fn hidden(value: Value) -> Self {
        Property {
            value,
            writable: true,
            enumerable: false,
            configurable: true,
        }
    }

    pub fn with_attributes(value: Value, writable: bool, enumerable: bool, configurable: bool) -> Self {
        Property {
            value,
            writable,
            enumerable,
            configurable,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Object kinds
// ═══════════════════════════════════════════════════════════════════════════════

/// Host function body
pub type NativeFn = Rc<dyn Fn(&mut Vm, FunctionCall) -> Result<Value, VmError>>;

/// Host constructor body: `(vm, arguments, new_target)`
pub type NativeConstructFn = Rc<dyn Fn(&mut Vm, Vec<Value>, Value) -> Result<Value, VmError>>;

/// A function implemented by the host
#[derive(Clone)]
pub struct NativeFunction {
    pub name: JsString,
    pub length: u32,
    pub call: NativeFn,
    pub construct: Option<NativeConstructFn>,
}

/// How a script function treats `this` and construction
#[derive(Clone)]
pub enum FunctionKind {
    /// Ordinary function: callable and constructible
    Normal,
    /// Object/class method: callable only
    Method,
    /// Arrow function: `this` and new-target come from the defining context
    Arrow { this: Value, new_target: Value },
}

/// A closure over compiled code
#[derive(Clone)]
pub struct ScriptFunction {
    pub template: Rc<FuncTemplate>,
    pub stash: StashRef,
    pub kind: FunctionKind,
}

/// `Function.prototype.bind` result
#[derive(Clone)]
pub struct BoundFunction {
    pub target: ObjectRef,
    pub this: Value,
    pub args: Vec<Value>,
}

/// Call traps of a proxy object. Property traps are not part of this model.
pub trait ProxyHandler {
    fn apply(
        &self,
        vm: &mut Vm,
        target: &ObjectRef,
        this: Value,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        vm.call_value(&Value::Object(target.cheap_clone()), this, &args)
    }

    fn construct(
        &self,
        vm: &mut Vm,
        target: &ObjectRef,
        args: Vec<Value>,
        new_target: Value,
    ) -> Result<Value, VmError> {
        vm.construct(&Value::Object(target.cheap_clone()), args, Some(new_target))
    }
}

#[derive(Clone)]
pub struct ProxyObject {
    pub target: ObjectRef,
    pub handler: Rc<dyn ProxyHandler>,
}

/// Produces the concrete object the first time a lazy object is used
#[derive(Clone)]
pub struct LazyInit(pub Rc<dyn Fn() -> JsObject>);

/// A mapped arguments object: index `i` aliases slot `i` of the function
/// stash while `mapped[i]` is set.
#[derive(Clone)]
pub struct ArgumentsObject {
    pub stash: StashRef,
    pub mapped: Vec<bool>,
}

impl ArgumentsObject {
    fn mapped_index(&self, key: &PropertyKey) -> Option<usize> {
        let i = key.as_index()? as usize;
        match self.mapped.get(i) {
            Some(true) => Some(i),
            _ => None,
        }
    }

    fn unmap(&mut self, i: usize) {
        if let Some(m) = self.mapped.get_mut(i) {
            *m = false;
        }
    }
}

pub enum ObjectKind {
    Ordinary,
    /// Dense elements. `Value::Empty` marks a hole.
    Array(Vec<Value>),
    Arguments(ArgumentsObject),
    /// Wrapper around a primitive (`Object("abc")`)
    Primitive(Value),
    Error(ErrorData),
    Function(ScriptFunction),
    Native(NativeFunction),
    Bound(BoundFunction),
    Proxy(ProxyObject),
    Lazy(LazyInit),
}

/// Object storage
pub struct JsObject {
    pub prototype: Option<ObjectRef>,
    pub properties: IndexMap<PropertyKey, Property>,
    pub extensible: bool,
    pub kind: ObjectKind,
}

impl JsObject {
    pub fn ordinary(prototype: Option<ObjectRef>) -> Self {
        JsObject::with_kind(prototype, ObjectKind::Ordinary)
    }

    pub fn with_kind(prototype: Option<ObjectRef>, kind: ObjectKind) -> Self {
        JsObject {
            prototype,
            properties: index_map_new(),
            extensible: true,
            kind,
        }
    }

    /// Own property including the virtual ones of exotic kinds
    pub fn get_own_property(&self, key: &PropertyKey) -> Option<Property> {
        match &self.kind {
            ObjectKind::Array(elements) => {
                if let Some(i) = key.as_index() {
                    return elements
                        .get(i as usize)
                        .filter(|v| !v.is_empty())
                        .map(|v| Property::data(v.clone()));
                }
                if is_length(key) {
                    return Some(Property::with_attributes(
                        Value::from(elements.len() as u32),
                        true,
                        false,
                        false,
                    ));
                }
            }
            ObjectKind::Primitive(Value::String(s)) => {
                if let Some(i) = key.as_index() {
                    return s.code_unit_at(i as usize).map(|unit| {
                        Property::with_attributes(
                            Value::String(JsString::from_code_units(vec![unit])),
                            false,
                            true,
                            false,
                        )
                    });
                }
                if is_length(key) {
                    return Some(Property::with_attributes(
                        Value::from(s.len() as u32),
                        false,
                        false,
                        false,
                    ));
                }
            }
            ObjectKind::Arguments(args) => {
                if let Some(i) = args.mapped_index(key) {
                    let stash = args.stash.borrow();
                    let value = stash.values.get(i).cloned().unwrap_or_default();
                    return Some(Property::data(value.or_undefined()));
                }
            }
            _ => {}
        }
        self.properties.get(key).cloned()
    }

    pub fn has_own_property(&self, key: &PropertyKey) -> bool {
        self.get_own_property(key).is_some()
    }

    pub fn is_callable(&self) -> bool {
        match &self.kind {
            ObjectKind::Function(_) | ObjectKind::Native(_) | ObjectKind::Bound(_) => true,
            ObjectKind::Proxy(proxy) => proxy.target.is_callable(),
            _ => false,
        }
    }

    pub fn class_name(&self) -> &'static str {
        match &self.kind {
            ObjectKind::Ordinary | ObjectKind::Lazy(_) | ObjectKind::Proxy(_) => "Object",
            ObjectKind::Array(_) => "Array",
            ObjectKind::Arguments(_) => "Arguments",
            ObjectKind::Error(_) => "Error",
            ObjectKind::Function(_) | ObjectKind::Native(_) | ObjectKind::Bound(_) => "Function",
            ObjectKind::Primitive(Value::String(_)) => "String",
            ObjectKind::Primitive(Value::Bool(_)) => "Boolean",
            ObjectKind::Primitive(Value::Symbol(_)) => "Symbol",
            ObjectKind::Primitive(_) => "Number",
        }
    }
}

fn is_length(key: &PropertyKey) -> bool {
    matches!(key, PropertyKey::String(s) if *s == "length")
}

fn read_only_error(key: &PropertyKey) -> VmError {
    VmError::type_error(format!(
        "Cannot assign to read only property '{}' of object",
        key
    ))
}

fn array_length_from(value: &Value) -> Result<usize, VmError> {
    match value.as_f64() {
        Some(f) if f >= 0.0 && f <= f64::from(u32::MAX) && f.fract() == 0.0 => Ok(f as usize),
        _ => Err(VmError::range_error("Invalid array length")),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Object references
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared handle to an object
#[derive(Clone)]
pub struct ObjectRef(Rc<RefCell<JsObject>>);

impl CheapClone for ObjectRef {}

enum ExoticWrite {
    Done(bool),
    NotHandled(Value),
}

impl ObjectRef {
    pub fn new(obj: JsObject) -> Self {
        ObjectRef(Rc::new(RefCell::new(obj)))
    }

    pub fn borrow(&self) -> Ref<'_, JsObject> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, JsObject> {
        self.0.borrow_mut()
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }

    /// Replace a lazy object with its concrete form. No-op for other kinds.
    pub fn materialize(&self) {
        loop {
            let init = match &self.0.borrow().kind {
                ObjectKind::Lazy(init) => init.clone(),
                _ => return,
            };
            let concrete = (init.0)();
            *self.0.borrow_mut() = concrete;
        }
    }

    pub fn prototype(&self) -> Option<ObjectRef> {
        self.materialize();
        self.borrow().prototype.clone()
    }

    /// Set the prototype. Refuses (returns false) when it would create a cycle
    /// or the object is not extensible.
    pub fn set_prototype(&self, proto: Option<ObjectRef>) -> bool {
        self.materialize();
        let mut cursor = proto.clone();
        while let Some(p) = cursor {
            if p.ptr_eq(self) {
                return false;
            }
            cursor = p.prototype();
        }
        let mut obj = self.borrow_mut();
        if !obj.extensible {
            let same = match (&obj.prototype, &proto) {
                (Some(a), Some(b)) => a.ptr_eq(b),
                (None, None) => true,
                _ => false,
            };
            return same;
        }
        obj.prototype = proto;
        true
    }

    pub fn is_extensible(&self) -> bool {
        self.materialize();
        self.borrow().extensible
    }

    pub fn prevent_extensions(&self) {
        self.materialize();
        self.borrow_mut().extensible = false;
    }

    pub fn is_callable(&self) -> bool {
        self.materialize();
        self.borrow().is_callable()
    }

    /// Has a registered construct behaviour (native functions without a
    /// construct hook are handled separately by the VM)
    pub fn is_constructor(&self) -> bool {
        self.materialize();
        let obj = self.borrow();
        match &obj.kind {
            ObjectKind::Function(f) => matches!(f.kind, FunctionKind::Normal),
            ObjectKind::Native(n) => n.construct.is_some(),
            ObjectKind::Bound(b) => b.target.is_constructor(),
            ObjectKind::Proxy(p) => p.target.is_constructor(),
            _ => false,
        }
    }

    pub fn class_name(&self) -> &'static str {
        self.materialize();
        self.borrow().class_name()
    }

    pub fn get_own_property(&self, key: &PropertyKey) -> Option<Property> {
        self.materialize();
        self.borrow().get_own_property(key)
    }

    pub fn has_own_property(&self, key: &PropertyKey) -> bool {
        self.get_own_property(key).is_some()
    }

    /// Find a property on the object or its prototype chain
    pub fn find_property(&self, key: &PropertyKey) -> Option<Property> {
        let mut current = self.cheap_clone();
        loop {
            current.materialize();
            let next = {
                let obj = current.borrow();
                if let Some(prop) = obj.get_own_property(key) {
                    return Some(prop);
                }
                obj.prototype.clone()
            };
            current = next?;
        }
    }

    /// Property value through the prototype chain; `None` when absent
    pub fn get(&self, key: &PropertyKey) -> Option<Value> {
        self.find_property(key).map(|p| p.value)
    }

    pub fn has_property(&self, key: &PropertyKey) -> bool {
        self.find_property(key).is_some()
    }

    fn write_exotic(&self, key: &PropertyKey, value: Value) -> Result<ExoticWrite, VmError> {
        let mut obj = self.borrow_mut();
        let extensible = obj.extensible;
        match &mut obj.kind {
            ObjectKind::Array(elements) => {
                if let Some(i) = key.as_index() {
                    let i = i as usize;
                    if i >= elements.len() {
                        if !extensible {
                            return Ok(ExoticWrite::Done(false));
                        }
                        elements.resize(i + 1, Value::Empty);
                    }
                    if let Some(slot) = elements.get_mut(i) {
                        *slot = value;
                    }
                    return Ok(ExoticWrite::Done(true));
                }
                if is_length(key) {
                    let len = array_length_from(&value)?;
                    elements.resize(len, Value::Empty);
                    return Ok(ExoticWrite::Done(true));
                }
            }
            ObjectKind::Primitive(Value::String(s)) => {
                let hit = is_length(key)
                    || key.as_index().is_some_and(|i| (i as usize) < s.len());
                if hit {
                    return Ok(ExoticWrite::Done(false));
                }
            }
            ObjectKind::Arguments(args) => {
                if let Some(i) = args.mapped_index(key) {
                    let mut stash = args.stash.borrow_mut();
                    if let Some(slot) = stash.values.get_mut(i) {
                        *slot = value;
                    }
                    return Ok(ExoticWrite::Done(true));
                }
            }
            _ => {}
        }
        Ok(ExoticWrite::NotHandled(value))
    }

    /// Assign an own data property, following the prototype chain only to
    /// check for inherited read-only properties. Strict mode turns failures
    /// into type errors.
    pub fn set_own(&self, key: &PropertyKey, value: Value, strict: bool) -> Result<bool, VmError> {
        self.materialize();
        let value = match self.write_exotic(key, value)? {
            ExoticWrite::Done(true) => return Ok(true),
            ExoticWrite::Done(false) => {
                return if strict { Err(read_only_error(key)) } else { Ok(false) };
            }
            ExoticWrite::NotHandled(value) => value,
        };

        let own_writable = self.borrow().properties.get(key).map(|p| p.writable);
        let ok = match own_writable {
            Some(true) => {
                if let Some(prop) = self.borrow_mut().properties.get_mut(key) {
                    prop.value = value;
                }
                return Ok(true);
            }
            Some(false) => false,
            None => {
                let proto = self.borrow().prototype.clone();
                let inherited_read_only = proto
                    .and_then(|p| p.find_property(key))
                    .is_some_and(|p| !p.writable);
                let mut obj = self.borrow_mut();
                if inherited_read_only || !obj.extensible {
                    false
                } else {
                    obj.properties.insert(key.clone(), Property::data(value));
                    true
                }
            }
        };
        if !ok && strict {
            return Err(read_only_error(key));
        }
        Ok(ok)
    }

    /// Define or redefine an own data property
    pub fn define_own_property(
        &self,
        key: PropertyKey,
        prop: Property,
        strict: bool,
    ) -> Result<bool, VmError> {
        self.materialize();
        let current = self.get_own_property(&key);
        let allowed = match &current {
            None => self.borrow().extensible,
            Some(cur) if cur.configurable => true,
            Some(cur) => {
                !prop.configurable
                    && prop.enumerable == cur.enumerable
                    && (cur.writable || (!prop.writable && prop.value.same_value(&cur.value)))
            }
        };
        if !allowed {
            return if strict {
                Err(VmError::type_error(format!("Cannot redefine property: {}", key)))
            } else {
                Ok(false)
            };
        }

        let mut obj = self.borrow_mut();
        match &mut obj.kind {
            ObjectKind::Array(elements) => {
                if let Some(i) = key.as_index() {
                    let i = i as usize;
                    if i >= elements.len() {
                        elements.resize(i + 1, Value::Empty);
                    }
                    if let Some(slot) = elements.get_mut(i) {
                        *slot = prop.value;
                    }
                    return Ok(true);
                }
                if is_length(&key) {
                    let len = array_length_from(&prop.value)?;
                    elements.resize(len, Value::Empty);
                    return Ok(true);
                }
            }
            ObjectKind::Arguments(args) => {
                if let Some(i) = args.mapped_index(&key) {
                    args.unmap(i);
                }
            }
            _ => {}
        }
        obj.properties.insert(key, prop);
        Ok(true)
    }

    /// Delete an own property. Non-configurable properties fail, or raise in strict mode.
    pub fn delete(&self, key: &PropertyKey, strict: bool) -> Result<bool, VmError> {
        self.materialize();
        let ok = {
            let mut obj = self.borrow_mut();
            let handled = match &mut obj.kind {
                ObjectKind::Array(elements) => {
                    if let Some(i) = key.as_index() {
                        if let Some(slot) = elements.get_mut(i as usize) {
                            *slot = Value::Empty;
                        }
                        Some(true)
                    } else if is_length(key) {
                        Some(false)
                    } else {
                        None
                    }
                }
                ObjectKind::Primitive(Value::String(s)) => {
                    let hit = is_length(key)
                        || key.as_index().is_some_and(|i| (i as usize) < s.len());
                    if hit { Some(false) } else { None }
                }
                ObjectKind::Arguments(args) => match args.mapped_index(key) {
                    Some(i) => {
                        args.unmap(i);
                        Some(true)
                    }
                    None => None,
                },
                _ => None,
            };
            match handled {
                Some(ok) => ok,
                None => match obj.properties.get(key) {
                    Some(prop) if !prop.configurable => false,
                    Some(_) => {
                        obj.properties.shift_remove(key);
                        true
                    }
                    None => true,
                },
            }
        };
        if !ok && strict {
            return Err(VmError::type_error(format!(
                "Cannot delete property '{}' of object",
                key
            )));
        }
        Ok(ok)
    }

    /// Own keys in property order: array indices ascending, then strings in
    /// insertion order, then symbols
    pub fn own_keys(&self) -> Vec<PropertyKey> {
        self.materialize();
        let obj = self.borrow();
        let mut indices: Vec<u32> = Vec::new();
        let mut strings: Vec<PropertyKey> = Vec::new();
        let mut symbols: Vec<PropertyKey> = Vec::new();

        match &obj.kind {
            ObjectKind::Array(elements) => {
                indices.extend(
                    elements
                        .iter()
                        .enumerate()
                        .filter(|(_, v)| !v.is_empty())
                        .map(|(i, _)| i as u32),
                );
                strings.push(PropertyKey::from("length"));
            }
            ObjectKind::Primitive(Value::String(s)) => {
                indices.extend(0..s.len() as u32);
                strings.push(PropertyKey::from("length"));
            }
            ObjectKind::Arguments(args) => {
                indices.extend(
                    args.mapped
                        .iter()
                        .enumerate()
                        .filter(|(_, m)| **m)
                        .map(|(i, _)| i as u32),
                );
            }
            _ => {}
        }

        for key in obj.properties.keys() {
            match key.as_index() {
                Some(i) => indices.push(i),
                None if key.is_symbol() => symbols.push(key.clone()),
                None => strings.push(key.clone()),
            }
        }

        indices.sort_unstable();
        indices.dedup();
        let mut keys: Vec<PropertyKey> = indices.into_iter().map(PropertyKey::from).collect();
        keys.extend(strings);
        keys.extend(symbols);
        keys
    }

    /// Host-side convenience: define a plain data property
    pub fn put(&self, key: impl Into<PropertyKey>, value: impl Into<Value>) -> bool {
        self.define_own_property(key.into(), Property::data(value.into()), false)
            .unwrap_or(false)
    }

    /// Elements of an array object
    pub fn array_elements(&self) -> Option<Vec<Value>> {
        self.materialize();
        match &self.borrow().kind {
            ObjectKind::Array(elements) => {
                Some(elements.iter().cloned().map(Value::or_undefined).collect())
            }
            _ => None,
        }
    }

    /// Append to an array object
    pub(crate) fn array_push(&self, value: Value) -> Result<(), VmError> {
        let mut obj = self.borrow_mut();
        match &mut obj.kind {
            ObjectKind::Array(elements) => {
                if elements.len() >= u32::MAX as usize {
                    return Err(VmError::range_error("Invalid array length"));
                }
                elements.push(value);
                Ok(())
            }
            _ => Err(VmError::type_error("not an array")),
        }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Ok(obj) = self.0.try_borrow() else {
            return write!(f, "[object <borrowed>]");
        };
        match &obj.kind {
            ObjectKind::Function(func) => write!(f, "[Function: {}]", func.template.name),
            ObjectKind::Native(native) => write!(f, "[Function: {}]", native.name),
            ObjectKind::Bound(_) => write!(f, "[Function: bound]"),
            ObjectKind::Array(elements) => write!(f, "[Array({})]", elements.len()),
            _ => write!(f, "[object {}]", obj.class_name()),
        }
    }
}
