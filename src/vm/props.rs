//! Property access, object and array literal instructions

use super::{Reference, Vm};
use crate::error::VmError;
use crate::object::{ObjectRef, Property, PropertyKey};
use crate::value::{CheapClone, JsString, Value};

fn member_of_nothing(key: &PropertyKey, base: &Value) -> VmError {
    VmError::type_error(format!("Cannot access member '{}' of {}", key, base))
}

impl Vm {
    // ═══════════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════════

    /// `base[key]`; primitives read through their wrapper prototype
    pub fn get_property(&self, base: &Value, key: &PropertyKey) -> Result<Option<Value>, VmError> {
        match base {
            Value::Object(obj) => Ok(obj.get(key)),
            Value::Undefined | Value::Null | Value::Empty | Value::Unresolved { .. } => {
                Err(member_of_nothing(key, &base.clone().or_undefined()))
            }
            other => Ok(self.to_object(other)?.get(key)),
        }
    }

    /// Missing properties read as undefined, or as an unresolved marker for
    /// the callee of a method call
    fn property_or_marker(
        &self,
        base: &Value,
        key: &PropertyKey,
        callee: bool,
    ) -> Result<Value, VmError> {
        Ok(match self.get_property(base, key)? {
            Some(value) => value,
            None if callee => Value::Unresolved {
                name: JsString::from(key.to_string()),
                member: true,
            },
            None => Value::Undefined,
        })
    }

    /// Replace the object on top with its property
    pub(crate) fn exec_get_prop(&mut self, name: &JsString, callee: bool) -> Result<(), VmError> {
        let key = PropertyKey::from(name);
        let base = self.stack.peek(0)?.clone();
        let value = self.property_or_marker(&base, &key, callee)?;
        self.stack.replace_top(value)?;
        self.pc += 1;
        Ok(())
    }

    /// `[obj, key]` → `[value]`. A key produced by `ToPropertyKey` skips the
    /// conversion.
    pub(crate) fn exec_get_elem(&mut self, key_ready: bool, callee: bool) -> Result<(), VmError> {
        let key_value = self.stack.pop()?;
        let base = self.stack.peek(0)?.clone();
        if base.is_null_or_undefined() {
            let shown = PropertyKey::from(JsString::from(key_value.to_string()));
            return Err(member_of_nothing(&shown, &base));
        }
        let key = if key_ready {
            key_of_converted(key_value)?
        } else {
            self.to_property_key(&key_value)?
        };
        let value = self.property_or_marker(&base, &key, callee)?;
        self.stack.replace_top(value)?;
        self.pc += 1;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════════

    /// Assignment `base[key] = value`. Writes to primitives are dropped in
    /// sloppy mode.
    pub fn put_property(
        &mut self,
        base: &Value,
        key: &PropertyKey,
        value: Value,
        strict: bool,
    ) -> Result<(), VmError> {
        match base {
            Value::Object(obj) => {
                obj.set_own(key, value, strict)?;
                Ok(())
            }
            Value::Undefined | Value::Null | Value::Empty | Value::Unresolved { .. } => {
                Err(VmError::type_error(format!(
                    "Cannot set property '{}' of {}",
                    key,
                    base.clone().or_undefined()
                )))
            }
            primitive if strict => Err(VmError::type_error(format!(
                "Cannot create property '{}' on {} '{}'",
                key,
                self.type_of(primitive),
                primitive
            ))),
            _ => Ok(()),
        }
    }

    /// `[obj, value]` → `[value]` (or `[]` with `pop`)
    pub(crate) fn exec_set_prop(&mut self, name: &JsString, strict: bool, pop: bool) -> Result<(), VmError> {
        let value = self.stack.pop()?;
        let base = self.stack.pop()?;
        self.put_property(&base, &PropertyKey::from(name), value.clone(), strict)?;
        if !pop {
            self.stack.push(value);
        }
        self.pc += 1;
        Ok(())
    }

    /// `[obj, key, value]` → `[value]` (or `[]` with `pop`)
    pub(crate) fn exec_set_elem(&mut self, strict: bool, pop: bool) -> Result<(), VmError> {
        let value = self.stack.pop()?;
        let key_value = self.stack.pop()?;
        let base = self.stack.pop()?;
        if base.is_null_or_undefined() {
            return Err(VmError::type_error(format!(
                "Cannot set property '{}' of {}",
                key_value, base
            )));
        }
        let key = self.to_property_key(&key_value)?;
        self.put_property(&base, &key, value.clone(), strict)?;
        if !pop {
            self.stack.push(value);
        }
        self.pc += 1;
        Ok(())
    }

    /// Literal element definition: `[obj, key, value]` → `[obj]`
    pub(crate) fn exec_set_elem1(&mut self) -> Result<(), VmError> {
        let value = self.stack.pop()?;
        let key_value = self.stack.pop()?;
        let key = self.to_property_key(&key_value)?;
        let target = self.literal_target()?;
        target.define_own_property(key, Property::data(value), true)?;
        self.pc += 1;
        Ok(())
    }

    /// Literal property definition: `[obj, value]` → `[obj]`
    pub(crate) fn exec_set_prop1(&mut self, name: &JsString) -> Result<(), VmError> {
        let value = self.stack.pop()?;
        let target = self.literal_target()?;
        target.define_own_property(PropertyKey::from(name), Property::data(value), true)?;
        self.pc += 1;
        Ok(())
    }

    /// `__proto__: value` in a literal: `[obj, proto]` → `[obj]`.
    /// Values other than objects and null are ignored.
    pub(crate) fn exec_set_proto(&mut self) -> Result<(), VmError> {
        let proto = self.stack.pop()?;
        let target = self.literal_target()?;
        match proto {
            Value::Object(proto) => {
                target.set_prototype(Some(proto));
            }
            Value::Null => {
                target.set_prototype(None);
            }
            _ => {}
        }
        self.pc += 1;
        Ok(())
    }

    fn literal_target(&self) -> Result<ObjectRef, VmError> {
        match self.stack.peek(0)? {
            Value::Object(obj) => Ok(obj.cheap_clone()),
            other => Err(VmError::internal(format!("literal target {} is not an object", other))),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // References and deletion
    // ═══════════════════════════════════════════════════════════════════════════

    /// Pop an object and push a reference to its property
    pub(crate) fn exec_get_prop_ref(&mut self, name: &JsString, strict: bool) -> Result<(), VmError> {
        let base = self.stack.pop()?;
        let base = self.to_object(&base)?;
        self.ref_stack.push(Reference::Object {
            base,
            key: PropertyKey::from(name),
            strict,
            binding: false,
        });
        self.pc += 1;
        Ok(())
    }

    /// Pop `[obj, key]` and push a reference to the property
    pub(crate) fn exec_get_elem_ref(&mut self, strict: bool) -> Result<(), VmError> {
        let key_value = self.stack.pop()?;
        let base = self.stack.pop()?;
        let base = self.to_object(&base)?;
        let key = self.to_property_key(&key_value)?;
        self.ref_stack.push(Reference::Object {
            base,
            key,
            strict,
            binding: false,
        });
        self.pc += 1;
        Ok(())
    }

    /// Replace the object on top with the outcome of deleting its property
    pub(crate) fn exec_delete_prop(&mut self, name: &JsString, strict: bool) -> Result<(), VmError> {
        let base = self.stack.peek(0)?.clone();
        let base = self.to_object(&base)?;
        let deleted = base.delete(&PropertyKey::from(name), strict)?;
        self.stack.replace_top(Value::Bool(deleted))?;
        self.pc += 1;
        Ok(())
    }

    /// `[obj, key]` → `[deleted]`
    pub(crate) fn exec_delete_elem(&mut self, strict: bool) -> Result<(), VmError> {
        let key_value = self.stack.pop()?;
        let base = self.stack.peek(0)?.clone();
        let base = self.to_object(&base)?;
        let key = self.to_property_key(&key_value)?;
        let deleted = base.delete(&key, strict)?;
        self.stack.replace_top(Value::Bool(deleted))?;
        self.pc += 1;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Array literals and spreading
    // ═══════════════════════════════════════════════════════════════════════════

    /// `[array, value]` → `[array]`
    pub(crate) fn exec_push_array_item(&mut self) -> Result<(), VmError> {
        let value = self.stack.pop()?;
        self.literal_target()?.array_push(value)?;
        self.pc += 1;
        Ok(())
    }

    /// `[array, iterable]` → `[array]`
    pub(crate) fn exec_push_array_spread(&mut self) -> Result<(), VmError> {
        let iterable = self.stack.pop()?;
        let array = self.literal_target()?;
        self.for_each_item(&iterable, |_, item| array.array_push(item))?;
        self.pc += 1;
        Ok(())
    }

    /// Spread call arguments: pop an iterable and push each item
    pub(crate) fn exec_push_spread(&mut self) -> Result<(), VmError> {
        let iterable = self.stack.pop()?;
        self.for_each_item(&iterable, |vm, item| {
            vm.stack.push(item);
            Ok(())
        })?;
        self.pc += 1;
        Ok(())
    }

    /// Object spread: `[target, source]` → `[target]`
    pub(crate) fn exec_copy_spread(&mut self) -> Result<(), VmError> {
        let source = self.stack.pop()?;
        let target = self.literal_target()?;
        self.copy_data_properties(&target, &source)?;
        self.pc += 1;
        Ok(())
    }

    /// Object rest: `[source]` → `[source, rest]`
    pub(crate) fn exec_copy_rest(&mut self) -> Result<(), VmError> {
        let source = self.stack.peek(0)?.clone();
        let rest = self.realm.new_object();
        self.copy_data_properties(&rest, &source)?;
        self.stack.push(Value::Object(rest));
        self.pc += 1;
        Ok(())
    }

    /// Copy the own enumerable properties of `source`. Null and undefined
    /// sources copy nothing.
    pub fn copy_data_properties(&mut self, target: &ObjectRef, source: &Value) -> Result<(), VmError> {
        if source.is_null_or_undefined() {
            return Ok(());
        }
        let source = self.to_object(source)?;
        for key in source.own_keys() {
            let Some(prop) = source.get_own_property(&key) else {
                continue;
            };
            if prop.enumerable {
                target.define_own_property(key, Property::data(prop.value), true)?;
            }
        }
        Ok(())
    }

    /// Destructuring a null or undefined value is a TypeError
    pub(crate) fn exec_check_object_coercible(&mut self) -> Result<(), VmError> {
        let top = self.stack.peek(0)?;
        if top.is_null_or_undefined() {
            let shown = top.clone().or_undefined();
            return Err(VmError::type_error(format!(
                "Cannot destructure '{}' as it is {}.",
                shown, shown
            )));
        }
        self.pc += 1;
        Ok(())
    }
}

/// A key already converted by `ToPropertyKey`
fn key_of_converted(value: Value) -> Result<PropertyKey, VmError> {
    match value {
        Value::String(s) => Ok(PropertyKey::String(s)),
        Value::Symbol(sym) => Ok(PropertyKey::Symbol(sym)),
        other => Ok(PropertyKey::String(other.primitive_to_string()?)),
    }
}
