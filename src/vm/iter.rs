//! for-in enumeration and the iterator protocol
//!
//! Both loop kinds keep their state on the VM's iterator stack so that an
//! abrupt exit from a guarded region can close whatever iterators the region
//! left open.

use super::Vm;
use crate::error::VmError;
use crate::object::{ObjectRef, PropertyKey};
use crate::prelude::*;
use crate::value::{CheapClone, JsSymbol, Value};

// ═══════════════════════════════════════════════════════════════════════════════
// for-in cursor
// ═══════════════════════════════════════════════════════════════════════════════

/// Lazy walk over the enumerable string keys of an object and its prototypes.
///
/// Keys are snapshotted one object at a time; a key deleted before the cursor
/// reaches it is skipped, and a key seen on an object shadows the same key
/// further up the chain whether or not it was enumerable.
pub struct EnumCursor {
    current: Option<ObjectRef>,
    pending: std::vec::IntoIter<PropertyKey>,
    visited: FxHashSet<PropertyKey>,
    /// Set when the object is the binding object of an active `with`
    unscopables: Option<(ObjectRef, JsSymbol)>,
}

impl EnumCursor {
    pub fn new(object: Option<ObjectRef>) -> Self {
        let pending = object
            .as_ref()
            .map(ObjectRef::own_keys)
            .unwrap_or_default()
            .into_iter();
        EnumCursor {
            current: object,
            pending,
            visited: FxHashSet::default(),
            unscopables: None,
        }
    }

    /// Skip names the object hides from `with` through `Symbol.unscopables`
    pub fn with_unscopables(mut self, object: ObjectRef, symbol: JsSymbol) -> Self {
        self.unscopables = Some((object, symbol));
        self
    }

    fn blocked(&self, key: &PropertyKey) -> bool {
        let Some((object, symbol)) = &self.unscopables else {
            return false;
        };
        match object.get(&PropertyKey::from(symbol.cheap_clone())) {
            Some(Value::Object(blocked)) => blocked.get(key).is_some_and(|v| v.to_boolean()),
            _ => false,
        }
    }

    /// Next enumerable key, `None` once the chain is exhausted
    pub fn next_key(&mut self) -> Option<PropertyKey> {
        loop {
            let current = self.current.clone()?;
            let Some(key) = self.pending.next() else {
                self.current = current.prototype();
                self.pending = self
                    .current
                    .as_ref()
                    .map(ObjectRef::own_keys)
                    .unwrap_or_default()
                    .into_iter();
                continue;
            };
            if key.is_symbol() || !self.visited.insert(key.clone()) {
                continue;
            }
            match current.get_own_property(&key) {
                Some(prop) if prop.enumerable && !self.blocked(&key) => return Some(key),
                _ => continue,
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Iterator records
// ═══════════════════════════════════════════════════════════════════════════════

/// An iterator object together with its cached `next` method
#[derive(Clone)]
pub struct IteratorRecord {
    iterator: Value,
    next: Value,
    done: bool,
}

impl IteratorRecord {
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn parts(&self) -> (&Value, &Value) {
        (&self.iterator, &self.next)
    }

    /// Advance the iterator. `Ok(None)` once it reports done; a failing
    /// `next` also marks the record done.
    pub fn step(&mut self, vm: &mut Vm) -> Result<Option<Value>, VmError> {
        if self.done {
            return Ok(None);
        }
        let result = match vm.call_value(&self.next, self.iterator.clone(), &[]) {
            Ok(result) => result,
            Err(e) => {
                self.done = true;
                return Err(e);
            }
        };
        let result = match result {
            Value::Object(obj) => obj,
            other => {
                self.done = true;
                return Err(VmError::type_error(format!(
                    "Iterator result {} is not an object",
                    other
                )));
            }
        };
        if result
            .get(&PropertyKey::from("done"))
            .is_some_and(|d| d.to_boolean())
        {
            self.done = true;
            return Ok(None);
        }
        Ok(Some(
            result.get(&PropertyKey::from("value")).unwrap_or_default(),
        ))
    }

    /// Call the iterator's `return` method unless it already finished.
    /// Closing twice is a no-op.
    pub fn close(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        let method = vm.get_property(&self.iterator, &PropertyKey::from("return"))?;
        let Some(method) = method.filter(|m| !m.is_null_or_undefined()) else {
            return Ok(());
        };
        let result = vm.call_value(&method, self.iterator.clone(), &[])?;
        if !matches!(result, Value::Object(_)) {
            return Err(VmError::type_error(format!(
                "Iterator result {} is not an object",
                result
            )));
        }
        Ok(())
    }
}

/// What an iterator stack entry walks
pub enum IterSource {
    Enumerate(EnumCursor),
    Iterator(IteratorRecord),
}

/// Iterator stack entry: the loop's source and its current value
pub struct IterStackItem {
    pub value: Value,
    pub source: IterSource,
}

impl Vm {
    // ═══════════════════════════════════════════════════════════════════════════
    // Helpers
    // ═══════════════════════════════════════════════════════════════════════════

    /// GetIterator via `Symbol.iterator`
    pub fn get_iterator(&mut self, iterable: &Value) -> Result<IteratorRecord, VmError> {
        let key = PropertyKey::from(self.realm.symbols.iterator.cheap_clone());
        let method = match iterable {
            Value::Undefined | Value::Null => None,
            other => self.get_property(other, &key)?,
        };
        let method = match method {
            Some(Value::Object(m)) if m.is_callable() => Value::Object(m),
            _ => {
                return Err(VmError::type_error(format!("{} is not iterable", iterable)));
            }
        };
        let iterator = self.call_value(&method, iterable.clone(), &[])?;
        if !matches!(iterator, Value::Object(_)) {
            return Err(VmError::type_error(
                "Result of the Symbol.iterator method is not an object",
            ));
        }
        let next = self
            .get_property(&iterator, &PropertyKey::from("next"))?
            .unwrap_or_default();
        Ok(IteratorRecord {
            iterator,
            next,
            done: false,
        })
    }

    /// Feed every item of `iterable` to `f`. The iterator is closed when `f`
    /// fails; the failure of `f` wins over a failing close unless the close
    /// is uncatchable.
    pub fn for_each_item<F>(&mut self, iterable: &Value, mut f: F) -> Result<(), VmError>
    where
        F: FnMut(&mut Vm, Value) -> Result<(), VmError>,
    {
        let mut record = self.get_iterator(iterable)?;
        while let Some(item) = record.step(self)? {
            if let Err(err) = f(self, item) {
                if let Err(close_err) = record.close(self) {
                    tracing::warn!(error = %close_err, "iterator close failed");
                    if close_err.is_uncatchable() && !err.is_uncatchable() {
                        return Err(close_err);
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) fn pop_iter(&mut self) -> Result<IterStackItem, VmError> {
        self.iter_stack
            .pop()
            .ok_or_else(|| VmError::internal("iterator stack underflow"))
    }

    fn top_iter(&mut self) -> Result<&mut IterStackItem, VmError> {
        self.iter_stack
            .last_mut()
            .ok_or_else(|| VmError::internal("iterator stack underflow"))
    }

    /// Whether `obj` is the binding object of a `with` on the scope chain
    fn is_active_with_object(&self, obj: &ObjectRef) -> bool {
        let mut current = Some(self.stash.clone());
        while let Some(stash) = current {
            let s = stash.borrow();
            if s.obj.as_ref().is_some_and(|o| o.ptr_eq(obj)) {
                return true;
            }
            current = s.outer.clone();
        }
        false
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // for-in
    // ═══════════════════════════════════════════════════════════════════════════

    pub(crate) fn exec_enumerate(&mut self) -> Result<(), VmError> {
        let value = self.stack.pop()?;
        let cursor = if value.is_null_or_undefined() {
            EnumCursor::new(None)
        } else {
            let obj = self.to_object(&value)?;
            let cursor = EnumCursor::new(Some(obj.cheap_clone()));
            if self.is_active_with_object(&obj) {
                cursor.with_unscopables(obj, self.realm.symbols.unscopables.cheap_clone())
            } else {
                cursor
            }
        };
        self.iter_stack.push(IterStackItem {
            value: Value::Undefined,
            source: IterSource::Enumerate(cursor),
        });
        self.pc += 1;
        Ok(())
    }

    /// Advance the for-in cursor, or jump by `offset` when it is exhausted
    pub(crate) fn exec_enum_next(&mut self, offset: i32) -> Result<(), VmError> {
        let item = self.top_iter()?;
        let IterSource::Enumerate(cursor) = &mut item.source else {
            return Err(VmError::internal("EnumNext on an iterator record"));
        };
        match cursor.next_key() {
            Some(key) => {
                item.value = key.to_value();
                self.pc += 1;
                Ok(())
            }
            None => self.jump(offset),
        }
    }

    /// Push the current value of the innermost loop
    pub(crate) fn exec_enum_get(&mut self) -> Result<(), VmError> {
        let value = self.top_iter()?.value.clone();
        self.stack.push(value);
        self.pc += 1;
        Ok(())
    }

    /// Pop the innermost loop, closing an iterator that did not finish
    pub(crate) fn exec_enum_pop_close(&mut self) -> Result<(), VmError> {
        let item = self.pop_iter()?;
        if let IterSource::Iterator(mut record) = item.source {
            record.close(self)?;
        }
        self.pc += 1;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // for-of and destructuring
    // ═══════════════════════════════════════════════════════════════════════════

    /// Open an iterator over the top value, popping it when `pop` is set
    pub(crate) fn exec_iterate(&mut self, pop: bool) -> Result<(), VmError> {
        let iterable = if pop {
            self.stack.pop()?
        } else {
            self.stack.peek(0)?.clone()
        };
        let record = self.get_iterator(&iterable)?;
        self.iter_stack.push(IterStackItem {
            value: Value::Undefined,
            source: IterSource::Iterator(record),
        });
        self.pc += 1;
        Ok(())
    }

    /// Step the innermost iterator out of the stack. An error leaves the
    /// record popped and unclosed.
    fn step_top_iterator(&mut self) -> Result<(IterStackItem, Option<Value>), VmError> {
        let mut item = self.pop_iter()?;
        let IterSource::Iterator(record) = &mut item.source else {
            return Err(VmError::internal("iterator step on a for-in cursor"));
        };
        let next = record.step(self)?;
        Ok((item, next))
    }

    /// Store the next item as the loop value, or jump by `offset` when done
    pub(crate) fn exec_iter_next(&mut self, offset: i32) -> Result<(), VmError> {
        let (mut item, next) = self.step_top_iterator()?;
        match next {
            Some(value) => {
                item.value = value;
                self.iter_stack.push(item);
                self.pc += 1;
                Ok(())
            }
            None => {
                self.iter_stack.push(item);
                self.jump(offset)
            }
        }
    }

    /// Destructuring step: push the next item, or undefined once exhausted
    pub(crate) fn exec_iter_get_next_or_undef(&mut self) -> Result<(), VmError> {
        let (item, next) = self.step_top_iterator()?;
        self.iter_stack.push(item);
        self.stack.push(next.unwrap_or_default());
        self.pc += 1;
        Ok(())
    }

    /// Collect what is left of the innermost iterator into an array
    pub(crate) fn exec_new_array_from_iter(&mut self) -> Result<(), VmError> {
        let item = self.pop_iter()?;
        let IterSource::Iterator(mut record) = item.source else {
            return Err(VmError::internal("array rest on a for-in cursor"));
        };
        let mut values = Vec::new();
        while let Some(value) = record.step(self)? {
            values.push(value);
        }
        let array = self.realm.new_array(values);
        self.stack.push(Value::Object(array));
        self.pc += 1;
        Ok(())
    }
}
