//! Scope records and references
//!
//! A [`Stash`] holds the bindings of one scope that outlive the operand
//! stack: captured variables, the function scope of code that uses `eval`
//! or `arguments`, and `with` scopes (which wrap an object instead of slots).
//! Stashes form a chain through `outer` ending at the global stash.
//!
//! A [`Reference`] is a resolved assignment target pushed on the reference
//! stack by the `Resolve*` instructions and consumed by `GetValue`,
//! `PutValue` and `InitValueP`.

use super::Vm;
use super::stack::ValueStack;
use crate::bytecode::{
    BindingKind, FuncBodyEntry, FuncEntry, FuncEntry1, GlobalBindings, MixedLoad, MixedResolve,
    MixedStackLoad, MixedStackResolve, ScopeLayout, ScopeNames, SlotInfo, StashIndex, VarBindings,
};
use crate::error::VmError;
use crate::object::{ObjectRef, Property, PropertyKey};
use crate::prelude::*;
use crate::value::{CheapClone, JsString, JsSymbol, Value};

/// Shared handle to a scope record
pub type StashRef = Rc<RefCell<Stash>>;

// ═══════════════════════════════════════════════════════════════════════════════
// Stash
// ═══════════════════════════════════════════════════════════════════════════════

/// A scope record
#[derive(Default)]
pub struct Stash {
    /// Slot values. `Value::Empty` marks an uninitialised let/const.
    pub values: Vec<Value>,
    /// Arguments beyond the declared parameters
    pub extra_args: Vec<Value>,
    /// Name → slot map for dynamic lookups. Shared with the layout until
    /// a binding is added or removed.
    pub names: Option<Rc<ScopeNames>>,
    /// Target object of a `with` scope
    pub obj: Option<ObjectRef>,
    pub outer: Option<StashRef>,
    /// Function-level (or global) scope: the target of `var` declarations
    pub variable: bool,
}

impl Stash {
    pub fn new(outer: Option<StashRef>) -> Self {
        Stash {
            outer,
            ..Stash::default()
        }
    }

    /// A record with `size` empty slots
    pub fn with_layout(outer: Option<StashRef>, size: u32, names: Option<Rc<ScopeNames>>) -> Self {
        Stash {
            values: vec![Value::Empty; size as usize],
            names,
            outer,
            ..Stash::default()
        }
    }

    /// A `with` scope over `obj`
    pub fn for_object(obj: ObjectRef, outer: Option<StashRef>) -> Self {
        Stash {
            obj: Some(obj),
            outer,
            ..Stash::default()
        }
    }

    pub fn into_ref(self) -> StashRef {
        Rc::new(RefCell::new(self))
    }

    pub fn slot(&self, name: &JsString) -> Option<SlotInfo> {
        self.names.as_ref()?.get(name).copied()
    }

    /// Name of the slot at `index`, for error messages
    pub fn name_of(&self, index: u32) -> Option<JsString> {
        self.names
            .as_ref()?
            .iter()
            .find(|(_, info)| info.index == index)
            .map(|(name, _)| name.cheap_clone())
    }

    fn names_mut(&mut self) -> &mut ScopeNames {
        Rc::make_mut(self.names.get_or_insert_with(Default::default))
    }

    /// Look a name up in this record only. `Ok(None)` when it is not bound here.
    pub fn get_by_name(
        &self,
        name: &JsString,
        unscopables: &JsSymbol,
    ) -> Result<Option<Value>, VmError> {
        if let Some(obj) = &self.obj {
            if stash_obj_has(obj, name, unscopables) {
                return Ok(Some(obj.get(&PropertyKey::from(name)).unwrap_or_default()));
            }
            return Ok(None);
        }
        let Some(info) = self.slot(name) else {
            return Ok(None);
        };
        let value = self
            .values
            .get(info.index as usize)
            .cloned()
            .unwrap_or_default();
        read_binding(name, info.kind, value).map(Some)
    }

    /// Add a `var` binding initialised to undefined unless the name is already bound
    pub fn create_binding(&mut self, name: &JsString, deletable: bool) {
        if self.slot(name).is_some() {
            return;
        }
        let index = self.values.len() as u32;
        self.values.push(Value::Undefined);
        self.names_mut()
            .insert(name.cheap_clone(), SlotInfo::new(index, BindingKind::Var { deletable }));
    }

    /// Add an uninitialised let/const binding
    pub fn create_lex_binding(&mut self, name: &JsString, is_const: bool) {
        if self.slot(name).is_some() {
            return;
        }
        let index = self.values.len() as u32;
        self.values.push(Value::Empty);
        let kind = if is_const {
            BindingKind::Const { strict: true }
        } else {
            BindingKind::Let
        };
        self.names_mut()
            .insert(name.cheap_clone(), SlotInfo::new(index, kind));
    }

    /// Forget a binding. The slot itself is left in place.
    pub fn delete_binding(&mut self, name: &JsString) {
        if self.slot(name).is_some() {
            self.names_mut().remove(name);
        }
    }

    /// Initialise a named binding of this record
    pub fn init_by_name(&mut self, name: &JsString, value: Value) -> Result<(), VmError> {
        let info = self
            .slot(name)
            .ok_or_else(|| VmError::reference_error(name.cheap_clone()))?;
        let slot = self
            .values
            .get_mut(info.index as usize)
            .ok_or_else(|| VmError::internal(format!("no slot for binding '{}'", name)))?;
        *slot = value;
        Ok(())
    }
}

/// Whether a `with` object provides `name`, honouring `Symbol.unscopables`
pub(crate) fn stash_obj_has(obj: &ObjectRef, name: &JsString, unscopables: &JsSymbol) -> bool {
    let key = PropertyKey::from(name);
    if !obj.has_property(&key) {
        return false;
    }
    if let Some(Value::Object(blocked)) = obj.get(&PropertyKey::from(unscopables.cheap_clone())) {
        if let Some(flag) = blocked.get(&key) {
            return !flag.to_boolean();
        }
    }
    true
}

/// Resolve `name` in a single record
pub(crate) fn get_ref_by_name(
    stash: &StashRef,
    name: &JsString,
    strict: bool,
    unscopables: &JsSymbol,
) -> Option<Reference> {
    let s = stash.borrow();
    if let Some(obj) = &s.obj {
        if stash_obj_has(obj, name, unscopables) {
            return Some(Reference::Object {
                base: obj.cheap_clone(),
                key: PropertyKey::from(name),
                strict,
                binding: true,
            });
        }
        return None;
    }
    let info = s.slot(name)?;
    Some(Reference::Stash {
        name: name.cheap_clone(),
        stash: stash.clone(),
        index: info.index as usize,
        kind: fold_strict(info.kind, strict),
    })
}

fn fold_strict(kind: BindingKind, strict: bool) -> BindingKind {
    match kind {
        BindingKind::Const { strict: s } => BindingKind::Const { strict: strict || s },
        other => other,
    }
}

/// Value read from a binding slot. Empty var slots read as undefined.
fn read_binding(name: &JsString, kind: BindingKind, value: Value) -> Result<Value, VmError> {
    match value {
        Value::Empty if kind.is_lexical() => Err(VmError::uninitialized(Some(name.cheap_clone()))),
        Value::Empty => Ok(Value::Undefined),
        v => Ok(v),
    }
}

/// Whether an assignment to a binding holding `current` should be stored
fn check_assignment(name: &JsString, kind: BindingKind, current: &Value) -> Result<bool, VmError> {
    match kind {
        BindingKind::Var { .. } => Ok(true),
        _ if current.is_empty() => Err(VmError::uninitialized(Some(name.cheap_clone()))),
        BindingKind::Let => Ok(true),
        BindingKind::Const { strict: true } => {
            Err(VmError::type_error("Assignment to constant variable."))
        }
        BindingKind::Const { strict: false } => Ok(false),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// References
// ═══════════════════════════════════════════════════════════════════════════════

/// A resolved assignment target
#[derive(Clone)]
pub enum Reference {
    /// Operand stack slot of the current frame
    Stack {
        name: JsString,
        index: usize,
        kind: BindingKind,
    },
    Stash {
        name: JsString,
        stash: StashRef,
        index: usize,
        kind: BindingKind,
    },
    /// Property of an object. `binding` marks a name resolved through a
    /// `with` object or the global object rather than a member expression.
    Object {
        base: ObjectRef,
        key: PropertyKey,
        strict: bool,
        binding: bool,
    },
    /// A name that did not resolve; every access raises a ReferenceError
    Unresolved { name: JsString },
}

impl Reference {
    pub fn name(&self) -> JsString {
        match self {
            Reference::Stack { name, .. }
            | Reference::Stash { name, .. }
            | Reference::Unresolved { name } => name.cheap_clone(),
            Reference::Object { key, .. } => JsString::from(key.to_string()),
        }
    }

    /// Current value. `Ok(None)` when a name binding vanished from its object.
    pub(crate) fn get(&self, stack: &ValueStack) -> Result<Option<Value>, VmError> {
        match self {
            Reference::Stack { name, index, kind } => {
                let value = stack.get(*index)?.clone();
                read_binding(name, *kind, value).map(Some)
            }
            Reference::Stash {
                name,
                stash,
                index,
                kind,
            } => {
                let value = stash.borrow().values.get(*index).cloned().unwrap_or_default();
                read_binding(name, *kind, value).map(Some)
            }
            Reference::Object {
                base, key, binding, ..
            } => match base.get(key) {
                Some(v) => Ok(Some(v)),
                None if *binding => Ok(None),
                None => Ok(Some(Value::Undefined)),
            },
            Reference::Unresolved { name } => Err(VmError::reference_error(name.cheap_clone())),
        }
    }

    pub(crate) fn set(&self, stack: &mut ValueStack, value: Value) -> Result<(), VmError> {
        match self {
            Reference::Stack { name, index, kind } => {
                if check_assignment(name, *kind, stack.get(*index)?)? {
                    stack.set(*index, value)?;
                }
                Ok(())
            }
            Reference::Stash {
                name,
                stash,
                index,
                kind,
            } => {
                let mut s = stash.borrow_mut();
                let slot = s
                    .values
                    .get_mut(*index)
                    .ok_or_else(|| VmError::internal(format!("no slot for binding '{}'", name)))?;
                if check_assignment(name, *kind, slot)? {
                    *slot = value;
                }
                Ok(())
            }
            Reference::Object {
                base,
                key,
                strict,
                binding,
            } => {
                if *binding && *strict && !base.has_own_property(key) {
                    return Err(VmError::reference_error(key.to_string()));
                }
                base.set_own(key, value, *strict)?;
                Ok(())
            }
            Reference::Unresolved { name } => Err(VmError::reference_error(name.cheap_clone())),
        }
    }

    /// Initialise the target, bypassing let/const checks
    pub(crate) fn init(&self, stack: &mut ValueStack, value: Value) -> Result<(), VmError> {
        match self {
            Reference::Stack { index, .. } => stack.set(*index, value),
            Reference::Stash {
                name, stash, index, ..
            } => {
                let mut s = stash.borrow_mut();
                let slot = s
                    .values
                    .get_mut(*index)
                    .ok_or_else(|| VmError::internal(format!("no slot for binding '{}'", name)))?;
                *slot = value;
                Ok(())
            }
            Reference::Object {
                base, key, strict, ..
            } => base.set_own(key, value, *strict).map(|_| ()),
            Reference::Unresolved { name } => Err(VmError::reference_error(name.cheap_clone())),
        }
    }
}

fn already_declared(name: &JsString) -> VmError {
    VmError::syntax_error(format!("Identifier '{}' has already been declared", name))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scope instructions
// ═══════════════════════════════════════════════════════════════════════════════

impl Vm {
    pub(crate) fn frame_base(&self) -> Result<usize, VmError> {
        self.sb
            .ok_or_else(|| VmError::internal("stack slot access outside a function frame"))
    }

    /// Absolute index of a frame slot. `None` for an argument that was not passed.
    fn stack_slot(&self, index: i32, args_in_stash: bool) -> Result<Option<usize>, VmError> {
        let sb = self.frame_base()?;
        Ok(match index {
            i if i > 0 && args_in_stash => Some(sb + i as usize),
            i if i > 0 => Some(sb + self.args + i as usize),
            0 => Some(sb),
            i => {
                let arg = i.unsigned_abs() as usize;
                if arg > self.args { None } else { Some(sb + arg) }
            }
        })
    }

    fn read_stack_slot(
        &self,
        index: i32,
        args_in_stash: bool,
        lexical: bool,
        name: Option<&JsString>,
    ) -> Result<Value, VmError> {
        let Some(idx) = self.stack_slot(index, args_in_stash)? else {
            return Ok(Value::Undefined);
        };
        match self.stack.get(idx)? {
            Value::Empty if lexical => Err(VmError::uninitialized(name.cloned())),
            Value::Empty => Ok(Value::Undefined),
            v => Ok(v.clone()),
        }
    }

    pub(crate) fn exec_load_stack(
        &mut self,
        index: i32,
        args_in_stash: bool,
        lexical: bool,
    ) -> Result<(), VmError> {
        let value = self.read_stack_slot(index, args_in_stash, lexical, None)?;
        self.stack.push(value);
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_store_stack(
        &mut self,
        index: i32,
        args_in_stash: bool,
        lexical: bool,
        pop: bool,
    ) -> Result<(), VmError> {
        if index == 0 {
            return Err(VmError::internal("illegal store into the receiver slot"));
        }
        let idx = self
            .stack_slot(index, args_in_stash)?
            .ok_or_else(|| VmError::internal("store into a missing argument slot"))?;
        if lexical && self.stack.get(idx)?.is_empty() {
            return Err(VmError::uninitialized(None));
        }
        let value = if pop {
            self.stack.pop()?
        } else {
            self.stack.peek(0)?.clone()
        };
        self.stack.set(idx, value)?;
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_init_stack(&mut self, index: i32, args_in_stash: bool) -> Result<(), VmError> {
        let idx = self
            .stack_slot(index, args_in_stash)?
            .ok_or_else(|| VmError::internal("init of a missing argument slot"))?;
        let value = self.stack.pop()?;
        self.stack.set(idx, value)?;
        self.pc += 1;
        Ok(())
    }

    /// The record `level` links out from the current one
    pub(crate) fn stash_at(&self, level: u32) -> Result<StashRef, VmError> {
        let mut stash = self.stash.clone();
        for _ in 0..level {
            let outer = stash
                .borrow()
                .outer
                .clone()
                .ok_or_else(|| VmError::internal("scope level out of range"))?;
            stash = outer;
        }
        Ok(stash)
    }

    fn read_stash_slot(stash: &StashRef, index: u32, lexical: bool) -> Result<Value, VmError> {
        let s = stash.borrow();
        let value = s
            .values
            .get(index as usize)
            .ok_or_else(|| VmError::internal(format!("stash slot {} out of range", index)))?;
        match value {
            Value::Empty if lexical => Err(VmError::uninitialized(s.name_of(index))),
            Value::Empty => Ok(Value::Undefined),
            v => Ok(v.clone()),
        }
    }

    pub(crate) fn exec_load_stash(&mut self, at: StashIndex, lexical: bool) -> Result<(), VmError> {
        let stash = self.stash_at(at.level)?;
        let value = Self::read_stash_slot(&stash, at.index, lexical)?;
        self.stack.push(value);
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_store_stash(
        &mut self,
        at: StashIndex,
        lexical: bool,
        pop: bool,
    ) -> Result<(), VmError> {
        let stash = self.stash_at(at.level)?;
        let value = if pop {
            self.stack.pop()?
        } else {
            self.stack.peek(0)?.clone()
        };
        let mut s = stash.borrow_mut();
        let uninitialized = lexical
            && s
                .values
                .get(at.index as usize)
                .is_some_and(Value::is_empty);
        if uninitialized {
            return Err(VmError::uninitialized(s.name_of(at.index)));
        }
        let slot = s
            .values
            .get_mut(at.index as usize)
            .ok_or_else(|| VmError::internal(format!("stash slot {} out of range", at.index)))?;
        *slot = value;
        drop(s);
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_init_stash(&mut self, at: StashIndex) -> Result<(), VmError> {
        let stash = self.stash_at(at.level)?;
        let value = self.stack.pop()?;
        let mut s = stash.borrow_mut();
        let slot = s
            .values
            .get_mut(at.index as usize)
            .ok_or_else(|| VmError::internal(format!("stash slot {} out of range", at.index)))?;
        *slot = value;
        drop(s);
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_init_global(&mut self, name: &JsString) -> Result<(), VmError> {
        let value = self.stack.pop()?;
        self.realm
            .global_stash
            .borrow_mut()
            .init_by_name(name, value)?;
        self.pc += 1;
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Mixed (dynamic then fixed) lookups
    // ───────────────────────────────────────────────────────────────────────────

    /// Scan `level` records by name. On a hit returns the value and the
    /// receiver of the record that provided it. Also returns the record
    /// reached after the scan.
    fn scan_dynamic(
        &self,
        name: &JsString,
        level: u32,
    ) -> Result<(Option<(Value, Value)>, StashRef), VmError> {
        let unscopables = self.realm.symbols.unscopables.cheap_clone();
        let mut stash = self.stash.clone();
        for _ in 0..level {
            let found = stash.borrow().get_by_name(name, &unscopables)?;
            if let Some(value) = found {
                let receiver = stash
                    .borrow()
                    .obj
                    .clone()
                    .map(Value::Object)
                    .unwrap_or_default();
                return Ok((Some((value, receiver)), stash));
            }
            let outer = stash
                .borrow()
                .outer
                .clone()
                .ok_or_else(|| VmError::internal("scope level out of range"))?;
            stash = outer;
        }
        Ok((None, stash))
    }

    pub(crate) fn exec_load_mixed(&mut self, m: &MixedLoad) -> Result<(), VmError> {
        let (found, stash) = self.scan_dynamic(&m.name, m.level)?;
        let (value, receiver) = match found {
            Some(hit) => hit,
            None => {
                let s = stash.borrow();
                let value = s
                    .values
                    .get(m.index as usize)
                    .cloned()
                    .ok_or_else(|| VmError::internal(format!("stash slot {} out of range", m.index)))?;
                let value = match value {
                    Value::Empty if m.lexical => {
                        return Err(VmError::uninitialized(Some(m.name.cheap_clone())));
                    }
                    v => v.or_undefined(),
                };
                (value, Value::Undefined)
            }
        };
        if m.callee {
            self.stack.push(receiver);
        }
        self.stack.push(value);
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_load_mixed_stack(&mut self, m: &MixedStackLoad) -> Result<(), VmError> {
        let (found, _) = self.scan_dynamic(&m.name, m.level)?;
        let (value, receiver) = match found {
            Some(hit) => hit,
            None => {
                let value =
                    self.read_stack_slot(m.index, m.args_in_stash, m.lexical, Some(&m.name))?;
                (value, Value::Undefined)
            }
        };
        if m.callee {
            self.stack.push(receiver);
        }
        self.stack.push(value);
        self.pc += 1;
        Ok(())
    }

    /// Scan `level` records for a reference to `name`
    fn scan_dynamic_ref(
        &self,
        name: &JsString,
        level: u32,
        strict: bool,
    ) -> Result<(Option<Reference>, StashRef), VmError> {
        let unscopables = self.realm.symbols.unscopables.cheap_clone();
        let mut stash = self.stash.clone();
        for _ in 0..level {
            if let Some(r) = get_ref_by_name(&stash, name, strict, &unscopables) {
                return Ok((Some(r), stash));
            }
            let outer = stash
                .borrow()
                .outer
                .clone()
                .ok_or_else(|| VmError::internal("scope level out of range"))?;
            stash = outer;
        }
        Ok((None, stash))
    }

    pub(crate) fn exec_resolve_mixed(&mut self, m: &MixedResolve) -> Result<(), VmError> {
        let (found, stash) = self.scan_dynamic_ref(&m.name, m.level, m.strict)?;
        let reference = found.unwrap_or_else(|| Reference::Stash {
            name: m.name.cheap_clone(),
            stash,
            index: m.index as usize,
            kind: fold_strict(m.kind, m.strict),
        });
        self.ref_stack.push(reference);
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_resolve_mixed_stack(&mut self, m: &MixedStackResolve) -> Result<(), VmError> {
        let (found, _) = self.scan_dynamic_ref(&m.name, m.level, m.strict)?;
        let reference = match found {
            Some(r) => r,
            None => Reference::Stack {
                name: m.name.cheap_clone(),
                index: self
                    .stack_slot(m.index, m.args_in_stash)?
                    .ok_or_else(|| VmError::internal("reference to a missing argument slot"))?,
                kind: fold_strict(m.kind, m.strict),
            },
        };
        self.ref_stack.push(reference);
        self.pc += 1;
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Fully dynamic names
    // ───────────────────────────────────────────────────────────────────────────

    pub(crate) fn exec_resolve_var(&mut self, name: &JsString, strict: bool) -> Result<(), VmError> {
        let unscopables = self.realm.symbols.unscopables.cheap_clone();
        let mut cursor = Some(self.stash.clone());
        while let Some(stash) = cursor {
            if let Some(r) = get_ref_by_name(&stash, name, strict, &unscopables) {
                self.ref_stack.push(r);
                self.pc += 1;
                return Ok(());
            }
            cursor = stash.borrow().outer.clone();
        }
        let global = self.realm.global_object.cheap_clone();
        let key = PropertyKey::from(name);
        let reference = if !strict || global.has_property(&key) {
            Reference::Object {
                base: global,
                key,
                strict,
                binding: true,
            }
        } else {
            Reference::Unresolved {
                name: name.cheap_clone(),
            }
        };
        self.ref_stack.push(reference);
        self.pc += 1;
        Ok(())
    }

    /// Value and receiver of a name looked up through the whole chain and
    /// then the global object
    pub(crate) fn lookup_dynamic(&self, name: &JsString) -> Result<Option<(Value, Value)>, VmError> {
        let unscopables = self.realm.symbols.unscopables.cheap_clone();
        let mut cursor = Some(self.stash.clone());
        while let Some(stash) = cursor {
            let s = stash.borrow();
            if let Some(value) = s.get_by_name(name, &unscopables)? {
                let receiver = s.obj.clone().map(Value::Object).unwrap_or_default();
                return Ok(Some((value, receiver)));
            }
            cursor = s.outer.clone();
        }
        Ok(self
            .realm
            .global_object
            .get(&PropertyKey::from(name))
            .map(|v| (v, Value::Undefined)))
    }

    pub(crate) fn exec_load_dynamic(&mut self, name: &JsString) -> Result<(), VmError> {
        let (value, _) = self
            .lookup_dynamic(name)?
            .ok_or_else(|| VmError::reference_error(name.cheap_clone()))?;
        self.stack.push(value);
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_load_dynamic_ref(&mut self, name: &JsString) -> Result<(), VmError> {
        let value = match self.lookup_dynamic(name)? {
            Some((value, _)) => value,
            None => Value::Unresolved {
                name: name.cheap_clone(),
                member: false,
            },
        };
        self.stack.push(value);
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_load_dynamic_callee(&mut self, name: &JsString) -> Result<(), VmError> {
        let (value, receiver) = self.lookup_dynamic(name)?.unwrap_or_else(|| {
            let unresolved = Value::Unresolved {
                name: name.cheap_clone(),
                member: false,
            };
            (unresolved, Value::Undefined)
        });
        self.stack.push(receiver);
        self.stack.push(value);
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_delete_var(&mut self, name: &JsString) -> Result<(), VmError> {
        let unscopables = self.realm.symbols.unscopables.cheap_clone();
        let key = PropertyKey::from(name);
        let mut cursor = Some(self.stash.clone());
        let mut result = None;
        while let Some(stash) = cursor {
            let obj = stash.borrow().obj.clone();
            if let Some(obj) = obj {
                if stash_obj_has(&obj, name, &unscopables) {
                    result = Some(obj.delete(&key, false)?);
                    break;
                }
            } else {
                let slot = stash.borrow().slot(name);
                if let Some(info) = slot {
                    let deletable = matches!(info.kind, BindingKind::Var { deletable: true });
                    if deletable {
                        stash.borrow_mut().delete_binding(name);
                    }
                    result = Some(deletable);
                    break;
                }
            }
            cursor = stash.borrow().outer.clone();
        }
        let result = match result {
            Some(r) => r,
            None => {
                let global = &self.realm.global_object;
                if global.has_property(&key) {
                    global.delete(&key, false)?
                } else {
                    true
                }
            }
        };
        self.stack.push(Value::Bool(result));
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_delete_global(&mut self, name: &JsString) -> Result<(), VmError> {
        let key = PropertyKey::from(name);
        let global = self.realm.global_object.cheap_clone();
        let result = if global.has_property(&key) {
            let deleted = global.delete(&key, false)?;
            if deleted {
                self.realm.var_names.remove(name);
            }
            deleted
        } else {
            true
        };
        self.stack.push(Value::Bool(result));
        self.pc += 1;
        Ok(())
    }

    /// Assign a global name: lexical globals first, then the global object
    pub(crate) fn set_global(&mut self, name: &JsString, value: Value, strict: bool) -> Result<(), VmError> {
        let unscopables = self.realm.symbols.unscopables.cheap_clone();
        let global_stash = self.realm.global_stash.clone();
        if let Some(r) = get_ref_by_name(&global_stash, name, strict, &unscopables) {
            return r.set(&mut self.stack, value);
        }
        let global = &self.realm.global_object;
        let key = PropertyKey::from(name);
        if strict && !global.has_own_property(&key) {
            return Err(VmError::reference_error(name.cheap_clone()));
        }
        global.set_own(&key, value, strict)?;
        Ok(())
    }

    pub(crate) fn exec_set_global(&mut self, name: &JsString, strict: bool) -> Result<(), VmError> {
        let value = self.stack.peek(0)?.clone();
        self.set_global(name, value, strict)?;
        self.pc += 1;
        Ok(())
    }

    fn top_ref(&self) -> Result<&Reference, VmError> {
        self.ref_stack
            .last()
            .ok_or_else(|| VmError::internal("reference stack underflow"))
    }

    fn pop_ref(&mut self) -> Result<Reference, VmError> {
        self.ref_stack
            .pop()
            .ok_or_else(|| VmError::internal("reference stack underflow"))
    }

    pub(crate) fn exec_get_value(&mut self) -> Result<(), VmError> {
        let reference = self.top_ref()?;
        let value = reference
            .get(&self.stack)?
            .ok_or_else(|| VmError::reference_error(reference.name()))?;
        self.stack.push(value);
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_put_value(&mut self, pop: bool) -> Result<(), VmError> {
        let reference = self.pop_ref()?;
        let value = if pop {
            self.stack.pop()?
        } else {
            self.stack.peek(0)?.clone()
        };
        reference.set(&mut self.stack, value)?;
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_init_value(&mut self) -> Result<(), VmError> {
        let reference = self.pop_ref()?;
        let value = self.stack.pop()?;
        reference.init(&mut self.stack, value)?;
        self.pc += 1;
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Declaration instantiation
    // ───────────────────────────────────────────────────────────────────────────

    fn check_global_funcs(&self, names: &[JsString]) -> Result<(), VmError> {
        let global = &self.realm.global_object;
        let stash = self.realm.global_stash.borrow();
        for name in names {
            if stash.slot(name).is_some() {
                return Err(already_declared(name));
            }
            let allowed = match global.get_own_property(&PropertyKey::from(name)) {
                None => global.is_extensible(),
                Some(prop) if !prop.configurable => prop.writable && prop.enumerable,
                Some(_) => true,
            };
            if !allowed {
                return Err(VmError::type_error(format!(
                    "Cannot redefine global function '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    fn check_global_lex(&self, names: &[JsString]) -> Result<(), VmError> {
        let global = &self.realm.global_object;
        let stash = self.realm.global_stash.borrow();
        for name in names {
            let conflicting = self.realm.var_names.contains(name)
                || stash.slot(name).is_some()
                || global
                    .get_own_property(&PropertyKey::from(name))
                    .is_some_and(|p| !p.configurable);
            if conflicting {
                return Err(already_declared(name));
            }
        }
        Ok(())
    }

    fn check_global_vars(&self, names: &[JsString]) -> Result<(), VmError> {
        let global = &self.realm.global_object;
        let extensible = global.is_extensible();
        let stash = self.realm.global_stash.borrow();
        for name in names {
            if !extensible && !global.has_own_property(&PropertyKey::from(name)) {
                return Err(VmError::type_error(format!(
                    "Cannot define global variable '{}', global object is not extensible",
                    name
                )));
            }
            if stash.slot(name).is_some() {
                return Err(already_declared(name));
            }
        }
        Ok(())
    }

    pub(crate) fn exec_bind_global(&mut self, b: &GlobalBindings) -> Result<(), VmError> {
        self.check_global_funcs(&b.funcs)?;
        self.check_global_lex(&b.lets)?;
        self.check_global_lex(&b.consts)?;
        self.check_global_vars(&b.vars)?;

        {
            let mut stash = self.realm.global_stash.borrow_mut();
            for name in &b.lets {
                stash.create_lex_binding(name, false);
            }
            for name in &b.consts {
                stash.create_lex_binding(name, true);
            }
        }

        let global = self.realm.global_object.cheap_clone();
        let values = self.stack.pop_n(b.funcs.len())?;
        for (name, value) in b.funcs.iter().zip(values) {
            let key = PropertyKey::from(name);
            let prop = match global.get_own_property(&key) {
                Some(cur) if !cur.configurable => {
                    Property::with_attributes(value, cur.writable, cur.enumerable, false)
                }
                _ => Property::with_attributes(value, true, true, b.deletable),
            };
            global.define_own_property(key, prop, true)?;
            self.realm.var_names.insert(name.cheap_clone());
        }

        for name in &b.vars {
            let key = PropertyKey::from(name);
            if !global.has_own_property(&key) && global.is_extensible() {
                global.define_own_property(
                    key,
                    Property::with_attributes(Value::Undefined, true, true, b.deletable),
                    true,
                )?;
            }
            self.realm.var_names.insert(name.cheap_clone());
        }
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_bind_vars(&mut self, b: &VarBindings) -> Result<(), VmError> {
        let mut target = None;
        for name in &b.names {
            let mut cursor = Some(self.stash.clone());
            while let Some(stash) = cursor {
                let s = stash.borrow();
                if s.slot(name).is_some_and(|info| info.kind.is_lexical()) {
                    return Err(already_declared(name));
                }
                if s.variable {
                    drop(s);
                    target = Some(stash);
                    break;
                }
                cursor = s.outer.clone();
            }
        }
        let target = target.unwrap_or_else(|| self.stash.clone());
        let mut t = target.borrow_mut();
        for name in &b.names {
            t.create_binding(name, b.deletable);
        }
        drop(t);
        self.pc += 1;
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Function and block entry
    // ───────────────────────────────────────────────────────────────────────────

    fn enter_stash(&mut self, stash: Stash) {
        self.stash = stash.into_ref();
        self.stash_allocs += 1;
    }

    /// Set the stack base for a function whose arguments are on the stack
    fn begin_frame(&mut self) -> Result<usize, VmError> {
        let sp = self.stack.sp();
        let sb = sp
            .checked_sub(self.args + 1)
            .ok_or_else(|| VmError::internal("function entry without arguments on the stack"))?;
        self.sb = Some(sb);
        Ok(sp)
    }

    pub(crate) fn exec_enter_func(&mut self, e: &FuncEntry) -> Result<(), VmError> {
        let sp = self.begin_frame()?;
        let mut stash = Stash::with_layout(Some(self.stash.clone()), e.stash_size, e.names.clone());
        stash.variable = true;
        let num_args = e.num_args as usize;
        if e.args_to_stash {
            let args = self.stack.slice(sp - self.args, sp)?;
            for (slot, arg) in stash.values.iter_mut().zip(args) {
                *slot = arg.clone();
            }
            if self.args > num_args {
                stash.extra_args = args.get(num_args..).map(<[Value]>::to_vec).unwrap_or_default();
            } else if let Some(missing) = stash.values.get_mut(self.args..num_args) {
                missing.fill(Value::Undefined);
            }
            self.stack.set_sp(sp - self.args);
        } else if num_args > self.args {
            for _ in self.args..num_args {
                self.stack.push(Value::Undefined);
            }
            self.args = num_args;
        }
        self.enter_stash(stash);
        self.stack.reserve_slots(e.stack_size as usize);
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_enter_func1(&mut self, e: &FuncEntry1) -> Result<(), VmError> {
        let sp = self.begin_frame()?;
        let mut stash = Stash::with_layout(Some(self.stash.clone()), e.stash_size, e.names.clone());
        stash.variable = true;
        let args = self.stack.slice(sp - self.args, sp)?;
        let to_copy = e.args_to_copy as usize;
        let num_args = e.num_args as usize;
        for (slot, arg) in stash.values.iter_mut().zip(args.iter().take(to_copy)) {
            *slot = arg.clone();
        }
        if self.args > to_copy {
            if self.args > num_args {
                stash.extra_args = args.get(num_args..).map(<[Value]>::to_vec).unwrap_or_default();
            }
        } else if let Some(missing) = stash.values.get_mut(self.args..to_copy) {
            missing.fill(Value::Undefined);
        }
        self.enter_stash(stash);
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_enter_func_body(&mut self, e: &FuncBodyEntry) -> Result<(), VmError> {
        if e.layout.stash_size > 0 {
            let mut stash = Stash::with_layout(
                Some(self.stash.clone()),
                e.layout.stash_size,
                e.layout.names.clone(),
            );
            stash.variable = true;
            self.enter_stash(stash);
        }
        if e.adjust_stack {
            let sp = self
                .stack
                .sp()
                .checked_sub(self.args)
                .ok_or_else(|| VmError::internal("function body entry below the frame"))?;
            self.stack.set_sp(sp);
        }
        self.stack.reserve_slots(e.layout.stack_size as usize);
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_enter_func_stashless(
        &mut self,
        stack_size: u32,
        num_args: u32,
    ) -> Result<(), VmError> {
        self.begin_frame()?;
        let num_args = num_args as usize;
        if num_args > self.args {
            for _ in self.args..num_args {
                self.stack.push(Value::Undefined);
            }
            self.args = num_args;
        }
        self.stack.reserve_slots(stack_size as usize);
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_enter_block(&mut self, layout: &ScopeLayout) -> Result<(), VmError> {
        if layout.stash_size > 0 {
            let stash = Stash::with_layout(
                Some(self.stash.clone()),
                layout.stash_size,
                layout.names.clone(),
            );
            self.enter_stash(stash);
        }
        self.stack.reserve_slots(layout.stack_size as usize);
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_enter_catch_block(&mut self, layout: &ScopeLayout) -> Result<(), VmError> {
        let mut stash = Stash::with_layout(
            Some(self.stash.clone()),
            layout.stash_size.max(1),
            layout.names.clone(),
        );
        let caught = self.stack.pop()?;
        if let Some(slot) = stash.values.first_mut() {
            *slot = caught;
        }
        self.enter_stash(stash);
        self.stack.reserve_slots(layout.stack_size as usize);
        self.pc += 1;
        Ok(())
    }

    /// Make the outer record current
    pub(crate) fn leave_stash(&mut self) -> Result<(), VmError> {
        let outer = self
            .stash
            .borrow()
            .outer
            .clone()
            .ok_or_else(|| VmError::internal("left the outermost scope"))?;
        self.stash = outer;
        Ok(())
    }

    pub(crate) fn exec_leave_block(&mut self, stack_size: u32, pop_stash: bool) -> Result<(), VmError> {
        if pop_stash {
            self.leave_stash()?;
        }
        let sp = self
            .stack
            .sp()
            .checked_sub(stack_size as usize)
            .ok_or_else(|| VmError::internal("block exit below the frame"))?;
        self.stack.set_sp(sp);
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_copy_stash(&mut self) -> Result<(), VmError> {
        let copy = {
            let s = self.stash.borrow();
            Stash {
                values: s.values.clone(),
                names: s.names.clone(),
                outer: s.outer.clone(),
                ..Stash::default()
            }
        };
        self.enter_stash(copy);
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_enter_with(&mut self) -> Result<(), VmError> {
        let value = self.stack.pop()?;
        let obj = self.to_object(&value)?;
        let stash = Stash::for_object(obj, Some(self.stash.clone()));
        self.enter_stash(stash);
        self.pc += 1;
        Ok(())
    }

    /// Sloppy-mode receiver: undefined/null become the global object,
    /// primitives are wrapped
    pub(crate) fn exec_box_this(&mut self) -> Result<(), VmError> {
        let sb = self.frame_base()?;
        let this = self.stack.get(sb)?.clone();
        let boxed = match this {
            Value::Undefined | Value::Null => Value::Object(self.realm.global_object.cheap_clone()),
            Value::Object(_) => this,
            other => Value::Object(self.to_object(&other)?),
        };
        self.stack.set(sb, boxed)?;
        self.pc += 1;
        Ok(())
    }
}
