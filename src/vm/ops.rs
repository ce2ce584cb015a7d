//! Operators and type conversions
//!
//! Numbers are kept as integers while results stay exact: `Int` holds safe
//! integers, `Int64` holds exact 64-bit results past the safe range, and
//! everything else falls back to `Float`. The pure numeric helpers take
//! values that already went through ToNumber.

use super::Vm;
use crate::error::VmError;
use crate::object::{ObjectKind, ObjectRef, PropertyKey};
use crate::value::{
    CheapClone, JsString, Value, int_to_value, int64_to_value, numbers_equal, string_to_number,
    to_int32, to_uint32,
};

/// Preferred type for ToPrimitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    Default,
    Number,
    String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Numeric helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn f64_of(v: &Value) -> f64 {
    v.as_f64().unwrap_or(f64::NAN)
}

fn int_operands(l: &Value, r: &Value) -> Option<(i64, i64)> {
    match (l, r) {
        (Value::Int(a) | Value::Int64(a), Value::Int(b) | Value::Int64(b)) => Some((*a, *b)),
        _ => None,
    }
}

pub fn add_numbers(l: &Value, r: &Value) -> Value {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => int_to_value(a + b),
        _ => match int_operands(l, r) {
            Some((a, b)) => match a.checked_add(b) {
                Some(sum) => int64_to_value(sum),
                None => Value::Float(a as f64 + b as f64),
            },
            None => Value::Float(f64_of(l) + f64_of(r)),
        },
    }
}

pub fn sub_numbers(l: &Value, r: &Value) -> Value {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => int_to_value(a - b),
        _ => match int_operands(l, r) {
            Some((a, b)) => match a.checked_sub(b) {
                Some(diff) => int64_to_value(diff),
                None => Value::Float(a as f64 - b as f64),
            },
            None => Value::Float(f64_of(l) - f64_of(r)),
        },
    }
}

pub fn mul_numbers(l: &Value, r: &Value) -> Value {
    if let (Some(a), Some(b)) = (l.as_integer(), r.as_integer()) {
        if (a == 0 && b < 0) || (b == 0 && a < 0) {
            return Value::NEGATIVE_ZERO;
        }
        let product = a.wrapping_mul(b);
        if a == 0 || product.checked_div(a) == Some(b) {
            return int_to_value(product);
        }
    }
    Value::Float(f64_of(l) * f64_of(r))
}

pub fn div_numbers(l: &Value, r: &Value) -> Value {
    Value::Float(f64_of(l) / f64_of(r))
}

pub fn mod_numbers(l: &Value, r: &Value) -> Value {
    if let (Some(a), Some(b)) = (l.as_integer(), r.as_integer()) {
        if b == 0 {
            return Value::NAN;
        }
        match a.checked_rem(b) {
            Some(0) if a < 0 => return Value::NEGATIVE_ZERO,
            Some(rem) => return int_to_value(rem),
            None => {}
        }
    }
    Value::Float(f64_of(l) % f64_of(r))
}

pub fn neg_number(v: &Value) -> Value {
    match v {
        Value::Int(0) => Value::NEGATIVE_ZERO,
        Value::Int(i) => Value::Int(-i),
        Value::Int64(i) => match i.checked_neg() {
            Some(n) => int64_to_value(n),
            None => Value::Float(-(*i as f64)),
        },
        other => Value::Float(-f64_of(other)),
    }
}

pub fn inc_number(v: &Value) -> Value {
    match v {
        Value::Int(i) => int_to_value(i + 1),
        Value::Int64(i) => match i.checked_add(1) {
            Some(n) => int64_to_value(n),
            None => Value::Float(*i as f64 + 1.0),
        },
        other => Value::Float(f64_of(other) + 1.0),
    }
}

pub fn dec_number(v: &Value) -> Value {
    match v {
        Value::Int(i) => int_to_value(i - 1),
        Value::Int64(i) => match i.checked_sub(1) {
            Some(n) => int64_to_value(n),
            None => Value::Float(*i as f64 - 1.0),
        },
        other => Value::Float(f64_of(other) - 1.0),
    }
}

/// `l < r` on numbers; `None` when either is NaN
pub fn less_than_numbers(l: &Value, r: &Value) -> Option<bool> {
    if let Some((a, b)) = int_operands(l, r) {
        return Some(a < b);
    }
    let (a, b) = (f64_of(l), f64_of(r));
    if a.is_nan() || b.is_nan() {
        return None;
    }
    Some(a < b)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BitOp {
    And,
    Or,
    Xor,
    Sal,
    Sar,
    Shr,
}

pub(crate) fn bitwise(op: BitOp, l: &Value, r: &Value) -> Value {
    let a = to_int32(l);
    let shift = to_uint32(r) & 0x1F;
    match op {
        BitOp::And => Value::from(a & to_int32(r)),
        BitOp::Or => Value::from(a | to_int32(r)),
        BitOp::Xor => Value::from(a ^ to_int32(r)),
        BitOp::Sal => Value::from(a.wrapping_shl(shift)),
        BitOp::Sar => Value::from(a >> shift),
        BitOp::Shr => Value::from(to_uint32(l) >> shift),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Relation {
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arith {
    Sub,
    Mul,
    Div,
    Mod,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions and operators that may run script code
// ═══════════════════════════════════════════════════════════════════════════════

impl Vm {
    pub fn to_object(&self, value: &Value) -> Result<ObjectRef, VmError> {
        self.realm.to_object(value)
    }

    /// ToPrimitive. Objects try `valueOf`/`toString` in hint order.
    pub fn to_primitive(&mut self, value: &Value, hint: Hint) -> Result<Value, VmError> {
        let Value::Object(obj) = value else {
            return Ok(value.clone());
        };
        obj.materialize();
        if let ObjectKind::Primitive(inner) = &obj.borrow().kind {
            return Ok(inner.clone());
        }
        let order = match hint {
            Hint::String => ["toString", "valueOf"],
            Hint::Default | Hint::Number => ["valueOf", "toString"],
        };
        for name in order {
            let method = obj.get(&PropertyKey::from(name)).unwrap_or_default();
            if method.as_object().is_some_and(ObjectRef::is_callable) {
                let result = self.call_value(&method, value.clone(), &[])?;
                if !matches!(result, Value::Object(_)) {
                    return Ok(result);
                }
            }
        }
        Err(VmError::type_error("Cannot convert object to primitive value"))
    }

    pub fn to_number(&mut self, value: &Value) -> Result<Value, VmError> {
        match value {
            Value::Int(_) | Value::Int64(_) | Value::Float(_) => Ok(value.clone()),
            Value::Object(_) => self.to_primitive(value, Hint::Number)?.primitive_to_number(),
            other => other.primitive_to_number(),
        }
    }

    pub fn to_string(&mut self, value: &Value) -> Result<JsString, VmError> {
        match value {
            Value::String(s) => Ok(s.cheap_clone()),
            Value::Object(_) => self.to_primitive(value, Hint::String)?.primitive_to_string(),
            other => other.primitive_to_string(),
        }
    }

    pub fn to_property_key(&mut self, value: &Value) -> Result<PropertyKey, VmError> {
        let primitive = match value {
            Value::Object(_) => self.to_primitive(value, Hint::String)?,
            other => other.clone(),
        };
        match primitive {
            Value::Symbol(sym) => Ok(PropertyKey::Symbol(sym)),
            Value::String(s) => Ok(PropertyKey::String(s)),
            other => Ok(PropertyKey::String(other.primitive_to_string()?)),
        }
    }

    /// Message argument of the error constructors
    pub(crate) fn error_message_arg(&mut self, value: Value) -> Result<JsString, VmError> {
        if value.is_undefined() {
            return Ok(JsString::from(""));
        }
        self.to_string(&value)
    }

    /// Abstract equality (`==`)
    pub fn loose_equals(&mut self, a: &Value, b: &Value) -> Result<bool, VmError> {
        let a = a.clone().or_undefined();
        let b = b.clone().or_undefined();
        Ok(match (&a, &b) {
            (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
            (Value::Undefined | Value::Null, _) | (_, Value::Undefined | Value::Null) => false,
            (x, y) if x.is_number() && y.is_number() => numbers_equal(x, y),
            (Value::String(x), Value::String(y)) => x == y,
            (x, Value::String(s)) if x.is_number() => numbers_equal(x, &string_to_number(s)),
            (Value::String(s), y) if y.is_number() => numbers_equal(&string_to_number(s), y),
            (Value::Bool(x), y) => return self.loose_equals(&Value::Int(i64::from(*x)), y),
            (x, Value::Bool(y)) => return self.loose_equals(x, &Value::Int(i64::from(*y))),
            (Value::Object(x), Value::Object(y)) => x.ptr_eq(y),
            (Value::Object(_), y) => {
                let x = self.to_primitive(&a, Hint::Default)?;
                return self.loose_equals(&x, y);
            }
            (x, Value::Object(_)) => {
                let y = self.to_primitive(&b, Hint::Default)?;
                return self.loose_equals(x, &y);
            }
            (Value::Symbol(x), Value::Symbol(y)) => x == y,
            _ => false,
        })
    }

    pub fn type_of(&self, value: &Value) -> &'static str {
        match value {
            Value::Undefined | Value::Empty | Value::Unresolved { .. } => "undefined",
            Value::Null => "object",
            Value::Bool(_) => "boolean",
            Value::Int(_) | Value::Int64(_) | Value::Float(_) => "number",
            Value::String(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::Object(obj) if obj.is_callable() => "function",
            Value::Object(_) => "object",
        }
    }

    /// `value instanceof target`
    pub fn instance_of(&mut self, value: &Value, target: &Value) -> Result<bool, VmError> {
        let Some(mut target) = target.as_object().filter(|t| t.is_callable()).cloned() else {
            return Err(VmError::type_error(
                "Right-hand side of 'instanceof' is not callable",
            ));
        };
        loop {
            let bound = match &target.borrow().kind {
                ObjectKind::Bound(b) => Some(b.target.cheap_clone()),
                _ => None,
            };
            match bound {
                Some(inner) => target = inner,
                None => break,
            }
        }
        let Value::Object(obj) = value else {
            return Ok(false);
        };
        let proto = match target.get(&PropertyKey::from("prototype")) {
            Some(Value::Object(p)) => p,
            other => {
                return Err(VmError::type_error(format!(
                    "Function has non-object prototype '{}' in instanceof check",
                    other.unwrap_or_default()
                )));
            }
        };
        let mut cursor = obj.prototype();
        while let Some(p) = cursor {
            if p.ptr_eq(&proto) {
                return Ok(true);
            }
            cursor = p.prototype();
        }
        Ok(false)
    }

    /// `key in target`
    pub fn has_in(&mut self, key: &Value, target: &Value) -> Result<bool, VmError> {
        let Value::Object(obj) = target else {
            return Err(VmError::type_error(format!(
                "Cannot use 'in' operator to search for '{}' in {}",
                key, target
            )));
        };
        let obj = obj.cheap_clone();
        let key = self.to_property_key(key)?;
        Ok(obj.has_property(&key))
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Instruction bodies
    // ───────────────────────────────────────────────────────────────────────────

    pub(crate) fn exec_add(&mut self) -> Result<(), VmError> {
        let right = self.stack.pop()?;
        let left = self.stack.peek(0)?.clone();
        let l = self.to_primitive(&left, Hint::Default)?;
        let r = self.to_primitive(&right, Hint::Default)?;
        let result = if l.is_string() || r.is_string() {
            let ls = l.primitive_to_string()?;
            let rs = r.primitive_to_string()?;
            Value::String(ls.concat(&rs))
        } else {
            let ln = l.primitive_to_number()?;
            let rn = r.primitive_to_number()?;
            add_numbers(&ln, &rn)
        };
        self.stack.replace_top(result)?;
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_arith(&mut self, op: Arith) -> Result<(), VmError> {
        let right = self.stack.pop()?;
        let left = self.stack.peek(0)?.clone();
        let l = self.to_number(&left)?;
        let r = self.to_number(&right)?;
        let result = match op {
            Arith::Sub => sub_numbers(&l, &r),
            Arith::Mul => mul_numbers(&l, &r),
            Arith::Div => div_numbers(&l, &r),
            Arith::Mod => mod_numbers(&l, &r),
        };
        self.stack.replace_top(result)?;
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_bitwise(&mut self, op: BitOp) -> Result<(), VmError> {
        let right = self.stack.pop()?;
        let left = self.stack.peek(0)?.clone();
        let l = self.to_number(&left)?;
        let r = self.to_number(&right)?;
        self.stack.replace_top(bitwise(op, &l, &r))?;
        self.pc += 1;
        Ok(())
    }

    /// Apply a unary numeric operation to the top value
    pub(crate) fn exec_unary(&mut self, f: fn(&Value) -> Value) -> Result<(), VmError> {
        let value = self.stack.peek(0)?.clone();
        let n = self.to_number(&value)?;
        self.stack.replace_top(f(&n))?;
        self.pc += 1;
        Ok(())
    }

    /// `left < right` after ToPrimitive; `None` for NaN comparisons
    fn less_than(&mut self, left: &Value, right: &Value) -> Result<Option<bool>, VmError> {
        if let (Value::String(a), Value::String(b)) = (left, right) {
            return Ok(Some(a < b));
        }
        let l = left.primitive_to_number()?;
        let r = right.primitive_to_number()?;
        Ok(less_than_numbers(&l, &r))
    }

    pub(crate) fn exec_relation(&mut self, rel: Relation) -> Result<(), VmError> {
        let right = self.stack.pop()?;
        let left = self.stack.peek(0)?.clone();
        let l = self.to_primitive(&left, Hint::Number)?;
        let r = self.to_primitive(&right, Hint::Number)?;
        let result = match rel {
            Relation::Lt => self.less_than(&l, &r)?.unwrap_or(false),
            Relation::Gt => self.less_than(&r, &l)?.unwrap_or(false),
            Relation::Lte => self.less_than(&r, &l)?.is_some_and(|gt| !gt),
            Relation::Gte => self.less_than(&l, &r)?.is_some_and(|lt| !lt),
        };
        self.stack.replace_top(Value::Bool(result))?;
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_equality(&mut self, strict: bool, negate: bool) -> Result<(), VmError> {
        let right = self.stack.pop()?;
        let left = self.stack.peek(0)?.clone();
        let equal = if strict {
            left.strict_equals(&right)
        } else {
            self.loose_equals(&left, &right)?
        };
        self.stack.replace_top(Value::Bool(equal != negate))?;
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_instance_of(&mut self) -> Result<(), VmError> {
        let target = self.stack.pop()?;
        let value = self.stack.peek(0)?.clone();
        let result = self.instance_of(&value, &target)?;
        self.stack.replace_top(Value::Bool(result))?;
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_in(&mut self) -> Result<(), VmError> {
        let target = self.stack.pop()?;
        let key = self.stack.peek(0)?.clone();
        let result = self.has_in(&key, &target)?;
        self.stack.replace_top(Value::Bool(result))?;
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_type_of(&mut self) -> Result<(), VmError> {
        let name = self.type_of(self.stack.peek(0)?);
        self.stack.replace_top(Value::from(name))?;
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_to_property_key(&mut self) -> Result<(), VmError> {
        let value = self.stack.peek(0)?.clone();
        let key = self.to_property_key(&value)?;
        self.stack.replace_top(key.to_value())?;
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn exec_to_string(&mut self) -> Result<(), VmError> {
        let value = self.stack.peek(0)?.clone();
        let s = self.to_string(&value)?;
        self.stack.replace_top(Value::String(s))?;
        self.pc += 1;
        Ok(())
    }

    /// Template literal: the top `n` values joined as strings, bottom first
    pub(crate) fn exec_concat_strings(&mut self, n: usize) -> Result<(), VmError> {
        let parts = self.stack.pop_n(n)?;
        let mut units: Vec<u16> = Vec::new();
        for part in &parts {
            units.extend(self.to_string(part)?.code_units());
        }
        self.push_next(Value::String(JsString::from_code_units(units)))
    }
}
