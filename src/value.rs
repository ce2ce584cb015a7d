//! Runtime value representation

use crate::error::VmError;
use crate::object::ObjectRef;
use crate::prelude::*;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Marker trait for types that are cheap to clone (reference-counted types).
///
/// Use `.cheap_clone()` instead of `.clone()` where the copy is only a
/// reference-count increment, so that expensive clones stand out in review.
pub trait CheapClone: Clone {
    /// Create a cheap (reference-counted) clone of this value.
    fn cheap_clone(&self) -> Self {
        self.clone()
    }
}

impl<T: ?Sized> CheapClone for Rc<T> {}

/// Largest integer magnitude held in the exact `Value::Int` representation
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

// ═══════════════════════════════════════════════════════════════════════════════
// Strings
// ═══════════════════════════════════════════════════════════════════════════════

/// Reference-counted script string.
///
/// Strings made only of ASCII are stored narrow (one byte per code unit),
/// everything else as UTF-16 code units. The representation is canonical, but
/// equality, hashing and ordering are defined over code units so the two
/// encodings are never observable.
#[derive(Clone)]
pub struct JsString(Repr);

#[derive(Clone)]
enum Repr {
    Narrow(Rc<str>),
    Wide(Rc<[u16]>),
}

impl CheapClone for JsString {}

/// Iterator over the UTF-16 code units of a [`JsString`]
pub enum CodeUnits<'a> {
    Narrow(std::str::Bytes<'a>),
    Wide(std::slice::Iter<'a, u16>),
}

impl Iterator for CodeUnits<'_> {
    type Item = u16;

    #[inline]
    fn next(&mut self) -> Option<u16> {
        match self {
            CodeUnits::Narrow(bytes) => bytes.next().map(u16::from),
            CodeUnits::Wide(units) => units.next().copied(),
        }
    }
}

impl JsString {
    /// Build a string from UTF-16 code units, choosing the narrow form when possible
    pub fn from_code_units(units: Vec<u16>) -> Self {
        if units.iter().all(|&u| u < 0x80) {
            let s: String = units.iter().map(|&u| char::from(u as u8)).collect();
            JsString(Repr::Narrow(s.into()))
        } else {
            JsString(Repr::Wide(units.into()))
        }
    }

    /// Length in UTF-16 code units
    pub fn len(&self) -> usize {
        match &self.0 {
            Repr::Narrow(s) => s.len(),
            Repr::Wide(units) => units.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when stored as UTF-16 code units
    pub fn is_wide(&self) -> bool {
        matches!(self.0, Repr::Wide(_))
    }

    /// Borrow the narrow representation, if this string has one
    pub fn as_narrow(&self) -> Option<&str> {
        match &self.0 {
            Repr::Narrow(s) => Some(s),
            Repr::Wide(_) => None,
        }
    }

    pub fn code_units(&self) -> CodeUnits<'_> {
        match &self.0 {
            Repr::Narrow(s) => CodeUnits::Narrow(s.bytes()),
            Repr::Wide(units) => CodeUnits::Wide(units.iter()),
        }
    }

    pub fn code_unit_at(&self, index: usize) -> Option<u16> {
        match &self.0 {
            Repr::Narrow(s) => s.as_bytes().get(index).map(|&b| u16::from(b)),
            Repr::Wide(units) => units.get(index).copied(),
        }
    }

    /// Concatenate two strings. The result stays narrow when both sides are narrow.
    pub fn concat(&self, other: &JsString) -> JsString {
        if other.is_empty() {
            return self.cheap_clone();
        }
        if self.is_empty() {
            return other.cheap_clone();
        }
        match (&self.0, &other.0) {
            (Repr::Narrow(a), Repr::Narrow(b)) => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(a);
                s.push_str(b);
                JsString(Repr::Narrow(s.into()))
            }
            _ => {
                let mut units = Vec::with_capacity(self.len() + other.len());
                units.extend(self.code_units());
                units.extend(other.code_units());
                JsString(Repr::Wide(units.into()))
            }
        }
    }

    /// Compare by UTF-16 code units
    pub fn compare(&self, other: &JsString) -> Ordering {
        match (&self.0, &other.0) {
            (Repr::Narrow(a), Repr::Narrow(b)) => a.as_bytes().cmp(b.as_bytes()),
            _ => self.code_units().cmp(other.code_units()),
        }
    }

    /// Parse as an array index (canonical decimal, below 2^32 - 1)
    pub fn as_array_index(&self) -> Option<u32> {
        let s = self.as_narrow()?;
        if s.is_empty() || (s.len() > 1 && s.starts_with('0')) {
            return None;
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let n: u64 = s.parse().ok()?;
        if n < u64::from(u32::MAX) {
            u32::try_from(n).ok()
        } else {
            None
        }
    }

    /// Approximate heap footprint in bytes
    pub(crate) fn heap_size(&self) -> usize {
        match &self.0 {
            Repr::Narrow(s) => s.len(),
            Repr::Wide(units) => units.len() * 2,
        }
    }
}

impl PartialEq for JsString {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Repr::Narrow(a), Repr::Narrow(b)) => a == b,
            (Repr::Wide(a), Repr::Wide(b)) => a == b,
            _ => self.len() == other.len() && self.code_units().eq(other.code_units()),
        }
    }
}

impl Eq for JsString {}

impl Hash for JsString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.len());
        for unit in self.code_units() {
            state.write_u16(unit);
        }
    }
}

impl PartialOrd for JsString {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for JsString {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl PartialEq<str> for JsString {
    fn eq(&self, other: &str) -> bool {
        match &self.0 {
            Repr::Narrow(s) => s.as_ref() == other,
            Repr::Wide(units) => units.iter().copied().eq(other.encode_utf16()),
        }
    }
}

impl PartialEq<&str> for JsString {
    fn eq(&self, other: &&str) -> bool {
        *self == **other
    }
}

impl From<&str> for JsString {
    fn from(s: &str) -> Self {
        if s.is_ascii() {
            JsString(Repr::Narrow(s.into()))
        } else {
            JsString(Repr::Wide(s.encode_utf16().collect::<Vec<_>>().into()))
        }
    }
}

impl From<String> for JsString {
    fn from(s: String) -> Self {
        JsString::from(s.as_str())
    }
}

impl fmt::Debug for JsString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self)
    }
}

impl fmt::Display for JsString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Repr::Narrow(s) => f.write_str(s),
            Repr::Wide(units) => {
                for c in char::decode_utf16(units.iter().copied()) {
                    write!(f, "{}", c.unwrap_or(char::REPLACEMENT_CHARACTER))?;
                }
                Ok(())
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Symbols
// ═══════════════════════════════════════════════════════════════════════════════

/// A symbol. Identity is the allocation, descriptions are informational.
#[derive(Clone)]
pub struct JsSymbol(Rc<SymbolData>);

struct SymbolData {
    description: Option<JsString>,
}

impl CheapClone for JsSymbol {}

impl JsSymbol {
    pub fn new(description: Option<JsString>) -> Self {
        JsSymbol(Rc::new(SymbolData { description }))
    }

    pub fn description(&self) -> Option<&JsString> {
        self.0.description.as_ref()
    }

    fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for JsSymbol {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for JsSymbol {}

impl Hash for JsSymbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.addr());
    }
}

impl fmt::Debug for JsSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.description() {
            Some(desc) => write!(f, "Symbol({})", desc),
            None => write!(f, "Symbol()"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Values
// ═══════════════════════════════════════════════════════════════════════════════

/// A script value
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    /// Exact integer within `±MAX_SAFE_INTEGER`
    Int(i64),
    /// Integer outside the safe range (only produced by hosts and 64-bit arithmetic)
    Int64(i64),
    Float(f64),
    String(JsString),
    Symbol(JsSymbol),
    Object(ObjectRef),
    /// Uninitialised binding or cleared stack slot. Never observable by scripts.
    Empty,
    /// Result of a lookup that found nothing. `typeof` reports "undefined";
    /// calling it raises. `member` distinguishes `o.f()` from `f()`.
    Unresolved { name: JsString, member: bool },
}

impl CheapClone for Value {}

/// Integer result, promoted to float outside the safe range
#[inline]
pub fn int_to_value(i: i64) -> Value {
    if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&i) {
        Value::Int(i)
    } else {
        Value::Float(i as f64)
    }
}

/// Integer result of 64-bit arithmetic, narrowed to `Int` when it fits
#[inline]
pub fn int64_to_value(i: i64) -> Value {
    if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&i) {
        Value::Int(i)
    } else {
        Value::Int64(i)
    }
}

#[inline]
pub fn float_to_value(f: f64) -> Value {
    Value::Float(f)
}

impl Value {
    pub const NAN: Value = Value::Float(f64::NAN);
    pub const POSITIVE_ZERO: Value = Value::Float(0.0);
    pub const NEGATIVE_ZERO: Value = Value::Float(-0.0);
    pub const POSITIVE_INFINITY: Value = Value::Float(f64::INFINITY);
    pub const NEGATIVE_INFINITY: Value = Value::Float(f64::NEG_INFINITY);

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Check if this value is null or undefined
    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, Value::Null | Value::Undefined)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Int64(_) | Value::Float(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&JsString> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric value as a float, for numeric variants only
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) | Value::Int64(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Integer value of an integral number. `-0` is not integral here.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Int(i) | Value::Int64(i) => Some(*i),
            Value::Float(f) => float_to_integer(*f),
            _ => None,
        }
    }

    pub fn is_negative_zero(&self) -> bool {
        matches!(self, Value::Float(f) if *f == 0.0 && f.is_sign_negative())
    }

    pub fn is_nan(&self) -> bool {
        matches!(self, Value::Float(f) if f.is_nan())
    }

    /// `undefined` for the internal markers, the value otherwise
    #[inline]
    pub fn or_undefined(self) -> Value {
        match self {
            Value::Empty | Value::Unresolved { .. } => Value::Undefined,
            v => v,
        }
    }

    /// Convert to boolean (ToBoolean)
    pub fn to_boolean(&self) -> bool {
        match self {
            Value::Undefined | Value::Null | Value::Empty | Value::Unresolved { .. } => false,
            Value::Bool(b) => *b,
            Value::Int(i) | Value::Int64(i) => *i != 0,
            Value::Float(f) => *f != 0.0 && !f.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Symbol(_) | Value::Object(_) => true,
        }
    }

    /// ToNumber for a primitive. Objects must be converted to a primitive first.
    pub(crate) fn primitive_to_number(&self) -> Result<Value, VmError> {
        match self {
            Value::Undefined | Value::Empty | Value::Unresolved { .. } => Ok(Value::NAN),
            Value::Null => Ok(Value::Int(0)),
            Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
            Value::Int(_) | Value::Int64(_) | Value::Float(_) => Ok(self.clone()),
            Value::String(s) => Ok(string_to_number(s)),
            Value::Symbol(_) => Err(VmError::type_error(
                "Cannot convert a Symbol value to a number",
            )),
            Value::Object(_) => Ok(Value::NAN),
        }
    }

    /// ToString for a primitive. Objects must be converted to a primitive first.
    pub(crate) fn primitive_to_string(&self) -> Result<JsString, VmError> {
        Ok(match self {
            Value::Undefined | Value::Empty | Value::Unresolved { .. } => JsString::from("undefined"),
            Value::Null => JsString::from("null"),
            Value::Bool(true) => JsString::from("true"),
            Value::Bool(false) => JsString::from("false"),
            Value::Int(i) | Value::Int64(i) => JsString::from(i.to_string()),
            Value::Float(f) => JsString::from(number_to_string(*f)),
            Value::String(s) => s.cheap_clone(),
            Value::Symbol(_) => {
                return Err(VmError::type_error(
                    "Cannot convert a Symbol value to a string",
                ));
            }
            Value::Object(_) => JsString::from("[object Object]"),
        })
    }

    /// Strict equality (===)
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (a, b) if a.is_number() && b.is_number() => numbers_equal(a, b),
            _ => false,
        }
    }

    /// SameValue: like strict equality but NaN equals NaN and the zeros differ
    pub fn same_value(&self, other: &Value) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) if a.is_nan() && b.is_nan() => true,
            (Some(a), Some(b)) if a == 0.0 && b == 0.0 => {
                a.is_sign_negative() == b.is_sign_negative()
            }
            _ => self.strict_equals(other),
        }
    }
}

/// Numeric equality through the shared integer/float path
pub(crate) fn numbers_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x) | Value::Int64(x), Value::Int(y) | Value::Int64(y)) => x == y,
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

pub(crate) fn float_to_integer(f: f64) -> Option<i64> {
    if f.fract() != 0.0 || !f.is_finite() || (f == 0.0 && f.is_sign_negative()) {
        return None;
    }
    if f < -9.223_372_036_854_776e18 || f >= 9.223_372_036_854_776e18 {
        return None;
    }
    Some(f as i64)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Number conversions
// ═══════════════════════════════════════════════════════════════════════════════

/// Format a number the way script `String(n)` does
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    let abs = n.abs();
    if (1e-6..1e21).contains(&abs) {
        return format!("{}", n);
    }
    let formatted = format!("{:e}", n);
    match formatted.split_once('e') {
        Some((mantissa, exp)) if exp.starts_with('-') => format!("{}e{}", mantissa, exp),
        Some((mantissa, exp)) => format!("{}e+{}", mantissa, exp),
        None => formatted,
    }
}

fn is_script_whitespace(c: char) -> bool {
    c.is_whitespace() || c == '\u{FEFF}'
}

/// ToNumber applied to a string
pub fn string_to_number(s: &JsString) -> Value {
    let text = s.to_string();
    let trimmed = text.trim_matches(is_script_whitespace);
    if trimmed.is_empty() {
        return Value::Int(0);
    }
    match trimmed {
        "Infinity" | "+Infinity" => return Value::POSITIVE_INFINITY,
        "-Infinity" => return Value::NEGATIVE_INFINITY,
        _ => {}
    }
    let radix = match trimmed.get(..2) {
        Some("0x") | Some("0X") => Some(16),
        Some("0o") | Some("0O") => Some(8),
        Some("0b") | Some("0B") => Some(2),
        _ => None,
    };
    if let Some(radix) = radix {
        let digits = trimmed.get(2..).unwrap_or_default();
        if digits.is_empty() {
            return Value::NAN;
        }
        let mut acc = 0.0f64;
        for c in digits.chars() {
            match c.to_digit(radix) {
                Some(d) => acc = acc * f64::from(radix) + f64::from(d),
                None => return Value::NAN,
            }
        }
        return match float_to_integer(acc) {
            Some(i) => int_to_value(i),
            None => Value::Float(acc),
        };
    }
    if !trimmed
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
    {
        return Value::NAN;
    }
    match trimmed.parse::<f64>() {
        Ok(f) => match float_to_integer(f) {
            Some(i) if i.unsigned_abs() <= MAX_SAFE_INTEGER as u64 => Value::Int(i),
            _ => Value::Float(f),
        },
        Err(_) => Value::NAN,
    }
}

/// ToInt32 on an already-numeric value
pub fn to_int32(v: &Value) -> i32 {
    match v {
        Value::Int(i) | Value::Int64(i) => *i as i32,
        Value::Float(f) => to_uint32_f64(*f) as i32,
        _ => 0,
    }
}

/// ToUint32 on an already-numeric value
pub fn to_uint32(v: &Value) -> u32 {
    match v {
        Value::Int(i) | Value::Int64(i) => *i as u32,
        Value::Float(f) => to_uint32_f64(*f),
        _ => 0,
    }
}

fn to_uint32_f64(f: f64) -> u32 {
    if !f.is_finite() {
        return 0;
    }
    let m = f.trunc().rem_euclid(4_294_967_296.0);
    m as u32
}

// ═══════════════════════════════════════════════════════════════════════════════
// Formatting and conversions from Rust types
// ═══════════════════════════════════════════════════════════════════════════════

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Int64(i) => write!(f, "{}n64", i),
            Value::Float(n) if *n == 0.0 && n.is_sign_negative() => write!(f, "-0"),
            Value::Float(n) => write!(f, "{}", number_to_string(*n)),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Symbol(s) => write!(f, "{:?}", s),
            Value::Object(obj) => write!(f, "{:?}", obj),
            Value::Empty => write!(f, "<empty>"),
            Value::Unresolved { name, .. } => write!(f, "<unresolved {}>", name),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            Value::Symbol(s) => write!(f, "{:?}", s),
            Value::Object(obj) => write!(f, "{:?}", obj),
            other => match other.primitive_to_string() {
                Ok(s) => write!(f, "{}", s),
                Err(_) => write!(f, "{:?}", other),
            },
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.strict_equals(other)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        int64_to_value(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(JsString::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(JsString::from(s))
    }
}

impl From<JsString> for Value {
    fn from(s: JsString) -> Self {
        Value::String(s)
    }
}

impl From<JsSymbol> for Value {
    fn from(s: JsSymbol) -> Self {
        Value::Symbol(s)
    }
}

impl From<ObjectRef> for Value {
    fn from(o: ObjectRef) -> Self {
        Value::Object(o)
    }
}
