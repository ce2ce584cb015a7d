//! Numeric semantics: integer fast paths, overflow promotion, signed zero, coercions

use super::{eval, eval_result, exception};
use stashvm::bytecode::Instruction;
use stashvm::value::MAX_SAFE_INTEGER;
use stashvm::{ErrorKind, ExceptionKind, JsSymbol, Value};

fn binary(l: impl Into<Value>, r: impl Into<Value>, op: Instruction) -> Value {
    let (l, r) = (l.into(), r.into());
    eval(|b| {
        b.load(l);
        b.load(r);
        b.emit(op);
    })
}

// -----------------------------------------------------------------------------
// Integers
// -----------------------------------------------------------------------------

#[test]
fn test_integer_arithmetic_stays_exact() {
    assert!(matches!(binary(40, 2, Instruction::Add), Value::Int(42)));
    assert!(matches!(binary(40, 2, Instruction::Sub), Value::Int(38)));
    assert!(matches!(binary(6, 7, Instruction::Mul), Value::Int(42)));
    assert!(matches!(binary(7, 3, Instruction::Mod), Value::Int(1)));
}

#[test]
fn test_safe_integer_overflow_promotes_to_float() {
    let sum = binary(MAX_SAFE_INTEGER, 1, Instruction::Add);
    assert!(matches!(sum, Value::Float(f) if f == 9007199254740992.0));

    let below = binary(-MAX_SAFE_INTEGER, 1, Instruction::Sub);
    assert!(matches!(below, Value::Float(f) if f == -9007199254740992.0));

    let inc = eval(|b| {
        b.load(MAX_SAFE_INTEGER);
        b.emit(Instruction::Inc);
    });
    assert!(matches!(inc, Value::Float(_)));
}

#[test]
fn test_zero_products_keep_the_sign() {
    assert!(binary(0, -5, Instruction::Mul).is_negative_zero());
    assert!(binary(-5, 0, Instruction::Mul).is_negative_zero());
    assert!(!binary(0, 5, Instruction::Mul).is_negative_zero());
    assert!(binary(-4, 2, Instruction::Mod).is_negative_zero());

    let neg = eval(|b| {
        b.load(0);
        b.emit(Instruction::Neg);
    });
    assert!(neg.is_negative_zero());
}

#[test]
fn test_division_table() {
    assert_eq!(binary(1, 0, Instruction::Div), Value::POSITIVE_INFINITY);
    assert_eq!(binary(-1, 0, Instruction::Div), Value::NEGATIVE_INFINITY);
    assert!(binary(0, 0, Instruction::Div).is_nan());
    assert_eq!(binary(6, 3, Instruction::Div), Value::from(2));
    assert_eq!(binary(1, 4, Instruction::Div), Value::from(0.25));
    assert_eq!(binary(1, Value::NEGATIVE_ZERO, Instruction::Div), Value::NEGATIVE_INFINITY);
    assert!(binary(5, 0, Instruction::Mod).is_nan());
}

// -----------------------------------------------------------------------------
// Coercions
// -----------------------------------------------------------------------------

#[test]
fn test_add_concatenates_when_either_side_is_a_string() {
    assert_eq!(binary("a", 1, Instruction::Add), Value::from("a1"));
    assert_eq!(binary(1, "b", Instruction::Add), Value::from("1b"));
    assert_eq!(binary(1.5, true, Instruction::Add), Value::from(2.5));
}

#[test]
fn test_numeric_strings_convert() {
    assert_eq!(binary("6", "2", Instruction::Mul), Value::from(12));
    assert!(binary("x", 1, Instruction::Sub).is_nan());
}

#[test]
fn test_object_operands_go_through_value_of() {
    let result = eval(|b| {
        b.emit(Instruction::NewObject);
        b.emit(Instruction::Dup);
        b.emit(Instruction::GetPropCallee("valueOf".into()));
        b.emit(Instruction::Call(0));
        b.emit(Instruction::TypeOf);
    });
    assert_eq!(result, Value::from("object"));

    // `{} + 1` falls back to toString
    let concat = eval(|b| {
        b.emit(Instruction::NewObject);
        b.load(1);
        b.emit(Instruction::Add);
    });
    assert_eq!(concat, Value::from("[object Object]1"));
}

#[test]
fn test_symbols_do_not_convert_to_numbers() {
    let ex = exception(eval_result(|b| {
        b.load(JsSymbol::new(None));
        b.load(1);
        b.emit(Instruction::Sub);
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Type));
}

// -----------------------------------------------------------------------------
// Comparison & bitwise
// -----------------------------------------------------------------------------

#[test]
fn test_relations() {
    assert_eq!(binary(1, 2, Instruction::Lt), Value::Bool(true));
    assert_eq!(binary(2, 2, Instruction::Lte), Value::Bool(true));
    assert_eq!(binary("10", "9", Instruction::Lt), Value::Bool(true));
    assert_eq!(binary("10", 9, Instruction::Lt), Value::Bool(false));
    assert_eq!(binary(Value::NAN, 1, Instruction::Lt), Value::Bool(false));
    assert_eq!(binary(Value::NAN, 1, Instruction::Gte), Value::Bool(false));
    assert_eq!(binary(3, 2.5, Instruction::Gt), Value::Bool(true));
    assert_eq!(binary("b", "a", Instruction::Gt), Value::Bool(true));
}

#[test]
fn test_equality() {
    assert_eq!(binary(Value::Null, Value::Undefined, Instruction::Eq), Value::Bool(true));
    assert_eq!(binary(Value::Null, Value::Undefined, Instruction::StrictEq), Value::Bool(false));
    assert_eq!(binary("1", 1, Instruction::Eq), Value::Bool(true));
    assert_eq!(binary(true, 1, Instruction::Eq), Value::Bool(true));
    assert_eq!(binary(Value::NAN, Value::NAN, Instruction::StrictNeq), Value::Bool(true));
    assert_eq!(binary(0, Value::NEGATIVE_ZERO, Instruction::StrictEq), Value::Bool(true));
    assert_eq!(binary("1", 1, Instruction::Neq), Value::Bool(false));
    assert_eq!(binary(Value::Null, 0, Instruction::Neq), Value::Bool(true));
}

#[test]
fn test_bitwise() {
    assert_eq!(binary(-1, 0, Instruction::Shr), Value::from(4294967295u32));
    assert_eq!(binary(-8, 1, Instruction::Sar), Value::from(-4));
    assert_eq!(binary(1, 33, Instruction::Sal), Value::from(2));
    assert_eq!(binary(0b1100, 0b1010, Instruction::Xor), Value::from(0b0110));
    assert_eq!(binary(0b1100, 0b1010, Instruction::And), Value::from(0b1000));
    assert_eq!(binary(0b1100, 0b1010, Instruction::Or), Value::from(0b1110));
    assert_eq!(binary("7", 2.9, Instruction::Or), Value::from(7));
    let not = eval(|b| {
        b.load(5);
        b.emit(Instruction::BNot);
    });
    assert_eq!(not, Value::from(-6));
}

#[test]
fn test_type_of() {
    let undeclared = eval(|b| {
        b.emit(Instruction::LoadDynamicRef("nope".into()));
        b.emit(Instruction::TypeOf);
    });
    assert_eq!(undeclared, Value::from("undefined"));

    let null = eval(|b| {
        b.load(Value::Null);
        b.emit(Instruction::TypeOf);
    });
    assert_eq!(null, Value::from("object"));

    let func = eval(|b| {
        b.emit(Instruction::LoadDynamic("eval".into()));
        b.emit(Instruction::TypeOf);
    });
    assert_eq!(func, Value::from("function"));
}

#[test]
fn test_concat_strings() {
    let result = eval(|b| {
        b.load("x=");
        b.load(1);
        b.load(Value::Null);
        b.emit(Instruction::ConcatStrings(3));
    });
    assert_eq!(result, Value::from("x=1null"));
}

#[test]
fn test_logical_not() {
    for (value, expected) in [
        (Value::from(0), true),
        (Value::from(""), true),
        (Value::NAN, true),
        (Value::Null, true),
        (Value::from("a"), false),
        (Value::from(-1), false),
    ] {
        let result = eval(|b| {
            b.load(value.clone());
            b.emit(Instruction::Not);
        });
        assert_eq!(result, Value::Bool(expected), "!{}", value);
    }
}

/// `l || r` or `l && r`, depending on the jump
fn short_circuit(l: impl Into<Value>, r: impl Into<Value>, jump: fn(i32) -> Instruction) -> Value {
    let (l, r) = (l.into(), r.into());
    eval(|b| {
        b.load(l);
        let done = b.emit_jump(jump);
        b.load(r);
        b.patch_jump(done);
    })
}

#[test]
fn test_logical_operators_keep_the_deciding_operand() {
    assert_eq!(short_circuit("a", "b", Instruction::Jeq1), Value::from("a"));
    assert_eq!(short_circuit(0, "b", Instruction::Jeq1), Value::from("b"));
    assert_eq!(short_circuit("a", "b", Instruction::Jneq1), Value::from("b"));
    assert_eq!(short_circuit("", "b", Instruction::Jneq1), Value::from(""));
}

#[test]
fn test_default_value_jumps() {
    let or_default = |v: Value| {
        eval(|b| {
            b.load(v);
            let done = b.emit_jump(Instruction::Jdef);
            b.load("default");
            b.patch_jump(done);
        })
    };
    assert_eq!(or_default(Value::Undefined), Value::from("default"));
    assert_eq!(or_default(Value::Null), Value::Null);

    let defined = |v: Value| {
        eval(|b| {
            b.load(v);
            let yes = b.emit_jump(Instruction::JdefP);
            b.load(false);
            let done = b.emit_jump(Instruction::Jump);
            b.patch_jump(yes);
            b.load(true);
            b.patch_jump(done);
        })
    };
    assert_eq!(defined(Value::Undefined), Value::Bool(false));
    assert_eq!(defined(Value::from(0)), Value::Bool(true));
}

#[test]
fn test_in_operator() {
    let found = eval(|b| {
        b.load("NaN");
        b.emit(Instruction::LoadGlobalObject);
        b.emit(Instruction::In);
    });
    assert_eq!(found, Value::Bool(true));

    let missing = eval(|b| {
        b.load("no_such_property");
        b.emit(Instruction::LoadGlobalObject);
        b.emit(Instruction::In);
    });
    assert_eq!(missing, Value::Bool(false));

    let ex = exception(eval_result(|b| {
        b.load(1);
        b.load(5);
        b.emit(Instruction::In);
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Type));
}

// -----------------------------------------------------------------------------
// Explicit conversions
// -----------------------------------------------------------------------------

fn unary(value: impl Into<Value>, op: Instruction) -> Value {
    let value = value.into();
    eval(|b| {
        b.load(value);
        b.emit(op);
    })
}

#[test]
fn test_unary_plus_and_to_number() {
    assert_eq!(unary("3", Instruction::Plus), Value::from(3));
    assert_eq!(unary(true, Instruction::ToNumber), Value::from(1));
    assert!(unary("three", Instruction::Plus).is_nan());
    assert_eq!(unary(Value::Null, Instruction::ToNumber), Value::from(0));
}

#[test]
fn test_to_string_and_property_key() {
    assert_eq!(unary(Value::Null, Instruction::ToString), Value::from("null"));
    assert_eq!(unary(1.5, Instruction::ToString), Value::from("1.5"));
    assert_eq!(unary(42, Instruction::ToPropertyKey), Value::from("42"));

    // symbols stay symbols as keys
    let sym = Value::Symbol(JsSymbol::new(Some("k".into())));
    assert_eq!(unary(sym.clone(), Instruction::ToPropertyKey), sym);
}
