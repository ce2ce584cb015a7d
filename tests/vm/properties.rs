//! Property access: element keys, references, deletion, object literals, spread and rest

use super::{eval, eval_in, eval_result, eval_result_in, exception};
use stashvm::bytecode::Instruction;
use stashvm::{ErrorKind, ExceptionKind, PropertyKey, Runtime, Value};

fn with_object(props: &[(&str, Value)]) -> Runtime {
    let mut runtime = Runtime::new();
    let obj = runtime.new_object();
    for (key, value) in props {
        obj.as_object().unwrap().put(*key, value.clone());
    }
    runtime.set_global("o", obj);
    runtime
}

fn global_prop(runtime: &Runtime, name: &str, key: &str) -> Option<Value> {
    runtime
        .get_global(name)
        .and_then(|v| v.as_object().cloned())
        .and_then(|obj| obj.get(&PropertyKey::from(key)))
}

// -----------------------------------------------------------------------------
// Element reads
// -----------------------------------------------------------------------------

#[test]
fn test_element_keys_are_converted() {
    let mut runtime = with_object(&[("1", Value::from("one"))]);
    let numeric = eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("o".into()));
        b.load(1);
        b.emit(Instruction::GetElem);
    });
    assert_eq!(numeric, Value::from("one"));

    // the key was converted by an earlier ToPropertyKey
    let ready = eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("o".into()));
        b.load(1);
        b.emit(Instruction::ToPropertyKey);
        b.emit(Instruction::GetKey);
    });
    assert_eq!(ready, Value::from("one"));

    let ex = exception(eval_result(|b| {
        b.load(Value::Null);
        b.load("x");
        b.emit(Instruction::GetElem);
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Type));
}

#[test]
fn test_missing_element_method() {
    let ex = exception(eval_result(|b| {
        b.emit(Instruction::NewObject);
        b.emit(Instruction::Dup);
        b.load("nope");
        b.emit(Instruction::GetElemCallee);
        b.emit(Instruction::Call(0));
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Type));
    assert_eq!(ex.message(), "'nope' is not a function");
}

// -----------------------------------------------------------------------------
// References
// -----------------------------------------------------------------------------

#[test]
fn test_compound_assignment_through_a_property_reference() {
    let mut runtime = with_object(&[("count", Value::from(10))]);
    // o.count += 5
    let result = eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("o".into()));
        b.emit(Instruction::GetPropRef {
            name: "count".into(),
            strict: true,
        });
        b.emit(Instruction::GetValue);
        b.load(5);
        b.emit(Instruction::Add);
        b.emit(Instruction::PutValue { pop: false });
    });
    assert_eq!(result, Value::from(15));
    assert_eq!(global_prop(&runtime, "o", "count"), Some(Value::from(15)));
}

#[test]
fn test_element_reference_assignment() {
    let mut runtime = with_object(&[]);
    eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("o".into()));
        b.load("k");
        b.emit(Instruction::GetElemRef { strict: false });
        b.load("v");
        b.emit(Instruction::PutValue { pop: true });
        b.emit(Instruction::LoadUndef);
    });
    assert_eq!(global_prop(&runtime, "o", "k"), Some(Value::from("v")));
}

#[test]
fn test_assignment_result_is_moved_below_the_operands() {
    // [1, 2, 3] -> [3, 2, 3]
    let result = eval(|b| {
        b.load(1);
        b.load(2);
        b.load(3);
        b.emit(Instruction::RDupN(2));
        b.emit(Instruction::Pop);
        b.emit(Instruction::Pop);
    });
    assert_eq!(result, Value::from(3));
}

// -----------------------------------------------------------------------------
// Deletion
// -----------------------------------------------------------------------------

#[test]
fn test_delete_element() {
    let mut runtime = with_object(&[("x", Value::from(1))]);
    let result = eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("o".into()));
        b.load("x");
        b.emit(Instruction::DeleteElem { strict: false });
    });
    assert_eq!(result, Value::Bool(true));
    assert_eq!(global_prop(&runtime, "o", "x"), None);

    let sloppy = eval(|b| {
        b.emit(Instruction::NewArray(0));
        b.load("length");
        b.emit(Instruction::DeleteElem { strict: false });
    });
    assert_eq!(sloppy, Value::Bool(false));

    let ex = exception(eval_result(|b| {
        b.emit(Instruction::NewArray(0));
        b.load("length");
        b.emit(Instruction::DeleteElem { strict: true });
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Type));
    assert_eq!(ex.message(), "Cannot delete property 'length' of object");
}

// -----------------------------------------------------------------------------
// Object literals
// -----------------------------------------------------------------------------

#[test]
fn test_computed_literal_keys() {
    let result = eval(|b| {
        b.emit(Instruction::NewObject);
        b.load(2);
        b.load("two");
        b.emit(Instruction::SetElem1);
        b.load("2");
        b.emit(Instruction::GetElem);
    });
    assert_eq!(result, Value::from("two"));
}

#[test]
fn test_literal_proto() {
    let mut runtime = Runtime::new();
    let proto = runtime.new_object();
    proto.as_object().unwrap().put("inherited", "yes");
    runtime.set_global("proto", proto);

    let inherited = eval_in(&mut runtime, |b| {
        b.emit(Instruction::NewObject);
        b.emit(Instruction::LoadDynamic("proto".into()));
        b.emit(Instruction::SetProto);
        b.emit(Instruction::GetProp("inherited".into()));
    });
    assert_eq!(inherited, Value::from("yes"));

    let bare = eval_in(&mut runtime, |b| {
        b.emit(Instruction::NewObject);
        b.load(Value::Null);
        b.emit(Instruction::SetProto);
    });
    assert!(bare.as_object().unwrap().prototype().is_none());

    // anything but an object or null is ignored
    let ordinary = eval_in(&mut runtime, |b| {
        b.emit(Instruction::NewObject);
        b.load(5);
        b.emit(Instruction::SetProto);
    });
    assert!(ordinary.as_object().unwrap().prototype().is_some());
}

// -----------------------------------------------------------------------------
// Spread and rest
// -----------------------------------------------------------------------------

#[test]
fn test_object_spread_copies_own_properties() {
    let mut runtime = with_object(&[("a", Value::from(1)), ("b", Value::from(2))]);
    let copy = eval_in(&mut runtime, |b| {
        b.emit(Instruction::NewObject);
        b.emit(Instruction::LoadDynamic("o".into()));
        b.emit(Instruction::CopySpread);
        // spreading null copies nothing
        b.load(Value::Null);
        b.emit(Instruction::CopySpread);
    });
    let copy = copy.as_object().unwrap().clone();
    assert_eq!(copy.own_keys(), vec![PropertyKey::from("a"), PropertyKey::from("b")]);
    assert_eq!(copy.get(&"b".into()), Some(Value::from(2)));
}

#[test]
fn test_object_rest_is_a_fresh_object() {
    let mut runtime = with_object(&[("a", Value::from(1))]);
    let same = eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("o".into()));
        b.emit(Instruction::CopyRest);
        b.emit(Instruction::StrictEq);
    });
    assert_eq!(same, Value::Bool(false));

    let a = eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("o".into()));
        b.emit(Instruction::CopyRest);
        b.emit(Instruction::GetProp("a".into()));
    });
    assert_eq!(a, Value::from(1));
}

#[test]
fn test_destructuring_null_and_undefined() {
    let mut runtime = Runtime::new();
    let ex = exception(eval_result_in(&mut runtime, |b| {
        b.load(Value::Null);
        b.emit(Instruction::CheckObjectCoercible);
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Type));
    assert_eq!(ex.message(), "Cannot destructure 'null' as it is null.");

    let ex = exception(eval_result_in(&mut runtime, |b| {
        b.emit(Instruction::LoadUndef);
        b.emit(Instruction::CheckObjectCoercible);
    }));
    assert_eq!(ex.message(), "Cannot destructure 'undefined' as it is undefined.");

    let fine = eval_in(&mut runtime, |b| {
        b.load(0);
        b.emit(Instruction::CheckObjectCoercible);
    });
    assert_eq!(fine, Value::from(0));
}
