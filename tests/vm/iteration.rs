//! for-in, for-of, spread and destructuring

use super::{bump_global, eval, eval_in, eval_result, eval_result_in, exception, set_global, strings};
use stashvm::bytecode::{Instruction, ProgramBuilder};
use stashvm::object::Property;
use stashvm::{ErrorKind, ExceptionKind, PropertyKey, Runtime, Value, VmError};
use std::cell::Cell;
use std::rc::Rc;

fn array(runtime: &Runtime, items: &[i32]) -> Value {
    runtime.new_array(items.iter().map(|&i| Value::from(i)).collect())
}

/// Call counters of [`counting_iterable`]
#[derive(Default)]
struct Counters {
    next: Cell<u32>,
    closed: Cell<u32>,
    /// `next` call that throws instead of yielding; 0 never throws
    fail_at: Cell<u32>,
}

/// An endless iterable yielding 1, 2, 3, ... that records `next` and `return` calls
fn counting_iterable(runtime: &Runtime, counters: &Rc<Counters>) -> Value {
    let iterable = runtime.new_object();
    let counters = counters.clone();
    let make_iterator = runtime.new_native_function("[Symbol.iterator]", 0, move |vm, _| {
        let iterator = vm.realm.new_object();
        let c = counters.clone();
        let next = vm.realm.new_native_function("next", 0, move |vm, _| {
            c.next.set(c.next.get() + 1);
            if c.next.get() == c.fail_at.get() {
                return Err(VmError::throw(Value::from("next failed")));
            }
            Ok(Value::Object(vm.realm.iter_result(Value::from(c.next.get()), false)))
        });
        let c = counters.clone();
        let close = vm.realm.new_native_function("return", 0, move |vm, _| {
            c.closed.set(c.closed.get() + 1);
            Ok(Value::Object(vm.realm.new_object()))
        });
        iterator.put("next", next);
        iterator.put("return", close);
        Ok(Value::Object(iterator))
    });
    let key = runtime.well_known_symbols().iterator.clone();
    iterable.as_object().unwrap().put(key, make_iterator);
    iterable
}

// -----------------------------------------------------------------------------
// for-of
// -----------------------------------------------------------------------------

#[test]
fn test_for_of_sums_an_array() {
    let mut runtime = Runtime::new();
    runtime.set_global("items", array(&runtime, &[1, 2, 3]));
    runtime.set_global("sum", 0);
    eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("items".into()));
        b.emit(Instruction::IterateP);
        let top = b.current_offset();
        let exit = b.emit_jump(Instruction::IterNext);
        b.emit(Instruction::EnumGet);
        b.emit(Instruction::LoadDynamic("sum".into()));
        b.emit(Instruction::Add);
        set_global(b, "sum");
        b.emit_jump_to(Instruction::Jump, top);
        b.patch_jump(exit);
        b.emit(Instruction::EnumPop);
        b.emit(Instruction::LoadUndef);
    });
    assert_eq!(runtime.get_global("sum"), Some(Value::from(6)));
}

#[test]
fn test_iterate_keeps_the_iterable() {
    let mut runtime = Runtime::new();
    runtime.set_global("items", array(&runtime, &[4, 5]));
    runtime.set_global("count", 0);
    let result = eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("items".into()));
        b.emit(Instruction::Iterate);
        let top = b.current_offset();
        let exit = b.emit_jump(Instruction::IterNext);
        b.emit(Instruction::EnumGet);
        b.emit(Instruction::Pop);
        super::bump_global(b, "count");
        b.emit_jump_to(Instruction::Jump, top);
        b.patch_jump(exit);
        b.emit(Instruction::EnumPop);
        b.emit(Instruction::GetProp("length".into()));
    });
    assert_eq!(result, Value::from(2));
    assert_eq!(runtime.get_global("count"), Some(Value::from(2)));
}

#[test]
fn test_break_closes_the_iterator_once() {
    let counters = Rc::new(Counters::default());
    let mut runtime = Runtime::new();
    runtime.set_global("iterable", counting_iterable(&runtime, &counters));
    eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("iterable".into()));
        b.emit(Instruction::IterateP);
        let top = b.current_offset();
        let exit = b.emit_jump(Instruction::IterNext);
        // continue while item < 3
        b.emit(Instruction::EnumGet);
        b.load(3);
        b.emit(Instruction::Lt);
        b.emit_jump_to(Instruction::Jeq, top);
        b.emit(Instruction::EnumPopClose);
        let end = b.emit_jump(Instruction::Jump);
        b.patch_jump(exit);
        b.emit(Instruction::EnumPop);
        b.patch_jump(end);
        b.emit(Instruction::LoadUndef);
    });
    assert_eq!(counters.next.get(), 3);
    assert_eq!(counters.closed.get(), 1);
}

#[test]
fn test_throw_in_the_body_closes_the_iterator() {
    let counters = Rc::new(Counters::default());
    let mut runtime = Runtime::new();
    runtime.set_global("iterable", counting_iterable(&runtime, &counters));
    let ex = exception(eval_result_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("iterable".into()));
        b.emit(Instruction::IterateP);
        b.emit(Instruction::IterNext(3));
        b.load("stop");
        b.emit(Instruction::Throw);
        b.emit(Instruction::EnumPop);
    }));
    assert_eq!(ex.message(), "stop");
    assert_eq!(counters.next.get(), 1);
    assert_eq!(counters.closed.get(), 1);
}

#[test]
fn test_failing_next_is_not_closed() {
    let counters = Rc::new(Counters::default());
    counters.fail_at.set(3);
    let mut runtime = Runtime::new();
    runtime.set_global("iterable", counting_iterable(&runtime, &counters));
    runtime.set_global("outer", array(&runtime, &[1]));
    runtime.set_global("count", 0);
    let depth = runtime.new_native_function("depth", 0, |vm, _| Ok(Value::from(vm.iter_depth() as i64)));
    runtime.set_global("depth", depth);

    // for (_ of outer) { try { for (_ of iterable) count++; } catch (e) { ... } }
    eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("outer".into()));
        b.emit(Instruction::IterateP);
        let top = b.current_offset();
        let exit = b.emit_jump(Instruction::IterNext);

        let t = b.emit_try();
        b.emit(Instruction::LoadDynamic("iterable".into()));
        b.emit(Instruction::IterateP);
        let inner_top = b.current_offset();
        let inner_exit = b.emit_jump(Instruction::IterNext);
        bump_global(b, "count");
        b.emit_jump_to(Instruction::Jump, inner_top);
        b.patch_jump(inner_exit);
        b.emit(Instruction::EnumPop);
        b.emit(Instruction::Halt);
        let done = b.emit_jump(Instruction::Jump);
        b.patch_try_catch(t);
        set_global(b, "caught");
        b.emit(Instruction::LoadUndef);
        b.emit(Instruction::LoadDynamic("depth".into()));
        b.emit(Instruction::Call(0));
        set_global(b, "depth_in_catch");
        b.emit(Instruction::Halt);
        b.patch_jump(done);

        b.emit_jump_to(Instruction::Jump, top);
        b.patch_jump(exit);
        b.emit(Instruction::EnumPop);
        b.emit(Instruction::LoadUndef);
    });
    assert_eq!(runtime.get_global("caught"), Some(Value::from("next failed")));
    assert_eq!(runtime.get_global("count"), Some(Value::from(2)));
    assert_eq!(counters.next.get(), 3);
    assert_eq!(counters.closed.get(), 0);
    // only the outer loop was open in the catch block
    assert_eq!(runtime.get_global("depth_in_catch"), Some(Value::from(1)));
    assert_eq!(runtime.vm().iter_depth(), 0);
}

#[test]
fn test_iterating_a_non_iterable() {
    let ex = exception(eval_result(|b| {
        b.load(5);
        b.emit(Instruction::IterateP);
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Type));
    assert_eq!(ex.message(), "5 is not iterable");
}

// -----------------------------------------------------------------------------
// for-in
// -----------------------------------------------------------------------------

/// `for (k in <target>) keys.push(k)`, leaving `keys` on the stack
fn collect_keys(b: &mut ProgramBuilder, target: &str) {
    b.emit(Instruction::NewArray(0));
    set_global(b, "keys");
    b.emit(Instruction::LoadDynamic(target.into()));
    b.emit(Instruction::Enumerate);
    let top = b.current_offset();
    let exit = b.emit_jump(Instruction::EnumNext);
    b.emit(Instruction::LoadDynamic("keys".into()));
    b.emit(Instruction::Dup);
    b.emit(Instruction::GetPropCallee("push".into()));
    b.emit(Instruction::EnumGet);
    b.emit(Instruction::Call(1));
    b.emit(Instruction::Pop);
    b.emit_jump_to(Instruction::Jump, top);
    b.patch_jump(exit);
    b.emit(Instruction::EnumPop);
    b.emit(Instruction::LoadDynamic("keys".into()));
}

#[test]
fn test_for_in_walks_the_prototype_chain_once_per_name() {
    let mut runtime = Runtime::new();
    let proto = runtime.new_object();
    let p = proto.as_object().unwrap();
    p.put("shadow", 1);
    p.put("a", 2);
    p.put("hidden", 3);

    let child = runtime.new_object();
    let c = child.as_object().unwrap();
    c.set_prototype(Some(p.clone()));
    c.put("b", 1);
    c.put("shadow", 2);
    c.define_own_property(
        PropertyKey::from("hidden"),
        Property::hidden(Value::from(4)),
        false,
    )
    .unwrap();
    runtime.set_global("child", child.clone());

    let keys = eval_in(&mut runtime, |b| collect_keys(b, "child"));
    assert_eq!(strings(&keys), vec!["b", "shadow", "a"]);
}

#[test]
fn test_for_in_over_nothing() {
    let mut runtime = Runtime::new();
    runtime.set_global("nothing", Value::Null);
    let keys = eval_in(&mut runtime, |b| collect_keys(b, "nothing"));
    assert!(strings(&keys).is_empty());
}

#[test]
fn test_for_in_inside_with_skips_unscopables() {
    let mut runtime = Runtime::new();
    let obj = runtime.new_object();
    let blocked = runtime.new_object();
    blocked.as_object().unwrap().put("b", true);
    let o = obj.as_object().unwrap();
    o.put("a", 1);
    o.put("b", 2);
    o.put(runtime.well_known_symbols().unscopables.clone(), blocked);
    runtime.set_global("o", obj.clone());

    let keys = eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("o".into()));
        b.emit(Instruction::EnterWith);
        collect_keys(b, "o");
        b.emit(Instruction::LeaveWith);
    });
    assert_eq!(strings(&keys), vec!["a"]);

    // outside the with statement both names are listed
    let keys = eval_in(&mut runtime, |b| collect_keys(b, "o"));
    assert_eq!(strings(&keys), vec!["a", "b"]);
}

// -----------------------------------------------------------------------------
// Destructuring and spread
// -----------------------------------------------------------------------------

#[test]
fn test_array_destructuring_pads_with_undefined() {
    let mut runtime = Runtime::new();
    runtime.set_global("pair", array(&runtime, &[1, 2]));
    let result = eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("pair".into()));
        b.emit(Instruction::IterateP);
        for _ in 0..3 {
            b.emit(Instruction::IterGetNextOrUndef);
        }
        b.emit(Instruction::EnumPopClose);
        b.emit(Instruction::ConcatStrings(3));
    });
    assert_eq!(result, Value::from("12undefined"));
}

#[test]
fn test_rest_element_collects_what_is_left() {
    let mut runtime = Runtime::new();
    runtime.set_global("items", array(&runtime, &[1, 2, 3]));
    let rest = eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("items".into()));
        b.emit(Instruction::IterateP);
        b.emit(Instruction::IterGetNextOrUndef);
        set_global(b, "first");
        b.emit(Instruction::NewArrayFromIter);
    });
    assert_eq!(strings(&rest), vec!["2", "3"]);
    assert_eq!(runtime.get_global("first"), Some(Value::from(1)));
}

#[test]
fn test_destructuring_closes_an_unfinished_iterator() {
    let counters = Rc::new(Counters::default());
    let mut runtime = Runtime::new();
    runtime.set_global("iterable", counting_iterable(&runtime, &counters));
    let first = eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("iterable".into()));
        b.emit(Instruction::IterateP);
        b.emit(Instruction::IterGetNextOrUndef);
        b.emit(Instruction::EnumPopClose);
    });
    assert_eq!(first, Value::from(1));
    assert_eq!(counters.closed.get(), 1);
}

#[test]
fn test_array_spread() {
    let mut runtime = Runtime::new();
    runtime.set_global("tail", array(&runtime, &[1, 2]));
    let result = eval_in(&mut runtime, |b| {
        b.emit(Instruction::NewArray(3));
        b.load(0);
        b.emit(Instruction::PushArrayItem);
        b.emit(Instruction::LoadDynamic("tail".into()));
        b.emit(Instruction::PushArraySpread);
    });
    assert_eq!(strings(&result), vec!["0", "1", "2"]);
}

#[test]
fn test_spreading_a_non_iterable() {
    let ex = exception(eval_result(|b| {
        b.emit(Instruction::NewArray(0));
        b.emit(Instruction::LoadUndef);
        b.emit(Instruction::PushArraySpread);
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Type));
    assert_eq!(ex.message(), "undefined is not iterable");
}

#[test]
fn test_array_values_iterator() {
    let result = eval(|b| {
        b.emit(Instruction::NewArray(2));
        b.load("x");
        b.emit(Instruction::PushArrayItem);
        b.load("y");
        b.emit(Instruction::PushArrayItem);
        b.emit(Instruction::IterateP);
        b.emit(Instruction::IterGetNextOrUndef);
        b.emit(Instruction::IterGetNextOrUndef);
        b.emit(Instruction::EnumPop);
        b.emit(Instruction::ConcatStrings(2));
    });
    assert_eq!(result, Value::from("xy"));
}
