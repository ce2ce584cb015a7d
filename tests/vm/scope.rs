//! Scope tests: global declarations, TDZ, block records, with scopes, references

use super::{eval, eval_in, eval_result, eval_result_in, exception, function, set_global};
use stashvm::bytecode::{
    BindingKind, FuncEntry, GlobalBindings, Instruction, MixedLoad, MixedResolve, MixedStackLoad,
    MixedStackResolve, ScopeLayout, StashIndex, VarBindings, scope_names,
};
use stashvm::{ErrorKind, ExceptionKind, Runtime, Value};
use std::rc::Rc;

fn bind_global(lets: &[&str], consts: &[&str], vars: &[&str]) -> Instruction {
    Instruction::BindGlobal(Rc::new(GlobalBindings {
        vars: vars.iter().map(|&n| n.into()).collect(),
        funcs: Vec::new(),
        lets: lets.iter().map(|&n| n.into()).collect(),
        consts: consts.iter().map(|&n| n.into()).collect(),
        deletable: false,
    }))
}

// -----------------------------------------------------------------------------
// Global declarations
// -----------------------------------------------------------------------------

#[test]
fn test_let_read_before_initialization_raises() {
    let ex = exception(eval_result(|b| {
        b.emit(bind_global(&["x"], &[], &[]));
        b.emit(Instruction::LoadDynamic("x".into()));
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Uninitialized));
    assert_eq!(ex.message(), "Cannot access 'x' before initialization");
    assert_eq!(ex.value().as_object().unwrap().class_name(), "Error");
}

#[test]
fn test_let_after_initialization() {
    let mut runtime = Runtime::new();
    let result = eval_in(&mut runtime, |b| {
        b.emit(bind_global(&["x"], &[], &[]));
        b.load(5);
        b.emit(Instruction::InitGlobal("x".into()));
        b.emit(Instruction::LoadDynamic("x".into()));
    });
    assert_eq!(result, Value::from(5));
    assert_eq!(runtime.get_global("x"), Some(Value::from(5)));
    // lexical globals are not properties of the global object
    assert!(runtime.global_object().get(&"x".into()).is_none());
}

#[test]
fn test_const_assignment() {
    let mut runtime = Runtime::new();
    eval_in(&mut runtime, |b| {
        b.emit(bind_global(&[], &["c"], &[]));
        b.load(1);
        b.emit(Instruction::InitGlobal("c".into()));
        b.emit(Instruction::LoadUndef);
    });

    let ex = exception(eval_result_in(&mut runtime, |b| {
        b.load(2);
        b.emit(Instruction::SetGlobal {
            name: "c".into(),
            strict: true,
        });
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Type));
    assert_eq!(runtime.get_global("c"), Some(Value::from(1)));
}

#[test]
fn test_redeclaring_a_lexical_global_is_a_syntax_error() {
    let mut runtime = Runtime::new();
    eval_in(&mut runtime, |b| {
        b.emit(bind_global(&["x"], &[], &[]));
        b.emit(Instruction::LoadUndef);
    });
    let ex = exception(eval_result_in(&mut runtime, |b| {
        b.emit(bind_global(&[], &[], &["x"]));
        b.emit(Instruction::LoadUndef);
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Syntax));
    assert_eq!(ex.message(), "Identifier 'x' has already been declared");
}

#[test]
fn test_var_declarations_are_global_properties() {
    let mut runtime = Runtime::new();
    let result = eval_in(&mut runtime, |b| {
        b.emit(bind_global(&[], &[], &["g"]));
        b.emit(Instruction::LoadDynamic("g".into()));
    });
    assert_eq!(result, Value::Undefined);
    assert_eq!(runtime.get_global("g"), Some(Value::Undefined));

    // non-deletable var
    let deleted = eval_in(&mut runtime, |b| {
        b.emit(Instruction::DeleteGlobal("g".into()));
    });
    assert_eq!(deleted, Value::Bool(false));
}

#[test]
fn test_unresolved_names() {
    let ex = exception(eval_result(|b| {
        b.emit(Instruction::LoadDynamic("missing".into()));
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Reference));
    assert_eq!(ex.message(), "missing is not defined");

    // strict assignment to an undeclared name
    let ex = exception(eval_result(|b| {
        b.emit(Instruction::ResolveVar1 {
            name: "missing".into(),
            strict: true,
        });
        b.load(1);
        b.emit(Instruction::PutValue { pop: false });
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Reference));

    // sloppy assignment creates a global property
    let mut runtime = Runtime::new();
    eval_in(&mut runtime, |b| {
        b.emit(Instruction::ResolveVar1 {
            name: "created".into(),
            strict: false,
        });
        b.load(7);
        b.emit(Instruction::PutValue { pop: false });
    });
    assert_eq!(runtime.get_global("created"), Some(Value::from(7)));
}

// -----------------------------------------------------------------------------
// Blocks
// -----------------------------------------------------------------------------

fn let_block() -> Instruction {
    Instruction::EnterBlock(Rc::new(ScopeLayout {
        names: Some(scope_names([("a", BindingKind::Let)])),
        stash_size: 1,
        stack_size: 0,
    }))
}

#[test]
fn test_block_stash_bindings() {
    let result = eval(|b| {
        b.emit(let_block());
        b.load(3);
        b.emit(Instruction::InitStash(StashIndex::new(0, 0)));
        b.emit(Instruction::LoadStashLex(StashIndex::new(0, 0)));
        b.emit(Instruction::LeaveBlock {
            stack_size: 0,
            pop_stash: true,
        });
    });
    assert_eq!(result, Value::from(3));
}

#[test]
fn test_block_tdz_reports_the_binding_name() {
    let ex = exception(eval_result(|b| {
        b.emit(let_block());
        b.emit(Instruction::LoadStashLex(StashIndex::new(0, 0)));
    }));
    assert_eq!(ex.message(), "Cannot access 'a' before initialization");

    let ex = exception(eval_result(|b| {
        b.emit(let_block());
        b.load(1);
        b.emit(Instruction::StoreStashLex {
            at: StashIndex::new(0, 0),
            pop: false,
        });
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Uninitialized));
}

#[test]
fn test_stack_block_slots() {
    let result = eval(|b| {
        b.emit(Instruction::EnterBlock(Rc::new(ScopeLayout {
            names: None,
            stash_size: 0,
            stack_size: 2,
        })));
        b.load(4);
        b.emit(Instruction::InitStack(1));
        b.load(5);
        b.emit(Instruction::InitStack(2));
        b.emit(Instruction::LoadStackLex(1));
        b.emit(Instruction::LoadStackLex(2));
        b.emit(Instruction::Mul);
        b.emit(Instruction::LeaveBlock {
            stack_size: 0,
            pop_stash: false,
        });
    });
    assert_eq!(result, Value::from(20));
}

#[test]
fn test_top_level_this_is_the_global_object() {
    let result = eval(|b| {
        b.emit(Instruction::LoadStack(0));
        b.emit(Instruction::LoadGlobalObject);
        b.emit(Instruction::StrictEq);
    });
    assert_eq!(result, Value::Bool(true));
}

#[test]
fn test_copy_stash_gives_each_iteration_its_own_record() {
    let mut runtime = Runtime::new();
    // capture the record, copy it, then write through the copy
    eval_in(&mut runtime, |b| {
        b.emit(let_block());
        b.load(1);
        b.emit(Instruction::InitStash(StashIndex::new(0, 0)));
        b.emit(Instruction::CopyStash);
        b.load(2);
        b.emit(Instruction::StoreStashLex {
            at: StashIndex::new(0, 0),
            pop: true,
        });
        b.emit(Instruction::LoadStashLex(StashIndex::new(0, 0)));
        set_global(b, "after_copy");
        b.emit(Instruction::LoadUndef);
    });
    assert_eq!(runtime.get_global("after_copy"), Some(Value::from(2)));
    assert!(runtime.vm().stash_allocs() >= 2);
}

fn stack_block(size: u32) -> Instruction {
    Instruction::EnterBlock(Rc::new(ScopeLayout {
        names: None,
        stash_size: 0,
        stack_size: size,
    }))
}

#[test]
fn test_stack_slot_tdz() {
    let ex = exception(eval_result(|b| {
        b.emit(stack_block(1));
        b.load(1);
        b.emit(Instruction::StoreStackLex { index: 1, pop: false });
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Uninitialized));

    // a plain store does not check
    let result = eval(|b| {
        b.emit(stack_block(1));
        b.load(1);
        b.emit(Instruction::StoreStack { index: 1, pop: true });
        b.load(2);
        b.emit(Instruction::StoreStackLex { index: 1, pop: true });
        b.emit(Instruction::LoadStackLex(1));
    });
    assert_eq!(result, Value::from(2));

    // loop bodies put a binding back into its TDZ
    let ex = exception(eval_result(|b| {
        b.emit(stack_block(1));
        b.load(1);
        b.emit(Instruction::InitStack(1));
        b.emit(Instruction::LoadEmpty);
        b.emit(Instruction::InitStack(1));
        b.emit(Instruction::LoadStackLex(1));
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Uninitialized));
}

#[test]
fn test_plain_stash_store() {
    let result = eval(|b| {
        b.emit(let_block());
        b.load("x");
        b.emit(Instruction::StoreStash {
            at: StashIndex::new(0, 0),
            pop: false,
        });
        b.emit(Instruction::LoadStashLex(StashIndex::new(0, 0)));
        b.emit(Instruction::Add);
    });
    assert_eq!(result, Value::from("xx"));
}

#[test]
fn test_assignment_to_a_known_const() {
    let ex = exception(eval_result(|b| {
        b.emit(Instruction::ThrowAssignToConst("limit".into()));
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Type));
    assert_eq!(ex.message(), "Assignment to constant variable 'limit'.");
}

#[test]
fn test_catch_block_binds_the_exception() {
    let result = eval(|b| {
        let t = b.emit_try();
        b.load("boom");
        b.emit(Instruction::Throw);
        b.emit(Instruction::Halt);
        let done = b.emit_jump(Instruction::Jump);
        b.patch_try_catch(t);
        b.emit(Instruction::EnterCatchBlock(Rc::new(ScopeLayout {
            names: Some(scope_names([("e", BindingKind::Let)])),
            stash_size: 1,
            stack_size: 0,
        })));
        b.emit(Instruction::LoadStashLex(StashIndex::new(0, 0)));
        set_global(b, "caught");
        b.emit(Instruction::LeaveBlock {
            stack_size: 0,
            pop_stash: true,
        });
        b.emit(Instruction::Halt);
        b.patch_jump(done);
        b.emit(Instruction::LoadDynamic("caught".into()));
    });
    assert_eq!(result, Value::from("boom"));
}

// -----------------------------------------------------------------------------
// with
// -----------------------------------------------------------------------------

#[test]
fn test_with_scope_lookup_and_assignment() {
    let mut runtime = Runtime::new();
    let obj = runtime.new_object();
    obj.as_object().unwrap().put("v", 5);
    runtime.set_global("o", obj.clone());

    let result = eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("o".into()));
        b.emit(Instruction::EnterWith);
        b.emit(Instruction::ResolveVar1 {
            name: "v".into(),
            strict: false,
        });
        b.emit(Instruction::GetValue);
        b.load(1);
        b.emit(Instruction::Add);
        b.emit(Instruction::PutValue { pop: false });
        b.emit(Instruction::LeaveWith);
    });
    assert_eq!(result, Value::from(6));
    assert_eq!(obj.as_object().unwrap().get(&"v".into()), Some(Value::from(6)));
    assert_eq!(runtime.get_global("v"), None);
}

#[test]
fn test_with_scope_honours_unscopables() {
    let mut runtime = Runtime::new();
    let obj = runtime.new_object();
    let blocked = runtime.new_object();
    blocked.as_object().unwrap().put("hidden", true);
    let o = obj.as_object().unwrap();
    o.put("hidden", "from with");
    o.put(runtime.well_known_symbols().unscopables.clone(), blocked);
    runtime.set_global("o", obj.clone());
    runtime.set_global("hidden", "from global");

    let result = eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("o".into()));
        b.emit(Instruction::EnterWith);
        b.emit(Instruction::LoadDynamic("hidden".into()));
        b.emit(Instruction::LeaveWith);
    });
    assert_eq!(result, Value::from("from global"));
}

#[test]
fn test_mixed_load_prefers_the_dynamic_scope() {
    let mut runtime = Runtime::new();
    let obj = runtime.new_object();
    obj.as_object().unwrap().put("a", "dynamic");
    runtime.set_global("o", obj);

    let load = |b: &mut stashvm::ProgramBuilder| {
        b.emit(Instruction::LoadMixed(Rc::new(MixedLoad {
            name: "a".into(),
            level: 1,
            index: 0,
            callee: false,
            lexical: true,
        })));
    };

    let result = eval_in(&mut runtime, |b| {
        b.emit(let_block());
        b.load("fixed");
        b.emit(Instruction::InitStash(StashIndex::new(0, 0)));
        b.emit(Instruction::LoadDynamic("o".into()));
        b.emit(Instruction::EnterWith);
        load(b);
        b.load(",");
        b.emit(Instruction::LeaveWith);
        b.emit(Instruction::LoadDynamic("o".into()));
        b.emit(Instruction::DeleteProp {
            name: "a".into(),
            strict: false,
        });
        b.emit(Instruction::Pop);
        b.emit(Instruction::LoadDynamic("o".into()));
        b.emit(Instruction::EnterWith);
        load(b);
        b.emit(Instruction::LeaveWith);
        b.emit(Instruction::ConcatStrings(3));
    });
    assert_eq!(result, Value::from("dynamic,fixed"));
}

#[test]
fn test_mixed_resolve_writes_where_the_name_is_found() {
    let mut runtime = Runtime::new();
    let has_a = runtime.new_object();
    has_a.as_object().unwrap().put("a", "old");
    runtime.set_global("o", has_a.clone());
    runtime.set_global("empty", runtime.new_object());

    let assign = |b: &mut stashvm::ProgramBuilder, scope: &str, value: &str| {
        b.emit(Instruction::LoadDynamic(scope.into()));
        b.emit(Instruction::EnterWith);
        b.emit(Instruction::ResolveMixed(Rc::new(MixedResolve {
            name: "a".into(),
            level: 1,
            index: 0,
            kind: BindingKind::Let,
            strict: false,
        })));
        b.load(value);
        b.emit(Instruction::PutValue { pop: true });
        b.emit(Instruction::LeaveWith);
    };

    let result = eval_in(&mut runtime, |b| {
        b.emit(let_block());
        b.load("fixed");
        b.emit(Instruction::InitStash(StashIndex::new(0, 0)));
        assign(b, "o", "via with");
        b.emit(Instruction::LoadStashLex(StashIndex::new(0, 0)));
        b.load(",");
        assign(b, "empty", "direct");
        b.emit(Instruction::LoadStashLex(StashIndex::new(0, 0)));
        b.emit(Instruction::ConcatStrings(3));
    });
    assert_eq!(result, Value::from("fixed,direct"));
    assert_eq!(has_a.as_object().unwrap().get(&"a".into()), Some(Value::from("via with")));
}

#[test]
fn test_mixed_stack_bindings() {
    let mut runtime = Runtime::new();
    runtime.set_global("empty", runtime.new_object());
    let load = || {
        Instruction::LoadMixedStack(Rc::new(MixedStackLoad {
            name: "x".into(),
            level: 1,
            index: 1,
            callee: false,
            lexical: true,
            args_in_stash: false,
        }))
    };

    let ex = exception(eval_result_in(&mut runtime, |b| {
        b.emit(stack_block(1));
        b.emit(Instruction::LoadDynamic("empty".into()));
        b.emit(Instruction::EnterWith);
        b.emit(load());
    }));
    assert_eq!(ex.message(), "Cannot access 'x' before initialization");

    let result = eval_in(&mut runtime, |b| {
        b.emit(stack_block(1));
        b.emit(Instruction::LoadDynamic("empty".into()));
        b.emit(Instruction::EnterWith);
        b.emit(Instruction::ResolveMixedStack(Rc::new(MixedStackResolve {
            name: "x".into(),
            level: 1,
            index: 1,
            kind: BindingKind::Let,
            strict: true,
            args_in_stash: false,
        })));
        b.load(9);
        b.emit(Instruction::InitValueP);
        b.emit(load());
        b.emit(Instruction::LeaveWith);
    });
    assert_eq!(result, Value::from(9));
}

#[test]
fn test_delete_var_in_with_scope() {
    let mut runtime = Runtime::new();
    let obj = runtime.new_object();
    obj.as_object().unwrap().put("gone", 1);
    runtime.set_global("o", obj.clone());

    let result = eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("o".into()));
        b.emit(Instruction::EnterWith);
        b.emit(Instruction::DeleteVar("gone".into()));
        b.emit(Instruction::LeaveWith);
    });
    assert_eq!(result, Value::Bool(true));
    assert!(!obj.as_object().unwrap().has_own_property(&"gone".into()));
}

// -----------------------------------------------------------------------------
// var declarations in function code
// -----------------------------------------------------------------------------

fn function_entry() -> Instruction {
    Instruction::EnterFunc(Rc::new(FuncEntry {
        names: None,
        stash_size: 0,
        stack_size: 0,
        num_args: 0,
        args_to_stash: true,
    }))
}

fn bind_vars(names: &[&str]) -> Instruction {
    Instruction::BindVars(Rc::new(VarBindings {
        names: names.iter().map(|&n| n.into()).collect(),
        deletable: true,
    }))
}

#[test]
fn test_bind_vars_targets_the_function_record() {
    let mut runtime = Runtime::new();
    let declare = function("declare", 0, |b| {
        b.emit(function_entry());
        b.emit(let_block());
        b.emit(bind_vars(&["v"]));
        b.emit(Instruction::ResolveVar1 {
            name: "v".into(),
            strict: true,
        });
        b.load(7);
        b.emit(Instruction::PutValue { pop: true });
        b.emit(Instruction::LeaveBlock {
            stack_size: 0,
            pop_stash: true,
        });
        b.emit(Instruction::LoadDynamic("v".into()));
        b.emit(Instruction::Ret);
    });
    let result = eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadUndef);
        b.emit(Instruction::NewFunc(declare));
        b.emit(Instruction::Call(0));
    });
    assert_eq!(result, Value::from(7));
    assert_eq!(runtime.get_global("v"), None);
}

#[test]
fn test_bind_vars_conflicting_with_a_lexical_binding() {
    let declare = function("declare", 0, |b| {
        b.emit(function_entry());
        b.emit(let_block());
        b.emit(bind_vars(&["a"]));
        b.emit(Instruction::LoadUndef);
        b.emit(Instruction::Ret);
    });
    let ex = exception(eval_result(|b| {
        b.emit(Instruction::LoadUndef);
        b.emit(Instruction::NewFunc(declare));
        b.emit(Instruction::Call(0));
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Syntax));
    assert_eq!(ex.message(), "Identifier 'a' has already been declared");
}
