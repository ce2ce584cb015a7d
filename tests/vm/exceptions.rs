//! Exceptions: try/catch/finally, error objects, stack traces, host errors

use super::{bump_global, eval, eval_in, eval_result, eval_result_in, exception, set_global, uncatchable};
use stashvm::bytecode::{FuncTemplate, Instruction, ProgramBuilder, SourceFile};
use stashvm::{ErrorKind, ExceptionKind, HostError, Runtime, UncatchableError, Value, VmError};
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("disk on fire")]
struct DiskError;

/// `try { <body> } catch (e) { <handler> }`, each section closed with `Halt`
fn try_catch(b: &mut ProgramBuilder, body: impl FnOnce(&mut ProgramBuilder), handler: impl FnOnce(&mut ProgramBuilder)) {
    let t = b.emit_try();
    body(b);
    b.emit(Instruction::Halt);
    let done = b.emit_jump(Instruction::Jump);
    b.patch_try_catch(t);
    handler(b);
    b.emit(Instruction::Halt);
    b.patch_jump(done);
}

// -----------------------------------------------------------------------------
// try / catch
// -----------------------------------------------------------------------------

#[test]
fn test_catch_receives_the_thrown_value() {
    let result = eval(|b| {
        try_catch(
            b,
            |b| {
                b.load("boom");
                b.emit(Instruction::Throw);
            },
            |b| set_global(b, "caught"),
        );
        b.emit(Instruction::LoadDynamic("caught".into()));
    });
    assert_eq!(result, Value::from("boom"));
}

#[test]
fn test_vm_errors_are_caught_as_error_objects() {
    let mut runtime = Runtime::new();
    eval_in(&mut runtime, |b| {
        try_catch(
            b,
            |b| {
                b.emit(Instruction::LoadUndef);
                b.load(5);
                b.emit(Instruction::Call(0));
            },
            |b| {
                b.emit(Instruction::Dup);
                b.emit(Instruction::GetProp("name".into()));
                set_global(b, "name");
                b.emit(Instruction::GetProp("message".into()));
                set_global(b, "message");
            },
        );
        b.emit(Instruction::LoadUndef);
    });
    assert_eq!(runtime.get_global("name"), Some(Value::from("TypeError")));
    assert_eq!(runtime.get_global("message"), Some(Value::from("Not a function: 5")));
}

#[test]
fn test_catch_inside_a_function_restores_the_caller() {
    let thrower = FuncTemplate::new(
        {
            let mut b = ProgramBuilder::new("thrower");
            b.emit(Instruction::EnterFuncStashless {
                stack_size: 3,
                num_args: 0,
            });
            b.load("deep");
            b.emit(Instruction::Throw);
            b.finish()
        },
        0,
        true,
    );
    let result = eval(|b| {
        b.load("below");
        try_catch(
            b,
            |b| {
                b.emit(Instruction::LoadUndef);
                b.emit(Instruction::NewFunc(thrower));
                b.emit(Instruction::Call(0));
            },
            |b| {
                b.emit(Instruction::Pop);
            },
        );
        // the value pushed before the try is still on top
    });
    assert_eq!(result, Value::from("below"));
}

// -----------------------------------------------------------------------------
// finally
// -----------------------------------------------------------------------------

/// `try { <body> } catch { } finally { fin++ }`; catch omitted when `catch` is false
fn try_finally(b: &mut ProgramBuilder, catch: bool, body: impl FnOnce(&mut ProgramBuilder)) {
    let t = b.emit_try();
    body(b);
    b.emit(Instruction::Halt);
    let after_try = b.emit_jump(Instruction::Jump);
    let mut after_catch = None;
    if catch {
        b.patch_try_catch(t);
        b.emit(Instruction::Pop);
        b.emit(Instruction::Halt);
        after_catch = Some(b.emit_jump(Instruction::Jump));
    }
    b.patch_try_finally(t);
    bump_global(b, "fin");
    b.emit(Instruction::Halt);
    b.emit(Instruction::RetFinally);
    b.patch_jump(after_try);
    if let Some(j) = after_catch {
        b.patch_jump(j);
    }
}

fn throw_x(b: &mut ProgramBuilder) {
    b.load("x");
    b.emit(Instruction::Throw);
}

#[test]
fn test_finally_runs_once_on_normal_completion() {
    let mut runtime = Runtime::new();
    runtime.set_global("fin", 0);
    let result = eval_in(&mut runtime, |b| {
        try_finally(b, false, |b| {
            b.load(1);
            set_global(b, "a");
        });
        b.load("after");
    });
    assert_eq!(result, Value::from("after"));
    assert_eq!(runtime.get_global("fin"), Some(Value::from(1)));
    assert_eq!(runtime.get_global("a"), Some(Value::from(1)));
}

#[test]
fn test_finally_runs_once_after_catch() {
    let mut runtime = Runtime::new();
    runtime.set_global("fin", 0);
    let result = eval_in(&mut runtime, |b| {
        try_finally(b, true, throw_x);
        b.load("after");
    });
    assert_eq!(result, Value::from("after"));
    assert_eq!(runtime.get_global("fin"), Some(Value::from(1)));
}

#[test]
fn test_finally_rethrows_the_pending_error() {
    let mut runtime = Runtime::new();
    runtime.set_global("fin", 0);
    let ex = exception(eval_result_in(&mut runtime, |b| {
        try_finally(b, false, throw_x);
        b.load("unreachable");
    }));
    assert_eq!(ex.kind(), ExceptionKind::Value);
    assert_eq!(ex.message(), "x");
    assert_eq!(runtime.get_global("fin"), Some(Value::from(1)));
}

#[test]
fn test_leaving_finally_early_discards_the_error() {
    let result = eval(|b| {
        let t = b.emit_try();
        b.load("lost");
        b.emit(Instruction::Throw);
        b.emit(Instruction::Halt);
        let after_try = b.emit_jump(Instruction::Jump);
        b.patch_try_finally(t);
        // `break` out of the finally block
        b.emit(Instruction::Halt);
        let out = b.emit_jump(Instruction::Jump);
        b.emit(Instruction::Halt);
        b.emit(Instruction::RetFinally);
        b.patch_jump(after_try);
        b.patch_jump(out);
        b.load("recovered");
    });
    assert_eq!(result, Value::from("recovered"));
}

// -----------------------------------------------------------------------------
// Error objects
// -----------------------------------------------------------------------------

#[test]
fn test_error_constructors() {
    let ex = exception(eval_result(|b| {
        b.emit(Instruction::LoadDynamic("RangeError".into()));
        b.load("too far");
        b.emit(Instruction::New(1));
        b.emit(Instruction::Throw);
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Range));
    assert_eq!(ex.message(), "too far");
    assert!(ex.to_string().starts_with("RangeError: too far"));

    // without `new`
    let ex = exception(eval_result(|b| {
        b.emit(Instruction::LoadUndef);
        b.emit(Instruction::LoadDynamic("Error".into()));
        b.load("plain");
        b.emit(Instruction::Call(1));
        b.emit(Instruction::Throw);
    }));
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Error));
    assert_eq!(ex.message(), "plain");
}

#[test]
fn test_thrown_primitives() {
    let ex = exception(eval_result(|b| {
        b.load(42);
        b.emit(Instruction::Throw);
    }));
    assert_eq!(ex.kind(), ExceptionKind::Value);
    assert_eq!(ex.value(), &Value::from(42));
    assert!(ex.to_string().starts_with("Uncaught 42"));
}

// -----------------------------------------------------------------------------
// Stack traces
// -----------------------------------------------------------------------------

#[test]
fn test_stack_trace_positions() {
    let source = Rc::new(SourceFile::new(
        "main.js",
        "function inner() {\n  throw 1;\n}\ninner();",
    ));

    let mut inner = ProgramBuilder::new("inner").with_source_file(source.clone());
    inner.set_position(21);
    inner.emit(Instruction::EnterFuncStashless {
        stack_size: 0,
        num_args: 0,
    });
    inner.load(1);
    inner.emit(Instruction::Throw);
    let inner = FuncTemplate::new(inner.finish(), 0, true);

    let mut main = ProgramBuilder::new("main").with_source_file(source);
    main.set_position(32);
    main.emit(Instruction::LoadUndef);
    main.emit(Instruction::NewFunc(inner));
    main.emit(Instruction::Call(0));
    main.emit(Instruction::SaveResult);
    main.emit(Instruction::Halt);

    let mut runtime = Runtime::new();
    let ex = exception(runtime.run_program(main.finish()));
    let frames: Vec<_> = ex
        .stack()
        .iter()
        .map(|f| (f.function_name.clone().unwrap(), f.line, f.column))
        .collect();
    assert_eq!(
        frames,
        vec![("inner".to_string(), 2, 3), ("main".to_string(), 4, 1)]
    );
    assert!(ex.stack().iter().all(|f| f.file.as_deref() == Some("main.js")));
    assert!(ex.to_string().contains("    at inner (main.js:2:3)"));
}

// -----------------------------------------------------------------------------
// Host errors
// -----------------------------------------------------------------------------

#[test]
fn test_host_error_reaches_the_embedder() {
    let mut runtime = Runtime::new();
    let fail = runtime.new_native_function("fail", 0, |_, _| {
        Err(VmError::host(HostError::new(DiskError)))
    });
    runtime.set_global("fail", fail);

    let err = eval_result_in(&mut runtime, |b| {
        b.emit(Instruction::LoadUndef);
        b.emit(Instruction::LoadDynamic("fail".into()));
        b.emit(Instruction::Call(0));
    })
    .unwrap_err();
    let host = err.native_error().unwrap();
    assert!(host.downcast_ref::<DiskError>().is_some());
    let ex = err.exception().unwrap();
    assert_eq!(ex.kind(), ExceptionKind::Error(ErrorKind::Host));
    assert_eq!(ex.message(), "disk on fire");
}

#[test]
fn test_host_error_survives_catch_and_rethrow() {
    let original = HostError::new(DiskError);
    let mut runtime = Runtime::new();
    let raised = original.clone();
    let fail = runtime.new_native_function("fail", 0, move |_, _| Err(VmError::host(raised.clone())));
    runtime.set_global("fail", fail);

    let err = eval_result_in(&mut runtime, |b| {
        try_catch(
            b,
            |b| {
                b.emit(Instruction::LoadUndef);
                b.emit(Instruction::LoadDynamic("fail".into()));
                b.emit(Instruction::Call(0));
            },
            |b| {
                b.emit(Instruction::Throw);
            },
        );
    })
    .unwrap_err();
    assert!(err.native_error().unwrap().ptr_eq(&original));
}

// -----------------------------------------------------------------------------
// Uncatchable conditions
// -----------------------------------------------------------------------------

#[test]
fn test_uncatchable_errors_skip_catch_but_run_finally() {
    let mut runtime = Runtime::new();
    runtime.set_global("fin", 0);
    let u = uncatchable(eval_result_in(&mut runtime, |b| {
        let t = b.emit_try();
        // constant index past the pool: malformed bytecode
        b.emit(Instruction::LoadVal(999));
        b.emit(Instruction::Halt);
        let after_try = b.emit_jump(Instruction::Jump);
        b.patch_try_catch(t);
        set_global(b, "caught");
        b.emit(Instruction::Halt);
        let after_catch = b.emit_jump(Instruction::Jump);
        b.patch_try_finally(t);
        bump_global(b, "fin");
        b.emit(Instruction::Halt);
        b.emit(Instruction::RetFinally);
        b.patch_jump(after_try);
        b.patch_jump(after_catch);
    }));
    assert!(matches!(u, UncatchableError::Internal { .. }));
    assert!(!u.is_interrupt());
    assert_eq!(runtime.get_global("caught"), None);
    assert_eq!(runtime.get_global("fin"), Some(Value::from(1)));

    // the runtime is usable afterwards
    let sum = eval_in(&mut runtime, |b| {
        b.emit(Instruction::LoadDynamic("fin".into()));
        b.load(1);
        b.emit(Instruction::Add);
    });
    assert_eq!(sum, Value::from(2));
    assert_eq!(runtime.vm().frame_depth(), 0);
}
