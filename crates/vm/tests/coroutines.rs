//! Coroutine and async-generator semantics.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use pyrun_vm::builder::CodeBuilder;
use pyrun_vm::code::CodeFlags;
use pyrun_vm::object::async_generator::{asend_send, athrow_send};
use pyrun_vm::object::exception::{ExcKind, ExceptionValue};
use pyrun_vm::object::generator::gen_send_ex;
use pyrun_vm::object::{AsyncGenASend, AsyncGenAThrow, Function, Namespace, Value};
use pyrun_vm::op_code::OpCode;
use pyrun_vm::version::PyVersion;
use pyrun_vm::vm::Vm;

use common::capture_vm;

fn make_function(
    globals: Rc<RefCell<Namespace>>,
    code: Rc<pyrun_vm::code::CodeObject>,
) -> Rc<Function> {
    Rc::new(Function {
        qualname: code.qualname.clone(),
        code,
        globals,
        defaults: vec![],
        kwdefaults: Default::default(),
        closure: vec![],
        annotations: Default::default(),
    })
}

fn fresh_globals() -> Rc<RefCell<Namespace>> {
    Rc::new(RefCell::new(Namespace::new()))
}

/// `async def c(): return 42`
fn simple_coroutine(version: PyVersion) -> Rc<pyrun_vm::code::CodeObject> {
    let mut c = CodeBuilder::new(version, "c");
    c.load_const(Value::from_i64(42));
    c.op(OpCode::ReturnValue);
    Rc::new(c.flags(CodeFlags::COROUTINE).build())
}

fn call_to_value(vm: &mut Vm, func: &Rc<Function>) -> Value {
    vm.call_function(func, vec![], Default::default()).unwrap()
}

#[test]
fn test_calling_async_def_returns_coroutine() {
    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let func = make_function(fresh_globals(), simple_coroutine(PyVersion::Py36));
    let value = call_to_value(&mut vm, &func);
    assert!(matches!(value, Value::Coroutine(_)));
}

#[test]
fn test_driving_coroutine_to_completion() {
    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let func = make_function(fresh_globals(), simple_coroutine(PyVersion::Py36));
    let Value::Coroutine(gen) = call_to_value(&mut vm, &func) else {
        panic!("expected coroutine");
    };
    let err = gen_send_ex(&mut vm, &gen, Value::None, None).unwrap_err();
    let exc = err.into_raised().unwrap();
    assert!(exc.derives_from(ExcKind::StopIteration));
    assert_eq!(exc.stop_value(), Value::from_i64(42));
}

#[test]
fn test_await_chain() {
    // async def inner(): return 1
    // async def outer(): return (await inner()) + 1
    let globals = fresh_globals();
    let inner = make_function(globals.clone(), simple_coroutine(PyVersion::Py36));
    globals
        .borrow_mut()
        .insert(Rc::from("inner"), Value::Function(inner));

    let mut outer = CodeBuilder::new(PyVersion::Py36, "outer");
    outer.op_name(OpCode::LoadGlobal, "inner");
    outer.op_arg(OpCode::CallFunction, 0);
    outer.op(OpCode::GetAwaitable);
    outer.load_const(Value::None);
    outer.op(OpCode::YieldFrom);
    outer.load_const(Value::from_i64(1));
    outer.op(OpCode::BinaryAdd);
    outer.op(OpCode::ReturnValue);
    let outer_code = Rc::new(outer.flags(CodeFlags::COROUTINE).build());
    let outer_func = make_function(globals, outer_code);

    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let Value::Coroutine(gen) = call_to_value(&mut vm, &outer_func) else {
        panic!("expected coroutine");
    };
    let err = gen_send_ex(&mut vm, &gen, Value::None, None).unwrap_err();
    let exc = err.into_raised().unwrap();
    assert!(exc.derives_from(ExcKind::StopIteration));
    assert_eq!(exc.stop_value(), Value::from_i64(43));
}

#[test]
fn test_await_non_awaitable_is_type_error() {
    // async def c(): await 7
    let mut c = CodeBuilder::new(PyVersion::Py36, "c");
    c.load_const(Value::from_i64(7));
    c.op(OpCode::GetAwaitable);
    c.load_const(Value::None);
    c.op(OpCode::YieldFrom);
    c.op(OpCode::ReturnValue);
    let code = Rc::new(c.flags(CodeFlags::COROUTINE).build());
    let func = make_function(fresh_globals(), code);

    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let Value::Coroutine(gen) = call_to_value(&mut vm, &func) else {
        panic!("expected coroutine");
    };
    let err = gen_send_ex(&mut vm, &gen, Value::None, None).unwrap_err();
    assert_eq!(
        err.to_string(),
        "TypeError: object int can't be used in 'await' expression"
    );
}

#[test]
fn test_unawaited_coroutine_warns_on_drop() {
    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let func = make_function(fresh_globals(), simple_coroutine(PyVersion::Py36));
    let value = call_to_value(&mut vm, &func);
    drop(value);
    let warnings = vm.warnings();
    let warnings = warnings.borrow();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0], "coroutine 'c' was never awaited");
}

#[test]
fn test_awaited_coroutine_does_not_warn() {
    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let func = make_function(fresh_globals(), simple_coroutine(PyVersion::Py36));
    let Value::Coroutine(gen) = call_to_value(&mut vm, &func) else {
        panic!("expected coroutine");
    };
    let _ = gen_send_ex(&mut vm, &gen, Value::None, None);
    drop(gen);
    assert!(vm.warnings().borrow().is_empty());
}

/// `async def ag(): yield 1; yield 2`
fn two_yield_async_generator(version: PyVersion) -> Rc<pyrun_vm::code::CodeObject> {
    let mut g = CodeBuilder::new(version, "ag");
    g.load_const(Value::from_i64(1));
    g.op(OpCode::YieldValue);
    g.op(OpCode::PopTop);
    g.load_const(Value::from_i64(2));
    g.op(OpCode::YieldValue);
    g.op(OpCode::PopTop);
    g.load_const(Value::None);
    g.op(OpCode::ReturnValue);
    Rc::new(g.flags(CodeFlags::ASYNC_GENERATOR).build())
}

fn make_async_generator(vm: &mut Vm, version: PyVersion) -> pyrun_vm::object::GenRef {
    let func = make_function(fresh_globals(), two_yield_async_generator(version));
    match vm.call_function(&func, vec![], Default::default()).unwrap() {
        Value::AsyncGenerator(gen) => gen,
        other => panic!("expected async generator, got {}", other.type_name()),
    }
}

#[test]
fn test_async_generator_anext_protocol() {
    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let gen = make_async_generator(&mut vm, PyVersion::Py36);

    // Each __anext__ awaitable resolves by raising StopIteration carrying
    // the yielded value.
    let anext = AsyncGenASend::new(gen.clone(), Value::None);
    let err = asend_send(&mut vm, &anext, Value::None).unwrap_err();
    let exc = err.into_raised().unwrap();
    assert!(exc.derives_from(ExcKind::StopIteration));
    assert_eq!(exc.stop_value(), Value::from_i64(1));

    let anext = AsyncGenASend::new(gen.clone(), Value::None);
    let err = asend_send(&mut vm, &anext, Value::None).unwrap_err();
    assert_eq!(err.into_raised().unwrap().stop_value(), Value::from_i64(2));

    // Exhaustion surfaces as StopAsyncIteration.
    let anext = AsyncGenASend::new(gen.clone(), Value::None);
    let err = asend_send(&mut vm, &anext, Value::None).unwrap_err();
    assert!(err.is_kind(ExcKind::StopAsyncIteration));
    assert!(gen.borrow().ag_closed);
}

#[test]
fn test_async_generator_asend_reuse_is_an_error() {
    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let gen = make_async_generator(&mut vm, PyVersion::Py36);

    let anext = AsyncGenASend::new(gen, Value::None);
    let _ = asend_send(&mut vm, &anext, Value::None);
    let err = asend_send(&mut vm, &anext, Value::None).unwrap_err();
    assert_eq!(
        err.to_string(),
        "RuntimeError: cannot reuse already awaited __anext__()/asend()"
    );
}

#[test]
fn test_async_generator_aclose_fresh() {
    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let gen = make_async_generator(&mut vm, PyVersion::Py36);

    let aclose = AsyncGenAThrow::new(gen.clone(), None);
    let err = athrow_send(&mut vm, &aclose, Value::None).unwrap_err();
    assert!(err.is_kind(ExcKind::StopIteration));
    assert!(gen.borrow().ag_closed);

    // A closed async generator refuses further iteration.
    let anext = AsyncGenASend::new(gen, Value::None);
    let err = asend_send(&mut vm, &anext, Value::None).unwrap_err();
    assert!(
        err.is_kind(ExcKind::StopAsyncIteration) || err.is_kind(ExcKind::StopIteration),
        "closed async generator must not yield again: {err}"
    );
}

#[test]
fn test_async_generator_athrow_propagates() {
    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let gen = make_async_generator(&mut vm, PyVersion::Py36);

    // Start the generator so the throw lands at the first yield.
    let anext = AsyncGenASend::new(gen.clone(), Value::None);
    let _ = asend_send(&mut vm, &anext, Value::None);

    let exc = ExceptionValue::with_message(ExcKind::ValueError, "athrown");
    let athrow = AsyncGenAThrow::new(gen, Some(exc));
    let err = athrow_send(&mut vm, &athrow, Value::None).unwrap_err();
    assert_eq!(err.to_string(), "ValueError: athrown");
}

#[test]
fn test_iterable_coroutine_passes_get_awaitable() {
    // A generator flagged ITERABLE_COROUTINE may be awaited directly.
    let mut g = CodeBuilder::new(PyVersion::Py36, "legacy");
    g.load_const(Value::from_i64(1));
    g.op(OpCode::YieldValue);
    g.op(OpCode::PopTop);
    g.load_const(Value::None);
    g.op(OpCode::ReturnValue);
    let code = Rc::new(
        g.flags(CodeFlags::GENERATOR | CodeFlags::ITERABLE_COROUTINE)
            .build(),
    );
    let func = make_function(fresh_globals(), code);

    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let value = call_to_value(&mut vm, &func);
    let iter = pyrun_vm::object::get_awaitable_iter(&mut vm, &value).unwrap();
    assert!(matches!(iter, Value::Generator(_)));
}
