//! `with` statement semantics across the cleanup opcode variants.

mod common;

use std::rc::Rc;

use pyrun_vm::builder::CodeBuilder;
use pyrun_vm::object::exception::ExcKind;
use pyrun_vm::object::Value;
use pyrun_vm::op_code::OpCode;
use pyrun_vm::version::PyVersion;

use common::{capture_vm, output};

/// Builds a context-manager class:
///
/// ```text
/// class CM:
///     def __enter__(self): print('enter'); return 5
///     def __exit__(self, t, v, tb): print('exit'); return <suppress>
/// ```
fn emit_cm_class(b: &mut CodeBuilder, version: PyVersion, suppress: bool) {
    let mut enter = CodeBuilder::new(version, "__enter__").params(&["self"]);
    enter.op_name(OpCode::LoadGlobal, "print");
    enter.load_const(Value::from_str("enter"));
    enter.op_arg(OpCode::CallFunction, 1);
    enter.op(OpCode::PopTop);
    enter.load_const(Value::from_i64(5));
    enter.op(OpCode::ReturnValue);

    let mut exit = CodeBuilder::new(version, "__exit__").params(&["self", "t", "v", "tb"]);
    exit.op_name(OpCode::LoadGlobal, "print");
    exit.load_const(Value::from_str("exit"));
    exit.op_arg(OpCode::CallFunction, 1);
    exit.op(OpCode::PopTop);
    exit.load_const(Value::Bool(suppress));
    exit.op(OpCode::ReturnValue);

    let mut body = CodeBuilder::new(version, "CM");
    body.load_const(Value::Code(Rc::new(enter.build())));
    body.load_const(Value::from_str("CM.__enter__"));
    body.op_arg(OpCode::MakeFunction, 0);
    body.op_name(OpCode::StoreName, "__enter__");
    body.load_const(Value::Code(Rc::new(exit.build())));
    body.load_const(Value::from_str("CM.__exit__"));
    body.op_arg(OpCode::MakeFunction, 0);
    body.op_name(OpCode::StoreName, "__exit__");
    body.load_const(Value::None);
    body.op(OpCode::ReturnValue);

    b.op(OpCode::LoadBuildClass);
    b.load_const(Value::Code(Rc::new(body.build())));
    b.load_const(Value::from_str("CM"));
    b.op_arg(OpCode::MakeFunction, 0);
    b.load_const(Value::from_str("CM"));
    b.op_arg(OpCode::CallFunction, 2);
    b.op_name(OpCode::StoreName, "CM");
}

#[test]
fn test_with_normal_flow_py36() {
    // with CM() as x: print(x)
    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    emit_cm_class(&mut b, PyVersion::Py36, false);

    let fin = b.label();
    b.op_name(OpCode::LoadName, "CM");
    b.op_arg(OpCode::CallFunction, 0);
    b.op_jump(OpCode::SetupWith, fin);
    b.op_name(OpCode::StoreName, "x");
    b.op_name(OpCode::LoadName, "print");
    b.op_name(OpCode::LoadName, "x");
    b.op_arg(OpCode::CallFunction, 1);
    b.op(OpCode::PopTop);
    b.op(OpCode::PopBlock);
    b.load_const(Value::None);
    b.bind(fin);
    b.op(OpCode::WithCleanupStart);
    b.op(OpCode::WithCleanupFinish);
    b.op(OpCode::EndFinally);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, out) = capture_vm(PyVersion::Py36);
    vm.run_code(Rc::new(b.build()), None, None).unwrap();
    assert_eq!(output(&out), "enter\n5\nexit\n");
}

#[test]
fn test_with_exception_runs_exit_and_propagates() {
    // with CM(): raise ValueError('inside')   -- exit returns False
    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    emit_cm_class(&mut b, PyVersion::Py36, false);

    let fin = b.label();
    b.op_name(OpCode::LoadName, "CM");
    b.op_arg(OpCode::CallFunction, 0);
    b.op_jump(OpCode::SetupWith, fin);
    b.op(OpCode::PopTop);
    b.op_name(OpCode::LoadName, "ValueError");
    b.load_const(Value::from_str("inside"));
    b.op_arg(OpCode::CallFunction, 1);
    b.op_arg(OpCode::RaiseVarargs, 1);
    b.op(OpCode::PopBlock);
    b.load_const(Value::None);
    b.bind(fin);
    b.op(OpCode::WithCleanupStart);
    b.op(OpCode::WithCleanupFinish);
    b.op(OpCode::EndFinally);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, out) = capture_vm(PyVersion::Py36);
    let err = vm.run_code(Rc::new(b.build()), None, None).unwrap_err();
    assert!(err.is_kind(ExcKind::ValueError));
    assert_eq!(output(&out), "enter\nexit\n");
}

#[test]
fn test_with_exception_suppressed_by_exit() {
    // with CM(): raise ValueError('inside')   -- exit returns True
    // print('after')
    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    emit_cm_class(&mut b, PyVersion::Py36, true);

    let fin = b.label();
    b.op_name(OpCode::LoadName, "CM");
    b.op_arg(OpCode::CallFunction, 0);
    b.op_jump(OpCode::SetupWith, fin);
    b.op(OpCode::PopTop);
    b.op_name(OpCode::LoadName, "ValueError");
    b.load_const(Value::from_str("inside"));
    b.op_arg(OpCode::CallFunction, 1);
    b.op_arg(OpCode::RaiseVarargs, 1);
    b.op(OpCode::PopBlock);
    b.load_const(Value::None);
    b.bind(fin);
    b.op(OpCode::WithCleanupStart);
    b.op(OpCode::WithCleanupFinish);
    b.op(OpCode::EndFinally);
    b.op_name(OpCode::LoadName, "print");
    b.load_const(Value::from_str("after"));
    b.op_arg(OpCode::CallFunction, 1);
    b.op(OpCode::PopTop);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, out) = capture_vm(PyVersion::Py36);
    vm.run_code(Rc::new(b.build()), None, None).unwrap();
    assert_eq!(output(&out), "enter\nexit\nafter\n");
}

#[test]
fn test_with_single_cleanup_opcode_py34() {
    // The 3.4 WITH_CLEANUP combines start and finish.
    let mut b = CodeBuilder::new(PyVersion::Py34, "<module>");
    emit_cm_class(&mut b, PyVersion::Py34, false);

    let fin = b.label();
    b.op_name(OpCode::LoadName, "CM");
    b.op_arg(OpCode::CallFunction, 0);
    b.op_jump(OpCode::SetupWith, fin);
    b.op_name(OpCode::StoreName, "x");
    b.op_name(OpCode::LoadName, "print");
    b.op_name(OpCode::LoadName, "x");
    b.op_arg(OpCode::CallFunction, 1);
    b.op(OpCode::PopTop);
    b.op(OpCode::PopBlock);
    b.load_const(Value::None);
    b.bind(fin);
    b.op(OpCode::WithCleanup);
    b.op(OpCode::EndFinally);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, out) = capture_vm(PyVersion::Py34);
    vm.run_code(Rc::new(b.build()), None, None).unwrap();
    assert_eq!(output(&out), "enter\n5\nexit\n");
}
