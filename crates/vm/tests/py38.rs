//! The 3.8 bytecode model: explicit finally plumbing, no loop blocks.

mod common;

use std::rc::Rc;

use pyrun_vm::builder::CodeBuilder;
use pyrun_vm::object::exception::ExcKind;
use pyrun_vm::object::Value;
use pyrun_vm::op_code::OpCode;
use pyrun_vm::version::PyVersion;

use common::{capture_vm, output};

fn emit_print(b: &mut CodeBuilder, text: &str) {
    b.op_name(OpCode::LoadName, "print");
    b.load_const(Value::from_str(text));
    b.op_arg(OpCode::CallFunction, 1);
    b.op(OpCode::PopTop);
}

#[test]
fn test_loop_compiles_to_plain_jumps() {
    // for i in range(3): print(i)   -- no SETUP_LOOP in 3.8.
    let mut b = CodeBuilder::new(PyVersion::Py38, "<module>");
    let loop_top = b.label();
    let loop_end = b.label();

    b.op_name(OpCode::LoadName, "range");
    b.load_const(Value::from_i64(3));
    b.op_arg(OpCode::CallFunction, 1);
    b.op(OpCode::GetIter);
    b.bind(loop_top);
    b.op_jump(OpCode::ForIter, loop_end);
    b.op_name(OpCode::StoreName, "i");
    b.op_name(OpCode::LoadName, "print");
    b.op_name(OpCode::LoadName, "i");
    b.op_arg(OpCode::CallFunction, 1);
    b.op(OpCode::PopTop);
    b.op_jump(OpCode::JumpAbsolute, loop_top);
    b.bind(loop_end);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, out) = capture_vm(PyVersion::Py38);
    vm.run_code(Rc::new(b.build()), None, None).unwrap();
    assert_eq!(output(&out), "0\n1\n2\n");
}

#[test]
fn test_begin_finally_normal_path() {
    // try: print('body')
    // finally: print('cleanup')
    let mut b = CodeBuilder::new(PyVersion::Py38, "<module>");
    let fin = b.label();

    b.op_jump(OpCode::SetupFinally, fin);
    emit_print(&mut b, "body");
    b.op(OpCode::PopBlock);
    b.op(OpCode::BeginFinally);
    b.bind(fin);
    emit_print(&mut b, "cleanup");
    b.op(OpCode::EndFinally);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, out) = capture_vm(PyVersion::Py38);
    vm.run_code(Rc::new(b.build()), None, None).unwrap();
    assert_eq!(output(&out), "body\ncleanup\n");
}

#[test]
fn test_finally_runs_on_exception_and_reraises() {
    let mut b = CodeBuilder::new(PyVersion::Py38, "<module>");
    let fin = b.label();

    b.op_jump(OpCode::SetupFinally, fin);
    b.op_name(OpCode::LoadName, "ValueError");
    b.load_const(Value::from_str("boom"));
    b.op_arg(OpCode::CallFunction, 1);
    b.op_arg(OpCode::RaiseVarargs, 1);
    b.op(OpCode::PopBlock);
    b.op(OpCode::BeginFinally);
    b.bind(fin);
    emit_print(&mut b, "cleanup");
    b.op(OpCode::EndFinally);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, out) = capture_vm(PyVersion::Py38);
    let err = vm.run_code(Rc::new(b.build()), None, None).unwrap_err();
    assert!(err.is_kind(ExcKind::ValueError));
    assert_eq!(output(&out), "cleanup\n");
}

#[test]
fn test_call_finally_return_path() {
    // def f():
    //     try: return 'v'
    //     finally: print('f')
    let mut f = CodeBuilder::new(PyVersion::Py38, "f");
    let fin = f.label();

    f.op_jump(OpCode::SetupFinally, fin);
    f.load_const(Value::from_str("v"));
    f.op(OpCode::PopBlock);
    f.op_jump(OpCode::CallFinally, fin);
    f.op(OpCode::ReturnValue);
    f.bind(fin);
    f.op_name(OpCode::LoadGlobal, "print");
    f.load_const(Value::from_str("f"));
    f.op_arg(OpCode::CallFunction, 1);
    f.op(OpCode::PopTop);
    f.op(OpCode::EndFinally);
    f.load_const(Value::None);
    f.op(OpCode::ReturnValue);

    let mut b = CodeBuilder::new(PyVersion::Py38, "<module>");
    b.load_const(Value::Code(Rc::new(f.build())));
    b.load_const(Value::from_str("f"));
    b.op_arg(OpCode::MakeFunction, 0);
    b.op_arg(OpCode::CallFunction, 0);
    b.op(OpCode::ReturnValue);

    let (mut vm, out) = capture_vm(PyVersion::Py38);
    let result = vm.run_code(Rc::new(b.build()), None, None).unwrap();
    assert_eq!(result, Value::from_str("v"));
    assert_eq!(output(&out), "f\n");
}

#[test]
fn test_pop_finally_return_in_finally_overrides() {
    // def f():
    //     try: return 'a'
    //     finally: return 'z'
    let mut f = CodeBuilder::new(PyVersion::Py38, "f");
    let fin = f.label();

    f.op_jump(OpCode::SetupFinally, fin);
    f.load_const(Value::from_str("a"));
    f.op(OpCode::PopBlock);
    f.op_jump(OpCode::CallFinally, fin);
    f.op(OpCode::ReturnValue);
    f.bind(fin);
    f.load_const(Value::from_str("z"));
    f.op_arg(OpCode::PopFinally, 1);
    f.op(OpCode::ReturnValue);

    let mut b = CodeBuilder::new(PyVersion::Py38, "<module>");
    b.load_const(Value::Code(Rc::new(f.build())));
    b.load_const(Value::from_str("f"));
    b.op_arg(OpCode::MakeFunction, 0);
    b.op_arg(OpCode::CallFunction, 0);
    b.op(OpCode::ReturnValue);

    let (mut vm, _) = capture_vm(PyVersion::Py38);
    let result = vm.run_code(Rc::new(b.build()), None, None).unwrap();
    assert_eq!(result, Value::from_str("z"));
}

#[test]
fn test_except_through_setup_finally() {
    // try: raise ValueError('x')
    // except ValueError: print('caught')
    let mut b = CodeBuilder::new(PyVersion::Py38, "<module>");
    let handler = b.label();
    let reraise = b.label();
    let end = b.label();

    b.op_jump(OpCode::SetupFinally, handler);
    b.op_name(OpCode::LoadName, "ValueError");
    b.load_const(Value::from_str("x"));
    b.op_arg(OpCode::CallFunction, 1);
    b.op_arg(OpCode::RaiseVarargs, 1);
    b.op(OpCode::PopBlock);
    b.op_jump(OpCode::JumpForward, end);

    b.bind(handler);
    b.op(OpCode::DupTop);
    b.op_name(OpCode::LoadName, "ValueError");
    b.op_arg(OpCode::CompareOp, 10);
    b.op_jump(OpCode::PopJumpIfFalse, reraise);
    b.op(OpCode::PopTop);
    b.op(OpCode::PopTop);
    b.op(OpCode::PopTop);
    emit_print(&mut b, "caught");
    b.op(OpCode::PopExcept);
    b.op_jump(OpCode::JumpForward, end);
    b.bind(reraise);
    b.op(OpCode::EndFinally);
    b.bind(end);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, out) = capture_vm(PyVersion::Py38);
    vm.run_code(Rc::new(b.build()), None, None).unwrap();
    assert_eq!(output(&out), "caught\n");
}

#[test]
fn test_rot_four_exists_only_in_py38() {
    let mut b = CodeBuilder::new(PyVersion::Py38, "<module>");
    b.load_const(Value::from_i64(1));
    b.load_const(Value::from_i64(2));
    b.load_const(Value::from_i64(3));
    b.load_const(Value::from_i64(4));
    b.op(OpCode::RotFour);
    // Stack is now [4, 1, 2, 3]; return TOS.
    b.op(OpCode::ReturnValue);

    let (mut vm, _) = capture_vm(PyVersion::Py38);
    let result = vm.run_code(Rc::new(b.build()), None, None).unwrap();
    assert_eq!(result, Value::from_i64(3));

    // And the byte does not decode in 3.7.
    let mut old = CodeBuilder::new(PyVersion::Py37, "<module>");
    old.op(OpCode::RotFour);
    assert!(old.try_build().is_err());
}

#[test]
fn test_removed_loop_opcodes_fault_with_version() {
    // A 3.8 stream cannot even encode BREAK_LOOP; the assembler refuses.
    let mut b = CodeBuilder::new(PyVersion::Py38, "<module>");
    b.op(OpCode::BreakLoop);
    assert!(b.try_build().is_err());
}
