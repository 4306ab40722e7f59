//! Trace hook events.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use pyrun_vm::builder::CodeBuilder;
use pyrun_vm::object::Value;
use pyrun_vm::op_code::OpCode;
use pyrun_vm::tracing::{TraceDisposition, TraceEventKind};
use pyrun_vm::version::PyVersion;

use common::capture_vm;

fn two_line_program() -> Rc<pyrun_vm::code::CodeObject> {
    // 1: x = 1
    // 2: y = 2
    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    b.line(1);
    b.load_const(Value::from_i64(1));
    b.op_name(OpCode::StoreName, "x");
    b.line(2);
    b.load_const(Value::from_i64(2));
    b.op_name(OpCode::StoreName, "y");
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);
    Rc::new(b.build())
}

#[test]
fn test_call_line_return_sequence() {
    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let events = Rc::new(RefCell::new(Vec::new()));

    let sink = events.clone();
    vm.settrace(Some(Rc::new(move |_vm, event| {
        sink.borrow_mut().push(event.kind.name().to_string());
        Ok(TraceDisposition::Keep)
    })));

    vm.run_code(two_line_program(), None, None).unwrap();

    let events = events.borrow();
    assert_eq!(*events, vec!["call", "line", "line", "return"]);
}

#[test]
fn test_opcode_events_require_frame_flag() {
    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let events = Rc::new(RefCell::new(Vec::new()));

    let sink = events.clone();
    vm.settrace(Some(Rc::new(move |_vm, event| {
        if event.kind == TraceEventKind::Call {
            event.frame.borrow_mut().trace_opcodes = true;
        }
        sink.borrow_mut().push(event.kind.name().to_string());
        Ok(TraceDisposition::Keep)
    })));

    vm.run_code(two_line_program(), None, None).unwrap();

    let events = events.borrow();
    // Six instructions, each reporting an opcode event.
    let opcode_count = events.iter().filter(|e| *e == "opcode").count();
    assert_eq!(opcode_count, 6);
    assert_eq!(events.first().map(String::as_str), Some("call"));
    assert_eq!(events.last().map(String::as_str), Some("return"));
}

#[test]
fn test_exception_event_fires_before_unwinding() {
    // try: raise ValueError('x')
    // except: pass
    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    let handler = b.label();
    let end = b.label();
    b.op_jump(OpCode::SetupExcept, handler);
    b.op_name(OpCode::LoadName, "ValueError");
    b.op_arg(OpCode::CallFunction, 0);
    b.op_arg(OpCode::RaiseVarargs, 1);
    b.op(OpCode::PopBlock);
    b.op_jump(OpCode::JumpForward, end);
    b.bind(handler);
    b.op(OpCode::PopTop);
    b.op(OpCode::PopTop);
    b.op(OpCode::PopTop);
    b.op(OpCode::PopExcept);
    b.bind(end);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    vm.settrace(Some(Rc::new(move |_vm, event| {
        sink.borrow_mut().push(event.kind.name().to_string());
        Ok(TraceDisposition::Keep)
    })));

    vm.run_code(Rc::new(b.build()), None, None).unwrap();

    let events = events.borrow();
    assert!(events.contains(&"exception".to_string()));
    assert_eq!(events.last().map(String::as_str), Some("return"));
}

#[test]
fn test_stop_disposition_clears_frame_trace() {
    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let events = Rc::new(RefCell::new(Vec::new()));

    let sink = events.clone();
    vm.settrace(Some(Rc::new(move |_vm, event| {
        sink.borrow_mut().push(event.kind.name().to_string());
        Ok(TraceDisposition::Stop)
    })));

    let code = two_line_program();
    vm.run_code(code.clone(), None, None).unwrap();

    // The hook still fires (it is installed globally), but the per-frame
    // continuation is cleared each time it returns Stop.
    assert!(events.borrow().contains(&"call".to_string()));
}

#[test]
fn test_line_events_respect_trace_lines_flag() {
    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let events = Rc::new(RefCell::new(Vec::new()));

    let sink = events.clone();
    vm.settrace(Some(Rc::new(move |_vm, event| {
        if event.kind == TraceEventKind::Call {
            event.frame.borrow_mut().trace_lines = false;
        }
        sink.borrow_mut().push(event.kind.name().to_string());
        Ok(TraceDisposition::Keep)
    })));

    vm.run_code(two_line_program(), None, None).unwrap();

    let events = events.borrow();
    assert!(!events.contains(&"line".to_string()));
    assert_eq!(*events, vec!["call", "return"]);
}
