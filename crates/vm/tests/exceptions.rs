//! Exception raising, catching, and finally semantics (3.4–3.7 model).

mod common;

use std::rc::Rc;

use pyrun_vm::builder::CodeBuilder;
use pyrun_vm::object::exception::ExcKind;
use pyrun_vm::object::Value;
use pyrun_vm::op_code::OpCode;
use pyrun_vm::version::PyVersion;

use common::{capture_vm, output};

/// Emits `raise <name>('<message>')`.
fn emit_raise(b: &mut CodeBuilder, exc_name: &str, message: &str) {
    b.op_name(OpCode::LoadName, exc_name);
    b.load_const(Value::from_str(message));
    b.op_arg(OpCode::CallFunction, 1);
    b.op_arg(OpCode::RaiseVarargs, 1);
}

/// Emits `print(<const str>)`.
fn emit_print(b: &mut CodeBuilder, text: &str) {
    b.op_name(OpCode::LoadName, "print");
    b.load_const(Value::from_str(text));
    b.op_arg(OpCode::CallFunction, 1);
    b.op(OpCode::PopTop);
}

#[test]
fn test_raise_and_catch() {
    // try:
    //     raise ValueError('oops')
    // except ValueError as e:
    //     print(e)
    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    let handler = b.label();
    let reraise = b.label();
    let end = b.label();

    b.op_jump(OpCode::SetupExcept, handler);
    emit_raise(&mut b, "ValueError", "oops");
    b.op(OpCode::PopBlock);
    b.op_jump(OpCode::JumpForward, end);

    b.bind(handler);
    b.op(OpCode::DupTop);
    b.op_name(OpCode::LoadName, "ValueError");
    b.op_arg(OpCode::CompareOp, 10);
    b.op_jump(OpCode::PopJumpIfFalse, reraise);
    b.op(OpCode::PopTop);
    b.op_name(OpCode::StoreName, "e");
    b.op(OpCode::PopTop);
    b.op_name(OpCode::LoadName, "print");
    b.op_name(OpCode::LoadName, "e");
    b.op_arg(OpCode::CallFunction, 1);
    b.op(OpCode::PopTop);
    b.op(OpCode::PopExcept);
    b.op_jump(OpCode::JumpForward, end);

    b.bind(reraise);
    b.op(OpCode::EndFinally);

    b.bind(end);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, out) = capture_vm(PyVersion::Py36);
    vm.run_code(Rc::new(b.build()), None, None).unwrap();
    assert_eq!(output(&out), "oops\n");
}

#[test]
fn test_mismatched_handler_reraises() {
    // try: raise ValueError('nope')
    // except TypeError: print('caught')
    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    let handler = b.label();
    let reraise = b.label();
    let end = b.label();

    b.op_jump(OpCode::SetupExcept, handler);
    emit_raise(&mut b, "ValueError", "nope");
    b.op(OpCode::PopBlock);
    b.op_jump(OpCode::JumpForward, end);

    b.bind(handler);
    b.op(OpCode::DupTop);
    b.op_name(OpCode::LoadName, "TypeError");
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

    let (mut vm, out) = capture_vm(PyVersion::Py36);
    let err = vm.run_code(Rc::new(b.build()), None, None).unwrap_err();
    assert!(err.is_kind(ExcKind::ValueError));
    assert_eq!(output(&out), "");
}

#[test]
fn test_bare_raise_reraises_current() {
    // try: raise ValueError('x')
    // except: raise
    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    let handler = b.label();
    let end = b.label();

    b.op_jump(OpCode::SetupExcept, handler);
    emit_raise(&mut b, "ValueError", "x");
    b.op(OpCode::PopBlock);
    b.op_jump(OpCode::JumpForward, end);

    b.bind(handler);
    b.op(OpCode::PopTop);
    b.op(OpCode::PopTop);
    b.op(OpCode::PopTop);
    b.op_arg(OpCode::RaiseVarargs, 0);

    b.bind(end);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let err = vm.run_code(Rc::new(b.build()), None, None).unwrap_err();
    assert_eq!(err.to_string(), "ValueError: x");
}

#[test]
fn test_bare_raise_outside_handler() {
    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    b.op_arg(OpCode::RaiseVarargs, 0);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let err = vm.run_code(Rc::new(b.build()), None, None).unwrap_err();
    assert_eq!(err.to_string(), "RuntimeError: No active exception to re-raise");
}

#[test]
fn test_raise_from_sets_cause() {
    // raise ValueError('v') from TypeError('t')
    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    b.op_name(OpCode::LoadName, "ValueError");
    b.load_const(Value::from_str("v"));
    b.op_arg(OpCode::CallFunction, 1);
    b.op_name(OpCode::LoadName, "TypeError");
    b.load_const(Value::from_str("t"));
    b.op_arg(OpCode::CallFunction, 1);
    b.op_arg(OpCode::RaiseVarargs, 2);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let err = vm.run_code(Rc::new(b.build()), None, None).unwrap_err();
    let exc = err.into_raised().unwrap();
    assert_eq!(exc.to_string(), "ValueError: v");
    let cause = exc.cause().expect("cause is recorded");
    assert_eq!(cause.to_string(), "TypeError: t");
}

#[test]
fn test_finally_runs_on_normal_exit() {
    // try: print('body')
    // finally: print('cleanup')
    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    let fin = b.label();

    b.op_jump(OpCode::SetupFinally, fin);
    emit_print(&mut b, "body");
    b.op(OpCode::PopBlock);
    b.load_const(Value::None);
    b.bind(fin);
    emit_print(&mut b, "cleanup");
    b.op(OpCode::EndFinally);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, out) = capture_vm(PyVersion::Py36);
    vm.run_code(Rc::new(b.build()), None, None).unwrap();
    assert_eq!(output(&out), "body\ncleanup\n");
}

#[test]
fn test_finally_runs_on_exception_then_reraises() {
    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    let fin = b.label();

    b.op_jump(OpCode::SetupFinally, fin);
    emit_raise(&mut b, "ValueError", "boom");
    b.op(OpCode::PopBlock);
    b.load_const(Value::None);
    b.bind(fin);
    emit_print(&mut b, "cleanup");
    b.op(OpCode::EndFinally);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, out) = capture_vm(PyVersion::Py36);
    let err = vm.run_code(Rc::new(b.build()), None, None).unwrap_err();
    assert!(err.is_kind(ExcKind::ValueError));
    assert_eq!(output(&out), "cleanup\n");
}

/// A function body `try: return 'from_try' finally: return 'from_finally'`.
fn finally_override_function(version: PyVersion) -> CodeBuilder {
    let mut f = CodeBuilder::new(version, "fn");
    let fin = f.label();
    f.op_jump(OpCode::SetupFinally, fin);
    f.load_const(Value::from_str("from_try"));
    f.op(OpCode::ReturnValue);
    f.bind(fin);
    f.load_const(Value::from_str("from_finally"));
    f.op(OpCode::ReturnValue);
    f
}

#[test]
fn test_return_in_finally_overrides_pending_return() {
    let func_code = finally_override_function(PyVersion::Py36).build();

    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    b.load_const(Value::Code(Rc::new(func_code)));
    b.load_const(Value::from_str("fn"));
    b.op_arg(OpCode::MakeFunction, 0);
    b.op_arg(OpCode::CallFunction, 0);
    b.op(OpCode::ReturnValue);

    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let result = vm.run_code(Rc::new(b.build()), None, None).unwrap();
    assert_eq!(result, Value::from_str("from_finally"));
}

#[test]
fn test_finally_preserves_pending_return_without_own_return() {
    // def fn():
    //     try: return 'kept'
    //     finally: print('fin')
    let mut f = CodeBuilder::new(PyVersion::Py36, "fn");
    let fin = f.label();
    f.op_jump(OpCode::SetupFinally, fin);
    f.load_const(Value::from_str("kept"));
    f.op(OpCode::ReturnValue);
    f.bind(fin);
    emit_print(&mut f, "fin");
    f.op(OpCode::EndFinally);
    f.load_const(Value::None);
    f.op(OpCode::ReturnValue);

    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    b.load_const(Value::Code(Rc::new(f.build())));
    b.load_const(Value::from_str("fn"));
    b.op_arg(OpCode::MakeFunction, 0);
    b.op_arg(OpCode::CallFunction, 0);
    b.op(OpCode::ReturnValue);

    let (mut vm, out) = capture_vm(PyVersion::Py36);
    let result = vm.run_code(Rc::new(b.build()), None, None).unwrap();
    assert_eq!(result, Value::from_str("kept"));
    assert_eq!(output(&out), "fin\n");
}

#[test]
fn test_loop_try_finally_interleaving() {
    // l = []
    // for i in range(3):
    //     try: l.append(i)
    //     finally: l.append('f')
    //     l.append('e')
    // l.append('r')
    // print(l)
    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    let after = b.label();
    let loop_top = b.label();
    let loop_end = b.label();
    let fin = b.label();

    let append = |b: &mut CodeBuilder, push: &dyn Fn(&mut CodeBuilder)| {
        b.op_name(OpCode::LoadName, "l");
        b.op_name(OpCode::LoadAttr, "append");
        push(b);
        b.op_arg(OpCode::CallFunction, 1);
        b.op(OpCode::PopTop);
    };

    b.op_arg(OpCode::BuildList, 0);
    b.op_name(OpCode::StoreName, "l");
    b.op_jump(OpCode::SetupLoop, after);
    b.op_name(OpCode::LoadName, "range");
    b.load_const(Value::from_i64(3));
    b.op_arg(OpCode::CallFunction, 1);
    b.op(OpCode::GetIter);
    b.bind(loop_top);
    b.op_jump(OpCode::ForIter, loop_end);
    b.op_name(OpCode::StoreName, "i");

    b.op_jump(OpCode::SetupFinally, fin);
    append(&mut b, &|b| {
        b.op_name(OpCode::LoadName, "i");
    });
    b.op(OpCode::PopBlock);
    b.load_const(Value::None);
    b.bind(fin);
    append(&mut b, &|b| {
        b.load_const(Value::from_str("f"));
    });
    b.op(OpCode::EndFinally);
    append(&mut b, &|b| {
        b.load_const(Value::from_str("e"));
    });
    b.op_jump(OpCode::JumpAbsolute, loop_top);
    b.bind(loop_end);
    b.op(OpCode::PopBlock);
    b.bind(after);
    append(&mut b, &|b| {
        b.load_const(Value::from_str("r"));
    });
    b.op_name(OpCode::LoadName, "print");
    b.op_name(OpCode::LoadName, "l");
    b.op_arg(OpCode::CallFunction, 1);
    b.op(OpCode::PopTop);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, out) = capture_vm(PyVersion::Py36);
    vm.run_code(Rc::new(b.build()), None, None).unwrap();
    assert_eq!(
        output(&out),
        "[0, 'f', 'e', 1, 'f', 'e', 2, 'f', 'e', 'r']\n"
    );
}

#[test]
fn test_nested_finally_return_overrides_exception() {
    // def fn():
    //     try:
    //         try: raise ValueError('inner')
    //         finally: print('finally_1')
    //     finally:
    //         print('finally_2')
    //         return 'return from finally_2'
    let mut f = CodeBuilder::new(PyVersion::Py36, "fn");
    let fin1 = f.label();
    let fin2 = f.label();

    f.op_jump(OpCode::SetupFinally, fin2);
    f.op_jump(OpCode::SetupFinally, fin1);
    emit_raise(&mut f, "ValueError", "inner");
    f.op(OpCode::PopBlock);
    f.load_const(Value::None);
    f.bind(fin1);
    emit_print(&mut f, "finally_1");
    f.op(OpCode::EndFinally);
    f.op(OpCode::PopBlock);
    f.load_const(Value::None);
    f.bind(fin2);
    emit_print(&mut f, "finally_2");
    f.load_const(Value::from_str("return from finally_2"));
    f.op(OpCode::ReturnValue);

    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    b.load_const(Value::Code(Rc::new(f.build())));
    b.load_const(Value::from_str("fn"));
    b.op_arg(OpCode::MakeFunction, 0);
    b.op_arg(OpCode::CallFunction, 0);
    b.op(OpCode::ReturnValue);

    let (mut vm, out) = capture_vm(PyVersion::Py36);
    let result = vm.run_code(Rc::new(b.build()), None, None).unwrap();
    assert_eq!(result, Value::from_str("return from finally_2"));
    assert_eq!(output(&out), "finally_1\nfinally_2\n");
}

#[test]
fn test_nested_try_catch_return_in_finally() {
    // def fn():
    //     try:
    //         try:
    //             try:
    //                 print('--- try_1')
    //                 raise ValueError
    //             except RuntimeError:
    //                 print('--- except_1 for RuntimeError')
    //                 # no raise here
    //             except ValueError:
    //                 print('--- except_1 for ValueError')
    //                 raise
    //             finally:
    //                 print('--- finally_1')
    //         except:
    //             print('--- except_2')
    //             raise
    //         finally:
    //             print('--- finally_2')
    //             return 'return from finally_2'  # <--- here
    //     except RuntimeError:
    //         print('--- except_3 for RuntimeError')
    //         return 'exc3-RuntimeError'
    //     except ValueError:
    //         print('--- except_3 for ValueError')
    //         return 'exc3-ValueError'
    //     finally:
    //         print('---finally_3')
    // print(fn())
    let mut f = CodeBuilder::new(PyVersion::Py36, "fn");

    let print_global = |f: &mut CodeBuilder, text: &str| {
        f.op_name(OpCode::LoadGlobal, "print");
        f.load_const(Value::from_str(text));
        f.op_arg(OpCode::CallFunction, 1);
        f.op(OpCode::PopTop);
    };

    let fin3 = f.label();
    let h3 = f.label();
    let h3_check_ve = f.label();
    let h3_reraise = f.label();
    let l3_done = f.label();
    let fin2 = f.label();
    let h2 = f.label();
    let l2_done = f.label();
    let fin1 = f.label();
    let h1 = f.label();
    let h1_check_ve = f.label();
    let h1_reraise = f.label();
    let l1_done = f.label();

    f.op_jump(OpCode::SetupFinally, fin3);
    f.op_jump(OpCode::SetupExcept, h3);
    f.op_jump(OpCode::SetupFinally, fin2);
    f.op_jump(OpCode::SetupExcept, h2);
    f.op_jump(OpCode::SetupFinally, fin1);
    f.op_jump(OpCode::SetupExcept, h1);
    print_global(&mut f, "--- try_1");
    f.op_name(OpCode::LoadGlobal, "ValueError");
    f.op_arg(OpCode::RaiseVarargs, 1);
    f.op(OpCode::PopBlock);
    f.op_jump(OpCode::JumpForward, l1_done);

    // except RuntimeError: print, fall through without re-raising
    f.bind(h1);
    f.op(OpCode::DupTop);
    f.op_name(OpCode::LoadGlobal, "RuntimeError");
    f.op_arg(OpCode::CompareOp, 10);
    f.op_jump(OpCode::PopJumpIfFalse, h1_check_ve);
    f.op(OpCode::PopTop);
    f.op(OpCode::PopTop);
    f.op(OpCode::PopTop);
    print_global(&mut f, "--- except_1 for RuntimeError");
    f.op(OpCode::PopExcept);
    f.op_jump(OpCode::JumpForward, l1_done);

    // except ValueError: print and bare-raise
    f.bind(h1_check_ve);
    f.op(OpCode::DupTop);
    f.op_name(OpCode::LoadGlobal, "ValueError");
    f.op_arg(OpCode::CompareOp, 10);
    f.op_jump(OpCode::PopJumpIfFalse, h1_reraise);
    f.op(OpCode::PopTop);
    f.op(OpCode::PopTop);
    f.op(OpCode::PopTop);
    print_global(&mut f, "--- except_1 for ValueError");
    f.op_arg(OpCode::RaiseVarargs, 0);
    f.op(OpCode::PopExcept);
    f.op_jump(OpCode::JumpForward, l1_done);

    f.bind(h1_reraise);
    f.op(OpCode::EndFinally);

    f.bind(l1_done);
    f.op(OpCode::PopBlock);
    f.load_const(Value::None);
    f.bind(fin1);
    print_global(&mut f, "--- finally_1");
    f.op(OpCode::EndFinally);

    // back in the middle try body
    f.op(OpCode::PopBlock);
    f.op_jump(OpCode::JumpForward, l2_done);

    // bare except: print and re-raise
    f.bind(h2);
    f.op(OpCode::PopTop);
    f.op(OpCode::PopTop);
    f.op(OpCode::PopTop);
    print_global(&mut f, "--- except_2");
    f.op_arg(OpCode::RaiseVarargs, 0);
    f.op(OpCode::PopExcept);
    f.op_jump(OpCode::JumpForward, l2_done);

    f.bind(l2_done);
    f.op(OpCode::PopBlock);
    f.load_const(Value::None);
    f.bind(fin2);
    print_global(&mut f, "--- finally_2");
    f.load_const(Value::from_str("return from finally_2"));
    f.op(OpCode::ReturnValue);
    f.op(OpCode::EndFinally);

    // back in the outer try body
    f.op(OpCode::PopBlock);
    f.op_jump(OpCode::JumpForward, l3_done);

    // except RuntimeError: print and return
    f.bind(h3);
    f.op(OpCode::DupTop);
    f.op_name(OpCode::LoadGlobal, "RuntimeError");
    f.op_arg(OpCode::CompareOp, 10);
    f.op_jump(OpCode::PopJumpIfFalse, h3_check_ve);
    f.op(OpCode::PopTop);
    f.op(OpCode::PopTop);
    f.op(OpCode::PopTop);
    print_global(&mut f, "--- except_3 for RuntimeError");
    f.op(OpCode::PopExcept);
    f.load_const(Value::from_str("exc3-RuntimeError"));
    f.op(OpCode::ReturnValue);

    // except ValueError: print and return
    f.bind(h3_check_ve);
    f.op(OpCode::DupTop);
    f.op_name(OpCode::LoadGlobal, "ValueError");
    f.op_arg(OpCode::CompareOp, 10);
    f.op_jump(OpCode::PopJumpIfFalse, h3_reraise);
    f.op(OpCode::PopTop);
    f.op(OpCode::PopTop);
    f.op(OpCode::PopTop);
    print_global(&mut f, "--- except_3 for ValueError");
    f.op(OpCode::PopExcept);
    f.load_const(Value::from_str("exc3-ValueError"));
    f.op(OpCode::ReturnValue);

    f.bind(h3_reraise);
    f.op(OpCode::EndFinally);

    f.bind(l3_done);
    f.op(OpCode::PopBlock);
    f.load_const(Value::None);
    f.bind(fin3);
    print_global(&mut f, "---finally_3");
    f.op(OpCode::EndFinally);
    f.load_const(Value::None);
    f.op(OpCode::ReturnValue);

    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    b.load_const(Value::Code(Rc::new(f.build())));
    b.load_const(Value::from_str("fn"));
    b.op_arg(OpCode::MakeFunction, 0);
    b.op_name(OpCode::StoreName, "fn");
    b.op_name(OpCode::LoadName, "print");
    b.op_name(OpCode::LoadName, "fn");
    b.op_arg(OpCode::CallFunction, 0);
    b.op_arg(OpCode::CallFunction, 1);
    b.op(OpCode::PopTop);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, out) = capture_vm(PyVersion::Py36);
    vm.run_code(Rc::new(b.build()), None, None).unwrap();
    // The middle finally's return wins over the in-flight ValueError, so
    // the outer except clauses never run; the outer finally still does.
    assert_eq!(
        output(&out),
        "--- try_1\n\
         --- except_1 for ValueError\n\
         --- finally_1\n\
         --- except_2\n\
         --- finally_2\n\
         ---finally_3\n\
         return from finally_2\n"
    );
}

#[test]
fn test_user_exception_class_caught_by_base() {
    // class MyError(ValueError): pass
    // try: raise MyError('custom')
    // except ValueError as e: print(e)
    let mut body = CodeBuilder::new(PyVersion::Py36, "MyError");
    body.load_const(Value::None);
    body.op(OpCode::ReturnValue);

    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    let handler = b.label();
    let reraise = b.label();
    let end = b.label();

    b.op(OpCode::LoadBuildClass);
    b.load_const(Value::Code(Rc::new(body.build())));
    b.load_const(Value::from_str("MyError"));
    b.op_arg(OpCode::MakeFunction, 0);
    b.load_const(Value::from_str("MyError"));
    b.op_name(OpCode::LoadName, "ValueError");
    b.op_arg(OpCode::CallFunction, 3);
    b.op_name(OpCode::StoreName, "MyError");

    b.op_jump(OpCode::SetupExcept, handler);
    emit_raise(&mut b, "MyError", "custom");
    b.op(OpCode::PopBlock);
    b.op_jump(OpCode::JumpForward, end);

    b.bind(handler);
    b.op(OpCode::DupTop);
    b.op_name(OpCode::LoadName, "ValueError");
    b.op_arg(OpCode::CompareOp, 10);
    b.op_jump(OpCode::PopJumpIfFalse, reraise);
    b.op(OpCode::PopTop);
    b.op_name(OpCode::StoreName, "e");
    b.op(OpCode::PopTop);
    b.op_name(OpCode::LoadName, "print");
    b.op_name(OpCode::LoadName, "e");
    b.op_arg(OpCode::CallFunction, 1);
    b.op(OpCode::PopTop);
    b.op(OpCode::PopExcept);
    b.op_jump(OpCode::JumpForward, end);

    b.bind(reraise);
    b.op(OpCode::EndFinally);

    b.bind(end);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, out) = capture_vm(PyVersion::Py36);
    vm.run_code(Rc::new(b.build()), None, None).unwrap();
    assert_eq!(output(&out), "custom\n");
}

#[test]
fn test_nested_except_restores_outer_exception() {
    // The inner handler's bare raise after POP_EXCEPT must re-raise the
    // *outer* exception being handled.
    //
    // try: raise ValueError('outer')
    // except:
    //     try: raise TypeError('inner')
    //     except: pass
    //     raise
    let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
    let outer_handler = b.label();
    let inner_handler = b.label();
    let after_inner = b.label();
    let end = b.label();

    b.op_jump(OpCode::SetupExcept, outer_handler);
    emit_raise(&mut b, "ValueError", "outer");
    b.op(OpCode::PopBlock);
    b.op_jump(OpCode::JumpForward, end);

    b.bind(outer_handler);
    b.op(OpCode::PopTop);
    b.op(OpCode::PopTop);
    b.op(OpCode::PopTop);

    b.op_jump(OpCode::SetupExcept, inner_handler);
    emit_raise(&mut b, "TypeError", "inner");
    b.op(OpCode::PopBlock);
    b.op_jump(OpCode::JumpForward, after_inner);
    b.bind(inner_handler);
    b.op(OpCode::PopTop);
    b.op(OpCode::PopTop);
    b.op(OpCode::PopTop);
    b.op(OpCode::PopExcept);
    b.bind(after_inner);
    b.op_arg(OpCode::RaiseVarargs, 0);

    b.bind(end);
    b.load_const(Value::None);
    b.op(OpCode::ReturnValue);

    let (mut vm, _) = capture_vm(PyVersion::Py36);
    let err = vm.run_code(Rc::new(b.build()), None, None).unwrap_err();
    assert_eq!(err.to_string(), "ValueError: outer");
}
