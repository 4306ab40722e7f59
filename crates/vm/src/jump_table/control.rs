//! Control flow opcodes: jumps, loops, blocks, exception machinery,
//! `with` statements, and the 3.8 finally model.

use std::rc::Rc;

use crate::error::{VmError, VmResult};
use crate::frame::BlockKind;
use crate::jump_table::{JumpTable, Operand};
use crate::object::exception::{normalize_exception, ExcKind};
use crate::object::Value;
use crate::op_code::OpCode;
use crate::protocol;
use crate::scratch::ExcTriple;
use crate::vm::Vm;
use crate::why::Why;

/// Registers the control flow handlers.
pub fn register_handlers(table: &mut JumpTable) {
    table.register(OpCode::JumpForward, jump_to);
    table.register(OpCode::JumpAbsolute, jump_to);
    table.register(OpCode::PopJumpIfFalse, pop_jump_if_false);
    table.register(OpCode::PopJumpIfTrue, pop_jump_if_true);
    table.register(OpCode::JumpIfFalseOrPop, jump_if_false_or_pop);
    table.register(OpCode::JumpIfTrueOrPop, jump_if_true_or_pop);
    table.register(OpCode::GetIter, get_iter);
    table.register(OpCode::GetYieldFromIter, get_yield_from_iter);
    table.register(OpCode::ForIter, for_iter);
    table.register(OpCode::BreakLoop, break_loop);
    table.register(OpCode::ContinueLoop, continue_loop);
    table.register(OpCode::SetupLoop, |vm, operand| {
        setup_block(vm, operand, BlockKind::Loop)
    });
    table.register(OpCode::SetupExcept, |vm, operand| {
        setup_block(vm, operand, BlockKind::Except)
    });
    table.register(OpCode::SetupFinally, |vm, operand| {
        setup_block(vm, operand, BlockKind::Finally)
    });
    table.register(OpCode::PopBlock, pop_block);
    table.register(OpCode::PopExcept, pop_except);
    table.register(OpCode::RaiseVarargs, raise_varargs);
    table.register(OpCode::EndFinally, end_finally);
    table.register(OpCode::ReturnValue, return_value);
    table.register(OpCode::ExtendedArg, extended_arg);
    table.register(OpCode::SetupWith, setup_with);
    table.register(OpCode::WithCleanup, with_cleanup_py34);
    table.register(OpCode::WithCleanupStart, with_cleanup_start);
    table.register(OpCode::WithCleanupFinish, with_cleanup_finish);
    table.register(OpCode::PrintExpr, print_expr);
    // 3.8 finally model.
    table.register(OpCode::BeginFinally, begin_finally);
    table.register(OpCode::CallFinally, call_finally);
    table.register(OpCode::PopFinally, pop_finally);
    table.register(OpCode::EndAsyncFor, end_async_for);
}

fn jump_to(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let target = operand.jump()?;
    vm.frame()?.borrow_mut().jump(target);
    Ok(None)
}

fn pop_jump_if_false(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let target = operand.jump()?;
    let frame = vm.frame()?;
    let value = frame.borrow_mut().pop()?;
    if !protocol::truthy(vm, &value)? {
        frame.borrow_mut().jump(target);
    }
    Ok(None)
}

fn pop_jump_if_true(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let target = operand.jump()?;
    let frame = vm.frame()?;
    let value = frame.borrow_mut().pop()?;
    if protocol::truthy(vm, &value)? {
        frame.borrow_mut().jump(target);
    }
    Ok(None)
}

fn jump_if_false_or_pop(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let target = operand.jump()?;
    let frame = vm.frame()?;
    let value = frame.borrow().top()?;
    if !protocol::truthy(vm, &value)? {
        frame.borrow_mut().jump(target);
    } else {
        frame.borrow_mut().pop()?;
    }
    Ok(None)
}

fn jump_if_true_or_pop(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let target = operand.jump()?;
    let frame = vm.frame()?;
    let value = frame.borrow().top()?;
    if protocol::truthy(vm, &value)? {
        frame.borrow_mut().jump(target);
    } else {
        frame.borrow_mut().pop()?;
    }
    Ok(None)
}

fn get_iter(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let value = frame.borrow_mut().pop()?;
    let iterator = protocol::iter_value(vm, value)?;
    frame.borrow_mut().push(iterator);
    Ok(None)
}

fn get_yield_from_iter(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let top = frame.borrow().top()?;
    // Generators and coroutine iterators delegate as-is.
    if matches!(
        top,
        Value::Generator(_) | Value::Coroutine(_) | Value::CoroutineIter(_)
    ) {
        return Ok(None);
    }
    let value = frame.borrow_mut().pop()?;
    let iterator = protocol::iter_value(vm, value)?;
    frame.borrow_mut().push(iterator);
    Ok(None)
}

fn for_iter(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let target = operand.jump()?;
    let frame = vm.frame()?;
    let iterator = frame.borrow().top()?;
    match protocol::next_value(vm, &iterator) {
        Ok(element) => {
            frame.borrow_mut().push(element);
            Ok(None)
        }
        Err(err) => {
            let exc = err.into_raised()?;
            if exc.derives_from(ExcKind::StopIteration) {
                let mut frame = frame.borrow_mut();
                frame.pop()?;
                frame.jump(target);
                Ok(None)
            } else {
                Err(VmError::Raised(exc))
            }
        }
    }
}

fn break_loop(_vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    Ok(Some(Why::Break))
}

fn continue_loop(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let target = operand.jump()?;
    vm.scratch.return_value = Value::from_i64(target as i64);
    Ok(Some(Why::Continue))
}

fn setup_block(vm: &mut Vm, operand: Operand, kind: BlockKind) -> VmResult<Option<Why>> {
    let handler = operand.jump()?;
    vm.frame()?.borrow_mut().push_block(kind, handler);
    Ok(None)
}

fn pop_block(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    vm.frame()?.borrow_mut().pop_block()?;
    Ok(None)
}

fn pop_except(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let mut frame = frame.borrow_mut();
    let block = frame.pop_block()?;
    if block.kind != BlockKind::ExceptHandler {
        return Err(VmError::fault("popped block is not an except handler"));
    }
    frame.unwind_except_handler(&block, &mut vm.scratch)?;
    Ok(None)
}

fn raise_varargs(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let argc = operand.raw()?;
    let frame = vm.frame()?;
    let args = frame.borrow_mut().popn(argc as usize)?;
    let mut args = args.into_iter();
    let exc = args.next();
    let cause = args.next();
    do_raise(vm, exc, cause)
}

/// `RAISE_VARARGS` semantics: re-raise, raise, or raise-from.
fn do_raise(vm: &mut Vm, exc: Option<Value>, cause: Option<Value>) -> VmResult<Option<Why>> {
    let exc = match exc {
        None => {
            // Bare `raise`: re-raise the exception being handled.
            let current = vm
                .scratch
                .current_exception
                .clone()
                .and_then(|t| t.exception());
            return match current {
                Some(exc) => {
                    vm.scratch.last_exception = Some(ExcTriple::from_exception(exc));
                    Ok(Some(Why::Reraise))
                }
                None => Err(VmError::runtime_error("No active exception to re-raise")),
            };
        }
        Some(exc) => exc,
    };

    let exc = normalize_exception(exc, None)?;
    let exc = Rc::new(exc);
    if let Some(cause) = cause {
        let cause = normalize_exception(cause, None)?;
        exc.set_cause(Some(Rc::new(cause)));
    }
    if let Some(context) = vm
        .scratch
        .current_exception
        .as_ref()
        .and_then(|t| t.exception())
    {
        if !Rc::ptr_eq(&context, &exc) {
            exc.set_context(Some(context));
        }
    }
    vm.scratch.last_exception = Some(ExcTriple::from_exception(exc));
    Ok(Some(Why::Exception))
}

fn end_finally(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let discriminator = frame.borrow_mut().pop()?;
    match discriminator {
        Value::UnwindToken(why) => match why {
            Why::Return | Why::Continue => {
                vm.scratch.return_value = frame.borrow_mut().pop()?;
                Ok(Some(why))
            }
            Why::Silenced => {
                let mut frame = frame.borrow_mut();
                let block = frame.pop_block()?;
                if block.kind != BlockKind::ExceptHandler {
                    return Err(VmError::fault("popped block is not an except handler"));
                }
                frame.unwind_except_handler(&block, &mut vm.scratch)?;
                Ok(None)
            }
            other => Ok(Some(other)),
        },
        Value::None => Ok(None),
        Value::ExcType(_) | Value::Class(_) => {
            let (value, tb) = {
                let mut frame = frame.borrow_mut();
                let value = frame.pop()?;
                let tb = frame.pop()?;
                (value, tb)
            };
            vm.scratch.last_exception = Some(ExcTriple {
                etype: discriminator,
                value,
                tb,
            });
            Ok(Some(Why::Reraise))
        }
        _ => Err(VmError::fault("Confused END_FINALLY")),
    }
}

/// The 3.8 `END_FINALLY`: the discriminator is `None`, a jump target, or
/// an exception type, and re-raising reports plain `exception`.
pub fn end_finally_py38(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let discriminator = frame.borrow_mut().pop()?;
    match discriminator {
        Value::None => Ok(None),
        Value::Int(target) => {
            use num_traits::ToPrimitive;
            let target = target
                .to_usize()
                .ok_or_else(|| VmError::fault("END_FINALLY jump target out of range"))?;
            frame.borrow_mut().jump(target);
            Ok(None)
        }
        Value::ExcType(_) | Value::Class(_) => {
            let (value, tb) = {
                let mut frame = frame.borrow_mut();
                let value = frame.pop()?;
                let tb = frame.pop()?;
                (value, tb)
            };
            vm.scratch.last_exception = Some(ExcTriple {
                etype: discriminator,
                value,
                tb,
            });
            Ok(Some(Why::Exception))
        }
        _ => Err(VmError::fault("Confused END_FINALLY")),
    }
}

fn return_value(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let value = frame.borrow_mut().pop()?;
    vm.scratch.return_value = value;
    let generator = frame.borrow().generator.clone();
    if let Some(gen) = generator.and_then(|weak| weak.upgrade()) {
        gen.borrow_mut().finish();
    }
    Ok(Some(Why::Return))
}

fn extended_arg(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let arg = operand.raw()?;
    vm.scratch.oparg = arg << vm.version().extended_arg_shift();
    Ok(Some(Why::ExtendedArg))
}

fn print_expr(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let value = frame.borrow_mut().pop()?;
    if !matches!(value, Value::None) {
        vm.write_stdout(&format!("{}\n", value.repr()))?;
    }
    Ok(None)
}

// ----------------------------------------------------------------------
// with statements
// ----------------------------------------------------------------------

fn setup_with(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let handler = operand.jump()?;
    let frame = vm.frame()?;
    let manager = frame.borrow_mut().pop()?;
    let exit = protocol::get_attr(vm, &manager, "__exit__")?;
    let enter = protocol::get_attr(vm, &manager, "__enter__")?;
    frame.borrow_mut().push(exit);
    let result = protocol::call_value(vm, enter, vec![], Default::default())?;
    // The finally block records the stack with only __exit__ above it.
    frame.borrow_mut().push_block(BlockKind::Finally, handler);
    frame.borrow_mut().push(result);
    Ok(None)
}

/// Layout produced by exception unwinding for a `with` block:
/// `[exit, shadow_tb, shadow_val, shadow_type, tb, val, type]` with an
/// except-handler block recording the level just above `exit`.
fn with_cleanup_common(vm: &mut Vm) -> VmResult<(Value, Value, Value, Value)> {
    let frame = vm.frame()?;
    let top = frame.borrow().top()?;

    let (exit_func, u, v, w) = match top {
        Value::None => {
            let exit = frame.borrow_mut().pop_at(1)?;
            (exit, Value::None, Value::None, Value::None)
        }
        Value::UnwindToken(why) => {
            let exit = match why {
                Why::Return | Why::Continue => frame.borrow_mut().pop_at(2)?,
                _ => frame.borrow_mut().pop_at(1)?,
            };
            (exit, Value::None, Value::None, Value::None)
        }
        Value::ExcType(_) | Value::Class(_) => {
            let mut f = frame.borrow_mut();
            let triple = f.popn(3)?;
            let [w, v, u]: [_; 3] = triple.try_into().expect("popn(3) yields three values");
            let shadow = f.popn(3)?;
            let exit = f.pop()?;
            for value in shadow {
                f.push(value);
            }
            f.push(Value::None);
            f.push(w.clone());
            f.push(v.clone());
            f.push(u.clone());
            let block = f.pop_block()?;
            if block.kind != BlockKind::ExceptHandler {
                return Err(VmError::fault("Confused WITH_CLEANUP"));
            }
            f.push_block_at(block.kind, block.handler, block.level - 1);
            (exit, u, v, w)
        }
        _ => return Err(VmError::fault("Confused WITH_CLEANUP")),
    };
    Ok((exit_func, u, v, w))
}

fn with_cleanup_py34(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let (exit_func, u, v, w) = with_cleanup_common(vm)?;
    let has_exception = !matches!(u, Value::None);
    let result = protocol::call_value(vm, exit_func, vec![u, v, w], Default::default())?;
    if has_exception && protocol::truthy(vm, &result)? {
        vm.frame()?
            .borrow_mut()
            .push(Value::UnwindToken(Why::Silenced));
    }
    Ok(None)
}

fn with_cleanup_start(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let (exit_func, u, v, w) = with_cleanup_common(vm)?;
    let result =
        protocol::call_value(vm, exit_func, vec![u.clone(), v, w], Default::default())?;
    let frame = vm.frame()?;
    let mut frame = frame.borrow_mut();
    frame.push(u);
    frame.push(result);
    Ok(None)
}

fn with_cleanup_finish(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let (u, result) = {
        let mut frame = frame.borrow_mut();
        let result = frame.pop()?;
        let u = frame.pop()?;
        (u, result)
    };
    if !matches!(u, Value::None) && protocol::truthy(vm, &result)? {
        frame.borrow_mut().push(Value::UnwindToken(Why::Silenced));
    }
    Ok(None)
}

/// The 3.8 variant: suppression unwinds the except-handler block right
/// here and pushes `None`, so `END_FINALLY` resumes normal flow.
pub fn with_cleanup_finish_py38(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let (u, result) = {
        let mut frame = frame.borrow_mut();
        let result = frame.pop()?;
        let u = frame.pop()?;
        (u, result)
    };
    if !matches!(u, Value::None) && protocol::truthy(vm, &result)? {
        let mut frame = frame.borrow_mut();
        let block = frame.pop_block()?;
        if block.kind != BlockKind::ExceptHandler {
            return Err(VmError::fault("Confused WITH_CLEANUP"));
        }
        frame.unwind_except_handler(&block, &mut vm.scratch)?;
        frame.push(Value::None);
    }
    Ok(None)
}

// ----------------------------------------------------------------------
// 3.8 finally model
// ----------------------------------------------------------------------

fn begin_finally(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    vm.frame()?.borrow_mut().push(Value::None);
    Ok(None)
}

fn call_finally(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let target = operand.jump()?;
    let frame = vm.frame()?;
    let mut frame = frame.borrow_mut();
    // The return address is the instruction following this one; the
    // cursor already points there.
    let return_to = frame.lasti;
    frame.push(Value::from_i64(return_to as i64));
    frame.jump(target);
    Ok(None)
}

fn pop_finally(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let preserve_tos = operand.raw()? != 0;
    let frame = vm.frame()?;
    let mut frame = frame.borrow_mut();

    let preserved = if preserve_tos { Some(frame.pop()?) } else { None };

    let discriminator = frame.pop()?;
    match discriminator {
        Value::None | Value::Int(_) => {}
        Value::ExcType(_) | Value::Class(_) => {
            frame.pop()?; // value
            frame.pop()?; // traceback
            let block = frame.pop_block()?;
            if block.kind != BlockKind::ExceptHandler {
                return Err(VmError::fault("popped block is not an except handler"));
            }
            frame.unwind_except_handler(&block, &mut vm.scratch)?;
        }
        _ => return Err(VmError::fault("Confused POP_FINALLY")),
    }

    if let Some(value) = preserved {
        frame.push(value);
    }
    Ok(None)
}

fn end_async_for(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let etype = frame.borrow_mut().pop()?;
    let matches_stop = matches!(
        &etype,
        Value::ExcType(class) if class.is_subclass_of(
            &crate::object::ExcClass::Builtin(ExcKind::StopAsyncIteration)
        )
    );
    if matches_stop {
        let mut frame = frame.borrow_mut();
        frame.pop()?; // value
        frame.pop()?; // traceback
        let block = frame.pop_block()?;
        if block.kind != BlockKind::ExceptHandler {
            return Err(VmError::fault("popped block is not an except handler"));
        }
        frame.unwind_except_handler(&block, &mut vm.scratch)?;
        frame.pop()?; // the exhausted async iterator
        Ok(None)
    } else {
        let (value, tb) = {
            let mut frame = frame.borrow_mut();
            let value = frame.pop()?;
            let tb = frame.pop()?;
            (value, tb)
        };
        vm.scratch.last_exception = Some(ExcTriple { etype, value, tb });
        Ok(Some(Why::Exception))
    }
}
