//! Suspension opcodes: yields, awaitables, async iteration.

use std::rc::Rc;

use crate::error::{VmError, VmResult};
use crate::frame::BlockKind;
use crate::jump_table::{JumpTable, Operand};
use crate::object::coroutine::{check_not_already_awaited, get_awaitable_iter};
use crate::object::generator::{gen_send_ex, GenFlavor};
use crate::object::{AsyncGenASend, ExcKind, Value};
use crate::op_code::OpCode;
use crate::protocol;
use crate::version::PyVersion;
use crate::vm::Vm;
use crate::why::Why;

/// Registers the suspension handlers.
pub fn register_handlers(table: &mut JumpTable) {
    table.register(OpCode::YieldValue, yield_value);
    table.register(OpCode::YieldFrom, yield_from);
    table.register(OpCode::GetAwaitable, get_awaitable);
    table.register(OpCode::GetAiter, get_aiter);
    table.register(OpCode::GetAnext, get_anext);
    table.register(OpCode::BeforeAsyncWith, before_async_with);
    table.register(OpCode::SetupAsyncWith, setup_async_with);
}

fn yield_value(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let mut value = frame.borrow_mut().pop()?;

    // Values yielded from an async generator body are wrapped so the
    // driving awaitable can distinguish them from awaited results.
    let is_async_gen = frame
        .borrow()
        .generator
        .as_ref()
        .and_then(|weak| weak.upgrade())
        .map(|gen| gen.borrow().flavor == GenFlavor::AsyncGenerator)
        .unwrap_or(false);
    if is_async_gen {
        value = Value::AGenWrapped(Rc::new(value));
    }

    vm.scratch.return_value = value;
    Ok(Some(Why::Yield))
}

fn yield_from(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let (sent, sub) = {
        let mut f = frame.borrow_mut();
        let sent = f.pop()?;
        let sub = f.top()?;
        (sent, sub)
    };

    let step = match &sub {
        Value::Generator(gen) | Value::Coroutine(gen) | Value::CoroutineIter(gen) => {
            gen_send_ex(vm, gen, sent, None)
        }
        Value::AsyncGenASend(asend) => {
            crate::object::async_generator::asend_send(vm, asend, sent)
        }
        Value::AsyncGenAThrow(athrow) => {
            crate::object::async_generator::athrow_send(vm, athrow, sent)
        }
        Value::Instance(_) if !matches!(sent, Value::None) => {
            let send = protocol::get_attr(vm, &sub, "send")?;
            protocol::call_value(vm, send, vec![sent], Default::default())
        }
        _ => protocol::next_value(vm, &sub),
    };

    match step {
        Ok(yielded) => {
            vm.scratch.return_value = yielded;
            // Rewind one instruction unit so resumption re-executes this
            // YIELD_FROM until the delegate is exhausted.
            let unit = vm.version().instruction_unit();
            frame.borrow_mut().lasti -= unit;
            Ok(Some(Why::Yield))
        }
        Err(err) => {
            let exc = err.into_raised()?;
            if exc.derives_from(ExcKind::StopIteration) {
                let mut f = frame.borrow_mut();
                f.pop()?;
                f.push(exc.stop_value());
                Ok(None)
            } else {
                Err(VmError::Raised(exc))
            }
        }
    }
}

fn get_awaitable(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let value = frame.borrow_mut().pop()?;
    let iterator = get_awaitable_iter(vm, &value)?;
    check_not_already_awaited(&iterator)?;
    frame.borrow_mut().push(iterator);
    Ok(None)
}

fn get_aiter(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let value = frame.borrow_mut().pop()?;

    match &value {
        Value::AsyncGenerator(_) => {
            frame.borrow_mut().push(value.clone());
            return Ok(None);
        }
        Value::Instance(_) => {}
        other => {
            return Err(VmError::type_error(format!(
                "'async for' requires an object with __aiter__ method, got {}",
                other.type_name()
            )))
        }
    }

    let dunder = protocol::get_attr(vm, &value, "__aiter__").map_err(|_| {
        VmError::type_error(format!(
            "'async for' requires an object with __aiter__ method, got {}",
            value.type_name()
        ))
    })?;
    let result = protocol::call_value(vm, dunder, vec![], Default::default())?;

    let has_anext = match &result {
        Value::AsyncGenerator(_) => true,
        Value::Instance(_) => protocol::get_attr(vm, &result, "__anext__").is_ok(),
        _ => false,
    };
    if has_anext {
        frame.borrow_mut().push(result);
        return Ok(None);
    }

    // Legacy protocol: an awaitable-returning __aiter__ is adapted with a
    // deprecation warning through 3.6, and rejected from 3.7.
    if vm.version() >= PyVersion::Py37 {
        return Err(VmError::type_error(format!(
            "'async for' received an object from __aiter__ that does not implement __anext__: {}",
            result.type_name()
        )));
    }
    let awaitable = get_awaitable_iter(vm, &result).map_err(|_| {
        VmError::type_error(format!(
            "'async for' received an invalid object from __aiter__: {}",
            result.type_name()
        ))
    })?;
    vm.warn(format!(
        "{} implements legacy __aiter__ protocol; __aiter__ should return an asynchronous iterator, not awaitable",
        value.type_name()
    ));
    frame.borrow_mut().push(awaitable);
    Ok(None)
}

fn get_anext(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let aiter = frame.borrow().top()?;

    let awaitable = match &aiter {
        Value::AsyncGenerator(gen) => {
            Value::AsyncGenASend(AsyncGenASend::new(gen.clone(), Value::None))
        }
        Value::Instance(_) => {
            let dunder = protocol::get_attr(vm, &aiter, "__anext__").map_err(|_| {
                VmError::type_error(format!(
                    "'async for' requires an iterator with __anext__ method, got {}",
                    aiter.type_name()
                ))
            })?;
            let next = protocol::call_value(vm, dunder, vec![], Default::default())?;
            get_awaitable_iter(vm, &next).map_err(|_| {
                VmError::type_error(format!(
                    "'async for' received an invalid object from __anext__: {}",
                    next.type_name()
                ))
            })?
        }
        other => {
            return Err(VmError::type_error(format!(
                "'async for' requires an iterator with __anext__ method, got {}",
                other.type_name()
            )))
        }
    };
    frame.borrow_mut().push(awaitable);
    Ok(None)
}

fn before_async_with(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let manager = frame.borrow_mut().pop()?;
    let exit = protocol::get_attr(vm, &manager, "__aexit__")?;
    let enter = protocol::get_attr(vm, &manager, "__aenter__")?;
    frame.borrow_mut().push(exit);
    let awaitable = protocol::call_value(vm, enter, vec![], Default::default())?;
    frame.borrow_mut().push(awaitable);
    Ok(None)
}

fn setup_async_with(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let handler = operand.jump()?;
    let frame = vm.frame()?;
    let mut frame = frame.borrow_mut();
    // The enter result is already on the stack; the block level must not
    // include it.
    let result = frame.pop()?;
    frame.push_block(BlockKind::Finally, handler);
    frame.push(result);
    Ok(None)
}
