//! Coroutine wrappers and awaitable coercion.

use crate::error::{VmError, VmResult};
use crate::object::generator::{gen_yf, GenFlavor};
use crate::object::Value;
use crate::vm::Vm;

/// Coerces a value into the iterator `GET_AWAITABLE` pushes.
///
/// Coroutines, coroutine iterators, and iterable-coroutine generators pass
/// through; objects exposing `__await__` contribute whatever that returns
/// (which must not itself be a coroutine); everything else is a
/// `TypeError`.
pub fn get_awaitable_iter(vm: &mut Vm, value: &Value) -> VmResult<Value> {
    match value {
        Value::Coroutine(gen) => Ok(Value::CoroutineIter(gen.clone())),
        Value::CoroutineIter(_) | Value::AsyncGenASend(_) | Value::AsyncGenAThrow(_) => {
            Ok(value.clone())
        }
        Value::Generator(gen)
            if gen.borrow().flavor == GenFlavor::IterableCoroutine =>
        {
            Ok(value.clone())
        }
        Value::Instance(_) => {
            let await_method = crate::protocol::get_attr(vm, value, "__await__")
                .map_err(|_| cannot_await(value))?;
            let result =
                crate::protocol::call_value(vm, await_method, vec![], Default::default())?;
            match &result {
                Value::Coroutine(_) => {
                    Err(VmError::type_error("__await__() returned a coroutine"))
                }
                Value::Generator(_) | Value::CoroutineIter(_) | Value::Iterator(_) => Ok(result),
                Value::Instance(_) => crate::protocol::iter_value(vm, result.clone()).map_err(|_| {
                    VmError::type_error(format!(
                        "__await__() returned non-iterator of type '{}'",
                        result.type_name()
                    ))
                }),
                _ => Err(VmError::type_error(format!(
                    "__await__() returned non-iterator of type '{}'",
                    result.type_name()
                ))),
            }
        }
        _ => Err(cannot_await(value)),
    }
}

fn cannot_await(value: &Value) -> VmError {
    VmError::type_error(format!(
        "object {} can't be used in 'await' expression",
        value.type_name()
    ))
}

/// Rejects awaiting a coroutine that is already being awaited somewhere
/// else (its frame is suspended inside a `yield from` chain).
pub fn check_not_already_awaited(iter: &Value) -> VmResult<()> {
    if let Value::CoroutineIter(gen) = iter {
        if gen_yf(gen).is_some() {
            return Err(VmError::runtime_error("coroutine is being awaited already"));
        }
    }
    Ok(())
}
