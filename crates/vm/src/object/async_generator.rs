//! Async generators and their one-shot awaitables.
//!
//! `asend`, `athrow`, and `aclose` each hand back a small awaitable state
//! machine that drives the underlying generator one step per `send` and
//! translates its yields and terminations into the async iteration
//! protocol: a wrapped yield becomes `StopIteration(value)`, exhaustion
//! becomes `StopAsyncIteration`, and intermediate awaited values pass
//! through untouched.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{VmError, VmResult};
use crate::object::exception::{ExcKind, ExceptionValue};
use crate::object::generator::{gen_send_ex, gen_throw, GenRef};
use crate::object::Value;
use crate::vm::Vm;

/// One-shot awaitable lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitableState {
    Init,
    Iter,
    Closed,
}

/// Translates one step of the underlying generator into async-iteration
/// terms.
fn unwrap_step(gen: &GenRef, step: VmResult<Value>) -> VmResult<Value> {
    match step {
        Ok(Value::AGenWrapped(value)) => {
            Err(VmError::stop_iteration(Some((*value).clone())))
        }
        Ok(other) => Ok(other),
        Err(err) => {
            let exc = err.into_raised()?;
            if exc.derives_from(ExcKind::StopAsyncIteration)
                || exc.derives_from(ExcKind::GeneratorExit)
            {
                gen.borrow_mut().ag_closed = true;
                Err(VmError::stop_async_iteration())
            } else if exc.derives_from(ExcKind::StopIteration) {
                // The body finished; async iteration is over.
                gen.borrow_mut().ag_closed = true;
                Err(VmError::stop_async_iteration())
            } else {
                Err(VmError::Raised(exc))
            }
        }
    }
}

/// The awaitable behind `__anext__` / `asend`.
#[derive(Debug)]
pub struct AsyncGenASend {
    pub gen: GenRef,
    pub state: AwaitableState,
    pub sendval: Value,
}

impl AsyncGenASend {
    pub fn new(gen: GenRef, sendval: Value) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            gen,
            state: AwaitableState::Init,
            sendval,
        }))
    }
}

/// Advances an `asend` awaitable by one `send(value)`.
pub fn asend_send(vm: &mut Vm, this: &Rc<RefCell<AsyncGenASend>>, value: Value) -> VmResult<Value> {
    let (gen, send_value) = {
        let mut this = this.borrow_mut();
        if this.state == AwaitableState::Closed {
            return Err(VmError::runtime_error(
                "cannot reuse already awaited __anext__()/asend()",
            ));
        }
        let send_value = if this.state == AwaitableState::Init {
            this.state = AwaitableState::Iter;
            match value {
                Value::None => std::mem::take(&mut this.sendval),
                explicit => explicit,
            }
        } else {
            value
        };
        (this.gen.clone(), send_value)
    };

    let result = unwrap_step(&gen, gen_send_ex(vm, &gen, send_value, None));
    if result.is_err() {
        this.borrow_mut().state = AwaitableState::Closed;
    }
    result
}

/// Throws into an `asend` awaitable.
pub fn asend_throw(
    vm: &mut Vm,
    this: &Rc<RefCell<AsyncGenASend>>,
    exc: ExceptionValue,
) -> VmResult<Value> {
    let gen = {
        let this = this.borrow();
        if this.state == AwaitableState::Closed {
            return Err(VmError::stop_iteration(None));
        }
        this.gen.clone()
    };
    let result = unwrap_step(&gen, gen_throw(vm, &gen, exc));
    if result.is_err() {
        this.borrow_mut().state = AwaitableState::Closed;
    }
    result
}

/// Marks an `asend` awaitable closed.
pub fn asend_close(this: &Rc<RefCell<AsyncGenASend>>) {
    this.borrow_mut().state = AwaitableState::Closed;
}

/// The awaitable behind `athrow` / `aclose`. `args` is `None` for
/// `aclose`, which delivers `GeneratorExit`.
#[derive(Debug)]
pub struct AsyncGenAThrow {
    pub gen: GenRef,
    pub state: AwaitableState,
    pub args: Option<ExceptionValue>,
}

impl AsyncGenAThrow {
    pub fn new(gen: GenRef, args: Option<ExceptionValue>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            gen,
            state: AwaitableState::Init,
            args,
        }))
    }
}

/// Advances an `athrow` / `aclose` awaitable by one `send(value)`.
pub fn athrow_send(
    vm: &mut Vm,
    this: &Rc<RefCell<AsyncGenAThrow>>,
    value: Value,
) -> VmResult<Value> {
    let (gen, state, args) = {
        let this = this.borrow();
        (this.gen.clone(), this.state, this.args.clone())
    };
    let closing = args.is_none();

    if state == AwaitableState::Closed {
        return Err(VmError::stop_iteration(None));
    }

    if state == AwaitableState::Init {
        if gen.borrow().ag_closed {
            this.borrow_mut().state = AwaitableState::Closed;
            return Err(VmError::stop_iteration(None));
        }
        if !matches!(value, Value::None) {
            return Err(VmError::runtime_error(
                "can't send non-None value to a just-started coroutine",
            ));
        }
        this.borrow_mut().state = AwaitableState::Iter;

        if closing {
            gen.borrow_mut().ag_closed = true;
            let exit = ExceptionValue::new(ExcKind::GeneratorExit, vec![]);
            return match gen_throw(vm, &gen, exit) {
                Ok(Value::AGenWrapped(_)) => {
                    this.borrow_mut().state = AwaitableState::Closed;
                    Err(VmError::runtime_error(
                        "async generator ignored GeneratorExit",
                    ))
                }
                Ok(awaited) => Ok(awaited),
                Err(err) => {
                    this.borrow_mut().state = AwaitableState::Closed;
                    let exc = err.into_raised()?;
                    if exc.derives_from(ExcKind::StopAsyncIteration)
                        || exc.derives_from(ExcKind::GeneratorExit)
                        || exc.derives_from(ExcKind::StopIteration)
                    {
                        Err(VmError::stop_iteration(None))
                    } else {
                        Err(VmError::Raised(exc))
                    }
                }
            };
        }

        let exc = args.expect("athrow carries an exception");
        let result = unwrap_step(&gen, gen_throw(vm, &gen, exc));
        if result.is_err() {
            this.borrow_mut().state = AwaitableState::Closed;
        }
        return result;
    }

    // Resuming after an intermediate await inside the throw handling.
    let step = gen_send_ex(vm, &gen, value, None);
    if closing {
        match step {
            Ok(Value::AGenWrapped(_)) => {
                this.borrow_mut().state = AwaitableState::Closed;
                Err(VmError::runtime_error(
                    "async generator ignored GeneratorExit",
                ))
            }
            Ok(awaited) => Ok(awaited),
            Err(err) => {
                this.borrow_mut().state = AwaitableState::Closed;
                let exc = err.into_raised()?;
                if exc.derives_from(ExcKind::StopAsyncIteration)
                    || exc.derives_from(ExcKind::GeneratorExit)
                    || exc.derives_from(ExcKind::StopIteration)
                {
                    Err(VmError::stop_iteration(None))
                } else {
                    Err(VmError::Raised(exc))
                }
            }
        }
    } else {
        let result = unwrap_step(&gen, step);
        if result.is_err() {
            this.borrow_mut().state = AwaitableState::Closed;
        }
        result
    }
}

/// Throws into an `athrow` awaitable.
pub fn athrow_throw(
    vm: &mut Vm,
    this: &Rc<RefCell<AsyncGenAThrow>>,
    exc: ExceptionValue,
) -> VmResult<Value> {
    let (gen, state, closing) = {
        let this = this.borrow();
        (this.gen.clone(), this.state, this.args.is_none())
    };
    match state {
        AwaitableState::Init => Err(VmError::runtime_error(
            "can't send non-None value to a just-started coroutine",
        )),
        AwaitableState::Closed => Err(VmError::stop_iteration(None)),
        AwaitableState::Iter => {
            let step = gen_throw(vm, &gen, exc);
            if closing {
                match step {
                    Ok(Value::AGenWrapped(_)) => Err(VmError::runtime_error(
                        "async generator ignored GeneratorExit",
                    )),
                    other => other,
                }
            } else {
                unwrap_step(&gen, step)
            }
        }
    }
}

/// Marks an `athrow` awaitable closed.
pub fn athrow_close(this: &Rc<RefCell<AsyncGenAThrow>>) {
    this.borrow_mut().state = AwaitableState::Closed;
}
