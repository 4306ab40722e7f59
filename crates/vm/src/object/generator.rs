//! Suspendable activations: the generator state machine.
//!
//! A [`GenObject`] wraps a frame whose code carries one of the suspendable
//! flags. Coroutines and async generators share the same state machine;
//! their wrappers differ in the protocol surface (see
//! [`crate::object::coroutine`] and [`crate::object::async_generator`]).

use std::cell::RefCell;
use std::rc::Rc;

use crate::code::{CodeFlags, CodeObject};
use crate::error::{VmError, VmResult};
use crate::frame::Frame;
use crate::object::exception::{ExcKind, ExceptionValue};
use crate::object::Value;
use crate::op_code::{decode_table, OpCode};
use crate::vm::Vm;

/// Shared handle to a generator object.
pub type GenRef = Rc<RefCell<GenObject>>;

/// Lifecycle of a suspendable activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenState {
    /// Created, never resumed.
    Initial,
    /// Currently executing inside a nested evaluator run.
    Running,
    /// Suspended at a yield point.
    Suspended,
    /// Ran to completion or was closed.
    Finished,
}

/// Which protocol surface the wrapper exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenFlavor {
    /// A plain generator.
    Generator,
    /// An `async def` coroutine.
    Coroutine,
    /// A generator usable in `await` (legacy asyncio decoration).
    IterableCoroutine,
    /// An `async def` body containing `yield`.
    AsyncGenerator,
}

impl GenFlavor {
    /// Derives the flavor from code flags.
    pub fn from_flags(flags: CodeFlags) -> Self {
        if flags.contains(CodeFlags::ASYNC_GENERATOR) {
            GenFlavor::AsyncGenerator
        } else if flags.contains(CodeFlags::COROUTINE) {
            GenFlavor::Coroutine
        } else if flags.contains(CodeFlags::ITERABLE_COROUTINE) {
            GenFlavor::IterableCoroutine
        } else {
            GenFlavor::Generator
        }
    }
}

/// A suspendable activation wrapper around a frame.
pub struct GenObject {
    /// The suspended (or running) frame.
    pub frame: Rc<RefCell<Frame>>,
    /// The frame's code, kept reachable after the frame is dropped.
    pub code: Rc<CodeObject>,
    /// Lifecycle state.
    pub state: GenState,
    /// Protocol flavor.
    pub flavor: GenFlavor,
    /// Async-generator close latch.
    pub ag_closed: bool,
    /// Warning sink shared with the owning evaluator.
    warnings: Rc<RefCell<Vec<String>>>,
}

impl std::fmt::Debug for GenObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenObject")
            .field("code", &self.code.qualname)
            .field("state", &self.state)
            .field("flavor", &self.flavor)
            .finish()
    }
}

impl GenObject {
    /// Wraps a fresh frame. The caller is responsible for linking
    /// `frame.generator` back to the returned handle.
    pub fn new(
        frame: Rc<RefCell<Frame>>,
        flavor: GenFlavor,
        warnings: Rc<RefCell<Vec<String>>>,
    ) -> GenRef {
        let code = frame.borrow().code.clone();
        let gen = Rc::new(RefCell::new(Self {
            frame,
            code,
            state: GenState::Initial,
            flavor,
            ag_closed: false,
            warnings,
        }));
        gen.borrow().frame.borrow_mut().generator = Some(Rc::downgrade(&gen));
        gen
    }

    /// Diagnostic name.
    pub fn qualname(&self) -> Rc<str> {
        self.code.qualname.clone()
    }

    /// Whether the activation has finished.
    pub fn is_finished(&self) -> bool {
        self.state == GenState::Finished
    }

    /// Marks the activation finished (driven by `RETURN_VALUE` through the
    /// frame back-reference).
    pub fn finish(&mut self) {
        self.state = GenState::Finished;
    }

    fn started(&self) -> bool {
        self.frame.borrow().lasti != 0 || self.state != GenState::Initial
    }
}

impl Drop for GenObject {
    fn drop(&mut self) {
        // A coroutine discarded before its first resume was never awaited.
        if matches!(self.flavor, GenFlavor::Coroutine)
            && self.state == GenState::Initial
            && self.frame.borrow().lasti == 0
        {
            let message = format!("coroutine '{}' was never awaited", self.code.name);
            log::warn!("{message}");
            self.warnings.borrow_mut().push(message);
        }
    }
}

/// Probes the sub-iterator this generator is yielding from, if its frame
/// is suspended exactly at a `YIELD_FROM` instruction.
pub fn gen_yf(gen: &GenRef) -> Option<Value> {
    let gen = gen.borrow();
    if gen.state != GenState::Suspended {
        return None;
    }
    let frame = gen.frame.borrow();
    let code = &frame.code;
    let byte = *code.code.get(frame.lasti)?;
    if decode_table(code.version)[byte as usize] != Some(OpCode::YieldFrom) {
        return None;
    }
    frame.stack.last().cloned()
}

/// Resumes a generator with `value`, optionally injecting an exception.
///
/// Returns the next yielded value; a finished generator surfaces as
/// `StopIteration` carrying the return value.
pub fn gen_send_ex(
    vm: &mut Vm,
    gen: &GenRef,
    value: Value,
    inject: Option<ExceptionValue>,
) -> VmResult<Value> {
    {
        let state = gen.borrow().state;
        let flavor = gen.borrow().flavor;
        match state {
            GenState::Running => {
                return Err(match flavor {
                    GenFlavor::Generator | GenFlavor::IterableCoroutine => VmError::raised(
                        ExcKind::ValueError,
                        "generator already executing",
                    ),
                    GenFlavor::Coroutine => {
                        VmError::runtime_error("coroutine already executing")
                    }
                    GenFlavor::AsyncGenerator => {
                        VmError::runtime_error("async generator already executing")
                    }
                });
            }
            GenState::Finished => return Err(VmError::stop_iteration(None)),
            _ => {}
        }
        if !gen.borrow().started() && !matches!(value, Value::None) && inject.is_none() {
            return Err(VmError::type_error(
                "can't send non-None value to a just-started generator",
            ));
        }
    }

    let frame = gen.borrow().frame.clone();
    frame.borrow_mut().push(value);
    gen.borrow_mut().state = GenState::Running;

    let result = vm.resume_frame(&frame, inject);

    let mut gen_mut = gen.borrow_mut();
    let finished = gen_mut.is_finished();
    match result {
        Ok(value) => {
            if finished {
                drop(gen_mut);
                Err(VmError::stop_iteration(Some(value)))
            } else {
                gen_mut.state = GenState::Suspended;
                Ok(value)
            }
        }
        Err(err) => {
            gen_mut.finish();
            Err(err)
        }
    }
}

/// Throws an exception into a generator, delegating through an active
/// `yield from` chain first.
pub fn gen_throw(vm: &mut Vm, gen: &GenRef, exc: ExceptionValue) -> VmResult<Value> {
    if let Some(yf) = gen_yf(gen) {
        if exc.derives_from(ExcKind::GeneratorExit) {
            // Shut the delegate down, then deliver GeneratorExit here.
            gen_close_iter(vm, &yf)?;
            return gen_send_ex(vm, gen, Value::None, Some(exc));
        }

        let delegated = match &yf {
            Value::Generator(sub) | Value::Coroutine(sub) | Value::CoroutineIter(sub) => {
                Some(gen_throw(vm, sub, exc.clone()))
            }
            Value::Instance(_) => {
                let meth = crate::protocol::get_attr(vm, &yf, "throw").ok();
                meth.map(|m| {
                    crate::protocol::call_value(
                        vm,
                        m,
                        vec![exc.class_value(), Value::Exception(Rc::new(exc.clone()))],
                        Default::default(),
                    )
                })
            }
            _ => None,
        };

        return match delegated {
            Some(Ok(yielded)) => Ok(yielded),
            Some(Err(err)) => {
                let sub_exc = err.into_raised()?;
                if sub_exc.derives_from(ExcKind::StopIteration) {
                    // Delegation over: step past YIELD_FROM and resume with
                    // the sub-iterator's return value.
                    let frame = gen.borrow().frame.clone();
                    let unit = {
                        let mut f = frame.borrow_mut();
                        f.pop()?;
                        f.code.version.instruction_unit()
                    };
                    frame.borrow_mut().lasti += unit;
                    gen_send_ex(vm, gen, sub_exc.stop_value(), None)
                } else {
                    // The delegate raised: deliver it at the yield-from
                    // suspension point.
                    let frame = gen.borrow().frame.clone();
                    frame.borrow_mut().pop()?;
                    gen_send_ex(vm, gen, Value::None, Some(sub_exc))
                }
            }
            None => {
                // No throw support on the delegate; raise here.
                let frame = gen.borrow().frame.clone();
                frame.borrow_mut().pop()?;
                gen_send_ex(vm, gen, Value::None, Some(exc))
            }
        };
    }

    gen_send_ex(vm, gen, Value::None, Some(exc))
}

/// Closes a generator by delivering `GeneratorExit` at its suspension
/// point. Normal termination (StopIteration or GeneratorExit escaping) is
/// absorbed; a generator that yields instead is an error.
pub fn gen_close(vm: &mut Vm, gen: &GenRef) -> VmResult<()> {
    if gen.borrow().is_finished() || !gen.borrow().started() {
        gen.borrow_mut().finish();
        return Ok(());
    }
    if let Some(yf) = gen_yf(gen) {
        gen_close_iter(vm, &yf)?;
    }

    match gen_send_ex(vm, gen, Value::None, Some(ExceptionValue::new(ExcKind::GeneratorExit, vec![]))) {
        Ok(_yielded) => Err(VmError::runtime_error("generator ignored GeneratorExit")),
        Err(err) => {
            let exc = err.into_raised()?;
            if exc.derives_from(ExcKind::StopIteration)
                || exc.derives_from(ExcKind::GeneratorExit)
            {
                gen.borrow_mut().finish();
                Ok(())
            } else {
                Err(VmError::Raised(exc))
            }
        }
    }
}

/// Closes a sub-iterator during `yield from` shutdown.
pub fn gen_close_iter(vm: &mut Vm, value: &Value) -> VmResult<()> {
    match value {
        Value::Generator(sub) | Value::Coroutine(sub) | Value::CoroutineIter(sub) => {
            gen_close(vm, sub)
        }
        Value::Instance(_) => {
            if let Ok(close) = crate::protocol::get_attr(vm, value, "close") {
                crate::protocol::call_value(vm, close, vec![], Default::default())?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
