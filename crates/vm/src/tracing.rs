//! Trace hook plumbing.
//!
//! External collaborators (debuggers, profilers) observe execution through
//! a single installed callback. The evaluation loop reports `call`, `line`,
//! `opcode`, `return`, and `exception` events; the callback decides per
//! frame whether to keep receiving them.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::VmResult;
use crate::frame::Frame;
use crate::object::Value;
use crate::vm::Vm;

/// Events delivered to a trace function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEventKind {
    Call,
    Line,
    Opcode,
    Return,
    Exception,
}

impl TraceEventKind {
    /// The event name as the hook contract spells it.
    pub fn name(self) -> &'static str {
        match self {
            TraceEventKind::Call => "call",
            TraceEventKind::Line => "line",
            TraceEventKind::Opcode => "opcode",
            TraceEventKind::Return => "return",
            TraceEventKind::Exception => "exception",
        }
    }
}

/// One delivered trace event.
pub struct TraceEvent {
    /// The frame the event happened in.
    pub frame: Rc<RefCell<Frame>>,
    /// What happened.
    pub kind: TraceEventKind,
    /// Event payload: the return value for `return`, the exception triple
    /// (as a tuple) for `exception`, `None` otherwise.
    pub arg: Value,
}

/// What the trace callback wants next for this frame.
pub enum TraceDisposition {
    /// Keep the current per-frame callback.
    Keep,
    /// Install this callback as the frame's `f_trace`.
    Install(TraceFn),
    /// Stop tracing this frame.
    Stop,
}

/// A trace callback.
pub type TraceFn = Rc<dyn Fn(&mut Vm, &TraceEvent) -> VmResult<TraceDisposition>>;

/// Hook registration state, owned by the evaluator.
#[derive(Default)]
pub struct TraceState {
    /// The installed hook, if any.
    pub func: Option<TraceFn>,
    /// Re-entrancy guard: set while the hook itself executes.
    pub tracing: bool,
    /// Fast check consulted before each event decision.
    pub use_tracing: bool,
}

impl TraceState {
    /// Installs (or uninstalls) the hook.
    pub fn settrace(&mut self, func: Option<TraceFn>) {
        self.use_tracing = func.is_some();
        self.func = func;
    }
}

/// Invokes the hook for one event, honoring the re-entrancy guard. The
/// frame's own continuation callback takes precedence over the installed
/// global hook. Returns `true` when the hook raised.
pub fn call_trace(vm: &mut Vm, frame: &Rc<RefCell<Frame>>, kind: TraceEventKind, arg: Value) -> bool {
    if vm.trace.tracing {
        return false;
    }
    let per_frame = frame.borrow().trace.clone();
    let Some(func) = per_frame.or_else(|| vm.trace.func.clone()) else {
        return false;
    };

    vm.trace.tracing = true;
    vm.trace.use_tracing = false;
    let event = TraceEvent {
        frame: frame.clone(),
        kind,
        arg,
    };
    let result = func(vm, &event);
    vm.trace.use_tracing = vm.trace.func.is_some();
    vm.trace.tracing = false;

    match result {
        Ok(TraceDisposition::Keep) => false,
        Ok(TraceDisposition::Install(continuation)) => {
            frame.borrow_mut().trace = Some(continuation);
            false
        }
        Ok(TraceDisposition::Stop) => {
            let mut frame = frame.borrow_mut();
            frame.trace = None;
            frame.trace_lines = false;
            frame.trace_opcodes = false;
            false
        }
        Err(err) => {
            // A raising hook uninstalls itself; its exception becomes the
            // pending one so the caller can route it through unwinding.
            vm.trace.settrace(None);
            if let Ok(exc) = err.into_raised() {
                vm.scratch.last_exception =
                    Some(crate::scratch::ExcTriple::from_exception(std::rc::Rc::new(exc)));
            }
            true
        }
    }
}

/// Protected variant used on frame entry/exit paths: hook errors are
/// swallowed after uninstalling the hook.
pub fn call_trace_protected(
    vm: &mut Vm,
    frame: &Rc<RefCell<Frame>>,
    kind: TraceEventKind,
    arg: Value,
) {
    if !vm.trace.use_tracing || vm.trace.func.is_none() {
        return;
    }
    let _ = call_trace(vm, frame, kind, arg);
}

/// Reports `line` / `opcode` events for the instruction about to execute.
///
/// A `line` event fires only when the cursor sits on the first instruction
/// of a source line and the frame has line tracing enabled; an `opcode`
/// event fires for every instruction when opcode tracing is enabled.
pub fn maybe_call_line_trace(vm: &mut Vm, frame: &Rc<RefCell<Frame>>) {
    if vm.trace.tracing || vm.trace.func.is_none() {
        return;
    }
    let (lasti, trace_lines, trace_opcodes) = {
        let f = frame.borrow();
        (f.lasti, f.trace_lines, f.trace_opcodes)
    };
    let (_line, lb, _ub) = frame.borrow().code.line_range(lasti);

    if lasti == lb && trace_lines {
        call_trace(vm, frame, TraceEventKind::Line, Value::None);
    }
    if trace_opcodes {
        call_trace(vm, frame, TraceEventKind::Opcode, Value::None);
    }
}

/// Reports an `exception` event, preserving the pending exception around
/// the hook invocation.
pub fn call_exc_trace(vm: &mut Vm, frame: &Rc<RefCell<Frame>>) {
    if vm.trace.func.is_none() {
        return;
    }
    let pending = vm.scratch.take_last_exception();
    let arg = match &pending {
        Some(triple) => Value::tuple(vec![
            triple.etype.clone(),
            triple.value.clone(),
            triple.tb.clone(),
        ]),
        None => Value::None,
    };
    call_trace(vm, frame, TraceEventKind::Exception, arg);
    vm.scratch.last_exception = pending;
}
