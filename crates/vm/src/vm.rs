//! The evaluator.
//!
//! [`Vm`] owns the frame chain, the inter-opcode scratch state, the
//! version-specialized handler table, and the tracing hook. `run` drives
//! one frame to completion, suspension, or propagated exception; generator
//! resumption re-enters it through [`Vm::resume_frame`].

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::builtins::make_builtins;
use crate::code::CodeObject;
use crate::config::VmConfig;
use crate::error::{VmError, VmResult};
use crate::frame::Frame;
use crate::jump_table::{JumpTable, Operand};
use crate::object::exception::ExceptionValue;
use crate::object::function::{bind_arguments, Function, Kwargs};
use crate::object::generator::{GenFlavor, GenObject};
use crate::object::{ModuleObject, Namespace, Value};
use crate::op_code::{decode_table, ArgKind, OpCode, HAVE_ARGUMENT};
use crate::scratch::{ExcTriple, Scratch};
use crate::tracing::{
    call_exc_trace, call_trace, call_trace_protected, maybe_call_line_trace, TraceEventKind,
    TraceFn, TraceState,
};
use crate::version::PyVersion;
use crate::why::Why;

/// A writable stdout sink shared with the `print` builtin. Tests hand the
/// evaluator a shared buffer to capture output.
pub type OutputSink = Rc<RefCell<dyn Write>>;

/// The bytecode evaluator.
pub struct Vm {
    version: PyVersion,
    table: JumpTable,
    config: VmConfig,
    /// The active frame chain, innermost last.
    pub frames: Vec<Rc<RefCell<Frame>>>,
    /// Inter-opcode scratch slots.
    pub scratch: Scratch,
    /// Trace hook state.
    pub trace: TraceState,
    builtins: Rc<RefCell<Namespace>>,
    stdout: OutputSink,
    warnings: Rc<RefCell<Vec<String>>>,
    modules: IndexMap<Rc<str>, Value>,
    current_op: Option<OpCode>,
}

impl Vm {
    /// Creates an evaluator for one bytecode version with default
    /// configuration. Use [`VmConfig::from_env`] with
    /// [`Vm::with_config`] to honor the `DEBUG_INTERNAL` environment
    /// variable.
    pub fn new(version: PyVersion) -> Self {
        Self::with_config(version, VmConfig::default())
    }

    /// Creates an evaluator with explicit configuration.
    pub fn with_config(version: PyVersion, config: VmConfig) -> Self {
        let builtins = Rc::new(RefCell::new(make_builtins()));
        let mut modules = IndexMap::new();
        modules.insert(
            Rc::from("sys"),
            Value::Module(Rc::new(ModuleObject::new(
                Rc::from("sys"),
                sys_module(version),
            ))),
        );
        Self {
            version,
            table: JumpTable::for_version(version),
            config,
            frames: Vec::new(),
            scratch: Scratch::default(),
            trace: TraceState::default(),
            builtins,
            stdout: Rc::new(RefCell::new(std::io::stdout())),
            warnings: Rc::new(RefCell::new(Vec::new())),
            modules,
            current_op: None,
        }
    }

    /// Redirects `print` and friends into the given sink.
    pub fn with_output(mut self, sink: OutputSink) -> Self {
        self.stdout = sink;
        self
    }

    /// The bytecode version this evaluator runs.
    pub fn version(&self) -> PyVersion {
        self.version
    }

    /// The shared warning sink (un-awaited coroutines, deprecations).
    pub fn warnings(&self) -> Rc<RefCell<Vec<String>>> {
        self.warnings.clone()
    }

    /// Records a runtime warning.
    pub fn warn(&mut self, message: String) {
        log::warn!("{message}");
        self.warnings.borrow_mut().push(message);
    }

    /// Writes to the configured stdout sink.
    pub fn write_stdout(&mut self, text: &str) -> VmResult<()> {
        self.stdout
            .borrow_mut()
            .write_all(text.as_bytes())
            .map_err(|e| VmError::fault(format!("stdout write failed: {e}")))
    }

    /// Installs (or uninstalls) the trace hook.
    pub fn settrace(&mut self, func: Option<TraceFn>) {
        self.trace.settrace(func);
    }

    /// The innermost frame.
    pub fn frame(&self) -> VmResult<Rc<RefCell<Frame>>> {
        self.frames
            .last()
            .cloned()
            .ok_or_else(|| VmError::fault("no active frame"))
    }

    /// The innermost frame, if any.
    pub fn current_frame(&self) -> Option<Rc<RefCell<Frame>>> {
        self.frames.last().cloned()
    }

    /// Name of the opcode currently dispatched, for diagnostics.
    pub fn current_op_name(&self) -> String {
        self.current_op
            .map(|op| op.name().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    }

    /// Resolves a registered module.
    pub fn import_module(&mut self, name: &str) -> VmResult<Value> {
        self.modules.get(name).cloned().ok_or_else(|| {
            VmError::raised(
                crate::object::ExcKind::ImportError,
                format!("No module named '{name}'"),
            )
        })
    }

    /// Registers a module under a name.
    pub fn register_module(&mut self, name: &str, module: Value) {
        self.modules.insert(Rc::from(name), module);
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Runs a top-level code object with fresh (or supplied) namespaces.
    pub fn run_code(
        &mut self,
        code: Rc<CodeObject>,
        globals: Option<Rc<RefCell<Namespace>>>,
        locals: Option<Rc<RefCell<Namespace>>>,
    ) -> VmResult<Value> {
        let globals = globals.unwrap_or_else(|| {
            let mut ns = Namespace::new();
            ns.insert(Rc::from("__name__"), Value::from_str("__main__"));
            Rc::new(RefCell::new(ns))
        });
        if !globals.borrow().contains_key("__builtins__") {
            let module = ModuleObject::shared(Rc::from("builtins"), self.builtins.clone());
            globals
                .borrow_mut()
                .insert(Rc::from("__builtins__"), Value::Module(Rc::new(module)));
        }
        if self.version >= PyVersion::Py36 && !globals.borrow().contains_key("__annotations__") {
            globals
                .borrow_mut()
                .insert(Rc::from("__annotations__"), Value::empty_dict());
        }
        let locals = locals.unwrap_or_else(|| globals.clone());

        let frame = Frame::new(code, globals, locals, &[], None, &self.builtins)?;
        self.run(Rc::new(RefCell::new(frame)), None)
    }

    /// Calls a guest function, binding arguments and either running the
    /// new frame or wrapping it in a suspendable object.
    pub fn call_function(
        &mut self,
        func: &Rc<Function>,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> VmResult<Value> {
        let locals = bind_arguments(func, args, kwargs)?;
        let frame = Frame::new(
            func.code.clone(),
            func.globals.clone(),
            Rc::new(RefCell::new(locals)),
            &func.closure,
            self.frames.last().cloned(),
            &self.builtins,
        )?;
        let frame = Rc::new(RefCell::new(frame));

        if func.code.flags.is_suspendable() {
            let flavor = GenFlavor::from_flags(func.code.flags);
            let gen = GenObject::new(frame, flavor, self.warnings.clone());
            return Ok(match flavor {
                GenFlavor::Generator | GenFlavor::IterableCoroutine => Value::Generator(gen),
                GenFlavor::Coroutine => Value::Coroutine(gen),
                GenFlavor::AsyncGenerator => Value::AsyncGenerator(gen),
            });
        }
        self.run(frame, None)
    }

    /// Runs a class body function against a supplied namespace. Returns
    /// the body's return value (the `__class__` cell, when one exists).
    pub fn run_class_body(
        &mut self,
        func: &Rc<Function>,
        namespace: Rc<RefCell<Namespace>>,
    ) -> VmResult<Value> {
        let frame = Frame::new(
            func.code.clone(),
            func.globals.clone(),
            namespace,
            &func.closure,
            self.frames.last().cloned(),
            &self.builtins,
        )?;
        self.run(Rc::new(RefCell::new(frame)), None)
    }

    /// Re-enters the evaluator for a suspended frame. The frame's caller
    /// link is rewritten to the resumer for the duration of the run, and
    /// the scratch slots a nested run clobbers are saved around it.
    pub fn resume_frame(
        &mut self,
        frame: &Rc<RefCell<Frame>>,
        inject: Option<ExceptionValue>,
    ) -> VmResult<Value> {
        frame.borrow_mut().back = self.frames.last().cloned();
        let saved = self.scratch.save();
        let result = self.run(frame.clone(), inject);
        self.scratch.restore(saved);
        frame.borrow_mut().back = None;
        result
    }

    // ------------------------------------------------------------------
    // The evaluation loop
    // ------------------------------------------------------------------

    /// Runs one frame to completion, suspension, or propagated exception.
    pub fn run(
        &mut self,
        frame: Rc<RefCell<Frame>>,
        inject: Option<ExceptionValue>,
    ) -> VmResult<Value> {
        self.frames.push(frame.clone());
        log::debug!(
            "enter frame {} (depth {})",
            frame.borrow().code.qualname,
            self.frames.len()
        );
        call_trace_protected(self, &frame, TraceEventKind::Call, Value::None);

        let mut inject = inject;
        let mut why: Option<Why> = None;

        loop {
            if let Some(exc) = inject.take() {
                self.set_last_exception(exc);
                why = Some(Why::Exception);
            } else if why.is_none() {
                if self.trace.use_tracing {
                    maybe_call_line_trace(self, &frame);
                }
                why = match self.step() {
                    Ok(why) => why,
                    Err(err) => {
                        self.frames.pop();
                        return Err(err);
                    }
                };
            }

            if why == Some(Why::ExtendedArg) {
                // The saved high-order bits are OR'd into the next
                // instruction's argument during fetch.
                why = None;
                continue;
            }
            if why == Some(Why::Exception) {
                call_exc_trace(self, &frame);
            }
            if why == Some(Why::Reraise) {
                why = Some(Why::Exception);
            }
            if why != Some(Why::Yield) {
                while let Some(reason) = why {
                    if frame.borrow().block_stack.is_empty() {
                        break;
                    }
                    let managed = frame
                        .borrow_mut()
                        .manage_block_stack(reason, &mut self.scratch);
                    why = match managed {
                        Ok(next) => next,
                        Err(err) => {
                            self.frames.pop();
                            return Err(err);
                        }
                    };
                }
            }
            if why.is_some() {
                break;
            }
        }

        let retval = self.scratch.return_value.clone();
        match why {
            Some(Why::Return) | Some(Why::Yield) => {
                if call_trace(self, &frame, TraceEventKind::Return, retval.clone())
                    && self.scratch.last_exception.is_some()
                {
                    why = Some(Why::Exception);
                }
            }
            Some(Why::Exception) => {
                call_trace_protected(self, &frame, TraceEventKind::Return, Value::None);
            }
            _ => {}
        }

        self.frames.pop();
        log::debug!("leave frame {}", frame.borrow().code.qualname);

        match why {
            Some(Why::Return) | Some(Why::Yield) => Ok(retval),
            Some(Why::Exception) => {
                let triple = self
                    .scratch
                    .take_last_exception()
                    .ok_or_else(|| VmError::fault("exception exit with no pending exception"))?;
                match triple.exception() {
                    Some(exc) => Err(VmError::Raised((*exc).clone())),
                    None => Err(VmError::fault("pending exception with no instance")),
                }
            }
            Some(other) => Err(VmError::fault(format!(
                "'{other}' escaped the frame without a matching block"
            ))),
            None => Err(VmError::fault("evaluation loop exited without a reason")),
        }
    }

    /// Fetches, decodes, and dispatches one instruction.
    fn step(&mut self) -> VmResult<Option<Why>> {
        let (op, operand) = self.fetch()?;
        self.current_op = Some(op);
        if self.config.trace_opargs {
            log::trace!("{op} {operand:?}");
        }

        let handler = self.table.get(op)?;
        match handler(self, operand) {
            Ok(why) => Ok(why),
            Err(err) if !err.is_fatal() && !self.config.debug => {
                let exc = err.into_raised()?;
                self.set_last_exception(exc);
                Ok(Some(Why::Exception))
            }
            Err(err) => Err(err),
        }
    }

    /// Records a raised exception in the scratch slot, chaining the
    /// exception being handled as its implicit context.
    pub fn set_last_exception(&mut self, exc: ExceptionValue) {
        let exc = Rc::new(exc);
        if exc.context().is_none() {
            if let Some(context) = self
                .scratch
                .current_exception
                .as_ref()
                .and_then(|t| t.exception())
            {
                if !Rc::ptr_eq(&context, &exc) {
                    exc.set_context(Some(context));
                }
            }
        }
        self.scratch.last_exception = Some(ExcTriple::from_exception(exc));
    }

    /// Decodes the instruction at the cursor and resolves its argument.
    fn fetch(&mut self) -> VmResult<(OpCode, Operand)> {
        let frame = self.frame()?;
        let mut frame = frame.borrow_mut();
        let code = frame.code.clone();
        let offset = frame.lasti;
        let bytes = &code.code;

        if offset >= bytes.len() {
            return Err(VmError::Decode {
                offset,
                reason: "instruction cursor past the end of code".into(),
            });
        }

        let byte = bytes[offset];
        let op = decode_table(self.version)[byte as usize]
            .ok_or(VmError::InvalidOpcode { opcode: byte, offset })?;

        let raw_arg = if self.version.is_wordcode() {
            let arg_byte = *bytes.get(offset + 1).ok_or_else(|| VmError::Decode {
                offset,
                reason: "truncated wordcode instruction".into(),
            })?;
            frame.lasti += 2;
            if byte >= HAVE_ARGUMENT {
                Some(arg_byte as u32 | self.scratch.take_oparg())
            } else {
                None
            }
        } else {
            frame.lasti += 1;
            if byte >= HAVE_ARGUMENT {
                let lo = *bytes.get(offset + 1).ok_or_else(|| VmError::Decode {
                    offset,
                    reason: "truncated instruction argument".into(),
                })? as u32;
                let hi = *bytes.get(offset + 2).ok_or_else(|| VmError::Decode {
                    offset,
                    reason: "truncated instruction argument".into(),
                })? as u32;
                frame.lasti += 2;
                Some((lo | (hi << 8)) | self.scratch.take_oparg())
            } else {
                None
            }
        };

        let operand = match (op.arg_kind(), raw_arg) {
            (ArgKind::None, _) => Operand::None,
            (kind, Some(arg)) => {
                let arg = arg as usize;
                match kind {
                    ArgKind::Const => Operand::Const(
                        code.consts
                            .get(arg)
                            .cloned()
                            .ok_or_else(|| VmError::Decode {
                                offset,
                                reason: format!("constant index {arg} out of range"),
                            })?,
                    ),
                    ArgKind::Name => Operand::Name(
                        code.names
                            .get(arg)
                            .cloned()
                            .ok_or_else(|| VmError::Decode {
                                offset,
                                reason: format!("name index {arg} out of range"),
                            })?,
                    ),
                    ArgKind::Local => Operand::Name(
                        code.varnames
                            .get(arg)
                            .cloned()
                            .ok_or_else(|| VmError::Decode {
                                offset,
                                reason: format!("local index {arg} out of range"),
                            })?,
                    ),
                    ArgKind::Free => Operand::Name(
                        code.free_name(arg)
                            .cloned()
                            .ok_or_else(|| VmError::Decode {
                                offset,
                                reason: format!("cell/free index {arg} out of range"),
                            })?,
                    ),
                    ArgKind::JumpRel => Operand::Jump(frame.lasti + arg),
                    ArgKind::JumpAbs => Operand::Jump(arg),
                    ArgKind::Raw | ArgKind::None => Operand::Raw(arg as u32),
                }
            }
            (kind, None) => {
                return Err(VmError::Decode {
                    offset,
                    reason: format!("{op} ({kind:?}) decoded without an argument"),
                })
            }
        };

        Ok((op, operand))
    }
}

fn sys_module(version: PyVersion) -> Namespace {
    let mut ns = Namespace::new();
    ns.insert(Rc::from("maxsize"), Value::from_i64(i64::MAX));
    let (major, minor) = match version {
        PyVersion::Py34 => (3, 4),
        PyVersion::Py35 => (3, 5),
        PyVersion::Py36 => (3, 6),
        PyVersion::Py37 => (3, 7),
        PyVersion::Py38 => (3, 8),
    };
    ns.insert(
        Rc::from("version_info"),
        Value::tuple(vec![Value::from_i64(major), Value::from_i64(minor)]),
    );
    ns
}
