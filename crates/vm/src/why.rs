//! Continuation reasons.
//!
//! After each dispatched instruction the evaluation loop inspects the
//! handler's continuation reason to decide whether to keep fetching, unwind
//! the block stack, or leave the frame.

/// The reason an opcode handler interrupted straight-line execution.
///
/// Handlers return `Option<Why>`; `None` means fall through to the next
/// instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Why {
    /// A `RETURN_VALUE` executed; the result is in the evaluator scratch.
    Return,
    /// A `BREAK_LOOP` executed (absent from 3.8 bytecode).
    Break,
    /// A `CONTINUE_LOOP` executed; the jump target is in the scratch
    /// `return_value` slot (absent from 3.8 bytecode).
    Continue,
    /// An exception was raised and not yet handled.
    Exception,
    /// `END_FINALLY` re-raised a stashed exception. Folded into
    /// [`Why::Exception`] by the loop before block unwinding.
    Reraise,
    /// The frame suspends with a value (`YIELD_VALUE` / `YIELD_FROM`).
    Yield,
    /// A context manager suppressed the in-flight exception.
    Silenced,
    /// An `EXTENDED_ARG` prefix executed; the next instruction must be
    /// decoded with the saved high-order bits.
    ExtendedArg,
}

impl Why {
    /// Marker name used when the unwinding machinery stores a continuation
    /// token on the value stack for `END_FINALLY` to inspect.
    pub fn token_name(self) -> &'static str {
        match self {
            Why::Return => "return",
            Why::Break => "break",
            Why::Continue => "continue",
            Why::Exception => "exception",
            Why::Reraise => "reraise",
            Why::Yield => "yield",
            Why::Silenced => "silenced",
            Why::ExtendedArg => "extended_arg",
        }
    }
}

impl std::fmt::Display for Why {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token_name())
    }
}
