//! Error types for the interpreter crate.
//!
//! Two error planes flow through every opcode handler:
//!
//! * **Machine faults** — evaluator invariants were violated (confused
//!   `WITH_CLEANUP`, unknown `END_FINALLY` discriminator, a popped block of
//!   the wrong kind). These are never catchable by guest bytecode and
//!   surface to the embedder as-is.
//! * **Guest exceptions** — anything the running program can catch with an
//!   `except` clause. They travel as [`VmError::Raised`] so `?` propagates
//!   them out of handlers, and the dispatch layer converts them into the
//!   block-stack unwinding protocol.

use thiserror::Error;

use crate::object::exception::{ExcKind, ExceptionValue};
use crate::object::Value;

/// Interpreter errors.
#[derive(Error, Debug, Clone)]
pub enum VmError {
    /// Evaluator invariant violated. Fatal; not catchable by guest code.
    #[error("virtual machine error: {reason}")]
    Fault { reason: String },

    /// An opcode byte that does not decode in the selected version.
    #[error("invalid opcode: {opcode:#04x} at offset {offset}")]
    InvalidOpcode { opcode: u8, offset: usize },

    /// An opcode that exists in the table but was removed in the running
    /// version.
    #[error("operation `{name}` is removed in {version}")]
    RemovedOpcode { name: String, version: String },

    /// Instruction stream decoding ran off the end of the code bytes.
    #[error("decode error at offset {offset}: {reason}")]
    Decode { offset: usize, reason: String },

    /// A guest-level exception in flight.
    #[error("{0}")]
    Raised(ExceptionValue),
}

impl VmError {
    /// Creates a fatal machine fault.
    pub fn fault<S: Into<String>>(reason: S) -> Self {
        Self::Fault {
            reason: reason.into(),
        }
    }

    /// Creates a removed-in-version error.
    pub fn removed<S: Into<String>>(name: S, version: S) -> Self {
        Self::RemovedOpcode {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Raises a guest exception of the given builtin kind with one string
    /// argument.
    pub fn raised<S: Into<String>>(kind: ExcKind, message: S) -> Self {
        Self::Raised(ExceptionValue::with_message(kind, message))
    }

    /// Raises a guest exception carrying arbitrary arguments.
    pub fn raised_with(kind: ExcKind, args: Vec<Value>) -> Self {
        Self::Raised(ExceptionValue::new(kind, args))
    }

    /// `TypeError` shorthand.
    pub fn type_error<S: Into<String>>(message: S) -> Self {
        Self::raised(ExcKind::TypeError, message)
    }

    /// `ValueError` shorthand.
    pub fn value_error<S: Into<String>>(message: S) -> Self {
        Self::raised(ExcKind::ValueError, message)
    }

    /// `NameError` shorthand.
    pub fn name_error(name: &str) -> Self {
        Self::raised(ExcKind::NameError, format!("name '{name}' is not defined"))
    }

    /// `UnboundLocalError` shorthand.
    pub fn unbound_local(name: &str) -> Self {
        Self::raised(
            ExcKind::UnboundLocalError,
            format!("local variable '{name}' referenced before assignment"),
        )
    }

    /// `AttributeError` shorthand.
    pub fn attribute_error<S: Into<String>>(message: S) -> Self {
        Self::raised(ExcKind::AttributeError, message)
    }

    /// `RuntimeError` shorthand.
    pub fn runtime_error<S: Into<String>>(message: S) -> Self {
        Self::raised(ExcKind::RuntimeError, message)
    }

    /// `KeyError` carrying the missing key.
    pub fn key_error(key: Value) -> Self {
        Self::Raised(ExceptionValue::new(ExcKind::KeyError, vec![key]))
    }

    /// `StopIteration`, optionally carrying the generator's return value.
    pub fn stop_iteration(value: Option<Value>) -> Self {
        let args = match value {
            Some(Value::None) | None => vec![],
            Some(v) => vec![v],
        };
        Self::Raised(ExceptionValue::new(ExcKind::StopIteration, args))
    }

    /// `StopAsyncIteration` shorthand.
    pub fn stop_async_iteration() -> Self {
        Self::Raised(ExceptionValue::new(ExcKind::StopAsyncIteration, vec![]))
    }

    /// `GeneratorExit` shorthand.
    pub fn generator_exit() -> Self {
        Self::Raised(ExceptionValue::new(ExcKind::GeneratorExit, vec![]))
    }

    /// `ZeroDivisionError` shorthand.
    pub fn zero_division<S: Into<String>>(message: S) -> Self {
        Self::raised(ExcKind::ZeroDivisionError, message)
    }

    /// Returns the carried guest exception, if this is one.
    pub fn as_raised(&self) -> Option<&ExceptionValue> {
        match self {
            Self::Raised(exc) => Some(exc),
            _ => None,
        }
    }

    /// Consumes the error, returning the guest exception if it carries one.
    pub fn into_raised(self) -> Result<ExceptionValue, VmError> {
        match self {
            Self::Raised(exc) => Ok(exc),
            other => Err(other),
        }
    }

    /// Returns `true` when this error is a guest exception of the given
    /// builtin kind (exact kind, no subclass walk).
    pub fn is_kind(&self, kind: ExcKind) -> bool {
        self.as_raised().map(|e| e.kind() == Some(kind)).unwrap_or(false)
    }

    /// Returns `true` for errors that must never be trapped into the guest
    /// exception machinery.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Raised(_))
    }
}

/// Result type for interpreter operations.
pub type VmResult<T> = std::result::Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_is_fatal() {
        assert!(VmError::fault("boom").is_fatal());
        assert!(!VmError::type_error("bad").is_fatal());
    }

    #[test]
    fn test_raised_kind() {
        let err = VmError::name_error("x");
        assert!(err.is_kind(ExcKind::NameError));
        assert!(!err.is_kind(ExcKind::TypeError));
        assert_eq!(err.to_string(), "NameError: name 'x' is not defined");
    }

    #[test]
    fn test_stop_iteration_value() {
        let err = VmError::stop_iteration(Some(Value::from_i64(3)));
        let exc = err.into_raised().unwrap();
        assert_eq!(exc.stop_value(), Value::from_i64(3));

        let bare = VmError::stop_iteration(None).into_raised().unwrap();
        assert_eq!(bare.stop_value(), Value::None);
    }
}
