//! Evaluator scratch state.
//!
//! Transient values that individual opcode handlers leave for the
//! evaluation loop (and each other) to pick up between instructions. The
//! reference system kept these in a process-wide cache; here they are a
//! plain field of the evaluator, saved and restored around nested runs by
//! generator resumption.

use std::rc::Rc;

use crate::object::exception::ExceptionValue;
use crate::object::Value;

/// An exception triple `(type, value, traceback)` as it travels through
/// the unwinding machinery and the value stack.
#[derive(Debug, Clone)]
pub struct ExcTriple {
    pub etype: Value,
    pub value: Value,
    pub tb: Value,
}

impl ExcTriple {
    /// Builds a triple from an exception instance. Tracebacks are carried
    /// but never synthesized by this evaluator.
    pub fn from_exception(exc: Rc<ExceptionValue>) -> Self {
        Self {
            etype: exc.class_value(),
            value: Value::Exception(exc),
            tb: Value::None,
        }
    }

    /// The "no exception" triple `(None, None, None)` pushed when
    /// exception handling begins outside any prior handler.
    pub fn none() -> Self {
        Self {
            etype: Value::None,
            value: Value::None,
            tb: Value::None,
        }
    }

    /// The exception instance, when the triple carries one.
    pub fn exception(&self) -> Option<Rc<ExceptionValue>> {
        match &self.value {
            Value::Exception(exc) => Some(exc.clone()),
            _ => None,
        }
    }
}

/// Inter-opcode scratch slots.
#[derive(Debug, Default)]
pub struct Scratch {
    /// Value written by `RETURN_VALUE` / `YIELD_VALUE`; `CONTINUE_LOOP`
    /// borrows it to carry the jump target.
    pub return_value: Value,
    /// Exception raised and not yet caught.
    pub last_exception: Option<ExcTriple>,
    /// The exception currently being handled (the `exc_info` analogue).
    pub current_exception: Option<ExcTriple>,
    /// High-order bits contributed by an `EXTENDED_ARG` prefix.
    pub oparg: u32,
}

impl Scratch {
    /// Takes the pending raised exception, leaving the slot empty.
    pub fn take_last_exception(&mut self) -> Option<ExcTriple> {
        self.last_exception.take()
    }

    /// Takes the accumulated `EXTENDED_ARG` bits.
    pub fn take_oparg(&mut self) -> u32 {
        std::mem::take(&mut self.oparg)
    }

    /// Moves `return_value` out, replacing it with `None`.
    pub fn take_return_value(&mut self) -> Value {
        std::mem::take(&mut self.return_value)
    }

    /// Snapshot of the slots a nested evaluator run may clobber.
    pub fn save(&mut self) -> SavedScratch {
        SavedScratch {
            return_value: std::mem::take(&mut self.return_value),
            last_exception: self.last_exception.take(),
        }
    }

    /// Restores a snapshot taken by [`Scratch::save`].
    pub fn restore(&mut self, saved: SavedScratch) {
        self.return_value = saved.return_value;
        self.last_exception = saved.last_exception;
    }
}

/// Slots preserved across a nested `run` (generator resumption).
#[derive(Debug)]
pub struct SavedScratch {
    return_value: Value,
    last_exception: Option<ExcTriple>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::exception::ExcKind;

    #[test]
    fn test_save_restore_roundtrip() {
        let mut scratch = Scratch::default();
        scratch.return_value = Value::from_i64(1);
        scratch.last_exception = Some(ExcTriple::from_exception(Rc::new(
            ExceptionValue::with_message(ExcKind::ValueError, "x"),
        )));

        let saved = scratch.save();
        assert_eq!(scratch.return_value, Value::None);
        assert!(scratch.last_exception.is_none());

        scratch.return_value = Value::from_i64(2);
        scratch.restore(saved);
        assert_eq!(scratch.return_value, Value::from_i64(1));
        assert!(scratch.last_exception.is_some());
    }

    #[test]
    fn test_triple_from_exception() {
        let exc = Rc::new(ExceptionValue::with_message(ExcKind::TypeError, "t"));
        let triple = ExcTriple::from_exception(exc);
        assert!(matches!(triple.etype, Value::ExcType(_)));
        assert!(triple.exception().is_some());
        assert!(ExcTriple::none().exception().is_none());
    }
}
