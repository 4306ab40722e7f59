//! Closure cells.

use std::cell::RefCell;

use crate::error::{VmError, VmResult};
use crate::object::exception::ExcKind;
use crate::object::Value;

/// A single mutable slot shared between an enclosing frame and the
/// closures created inside it.
///
/// The creating frame owns the cell; inner functions hold it through an
/// `Rc` handle. An empty cell models a variable that has not been bound
/// yet (or was deleted with `DELETE_DEREF`).
#[derive(Debug, Default)]
pub struct Cell {
    contents: RefCell<Option<Value>>,
}

impl Cell {
    /// Creates a cell, optionally pre-seeded with a value.
    pub fn new(value: Option<Value>) -> Self {
        Self {
            contents: RefCell::new(value),
        }
    }

    /// Reads the slot, raising `NameError` when the variable is unbound.
    pub fn get(&self, name: &str) -> VmResult<Value> {
        self.contents.borrow().clone().ok_or_else(|| {
            VmError::raised(
                ExcKind::NameError,
                format!("free variable '{name}' referenced before assignment in enclosing scope"),
            )
        })
    }

    /// Reads the slot without the unbound check.
    pub fn get_opt(&self) -> Option<Value> {
        self.contents.borrow().clone()
    }

    /// Rebinds the slot.
    pub fn set(&self, value: Value) {
        *self.contents.borrow_mut() = Some(value);
    }

    /// Empties the slot, raising `NameError` when it already is.
    pub fn delete(&self, name: &str) -> VmResult<()> {
        if self.contents.borrow_mut().take().is_none() {
            return Err(VmError::raised(
                ExcKind::NameError,
                format!("free variable '{name}' referenced before assignment in enclosing scope"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_lifecycle() {
        let cell = Cell::new(None);
        assert!(cell.get("x").is_err());

        cell.set(Value::from_i64(7));
        assert_eq!(cell.get("x").unwrap().as_index().unwrap(), 7);

        cell.delete("x").unwrap();
        assert!(cell.get("x").is_err());
        assert!(cell.delete("x").is_err());
    }
}
