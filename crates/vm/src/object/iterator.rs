//! Builtin iterator, range, and slice objects.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{VmError, VmResult};
use crate::object::Value;

/// The state of a builtin iterator produced by `iter()` over a native
/// container. User iterators (objects with `__next__`) are driven through
/// the protocol layer instead.
#[derive(Debug)]
pub enum IterObject {
    /// Live view over a list; observes mutation like the guest's list
    /// iterator does.
    List {
        list: Rc<RefCell<Vec<Value>>>,
        index: usize,
    },
    /// Iterator over an immutable snapshot (tuples, dict keys, sets,
    /// strings exploded to characters).
    Seq { items: Vec<Value>, index: usize },
    /// Iterator over a range.
    Range { range: Rc<RangeObject>, index: i64 },
}

impl IterObject {
    /// Advances the iterator; `None` signals exhaustion.
    pub fn next(&mut self) -> Option<Value> {
        match self {
            IterObject::List { list, index } => {
                let item = list.borrow().get(*index).cloned();
                if item.is_some() {
                    *index += 1;
                }
                item
            }
            IterObject::Seq { items, index } => {
                let item = items.get(*index).cloned();
                if item.is_some() {
                    *index += 1;
                }
                item
            }
            IterObject::Range { range, index } => {
                let value = range.start + *index * range.step;
                if range.contains_step(*index) {
                    *index += 1;
                    Some(Value::from_i64(value))
                } else {
                    None
                }
            }
        }
    }
}

/// A `range` object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeObject {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeObject {
    /// Creates a range, rejecting a zero step.
    pub fn new(start: i64, stop: i64, step: i64) -> VmResult<Self> {
        if step == 0 {
            return Err(VmError::value_error("range() arg 3 must not be zero"));
        }
        Ok(Self { start, stop, step })
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        let span = if self.step > 0 {
            self.stop.saturating_sub(self.start)
        } else {
            self.start.saturating_sub(self.stop)
        };
        if span <= 0 {
            0
        } else {
            ((span + self.step.abs() - 1) / self.step.abs()) as usize
        }
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains_step(&self, index: i64) -> bool {
        (index as usize) < self.len()
    }

    /// Element at a position, for subscripting.
    pub fn get(&self, index: usize) -> Option<i64> {
        if index < self.len() {
            Some(self.start + index as i64 * self.step)
        } else {
            None
        }
    }

    pub fn repr(&self) -> String {
        if self.step == 1 {
            format!("range({}, {})", self.start, self.stop)
        } else {
            format!("range({}, {}, {})", self.start, self.stop, self.step)
        }
    }
}

/// A slice object built by `BUILD_SLICE`.
#[derive(Debug, Clone)]
pub struct SliceObject {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}

impl SliceObject {
    pub fn new(start: Value, stop: Value, step: Value) -> Self {
        Self { start, stop, step }
    }

    /// Resolves the slice against a sequence length into
    /// `(start, stop, step)` concrete indices.
    pub fn indices(&self, len: usize) -> VmResult<(i64, i64, i64)> {
        let len = len as i64;
        let step = match &self.step {
            Value::None => 1,
            v => v.as_index()?,
        };
        if step == 0 {
            return Err(VmError::value_error("slice step cannot be zero"));
        }
        let default_start = if step > 0 { 0 } else { len - 1 };
        let default_stop = if step > 0 { len } else { -1 };

        let clamp = |v: i64, lo: i64, hi: i64| v.max(lo).min(hi);
        let resolve = |v: &Value, default: i64, neg_floor: i64| -> VmResult<i64> {
            match v {
                Value::None => Ok(default),
                v => {
                    let mut idx = v.as_index()?;
                    if idx < 0 {
                        idx += len;
                    }
                    Ok(clamp(idx, neg_floor, len))
                }
            }
        };
        let start = resolve(&self.start, default_start, if step > 0 { 0 } else { -1 })?;
        let stop = resolve(&self.stop, default_stop, if step > 0 { 0 } else { -1 })?;
        Ok((start, stop, step))
    }

    pub fn repr(&self) -> String {
        format!(
            "slice({}, {}, {})",
            self.start.repr(),
            self.stop.repr(),
            self.step.repr()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_len() {
        assert_eq!(RangeObject::new(0, 3, 1).unwrap().len(), 3);
        assert_eq!(RangeObject::new(0, 10, 3).unwrap().len(), 4);
        assert_eq!(RangeObject::new(5, 0, -1).unwrap().len(), 5);
        assert_eq!(RangeObject::new(3, 3, 1).unwrap().len(), 0);
        assert!(RangeObject::new(0, 1, 0).is_err());
    }

    #[test]
    fn test_range_iteration() {
        let range = Rc::new(RangeObject::new(0, 3, 1).unwrap());
        let mut it = IterObject::Range { range, index: 0 };
        let mut seen = vec![];
        while let Some(v) = it.next() {
            seen.push(v.as_index().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_list_iterator_sees_mutation() {
        let storage = Rc::new(RefCell::new(vec![Value::from_i64(1)]));
        let mut it = IterObject::List {
            list: storage.clone(),
            index: 0,
        };
        assert_eq!(it.next(), Some(Value::from_i64(1)));
        storage.borrow_mut().push(Value::from_i64(2));
        assert_eq!(it.next(), Some(Value::from_i64(2)));
        assert_eq!(it.next(), None);
    }

    #[test]
    fn test_slice_indices() {
        let slice = SliceObject::new(Value::None, Value::None, Value::None);
        assert_eq!(slice.indices(5).unwrap(), (0, 5, 1));

        let slice = SliceObject::new(Value::from_i64(1), Value::from_i64(-1), Value::None);
        assert_eq!(slice.indices(5).unwrap(), (1, 4, 1));

        let slice = SliceObject::new(Value::None, Value::None, Value::from_i64(-1));
        assert_eq!(slice.indices(3).unwrap(), (2, -1, -1));
    }
}
