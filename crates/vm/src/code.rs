//! Compiled code units.
//!
//! A [`CodeObject`] is the read-only input the host compiler hands to the
//! interpreter: instruction bytes, constant pool, name tables, argument
//! counts, flags, and the compressed line-number table.

use std::rc::Rc;

use bitflags::bitflags;

use crate::object::Value;
use crate::version::PyVersion;

bitflags! {
    /// Code object flag bits.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CodeFlags: u32 {
        /// The function accepts `*args`.
        const VARARGS = 0x0004;
        /// The function accepts `**kwargs`.
        const VARKEYWORDS = 0x0008;
        /// The code is a generator body.
        const GENERATOR = 0x0020;
        /// The code is a `async def` coroutine body.
        const COROUTINE = 0x0080;
        /// A generator decorated into an awaitable (legacy asyncio style).
        const ITERABLE_COROUTINE = 0x0100;
        /// The code is an `async def` body containing `yield`.
        const ASYNC_GENERATOR = 0x0200;
    }
}

impl CodeFlags {
    /// Returns `true` when calling a function with this code must produce a
    /// suspendable wrapper instead of running the frame to completion.
    pub fn is_suspendable(self) -> bool {
        self.intersects(CodeFlags::GENERATOR | CodeFlags::COROUTINE | CodeFlags::ASYNC_GENERATOR)
    }
}

/// One compiled code unit, immutable once constructed.
///
/// Code objects are built either programmatically through
/// [`crate::builder::CodeBuilder`] or, with the `serde-types` feature, from
/// a host-side dump via [`crate::marshal`].
#[derive(Debug, Clone)]
pub struct CodeObject {
    /// Bytecode version this unit was compiled for.
    pub version: PyVersion,
    /// Raw instruction bytes.
    pub code: Vec<u8>,
    /// Constant pool.
    pub consts: Vec<Value>,
    /// Global / attribute names referenced by the code.
    pub names: Vec<Rc<str>>,
    /// Local variable names; parameters come first.
    pub varnames: Vec<Rc<str>>,
    /// Names of locals captured by inner closures.
    pub cellvars: Vec<Rc<str>>,
    /// Names of variables captured from an enclosing scope.
    pub freevars: Vec<Rc<str>>,
    /// Number of positional parameters.
    pub argcount: usize,
    /// Number of keyword-only parameters.
    pub kwonlyargcount: usize,
    /// Flag bitset.
    pub flags: CodeFlags,
    /// Simple name of the code unit.
    pub name: Rc<str>,
    /// Dotted name for diagnostics.
    pub qualname: Rc<str>,
    /// Source file name, for tracebacks and tracing.
    pub filename: Rc<str>,
    /// First source line of the unit.
    pub firstlineno: u32,
    /// Compressed line-number table: `(addr_incr, line_incr)` byte pairs,
    /// line increments signed.
    pub lnotab: Vec<u8>,
}

impl CodeObject {
    /// Looks up the name for a `hasfree` argument: cell variables first,
    /// then free variables.
    pub fn free_name(&self, index: usize) -> Option<&Rc<str>> {
        if index < self.cellvars.len() {
            self.cellvars.get(index)
        } else {
            self.freevars.get(index - self.cellvars.len())
        }
    }

    /// Source line for the instruction at `lasti`.
    pub fn line_for_offset(&self, lasti: usize) -> u32 {
        self.line_range(lasti).0
    }

    /// Source line for `lasti` together with the inclusive instruction
    /// offset range `[lb, ub)` covered by that line. The upper bound of the
    /// last entry is open-ended.
    ///
    /// Line increments at or above `0x80` are negative (two's complement in
    /// one byte).
    pub fn line_range(&self, lasti: usize) -> (u32, usize, usize) {
        let mut line = self.firstlineno as i64;
        let mut addr = 0usize;
        let mut lb = 0usize;

        let mut pairs = self
            .lnotab
            .chunks_exact(2)
            .map(|p| (p[0] as usize, p[1] as i64))
            .peekable();

        while let Some(&(addr_incr, _)) = pairs.peek() {
            if addr + addr_incr > lasti {
                break;
            }
            let (addr_incr, line_incr) = pairs.next().expect("peeked pair");
            addr += addr_incr;
            line += if line_incr >= 0x80 {
                line_incr - 0x100
            } else {
                line_incr
            };
            lb = addr;
        }

        let ub = match pairs.peek() {
            Some(&(addr_incr, _)) => addr + addr_incr,
            None => usize::MAX,
        };
        (line as u32, lb, ub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CodeBuilder;

    fn code_with_lnotab(firstlineno: u32, lnotab: Vec<u8>) -> CodeObject {
        let mut code = CodeBuilder::new(PyVersion::Py36, "test").build();
        code.firstlineno = firstlineno;
        code.lnotab = lnotab;
        code
    }

    #[test]
    fn test_line_for_offset() {
        // Offsets 0..6 on line 1, 6..12 on line 2, 12.. on line 5.
        let code = code_with_lnotab(1, vec![6, 1, 6, 3]);
        assert_eq!(code.line_for_offset(0), 1);
        assert_eq!(code.line_for_offset(4), 1);
        assert_eq!(code.line_for_offset(6), 2);
        assert_eq!(code.line_for_offset(11), 2);
        assert_eq!(code.line_for_offset(12), 5);
        assert_eq!(code.line_for_offset(100), 5);
    }

    #[test]
    fn test_negative_line_increment() {
        // Second entry moves two lines back (0xFE == -2).
        let code = code_with_lnotab(10, vec![4, 3, 4, 0xFE]);
        assert_eq!(code.line_for_offset(0), 10);
        assert_eq!(code.line_for_offset(4), 13);
        assert_eq!(code.line_for_offset(8), 11);
    }

    #[test]
    fn test_line_range_bounds() {
        let code = code_with_lnotab(1, vec![6, 1, 6, 1]);
        let (line, lb, ub) = code.line_range(7);
        assert_eq!(line, 2);
        assert_eq!(lb, 6);
        assert_eq!(ub, 12);

        let (_, lb, ub) = code.line_range(20);
        assert_eq!(lb, 12);
        assert_eq!(ub, usize::MAX);
    }

    #[test]
    fn test_free_name_spans_cell_and_free_vars() {
        let mut code = CodeBuilder::new(PyVersion::Py36, "test").build();
        code.cellvars = vec!["a".into()];
        code.freevars = vec!["b".into()];
        assert_eq!(code.free_name(0).unwrap().as_ref(), "a");
        assert_eq!(code.free_name(1).unwrap().as_ref(), "b");
        assert!(code.free_name(2).is_none());
    }
}
