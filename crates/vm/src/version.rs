//! Target interpreter versions.
//!
//! The instruction encoding and the opcode table are both selected by the
//! version the host compiler targeted when it produced a code object.

use crate::error::{VmError, VmResult};

/// A bytecode version understood by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PyVersion {
    /// CPython 3.4 (variable-width instructions).
    Py34,
    /// CPython 3.5 (variable-width instructions, async opcodes).
    Py35,
    /// CPython 3.6 (wordcode).
    Py36,
    /// CPython 3.7 (wordcode, method-call opcodes).
    Py37,
    /// CPython 3.8 (wordcode, explicit finally model).
    Py38,
}

impl PyVersion {
    /// All versions, oldest first.
    pub const ALL: [PyVersion; 5] = [
        PyVersion::Py34,
        PyVersion::Py35,
        PyVersion::Py36,
        PyVersion::Py37,
        PyVersion::Py38,
    ];

    /// Returns `true` when every instruction is a fixed two-byte word.
    /// Versions before 3.6 use one opcode byte plus an optional two-byte
    /// little-endian argument.
    pub fn is_wordcode(self) -> bool {
        self >= PyVersion::Py36
    }

    /// Number of bits an `EXTENDED_ARG` prefix shifts its argument by
    /// before it is OR'd into the next instruction's argument.
    pub fn extended_arg_shift(self) -> u32 {
        if self.is_wordcode() {
            8
        } else {
            16
        }
    }

    /// Width in bytes of one instruction unit. `YIELD_FROM` rewinds the
    /// cursor by exactly this amount to re-execute itself on resumption.
    pub fn instruction_unit(self) -> usize {
        if self.is_wordcode() {
            2
        } else {
            1
        }
    }

    /// Parses a `"3.x"` version string.
    pub fn parse(s: &str) -> VmResult<Self> {
        match s {
            "3.4" => Ok(PyVersion::Py34),
            "3.5" => Ok(PyVersion::Py35),
            "3.6" => Ok(PyVersion::Py36),
            "3.7" => Ok(PyVersion::Py37),
            "3.8" => Ok(PyVersion::Py38),
            _ => Err(VmError::fault(format!("unsupported bytecode version: {s}"))),
        }
    }
}

impl std::fmt::Display for PyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PyVersion::Py34 => "3.4",
            PyVersion::Py35 => "3.5",
            PyVersion::Py36 => "3.6",
            PyVersion::Py37 => "3.7",
            PyVersion::Py38 => "3.8",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wordcode_boundary() {
        assert!(!PyVersion::Py34.is_wordcode());
        assert!(!PyVersion::Py35.is_wordcode());
        assert!(PyVersion::Py36.is_wordcode());
        assert!(PyVersion::Py38.is_wordcode());
    }

    #[test]
    fn test_extended_arg_shift() {
        assert_eq!(PyVersion::Py35.extended_arg_shift(), 16);
        assert_eq!(PyVersion::Py37.extended_arg_shift(), 8);
    }

    #[test]
    fn test_parse_roundtrip() {
        for v in PyVersion::ALL {
            assert_eq!(PyVersion::parse(&v.to_string()).unwrap(), v);
        }
        assert!(PyVersion::parse("2.7").is_err());
    }
}
