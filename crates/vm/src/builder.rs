//! Programmatic code-object construction.
//!
//! [`CodeBuilder`] assembles version-correct instruction streams: one-byte
//! or three-byte instructions through 3.5, two-byte words from 3.6, with
//! `EXTENDED_ARG` prefixes inserted automatically and labels resolved by
//! relaxation. Embedders and tests use it in place of a host compiler.

use std::rc::Rc;

use crate::code::{CodeFlags, CodeObject};
use crate::error::{VmError, VmResult};
use crate::object::Value;
use crate::op_code::{encode_op, ArgKind, OpCode};
use crate::version::PyVersion;

/// A forward-referencable jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone)]
enum Arg {
    None,
    Raw(u32),
    Target(Label),
}

#[derive(Debug, Clone)]
struct Instr {
    op: OpCode,
    arg: Arg,
    line: Option<u32>,
}

/// Builds [`CodeObject`]s instruction by instruction.
pub struct CodeBuilder {
    version: PyVersion,
    name: Rc<str>,
    instructions: Vec<Instr>,
    labels: Vec<Option<usize>>,
    consts: Vec<Value>,
    names: Vec<Rc<str>>,
    varnames: Vec<Rc<str>>,
    cellvars: Vec<Rc<str>>,
    freevars: Vec<Rc<str>>,
    argcount: usize,
    kwonlyargcount: usize,
    flags: CodeFlags,
    firstlineno: u32,
    pending_line: Option<u32>,
}

impl CodeBuilder {
    /// Starts a builder for one code unit.
    pub fn new(version: PyVersion, name: &str) -> Self {
        Self {
            version,
            name: Rc::from(name),
            instructions: Vec::new(),
            labels: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            argcount: 0,
            kwonlyargcount: 0,
            flags: CodeFlags::empty(),
            firstlineno: 1,
            pending_line: None,
        }
    }

    /// Declares the positional parameters (these become the leading
    /// `varnames`).
    pub fn params(mut self, names: &[&str]) -> Self {
        for name in names {
            self.varname(name);
        }
        self.argcount = names.len();
        self
    }

    /// Sets the keyword-only parameter count.
    pub fn kwonly(mut self, count: usize) -> Self {
        self.kwonlyargcount = count;
        self
    }

    /// Adds code flags.
    pub fn flags(mut self, flags: CodeFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Sets the first source line.
    pub fn firstlineno(mut self, line: u32) -> Self {
        self.firstlineno = line;
        self
    }

    /// Declares cell variables.
    pub fn cellvars(mut self, names: &[&str]) -> Self {
        self.cellvars = names.iter().map(|n| Rc::from(*n)).collect();
        self
    }

    /// Declares free variables.
    pub fn freevars(mut self, names: &[&str]) -> Self {
        self.freevars = names.iter().map(|n| Rc::from(*n)).collect();
        self
    }

    /// Interns a constant, returning its pool index.
    pub fn const_index(&mut self, value: Value) -> u32 {
        if let Some(i) = self.consts.iter().position(|v| v.is_identical(&value)) {
            return i as u32;
        }
        self.consts.push(value);
        (self.consts.len() - 1) as u32
    }

    /// Interns a global/attribute name.
    pub fn name_index(&mut self, name: &str) -> u32 {
        intern(&mut self.names, name)
    }

    /// Interns a local variable name.
    pub fn varname(&mut self, name: &str) -> u32 {
        intern(&mut self.varnames, name)
    }

    /// Marks the source line for the next emitted instruction.
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.pending_line = Some(line);
        self
    }

    /// Creates an unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds a label to the next instruction.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.instructions.len());
    }

    /// Emits a no-argument instruction.
    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.push_instr(op, Arg::None)
    }

    /// Emits an instruction with a raw argument.
    pub fn op_arg(&mut self, op: OpCode, arg: u32) -> &mut Self {
        self.push_instr(op, Arg::Raw(arg))
    }

    /// Emits a jump (or block-setup) instruction targeting a label.
    pub fn op_jump(&mut self, op: OpCode, target: Label) -> &mut Self {
        self.push_instr(op, Arg::Target(target))
    }

    /// Emits `LOAD_CONST` for a value.
    pub fn load_const(&mut self, value: Value) -> &mut Self {
        let index = self.const_index(value);
        self.op_arg(OpCode::LoadConst, index)
    }

    /// Emits an instruction whose argument is a `names` entry.
    pub fn op_name(&mut self, op: OpCode, name: &str) -> &mut Self {
        let index = self.name_index(name);
        self.op_arg(op, index)
    }

    /// Emits an instruction whose argument is a `varnames` entry.
    pub fn op_local(&mut self, op: OpCode, name: &str) -> &mut Self {
        let index = self.varname(name);
        self.op_arg(op, index)
    }

    /// Emits an instruction whose argument indexes `cellvars ++ freevars`.
    pub fn op_free(&mut self, op: OpCode, name: &str) -> VmResult<&mut Self> {
        let index = self
            .cellvars
            .iter()
            .chain(self.freevars.iter())
            .position(|n| n.as_ref() == name)
            .ok_or_else(|| VmError::fault(format!("'{name}' is not a cell or free variable")))?;
        Ok(self.op_arg(op, index as u32))
    }

    fn push_instr(&mut self, op: OpCode, arg: Arg) -> &mut Self {
        let line = self.pending_line.take();
        self.instructions.push(Instr { op, arg, line });
        self
    }

    /// Assembles the final code object.
    pub fn build(self) -> CodeObject {
        self.try_build()
            .expect("code assembly failed; check labels and version support")
    }

    /// Assembles, reporting label and encoding errors.
    pub fn try_build(self) -> VmResult<CodeObject> {
        let CodeBuilder {
            version,
            name,
            instructions,
            labels,
            consts,
            names,
            varnames,
            cellvars,
            freevars,
            argcount,
            kwonlyargcount,
            flags,
            firstlineno,
            ..
        } = self;

        // Size relaxation: argument widths depend on jump targets, which
        // depend on sizes. Iterate until offsets stabilize.
        let mut sizes: Vec<usize> = instructions
            .iter()
            .map(|i| base_size(version, i.op))
            .collect();
        let mut offsets = vec![0usize; instructions.len()];
        for _ in 0..instructions.len() + 2 {
            let mut offset = 0;
            for (i, size) in sizes.iter().enumerate() {
                offsets[i] = offset;
                offset += size;
            }
            let mut changed = false;
            for (i, instr) in instructions.iter().enumerate() {
                let arg = resolve_arg(version, instr, i, &offsets, &sizes, &labels)?;
                if let Some(arg) = arg {
                    let needed = base_size(version, instr.op)
                        + ext_count(version, arg) * ext_size(version);
                    if needed != sizes[i] {
                        sizes[i] = needed;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        // Final encoding pass.
        let mut bytes = Vec::new();
        let mut lnotab = Vec::new();
        let mut last_addr = 0usize;
        let mut last_line = firstlineno;
        for (i, instr) in instructions.iter().enumerate() {
            if let Some(line) = instr.line {
                push_lnotab(&mut lnotab, offsets[i] - last_addr, line as i64 - last_line as i64);
                last_addr = offsets[i];
                last_line = line;
            }
            let opcode = encode_op(version, instr.op).ok_or_else(|| {
                VmError::fault(format!("{} does not exist in {version}", instr.op))
            })?;
            let arg = resolve_arg(version, instr, i, &offsets, &sizes, &labels)?;
            encode_instruction(version, &mut bytes, opcode, arg)?;
        }

        Ok(CodeObject {
            version,
            code: bytes,
            consts,
            names,
            varnames,
            cellvars,
            freevars,
            argcount,
            kwonlyargcount,
            flags,
            qualname: name.clone(),
            name,
            filename: Rc::from("<assembled>"),
            firstlineno,
            lnotab,
        })
    }
}

fn intern(pool: &mut Vec<Rc<str>>, name: &str) -> u32 {
    if let Some(i) = pool.iter().position(|n| n.as_ref() == name) {
        return i as u32;
    }
    pool.push(Rc::from(name));
    (pool.len() - 1) as u32
}

fn base_size(version: PyVersion, op: OpCode) -> usize {
    if version.is_wordcode() {
        2
    } else if op.arg_kind() == ArgKind::None {
        1
    } else {
        3
    }
}

fn ext_size(version: PyVersion) -> usize {
    if version.is_wordcode() {
        2
    } else {
        3
    }
}

fn ext_count(version: PyVersion, arg: u32) -> usize {
    let limit: u32 = if version.is_wordcode() { 0xFF } else { 0xFFFF };
    let mut count = 0;
    let mut rest = arg;
    while rest > limit {
        rest >>= if version.is_wordcode() { 8 } else { 16 };
        count += 1;
    }
    count
}

fn resolve_arg(
    version: PyVersion,
    instr: &Instr,
    index: usize,
    offsets: &[usize],
    sizes: &[usize],
    labels: &[Option<usize>],
) -> VmResult<Option<u32>> {
    match &instr.arg {
        Arg::None => Ok(None),
        Arg::Raw(arg) => Ok(Some(*arg)),
        Arg::Target(label) => {
            let target_index = labels
                .get(label.0)
                .copied()
                .flatten()
                .ok_or_else(|| VmError::fault(format!("unbound label {label:?}")))?;
            let target_offset = if target_index < offsets.len() {
                offsets[target_index]
            } else {
                // Label bound past the last instruction.
                offsets.last().copied().unwrap_or(0) + sizes.last().copied().unwrap_or(0)
            };
            let arg = match instr.op.arg_kind() {
                ArgKind::JumpAbs => target_offset,
                ArgKind::JumpRel => {
                    let after = offsets[index] + sizes[index];
                    target_offset.checked_sub(after).ok_or_else(|| {
                        VmError::fault(format!(
                            "relative jump target precedes {} at offset {}",
                            instr.op, offsets[index]
                        ))
                    })?
                }
                other => {
                    return Err(VmError::fault(format!(
                        "label argument on non-jump opcode {} ({other:?})",
                        instr.op
                    )))
                }
            };
            Ok(Some(arg as u32))
        }
    }
}

fn encode_instruction(
    version: PyVersion,
    bytes: &mut Vec<u8>,
    opcode: u8,
    arg: Option<u32>,
) -> VmResult<()> {
    let ext_opcode = encode_op(version, OpCode::ExtendedArg)
        .ok_or_else(|| VmError::fault("EXTENDED_ARG missing from opcode table"))?;

    match arg {
        None => {
            bytes.push(opcode);
            if version.is_wordcode() {
                bytes.push(0);
            }
        }
        Some(arg) if version.is_wordcode() => {
            let mut chunks = vec![(arg & 0xFF) as u8];
            let mut rest = arg >> 8;
            while rest > 0 {
                chunks.push((rest & 0xFF) as u8);
                rest >>= 8;
            }
            for &chunk in chunks.iter().skip(1).rev() {
                bytes.push(ext_opcode);
                bytes.push(chunk);
            }
            bytes.push(opcode);
            bytes.push(chunks[0]);
        }
        Some(arg) => {
            if arg > 0xFFFF {
                let high = arg >> 16;
                bytes.push(ext_opcode);
                bytes.push((high & 0xFF) as u8);
                bytes.push(((high >> 8) & 0xFF) as u8);
            }
            bytes.push(opcode);
            bytes.push((arg & 0xFF) as u8);
            bytes.push(((arg >> 8) & 0xFF) as u8);
        }
    }
    Ok(())
}

fn push_lnotab(lnotab: &mut Vec<u8>, mut addr_incr: usize, mut line_incr: i64) {
    while addr_incr > 255 {
        lnotab.push(255);
        lnotab.push(0);
        addr_incr -= 255;
    }
    while line_incr > 127 {
        lnotab.push(addr_incr as u8);
        lnotab.push(127);
        addr_incr = 0;
        line_incr -= 127;
    }
    while line_incr < -128 {
        lnotab.push(addr_incr as u8);
        lnotab.push(0x80);
        addr_incr = 0;
        line_incr += 128;
    }
    lnotab.push(addr_incr as u8);
    lnotab.push((line_incr as i8) as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wordcode_encoding() {
        let mut b = CodeBuilder::new(PyVersion::Py36, "t");
        b.load_const(Value::from_i64(1));
        b.op(OpCode::ReturnValue);
        let code = b.build();
        // LOAD_CONST 0; RETURN_VALUE 0
        assert_eq!(code.code, vec![100, 0, 83, 0]);
    }

    #[test]
    fn test_legacy_encoding_widths() {
        let mut b = CodeBuilder::new(PyVersion::Py34, "t");
        b.load_const(Value::from_i64(1));
        b.op(OpCode::PopTop);
        let code = b.build();
        // LOAD_CONST is three bytes, POP_TOP one.
        assert_eq!(code.code, vec![100, 0, 0, 1]);
    }

    #[test]
    fn test_extended_arg_emission() {
        let mut b = CodeBuilder::new(PyVersion::Py36, "t");
        b.op_arg(OpCode::LoadConst, 0x1FF);
        let code = b.build();
        // EXTENDED_ARG 1; LOAD_CONST 0xFF
        assert_eq!(code.code, vec![144, 1, 100, 0xFF]);
    }

    #[test]
    fn test_forward_jump_resolution() {
        let mut b = CodeBuilder::new(PyVersion::Py36, "t");
        let end = b.label();
        b.op_jump(OpCode::JumpForward, end);
        b.op(OpCode::Nop);
        b.bind(end);
        b.load_const(Value::None);
        b.op(OpCode::ReturnValue);
        let code = b.build();
        // JUMP_FORWARD skips the NOP: relative distance 2.
        assert_eq!(code.code[0], 110);
        assert_eq!(code.code[1], 2);
    }

    #[test]
    fn test_const_interning_dedupes() {
        let mut b = CodeBuilder::new(PyVersion::Py36, "t");
        let a = b.const_index(Value::None);
        let c = b.const_index(Value::None);
        assert_eq!(a, c);
    }

    #[test]
    fn test_lnotab_generation() {
        let mut b = CodeBuilder::new(PyVersion::Py36, "t");
        b.line(1);
        b.load_const(Value::from_i64(1));
        b.line(2);
        b.load_const(Value::from_i64(2));
        b.op(OpCode::ReturnValue);
        let code = b.build();
        assert_eq!(code.line_for_offset(0), 1);
        assert_eq!(code.line_for_offset(2), 2);
        assert_eq!(code.line_for_offset(4), 2);
    }

    #[test]
    fn test_unbound_label_errors() {
        let mut b = CodeBuilder::new(PyVersion::Py36, "t");
        let dangling = b.label();
        b.op_jump(OpCode::JumpForward, dangling);
        assert!(b.try_build().is_err());
    }
}
