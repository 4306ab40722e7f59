//! Opcode handler dispatch.
//!
//! The [`JumpTable`] maps every [`OpCode`] name to a handler function. One
//! base registration covers the opcodes whose semantics are shared across
//! versions; per-version patch lists override the handful that changed
//! (`MAKE_FUNCTION`, the call protocol, `END_FINALLY`, the 3.8 finally
//! model) and mark removed opcodes so that invoking one faults with the
//! removing version's name.

pub mod arith;
pub mod build;
pub mod call;
pub mod control;
pub mod coro;
pub mod names;
pub mod stack;

use std::rc::Rc;

use crate::error::{VmError, VmResult};
use crate::object::Value;
use crate::op_code::OpCode;
use crate::version::PyVersion;
use crate::vm::Vm;
use crate::why::Why;

/// A decoded instruction argument, resolved through its family table.
#[derive(Debug, Clone)]
pub enum Operand {
    /// No argument.
    None,
    /// Raw integer argument.
    Raw(u32),
    /// Resolved constant-pool entry.
    Const(Value),
    /// Resolved name (from `names`, `varnames`, or the cell/free tables).
    Name(Rc<str>),
    /// Resolved jump target (absolute offset).
    Jump(usize),
}

impl Operand {
    /// The raw integer argument.
    pub fn raw(&self) -> VmResult<u32> {
        match self {
            Operand::Raw(v) => Ok(*v),
            other => Err(VmError::fault(format!(
                "expected raw operand, got {other:?}"
            ))),
        }
    }

    /// The resolved constant.
    pub fn constant(&self) -> VmResult<Value> {
        match self {
            Operand::Const(v) => Ok(v.clone()),
            other => Err(VmError::fault(format!(
                "expected const operand, got {other:?}"
            ))),
        }
    }

    /// The resolved name.
    pub fn name(&self) -> VmResult<Rc<str>> {
        match self {
            Operand::Name(n) => Ok(n.clone()),
            other => Err(VmError::fault(format!(
                "expected name operand, got {other:?}"
            ))),
        }
    }

    /// The resolved jump target.
    pub fn jump(&self) -> VmResult<usize> {
        match self {
            Operand::Jump(t) => Ok(*t),
            other => Err(VmError::fault(format!(
                "expected jump operand, got {other:?}"
            ))),
        }
    }
}

/// A handler for one opcode.
pub type OpHandler = fn(&mut Vm, Operand) -> VmResult<Option<Why>>;

/// Handler table indexed by [`OpCode`].
pub struct JumpTable {
    handlers: [Option<OpHandler>; OpCode::COUNT],
    version: PyVersion,
}

impl JumpTable {
    /// Builds the handler table for one bytecode version.
    pub fn for_version(version: PyVersion) -> Self {
        let mut table = Self {
            handlers: [None; OpCode::COUNT],
            version,
        };

        stack::register_handlers(&mut table);
        arith::register_handlers(&mut table);
        names::register_handlers(&mut table);
        build::register_handlers(&mut table);
        control::register_handlers(&mut table);
        call::register_handlers(&mut table);
        coro::register_handlers(&mut table);

        // Version patches, applied oldest to newest so each override
        // stacks on the previous version's table.
        if version >= PyVersion::Py35 {
            table.remove(OpCode::WithCleanup, "3.5");
            table.remove(OpCode::StoreMap, "3.5");
        }
        if version >= PyVersion::Py36 {
            table.remove(OpCode::MakeClosure, "3.6");
            table.remove(OpCode::CallFunctionVar, "3.6");
            table.remove(OpCode::CallFunctionVarKw, "3.6");
            table.register(OpCode::MakeFunction, call::make_function_bitmask);
            table.register(OpCode::CallFunctionKw, call::call_function_kw_names);
        }
        if version >= PyVersion::Py37 {
            table.remove(OpCode::StoreAnnotation, "3.7");
        }
        if version >= PyVersion::Py38 {
            table.remove(OpCode::BreakLoop, "3.8");
            table.remove(OpCode::ContinueLoop, "3.8");
            table.remove(OpCode::SetupLoop, "3.8");
            table.remove(OpCode::SetupExcept, "3.8");
            table.register(OpCode::EndFinally, control::end_finally_py38);
            table.register(OpCode::WithCleanupFinish, control::with_cleanup_finish_py38);
        }

        table
    }

    /// The version this table was built for.
    pub fn version(&self) -> PyVersion {
        self.version
    }

    /// Registers a handler.
    pub fn register(&mut self, op: OpCode, handler: OpHandler) {
        self.handlers[op as usize] = Some(handler);
    }

    fn remove(&mut self, op: OpCode, version: &'static str) {
        // Removed opcodes keep a handler so an instruction stream that
        // still carries one fails with a diagnostic naming the version.
        self.handlers[op as usize] = Some(match version {
            "3.5" => removed_35,
            "3.6" => removed_36,
            "3.7" => removed_37,
            _ => removed_38,
        });
    }

    /// Looks up the handler for an opcode.
    pub fn get(&self, op: OpCode) -> VmResult<OpHandler> {
        self.handlers[op as usize].ok_or_else(|| {
            VmError::fault(format!("no handler registered for {op}"))
        })
    }
}

macro_rules! removed_in {
    ($name:ident, $version:literal) => {
        fn $name(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
            let op = vm.current_op_name();
            Err(VmError::removed(op, $version.to_string()))
        }
    };
}

removed_in!(removed_35, "3.5");
removed_in!(removed_36, "3.6");
removed_in!(removed_37, "3.7");
removed_in!(removed_38, "3.8");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op_code::tables::decode_table;

    #[test]
    fn test_every_decodable_opcode_has_a_handler() {
        for version in PyVersion::ALL {
            let table = JumpTable::for_version(version);
            for entry in decode_table(version).iter().flatten() {
                assert!(
                    table.get(*entry).is_ok(),
                    "{entry} decodable in {version} but has no handler"
                );
            }
        }
    }

    #[test]
    fn test_removed_opcode_faults_with_version() {
        let table = JumpTable::for_version(PyVersion::Py36);
        let handler = table.get(OpCode::MakeClosure).unwrap();
        let mut vm = Vm::new(PyVersion::Py36);
        let err = handler(&mut vm, Operand::Raw(0)).unwrap_err();
        assert!(err.to_string().contains("3.6"));
    }
}
