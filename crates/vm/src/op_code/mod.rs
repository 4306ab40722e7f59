//! Opcode namespace for the supported bytecode versions.
//!
//! [`OpCode`] is the union of every instruction name that appears in the
//! 3.4–3.8 instruction sets. The mapping from opcode *bytes* to names is
//! version-specific and lives in [`tables`]; an `OpCode` value itself is
//! version-neutral, which lets the handler table and the assembler share one
//! namespace.

pub mod tables;

pub use tables::{decode_table, encode_op, HAVE_ARGUMENT};

/// How an instruction's raw integer argument is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// No argument.
    None,
    /// Index into the constant pool.
    Const,
    /// Index into `names`.
    Name,
    /// Index into `varnames`.
    Local,
    /// Index into `cellvars ++ freevars`.
    Free,
    /// Relative jump: target is `cursor + arg`.
    JumpRel,
    /// Absolute jump target.
    JumpAbs,
    /// Plain integer, interpreted by the handler.
    Raw,
}

macro_rules! op_codes {
    ($($name:ident => $kind:ident),+ $(,)?) => {
        /// An instruction name. The numeric encoding is version-specific;
        /// see [`tables`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum OpCode {
            $($name),+
        }

        impl OpCode {
            /// Number of distinct opcode names across all versions.
            pub const COUNT: usize = [$(OpCode::$name),+].len();

            /// Every opcode name.
            pub const ALL: [OpCode; Self::COUNT] = [$(OpCode::$name),+];

            /// How this opcode's argument is interpreted.
            pub fn arg_kind(self) -> ArgKind {
                match self {
                    $(OpCode::$name => ArgKind::$kind),+
                }
            }
        }
    };
}

op_codes! {
    // Stack manipulation
    PopTop => None,
    RotTwo => None,
    RotThree => None,
    RotFour => None,
    DupTop => None,
    DupTopTwo => None,
    Nop => None,

    // Unary operators
    UnaryPositive => None,
    UnaryNegative => None,
    UnaryNot => None,
    UnaryInvert => None,

    // Binary operators
    BinaryMatrixMultiply => None,
    BinaryPower => None,
    BinaryMultiply => None,
    BinaryModulo => None,
    BinaryAdd => None,
    BinarySubtract => None,
    BinarySubscr => None,
    BinaryFloorDivide => None,
    BinaryTrueDivide => None,
    BinaryLshift => None,
    BinaryRshift => None,
    BinaryAnd => None,
    BinaryXor => None,
    BinaryOr => None,

    // In-place operators
    InplaceMatrixMultiply => None,
    InplaceFloorDivide => None,
    InplaceTrueDivide => None,
    InplaceAdd => None,
    InplaceSubtract => None,
    InplaceMultiply => None,
    InplaceModulo => None,
    InplacePower => None,
    InplaceLshift => None,
    InplaceRshift => None,
    InplaceAnd => None,
    InplaceXor => None,
    InplaceOr => None,

    // Subscript stores
    StoreMap => None,
    StoreSubscr => None,
    DeleteSubscr => None,

    // Coroutine / async plumbing
    GetAiter => None,
    GetAnext => None,
    BeforeAsyncWith => None,
    BeginFinally => None,
    EndAsyncFor => None,
    GetAwaitable => None,
    GetYieldFromIter => None,

    // Iteration and miscellany
    GetIter => None,
    PrintExpr => None,
    LoadBuildClass => None,
    YieldFrom => None,
    WithCleanup => None,
    WithCleanupStart => None,
    WithCleanupFinish => None,
    BreakLoop => None,
    ReturnValue => None,
    ImportStar => None,
    SetupAnnotations => None,
    YieldValue => None,
    PopBlock => None,
    EndFinally => None,
    PopExcept => None,

    // Namespace access
    StoreName => Name,
    DeleteName => Name,
    UnpackSequence => Raw,
    ForIter => JumpRel,
    UnpackEx => Raw,
    StoreAttr => Name,
    DeleteAttr => Name,
    StoreGlobal => Name,
    DeleteGlobal => Name,
    LoadConst => Const,
    LoadName => Name,

    // Container construction
    BuildTuple => Raw,
    BuildList => Raw,
    BuildSet => Raw,
    BuildMap => Raw,
    LoadAttr => Name,
    CompareOp => Raw,
    ImportName => Name,
    ImportFrom => Name,

    // Jumps
    JumpForward => JumpRel,
    JumpIfFalseOrPop => JumpAbs,
    JumpIfTrueOrPop => JumpAbs,
    JumpAbsolute => JumpAbs,
    PopJumpIfFalse => JumpAbs,
    PopJumpIfTrue => JumpAbs,
    LoadGlobal => Name,

    // Blocks
    ContinueLoop => JumpAbs,
    SetupLoop => JumpRel,
    SetupExcept => JumpRel,
    SetupFinally => JumpRel,

    // Fast locals
    LoadFast => Local,
    StoreFast => Local,
    DeleteFast => Local,
    StoreAnnotation => Name,

    // Calls and function construction
    RaiseVarargs => Raw,
    CallFunction => Raw,
    MakeFunction => Raw,
    BuildSlice => Raw,
    MakeClosure => Raw,
    LoadClosure => Free,
    LoadDeref => Free,
    StoreDeref => Free,
    DeleteDeref => Free,
    CallFunctionVar => Raw,
    CallFunctionKw => Raw,
    CallFunctionVarKw => Raw,
    CallFunctionEx => Raw,
    SetupWith => JumpRel,
    ExtendedArg => Raw,
    ListAppend => Raw,
    SetAdd => Raw,
    MapAdd => Raw,
    LoadClassderef => Free,

    // Unpacking builders (3.5+)
    BuildListUnpack => Raw,
    BuildMapUnpack => Raw,
    BuildMapUnpackWithCall => Raw,
    BuildTupleUnpack => Raw,
    BuildSetUnpack => Raw,
    SetupAsyncWith => JumpRel,

    // 3.6+ additions
    FormatValue => Raw,
    BuildConstKeyMap => Raw,
    BuildString => Raw,
    BuildTupleUnpackWithCall => Raw,

    // 3.7+ method-call protocol
    LoadMethod => Name,
    CallMethod => Raw,

    // 3.8 finally model
    CallFinally => JumpRel,
    PopFinally => Raw,
}

impl OpCode {
    /// Upper-snake-case name as it appears in disassembly listings.
    pub fn name(self) -> &'static str {
        tables::op_name(self)
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_kinds() {
        assert_eq!(OpCode::PopTop.arg_kind(), ArgKind::None);
        assert_eq!(OpCode::LoadConst.arg_kind(), ArgKind::Const);
        assert_eq!(OpCode::LoadFast.arg_kind(), ArgKind::Local);
        assert_eq!(OpCode::LoadDeref.arg_kind(), ArgKind::Free);
        assert_eq!(OpCode::ForIter.arg_kind(), ArgKind::JumpRel);
        assert_eq!(OpCode::JumpAbsolute.arg_kind(), ArgKind::JumpAbs);
        assert_eq!(OpCode::CompareOp.arg_kind(), ArgKind::Raw);
    }

    #[test]
    fn test_display_name() {
        assert_eq!(OpCode::PopJumpIfFalse.to_string(), "POP_JUMP_IF_FALSE");
        assert_eq!(OpCode::DupTopTwo.to_string(), "DUP_TOP_TWO");
    }
}
