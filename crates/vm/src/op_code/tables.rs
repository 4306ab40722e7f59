//! Version-specific opcode byte tables.
//!
//! Each supported version maps instruction bytes to [`OpCode`] names. The
//! 3.4 table is the base; later versions are derived from their predecessor
//! by removing and adding entries, mirroring how the instruction sets
//! actually evolved. Tables are built once and cached.

use once_cell::sync::Lazy;

use super::OpCode;
use crate::version::PyVersion;

/// First opcode byte that carries an argument (stable across 3.4–3.8).
pub const HAVE_ARGUMENT: u8 = 90;

type DecodeTable = [Option<OpCode>; 256];

const BASE_34: &[(u8, OpCode)] = &[
    (1, OpCode::PopTop),
    (2, OpCode::RotTwo),
    (3, OpCode::RotThree),
    (4, OpCode::DupTop),
    (5, OpCode::DupTopTwo),
    (9, OpCode::Nop),
    (10, OpCode::UnaryPositive),
    (11, OpCode::UnaryNegative),
    (12, OpCode::UnaryNot),
    (15, OpCode::UnaryInvert),
    (19, OpCode::BinaryPower),
    (20, OpCode::BinaryMultiply),
    (22, OpCode::BinaryModulo),
    (23, OpCode::BinaryAdd),
    (24, OpCode::BinarySubtract),
    (25, OpCode::BinarySubscr),
    (26, OpCode::BinaryFloorDivide),
    (27, OpCode::BinaryTrueDivide),
    (28, OpCode::InplaceFloorDivide),
    (29, OpCode::InplaceTrueDivide),
    (54, OpCode::StoreMap),
    (55, OpCode::InplaceAdd),
    (56, OpCode::InplaceSubtract),
    (57, OpCode::InplaceMultiply),
    (59, OpCode::InplaceModulo),
    (60, OpCode::StoreSubscr),
    (61, OpCode::DeleteSubscr),
    (62, OpCode::BinaryLshift),
    (63, OpCode::BinaryRshift),
    (64, OpCode::BinaryAnd),
    (65, OpCode::BinaryXor),
    (66, OpCode::BinaryOr),
    (67, OpCode::InplacePower),
    (68, OpCode::GetIter),
    (70, OpCode::PrintExpr),
    (71, OpCode::LoadBuildClass),
    (72, OpCode::YieldFrom),
    (75, OpCode::InplaceLshift),
    (76, OpCode::InplaceRshift),
    (77, OpCode::InplaceAnd),
    (78, OpCode::InplaceXor),
    (79, OpCode::InplaceOr),
    (80, OpCode::BreakLoop),
    (81, OpCode::WithCleanup),
    (83, OpCode::ReturnValue),
    (84, OpCode::ImportStar),
    (86, OpCode::YieldValue),
    (87, OpCode::PopBlock),
    (88, OpCode::EndFinally),
    (89, OpCode::PopExcept),
    (90, OpCode::StoreName),
    (91, OpCode::DeleteName),
    (92, OpCode::UnpackSequence),
    (93, OpCode::ForIter),
    (94, OpCode::UnpackEx),
    (95, OpCode::StoreAttr),
    (96, OpCode::DeleteAttr),
    (97, OpCode::StoreGlobal),
    (98, OpCode::DeleteGlobal),
    (100, OpCode::LoadConst),
    (101, OpCode::LoadName),
    (102, OpCode::BuildTuple),
    (103, OpCode::BuildList),
    (104, OpCode::BuildSet),
    (105, OpCode::BuildMap),
    (106, OpCode::LoadAttr),
    (107, OpCode::CompareOp),
    (108, OpCode::ImportName),
    (109, OpCode::ImportFrom),
    (110, OpCode::JumpForward),
    (111, OpCode::JumpIfFalseOrPop),
    (112, OpCode::JumpIfTrueOrPop),
    (113, OpCode::JumpAbsolute),
    (114, OpCode::PopJumpIfFalse),
    (115, OpCode::PopJumpIfTrue),
    (116, OpCode::LoadGlobal),
    (119, OpCode::ContinueLoop),
    (120, OpCode::SetupLoop),
    (121, OpCode::SetupExcept),
    (122, OpCode::SetupFinally),
    (124, OpCode::LoadFast),
    (125, OpCode::StoreFast),
    (126, OpCode::DeleteFast),
    (130, OpCode::RaiseVarargs),
    (131, OpCode::CallFunction),
    (132, OpCode::MakeFunction),
    (133, OpCode::BuildSlice),
    (134, OpCode::MakeClosure),
    (135, OpCode::LoadClosure),
    (136, OpCode::LoadDeref),
    (137, OpCode::StoreDeref),
    (138, OpCode::DeleteDeref),
    (140, OpCode::CallFunctionVar),
    (141, OpCode::CallFunctionKw),
    (142, OpCode::CallFunctionVarKw),
    (143, OpCode::SetupWith),
    (144, OpCode::ExtendedArg),
    (145, OpCode::ListAppend),
    (146, OpCode::SetAdd),
    (147, OpCode::MapAdd),
    (148, OpCode::LoadClassderef),
];

const REMOVED_35: &[u8] = &[54, 81]; // STORE_MAP, WITH_CLEANUP
const ADDED_35: &[(u8, OpCode)] = &[
    (16, OpCode::BinaryMatrixMultiply),
    (17, OpCode::InplaceMatrixMultiply),
    (50, OpCode::GetAiter),
    (51, OpCode::GetAnext),
    (52, OpCode::BeforeAsyncWith),
    (69, OpCode::GetYieldFromIter),
    (73, OpCode::GetAwaitable),
    (81, OpCode::WithCleanupStart),
    (82, OpCode::WithCleanupFinish),
    (149, OpCode::BuildListUnpack),
    (150, OpCode::BuildMapUnpack),
    (151, OpCode::BuildMapUnpackWithCall),
    (152, OpCode::BuildTupleUnpack),
    (153, OpCode::BuildSetUnpack),
    (154, OpCode::SetupAsyncWith),
];

// MAKE_CLOSURE, CALL_FUNCTION_VAR, CALL_FUNCTION_VAR_KW
const REMOVED_36: &[u8] = &[134, 140, 142];
const ADDED_36: &[(u8, OpCode)] = &[
    (85, OpCode::SetupAnnotations),
    (127, OpCode::StoreAnnotation),
    (142, OpCode::CallFunctionEx),
    (155, OpCode::FormatValue),
    (156, OpCode::BuildConstKeyMap),
    (157, OpCode::BuildString),
    (158, OpCode::BuildTupleUnpackWithCall),
];

const REMOVED_37: &[u8] = &[127]; // STORE_ANNOTATION
const ADDED_37: &[(u8, OpCode)] = &[
    (160, OpCode::LoadMethod),
    (161, OpCode::CallMethod),
];

// BREAK_LOOP, CONTINUE_LOOP, SETUP_LOOP, SETUP_EXCEPT
const REMOVED_38: &[u8] = &[80, 119, 120, 121];
const ADDED_38: &[(u8, OpCode)] = &[
    (6, OpCode::RotFour),
    (53, OpCode::BeginFinally),
    (54, OpCode::EndAsyncFor),
    (162, OpCode::CallFinally),
    (163, OpCode::PopFinally),
];

fn apply(table: &mut DecodeTable, removed: &[u8], added: &[(u8, OpCode)]) {
    for &byte in removed {
        table[byte as usize] = None;
    }
    for &(byte, op) in added {
        table[byte as usize] = Some(op);
    }
}

fn build_tables() -> [DecodeTable; 5] {
    let mut py34: DecodeTable = [None; 256];
    apply(&mut py34, &[], BASE_34);

    let mut py35 = py34;
    apply(&mut py35, REMOVED_35, ADDED_35);

    let mut py36 = py35;
    apply(&mut py36, REMOVED_36, ADDED_36);

    let mut py37 = py36;
    apply(&mut py37, REMOVED_37, ADDED_37);

    let mut py38 = py37;
    apply(&mut py38, REMOVED_38, ADDED_38);

    [py34, py35, py36, py37, py38]
}

static DECODE: Lazy<[DecodeTable; 5]> = Lazy::new(build_tables);

static ENCODE: Lazy<[[Option<u8>; OpCode::COUNT]; 5]> = Lazy::new(|| {
    let mut out = [[None; OpCode::COUNT]; 5];
    for (vi, table) in DECODE.iter().enumerate() {
        for (byte, entry) in table.iter().enumerate() {
            if let Some(op) = entry {
                out[vi][*op as usize] = Some(byte as u8);
            }
        }
    }
    out
});

fn version_index(version: PyVersion) -> usize {
    match version {
        PyVersion::Py34 => 0,
        PyVersion::Py35 => 1,
        PyVersion::Py36 => 2,
        PyVersion::Py37 => 3,
        PyVersion::Py38 => 4,
    }
}

/// The byte → opcode decode table for a version.
pub fn decode_table(version: PyVersion) -> &'static DecodeTable {
    &DECODE[version_index(version)]
}

/// Encodes an opcode name as its byte in a version, or `None` when the
/// instruction does not exist there.
pub fn encode_op(version: PyVersion, op: OpCode) -> Option<u8> {
    ENCODE[version_index(version)][op as usize]
}

/// Upper-snake-case instruction name (`ROT_TWO`, `POP_JUMP_IF_FALSE`, …).
pub fn op_name(op: OpCode) -> &'static str {
    static NAMES: Lazy<Vec<&'static str>> = Lazy::new(|| {
        OpCode::ALL
            .iter()
            .map(|op| {
                let camel = format!("{op:?}");
                let mut name = String::with_capacity(camel.len() + 4);
                for (i, ch) in camel.chars().enumerate() {
                    if ch.is_ascii_uppercase() && i > 0 {
                        name.push('_');
                    }
                    name.push(ch.to_ascii_uppercase());
                }
                &*Box::leak(name.into_boxed_str())
            })
            .collect()
    });
    NAMES[op as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_table_spot_checks() {
        let t = decode_table(PyVersion::Py34);
        assert_eq!(t[1], Some(OpCode::PopTop));
        assert_eq!(t[100], Some(OpCode::LoadConst));
        assert_eq!(t[83], Some(OpCode::ReturnValue));
        assert_eq!(t[81], Some(OpCode::WithCleanup));
        assert_eq!(t[0], None);
    }

    #[test]
    fn test_version_evolution() {
        // WITH_CLEANUP split in 3.5.
        assert_eq!(
            decode_table(PyVersion::Py35)[81],
            Some(OpCode::WithCleanupStart)
        );
        // CALL_FUNCTION_VAR_KW replaced by CALL_FUNCTION_EX at byte 142.
        assert_eq!(
            decode_table(PyVersion::Py35)[142],
            Some(OpCode::CallFunctionVarKw)
        );
        assert_eq!(
            decode_table(PyVersion::Py36)[142],
            Some(OpCode::CallFunctionEx)
        );
        // Loop opcodes vanish in 3.8.
        assert_eq!(decode_table(PyVersion::Py37)[120], Some(OpCode::SetupLoop));
        assert_eq!(decode_table(PyVersion::Py38)[120], None);
        assert_eq!(decode_table(PyVersion::Py38)[53], Some(OpCode::BeginFinally));
    }

    #[test]
    fn test_encode_is_inverse_of_decode() {
        for version in PyVersion::ALL {
            let table = decode_table(version);
            for (byte, entry) in table.iter().enumerate() {
                if let Some(op) = entry {
                    assert_eq!(encode_op(version, *op), Some(byte as u8));
                }
            }
        }
    }

    #[test]
    fn test_have_argument_boundary() {
        for version in PyVersion::ALL {
            let table = decode_table(version);
            for (byte, entry) in table.iter().enumerate() {
                if let Some(op) = entry {
                    let has_arg = op.arg_kind() != crate::op_code::ArgKind::None;
                    assert_eq!(
                        has_arg,
                        byte as u8 >= HAVE_ARGUMENT,
                        "{op} at byte {byte} crosses the HAVE_ARGUMENT boundary"
                    );
                }
            }
        }
    }

    #[test]
    fn test_op_names() {
        assert_eq!(op_name(OpCode::GetAiter), "GET_AITER");
        assert_eq!(op_name(OpCode::BuildMapUnpackWithCall), "BUILD_MAP_UNPACK_WITH_CALL");
    }
}
