//! Operator opcodes: unary, binary, in-place, comparison, slices.

use std::rc::Rc;

use crate::error::VmResult;
use crate::jump_table::{JumpTable, Operand};
use crate::object::{SliceObject, Value};
use crate::op_code::OpCode;
use crate::protocol::{self, BinaryOp, UnaryOp};
use crate::vm::Vm;
use crate::why::Why;

/// Registers the operator handlers.
pub fn register_handlers(table: &mut JumpTable) {
    table.register(OpCode::UnaryPositive, |vm, _| unary(vm, UnaryOp::Positive));
    table.register(OpCode::UnaryNegative, |vm, _| unary(vm, UnaryOp::Negative));
    table.register(OpCode::UnaryNot, |vm, _| unary(vm, UnaryOp::Not));
    table.register(OpCode::UnaryInvert, |vm, _| unary(vm, UnaryOp::Invert));

    table.register(OpCode::BinaryPower, |vm, _| binary(vm, BinaryOp::Power));
    table.register(OpCode::BinaryMultiply, |vm, _| binary(vm, BinaryOp::Multiply));
    table.register(OpCode::BinaryMatrixMultiply, |vm, _| {
        binary(vm, BinaryOp::MatrixMultiply)
    });
    table.register(OpCode::BinaryModulo, |vm, _| binary(vm, BinaryOp::Modulo));
    table.register(OpCode::BinaryAdd, |vm, _| binary(vm, BinaryOp::Add));
    table.register(OpCode::BinarySubtract, |vm, _| binary(vm, BinaryOp::Subtract));
    table.register(OpCode::BinarySubscr, |vm, _| binary(vm, BinaryOp::Subscr));
    table.register(OpCode::BinaryFloorDivide, |vm, _| {
        binary(vm, BinaryOp::FloorDivide)
    });
    table.register(OpCode::BinaryTrueDivide, |vm, _| {
        binary(vm, BinaryOp::TrueDivide)
    });
    table.register(OpCode::BinaryLshift, |vm, _| binary(vm, BinaryOp::Lshift));
    table.register(OpCode::BinaryRshift, |vm, _| binary(vm, BinaryOp::Rshift));
    table.register(OpCode::BinaryAnd, |vm, _| binary(vm, BinaryOp::And));
    table.register(OpCode::BinaryXor, |vm, _| binary(vm, BinaryOp::Xor));
    table.register(OpCode::BinaryOr, |vm, _| binary(vm, BinaryOp::Or));

    table.register(OpCode::InplacePower, |vm, _| inplace(vm, BinaryOp::Power));
    table.register(OpCode::InplaceMultiply, |vm, _| {
        inplace(vm, BinaryOp::Multiply)
    });
    table.register(OpCode::InplaceMatrixMultiply, |vm, _| {
        inplace(vm, BinaryOp::MatrixMultiply)
    });
    table.register(OpCode::InplaceModulo, |vm, _| inplace(vm, BinaryOp::Modulo));
    table.register(OpCode::InplaceAdd, |vm, _| inplace(vm, BinaryOp::Add));
    table.register(OpCode::InplaceSubtract, |vm, _| {
        inplace(vm, BinaryOp::Subtract)
    });
    table.register(OpCode::InplaceFloorDivide, |vm, _| {
        inplace(vm, BinaryOp::FloorDivide)
    });
    table.register(OpCode::InplaceTrueDivide, |vm, _| {
        inplace(vm, BinaryOp::TrueDivide)
    });
    table.register(OpCode::InplaceLshift, |vm, _| inplace(vm, BinaryOp::Lshift));
    table.register(OpCode::InplaceRshift, |vm, _| inplace(vm, BinaryOp::Rshift));
    table.register(OpCode::InplaceAnd, |vm, _| inplace(vm, BinaryOp::And));
    table.register(OpCode::InplaceXor, |vm, _| inplace(vm, BinaryOp::Xor));
    table.register(OpCode::InplaceOr, |vm, _| inplace(vm, BinaryOp::Or));

    table.register(OpCode::CompareOp, compare_op);
    table.register(OpCode::BuildSlice, build_slice);
}

fn unary(vm: &mut Vm, op: UnaryOp) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let value = frame.borrow_mut().pop()?;
    let result = protocol::unary_op(vm, op, value)?;
    frame.borrow_mut().push(result);
    Ok(None)
}

fn binary(vm: &mut Vm, op: BinaryOp) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let (lhs, rhs) = {
        let mut frame = frame.borrow_mut();
        let rhs = frame.pop()?;
        let lhs = frame.pop()?;
        (lhs, rhs)
    };
    let result = protocol::binary_op(vm, op, lhs, rhs)?;
    frame.borrow_mut().push(result);
    Ok(None)
}

fn inplace(vm: &mut Vm, op: BinaryOp) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let (lhs, rhs) = {
        let mut frame = frame.borrow_mut();
        let rhs = frame.pop()?;
        let lhs = frame.pop()?;
        (lhs, rhs)
    };

    // `list += iterable` mutates in place and leaves the same object.
    if op == BinaryOp::Add {
        if let Value::List(items) = &lhs {
            let extension = protocol::collect_iterable(vm, rhs)?;
            items.borrow_mut().extend(extension);
            frame.borrow_mut().push(lhs);
            return Ok(None);
        }
    }

    let result = protocol::binary_op(vm, op, lhs, rhs)?;
    frame.borrow_mut().push(result);
    Ok(None)
}

fn compare_op(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let opnum = operand.raw()?;
    let frame = vm.frame()?;
    let (lhs, rhs) = {
        let mut frame = frame.borrow_mut();
        let rhs = frame.pop()?;
        let lhs = frame.pop()?;
        (lhs, rhs)
    };
    let result = protocol::compare_op(vm, opnum, lhs, rhs)?;
    frame.borrow_mut().push(result);
    Ok(None)
}

fn build_slice(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let count = operand.raw()?;
    if !matches!(count, 2 | 3) {
        return Err(crate::error::VmError::fault(format!(
            "strange BUILD_SLICE count: {count}"
        )));
    }
    let frame = vm.frame()?;
    let mut frame = frame.borrow_mut();
    let mut parts = frame.popn(count as usize)?;
    let step = if count == 3 {
        parts.pop().expect("three slice parts")
    } else {
        Value::None
    };
    let stop = parts.pop().expect("slice stop");
    let start = parts.pop().expect("slice start");
    frame.push(Value::Slice(Rc::new(SliceObject::new(start, stop, step))));
    Ok(None)
}
