//! Stack-shuffling opcodes.

use crate::error::VmResult;
use crate::jump_table::{JumpTable, Operand};
use crate::op_code::OpCode;
use crate::vm::Vm;
use crate::why::Why;

/// Registers the stack manipulation handlers.
pub fn register_handlers(table: &mut JumpTable) {
    table.register(OpCode::PopTop, pop_top);
    table.register(OpCode::RotTwo, rot_two);
    table.register(OpCode::RotThree, rot_three);
    table.register(OpCode::RotFour, rot_four);
    table.register(OpCode::DupTop, dup_top);
    table.register(OpCode::DupTopTwo, dup_top_two);
    table.register(OpCode::Nop, nop);
}

fn pop_top(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    frame.borrow_mut().pop()?;
    Ok(None)
}

fn rot_two(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let mut frame = frame.borrow_mut();
    let values = frame.popn(2)?;
    let [a, b]: [_; 2] = values.try_into().expect("popn(2) yields two values");
    frame.push(b);
    frame.push(a);
    Ok(None)
}

fn rot_three(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let mut frame = frame.borrow_mut();
    let values = frame.popn(3)?;
    let [a, b, c]: [_; 3] = values.try_into().expect("popn(3) yields three values");
    frame.push(c);
    frame.push(a);
    frame.push(b);
    Ok(None)
}

fn rot_four(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let mut frame = frame.borrow_mut();
    let values = frame.popn(4)?;
    let [a, b, c, d]: [_; 4] = values.try_into().expect("popn(4) yields four values");
    frame.push(d);
    frame.push(a);
    frame.push(b);
    frame.push(c);
    Ok(None)
}

fn dup_top(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let mut frame = frame.borrow_mut();
    let top = frame.top()?;
    frame.push(top);
    Ok(None)
}

fn dup_top_two(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let mut frame = frame.borrow_mut();
    let b = frame.peek(0)?;
    let a = frame.peek(1)?;
    frame.push(a);
    frame.push(b);
    Ok(None)
}

fn nop(_vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    Ok(None)
}
