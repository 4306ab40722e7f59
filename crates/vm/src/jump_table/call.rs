//! Call-site and function-construction opcodes.
//!
//! The call protocol changed shape twice across the supported versions:
//! through 3.5 keyword arguments travel as name/value pairs counted in the
//! operand's high byte, from 3.6 `CALL_FUNCTION_KW` carries a name tuple,
//! and `CALL_FUNCTION_EX` replaces the `_VAR` / `_VAR_KW` forms.

use std::rc::Rc;

use crate::error::{VmError, VmResult};
use crate::jump_table::{JumpTable, Operand};
use crate::object::function::{Function, Kwargs};
use crate::object::{Cell, Value};
use crate::op_code::OpCode;
use crate::protocol;
use crate::vm::Vm;
use crate::why::Why;

/// Registers the call handlers (base versions; 3.6+ overrides are applied
/// by the table constructor).
pub fn register_handlers(table: &mut JumpTable) {
    table.register(OpCode::CallFunction, call_function);
    table.register(OpCode::CallFunctionVar, call_function_var);
    table.register(OpCode::CallFunctionKw, call_function_kw_legacy);
    table.register(OpCode::CallFunctionVarKw, call_function_var_kw);
    table.register(OpCode::CallFunctionEx, call_function_ex);
    table.register(OpCode::MakeFunction, make_function_legacy);
    table.register(OpCode::MakeClosure, make_closure);
    table.register(OpCode::LoadBuildClass, load_build_class);
    table.register(OpCode::LoadMethod, load_method);
    table.register(OpCode::CallMethod, call_method);
}

/// Pops call-site arguments laid out by the ≤3.5 protocol and performs
/// the call: `oparg = (num_kw << 8) | num_pos`, keyword arguments as flat
/// name/value pairs above the positionals.
fn legacy_call(
    vm: &mut Vm,
    oparg: u32,
    extra_args: Vec<Value>,
    extra_kwargs: Kwargs,
) -> VmResult<Option<Why>> {
    let num_kw = (oparg >> 8) as usize;
    let num_pos = (oparg & 0xFF) as usize;
    let frame = vm.frame()?;

    let (callable, mut args, mut kwargs) = {
        let mut frame = frame.borrow_mut();
        let mut kwargs = Kwargs::new();
        for _ in 0..num_kw {
            let pair = frame.popn(2)?;
            let [name, value]: [_; 2] = pair.try_into().expect("popn(2) yields two values");
            match name {
                Value::Str(name) => {
                    kwargs.insert(name, value);
                }
                other => {
                    return Err(VmError::type_error(format!(
                        "keywords must be strings, not {}",
                        other.type_name()
                    )))
                }
            }
        }
        let args = frame.popn(num_pos)?;
        let callable = frame.pop()?;
        (callable, args, kwargs)
    };

    args.extend(extra_args);
    kwargs.extend(extra_kwargs);
    let result = protocol::call_value(vm, callable, args, kwargs)?;
    frame.borrow_mut().push(result);
    Ok(None)
}

fn call_function(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    legacy_call(vm, operand.raw()?, vec![], Kwargs::new())
}

fn call_function_var(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let varargs = frame.borrow_mut().pop()?;
    let extra = protocol::collect_iterable(vm, varargs)?;
    legacy_call(vm, operand.raw()?, extra, Kwargs::new())
}

fn call_function_kw_legacy(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let mapping = frame.borrow_mut().pop()?;
    let extra = kwargs_from_mapping(&mapping)?;
    legacy_call(vm, operand.raw()?, vec![], extra)
}

fn call_function_var_kw(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let (varargs, mapping) = {
        let mut frame = frame.borrow_mut();
        let pair = frame.popn(2)?;
        let [varargs, mapping]: [_; 2] = pair.try_into().expect("popn(2) yields two values");
        (varargs, mapping)
    };
    let extra_args = protocol::collect_iterable(vm, varargs)?;
    let extra_kwargs = kwargs_from_mapping(&mapping)?;
    legacy_call(vm, operand.raw()?, extra_args, extra_kwargs)
}

/// The 3.6+ `CALL_FUNCTION_KW`: a tuple of keyword names sits on top of
/// the stack, above all argument values.
pub fn call_function_kw_names(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let total = operand.raw()? as usize;
    let frame = vm.frame()?;
    let (callable, args, kwargs) = {
        let mut frame = frame.borrow_mut();
        let names = match frame.pop()? {
            Value::Tuple(names) => names,
            other => {
                return Err(VmError::fault(format!(
                    "CALL_FUNCTION_KW expects a name tuple, got {}",
                    other.type_name()
                )))
            }
        };
        let mut values = frame.popn(total)?;
        let callable = frame.pop()?;
        let split = values.len() - names.len();
        let kw_values = values.split_off(split);
        let mut kwargs = Kwargs::new();
        for (name, value) in names.iter().zip(kw_values) {
            match name {
                Value::Str(name) => {
                    kwargs.insert(name.clone(), value);
                }
                other => {
                    return Err(VmError::type_error(format!(
                        "keywords must be strings, not {}",
                        other.type_name()
                    )))
                }
            }
        }
        (callable, values, kwargs)
    };
    let result = protocol::call_value(vm, callable, args, kwargs)?;
    frame.borrow_mut().push(result);
    Ok(None)
}

fn call_function_ex(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let flags = operand.raw()?;
    let frame = vm.frame()?;
    let (callable, varargs, mapping) = {
        let mut frame = frame.borrow_mut();
        let mapping = if flags & 0x01 != 0 {
            Some(frame.pop()?)
        } else {
            None
        };
        let varargs = frame.pop()?;
        let callable = frame.pop()?;
        (callable, varargs, mapping)
    };
    let args = protocol::collect_iterable(vm, varargs)?;
    let kwargs = match mapping {
        Some(mapping) => kwargs_from_mapping(&mapping)?,
        None => Kwargs::new(),
    };
    let result = protocol::call_value(vm, callable, args, kwargs)?;
    frame.borrow_mut().push(result);
    Ok(None)
}

fn kwargs_from_mapping(mapping: &Value) -> VmResult<Kwargs> {
    let mut kwargs = Kwargs::new();
    for (key, value) in protocol::dict_pairs(mapping)? {
        match key {
            Value::Str(name) => {
                kwargs.insert(name, value);
            }
            other => {
                return Err(VmError::type_error(format!(
                    "keywords must be strings, not {}",
                    other.type_name()
                )))
            }
        }
    }
    Ok(kwargs)
}

// ----------------------------------------------------------------------
// Function construction
// ----------------------------------------------------------------------

fn closure_cells(closure: Value) -> VmResult<Vec<Rc<Cell>>> {
    match closure {
        Value::None => Ok(vec![]),
        Value::Tuple(items) => items
            .iter()
            .map(|item| match item {
                Value::Cell(cell) => Ok(cell.clone()),
                other => Err(VmError::fault(format!(
                    "closure entries must be cells, got {}",
                    other.type_name()
                ))),
            })
            .collect(),
        other => Err(VmError::fault(format!(
            "closure must be a tuple, got {}",
            other.type_name()
        ))),
    }
}

fn finish_function(vm: &mut Vm, func: Function) -> VmResult<Option<Why>> {
    vm.frame()?
        .borrow_mut()
        .push(Value::Function(Rc::new(func)));
    Ok(None)
}

/// The ≤3.5 `MAKE_FUNCTION`: the operand packs the counts of positional
/// defaults, keyword-only defaults, and annotations.
fn make_function_legacy(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    make_legacy(vm, operand.raw()?, vec![])
}

/// The ≤3.5 `MAKE_CLOSURE`: like `MAKE_FUNCTION` with a closure tuple
/// below the code object.
fn make_closure(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let closure = {
        let mut frame = frame.borrow_mut();
        let (qualname, code) = {
            let pair = frame.popn(2)?;
            let [code, qualname]: [_; 2] = pair.try_into().expect("popn(2) yields two values");
            (qualname, code)
        };
        let closure = frame.pop()?;
        frame.push(code);
        frame.push(qualname);
        closure
    };
    make_legacy(vm, operand.raw()?, closure_cells(closure)?)
}

fn make_legacy(vm: &mut Vm, argc: u32, closure: Vec<Rc<Cell>>) -> VmResult<Option<Why>> {
    let num_posdefs = (argc & 0xFF) as usize;
    let num_kwdefs = ((argc >> 8) & 0xFF) as usize;
    let num_annos = ((argc >> 16) & 0x7FFF) as usize;

    let frame = vm.frame()?;
    let mut frame_mut = frame.borrow_mut();
    let pair = frame_mut.popn(2)?;
    let [code, qualname]: [_; 2] = pair.try_into().expect("popn(2) yields two values");
    let code = match code {
        Value::Code(code) => code,
        other => {
            return Err(VmError::fault(format!(
                "MAKE_FUNCTION expects a code object, got {}",
                other.type_name()
            )))
        }
    };
    let qualname = match qualname {
        Value::Str(name) => name,
        other => {
            return Err(VmError::fault(format!(
                "MAKE_FUNCTION expects a name string, got {}",
                other.type_name()
            )))
        }
    };

    let mut annotations = Kwargs::new();
    if num_annos > 0 {
        let names = match frame_mut.pop()? {
            Value::Tuple(names) => names,
            other => {
                return Err(VmError::fault(format!(
                    "annotation names must be a tuple, got {}",
                    other.type_name()
                )))
            }
        };
        let values = frame_mut.popn(names.len())?;
        for (name, value) in names.iter().zip(values) {
            if let Value::Str(name) = name {
                annotations.insert(name.clone(), value);
            }
        }
    }

    let mut kwdefaults = Kwargs::new();
    if num_kwdefs > 0 {
        let flat = frame_mut.popn(num_kwdefs * 2)?;
        for pair in flat.chunks_exact(2) {
            if let Value::Str(name) = &pair[0] {
                kwdefaults.insert(name.clone(), pair[1].clone());
            }
        }
    }

    let defaults = if num_posdefs > 0 {
        frame_mut.popn(num_posdefs)?
    } else {
        vec![]
    };

    let globals = frame_mut.globals.clone();
    drop(frame_mut);
    finish_function(
        vm,
        Function {
            code,
            globals,
            qualname,
            defaults,
            kwdefaults,
            closure,
            annotations,
        },
    )
}

/// The 3.6+ `MAKE_FUNCTION`: the operand is a bitmask selecting which of
/// defaults, keyword defaults, annotations, and closure were pushed.
pub fn make_function_bitmask(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let flags = operand.raw()?;
    let frame = vm.frame()?;
    let mut frame_mut = frame.borrow_mut();

    let pair = frame_mut.popn(2)?;
    let [code, qualname]: [_; 2] = pair.try_into().expect("popn(2) yields two values");
    let code = match code {
        Value::Code(code) => code,
        other => {
            return Err(VmError::fault(format!(
                "MAKE_FUNCTION expects a code object, got {}",
                other.type_name()
            )))
        }
    };
    let qualname = match qualname {
        Value::Str(name) => name,
        other => {
            return Err(VmError::fault(format!(
                "MAKE_FUNCTION expects a name string, got {}",
                other.type_name()
            )))
        }
    };

    let closure = if flags & 0x08 != 0 {
        closure_cells(frame_mut.pop()?)?
    } else {
        vec![]
    };
    let mut annotations = Kwargs::new();
    if flags & 0x04 != 0 {
        let mapping = frame_mut.pop()?;
        for (key, value) in protocol::dict_pairs(&mapping)? {
            if let Value::Str(name) = key {
                annotations.insert(name, value);
            }
        }
    }
    let mut kwdefaults = Kwargs::new();
    if flags & 0x02 != 0 {
        let mapping = frame_mut.pop()?;
        for (key, value) in protocol::dict_pairs(&mapping)? {
            if let Value::Str(name) = key {
                kwdefaults.insert(name, value);
            }
        }
    }
    let defaults = if flags & 0x01 != 0 {
        match frame_mut.pop()? {
            Value::Tuple(items) => items.as_ref().clone(),
            other => {
                return Err(VmError::fault(format!(
                    "defaults must be a tuple, got {}",
                    other.type_name()
                )))
            }
        }
    } else {
        vec![]
    };

    let globals = frame_mut.globals.clone();
    drop(frame_mut);
    finish_function(
        vm,
        Function {
            code,
            globals,
            qualname,
            defaults,
            kwdefaults,
            closure,
            annotations,
        },
    )
}

fn load_build_class(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let builder = frame
        .borrow()
        .builtins
        .borrow()
        .get("__build_class__")
        .cloned()
        .ok_or_else(|| VmError::name_error("__build_class__"))?;
    frame.borrow_mut().push(builder);
    Ok(None)
}

// ----------------------------------------------------------------------
// 3.7+ method-call protocol
// ----------------------------------------------------------------------

/// Pushes either `(method, self)` for a function found on the class, or
/// `(None, bound)` for anything already bound (or a plain attribute).
fn load_method(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let receiver = frame.borrow_mut().pop()?;
    let attr = protocol::get_attr(vm, &receiver, &name)?;
    let mut frame = frame.borrow_mut();
    match attr {
        Value::BoundMethod(method) => {
            frame.push(Value::Function(method.func.clone()));
            frame.push(method.receiver.clone());
        }
        other => {
            frame.push(Value::None);
            frame.push(other);
        }
    }
    Ok(None)
}

fn call_method(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let argc = operand.raw()? as usize;
    let frame = vm.frame()?;
    let (callable, args) = {
        let mut frame = frame.borrow_mut();
        let mut args = frame.popn(argc)?;
        let self_or_callable = frame.pop()?;
        let method_slot = frame.pop()?;
        match method_slot {
            Value::None => (self_or_callable, args),
            method => {
                args.insert(0, self_or_callable);
                (method, args)
            }
        }
    };
    let result = protocol::call_value(vm, callable, args, Kwargs::new())?;
    frame.borrow_mut().push(result);
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_cells_accepts_cells_only() {
        let cell = Rc::new(Cell::new(Some(Value::from_i64(1))));
        let ok = closure_cells(Value::tuple(vec![Value::Cell(cell)])).unwrap();
        assert_eq!(ok.len(), 1);

        assert!(closure_cells(Value::tuple(vec![Value::from_i64(1)])).is_err());
        assert!(closure_cells(Value::from_i64(1)).is_err());
    }

    #[test]
    fn test_kwargs_from_mapping_rejects_non_str_keys() {
        let mapping = protocol::dict_from_pairs(vec![(
            Value::from_i64(1),
            Value::from_i64(2),
        )])
        .unwrap();
        assert!(kwargs_from_mapping(&mapping).is_err());

        let mapping =
            protocol::dict_from_pairs(vec![(Value::from_str("a"), Value::from_i64(2))]).unwrap();
        let kwargs = kwargs_from_mapping(&mapping).unwrap();
        assert_eq!(kwargs["a"], Value::from_i64(2));
    }
}
