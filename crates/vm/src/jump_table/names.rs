//! Name resolution opcodes: namespaces, attributes, subscripts, cells.

use crate::error::{VmError, VmResult};
use crate::jump_table::{JumpTable, Operand};
use crate::object::Value;
use crate::op_code::OpCode;
use crate::protocol;
use crate::vm::Vm;
use crate::why::Why;

/// Registers the name access handlers.
pub fn register_handlers(table: &mut JumpTable) {
    table.register(OpCode::LoadConst, load_const);
    table.register(OpCode::LoadName, load_name);
    table.register(OpCode::StoreName, store_name);
    table.register(OpCode::DeleteName, delete_name);
    table.register(OpCode::LoadGlobal, load_global);
    table.register(OpCode::StoreGlobal, store_global);
    table.register(OpCode::DeleteGlobal, delete_global);
    table.register(OpCode::LoadFast, load_fast);
    table.register(OpCode::StoreFast, store_fast);
    table.register(OpCode::DeleteFast, delete_fast);
    table.register(OpCode::LoadAttr, load_attr);
    table.register(OpCode::StoreAttr, store_attr);
    table.register(OpCode::DeleteAttr, delete_attr);
    table.register(OpCode::StoreSubscr, store_subscr);
    table.register(OpCode::DeleteSubscr, delete_subscr);
    table.register(OpCode::LoadClosure, load_closure);
    table.register(OpCode::LoadDeref, load_deref);
    table.register(OpCode::StoreDeref, store_deref);
    table.register(OpCode::DeleteDeref, delete_deref);
    table.register(OpCode::LoadClassderef, load_deref);
    table.register(OpCode::ImportName, import_name);
    table.register(OpCode::ImportFrom, import_from);
    table.register(OpCode::ImportStar, import_star);
    table.register(OpCode::StoreAnnotation, store_annotation);
    table.register(OpCode::SetupAnnotations, setup_annotations);
}

fn load_const(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let value = operand.constant()?;
    vm.frame()?.borrow_mut().push(value);
    Ok(None)
}

fn load_name(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let value = {
        let frame = frame.borrow();
        let found = frame.locals.borrow().get(name.as_ref()).cloned();
        let found = found.or_else(|| frame.globals.borrow().get(name.as_ref()).cloned());
        found.or_else(|| frame.builtins.borrow().get(name.as_ref()).cloned())
    };
    match value {
        Some(v) => {
            frame.borrow_mut().push(v);
            Ok(None)
        }
        None => Err(VmError::name_error(&name)),
    }
}

fn store_name(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let value = frame.borrow_mut().pop()?;
    frame.borrow().locals.borrow_mut().insert(name, value);
    Ok(None)
}

fn delete_name(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let removed = frame.borrow().locals.borrow_mut().shift_remove(name.as_ref());
    if removed.is_none() {
        return Err(VmError::name_error(&name));
    }
    Ok(None)
}

fn load_global(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let value = {
        let frame = frame.borrow();
        let found = frame.globals.borrow().get(name.as_ref()).cloned();
        found.or_else(|| frame.builtins.borrow().get(name.as_ref()).cloned())
    };
    match value {
        Some(v) => {
            frame.borrow_mut().push(v);
            Ok(None)
        }
        None => Err(VmError::name_error(&name)),
    }
}

fn store_global(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let value = frame.borrow_mut().pop()?;
    frame.borrow().globals.borrow_mut().insert(name, value);
    Ok(None)
}

fn delete_global(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let removed = frame
        .borrow()
        .globals
        .borrow_mut()
        .shift_remove(name.as_ref());
    if removed.is_none() {
        return Err(VmError::name_error(&name));
    }
    Ok(None)
}

fn load_fast(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let value = frame.borrow().locals.borrow().get(name.as_ref()).cloned();
    match value {
        Some(v) => {
            frame.borrow_mut().push(v);
            Ok(None)
        }
        None => Err(VmError::unbound_local(&name)),
    }
}

fn store_fast(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let value = frame.borrow_mut().pop()?;
    frame.borrow().locals.borrow_mut().insert(name, value);
    Ok(None)
}

fn delete_fast(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let removed = frame.borrow().locals.borrow_mut().shift_remove(name.as_ref());
    if removed.is_none() {
        return Err(VmError::unbound_local(&name));
    }
    Ok(None)
}

fn load_attr(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let receiver = frame.borrow_mut().pop()?;
    let value = protocol::get_attr(vm, &receiver, &name)?;
    frame.borrow_mut().push(value);
    Ok(None)
}

fn store_attr(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let (value, receiver) = {
        let mut frame = frame.borrow_mut();
        let receiver = frame.pop()?;
        let value = frame.pop()?;
        (value, receiver)
    };
    protocol::set_attr(&receiver, &name, value)?;
    Ok(None)
}

fn delete_attr(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let receiver = frame.borrow_mut().pop()?;
    protocol::del_attr(&receiver, &name)?;
    Ok(None)
}

fn store_subscr(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let (value, container, index) = {
        let mut frame = frame.borrow_mut();
        let index = frame.pop()?;
        let container = frame.pop()?;
        let value = frame.pop()?;
        (value, container, index)
    };
    protocol::set_subscript(vm, &container, index, value)?;
    Ok(None)
}

fn delete_subscr(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let (container, index) = {
        let mut frame = frame.borrow_mut();
        let index = frame.pop()?;
        let container = frame.pop()?;
        (container, index)
    };
    protocol::del_subscript(vm, &container, index)?;
    Ok(None)
}

fn load_closure(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let cell = frame
        .borrow()
        .cells
        .get(name.as_ref())
        .cloned()
        .ok_or_else(|| VmError::fault(format!("no cell for '{name}'")))?;
    frame.borrow_mut().push(Value::Cell(cell));
    Ok(None)
}

fn load_deref(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let cell = frame
        .borrow()
        .cells
        .get(name.as_ref())
        .cloned()
        .ok_or_else(|| VmError::fault(format!("no cell for '{name}'")))?;
    let value = cell.get(&name)?;
    frame.borrow_mut().push(value);
    Ok(None)
}

fn store_deref(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let value = frame.borrow_mut().pop()?;
    let cell = frame
        .borrow()
        .cells
        .get(name.as_ref())
        .cloned()
        .ok_or_else(|| VmError::fault(format!("no cell for '{name}'")))?;
    cell.set(value);
    Ok(None)
}

fn delete_deref(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let cell = frame
        .borrow()
        .cells
        .get(name.as_ref())
        .cloned()
        .ok_or_else(|| VmError::fault(format!("no cell for '{name}'")))?;
    cell.delete(&name)?;
    Ok(None)
}

fn import_name(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    {
        // level and fromlist drive filesystem-relative imports, which this
        // evaluator does not perform.
        let mut frame = frame.borrow_mut();
        let _fromlist = frame.pop()?;
        let _level = frame.pop()?;
    }
    let module = vm.import_module(&name)?;
    frame.borrow_mut().push(module);
    Ok(None)
}

fn import_from(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let module = frame.borrow().top()?;
    let value = protocol::get_attr(vm, &module, &name).map_err(|_| {
        VmError::raised(
            crate::object::ExcKind::ImportError,
            format!("cannot import name '{name}'"),
        )
    })?;
    frame.borrow_mut().push(value);
    Ok(None)
}

fn import_star(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let module = frame.borrow_mut().pop()?;
    match &module {
        Value::Module(module_obj) => {
            let frame = frame.borrow();
            let mut locals = frame.locals.borrow_mut();
            for (key, value) in module_obj.dict.borrow().iter() {
                if !key.starts_with('_') {
                    locals.insert(key.clone(), value.clone());
                }
            }
            Ok(None)
        }
        other => Err(VmError::type_error(format!(
            "import * requires a module, got {}",
            other.type_name()
        ))),
    }
}

fn store_annotation(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let name = operand.name()?;
    let frame = vm.frame()?;
    let value = frame.borrow_mut().pop()?;
    let annotations = {
        let frame = frame.borrow();
        let found = frame.locals.borrow().get("__annotations__").cloned();
        found.ok_or_else(|| VmError::name_error("__annotations__"))?
    };
    protocol::set_subscript(vm, &annotations, Value::Str(name), value)?;
    Ok(None)
}

fn setup_annotations(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let frame = frame.borrow();
    let mut locals = frame.locals.borrow_mut();
    if !locals.contains_key("__annotations__") {
        locals.insert(std::rc::Rc::from("__annotations__"), Value::empty_dict());
    }
    Ok(None)
}
