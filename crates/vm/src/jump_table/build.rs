//! Container construction and unpacking opcodes.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{VmError, VmResult};
use crate::jump_table::{JumpTable, Operand};
use crate::object::{Dict, Set, Value};
use crate::op_code::OpCode;
use crate::protocol::{self, FormatConversion};
use crate::version::PyVersion;
use crate::vm::Vm;
use crate::why::Why;

/// Registers the container handlers.
pub fn register_handlers(table: &mut JumpTable) {
    table.register(OpCode::BuildTuple, build_tuple);
    table.register(OpCode::BuildList, build_list);
    table.register(OpCode::BuildSet, build_set);
    table.register(OpCode::BuildMap, build_map);
    table.register(OpCode::BuildConstKeyMap, build_const_key_map);
    table.register(OpCode::BuildString, build_string);
    table.register(OpCode::StoreMap, store_map);
    table.register(OpCode::UnpackSequence, unpack_sequence);
    table.register(OpCode::UnpackEx, unpack_ex);
    table.register(OpCode::BuildTupleUnpack, |vm, operand| {
        build_unpack(vm, operand, UnpackKind::Tuple)
    });
    table.register(OpCode::BuildTupleUnpackWithCall, |vm, operand| {
        build_unpack(vm, operand, UnpackKind::Tuple)
    });
    table.register(OpCode::BuildListUnpack, |vm, operand| {
        build_unpack(vm, operand, UnpackKind::List)
    });
    table.register(OpCode::BuildSetUnpack, |vm, operand| {
        build_unpack(vm, operand, UnpackKind::Set)
    });
    table.register(OpCode::BuildMapUnpack, build_map_unpack);
    table.register(OpCode::BuildMapUnpackWithCall, build_map_unpack_with_call);
    table.register(OpCode::ListAppend, list_append);
    table.register(OpCode::SetAdd, set_add);
    table.register(OpCode::MapAdd, map_add);
    table.register(OpCode::FormatValue, format_value);
}

fn build_tuple(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let count = operand.raw()? as usize;
    let frame = vm.frame()?;
    let items = frame.borrow_mut().popn(count)?;
    frame.borrow_mut().push(Value::tuple(items));
    Ok(None)
}

fn build_list(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let count = operand.raw()? as usize;
    let frame = vm.frame()?;
    let items = frame.borrow_mut().popn(count)?;
    frame.borrow_mut().push(Value::list(items));
    Ok(None)
}

fn build_set(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let count = operand.raw()? as usize;
    let frame = vm.frame()?;
    let items = frame.borrow_mut().popn(count)?;
    let mut set = Set::new();
    for item in items {
        set.insert(item.hash_key()?, ());
    }
    frame.borrow_mut().push(Value::Set(Rc::new(RefCell::new(set))));
    Ok(None)
}

fn build_map(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let size = operand.raw()? as usize;
    let frame = vm.frame()?;

    // Before 3.5 the operand is only a size hint; the map is populated by
    // STORE_MAP instructions that follow.
    if vm.version() < PyVersion::Py35 {
        frame.borrow_mut().push(Value::empty_dict());
        return Ok(None);
    }

    let items = frame.borrow_mut().popn(size * 2)?;
    let mut map = Dict::new();
    for pair in items.chunks_exact(2) {
        map.insert(pair[0].hash_key()?, pair[1].clone());
    }
    frame.borrow_mut().push(Value::Dict(Rc::new(RefCell::new(map))));
    Ok(None)
}

fn build_const_key_map(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let count = operand.raw()? as usize;
    let frame = vm.frame()?;
    let (keys, values) = {
        let mut frame = frame.borrow_mut();
        let keys = frame.pop()?;
        let values = frame.popn(count)?;
        (keys, values)
    };
    let keys = match keys {
        Value::Tuple(keys) => keys,
        other => {
            return Err(VmError::fault(format!(
                "BUILD_CONST_KEY_MAP expects a key tuple, got {}",
                other.type_name()
            )))
        }
    };
    if keys.len() != count {
        return Err(VmError::fault("BUILD_CONST_KEY_MAP key count mismatch"));
    }
    let mut map = Dict::new();
    for (key, value) in keys.iter().zip(values) {
        map.insert(key.hash_key()?, value);
    }
    frame.borrow_mut().push(Value::Dict(Rc::new(RefCell::new(map))));
    Ok(None)
}

fn build_string(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let count = operand.raw()? as usize;
    let frame = vm.frame()?;
    let parts = frame.borrow_mut().popn(count)?;
    let mut out = String::new();
    for part in parts {
        match part {
            Value::Str(s) => out.push_str(&s),
            other => {
                return Err(VmError::fault(format!(
                    "BUILD_STRING expects str parts, got {}",
                    other.type_name()
                )))
            }
        }
    }
    frame.borrow_mut().push(Value::from_str(out));
    Ok(None)
}

fn store_map(vm: &mut Vm, _operand: Operand) -> VmResult<Option<Why>> {
    let frame = vm.frame()?;
    let mut frame = frame.borrow_mut();
    let key = frame.pop()?;
    let value = frame.pop()?;
    let map = frame.top()?;
    match map {
        Value::Dict(map) => {
            map.borrow_mut().insert(key.hash_key()?, value);
            Ok(None)
        }
        other => Err(VmError::fault(format!(
            "STORE_MAP on {}",
            other.type_name()
        ))),
    }
}

fn unpack_sequence(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let count = operand.raw()? as usize;
    let frame = vm.frame()?;
    let value = frame.borrow_mut().pop()?;
    let items = protocol::collect_iterable(vm, value)?;
    if items.len() > count {
        return Err(VmError::value_error(format!(
            "too many values to unpack (expected {count})"
        )));
    }
    if items.len() < count {
        return Err(VmError::value_error(format!(
            "not enough values to unpack (expected {count}, got {})",
            items.len()
        )));
    }
    let mut frame = frame.borrow_mut();
    for item in items.into_iter().rev() {
        frame.push(item);
    }
    Ok(None)
}

fn unpack_ex(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let oparg = operand.raw()?;
    let before_count = (oparg & 0xFF) as usize;
    let after_count = (oparg >> 8) as usize;
    let frame = vm.frame()?;
    let value = frame.borrow_mut().pop()?;
    let items = protocol::collect_iterable(vm, value)?;

    if before_count + after_count > items.len() {
        return Err(VmError::value_error(format!(
            "not enough values to unpack (expected at least {}, got {})",
            before_count + after_count,
            items.len()
        )));
    }

    let before = &items[..before_count];
    let middle = &items[before_count..items.len() - after_count];
    let after = &items[items.len() - after_count..];

    let mut frame = frame.borrow_mut();
    for item in after.iter().rev() {
        frame.push(item.clone());
    }
    frame.push(Value::list(middle.to_vec()));
    for item in before.iter().rev() {
        frame.push(item.clone());
    }
    Ok(None)
}

enum UnpackKind {
    Tuple,
    List,
    Set,
}

fn build_unpack(vm: &mut Vm, operand: Operand, kind: UnpackKind) -> VmResult<Option<Why>> {
    let count = operand.raw()? as usize;
    let frame = vm.frame()?;
    let sources = frame.borrow_mut().popn(count)?;
    let mut items = Vec::new();
    for source in sources {
        items.extend(protocol::collect_iterable(vm, source)?);
    }
    let result = match kind {
        UnpackKind::Tuple => Value::tuple(items),
        UnpackKind::List => Value::list(items),
        UnpackKind::Set => {
            let mut set = Set::new();
            for item in items {
                set.insert(item.hash_key()?, ());
            }
            Value::Set(Rc::new(RefCell::new(set)))
        }
    };
    frame.borrow_mut().push(result);
    Ok(None)
}

fn build_map_unpack(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let count = operand.raw()? as usize;
    let frame = vm.frame()?;
    let sources = frame.borrow_mut().popn(count)?;
    let mut map = Dict::new();
    for source in sources {
        for (k, v) in protocol::dict_pairs(&source)? {
            map.insert(k.hash_key()?, v);
        }
    }
    frame.borrow_mut().push(Value::Dict(Rc::new(RefCell::new(map))));
    Ok(None)
}

fn build_map_unpack_with_call(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let oparg = operand.raw()?;
    let num_maps = (oparg & 0xFF) as usize;
    let frame = vm.frame()?;
    let sources = frame.borrow_mut().popn(num_maps)?;
    let mut map = Dict::new();
    for source in sources {
        let pairs = protocol::dict_pairs(&source).map_err(|_| {
            VmError::type_error(format!(
                "argument after ** must be a mapping, not {}",
                source.type_name()
            ))
        })?;
        for (k, v) in pairs {
            map.insert(k.hash_key()?, v);
        }
    }
    frame.borrow_mut().push(Value::Dict(Rc::new(RefCell::new(map))));
    Ok(None)
}

fn container_depth(operand: &Operand) -> VmResult<usize> {
    match operand.raw()? as usize {
        0 => Err(VmError::fault("comprehension opcode with zero depth")),
        depth => Ok(depth),
    }
}

fn list_append(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let depth = container_depth(&operand)?;
    let frame = vm.frame()?;
    let mut frame = frame.borrow_mut();
    let value = frame.pop()?;
    match frame.peek(depth - 1)? {
        Value::List(list) => {
            list.borrow_mut().push(value);
            Ok(None)
        }
        other => Err(VmError::fault(format!(
            "LIST_APPEND on {}",
            other.type_name()
        ))),
    }
}

fn set_add(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let depth = container_depth(&operand)?;
    let frame = vm.frame()?;
    let mut frame = frame.borrow_mut();
    let value = frame.pop()?;
    match frame.peek(depth - 1)? {
        Value::Set(set) => {
            set.borrow_mut().insert(value.hash_key()?, ());
            Ok(None)
        }
        other => Err(VmError::fault(format!("SET_ADD on {}", other.type_name()))),
    }
}

fn map_add(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let depth = container_depth(&operand)?;
    let frame = vm.frame()?;
    let mut frame = frame.borrow_mut();
    // The key/value stack order flipped in 3.8.
    let (key, value) = if vm.version() >= PyVersion::Py38 {
        let value = frame.pop()?;
        let key = frame.pop()?;
        (key, value)
    } else {
        let key = frame.pop()?;
        let value = frame.pop()?;
        (key, value)
    };
    match frame.peek(depth - 1)? {
        Value::Dict(map) => {
            map.borrow_mut().insert(key.hash_key()?, value);
            Ok(None)
        }
        other => Err(VmError::fault(format!("MAP_ADD on {}", other.type_name()))),
    }
}

fn format_value(vm: &mut Vm, operand: Operand) -> VmResult<Option<Why>> {
    let flags = operand.raw()?;
    let frame = vm.frame()?;
    let (value, spec) = {
        let mut frame = frame.borrow_mut();
        let spec = if flags & 0x04 != 0 {
            match frame.pop()? {
                Value::Str(s) => Some(s),
                other => {
                    return Err(VmError::fault(format!(
                        "FORMAT_VALUE spec must be str, got {}",
                        other.type_name()
                    )))
                }
            }
        } else {
            None
        };
        (frame.pop()?, spec)
    };
    let conversion = match flags & 0x03 {
        0 => FormatConversion::None,
        1 => FormatConversion::Str,
        2 => FormatConversion::Repr,
        3 => FormatConversion::Ascii,
        _ => unreachable!("masked to two bits"),
    };
    let result = protocol::format_value(&value, conversion, spec.as_deref())?;
    frame.borrow_mut().push(result);
    Ok(None)
}
