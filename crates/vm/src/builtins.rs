//! The builtins namespace.
//!
//! Top-level frames resolve names against this namespace after locals and
//! globals miss. It carries the callable surface guest programs need
//! (`print`, `range`, `len`, constructors, introspection helpers), the
//! builtin exception types, and `__build_class__`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{VmError, VmResult};
use crate::object::exception::{normalize_exception, ExcClass, ExcKind, ALL_KINDS};
use crate::object::function::{BuiltinFunction, Kwargs};
use crate::object::generator::{gen_close, gen_send_ex, gen_throw};
use crate::object::{
    AsyncGenASend, AsyncGenAThrow, ClassObject, Dict, Namespace, RangeObject, Set, Value,
};
use crate::protocol;
use crate::vm::Vm;

/// Builds the default builtins namespace.
pub fn make_builtins() -> Namespace {
    let mut ns = Namespace::new();

    let mut add = |name: &'static str, func: crate::object::function::NativeFn| {
        ns.insert(Rc::from(name), BuiltinFunction::new(name, func));
    };

    add("print", builtin_print);
    add("range", builtin_range);
    add("len", builtin_len);
    add("iter", builtin_iter);
    add("next", builtin_next);
    add("repr", builtin_repr);
    add("str", builtin_str);
    add("int", builtin_int);
    add("float", builtin_float);
    add("bool", builtin_bool);
    add("list", builtin_list);
    add("tuple", builtin_tuple);
    add("dict", builtin_dict);
    add("set", builtin_set);
    add("abs", builtin_abs);
    add("min", builtin_min);
    add("max", builtin_max);
    add("sum", builtin_sum);
    add("sorted", builtin_sorted);
    add("enumerate", builtin_enumerate);
    add("zip", builtin_zip);
    add("isinstance", builtin_isinstance);
    add("issubclass", builtin_issubclass);
    add("getattr", builtin_getattr);
    add("setattr", builtin_setattr);
    add("hasattr", builtin_hasattr);
    add("locals", builtin_locals);
    add("globals", builtin_globals);
    add("__build_class__", builtin_build_class);

    for kind in ALL_KINDS {
        ns.insert(
            Rc::from(kind.name()),
            Value::ExcType(ExcClass::Builtin(*kind)),
        );
    }
    ns.insert(Rc::from("None"), Value::None);
    ns.insert(Rc::from("True"), Value::Bool(true));
    ns.insert(Rc::from("False"), Value::Bool(false));
    ns.insert(Rc::from("Ellipsis"), Value::Ellipsis);
    ns.insert(Rc::from("NotImplemented"), Value::NotImplemented);
    ns
}

fn arity(args: &[Value], min: usize, max: usize, name: &str) -> VmResult<()> {
    if args.len() < min || args.len() > max {
        return Err(VmError::type_error(format!(
            "{name}() takes from {min} to {max} positional arguments but {} were given",
            args.len()
        )));
    }
    Ok(())
}

fn builtin_print(vm: &mut Vm, args: Vec<Value>, kwargs: Kwargs) -> VmResult<Value> {
    let sep = match kwargs.get("sep") {
        Some(Value::Str(s)) => s.to_string(),
        Some(Value::None) | None => " ".to_string(),
        Some(other) => {
            return Err(VmError::type_error(format!(
                "sep must be None or a string, not {}",
                other.type_name()
            )))
        }
    };
    let end = match kwargs.get("end") {
        Some(Value::Str(s)) => s.to_string(),
        Some(Value::None) | None => "\n".to_string(),
        Some(other) => {
            return Err(VmError::type_error(format!(
                "end must be None or a string, not {}",
                other.type_name()
            )))
        }
    };
    let rendered: Vec<String> = args.iter().map(Value::str).collect();
    vm.write_stdout(&format!("{}{}", rendered.join(&sep), end))?;
    Ok(Value::None)
}

fn builtin_range(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 3, "range")?;
    let range = match args.len() {
        1 => RangeObject::new(0, args[0].as_index()?, 1)?,
        2 => RangeObject::new(args[0].as_index()?, args[1].as_index()?, 1)?,
        _ => RangeObject::new(
            args[0].as_index()?,
            args[1].as_index()?,
            args[2].as_index()?,
        )?,
    };
    Ok(Value::Range(Rc::new(range)))
}

fn builtin_len(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 1, "len")?;
    let len = match &args[0] {
        Value::Str(s) => s.chars().count(),
        Value::Bytes(b) => b.len(),
        Value::Tuple(t) => t.len(),
        Value::List(l) => l.borrow().len(),
        Value::Dict(d) => d.borrow().len(),
        Value::Set(s) => s.borrow().len(),
        Value::Range(r) => r.len(),
        Value::Instance(_) => {
            let dunder = protocol::get_attr(vm, &args[0], "__len__").map_err(|_| {
                VmError::type_error(format!(
                    "object of type '{}' has no len()",
                    args[0].type_name()
                ))
            })?;
            let result = protocol::call_value(vm, dunder, vec![], Kwargs::new())?;
            return Ok(result);
        }
        other => {
            return Err(VmError::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )))
        }
    };
    Ok(Value::from_i64(len as i64))
}

fn builtin_iter(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 1, "iter")?;
    protocol::iter_value(vm, args[0].clone())
}

fn builtin_next(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 2, "next")?;
    match protocol::next_value(vm, &args[0]) {
        Ok(value) => Ok(value),
        Err(err) if err.is_kind(ExcKind::StopIteration) && args.len() == 2 => {
            Ok(args[1].clone())
        }
        Err(err) => Err(err),
    }
}

fn builtin_repr(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 1, "repr")?;
    Ok(Value::from_str(args[0].repr()))
}

fn builtin_str(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 0, 1, "str")?;
    Ok(Value::from_str(
        args.first().map(Value::str).unwrap_or_default(),
    ))
}

fn builtin_int(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 0, 2, "int")?;
    match args.first() {
        None => Ok(Value::from_i64(0)),
        Some(Value::Int(i)) => Ok(Value::Int(i.clone())),
        Some(Value::Bool(b)) => Ok(Value::from_i64(*b as i64)),
        Some(Value::Float(f)) => Ok(Value::from_i64(f.trunc() as i64)),
        Some(Value::Str(s)) => {
            let trimmed = s.trim();
            trimmed
                .parse::<num_bigint::BigInt>()
                .map(Value::from_bigint)
                .map_err(|_| {
                    VmError::value_error(format!(
                        "invalid literal for int() with base 10: {}",
                        Value::from_str(trimmed).repr()
                    ))
                })
        }
        Some(other) => Err(VmError::type_error(format!(
            "int() argument must be a string or a number, not '{}'",
            other.type_name()
        ))),
    }
}

fn builtin_float(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 0, 1, "float")?;
    match args.first() {
        None => Ok(Value::Float(0.0)),
        Some(Value::Float(f)) => Ok(Value::Float(*f)),
        Some(Value::Int(i)) => {
            use num_traits::ToPrimitive;
            Ok(Value::Float(i.to_f64().unwrap_or(f64::INFINITY)))
        }
        Some(Value::Bool(b)) => Ok(Value::Float(*b as i64 as f64)),
        Some(Value::Str(s)) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
            VmError::value_error(format!("could not convert string to float: '{s}'"))
        }),
        Some(other) => Err(VmError::type_error(format!(
            "float() argument must be a string or a number, not '{}'",
            other.type_name()
        ))),
    }
}

fn builtin_bool(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 0, 1, "bool")?;
    match args.first() {
        None => Ok(Value::Bool(false)),
        Some(v) => Ok(Value::Bool(protocol::truthy(vm, v)?)),
    }
}

fn builtin_list(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 0, 1, "list")?;
    match args.into_iter().next() {
        None => Ok(Value::list(vec![])),
        Some(v) => Ok(Value::list(protocol::collect_iterable(vm, v)?)),
    }
}

fn builtin_tuple(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 0, 1, "tuple")?;
    match args.into_iter().next() {
        None => Ok(Value::tuple(vec![])),
        Some(v) => Ok(Value::tuple(protocol::collect_iterable(vm, v)?)),
    }
}

fn builtin_dict(vm: &mut Vm, args: Vec<Value>, kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 0, 1, "dict")?;
    let mut map = Dict::new();
    if let Some(source) = args.into_iter().next() {
        for (k, v) in protocol::dict_pairs(&source).or_else(|_| {
            let items = protocol::collect_iterable(vm, source.clone())?;
            items
                .into_iter()
                .map(|pair| {
                    let pair = protocol::collect_iterable(vm, pair)?;
                    if pair.len() != 2 {
                        return Err(VmError::value_error(
                            "dictionary update sequence element is not a pair",
                        ));
                    }
                    Ok((pair[0].clone(), pair[1].clone()))
                })
                .collect::<VmResult<Vec<_>>>()
        })? {
            map.insert(k.hash_key()?, v);
        }
    }
    for (name, value) in kwargs {
        map.insert(Value::Str(name).hash_key()?, value);
    }
    Ok(Value::Dict(Rc::new(RefCell::new(map))))
}

fn builtin_set(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 0, 1, "set")?;
    let mut set = Set::new();
    if let Some(source) = args.into_iter().next() {
        for item in protocol::collect_iterable(vm, source)? {
            set.insert(item.hash_key()?, ());
        }
    }
    Ok(Value::Set(Rc::new(RefCell::new(set))))
}

fn builtin_abs(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 1, "abs")?;
    match &args[0] {
        Value::Int(i) => {
            use num_traits::Signed;
            Ok(Value::from_bigint(i.abs()))
        }
        Value::Float(f) => Ok(Value::Float(f.abs())),
        Value::Bool(b) => Ok(Value::from_i64(*b as i64)),
        other => Err(VmError::type_error(format!(
            "bad operand type for abs(): '{}'",
            other.type_name()
        ))),
    }
}

fn fold_extremum(vm: &mut Vm, args: Vec<Value>, want_max: bool, name: &str) -> VmResult<Value> {
    let items = if args.len() == 1 {
        protocol::collect_iterable(vm, args[0].clone())?
    } else {
        args
    };
    let mut items = items.into_iter();
    let mut best = items.next().ok_or_else(|| {
        VmError::value_error(format!("{name}() arg is an empty sequence"))
    })?;
    for item in items {
        let take = protocol::compare_op(
            vm,
            if want_max { 4 } else { 0 },
            item.clone(),
            best.clone(),
        )?;
        if matches!(take, Value::Bool(true)) {
            best = item;
        }
    }
    Ok(best)
}

fn builtin_min(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    fold_extremum(vm, args, false, "min")
}

fn builtin_max(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    fold_extremum(vm, args, true, "max")
}

fn builtin_sum(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 2, "sum")?;
    let mut acc = args.get(1).cloned().unwrap_or(Value::from_i64(0));
    for item in protocol::collect_iterable(vm, args[0].clone())? {
        acc = protocol::binary_op(vm, protocol::BinaryOp::Add, acc, item)?;
    }
    Ok(acc)
}

fn builtin_sorted(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 1, "sorted")?;
    let mut items = protocol::collect_iterable(vm, args[0].clone())?;
    // Insertion sort through the comparison protocol keeps the error
    // behavior of heterogeneous elements intact.
    for i in 1..items.len() {
        let mut j = i;
        while j > 0 {
            let less = protocol::compare_op(vm, 0, items[j].clone(), items[j - 1].clone())?;
            if matches!(less, Value::Bool(true)) {
                items.swap(j, j - 1);
                j -= 1;
            } else {
                break;
            }
        }
    }
    Ok(Value::list(items))
}

fn builtin_enumerate(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 2, "enumerate")?;
    let start = args.get(1).map(|v| v.as_index()).transpose()?.unwrap_or(0);
    let items = protocol::collect_iterable(vm, args[0].clone())?;
    let pairs: Vec<Value> = items
        .into_iter()
        .enumerate()
        .map(|(i, v)| Value::tuple(vec![Value::from_i64(start + i as i64), v]))
        .collect();
    protocol::iter_value(vm, Value::list(pairs))
}

fn builtin_zip(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    let columns: Vec<Vec<Value>> = args
        .into_iter()
        .map(|a| protocol::collect_iterable(vm, a))
        .collect::<VmResult<_>>()?;
    let shortest = columns.iter().map(Vec::len).min().unwrap_or(0);
    let rows: Vec<Value> = (0..shortest)
        .map(|i| Value::tuple(columns.iter().map(|c| c[i].clone()).collect()))
        .collect();
    protocol::iter_value(vm, Value::list(rows))
}

fn type_matches(value: &Value, target: &Value) -> VmResult<bool> {
    match target {
        Value::Tuple(targets) => {
            for t in targets.iter() {
                if type_matches(value, t)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::ExcType(class) => Ok(match value {
            Value::Exception(exc) => exc.matches(class),
            _ => false,
        }),
        Value::Class(class) => Ok(match value {
            Value::Instance(instance) => instance.class.derives_from(class),
            Value::Exception(exc) => exc.matches(&ExcClass::User(class.clone())),
            _ => false,
        }),
        Value::Builtin(builtin) => Ok(match builtin.name {
            "int" => matches!(value, Value::Int(_)),
            "bool" => matches!(value, Value::Bool(_)),
            "float" => matches!(value, Value::Float(_)),
            "str" => matches!(value, Value::Str(_)),
            "list" => matches!(value, Value::List(_)),
            "tuple" => matches!(value, Value::Tuple(_)),
            "dict" => matches!(value, Value::Dict(_)),
            "set" => matches!(value, Value::Set(_)),
            _ => false,
        }),
        other => Err(VmError::type_error(format!(
            "isinstance() arg 2 must be a type or tuple of types, not {}",
            other.type_name()
        ))),
    }
}

fn builtin_isinstance(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 2, "isinstance")?;
    Ok(Value::Bool(type_matches(&args[0], &args[1])?))
}

fn builtin_issubclass(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 2, "issubclass")?;
    let result = protocol::exception_match(&args[0], &args[1])?;
    Ok(Value::Bool(result))
}

fn builtin_getattr(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 3, "getattr")?;
    let name = match &args[1] {
        Value::Str(s) => s.clone(),
        other => {
            return Err(VmError::type_error(format!(
                "attribute name must be string, not '{}'",
                other.type_name()
            )))
        }
    };
    match protocol::get_attr(vm, &args[0], &name) {
        Ok(value) => Ok(value),
        Err(err) if args.len() == 3 && err.is_kind(ExcKind::AttributeError) => {
            Ok(args[2].clone())
        }
        Err(err) => Err(err),
    }
}

fn builtin_setattr(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 3, 3, "setattr")?;
    let name = match &args[1] {
        Value::Str(s) => s.clone(),
        other => {
            return Err(VmError::type_error(format!(
                "attribute name must be string, not '{}'",
                other.type_name()
            )))
        }
    };
    protocol::set_attr(&args[0], &name, args[2].clone())?;
    Ok(Value::None)
}

fn builtin_hasattr(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 2, "hasattr")?;
    let name = match &args[1] {
        Value::Str(s) => s.clone(),
        other => {
            return Err(VmError::type_error(format!(
                "attribute name must be string, not '{}'",
                other.type_name()
            )))
        }
    };
    Ok(Value::Bool(protocol::get_attr(vm, &args[0], &name).is_ok()))
}

fn builtin_locals(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 0, 0, "locals")?;
    let frame = vm
        .current_frame()
        .ok_or_else(|| VmError::fault("locals() outside any frame"))?;
    let pairs: Vec<(Value, Value)> = frame
        .borrow()
        .locals
        .borrow()
        .iter()
        .map(|(k, v)| (Value::Str(k.clone()), v.clone()))
        .collect();
    protocol::dict_from_pairs(pairs)
}

fn builtin_globals(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 0, 0, "globals")?;
    let frame = vm
        .current_frame()
        .ok_or_else(|| VmError::fault("globals() outside any frame"))?;
    let pairs: Vec<(Value, Value)> = frame
        .borrow()
        .globals
        .borrow()
        .iter()
        .map(|(k, v)| (Value::Str(k.clone()), v.clone()))
        .collect();
    protocol::dict_from_pairs(pairs)
}

fn builtin_build_class(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    if args.len() < 2 {
        return Err(VmError::type_error(
            "__build_class__: not enough arguments",
        ));
    }
    let func = match &args[0] {
        Value::Function(f) => f.clone(),
        _ => return Err(VmError::type_error("__build_class__: func must be a function")),
    };
    let name = match &args[1] {
        Value::Str(s) => s.clone(),
        _ => return Err(VmError::type_error("__build_class__: name is not a string")),
    };
    let bases = args[2..].to_vec();

    let namespace = Rc::new(RefCell::new(Namespace::new()));
    let cell = vm.run_class_body(&func, namespace.clone())?;

    let class = Rc::new(ClassObject::new(
        name,
        bases,
        namespace.borrow().clone(),
    ));
    let class_value = if crate::object::exception::ExcClass::User(class.clone())
        .builtin_kind()
        .is_some()
    {
        Value::ExcType(ExcClass::User(class))
    } else {
        Value::Class(class)
    };
    if let Value::Cell(cell) = cell {
        cell.set(class_value.clone());
    }
    Ok(class_value)
}

// ----------------------------------------------------------------------
// Builtin methods on native types
// ----------------------------------------------------------------------

/// Resolves a builtin method on a native value, bound to it.
pub fn method_for(receiver: &Value, name: &str) -> Option<Value> {
    let entry: (&'static str, crate::object::function::NativeFn) = match (receiver, name) {
        (Value::List(_), "append") => ("append", list_append),
        (Value::List(_), "extend") => ("extend", list_extend),
        (Value::List(_), "insert") => ("insert", list_insert),
        (Value::List(_), "pop") => ("pop", list_pop),
        (Value::List(_), "remove") => ("remove", list_remove),
        (Value::List(_), "clear") => ("clear", list_clear),
        (Value::List(_), "reverse") => ("reverse", list_reverse),
        (Value::List(_), "index") => ("index", seq_index),
        (Value::List(_), "count") => ("count", seq_count),
        (Value::Tuple(_), "index") => ("index", seq_index),
        (Value::Tuple(_), "count") => ("count", seq_count),
        (Value::Dict(_), "get") => ("get", dict_get),
        (Value::Dict(_), "keys") => ("keys", dict_keys),
        (Value::Dict(_), "values") => ("values", dict_values),
        (Value::Dict(_), "items") => ("items", dict_items),
        (Value::Dict(_), "update") => ("update", dict_update),
        (Value::Dict(_), "pop") => ("pop", dict_pop),
        (Value::Dict(_), "setdefault") => ("setdefault", dict_setdefault),
        (Value::Set(_), "add") => ("add", set_add),
        (Value::Set(_), "discard") => ("discard", set_discard),
        (Value::Set(_), "remove") => ("remove", set_remove),
        (Value::Str(_), "join") => ("join", str_join),
        (Value::Str(_), "upper") => ("upper", str_upper),
        (Value::Str(_), "lower") => ("lower", str_lower),
        (Value::Str(_), "strip") => ("strip", str_strip),
        (Value::Str(_), "split") => ("split", str_split),
        (Value::Str(_), "replace") => ("replace", str_replace),
        (Value::Str(_), "startswith") => ("startswith", str_startswith),
        (Value::Str(_), "endswith") => ("endswith", str_endswith),
        (Value::Generator(_), "send") => ("send", gen_method_send),
        (Value::Generator(_), "throw") => ("throw", gen_method_throw),
        (Value::Generator(_), "close") => ("close", gen_method_close),
        (Value::Generator(_), "__next__") => ("__next__", gen_method_next),
        (Value::Generator(_), "__iter__") => ("__iter__", identity_method),
        (Value::CoroutineIter(_), "send") => ("send", gen_method_send),
        (Value::CoroutineIter(_), "throw") => ("throw", gen_method_throw),
        (Value::CoroutineIter(_), "close") => ("close", gen_method_close),
        (Value::CoroutineIter(_), "__next__") => ("__next__", gen_method_next),
        (Value::CoroutineIter(_), "__iter__") => ("__iter__", identity_method),
        (Value::Coroutine(_), "send") => ("send", gen_method_send),
        (Value::Coroutine(_), "throw") => ("throw", gen_method_throw),
        (Value::Coroutine(_), "close") => ("close", gen_method_close),
        (Value::Coroutine(_), "__await__") => ("__await__", coro_method_await),
        (Value::AsyncGenerator(_), "__aiter__") => ("__aiter__", identity_method),
        (Value::AsyncGenerator(_), "__anext__") => ("__anext__", agen_method_anext),
        (Value::AsyncGenerator(_), "asend") => ("asend", agen_method_asend),
        (Value::AsyncGenerator(_), "athrow") => ("athrow", agen_method_athrow),
        (Value::AsyncGenerator(_), "aclose") => ("aclose", agen_method_aclose),
        _ => return None,
    };
    Some(BuiltinFunction::bound(entry.0, receiver.clone(), entry.1))
}

fn recv_list(args: &[Value]) -> VmResult<Rc<RefCell<Vec<Value>>>> {
    match args.first() {
        Some(Value::List(l)) => Ok(l.clone()),
        _ => Err(VmError::fault("list method without list receiver")),
    }
}

fn list_append(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 2, "append")?;
    recv_list(&args)?.borrow_mut().push(args[1].clone());
    Ok(Value::None)
}

fn list_extend(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 2, "extend")?;
    let items = protocol::collect_iterable(vm, args[1].clone())?;
    recv_list(&args)?.borrow_mut().extend(items);
    Ok(Value::None)
}

fn list_insert(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 3, 3, "insert")?;
    let list = recv_list(&args)?;
    let len = list.borrow().len() as i64;
    let index = args[1].as_index()?.clamp(-len, len);
    let index = if index < 0 { index + len } else { index } as usize;
    list.borrow_mut().insert(index, args[2].clone());
    Ok(Value::None)
}

fn list_pop(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 2, "pop")?;
    let list = recv_list(&args)?;
    let len = list.borrow().len();
    if len == 0 {
        return Err(VmError::raised(ExcKind::IndexError, "pop from empty list"));
    }
    let index = match args.get(1) {
        Some(v) => {
            let i = v.as_index()?;
            let i = if i < 0 { i + len as i64 } else { i };
            if i < 0 || i as usize >= len {
                return Err(VmError::raised(ExcKind::IndexError, "pop index out of range"));
            }
            i as usize
        }
        None => len - 1,
    };
    let removed = list.borrow_mut().remove(index);
    Ok(removed)
}

fn list_remove(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 2, "remove")?;
    let list = recv_list(&args)?;
    let pos = list.borrow().iter().position(|v| v == &args[1]);
    match pos {
        Some(i) => {
            list.borrow_mut().remove(i);
            Ok(Value::None)
        }
        None => Err(VmError::value_error("list.remove(x): x not in list")),
    }
}

fn list_clear(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 1, "clear")?;
    recv_list(&args)?.borrow_mut().clear();
    Ok(Value::None)
}

fn list_reverse(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 1, "reverse")?;
    recv_list(&args)?.borrow_mut().reverse();
    Ok(Value::None)
}

fn seq_items(value: &Value) -> VmResult<Vec<Value>> {
    match value {
        Value::List(l) => Ok(l.borrow().clone()),
        Value::Tuple(t) => Ok(t.as_ref().clone()),
        _ => Err(VmError::fault("sequence method without sequence receiver")),
    }
}

fn seq_index(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 2, "index")?;
    seq_items(&args[0])?
        .iter()
        .position(|v| v == &args[1])
        .map(|i| Value::from_i64(i as i64))
        .ok_or_else(|| VmError::value_error(format!("{} is not in sequence", args[1].repr())))
}

fn seq_count(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 2, "count")?;
    let count = seq_items(&args[0])?.iter().filter(|v| *v == &args[1]).count();
    Ok(Value::from_i64(count as i64))
}

fn recv_dict(args: &[Value]) -> VmResult<Rc<RefCell<Dict>>> {
    match args.first() {
        Some(Value::Dict(d)) => Ok(d.clone()),
        _ => Err(VmError::fault("dict method without dict receiver")),
    }
}

fn dict_get(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 3, "get")?;
    let map = recv_dict(&args)?;
    let value = map.borrow().get(&args[1].hash_key()?).cloned();
    Ok(value.unwrap_or_else(|| args.get(2).cloned().unwrap_or(Value::None)))
}

fn dict_keys(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 1, "keys")?;
    let map = recv_dict(&args)?;
    let keys: Vec<Value> = map.borrow().keys().map(|k| k.0.clone()).collect();
    Ok(Value::list(keys))
}

fn dict_values(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 1, "values")?;
    let map = recv_dict(&args)?;
    let values: Vec<Value> = map.borrow().values().cloned().collect();
    Ok(Value::list(values))
}

fn dict_items(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 1, "items")?;
    let map = recv_dict(&args)?;
    let items: Vec<Value> = map
        .borrow()
        .iter()
        .map(|(k, v)| Value::tuple(vec![k.0.clone(), v.clone()]))
        .collect();
    Ok(Value::list(items))
}

fn dict_update(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 2, "update")?;
    let map = recv_dict(&args)?;
    let _ = vm;
    for (k, v) in protocol::dict_pairs(&args[1])? {
        map.borrow_mut().insert(k.hash_key()?, v);
    }
    Ok(Value::None)
}

fn dict_pop(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 3, "pop")?;
    let map = recv_dict(&args)?;
    let removed = map.borrow_mut().shift_remove(&args[1].hash_key()?);
    match removed {
        Some(v) => Ok(v),
        None => args
            .get(2)
            .cloned()
            .ok_or_else(|| VmError::key_error(args[1].clone())),
    }
}

fn dict_setdefault(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 3, "setdefault")?;
    let map = recv_dict(&args)?;
    let key = args[1].hash_key()?;
    let default = args.get(2).cloned().unwrap_or(Value::None);
    let value = map.borrow_mut().entry(key).or_insert(default).clone();
    Ok(value)
}

fn recv_set(args: &[Value]) -> VmResult<Rc<RefCell<Set>>> {
    match args.first() {
        Some(Value::Set(s)) => Ok(s.clone()),
        _ => Err(VmError::fault("set method without set receiver")),
    }
}

fn set_add(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 2, "add")?;
    recv_set(&args)?.borrow_mut().insert(args[1].hash_key()?, ());
    Ok(Value::None)
}

fn set_discard(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 2, "discard")?;
    recv_set(&args)?.borrow_mut().shift_remove(&args[1].hash_key()?);
    Ok(Value::None)
}

fn set_remove(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 2, "remove")?;
    let removed = recv_set(&args)?
        .borrow_mut()
        .shift_remove(&args[1].hash_key()?);
    match removed {
        Some(()) => Ok(Value::None),
        None => Err(VmError::key_error(args[1].clone())),
    }
}

fn recv_str(args: &[Value]) -> VmResult<Rc<str>> {
    match args.first() {
        Some(Value::Str(s)) => Ok(s.clone()),
        _ => Err(VmError::fault("str method without str receiver")),
    }
}

fn str_join(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 2, "join")?;
    let sep = recv_str(&args)?;
    let items = protocol::collect_iterable(vm, args[1].clone())?;
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Str(s) => parts.push(s.to_string()),
            other => {
                return Err(VmError::type_error(format!(
                    "sequence item: expected str instance, {} found",
                    other.type_name()
                )))
            }
        }
    }
    Ok(Value::from_str(parts.join(sep.as_ref())))
}

fn str_upper(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 1, "upper")?;
    Ok(Value::from_str(recv_str(&args)?.to_uppercase()))
}

fn str_lower(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 1, "lower")?;
    Ok(Value::from_str(recv_str(&args)?.to_lowercase()))
}

fn str_strip(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 2, "strip")?;
    let s = recv_str(&args)?;
    match args.get(1) {
        None | Some(Value::None) => Ok(Value::from_str(s.trim())),
        Some(Value::Str(chars)) => {
            let set: Vec<char> = chars.chars().collect();
            Ok(Value::from_str(s.trim_matches(|c| set.contains(&c))))
        }
        Some(other) => Err(VmError::type_error(format!(
            "strip arg must be None or str, not {}",
            other.type_name()
        ))),
    }
}

fn str_split(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 2, "split")?;
    let s = recv_str(&args)?;
    let parts: Vec<Value> = match args.get(1) {
        None | Some(Value::None) => s.split_whitespace().map(Value::from_str).collect(),
        Some(Value::Str(sep)) => s.split(sep.as_ref()).map(Value::from_str).collect(),
        Some(other) => {
            return Err(VmError::type_error(format!(
                "must be str or None, not {}",
                other.type_name()
            )))
        }
    };
    Ok(Value::list(parts))
}

fn str_replace(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 3, 3, "replace")?;
    let s = recv_str(&args)?;
    match (&args[1], &args[2]) {
        (Value::Str(from), Value::Str(to)) => {
            Ok(Value::from_str(s.replace(from.as_ref(), to.as_ref())))
        }
        _ => Err(VmError::type_error("replace arguments must be str")),
    }
}

fn str_startswith(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 2, "startswith")?;
    let s = recv_str(&args)?;
    match &args[1] {
        Value::Str(prefix) => Ok(Value::Bool(s.starts_with(prefix.as_ref()))),
        _ => Err(VmError::type_error("startswith argument must be str")),
    }
}

fn str_endswith(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 2, "endswith")?;
    let s = recv_str(&args)?;
    match &args[1] {
        Value::Str(suffix) => Ok(Value::Bool(s.ends_with(suffix.as_ref()))),
        _ => Err(VmError::type_error("endswith argument must be str")),
    }
}

// ----------------------------------------------------------------------
// Generator / coroutine / async-generator method surface
// ----------------------------------------------------------------------

fn recv_gen(args: &[Value]) -> VmResult<crate::object::GenRef> {
    match args.first() {
        Some(Value::Generator(g)) | Some(Value::Coroutine(g)) | Some(Value::CoroutineIter(g))
        | Some(Value::AsyncGenerator(g)) => Ok(g.clone()),
        _ => Err(VmError::fault("generator method without generator receiver")),
    }
}

fn identity_method(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 1, "__iter__")?;
    Ok(args[0].clone())
}

fn gen_method_send(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 2, "send")?;
    gen_send_ex(vm, &recv_gen(&args)?, args[1].clone(), None)
}

fn gen_method_throw(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 4, "throw")?;
    let exc = normalize_exception(args[1].clone(), args.get(2).cloned())?;
    gen_throw(vm, &recv_gen(&args)?, exc)
}

fn gen_method_close(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 1, "close")?;
    gen_close(vm, &recv_gen(&args)?)?;
    Ok(Value::None)
}

fn gen_method_next(vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 1, "__next__")?;
    gen_send_ex(vm, &recv_gen(&args)?, Value::None, None)
}

fn coro_method_await(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 1, "__await__")?;
    Ok(Value::CoroutineIter(recv_gen(&args)?))
}

fn agen_method_anext(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 1, "__anext__")?;
    Ok(Value::AsyncGenASend(AsyncGenASend::new(
        recv_gen(&args)?,
        Value::None,
    )))
}

fn agen_method_asend(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 2, "asend")?;
    Ok(Value::AsyncGenASend(AsyncGenASend::new(
        recv_gen(&args)?,
        args[1].clone(),
    )))
}

fn agen_method_athrow(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 2, 4, "athrow")?;
    let exc = normalize_exception(args[1].clone(), args.get(2).cloned())?;
    Ok(Value::AsyncGenAThrow(AsyncGenAThrow::new(
        recv_gen(&args)?,
        Some(exc),
    )))
}

fn agen_method_aclose(_vm: &mut Vm, args: Vec<Value>, _kwargs: Kwargs) -> VmResult<Value> {
    arity(&args, 1, 1, "aclose")?;
    Ok(Value::AsyncGenAThrow(AsyncGenAThrow::new(
        recv_gen(&args)?,
        None,
    )))
}
