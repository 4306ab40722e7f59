//! Cross-cutting object protocol.
//!
//! Opcode handlers funnel through this layer for everything that depends
//! on the operand's runtime type: calling, truthiness, attribute access,
//! operators, subscripts, iteration, and value formatting. Builtin types
//! take native fast paths; instances fall back to their dunder methods,
//! which re-enter the evaluator.

use std::cell::RefCell;
use std::rc::Rc;

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::error::{VmError, VmResult};
use crate::object::exception::{ExcClass, ExcKind, ExceptionValue};
use crate::object::function::Kwargs;
use crate::object::generator::gen_send_ex;
use crate::object::{
    format_float, BoundMethod, Dict, HashKey, InstanceObject, IterObject, Value,
};
use crate::vm::Vm;

/// Binary operators, in the order the `BINARY_*` / `INPLACE_*` opcode
/// families name them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    MatrixMultiply,
    TrueDivide,
    FloorDivide,
    Modulo,
    Power,
    Lshift,
    Rshift,
    And,
    Xor,
    Or,
    Subscr,
}

impl BinaryOp {
    fn dunder(self) -> &'static str {
        match self {
            BinaryOp::Add => "__add__",
            BinaryOp::Subtract => "__sub__",
            BinaryOp::Multiply => "__mul__",
            BinaryOp::MatrixMultiply => "__matmul__",
            BinaryOp::TrueDivide => "__truediv__",
            BinaryOp::FloorDivide => "__floordiv__",
            BinaryOp::Modulo => "__mod__",
            BinaryOp::Power => "__pow__",
            BinaryOp::Lshift => "__lshift__",
            BinaryOp::Rshift => "__rshift__",
            BinaryOp::And => "__and__",
            BinaryOp::Xor => "__xor__",
            BinaryOp::Or => "__or__",
            BinaryOp::Subscr => "__getitem__",
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::MatrixMultiply => "@",
            BinaryOp::TrueDivide => "/",
            BinaryOp::FloorDivide => "//",
            BinaryOp::Modulo => "%",
            BinaryOp::Power => "**",
            BinaryOp::Lshift => "<<",
            BinaryOp::Rshift => ">>",
            BinaryOp::And => "&",
            BinaryOp::Xor => "^",
            BinaryOp::Or => "|",
            BinaryOp::Subscr => "[]",
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Positive,
    Negative,
    Not,
    Invert,
}

// ----------------------------------------------------------------------
// Truthiness
// ----------------------------------------------------------------------

/// Guest truthiness, dispatching to `__bool__` / `__len__` on instances.
pub fn truthy(vm: &mut Vm, value: &Value) -> VmResult<bool> {
    if let Some(b) = value.native_truthy() {
        return Ok(b);
    }
    if let Ok(dunder) = get_attr(vm, value, "__bool__") {
        let result = call_value(vm, dunder, vec![], Kwargs::new())?;
        return match result {
            Value::Bool(b) => Ok(b),
            other => Err(VmError::type_error(format!(
                "__bool__ should return bool, returned {}",
                other.type_name()
            ))),
        };
    }
    if let Ok(dunder) = get_attr(vm, value, "__len__") {
        let result = call_value(vm, dunder, vec![], Kwargs::new())?;
        return Ok(result.as_index()? != 0);
    }
    Ok(true)
}

// ----------------------------------------------------------------------
// Calling
// ----------------------------------------------------------------------

/// Calls any callable value.
pub fn call_value(
    vm: &mut Vm,
    callable: Value,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> VmResult<Value> {
    match callable {
        Value::Function(func) => vm.call_function(&func, args, kwargs),
        Value::Builtin(builtin) => {
            let mut full_args = args;
            if let Some(receiver) = &builtin.receiver {
                full_args.insert(0, receiver.clone());
            }
            (builtin.func)(vm, full_args, kwargs)
        }
        Value::BoundMethod(method) => {
            let mut full_args = args;
            full_args.insert(0, method.receiver.clone());
            vm.call_function(&method.func, full_args, kwargs)
        }
        Value::Class(class) => instantiate(vm, class, args, kwargs),
        Value::ExcType(ExcClass::Builtin(kind)) => {
            Ok(Value::Exception(Rc::new(ExceptionValue::new(kind, args))))
        }
        Value::ExcType(ExcClass::User(class)) => Ok(Value::Exception(Rc::new(
            ExceptionValue::of_class(ExcClass::User(class), args),
        ))),
        Value::Instance(_) => {
            let call = get_attr(vm, &callable, "__call__").map_err(|_| {
                VmError::type_error(format!(
                    "'{}' object is not callable",
                    callable.type_name()
                ))
            })?;
            call_value(vm, call, args, kwargs)
        }
        other => Err(VmError::type_error(format!(
            "'{}' object is not callable",
            other.type_name()
        ))),
    }
}

fn instantiate(
    vm: &mut Vm,
    class: Rc<crate::object::ClassObject>,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> VmResult<Value> {
    // Classes reaching into the exception lattice construct exception
    // values so `raise` / `except` can treat them uniformly.
    if class_is_exception(&class) {
        return Ok(Value::Exception(Rc::new(ExceptionValue::of_class(
            ExcClass::User(class),
            args,
        ))));
    }

    let instance = Value::Instance(Rc::new(InstanceObject::new(class.clone())));
    if let Some(init) = class.lookup("__init__") {
        let mut init_args = args;
        init_args.insert(0, instance.clone());
        let result = call_value(vm, init, init_args, kwargs)?;
        if !matches!(result, Value::None) {
            return Err(VmError::type_error(format!(
                "__init__() should return None, not '{}'",
                result.type_name()
            )));
        }
    } else if !args.is_empty() || !kwargs.is_empty() {
        return Err(VmError::type_error(format!(
            "{}() takes no arguments",
            class.name
        )));
    }
    Ok(instance)
}

fn class_is_exception(class: &Rc<crate::object::ClassObject>) -> bool {
    ExcClass::User(class.clone()).builtin_kind().is_some()
}

// ----------------------------------------------------------------------
// Attribute access
// ----------------------------------------------------------------------

/// Reads an attribute.
pub fn get_attr(vm: &mut Vm, value: &Value, name: &str) -> VmResult<Value> {
    match value {
        Value::Instance(instance) => {
            if let Some(v) = instance.attrs.borrow().get(name).cloned() {
                return Ok(v);
            }
            if let Some(v) = instance.class.lookup(name) {
                return Ok(bind_attr(v, value));
            }
            if let Some(getattr) = instance.class.lookup("__getattr__") {
                let bound = bind_attr(getattr, value);
                return call_value(vm, bound, vec![Value::from_str(name)], Kwargs::new());
            }
            Err(attr_missing(value, name))
        }
        Value::Class(class) => class
            .lookup(name)
            .ok_or_else(|| attr_missing(value, name)),
        Value::Module(module) => module
            .get(name)
            .ok_or_else(|| attr_missing(value, name)),
        Value::Exception(exc) => match name {
            "args" => Ok(Value::tuple(exc.args().to_vec())),
            "value" if exc.derives_from(ExcKind::StopIteration) => Ok(exc.stop_value()),
            "__cause__" => Ok(exc
                .cause()
                .map(Value::Exception)
                .unwrap_or(Value::None)),
            "__context__" => Ok(exc
                .context()
                .map(Value::Exception)
                .unwrap_or(Value::None)),
            _ => crate::builtins::method_for(value, name)
                .ok_or_else(|| attr_missing(value, name)),
        },
        _ => {
            let _ = vm;
            crate::builtins::method_for(value, name).ok_or_else(|| attr_missing(value, name))
        }
    }
}

fn bind_attr(attr: Value, receiver: &Value) -> Value {
    match attr {
        Value::Function(func) => Value::BoundMethod(Rc::new(BoundMethod {
            receiver: receiver.clone(),
            func,
        })),
        other => other,
    }
}

fn attr_missing(value: &Value, name: &str) -> VmError {
    VmError::attribute_error(format!(
        "'{}' object has no attribute '{}'",
        value.type_name(),
        name
    ))
}

/// Writes an attribute.
pub fn set_attr(value: &Value, name: &str, new: Value) -> VmResult<()> {
    match value {
        Value::Instance(instance) => {
            instance.attrs.borrow_mut().insert(Rc::from(name), new);
            Ok(())
        }
        Value::Class(class) => {
            class.dict.borrow_mut().insert(Rc::from(name), new);
            Ok(())
        }
        Value::Module(module) => {
            module.dict.borrow_mut().insert(Rc::from(name), new);
            Ok(())
        }
        _ => Err(VmError::attribute_error(format!(
            "'{}' object has no settable attributes",
            value.type_name()
        ))),
    }
}

/// Deletes an attribute.
pub fn del_attr(value: &Value, name: &str) -> VmResult<()> {
    match value {
        Value::Instance(instance) => instance
            .attrs
            .borrow_mut()
            .shift_remove(name)
            .map(|_| ())
            .ok_or_else(|| attr_missing(value, name)),
        Value::Class(class) => class
            .dict
            .borrow_mut()
            .shift_remove(name)
            .map(|_| ())
            .ok_or_else(|| attr_missing(value, name)),
        _ => Err(VmError::attribute_error(format!(
            "'{}' object has no deletable attributes",
            value.type_name()
        ))),
    }
}

// ----------------------------------------------------------------------
// Iteration
// ----------------------------------------------------------------------

/// `iter()`: wraps a value in the iterator protocol.
pub fn iter_value(vm: &mut Vm, value: Value) -> VmResult<Value> {
    match &value {
        Value::Iterator(_)
        | Value::Generator(_)
        | Value::CoroutineIter(_)
        | Value::AsyncGenASend(_)
        | Value::AsyncGenAThrow(_) => Ok(value.clone()),
        Value::List(list) => Ok(Value::Iterator(Rc::new(RefCell::new(IterObject::List {
            list: list.clone(),
            index: 0,
        })))),
        Value::Tuple(items) => Ok(seq_iter(items.as_ref().clone())),
        Value::Str(s) => Ok(seq_iter(
            s.chars().map(|c| Value::from_str(c.to_string())).collect(),
        )),
        Value::Bytes(b) => Ok(seq_iter(
            b.iter().map(|&x| Value::from_i64(x as i64)).collect(),
        )),
        Value::Dict(map) => Ok(seq_iter(
            map.borrow().keys().map(|k| k.0.clone()).collect(),
        )),
        Value::Set(set) => Ok(seq_iter(
            set.borrow().keys().map(|k| k.0.clone()).collect(),
        )),
        Value::Range(range) => Ok(Value::Iterator(Rc::new(RefCell::new(IterObject::Range {
            range: range.clone(),
            index: 0,
        })))),
        Value::Instance(_) => {
            let dunder = get_attr(vm, &value, "__iter__").map_err(|_| {
                VmError::type_error(format!(
                    "'{}' object is not iterable",
                    value.type_name()
                ))
            })?;
            call_value(vm, dunder, vec![], Kwargs::new())
        }
        other => Err(VmError::type_error(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

fn seq_iter(items: Vec<Value>) -> Value {
    Value::Iterator(Rc::new(RefCell::new(IterObject::Seq { items, index: 0 })))
}

/// `next()`: advances an iterator; exhaustion surfaces as StopIteration.
pub fn next_value(vm: &mut Vm, iterator: &Value) -> VmResult<Value> {
    match iterator {
        Value::Iterator(it) => it
            .borrow_mut()
            .next()
            .ok_or_else(|| VmError::stop_iteration(None)),
        Value::Generator(gen) | Value::CoroutineIter(gen) => {
            gen_send_ex(vm, gen, Value::None, None)
        }
        Value::AsyncGenASend(asend) => {
            crate::object::async_generator::asend_send(vm, asend, Value::None)
        }
        Value::AsyncGenAThrow(athrow) => {
            crate::object::async_generator::athrow_send(vm, athrow, Value::None)
        }
        Value::Instance(_) => {
            let dunder = get_attr(vm, iterator, "__next__").map_err(|_| {
                VmError::type_error(format!(
                    "'{}' object is not an iterator",
                    iterator.type_name()
                ))
            })?;
            call_value(vm, dunder, vec![], Kwargs::new())
        }
        other => Err(VmError::type_error(format!(
            "'{}' object is not an iterator",
            other.type_name()
        ))),
    }
}

// ----------------------------------------------------------------------
// Operators
// ----------------------------------------------------------------------

/// Applies a unary operator.
pub fn unary_op(vm: &mut Vm, op: UnaryOp, value: Value) -> VmResult<Value> {
    match (op, &value) {
        (UnaryOp::Not, _) => Ok(Value::Bool(!truthy(vm, &value)?)),
        (UnaryOp::Positive, Value::Int(_) | Value::Float(_)) => Ok(value.clone()),
        (UnaryOp::Positive, Value::Bool(b)) => Ok(Value::from_i64(*b as i64)),
        (UnaryOp::Negative, Value::Int(i)) => Ok(Value::from_bigint(-i.as_ref().clone())),
        (UnaryOp::Negative, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Negative, Value::Bool(b)) => Ok(Value::from_i64(-(*b as i64))),
        (UnaryOp::Invert, Value::Int(i)) => Ok(Value::from_bigint(!i.as_ref().clone())),
        (UnaryOp::Invert, Value::Bool(b)) => Ok(Value::from_i64(!(*b as i64))),
        (op, Value::Instance(_)) => {
            let name = match op {
                UnaryOp::Positive => "__pos__",
                UnaryOp::Negative => "__neg__",
                UnaryOp::Invert => "__invert__",
                UnaryOp::Not => unreachable!("handled above"),
            };
            let dunder = get_attr(vm, &value, name)?;
            call_value(vm, dunder, vec![], Kwargs::new())
        }
        (op, other) => Err(VmError::type_error(format!(
            "bad operand type for unary {:?}: '{}'",
            op,
            other.type_name()
        ))),
    }
}

/// Applies a binary operator. In-place variants share this path: for
/// builtin types in-place semantics coincide with the binary result
/// except for lists, which the caller special-cases.
pub fn binary_op(vm: &mut Vm, op: BinaryOp, lhs: Value, rhs: Value) -> VmResult<Value> {
    if op == BinaryOp::Subscr {
        return get_subscript(vm, &lhs, &rhs);
    }

    if let Some(result) = numeric_binary_op(op, &lhs, &rhs)? {
        return Ok(result);
    }
    if let Some(result) = sequence_binary_op(op, &lhs, &rhs)? {
        return Ok(result);
    }
    if let Value::Instance(_) = &lhs {
        if let Ok(dunder) = get_attr(vm, &lhs, op.dunder()) {
            let result = call_value(vm, dunder, vec![rhs.clone()], Kwargs::new())?;
            if !matches!(result, Value::NotImplemented) {
                return Ok(result);
            }
        }
    }
    Err(VmError::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        lhs.type_name(),
        rhs.type_name()
    )))
}

fn to_bigint(value: &Value) -> Option<BigInt> {
    match value {
        Value::Int(i) => Some(i.as_ref().clone()),
        Value::Bool(b) => Some(BigInt::from(*b as i64)),
        _ => None,
    }
}

fn to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Float(f) => Some(*f),
        Value::Int(i) => i.to_f64(),
        Value::Bool(b) => Some(*b as i64 as f64),
        _ => None,
    }
}

fn numeric_binary_op(op: BinaryOp, lhs: &Value, rhs: &Value) -> VmResult<Option<Value>> {
    // Integer (and bool) fast path.
    if let (Some(a), Some(b)) = (to_bigint(lhs), to_bigint(rhs)) {
        let result = match op {
            BinaryOp::Add => Value::from_bigint(a + b),
            BinaryOp::Subtract => Value::from_bigint(a - b),
            BinaryOp::Multiply => Value::from_bigint(a * b),
            BinaryOp::TrueDivide => {
                if b.is_zero() {
                    return Err(VmError::zero_division("division by zero"));
                }
                let (x, y) = (a.to_f64(), b.to_f64());
                match (x, y) {
                    (Some(x), Some(y)) => Value::Float(x / y),
                    _ => return Err(VmError::value_error("int too large for division")),
                }
            }
            BinaryOp::FloorDivide => {
                if b.is_zero() {
                    return Err(VmError::zero_division("integer division or modulo by zero"));
                }
                Value::from_bigint(floor_div(&a, &b))
            }
            BinaryOp::Modulo => {
                if b.is_zero() {
                    return Err(VmError::zero_division("integer division or modulo by zero"));
                }
                Value::from_bigint(floor_mod(&a, &b))
            }
            BinaryOp::Power => {
                if b.is_negative() {
                    let (x, y) = (a.to_f64().unwrap_or(f64::NAN), b.to_f64().unwrap_or(f64::NAN));
                    Value::Float(x.powf(y))
                } else {
                    let exp = b.to_u32().ok_or_else(|| {
                        VmError::value_error("exponent too large")
                    })?;
                    Value::from_bigint(num_traits::pow::pow(a, exp as usize))
                }
            }
            BinaryOp::Lshift => {
                let shift = b
                    .to_u64()
                    .ok_or_else(|| VmError::value_error("negative shift count"))?;
                Value::from_bigint(a << shift)
            }
            BinaryOp::Rshift => {
                let shift = b
                    .to_u64()
                    .ok_or_else(|| VmError::value_error("negative shift count"))?;
                Value::from_bigint(a >> shift)
            }
            BinaryOp::And => Value::from_bigint(a & b),
            BinaryOp::Or => Value::from_bigint(a | b),
            BinaryOp::Xor => Value::from_bigint(a ^ b),
            _ => return Ok(None),
        };
        return Ok(Some(result));
    }

    // Float path, with int/bool promotion.
    let float_involved = matches!(lhs, Value::Float(_)) || matches!(rhs, Value::Float(_));
    if float_involved {
        if let (Some(a), Some(b)) = (to_float(lhs), to_float(rhs)) {
            let result = match op {
                BinaryOp::Add => Value::Float(a + b),
                BinaryOp::Subtract => Value::Float(a - b),
                BinaryOp::Multiply => Value::Float(a * b),
                BinaryOp::TrueDivide => {
                    if b == 0.0 {
                        return Err(VmError::zero_division("float division by zero"));
                    }
                    Value::Float(a / b)
                }
                BinaryOp::FloorDivide => {
                    if b == 0.0 {
                        return Err(VmError::zero_division("float floor division by zero"));
                    }
                    Value::Float((a / b).floor())
                }
                BinaryOp::Modulo => {
                    if b == 0.0 {
                        return Err(VmError::zero_division("float modulo"));
                    }
                    Value::Float(a - b * (a / b).floor())
                }
                BinaryOp::Power => Value::Float(a.powf(b)),
                _ => return Ok(None),
            };
            return Ok(Some(result));
        }
    }
    Ok(None)
}

fn floor_div(a: &BigInt, b: &BigInt) -> BigInt {
    let q = a / b;
    let r = a % b;
    if !r.is_zero() && (r.is_negative() != b.is_negative()) {
        q - 1
    } else {
        q
    }
}

fn floor_mod(a: &BigInt, b: &BigInt) -> BigInt {
    let r = a % b;
    if !r.is_zero() && (r.is_negative() != b.is_negative()) {
        r + b
    } else {
        r
    }
}

fn sequence_binary_op(op: BinaryOp, lhs: &Value, rhs: &Value) -> VmResult<Option<Value>> {
    match (op, lhs, rhs) {
        (BinaryOp::Add, Value::Str(a), Value::Str(b)) => {
            Ok(Some(Value::from_str(format!("{a}{b}"))))
        }
        (BinaryOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(Some(Value::list(items)))
        }
        (BinaryOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            let mut items = a.as_ref().clone();
            items.extend(b.iter().cloned());
            Ok(Some(Value::tuple(items)))
        }
        (BinaryOp::Multiply, Value::Str(s), n) | (BinaryOp::Multiply, n, Value::Str(s))
            if to_bigint(n).is_some() =>
        {
            let count = n.as_index()?.max(0) as usize;
            Ok(Some(Value::from_str(s.repeat(count))))
        }
        (BinaryOp::Multiply, Value::List(items), n)
        | (BinaryOp::Multiply, n, Value::List(items))
            if to_bigint(n).is_some() =>
        {
            let count = n.as_index()?.max(0) as usize;
            let base = items.borrow().clone();
            let mut out = Vec::with_capacity(base.len() * count);
            for _ in 0..count {
                out.extend(base.iter().cloned());
            }
            Ok(Some(Value::list(out)))
        }
        (BinaryOp::Multiply, Value::Tuple(items), n)
        | (BinaryOp::Multiply, n, Value::Tuple(items))
            if to_bigint(n).is_some() =>
        {
            let count = n.as_index()?.max(0) as usize;
            let mut out = Vec::with_capacity(items.len() * count);
            for _ in 0..count {
                out.extend(items.iter().cloned());
            }
            Ok(Some(Value::tuple(out)))
        }
        (BinaryOp::And, Value::Set(a), Value::Set(b)) => {
            let (a, b) = (a.borrow(), b.borrow());
            let out: crate::object::Set = a
                .keys()
                .filter(|k| b.contains_key(*k))
                .map(|k| (k.clone(), ()))
                .collect();
            Ok(Some(Value::Set(Rc::new(RefCell::new(out)))))
        }
        (BinaryOp::Or, Value::Set(a), Value::Set(b)) => {
            let mut out = a.borrow().clone();
            out.extend(b.borrow().iter().map(|(k, ())| (k.clone(), ())));
            Ok(Some(Value::Set(Rc::new(RefCell::new(out)))))
        }
        (BinaryOp::Subtract, Value::Set(a), Value::Set(b)) => {
            let (a, b) = (a.borrow(), b.borrow());
            let out: crate::object::Set = a
                .keys()
                .filter(|k| !b.contains_key(*k))
                .map(|k| (k.clone(), ()))
                .collect();
            Ok(Some(Value::Set(Rc::new(RefCell::new(out)))))
        }
        (BinaryOp::Xor, Value::Set(a), Value::Set(b)) => {
            let (a, b) = (a.borrow(), b.borrow());
            let mut out = crate::object::Set::new();
            for k in a.keys() {
                if !b.contains_key(k) {
                    out.insert(k.clone(), ());
                }
            }
            for k in b.keys() {
                if !a.contains_key(k) {
                    out.insert(k.clone(), ());
                }
            }
            Ok(Some(Value::Set(Rc::new(RefCell::new(out)))))
        }
        _ => Ok(None),
    }
}

// ----------------------------------------------------------------------
// Comparison
// ----------------------------------------------------------------------

/// The fixed `COMPARE_OP` relation table: six orderings, containment,
/// identity, and exception-match last.
pub fn compare_op(vm: &mut Vm, opnum: u32, lhs: Value, rhs: Value) -> VmResult<Value> {
    let result = match opnum {
        0..=5 => {
            let ordering_op = opnum;
            compare_ordered(vm, ordering_op, &lhs, &rhs)?
        }
        6 => contains(vm, &rhs, &lhs)?,
        7 => !contains(vm, &rhs, &lhs)?,
        8 => lhs.is_identical(&rhs),
        9 => !lhs.is_identical(&rhs),
        10 => exception_match(&lhs, &rhs)?,
        other => {
            return Err(VmError::fault(format!(
                "invalid COMPARE_OP argument: {other}"
            )))
        }
    };
    Ok(Value::Bool(result))
}

fn compare_ordered(vm: &mut Vm, op: u32, lhs: &Value, rhs: &Value) -> VmResult<bool> {
    use std::cmp::Ordering;

    // Equality can be decided for more types than ordering can.
    if op == 2 || op == 3 {
        if let Some(eq) = lhs.native_eq(rhs) {
            return Ok(if op == 2 { eq } else { !eq });
        }
        if let Value::Instance(_) = lhs {
            if let Ok(dunder) = get_attr(vm, lhs, "__eq__") {
                let result = call_value(vm, dunder, vec![rhs.clone()], Kwargs::new())?;
                if !matches!(result, Value::NotImplemented) {
                    let eq = truthy(vm, &result)?;
                    return Ok(if op == 2 { eq } else { !eq });
                }
            }
        }
        let identical = lhs.is_identical(rhs);
        return Ok(if op == 2 { identical } else { !identical });
    }

    let ordering = match native_ordering(lhs, rhs) {
        Some(o) => o,
        None => {
            if let Value::Instance(_) = lhs {
                let name = match op {
                    0 => "__lt__",
                    1 => "__le__",
                    4 => "__gt__",
                    5 => "__ge__",
                    _ => unreachable!(),
                };
                let dunder = get_attr(vm, lhs, name)?;
                let result = call_value(vm, dunder, vec![rhs.clone()], Kwargs::new())?;
                return truthy(vm, &result);
            }
            return Err(VmError::type_error(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                ["<", "<=", "==", "!=", ">", ">="][op as usize],
                lhs.type_name(),
                rhs.type_name()
            )));
        }
    };
    Ok(match op {
        0 => ordering == Ordering::Less,
        1 => ordering != Ordering::Greater,
        4 => ordering == Ordering::Greater,
        5 => ordering != Ordering::Less,
        _ => unreachable!(),
    })
}

fn native_ordering(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    use std::cmp::Ordering;
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
        (Value::Tuple(a), Value::Tuple(b)) => seq_ordering(a, b),
        (Value::List(a), Value::List(b)) => seq_ordering(&a.borrow(), &b.borrow()),
        _ => {
            let (a, b) = (to_float(lhs)?, to_float(rhs)?);
            a.partial_cmp(&b).or(Some(Ordering::Equal))
        }
    }
}

fn seq_ordering(a: &[Value], b: &[Value]) -> Option<std::cmp::Ordering> {
    use std::cmp::Ordering;
    for (x, y) in a.iter().zip(b.iter()) {
        if x.native_eq(y) == Some(true) {
            continue;
        }
        return native_ordering(x, y);
    }
    Some(a.len().cmp(&b.len()))
}

/// Containment (`in`).
pub fn contains(vm: &mut Vm, container: &Value, needle: &Value) -> VmResult<bool> {
    match container {
        Value::Str(haystack) => match needle {
            Value::Str(sub) => Ok(haystack.contains(sub.as_ref())),
            other => Err(VmError::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) => Ok(items.borrow().iter().any(|v| v == needle)),
        Value::Tuple(items) => Ok(items.iter().any(|v| v == needle)),
        Value::Dict(map) => Ok(map.borrow().contains_key(&needle.hash_key()?)),
        Value::Set(set) => Ok(set.borrow().contains_key(&needle.hash_key()?)),
        Value::Range(range) => {
            let n = needle.as_index()?;
            Ok((0..range.len() as i64).any(|i| range.get(i as usize) == Some(n)))
        }
        Value::Instance(_) => {
            if let Ok(dunder) = get_attr(vm, container, "__contains__") {
                let result = call_value(vm, dunder, vec![needle.clone()], Kwargs::new())?;
                return truthy(vm, &result);
            }
            // Fall back to iteration.
            let iterator = iter_value(vm, container.clone())?;
            loop {
                match next_value(vm, &iterator) {
                    Ok(item) => {
                        if &item == needle {
                            return Ok(true);
                        }
                    }
                    Err(err) if err.is_kind(ExcKind::StopIteration) => return Ok(false),
                    Err(err) => return Err(err),
                }
            }
        }
        other => Err(VmError::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

/// The exception-match relation: the left operand must be an exception
/// type (or instance); the right a type or tuple of types.
pub fn exception_match(lhs: &Value, rhs: &Value) -> VmResult<bool> {
    let class = match lhs {
        Value::ExcType(class) => class.clone(),
        Value::Exception(exc) => exc.class().clone(),
        Value::Class(class) => ExcClass::User(class.clone()),
        _ => return Ok(false),
    };
    match rhs {
        Value::ExcType(target) => Ok(class.is_subclass_of(target)),
        Value::Class(target) => Ok(class.is_subclass_of(&ExcClass::User(target.clone()))),
        Value::Tuple(targets) => {
            for target in targets.iter() {
                if exception_match(lhs, target)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(VmError::type_error(
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}

// ----------------------------------------------------------------------
// Subscripts
// ----------------------------------------------------------------------

/// `container[index]`.
pub fn get_subscript(vm: &mut Vm, container: &Value, index: &Value) -> VmResult<Value> {
    match container {
        Value::List(items) => {
            if let Value::Slice(slice) = index {
                let items = items.borrow();
                return Ok(Value::list(slice_values(&items, slice)?));
            }
            let items = items.borrow();
            let i = normalize_index(index.as_index()?, items.len(), "list")?;
            Ok(items[i].clone())
        }
        Value::Tuple(items) => {
            if let Value::Slice(slice) = index {
                return Ok(Value::tuple(slice_values(items, slice)?));
            }
            let i = normalize_index(index.as_index()?, items.len(), "tuple")?;
            Ok(items[i].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            if let Value::Slice(slice) = index {
                let values: Vec<Value> =
                    chars.iter().map(|c| Value::from_str(c.to_string())).collect();
                let selected = slice_values(&values, slice)?;
                let mut out = String::new();
                for v in selected {
                    out.push_str(&v.str());
                }
                return Ok(Value::from_str(out));
            }
            let i = normalize_index(index.as_index()?, chars.len(), "string")?;
            Ok(Value::from_str(chars[i].to_string()))
        }
        Value::Dict(map) => map
            .borrow()
            .get(&index.hash_key()?)
            .cloned()
            .ok_or_else(|| VmError::key_error(index.clone())),
        Value::Range(range) => {
            let i = normalize_index(index.as_index()?, range.len(), "range")?;
            Ok(Value::from_i64(range.get(i).expect("index validated")))
        }
        Value::Instance(_) => {
            let dunder = get_attr(vm, container, "__getitem__").map_err(|_| {
                VmError::type_error(format!(
                    "'{}' object is not subscriptable",
                    container.type_name()
                ))
            })?;
            call_value(vm, dunder, vec![index.clone()], Kwargs::new())
        }
        other => Err(VmError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

/// `container[index] = value`.
pub fn set_subscript(vm: &mut Vm, container: &Value, index: Value, value: Value) -> VmResult<()> {
    match container {
        Value::List(items) => {
            let len = items.borrow().len();
            let i = normalize_index(index.as_index()?, len, "list")?;
            items.borrow_mut()[i] = value;
            Ok(())
        }
        Value::Dict(map) => {
            map.borrow_mut().insert(index.hash_key()?, value);
            Ok(())
        }
        Value::Instance(_) => {
            let dunder = get_attr(vm, container, "__setitem__").map_err(|_| {
                VmError::type_error(format!(
                    "'{}' object does not support item assignment",
                    container.type_name()
                ))
            })?;
            call_value(vm, dunder, vec![index, value], Kwargs::new())?;
            Ok(())
        }
        other => Err(VmError::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

/// `del container[index]`.
pub fn del_subscript(vm: &mut Vm, container: &Value, index: Value) -> VmResult<()> {
    match container {
        Value::List(items) => {
            let len = items.borrow().len();
            let i = normalize_index(index.as_index()?, len, "list")?;
            items.borrow_mut().remove(i);
            Ok(())
        }
        Value::Dict(map) => {
            let key = index.hash_key()?;
            map.borrow_mut()
                .shift_remove(&key)
                .map(|_| ())
                .ok_or_else(|| VmError::key_error(index))
        }
        Value::Instance(_) => {
            let dunder = get_attr(vm, container, "__delitem__").map_err(|_| {
                VmError::type_error(format!(
                    "'{}' object does not support item deletion",
                    container.type_name()
                ))
            })?;
            call_value(vm, dunder, vec![index], Kwargs::new())?;
            Ok(())
        }
        other => Err(VmError::type_error(format!(
            "'{}' object does not support item deletion",
            other.type_name()
        ))),
    }
}

fn normalize_index(index: i64, len: usize, kind: &str) -> VmResult<usize> {
    let adjusted = if index < 0 { index + len as i64 } else { index };
    if adjusted < 0 || adjusted as usize >= len {
        Err(VmError::raised(
            ExcKind::IndexError,
            format!("{kind} index out of range"),
        ))
    } else {
        Ok(adjusted as usize)
    }
}

fn slice_values(items: &[Value], slice: &crate::object::SliceObject) -> VmResult<Vec<Value>> {
    let (start, stop, step) = slice.indices(items.len())?;
    let mut out = Vec::new();
    let mut i = start;
    if step > 0 {
        while i < stop {
            out.push(items[i as usize].clone());
            i += step;
        }
    } else {
        while i > stop {
            out.push(items[i as usize].clone());
            i += step;
        }
    }
    Ok(out)
}

// ----------------------------------------------------------------------
// Formatting (FORMAT_VALUE)
// ----------------------------------------------------------------------

/// Conversion selected by the `FORMAT_VALUE` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatConversion {
    None,
    Str,
    Repr,
    Ascii,
}

/// Applies the optional conversion then the optional format spec.
pub fn format_value(
    value: &Value,
    conversion: FormatConversion,
    spec: Option<&str>,
) -> VmResult<Value> {
    let converted = match conversion {
        FormatConversion::None => None,
        FormatConversion::Str => Some(value.str()),
        FormatConversion::Repr => Some(value.repr()),
        FormatConversion::Ascii => Some(value.repr().chars().map(escape_non_ascii).collect()),
    };
    let spec = spec.unwrap_or("");
    let text = match (&converted, spec.is_empty()) {
        (Some(text), true) => text.clone(),
        (Some(text), false) => apply_format_spec(&Value::from_str(text.clone()), spec)?,
        (None, true) => value.str(),
        (None, false) => apply_format_spec(value, spec)?,
    };
    Ok(Value::from_str(text))
}

fn escape_non_ascii(c: char) -> char {
    if c.is_ascii() {
        c
    } else {
        '?'
    }
}

fn apply_format_spec(value: &Value, spec: &str) -> VmResult<String> {
    // Subset of the format mini-language:
    //   [[fill]align][width][.precision][type]
    let mut chars: Vec<char> = spec.chars().collect();
    let mut fill = ' ';
    let mut align = None;

    if chars.len() >= 2 && matches!(chars[1], '<' | '>' | '^') {
        fill = chars[0];
        align = Some(chars[1]);
        chars.drain(..2);
    } else if !chars.is_empty() && matches!(chars[0], '<' | '>' | '^') {
        align = Some(chars[0]);
        chars.remove(0);
    }

    let mut width = 0usize;
    while !chars.is_empty() && chars[0].is_ascii_digit() {
        width = width * 10 + chars.remove(0).to_digit(10).unwrap_or(0) as usize;
    }

    let mut precision = None;
    if !chars.is_empty() && chars[0] == '.' {
        chars.remove(0);
        let mut p = 0usize;
        while !chars.is_empty() && chars[0].is_ascii_digit() {
            p = p * 10 + chars.remove(0).to_digit(10).unwrap_or(0) as usize;
        }
        precision = Some(p);
    }

    let type_char = if chars.len() == 1 { Some(chars[0]) } else { None };
    if chars.len() > 1 {
        return Err(VmError::value_error(format!(
            "Invalid format specifier '{spec}'"
        )));
    }

    let mut text = match type_char {
        None | Some('s') => {
            let mut s = value.str();
            if let Some(p) = precision {
                s.truncate(p);
            }
            s
        }
        Some('d') => match value {
            Value::Int(i) => i.to_string(),
            Value::Bool(b) => (*b as i64).to_string(),
            other => {
                return Err(VmError::value_error(format!(
                    "Unknown format code 'd' for object of type '{}'",
                    other.type_name()
                )))
            }
        },
        Some('x') => match value {
            Value::Int(i) => format!("{:x}", i.as_ref()),
            other => {
                return Err(VmError::value_error(format!(
                    "Unknown format code 'x' for object of type '{}'",
                    other.type_name()
                )))
            }
        },
        Some('f') => {
            let f = to_float(value).ok_or_else(|| {
                VmError::value_error(format!(
                    "Unknown format code 'f' for object of type '{}'",
                    value.type_name()
                ))
            })?;
            format!("{:.*}", precision.unwrap_or(6), f)
        }
        Some(other) => {
            return Err(VmError::value_error(format!(
                "Unknown format code '{other}'"
            )))
        }
    };

    if text.len() < width {
        let pad = width - text.len();
        let is_numeric = matches!(type_char, Some('d' | 'f' | 'x'));
        match align.unwrap_or(if is_numeric { '>' } else { '<' }) {
            '<' => text.extend(std::iter::repeat(fill).take(pad)),
            '>' => text = format!("{}{}", fill.to_string().repeat(pad), text),
            '^' => {
                let left = pad / 2;
                let right = pad - left;
                text = format!(
                    "{}{}{}",
                    fill.to_string().repeat(left),
                    text,
                    fill.to_string().repeat(right)
                );
            }
            _ => {}
        }
    }
    Ok(text)
}

/// `str % tuple` style formatting is not part of this evaluator; `repr`
/// of floats goes through [`format_float`] so both agree.
pub fn float_repr(f: f64) -> String {
    format_float(f)
}

/// Collects an arbitrary iterable into a vector, driving user iterators
/// through the evaluator.
pub fn collect_iterable(vm: &mut Vm, value: Value) -> VmResult<Vec<Value>> {
    match &value {
        Value::List(items) => Ok(items.borrow().clone()),
        Value::Tuple(items) => Ok(items.as_ref().clone()),
        _ => {
            let iterator = iter_value(vm, value)?;
            let mut out = Vec::new();
            loop {
                match next_value(vm, &iterator) {
                    Ok(item) => out.push(item),
                    Err(err) if err.is_kind(ExcKind::StopIteration) => break,
                    Err(err) => {
                        let exc = err.into_raised()?;
                        if exc.derives_from(ExcKind::StopIteration) {
                            break;
                        }
                        return Err(VmError::Raised(exc));
                    }
                }
            }
            Ok(out)
        }
    }
}

/// Builds a dict value from key/value pairs.
pub fn dict_from_pairs(pairs: Vec<(Value, Value)>) -> VmResult<Value> {
    let mut map = Dict::new();
    for (k, v) in pairs {
        map.insert(k.hash_key()?, v);
    }
    Ok(Value::Dict(Rc::new(RefCell::new(map))))
}

/// Reads a dict value's entries as key/value pairs.
pub fn dict_pairs(value: &Value) -> VmResult<Vec<(Value, Value)>> {
    match value {
        Value::Dict(map) => Ok(map
            .borrow()
            .iter()
            .map(|(k, v)| (k.0.clone(), v.clone()))
            .collect()),
        other => Err(VmError::type_error(format!(
            "argument must be a mapping, not {}",
            other.type_name()
        ))),
    }
}

/// Checks a hashable key out of a value (shared by SET_ADD and friends).
pub fn as_key(value: Value) -> VmResult<HashKey> {
    value.hash_key()
}
