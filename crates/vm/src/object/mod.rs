//! Runtime value model.
//!
//! [`Value`] is the polymorphic item that lives on frame value stacks, in
//! namespaces, and in constant pools. Compound values share storage through
//! `Rc<RefCell<…>>`; the evaluator is strictly single-threaded, so no
//! thread-safe wrappers are involved.

pub mod async_generator;
pub mod cell;
pub mod class;
pub mod coroutine;
pub mod exception;
pub mod function;
pub mod generator;
pub mod iterator;

use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::code::CodeObject;
use crate::error::{VmError, VmResult};
use crate::why::Why;

pub use async_generator::{AsyncGenAThrow, AsyncGenASend};
pub use cell::Cell;
pub use class::{ClassObject, InstanceObject, ModuleObject};
pub use coroutine::get_awaitable_iter;
pub use exception::{ExcClass, ExcKind, ExceptionValue};
pub use function::{BoundMethod, BuiltinFunction, Function};
pub use generator::{GenFlavor, GenObject, GenRef, GenState};
pub use iterator::{IterObject, RangeObject, SliceObject};

/// An insertion-ordered string-keyed namespace (module globals, locals,
/// class and instance dictionaries).
pub type Namespace = IndexMap<Rc<str>, Value>;

/// Guest dictionary storage.
pub type Dict = IndexMap<HashKey, Value>;

/// Guest set storage.
pub type Set = IndexMap<HashKey, ()>;

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    /// The `None` singleton.
    None,
    /// The `Ellipsis` singleton.
    Ellipsis,
    /// The `NotImplemented` singleton.
    NotImplemented,
    /// Booleans.
    Bool(bool),
    /// Arbitrary-precision integers.
    Int(Rc<BigInt>),
    /// Double-precision floats.
    Float(f64),
    /// Immutable text.
    Str(Rc<str>),
    /// Immutable byte strings.
    Bytes(Rc<[u8]>),
    /// Immutable sequences.
    Tuple(Rc<Vec<Value>>),
    /// Mutable sequences.
    List(Rc<RefCell<Vec<Value>>>),
    /// Insertion-ordered mappings.
    Dict(Rc<RefCell<Dict>>),
    /// Insertion-ordered sets.
    Set(Rc<RefCell<Set>>),
    /// Slice objects built by `BUILD_SLICE`.
    Slice(Rc<SliceObject>),
    /// `range` objects.
    Range(Rc<RangeObject>),
    /// Closure cells (pushed by `LOAD_CLOSURE`).
    Cell(Rc<Cell>),
    /// Compiled code units (constants of `MAKE_FUNCTION`).
    Code(Rc<CodeObject>),
    /// Guest functions.
    Function(Rc<Function>),
    /// Host-provided callables.
    Builtin(Rc<BuiltinFunction>),
    /// A guest function bound to a receiver.
    BoundMethod(Rc<BoundMethod>),
    /// Guest classes.
    Class(Rc<ClassObject>),
    /// Guest class instances.
    Instance(Rc<InstanceObject>),
    /// Imported modules.
    Module(Rc<ModuleObject>),
    /// Exception types (builtin kinds or user exception classes).
    ExcType(ExcClass),
    /// Exception instances.
    Exception(Rc<ExceptionValue>),
    /// Builtin iterator objects.
    Iterator(Rc<RefCell<IterObject>>),
    /// Plain generators.
    Generator(GenRef),
    /// Coroutines (`async def`).
    Coroutine(GenRef),
    /// The iterator a coroutine's `__await__` returns.
    CoroutineIter(GenRef),
    /// Async generators.
    AsyncGenerator(GenRef),
    /// One-shot awaitable driving `asend` / `__anext__`.
    AsyncGenASend(Rc<RefCell<AsyncGenASend>>),
    /// One-shot awaitable driving `athrow` / `aclose`.
    AsyncGenAThrow(Rc<RefCell<AsyncGenAThrow>>),
    /// A value yielded by an async generator body, wrapped so the driving
    /// awaitable can tell it apart from awaited intermediate results.
    AGenWrapped(Rc<Value>),
    /// Continuation marker stored on the stack by finally unwinding.
    UnwindToken(Why),
}

impl Value {
    /// Builds an integer value.
    pub fn from_i64(v: i64) -> Self {
        Value::Int(Rc::new(BigInt::from(v)))
    }

    /// Builds an integer value from a big integer.
    pub fn from_bigint(v: BigInt) -> Self {
        Value::Int(Rc::new(v))
    }

    /// Builds a string value.
    pub fn from_str<S: AsRef<str>>(v: S) -> Self {
        Value::Str(Rc::from(v.as_ref()))
    }

    /// Builds a tuple value.
    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(items))
    }

    /// Builds a list value.
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    /// Builds an empty dict value.
    pub fn empty_dict() -> Self {
        Value::Dict(Rc::new(RefCell::new(Dict::new())))
    }

    /// The guest-visible type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Ellipsis => "ellipsis",
            Value::NotImplemented => "NotImplementedType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Slice(_) => "slice",
            Value::Range(_) => "range",
            Value::Cell(_) => "cell",
            Value::Code(_) => "code",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::BoundMethod(_) => "method",
            Value::Class(_) => "type",
            Value::Instance(i) => i.class_name(),
            Value::Module(_) => "module",
            Value::ExcType(_) => "type",
            Value::Exception(e) => e.type_name(),
            Value::Iterator(_) => "iterator",
            Value::Generator(_) => "generator",
            Value::Coroutine(_) => "coroutine",
            Value::CoroutineIter(_) => "coroutine_wrapper",
            Value::AsyncGenerator(_) => "async_generator",
            Value::AsyncGenASend(_) => "async_generator_asend",
            Value::AsyncGenAThrow(_) => "async_generator_athrow",
            Value::AGenWrapped(_) => "async_generator_wrapped_value",
            Value::UnwindToken(_) => "unwind_token",
        }
    }

    /// Truthiness for values whose truth does not require calling guest
    /// code. Instances defer to the protocol layer and return `None` here.
    pub fn native_truthy(&self) -> Option<bool> {
        match self {
            Value::None => Some(false),
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(!i.is_zero()),
            Value::Float(f) => Some(*f != 0.0),
            Value::Str(s) => Some(!s.is_empty()),
            Value::Bytes(b) => Some(!b.is_empty()),
            Value::Tuple(t) => Some(!t.is_empty()),
            Value::List(l) => Some(!l.borrow().is_empty()),
            Value::Dict(d) => Some(!d.borrow().is_empty()),
            Value::Set(s) => Some(!s.borrow().is_empty()),
            Value::Range(r) => Some(r.len() != 0),
            Value::Instance(_) => None,
            _ => Some(true),
        }
    }

    /// Reference identity, the `is` relation. Singletons compare by
    /// variant; reference types by pointer.
    pub fn is_identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None)
            | (Value::Ellipsis, Value::Ellipsis)
            | (Value::NotImplemented, Value::NotImplemented) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(a, b),
            (Value::Cell(a), Value::Cell(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            (Value::ExcType(a), Value::ExcType(b)) => a.same_class(b),
            (Value::Generator(a), Value::Generator(b))
            | (Value::Coroutine(a), Value::Coroutine(b))
            | (Value::CoroutineIter(a), Value::CoroutineIter(b))
            | (Value::AsyncGenerator(a), Value::AsyncGenerator(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Structural equality for values comparable without guest code:
    /// numbers across int/float/bool, strings, bytes, sequences, mappings.
    /// Returns `None` when equality would need a guest `__eq__`.
    pub fn native_eq(&self, other: &Value) -> Option<bool> {
        match (self, other) {
            (Value::None, Value::None) => Some(true),
            (Value::Bool(_) | Value::Int(_) | Value::Float(_), Value::Bool(_) | Value::Int(_) | Value::Float(_)) => {
                Some(numeric_eq(self, other))
            }
            (Value::Str(a), Value::Str(b)) => Some(a == b),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a == b),
            (Value::Tuple(a), Value::Tuple(b)) => seq_eq(a, b),
            (Value::List(a), Value::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return Some(true);
                }
                seq_eq(&a.borrow(), &b.borrow())
            }
            (Value::Dict(a), Value::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return Some(true);
                }
                let (a, b) = (a.borrow(), b.borrow());
                if a.len() != b.len() {
                    return Some(false);
                }
                for (k, v) in a.iter() {
                    match b.get(k) {
                        Some(w) => match v.native_eq(w) {
                            Some(true) => {}
                            other => return other,
                        },
                        None => return Some(false),
                    }
                }
                Some(true)
            }
            (Value::Set(a), Value::Set(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                Some(a.len() == b.len() && a.keys().all(|k| b.contains_key(k)))
            }
            (Value::Instance(_), _) | (_, Value::Instance(_)) => None,
            _ => Some(self.is_identical(other)),
        }
    }

    /// Projects this value into a dictionary key, or raises `TypeError`
    /// for unhashable values.
    pub fn hash_key(&self) -> VmResult<HashKey> {
        match self {
            Value::List(_) | Value::Dict(_) | Value::Set(_) => Err(VmError::type_error(format!(
                "unhashable type: '{}'",
                self.type_name()
            ))),
            Value::Tuple(items) => {
                for item in items.iter() {
                    item.hash_key()?;
                }
                Ok(HashKey(self.clone()))
            }
            _ => Ok(HashKey(self.clone())),
        }
    }

    /// Converts to an index integer, raising `TypeError` for non-integers.
    pub fn as_index(&self) -> VmResult<i64> {
        match self {
            Value::Bool(b) => Ok(*b as i64),
            Value::Int(i) => i.to_i64().ok_or_else(|| {
                VmError::raised(ExcKind::OverflowError, "int too large to convert to index")
            }),
            _ => Err(VmError::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                self.type_name()
            ))),
        }
    }

    /// `repr()` rendering.
    pub fn repr(&self) -> String {
        match self {
            Value::None => "None".into(),
            Value::Ellipsis => "Ellipsis".into(),
            Value::NotImplemented => "NotImplemented".into(),
            Value::Bool(true) => "True".into(),
            Value::Bool(false) => "False".into(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => repr_str(s),
            Value::Bytes(b) => repr_bytes(b),
            Value::Tuple(items) => {
                let inner: Vec<String> = items.iter().map(Value::repr).collect();
                if inner.len() == 1 {
                    format!("({},)", inner[0])
                } else {
                    format!("({})", inner.join(", "))
                }
            }
            Value::List(items) => {
                let inner: Vec<String> = items.borrow().iter().map(Value::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Dict(map) => {
                let inner: Vec<String> = map
                    .borrow()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.0.repr(), v.repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Value::Set(set) => {
                let set = set.borrow();
                if set.is_empty() {
                    "set()".into()
                } else {
                    let inner: Vec<String> = set.keys().map(|k| k.0.repr()).collect();
                    format!("{{{}}}", inner.join(", "))
                }
            }
            Value::Slice(s) => s.repr(),
            Value::Range(r) => r.repr(),
            Value::Cell(_) => "<cell>".into(),
            Value::Code(c) => format!("<code object {}>", c.name),
            Value::Function(f) => format!("<function {}>", f.qualname),
            Value::Builtin(b) => format!("<built-in function {}>", b.name),
            Value::BoundMethod(m) => format!("<bound method {}>", m.name()),
            Value::Class(c) => format!("<class '{}'>", c.name),
            Value::Instance(i) => format!("<{} object>", i.class_name()),
            Value::Module(m) => format!("<module '{}'>", m.name),
            Value::ExcType(c) => format!("<class '{}'>", c.name()),
            Value::Exception(e) => e.repr(),
            Value::Generator(g) => format!("<generator object {}>", g.borrow().qualname()),
            Value::Coroutine(g) => format!("<coroutine object {}>", g.borrow().qualname()),
            Value::AsyncGenerator(g) => {
                format!("<async_generator object {}>", g.borrow().qualname())
            }
            other => format!("<{}>", other.type_name()),
        }
    }

    /// `str()` rendering: strings and exceptions render bare, everything
    /// else falls back to `repr()`.
    pub fn str(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            Value::Exception(e) => e.message(),
            _ => self.repr(),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::None
    }
}

impl PartialEq for Value {
    /// Structural equality where natively decidable, identity otherwise.
    /// Guest `__eq__` dispatch lives in the protocol layer; this impl is
    /// what tests and container internals use.
    fn eq(&self, other: &Self) -> bool {
        self.native_eq(other).unwrap_or_else(|| self.is_identical(other))
    }
}

fn numeric_eq(a: &Value, b: &Value) -> bool {
    fn as_float(v: &Value) -> Option<f64> {
        match v {
            Value::Bool(b) => Some(*b as i64 as f64),
            Value::Int(i) => i.to_f64(),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Bool(x), Value::Int(y)) | (Value::Int(y), Value::Bool(x)) => {
            BigInt::from(*x as i64) == **y
        }
        _ => match (as_float(a), as_float(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

fn seq_eq(a: &[Value], b: &[Value]) -> Option<bool> {
    if a.len() != b.len() {
        return Some(false);
    }
    for (x, y) in a.iter().zip(b.iter()) {
        match x.native_eq(y) {
            Some(true) => {}
            other => return other,
        }
    }
    Some(true)
}

/// Renders a float the way the guest language prints one: integral floats
/// keep a trailing `.0`.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".into();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if f == f.trunc() && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

fn repr_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn repr_bytes(b: &[u8]) -> String {
    let mut out = String::from("b'");
    for &byte in b {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7E => out.push(byte as char),
            _ => out.push_str(&format!("\\x{byte:02x}")),
        }
    }
    out.push('\'');
    out
}

/// A hashable projection of a [`Value`], usable as a dict or set key.
///
/// Numeric keys are unified the way guest semantics require: `1`, `1.0`
/// and `True` are the same key.
#[derive(Debug, Clone)]
pub struct HashKey(pub Value);

impl PartialEq for HashKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.native_eq(&other.0).unwrap_or(false)
    }
}

impl Eq for HashKey {}

impl Hash for HashKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0 {
            Value::None => 0u8.hash(state),
            Value::Ellipsis => 1u8.hash(state),
            Value::Bool(b) => hash_int(&BigInt::from(*b as i64), state),
            Value::Int(i) => hash_int(i, state),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 1e18 {
                    hash_int(&BigInt::from(*f as i64), state);
                } else {
                    3u8.hash(state);
                    f.to_bits().hash(state);
                }
            }
            Value::Str(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            Value::Bytes(b) => {
                5u8.hash(state);
                b.hash(state);
            }
            Value::Tuple(items) => {
                6u8.hash(state);
                for item in items.iter() {
                    HashKey(item.clone()).hash(state);
                }
            }
            other => {
                // Identity-hashed values (functions, instances, ...).
                7u8.hash(state);
                std::mem::discriminant(other).hash(state);
            }
        }
    }
}

fn hash_int<H: Hasher>(i: &BigInt, state: &mut H) {
    2u8.hash(state);
    i.is_negative().hash(state);
    i.magnitude().to_u64_digits().hash(state);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repr_collections() {
        let l = Value::list(vec![
            Value::from_i64(0),
            Value::from_str("f"),
            Value::from_str("e"),
        ]);
        assert_eq!(l.repr(), "[0, 'f', 'e']");

        let t = Value::tuple(vec![Value::from_i64(1)]);
        assert_eq!(t.repr(), "(1,)");
    }

    #[test]
    fn test_str_of_float() {
        assert_eq!(Value::Float(3.0).str(), "3.0");
        assert_eq!(Value::Float(2.5).str(), "2.5");
    }

    #[test]
    fn test_numeric_key_unification() {
        let one = Value::from_i64(1).hash_key().unwrap();
        let one_f = Value::Float(1.0).hash_key().unwrap();
        let one_b = Value::Bool(true).hash_key().unwrap();
        assert_eq!(one, one_f);
        assert_eq!(one, one_b);

        let mut d = Dict::new();
        d.insert(one, Value::from_str("x"));
        assert!(d.contains_key(&Value::Float(1.0).hash_key().unwrap()));
    }

    #[test]
    fn test_unhashable() {
        assert!(Value::list(vec![]).hash_key().is_err());
        assert!(Value::empty_dict().hash_key().is_err());
        // A tuple is only hashable when its elements are.
        assert!(Value::tuple(vec![Value::list(vec![])]).hash_key().is_err());
    }

    #[test]
    fn test_identity_vs_equality() {
        let a = Value::list(vec![Value::from_i64(1)]);
        let b = Value::list(vec![Value::from_i64(1)]);
        assert_eq!(a.native_eq(&b), Some(true));
        assert!(!a.is_identical(&b));
        assert!(a.is_identical(&a.clone()));
    }
}
