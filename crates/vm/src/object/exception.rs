//! Guest exception machinery.
//!
//! Builtin exception types form a fixed subclass lattice; user exception
//! classes hang off it through their base list. A raised exception is an
//! [`ExceptionValue`] carrying its class and constructor arguments.

use std::cell::RefCell;
use std::rc::Rc;

use crate::object::class::ClassObject;
use crate::object::Value;

/// The builtin exception types the evaluator itself can raise or must
/// recognize during unwinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcKind {
    BaseException,
    Exception,
    ArithmeticError,
    LookupError,
    AttributeError,
    ImportError,
    IndexError,
    KeyError,
    NameError,
    UnboundLocalError,
    OverflowError,
    RuntimeError,
    NotImplementedError,
    StopIteration,
    StopAsyncIteration,
    GeneratorExit,
    KeyboardInterrupt,
    SystemExit,
    TypeError,
    ValueError,
    ZeroDivisionError,
    OSError,
    DeprecationWarning,
    PendingDeprecationWarning,
    RuntimeWarning,
}

impl ExcKind {
    /// Guest-visible type name.
    pub fn name(self) -> &'static str {
        match self {
            ExcKind::BaseException => "BaseException",
            ExcKind::Exception => "Exception",
            ExcKind::ArithmeticError => "ArithmeticError",
            ExcKind::LookupError => "LookupError",
            ExcKind::AttributeError => "AttributeError",
            ExcKind::ImportError => "ImportError",
            ExcKind::IndexError => "IndexError",
            ExcKind::KeyError => "KeyError",
            ExcKind::NameError => "NameError",
            ExcKind::UnboundLocalError => "UnboundLocalError",
            ExcKind::OverflowError => "OverflowError",
            ExcKind::RuntimeError => "RuntimeError",
            ExcKind::NotImplementedError => "NotImplementedError",
            ExcKind::StopIteration => "StopIteration",
            ExcKind::StopAsyncIteration => "StopAsyncIteration",
            ExcKind::GeneratorExit => "GeneratorExit",
            ExcKind::KeyboardInterrupt => "KeyboardInterrupt",
            ExcKind::SystemExit => "SystemExit",
            ExcKind::TypeError => "TypeError",
            ExcKind::ValueError => "ValueError",
            ExcKind::ZeroDivisionError => "ZeroDivisionError",
            ExcKind::OSError => "OSError",
            ExcKind::DeprecationWarning => "DeprecationWarning",
            ExcKind::PendingDeprecationWarning => "PendingDeprecationWarning",
            ExcKind::RuntimeWarning => "RuntimeWarning",
        }
    }

    /// Direct base type in the builtin lattice. `BaseException` has none.
    pub fn base(self) -> Option<ExcKind> {
        use ExcKind::*;
        match self {
            BaseException => None,
            // Direct children of BaseException: these deliberately do NOT
            // inherit from Exception, so a bare `except Exception` does not
            // swallow generator shutdown or interpreter exit.
            GeneratorExit | KeyboardInterrupt | SystemExit => Some(BaseException),
            Exception => Some(BaseException),
            ArithmeticError | LookupError | AttributeError | ImportError | NameError
            | RuntimeError | StopIteration | StopAsyncIteration | TypeError | ValueError
            | OSError | DeprecationWarning | PendingDeprecationWarning | RuntimeWarning => {
                Some(Exception)
            }
            IndexError | KeyError => Some(LookupError),
            UnboundLocalError => Some(NameError),
            OverflowError | ZeroDivisionError => Some(ArithmeticError),
            NotImplementedError => Some(RuntimeError),
        }
    }

    /// Subclass relation within the builtin lattice (reflexive).
    pub fn is_subclass_of(self, other: ExcKind) -> bool {
        let mut cur = Some(self);
        while let Some(kind) = cur {
            if kind == other {
                return true;
            }
            cur = kind.base();
        }
        false
    }

    /// Resolves a builtin exception name.
    pub fn by_name(name: &str) -> Option<ExcKind> {
        ALL_KINDS.iter().copied().find(|k| k.name() == name)
    }
}

/// Every builtin exception kind, for namespace registration.
pub const ALL_KINDS: &[ExcKind] = &[
    ExcKind::BaseException,
    ExcKind::Exception,
    ExcKind::ArithmeticError,
    ExcKind::LookupError,
    ExcKind::AttributeError,
    ExcKind::ImportError,
    ExcKind::IndexError,
    ExcKind::KeyError,
    ExcKind::NameError,
    ExcKind::UnboundLocalError,
    ExcKind::OverflowError,
    ExcKind::RuntimeError,
    ExcKind::NotImplementedError,
    ExcKind::StopIteration,
    ExcKind::StopAsyncIteration,
    ExcKind::GeneratorExit,
    ExcKind::KeyboardInterrupt,
    ExcKind::SystemExit,
    ExcKind::TypeError,
    ExcKind::ValueError,
    ExcKind::ZeroDivisionError,
    ExcKind::OSError,
    ExcKind::DeprecationWarning,
    ExcKind::PendingDeprecationWarning,
    ExcKind::RuntimeWarning,
];

/// An exception *type*: a builtin kind or a user class whose bases reach
/// into the builtin lattice.
#[derive(Debug, Clone)]
pub enum ExcClass {
    Builtin(ExcKind),
    User(Rc<ClassObject>),
}

impl ExcClass {
    /// The type's guest-visible name.
    pub fn name(&self) -> String {
        match self {
            ExcClass::Builtin(kind) => kind.name().to_string(),
            ExcClass::User(class) => class.name.to_string(),
        }
    }

    /// Identity of exception types.
    pub fn same_class(&self, other: &ExcClass) -> bool {
        match (self, other) {
            (ExcClass::Builtin(a), ExcClass::Builtin(b)) => a == b,
            (ExcClass::User(a), ExcClass::User(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Subclass relation, walking user bases down into the builtin lattice.
    pub fn is_subclass_of(&self, other: &ExcClass) -> bool {
        match (self, other) {
            (ExcClass::Builtin(a), ExcClass::Builtin(b)) => a.is_subclass_of(*b),
            (ExcClass::User(class), _) => {
                if let ExcClass::User(o) = other {
                    if Rc::ptr_eq(class, o) {
                        return true;
                    }
                }
                class.bases.iter().any(|base| match base {
                    Value::ExcType(parent) => parent.is_subclass_of(other),
                    Value::Class(parent) => {
                        ExcClass::User(parent.clone()).is_subclass_of(other)
                    }
                    _ => false,
                })
            }
            (ExcClass::Builtin(_), ExcClass::User(_)) => false,
        }
    }

    /// The nearest builtin kind this type derives from, if any.
    pub fn builtin_kind(&self) -> Option<ExcKind> {
        match self {
            ExcClass::Builtin(kind) => Some(*kind),
            ExcClass::User(class) => class.bases.iter().find_map(|base| match base {
                Value::ExcType(parent) => parent.builtin_kind(),
                Value::Class(parent) => ExcClass::User(parent.clone()).builtin_kind(),
                _ => None,
            }),
        }
    }
}

/// A raised (or constructed) exception instance.
#[derive(Debug, Clone)]
pub struct ExceptionValue {
    class: ExcClass,
    args: Vec<Value>,
    cause: RefCell<Option<Rc<ExceptionValue>>>,
    context: RefCell<Option<Rc<ExceptionValue>>>,
}

impl ExceptionValue {
    /// Creates an exception of a builtin kind.
    pub fn new(kind: ExcKind, args: Vec<Value>) -> Self {
        Self::of_class(ExcClass::Builtin(kind), args)
    }

    /// Creates an exception of an arbitrary type.
    pub fn of_class(class: ExcClass, args: Vec<Value>) -> Self {
        Self {
            class,
            args,
            cause: RefCell::new(None),
            context: RefCell::new(None),
        }
    }

    /// Creates an exception with a single string argument.
    pub fn with_message<S: Into<String>>(kind: ExcKind, message: S) -> Self {
        Self::new(kind, vec![Value::from_str(message.into())])
    }

    /// The exception's type.
    pub fn class(&self) -> &ExcClass {
        &self.class
    }

    /// The exception's type as a stack value.
    pub fn class_value(&self) -> Value {
        Value::ExcType(self.class.clone())
    }

    /// Constructor arguments.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// The builtin kind, when the type is builtin (not a user subclass).
    pub fn kind(&self) -> Option<ExcKind> {
        match &self.class {
            ExcClass::Builtin(kind) => Some(*kind),
            ExcClass::User(_) => None,
        }
    }

    /// Whether this exception matches `except <other>` (instance-of,
    /// including subclasses).
    pub fn matches(&self, other: &ExcClass) -> bool {
        self.class.is_subclass_of(other)
    }

    /// Whether the exception's type derives from the given builtin kind.
    pub fn derives_from(&self, kind: ExcKind) -> bool {
        self.class.is_subclass_of(&ExcClass::Builtin(kind))
    }

    /// Type name.
    pub fn type_name(&self) -> &'static str {
        match &self.class {
            ExcClass::Builtin(kind) => kind.name(),
            ExcClass::User(_) => "Exception",
        }
    }

    /// `StopIteration.value`: the first argument, or `None`.
    pub fn stop_value(&self) -> Value {
        self.args.first().cloned().unwrap_or(Value::None)
    }

    /// Sets `__cause__` (the `raise … from …` chain).
    pub fn set_cause(&self, cause: Option<Rc<ExceptionValue>>) {
        *self.cause.borrow_mut() = cause;
    }

    /// Reads `__cause__`.
    pub fn cause(&self) -> Option<Rc<ExceptionValue>> {
        self.cause.borrow().clone()
    }

    /// Sets `__context__` (the implicit chain).
    pub fn set_context(&self, context: Option<Rc<ExceptionValue>>) {
        *self.context.borrow_mut() = context;
    }

    /// Reads `__context__`.
    pub fn context(&self) -> Option<Rc<ExceptionValue>> {
        self.context.borrow().clone()
    }

    /// The rendered message: `str(exc)`.
    pub fn message(&self) -> String {
        match self.args.len() {
            0 => String::new(),
            1 => self.args[0].str(),
            _ => {
                let inner: Vec<String> = self.args.iter().map(Value::repr).collect();
                format!("({})", inner.join(", "))
            }
        }
    }

    /// `repr(exc)`.
    pub fn repr(&self) -> String {
        let inner: Vec<String> = self.args.iter().map(Value::repr).collect();
        format!("{}({})", self.class.name(), inner.join(", "))
    }
}

/// Normalizes a raise operand into an exception instance: an instance
/// passes through, a type is instantiated with the optional argument.
pub fn normalize_exception(
    etype: Value,
    value: Option<Value>,
) -> crate::error::VmResult<ExceptionValue> {
    let class = match etype {
        Value::Exception(exc) => return Ok((*exc).clone()),
        Value::ExcType(class) => class,
        Value::Class(class) => {
            let class = ExcClass::User(class);
            if class.builtin_kind().is_none() {
                return Err(crate::error::VmError::type_error(
                    "exceptions must derive from BaseException",
                ));
            }
            class
        }
        other => {
            return Err(crate::error::VmError::type_error(format!(
                "exceptions must derive from BaseException, not {}",
                other.type_name()
            )))
        }
    };
    let args = match value {
        Some(Value::Exception(exc)) => return Ok((*exc).clone()),
        Some(Value::None) | None => vec![],
        Some(Value::Tuple(items)) => items.as_ref().clone(),
        Some(single) => vec![single],
    };
    Ok(ExceptionValue::of_class(class, args))
}

impl std::fmt::Display for ExceptionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = self.message();
        if message.is_empty() {
            write!(f, "{}", self.class.name())
        } else {
            write!(f, "{}: {}", self.class.name(), message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lattice() {
        assert!(ExcKind::ValueError.is_subclass_of(ExcKind::Exception));
        assert!(ExcKind::ValueError.is_subclass_of(ExcKind::BaseException));
        assert!(ExcKind::UnboundLocalError.is_subclass_of(ExcKind::NameError));
        assert!(ExcKind::KeyError.is_subclass_of(ExcKind::LookupError));
        // GeneratorExit escapes `except Exception`.
        assert!(!ExcKind::GeneratorExit.is_subclass_of(ExcKind::Exception));
        assert!(ExcKind::GeneratorExit.is_subclass_of(ExcKind::BaseException));
    }

    #[test]
    fn test_matches() {
        let exc = ExceptionValue::with_message(ExcKind::ValueError, "oops");
        assert!(exc.matches(&ExcClass::Builtin(ExcKind::ValueError)));
        assert!(exc.matches(&ExcClass::Builtin(ExcKind::Exception)));
        assert!(!exc.matches(&ExcClass::Builtin(ExcKind::TypeError)));
    }

    #[test]
    fn test_message_rendering() {
        let exc = ExceptionValue::with_message(ExcKind::ValueError, "oops");
        assert_eq!(exc.message(), "oops");
        assert_eq!(exc.to_string(), "ValueError: oops");

        let bare = ExceptionValue::new(ExcKind::StopIteration, vec![]);
        assert_eq!(bare.to_string(), "StopIteration");
        assert_eq!(bare.stop_value(), Value::None);
    }

    #[test]
    fn test_by_name() {
        assert_eq!(ExcKind::by_name("TypeError"), Some(ExcKind::TypeError));
        assert_eq!(ExcKind::by_name("NoSuchError"), None);
    }
}
