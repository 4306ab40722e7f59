//! Guest functions, builtin callables, and argument binding.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::code::{CodeFlags, CodeObject};
use crate::error::{VmError, VmResult};
use crate::object::cell::Cell;
use crate::object::{Namespace, Value};

/// Keyword arguments at a call site.
pub type Kwargs = IndexMap<Rc<str>, Value>;

/// A guest function: code plus captured globals, defaults, and closure.
#[derive(Debug)]
pub struct Function {
    /// Compiled body.
    pub code: Rc<CodeObject>,
    /// The globals mapping the function was defined in.
    pub globals: Rc<std::cell::RefCell<Namespace>>,
    /// Dotted name for diagnostics.
    pub qualname: Rc<str>,
    /// Positional defaults, right-aligned over the positional parameters.
    pub defaults: Vec<Value>,
    /// Keyword-only defaults.
    pub kwdefaults: Kwargs,
    /// Closure cells matching `code.freevars`.
    pub closure: Vec<Rc<Cell>>,
    /// Annotations mapping (`__annotations__`).
    pub annotations: Kwargs,
}

impl Function {
    /// Simple name from the code object.
    pub fn name(&self) -> &str {
        &self.code.name
    }
}

/// Signature of a host-provided callable.
pub type NativeFn = fn(&mut crate::vm::Vm, Vec<Value>, Kwargs) -> VmResult<Value>;

/// A builtin function, optionally bound to a receiver (builtin methods
/// such as `list.append` carry their list here).
#[derive(Debug)]
pub struct BuiltinFunction {
    /// Guest-visible name.
    pub name: &'static str,
    /// The implementation.
    pub func: NativeFn,
    /// Receiver prepended to the positional arguments when calling.
    pub receiver: Option<Value>,
}

impl BuiltinFunction {
    /// A free builtin function.
    pub fn new(name: &'static str, func: NativeFn) -> Value {
        Value::Builtin(Rc::new(Self {
            name,
            func,
            receiver: None,
        }))
    }

    /// A builtin method bound to `receiver`.
    pub fn bound(name: &'static str, receiver: Value, func: NativeFn) -> Value {
        Value::Builtin(Rc::new(Self {
            name,
            func,
            receiver: Some(receiver),
        }))
    }
}

/// A guest function bound to a receiver by attribute lookup.
#[derive(Debug)]
pub struct BoundMethod {
    /// The receiver (`self`).
    pub receiver: Value,
    /// The underlying function.
    pub func: Rc<Function>,
}

impl BoundMethod {
    pub fn name(&self) -> &str {
        self.func.name()
    }
}

/// Binds call-site arguments to parameter slots, producing the initial
/// locals for a frame.
///
/// Follows the calling convention of the compiled code: `varnames` starts
/// with the positional parameters, then keyword-only parameters, then the
/// `*args` slot, then the `**kwargs` slot.
pub fn bind_arguments(func: &Function, args: Vec<Value>, kwargs: Kwargs) -> VmResult<Namespace> {
    let code = &func.code;
    let argc = code.argcount;
    let kwargc = code.kwonlyargcount;
    let varargs = code.flags.contains(CodeFlags::VARARGS);
    let varkws = code.flags.contains(CodeFlags::VARKEYWORDS);
    let n_params = argc + kwargc + varargs as usize + varkws as usize;
    if code.varnames.len() < n_params {
        return Err(VmError::fault(format!(
            "code object {} declares {} parameters but only {} varnames",
            code.name,
            n_params,
            code.varnames.len()
        )));
    }
    let params: &[Rc<str>] = &code.varnames[..n_params];

    let mut locals = Namespace::new();

    // Positional defaults are right-aligned over the positional params.
    let n_defaults = func.defaults.len().min(argc);
    for (name, value) in params[argc - n_defaults..argc]
        .iter()
        .zip(func.defaults[func.defaults.len() - n_defaults..].iter())
    {
        locals.insert(name.clone(), value.clone());
    }
    for (name, value) in &func.kwdefaults {
        locals.insert(name.clone(), value.clone());
    }

    // Positional arguments fill the positional params left to right.
    for (name, value) in params[..argc].iter().zip(args.iter()) {
        locals.insert(name.clone(), value.clone());
    }
    if varargs {
        let overflow: Vec<Value> = args.iter().skip(argc).cloned().collect();
        locals.insert(params[argc + kwargc].clone(), Value::tuple(overflow));
    } else if args.len() > argc {
        return Err(VmError::type_error(format!(
            "{}() takes {} positional argument{} but {} {} given",
            func.name(),
            argc,
            if argc == 1 { "" } else { "s" },
            args.len(),
            if args.len() == 1 { "was" } else { "were" },
        )));
    }

    let mut extra = Namespace::new();
    for (name, value) in kwargs {
        if params[..argc + kwargc].iter().any(|p| *p == name) {
            if params[..args.len().min(argc)].iter().any(|p| *p == name) {
                return Err(VmError::type_error(format!(
                    "{}() got multiple values for argument '{}'",
                    func.name(),
                    name
                )));
            }
            locals.insert(name, value);
        } else if varkws {
            extra.insert(name, value);
        } else {
            return Err(VmError::type_error(format!(
                "{}() got an unexpected keyword argument '{}'",
                func.name(),
                name
            )));
        }
    }
    if varkws {
        let mut dict = crate::object::Dict::new();
        for (name, value) in extra {
            dict.insert(Value::Str(name).hash_key()?, value);
        }
        let slot = params[n_params - 1].clone();
        locals.insert(
            slot,
            Value::Dict(Rc::new(std::cell::RefCell::new(dict))),
        );
    }

    // Required parameters: positional params without defaults, then
    // keyword-only params without defaults.
    let required = &params[..argc - n_defaults];
    let missing: Vec<&Rc<str>> = required.iter().filter(|p| !locals.contains_key(&***p)).collect();
    if !missing.is_empty() {
        let names: Vec<String> = missing.iter().map(|m| format!("'{m}'")).collect();
        return Err(VmError::type_error(format!(
            "{}() missing {} required positional argument{}: {}",
            code.name,
            missing.len(),
            if missing.len() == 1 { "" } else { "s" },
            names.join(", "),
        )));
    }
    let missing_kw: Vec<&Rc<str>> = params[argc..argc + kwargc]
        .iter()
        .filter(|p| !locals.contains_key(&***p))
        .collect();
    if !missing_kw.is_empty() {
        let names: Vec<String> = missing_kw.iter().map(|m| format!("'{m}'")).collect();
        return Err(VmError::type_error(format!(
            "{}() missing {} required keyword-only argument{}: {}",
            code.name,
            missing_kw.len(),
            if missing_kw.len() == 1 { "" } else { "s" },
            names.join(", "),
        )));
    }

    Ok(locals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CodeBuilder;
    use crate::version::PyVersion;
    use std::cell::RefCell;

    fn make_func(
        varnames: &[&str],
        argcount: usize,
        kwonly: usize,
        flags: CodeFlags,
        defaults: Vec<Value>,
    ) -> Function {
        let mut code = CodeBuilder::new(PyVersion::Py36, "fn").build();
        code.varnames = varnames.iter().map(|v| Rc::from(*v)).collect();
        code.argcount = argcount;
        code.kwonlyargcount = kwonly;
        code.flags = flags;
        Function {
            code: Rc::new(code),
            globals: Rc::new(RefCell::new(Namespace::new())),
            qualname: Rc::from("fn"),
            defaults,
            kwdefaults: Kwargs::new(),
            closure: vec![],
            annotations: Kwargs::new(),
        }
    }

    #[test]
    fn test_positional_binding() {
        let func = make_func(&["a", "b"], 2, 0, CodeFlags::empty(), vec![]);
        let locals =
            bind_arguments(&func, vec![Value::from_i64(1), Value::from_i64(2)], Kwargs::new())
                .unwrap();
        assert_eq!(locals["a"], Value::from_i64(1));
        assert_eq!(locals["b"], Value::from_i64(2));
    }

    #[test]
    fn test_defaults_right_aligned() {
        let func = make_func(&["a", "b", "c"], 3, 0, CodeFlags::empty(), vec![
            Value::from_i64(20),
            Value::from_i64(30),
        ]);
        let locals = bind_arguments(&func, vec![Value::from_i64(1)], Kwargs::new()).unwrap();
        assert_eq!(locals["a"], Value::from_i64(1));
        assert_eq!(locals["b"], Value::from_i64(20));
        assert_eq!(locals["c"], Value::from_i64(30));
    }

    #[test]
    fn test_varargs_overflow() {
        let func = make_func(&["a", "args"], 1, 0, CodeFlags::VARARGS, vec![]);
        let locals = bind_arguments(
            &func,
            vec![Value::from_i64(1), Value::from_i64(2), Value::from_i64(3)],
            Kwargs::new(),
        )
        .unwrap();
        assert_eq!(
            locals["args"],
            Value::tuple(vec![Value::from_i64(2), Value::from_i64(3)])
        );
    }

    #[test]
    fn test_too_many_positionals() {
        let func = make_func(&["a"], 1, 0, CodeFlags::empty(), vec![]);
        let err = bind_arguments(
            &func,
            vec![Value::from_i64(1), Value::from_i64(2)],
            Kwargs::new(),
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("takes 1 positional argument but 2 were given"));
    }

    #[test]
    fn test_unexpected_keyword() {
        let func = make_func(&["a"], 1, 0, CodeFlags::empty(), vec![]);
        let mut kwargs = Kwargs::new();
        kwargs.insert(Rc::from("nope"), Value::from_i64(1));
        let err = bind_arguments(&func, vec![Value::from_i64(1)], kwargs).unwrap_err();
        assert!(err.to_string().contains("unexpected keyword argument 'nope'"));
    }

    #[test]
    fn test_varkw_collects_extras() {
        let func = make_func(&["a", "kw"], 1, 0, CodeFlags::VARKEYWORDS, vec![]);
        let mut kwargs = Kwargs::new();
        kwargs.insert(Rc::from("x"), Value::from_i64(9));
        let locals = bind_arguments(&func, vec![Value::from_i64(1)], kwargs).unwrap();
        match &locals["kw"] {
            Value::Dict(d) => assert_eq!(d.borrow().len(), 1),
            other => panic!("expected dict, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_missing_required() {
        let func = make_func(&["a", "b"], 2, 0, CodeFlags::empty(), vec![]);
        let err = bind_arguments(&func, vec![Value::from_i64(1)], Kwargs::new()).unwrap_err();
        assert!(err.to_string().contains("missing 1 required positional argument: 'b'"));
    }

    #[test]
    fn test_kwonly_binding() {
        let func = make_func(&["a", "flag"], 1, 1, CodeFlags::empty(), vec![]);
        let mut kwargs = Kwargs::new();
        kwargs.insert(Rc::from("flag"), Value::Bool(true));
        let locals = bind_arguments(&func, vec![Value::from_i64(1)], kwargs).unwrap();
        assert_eq!(locals["flag"], Value::Bool(true));

        let err = bind_arguments(&func, vec![Value::from_i64(1)], Kwargs::new()).unwrap_err();
        assert!(err.to_string().contains("keyword-only"));
    }
}
