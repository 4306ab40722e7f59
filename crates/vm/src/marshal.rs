//! Host-side code unit loading (`serde-types` feature).
//!
//! A dump of compiled code objects — produced on the host side by walking
//! `co_*` attributes — deserializes into [`CodeSpec`] trees and converts
//! into runnable [`CodeObject`]s. Only constant kinds that can appear in a
//! constant pool are representable.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::code::{CodeFlags, CodeObject};
use crate::error::{VmError, VmResult};
use crate::object::Value;
use crate::version::PyVersion;

/// A constant-pool entry in dump form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstSpec {
    None,
    Ellipsis,
    Bool { value: bool },
    /// Integers are carried as decimal strings so arbitrary precision
    /// survives the trip.
    Int { value: String },
    Float { value: f64 },
    Str { value: String },
    Bytes { value: Vec<u8> },
    Tuple { items: Vec<ConstSpec> },
    Code { code: Box<CodeSpec> },
}

impl ConstSpec {
    fn into_value(self, version: PyVersion) -> VmResult<Value> {
        Ok(match self {
            ConstSpec::None => Value::None,
            ConstSpec::Ellipsis => Value::Ellipsis,
            ConstSpec::Bool { value } => Value::Bool(value),
            ConstSpec::Int { value } => {
                let parsed = value
                    .parse::<num_bigint::BigInt>()
                    .map_err(|_| VmError::fault(format!("bad integer constant: {value}")))?;
                Value::from_bigint(parsed)
            }
            ConstSpec::Float { value } => Value::Float(value),
            ConstSpec::Str { value } => Value::from_str(value),
            ConstSpec::Bytes { value } => Value::Bytes(Rc::from(value.into_boxed_slice())),
            ConstSpec::Tuple { items } => Value::tuple(
                items
                    .into_iter()
                    .map(|item| item.into_value(version))
                    .collect::<VmResult<Vec<_>>>()?,
            ),
            ConstSpec::Code { code } => Value::Code(Rc::new(code.into_code(version)?)),
        })
    }
}

/// One code object in dump form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSpec {
    pub code: Vec<u8>,
    #[serde(default)]
    pub consts: Vec<ConstSpec>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub varnames: Vec<String>,
    #[serde(default)]
    pub cellvars: Vec<String>,
    #[serde(default)]
    pub freevars: Vec<String>,
    #[serde(default)]
    pub argcount: usize,
    #[serde(default)]
    pub kwonlyargcount: usize,
    #[serde(default)]
    pub flags: u32,
    pub name: String,
    #[serde(default)]
    pub qualname: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default = "default_firstlineno")]
    pub firstlineno: u32,
    #[serde(default)]
    pub lnotab: Vec<u8>,
}

fn default_firstlineno() -> u32 {
    1
}

impl CodeSpec {
    /// Converts the dump into a runnable code object.
    pub fn into_code(self, version: PyVersion) -> VmResult<CodeObject> {
        let qualname = self.qualname.unwrap_or_else(|| self.name.clone());
        Ok(CodeObject {
            version,
            code: self.code,
            consts: self
                .consts
                .into_iter()
                .map(|c| c.into_value(version))
                .collect::<VmResult<Vec<_>>>()?,
            names: self.names.into_iter().map(Rc::from).collect(),
            varnames: self.varnames.into_iter().map(Rc::from).collect(),
            cellvars: self.cellvars.into_iter().map(Rc::from).collect(),
            freevars: self.freevars.into_iter().map(Rc::from).collect(),
            argcount: self.argcount,
            kwonlyargcount: self.kwonlyargcount,
            flags: CodeFlags::from_bits_truncate(self.flags),
            name: Rc::from(self.name),
            qualname: Rc::from(qualname),
            filename: Rc::from(self.filename.unwrap_or_else(|| "<dump>".to_string())),
            firstlineno: self.firstlineno,
            lnotab: self.lnotab,
        })
    }
}

/// Parses a JSON dump into a code object for the given version.
pub fn load_json(version: PyVersion, json: &str) -> VmResult<CodeObject> {
    let spec: CodeSpec = serde_json::from_str(json)
        .map_err(|e| VmError::fault(format!("code dump parse error: {e}")))?;
    spec.into_code(version)
}
