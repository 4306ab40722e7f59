//! # pyrun-vm
//!
//! A bytecode interpreter for the CPython 3.4–3.8 instruction sets.
//!
//! The crate re-implements the reference evaluation loop in user space:
//! stack-based instruction dispatch, lexical scoping through frames,
//! exception unwinding through a block stack, and cooperative suspension
//! of generator, coroutine, and async-generator objects. It exists to be
//! instrumentable and introspectable; it is not a drop-in replacement for
//! a native interpreter.
//!
//! ## Architecture
//!
//! - **`Vm`**: the evaluator — frame chain, scratch state, fetch/decode,
//!   dispatch, block-stack unwinding, tracing hooks.
//! - **`Frame`**: one activation record — value stack, block stack,
//!   namespaces, closure cells, instruction cursor.
//! - **`JumpTable`**: version-stratified opcode handlers.
//! - **`object`**: the runtime value model, including the suspendable
//!   generator / coroutine / async-generator wrappers.
//! - **`CodeBuilder`**: a version-faithful assembler for constructing
//!   code objects without a host compiler.
//!
//! ## Example
//!
//! ```
//! use pyrun_vm::builder::CodeBuilder;
//! use pyrun_vm::object::Value;
//! use pyrun_vm::op_code::OpCode;
//! use pyrun_vm::version::PyVersion;
//! use pyrun_vm::vm::Vm;
//! use std::rc::Rc;
//!
//! // return 1 + 2
//! let mut b = CodeBuilder::new(PyVersion::Py36, "<module>");
//! b.load_const(Value::from_i64(1));
//! b.load_const(Value::from_i64(2));
//! b.op(OpCode::BinaryAdd);
//! b.op(OpCode::ReturnValue);
//!
//! let mut vm = Vm::new(PyVersion::Py36);
//! let result = vm.run_code(Rc::new(b.build()), None, None).unwrap();
//! assert_eq!(result, Value::from_i64(3));
//! ```

pub mod builder;
pub mod builtins;
pub mod code;
pub mod config;
pub mod error;
pub mod frame;
pub mod jump_table;
#[cfg(feature = "serde-types")]
pub mod marshal;
pub mod object;
pub mod op_code;
pub mod protocol;
pub mod scratch;
pub mod tracing;
pub mod version;
pub mod vm;
pub mod why;

pub use builder::CodeBuilder;
pub use code::{CodeFlags, CodeObject};
pub use config::VmConfig;
pub use error::{VmError, VmResult};
pub use frame::{Block, BlockKind, Frame};
pub use object::Value;
pub use op_code::OpCode;
pub use version::PyVersion;
pub use vm::Vm;
pub use why::Why;
