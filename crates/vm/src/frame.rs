//! Activation records.
//!
//! A [`Frame`] is one activation of a code object: its value stack, block
//! stack, namespace bindings, closure cells, and instruction cursor. The
//! block-unwinding primitives live here; the evaluation loop drives them
//! through [`Frame::manage_block_stack`].

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::code::CodeObject;
use crate::error::{VmError, VmResult};
use crate::object::generator::GenObject;
use crate::object::{Cell, Namespace, Value};
use crate::scratch::{ExcTriple, Scratch};
use crate::tracing::TraceFn;
use crate::version::PyVersion;
use crate::why::Why;

/// The kind of a structured-construct record on the block stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// A `SETUP_LOOP` region (absent from 3.8 bytecode).
    Loop,
    /// A `SETUP_EXCEPT` region (absent from 3.8 bytecode).
    Except,
    /// A `SETUP_FINALLY` / `SETUP_WITH` region.
    Finally,
    /// Pushed when exception handling begins; records the shadowed
    /// exception so `POP_EXCEPT` can restore it.
    ExceptHandler,
}

/// One block-stack record.
#[derive(Debug, Clone, Copy)]
pub struct Block {
    pub kind: BlockKind,
    /// Handler offset jumped to when the block reacts to unwinding.
    pub handler: usize,
    /// Value-stack depth at entry.
    pub level: usize,
}

/// One activation of a code object.
pub struct Frame {
    /// The code being executed.
    pub code: Rc<CodeObject>,
    /// Module globals.
    pub globals: Rc<RefCell<Namespace>>,
    /// Local bindings.
    pub locals: Rc<RefCell<Namespace>>,
    /// Builtins namespace, resolved at construction.
    pub builtins: Rc<RefCell<Namespace>>,
    /// Caller frame; rewritten when a generator is resumed.
    pub back: Option<Rc<RefCell<Frame>>>,
    /// The value stack.
    pub stack: Vec<Value>,
    /// The block stack.
    pub block_stack: Vec<Block>,
    /// Instruction cursor (byte offset).
    pub lasti: usize,
    /// Closure cells, one entry per cell variable or free variable.
    pub cells: IndexMap<Rc<str>, Rc<Cell>>,
    /// Back-reference to the suspendable wrapper owning this frame.
    pub generator: Option<Weak<RefCell<GenObject>>>,
    /// Per-frame trace callback.
    pub trace: Option<TraceFn>,
    /// Invoke the trace callback at line starts.
    pub trace_lines: bool,
    /// Invoke the trace callback before every instruction.
    pub trace_opcodes: bool,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("code", &self.code.qualname)
            .field("lasti", &self.lasti)
            .field("stack_depth", &self.stack.len())
            .field("blocks", &self.block_stack.len())
            .finish()
    }
}

impl Frame {
    /// Creates a frame for one activation.
    ///
    /// The builtins mapping is inherited from the caller when both share
    /// the same globals; otherwise it is resolved through the reserved
    /// `__builtins__` entry, falling back to `default_builtins`.
    pub fn new(
        code: Rc<CodeObject>,
        globals: Rc<RefCell<Namespace>>,
        locals: Rc<RefCell<Namespace>>,
        closure: &[Rc<Cell>],
        back: Option<Rc<RefCell<Frame>>>,
        default_builtins: &Rc<RefCell<Namespace>>,
    ) -> VmResult<Self> {
        let builtins = match &back {
            Some(parent) if Rc::ptr_eq(&parent.borrow().globals, &globals) => {
                parent.borrow().builtins.clone()
            }
            _ => match globals.borrow().get("__builtins__") {
                Some(Value::Module(module)) => module.dict.clone(),
                _ => default_builtins.clone(),
            },
        };

        let mut cells = IndexMap::new();
        for var in &code.cellvars {
            let seed = locals.borrow().get(var.as_ref()).cloned();
            cells.insert(var.clone(), Rc::new(Cell::new(seed)));
        }
        if !code.freevars.is_empty() {
            if code.freevars.len() != closure.len() {
                return Err(VmError::fault(format!(
                    "closure of length {} does not match {} free variables of {}",
                    closure.len(),
                    code.freevars.len(),
                    code.qualname,
                )));
            }
            for (var, cell) in code.freevars.iter().zip(closure.iter()) {
                cells.insert(var.clone(), cell.clone());
            }
        }

        Ok(Self {
            code,
            globals,
            locals,
            builtins,
            back,
            stack: Vec::new(),
            block_stack: Vec::new(),
            lasti: 0,
            cells,
            generator: None,
            trace: None,
            trace_lines: true,
            trace_opcodes: false,
        })
    }

    /// Current source line.
    pub fn lineno(&self) -> u32 {
        self.code.line_for_offset(self.lasti)
    }

    // ------------------------------------------------------------------
    // Value-stack primitives
    // ------------------------------------------------------------------

    /// The top of the stack, cloned.
    pub fn top(&self) -> VmResult<Value> {
        self.peek(0)
    }

    /// The value `i` slots below the top, cloned.
    pub fn peek(&self, i: usize) -> VmResult<Value> {
        let len = self.stack.len();
        if i >= len {
            return Err(VmError::fault(format!(
                "stack underflow: peek({i}) with depth {len}"
            )));
        }
        Ok(self.stack[len - 1 - i].clone())
    }

    /// Pushes one value.
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Pops the top of the stack.
    pub fn pop(&mut self) -> VmResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| VmError::fault("stack underflow: pop from empty stack"))
    }

    /// Removes and returns the value `i` slots below the top.
    pub fn pop_at(&mut self, i: usize) -> VmResult<Value> {
        let len = self.stack.len();
        if i >= len {
            return Err(VmError::fault(format!(
                "stack underflow: pop_at({i}) with depth {len}"
            )));
        }
        Ok(self.stack.remove(len - 1 - i))
    }

    /// Pops `n` values; the returned vector is ordered deepest-first.
    pub fn popn(&mut self, n: usize) -> VmResult<Vec<Value>> {
        let len = self.stack.len();
        if n > len {
            return Err(VmError::fault(format!(
                "stack underflow: popn({n}) with depth {len}"
            )));
        }
        Ok(self.stack.split_off(len - n))
    }

    /// Moves the cursor.
    pub fn jump(&mut self, target: usize) {
        self.lasti = target;
    }

    // ------------------------------------------------------------------
    // Block-stack primitives
    // ------------------------------------------------------------------

    /// Pushes a block recording the current stack depth.
    pub fn push_block(&mut self, kind: BlockKind, handler: usize) {
        let level = self.stack.len();
        self.push_block_at(kind, handler, level);
    }

    /// Pushes a block with an explicit entry level.
    pub fn push_block_at(&mut self, kind: BlockKind, handler: usize, level: usize) {
        self.block_stack.push(Block {
            kind,
            handler,
            level,
        });
    }

    /// Pops the innermost block.
    pub fn pop_block(&mut self) -> VmResult<Block> {
        self.block_stack
            .pop()
            .ok_or_else(|| VmError::fault("pop from empty block stack"))
    }

    /// Pops values until the stack is back at the block's entry level.
    pub fn unwind_block(&mut self, block: &Block) {
        self.stack.truncate(block.level);
    }

    /// Unwinds an except-handler block: pops down to three values above
    /// the entry level, then pops the shadowed exception triple into the
    /// current-exception slot.
    pub fn unwind_except_handler(&mut self, block: &Block, scratch: &mut Scratch) -> VmResult<()> {
        if self.stack.len() < block.level + 3 {
            return Err(VmError::fault(
                "except-handler block without a shadowed exception triple",
            ));
        }
        self.stack.truncate(block.level + 3);
        let triple = self.popn(3)?;
        let (tb, value, etype) = into_triple(triple);
        scratch.current_exception = match etype {
            Value::None => None,
            etype => Some(ExcTriple { etype, value, tb }),
        };
        Ok(())
    }

    /// Applies the block-stack unwinding policy for a non-`yield`
    /// continuation reason. Returns the reason still propagating, or
    /// `None` when the block handled it (cursor already redirected).
    pub fn manage_block_stack(
        &mut self,
        why: Why,
        scratch: &mut Scratch,
    ) -> VmResult<Option<Why>> {
        debug_assert!(why != Why::Yield);
        let block = *self
            .block_stack
            .last()
            .ok_or_else(|| VmError::fault("manage_block_stack on empty block stack"))?;

        if block.kind == BlockKind::Loop && why == Why::Continue {
            let target = scratch.return_value.as_index()? as usize;
            self.jump(target);
            return Ok(None);
        }

        self.pop_block()?;
        if block.kind == BlockKind::ExceptHandler {
            self.unwind_except_handler(&block, scratch)?;
            return Ok(Some(why));
        }
        self.unwind_block(&block);

        if block.kind == BlockKind::Loop && why == Why::Break {
            self.jump(block.handler);
            return Ok(None);
        }

        if why == Why::Exception
            && matches!(block.kind, BlockKind::Except | BlockKind::Finally)
        {
            self.push_block(BlockKind::ExceptHandler, 0);

            // The shadowed exception first, then the one being raised;
            // both as (tb, value, type) in stack order.
            let prior = scratch
                .current_exception
                .clone()
                .unwrap_or_else(ExcTriple::none);
            self.push(prior.tb);
            self.push(prior.value);
            self.push(prior.etype);

            let raised = scratch
                .take_last_exception()
                .ok_or_else(|| VmError::fault("exception unwinding with no pending exception"))?;
            self.push(raised.tb.clone());
            self.push(raised.value.clone());
            self.push(raised.etype.clone());
            scratch.current_exception = Some(raised);

            self.jump(block.handler);
            return Ok(None);
        }

        if block.kind == BlockKind::Finally {
            // 3.8 compiles return/continue paths to explicit CALL_FINALLY,
            // so only the exception arm above applies there.
            if self.code.version < PyVersion::Py38 {
                if matches!(why, Why::Return | Why::Continue) {
                    self.push(scratch.return_value.clone());
                }
                self.push(Value::UnwindToken(why));
                self.jump(block.handler);
                return Ok(None);
            }
        }

        Ok(Some(why))
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Clears an introspection attribute. Deletion never removes the
    /// slot itself, matching the frame attribute contract.
    pub fn clear_attr(&mut self, name: &str) -> VmResult<()> {
        match name {
            "f_trace" => self.trace = None,
            "f_trace_lines" => self.trace_lines = false,
            "f_trace_opcodes" => self.trace_opcodes = false,
            "f_back" => self.back = None,
            _ => {
                return Err(VmError::attribute_error(format!(
                    "cannot delete frame attribute '{name}'"
                )))
            }
        }
        Ok(())
    }
}

fn into_triple(mut values: Vec<Value>) -> (Value, Value, Value) {
    debug_assert_eq!(values.len(), 3);
    let etype = values.pop().unwrap_or(Value::None);
    let value = values.pop().unwrap_or(Value::None);
    let tb = values.pop().unwrap_or(Value::None);
    (tb, value, etype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CodeBuilder;
    use crate::object::exception::{ExcKind, ExceptionValue};

    fn test_frame() -> Frame {
        let code = Rc::new(CodeBuilder::new(PyVersion::Py36, "test").build());
        let ns = Rc::new(RefCell::new(Namespace::new()));
        Frame::new(code, ns.clone(), ns.clone(), &[], None, &ns).unwrap()
    }

    #[test]
    fn test_push_pop_roundtrip() {
        let mut frame = test_frame();
        frame.push(Value::from_i64(42));
        assert_eq!(frame.top().unwrap(), Value::from_i64(42));
        assert_eq!(frame.pop().unwrap(), Value::from_i64(42));
        assert!(frame.pop().is_err());
    }

    #[test]
    fn test_popn_orders_deepest_first() {
        let mut frame = test_frame();
        frame.push(Value::from_i64(1));
        frame.push(Value::from_i64(2));
        frame.push(Value::from_i64(3));
        let values = frame.popn(2).unwrap();
        assert_eq!(values, vec![Value::from_i64(2), Value::from_i64(3)]);
        assert_eq!(frame.stack.len(), 1);
    }

    #[test]
    fn test_block_push_pop_leaves_state() {
        let mut frame = test_frame();
        frame.push(Value::from_i64(1));
        let lasti = frame.lasti;
        frame.push_block(BlockKind::Loop, 10);
        let block = frame.pop_block().unwrap();
        assert_eq!(block.level, 1);
        assert_eq!(frame.stack.len(), 1);
        assert_eq!(frame.lasti, lasti);
    }

    #[test]
    fn test_unwind_block_restores_level() {
        let mut frame = test_frame();
        frame.push(Value::from_i64(1));
        frame.push_block(BlockKind::Loop, 10);
        frame.push(Value::from_i64(2));
        frame.push(Value::from_i64(3));
        let block = *frame.block_stack.last().unwrap();
        frame.unwind_block(&block);
        assert_eq!(frame.stack.len(), 1);
    }

    #[test]
    fn test_exception_unwinding_pushes_both_triples() {
        let mut frame = test_frame();
        let mut scratch = Scratch::default();
        frame.push_block(BlockKind::Except, 30);
        let exc = Rc::new(ExceptionValue::with_message(ExcKind::ValueError, "oops"));
        scratch.last_exception = Some(ExcTriple::from_exception(exc));

        let why = frame.manage_block_stack(Why::Exception, &mut scratch).unwrap();
        assert_eq!(why, None);
        assert_eq!(frame.lasti, 30);
        // Shadowed (None, None, None) plus the raised triple.
        assert_eq!(frame.stack.len(), 6);
        assert!(matches!(frame.stack[5], Value::ExcType(_)));
        assert!(scratch.last_exception.is_none());
        assert!(scratch.current_exception.is_some());
        assert_eq!(frame.block_stack.len(), 1);
        assert_eq!(frame.block_stack[0].kind, BlockKind::ExceptHandler);
    }

    #[test]
    fn test_break_unwinds_to_loop_handler() {
        let mut frame = test_frame();
        let mut scratch = Scratch::default();
        frame.push(Value::from_i64(9));
        frame.push_block(BlockKind::Loop, 44);
        frame.push(Value::from_i64(1));

        let why = frame.manage_block_stack(Why::Break, &mut scratch).unwrap();
        assert_eq!(why, None);
        assert_eq!(frame.lasti, 44);
        assert_eq!(frame.stack.len(), 1);
        assert!(frame.block_stack.is_empty());
    }

    #[test]
    fn test_finally_pushes_token_for_return() {
        let mut frame = test_frame();
        let mut scratch = Scratch::default();
        scratch.return_value = Value::from_i64(5);
        frame.push_block(BlockKind::Finally, 20);

        let why = frame.manage_block_stack(Why::Return, &mut scratch).unwrap();
        assert_eq!(why, None);
        assert_eq!(frame.lasti, 20);
        assert_eq!(frame.stack.len(), 2);
        assert_eq!(frame.stack[0], Value::from_i64(5));
        assert!(matches!(frame.stack[1], Value::UnwindToken(Why::Return)));
    }

    #[test]
    fn test_continue_keeps_loop_block() {
        let mut frame = test_frame();
        let mut scratch = Scratch::default();
        scratch.return_value = Value::from_i64(12);
        frame.push_block(BlockKind::Loop, 50);

        let why = frame.manage_block_stack(Why::Continue, &mut scratch).unwrap();
        assert_eq!(why, None);
        assert_eq!(frame.lasti, 12);
        assert_eq!(frame.block_stack.len(), 1);
    }

    #[test]
    fn test_attr_deletion_clears_without_removing() {
        let mut frame = test_frame();
        frame.trace_opcodes = true;
        frame.clear_attr("f_trace_opcodes").unwrap();
        assert!(!frame.trace_opcodes);
        // Clearing an already-clear slot is fine; unknown slots are not.
        frame.clear_attr("f_trace").unwrap();
        assert!(frame.clear_attr("f_code").is_err());
    }

    #[test]
    fn test_except_handler_restores_current_exception() {
        let mut frame = test_frame();
        let mut scratch = Scratch::default();
        frame.push_block(BlockKind::ExceptHandler, 0);
        // The shadowed triple (no prior exception).
        frame.push(Value::None);
        frame.push(Value::None);
        frame.push(Value::None);
        frame.push(Value::from_i64(7)); // junk above the triple

        let why = frame.manage_block_stack(Why::Return, &mut scratch).unwrap();
        assert_eq!(why, Some(Why::Return));
        assert!(frame.stack.is_empty());
        assert!(scratch.current_exception.is_none());
    }
}
