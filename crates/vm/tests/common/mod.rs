//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use pyrun_vm::version::PyVersion;
use pyrun_vm::vm::Vm;

/// A `Write` sink backed by a shared buffer, handed to the evaluator so
/// tests can assert on printed output.
pub struct SharedOutput(pub Rc<RefCell<Vec<u8>>>);

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// An evaluator whose stdout is captured into the returned buffer.
pub fn capture_vm(version: PyVersion) -> (Vm, Rc<RefCell<Vec<u8>>>) {
    let buffer = Rc::new(RefCell::new(Vec::new()));
    let sink = SharedOutput(buffer.clone());
    let vm = Vm::new(version).with_output(Rc::new(RefCell::new(sink)));
    (vm, buffer)
}

/// The captured output as a string.
pub fn output(buffer: &Rc<RefCell<Vec<u8>>>) -> String {
    String::from_utf8(buffer.borrow().clone()).expect("captured output is UTF-8")
}
