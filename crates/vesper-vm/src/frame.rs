//! Call frames and their local storage.

use std::cell::RefCell;
use std::rc::Rc;

use vesper_bytecode::Code;

use crate::value::{Closure, Value};

/// Locals live inline for small frames and spill to the heap past
/// [`INLINE_SLOTS`]; spilled frames reserve [`HEAP_RESERVE`] slots to
/// dampen reallocation churn.
pub const INLINE_SLOTS: usize = 8;
pub const HEAP_RESERVE: usize = 32;

/// Small-vector storage for a frame's local variables.
#[derive(Debug)]
pub enum Locals {
    Inline {
        slots: [Value; INLINE_SLOTS],
        len: usize,
    },
    Heap(Vec<Value>),
}

impl Locals {
    pub fn with_len(len: usize) -> Self {
        if len <= INLINE_SLOTS {
            Locals::Inline {
                slots: std::array::from_fn(|_| Value::Nil),
                len,
            }
        } else {
            let mut slots = Vec::with_capacity(len.max(HEAP_RESERVE));
            slots.resize(len, Value::Nil);
            Locals::Heap(slots)
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Locals::Inline { len, .. } => *len,
            Locals::Heap(slots) => slots.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> &Value {
        match self {
            Locals::Inline { slots, .. } => &slots[index],
            Locals::Heap(slots) => &slots[index],
        }
    }

    pub fn set(&mut self, index: usize, value: Value) {
        match self {
            Locals::Inline { slots, .. } => slots[index] = value,
            Locals::Heap(slots) => slots[index] = value,
        }
    }
}

/// One active function invocation.
#[derive(Debug)]
pub struct Frame {
    /// Next instruction word to execute.
    pub ip: usize,
    pub code: Rc<Code>,
    pub locals: Locals,
    /// The invoked closure; `None` for the main frame.
    pub closure: Option<Rc<Closure>>,
    /// Value-stack height at activation, restored on return.
    pub base_sp: usize,
    /// Caller instruction pointer at the call site, kept for stack
    /// traces even after control returns to the host.
    pub call_ip: usize,
    /// Return control to the host instead of a caller frame (the stop
    /// sentinel for host-initiated calls).
    pub host_entry: bool,
}

impl Frame {
    pub fn new(
        code: Rc<Code>,
        base_sp: usize,
        call_ip: usize,
        host_entry: bool,
        closure: Option<Rc<Closure>>,
    ) -> Self {
        let locals = Locals::with_len(code.local_count);
        Self {
            ip: 0,
            code,
            locals,
            closure,
            base_sp,
            call_ip,
            host_entry,
        }
    }

    /// Read the instruction word at `ip` and advance.
    pub fn read_word(&mut self) -> u16 {
        let word = self.code.instructions[self.ip];
        self.ip += 1;
        word
    }

    pub fn at_end(&self) -> bool {
        self.ip >= self.code.instructions.len()
    }

    /// Read a local, looking through an in-slot cell.
    pub fn load_local(&self, index: usize) -> Value {
        match self.locals.get(index) {
            Value::Cell(cell) => cell.borrow().clone(),
            value => value.clone(),
        }
    }

    /// Write a local, writing through an in-slot cell so closures sharing
    /// the variable observe the update.
    pub fn store_local(&mut self, index: usize, value: Value) {
        if let Value::Cell(cell) = self.locals.get(index) {
            *cell.borrow_mut() = value;
            return;
        }
        self.locals.set(index, value);
    }

    /// Promote a local slot into a shared cell. The slot itself holds the
    /// cell afterward, so the frame and every closure created from the
    /// cell alias the same storage. Promotion is sticky.
    pub fn promote_local(&mut self, index: usize) -> Rc<RefCell<Value>> {
        if let Value::Cell(cell) = self.locals.get(index) {
            return cell.clone();
        }
        let current = self.locals.get(index).clone();
        let cell = Rc::new(RefCell::new(current));
        self.locals.set(index, Value::Cell(cell.clone()));
        cell
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locals_inline_and_heap() {
        let small = Locals::with_len(3);
        assert!(matches!(small, Locals::Inline { .. }));
        assert_eq!(small.len(), 3);

        let large = Locals::with_len(9);
        assert!(matches!(large, Locals::Heap(_)));
        assert_eq!(large.len(), 9);
        if let Locals::Heap(slots) = &large {
            assert!(slots.capacity() >= HEAP_RESERVE);
        }
    }

    #[test]
    fn test_locals_get_set() {
        let mut locals = Locals::with_len(2);
        locals.set(1, Value::Int(7));
        assert!(locals.get(1).equals(&Value::Int(7)));
        assert!(locals.get(0).is_nil());
    }

    fn frame_with_locals(count: usize) -> Frame {
        let builder = vesper_bytecode::CodeBuilder::new(
            "test".to_string(),
            String::new(),
            false,
            "".into(),
            "".into(),
        );
        let code = builder.into_code(count, 0, vec![], vec![]);
        Frame::new(code, 0, 0, true, None)
    }

    #[test]
    fn test_cell_promotion_aliases_slot() {
        let mut frame = frame_with_locals(1);
        frame.store_local(0, Value::Int(1));

        let cell = frame.promote_local(0);
        // Writes through the frame are visible through the cell.
        frame.store_local(0, Value::Int(2));
        assert!(cell.borrow().equals(&Value::Int(2)));

        // Writes through the cell are visible through the frame.
        *cell.borrow_mut() = Value::Int(3);
        assert!(frame.load_local(0).equals(&Value::Int(3)));
    }

    #[test]
    fn test_promotion_is_sticky() {
        let mut frame = frame_with_locals(1);
        let first = frame.promote_local(0);
        let second = frame.promote_local(0);
        assert!(Rc::ptr_eq(&first, &second));
    }
}
