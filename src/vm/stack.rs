//! Runtime stacks
//!
//! Three stacks drive execution:
//! - the value stack holds operands and a `None` sentinel at every call
//!   boundary
//! - the call stack holds one [`Frame`] per active bytecode call
//! - the catch stack holds one [`CatchFrame`] per active `try` region
//!
//! All three double when full and halve when at most a quarter full, never
//! going below their minimum capacity.

use std::path::Path;
use std::rc::Rc;

use crate::error::{Error, Result, Span};
use crate::gc::Heap;
use crate::value::ObjRef;
use crate::vm::var_table::VarTable;

pub const VALUE_STACK_MIN: usize = 32;
pub const CALL_STACK_MIN: usize = 125;
pub const CATCH_STACK_MIN: usize = 4;

/// Maximum number of nested calls
pub const MAX_CALL_DEPTH: usize = 1000;

/// Vector with the shared grow/shrink policy
#[derive(Debug)]
struct RuntimeStack<T> {
    items: Vec<T>,
    cap: usize,
    min: usize,
}

impl<T> RuntimeStack<T> {
    fn new(min: usize) -> Self {
        RuntimeStack {
            items: Vec::with_capacity(min),
            cap: min,
            min,
        }
    }

    fn push(&mut self, item: T) {
        if self.items.len() == self.cap {
            self.cap *= 2;
            self.items.reserve(self.cap - self.items.len());
        }
        self.items.push(item);
    }

    fn pop(&mut self) -> Option<T> {
        let item = self.items.pop();
        self.shrink();
        item
    }

    fn shrink(&mut self) {
        if self.cap <= self.min || self.cap / 4 < self.items.len() {
            return;
        }
        self.cap /= 2;
        self.items.shrink_to(self.cap);
    }
}

/// Operand stack; `None` entries are call sentinels
#[derive(Debug)]
pub struct ValueStack {
    inner: RuntimeStack<Option<ObjRef>>,
}

impl Default for ValueStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueStack {
    pub fn new() -> Self {
        ValueStack {
            inner: RuntimeStack::new(VALUE_STACK_MIN),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.items.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.cap
    }

    /// Push a borrowed reference
    #[inline]
    pub fn push(&mut self, heap: &mut Heap, r: ObjRef) {
        heap.inc_ref(r);
        self.inner.push(Some(r));
    }

    /// Push an owned reference
    #[inline]
    pub fn push_owned(&mut self, r: ObjRef) {
        self.inner.push(Some(r));
    }

    #[inline]
    pub fn push_sentinel(&mut self) {
        self.inner.push(None);
    }

    /// Pop the top value, transferring it to the caller. A sentinel or an
    /// empty stack yields `None`.
    #[inline]
    pub fn pop(&mut self) -> Option<ObjRef> {
        self.inner.pop().flatten()
    }

    /// Borrowed top value
    #[inline]
    pub fn peek(&self) -> Option<ObjRef> {
        self.inner.items.last().copied().flatten()
    }

    /// Borrowed value `offset` entries below the top
    pub fn peek_at(&self, offset: usize) -> Option<ObjRef> {
        let len = self.len();
        if offset >= len {
            return None;
        }
        self.inner.items[len - 1 - offset]
    }

    /// Duplicate the top value
    pub fn dup(&mut self, heap: &mut Heap) -> Option<()> {
        let top = self.peek()?;
        self.push(heap, top);
        Some(())
    }

    /// Number of values above the nearest sentinel
    pub fn frame_len(&self) -> usize {
        let items = &self.inner.items;
        match items.iter().rposition(Option::is_none) {
            Some(pos) => items.len() - pos - 1,
            None => items.len(),
        }
    }

    /// Move the top value `n - 1` positions down. Fails when fewer than `n`
    /// values sit above the nearest sentinel.
    pub fn rot(&mut self, n: usize) -> Option<()> {
        if n > self.frame_len() {
            return None;
        }
        if n >= 2 {
            let len = self.len();
            self.inner.items[len - n..].rotate_right(1);
        }
        Some(())
    }

    /// Drop values down to and including the nearest sentinel
    pub fn drain_frame(&mut self, heap: &mut Heap) {
        while let Some(entry) = self.inner.items.pop() {
            match entry {
                Some(r) => heap.dec_ref(r),
                None => break,
            }
        }
        self.inner.shrink();
    }

    /// Drop values until `len` entries remain
    pub fn truncate(&mut self, heap: &mut Heap, len: usize) {
        while self.len() > len {
            if let Some(Some(r)) = self.inner.items.pop() {
                heap.dec_ref(r);
            }
        }
        self.inner.shrink();
    }

    /// Remove the values above the nearest sentinel and the sentinel itself;
    /// the values are returned bottom first and owned by the caller
    pub fn take_frame(&mut self) -> Vec<ObjRef> {
        let items = &mut self.inner.items;
        let start = items.iter().rposition(Option::is_none);
        let segment: Vec<ObjRef> = match start {
            Some(pos) => items.drain(pos + 1..).flatten().collect(),
            None => items.drain(..).flatten().collect(),
        };
        if start.is_some() {
            items.pop();
        }
        self.inner.shrink();
        segment
    }

    /// Release every value
    pub fn clear(&mut self, heap: &mut Heap) {
        self.truncate(heap, 0);
    }
}

/// An active bytecode call
#[derive(Debug)]
pub struct Frame {
    /// Callee (owned)
    pub func: ObjRef,
    /// Call site
    pub span: Span,
    /// Working directory of the caller
    pub cwd: Rc<Path>,
    /// Variable table of the caller; `None` when the callee runs in it
    pub caller_vt: Option<VarTable>,
    /// Instruction index the caller resumes at
    pub resume: usize,
    /// Catch stack depth when the call was made
    pub catch_len: usize,
}

/// Frames of the active bytecode calls
#[derive(Debug)]
pub struct CallStack {
    frames: RuntimeStack<Frame>,
    max_depth: usize,
}

impl CallStack {
    pub fn new(max_depth: usize) -> Self {
        CallStack {
            frames: RuntimeStack::new(CALL_STACK_MIN.min(max_depth.max(1))),
            max_depth,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.items.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Fail with a Call error when no further frame fits
    pub fn check_depth(&self) -> Result<()> {
        if self.len() >= self.max_depth {
            return Err(Error::call_error(format!(
                "the maximum call stack size ({} calls) was exceeded",
                self.max_depth
            )));
        }
        Ok(())
    }

    /// Push a frame, taking a new reference to its function. The depth is
    /// checked with [`check_depth`](Self::check_depth) beforehand.
    pub fn push(&mut self, heap: &mut Heap, frame: Frame) {
        heap.inc_ref(frame.func);
        self.frames.push(frame);
    }

    /// Pop the top frame; its function reference moves to the caller
    #[inline]
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    #[inline]
    pub fn peek(&self) -> Option<&Frame> {
        self.frames.items.last()
    }

    /// Function of the top frame
    #[inline]
    pub fn top_func(&self) -> Option<ObjRef> {
        self.peek().map(|f| f.func)
    }
}

/// A registered error handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CatchFrame {
    /// Value stack length to restore
    pub v_len: usize,
    /// Call stack depth to unwind to
    pub f_len: usize,
    /// Instruction to resume at; `None` when no handler is registered
    pub resume: Option<usize>,
}

#[derive(Debug)]
pub struct CatchStack {
    frames: RuntimeStack<CatchFrame>,
}

impl Default for CatchStack {
    fn default() -> Self {
        Self::new()
    }
}

impl CatchStack {
    pub fn new() -> Self {
        CatchStack {
            frames: RuntimeStack::new(CATCH_STACK_MIN),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.items.is_empty()
    }

    pub fn push(&mut self, frame: CatchFrame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<CatchFrame> {
        self.frames.pop()
    }

    /// Innermost frame, or the empty handler `(0, 0, None)`
    pub fn peek(&self) -> CatchFrame {
        self.frames.items.last().copied().unwrap_or_default()
    }

    /// Drop frames until `len` remain
    pub fn truncate(&mut self, len: usize) {
        while self.len() > len {
            self.frames.pop();
        }
    }

    pub fn extend(&mut self, frames: impl IntoIterator<Item = CatchFrame>) {
        for frame in frames {
            self.frames.push(frame);
        }
    }

    /// Remove and return the frames above `len`, bottom first
    pub fn split_off(&mut self, len: usize) -> Vec<CatchFrame> {
        let mut taken = Vec::new();
        while self.len() > len {
            if let Some(frame) = self.frames.pop() {
                taken.push(frame);
            }
        }
        taken.reverse();
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;

    fn heap() -> Heap {
        Heap::new(HeapConfig::default()).unwrap()
    }

    #[test]
    fn test_value_stack_refcounts() {
        let mut heap = heap();
        let mut stack = ValueStack::new();
        let s = heap.new_str("x").unwrap();

        stack.push(&mut heap, s);
        stack.dup(&mut heap).unwrap();
        assert_eq!(heap.ref_count(s), 3);

        let top = stack.pop().unwrap();
        heap.dec_ref(top);
        stack.clear(&mut heap);
        assert_eq!(heap.ref_count(s), 1);
    }

    #[test]
    fn test_value_stack_sentinel() {
        let mut heap = heap();
        let mut stack = ValueStack::new();
        let a = heap.new_int(1).unwrap();
        let b = heap.new_int(2).unwrap();
        stack.push(&mut heap, a);
        stack.push_sentinel();
        assert_eq!(stack.peek(), None);
        stack.push(&mut heap, b);
        stack.push(&mut heap, b);

        stack.drain_frame(&mut heap);
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.peek(), Some(a));
        assert_eq!(heap.ref_count(b), 1);
    }

    #[test]
    fn test_take_frame() {
        let mut heap = heap();
        let mut stack = ValueStack::new();
        let items: Vec<_> = (0..3).map(|i| heap.new_int(i).unwrap()).collect();
        stack.push_owned(items[0]);
        stack.push_sentinel();
        stack.push_owned(items[1]);
        stack.push_owned(items[2]);

        let segment = stack.take_frame();
        assert_eq!(segment, vec![items[1], items[2]]);
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_rot() {
        let mut heap = heap();
        let mut stack = ValueStack::new();
        let items: Vec<_> = (0..3).map(|i| heap.new_int(i).unwrap()).collect();
        for &r in &items {
            stack.push_owned(r);
        }
        stack.rot(3).unwrap();
        assert_eq!(stack.peek_at(0), Some(items[1]));
        assert_eq!(stack.peek_at(1), Some(items[0]));
        assert_eq!(stack.peek_at(2), Some(items[2]));
    }

    #[test]
    fn test_rot_stops_at_sentinel() {
        let mut heap = heap();
        let mut stack = ValueStack::new();
        let below = heap.new_int(0).unwrap();
        stack.push_owned(below);
        stack.push_sentinel();
        let a = heap.new_int(1).unwrap();
        let b = heap.new_int(2).unwrap();
        stack.push_owned(a);
        stack.push_owned(b);
        assert_eq!(stack.frame_len(), 2);

        assert!(stack.rot(3).is_none());
        assert_eq!(stack.peek_at(0), Some(b));
        assert_eq!(stack.peek_at(1), Some(a));
        assert_eq!(stack.peek_at(2), None);

        stack.rot(2).unwrap();
        assert_eq!(stack.peek_at(0), Some(a));
        assert_eq!(stack.peek_at(1), Some(b));
        stack.clear(&mut heap);
    }

    #[test]
    fn test_value_stack_capacity() {
        let mut heap = heap();
        let mut stack = ValueStack::new();
        let n = heap.null();
        for _ in 0..40 {
            stack.push(&mut heap, n);
        }
        assert_eq!(stack.capacity(), 64);
        stack.truncate(&mut heap, 10);
        assert_eq!(stack.capacity(), 32);
        stack.clear(&mut heap);
        heap.dec_ref(n);
    }

    #[test]
    fn test_call_depth_limit() {
        let mut heap = heap();
        let mut calls = CallStack::new(2);
        let func = heap.new_map().unwrap();
        let frame = || Frame {
            func,
            span: Span::none(),
            cwd: Rc::from(Path::new(".")),
            caller_vt: None,
            resume: 0,
            catch_len: 0,
        };
        for _ in 0..2 {
            calls.check_depth().unwrap();
            calls.push(&mut heap, frame());
        }
        let err = calls.check_depth().unwrap_err();
        assert!(err.is(crate::ErrorKind::Call));
        assert_eq!(
            err.message,
            "the maximum call stack size (2 calls) was exceeded"
        );
        assert_eq!(heap.ref_count(func), 3);
        while let Some(f) = calls.pop() {
            heap.dec_ref(f.func);
        }
        assert!(calls.pop().is_none());
        assert_eq!(heap.ref_count(func), 1);
    }

    #[test]
    fn test_catch_stack() {
        let mut catches = CatchStack::new();
        assert_eq!(catches.peek(), CatchFrame::default());
        assert_eq!(catches.peek().resume, None);
        for i in 0..3 {
            catches.push(CatchFrame {
                v_len: i,
                f_len: i,
                resume: Some(i * 10),
            });
        }
        let taken = catches.split_off(1);
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].resume, Some(10));
        assert_eq!(catches.peek().resume, Some(0));
    }
}
