//! Arrays and vectors
//!
//! Both are backed by the same payload; an Array has a fixed length while a
//! Vector grows by a factor of 1.8 and shrinks when at most a quarter full.
//! Indices may be negative and then count from the end.

use crate::error::{Error, Result};
use crate::gc::Heap;
use crate::runtime::object::{Object, Trace};
use crate::value::ObjRef;

/// Vector growth ratio
pub const VECTOR_GROWTH_RATIO: f64 = 1.8;
/// Minimum vector capacity
pub const VECTOR_MIN_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqKind {
    Array,
    Vector,
}

#[derive(Debug)]
pub struct SeqObj {
    pub kind: SeqKind,
    pub items: Vec<ObjRef>,
    /// Logical capacity following the growth policy
    cap: usize,
}

impl SeqObj {
    pub fn array(items: Vec<ObjRef>) -> Self {
        let cap = items.len();
        SeqObj {
            kind: SeqKind::Array,
            items,
            cap,
        }
    }

    pub fn vector(items: Vec<ObjRef>) -> Self {
        let cap = items.len().max(VECTOR_MIN_SIZE);
        let mut items = items;
        items.reserve(cap - items.len());
        SeqObj {
            kind: SeqKind::Vector,
            items,
            cap,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Resolve a possibly negative index
    pub fn normalize_index(&self, idx: i64) -> Option<usize> {
        let len = self.items.len() as i64;
        let idx = if idx < 0 { idx + len } else { idx };
        if (0..len).contains(&idx) {
            Some(idx as usize)
        } else {
            None
        }
    }

    fn grow_for_push(&mut self) {
        if self.items.len() < self.cap {
            return;
        }
        let new_cap = ((self.cap as f64 * VECTOR_GROWTH_RATIO) as usize).max(VECTOR_MIN_SIZE);
        self.items.reserve(new_cap - self.items.len());
        self.cap = new_cap;
    }

    fn shrink_after_pop(&mut self) {
        if self.cap <= VECTOR_MIN_SIZE || self.items.len() > self.cap / 4 {
            return;
        }
        let new_cap = ((self.cap as f64 / VECTOR_GROWTH_RATIO) as usize).max(VECTOR_MIN_SIZE);
        self.items.shrink_to(new_cap);
        self.cap = new_cap;
    }
}

impl Trace for SeqObj {
    fn trace(&self, visit: &mut dyn FnMut(ObjRef)) {
        for &item in &self.items {
            visit(item);
        }
    }
}

fn index_error(kind: SeqKind, idx: i64, len: usize) -> Error {
    let name = match kind {
        SeqKind::Array => "Array",
        SeqKind::Vector => "Vector",
    };
    Error::value_error(format!(
        "index {} out of bounds for '{}' of size {}",
        idx, name, len
    ))
}

impl Heap {
    /// Create an Array owning `items`
    pub fn new_array(&mut self, items: Vec<ObjRef>) -> Result<ObjRef> {
        let ty = self.types().array;
        self.alloc(ty, Object::Seq(SeqObj::array(items)))
    }

    /// Create a Vector owning `items`
    pub fn new_vector(&mut self, items: Vec<ObjRef>) -> Result<ObjRef> {
        let ty = self.types().vector;
        self.alloc(ty, Object::Seq(SeqObj::vector(items)))
    }

    /// Array of `len` copies of a borrowed value
    pub fn new_array_filled(&mut self, len: usize, value: ObjRef) -> Result<ObjRef> {
        let items = self.repeat_owned(len, value);
        self.new_array(items)
    }

    pub fn new_vector_filled(&mut self, len: usize, value: ObjRef) -> Result<ObjRef> {
        let items = self.repeat_owned(len, value);
        self.new_vector(items)
    }

    fn repeat_owned(&mut self, len: usize, value: ObjRef) -> Vec<ObjRef> {
        (0..len).map(|_| self.inc_ref(value)).collect()
    }

    fn seq_mut(&mut self, seq: ObjRef) -> Result<&mut SeqObj> {
        match self.get_mut(seq) {
            Some(Object::Seq(s)) => Ok(s),
            _ => Err(Error::type_error("expected type 'Array' or 'Vector'")),
        }
    }

    /// Borrowed item at `idx`
    pub fn seq_get(&self, seq: ObjRef, idx: i64) -> Result<ObjRef> {
        let s = self.expect_seq(seq)?;
        s.normalize_index(idx)
            .map(|i| s.items[i])
            .ok_or_else(|| index_error(s.kind, idx, s.len()))
    }

    /// Replace the item at `idx` with a borrowed value
    pub fn seq_set(&mut self, seq: ObjRef, idx: i64, value: ObjRef) -> Result<()> {
        self.expect_seq(seq)?;
        self.inc_ref(value);
        let s = self.seq_mut(seq)?;
        let Some(i) = s.normalize_index(idx) else {
            let err = index_error(s.kind, idx, s.len());
            self.dec_ref(value);
            return Err(err);
        };
        let old = std::mem::replace(&mut s.items[i], value);
        self.dec_ref(old);
        Ok(())
    }

    /// Append a borrowed value to a Vector
    pub fn vector_push(&mut self, vector: ObjRef, value: ObjRef) -> Result<()> {
        let s = self.seq_mut(vector)?;
        if s.kind != SeqKind::Vector {
            return Err(Error::type_error("cannot append to an 'Array'"));
        }
        s.grow_for_push();
        s.items.push(value);
        self.inc_ref(value);
        Ok(())
    }

    /// Remove the last item of a Vector; the result is owned
    pub fn vector_pop(&mut self, vector: ObjRef) -> Result<Option<ObjRef>> {
        let s = self.seq_mut(vector)?;
        if s.kind != SeqKind::Vector {
            return Err(Error::type_error("cannot pop from an 'Array'"));
        }
        let item = s.items.pop();
        s.shrink_after_pop();
        Ok(item)
    }

    pub fn seq_len(&self, seq: ObjRef) -> Result<usize> {
        Ok(self.expect_seq(seq)?.len())
    }

    /// Borrowed copy of the items
    pub fn seq_items(&self, seq: ObjRef) -> Result<Vec<ObjRef>> {
        Ok(self.expect_seq(seq)?.items.clone())
    }
}
