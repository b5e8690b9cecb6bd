//! Iterator objects
//!
//! An iterator is four objects: `start`, `is_done` and `get_val` are
//! functions called with `value` as their only argument. `start` resets the
//! state held in `value`, `is_done` returns a truthy object once exhausted
//! and `get_val` returns the next item.
//!
//! The builtin iterators (ranges, sequences, strings, maps) keep their state
//! in a small Array and are driven by native functions.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::gc::Heap;
use crate::runtime::function::NativeFn;
use crate::runtime::object::{Object, Trace};
use crate::value::ObjRef;

#[derive(Debug)]
pub struct IterObj {
    pub start: ObjRef,
    pub is_done: ObjRef,
    pub get_val: ObjRef,
    pub value: ObjRef,
}

impl Trace for IterObj {
    fn trace(&self, visit: &mut dyn FnMut(ObjRef)) {
        visit(self.start);
        visit(self.is_done);
        visit(self.get_val);
        visit(self.value);
    }
}

impl Heap {
    /// Create an iterator; all four references are transferred to it
    pub fn new_iter(
        &mut self,
        start: ObjRef,
        is_done: ObjRef,
        get_val: ObjRef,
        value: ObjRef,
    ) -> Result<ObjRef> {
        let ty = self.types().iter;
        self.alloc(
            ty,
            Object::Iter(IterObj {
                start,
                is_done,
                get_val,
                value,
            }),
        )
    }

    /// Copy of the iterator's four references (borrowed)
    pub fn iter_parts(&self, iter: ObjRef) -> Result<IterParts> {
        match self.get(iter) {
            Some(Object::Iter(it)) => Ok(IterParts {
                start: it.start,
                is_done: it.is_done,
                get_val: it.get_val,
                value: it.value,
            }),
            _ => Err(self.type_mismatch(self.types().iter, iter)),
        }
    }
}

/// Borrowed view of an iterator
#[derive(Debug, Clone, Copy)]
pub struct IterParts {
    pub start: ObjRef,
    pub is_done: ObjRef,
    pub get_val: ObjRef,
    pub value: ObjRef,
}

/// Build a native-driven iterator around an owned state object
pub(crate) fn native_iter(
    heap: &mut Heap,
    name: &str,
    funcs: [NativeFn; 3],
    state: ObjRef,
) -> Result<ObjRef> {
    let mut made = Vec::with_capacity(3);
    for func in funcs {
        match heap.new_native(name, func, 1) {
            Ok(r) => made.push(r),
            Err(e) => {
                for r in made {
                    heap.dec_ref(r);
                }
                heap.dec_ref(state);
                return Err(e);
            }
        }
    }
    heap.new_iter(made[0], made[1], made[2], state)
}

fn state_arg(args: &[ObjRef]) -> Result<ObjRef> {
    args.first()
        .copied()
        .ok_or_else(|| Error::wrong_arg_num(1, 0))
}

fn state_int(heap: &Heap, state: ObjRef, idx: i64) -> Result<i64> {
    let item = heap.seq_get(state, idx)?;
    heap.expect_int(item)
}

fn store_int(heap: &mut Heap, state: ObjRef, idx: i64, value: i64) -> Result<()> {
    let obj = heap.new_int(value)?;
    let result = heap.seq_set(state, idx, obj);
    heap.dec_ref(obj);
    result
}

/// Iterator over `start..stop` by `step`
pub fn new_range_iter(ctx: &mut Context, start: i64, stop: i64, step: i64) -> Result<ObjRef> {
    if step == 0 {
        return Err(Error::value_error("the step cannot be zero"));
    }
    let heap = &mut ctx.heap;
    let mut items = Vec::with_capacity(4);
    for value in [start, start, stop, step] {
        match heap.new_int(value) {
            Ok(r) => items.push(r),
            Err(e) => {
                for r in items {
                    heap.dec_ref(r);
                }
                return Err(e);
            }
        }
    }
    let state = heap.new_array(items)?;
    native_iter(heap, "range", [range_start, range_is_done, range_get_val], state)
}

fn range_start(ctx: &mut Context, args: &[ObjRef]) -> Result<ObjRef> {
    let state = state_arg(args)?;
    let start = state_int(&ctx.heap, state, 1)?;
    store_int(&mut ctx.heap, state, 0, start)?;
    Ok(ctx.heap.null())
}

fn range_is_done(ctx: &mut Context, args: &[ObjRef]) -> Result<ObjRef> {
    let state = state_arg(args)?;
    let idx = state_int(&ctx.heap, state, 0)?;
    let stop = state_int(&ctx.heap, state, 2)?;
    let step = state_int(&ctx.heap, state, 3)?;
    let done = if step > 0 { idx >= stop } else { idx <= stop };
    Ok(ctx.heap.bool_obj(done))
}

fn range_get_val(ctx: &mut Context, args: &[ObjRef]) -> Result<ObjRef> {
    let state = state_arg(args)?;
    let idx = state_int(&ctx.heap, state, 0)?;
    let step = state_int(&ctx.heap, state, 3)?;
    store_int(&mut ctx.heap, state, 0, idx.wrapping_add(step))?;
    ctx.heap.new_int(idx)
}

/// Iterator over the items of an Array or Vector (borrowed)
pub fn new_seq_iter(ctx: &mut Context, seq: ObjRef) -> Result<ObjRef> {
    let heap = &mut ctx.heap;
    heap.expect_seq(seq)?;
    let idx = heap.new_int(0)?;
    let seq = heap.inc_ref(seq);
    let state = heap.new_array(vec![idx, seq])?;
    native_iter(heap, "sequence", [seq_start, seq_is_done, seq_get_val], state)
}

fn seq_start(ctx: &mut Context, args: &[ObjRef]) -> Result<ObjRef> {
    let state = state_arg(args)?;
    store_int(&mut ctx.heap, state, 0, 0)?;
    Ok(ctx.heap.null())
}

fn seq_is_done(ctx: &mut Context, args: &[ObjRef]) -> Result<ObjRef> {
    let state = state_arg(args)?;
    let idx = state_int(&ctx.heap, state, 0)?;
    let seq = ctx.heap.seq_get(state, 1)?;
    let len = ctx.heap.seq_len(seq)? as i64;
    Ok(ctx.heap.bool_obj(idx >= len))
}

fn seq_get_val(ctx: &mut Context, args: &[ObjRef]) -> Result<ObjRef> {
    let state = state_arg(args)?;
    let idx = state_int(&ctx.heap, state, 0)?;
    let seq = ctx.heap.seq_get(state, 1)?;
    let item = ctx.heap.seq_get(seq, idx)?;
    let item = ctx.heap.inc_ref(item);
    if let Err(e) = store_int(&mut ctx.heap, state, 0, idx + 1) {
        ctx.heap.dec_ref(item);
        return Err(e);
    }
    Ok(item)
}

/// Iterator over the characters of a Str (borrowed)
pub fn new_str_iter(ctx: &mut Context, s: ObjRef) -> Result<ObjRef> {
    let heap = &mut ctx.heap;
    heap.expect_str(s)?;
    let idx = heap.new_int(0)?;
    let s = heap.inc_ref(s);
    let state = heap.new_array(vec![idx, s])?;
    native_iter(heap, "string", [seq_start, str_is_done, str_get_val], state)
}

fn str_is_done(ctx: &mut Context, args: &[ObjRef]) -> Result<ObjRef> {
    let state = state_arg(args)?;
    let idx = state_int(&ctx.heap, state, 0)?;
    let s = ctx.heap.seq_get(state, 1)?;
    let len = ctx.heap.expect_str(s)?.len() as i64;
    Ok(ctx.heap.bool_obj(idx >= len))
}

fn str_get_val(ctx: &mut Context, args: &[ObjRef]) -> Result<ObjRef> {
    let state = state_arg(args)?;
    let idx = state_int(&ctx.heap, state, 0)?;
    let s = ctx.heap.seq_get(state, 1)?;
    // the index is a byte offset that always sits on a char boundary
    let ch = ctx
        .heap
        .expect_str(s)?
        .get(idx as usize..)
        .and_then(|rest| rest.chars().next())
        .ok_or_else(|| Error::value_error("the iterator is exhausted"))?;
    store_int(&mut ctx.heap, state, 0, idx + ch.len_utf8() as i64)?;
    ctx.heap.new_str(ch.to_string())
}

/// Iterator over `{key, value}` pairs of a Map, snapshotted at creation
pub fn new_map_iter(ctx: &mut Context, map: ObjRef) -> Result<ObjRef> {
    let entries = ctx.heap.map_entries(map)?;
    let mut pairs = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let key = ctx.heap.inc_ref(key);
        let value = ctx.heap.inc_ref(value);
        match ctx.heap.new_array(vec![key, value]) {
            Ok(pair) => pairs.push(pair),
            Err(e) => {
                for p in pairs {
                    ctx.heap.dec_ref(p);
                }
                return Err(e);
            }
        }
    }
    let snapshot = ctx.heap.new_array(pairs)?;
    let result = new_seq_iter(ctx, snapshot);
    ctx.heap.dec_ref(snapshot);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn drain(ctx: &mut Context, iter: ObjRef) -> Vec<String> {
        let parts = ctx.heap.iter_parts(iter).unwrap();
        let mut out = Vec::new();
        let r = ctx.call_function(parts.start, &[parts.value]).unwrap();
        ctx.heap.dec_ref(r);
        loop {
            let done = ctx.call_function(parts.is_done, &[parts.value]).unwrap();
            let finished = ctx.heap.truthy(done);
            ctx.heap.dec_ref(done);
            if finished {
                break;
            }
            let item = ctx.call_function(parts.get_val, &[parts.value]).unwrap();
            out.push(ctx.heap.display(item));
            ctx.heap.dec_ref(item);
        }
        out
    }

    #[test]
    fn test_range_iter() {
        let mut ctx = Context::new(Config::default()).unwrap();
        let it = new_range_iter(&mut ctx, 0, 5, 2).unwrap();
        assert_eq!(drain(&mut ctx, it), ["0", "2", "4"]);
        let down = new_range_iter(&mut ctx, 3, 0, -1).unwrap();
        assert_eq!(drain(&mut ctx, down), ["3", "2", "1"]);
        // restartable
        assert_eq!(drain(&mut ctx, down), ["3", "2", "1"]);
    }

    #[test]
    fn test_range_zero_step() {
        let mut ctx = Context::new(Config::default()).unwrap();
        let err = new_range_iter(&mut ctx, 0, 5, 0).unwrap_err();
        assert!(err.is(crate::ErrorKind::Value));
    }

    #[test]
    fn test_str_iter_unicode() {
        let mut ctx = Context::new(Config::default()).unwrap();
        let s = ctx.heap.new_str("aé€").unwrap();
        let it = new_str_iter(&mut ctx, s).unwrap();
        assert_eq!(drain(&mut ctx, it), ["a", "é", "€"]);
    }

    #[test]
    fn test_map_iter_pairs() {
        let mut ctx = Context::new(Config::default()).unwrap();
        let map = ctx.heap.new_map().unwrap();
        let one = ctx.heap.new_int(1).unwrap();
        ctx.heap.map_set_str(map, "a", one).unwrap();
        ctx.heap.map_set_str(map, "b", one).unwrap();
        let it = new_map_iter(&mut ctx, map).unwrap();
        assert_eq!(drain(&mut ctx, it), ["{'a', 1}", "{'b', 1}"]);
    }
}
