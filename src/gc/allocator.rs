//! Object arena
//!
//! Objects live in a vector of slots addressed by [`ObjRef`]. A slot holds
//! the object [`Header`] and the payload; a vacant slot has no payload.
//!
//! ```text
//! slots:  [ Type | Null | Bool | ... | Map #42 | <vacant> | Str #44 | ... ]
//!                                                  ^
//!          free_slots / type pools --------------'
//! ```
//!
//! When an instance is freed its slot is pushed onto its type's pool, up to
//! `pool_cap` entries, so that the next allocation of the same type can reuse
//! it. Otherwise the slot goes back to the shared free list.

use tracing::debug;

use crate::config::HeapConfig;
use crate::error::{Error, Result};
use crate::gc::Collector;
use crate::runtime::object::{Consts, Destructor, Object, Trace, TypeObj, Types};
use crate::value::{Header, ObjFlags, ObjRef};

/// Arena slot
pub(crate) struct Slot {
    pub(crate) header: Header,
    pub(crate) object: Option<Object>,
}

impl Slot {
    fn vacant() -> Self {
        Slot {
            header: Header::vacant(),
            object: None,
        }
    }
}

/// Allocation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Objects allocated since start-up
    pub allocated: usize,
    /// Allocations served from a type pool
    pub recycled: usize,
    /// Destructor runs
    pub destroyed: usize,
    /// Slots released
    pub freed: usize,
    /// Objects currently alive
    pub live: usize,
}

/// The object heap
pub struct Heap {
    pub(crate) slots: Vec<Slot>,
    free_slots: Vec<u32>,
    pub(crate) gc: Collector,
    config: HeapConfig,
    stats: HeapStats,
    types: Types,
    consts: Consts,
}

impl Heap {
    /// Create a heap with the builtin types and constants
    pub fn new(config: HeapConfig) -> Result<Self> {
        let self_type = ObjRef::from_index(0);
        let mut heap = Heap {
            slots: Vec::with_capacity(64),
            free_slots: Vec::new(),
            gc: Collector::new(),
            config,
            stats: HeapStats::default(),
            types: Types::bootstrap(self_type),
            consts: Consts::bootstrap(self_type),
        };

        // The type of `Type` is itself and it never owns a reference to itself.
        heap.slots.push(Slot {
            header: Header::new(self_type, false),
            object: Some(Object::Type(TypeObj::new("Type", false, None))),
        });
        heap.stats.allocated = 1;
        heap.stats.live = 1;

        heap.types.null = heap.new_type("Null", false, None)?;
        heap.types.bool = heap.new_type("Bool", false, None)?;
        heap.types.int = heap.new_type("Int", false, None)?;
        heap.types.real = heap.new_type("Real", false, None)?;
        heap.types.str = heap.new_type("Str", false, None)?;
        heap.types.array = heap.new_type("Array", true, None)?;
        heap.types.vector = heap.new_type("Vector", true, None)?;
        heap.types.map = heap.new_type("Map", true, None)?;
        heap.types.func = heap.new_type("Func", true, None)?;
        heap.types.iter = heap.new_type("Iter", true, None)?;
        heap.types.coroutine = heap.new_type(
            "Coroutine",
            true,
            Some(crate::vm::coroutine::destroy_coroutine),
        )?;

        heap.consts.null = heap.alloc(heap.types.null, Object::Null)?;
        heap.consts.bool_true = heap.alloc(heap.types.bool, Object::Bool(true))?;
        heap.consts.bool_false = heap.alloc(heap.types.bool, Object::Bool(false))?;

        debug!(objects = heap.stats.live, "heap initialised");
        Ok(heap)
    }

    /// Builtin type objects
    #[inline]
    pub fn types(&self) -> &Types {
        &self.types
    }

    /// Shared constants, borrowed
    #[inline]
    pub fn consts(&self) -> &Consts {
        &self.consts
    }

    #[inline]
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    #[inline]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Payload of a live object
    #[inline]
    pub fn get(&self, r: ObjRef) -> Option<&Object> {
        self.slots.get(r.index()).and_then(|s| s.object.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, r: ObjRef) -> Option<&mut Object> {
        self.slots.get_mut(r.index()).and_then(|s| s.object.as_mut())
    }

    #[inline]
    pub fn header(&self, r: ObjRef) -> &Header {
        &self.slots[r.index()].header
    }

    #[inline]
    pub(crate) fn header_mut(&mut self, r: ObjRef) -> &mut Header {
        &mut self.slots[r.index()].header
    }

    #[inline]
    pub fn ref_count(&self, r: ObjRef) -> u32 {
        self.header(r).ref_count
    }

    /// Type object of an instance
    #[inline]
    pub fn type_of(&self, r: ObjRef) -> ObjRef {
        self.header(r).ty
    }

    pub(crate) fn type_obj(&self, ty: ObjRef) -> Option<&TypeObj> {
        match self.get(ty) {
            Some(Object::Type(t)) => Some(t),
            _ => None,
        }
    }

    /// Number of recycled slots waiting in a type's pool
    pub fn pool_len(&self, ty: ObjRef) -> usize {
        self.type_obj(ty).map_or(0, |t| t.pool.len())
    }

    /// Create a new type object
    pub fn new_type(
        &mut self,
        name: &str,
        container: bool,
        destructor: Option<Destructor>,
    ) -> Result<ObjRef> {
        let ty = self.types.ty;
        self.alloc(ty, Object::Type(TypeObj::new(name, container, destructor)))
    }

    /// Allocate an object of type `ty`
    ///
    /// The references held by `object` are transferred to the new object; on
    /// failure they are released.
    pub fn alloc(&mut self, ty: ObjRef, object: Object) -> Result<ObjRef> {
        let over_limit = self
            .config
            .max_objects
            .is_some_and(|max| self.stats.live >= max);
        if over_limit {
            self.release(object);
            return Err(Error::memory());
        }

        let container = self.type_obj(ty).is_some_and(|t| t.container);
        let index = match self.pop_pooled(ty) {
            Some(index) => {
                self.stats.recycled += 1;
                index as usize
            }
            None => match self.free_slots.pop() {
                Some(index) => index as usize,
                None => {
                    if self.slots.try_reserve(1).is_err() {
                        self.release(object);
                        return Err(Error::memory());
                    }
                    self.slots.push(Slot::vacant());
                    self.slots.len() - 1
                }
            },
        };

        let slot = &mut self.slots[index];
        slot.header = Header::new(ty, container);
        slot.object = Some(object);
        self.inc_ref(ty);
        self.stats.allocated += 1;
        self.stats.live += 1;

        let r = ObjRef::from_index(index);
        if container {
            self.track(r);
        }
        Ok(r)
    }

    fn pop_pooled(&mut self, ty: ObjRef) -> Option<u32> {
        match self.get_mut(ty) {
            Some(Object::Type(t)) => t.pool.pop(),
            _ => None,
        }
    }

    /// Add an owner; returns the same reference
    #[inline]
    pub fn inc_ref(&mut self, r: ObjRef) -> ObjRef {
        self.slots[r.index()].header.ref_count += 1;
        r
    }

    /// Drop an owner, destroying and freeing the object at zero
    pub fn dec_ref(&mut self, r: ObjRef) {
        let header = &mut self.slots[r.index()].header;
        debug_assert!(header.ref_count > 0, "dec_ref of a dead object {:?}", r);
        header.ref_count = header.ref_count.saturating_sub(1);
        if header.ref_count > 0 {
            return;
        }
        if !header.flags.has(ObjFlags::DESTROYED) {
            self.destroy(r);
        }
        self.free(r);
    }

    /// Drop an optional owner
    #[inline]
    pub fn dec_opt(&mut self, r: Option<ObjRef>) {
        if let Some(r) = r {
            self.dec_ref(r);
        }
    }

    /// Run the destructor and release every owned reference
    ///
    /// Runs at most once per object. The slot itself stays allocated until
    /// [`free`](Self::free).
    pub(crate) fn destroy(&mut self, r: ObjRef) {
        let header = &mut self.slots[r.index()].header;
        if header.flags.has(ObjFlags::DESTROYED) {
            return;
        }
        header.flags.set(ObjFlags::DESTROYED);
        let ty = header.ty;
        self.stats.destroyed += 1;

        if let Some(destructor) = self.type_obj(ty).and_then(|t| t.destructor) {
            destructor(self, r);
        }
        if let Some(object) = self.slots[r.index()].object.take() {
            self.release(object);
        }
    }

    /// Release the references held by a payload that left the heap
    fn release(&mut self, object: Object) {
        match object {
            Object::Type(t) => {
                // Pooled slots of a dead type go back to the shared list.
                self.free_slots.extend(t.pool);
            }
            other => {
                let mut children = Vec::new();
                other.trace(&mut |child| children.push(child));
                drop(other);
                for child in children {
                    self.dec_ref(child);
                }
            }
        }
    }

    /// Return the slot of a destroyed object
    pub(crate) fn free(&mut self, r: ObjRef) {
        let index = r.index();
        let header = &self.slots[index].header;
        if header.flags.has(ObjFlags::PRESERVE_MEM) {
            return;
        }
        if header.flags.has(ObjFlags::TRACKED) {
            self.untrack(r);
        }
        let ty = self.slots[index].header.ty;
        self.slots[index] = Slot::vacant();
        self.stats.freed += 1;
        self.stats.live = self.stats.live.saturating_sub(1);

        let pool_cap = self.config.pool_cap;
        let pooled = ty != r
            && match self.get_mut(ty) {
                Some(Object::Type(t)) if t.pool.len() < pool_cap => {
                    t.pool.push(index as u32);
                    true
                }
                _ => false,
            };
        if !pooled {
            self.free_slots.push(index as u32);
        }
        if ty != r {
            self.dec_ref(ty);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DESTRUCTOR_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn count_destroy(_heap: &mut Heap, _r: ObjRef) {
        DESTRUCTOR_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    fn heap() -> Heap {
        Heap::new(HeapConfig::default()).unwrap()
    }

    #[test]
    fn test_bootstrap() {
        let heap = heap();
        let ty = heap.types().ty;
        assert_eq!(heap.type_of(ty), ty);
        assert_eq!(heap.type_of(heap.types().map), ty);
        assert_eq!(heap.type_of(heap.consts().null), heap.types().null);
        assert!(heap.type_obj(heap.types().map).unwrap().container);
        assert!(!heap.type_obj(heap.types().int).unwrap().container);
    }

    #[test]
    fn test_inc_dec_symmetry() {
        let mut heap = heap();
        DESTRUCTOR_RUNS.store(0, Ordering::SeqCst);
        let ty = heap.new_type("Counted", false, Some(count_destroy)).unwrap();
        let obj = heap.alloc(ty, Object::Int(5)).unwrap();

        for _ in 0..3 {
            assert_eq!(heap.inc_ref(obj), obj);
        }
        assert_eq!(heap.ref_count(obj), 4);
        for _ in 0..3 {
            heap.dec_ref(obj);
        }
        assert_eq!(DESTRUCTOR_RUNS.load(Ordering::SeqCst), 0);
        assert!(heap.get(obj).is_some());

        heap.dec_ref(obj);
        assert_eq!(DESTRUCTOR_RUNS.load(Ordering::SeqCst), 1);
        assert!(heap.get(obj).is_none());
        heap.dec_ref(ty);
    }

    #[test]
    fn test_pool_recycles_slot() {
        let mut heap = heap();
        let int = heap.types().int;
        let a = heap.new_int(1).unwrap();
        heap.dec_ref(a);
        assert_eq!(heap.pool_len(int), 1);

        let before = heap.stats().recycled;
        let b = heap.new_int(2).unwrap();
        assert_eq!(b, a);
        assert_eq!(heap.stats().recycled, before + 1);
        assert_eq!(heap.pool_len(int), 0);
        heap.dec_ref(b);
    }

    #[test]
    fn test_pool_cap() {
        let mut heap = Heap::new(HeapConfig {
            max_objects: None,
            pool_cap: 2,
        })
        .unwrap();
        let ints: Vec<_> = (0..5).map(|i| heap.new_int(i).unwrap()).collect();
        for r in ints {
            heap.dec_ref(r);
        }
        assert_eq!(heap.pool_len(heap.types().int), 2);
        assert_eq!(heap.free_slots.len(), 3);
    }

    #[test]
    fn test_max_objects() {
        let live = heap().stats().live;
        let mut heap = Heap::new(HeapConfig {
            max_objects: Some(live + 1),
            pool_cap: 20,
        })
        .unwrap();
        let a = heap.new_int(1).unwrap();
        let err = heap.new_int(2).unwrap_err();
        assert!(err.is(crate::ErrorKind::Memory));
        heap.dec_ref(a);
        assert!(heap.new_int(3).is_ok());
    }

    #[test]
    fn test_release_children() {
        let mut heap = heap();
        let s = heap.new_str("child").unwrap();
        let owned = heap.inc_ref(s);
        let arr = heap.new_array(vec![owned]).unwrap();
        assert_eq!(heap.ref_count(s), 2);
        heap.dec_ref(arr);
        assert_eq!(heap.ref_count(s), 1);
        heap.dec_ref(s);
        assert!(heap.get(s).is_none());
    }

    #[test]
    fn test_dead_type_returns_pool() {
        let mut heap = heap();
        let ty = heap.new_type("Temp", false, None).unwrap();
        let obj = heap.alloc(ty, Object::Null).unwrap();
        heap.dec_ref(obj);
        assert_eq!(heap.pool_len(ty), 1);
        let free_before = heap.free_slots.len();
        let type_pool = heap.pool_len(heap.types().ty);
        heap.dec_ref(ty);
        assert_eq!(heap.free_slots.len(), free_before + 1);
        assert_eq!(heap.pool_len(heap.types().ty), type_pool + 1);
    }
}
