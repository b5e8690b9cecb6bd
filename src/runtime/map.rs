//! Insertion-ordered hash map
//!
//! Open addressing over a power-of-two node array with perturbation probing.
//! Occupied nodes are chained in insertion order through `prev`/`next`
//! indices, so iteration order survives growth, shrinking and removals.

use crate::error::{Error, Result};
use crate::gc::Heap;
use crate::runtime::object::{Object, Trace, str_hash};
use crate::value::ObjRef;

/// Minimum node count
pub const MAP_MIN_SIZE: usize = 8;

#[derive(Debug, Clone, Default)]
struct MapNode {
    hash: i64,
    key: Option<ObjRef>,
    value: Option<ObjRef>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Outcome of a key lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The key lives at this node
    Found(usize),
    /// The key is absent; this is the first free node on its probe path
    Vacant(usize),
}

#[derive(Debug)]
pub struct MapObj {
    nodes: Vec<MapNode>,
    len: usize,
    head: Option<usize>,
    tail: Option<usize>,
}

impl Default for MapObj {
    fn default() -> Self {
        MapObj::new()
    }
}

impl MapObj {
    pub fn new() -> Self {
        MapObj {
            nodes: vec![MapNode::default(); MAP_MIN_SIZE],
            len: 0,
            head: None,
            tail: None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Probe for `hash`; `eq` decides whether a stored key matches
    pub fn find(&self, hash: i64, mut eq: impl FnMut(ObjRef) -> bool) -> Probe {
        let mask = self.nodes.len() - 1;
        let mut i = hash as u64 as usize;
        let mut perturb = hash as u64;
        loop {
            let node = &self.nodes[i & mask];
            match node.key {
                None => return Probe::Vacant(i & mask),
                Some(key) if node.hash == hash && eq(key) => return Probe::Found(i & mask),
                Some(_) => {}
            }
            i = i
                .wrapping_mul(5)
                .wrapping_add(1)
                .wrapping_add(perturb as usize);
            perturb >>= 5;
        }
    }

    /// Grow when less than a quarter of the nodes is free, shrink when a
    /// quarter of the capacity holds every entry; `force` rebuilds the node
    /// array even when the size stays the same.
    pub(crate) fn resize(&mut self, force: bool) {
        let cap = self.nodes.len();
        let new_cap = if cap - self.len < cap / 4 {
            cap * 2
        } else if cap > MAP_MIN_SIZE && cap / 4 >= self.len {
            cap / 2
        } else if force {
            cap
        } else {
            return;
        };

        let old = std::mem::replace(&mut self.nodes, vec![MapNode::default(); new_cap]);
        let mut cursor = self.head;
        self.head = None;
        self.tail = None;
        while let Some(idx) = cursor {
            let node = &old[idx];
            cursor = node.next;
            if let (Some(key), Some(value)) = (node.key, node.value) {
                // keys are unique, so the first vacant node is the right one
                if let Probe::Vacant(slot) = self.find(node.hash, |_| false) {
                    self.link(slot, node.hash, key, value);
                }
            }
        }
    }

    fn link(&mut self, slot: usize, hash: i64, key: ObjRef, value: ObjRef) {
        let tail = self.tail;
        let node = &mut self.nodes[slot];
        node.hash = hash;
        node.key = Some(key);
        node.value = Some(value);
        node.prev = tail;
        node.next = None;
        match tail {
            Some(t) => self.nodes[t].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }

    /// Store at a probed node; returns the replaced pair, if any
    pub(crate) fn insert_at(
        &mut self,
        probe: Probe,
        hash: i64,
        key: ObjRef,
        value: ObjRef,
    ) -> Option<(ObjRef, ObjRef)> {
        match probe {
            Probe::Found(idx) => {
                let node = &mut self.nodes[idx];
                let old_key = node.key.replace(key);
                let old_value = node.value.replace(value);
                old_key.zip(old_value)
            }
            Probe::Vacant(idx) => {
                self.link(idx, hash, key, value);
                self.len += 1;
                None
            }
        }
    }

    /// Unlink a node and rehash the rest
    pub(crate) fn remove_at(&mut self, idx: usize) -> Option<(ObjRef, ObjRef)> {
        let node = std::mem::take(&mut self.nodes[idx]);
        let pair = node.key.zip(node.value)?;
        match node.next {
            Some(n) => self.nodes[n].prev = node.prev,
            None => self.tail = node.prev,
        }
        match node.prev {
            Some(p) => self.nodes[p].next = node.next,
            None => self.head = node.next,
        }
        self.len -= 1;
        self.resize(true);
        Some(pair)
    }

    #[inline]
    pub(crate) fn value_at(&self, idx: usize) -> Option<ObjRef> {
        self.nodes.get(idx).and_then(|n| n.value)
    }

    /// Entries in insertion order
    pub fn entries(&self) -> MapIter<'_> {
        MapIter {
            map: self,
            cursor: self.head,
        }
    }

    /// Keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.entries().map(|(k, _)| k)
    }
}

/// Iterator over map entries in insertion order
pub struct MapIter<'a> {
    map: &'a MapObj,
    cursor: Option<usize>,
}

impl Iterator for MapIter<'_> {
    type Item = (ObjRef, ObjRef);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = &self.map.nodes[self.cursor?];
            self.cursor = node.next;
            if let (Some(k), Some(v)) = (node.key, node.value) {
                return Some((k, v));
            }
        }
    }
}

impl Trace for MapObj {
    fn trace(&self, visit: &mut dyn FnMut(ObjRef)) {
        for node in &self.nodes {
            if let (Some(k), Some(v)) = (node.key, node.value) {
                visit(k);
                visit(v);
            }
        }
    }
}

impl Heap {
    pub fn new_map(&mut self) -> Result<ObjRef> {
        let ty = self.types().map;
        self.alloc(ty, Object::Map(MapObj::new()))
    }

    fn map_obj(&self, map: ObjRef) -> Result<&MapObj> {
        self.expect_map(map)
    }

    fn map_obj_mut(&mut self, map: ObjRef) -> Result<&mut MapObj> {
        match self.get_mut(map) {
            Some(Object::Map(m)) => Ok(m),
            _ => Err(Error::type_error("expected type 'Map'")),
        }
    }

    fn key_hash(&mut self, key: ObjRef) -> Result<i64> {
        match self.hash_obj(key) {
            Some(hash) => Ok(hash),
            None => Err(Error::type_error(format!(
                "type '{}' is not hashable",
                self.type_name(key)
            ))),
        }
    }

    /// Set `key` to `value`; both are borrowed and gain an owner
    pub fn map_set(&mut self, map: ObjRef, key: ObjRef, value: ObjRef) -> Result<()> {
        let hash = self.key_hash(key)?;
        self.map_obj_mut(map)?.resize(false);
        let probe = self.map_obj(map)?.find(hash, |k| self.obj_eq(k, key));
        self.inc_ref(key);
        self.inc_ref(value);
        let replaced = self.map_obj_mut(map)?.insert_at(probe, hash, key, value);
        if let Some((old_key, old_value)) = replaced {
            self.dec_ref(old_key);
            self.dec_ref(old_value);
        }
        Ok(())
    }

    /// Borrowed value stored under `key`
    pub fn map_get(&mut self, map: ObjRef, key: ObjRef) -> Result<Option<ObjRef>> {
        let hash = self.key_hash(key)?;
        let m = self.map_obj(map)?;
        Ok(match m.find(hash, |k| self.obj_eq(k, key)) {
            Probe::Found(idx) => m.value_at(idx),
            Probe::Vacant(_) => None,
        })
    }

    /// Remove `key`, returning the owned value
    pub fn map_drop(&mut self, map: ObjRef, key: ObjRef) -> Result<Option<ObjRef>> {
        let hash = self.key_hash(key)?;
        let probe = self.map_obj(map)?.find(hash, |k| self.obj_eq(k, key));
        self.remove_probed(map, probe)
    }

    fn remove_probed(&mut self, map: ObjRef, probe: Probe) -> Result<Option<ObjRef>> {
        let Probe::Found(idx) = probe else {
            return Ok(None);
        };
        match self.map_obj_mut(map)?.remove_at(idx) {
            Some((key, value)) => {
                self.dec_ref(key);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn probe_str(&self, map: ObjRef, key: &str) -> Result<Probe> {
        Ok(self
            .map_obj(map)?
            .find(str_hash(key), |k| self.as_str(k) == Some(key)))
    }

    pub fn map_set_str(&mut self, map: ObjRef, key: &str, value: ObjRef) -> Result<()> {
        let key_obj = self.new_str(key)?;
        let result = self.map_set(map, key_obj, value);
        self.dec_ref(key_obj);
        result
    }

    /// Borrowed value stored under a string key
    pub fn map_get_str(&self, map: ObjRef, key: &str) -> Option<ObjRef> {
        let m = self.map_obj(map).ok()?;
        match m.find(str_hash(key), |k| self.as_str(k) == Some(key)) {
            Probe::Found(idx) => m.value_at(idx),
            Probe::Vacant(_) => None,
        }
    }

    /// Remove a string key, returning the owned value
    pub fn map_drop_str(&mut self, map: ObjRef, key: &str) -> Result<Option<ObjRef>> {
        let probe = self.probe_str(map, key)?;
        self.remove_probed(map, probe)
    }

    /// Borrowed snapshot of the entries in insertion order
    pub fn map_entries(&self, map: ObjRef) -> Result<Vec<(ObjRef, ObjRef)>> {
        Ok(self.map_obj(map)?.entries().collect())
    }

    pub fn map_len(&self, map: ObjRef) -> Result<usize> {
        Ok(self.map_obj(map)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;

    fn heap() -> Heap {
        Heap::new(HeapConfig::default()).unwrap()
    }

    fn keys(heap: &Heap, map: ObjRef) -> Vec<String> {
        heap.map_entries(map)
            .unwrap()
            .into_iter()
            .map(|(k, _)| heap.display(k))
            .collect()
    }

    #[test]
    fn test_order_survives_drop() {
        let mut heap = heap();
        let map = heap.new_map().unwrap();
        let one = heap.new_int(1).unwrap();
        for key in ["a", "b", "c"] {
            heap.map_set_str(map, key, one).unwrap();
        }
        assert_eq!(keys(&heap, map), ["a", "b", "c"]);

        let dropped = heap.map_drop_str(map, "b").unwrap();
        assert_eq!(dropped, Some(one));
        heap.dec_ref(one);
        assert_eq!(keys(&heap, map), ["a", "c"]);
        assert_eq!(heap.map_len(map).unwrap(), 2);
        assert!(heap.map_get_str(map, "b").is_none());
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut heap = heap();
        let map = heap.new_map().unwrap();
        let one = heap.new_int(1).unwrap();
        let two = heap.new_int(2).unwrap();
        heap.map_set_str(map, "x", one).unwrap();
        heap.map_set_str(map, "y", one).unwrap();
        heap.map_set_str(map, "x", two).unwrap();
        assert_eq!(keys(&heap, map), ["x", "y"]);
        assert_eq!(heap.map_get_str(map, "x"), Some(two));
        // one is still held by the caller and by "y"
        assert_eq!(heap.ref_count(one), 2);
    }

    #[test]
    fn test_growth_and_shrink() {
        let mut heap = heap();
        let map = heap.new_map().unwrap();
        let mut ints = Vec::new();
        for i in 0..100 {
            let k = heap.new_int(i).unwrap();
            heap.map_set(map, k, k).unwrap();
            ints.push(k);
        }
        let cap = heap.expect_map(map).unwrap().capacity();
        assert!(cap >= 128 && cap.is_power_of_two());
        for &k in &ints {
            assert_eq!(heap.map_get(map, k).unwrap(), Some(k));
        }
        for &k in &ints[..95] {
            let v = heap.map_drop(map, k).unwrap();
            heap.dec_opt(v);
        }
        let m = heap.expect_map(map).unwrap();
        assert_eq!(m.len(), 5);
        assert!(m.capacity() < cap);
        let remaining: Vec<i64> = m.keys().map(|k| heap.as_int(k).unwrap()).collect();
        assert_eq!(remaining, vec![95, 96, 97, 98, 99]);
    }

    #[test]
    fn test_numeric_keys_unify() {
        let mut heap = heap();
        let map = heap.new_map().unwrap();
        let int_key = heap.new_int(3).unwrap();
        let real_key = heap.new_real(3.0).unwrap();
        let value = heap.new_str("three").unwrap();
        heap.map_set(map, int_key, value).unwrap();
        assert_eq!(heap.map_get(map, real_key).unwrap(), Some(value));
    }

    #[test]
    fn test_unhashable_key() {
        let mut heap = heap();
        let map = heap.new_map().unwrap();
        let other = heap.new_map().unwrap();
        let err = heap.map_set(map, other, other).unwrap_err();
        assert_eq!(err.message, "type 'Map' is not hashable");
    }
}
