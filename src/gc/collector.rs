//! Generational cycle collector
//!
//! Container objects are tracked in one of four generations. A collection
//! of a generation uses trial deletion:
//! 1. Copy every member's refcount into a scratch counter
//! 2. Subtract the references each member receives from inside the generation
//! 3. Members with a positive counter are referenced from outside (a root,
//!    another generation, a Rust temporary): they survive
//! 4. Everything reachable from a survivor survives too
//! 5. The rest is garbage: destroyed first, freed afterwards
//!
//! Young generations are small and collected often; survivors are promoted
//! toward the old generation, which is only collected once enough new
//! objects have entered it since its last pass.

use tracing::debug;

use crate::gc::Heap;
use crate::runtime::object::Trace;
use crate::value::{ObjFlags, ObjRef};

/// Gen-1 capacity
pub const GEN1_MAX: usize = 700;
/// Gen-2 capacity
pub const GEN2_MAX: usize = 100;
/// Gen-3 capacity
pub const GEN3_MAX: usize = 10;
/// Minimum old generation size before it is considered for collection
pub const OLD_GEN_MIN: usize = 100;

/// A generation list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Gen1 = 0,
    Gen2 = 1,
    Gen3 = 2,
    Old = 3,
}

impl Generation {
    pub const ALL: [Generation; 4] = [
        Generation::Gen1,
        Generation::Gen2,
        Generation::Gen3,
        Generation::Old,
    ];

    #[inline]
    const fn idx(self) -> usize {
        self as usize
    }
}

/// Collector counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Collections run per generation
    pub passes: [usize; 4],
    /// Objects reclaimed by collections
    pub freed: usize,
}

pub(crate) struct Collector {
    gens: [Vec<ObjRef>; 4],
    /// Objects moved into the old generation since its last collection
    old_pending: usize,
    collecting: bool,
    stats: GcStats,
}

impl Collector {
    pub(crate) fn new() -> Self {
        Collector {
            gens: [Vec::new(), Vec::new(), Vec::new(), Vec::new()],
            old_pending: 0,
            collecting: false,
            stats: GcStats::default(),
        }
    }
}

impl Heap {
    /// Number of objects in a generation
    #[inline]
    pub fn generation_len(&self, g: Generation) -> usize {
        self.gc.gens[g.idx()].len()
    }

    /// Generation an object is tracked in
    pub fn generation_of(&self, r: ObjRef) -> Option<Generation> {
        self.header(r).gen_slot.map(|(g, _)| g)
    }

    #[inline]
    pub fn gc_stats(&self) -> GcStats {
        self.gc.stats
    }

    /// Start tracking a container in gen-1
    pub(crate) fn track(&mut self, r: ObjRef) {
        let flags = self.header(r).flags;
        if !flags.has(ObjFlags::CONTAINER) || flags.has(ObjFlags::TRACKED) {
            return;
        }
        self.push_to_gen(r, Generation::Gen1);

        if cfg!(feature = "debug-gc") {
            self.collect_generation(Generation::Gen1);
        } else if self.generation_len(Generation::Gen1) > GEN1_MAX {
            self.collect();
        }
    }

    /// Remove an object from its generation
    pub(crate) fn untrack(&mut self, r: ObjRef) {
        let header = self.header_mut(r);
        header.flags.clear(ObjFlags::TRACKED);
        let Some((g, pos)) = header.gen_slot.take() else {
            return;
        };
        let list = &mut self.gc.gens[g.idx()];
        let pos = pos as usize;
        if pos >= list.len() || list[pos] != r {
            return;
        }
        list.swap_remove(pos);
        if let Some(&moved) = list.get(pos) {
            self.slots[moved.index()].header.gen_slot = Some((g, pos as u32));
        }
    }

    fn push_to_gen(&mut self, r: ObjRef, g: Generation) {
        let list = &mut self.gc.gens[g.idx()];
        let pos = list.len() as u32;
        list.push(r);
        let header = &mut self.slots[r.index()].header;
        header.flags.set(ObjFlags::TRACKED);
        header.gen_slot = Some((g, pos));
    }

    fn move_generation(&mut self, from: Generation, to: Generation) {
        if from == to {
            return;
        }
        let moved = std::mem::take(&mut self.gc.gens[from.idx()]);
        debug!(?from, ?to, count = moved.len(), "promoting generation");
        for r in moved {
            self.push_to_gen(r, to);
        }
    }

    fn trace_children(&self, r: ObjRef, out: &mut Vec<ObjRef>) {
        if let Some(object) = self.get(r) {
            object.trace(&mut |child| out.push(child));
        }
    }

    /// Collect a single generation; returns the number of objects freed
    fn collect_gen(&mut self, g: Generation) -> usize {
        let members = std::mem::take(&mut self.gc.gens[g.idx()]);
        self.gc.stats.passes[g.idx()] += 1;
        if members.is_empty() {
            return 0;
        }

        let mut gc_refs: Vec<i64> = Vec::with_capacity(members.len());
        for &r in &members {
            let header = &mut self.slots[r.index()].header;
            header.flags.clear(ObjFlags::REACHABLE | ObjFlags::UNREACHABLE);
            gc_refs.push(header.ref_count as i64);
        }

        // Subtract the edges internal to the generation.
        let mut children = Vec::new();
        for &r in &members {
            children.clear();
            self.trace_children(r, &mut children);
            for &child in &children {
                if let Some((cg, pos)) = self.header(child).gen_slot {
                    if cg == g && members.get(pos as usize) == Some(&child) {
                        gc_refs[pos as usize] -= 1;
                    }
                }
            }
        }

        let mut survivors = Vec::with_capacity(members.len());
        for (i, &r) in members.iter().enumerate() {
            let header = &mut self.slots[r.index()].header;
            if gc_refs[i] > 0 {
                header.flags.set(ObjFlags::REACHABLE);
                survivors.push(r);
            } else {
                header.flags.set(ObjFlags::UNREACHABLE);
                header.gen_slot = None;
            }
        }
        for &r in &survivors {
            self.push_to_gen(r, g);
        }

        // Rescue whatever a survivor can still reach.
        let mut frontier = survivors;
        while let Some(r) = frontier.pop() {
            children.clear();
            self.trace_children(r, &mut children);
            for &child in &children {
                let header = &mut self.slots[child.index()].header;
                if header.flags.has(ObjFlags::UNREACHABLE) {
                    header.flags.clear(ObjFlags::UNREACHABLE);
                    header.flags.set(ObjFlags::REACHABLE);
                    self.push_to_gen(child, g);
                    frontier.push(child);
                }
            }
        }

        let garbage: Vec<ObjRef> = members
            .into_iter()
            .filter(|r| self.header(*r).flags.has(ObjFlags::UNREACHABLE))
            .collect();
        for &r in &self.gc.gens[g.idx()] {
            self.slots[r.index()].header.flags.clear(ObjFlags::REACHABLE);
        }
        let freed = self.destroy_garbage(&garbage);
        self.gc.stats.freed += freed;
        debug!(generation = ?g, freed, survivors = self.generation_len(g), "collected generation");
        freed
    }

    /// Destroy every object of the set, then free them all
    fn destroy_garbage(&mut self, garbage: &[ObjRef]) -> usize {
        for &r in garbage {
            let flags = &mut self.slots[r.index()].header.flags;
            flags.clear(ObjFlags::UNREACHABLE | ObjFlags::TRACKED);
            flags.set(ObjFlags::PRESERVE_MEM);
        }
        for &r in garbage {
            self.destroy(r);
        }
        let mut freed = 0;
        for &r in garbage {
            let header = &mut self.slots[r.index()].header;
            header.flags.clear(ObjFlags::PRESERVE_MEM);
            // A destructor may have handed out a new reference.
            if header.ref_count == 0 {
                self.free(r);
                freed += 1;
            }
        }
        freed
    }

    /// Run the collection cascade
    ///
    /// Young generations are collected when over capacity and their
    /// survivors promoted; the old generation is collected first when at
    /// least a quarter of it has not been examined yet.
    pub fn collect(&mut self) {
        if self.gc.collecting {
            return;
        }
        self.gc.collecting = true;

        let old_len = self.generation_len(Generation::Old);
        if old_len >= OLD_GEN_MIN && self.gc.old_pending >= old_len / 4 {
            self.collect_gen(Generation::Old);
            self.gc.old_pending = 0;
        }

        let mut collected_gen1 = false;
        let mut collected_gen2 = false;
        if self.generation_len(Generation::Gen1) > GEN1_MAX {
            self.collect_gen(Generation::Gen1);
            collected_gen1 = true;
        }

        if self.generation_len(Generation::Gen2) > GEN2_MAX
            || (collected_gen1
                && self.generation_len(Generation::Gen1) + self.generation_len(Generation::Gen2) > GEN2_MAX)
        {
            self.collect_gen(Generation::Gen2);
            collected_gen2 = true;
        }

        if self.generation_len(Generation::Gen3) > GEN3_MAX
            || (collected_gen2
                && self.generation_len(Generation::Gen2) + self.generation_len(Generation::Gen3) > GEN3_MAX)
        {
            self.collect_gen(Generation::Gen3);
            self.gc.old_pending += self.generation_len(Generation::Gen3);
            self.move_generation(Generation::Gen3, Generation::Old);
        }

        if collected_gen2 {
            if self.generation_len(Generation::Gen2) + self.generation_len(Generation::Gen3) > GEN3_MAX {
                self.gc.old_pending += self.generation_len(Generation::Gen2);
                self.move_generation(Generation::Gen2, Generation::Old);
            } else {
                self.move_generation(Generation::Gen2, Generation::Gen3);
            }
        }

        if collected_gen1 {
            if self.generation_len(Generation::Gen1) + self.generation_len(Generation::Gen2) <= GEN2_MAX {
                self.move_generation(Generation::Gen1, Generation::Gen2);
            } else if self.generation_len(Generation::Gen1) + self.generation_len(Generation::Gen3) <= GEN3_MAX {
                self.move_generation(Generation::Gen1, Generation::Gen3);
            } else {
                self.gc.old_pending += self.generation_len(Generation::Gen1);
                self.move_generation(Generation::Gen1, Generation::Old);
            }
        }

        self.gc.collecting = false;
    }

    /// Collect one generation without promoting its survivors
    pub fn collect_generation(&mut self, g: Generation) -> usize {
        if self.gc.collecting {
            return 0;
        }
        self.gc.collecting = true;
        let freed = self.collect_gen(g);
        self.gc.collecting = false;
        freed
    }

    /// Collect every generation and move all survivors to the old one
    pub fn collect_all(&mut self) -> usize {
        if self.gc.collecting {
            return 0;
        }
        self.gc.collecting = true;
        let mut freed = 0;
        for g in [Generation::Gen1, Generation::Gen2, Generation::Gen3] {
            freed += self.collect_gen(g);
            self.move_generation(g, Generation::Old);
        }
        freed += self.collect_gen(Generation::Old);
        self.gc.old_pending = 0;
        self.gc.collecting = false;
        freed
    }

    /// Destroy every tracked object, reachable or not
    ///
    /// Used at end-of-run teardown; destructors run before any slot is freed.
    pub fn delete_all(&mut self) {
        self.gc.collecting = true;
        let mut all = Vec::new();
        for g in Generation::ALL {
            for r in std::mem::take(&mut self.gc.gens[g.idx()]) {
                self.slots[r.index()].header.gen_slot = None;
                all.push(r);
            }
        }
        debug!(count = all.len(), "deleting tracked objects");
        for &r in &all {
            let flags = &mut self.slots[r.index()].header.flags;
            flags.clear(ObjFlags::TRACKED);
            flags.set(ObjFlags::PRESERVE_MEM);
        }
        for &r in &all {
            self.destroy(r);
        }
        for &r in &all {
            self.slots[r.index()].header.flags.clear(ObjFlags::PRESERVE_MEM);
            self.free(r);
        }
        self.gc.old_pending = 0;
        self.gc.collecting = false;
    }
}
