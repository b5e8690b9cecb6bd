//! Object handles and headers
//!
//! Every Nest value lives in the heap arena and is addressed by an [`ObjRef`],
//! the index of its slot. Handles are plain `Copy` values: ownership is
//! expressed through the reference count stored in the slot's [`Header`],
//! not through the Rust type system.

use std::fmt;

use crate::gc::Generation;

/// Hash value meaning "not computed yet"
pub const HASH_UNSET: i64 = -1;

/// Handle to an object in the heap arena
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(u32);

impl ObjRef {
    /// Create a handle from a slot index
    #[inline]
    pub(crate) const fn from_index(index: usize) -> Self {
        ObjRef(index as u32)
    }

    /// Slot index of this handle
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Header flag bitset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjFlags(u8);

impl ObjFlags {
    /// The destructor has run
    pub const DESTROYED: u8 = 1 << 0;
    /// The object is in one of the collector's generations
    pub const TRACKED: u8 = 1 << 1;
    /// Marked reachable by the current collection
    pub const REACHABLE: u8 = 1 << 2;
    /// Sitting in the unreachable set of the current collection
    pub const UNREACHABLE: u8 = 1 << 3;
    /// Instance of a container type
    pub const CONTAINER: u8 = 1 << 4;
    /// Memory must survive a refcount drop to zero (collector sweep)
    pub const PRESERVE_MEM: u8 = 1 << 5;

    #[inline]
    pub const fn empty() -> Self {
        ObjFlags(0)
    }

    #[inline]
    pub const fn has(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    #[inline]
    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    #[inline]
    pub fn clear(&mut self, flag: u8) {
        self.0 &= !flag;
    }
}

/// Per-object bookkeeping stored next to the payload
#[derive(Debug, Clone)]
pub struct Header {
    /// Number of owners
    pub ref_count: u32,
    /// Type object of the instance
    pub ty: ObjRef,
    /// Cached hash, [`HASH_UNSET`] until first computed
    pub hash: i64,
    /// Flag bitset
    pub flags: ObjFlags,
    /// Generation list and position, when tracked
    pub(crate) gen_slot: Option<(Generation, u32)>,
}

impl Header {
    /// Header of a freshly allocated object
    pub(crate) fn new(ty: ObjRef, container: bool) -> Self {
        let mut flags = ObjFlags::empty();
        if container {
            flags.set(ObjFlags::CONTAINER);
        }
        Header {
            ref_count: 1,
            ty,
            hash: HASH_UNSET,
            flags,
            gen_slot: None,
        }
    }

    /// Header of an unused slot
    pub(crate) fn vacant() -> Self {
        Header {
            ref_count: 0,
            ty: ObjRef::from_index(0),
            hash: HASH_UNSET,
            flags: ObjFlags::empty(),
            gen_slot: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objref_index() {
        let r = ObjRef::from_index(17);
        assert_eq!(r.index(), 17);
        assert_eq!(format!("{:?}", r), "#17");
    }

    #[test]
    fn test_flags() {
        let mut flags = ObjFlags::empty();
        assert!(!flags.has(ObjFlags::TRACKED));

        flags.set(ObjFlags::TRACKED);
        flags.set(ObjFlags::CONTAINER);
        assert!(flags.has(ObjFlags::TRACKED));
        assert!(flags.has(ObjFlags::CONTAINER));
        assert!(!flags.has(ObjFlags::DESTROYED));

        flags.clear(ObjFlags::TRACKED);
        assert!(!flags.has(ObjFlags::TRACKED));
        assert!(flags.has(ObjFlags::CONTAINER));
    }

    #[test]
    fn test_new_header() {
        let header = Header::new(ObjRef::from_index(3), true);
        assert_eq!(header.ref_count, 1);
        assert_eq!(header.hash, HASH_UNSET);
        assert!(header.flags.has(ObjFlags::CONTAINER));
        assert!(header.gen_slot.is_none());
    }
}
