//! Variable tables
//!
//! A table is a local map plus an optional global map. Lookups fall back
//! from the locals to the globals and finally to `null`; assignments always
//! go to the locals.
//!
//! Every local map stores itself under `_vars_`. That self-reference is
//! dropped before the table releases the map, so a finished call does not
//! leave a cycle for the collector.

use crate::error::Result;
use crate::gc::Heap;
use crate::value::ObjRef;

/// Name of the self-reference in every local map
pub const VARS_NAME: &str = "_vars_";
pub const GLOBALS_NAME: &str = "_globals_";
pub const CWD_NAME: &str = "_cwd_";
pub const ARGS_NAME: &str = "_args_";

/// Local and global maps (both owned)
#[derive(Debug)]
pub struct VarTable {
    vars: ObjRef,
    globals: Option<ObjRef>,
}

impl VarTable {
    /// Table of a program's top level. Unless `no_default` is set it is
    /// seeded with the builtin types, `true`, `false`, `null`, `_cwd_` and
    /// `_args_` (all borrowed).
    pub fn top_level(heap: &mut Heap, cwd: ObjRef, args: ObjRef, no_default: bool) -> Result<Self> {
        let table = Self::with_self_ref(heap, None)?;
        if no_default {
            return Ok(table);
        }
        if let Err(e) = table.seed_defaults(heap, cwd, args) {
            table.destroy(heap);
            return Err(e);
        }
        Ok(table)
    }

    fn seed_defaults(&self, heap: &mut Heap, cwd: ObjRef, args: ObjRef) -> Result<()> {
        let null = heap.consts().null;
        heap.map_set_str(self.vars, GLOBALS_NAME, null)?;
        for (name, ty) in heap.types().named() {
            heap.map_set_str(self.vars, name, ty)?;
        }
        let consts = heap.consts().clone();
        heap.map_set_str(self.vars, "true", consts.bool_true)?;
        heap.map_set_str(self.vars, "false", consts.bool_false)?;
        heap.map_set_str(self.vars, "null", consts.null)?;
        heap.map_set_str(self.vars, CWD_NAME, cwd)?;
        heap.map_set_str(self.vars, ARGS_NAME, args)
    }

    /// Table for a call of a function whose globals are `globals` (borrowed)
    pub fn for_call(heap: &mut Heap, globals: ObjRef) -> Result<Self> {
        let owned = heap.inc_ref(globals);
        let table = Self::with_self_ref(heap, Some(owned))?;
        if let Err(e) = heap.map_set_str(table.vars, GLOBALS_NAME, globals) {
            table.destroy(heap);
            return Err(e);
        }
        Ok(table)
    }

    /// Rebuild a table from saved maps; both references are transferred
    pub fn from_parts(vars: ObjRef, globals: Option<ObjRef>) -> Self {
        VarTable { vars, globals }
    }

    /// Split the table into its maps without releasing them
    pub fn into_parts(self) -> (ObjRef, Option<ObjRef>) {
        (self.vars, self.globals)
    }

    fn with_self_ref(heap: &mut Heap, globals: Option<ObjRef>) -> Result<Self> {
        let vars = match heap.new_map() {
            Ok(vars) => vars,
            Err(e) => {
                heap.dec_opt(globals);
                return Err(e);
            }
        };
        let table = VarTable { vars, globals };
        if let Err(e) = heap.map_set_str(vars, VARS_NAME, vars) {
            table.destroy(heap);
            return Err(e);
        }
        Ok(table)
    }

    #[inline]
    pub fn vars(&self) -> ObjRef {
        self.vars
    }

    #[inline]
    pub fn globals(&self) -> Option<ObjRef> {
        self.globals
    }

    /// Globals seen by functions defined while this table is active
    pub fn effective_globals(&self) -> ObjRef {
        self.globals.unwrap_or(self.vars)
    }

    /// Borrowed value of `name`, or null
    pub fn get(&self, heap: &mut Heap, name: ObjRef) -> Result<ObjRef> {
        if let Some(value) = heap.map_get(self.vars, name)? {
            return Ok(value);
        }
        if let Some(globals) = self.globals {
            if let Some(value) = heap.map_get(globals, name)? {
                return Ok(value);
            }
        }
        Ok(heap.consts().null)
    }

    /// Bind `name` in the locals (value borrowed)
    pub fn set(&self, heap: &mut Heap, name: ObjRef, value: ObjRef) -> Result<()> {
        heap.map_set(self.vars, name, value)
    }

    /// Bind `name` in the globals, or in the locals at the top level
    pub fn set_global(&self, heap: &mut Heap, name: ObjRef, value: ObjRef) -> Result<()> {
        heap.map_set(self.effective_globals(), name, value)
    }

    /// Release both maps, breaking the `_vars_` cycle first
    pub fn destroy(self, heap: &mut Heap) {
        self.release(heap);
    }

    /// [`destroy`](Self::destroy) for a table that cannot be moved out
    /// of its owner; the table must not be used afterwards
    pub(crate) fn release(&self, heap: &mut Heap) {
        if heap.get(self.vars).is_some() {
            if let Ok(old) = heap.map_drop_str(self.vars, VARS_NAME) {
                heap.dec_opt(old);
            }
        }
        heap.dec_ref(self.vars);
        heap.dec_opt(self.globals);
    }
}
