//! Native libraries
//!
//! A library is registered by name and initialised the first time a program
//! imports it. Initialisation returns the library's exports, which are
//! wrapped in native functions and collected into a map. The map is cached
//! in the [`ModuleTable`] for the rest of the context's life, so importing
//! a library twice yields the same map.

pub mod co;

use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::runtime::function::NativeFn;
use crate::value::ObjRef;

/// One exported native function
#[derive(Debug, Clone, Copy)]
pub struct NativeDecl {
    pub name: &'static str,
    pub func: NativeFn,
    pub arity: usize,
}

impl NativeDecl {
    pub const fn new(name: &'static str, func: NativeFn, arity: usize) -> Self {
        NativeDecl { name, func, arity }
    }
}

/// A library of native functions
pub trait NativeLib {
    /// Name the library is imported by
    fn name(&self) -> &'static str;

    /// Prepare the library and list its exports
    fn init(&self, ctx: &mut Context) -> Result<Vec<NativeDecl>>;

    /// Called once when the context is dropped, in reverse import order
    fn teardown(&self, _ctx: &mut Context) {}
}

/// Registered and loaded libraries
#[derive(Default)]
pub struct ModuleTable {
    registry: FxHashMap<&'static str, Rc<dyn NativeLib>>,
    /// Export maps of the loaded libraries (owned)
    loaded: FxHashMap<String, ObjRef>,
    /// Import order
    order: Vec<String>,
    /// Libraries whose `init` is running
    loading: Vec<String>,
}

impl ModuleTable {
    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.contains_key(name)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains_key(name)
    }
}

impl Context {
    /// Make a library importable; a library with the same name is replaced
    pub fn register_lib(&mut self, lib: impl NativeLib + 'static) {
        let name = lib.name();
        self.modules.registry.insert(name, Rc::new(lib));
    }

    /// Export map of a library (owned), loading it on first use
    pub fn import(&mut self, name: &str) -> Result<ObjRef> {
        if let Some(&map) = self.modules.loaded.get(name) {
            return Ok(self.heap.inc_ref(map));
        }
        if self.modules.loading.iter().any(|n| n == name) {
            return Err(Error::import_error(format!("circular import of '{}'", name)));
        }
        let Some(lib) = self.modules.registry.get(name).cloned() else {
            return Err(Error::import_error(format!(
                "no library named '{}' was found",
                name
            )));
        };

        self.modules.loading.push(name.to_owned());
        let decls = lib.init(self);
        self.modules.loading.pop();
        let decls = decls?;

        let map = self.heap.new_map()?;
        for decl in &decls {
            let result = self
                .heap
                .new_native(decl.name, decl.func, decl.arity)
                .and_then(|f| {
                    let set = self.heap.map_set_str(map, decl.name, f);
                    self.heap.dec_ref(f);
                    set
                });
            if let Err(e) = result {
                self.heap.dec_ref(map);
                return Err(e);
            }
        }

        debug!(library = name, exports = decls.len(), "library imported");
        self.modules.loaded.insert(name.to_owned(), map);
        self.modules.order.push(name.to_owned());
        Ok(self.heap.inc_ref(map))
    }

    /// Tear down the loaded libraries and release their export maps
    pub(crate) fn teardown_modules(&mut self) {
        let mut modules = std::mem::take(&mut self.modules);
        for name in modules.order.iter().rev() {
            if let Some(lib) = modules.registry.get(name.as_str()) {
                lib.teardown(self);
            }
        }
        for (_, map) in modules.loaded.drain() {
            self.heap.dec_ref(map);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::cell::Cell;

    thread_local! {
        static TEARDOWNS: Cell<usize> = const { Cell::new(0) };
    }

    fn answer(ctx: &mut Context, _args: &[ObjRef]) -> Result<ObjRef> {
        ctx.heap.new_int(42)
    }

    struct AnswerLib;

    impl NativeLib for AnswerLib {
        fn name(&self) -> &'static str {
            "answer"
        }

        fn init(&self, _ctx: &mut Context) -> Result<Vec<NativeDecl>> {
            Ok(vec![NativeDecl::new("get", answer, 0)])
        }

        fn teardown(&self, _ctx: &mut Context) {
            TEARDOWNS.with(|c| c.set(c.get() + 1));
        }
    }

    struct SelfImport;

    impl NativeLib for SelfImport {
        fn name(&self) -> &'static str {
            "loop"
        }

        fn init(&self, ctx: &mut Context) -> Result<Vec<NativeDecl>> {
            let map = ctx.import("loop")?;
            ctx.heap.dec_ref(map);
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_import_is_cached() {
        let mut ctx = Context::new(Config::default()).unwrap();
        ctx.register_lib(AnswerLib);
        let first = ctx.import("answer").unwrap();
        let second = ctx.import("answer").unwrap();
        assert_eq!(first, second);
        assert!(ctx.modules.is_loaded("answer"));

        let get = ctx.heap().map_get_str(first, "get").unwrap();
        let r = ctx.call_function(get, &[]).unwrap();
        assert_eq!(ctx.heap().as_int(r), Some(42));

        ctx.heap_mut().dec_ref(r);
        ctx.heap_mut().dec_ref(first);
        ctx.heap_mut().dec_ref(second);
    }

    #[test]
    fn test_teardown_runs_once() {
        TEARDOWNS.with(|c| c.set(0));
        {
            let mut ctx = Context::new(Config::default()).unwrap();
            ctx.register_lib(AnswerLib);
            let map = ctx.import("answer").unwrap();
            ctx.heap_mut().dec_ref(map);
        }
        assert_eq!(TEARDOWNS.with(Cell::get), 1);
    }

    #[test]
    fn test_unknown_library() {
        let mut ctx = Context::new(Config::default()).unwrap();
        let err = ctx.import("nope").unwrap_err();
        assert!(err.is(crate::ErrorKind::Import));
        assert_eq!(err.message, "no library named 'nope' was found");
    }

    #[test]
    fn test_circular_import() {
        let mut ctx = Context::new(Config::default()).unwrap();
        ctx.register_lib(SelfImport);
        let err = ctx.import("loop").unwrap_err();
        assert_eq!(err.message, "circular import of 'loop'");
        assert!(!ctx.modules.is_loaded("loop"));
    }
}
