//! Execution context
//!
//! The [`Context`] is the main entry point of the VM. It owns the heap, the
//! runtime stacks, the top-level variable table, the loaded native
//! libraries and the stack of running coroutines. Everything that the
//! interpreter reaches is owned (directly or through a chain of references)
//! by one of these, so nothing else has to be scanned for roots.

use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Result, Traceback};
use crate::gc::{GcStats, Heap, HeapStats};
use crate::native::ModuleTable;
use crate::native::co::CoLib;
use crate::value::ObjRef;
use crate::vm::stack::{CallStack, CatchStack, ValueStack};
use crate::vm::var_table::VarTable;

/// State of the running program
pub(crate) struct ExecState {
    pub(crate) traceback: Traceback,
    /// Variable table of the running function
    pub(crate) vt: VarTable,
    /// Next instruction of the running function
    pub(crate) idx: usize,
    pub(crate) cwd: Rc<Path>,
    /// Program arguments (Array of Str, owned)
    pub(crate) argv: ObjRef,
    pub(crate) values: ValueStack,
    pub(crate) calls: CallStack,
    pub(crate) catches: CatchStack,
}

/// Nest execution context
pub struct Context {
    pub(crate) heap: Heap,
    pub(crate) state: ExecState,
    /// Running coroutines, innermost last (owned)
    pub(crate) coroutines: Vec<ObjRef>,
    pub(crate) modules: ModuleTable,
    config: Config,
    pub(crate) interrupt: Arc<AtomicBool>,
}

impl Context {
    /// Create a context with a fresh heap and the default libraries
    pub fn new(config: Config) -> Result<Self> {
        let mut heap = Heap::new(config.heap.clone())?;

        let mut args = Vec::with_capacity(config.argv.len());
        for arg in &config.argv {
            match heap.new_str(arg.as_str()) {
                Ok(s) => args.push(s),
                Err(e) => {
                    heap.delete_all();
                    return Err(e);
                }
            }
        }
        let argv = heap.new_array(args)?;
        let cwd_str = heap.new_str(config.cwd.display().to_string())?;
        let vt = VarTable::top_level(&mut heap, cwd_str, argv, config.no_default);
        heap.dec_ref(cwd_str);
        let vt = vt?;

        let state = ExecState {
            traceback: Traceback::new(),
            vt,
            idx: 0,
            cwd: Rc::from(config.cwd.as_path()),
            argv,
            values: ValueStack::new(),
            calls: CallStack::new(config.max_recursion),
            catches: CatchStack::new(),
        };

        let mut ctx = Context {
            heap,
            state,
            coroutines: Vec::new(),
            modules: ModuleTable::default(),
            config,
            interrupt: Arc::new(AtomicBool::new(false)),
        };
        ctx.register_lib(CoLib);

        debug!(
            objects = ctx.heap.stats().live,
            no_default = ctx.config.no_default,
            "context created"
        );
        Ok(ctx)
    }

    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    #[inline]
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Pending error and the positions collected while unwinding it
    pub fn traceback(&self) -> &Traceback {
        &self.state.traceback
    }

    /// Print-ready trace of the pending error
    pub fn render_traceback(&self) -> String {
        self.state.traceback.render(self.config.color)
    }

    /// Local map of the running code; the top-level map when idle
    pub fn globals(&self) -> ObjRef {
        self.state.vt.vars()
    }

    /// Borrowed value of a top-level variable
    pub fn get_global(&self, name: &str) -> Option<ObjRef> {
        self.heap.map_get_str(self.state.vt.vars(), name)
    }

    /// Bind a top-level variable (value borrowed)
    pub fn set_global(&mut self, name: &str, value: ObjRef) -> Result<()> {
        let vars = self.state.vt.vars();
        self.heap.map_set_str(vars, name, value)
    }

    /// Program arguments as an Array of Str (borrowed)
    pub fn argv(&self) -> ObjRef {
        self.state.argv
    }

    pub fn cwd(&self) -> &Path {
        &self.state.cwd
    }

    pub fn value_stack_len(&self) -> usize {
        self.state.values.len()
    }

    pub fn call_depth(&self) -> usize {
        self.state.calls.len()
    }

    /// Flag checked before every instruction; setting it raises an
    /// `Interrupt` error in the running program
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Run a full collection
    pub fn collect(&mut self) -> usize {
        self.heap.collect_all()
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    pub fn gc_stats(&self) -> GcStats {
        self.heap.gc_stats()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.state.values.clear(&mut self.heap);
        if !self.state.calls.is_empty() {
            warn!(frames = self.state.calls.len(), "context dropped with active frames");
        }
        while !self.state.calls.is_empty() {
            self.finish_call();
        }
        self.state.vt.release(&mut self.heap);

        for co in std::mem::take(&mut self.coroutines) {
            self.heap.dec_ref(co);
        }
        self.teardown_modules();
        self.heap.dec_ref(self.state.argv);

        let live = self.heap.stats().live;
        self.heap.delete_all();
        debug!(live, "context destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::var_table::{ARGS_NAME, CWD_NAME};

    #[test]
    fn test_create_context() {
        let ctx = Context::new(Config::default()).unwrap();
        assert_eq!(ctx.value_stack_len(), 0);
        assert_eq!(ctx.call_depth(), 0);
        assert!(!ctx.traceback().occurred());
    }

    #[test]
    fn test_default_bindings() {
        let config = Config::default()
            .with_cwd("/srv/nest")
            .with_argv(["prog.nsa", "--fast"]);
        let ctx = Context::new(config).unwrap();

        let cwd = ctx.get_global(CWD_NAME).unwrap();
        assert_eq!(ctx.heap().as_str(cwd), Some("/srv/nest"));

        let args = ctx.get_global(ARGS_NAME).unwrap();
        assert_eq!(args, ctx.argv());
        let items = ctx.heap().seq_items(args).unwrap();
        assert_eq!(ctx.heap().as_str(items[1]), Some("--fast"));

        let str_ty = ctx.heap().types().str;
        assert_eq!(ctx.get_global("Str"), Some(str_ty));
    }

    #[test]
    fn test_no_default() {
        let ctx = Context::new(Config::default().with_no_default(true)).unwrap();
        assert!(ctx.get_global("Int").is_none());
        assert!(ctx.get_global("_vars_").is_some());
    }

    #[test]
    fn test_set_global() {
        let mut ctx = Context::new(Config::default()).unwrap();
        let value = ctx.heap_mut().new_int(12).unwrap();
        ctx.set_global("answer", value).unwrap();
        ctx.heap_mut().dec_ref(value);
        let got = ctx.get_global("answer").unwrap();
        assert_eq!(ctx.heap().as_int(got), Some(12));
    }

    #[test]
    fn test_collect_cycle_through_globals() {
        let mut ctx = Context::new(Config::default()).unwrap();
        let a = ctx.heap_mut().new_map().unwrap();
        let b = ctx.heap_mut().new_map().unwrap();
        ctx.heap_mut().map_set_str(a, "peer", b).unwrap();
        ctx.heap_mut().map_set_str(b, "peer", a).unwrap();
        ctx.set_global("a", a).unwrap();
        ctx.heap_mut().dec_ref(a);
        ctx.heap_mut().dec_ref(b);

        // reachable from the top-level table
        ctx.collect();
        assert!(ctx.heap().get(a).is_some());

        let vars = ctx.globals();
        let old = ctx.heap_mut().map_drop_str(vars, "a").unwrap();
        ctx.heap_mut().dec_opt(old);
        ctx.collect();
        assert!(ctx.heap().get(a).is_none());
        assert!(ctx.heap().get(b).is_none());
    }
}
