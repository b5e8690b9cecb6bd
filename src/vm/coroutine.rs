//! Coroutines
//!
//! A coroutine wraps a bytecode function. Calling it runs the function in a
//! nested interpreter loop until the function returns or pauses. Pausing
//! cuts the function's frame out of the runtime stacks and stores it in the
//! coroutine object:
//!
//! ```text
//! values:  [ ... | sentinel | a b c ]   ->  saved.values = [a, b, c]
//! calls:   [ ... | co frame ]           ->  saved.idx, saved vars/globals
//! catches: [ ... | (v, f, r) ]          ->  saved.catches, relative offsets
//! ```
//!
//! Resuming pushes the saved segment back on top of the current stacks,
//! followed by the arguments of the resuming call, which become the result
//! of the pending `pause`.

use tracing::debug;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::gc::Heap;
use crate::runtime::iter::native_iter;
use crate::runtime::object::{Object, Trace};
use crate::value::ObjRef;
use crate::vm::stack::{CatchFrame, Frame};
use crate::vm::var_table::{VARS_NAME, VarTable};

/// Coroutine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoState {
    /// Created, never called
    Suspended = 0,
    Running = 1,
    /// Stopped at a `pause`
    Paused = 2,
    /// Returned or failed
    Ended = 3,
}

impl CoState {
    pub const fn name(self) -> &'static str {
        match self {
            CoState::Suspended => "suspended",
            CoState::Running => "running",
            CoState::Paused => "paused",
            CoState::Ended => "ended",
        }
    }
}

/// Frame of a paused coroutine (all references owned)
#[derive(Debug)]
pub(crate) struct SavedFrame {
    /// Value stack segment above the call sentinel, bottom first
    pub(crate) values: Vec<ObjRef>,
    pub(crate) vars: ObjRef,
    pub(crate) globals: Option<ObjRef>,
    /// Catch frames registered inside the call; `v_len` is relative to the
    /// sentinel and `f_len` to the depth the coroutine was called at
    pub(crate) catches: Vec<CatchFrame>,
    /// Instruction to resume at
    pub(crate) idx: usize,
}

impl SavedFrame {
    fn release(self, heap: &mut Heap) {
        for r in self.values {
            heap.dec_ref(r);
        }
        VarTable::from_parts(self.vars, self.globals).destroy(heap);
    }
}

#[derive(Debug)]
pub struct CoroutineObj {
    pub func: ObjRef,
    pub state: CoState,
    pub(crate) saved: Option<SavedFrame>,
    /// Call stack depth at the time of the running call
    pub(crate) call_depth: usize,
}

impl Trace for CoroutineObj {
    fn trace(&self, visit: &mut dyn FnMut(ObjRef)) {
        visit(self.func);
        if let Some(saved) = &self.saved {
            for &r in &saved.values {
                visit(r);
            }
            visit(saved.vars);
            if let Some(globals) = saved.globals {
                visit(globals);
            }
        }
    }
}

/// Destructor of the `Coroutine` type: break the `_vars_` cycle of the
/// saved locals
pub fn destroy_coroutine(heap: &mut Heap, r: ObjRef) {
    let vars = match heap.get(r) {
        Some(Object::Coroutine(co)) => co.saved.as_ref().map(|s| s.vars),
        _ => None,
    };
    let Some(vars) = vars else {
        return;
    };
    if !matches!(heap.get(vars), Some(Object::Map(_))) {
        return;
    }
    if let Ok(old) = heap.map_drop_str(vars, VARS_NAME) {
        heap.dec_opt(old);
    }
}

impl Heap {
    /// Create a coroutine around a borrowed function
    pub fn new_coroutine(&mut self, func: ObjRef) -> Result<ObjRef> {
        let ty = self.types().coroutine;
        self.inc_ref(func);
        let co = CoroutineObj {
            func,
            state: CoState::Suspended,
            saved: None,
            call_depth: 0,
        };
        self.alloc(ty, Object::Coroutine(co))
    }

    pub fn coroutine(&self, r: ObjRef) -> Result<&CoroutineObj> {
        match self.get(r) {
            Some(Object::Coroutine(co)) => Ok(co),
            _ => Err(self.type_mismatch(self.types().coroutine, r)),
        }
    }

    pub fn coroutine_mut(&mut self, r: ObjRef) -> Result<&mut CoroutineObj> {
        if !matches!(self.get(r), Some(Object::Coroutine(_))) {
            return Err(self.type_mismatch(self.types().coroutine, r));
        }
        match self.get_mut(r) {
            Some(Object::Coroutine(co)) => Ok(co),
            _ => Err(Error::type_error("expected type 'Coroutine'")),
        }
    }
}

impl Context {
    /// Wrap a bytecode function in a coroutine
    pub fn create_coroutine(&mut self, func: ObjRef) -> Result<ObjRef> {
        if self.heap.expect_func(func)?.is_native() {
            return Err(Error::type_error(
                "cannot create a coroutine from a native function",
            ));
        }
        self.heap.new_coroutine(func)
    }

    pub fn coroutine_state(&self, co: ObjRef) -> Result<CoState> {
        Ok(self.heap.coroutine(co)?.state)
    }

    /// Start or resume a coroutine. Returns the value passed to `pause`, or
    /// the function's result once it has ended.
    pub fn call_coroutine(&mut self, co: ObjRef, args: &[ObjRef]) -> Result<ObjRef> {
        let (state, func) = {
            let c = self.heap.coroutine(co)?;
            (c.state, c.func)
        };
        if state == CoState::Running {
            return Err(Error::call_error("the coroutine is already running"));
        }
        if state != CoState::Paused {
            let arity = self.heap.expect_func(func)?.arity;
            if args.len() != arity {
                return Err(Error::wrong_arg_num(arity, args.len()));
            }
        }

        let depth = self.state.calls.len();
        let saved = {
            let c = self.heap.coroutine_mut(co)?;
            c.state = CoState::Running;
            c.call_depth = depth;
            c.saved.take()
        };
        let owned = self.heap.inc_ref(co);
        self.coroutines.push(owned);

        let result = match saved {
            Some(saved) => self.resume_saved(func, saved, args),
            None => self.call_function(func, args),
        };

        if let Some(r) = self.coroutines.pop() {
            if let Ok(c) = self.heap.coroutine_mut(r) {
                if result.is_err() || c.state != CoState::Paused {
                    c.state = CoState::Ended;
                }
                debug!(state = c.state.name(), "coroutine returned");
            }
            self.heap.dec_ref(r);
        }
        result
    }

    fn resume_saved(&mut self, func: ObjRef, saved: SavedFrame, args: &[ObjRef]) -> Result<ObjRef> {
        let items = args.iter().map(|&r| self.heap.inc_ref(r)).collect();
        let pending = match self.heap.new_array(items) {
            Ok(arr) => arr,
            Err(e) => {
                saved.release(&mut self.heap);
                return Err(e);
            }
        };

        let depth = self.state.calls.len();
        let base_v = self.state.values.len();
        self.state.values.push_sentinel();
        for r in saved.values {
            self.state.values.push_owned(r);
        }
        self.state.values.push_owned(pending);

        let catches = saved
            .catches
            .iter()
            .map(|c| CatchFrame {
                v_len: c.v_len + base_v,
                f_len: c.f_len + depth,
                resume: c.resume,
            })
            .collect();
        let table = VarTable::from_parts(saved.vars, saved.globals);
        self.run_in_table(func, saved.idx, table, catches)
    }

    /// Suspend the running coroutine, handing `value` (borrowed) to the
    /// caller of [`call_coroutine`](Self::call_coroutine)
    pub fn pause_coroutine(&mut self, value: ObjRef) -> Result<ObjRef> {
        let Some(&co) = self.coroutines.last() else {
            return Err(Error::call_error("the function was not called with 'call'"));
        };
        let (func, state, call_depth) = {
            let c = self.heap.coroutine(co)?;
            (c.func, c.state, c.call_depth)
        };
        if self.state.calls.top_func() != Some(func) {
            return Err(Error::call_error(
                "the top function does not match the coroutine",
            ));
        }
        let own_table = self
            .state
            .calls
            .peek()
            .is_some_and(|f| f.caller_vt.is_some());
        if state != CoState::Running || self.state.calls.len() != call_depth + 1 || !own_table {
            return Err(Error::call_error("the function was not called with 'call'"));
        }
        let Some(frame) = self.state.calls.pop() else {
            return Err(Error::call_error("the function was not called with 'call'"));
        };

        let Frame {
            func: frame_func,
            cwd,
            caller_vt,
            resume,
            catch_len,
            ..
        } = frame;
        let idx = self.state.idx;
        let table = match caller_vt {
            Some(vt) => std::mem::replace(&mut self.state.vt, vt),
            None => return Err(Error::call_error("the function was not called with 'call'")),
        };
        self.state.idx = resume;
        self.state.cwd = cwd;
        self.heap.dec_ref(frame_func);

        let values = self.state.values.take_frame();
        let base_v = self.state.values.len();
        let catches = self
            .state
            .catches
            .split_off(catch_len)
            .into_iter()
            .map(|c| CatchFrame {
                v_len: c.v_len.saturating_sub(base_v),
                f_len: c.f_len.saturating_sub(call_depth),
                resume: c.resume,
            })
            .collect();

        let (vars, globals) = table.into_parts();
        let c = self.heap.coroutine_mut(co)?;
        c.saved = Some(SavedFrame {
            values,
            vars,
            globals,
            catches,
            idx,
        });
        c.state = CoState::Paused;
        Ok(self.heap.inc_ref(value))
    }

    /// Drop the saved frame of a paused coroutine so that the next call
    /// starts from the beginning
    pub fn reset_coroutine(&mut self, co: ObjRef) -> Result<()> {
        let c = self.heap.coroutine_mut(co)?;
        if c.state == CoState::Running {
            return Err(Error::call_error("the coroutine is already running"));
        }
        let saved = c.saved.take();
        c.state = CoState::Suspended;
        if let Some(saved) = saved {
            saved.release(&mut self.heap);
        }
        Ok(())
    }

    /// Iterator over the values a zero-parameter coroutine pauses with
    pub fn new_generator(&mut self, co: ObjRef) -> Result<ObjRef> {
        let func = self.heap.coroutine(co)?.func;
        let arity = self.heap.expect_func(func)?.arity;
        if arity != 0 {
            return Err(Error::call_error(
                "a generator needs a coroutine that takes no arguments",
            ));
        }
        let co = self.heap.inc_ref(co);
        let value = self.heap.null();
        let state = self.heap.new_array(vec![co, value])?;
        native_iter(
            &mut self.heap,
            "generator",
            [gen_start, gen_is_done, gen_get_val],
            state,
        )
    }
}

fn gen_state(args: &[ObjRef]) -> Result<ObjRef> {
    args.first()
        .copied()
        .ok_or_else(|| Error::wrong_arg_num(1, 0))
}

/// Run the coroutine to its next pause and store the value
fn gen_advance(ctx: &mut Context, state: ObjRef) -> Result<()> {
    let co = ctx.heap.seq_get(state, 0)?;
    let value = ctx.call_coroutine(co, &[])?;
    let result = ctx.heap.seq_set(state, 1, value);
    ctx.heap.dec_ref(value);
    result
}

fn gen_start(ctx: &mut Context, args: &[ObjRef]) -> Result<ObjRef> {
    let state = gen_state(args)?;
    let co = ctx.heap.seq_get(state, 0)?;
    ctx.reset_coroutine(co)?;
    gen_advance(ctx, state)?;
    Ok(ctx.heap.null())
}

fn gen_is_done(ctx: &mut Context, args: &[ObjRef]) -> Result<ObjRef> {
    let state = gen_state(args)?;
    let co = ctx.heap.seq_get(state, 0)?;
    let done = ctx.coroutine_state(co)? == CoState::Ended;
    Ok(ctx.heap.bool_obj(done))
}

fn gen_get_val(ctx: &mut Context, args: &[ObjRef]) -> Result<ObjRef> {
    let state = gen_state(args)?;
    let current = ctx.heap.seq_get(state, 1)?;
    let current = ctx.heap.inc_ref(current);
    if let Err(e) = gen_advance(ctx, state) {
        ctx.heap.dec_ref(current);
        return Err(e);
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble_all;
    use crate::config::Config;

    fn load(ctx: &mut Context, src: &str) -> Vec<(String, ObjRef)> {
        assemble_all(ctx, src, "co.nsa").unwrap()
    }

    fn find(funcs: &[(String, ObjRef)], name: &str) -> ObjRef {
        funcs.iter().find(|(n, _)| n == name).unwrap().1
    }

    fn release(ctx: &mut Context, funcs: Vec<(String, ObjRef)>) {
        for (_, f) in funcs {
            ctx.heap_mut().dec_ref(f);
        }
    }

    const COUNTER: &str = "
func counter(start)
    GET_VAL start
    SET_VAL_LOC n
again:
    PUSH_VAL \"co\"
    OP_IMPORT
    PUSH_VAL \"pause\"
    OP_EXTRACT
    SET_VAL_LOC pause
    GET_VAL n
    GET_VAL pause
    OP_CALL 1
    SET_VAL_LOC got
    GET_VAL n
    PUSH_VAL 1
    STACK_OP +
    SET_VAL_LOC n
    JUMP @again
end
";

    #[test]
    fn test_round_trip() {
        let mut ctx = Context::new(Config::default()).unwrap();
        let funcs = load(&mut ctx, COUNTER);
        let counter = find(&funcs, "counter");
        let co = ctx.create_coroutine(counter).unwrap();
        assert_eq!(ctx.coroutine_state(co).unwrap(), CoState::Suspended);

        let start = ctx.heap_mut().new_int(10).unwrap();
        let first = ctx.call_coroutine(co, &[start]).unwrap();
        assert_eq!(ctx.heap().as_int(first), Some(10));
        assert_eq!(ctx.coroutine_state(co).unwrap(), CoState::Paused);
        assert_eq!(ctx.value_stack_len(), 0);
        assert_eq!(ctx.call_depth(), 0);

        let x = ctx.heap_mut().new_str("x").unwrap();
        let second = ctx.call_coroutine(co, &[x]).unwrap();
        // `n` persisted across the pause
        assert_eq!(ctx.heap().as_int(second), Some(11));

        // the pending pause evaluated to the new arguments
        let saved_vars = ctx.heap().coroutine(co).unwrap().saved.as_ref().unwrap().vars;
        let got = ctx.heap().map_get_str(saved_vars, "got").unwrap();
        let items = ctx.heap().seq_items(got).unwrap();
        assert_eq!(items, vec![x]);

        for r in [start, first, x, second, co] {
            ctx.heap_mut().dec_ref(r);
        }
        release(&mut ctx, funcs);
    }

    #[test]
    fn test_arity_and_native_errors() {
        let mut ctx = Context::new(Config::default()).unwrap();
        let funcs = load(&mut ctx, COUNTER);
        let co = ctx.create_coroutine(find(&funcs, "counter")).unwrap();
        let err = ctx.call_coroutine(co, &[]).unwrap_err();
        assert!(err.is(crate::ErrorKind::Call));
        assert_eq!(ctx.coroutine_state(co).unwrap(), CoState::Suspended);

        let lib = ctx.import("co").unwrap();
        let create = ctx.heap().map_get_str(lib, "create").unwrap();
        let err = ctx.create_coroutine(create).unwrap_err();
        assert_eq!(err.message, "cannot create a coroutine from a native function");

        ctx.heap_mut().dec_ref(lib);
        ctx.heap_mut().dec_ref(co);
        release(&mut ctx, funcs);
    }

    #[test]
    fn test_pause_outside_coroutine() {
        let mut ctx = Context::new(Config::default()).unwrap();
        let null = ctx.heap().consts().null;
        let err = ctx.pause_coroutine(null).unwrap_err();
        assert_eq!(err.message, "the function was not called with 'call'");
    }

    #[test]
    fn test_ends_on_return() {
        let src = "
func once()
    PUSH_VAL 5
    RETURN_VAL
end
";
        let mut ctx = Context::new(Config::default()).unwrap();
        let funcs = load(&mut ctx, src);
        let co = ctx.create_coroutine(find(&funcs, "once")).unwrap();
        let r = ctx.call_coroutine(co, &[]).unwrap();
        assert_eq!(ctx.heap().as_int(r), Some(5));
        assert_eq!(ctx.coroutine_state(co).unwrap(), CoState::Ended);
        ctx.heap_mut().dec_ref(r);
        ctx.heap_mut().dec_ref(co);
        release(&mut ctx, funcs);
    }

    #[test]
    fn test_error_ends_coroutine() {
        let src = "
func bad()
    PUSH_VAL 1
    PUSH_VAL \"a\"
    STACK_OP -
    RETURN_VAL
end
";
        let mut ctx = Context::new(Config::default()).unwrap();
        let funcs = load(&mut ctx, src);
        let co = ctx.create_coroutine(find(&funcs, "bad")).unwrap();
        assert!(ctx.call_coroutine(co, &[]).is_err());
        assert_eq!(ctx.coroutine_state(co).unwrap(), CoState::Ended);
        assert_eq!(ctx.call_depth(), 0);
        ctx.heap_mut().dec_ref(co);
        release(&mut ctx, funcs);
    }

    #[test]
    fn test_generator() {
        // pauses with 0, 1, 2 and returns
        let src = "
func three()
    PUSH_VAL \"co\"
    OP_IMPORT
    PUSH_VAL \"pause\"
    OP_EXTRACT
    SET_VAL_LOC pause
    PUSH_VAL 0
    PUSH_VAL 3
    OP_RANGE 2
    FOR_START
    POP_VAL
loop:
    FOR_IS_DONE
    JUMPIF_T @done
    FOR_GET_VAL
    GET_VAL pause
    OP_CALL 1
    POP_VAL
    JUMP @loop
done:
    POP_VAL
    PUSH_VAL null
    RETURN_VAL
end
";
        let mut ctx = Context::new(Config::default()).unwrap();
        let funcs = load(&mut ctx, src);
        let co = ctx.create_coroutine(find(&funcs, "three")).unwrap();
        let iter = ctx.new_generator(co).unwrap();
        let parts = ctx.heap().iter_parts(iter).unwrap();

        let mut seen = Vec::new();
        let r = ctx.call_function(parts.start, &[parts.value]).unwrap();
        ctx.heap_mut().dec_ref(r);
        loop {
            let done = ctx.call_function(parts.is_done, &[parts.value]).unwrap();
            let finished = ctx.heap().truthy(done);
            ctx.heap_mut().dec_ref(done);
            if finished {
                break;
            }
            let v = ctx.call_function(parts.get_val, &[parts.value]).unwrap();
            seen.push(ctx.heap().as_int(v).unwrap());
            ctx.heap_mut().dec_ref(v);
        }
        assert_eq!(seen, vec![0, 1, 2]);

        // restarting replays from the beginning
        let r = ctx.call_function(parts.start, &[parts.value]).unwrap();
        ctx.heap_mut().dec_ref(r);
        let v = ctx.call_function(parts.get_val, &[parts.value]).unwrap();
        assert_eq!(ctx.heap().as_int(v), Some(0));

        for r in [v, iter, co] {
            ctx.heap_mut().dec_ref(r);
        }
        release(&mut ctx, funcs);
    }

    #[test]
    fn test_catch_frame_survives_pause() {
        let src = "
func guarded()
    PUSH_CATCH @handler
    PUSH_VAL \"co\"
    OP_IMPORT
    PUSH_VAL \"pause\"
    OP_EXTRACT
    SET_VAL_LOC pause
    PUSH_VAL 1
    GET_VAL pause
    OP_CALL 1
    POP_VAL
    PUSH_VAL \"Boom\"
    PUSH_VAL \"raised after resume\"
    THROW_ERR
handler:
    POP_CATCH
    SAVE_ERROR
    PUSH_VAL \"name\"
    OP_EXTRACT
    RETURN_VAL
end
";
        let mut ctx = Context::new(Config::default()).unwrap();
        let funcs = load(&mut ctx, src);
        let co = ctx.create_coroutine(find(&funcs, "guarded")).unwrap();
        let first = ctx.call_coroutine(co, &[]).unwrap();
        assert_eq!(ctx.heap().as_int(first), Some(1));
        assert!(ctx.state.catches.is_empty());

        let name = ctx.call_coroutine(co, &[]).unwrap();
        assert_eq!(ctx.heap().as_str(name), Some("Boom"));
        assert_eq!(ctx.coroutine_state(co).unwrap(), CoState::Ended);
        for r in [first, name, co] {
            ctx.heap_mut().dec_ref(r);
        }
        release(&mut ctx, funcs);
    }
}
