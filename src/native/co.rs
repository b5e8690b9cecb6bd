//! The `co` library: coroutines for Nest programs
//!
//! ```text
//! create(func)        -> Coroutine
//! call(co, args)      -> value passed to pause, or the result
//! pause(value)        -> arguments of the resuming call
//! get_state(co)       -> 0 suspended, 1 running, 2 paused, 3 ended
//! generator(co)       -> Iter over the paused values
//! ```

use crate::context::Context;
use crate::error::{Error, Result};
use crate::native::{NativeDecl, NativeLib};
use crate::value::ObjRef;

pub struct CoLib;

impl NativeLib for CoLib {
    fn name(&self) -> &'static str {
        "co"
    }

    fn init(&self, _ctx: &mut Context) -> Result<Vec<NativeDecl>> {
        Ok(vec![
            NativeDecl::new("create", co_create, 1),
            NativeDecl::new("call", co_call, 2),
            NativeDecl::new("pause", co_pause, 1),
            NativeDecl::new("get_state", co_get_state, 1),
            NativeDecl::new("generator", co_generator, 1),
        ])
    }
}

fn arg(args: &[ObjRef], i: usize) -> Result<ObjRef> {
    args.get(i)
        .copied()
        .ok_or_else(|| Error::wrong_arg_num(i + 1, args.len()))
}

fn co_create(ctx: &mut Context, args: &[ObjRef]) -> Result<ObjRef> {
    let func = arg(args, 0)?;
    ctx.create_coroutine(func)
}

fn co_call(ctx: &mut Context, args: &[ObjRef]) -> Result<ObjRef> {
    let co = arg(args, 0)?;
    let call_args = arg(args, 1)?;
    let items = if ctx.heap.is_null(call_args) {
        Vec::new()
    } else {
        ctx.heap.seq_items(call_args)?
    };
    // keep the arguments alive while the coroutine runs
    for &r in &items {
        ctx.heap.inc_ref(r);
    }
    let result = ctx.call_coroutine(co, &items);
    for r in items {
        ctx.heap.dec_ref(r);
    }
    result
}

fn co_pause(ctx: &mut Context, args: &[ObjRef]) -> Result<ObjRef> {
    let value = arg(args, 0)?;
    ctx.pause_coroutine(value)
}

fn co_get_state(ctx: &mut Context, args: &[ObjRef]) -> Result<ObjRef> {
    let co = arg(args, 0)?;
    let state = ctx.coroutine_state(co)?;
    ctx.heap.new_int(state as i64)
}

fn co_generator(ctx: &mut Context, args: &[ObjRef]) -> Result<ObjRef> {
    let co = arg(args, 0)?;
    ctx.new_generator(co)
}

#[cfg(test)]
mod tests {
    use crate::asm::assemble;
    use crate::config::Config;
    use crate::context::Context;

    fn run_int(src: &str) -> i64 {
        let mut ctx = Context::new(Config::default()).unwrap();
        let main = assemble(&mut ctx, src, "co.nsa").unwrap();
        let r = ctx.run_program(main).unwrap();
        let value = ctx.heap().as_int(r).unwrap();
        ctx.heap_mut().dec_ref(r);
        ctx.heap_mut().dec_ref(main);
        value
    }

    #[test]
    fn test_states_from_bytecode() {
        // state after create (0) * 10 + state after a pause (2)
        let src = "
func body()
    PUSH_VAL null
    GET_VAL co
    PUSH_VAL \"pause\"
    OP_EXTRACT
    OP_CALL 1
    RETURN_VAL
end

func main()
    PUSH_VAL \"co\"
    OP_IMPORT
    SET_VAL_LOC co
    PUSH_VAL &body
    GET_VAL co
    PUSH_VAL \"create\"
    OP_EXTRACT
    OP_CALL 1
    SET_VAL_LOC c
    GET_VAL c
    GET_VAL co
    PUSH_VAL \"get_state\"
    OP_EXTRACT
    OP_CALL 1
    PUSH_VAL 10
    STACK_OP *
    GET_VAL c
    PUSH_VAL null
    GET_VAL co
    PUSH_VAL \"call\"
    OP_EXTRACT
    OP_CALL 2
    POP_VAL
    GET_VAL c
    GET_VAL co
    PUSH_VAL \"get_state\"
    OP_EXTRACT
    OP_CALL 1
    STACK_OP +
    RETURN_VAL
end
";
        assert_eq!(run_int(src), 2);
    }
}
