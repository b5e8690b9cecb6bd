use criterion::{Criterion, black_box, criterion_group, criterion_main};
use nestvm::asm::assemble;
use nestvm::{Config, Context};

fn run(src: &str) -> i64 {
    let mut ctx = Context::new(Config::default()).unwrap();
    let main = assemble(&mut ctx, src, "bench.nsa").unwrap();
    let r = ctx.run_program(main).unwrap();
    let value = ctx.heap().as_int(r).unwrap();
    ctx.heap_mut().dec_ref(r);
    ctx.heap_mut().dec_ref(main);
    value
}

fn bench_loop(c: &mut Criterion) {
    let code = "
func main()
    PUSH_VAL 0
    SET_VAL_LOC total
    PUSH_VAL 0
    PUSH_VAL 10000
    OP_RANGE 2
    FOR_START
    POP_VAL
loop:
    FOR_IS_DONE
    JUMPIF_T @done
    FOR_GET_VAL
    GET_VAL total
    STACK_OP +
    SET_VAL_LOC total
    JUMP @loop
done:
    POP_VAL
    GET_VAL total
    RETURN_VAL
end
";

    c.bench_function("range loop 10k", |b| b.iter(|| black_box(run(code))));
}

fn bench_fib(c: &mut Criterion) {
    let code = "
func fib(n)
    GET_VAL n
    PUSH_VAL 2
    STACK_OP <
    JUMPIF_F @rec
    GET_VAL n
    RETURN_VAL
rec:
    GET_VAL n
    PUSH_VAL 1
    STACK_OP -
    PUSH_VAL &fib
    OP_CALL 1
    GET_VAL n
    PUSH_VAL 2
    STACK_OP -
    PUSH_VAL &fib
    OP_CALL 1
    STACK_OP +
    RETURN_VAL
end

func main()
    PUSH_VAL 20
    PUSH_VAL &fib
    OP_CALL 1
    RETURN_VAL
end
";

    c.bench_function("fib 20", |b| b.iter(|| black_box(run(code))));
}

fn bench_map_insert(c: &mut Criterion) {
    let code = "
func main()
    MAKE_MAP 0
    SET_VAL_LOC m
    PUSH_VAL 0
    PUSH_VAL 1000
    OP_RANGE 2
    FOR_START
    POP_VAL
loop:
    FOR_IS_DONE
    JUMPIF_T @done
    FOR_GET_VAL
    SET_VAL_LOC i
    GET_VAL i
    GET_VAL m
    GET_VAL i
    SET_CONT_LOC
    JUMP @loop
done:
    POP_VAL
    GET_VAL m
    LOCAL_OP len
    RETURN_VAL
end
";

    c.bench_function("map insert 1k", |b| b.iter(|| black_box(run(code))));
}

fn bench_cycle_collection(c: &mut Criterion) {
    c.bench_function("collect 1k self cycles", |b| {
        b.iter(|| {
            let mut ctx = Context::new(Config::default()).unwrap();
            for _ in 0..1000 {
                let heap = ctx.heap_mut();
                let m = heap.new_map().unwrap();
                heap.map_set_str(m, "self", m).unwrap();
                heap.dec_ref(m);
            }
            black_box(ctx.collect())
        })
    });
}

criterion_group!(
    benches,
    bench_loop,
    bench_fib,
    bench_map_insert,
    bench_cycle_collection,
);
criterion_main!(benches);
