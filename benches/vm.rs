//! Benchmarks for the bytecode compiler and VM.

use corvid::ast::build::*;
use corvid::ast::{BinaryOp, Program};
use corvid::config::VmConfig;
use corvid::vm::{Compiler, Vm};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn quiet_vm() -> Vm {
    Vm::with_config(VmConfig {
        print_uncaught: false,
        ..VmConfig::default()
    })
    .expect("valid config")
}

/// Compile and run on a fresh VM.
fn run_vm(program: &Program) {
    let module = Compiler::compile(program).expect("compile error");
    let mut vm = quiet_vm();
    vm.eval_module("__main__", &module).expect("vm runtime error");
}

/// `fun fib(n) if n < 2 then return n end return fib(n-1) + fib(n-2) end; var result = fib(n)`
fn fib_recursive(n: f64) -> Program {
    let sub = |k: f64| binary(var("n"), BinaryOp::Subtract, num(k));
    program(vec![
        fun(
            "fib",
            &["n"],
            vec![
                if_(
                    binary(var("n"), BinaryOp::Less, num(2.0)),
                    vec![ret(Some(var("n")))],
                    None,
                ),
                ret(Some(binary(
                    call_named("fib", vec![sub(1.0)]),
                    BinaryOp::Add,
                    call_named("fib", vec![sub(2.0)]),
                ))),
            ],
        ),
        var_decl("result", Some(call_named("fib", vec![num(n)]))),
    ])
}

/// Sum of 0..n in a C-style loop over a local.
fn loop_sum(n: f64) -> Program {
    program(vec![
        fun(
            "main",
            &[],
            vec![
                var_decl("sum", Some(num(0.0))),
                for_(
                    Some(var_decl("i", Some(num(0.0)))),
                    Some(binary(var("i"), BinaryOp::Less, num(n))),
                    Some(compound(var("i"), BinaryOp::Add, num(1.0))),
                    vec![expr(compound(var("sum"), BinaryOp::Add, var("i")))],
                ),
                ret(Some(var("sum"))),
            ],
        ),
        expr(call_named("main", vec![])),
    ])
}

/// A closure counter called n times.
fn closure_calls(n: f64) -> Program {
    program(vec![
        fun(
            "counter",
            &[],
            vec![
                var_decl("count", Some(num(0.0))),
                fun(
                    "inc",
                    &[],
                    vec![expr(compound(var("count"), BinaryOp::Add, num(1.0)))],
                ),
                ret(Some(var("inc"))),
            ],
        ),
        var_decl("inc", Some(call_named("counter", vec![]))),
        for_(
            Some(var_decl("i", Some(num(0.0)))),
            Some(binary(var("i"), BinaryOp::Less, num(n))),
            Some(compound(var("i"), BinaryOp::Add, num(1.0))),
            vec![expr(call_named("inc", vec![]))],
        ),
    ])
}

/// Build a list of n elements, then iterate it with `for in`.
fn list_build_iterate(n: f64) -> Program {
    program(vec![
        var_decl("items", Some(list(vec![]))),
        for_(
            Some(var_decl("i", Some(num(0.0)))),
            Some(binary(var("i"), BinaryOp::Less, num(n))),
            Some(compound(var("i"), BinaryOp::Add, num(1.0))),
            vec![expr(invoke(var("items"), "add", vec![var("i")]))],
        ),
        var_decl("total", Some(num(0.0))),
        for_each(
            &["x"],
            var("items"),
            vec![expr(compound(var("total"), BinaryOp::Add, var("x")))],
        ),
    ])
}

fn fibonacci(c: &mut Criterion) {
    let mut group = c.benchmark_group("fib_recursive");
    for n in [10.0, 15.0, 20.0] {
        let program = fib_recursive(n);
        group.bench_with_input(BenchmarkId::new("vm", n), &program, |b, p| {
            b.iter(|| run_vm(black_box(p)))
        });
    }
    group.finish();
}

fn loops(c: &mut Criterion) {
    let program = loop_sum(100_000.0);
    c.bench_function("loop_sum_100k", |b| b.iter(|| run_vm(black_box(&program))));
}

fn closures(c: &mut Criterion) {
    let program = closure_calls(50_000.0);
    c.bench_function("closure_calls_50k", |b| {
        b.iter(|| run_vm(black_box(&program)))
    });
}

fn collections(c: &mut Criterion) {
    let program = list_build_iterate(20_000.0);
    c.bench_function("list_build_iterate_20k", |b| {
        b.iter(|| run_vm(black_box(&program)))
    });
}

/// Benchmark compilation time alone (not execution).
fn compilation_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("compilation_overhead");

    let program = fib_recursive(20.0);
    group.bench_function("compile_fib", |b| {
        b.iter(|| Compiler::compile(black_box(&program)).unwrap())
    });

    let program = list_build_iterate(10.0);
    group.bench_function("compile_collections", |b| {
        b.iter(|| Compiler::compile(black_box(&program)).unwrap())
    });

    group.finish();
}

criterion_group!(
    benches,
    fibonacci,
    loops,
    closures,
    collections,
    compilation_overhead,
);

criterion_main!(benches);
