//! End-to-end scenarios: parse text IR, assemble, retarget to the host,
//! load into memory, and call the result — exercising the public API the
//! way an embedder (or the `jasmine` CLI's `--run`) would, without going
//! through the binary itself.

use jasmine::common::intern_global;
use jasmine::object::{ArchTag, Object, OsTag};
use jasmine::target::host_target;

fn build_and_load(src: &str) -> Object {
    let parsed = jasmine::ir::text::parse(src).expect("text IR should parse");
    let mut jasmine_obj = Object::new(ArchTag::Jasmine, OsTag::None);
    jasmine_obj.code = jasmine::ir::binary::assemble(&parsed.insns);
    jasmine_obj.types = parsed.types;

    let target = host_target();
    let mut native = jasmine_obj.retarget(target.as_ref()).expect("retarget should succeed");
    native.load().expect("load should succeed");
    native
}

fn call_i64(obj: &Object, name: &str) -> i64 {
    let addr = obj.loaded_address(intern_global(name)).expect("entry point should be defined");
    let f: extern "C" fn() -> i64 = unsafe { std::mem::transmute(addr) };
    f()
}

#[test]
fn arithmetic_expression_returns_eleven() {
    let src = r#"
        foo: frame
        mov i64 %0,1
        mov i64 %1,2
        add i64 %2,%0,%1
        mul i64 %2,%2,3
        div i64 %3,%1,%0
        add i64 %3,%2,%3
        ret i64 %3
    "#;
    let obj = build_and_load(src);
    assert_eq!(call_i64(&obj, "foo"), 11);
}

#[test]
fn loop_returns_ten() {
    let src = r#"
        foo: frame
        mov i64 %0,1
        rep: jeq i64 end %0,10
        add i64 %0,%0,1
        jump rep
        end: ret i64 %0
    "#;
    let obj = build_and_load(src);
    assert_eq!(call_i64(&obj, "foo"), 10);
}

#[test]
fn recursive_fib_of_ten_is_fifty_five() {
    let src = r#"
        fib: frame
        param i64 %0
        jge i64 rec %0,2
        ret i64 %0
        rec: sub i64 %0,%0,1
        call i64 %1,fib(i64 %0)
        sub i64 %0,%0,1
        call i64 %2,fib(i64 %0)
        add i64 %1,%1,%2
        ret i64 %1
    "#;
    let obj = build_and_load(src);
    let addr = obj.loaded_address(intern_global("fib")).unwrap();
    let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(addr) };
    assert_eq!(f(10), 55);
}

#[test]
fn struct_field_access_returns_three() {
    let src = r#"
        type Pair{left:i64,right:i64}
        foo: frame
        local Pair %0
        mov i64 [%0+Pair.left],1
        mov i64 [%0+Pair.right],2
        mov i64 %1,[%0+Pair.left]
        add i64 %1,%1,[%0+Pair.right]
        ret i64 %1
    "#;
    let obj = build_and_load(src);
    assert_eq!(call_i64(&obj, "foo"), 3);
}

#[test]
fn struct_dot_product_of_orthogonal_vectors_is_zero() {
    let src = r#"
        type Triple{a:i64,b:i64,c:i64}
        dot: frame
        local Triple %0
        local Triple %1
        mov i64 [%0+Triple.a],0
        mov i64 [%0+Triple.b],1
        mov i64 [%0+Triple.c],0
        mov i64 [%1+Triple.a],1
        mov i64 [%1+Triple.b],0
        mov i64 [%1+Triple.c],0
        mov i64 %2,[%0+Triple.a]
        mul i64 %2,%2,[%1+Triple.a]
        mov i64 %3,[%0+Triple.b]
        mul i64 %3,%3,[%1+Triple.b]
        add i64 %2,%2,%3
        mov i64 %3,[%0+Triple.c]
        mul i64 %3,%3,[%1+Triple.c]
        add i64 %2,%2,%3
        ret i64 %2
    "#;
    let obj = build_and_load(src);
    assert_eq!(call_i64(&obj, "dot"), 0);
}

#[test]
fn div_and_rem_by_power_of_two_truncate_toward_zero_for_negative_operands() {
    let src = r#"
        foo: frame
        mov i64 %0,-7
        div i64 %1,%0,4
        rem i64 %2,%0,4
        mul i64 %1,%1,100
        add i64 %1,%1,%2
        ret i64 %1
    "#;
    let obj = build_and_load(src);
    // -7 / 4 truncates to -1 and -7 % 4 is -3 (C/Rust `/`/`%` semantics),
    // not the -2/1 a floor-rounding `sar`/`and` peephole would give.
    assert_eq!(call_i64(&obj, "foo"), -103);
}

#[test]
fn multi_byte_nops_are_canonical_and_dont_disturb_the_return_value() {
    for n in 1..=9 {
        let src = format!(
            r#"
            foo: frame
            mov i64 %0,7
            nop {n}
            ret i64 %0
        "#
        );
        let obj = build_and_load(&src);
        assert_eq!(call_i64(&obj, "foo"), 7, "nop {n} should be a true no-op");
    }
}
