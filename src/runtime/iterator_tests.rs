//! Iterator behavior tests: prototype shadowing, generators, dynamic
//! property fallback, copies.

use std::collections::HashMap;

use super::array;
use super::context::Context;
use super::error::Result;
use super::function;
use super::iterator::*;
use super::object;
use super::string::{new_string, string_to_utf8};
use super::value::{TypeTag, Value};

/// Drain an iterator into key-string -> value pairs.
fn collect_walk(ctx: &mut Context, iter: Value) -> HashMap<String, Value> {
    let iter_loc = ctx.push_local(iter);
    let mut out = HashMap::new();
    loop {
        let iter = ctx.local(iter_loc);
        if !iterator_next(ctx, iter).unwrap() {
            break;
        }
        let iter = ctx.local(iter_loc);
        let key = get_walk_key(iter);
        let value = get_walk_value(iter);
        let key_bytes = string_to_utf8(ctx, key).unwrap();
        let prev = out.insert(String::from_utf8(key_bytes).unwrap(), value);
        assert!(prev.is_none(), "iterator produced a key twice");
    }
    out
}

#[test]
fn test_prototype_shadowing_walk() {
    let mut ctx = Context::new().unwrap();

    // A <- B <- C with a shadowed "y".
    let a = object::new_object_with_prototype(&mut ctx, Value::VOID).unwrap();
    let a_loc = ctx.push_local(a);
    let a = ctx.local(a_loc);
    let b = object::new_object_with_prototype(&mut ctx, a).unwrap();
    let b_loc = ctx.push_local(b);
    let b = ctx.local(b_loc);
    let c = object::new_object_with_prototype(&mut ctx, b).unwrap();
    let c_loc = ctx.push_local(c);

    for (target, key, val) in [
        (a_loc, "x", 1i64),
        (a_loc, "y", 2),
        (b_loc, "y", 20),
        (c_loc, "z", 3),
    ] {
        let k = new_string(&mut ctx, key).unwrap();
        let target = ctx.local(target);
        object::set_property(&mut ctx, target, k, Value::from_small_int(val)).unwrap();
    }

    // Deep: each key once, shadowed value from the nearest link.
    let c = ctx.local(c_loc);
    let iter = new_iterator(&mut ctx, c, IterDepth::Deep).unwrap();
    let walked = collect_walk(&mut ctx, iter);
    assert_eq!(walked.len(), 3);
    assert_eq!(walked["x"].as_small_int(), 1);
    assert_eq!(walked["y"].as_small_int(), 20);
    assert_eq!(walked["z"].as_small_int(), 3);

    // Shallow: own keys only.
    let c = ctx.local(c_loc);
    let iter = new_iterator(&mut ctx, c, IterDepth::Shallow).unwrap();
    let walked = collect_walk(&mut ctx, iter);
    assert_eq!(walked.len(), 1);
    assert_eq!(walked["z"].as_small_int(), 3);
}

#[test]
fn test_contents_on_object_equals_shallow() {
    let mut ctx = Context::new().unwrap();
    let obj = object::new_object(&mut ctx).unwrap();
    let obj_loc = ctx.push_local(obj);
    let k = new_string(&mut ctx, "only").unwrap();
    let obj = ctx.local(obj_loc);
    object::set_property(&mut ctx, obj, k, Value::from_small_int(1)).unwrap();

    let obj = ctx.local(obj_loc);
    let iter = new_iterator(&mut ctx, obj, IterDepth::Contents).unwrap();
    let walked = collect_walk(&mut ctx, iter);
    assert_eq!(walked.len(), 1);
    assert!(walked.contains_key("only"));
}

fn yields_256_512(ctx: &mut Context, func: Value, _args: Value) -> Result<Value> {
    let cursor = function::generator_reg(func, 0);
    let step = if cursor.is_void() {
        0
    } else {
        cursor.as_small_int()
    };
    function::set_generator_reg(func, 0, Value::from_small_int(step + 1));
    match step {
        0 => ctx.new_int(256),
        1 => ctx.new_int(512),
        _ => Ok(Value::BADPTR),
    }
}

#[test]
fn test_generator_iteration() {
    let mut ctx = Context::new().unwrap();
    let name = new_string(&mut ctx, "pair").unwrap();
    let template = function::new_native_generator(&mut ctx, name, yields_256_512, 1).unwrap();
    let args = ctx.empty_array;
    let generator = function::call_function(&mut ctx, template, Value::VOID, args).unwrap();

    let iter = new_iterator(&mut ctx, generator, IterDepth::Contents).unwrap();
    let iter_loc = ctx.push_local(iter);

    let iter = ctx.local(iter_loc);
    assert!(iterator_next(&mut ctx, iter).unwrap());
    let iter = ctx.local(iter_loc);
    assert_eq!(get_walk_key(iter).as_small_int(), 0);
    assert_eq!(get_walk_value(iter).as_small_int(), 256);

    let iter = ctx.local(iter_loc);
    assert!(iterator_next(&mut ctx, iter).unwrap());
    let iter = ctx.local(iter_loc);
    assert_eq!(get_walk_key(iter).as_small_int(), 1);
    assert_eq!(get_walk_value(iter).as_small_int(), 512);

    // Exhaustion is sticky and clears the outputs.
    for _ in 0..2 {
        let iter = ctx.local(iter_loc);
        assert!(!iterator_next(&mut ctx, iter).unwrap());
        let iter = ctx.local(iter_loc);
        assert!(get_walk_key(iter).is_bad());
        assert!(get_walk_value(iter).is_bad());
    }
}

#[test]
fn test_generator_exception_propagates() {
    let mut ctx = Context::new().unwrap();

    fn raises(ctx: &mut Context, func: Value, _args: Value) -> Result<Value> {
        let cursor = function::generator_reg(func, 0);
        if cursor.is_void() {
            function::set_generator_reg(func, 0, Value::from_small_int(1));
            return ctx.new_int(1);
        }
        Err(ctx.raise(super::error::ErrorKind::Exception, "boom"))
    }

    let name = new_string(&mut ctx, "boomer").unwrap();
    let template = function::new_native_generator(&mut ctx, name, raises, 1).unwrap();
    let args = ctx.empty_array;
    let generator = function::call_function(&mut ctx, template, Value::VOID, args).unwrap();

    let iter = new_iterator(&mut ctx, generator, IterDepth::Contents).unwrap();
    let iter_loc = ctx.push_local(iter);

    let iter = ctx.local(iter_loc);
    assert!(iterator_next(&mut ctx, iter).unwrap());

    let iter = ctx.local(iter_loc);
    let err = iterator_next(&mut ctx, iter).unwrap_err();
    assert_eq!(err.kind(), super::error::ErrorKind::Exception);
    assert!(ctx.is_exception_pending());
    let exc = super::utils::exception_to_string(&mut ctx).unwrap();
    let bytes = string_to_utf8(&mut ctx, exc).unwrap();
    assert_eq!(bytes, b"boom");
    ctx.clear_exception();

    // The raising generator is done; further next() reports exhaustion.
    let iter = ctx.local(iter_loc);
    assert!(!iterator_next(&mut ctx, iter).unwrap());
}

#[test]
fn test_dynamic_getter_failure_falls_back_to_getter() {
    let mut ctx = Context::new().unwrap();
    let obj = object::new_object_with_prototype(&mut ctx, Value::VOID).unwrap();
    let obj_loc = ctx.push_local(obj);

    fn failing_getter(ctx: &mut Context, _this: Value, _args: Value) -> Result<Value> {
        Err(ctx.raise(super::error::ErrorKind::Exception, "getter failed"))
    }

    let name = new_string(&mut ctx, "broken").unwrap();
    let obj = ctx.local(obj_loc);
    object::set_builtin_dynamic_property(&mut ctx, obj, name, Some(failing_getter), None).unwrap();

    let obj = ctx.local(obj_loc);
    let iter = new_iterator(&mut ctx, obj, IterDepth::Shallow).unwrap();
    let iter_loc = ctx.push_local(iter);

    let iter = ctx.local(iter_loc);
    assert!(iterator_next(&mut ctx, iter).unwrap());
    // The getter raised: the exception is cleared and the getter function
    // itself is the walked value.
    assert!(!ctx.is_exception_pending());
    let iter = ctx.local(iter_loc);
    let value = get_walk_value(iter);
    assert_eq!(value.type_tag(), TypeTag::Function);
}

#[test]
fn test_iterator_copy_keeps_cursor() {
    let mut ctx = Context::new().unwrap();
    let a = array::new_array(&mut ctx, 3).unwrap();
    for i in 0..3 {
        array::array_write(&mut ctx, a, i, Value::from_small_int(i + 10)).unwrap();
    }

    let iter = new_iterator(&mut ctx, a, IterDepth::Contents).unwrap();
    let iter_loc = ctx.push_local(iter);

    let iter = ctx.local(iter_loc);
    assert!(iterator_next(&mut ctx, iter).unwrap());

    let iter = ctx.local(iter_loc);
    let copy = new_iterator_copy(&mut ctx, iter).unwrap();
    let copy_loc = ctx.push_local(copy);

    // Both cursors continue from the same point independently.
    for expect in [11i64, 12] {
        let iter = ctx.local(iter_loc);
        assert!(iterator_next(&mut ctx, iter).unwrap());
        assert_eq!(get_walk_value(ctx.local(iter_loc)).as_small_int(), expect);

        let copy = ctx.local(copy_loc);
        assert!(iterator_next(&mut ctx, copy).unwrap());
        assert_eq!(get_walk_value(ctx.local(copy_loc)).as_small_int(), expect);
    }
}

#[test]
fn test_deep_walk_over_scalar_uses_type_prototype() {
    let mut ctx = Context::new().unwrap();

    let key = new_string(&mut ctx, "scalar_prop").unwrap();
    let key_loc = ctx.push_local(key);
    let proto = ctx.prototypes.boolean;
    let key = ctx.local(key_loc);
    object::set_property(&mut ctx, proto, key, Value::from_small_int(9)).unwrap();

    let iter = new_iterator(&mut ctx, Value::TRUE, IterDepth::Deep).unwrap();
    let walked = collect_walk(&mut ctx, iter);
    assert!(walked.contains_key("scalar_prop"));
    assert_eq!(walked["scalar_prop"].as_small_int(), 9);
}
