//! Collector behavior tests: rooting, evacuation, finalization, OOM.

use super::array;
use super::buffer;
use super::context::Context;
use super::error::ErrorKind;
use super::function;
use super::heap::{HeapConfig, POOL_SIZE};
use super::object;
use super::string::{self, new_string};
use super::utils::{self, CompareResult};
use super::value::Value;

#[test]
fn test_collect_fresh_context_frees_nothing() {
    let mut ctx = Context::new().unwrap();
    let stats = ctx.collect_garbage().unwrap();
    // Only the bootstrap objects (prototypes, preallocated strings) exist
    // and all of them are rooted.
    assert_eq!(stats.num_objs_freed, 0);
    assert_eq!(stats.num_objs_finalized, 0);
}

#[test]
fn test_unreachable_objects_are_freed() {
    let mut ctx = Context::new().unwrap();

    for i in 0..100 {
        let _ = new_string(&mut ctx, &format!("garbage{}", i)).unwrap();
    }
    let stats = ctx.collect_garbage().unwrap();
    assert!(stats.num_objs_freed >= 100);
    assert!(stats.size_freed > 0);
}

#[test]
fn test_rooted_value_survives_with_content() {
    let mut ctx = Context::new().unwrap();
    let s = new_string(&mut ctx, "survivor").unwrap();
    let loc = ctx.push_local(s);

    // Pad the page with garbage so it becomes an evacuation source.
    for _ in 0..50 {
        let _ = new_string(&mut ctx, "filler").unwrap();
    }

    let stats = ctx.collect_garbage().unwrap();
    assert!(stats.num_objs_evacuated > 0);

    let s = ctx.local(loc);
    let bytes = string::string_to_utf8(&mut ctx, s).unwrap();
    assert_eq!(bytes, b"survivor");
}

#[test]
fn test_array_grow_and_collect() {
    let mut ctx = Context::new().unwrap();
    let a = array::new_array(&mut ctx, 16).unwrap();
    let a_loc = ctx.push_local(a);

    // Push 128 distinct boxed objects, forcing storage resizes.
    for i in 0..128 {
        let v = ctx.new_int((1i64 << 62) + i).unwrap();
        let a = ctx.local(a_loc);
        array::array_push(&mut ctx, a, v).unwrap();
    }
    let a = ctx.local(a_loc);
    assert_eq!(array::array_size(a), 144);
    for i in 0..16 {
        let a = ctx.local(a_loc);
        assert!(array::array_read(&mut ctx, a, i).unwrap().is_void());
    }

    ctx.collect_garbage().unwrap();

    let a = ctx.local(a_loc);
    assert_eq!(array::array_size(a), 144);
    for i in 16..144 {
        let a = ctx.local(a_loc);
        let v = array::array_read(&mut ctx, a, i).unwrap();
        let expect = ctx.new_int((1i64 << 62) + (i - 16)).unwrap();
        assert_eq!(utils::compare(v, expect), CompareResult::Equal);
    }
}

#[test]
fn test_object_graph_survives_collection() {
    let mut ctx = Context::new().unwrap();
    let root = object::new_object(&mut ctx).unwrap();
    let root_loc = ctx.push_local(root);

    for i in 0..32 {
        let key = new_string(&mut ctx, &format!("k{}", i)).unwrap();
        let key_loc = ctx.push_local(key);
        let inner = array::new_array(&mut ctx, 2).unwrap();
        let inner_loc = ctx.push_local(inner);
        array::array_write(&mut ctx, inner, 0, Value::from_small_int(i)).unwrap();
        let s = new_string(&mut ctx, &format!("value{}", i)).unwrap();
        let inner = ctx.local(inner_loc);
        array::array_write(&mut ctx, inner, 1, s).unwrap();

        let root = ctx.local(root_loc);
        let key = ctx.local(key_loc);
        let inner = ctx.local(inner_loc);
        object::set_property(&mut ctx, root, key, inner).unwrap();
    }

    ctx.collect_garbage().unwrap();
    ctx.collect_garbage().unwrap();

    for i in 0..32 {
        let key = new_string(&mut ctx, &format!("k{}", i)).unwrap();
        let root = ctx.local(root_loc);
        let inner = object::get_property(&mut ctx, root, key).unwrap().unwrap();
        let v0 = array::array_read(&mut ctx, inner, 0).unwrap();
        assert_eq!(v0.as_small_int(), i);
        let v1 = array::array_read(&mut ctx, inner, 1).unwrap();
        let bytes = string::string_to_utf8(&mut ctx, v1).unwrap();
        assert_eq!(bytes, format!("value{}", i).as_bytes());
    }
}

#[test]
fn test_string_slice_keeps_backer_alive() {
    let mut ctx = Context::new().unwrap();
    let scope = ctx.scope();
    let long = new_string(&mut ctx, "the quick brown fox jumps over the lazy dog").unwrap();
    let long_loc = ctx.push_local(long);
    let long = ctx.local(long_loc);
    let slice = string::string_slice(&mut ctx, long, 4, 24).unwrap();
    ctx.close_scope(scope);
    let slice_loc = ctx.push_local(slice);

    // The backing string is now reachable only through the slice.
    ctx.collect_garbage().unwrap();

    let slice = ctx.local(slice_loc);
    let bytes = string::string_to_utf8(&mut ctx, slice).unwrap();
    assert_eq!(bytes, b"quick brown fox jump");
}

#[test]
fn test_finalizer_runs_exactly_once() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static RUNS: AtomicUsize = AtomicUsize::new(0);
    fn finalize(_priv: *mut std::ffi::c_void) {
        RUNS.fetch_add(1, Ordering::Relaxed);
    }
    static CLASS: object::PrivateClass = object::PrivateClass::new();

    let mut ctx = Context::new().unwrap();
    {
        let proto = ctx.prototypes.object;
        let _ = object::new_object_with_private(&mut ctx, proto, &CLASS, Some(finalize)).unwrap();
    }
    assert_eq!(RUNS.load(Ordering::Relaxed), 0);

    ctx.collect_garbage().unwrap();
    assert_eq!(RUNS.load(Ordering::Relaxed), 1);

    // Repeated collections and teardown do not run it again.
    ctx.collect_garbage().unwrap();
    drop(ctx);
    assert_eq!(RUNS.load(Ordering::Relaxed), 1);
}

#[test]
fn test_finalizer_at_teardown_for_live_object() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static RUNS: AtomicUsize = AtomicUsize::new(0);
    fn finalize(_priv: *mut std::ffi::c_void) {
        RUNS.fetch_add(1, Ordering::Relaxed);
    }
    static CLASS: object::PrivateClass = object::PrivateClass::new();

    {
        let mut ctx = Context::new().unwrap();
        let proto = ctx.prototypes.object;
        let obj = object::new_object_with_private(&mut ctx, proto, &CLASS, Some(finalize)).unwrap();
        ctx.push_local(obj);
        ctx.collect_garbage().unwrap();
        // Still rooted: not finalized by the collection.
        assert_eq!(RUNS.load(Ordering::Relaxed), 0);
    }
    assert_eq!(RUNS.load(Ordering::Relaxed), 1);
}

#[test]
fn test_external_buffer_finalized_by_gc() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static RUNS: AtomicUsize = AtomicUsize::new(0);
    fn finalize(_priv: *mut std::ffi::c_void) {
        RUNS.fetch_add(1, Ordering::Relaxed);
    }

    let mut ctx = Context::new().unwrap();
    let mut bytes = vec![0u8; 16];
    {
        let _ = unsafe {
            buffer::new_external_buffer(
                &mut ctx,
                bytes.as_mut_ptr(),
                bytes.len() as u32,
                std::ptr::null_mut(),
                Some(finalize),
            )
        }
        .unwrap();
    }
    ctx.collect_garbage().unwrap();
    assert_eq!(RUNS.load(Ordering::Relaxed), 1);
    drop(ctx);
    assert_eq!(RUNS.load(Ordering::Relaxed), 1);
}

#[test]
fn test_off_heap_object_tracked_and_freed() {
    let mut ctx = Context::new().unwrap();

    let big = buffer::new_buffer(&mut ctx, 64 * 1024).unwrap();
    let big_loc = ctx.push_local(big);

    let stats = ctx.collect_garbage().unwrap();
    assert!(stats.malloc_size >= 64 * 1024);

    // Drop the root; the next collection releases the storage.
    ctx.locals.truncate(big_loc.idx);
    let stats = ctx.collect_garbage().unwrap();
    assert!(stats.malloc_size < 64 * 1024);
}

#[test]
fn test_allocation_failure_raises_oom() {
    let mut ctx = Context::with_config(HeapConfig {
        max_heap_size: POOL_SIZE,
    })
    .unwrap();

    let mut count = 0;
    loop {
        match new_string(&mut ctx, "0123456789abcdef0123456789abcdef") {
            Ok(s) => {
                ctx.push_local(s);
                count += 1;
                assert!(count < 1_000_000);
            }
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::OutOfMemory);
                assert!(ctx.is_exception_pending());
                break;
            }
        }
    }
    ctx.clear_exception();

    // Everything rooted is still intact after the failed allocation.
    let first = ctx.locals[0];
    let bytes = string::string_to_utf8(&mut ctx, first).unwrap();
    assert_eq!(bytes, b"0123456789abcdef0123456789abcdef");
}

#[test]
fn test_generator_frame_survives_collection() {
    let mut ctx = Context::new().unwrap();

    fn yield_cursor(ctx: &mut Context, func: Value, _args: Value) -> super::error::Result<Value> {
        let cursor = function::generator_reg(func, 0);
        let n = if cursor.is_void() { 0 } else { cursor.as_small_int() };
        if n >= 2 {
            return Ok(Value::BADPTR);
        }
        function::set_generator_reg(func, 0, Value::from_small_int(n + 1));
        ctx.new_int(n + 1)
    }

    let name = new_string(&mut ctx, "gen").unwrap();
    let template = function::new_native_generator(&mut ctx, name, yield_cursor, 1).unwrap();
    let args = ctx.empty_array;
    let primed = function::call_function(&mut ctx, template, Value::VOID, args).unwrap();
    let gen_loc = ctx.push_local(primed);

    let primed = ctx.local(gen_loc);
    let first = function::call_generator(&mut ctx, primed, Value::VOID, args).unwrap();
    assert_eq!(first.unwrap().as_small_int(), 1);

    ctx.collect_garbage().unwrap();

    // The register frame moved with the generator; the cursor is intact.
    let primed = ctx.local(gen_loc);
    let args = ctx.empty_array;
    let second = function::call_generator(&mut ctx, primed, Value::VOID, args).unwrap();
    assert_eq!(second.unwrap().as_small_int(), 2);
}

#[test]
fn test_randomized_retention_stress() {
    let mut ctx = Context::new().unwrap();
    let keeper = array::new_array(&mut ctx, 0).unwrap();
    let keeper_loc = ctx.push_local(keeper);

    let mut expected: Vec<Option<String>> = Vec::new();
    fastrand::seed(0x5EED);

    for round in 0..8 {
        // Grow with random strings.
        for i in 0..64 {
            let text = format!("r{}i{}x{}", round, i, fastrand::u32(..));
            let s = new_string(&mut ctx, &text).unwrap();
            let keeper = ctx.local(keeper_loc);
            array::array_push(&mut ctx, keeper, s).unwrap();
            expected.push(Some(text));

            // Unreferenced garbage interleaved with retained data.
            let _ = new_string(&mut ctx, "transient").unwrap();
        }

        // Randomly void out some entries.
        for slot in 0..expected.len() {
            if fastrand::u8(..) < 64 {
                let keeper = ctx.local(keeper_loc);
                array::array_write(&mut ctx, keeper, slot as i64, Value::VOID).unwrap();
                expected[slot] = None;
            }
        }

        ctx.collect_garbage().unwrap();

        for (slot, want) in expected.iter().enumerate() {
            let keeper = ctx.local(keeper_loc);
            let v = array::array_read(&mut ctx, keeper, slot as i64).unwrap();
            match want {
                Some(text) => {
                    let bytes = string::string_to_utf8(&mut ctx, v).unwrap();
                    assert_eq!(bytes, text.as_bytes());
                }
                None => assert!(v.is_void()),
            }
        }
    }
}
