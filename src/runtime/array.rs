//! Arrays and their snapshot storage
//!
//! An array keeps its size separate from its storage's capacity. Reads are
//! lock-free: load the storage pointer, then load the slot. Growing
//! allocates a fresh storage, copies the live slots and publishes it through
//! the array; the old storage's `next` pointer forwards readers that
//! captured the older snapshot.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::context::Context;
use super::error::{ErrorKind, Result};
use super::heap::ObjectHeader;
use super::iterator::{self, IterDepth};
use super::value::{TypeTag, Value, normalize_index};

const MIN_CAPACITY: u32 = 4;

/// Heap layout of an array.
#[repr(C)]
pub struct ArrayObj {
    pub header: ObjectHeader,
    pub size: AtomicU32,
    pub _pad: u32,
    /// Value bits of the current `ArrayStorageObj`.
    pub data: AtomicUsize,
}

/// Heap layout of array storage. Slots follow at
/// [`ArrayStorageObj::SLOTS_OFFSET`]; capacity is fixed at allocation.
#[repr(C)]
pub struct ArrayStorageObj {
    pub header: ObjectHeader,
    pub capacity: u32,
    pub num_slots_open: AtomicU32,
    /// Value bits of the post-resize successor storage, for readers holding
    /// this snapshot; bad when this storage is current.
    pub next: AtomicUsize,
}

impl ArrayStorageObj {
    pub const SLOTS_OFFSET: usize = std::mem::size_of::<ArrayStorageObj>();

    /// Slot cell at index `i`.
    ///
    /// # Safety
    /// `i` must be below `self.capacity`.
    #[inline]
    pub unsafe fn slot(&self, i: u32) -> &AtomicUsize {
        debug_assert!(i < self.capacity);
        unsafe {
            let base = (self as *const Self as *const u8).add(Self::SLOTS_OFFSET);
            &*(base as *const AtomicUsize).add(i as usize)
        }
    }
}

fn alloc_storage(ctx: &mut Context, capacity: u32) -> Result<Value> {
    let size = ArrayStorageObj::SLOTS_OFFSET + capacity as usize * std::mem::size_of::<usize>();
    let ptr = ctx.alloc(TypeTag::ArrayStorage, size)?;
    let storage = unsafe { ptr.as_mut::<ArrayStorageObj>() };
    storage.capacity = capacity;
    storage.num_slots_open = AtomicU32::new(capacity);
    storage.next = AtomicUsize::new(Value::BADPTR.to_bits());
    for i in 0..capacity {
        unsafe { storage.slot(i) }.store(Value::BADPTR.to_bits(), Ordering::Relaxed);
    }
    Ok(Value::from_heap_ptr(ptr))
}

/// Create an array of `size` elements, all `void`.
pub fn new_array(ctx: &mut Context, size: u32) -> Result<Value> {
    ctx.with_scope(|ctx| {
        let storage = alloc_storage(ctx, size.max(MIN_CAPACITY))?;
        let storage_loc = ctx.push_local(storage);

        let ptr = ctx.alloc(TypeTag::Array, std::mem::size_of::<ArrayObj>())?;
        let storage = ctx.local(storage_loc);

        let array = unsafe { ptr.as_mut::<ArrayObj>() };
        array.size = AtomicU32::new(size);
        array._pad = 0;
        array.data = AtomicUsize::new(storage.to_bits());

        let st = unsafe { &*storage.as_obj::<ArrayStorageObj>() };
        for i in 0..size {
            unsafe { st.slot(i) }.store(Value::VOID.to_bits(), Ordering::Release);
        }

        Ok(Value::from_heap_ptr(ptr))
    })
}

/// Current number of elements. The value must be an array.
pub fn array_size(v: Value) -> u32 {
    debug_assert_eq!(v.type_tag(), TypeTag::Array);
    unsafe { &*v.as_obj::<ArrayObj>() }.size.load(Ordering::Acquire)
}

fn check_array(ctx: &mut Context, v: Value) -> Result<()> {
    if !v.is_heap_object() || v.type_tag() != TypeTag::Array {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not an array"));
    }
    Ok(())
}

/// Storage currently published by the array.
pub(crate) fn current_storage(v: Value) -> Value {
    let array = unsafe { &*v.as_obj::<ArrayObj>() };
    Value::from_bits(array.data.load(Ordering::Acquire))
}

/// Read the element at `idx`; negative indices count from the end. Out of
/// range raises `InvalidIndex`.
pub fn array_read(ctx: &mut Context, v: Value, idx: i64) -> Result<Value> {
    check_array(ctx, v)?;
    let size = array_size(v);
    let eff = if idx < 0 { idx + i64::from(size) } else { idx };
    if eff < 0 || eff >= i64::from(size) {
        return Err(ctx.raise_format(
            ErrorKind::InvalidIndex,
            format_args!("array index {} is out of range", idx),
        ));
    }
    let storage = current_storage(v);
    let st = unsafe { &*storage.as_obj::<ArrayStorageObj>() };
    Ok(Value::from_bits(
        unsafe { st.slot(eff as u32) }.load(Ordering::Acquire),
    ))
}

/// Write the element at `idx`; negative indices count from the end.
pub fn array_write(ctx: &mut Context, v: Value, idx: i64, value: Value) -> Result<()> {
    check_array(ctx, v)?;
    let size = array_size(v);
    let eff = if idx < 0 { idx + i64::from(size) } else { idx };
    if eff < 0 || eff >= i64::from(size) {
        return Err(ctx.raise_format(
            ErrorKind::InvalidIndex,
            format_args!("array index {} is out of range", idx),
        ));
    }
    let storage = current_storage(v);
    let st = unsafe { &*storage.as_obj::<ArrayStorageObj>() };
    unsafe { st.slot(eff as u32) }.store(value.to_bits(), Ordering::Release);
    Ok(())
}

/// Compare-and-swap the slot at `idx` by value identity. Returns the
/// previous slot content.
pub fn array_cas(
    ctx: &mut Context,
    v: Value,
    idx: i64,
    expected: Value,
    new: Value,
) -> Result<Value> {
    check_array(ctx, v)?;
    let size = array_size(v);
    let eff = if idx < 0 { idx + i64::from(size) } else { idx };
    if eff < 0 || eff >= i64::from(size) {
        return Err(ctx.raise_format(
            ErrorKind::InvalidIndex,
            format_args!("array index {} is out of range", idx),
        ));
    }
    let storage = current_storage(v);
    let st = unsafe { &*storage.as_obj::<ArrayStorageObj>() };
    let slot = unsafe { st.slot(eff as u32) };
    match slot.compare_exchange(
        expected.to_bits(),
        new.to_bits(),
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(prev) | Err(prev) => Ok(Value::from_bits(prev)),
    }
}

/// Ensure the storage can hold at least `capacity` elements.
pub fn array_reserve(ctx: &mut Context, v: Value, capacity: u32) -> Result<()> {
    check_array(ctx, v)?;
    let storage = current_storage(v);
    let st = unsafe { &*storage.as_obj::<ArrayStorageObj>() };
    if capacity <= st.capacity {
        return Ok(());
    }

    ctx.with_scope(|ctx| {
        let arr_loc = ctx.push_local(v);
        let old_loc = ctx.push_local(storage);

        let new_storage = alloc_storage(ctx, capacity)?;

        let v = ctx.local(arr_loc);
        let old = ctx.local(old_loc);

        let old_st = unsafe { &*old.as_obj::<ArrayStorageObj>() };
        let new_st = unsafe { &*new_storage.as_obj::<ArrayStorageObj>() };
        let size = array_size(v);
        for i in 0..size.min(old_st.capacity) {
            let val = unsafe { old_st.slot(i) }.load(Ordering::Acquire);
            unsafe { new_st.slot(i) }.store(val, Ordering::Release);
        }

        // Forward snapshot readers, then publish.
        old_st.next.store(new_storage.to_bits(), Ordering::Release);
        let array = unsafe { &*v.as_obj::<ArrayObj>() };
        array.data.store(new_storage.to_bits(), Ordering::Release);
        Ok(())
    })
}

/// Resize the array, filling growth with `void`.
pub fn array_resize(ctx: &mut Context, v: Value, new_size: u32) -> Result<()> {
    check_array(ctx, v)?;
    let size = array_size(v);
    let storage = current_storage(v);
    let capacity = unsafe { &*storage.as_obj::<ArrayStorageObj>() }.capacity;

    if new_size > capacity {
        let grown = capacity
            .saturating_add(capacity / 2)
            .max(new_size)
            .max(MIN_CAPACITY);
        array_reserve(ctx, v, grown)?;
    }

    let storage = current_storage(v);
    let st = unsafe { &*storage.as_obj::<ArrayStorageObj>() };
    if new_size > size {
        for i in size..new_size {
            unsafe { st.slot(i) }.store(Value::VOID.to_bits(), Ordering::Release);
        }
    } else {
        // Drop references held by the vacated slots.
        for i in new_size..size {
            unsafe { st.slot(i) }.store(Value::BADPTR.to_bits(), Ordering::Release);
        }
    }
    let array = unsafe { &*v.as_obj::<ArrayObj>() };
    array.size.store(new_size, Ordering::Release);
    Ok(())
}

/// Append a value; returns the pre-push size.
pub fn array_push(ctx: &mut Context, v: Value, value: Value) -> Result<u32> {
    check_array(ctx, v)?;
    let size = array_size(v);
    let storage = current_storage(v);
    let capacity = unsafe { &*storage.as_obj::<ArrayStorageObj>() }.capacity;

    if size == capacity {
        let scope = ctx.scope();
        let arr_loc = ctx.push_local(v);
        let val_loc = ctx.push_local(value);
        let grown = capacity
            .saturating_add(capacity / 2)
            .max(size + 1)
            .max(MIN_CAPACITY);
        let result = array_reserve(ctx, v, grown);
        let v2 = ctx.local(arr_loc);
        let value2 = ctx.close_scope_with(scope, val_loc);
        result?;
        return finish_push(v2, value2, size);
    }

    finish_push(v, value, size)
}

fn finish_push(v: Value, value: Value, size: u32) -> Result<u32> {
    let storage = current_storage(v);
    let st = unsafe { &*storage.as_obj::<ArrayStorageObj>() };
    unsafe { st.slot(size) }.store(value.to_bits(), Ordering::Release);
    let array = unsafe { &*v.as_obj::<ArrayObj>() };
    array.size.store(size + 1, Ordering::Release);
    Ok(size)
}

/// Remove and return the last element. Fails on an empty array.
pub fn array_pop(ctx: &mut Context, v: Value) -> Result<Value> {
    check_array(ctx, v)?;
    let size = array_size(v);
    if size == 0 {
        return Err(ctx.raise(ErrorKind::EmptyCollection, "array is empty"));
    }
    let storage = current_storage(v);
    let st = unsafe { &*storage.as_obj::<ArrayStorageObj>() };
    let slot = unsafe { st.slot(size - 1) };
    let value = Value::from_bits(slot.load(Ordering::Acquire));
    slot.store(Value::BADPTR.to_bits(), Ordering::Release);
    let array = unsafe { &*v.as_obj::<ArrayObj>() };
    array.size.store(size - 1, Ordering::Release);
    Ok(value)
}

/// Flat copy of `[begin, end)` into a new array.
pub fn array_slice(ctx: &mut Context, v: Value, begin: i64, end: i64) -> Result<Value> {
    check_array(ctx, v)?;
    let size = array_size(v);
    let begin = normalize_index(begin, size);
    let end = normalize_index(end, size).max(begin);
    let new_size = end - begin;

    ctx.with_scope(|ctx| {
        let src_loc = ctx.push_local(v);
        let out = new_array(ctx, new_size)?;
        let v = ctx.local(src_loc);

        let src_st = unsafe { &*current_storage(v).as_obj::<ArrayStorageObj>() };
        let dst_st = unsafe { &*current_storage(out).as_obj::<ArrayStorageObj>() };
        for i in 0..new_size {
            let val = unsafe { src_st.slot(begin + i) }.load(Ordering::Acquire);
            unsafe { dst_st.slot(i) }.store(val, Ordering::Release);
        }
        Ok(out)
    })
}

/// Set every element of `[begin, end)` to `value`.
pub fn array_fill(ctx: &mut Context, v: Value, begin: i64, end: i64, value: Value) -> Result<()> {
    check_array(ctx, v)?;
    let size = array_size(v);
    let begin = normalize_index(begin, size);
    let end = normalize_index(end, size).max(begin);

    let st = unsafe { &*current_storage(v).as_obj::<ArrayStorageObj>() };
    for i in begin..end {
        unsafe { st.slot(i) }.store(value.to_bits(), Ordering::Release);
    }
    Ok(())
}

/// Replace `dst[begin..end]` with `src[src_begin..src_end]`, growing or
/// shrinking `dst` as needed. `src` may be `dst` itself.
pub fn array_insert(
    ctx: &mut Context,
    dst: Value,
    begin: i64,
    end: i64,
    src: Value,
    src_begin: i64,
    src_end: i64,
) -> Result<()> {
    check_array(ctx, dst)?;
    check_array(ctx, src)?;

    let dst_size = array_size(dst);
    let src_size = array_size(src);
    let begin = normalize_index(begin, dst_size);
    let end = normalize_index(end, dst_size).max(begin);
    let src_begin = normalize_index(src_begin, src_size);
    let src_end = normalize_index(src_end, src_size).max(src_begin);

    let ins_len = src_end - src_begin;
    let new_size = dst_size - (end - begin) + ins_len;

    // Assemble the result up front; overlapping self-insertion then needs no
    // shifting logic. The scratch values are tracked so a growth collection
    // keeps them current.
    let mut tmp: Vec<Value> = Vec::with_capacity(new_size as usize);
    {
        let dst_st = unsafe { &*current_storage(dst).as_obj::<ArrayStorageObj>() };
        let src_st = unsafe { &*current_storage(src).as_obj::<ArrayStorageObj>() };
        for i in 0..begin {
            tmp.push(Value::from_bits(
                unsafe { dst_st.slot(i) }.load(Ordering::Acquire),
            ));
        }
        for i in src_begin..src_end {
            tmp.push(Value::from_bits(
                unsafe { src_st.slot(i) }.load(Ordering::Acquire),
            ));
        }
        for i in end..dst_size {
            tmp.push(Value::from_bits(
                unsafe { dst_st.slot(i) }.load(Ordering::Acquire),
            ));
        }
    }

    let scope = ctx.scope();
    let dst_loc = ctx.push_local(dst);
    unsafe { ctx.track_refs(tmp.as_mut_ptr(), tmp.len()) };
    let rooted_dst = ctx.local(dst_loc);
    let result = array_resize(ctx, rooted_dst, new_size);
    ctx.untrack_refs(1);
    let dst = ctx.close_scope_with(scope, dst_loc);
    result?;

    let dst_st = unsafe { &*current_storage(dst).as_obj::<ArrayStorageObj>() };
    for (i, val) in tmp.iter().enumerate() {
        unsafe { dst_st.slot(i as u32) }.store(val.to_bits(), Ordering::Release);
    }
    Ok(())
}

/// Push every element produced by iterating `value`'s contents.
pub fn array_push_expand(ctx: &mut Context, v: Value, value: Value) -> Result<()> {
    check_array(ctx, v)?;

    ctx.with_scope(|ctx| {
        let arr_loc = ctx.push_local(v);

        if value.is_heap_object() && value.type_tag() == TypeTag::Array {
            let src_loc = ctx.push_local(value);
            let count = array_size(value);
            for i in 0..count {
                let src = ctx.local(src_loc);
                let elem = array_read(ctx, src, i as i64)?;
                let arr = ctx.local(arr_loc);
                array_push(ctx, arr, elem)?;
            }
            return Ok(());
        }

        let iter = iterator::new_iterator(ctx, value, IterDepth::Contents)?;
        let iter_loc = ctx.push_local(iter);
        loop {
            let it = ctx.local(iter_loc);
            if !iterator::iterator_next(ctx, it)? {
                break;
            }
            let elem = iterator::get_walk_value(ctx.local(iter_loc));
            let arr = ctx.local(arr_loc);
            array_push(ctx, arr, elem)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_array_filled_with_void() {
        let mut ctx = Context::new().unwrap();
        let a = new_array(&mut ctx, 3).unwrap();
        assert_eq!(a.type_tag(), TypeTag::Array);
        assert_eq!(array_size(a), 3);
        for i in 0..3 {
            assert!(array_read(&mut ctx, a, i).unwrap().is_void());
        }
    }

    #[test]
    fn test_read_write_negative_index() {
        let mut ctx = Context::new().unwrap();
        let a = new_array(&mut ctx, 4).unwrap();
        array_write(&mut ctx, a, -1, Value::from_small_int(9)).unwrap();
        assert_eq!(array_read(&mut ctx, a, 3).unwrap().as_small_int(), 9);
        assert_eq!(array_read(&mut ctx, a, -1).unwrap().as_small_int(), 9);

        assert!(array_read(&mut ctx, a, 4).is_err());
        ctx.clear_exception();
        assert!(array_read(&mut ctx, a, -5).is_err());
        ctx.clear_exception();
    }

    #[test]
    fn test_push_pop() {
        let mut ctx = Context::new().unwrap();
        let a = new_array(&mut ctx, 0).unwrap();
        for i in 0..20 {
            let pre = array_push(&mut ctx, a, Value::from_small_int(i)).unwrap();
            assert_eq!(pre, i as u32);
        }
        assert_eq!(array_size(a), 20);
        for i in (0..20).rev() {
            let v = array_pop(&mut ctx, a).unwrap();
            assert_eq!(v.as_small_int(), i);
        }
        let err = array_pop(&mut ctx, a).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyCollection);
        ctx.clear_exception();
    }

    #[test]
    fn test_resize_grow_and_shrink() {
        let mut ctx = Context::new().unwrap();
        let a = new_array(&mut ctx, 2).unwrap();
        array_write(&mut ctx, a, 0, Value::from_small_int(1)).unwrap();
        array_write(&mut ctx, a, 1, Value::from_small_int(2)).unwrap();

        array_resize(&mut ctx, a, 100).unwrap();
        assert_eq!(array_size(a), 100);
        assert_eq!(array_read(&mut ctx, a, 0).unwrap().as_small_int(), 1);
        assert_eq!(array_read(&mut ctx, a, 1).unwrap().as_small_int(), 2);
        assert!(array_read(&mut ctx, a, 99).unwrap().is_void());

        array_resize(&mut ctx, a, 1).unwrap();
        assert_eq!(array_size(a), 1);
        assert_eq!(array_read(&mut ctx, a, 0).unwrap().as_small_int(), 1);
    }

    #[test]
    fn test_resize_leaves_snapshot_chain() {
        let mut ctx = Context::new().unwrap();
        let a = new_array(&mut ctx, 2).unwrap();
        let old = current_storage(a);
        array_reserve(&mut ctx, a, 64).unwrap();
        let new = current_storage(a);
        assert_ne!(old, new);
        let old_st = unsafe { &*old.as_obj::<ArrayStorageObj>() };
        assert_eq!(
            Value::from_bits(old_st.next.load(Ordering::Acquire)),
            new,
            "old snapshot must forward to the new storage"
        );
    }

    #[test]
    fn test_cas() {
        let mut ctx = Context::new().unwrap();
        let a = new_array(&mut ctx, 1).unwrap();
        array_write(&mut ctx, a, 0, Value::from_small_int(5)).unwrap();

        let prev = array_cas(
            &mut ctx,
            a,
            0,
            Value::from_small_int(5),
            Value::from_small_int(6),
        )
        .unwrap();
        assert_eq!(prev.as_small_int(), 5);
        assert_eq!(array_read(&mut ctx, a, 0).unwrap().as_small_int(), 6);

        // Mismatch leaves the slot untouched and reports the current value.
        let prev = array_cas(
            &mut ctx,
            a,
            0,
            Value::from_small_int(5),
            Value::from_small_int(7),
        )
        .unwrap();
        assert_eq!(prev.as_small_int(), 6);
        assert_eq!(array_read(&mut ctx, a, 0).unwrap().as_small_int(), 6);
    }

    #[test]
    fn test_slice_is_distinct_copy() {
        let mut ctx = Context::new().unwrap();
        let a = new_array(&mut ctx, 5).unwrap();
        for i in 0..5 {
            array_write(&mut ctx, a, i, Value::from_small_int(i * 10)).unwrap();
        }
        let s = array_slice(&mut ctx, a, 0, 5).unwrap();
        assert_ne!(s, a);
        assert_eq!(array_size(s), 5);
        for i in 0..5 {
            assert_eq!(
                array_read(&mut ctx, s, i).unwrap().as_small_int(),
                i * 10
            );
        }

        let mid = array_slice(&mut ctx, a, 1, -1).unwrap();
        assert_eq!(array_size(mid), 3);
        assert_eq!(array_read(&mut ctx, mid, 0).unwrap().as_small_int(), 10);
    }

    #[test]
    fn test_insert_range_length_contract() {
        let mut ctx = Context::new().unwrap();
        let a = new_array(&mut ctx, 6).unwrap();
        for i in 0..6 {
            array_write(&mut ctx, a, i, Value::from_small_int(i)).unwrap();
        }
        let src = new_array(&mut ctx, 2).unwrap();
        array_write(&mut ctx, src, 0, Value::from_small_int(100)).unwrap();
        array_write(&mut ctx, src, 1, Value::from_small_int(101)).unwrap();

        // Replace a[2..4] with src[0..2]: same length.
        array_insert(&mut ctx, a, 2, 4, src, 0, 2).unwrap();
        assert_eq!(array_size(a), 6);
        let expect = [0, 1, 100, 101, 4, 5];
        for (i, want) in expect.iter().enumerate() {
            assert_eq!(
                array_read(&mut ctx, a, i as i64).unwrap().as_small_int(),
                *want
            );
        }

        // Delete a[0..2]: shrinks.
        let empty = new_array(&mut ctx, 0).unwrap();
        array_insert(&mut ctx, a, 0, 2, empty, 0, 0).unwrap();
        assert_eq!(array_size(a), 4);
        assert_eq!(array_read(&mut ctx, a, 0).unwrap().as_small_int(), 100);

        // Insert without deleting: grows.
        array_insert(&mut ctx, a, 1, 1, src, 0, 2).unwrap();
        assert_eq!(array_size(a), 6);
        assert_eq!(array_read(&mut ctx, a, 1).unwrap().as_small_int(), 100);
        assert_eq!(array_read(&mut ctx, a, 2).unwrap().as_small_int(), 101);
    }

    #[test]
    fn test_self_insert_overlap() {
        let mut ctx = Context::new().unwrap();
        let a = new_array(&mut ctx, 4).unwrap();
        for i in 0..4 {
            array_write(&mut ctx, a, i, Value::from_small_int(i)).unwrap();
        }
        // Replace a[1..2] with a[0..3].
        array_insert(&mut ctx, a, 1, 2, a, 0, 3).unwrap();
        assert_eq!(array_size(a), 6);
        let expect = [0, 0, 1, 2, 2, 3];
        for (i, want) in expect.iter().enumerate() {
            assert_eq!(
                array_read(&mut ctx, a, i as i64).unwrap().as_small_int(),
                *want
            );
        }
    }

    #[test]
    fn test_fill() {
        let mut ctx = Context::new().unwrap();
        let a = new_array(&mut ctx, 5).unwrap();
        array_fill(&mut ctx, a, 1, -1, Value::from_small_int(7)).unwrap();
        assert!(array_read(&mut ctx, a, 0).unwrap().is_void());
        for i in 1..4 {
            assert_eq!(array_read(&mut ctx, a, i).unwrap().as_small_int(), 7);
        }
        assert!(array_read(&mut ctx, a, 4).unwrap().is_void());
    }

    #[test]
    fn test_push_expand_array() {
        let mut ctx = Context::new().unwrap();
        let a = new_array(&mut ctx, 1).unwrap();
        array_write(&mut ctx, a, 0, Value::from_small_int(1)).unwrap();
        let src = new_array(&mut ctx, 2).unwrap();
        array_write(&mut ctx, src, 0, Value::from_small_int(2)).unwrap();
        array_write(&mut ctx, src, 1, Value::from_small_int(3)).unwrap();

        array_push_expand(&mut ctx, a, src).unwrap();
        assert_eq!(array_size(a), 3);
        for i in 0..3 {
            assert_eq!(
                array_read(&mut ctx, a, i).unwrap().as_small_int(),
                i + 1
            );
        }
    }
}
