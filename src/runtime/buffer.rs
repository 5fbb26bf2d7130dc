//! Byte buffers
//!
//! A buffer keeps its size separate from its storage's capacity. Storage is
//! either inline (bytes follow the storage header) or external: memory owned
//! by native code, carrying an opaque private pointer and a finalizer the
//! collector invokes when the storage becomes unreachable.
//!
//! A buffer can be locked (made read-only); once locked it never unlocks and
//! every mutator fails with `ImmutableValue`. Slicing a locked buffer yields
//! an unlocked copy.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;

use super::context::Context;
use super::error::{ErrorKind, Result};
use super::heap::{Finalize, ObjectHeader};
use super::value::{TypeTag, Value, normalize_index};

bitflags! {
    /// Flags on the buffer object itself.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        /// Locked; all mutators refuse.
        const READ_ONLY = 1;
    }
}

bitflags! {
    /// Flags on a buffer storage object.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StorageFlags: u32 {
        /// Payload is externally owned memory with a finalizer.
        const EXTERNAL = 1;
    }
}

/// Capacity is rounded up to this granularity.
const CAPACITY_STEP: u32 = 64;

/// Heap layout of a buffer.
#[repr(C)]
pub struct BufferObj {
    pub header: ObjectHeader,
    pub size: AtomicU32,
    pub flags: AtomicU32,
    /// Value bits of the current storage object.
    pub data: AtomicUsize,
}

/// Heap layout of inline buffer storage; bytes follow at
/// [`BufferStorageObj::BYTES_OFFSET`].
#[repr(C)]
pub struct BufferStorageObj {
    pub header: ObjectHeader,
    pub capacity: AtomicU32,
    pub flags: u32,
}

impl BufferStorageObj {
    pub const BYTES_OFFSET: usize = std::mem::size_of::<BufferStorageObj>();
}

/// Heap layout of external buffer storage.
#[repr(C)]
pub struct BufferExternalObj {
    pub header: ObjectHeader,
    pub capacity: AtomicU32,
    pub flags: u32,
    pub ptr: *mut u8,
    pub priv_ptr: *mut c_void,
    pub finalize: Option<Finalize>,
}

/// Pointer to a storage object's bytes.
///
/// # Safety
/// `storage` must be a live buffer storage value.
pub(crate) unsafe fn storage_data_ptr(storage: Value) -> *mut u8 {
    unsafe {
        let st = &*storage.as_obj::<BufferStorageObj>();
        if StorageFlags::from_bits_truncate(st.flags).contains(StorageFlags::EXTERNAL) {
            (*storage.as_obj::<BufferExternalObj>()).ptr
        } else {
            (storage.to_bits() as *mut u8).add(BufferStorageObj::BYTES_OFFSET)
        }
    }
}

fn alloc_storage(ctx: &mut Context, capacity: u32) -> Result<Value> {
    let size = BufferStorageObj::BYTES_OFFSET + capacity as usize;
    let ptr = ctx.alloc(TypeTag::BufferStorage, size)?;
    let st = unsafe { ptr.as_mut::<BufferStorageObj>() };
    st.capacity = AtomicU32::new(capacity);
    st.flags = StorageFlags::empty().bits();
    unsafe {
        std::ptr::write_bytes(
            (ptr.as_ptr()).add(BufferStorageObj::BYTES_OFFSET),
            0,
            capacity as usize,
        );
    }
    Ok(Value::from_heap_ptr(ptr))
}

/// Create a buffer of `size` zero bytes.
pub fn new_buffer(ctx: &mut Context, size: u32) -> Result<Value> {
    let capacity = size.div_ceil(CAPACITY_STEP).saturating_mul(CAPACITY_STEP);
    ctx.with_scope(|ctx| {
        let storage = alloc_storage(ctx, capacity.max(CAPACITY_STEP))?;
        let storage_loc = ctx.push_local(storage);

        let ptr = ctx.alloc(TypeTag::Buffer, std::mem::size_of::<BufferObj>())?;
        let storage = ctx.local(storage_loc);

        let buf = unsafe { ptr.as_mut::<BufferObj>() };
        buf.size = AtomicU32::new(size);
        buf.flags = AtomicU32::new(BufferFlags::empty().bits());
        buf.data = AtomicUsize::new(storage.to_bits());
        Ok(Value::from_heap_ptr(ptr))
    })
}

/// Create a buffer over externally owned memory. `finalize` runs exactly
/// once, when the storage dies or at context teardown.
///
/// # Safety
/// `ptr` must stay valid for `size` bytes until the finalizer runs.
pub unsafe fn new_external_buffer(
    ctx: &mut Context,
    ptr: *mut u8,
    size: u32,
    priv_ptr: *mut c_void,
    finalize: Option<Finalize>,
) -> Result<Value> {
    ctx.with_scope(|ctx| {
        let st_ptr = ctx.alloc(
            TypeTag::BufferStorage,
            std::mem::size_of::<BufferExternalObj>(),
        )?;
        let st = unsafe { st_ptr.as_mut::<BufferExternalObj>() };
        st.capacity = AtomicU32::new(size);
        st.flags = StorageFlags::EXTERNAL.bits();
        st.ptr = ptr;
        st.priv_ptr = priv_ptr;
        st.finalize = finalize;
        let storage_loc = ctx.push_local(Value::from_heap_ptr(st_ptr));

        let buf_ptr = ctx.alloc(TypeTag::Buffer, std::mem::size_of::<BufferObj>())?;
        let storage = ctx.local(storage_loc);

        let buf = unsafe { buf_ptr.as_mut::<BufferObj>() };
        buf.size = AtomicU32::new(size);
        buf.flags = AtomicU32::new(BufferFlags::empty().bits());
        buf.data = AtomicUsize::new(storage.to_bits());
        Ok(Value::from_heap_ptr(buf_ptr))
    })
}

/// Current size in bytes. The value must be a buffer.
pub fn buffer_size(v: Value) -> u32 {
    debug_assert_eq!(v.type_tag(), TypeTag::Buffer);
    unsafe { &*v.as_obj::<BufferObj>() }.size.load(Ordering::Acquire)
}

/// Capacity of the current storage.
pub fn buffer_capacity(v: Value) -> u32 {
    let storage = current_storage(v);
    unsafe { &*storage.as_obj::<BufferStorageObj>() }
        .capacity
        .load(Ordering::Acquire)
}

pub(crate) fn current_storage(v: Value) -> Value {
    Value::from_bits(unsafe { &*v.as_obj::<BufferObj>() }.data.load(Ordering::Acquire))
}

/// Pointer to the first byte.
///
/// # Safety
/// `v` must be a live buffer; the pointer is invalidated by any allocation
/// or resize.
pub unsafe fn buffer_data_ptr(v: Value) -> *mut u8 {
    unsafe { storage_data_ptr(current_storage(v)) }
}

/// Lock the buffer; all further mutation fails. Locking is one-way.
pub fn buffer_lock(v: Value) {
    debug_assert_eq!(v.type_tag(), TypeTag::Buffer);
    let buf = unsafe { &*v.as_obj::<BufferObj>() };
    buf.flags
        .fetch_or(BufferFlags::READ_ONLY.bits(), Ordering::AcqRel);
}

pub fn buffer_is_locked(v: Value) -> bool {
    let buf = unsafe { &*v.as_obj::<BufferObj>() };
    BufferFlags::from_bits_truncate(buf.flags.load(Ordering::Acquire))
        .contains(BufferFlags::READ_ONLY)
}

fn check_buffer(ctx: &mut Context, v: Value) -> Result<()> {
    if !v.is_heap_object() || v.type_tag() != TypeTag::Buffer {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not a buffer"));
    }
    Ok(())
}

fn check_mutable(ctx: &mut Context, v: Value) -> Result<()> {
    check_buffer(ctx, v)?;
    if buffer_is_locked(v) {
        return Err(ctx.raise(ErrorKind::ImmutableValue, "buffer is read-only"));
    }
    Ok(())
}

/// Ensure capacity of at least `new_capacity` bytes. Growing an external
/// buffer migrates it to internal storage; the external finalizer then runs
/// when the old storage is collected.
pub fn buffer_reserve(ctx: &mut Context, v: Value, new_capacity: u32) -> Result<()> {
    check_mutable(ctx, v)?;
    let capacity = buffer_capacity(v);
    if new_capacity <= capacity {
        return Ok(());
    }
    let new_capacity = new_capacity
        .div_ceil(CAPACITY_STEP)
        .saturating_mul(CAPACITY_STEP);

    ctx.with_scope(|ctx| {
        let buf_loc = ctx.push_local(v);
        let storage = alloc_storage(ctx, new_capacity)?;
        let v = ctx.local(buf_loc);

        let size = buffer_size(v);
        unsafe {
            let src = buffer_data_ptr(v);
            let dst = storage_data_ptr(storage);
            std::ptr::copy_nonoverlapping(src, dst, size as usize);
        }
        let buf = unsafe { &*v.as_obj::<BufferObj>() };
        buf.data.store(storage.to_bits(), Ordering::Release);
        Ok(())
    })
}

/// Resize the buffer, zero-filling any growth.
pub fn buffer_resize(ctx: &mut Context, v: Value, new_size: u32) -> Result<()> {
    check_mutable(ctx, v)?;
    let size = buffer_size(v);
    if new_size > buffer_capacity(v) {
        let grown = buffer_capacity(v)
            .saturating_add(buffer_capacity(v) / 2)
            .max(new_size);
        buffer_reserve(ctx, v, grown)?;
    }
    if new_size > size {
        unsafe {
            std::ptr::write_bytes(
                buffer_data_ptr(v).add(size as usize),
                0,
                (new_size - size) as usize,
            );
        }
    }
    let buf = unsafe { &*v.as_obj::<BufferObj>() };
    buf.size.store(new_size, Ordering::Release);
    Ok(())
}

/// Grow by `size_delta` bytes, returning a pointer to the fresh tail.
///
/// The pointer stays valid until the next allocation or resize.
pub fn buffer_make_room(ctx: &mut Context, v: Value, size_delta: u32) -> Result<*mut u8> {
    check_mutable(ctx, v)?;
    let old_size = buffer_size(v);
    let new_size = old_size
        .checked_add(size_delta)
        .ok_or_else(|| ctx.raise_kind(ErrorKind::NumericOutOfRange))?;
    buffer_resize(ctx, v, new_size)?;
    Ok(unsafe { buffer_data_ptr(v).add(old_size as usize) })
}

/// Fill `[begin, end)` with `value`.
pub fn buffer_fill(ctx: &mut Context, v: Value, begin: i64, end: i64, value: u8) -> Result<()> {
    check_mutable(ctx, v)?;
    let size = buffer_size(v);
    let begin = normalize_index(begin, size);
    let end = normalize_index(end, size).max(begin);
    unsafe {
        std::ptr::write_bytes(
            buffer_data_ptr(v).add(begin as usize),
            value,
            (end - begin) as usize,
        );
    }
    Ok(())
}

/// Copy `src[src_begin..src_end]` into `dst` at `dst_begin`.
///
/// When source and destination share storage and the regions overlap
/// forward, the copy is truncated to the non-overlapping prefix.
pub fn buffer_copy(
    ctx: &mut Context,
    dst: Value,
    dst_begin: i64,
    src: Value,
    src_begin: i64,
    src_end: i64,
) -> Result<()> {
    check_mutable(ctx, dst)?;
    check_buffer(ctx, src)?;

    let dst_size = buffer_size(dst);
    let src_size = buffer_size(src);
    let dst_begin = normalize_index(dst_begin, dst_size);
    let src_begin = normalize_index(src_begin, src_size);
    let src_end = normalize_index(src_end, src_size).max(src_begin);

    let mut copy_size = src_end - src_begin;
    copy_size = copy_size.min(dst_size - dst_begin);
    if copy_size == 0 {
        return Ok(());
    }

    unsafe {
        let src_ptr = buffer_data_ptr(src).add(src_begin as usize);
        let dst_ptr = buffer_data_ptr(dst).add(dst_begin as usize);
        let src_end_ptr = src_ptr.add(copy_size as usize);
        if src_end_ptr > dst_ptr && src_ptr < dst_ptr {
            copy_size = (dst_ptr as usize - src_ptr as usize) as u32;
        }
        std::ptr::copy(src_ptr, dst_ptr, copy_size as usize);
    }
    Ok(())
}

/// Copy `[begin, end)` into a fresh, unlocked buffer.
pub fn buffer_slice(ctx: &mut Context, v: Value, begin: i64, end: i64) -> Result<Value> {
    check_buffer(ctx, v)?;
    let size = buffer_size(v);
    let begin = normalize_index(begin, size);
    let end = normalize_index(end, size).max(begin);
    let new_size = end - begin;

    ctx.with_scope(|ctx| {
        let src_loc = ctx.push_local(v);
        let out = new_buffer(ctx, new_size)?;
        let v = ctx.local(src_loc);
        unsafe {
            std::ptr::copy_nonoverlapping(
                buffer_data_ptr(v).add(begin as usize),
                buffer_data_ptr(out),
                new_size as usize,
            );
        }
        Ok(out)
    })
}
