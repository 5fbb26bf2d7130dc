//! Garbage collector
//!
//! A precise mark + evacuating copy collector. The mutator is stopped at a
//! safe point (every entry is through `&mut Context`), so the cycle runs in
//! phases:
//!
//! 1. Mark: walk the root set (locals, tracked slices, the pending
//!    exception, prototypes), setting the per-object visit bit and
//!    accumulating per-page live byte counts. Traversal is type-directed.
//! 2. Decide page fate: pages whose live bytes fall below half the page
//!    capacity become evacuation sources; the rest are kept.
//! 3. Evacuate: live objects in source pages are copied to destination
//!    pages; the old header is overwritten with a forwarding pointer.
//! 4. Rewrite: every reference in roots and live objects that targets a
//!    forwarded header is replaced with the new address.
//! 5. Finalize: dead objects with finalizers run them exactly once; dead
//!    objects on kept pages become opaque filler so page walks stay linear.
//! 6. Reclaim: source pages return to the free list.
//!
//! If evacuation runs out of space, already-moved objects are restored in
//! place through their forwarding pointers and the collection fails with
//! `OutOfMemory`, leaving the heap consistent.

use std::sync::atomic::Ordering;

use super::array::{ArrayObj, ArrayStorageObj};
use super::buffer::{BufferExternalObj, BufferObj, BufferStorageObj, StorageFlags};
use super::context::Context;
use super::error::Result;
use super::function::{self, ClassObj, FunctionObj, ModuleObj, StackObj};
use super::heap::{Heap, HeapPtr, ObjectHeader, PAGE_CAPACITY, Page};
use super::iterator::IteratorObj;
use super::object::{DynamicPropObj, ObjectObj, ObjectStorageObj};
use super::string::{StringObj, StringStorage};
use super::value::{TypeTag, Value};

/// Statistics reported by one collection cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    pub num_objs_evacuated: u32,
    pub num_objs_freed: u32,
    pub num_objs_finalized: u32,
    pub num_pages_kept: u32,
    pub num_pages_freed: u32,
    pub size_evacuated: u64,
    pub size_freed: u64,
    pub size_kept: u64,
    pub malloc_size: u64,
}

/// Pages whose live bytes fall below this fraction of capacity are
/// evacuated.
const MIGRATION_NUM: usize = 1;
const MIGRATION_DEN: usize = 2;

// =========================================================================
// Type-directed traversal
// =========================================================================

/// Invoke `f` with every reference slot value held by `v`.
///
/// # Safety
/// `v` must be a live heap object with an intact (non-forwarded) header.
unsafe fn for_each_ref(v: Value, f: &mut dyn FnMut(Value)) {
    unsafe {
        match v.type_tag() {
            TypeTag::Integer
            | TypeTag::Float
            | TypeTag::Boolean
            | TypeTag::Void
            | TypeTag::Opaque => {}

            TypeTag::String => {
                let s = &*v.as_obj::<StringObj>();
                if s.storage_kind() == StringStorage::Reference {
                    f(Value::from_bits(s.ref_backer().load(Ordering::Relaxed)));
                }
            }

            TypeTag::Array => {
                let a = &*v.as_obj::<ArrayObj>();
                f(Value::from_bits(a.data.load(Ordering::Relaxed)));
            }

            TypeTag::ArrayStorage => {
                let st = &*v.as_obj::<ArrayStorageObj>();
                f(Value::from_bits(st.next.load(Ordering::Relaxed)));
                for i in 0..st.capacity {
                    f(Value::from_bits(st.slot(i).load(Ordering::Relaxed)));
                }
            }

            TypeTag::Buffer => {
                let b = &*v.as_obj::<BufferObj>();
                f(Value::from_bits(b.data.load(Ordering::Relaxed)));
            }

            TypeTag::BufferStorage => {}

            TypeTag::Object => {
                let o = &*v.as_obj::<ObjectObj>();
                f(Value::from_bits(o.prototype.load(Ordering::Relaxed)));
                f(Value::from_bits(o.props.load(Ordering::Relaxed)));
            }

            TypeTag::ObjectStorage => {
                let t = &*v.as_obj::<ObjectStorageObj>();
                f(Value::from_bits(t.new_prop_table.load(Ordering::Relaxed)));
                for i in 0..t.capacity {
                    let item = t.item(i);
                    f(Value::from_bits(item.key.load(Ordering::Relaxed)));
                    f(Value::from_bits(item.value.load(Ordering::Relaxed)));
                }
            }

            TypeTag::Function => {
                let fun = &*v.as_obj::<FunctionObj>();
                trace_function(fun, f);
            }

            TypeTag::Class => {
                let class = &*v.as_obj::<ClassObj>();
                trace_function(&class.fun, f);
                f(Value::from_bits(class.prototype.load(Ordering::Relaxed)));
                f(Value::from_bits(class.props.load(Ordering::Relaxed)));
            }

            TypeTag::Module => {
                let m = &*v.as_obj::<ModuleObj>();
                f(Value::from_bits(m.name.load(Ordering::Relaxed)));
                f(Value::from_bits(m.path.load(Ordering::Relaxed)));
                f(Value::from_bits(m.constants.load(Ordering::Relaxed)));
                f(Value::from_bits(m.global_names.load(Ordering::Relaxed)));
                f(Value::from_bits(m.globals.load(Ordering::Relaxed)));
                f(Value::from_bits(m.module_names.load(Ordering::Relaxed)));
            }

            TypeTag::DynamicProp => {
                let p = &*v.as_obj::<DynamicPropObj>();
                f(Value::from_bits(p.getter.load(Ordering::Relaxed)));
                f(Value::from_bits(p.setter.load(Ordering::Relaxed)));
            }

            TypeTag::Iterator => {
                let it = &*v.as_obj::<IteratorObj>();
                f(Value::from_bits(it.obj.load(Ordering::Relaxed)));
                f(Value::from_bits(it.prop_obj.load(Ordering::Relaxed)));
                f(Value::from_bits(it.key_table.load(Ordering::Relaxed)));
                f(Value::from_bits(it.returned_keys.load(Ordering::Relaxed)));
                f(Value::from_bits(it.last_key.load(Ordering::Relaxed)));
                f(Value::from_bits(it.last_value.load(Ordering::Relaxed)));
            }

            TypeTag::Stack => {
                let s = &*v.as_obj::<StackObj>();
                let size = s.size.load(Ordering::Relaxed);
                for i in 0..size {
                    f(Value::from_bits(s.slot(i).load(Ordering::Relaxed)));
                }
            }
        }
    }
}

fn trace_function(fun: &FunctionObj, f: &mut dyn FnMut(Value)) {
    f(Value::from_bits(fun.name.load(Ordering::Relaxed)));
    f(Value::from_bits(fun.module.load(Ordering::Relaxed)));
    f(Value::from_bits(fun.closures.load(Ordering::Relaxed)));
    f(Value::from_bits(fun.defaults.load(Ordering::Relaxed)));
    f(Value::from_bits(fun.generator_frame.load(Ordering::Relaxed)));
}

/// Rewrite every reference slot of `v` through `fix`.
///
/// # Safety
/// `v` must be a live heap object with an intact header.
unsafe fn update_refs(v: Value, fix: &dyn Fn(Value) -> Value) {
    unsafe {
        let fix_slot = |slot: &std::sync::atomic::AtomicUsize| {
            let old = Value::from_bits(slot.load(Ordering::Relaxed));
            let new = fix(old);
            if new != old {
                slot.store(new.to_bits(), Ordering::Relaxed);
            }
        };

        match v.type_tag() {
            TypeTag::Integer
            | TypeTag::Float
            | TypeTag::Boolean
            | TypeTag::Void
            | TypeTag::Opaque
            | TypeTag::BufferStorage => {}

            TypeTag::String => {
                let s = &*v.as_obj::<StringObj>();
                if s.storage_kind() == StringStorage::Reference {
                    fix_slot(s.ref_backer());
                }
            }

            TypeTag::Array => fix_slot(&(*v.as_obj::<ArrayObj>()).data),

            TypeTag::ArrayStorage => {
                let st = &*v.as_obj::<ArrayStorageObj>();
                fix_slot(&st.next);
                for i in 0..st.capacity {
                    fix_slot(st.slot(i));
                }
            }

            TypeTag::Buffer => fix_slot(&(*v.as_obj::<BufferObj>()).data),

            TypeTag::Object => {
                let o = &*v.as_obj::<ObjectObj>();
                fix_slot(&o.prototype);
                fix_slot(&o.props);
            }

            TypeTag::ObjectStorage => {
                let t = &*v.as_obj::<ObjectStorageObj>();
                fix_slot(&t.new_prop_table);
                for i in 0..t.capacity {
                    let item = t.item(i);
                    fix_slot(&item.key);
                    fix_slot(&item.value);
                }
            }

            TypeTag::Function => {
                let fun = &*v.as_obj::<FunctionObj>();
                update_function(fun, &fix_slot);
            }

            TypeTag::Class => {
                let class = &*v.as_obj::<ClassObj>();
                update_function(&class.fun, &fix_slot);
                fix_slot(&class.prototype);
                fix_slot(&class.props);
            }

            TypeTag::Module => {
                let m = &*v.as_obj::<ModuleObj>();
                fix_slot(&m.name);
                fix_slot(&m.path);
                fix_slot(&m.constants);
                fix_slot(&m.global_names);
                fix_slot(&m.globals);
                fix_slot(&m.module_names);
            }

            TypeTag::DynamicProp => {
                let p = &*v.as_obj::<DynamicPropObj>();
                fix_slot(&p.getter);
                fix_slot(&p.setter);
            }

            TypeTag::Iterator => {
                let it = &*v.as_obj::<IteratorObj>();
                fix_slot(&it.obj);
                fix_slot(&it.prop_obj);
                fix_slot(&it.key_table);
                fix_slot(&it.returned_keys);
                fix_slot(&it.last_key);
                fix_slot(&it.last_value);
            }

            TypeTag::Stack => {
                let s = &*v.as_obj::<StackObj>();
                let size = s.size.load(Ordering::Relaxed);
                for i in 0..size {
                    fix_slot(s.slot(i));
                }
            }
        }
    }
}

fn update_function(
    fun: &FunctionObj,
    fix_slot: &impl Fn(&std::sync::atomic::AtomicUsize),
) {
    fix_slot(&fun.name);
    fix_slot(&fun.module);
    fix_slot(&fun.closures);
    fix_slot(&fun.defaults);
    fix_slot(&fun.generator_frame);
}


// =========================================================================
// Finalization
// =========================================================================

/// Run the finalizer of a dead object, if it declares one. Returns true
/// when a finalizer ran.
unsafe fn finalize_object(v: Value) -> bool {
    unsafe {
        match v.type_tag() {
            TypeTag::Object => {
                let o = &*v.as_obj::<ObjectObj>();
                if let Some(finalize) = o.finalize {
                    let priv_ptr = o.priv_ptr.load(Ordering::Acquire) as *mut std::ffi::c_void;
                    finalize(priv_ptr);
                    return true;
                }
                false
            }
            TypeTag::BufferStorage => {
                let st = &*v.as_obj::<BufferStorageObj>();
                if StorageFlags::from_bits_truncate(st.flags).contains(StorageFlags::EXTERNAL) {
                    let ext = &*v.as_obj::<BufferExternalObj>();
                    if let Some(finalize) = ext.finalize {
                        finalize(ext.priv_ptr);
                        return true;
                    }
                }
                false
            }
            TypeTag::Module => {
                function::free_module_data(&mut *v.as_obj::<ModuleObj>());
                false
            }
            _ => false,
        }
    }
}

// =========================================================================
// Collection
// =========================================================================

fn mark_value(heap: &Heap, worklist: &mut Vec<Value>, v: Value) {
    if !v.is_heap_object() {
        return;
    }
    let addr = v.to_bits();
    let header = unsafe { v.header() };

    // Pointers to static payloads and foreign memory are not heap objects;
    // only pool pages and the tracked off-heap list are managed.
    if !header.is_off_heap() && heap.page_of(addr).is_none() {
        return;
    }
    if header.is_marked() {
        return;
    }
    header.set_marked();

    if let Some(page) = heap.page_of(addr) {
        let size = header.size() as u32;
        unsafe {
            (*page).live_bytes.fetch_add(size, Ordering::Relaxed);
        }
    }
    worklist.push(v);
}

/// Walk a page's objects, calling `f` with each object address and its
/// size. Handles forwarded headers by reading the size from the copy.
unsafe fn walk_page(page: *mut Page, mut f: impl FnMut(HeapPtr, usize)) {
    unsafe {
        let mut cursor = Page::first_object(page);
        let end = Page::alloc_end(page);
        while cursor < end {
            let ptr = HeapPtr::from_usize(cursor);
            let header = ptr.as_ref::<ObjectHeader>();
            let size = match header.forwarding_addr() {
                Some(addr) => HeapPtr::from_usize(addr).as_ref::<ObjectHeader>().size(),
                None => header.size(),
            };
            debug_assert!(size > 0);
            f(ptr, size);
            cursor += size;
        }
    }
}

/// Run a full collection cycle.
pub fn collect(ctx: &mut Context) -> Result<GcStats> {
    let mut stats = GcStats::default();

    // ---- Mark ----------------------------------------------------------
    {
        let mut worklist: Vec<Value> = Vec::new();
        let heap = &ctx.heap;

        for root in ctx.locals.iter() {
            mark_value(heap, &mut worklist, *root);
        }
        for slice in ctx.tracked.iter() {
            for i in 0..slice.len {
                let v = unsafe { *slice.ptr.add(i) };
                mark_value(heap, &mut worklist, v);
            }
        }
        mark_value(heap, &mut worklist, ctx.exception);
        mark_value(heap, &mut worklist, ctx.str_oom);
        mark_value(heap, &mut worklist, ctx.empty_array);
        for proto in [
            ctx.prototypes.object,
            ctx.prototypes.integer,
            ctx.prototypes.float,
            ctx.prototypes.string,
            ctx.prototypes.boolean,
            ctx.prototypes.void,
            ctx.prototypes.array,
            ctx.prototypes.buffer,
            ctx.prototypes.function,
            ctx.prototypes.class,
            ctx.prototypes.module,
            ctx.prototypes.iterator,
        ] {
            mark_value(heap, &mut worklist, proto);
        }

        while let Some(v) = worklist.pop() {
            unsafe {
                for_each_ref(v, &mut |child| mark_value(heap, &mut worklist, child));
            }
        }
    }

    // ---- Decide page fate ----------------------------------------------
    let pages = ctx.heap.occupied_pages();
    ctx.heap.full_pages.clear();
    ctx.heap.current_page = std::ptr::null_mut();

    let mut source_pages: Vec<*mut Page> = Vec::new();
    let mut kept_pages: Vec<*mut Page> = Vec::new();
    for &page in &pages {
        let live = unsafe { (*page).live_bytes.load(Ordering::Relaxed) } as usize;
        if live * MIGRATION_DEN < PAGE_CAPACITY * MIGRATION_NUM {
            source_pages.push(page);
        } else {
            kept_pages.push(page);
        }
    }

    // ---- Evacuate ------------------------------------------------------
    let mut dest_pages: Vec<*mut Page> = Vec::new();
    let mut dest_current: *mut Page = std::ptr::null_mut();
    let mut failed = false;

    'evacuate: for &page in &source_pages {
        let mut dead: Vec<(HeapPtr, usize)> = Vec::new();
        let mut live: Vec<(HeapPtr, usize)> = Vec::new();
        unsafe {
            walk_page(page, |ptr, size| {
                let header = ptr.as_ref::<ObjectHeader>();
                if header.is_marked() {
                    live.push((ptr, size));
                } else {
                    dead.push((ptr, size));
                }
            });
        }

        for (ptr, size) in dead {
            let v = Value::from_heap_ptr(ptr);
            if unsafe { finalize_object(v) } {
                stats.num_objs_finalized += 1;
            }
            stats.num_objs_freed += 1;
            stats.size_freed += size as u64;
        }

        for (ptr, size) in live {
            let dst = loop {
                if dest_current.is_null() {
                    match ctx.heap.take_free_page() {
                        Some(p) => {
                            dest_pages.push(p);
                            dest_current = p;
                        }
                        None => {
                            failed = true;
                            break 'evacuate;
                        }
                    }
                }
                match unsafe { Page::alloc(dest_current, size) } {
                    Some(dst) => break dst,
                    None => dest_current = std::ptr::null_mut(),
                }
            };
            unsafe {
                std::ptr::copy_nonoverlapping(ptr.as_ptr(), dst.as_ptr(), size);
                ptr.as_ref::<ObjectHeader>().set_forwarding(dst.as_usize());
            }
            stats.num_objs_evacuated += 1;
            stats.size_evacuated += size as u64;
        }
    }

    if failed {
        rollback(ctx, &source_pages, &kept_pages, &dest_pages);
        return Err(ctx.raise_oom());
    }

    // ---- Rewrite references --------------------------------------------
    let fix = |v: Value| -> Value {
        if !v.is_heap_object() {
            return v;
        }
        match unsafe { v.header() }.forwarding_addr() {
            Some(addr) => Value::from_bits(addr),
            None => v,
        }
    };

    for root in ctx.locals.iter_mut() {
        *root = fix(*root);
    }
    for slice in ctx.tracked.iter() {
        for i in 0..slice.len {
            unsafe {
                let p = slice.ptr.add(i);
                *p = fix(*p);
            }
        }
    }
    ctx.exception = fix(ctx.exception);
    ctx.str_oom = fix(ctx.str_oom);
    ctx.empty_array = fix(ctx.empty_array);
    for slot in ctx.prototypes.slots_mut() {
        *slot = fix(*slot);
    }

    for &page in &dest_pages {
        unsafe {
            walk_page(page, |ptr, _size| {
                let v = Value::from_heap_ptr(ptr);
                update_refs(v, &fix);
                ptr.as_ref::<ObjectHeader>().clear_marked();
            });
        }
    }

    for &page in &kept_pages {
        let mut kept_bytes = 0u64;
        unsafe {
            walk_page(page, |ptr, size| {
                let header = ptr.as_ref::<ObjectHeader>();
                let v = Value::from_heap_ptr(ptr);
                if header.is_marked() {
                    update_refs(v, &fix);
                    header.clear_marked();
                    kept_bytes += size as u64;
                } else if header.type_tag() != TypeTag::Opaque {
                    if finalize_object(v) {
                        stats.num_objs_finalized += 1;
                    }
                    stats.num_objs_freed += 1;
                    stats.size_freed += size as u64;
                    // Turn the corpse into filler so the page stays walkable.
                    header.set_type_tag(TypeTag::Opaque);
                }
            });
        }
        stats.num_pages_kept += 1;
        stats.size_kept += kept_bytes;
    }

    // Off-heap objects keep their address; dead ones are released now.
    let mut retained = Vec::new();
    for entry in std::mem::take(&mut ctx.heap.off_heap) {
        let header = unsafe { entry.ptr.as_ref::<ObjectHeader>() };
        let v = Value::from_heap_ptr(entry.ptr);
        if header.is_marked() {
            unsafe { update_refs(v, &fix) };
            header.clear_marked();
            retained.push(entry);
        } else {
            if unsafe { finalize_object(v) } {
                stats.num_objs_finalized += 1;
            }
            stats.num_objs_freed += 1;
            stats.size_freed += header.size() as u64;
            unsafe { ctx.heap.free_off_heap(&entry) };
        }
    }
    ctx.heap.off_heap = retained;

    // ---- Reclaim -------------------------------------------------------
    for &page in &source_pages {
        unsafe { Page::reset(page) };
        ctx.heap.free_pages.push(page);
        stats.num_pages_freed += 1;
    }
    for &page in kept_pages.iter().chain(dest_pages.iter()) {
        unsafe { (*page).live_bytes.store(0, Ordering::Relaxed) };
        ctx.heap.full_pages.push(page);
    }

    stats.malloc_size = ctx.heap.malloc_size() as u64;
    Ok(stats)
}

/// Undo a partial evacuation: restore forwarded headers from their copies,
/// clear all marks, and put every page back on the full list.
fn rollback(
    ctx: &mut Context,
    source_pages: &[*mut Page],
    kept_pages: &[*mut Page],
    dest_pages: &[*mut Page],
) {
    for &page in source_pages {
        unsafe {
            walk_page(page, |ptr, _size| {
                let header = ptr.as_ref::<ObjectHeader>();
                if let Some(addr) = header.forwarding_addr() {
                    let copy = HeapPtr::from_usize(addr).as_ref::<ObjectHeader>();
                    header.restore(copy.raw());
                }
                header.clear_marked();
            });
        }
    }
    for &page in kept_pages {
        unsafe {
            walk_page(page, |ptr, _size| {
                ptr.as_ref::<ObjectHeader>().clear_marked();
            });
        }
    }
    // The abandoned copies must never run finalizers or be traced; turn
    // them into filler.
    for &page in dest_pages {
        unsafe {
            walk_page(page, |ptr, _size| {
                let header = ptr.as_ref::<ObjectHeader>();
                header.clear_marked();
                header.set_type_tag(TypeTag::Opaque);
            });
        }
    }
    for entry in ctx.heap.off_heap.iter() {
        unsafe { entry.ptr.as_ref::<ObjectHeader>() }.clear_marked();
    }

    for &page in source_pages
        .iter()
        .chain(kept_pages.iter())
        .chain(dest_pages.iter())
    {
        unsafe { (*page).live_bytes.store(0, Ordering::Relaxed) };
        ctx.heap.full_pages.push(page);
    }
}

/// Context teardown: run every outstanding finalizer exactly once. Objects
/// already collected ran theirs during collection; opaque filler is
/// skipped.
pub(crate) fn finalize_all(ctx: &mut Context) {
    let pages = ctx.heap.occupied_pages();
    for page in pages {
        unsafe {
            walk_page(page, |ptr, _size| {
                let v = Value::from_heap_ptr(ptr);
                finalize_object(v);
            });
        }
    }
    for entry in ctx.heap.off_heap.iter() {
        let v = Value::from_heap_ptr(entry.ptr);
        unsafe { finalize_object(v) };
    }
}
