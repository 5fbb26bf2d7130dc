//! Uniform iterator
//!
//! One iterator type traverses strings, arrays, buffers, objects (own
//! properties or the whole prototype chain), generators, booleans and void.
//! `iterator_next` advances the cursor and publishes the produced key and
//! value; exhaustion is sticky and leaves the bad sentinel in both.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::array;
use super::buffer;
use super::context::Context;
use super::error::{ErrorKind, Result};
use super::function::{self, FunctionState};
use super::heap::ObjectHeader;
use super::object::{self, DynamicPropObj};
use super::string;
use super::value::{TypeTag, Value};

/// How far an iterator reaches into its subject.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum IterDepth {
    /// Own properties of an object or class.
    Shallow = 0,
    /// Own plus prototype-chain properties, each key emitted once.
    Deep = 1,
    /// Linear contents: code points, elements, bytes, generator outputs.
    Contents = 2,
}

/// Heap layout of an iterator.
#[repr(C)]
pub struct IteratorObj {
    pub header: ObjectHeader,
    pub index: AtomicU32,
    pub depth: u8,
    /// Type tag driving the `next` dispatch.
    pub iter_type: u8,
    pub _pad: u16,
    /// The iterated value.
    pub obj: AtomicUsize,
    /// Object whose table is being walked (moves down the prototype chain).
    pub prop_obj: AtomicUsize,
    /// Snapshot of the walked property table.
    pub key_table: AtomicUsize,
    /// Dedup set for deep walks.
    pub returned_keys: AtomicUsize,
    pub last_key: AtomicUsize,
    pub last_value: AtomicUsize,
}

fn iter_obj(v: Value) -> &'static IteratorObj {
    debug_assert_eq!(v.type_tag(), TypeTag::Iterator);
    unsafe { &*v.as_obj::<IteratorObj>() }
}

fn alloc_iterator(ctx: &mut Context, depth: IterDepth, iter_type: TypeTag) -> Result<Value> {
    let ptr = ctx.alloc(TypeTag::Iterator, std::mem::size_of::<IteratorObj>())?;
    let it = unsafe { ptr.as_mut::<IteratorObj>() };
    it.index = AtomicU32::new(0);
    it.depth = u8::from(depth);
    it.iter_type = u8::from(iter_type);
    it._pad = 0;
    it.obj = AtomicUsize::new(Value::BADPTR.to_bits());
    it.prop_obj = AtomicUsize::new(Value::BADPTR.to_bits());
    it.key_table = AtomicUsize::new(Value::BADPTR.to_bits());
    it.returned_keys = AtomicUsize::new(Value::BADPTR.to_bits());
    it.last_key = AtomicUsize::new(Value::BADPTR.to_bits());
    it.last_value = AtomicUsize::new(Value::BADPTR.to_bits());
    Ok(Value::from_heap_ptr(ptr))
}

/// Create an iterator over `v`.
///
/// Objects and classes walk properties at any depth; `Contents` iterates the
/// linear form of everything else. `void` is empty, scalars emit themselves
/// once, and a generator is stepped per `next`.
pub fn new_iterator(ctx: &mut Context, v: Value, depth: IterDepth) -> Result<Value> {
    debug_assert!(!v.is_bad());
    let tag = v.type_tag();

    let object_like = matches!(tag, TypeTag::Object | TypeTag::Class);
    if object_like || depth != IterDepth::Contents {
        return new_object_walk(ctx, v, depth);
    }

    ctx.with_scope(|ctx| {
        let obj_loc = ctx.push_local(v);
        let iter = alloc_iterator(ctx, depth, tag)?;
        let v = ctx.local(obj_loc);
        let it = iter_obj(iter);
        it.obj.store(v.to_bits(), Ordering::Release);
        it.prop_obj.store(v.to_bits(), Ordering::Release);
        Ok(iter)
    })
}

/// Property-walk iterator over `v` (which may be a non-object value whose
/// type prototype is walked when `depth` is `Deep`).
fn new_object_walk(ctx: &mut Context, v: Value, depth: IterDepth) -> Result<Value> {
    ctx.with_scope(|ctx| {
        let obj_loc = ctx.push_local(v);

        let returned_keys = if depth == IterDepth::Deep {
            object::new_object_with_prototype(ctx, Value::VOID)?
        } else {
            Value::BADPTR
        };
        let keys_loc = ctx.push_local(returned_keys);

        let iter = alloc_iterator(ctx, depth, TypeTag::Object)?;
        let v = ctx.local(obj_loc);
        let returned_keys = ctx.local(keys_loc);

        let object_like = matches!(v.type_tag(), TypeTag::Object | TypeTag::Class);
        let prop_obj = if object_like {
            v
        } else if depth == IterDepth::Deep {
            object::type_prototype(ctx, v)
        } else {
            Value::BADPTR
        };

        let it = iter_obj(iter);
        it.obj.store(v.to_bits(), Ordering::Release);
        it.prop_obj.store(prop_obj.to_bits(), Ordering::Release);
        if !prop_obj.is_bad() && !prop_obj.is_void() {
            let table = object::props_storage(prop_obj);
            it.key_table.store(table.to_bits(), Ordering::Release);
        }
        it.returned_keys
            .store(returned_keys.to_bits(), Ordering::Release);
        Ok(iter)
    })
}

/// Duplicate an iterator, including its cursor position.
pub fn new_iterator_copy(ctx: &mut Context, iter: Value) -> Result<Value> {
    debug_assert_eq!(iter.type_tag(), TypeTag::Iterator);
    ctx.with_scope(|ctx| {
        let src_loc = ctx.push_local(iter);
        let ptr = ctx.alloc(TypeTag::Iterator, std::mem::size_of::<IteratorObj>())?;
        let src = iter_obj(ctx.local(src_loc));

        let it = unsafe { ptr.as_mut::<IteratorObj>() };
        it.index = AtomicU32::new(src.index.load(Ordering::Relaxed));
        it.depth = src.depth;
        it.iter_type = src.iter_type;
        it._pad = 0;
        it.obj = AtomicUsize::new(src.obj.load(Ordering::Relaxed));
        it.prop_obj = AtomicUsize::new(src.prop_obj.load(Ordering::Relaxed));
        it.key_table = AtomicUsize::new(src.key_table.load(Ordering::Relaxed));
        it.returned_keys = AtomicUsize::new(src.returned_keys.load(Ordering::Relaxed));
        it.last_key = AtomicUsize::new(src.last_key.load(Ordering::Relaxed));
        it.last_value = AtomicUsize::new(src.last_value.load(Ordering::Relaxed));
        Ok(Value::from_heap_ptr(ptr))
    })
}

/// Key produced by the last successful `next`; bad when exhausted.
pub fn get_walk_key(iter: Value) -> Value {
    Value::from_bits(iter_obj(iter).last_key.load(Ordering::Acquire))
}

/// Value produced by the last successful `next`; bad when exhausted.
pub fn get_walk_value(iter: Value) -> Value {
    Value::from_bits(iter_obj(iter).last_value.load(Ordering::Acquire))
}

fn finish(iter: Value) {
    let it = iter_obj(iter);
    it.last_key
        .store(Value::BADPTR.to_bits(), Ordering::Release);
    it.last_value
        .store(Value::BADPTR.to_bits(), Ordering::Release);
}

fn publish(iter: Value, key: Value, value: Value) {
    let it = iter_obj(iter);
    it.last_key.store(key.to_bits(), Ordering::Release);
    it.last_value.store(value.to_bits(), Ordering::Release);
}

/// Advance the iterator. Returns `Ok(true)` when a key/value pair was
/// produced, `Ok(false)` on exhaustion (sticky), and propagates exceptions
/// raised by generators. A dynamic property whose getter raises clears the
/// exception and yields the getter function itself.
pub fn iterator_next(ctx: &mut Context, iter: Value) -> Result<bool> {
    if !iter.is_heap_object() || iter.type_tag() != TypeTag::Iterator {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not an iterator"));
    }

    let iter_type = TypeTag::try_from(iter_obj(iter).iter_type).expect("corrupt iterator");
    match iter_type {
        TypeTag::Object => object_walk_next(ctx, iter),
        TypeTag::Void => {
            finish(iter);
            Ok(false)
        }
        TypeTag::Array => array_next(ctx, iter),
        TypeTag::String => string_next(ctx, iter),
        TypeTag::Buffer => buffer_next(ctx, iter),
        TypeTag::Function | TypeTag::Class => generator_next(ctx, iter),
        _ => singleton_next(ctx, iter),
    }
}

/// Scalars iterate as a single `(void, value)` pair.
fn singleton_next(_ctx: &mut Context, iter: Value) -> Result<bool> {
    let it = iter_obj(iter);
    if it.index.swap(1, Ordering::AcqRel) == 0 {
        let obj = Value::from_bits(it.obj.load(Ordering::Acquire));
        publish(iter, Value::VOID, obj);
        Ok(true)
    } else {
        finish(iter);
        Ok(false)
    }
}

fn array_next(ctx: &mut Context, iter: Value) -> Result<bool> {
    let it = iter_obj(iter);
    let obj = Value::from_bits(it.obj.load(Ordering::Acquire));
    let idx = it.index.fetch_add(1, Ordering::AcqRel);
    let size = array::array_size(obj);

    if idx < size {
        ctx.with_scope(|ctx| {
            let iter_loc = ctx.push_local(iter);
            let value = array::array_read(ctx, obj, i64::from(idx))?;
            let iter = ctx.local(iter_loc);
            publish(iter, Value::from_small_int(i64::from(idx)), value);
            Ok(true)
        })
    } else {
        it.index.store(size, Ordering::Release);
        finish(iter);
        Ok(false)
    }
}

fn string_next(ctx: &mut Context, iter: Value) -> Result<bool> {
    let it = iter_obj(iter);
    let obj = Value::from_bits(it.obj.load(Ordering::Acquire));
    let idx = it.index.fetch_add(1, Ordering::AcqRel);
    let size = string::string_length(obj);

    if idx < size {
        ctx.with_scope(|ctx| {
            let iter_loc = ctx.push_local(iter);
            let value = string::string_get_char(ctx, obj, i64::from(idx))?;
            let iter = ctx.local(iter_loc);
            publish(iter, Value::from_small_int(i64::from(idx)), value);
            Ok(true)
        })
    } else {
        it.index.store(size, Ordering::Release);
        finish(iter);
        Ok(false)
    }
}

fn buffer_next(_ctx: &mut Context, iter: Value) -> Result<bool> {
    let it = iter_obj(iter);
    let obj = Value::from_bits(it.obj.load(Ordering::Acquire));
    let idx = it.index.fetch_add(1, Ordering::AcqRel);
    let size = buffer::buffer_size(obj);

    if idx < size {
        let byte = unsafe { *buffer::buffer_data_ptr(obj).add(idx as usize) };
        publish(
            iter,
            Value::from_small_int(i64::from(idx)),
            Value::from_small_int(i64::from(byte)),
        );
        Ok(true)
    } else {
        it.index.store(size, Ordering::Release);
        finish(iter);
        Ok(false)
    }
}

fn generator_next(ctx: &mut Context, iter: Value) -> Result<bool> {
    let obj = Value::from_bits(iter_obj(iter).obj.load(Ordering::Acquire));

    if !function::is_generator(obj) {
        return Err(ctx.raise(ErrorKind::NotAGenerator, "function is not a generator"));
    }
    if function::function_state(obj) == FunctionState::GenDone {
        finish(iter);
        return Ok(false);
    }

    ctx.with_scope(|ctx| {
        let iter_loc = ctx.push_local(iter);
        let args = ctx.empty_array;
        let produced = function::call_generator(ctx, obj, Value::VOID, args)?;
        let iter = ctx.local(iter_loc);

        match produced {
            Some(value) => {
                let idx = iter_obj(iter).index.fetch_add(1, Ordering::AcqRel);
                publish(iter, Value::from_small_int(i64::from(idx)), value);
                Ok(true)
            }
            None => {
                finish(iter);
                Ok(false)
            }
        }
    })
}

/// One step of the property walk, including prototype-chain advancement and
/// deep-walk key dedup.
fn object_walk_next(ctx: &mut Context, iter: Value) -> Result<bool> {
    let deep = iter_obj(iter).depth == u8::from(IterDepth::Deep);

    ctx.with_scope(|ctx| {
        let iter_loc = ctx.push_local(iter);

        loop {
            let iter = ctx.local(iter_loc);
            let it = iter_obj(iter);
            let table = Value::from_bits(it.key_table.load(Ordering::Acquire));

            if table.is_bad() {
                if !advance_prototype(ctx, iter, deep) {
                    finish(ctx.local(iter_loc));
                    return Ok(false);
                }
                continue;
            }

            let idx = it.index.load(Ordering::Acquire);
            if idx >= object::table_capacity(table) {
                if !advance_prototype(ctx, iter, deep) {
                    finish(ctx.local(iter_loc));
                    return Ok(false);
                }
                continue;
            }
            it.index.store(idx + 1, Ordering::Release);

            let (key, value) = object::table_item(table, idx);
            if key.is_bad() || value.is_bad() {
                continue;
            }

            if deep {
                let returned = Value::from_bits(it.returned_keys.load(Ordering::Acquire));
                if object::get_property_shallow(ctx, returned, key)?.is_some() {
                    continue;
                }
                let key_loc = ctx.push_local(key);
                let val_loc = ctx.push_local(value);
                object::set_property(ctx, returned, key, Value::TRUE)?;
                let key = ctx.local(key_loc);
                let value = ctx.local(val_loc);

                let resolved = resolve_dynamic(ctx, iter_loc, value)?;
                let iter = ctx.local(iter_loc);
                let key = ctx.local(key_loc);
                publish(iter, key, resolved);
                return Ok(true);
            }

            let key_loc = ctx.push_local(key);
            let resolved = resolve_dynamic(ctx, iter_loc, value)?;
            let iter = ctx.local(iter_loc);
            let key = ctx.local(key_loc);
            publish(iter, key, resolved);
            return Ok(true);
        }
    })
}

/// Move the walk to the next prototype link; false when the chain ends or
/// the walk is shallow.
fn advance_prototype(ctx: &mut Context, iter: Value, deep: bool) -> bool {
    let it = iter_obj(iter);
    if !deep {
        return false;
    }
    let prop_obj = Value::from_bits(it.prop_obj.load(Ordering::Acquire));
    if prop_obj.is_bad() || prop_obj.is_void() {
        return false;
    }
    if !matches!(prop_obj.type_tag(), TypeTag::Object | TypeTag::Class) {
        return false;
    }
    let proto = object::get_prototype(ctx, prop_obj);
    if !proto.is_heap_object() || !matches!(proto.type_tag(), TypeTag::Object | TypeTag::Class) {
        return false;
    }

    it.prop_obj.store(proto.to_bits(), Ordering::Release);
    let table = object::props_storage(proto);
    it.key_table.store(table.to_bits(), Ordering::Release);
    it.index.store(0, Ordering::Release);
    true
}

/// Apply the dynamic-property contract: invoke the getter with the iterated
/// object as `this`; a raising getter is cleared and stands in for its own
/// value.
fn resolve_dynamic(
    ctx: &mut Context,
    iter_loc: super::context::Local,
    value: Value,
) -> Result<Value> {
    if !value.is_heap_object() || value.type_tag() != TypeTag::DynamicProp {
        return Ok(value);
    }
    let getter = {
        let prop = unsafe { &*value.as_obj::<DynamicPropObj>() };
        Value::from_bits(prop.getter.load(Ordering::Acquire))
    };
    if getter.is_bad() || getter.is_void() {
        return Ok(value);
    }

    let iter = ctx.local(iter_loc);
    let this = Value::from_bits(iter_obj(iter).obj.load(Ordering::Acquire));
    let getter_loc = ctx.push_local(getter);
    let args = ctx.empty_array;
    match function::call_function(ctx, getter, this, args) {
        Ok(v) => Ok(v),
        Err(_) => {
            ctx.clear_exception();
            Ok(ctx.local(getter_loc))
        }
    }
}
