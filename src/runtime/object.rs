//! Object model
//!
//! Properties live in an open-addressing hash table whose capacity is a
//! power of two. Each slot holds `{hash, key, value}`; a fresh insert
//! publishes the hash first, then the key, then the value, so a reader that
//! observes a key without a value treats the slot as not yet written.
//! Deletion is logical: the value becomes the bad sentinel while hash and
//! key stay, keeping probe chains valid.
//!
//! When the table grows, the new table is published through the old one's
//! `new_prop_table` pointer before items migrate; readers consult the newest
//! table first, then walk back down the chain.
//!
//! Property lookup has two modes: deep (walks the prototype chain, including
//! the per-type prototypes for non-object values) and shallow (own
//! properties only). Writes never touch the prototype.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::context::Context;
use super::error::{ErrorKind, Result};
use super::function::{self, ClassObj, NativeHandler};
use super::heap::{Finalize, ObjectHeader};
use super::string;
use super::value::{TypeTag, Value};

/// Initial property table capacity; must be a power of two.
const INITIAL_CAPACITY: u32 = 4;

/// Grow when `used + tombstones >= capacity * 3 / 4`.
const GROW_LOAD_NUM: u32 = 3;
const GROW_LOAD_DEN: u32 = 4;

/// Statically-declared identity tag for native private data.
///
/// Each native class declares one `static` instance; the address is the tag.
pub struct PrivateClass {
    _dummy: u8,
}

impl PrivateClass {
    pub const fn new() -> Self {
        Self { _dummy: 0 }
    }

    fn tag(&'static self) -> usize {
        self as *const PrivateClass as usize
    }
}

impl Default for PrivateClass {
    fn default() -> Self {
        Self::new()
    }
}

/// Heap layout of an object.
#[repr(C)]
pub struct ObjectObj {
    pub header: ObjectHeader,
    /// Value bits of the prototype; `void` when the chain ends.
    pub prototype: AtomicUsize,
    /// Value bits of the property table, bad until the first set.
    pub props: AtomicUsize,
    /// Address of the declaring [`PrivateClass`], 0 when none.
    pub priv_class: AtomicUsize,
    pub priv_ptr: AtomicUsize,
    pub finalize: Option<Finalize>,
}

/// One property slot.
#[repr(C)]
pub struct PropItem {
    pub hash: AtomicU32,
    pub _pad: u32,
    /// Value bits of the key string; bad while the slot is unused.
    pub key: AtomicUsize,
    /// Value bits of the property value; bad for tombstones and slots whose
    /// write has not completed.
    pub value: AtomicUsize,
}

/// Heap layout of a property table. Items follow at
/// [`ObjectStorageObj::ITEMS_OFFSET`].
#[repr(C)]
pub struct ObjectStorageObj {
    pub header: ObjectHeader,
    pub capacity: u32,
    pub num_slots_used: AtomicU32,
    pub num_slots_open: AtomicU32,
    pub active_copies: AtomicU32,
    /// Value bits of the migration target while this table is being retired.
    pub new_prop_table: AtomicUsize,
    pub _pad: u32,
}

impl ObjectStorageObj {
    pub const ITEMS_OFFSET: usize = std::mem::size_of::<ObjectStorageObj>();

    /// Item cell at `i`.
    ///
    /// # Safety
    /// `i` must be below `self.capacity`.
    #[inline]
    pub unsafe fn item(&self, i: u32) -> &PropItem {
        debug_assert!(i < self.capacity);
        unsafe {
            let base = (self as *const Self as *const u8).add(Self::ITEMS_OFFSET);
            &*(base as *const PropItem).add(i as usize)
        }
    }
}

// =========================================================================
// Construction
// =========================================================================

fn alloc_table(ctx: &mut Context, capacity: u32) -> Result<Value> {
    debug_assert!(capacity.is_power_of_two());
    let size =
        ObjectStorageObj::ITEMS_OFFSET + capacity as usize * std::mem::size_of::<PropItem>();
    let ptr = ctx.alloc(TypeTag::ObjectStorage, size)?;
    let table = unsafe { ptr.as_mut::<ObjectStorageObj>() };
    table.capacity = capacity;
    table.num_slots_used = AtomicU32::new(0);
    table.num_slots_open = AtomicU32::new(0);
    table.active_copies = AtomicU32::new(0);
    table.new_prop_table = AtomicUsize::new(Value::BADPTR.to_bits());
    table._pad = 0;
    for i in 0..capacity {
        let item = unsafe { table.item(i) };
        item.hash.store(0, Ordering::Relaxed);
        item.key.store(Value::BADPTR.to_bits(), Ordering::Relaxed);
        item.value.store(Value::BADPTR.to_bits(), Ordering::Relaxed);
    }
    Ok(Value::from_heap_ptr(ptr))
}

/// Create an object whose prototype is the instance object prototype.
pub fn new_object(ctx: &mut Context) -> Result<Value> {
    let proto = ctx.prototypes.object;
    new_object_with_prototype(ctx, proto)
}

/// Create an object with an explicit prototype (`void` for none).
pub fn new_object_with_prototype(ctx: &mut Context, prototype: Value) -> Result<Value> {
    ctx.with_scope(|ctx| {
        let proto_loc = ctx.push_local(prototype);
        let ptr = ctx.alloc(TypeTag::Object, std::mem::size_of::<ObjectObj>())?;
        let prototype = ctx.local(proto_loc);

        let obj = unsafe { ptr.as_mut::<ObjectObj>() };
        obj.prototype = AtomicUsize::new(prototype.to_bits());
        obj.props = AtomicUsize::new(Value::BADPTR.to_bits());
        obj.priv_class = AtomicUsize::new(0);
        obj.priv_ptr = AtomicUsize::new(0);
        obj.finalize = None;
        Ok(Value::from_heap_ptr(ptr))
    })
}

/// Create an object carrying a typed private-data slot and an optional
/// finalizer.
pub fn new_object_with_private(
    ctx: &mut Context,
    prototype: Value,
    priv_class: &'static PrivateClass,
    finalize: Option<Finalize>,
) -> Result<Value> {
    let v = new_object_with_prototype(ctx, prototype)?;
    let obj = unsafe { &mut *v.as_obj::<ObjectObj>() };
    obj.priv_class.store(priv_class.tag(), Ordering::Relaxed);
    obj.finalize = finalize;
    Ok(v)
}

// =========================================================================
// Private data
// =========================================================================

/// Store a private pointer; the object must have been created with a
/// private class.
pub fn object_set_private(v: Value, priv_class: &'static PrivateClass, ptr: *mut c_void) {
    let obj = unsafe { &*v.as_obj::<ObjectObj>() };
    if obj.priv_class.load(Ordering::Relaxed) == priv_class.tag() {
        obj.priv_ptr.store(ptr as usize, Ordering::Release);
    }
}

/// Type-safe downcast: the pointer comes back only when the class tag
/// matches.
pub fn object_get_private(v: Value, priv_class: &'static PrivateClass) -> Option<*mut c_void> {
    if !v.is_heap_object() || v.type_tag() != TypeTag::Object {
        return None;
    }
    let obj = unsafe { &*v.as_obj::<ObjectObj>() };
    if obj.priv_class.load(Ordering::Relaxed) == priv_class.tag() {
        Some(obj.priv_ptr.load(Ordering::Acquire) as *mut c_void)
    } else {
        None
    }
}

/// Atomically exchange the private pointer, tag-checked.
pub fn object_swap_private(
    v: Value,
    priv_class: &'static PrivateClass,
    new_ptr: *mut c_void,
) -> Option<*mut c_void> {
    if !v.is_heap_object() || v.type_tag() != TypeTag::Object {
        return None;
    }
    let obj = unsafe { &*v.as_obj::<ObjectObj>() };
    if obj.priv_class.load(Ordering::Relaxed) == priv_class.tag() {
        Some(obj.priv_ptr.swap(new_ptr as usize, Ordering::AcqRel) as *mut c_void)
    } else {
        None
    }
}

// =========================================================================
// Table access
// =========================================================================

fn is_object_like(v: Value) -> bool {
    v.is_heap_object() && matches!(v.type_tag(), TypeTag::Object | TypeTag::Class)
}

/// The property-table slot of an object or class.
pub(crate) fn props_slot(v: Value) -> &'static AtomicUsize {
    debug_assert!(is_object_like(v));
    match v.type_tag() {
        TypeTag::Object => unsafe { &(*v.as_obj::<ObjectObj>()).props },
        _ => unsafe { &(*v.as_obj::<ClassObj>()).props },
    }
}

/// The prototype slot of an object or class.
pub(crate) fn proto_slot(v: Value) -> &'static AtomicUsize {
    debug_assert!(is_object_like(v));
    match v.type_tag() {
        TypeTag::Object => unsafe { &(*v.as_obj::<ObjectObj>()).prototype },
        _ => unsafe { &(*v.as_obj::<ClassObj>()).prototype },
    }
}

/// Property table currently attached to an object or class.
pub(crate) fn props_storage(v: Value) -> Value {
    Value::from_bits(props_slot(v).load(Ordering::Acquire))
}

/// Key and value stored in table slot `idx`. Either may be bad.
pub(crate) fn table_item(table: Value, idx: u32) -> (Value, Value) {
    let t = unsafe { &*table.as_obj::<ObjectStorageObj>() };
    let item = unsafe { t.item(idx) };
    let key = Value::from_bits(item.key.load(Ordering::Acquire));
    let value = Value::from_bits(item.value.load(Ordering::Acquire));
    (key, value)
}

pub(crate) fn table_capacity(table: Value) -> u32 {
    unsafe { &*table.as_obj::<ObjectStorageObj>() }.capacity
}

/// Find `key` in one table. Returns the slot value, bad for tombstones.
fn lookup_in_table(table: Value, key: Value, hash: u32) -> Option<Value> {
    let t = unsafe { &*table.as_obj::<ObjectStorageObj>() };
    let mask = t.capacity - 1;
    let mut idx = hash & mask;
    loop {
        let item = unsafe { t.item(idx) };
        let slot_key = Value::from_bits(item.key.load(Ordering::Acquire));
        if slot_key.is_bad() {
            return None;
        }
        if item.hash.load(Ordering::Acquire) == hash
            && (slot_key == key || string::string_equal(slot_key, key))
        {
            return Some(Value::from_bits(item.value.load(Ordering::Acquire)));
        }
        idx = (idx + 1) & mask;
    }
}

/// Own-property lookup: newest table first, then down the migration chain.
fn get_own_property(v: Value, key: Value, hash: u32) -> Option<Value> {
    let first = props_storage(v);
    if first.is_bad() {
        return None;
    }

    let mut chain = vec![first];
    loop {
        let t = unsafe { &*chain.last().unwrap().as_obj::<ObjectStorageObj>() };
        let next = Value::from_bits(t.new_prop_table.load(Ordering::Acquire));
        if next.is_bad() {
            break;
        }
        chain.push(next);
    }

    for table in chain.iter().rev() {
        if let Some(value) = lookup_in_table(*table, key, hash) {
            if value.is_bad() {
                // Tombstone in the newest table that holds the key wins.
                return None;
            }
            return Some(value);
        }
    }
    None
}

fn check_key(ctx: &mut Context, key: Value) -> Result<u32> {
    if !key.is_heap_object() || key.type_tag() != TypeTag::String {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "property key is not a string"));
    }
    Ok(string::string_hash(key))
}

/// Lookup mode for [`get_property_with_depth`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropDepth {
    /// Own properties only.
    Shallow,
    /// Walk the prototype chain.
    Deep,
}

/// Read a property. Returns `None` when the key is absent; dynamic property
/// values come back raw (the caller invokes the getter).
pub fn get_property_with_depth(
    ctx: &mut Context,
    v: Value,
    key: Value,
    depth: PropDepth,
) -> Result<Option<Value>> {
    let hash = check_key(ctx, key)?;
    if v.is_bad() {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "value has no properties"));
    }

    if is_object_like(v) {
        if let Some(found) = get_own_property(v, key, hash) {
            return Ok(Some(found));
        }
        if depth == PropDepth::Shallow {
            return Ok(None);
        }
        let mut proto = Value::from_bits(proto_slot(v).load(Ordering::Acquire));
        while is_object_like(proto) {
            if let Some(found) = get_own_property(proto, key, hash) {
                return Ok(Some(found));
            }
            proto = Value::from_bits(proto_slot(proto).load(Ordering::Acquire));
        }
        return Ok(None);
    }

    if depth == PropDepth::Shallow {
        return Ok(None);
    }
    let proto = type_prototype(ctx, v);
    if is_object_like(proto) {
        return get_property_with_depth(ctx, proto, key, PropDepth::Deep);
    }
    Ok(None)
}

/// Deep property read.
pub fn get_property(ctx: &mut Context, v: Value, key: Value) -> Result<Option<Value>> {
    get_property_with_depth(ctx, v, key, PropDepth::Deep)
}

/// Shallow (own) property read.
pub fn get_property_shallow(ctx: &mut Context, v: Value, key: Value) -> Result<Option<Value>> {
    get_property_with_depth(ctx, v, key, PropDepth::Shallow)
}

/// Grow the table to the next power of two and migrate live items.
fn grow_table(ctx: &mut Context, obj: Value) -> Result<()> {
    let old = props_storage(obj);
    let new_capacity = table_capacity(old) * 2;

    ctx.with_scope(|ctx| {
        let obj_loc = ctx.push_local(obj);
        let old_loc = ctx.push_local(old);
        let new = alloc_table(ctx, new_capacity)?;
        let obj = ctx.local(obj_loc);
        let old = ctx.local(old_loc);

        let old_t = unsafe { &*old.as_obj::<ObjectStorageObj>() };
        // Publish the migration target first so late readers of the old
        // snapshot can find items that moved.
        old_t.new_prop_table.store(new.to_bits(), Ordering::Release);

        let new_t = unsafe { &*new.as_obj::<ObjectStorageObj>() };
        let mask = new_capacity - 1;
        let mut used = 0u32;
        for i in 0..old_t.capacity {
            let item = unsafe { old_t.item(i) };
            let key = Value::from_bits(item.key.load(Ordering::Acquire));
            let value = Value::from_bits(item.value.load(Ordering::Acquire));
            if key.is_bad() || value.is_bad() {
                continue;
            }
            let hash = item.hash.load(Ordering::Acquire);
            let mut idx = hash & mask;
            loop {
                let slot = unsafe { new_t.item(idx) };
                if Value::from_bits(slot.key.load(Ordering::Acquire)).is_bad() {
                    slot.hash.store(hash, Ordering::Release);
                    slot.key.store(key.to_bits(), Ordering::Release);
                    slot.value.store(value.to_bits(), Ordering::Release);
                    used += 1;
                    break;
                }
                idx = (idx + 1) & mask;
            }
        }
        new_t.num_slots_used.store(used, Ordering::Release);

        props_slot(obj).store(new.to_bits(), Ordering::Release);
        Ok(())
    })
}

/// Create or update an own property. Never touches the prototype chain.
pub fn set_property(ctx: &mut Context, v: Value, key: Value, value: Value) -> Result<()> {
    let hash = check_key(ctx, key)?;
    if !is_object_like(v) {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "cannot set property on this type"));
    }

    ctx.with_scope(|ctx| {
        let obj_loc = ctx.push_local(v);
        let key_loc = ctx.push_local(key);
        let val_loc = ctx.push_local(value);

        // Lazily attach the first table.
        if props_storage(ctx.local(obj_loc)).is_bad() {
            let table = alloc_table(ctx, INITIAL_CAPACITY)?;
            let obj = ctx.local(obj_loc);
            props_slot(obj).store(table.to_bits(), Ordering::Release);
        }

        // Grow when used + tombstones crosses the load factor.
        loop {
            let obj = ctx.local(obj_loc);
            let table = props_storage(obj);
            let t = unsafe { &*table.as_obj::<ObjectStorageObj>() };
            let used = t.num_slots_used.load(Ordering::Acquire);
            let open = t.num_slots_open.load(Ordering::Acquire);
            if (used + open + 1) * GROW_LOAD_DEN < t.capacity * GROW_LOAD_NUM + GROW_LOAD_DEN {
                break;
            }
            grow_table(ctx, obj)?;
        }

        let obj = ctx.local(obj_loc);
        let key = ctx.local(key_loc);
        let value = ctx.local(val_loc);
        let table = props_storage(obj);
        let t = unsafe { &*table.as_obj::<ObjectStorageObj>() };
        let mask = t.capacity - 1;
        let mut idx = hash & mask;
        loop {
            let item = unsafe { t.item(idx) };
            let slot_key = Value::from_bits(item.key.load(Ordering::Acquire));
            if slot_key.is_bad() {
                // Fresh slot: hash, then key, then value.
                item.hash.store(hash, Ordering::Release);
                item.key.store(key.to_bits(), Ordering::Release);
                item.value.store(value.to_bits(), Ordering::Release);
                t.num_slots_used.fetch_add(1, Ordering::AcqRel);
                return Ok(());
            }
            if item.hash.load(Ordering::Acquire) == hash
                && (slot_key == key || string::string_equal(slot_key, key))
            {
                let prev = item.value.swap(value.to_bits(), Ordering::AcqRel);
                if Value::from_bits(prev).is_bad() {
                    // Resurrected a tombstone.
                    t.num_slots_open.fetch_sub(1, Ordering::AcqRel);
                }
                return Ok(());
            }
            idx = (idx + 1) & mask;
        }
    })
}

/// Delete an own property. Absent keys are ignored.
pub fn delete_property(ctx: &mut Context, v: Value, key: Value) -> Result<()> {
    let hash = check_key(ctx, key)?;
    if !is_object_like(v) {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "cannot delete property on this type"));
    }

    let table = props_storage(v);
    if table.is_bad() {
        return Ok(());
    }
    let t = unsafe { &*table.as_obj::<ObjectStorageObj>() };
    let mask = t.capacity - 1;
    let mut idx = hash & mask;
    loop {
        let item = unsafe { t.item(idx) };
        let slot_key = Value::from_bits(item.key.load(Ordering::Acquire));
        if slot_key.is_bad() {
            return Ok(());
        }
        if item.hash.load(Ordering::Acquire) == hash
            && (slot_key == key || string::string_equal(slot_key, key))
        {
            let prev = item.value.swap(Value::BADPTR.to_bits(), Ordering::AcqRel);
            if !Value::from_bits(prev).is_bad() {
                t.num_slots_open.fetch_add(1, Ordering::AcqRel);
            }
            return Ok(());
        }
        idx = (idx + 1) & mask;
    }
}

// =========================================================================
// Prototypes
// =========================================================================

/// The prototype consulted for property lookup on a non-object value.
pub(crate) fn type_prototype(ctx: &Context, v: Value) -> Value {
    match v.type_tag() {
        TypeTag::Integer => ctx.prototypes.integer,
        TypeTag::Float => ctx.prototypes.float,
        TypeTag::String => ctx.prototypes.string,
        TypeTag::Boolean => ctx.prototypes.boolean,
        TypeTag::Void => ctx.prototypes.void,
        TypeTag::Array => ctx.prototypes.array,
        TypeTag::Buffer => ctx.prototypes.buffer,
        TypeTag::Function => ctx.prototypes.function,
        TypeTag::Class => ctx.prototypes.class,
        TypeTag::Module => ctx.prototypes.module,
        TypeTag::Iterator => ctx.prototypes.iterator,
        _ => Value::VOID,
    }
}

/// Prototype of any value: the object's own prototype, or its type
/// prototype.
pub fn get_prototype(ctx: &mut Context, v: Value) -> Value {
    if is_object_like(v) {
        Value::from_bits(proto_slot(v).load(Ordering::Acquire))
    } else {
        type_prototype(ctx, v)
    }
}

/// True when `proto` occurs anywhere on `v`'s prototype chain.
pub fn has_prototype(ctx: &mut Context, v: Value, proto: Value) -> bool {
    let mut p = get_prototype(ctx, v);
    while is_object_like(p) {
        if p == proto {
            return true;
        }
        p = Value::from_bits(proto_slot(p).load(Ordering::Acquire));
    }
    p == proto
}

// =========================================================================
// Dynamic properties
// =========================================================================

/// Heap layout of an accessor pair stored as a property value.
#[repr(C)]
pub struct DynamicPropObj {
    pub header: ObjectHeader,
    pub getter: AtomicUsize,
    pub setter: AtomicUsize,
}

/// Create a dynamic-property value from getter/setter functions.
pub fn new_dynamic_prop(ctx: &mut Context, getter: Value, setter: Value) -> Result<Value> {
    ctx.with_scope(|ctx| {
        let getter_loc = ctx.push_local(getter);
        let setter_loc = ctx.push_local(setter);
        let ptr = ctx.alloc(TypeTag::DynamicProp, std::mem::size_of::<DynamicPropObj>())?;
        let prop = unsafe { ptr.as_mut::<DynamicPropObj>() };
        prop.getter = AtomicUsize::new(ctx.local(getter_loc).to_bits());
        prop.setter = AtomicUsize::new(ctx.local(setter_loc).to_bits());
        Ok(Value::from_heap_ptr(ptr))
    })
}

/// Install a built-in accessor property backed by native handlers.
pub fn set_builtin_dynamic_property(
    ctx: &mut Context,
    v: Value,
    name: Value,
    getter: Option<NativeHandler>,
    setter: Option<NativeHandler>,
) -> Result<()> {
    ctx.with_scope(|ctx| {
        let obj_loc = ctx.push_local(v);
        let name_loc = ctx.push_local(name);

        let getter_val = match getter {
            Some(handler) => {
                let name = ctx.local(name_loc);
                function::new_native_function(ctx, name, handler, 0)?
            }
            None => Value::VOID,
        };
        let getter_loc = ctx.push_local(getter_val);

        let setter_val = match setter {
            Some(handler) => {
                let name = ctx.local(name_loc);
                function::new_native_function(ctx, name, handler, 1)?
            }
            None => Value::VOID,
        };
        let setter_loc = ctx.push_local(setter_val);

        let getter_val = ctx.local(getter_loc);
        let setter_val = ctx.local(setter_loc);
        let prop = new_dynamic_prop(ctx, getter_val, setter_val)?;

        let obj = ctx.local(obj_loc);
        let name = ctx.local(name_loc);
        set_property(ctx, obj, name, prop)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::string::new_string;

    #[test]
    fn test_set_get_delete_roundtrip() {
        let mut ctx = Context::new().unwrap();
        let obj = new_object(&mut ctx).unwrap();
        let key = new_string(&mut ctx, "answer").unwrap();

        assert!(get_property(&mut ctx, obj, key).unwrap().is_none());

        set_property(&mut ctx, obj, key, Value::from_small_int(42)).unwrap();
        let got = get_property(&mut ctx, obj, key).unwrap().unwrap();
        assert_eq!(got.as_small_int(), 42);

        // Same content, different string object.
        let key2 = new_string(&mut ctx, "answer").unwrap();
        let got = get_property(&mut ctx, obj, key2).unwrap().unwrap();
        assert_eq!(got.as_small_int(), 42);

        delete_property(&mut ctx, obj, key).unwrap();
        assert!(get_property_shallow(&mut ctx, obj, key).unwrap().is_none());
        assert!(get_property(&mut ctx, obj, key).unwrap().is_none());
    }

    #[test]
    fn test_overwrite_keeps_single_slot() {
        let mut ctx = Context::new().unwrap();
        let obj = new_object(&mut ctx).unwrap();
        let key = new_string(&mut ctx, "k").unwrap();

        set_property(&mut ctx, obj, key, Value::from_small_int(1)).unwrap();
        set_property(&mut ctx, obj, key, Value::from_small_int(2)).unwrap();

        let table = props_storage(obj);
        let t = unsafe { &*table.as_obj::<ObjectStorageObj>() };
        assert_eq!(t.num_slots_used.load(Ordering::Relaxed), 1);
        assert_eq!(
            get_property(&mut ctx, obj, key).unwrap().unwrap().as_small_int(),
            2
        );
    }

    #[test]
    fn test_growth_preserves_properties() {
        let mut ctx = Context::new().unwrap();
        let obj = new_object(&mut ctx).unwrap();
        let obj_loc = ctx.push_local(obj);

        for i in 0..64 {
            let key = new_string(&mut ctx, &format!("key{}", i)).unwrap();
            let obj = ctx.local(obj_loc);
            set_property(&mut ctx, obj, key, Value::from_small_int(i)).unwrap();
        }

        let obj = ctx.local(obj_loc);
        assert!(table_capacity(props_storage(obj)) >= 64);
        for i in 0..64 {
            let key = new_string(&mut ctx, &format!("key{}", i)).unwrap();
            let obj = ctx.local(obj_loc);
            let got = get_property(&mut ctx, obj, key).unwrap().unwrap();
            assert_eq!(got.as_small_int(), i);
        }
    }

    #[test]
    fn test_prototype_chain_lookup() {
        let mut ctx = Context::new().unwrap();
        let a = new_object(&mut ctx).unwrap();
        let b = new_object_with_prototype(&mut ctx, a).unwrap();
        let c = new_object_with_prototype(&mut ctx, b).unwrap();

        let key_x = new_string(&mut ctx, "x").unwrap();
        let key_y = new_string(&mut ctx, "y").unwrap();
        set_property(&mut ctx, a, key_x, Value::from_small_int(1)).unwrap();
        set_property(&mut ctx, a, key_y, Value::from_small_int(2)).unwrap();
        set_property(&mut ctx, b, key_y, Value::from_small_int(20)).unwrap();

        // Deep sees the shadowed value from the nearest link.
        let got = get_property(&mut ctx, c, key_y).unwrap().unwrap();
        assert_eq!(got.as_small_int(), 20);
        let got = get_property(&mut ctx, c, key_x).unwrap().unwrap();
        assert_eq!(got.as_small_int(), 1);

        // Shallow sees nothing on c.
        assert!(get_property_shallow(&mut ctx, c, key_y).unwrap().is_none());

        // Writes stay on the receiver.
        set_property(&mut ctx, c, key_y, Value::from_small_int(200)).unwrap();
        let on_b = get_property(&mut ctx, b, key_y).unwrap().unwrap();
        assert_eq!(on_b.as_small_int(), 20);

        assert!(has_prototype(&mut ctx, c, b));
        assert!(has_prototype(&mut ctx, c, a));
        assert!(!has_prototype(&mut ctx, a, c));
    }

    #[test]
    fn test_private_data_tag_safety() {
        static CLASS_A: PrivateClass = PrivateClass::new();
        static CLASS_B: PrivateClass = PrivateClass::new();

        let mut ctx = Context::new().unwrap();
        let proto = ctx.prototypes.object;
        let obj = new_object_with_private(&mut ctx, proto, &CLASS_A, None).unwrap();

        let data = Box::into_raw(Box::new(123u32)) as *mut c_void;
        object_set_private(obj, &CLASS_A, data);

        assert_eq!(object_get_private(obj, &CLASS_A), Some(data));
        assert_eq!(object_get_private(obj, &CLASS_B), None);

        let prev = object_swap_private(obj, &CLASS_A, std::ptr::null_mut()).unwrap();
        assert_eq!(prev, data);
        assert_eq!(object_get_private(obj, &CLASS_A), Some(std::ptr::null_mut()));

        unsafe { drop(Box::from_raw(data as *mut u32)) };
    }

    #[test]
    fn test_tombstones_keep_probe_chains_valid() {
        let mut ctx = Context::new().unwrap();
        let obj = new_object(&mut ctx).unwrap();
        let obj_loc = ctx.push_local(obj);

        let mut keys = Vec::new();
        for i in 0..8 {
            let key = new_string(&mut ctx, &format!("p{}", i)).unwrap();
            keys.push(ctx.push_local(key));
        }
        for (i, &key_loc) in keys.iter().enumerate() {
            let obj = ctx.local(obj_loc);
            let key = ctx.local(key_loc);
            set_property(&mut ctx, obj, key, Value::from_small_int(i as i64)).unwrap();
        }

        // Delete every other key, then verify the rest still resolve.
        for &key_loc in keys.iter().step_by(2) {
            let obj = ctx.local(obj_loc);
            let key = ctx.local(key_loc);
            delete_property(&mut ctx, obj, key).unwrap();
        }
        for (i, &key_loc) in keys.iter().enumerate() {
            let obj = ctx.local(obj_loc);
            let key = ctx.local(key_loc);
            let got = get_property(&mut ctx, obj, key).unwrap();
            if i % 2 == 0 {
                assert!(got.is_none());
            } else {
                assert_eq!(got.unwrap().as_small_int(), i as i64);
            }
        }
    }
}
