//! Universal value operations
//!
//! Numeric coercion, recursion-safe structural comparison and
//! stringification, and the table-driven native-value marshalling layer.
//!
//! Both the comparator and the stringifier guard against cyclic aggregates
//! with a scan over rooted guard entries, so collections triggered while
//! descending (dynamic-property getters can allocate) cannot invalidate the
//! guard.

use std::sync::atomic::Ordering;

use super::array;
use super::buffer;
use super::context::{Context, Local};
use super::error::{ErrorKind, Result};
use super::function::{self, FunctionObj};
use super::object::{self, DynamicPropObj, PropDepth};
use super::string::{self, StringIter};
use super::value::{BoxedFloat, BoxedInt, IndexRole, TypeTag, Value, normalize_index};

// =========================================================================
// Numeric coercion
// =========================================================================

/// A numeric value in its natural representation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Numeric {
    Int(i64),
    Float(f64),
}

/// Extract a numeric value without loss.
pub fn get_numeric(ctx: &mut Context, v: Value) -> Result<Numeric> {
    if v.is_small_int() {
        return Ok(Numeric::Int(v.as_small_int()));
    }
    if v.is_heap_object() {
        match v.type_tag() {
            TypeTag::Integer => {
                return Ok(Numeric::Int(unsafe { &*v.as_obj::<BoxedInt>() }.value));
            }
            TypeTag::Float => {
                return Ok(Numeric::Float(unsafe { &*v.as_obj::<BoxedFloat>() }.value));
            }
            _ => {}
        }
    }
    Err(ctx.raise(ErrorKind::TypeMismatch, "object is not a number"))
}

/// Coerce to a 64-bit integer. Floats round toward negative infinity;
/// values outside the 64-bit range fail with `NumericOutOfRange`.
pub fn get_integer(ctx: &mut Context, v: Value) -> Result<i64> {
    match get_numeric(ctx, v)? {
        Numeric::Int(value) => Ok(value),
        Numeric::Float(value) => {
            const LIMIT: f64 = 9_223_372_036_854_775_808.0;
            if !(value >= -LIMIT && value < LIMIT) {
                return Err(ctx.raise(ErrorKind::NumericOutOfRange, "number out of range"));
            }
            Ok(value.floor() as i64)
        }
    }
}

/// Coerce to a 64-bit float; integers widen.
pub fn get_float(ctx: &mut Context, v: Value) -> Result<f64> {
    match get_numeric(ctx, v)? {
        Numeric::Int(value) => Ok(value as f64),
        Numeric::Float(value) => Ok(value),
    }
}

/// Normalize an index argument against `len`. `void` selects the begin or
/// the end depending on the caller's role for this argument.
pub fn get_index_arg(ctx: &mut Context, v: Value, len: u32, role: IndexRole) -> Result<u32> {
    if v.is_void() {
        return Ok(match role {
            IndexRole::Begin => 0,
            IndexRole::End => len,
        });
    }
    let idx = get_integer(ctx, v)?;
    Ok(normalize_index(idx, len))
}

// =========================================================================
// Structural comparison
// =========================================================================

/// Outcome of a structural comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareResult {
    Less,
    Equal,
    Greater,
    /// NaN took part in the comparison.
    Indeterminate,
}

fn compare_i64(a: i64, b: i64) -> CompareResult {
    match a.cmp(&b) {
        std::cmp::Ordering::Less => CompareResult::Less,
        std::cmp::Ordering::Equal => CompareResult::Equal,
        std::cmp::Ordering::Greater => CompareResult::Greater,
    }
}

fn as_float(v: Value) -> f64 {
    if v.is_small_int() {
        v.as_small_int() as f64
    } else if v.type_tag() == TypeTag::Integer {
        unsafe { &*v.as_obj::<BoxedInt>() }.value as f64
    } else {
        unsafe { &*v.as_obj::<BoxedFloat>() }.value
    }
}

fn as_int_exact(v: Value) -> i64 {
    if v.is_small_int() {
        v.as_small_int()
    } else {
        unsafe { &*v.as_obj::<BoxedInt>() }.value
    }
}

fn compare_float_values(a: Value, b: Value) -> CompareResult {
    let fa = as_float(a);
    let fb = as_float(b);
    if fa.is_nan() || fb.is_nan() {
        return CompareResult::Indeterminate;
    }
    if fa < fb {
        CompareResult::Less
    } else if fa > fb {
        CompareResult::Greater
    } else {
        CompareResult::Equal
    }
}

/// Pairs of arrays on the active comparison path.
struct CompareRef {
    a: Value,
    b: Value,
}

fn compare_array(a: Value, b: Value, refs: &mut Vec<CompareRef>) -> CompareResult {
    // A pair already on the path compares equal; one member re-appearing
    // with a different partner falls back to identity order.
    for r in refs.iter() {
        let aa = a == r.a;
        let bb = b == r.b;
        let ab = a == r.b;
        let ba = b == r.a;
        if aa && bb {
            return CompareResult::Equal;
        }
        if aa || bb || ab || ba {
            return compare_i64(a.to_bits() as i64, b.to_bits() as i64);
        }
    }

    let a_size = array::array_size(a);
    let b_size = array::array_size(b);
    let cmp_size = a_size.min(b_size);

    refs.push(CompareRef { a, b });
    let mut result = CompareResult::Equal;
    for i in 0..cmp_size {
        let ea = array_slot(a, i);
        let eb = array_slot(b, i);
        result = compare_inner(ea, eb, refs);
        if result != CompareResult::Equal {
            break;
        }
    }
    refs.pop();

    if result != CompareResult::Equal {
        result
    } else {
        compare_i64(i64::from(a_size), i64::from(b_size))
    }
}

fn array_slot(v: Value, i: u32) -> Value {
    let storage = array::current_storage(v);
    let st = unsafe { &*storage.as_obj::<array::ArrayStorageObj>() };
    Value::from_bits(unsafe { st.slot(i) }.load(Ordering::Acquire))
}

fn compare_buffers(a: Value, b: Value) -> CompareResult {
    let a_size = buffer::buffer_size(a);
    let b_size = buffer::buffer_size(b);
    let cmp_size = (a_size.min(b_size)) as usize;

    let cmp = unsafe {
        let pa = buffer::buffer_data_ptr(a);
        let pb = buffer::buffer_data_ptr(b);
        let sa = std::slice::from_raw_parts(pa, cmp_size);
        let sb = std::slice::from_raw_parts(pb, cmp_size);
        sa.cmp(sb)
    };
    match cmp {
        std::cmp::Ordering::Less => CompareResult::Less,
        std::cmp::Ordering::Greater => CompareResult::Greater,
        std::cmp::Ordering::Equal => compare_i64(i64::from(a_size), i64::from(b_size)),
    }
}

fn compare_inner(a: Value, b: Value, refs: &mut Vec<CompareRef>) -> CompareResult {
    let a_type = a.type_tag();
    let b_type = b.type_tag();

    if a == b {
        if a_type == TypeTag::Float {
            let value = unsafe { &*a.as_obj::<BoxedFloat>() }.value;
            return if value.is_nan() {
                CompareResult::Indeterminate
            } else {
                CompareResult::Equal
            };
        }
        return CompareResult::Equal;
    }

    if a_type == b_type || (a_type.is_numeric() && b_type.is_numeric()) {
        return match a_type {
            TypeTag::Integer | TypeTag::Float => {
                if a_type == TypeTag::Float || b_type == TypeTag::Float {
                    compare_float_values(a, b)
                } else {
                    compare_i64(as_int_exact(a), as_int_exact(b))
                }
            }
            TypeTag::Boolean => compare_i64(i64::from(a.as_bool()), i64::from(b.as_bool())),
            TypeTag::String => match string::string_compare(a, b) {
                std::cmp::Ordering::Less => CompareResult::Less,
                std::cmp::Ordering::Equal => CompareResult::Equal,
                std::cmp::Ordering::Greater => CompareResult::Greater,
            },
            TypeTag::Array => compare_array(a, b, refs),
            TypeTag::Buffer => compare_buffers(a, b),
            TypeTag::Void => CompareResult::Equal,
            // Objects, functions, classes, modules: pointer identity.
            _ => compare_i64(a.to_bits() as i64, b.to_bits() as i64),
        };
    }

    if u8::from(a_type) < u8::from(b_type) {
        CompareResult::Less
    } else {
        CompareResult::Greater
    }
}

/// Structural comparison of any two values.
pub fn compare(a: Value, b: Value) -> CompareResult {
    let mut refs = Vec::new();
    compare_inner(a, b, &mut refs)
}

// =========================================================================
// Stringification
// =========================================================================

/// Whether strings embedded in output are quoted and escaped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quote {
    None,
    Strings,
}

fn append_escaped_string(out: &mut Vec<u8>, v: Value) {
    out.push(b'"');
    for code in unsafe { StringIter::new(v) } {
        match code {
            0x22 => out.extend_from_slice(b"\\\""),
            0x5C => out.extend_from_slice(b"\\\\"),
            0x00..=0x1F | 0x7F => {
                out.extend_from_slice(format!("\\x{:02x}", code).as_bytes());
            }
            0x20..=0x7E => out.push(code as u8),
            _ => out.extend_from_slice(format!("\\x{{{:x}}}", code).as_bytes()),
        }
    }
    out.push(b'"');
}

fn append_plain_string(ctx: &mut Context, out: &mut Vec<u8>, v: Value) -> Result<()> {
    let bytes = string::string_to_utf8(ctx, v)?;
    out.extend_from_slice(&bytes);
    Ok(())
}

fn append_function(ctx: &mut Context, out: &mut Vec<u8>, v: Value) -> Result<()> {
    let open: &[u8] = if v.type_tag() == TypeTag::Class {
        b"<class "
    } else {
        b"<function "
    };
    out.extend_from_slice(open);
    let name = function::function_name(v);
    if !name.is_bad() {
        append_plain_string(ctx, out, name)?;
    }
    let fun = unsafe { &*v.as_obj::<FunctionObj>() };
    match fun.handler {
        Some(handler) => {
            out.extend_from_slice(format!(" @ 0x{:x}>", handler as usize).as_bytes());
        }
        None => {
            out.extend_from_slice(format!(" @ {}>", fun.def_line).as_bytes());
        }
    }
    Ok(())
}

fn append_buffer(out: &mut Vec<u8>, v: Value) {
    let size = buffer::buffer_size(v) as usize;
    if size == 0 {
        out.extend_from_slice(b"<>");
        return;
    }
    let bytes = unsafe { std::slice::from_raw_parts(buffer::buffer_data_ptr(v), size) };
    let encoded = hex::encode(bytes);
    out.push(b'<');
    for (i, pair) in encoded.as_bytes().chunks(2).enumerate() {
        if i > 0 {
            out.push(b' ');
        }
        out.extend_from_slice(pair);
    }
    out.push(b'>');
}

fn is_recursive(ctx: &Context, guard: &[Local], v: Value) -> bool {
    guard.iter().any(|l| ctx.local(*l) == v)
}

fn append_array(
    ctx: &mut Context,
    out: &mut Vec<u8>,
    v: Value,
    guard: &mut Vec<Local>,
) -> Result<()> {
    if is_recursive(ctx, guard, v) {
        out.extend_from_slice(b"[...]");
        return Ok(());
    }
    if array::array_size(v) == 0 {
        out.extend_from_slice(b"[]");
        return Ok(());
    }

    let result = ctx.with_scope(|ctx| {
        let loc = ctx.push_local(v);
        guard.push(loc);

        out.push(b'[');
        let size = array::array_size(ctx.local(loc));
        for i in 0..size {
            if i > 0 {
                out.extend_from_slice(b", ");
            }
            let arr = ctx.local(loc);
            let elem = array::array_read(ctx, arr, i64::from(i))?;
            append_value(ctx, out, elem, Quote::Strings, guard)?;
        }
        out.push(b']');
        Ok(())
    });
    guard.pop();
    result
}

fn append_object(
    ctx: &mut Context,
    out: &mut Vec<u8>,
    v: Value,
    guard: &mut Vec<Local>,
) -> Result<()> {
    if is_recursive(ctx, guard, v) {
        out.extend_from_slice(b"{...}");
        return Ok(());
    }

    let result = ctx.with_scope(|ctx| {
        let obj_loc = ctx.push_local(v);
        guard.push(obj_loc);

        out.push(b'{');
        let table = object::props_storage(ctx.local(obj_loc));
        if !table.is_bad() {
            let table_loc = ctx.push_local(table);
            let mut first = true;
            let capacity = object::table_capacity(ctx.local(table_loc));
            for i in 0..capacity {
                let (key, value) = object::table_item(ctx.local(table_loc), i);
                if key.is_bad() || value.is_bad() {
                    continue;
                }
                if !first {
                    out.extend_from_slice(b", ");
                }
                first = false;

                append_escaped_string(out, key);
                out.extend_from_slice(b": ");

                let this = ctx.local(obj_loc);
                let value = resolve_dynamic_value(ctx, this, value)?;
                append_value(ctx, out, value, Quote::Strings, guard)?;
            }
        }
        out.push(b'}');
        Ok(())
    });
    guard.pop();
    result
}

/// Dynamic-property contract for the stringifier: a raising getter is
/// cleared and the getter object stands in for the value.
fn resolve_dynamic_value(ctx: &mut Context, this: Value, value: Value) -> Result<Value> {
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
    ctx.with_scope(|ctx| {
        let getter_loc = ctx.push_local(getter);
        let args = ctx.empty_array;
        match function::call_function(ctx, getter, this, args) {
            Ok(resolved) => Ok(resolved),
            Err(_) => {
                ctx.clear_exception();
                Ok(ctx.local(getter_loc))
            }
        }
    })
}

fn append_value(
    ctx: &mut Context,
    out: &mut Vec<u8>,
    v: Value,
    quote: Quote,
    guard: &mut Vec<Local>,
) -> Result<()> {
    if v.is_bad() {
        out.extend_from_slice(b"void");
        return Ok(());
    }
    match v.type_tag() {
        TypeTag::Integer => {
            let value = as_int_exact(v);
            out.extend_from_slice(format!("{}", value).as_bytes());
        }
        TypeTag::Float => {
            let value = unsafe { &*v.as_obj::<BoxedFloat>() }.value;
            out.extend_from_slice(format!("{:?}", value).as_bytes());
        }
        TypeTag::Boolean => {
            let text: &[u8] = if v.as_bool() { b"true" } else { b"false" };
            out.extend_from_slice(text);
        }
        TypeTag::Void => out.extend_from_slice(b"void"),
        TypeTag::String => {
            if quote == Quote::Strings {
                append_escaped_string(out, v);
            } else {
                append_plain_string(ctx, out, v)?;
            }
        }
        TypeTag::Array => append_array(ctx, out, v, guard)?,
        TypeTag::Object => append_object(ctx, out, v, guard)?,
        TypeTag::Buffer => append_buffer(out, v),
        TypeTag::Function | TypeTag::Class => append_function(ctx, out, v)?,
        TypeTag::Module => {
            out.extend_from_slice(b"<module ");
            let m = unsafe { &*v.as_obj::<function::ModuleObj>() };
            let name = Value::from_bits(m.name.load(Ordering::Acquire));
            if !name.is_bad() {
                append_plain_string(ctx, out, name)?;
            }
            out.push(b'>');
        }
        tag => {
            out.push(b'<');
            out.extend_from_slice(tag.name().as_bytes());
            out.push(b'>');
        }
    }
    Ok(())
}

/// Append the printable form of `v` to a byte vector.
pub fn value_to_vec(ctx: &mut Context, out: &mut Vec<u8>, v: Value, quote: Quote) -> Result<()> {
    let mut guard = Vec::new();
    append_value(ctx, out, v, quote, &mut guard)
}

/// Human-readable form of any value as a new string.
pub fn object_to_string(ctx: &mut Context, v: Value) -> Result<Value> {
    let mut out = Vec::new();
    value_to_vec(ctx, &mut out, v, Quote::None)?;
    string::new_string_utf8(ctx, &out)
}

/// Append the stringified elements of an argument array, separated by
/// single spaces. The core of the language-level `print`.
pub fn print_to_vec(ctx: &mut Context, out: &mut Vec<u8>, args: Value) -> Result<()> {
    let size = array::array_size(args);
    ctx.with_scope(|ctx| {
        let args_loc = ctx.push_local(args);
        for i in 0..size {
            if i > 0 {
                out.push(b' ');
            }
            let args = ctx.local(args_loc);
            let v = array::array_read(ctx, args, i64::from(i))?;
            value_to_vec(ctx, out, v, Quote::None)?;
        }
        Ok(())
    })
}

/// Printable form of the pending exception, which stays pending.
pub fn exception_to_string(ctx: &mut Context) -> Result<Value> {
    let exc = ctx.get_exception();
    if exc.is_heap_object() && exc.type_tag() == TypeTag::String {
        return Ok(exc);
    }
    object_to_string(ctx, exc)
}

/// Make a value read-only where the type supports it.
///
/// Buffers become locked for good. Already-immutable values (numbers,
/// strings, booleans, void, functions) accept the request as a no-op.
/// Objects and classes refuse: their prototype and property table must stay
/// writable.
pub fn lock_value(ctx: &mut Context, v: Value) -> Result<()> {
    if v.is_bad() {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "value cannot be locked"));
    }
    match v.type_tag() {
        TypeTag::Object | TypeTag::Class => {
            Err(ctx.raise(ErrorKind::TypeMismatch, "object cannot be locked"))
        }
        TypeTag::Buffer => {
            buffer::buffer_lock(v);
            Ok(())
        }
        _ => Ok(()),
    }
}

// =========================================================================
// Native marshalling
// =========================================================================

/// Native field representation accepted by the marshalling codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NativeType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    USize,
    /// C enum: non-negative 32-bit range.
    Enum,
    Bool8,
    Bool32,
    F32,
    F64,
    /// Fixed-size NUL-terminated string buffer of `size` bytes.
    StrBuf,
    /// Allocated C string written as `*mut c_char`; the consumer frees it.
    StrPtr,
    /// Fixed byte blob of `size` bytes.
    Blob,
}

/// Descriptor of one field inside a native struct.
#[derive(Clone, Copy, Debug)]
pub struct NativeField {
    pub name: &'static str,
    pub type_: NativeType,
    pub offset: usize,
    /// Byte length for `StrBuf` / `Blob`; ignored otherwise.
    pub size: usize,
    /// Used when the source has no value for this field; the bad sentinel
    /// marks the field required.
    pub default: Value,
}

fn int_limits(type_: NativeType) -> (i64, i64) {
    match type_ {
        NativeType::U8 => (0, 0xFF),
        NativeType::U16 => (0, 0xFFFF),
        NativeType::U32 => (0, 0xFFFF_FFFF),
        NativeType::U64 => (i64::MIN, i64::MAX),
        NativeType::I8 => (-0x80, 0x7F),
        NativeType::I16 => (-0x8000, 0x7FFF),
        NativeType::I32 => (i64::from(i32::MIN), i64::from(i32::MAX)),
        NativeType::I64 => (i64::MIN, i64::MAX),
        NativeType::USize => (0, i64::MAX),
        NativeType::Enum => (0, i64::from(i32::MAX)),
        _ => (0, 0),
    }
}

unsafe fn write_at<T>(base: *mut u8, offset: usize, value: T) {
    unsafe { std::ptr::write_unaligned(base.add(offset) as *mut T, value) }
}

unsafe fn read_at<T>(base: *const u8, offset: usize) -> T {
    unsafe { std::ptr::read_unaligned(base.add(offset) as *const T) }
}

/// Convert one value into its native form at `base + field.offset`.
///
/// # Safety
/// `base` must point at writable memory laid out per the field table.
pub unsafe fn extract_native_value(
    ctx: &mut Context,
    v: Value,
    field: &NativeField,
    base: *mut u8,
) -> Result<()> {
    match field.type_ {
        NativeType::U8
        | NativeType::U16
        | NativeType::U32
        | NativeType::U64
        | NativeType::I8
        | NativeType::I16
        | NativeType::I32
        | NativeType::I64
        | NativeType::USize
        | NativeType::Enum => {
            let value = get_integer(ctx, v)?;
            let (min, max) = int_limits(field.type_);
            let unsigned64 = field.type_ == NativeType::U64;
            if !unsigned64 && (value < min || value > max) {
                return Err(ctx.raise_format(
                    ErrorKind::NumericOutOfRange,
                    format_args!("value for field '{}' is out of range", field.name),
                ));
            }
            unsafe {
                match field.type_ {
                    NativeType::U8 => write_at(base, field.offset, value as u8),
                    NativeType::U16 => write_at(base, field.offset, value as u16),
                    NativeType::U32 => write_at(base, field.offset, value as u32),
                    NativeType::U64 => write_at(base, field.offset, value as u64),
                    NativeType::I8 => write_at(base, field.offset, value as i8),
                    NativeType::I16 => write_at(base, field.offset, value as i16),
                    NativeType::I32 => write_at(base, field.offset, value as i32),
                    NativeType::I64 => write_at(base, field.offset, value),
                    NativeType::USize => write_at(base, field.offset, value as usize),
                    NativeType::Enum => write_at(base, field.offset, value as i32),
                    _ => unreachable!(),
                }
            }
            Ok(())
        }
        NativeType::Bool8 | NativeType::Bool32 => {
            if !v.is_boolean() {
                return Err(ctx.raise_format(
                    ErrorKind::TypeMismatch,
                    format_args!("value for field '{}' is not a boolean", field.name),
                ));
            }
            unsafe {
                if field.type_ == NativeType::Bool8 {
                    write_at(base, field.offset, u8::from(v.as_bool()));
                } else {
                    write_at(base, field.offset, u32::from(v.as_bool()));
                }
            }
            Ok(())
        }
        NativeType::F32 => {
            let value = get_float(ctx, v)?;
            unsafe { write_at(base, field.offset, value as f32) };
            Ok(())
        }
        NativeType::F64 => {
            let value = get_float(ctx, v)?;
            unsafe { write_at(base, field.offset, value) };
            Ok(())
        }
        NativeType::StrBuf => {
            if !v.is_heap_object() || v.type_tag() != TypeTag::String {
                return Err(ctx.raise_format(
                    ErrorKind::TypeMismatch,
                    format_args!("value for field '{}' is not a string", field.name),
                ));
            }
            let bytes = string::string_to_utf8(ctx, v)?;
            if bytes.len() + 1 > field.size {
                return Err(ctx.raise_format(
                    ErrorKind::NumericOutOfRange,
                    format_args!("string for field '{}' does not fit", field.name),
                ));
            }
            unsafe {
                let dst = base.add(field.offset);
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
                std::ptr::write_bytes(dst.add(bytes.len()), 0, field.size - bytes.len());
            }
            Ok(())
        }
        NativeType::StrPtr => {
            if !v.is_heap_object() || v.type_tag() != TypeTag::String {
                return Err(ctx.raise_format(
                    ErrorKind::TypeMismatch,
                    format_args!("value for field '{}' is not a string", field.name),
                ));
            }
            let bytes = string::string_to_utf8(ctx, v)?;
            let cstring = match std::ffi::CString::new(bytes) {
                Ok(s) => s,
                Err(_) => {
                    return Err(ctx.raise(ErrorKind::InvalidString, "string contains NUL"));
                }
            };
            unsafe { write_at(base, field.offset, cstring.into_raw()) };
            Ok(())
        }
        NativeType::Blob => {
            if !v.is_heap_object() || v.type_tag() != TypeTag::Buffer {
                return Err(ctx.raise_format(
                    ErrorKind::TypeMismatch,
                    format_args!("value for field '{}' is not a buffer", field.name),
                ));
            }
            if (buffer::buffer_size(v) as usize) < field.size {
                return Err(ctx.raise_format(
                    ErrorKind::NumericOutOfRange,
                    format_args!("buffer for field '{}' is too short", field.name),
                ));
            }
            unsafe {
                std::ptr::copy_nonoverlapping(
                    buffer::buffer_data_ptr(v),
                    base.add(field.offset),
                    field.size,
                );
            }
            Ok(())
        }
    }
}

fn missing_field(ctx: &mut Context, field: &NativeField) -> super::error::Error {
    ctx.raise_format(
        ErrorKind::MissingArgument,
        format_args!("missing value for field '{}'", field.name),
    )
}

/// Fill a native struct from positional array elements.
///
/// # Safety
/// `base` must point at writable memory laid out per the field table.
pub unsafe fn extract_native_from_array(
    ctx: &mut Context,
    args: Value,
    fields: &[NativeField],
    base: *mut u8,
) -> Result<()> {
    let size = array::array_size(args);
    ctx.with_scope(|ctx| {
        let args_loc = ctx.push_local(args);
        for (i, field) in fields.iter().enumerate() {
            let v = if (i as u32) < size {
                let args = ctx.local(args_loc);
                array::array_read(ctx, args, i as i64)?
            } else if !field.default.is_bad() {
                field.default
            } else {
                return Err(missing_field(ctx, field));
            };
            unsafe { extract_native_value(ctx, v, field, base)? };
        }
        Ok(())
    })
}

/// Fill a native struct from named object properties.
///
/// # Safety
/// `base` must point at writable memory laid out per the field table.
pub unsafe fn extract_native_from_object(
    ctx: &mut Context,
    obj: Value,
    fields: &[NativeField],
    base: *mut u8,
) -> Result<()> {
    ctx.with_scope(|ctx| {
        let obj_loc = ctx.push_local(obj);
        for field in fields {
            let key = string::new_string(ctx, field.name)?;
            let obj = ctx.local(obj_loc);
            let found = object::get_property_with_depth(ctx, obj, key, PropDepth::Deep)?;
            let v = match found {
                Some(v) => v,
                None if !field.default.is_bad() => field.default,
                None => return Err(missing_field(ctx, field)),
            };
            unsafe { extract_native_value(ctx, v, field, base)? };
        }
        Ok(())
    })
}

/// Fill a native struct from the elements of any iterable, in field order.
///
/// # Safety
/// `base` must point at writable memory laid out per the field table.
pub unsafe fn extract_native_from_iterable(
    ctx: &mut Context,
    iterable: Value,
    fields: &[NativeField],
    base: *mut u8,
) -> Result<()> {
    use super::iterator::{self, IterDepth};

    ctx.with_scope(|ctx| {
        let iter = iterator::new_iterator(ctx, iterable, IterDepth::Contents)?;
        let iter_loc = ctx.push_local(iter);
        for field in fields {
            let it = ctx.local(iter_loc);
            let v = if iterator::iterator_next(ctx, it)? {
                iterator::get_walk_value(ctx.local(iter_loc))
            } else if !field.default.is_bad() {
                field.default
            } else {
                return Err(missing_field(ctx, field));
            };
            unsafe { extract_native_value(ctx, v, field, base)? };
        }
        Ok(())
    })
}

/// Read one native field back into a value.
///
/// # Safety
/// `base` must point at readable memory laid out per the field table.
unsafe fn native_to_value(ctx: &mut Context, field: &NativeField, base: *const u8) -> Result<Value> {
    unsafe {
        match field.type_ {
            NativeType::U8 => ctx.new_int(i64::from(read_at::<u8>(base, field.offset))),
            NativeType::U16 => ctx.new_int(i64::from(read_at::<u16>(base, field.offset))),
            NativeType::U32 => ctx.new_int(i64::from(read_at::<u32>(base, field.offset))),
            NativeType::U64 => ctx.new_int(read_at::<u64>(base, field.offset) as i64),
            NativeType::I8 => ctx.new_int(i64::from(read_at::<i8>(base, field.offset))),
            NativeType::I16 => ctx.new_int(i64::from(read_at::<i16>(base, field.offset))),
            NativeType::I32 => ctx.new_int(i64::from(read_at::<i32>(base, field.offset))),
            NativeType::I64 => ctx.new_int(read_at::<i64>(base, field.offset)),
            NativeType::USize => ctx.new_int(read_at::<usize>(base, field.offset) as i64),
            NativeType::Enum => ctx.new_int(i64::from(read_at::<i32>(base, field.offset))),
            NativeType::Bool8 => Ok(Value::from_bool(read_at::<u8>(base, field.offset) != 0)),
            NativeType::Bool32 => Ok(Value::from_bool(read_at::<u32>(base, field.offset) != 0)),
            NativeType::F32 => ctx.new_float(f64::from(read_at::<f32>(base, field.offset))),
            NativeType::F64 => ctx.new_float(read_at::<f64>(base, field.offset)),
            NativeType::StrBuf => {
                let ptr = base.add(field.offset);
                let slice = std::slice::from_raw_parts(ptr, field.size);
                let len = slice.iter().position(|&b| b == 0).unwrap_or(field.size);
                string::new_string_utf8(ctx, &slice[..len])
            }
            NativeType::StrPtr => {
                let ptr = read_at::<*const std::ffi::c_char>(base, field.offset);
                if ptr.is_null() {
                    return Ok(Value::VOID);
                }
                let cstr = std::ffi::CStr::from_ptr(ptr);
                string::new_string_utf8(ctx, cstr.to_bytes())
            }
            NativeType::Blob => {
                let out = buffer::new_buffer(ctx, field.size as u32)?;
                std::ptr::copy_nonoverlapping(
                    base.add(field.offset),
                    buffer::buffer_data_ptr(out),
                    field.size,
                );
                Ok(out)
            }
        }
    }
}

/// Build a fresh object whose properties mirror a native struct.
///
/// # Safety
/// `base` must point at readable memory laid out per the field table.
pub unsafe fn new_from_native(
    ctx: &mut Context,
    fields: &[NativeField],
    base: *const u8,
) -> Result<Value> {
    ctx.with_scope(|ctx| {
        let obj = object::new_object(ctx)?;
        let obj_loc = ctx.push_local(obj);
        unsafe { set_properties_from_native_rooted(ctx, obj_loc, fields, base)? };
        Ok(ctx.local(obj_loc))
    })
}

/// Set properties on an existing object from a native struct.
///
/// # Safety
/// `base` must point at readable memory laid out per the field table.
pub unsafe fn set_properties_from_native(
    ctx: &mut Context,
    obj: Value,
    fields: &[NativeField],
    base: *const u8,
) -> Result<()> {
    ctx.with_scope(|ctx| {
        let obj_loc = ctx.push_local(obj);
        unsafe { set_properties_from_native_rooted(ctx, obj_loc, fields, base) }
    })
}

unsafe fn set_properties_from_native_rooted(
    ctx: &mut Context,
    obj_loc: Local,
    fields: &[NativeField],
    base: *const u8,
) -> Result<()> {
    for field in fields {
        ctx.with_scope(|ctx| {
            let v = unsafe { native_to_value(ctx, field, base)? };
            let val_loc = ctx.push_local(v);
            let key = string::new_string(ctx, field.name)?;
            let obj = ctx.local(obj_loc);
            let v = ctx.local(val_loc);
            object::set_property(ctx, obj, key, v)
        })?;
    }
    Ok(())
}
