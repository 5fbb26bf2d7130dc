//! Strings
//!
//! A string stores code points at one of three element widths (1, 2 or 4
//! bytes) in one of three storage forms:
//!
//! - `Inline`: payload immediately follows the header
//! - `Constant`: payload is a pointer to static data that never moves
//! - `Reference`: payload lives inside another (inline) string; used for
//!   slices, keeping the backing string alive
//!
//! Strings are immutable after creation. The hash is computed lazily over
//! the code-point sequence, so identical content hashes identically
//! regardless of stored width. The UTF-8 codec is lenient about overlong
//! forms but rejects code points above [`MAX_CODE_POINT`].

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::context::{Context, Local};
use super::error::{ErrorKind, Result};
use super::heap::ObjectHeader;
use super::value::{TypeTag, Value, normalize_index};

/// Highest code point this runtime accepts.
pub const MAX_CODE_POINT: u32 = 0x1F_FFFF;

/// Longest representable string, in code points.
pub const MAX_STRING_LENGTH: u32 = 0x0FFF_FFFF;

/// Slices shorter than this are copied instead of sharing storage.
const MIN_REF_BYTES: usize = 16;

/// Element width, stored as log2 of bytes per code point.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
pub enum ElemSize {
    U8 = 0,
    U16 = 1,
    U32 = 2,
}

impl ElemSize {
    /// Smallest width that can hold `code`.
    pub fn for_code(code: u32) -> ElemSize {
        if code < 0x100 {
            ElemSize::U8
        } else if code < 0x1_0000 {
            ElemSize::U16
        } else {
            ElemSize::U32
        }
    }

    #[inline]
    pub fn log2(self) -> u32 {
        u8::from(self) as u32
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum StringStorage {
    Inline = 0,
    Constant = 1,
    Reference = 2,
}

/// Heap layout of a string. Payload follows at [`StringObj::PAYLOAD_OFFSET`].
#[repr(C)]
pub struct StringObj {
    pub header: ObjectHeader,
    /// Number of code points, not bytes.
    pub length: u32,
    /// 0 means not yet computed.
    pub hash: AtomicU32,
    /// log2 of bytes per element.
    pub elem_size: u8,
    /// One of [`StringStorage`].
    pub storage: u8,
    pub _pad: [u8; 6],
}

impl StringObj {
    pub const PAYLOAD_OFFSET: usize = std::mem::size_of::<StringObj>();

    #[inline]
    pub fn elem(&self) -> ElemSize {
        ElemSize::try_from(self.elem_size).expect("corrupt string header")
    }

    #[inline]
    pub fn storage_kind(&self) -> StringStorage {
        StringStorage::try_from(self.storage).expect("corrupt string header")
    }

    #[inline]
    fn payload(&self) -> *mut u8 {
        unsafe { (self as *const Self as *mut u8).add(Self::PAYLOAD_OFFSET) }
    }

    /// The backing string of a `Reference` string.
    ///
    /// # Safety
    /// Storage kind must be `Reference`.
    pub unsafe fn ref_backer(&self) -> &AtomicUsize {
        debug_assert_eq!(self.storage_kind(), StringStorage::Reference);
        unsafe { &*(self.payload() as *const AtomicUsize) }
    }

    /// Byte offset into the backing string's payload.
    ///
    /// # Safety
    /// Storage kind must be `Reference`.
    pub unsafe fn ref_offset(&self) -> usize {
        unsafe { *(self.payload().add(std::mem::size_of::<usize>()) as *const usize) }
    }

    /// Pointer to the first element of this string's data.
    ///
    /// # Safety
    /// The string and (for references) its backer must be live; the pointer
    /// is invalidated by any allocation.
    pub unsafe fn data_ptr(&self) -> *const u8 {
        unsafe {
            match self.storage_kind() {
                StringStorage::Inline => self.payload() as *const u8,
                StringStorage::Constant => *(self.payload() as *const *const u8),
                StringStorage::Reference => {
                    let backer = Value::from_bits(self.ref_backer().load(Ordering::Acquire));
                    let backer = &*backer.as_obj::<StringObj>();
                    debug_assert_eq!(backer.storage_kind(), StringStorage::Inline);
                    backer.data_ptr().add(self.ref_offset())
                }
            }
        }
    }

    /// Code point at element index `idx`.
    ///
    /// # Safety
    /// `idx` must be below `self.length` and the string must be live.
    pub unsafe fn code_at(&self, idx: u32) -> u32 {
        unsafe {
            let data = self.data_ptr();
            match self.elem() {
                ElemSize::U8 => u32::from(*data.add(idx as usize)),
                ElemSize::U16 => u32::from(*(data as *const u16).add(idx as usize)),
                ElemSize::U32 => *(data as *const u32).add(idx as usize),
            }
        }
    }
}

/// Iterator over a string's code points.
///
/// Holds a raw data pointer: must not be kept across allocations.
pub struct StringIter {
    ptr: *const u8,
    end: *const u8,
    elem: ElemSize,
}

impl StringIter {
    /// # Safety
    /// `v` must be a live string value.
    pub unsafe fn new(v: Value) -> StringIter {
        unsafe {
            let s = &*v.as_obj::<StringObj>();
            let ptr = s.data_ptr();
            let bytes = (s.length as usize) << s.elem().log2();
            StringIter {
                ptr,
                end: ptr.add(bytes),
                elem: s.elem(),
            }
        }
    }

    #[inline]
    pub fn is_end(&self) -> bool {
        self.ptr >= self.end
    }

    /// Code point under the cursor without advancing.
    pub fn peek_code(&self) -> u32 {
        debug_assert!(!self.is_end());
        unsafe {
            match self.elem {
                ElemSize::U8 => u32::from(*self.ptr),
                ElemSize::U16 => u32::from(*(self.ptr as *const u16)),
                ElemSize::U32 => *(self.ptr as *const u32),
            }
        }
    }

    #[inline]
    pub fn advance(&mut self) {
        self.ptr = unsafe { self.ptr.add(1 << self.elem.log2()) };
    }
}

impl Iterator for StringIter {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.is_end() {
            return None;
        }
        let code = self.peek_code();
        self.advance();
        Some(code)
    }
}

// =========================================================================
// UTF-8 codec
// =========================================================================

/// Number of continuation bytes for each leading byte, or -1 for a stray
/// continuation / invalid leader.
fn utf8_extra_bytes(lead: u8) -> i32 {
    match lead {
        0x00..=0x7F => 0,
        0x80..=0xBF => -1,
        0xC0..=0xDF => 1,
        0xE0..=0xEF => 2,
        0xF0..=0xF7 => 3,
        _ => -1,
    }
}

/// Decode UTF-8 bytes into code points. Overlong forms are permitted; stray
/// continuation bytes, truncated sequences and out-of-range code points are
/// not. With `escapes`, `\x##` and `\x{...}` sequences are recognized and a
/// malformed escape is an error.
pub fn decode_utf8(bytes: &[u8], escapes: bool) -> Option<Vec<u32>> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0usize;

    while i < bytes.len() {
        let b = bytes[i];

        if escapes && b == b'\\' {
            i += 1;
            if i >= bytes.len() || bytes[i] != b'x' {
                return None;
            }
            i += 1;
            let code = if bytes.get(i) == Some(&b'{') {
                i += 1;
                let start = i;
                while i < bytes.len() && bytes[i] != b'}' {
                    i += 1;
                }
                if i >= bytes.len() || i == start {
                    return None;
                }
                let code = parse_hex(&bytes[start..i])?;
                i += 1;
                code
            } else {
                if i + 2 > bytes.len() {
                    return None;
                }
                let code = parse_hex(&bytes[i..i + 2])?;
                i += 2;
                code
            };
            if code > MAX_CODE_POINT {
                return None;
            }
            out.push(code);
            continue;
        }

        let extra = utf8_extra_bytes(b);
        if extra < 0 {
            return None;
        }
        let extra = extra as usize;
        if i + extra >= bytes.len() {
            return None;
        }

        let mut code = if extra == 0 {
            u32::from(b)
        } else {
            u32::from(b) & (0x7F >> (extra + 1))
        };
        for k in 1..=extra {
            let cont = bytes[i + k];
            if (cont & 0xC0) != 0x80 {
                return None;
            }
            code = (code << 6) | u32::from(cont & 0x3F);
        }
        if code > MAX_CODE_POINT {
            return None;
        }
        out.push(code);
        i += extra + 1;
    }

    Some(out)
}

fn parse_hex(digits: &[u8]) -> Option<u32> {
    if digits.len() > 8 {
        return None;
    }
    let mut v = 0u32;
    for &d in digits {
        let nibble = match d {
            b'0'..=b'9' => u32::from(d - b'0'),
            b'a'..=b'f' => u32::from(d - b'a') + 10,
            b'A'..=b'F' => u32::from(d - b'A') + 10,
            _ => return None,
        };
        v = (v << 4) | nibble;
    }
    Some(v)
}

/// Bytes needed to encode `code` in UTF-8.
pub fn utf8_code_len(code: u32) -> usize {
    if code < 0x80 {
        1
    } else if code < 0x800 {
        2
    } else if code < 0x1_0000 {
        3
    } else {
        4
    }
}

/// Append one code point to a UTF-8 byte vector. Fails above
/// [`MAX_CODE_POINT`].
pub fn encode_utf8_code(code: u32, out: &mut Vec<u8>) -> std::result::Result<(), ()> {
    if code > MAX_CODE_POINT {
        return Err(());
    }
    if code < 0x80 {
        out.push(code as u8);
    } else if code < 0x800 {
        out.push(0xC0 | (code >> 6) as u8);
        out.push(0x80 | (code & 0x3F) as u8);
    } else if code < 0x1_0000 {
        out.push(0xE0 | (code >> 12) as u8);
        out.push(0x80 | ((code >> 6) & 0x3F) as u8);
        out.push(0x80 | (code & 0x3F) as u8);
    } else {
        out.push(0xF0 | (code >> 18) as u8);
        out.push(0x80 | ((code >> 12) & 0x3F) as u8);
        out.push(0x80 | ((code >> 6) & 0x3F) as u8);
        out.push(0x80 | (code & 0x3F) as u8);
    }
    Ok(())
}

// =========================================================================
// Construction
// =========================================================================

fn alloc_inline(ctx: &mut Context, length: u32, elem: ElemSize) -> Result<HeapStr> {
    let bytes = (length as usize) << elem.log2();
    let ptr = ctx.alloc(TypeTag::String, StringObj::PAYLOAD_OFFSET + bytes)?;
    let s = unsafe { ptr.as_mut::<StringObj>() };
    s.length = length;
    s.hash = AtomicU32::new(0);
    s.elem_size = u8::from(elem);
    s.storage = u8::from(StringStorage::Inline);
    s._pad = [0; 6];
    Ok(HeapStr {
        value: Value::from_heap_ptr(ptr),
    })
}

/// A freshly allocated string plus typed access; only valid until the next
/// allocation.
struct HeapStr {
    value: Value,
}

impl HeapStr {
    unsafe fn write_code(&self, idx: u32, code: u32) {
        unsafe {
            let s = &*self.value.as_obj::<StringObj>();
            debug_assert_eq!(s.storage_kind(), StringStorage::Inline);
            let data = s.payload();
            match s.elem() {
                ElemSize::U8 => *data.add(idx as usize) = code as u8,
                ElemSize::U16 => *(data as *mut u16).add(idx as usize) = code as u16,
                ElemSize::U32 => *(data as *mut u32).add(idx as usize) = code,
            }
        }
    }
}

/// Build an inline string from a slice of code points, choosing the
/// smallest element width that fits.
pub fn new_string_from_code_slice(ctx: &mut Context, codes: &[u32]) -> Result<Value> {
    if codes.len() > MAX_STRING_LENGTH as usize {
        return Err(ctx.raise_kind(ErrorKind::NumericOutOfRange));
    }
    let max = codes.iter().copied().max().unwrap_or(0);
    if max > MAX_CODE_POINT {
        return Err(ctx.raise_kind(ErrorKind::InvalidString));
    }
    let elem = ElemSize::for_code(max);
    let s = alloc_inline(ctx, codes.len() as u32, elem)?;
    for (i, &code) in codes.iter().enumerate() {
        unsafe { s.write_code(i as u32, code) };
    }
    Ok(s.value)
}

/// Build an inline string with an explicit element width. The width must be
/// able to hold every code point.
pub fn new_string_with_elem(ctx: &mut Context, codes: &[u32], elem: ElemSize) -> Result<Value> {
    if codes.len() > MAX_STRING_LENGTH as usize {
        return Err(ctx.raise_kind(ErrorKind::NumericOutOfRange));
    }
    let max = codes.iter().copied().max().unwrap_or(0);
    if max > MAX_CODE_POINT || ElemSize::for_code(max) > elem {
        return Err(ctx.raise_kind(ErrorKind::InvalidString));
    }
    let s = alloc_inline(ctx, codes.len() as u32, elem)?;
    for (i, &code) in codes.iter().enumerate() {
        unsafe { s.write_code(i as u32, code) };
    }
    Ok(s.value)
}

/// Create a string from a Rust string slice.
pub fn new_string(ctx: &mut Context, text: &str) -> Result<Value> {
    let codes: Vec<u32> = text.chars().map(u32::from).collect();
    new_string_from_code_slice(ctx, &codes)
}

/// Create a string from UTF-8 bytes with the lenient codec.
pub fn new_string_utf8(ctx: &mut Context, bytes: &[u8]) -> Result<Value> {
    match decode_utf8(bytes, false) {
        Some(codes) => new_string_from_code_slice(ctx, &codes),
        None => Err(ctx.raise_kind(ErrorKind::InvalidString)),
    }
}

/// Create a string from UTF-8 bytes, recognizing `\x##` and `\x{...}`
/// escapes.
pub fn new_string_esc(ctx: &mut Context, bytes: &[u8]) -> Result<Value> {
    match decode_utf8(bytes, true) {
        Some(codes) => new_string_from_code_slice(ctx, &codes),
        None => Err(ctx.raise_kind(ErrorKind::InvalidString)),
    }
}

/// Create a string whose payload points at static ASCII data. The payload is
/// never copied and never freed.
pub fn new_const_string(ctx: &mut Context, text: &'static str) -> Result<Value> {
    debug_assert!(text.is_ascii());
    let ptr = ctx.alloc(
        TypeTag::String,
        StringObj::PAYLOAD_OFFSET + std::mem::size_of::<usize>(),
    )?;
    let s = unsafe { ptr.as_mut::<StringObj>() };
    s.length = text.len() as u32;
    s.hash = AtomicU32::new(0);
    s.elem_size = u8::from(ElemSize::U8);
    s.storage = u8::from(StringStorage::Constant);
    s._pad = [0; 6];
    unsafe {
        *(s.payload() as *mut *const u8) = text.as_ptr();
    }
    Ok(Value::from_heap_ptr(ptr))
}

/// Create a string from an array of code-point numbers.
pub fn new_string_from_codes(ctx: &mut Context, codes_array: Value) -> Result<Value> {
    use super::array;

    if !codes_array.is_heap_object() || codes_array.type_tag() != TypeTag::Array {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not an array"));
    }
    let size = array::array_size(codes_array);
    let mut codes = Vec::with_capacity(size as usize);
    for i in 0..size {
        let v = array::array_read(ctx, codes_array, i as i64)?;
        let code = super::utils::get_integer(ctx, v)?;
        if code < 0 || code > i64::from(MAX_CODE_POINT) {
            return Err(ctx.raise(ErrorKind::NumericOutOfRange, "invalid code point"));
        }
        codes.push(code as u32);
    }
    new_string_from_code_slice(ctx, &codes)
}

/// Decode the `[begin, end)` byte region of a buffer as UTF-8.
pub fn new_string_from_buffer(
    ctx: &mut Context,
    buf: Value,
    begin: u32,
    end: u32,
) -> Result<Value> {
    use super::buffer;

    if !buf.is_heap_object() || buf.type_tag() != TypeTag::Buffer {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not a buffer"));
    }
    let size = buffer::buffer_size(buf);
    if begin > end || end > size {
        return Err(ctx.raise_kind(ErrorKind::InvalidIndex));
    }
    let bytes = unsafe {
        std::slice::from_raw_parts(
            buffer::buffer_data_ptr(buf).add(begin as usize),
            (end - begin) as usize,
        )
        .to_vec()
    };
    new_string_utf8(ctx, &bytes)
}

// =========================================================================
// Inspection
// =========================================================================

/// Length in code points. The value must be a string.
pub fn string_length(v: Value) -> u32 {
    debug_assert_eq!(v.type_tag(), TypeTag::String);
    unsafe { &*v.as_obj::<StringObj>() }.length
}

/// Encode the whole string back to UTF-8.
pub fn string_to_utf8(ctx: &mut Context, v: Value) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let iter = unsafe { StringIter::new(v) };
    for code in iter {
        if encode_utf8_code(code, &mut out).is_err() {
            return Err(ctx.raise_kind(ErrorKind::InvalidString));
        }
    }
    Ok(out)
}

/// Lazily computed FNV-style hash folded over the code-point sequence.
/// Never zero.
pub fn string_hash(v: Value) -> u32 {
    let s = unsafe { &*v.as_obj::<StringObj>() };
    let cached = s.hash.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }

    const FNV_OFFSET: u32 = 0x811C_9DC5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV_OFFSET;
    for code in unsafe { StringIter::new(v) } {
        hash = (hash ^ code).wrapping_mul(FNV_PRIME);
    }
    if hash == 0 {
        hash = 1;
    }
    s.hash.store(hash, Ordering::Relaxed);
    hash
}

/// Lexicographic comparison by code point, across element widths.
pub fn string_compare(a: Value, b: Value) -> CmpOrdering {
    if a == b {
        return CmpOrdering::Equal;
    }
    let mut ia = unsafe { StringIter::new(a) };
    let mut ib = unsafe { StringIter::new(b) };
    loop {
        match (ia.next(), ib.next()) {
            (Some(ca), Some(cb)) => match ca.cmp(&cb) {
                CmpOrdering::Equal => continue,
                other => return other,
            },
            (None, Some(_)) => return CmpOrdering::Less,
            (Some(_), None) => return CmpOrdering::Greater,
            (None, None) => return CmpOrdering::Equal,
        }
    }
}

/// Compare `[a_begin, a_end)` of `a` against `[b_begin, b_end)` of `b`.
pub fn string_compare_slice(
    a: Value,
    a_begin: i64,
    a_end: i64,
    b: Value,
    b_begin: i64,
    b_end: i64,
) -> CmpOrdering {
    let a_len = string_length(a);
    let b_len = string_length(b);
    let ab = normalize_index(a_begin, a_len);
    let ae = normalize_index(a_end, a_len).max(ab);
    let bb = normalize_index(b_begin, b_len);
    let be = normalize_index(b_end, b_len).max(bb);

    let sa = unsafe { &*a.as_obj::<StringObj>() };
    let sb = unsafe { &*b.as_obj::<StringObj>() };
    let mut i = ab;
    let mut j = bb;
    while i < ae && j < be {
        let ca = unsafe { sa.code_at(i) };
        let cb = unsafe { sb.code_at(j) };
        match ca.cmp(&cb) {
            CmpOrdering::Equal => {}
            other => return other,
        }
        i += 1;
        j += 1;
    }
    (ae - ab).cmp(&(be - bb))
}

/// Content equality; hashes are used as a fast reject when both are cached.
pub fn string_equal(a: Value, b: Value) -> bool {
    if a == b {
        return true;
    }
    let sa = unsafe { &*a.as_obj::<StringObj>() };
    let sb = unsafe { &*b.as_obj::<StringObj>() };
    if sa.length != sb.length {
        return false;
    }
    let ha = sa.hash.load(Ordering::Relaxed);
    let hb = sb.hash.load(Ordering::Relaxed);
    if ha != 0 && hb != 0 && ha != hb {
        return false;
    }
    string_compare(a, b) == CmpOrdering::Equal
}

// =========================================================================
// Slicing, concatenation and character access
// =========================================================================

/// Slice `[begin, end)` with negative-index normalization.
///
/// Returns the source itself when the slice covers it entirely, an inline
/// copy when the slice fits a narrower element width (or is very short), and
/// otherwise a `Reference` string sharing the source's payload.
pub fn string_slice(ctx: &mut Context, v: Value, begin: i64, end: i64) -> Result<Value> {
    if v.type_tag() != TypeTag::String {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not a string"));
    }
    let len = string_length(v);
    let begin = normalize_index(begin, len);
    let end = normalize_index(end, len).max(begin);
    let new_len = end - begin;

    if new_len == 0 {
        return new_string_from_code_slice(ctx, &[]);
    }
    if new_len == len {
        return Ok(v);
    }

    let (elem, storage) = {
        let s = unsafe { &*v.as_obj::<StringObj>() };
        (s.elem(), s.storage_kind())
    };

    // Pick the narrowest width the slice content actually needs.
    let mut max = 0u32;
    {
        let s = unsafe { &*v.as_obj::<StringObj>() };
        for i in begin..end {
            max = max.max(unsafe { s.code_at(i) });
        }
    }
    let want_elem = ElemSize::for_code(max);
    let slice_bytes = (new_len as usize) << elem.log2();

    if want_elem < elem || slice_bytes < MIN_REF_BYTES {
        return ctx.with_scope(|ctx| {
            let src = ctx.push_local(v);
            let out = alloc_inline(ctx, new_len, want_elem)?;
            let v = ctx.local(src);
            let s = unsafe { &*v.as_obj::<StringObj>() };
            for i in 0..new_len {
                let code = unsafe { s.code_at(begin + i) };
                unsafe { out.write_code(i, code) };
            }
            Ok(out.value)
        });
    }

    match storage {
        StringStorage::Constant => ctx.with_scope(|ctx| {
            let src = ctx.push_local(v);
            let ptr = ctx.alloc(
                TypeTag::String,
                StringObj::PAYLOAD_OFFSET + std::mem::size_of::<usize>(),
            )?;
            let v = ctx.local(src);
            let data = unsafe { (*v.as_obj::<StringObj>()).data_ptr() };
            let s = unsafe { ptr.as_mut::<StringObj>() };
            s.length = new_len;
            s.hash = AtomicU32::new(0);
            s.elem_size = u8::from(elem);
            s.storage = u8::from(StringStorage::Constant);
            s._pad = [0; 6];
            unsafe {
                *(s.payload() as *mut *const u8) = data.add((begin as usize) << elem.log2());
            }
            Ok(Value::from_heap_ptr(ptr))
        }),
        StringStorage::Inline | StringStorage::Reference => {
            let (backer, extra_off) = if storage == StringStorage::Reference {
                let s = unsafe { &*v.as_obj::<StringObj>() };
                let backer = Value::from_bits(unsafe { s.ref_backer() }.load(Ordering::Acquire));
                (backer, unsafe { s.ref_offset() })
            } else {
                (v, 0)
            };

            ctx.with_scope(|ctx| {
                let src = ctx.push_local(backer);
                let ptr = ctx.alloc(
                    TypeTag::String,
                    StringObj::PAYLOAD_OFFSET + 2 * std::mem::size_of::<usize>(),
                )?;
                let backer = ctx.local(src);

                let s = unsafe { ptr.as_mut::<StringObj>() };
                s.length = new_len;
                s.hash = AtomicU32::new(0);
                s.elem_size = u8::from(elem);
                s.storage = u8::from(StringStorage::Reference);
                s._pad = [0; 6];
                unsafe {
                    (*(s.payload() as *const AtomicUsize))
                        .store(backer.to_bits(), Ordering::Release);
                    *(s.payload().add(std::mem::size_of::<usize>()) as *mut usize) =
                        extra_off + ((begin as usize) << elem.log2());
                }
                Ok(Value::from_heap_ptr(ptr))
            })
        }
    }
}

/// Concatenate rooted strings into one inline string.
pub fn string_concat(ctx: &mut Context, parts: &[Local]) -> Result<Value> {
    let mut total: u64 = 0;
    let mut elem = ElemSize::U8;
    for &part in parts {
        let v = ctx.local(part);
        if !v.is_heap_object() || v.type_tag() != TypeTag::String {
            return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not a string"));
        }
        let s = unsafe { &*v.as_obj::<StringObj>() };
        total += u64::from(s.length);
        elem = elem.max(s.elem());
    }
    if total > u64::from(MAX_STRING_LENGTH) {
        return Err(ctx.raise_kind(ErrorKind::NumericOutOfRange));
    }

    if parts.len() == 1 {
        return Ok(ctx.local(parts[0]));
    }

    let out = alloc_inline(ctx, total as u32, elem)?;
    let mut at = 0u32;
    for &part in parts {
        let v = ctx.local(part);
        let s = unsafe { &*v.as_obj::<StringObj>() };
        for i in 0..s.length {
            let code = unsafe { s.code_at(i) };
            unsafe { out.write_code(at, code) };
            at += 1;
        }
    }
    Ok(out.value)
}

/// One-character string at `idx` (negative counts from the end).
pub fn string_get_char(ctx: &mut Context, v: Value, idx: i64) -> Result<Value> {
    let code = string_get_char_code(ctx, v, idx)?;
    new_string_from_code_slice(ctx, &[code])
}

/// Code point at `idx` (negative counts from the end).
pub fn string_get_char_code(ctx: &mut Context, v: Value, idx: i64) -> Result<u32> {
    if v.type_tag() != TypeTag::String {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not a string"));
    }
    let len = string_length(v);
    let eff = if idx < 0 { idx + i64::from(len) } else { idx };
    if eff < 0 || eff >= i64::from(len) {
        return Err(ctx.raise_format(
            ErrorKind::InvalidIndex,
            format_args!("string index {} is out of range", idx),
        ));
    }
    let s = unsafe { &*v.as_obj::<StringObj>() };
    Ok(unsafe { s.code_at(eff as u32) })
}

// =========================================================================
// Search and transforms
// =========================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FindDir {
    Forward,
    Reverse,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanInclude {
    Exclude,
    Include,
}

/// Find `pattern` in `text`. `pos` holds the starting position on input and
/// the match position on output; -1 when the pattern does not occur.
pub fn string_find(
    ctx: &mut Context,
    text: Value,
    pattern: Value,
    dir: FindDir,
    pos: &mut i64,
) -> Result<()> {
    if text.type_tag() != TypeTag::String || pattern.type_tag() != TypeTag::String {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not a string"));
    }
    let text_len = i64::from(string_length(text));
    let pat_len = i64::from(string_length(pattern));

    let mut at = if *pos < 0 { *pos + text_len } else { *pos };
    at = at.clamp(0, text_len);

    if pat_len > text_len {
        *pos = -1;
        return Ok(());
    }

    let t = unsafe { &*text.as_obj::<StringObj>() };
    let p = unsafe { &*pattern.as_obj::<StringObj>() };
    let matches = |start: i64| -> bool {
        for k in 0..pat_len {
            if unsafe { t.code_at((start + k) as u32) } != unsafe { p.code_at(k as u32) } {
                return false;
            }
        }
        true
    };

    match dir {
        FindDir::Forward => {
            let mut i = at;
            while i + pat_len <= text_len {
                if matches(i) {
                    *pos = i;
                    return Ok(());
                }
                i += 1;
            }
        }
        FindDir::Reverse => {
            let mut i = at.min(text_len - pat_len);
            while i >= 0 {
                if matches(i) {
                    *pos = i;
                    return Ok(());
                }
                i -= 1;
            }
        }
    }
    *pos = -1;
    Ok(())
}

/// Scan `text` for the first position whose code point is (or is not, with
/// `Exclude`) part of `pattern`'s character set.
pub fn string_scan(
    ctx: &mut Context,
    text: Value,
    pattern: Value,
    dir: FindDir,
    include: ScanInclude,
    pos: &mut i64,
) -> Result<()> {
    if text.type_tag() != TypeTag::String || pattern.type_tag() != TypeTag::String {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not a string"));
    }
    let text_len = i64::from(string_length(text));
    let pat_len = string_length(pattern);

    let mut at = if *pos < 0 { *pos + text_len } else { *pos };
    at = at.clamp(0, text_len);

    let t = unsafe { &*text.as_obj::<StringObj>() };
    let p = unsafe { &*pattern.as_obj::<StringObj>() };
    let in_set = |code: u32| -> bool {
        for k in 0..pat_len {
            if unsafe { p.code_at(k) } == code {
                return true;
            }
        }
        false
    };
    let want = include == ScanInclude::Include;

    match dir {
        FindDir::Forward => {
            let mut i = at;
            while i < text_len {
                if in_set(unsafe { t.code_at(i as u32) }) == want {
                    *pos = i;
                    return Ok(());
                }
                i += 1;
            }
        }
        FindDir::Reverse => {
            let mut i = at.min(text_len - 1);
            while i >= 0 {
                if in_set(unsafe { t.code_at(i as u32) }) == want {
                    *pos = i;
                    return Ok(());
                }
                i -= 1;
            }
        }
    }
    *pos = -1;
    Ok(())
}

/// New string with the code points in reverse order.
pub fn string_reverse(ctx: &mut Context, v: Value) -> Result<Value> {
    if v.type_tag() != TypeTag::String {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not a string"));
    }
    let codes: Vec<u32> = unsafe { StringIter::new(v) }.collect();
    let reversed: Vec<u32> = codes.into_iter().rev().collect();
    new_string_from_code_slice(ctx, &reversed)
}

/// Repeat the string `num` times.
pub fn string_repeat(ctx: &mut Context, v: Value, num: u32) -> Result<Value> {
    if v.type_tag() != TypeTag::String {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not a string"));
    }
    let len = u64::from(string_length(v)) * u64::from(num);
    if len > u64::from(MAX_STRING_LENGTH) {
        return Err(ctx.raise_kind(ErrorKind::NumericOutOfRange));
    }
    let codes: Vec<u32> = unsafe { StringIter::new(v) }.collect();
    let mut repeated = Vec::with_capacity(len as usize);
    for _ in 0..num {
        repeated.extend_from_slice(&codes);
    }
    new_string_from_code_slice(ctx, &repeated)
}

/// ASCII lowercase mapping; other code points pass through.
pub fn string_lowercase(ctx: &mut Context, v: Value) -> Result<Value> {
    map_ascii_case(ctx, v, |c| {
        if (b'A' as u32..=b'Z' as u32).contains(&c) {
            c + 0x20
        } else {
            c
        }
    })
}

/// ASCII uppercase mapping; other code points pass through.
pub fn string_uppercase(ctx: &mut Context, v: Value) -> Result<Value> {
    map_ascii_case(ctx, v, |c| {
        if (b'a' as u32..=b'z' as u32).contains(&c) {
            c - 0x20
        } else {
            c
        }
    })
}

fn map_ascii_case(ctx: &mut Context, v: Value, f: impl Fn(u32) -> u32) -> Result<Value> {
    if v.type_tag() != TypeTag::String {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not a string"));
    }
    let codes: Vec<u32> = unsafe { StringIter::new(v) }.map(f).collect();
    new_string_from_code_slice(ctx, &codes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_stray_continuation() {
        assert!(decode_utf8(&[0x80], false).is_none());
        assert!(decode_utf8(&[0x61, 0xBF], false).is_none());
    }

    #[test]
    fn test_decode_permits_overlong() {
        // 0xC0 0x80 is an overlong encoding of NUL; the codec is lenient.
        let codes = decode_utf8(&[0xC0, 0x80], false).unwrap();
        assert_eq!(codes, vec![0]);
    }

    #[test]
    fn test_decode_rejects_truncated() {
        assert!(decode_utf8(&[0xE2, 0x82], false).is_none());
        assert!(decode_utf8(&[0xF0], false).is_none());
        assert!(decode_utf8(&[0xF8, 0x80, 0x80, 0x80, 0x80], false).is_none());
    }

    #[test]
    fn test_decode_escapes() {
        let codes = decode_utf8(b"a\\x41\\x{1F600}", true).unwrap();
        assert_eq!(codes, vec![0x61, 0x41, 0x1F600]);

        assert!(decode_utf8(b"\\x4", true).is_none());
        assert!(decode_utf8(b"\\x{", true).is_none());
        assert!(decode_utf8(b"\\x{}", true).is_none());
        assert!(decode_utf8(b"\\x{zz}", true).is_none());
        assert!(decode_utf8(b"\\y", true).is_none());
        assert!(decode_utf8(b"\\x{200000}", true).is_none());
    }

    #[test]
    fn test_encode_roundtrip() {
        let mut out = Vec::new();
        for code in [0u32, 0x41, 0x7F, 0x80, 0x7FF, 0x800, 0xFFFF, 0x1_0000, MAX_CODE_POINT] {
            out.clear();
            encode_utf8_code(code, &mut out).unwrap();
            assert_eq!(out.len(), utf8_code_len(code));
            let decoded = decode_utf8(&out, false).unwrap();
            assert_eq!(decoded, vec![code]);
        }
        assert!(encode_utf8_code(MAX_CODE_POINT + 1, &mut out).is_err());
    }

    #[test]
    fn test_elem_size_selection() {
        assert_eq!(ElemSize::for_code(0), ElemSize::U8);
        assert_eq!(ElemSize::for_code(0xFF), ElemSize::U8);
        assert_eq!(ElemSize::for_code(0x100), ElemSize::U16);
        assert_eq!(ElemSize::for_code(0xFFFF), ElemSize::U16);
        assert_eq!(ElemSize::for_code(0x1_0000), ElemSize::U32);
    }
}
