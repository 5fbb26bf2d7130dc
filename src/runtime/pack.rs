//! Binary pack/unpack codec
//!
//! A format string drives conversion between values and their binary form
//! in a buffer. Grammar per item: optional decimal count, then one format
//! character:
//!
//! | Char    | Meaning                                                    |
//! |---------|------------------------------------------------------------|
//! | `<` `>` | Switch to little- / big-endian (default little)            |
//! | `uN`    | Unsigned integer, N in {1,2,4,8} bytes                     |
//! | `iN`    | Signed integer, N in {1,2,4,8} bytes                       |
//! | `fN`    | Float, N in {4,8} bytes                                    |
//! | `sN`    | String of exactly N UTF-8 bytes; bare `s` packs            |
//! |         | variable-length and unpacks to the end of the buffer       |
//! | `bN`    | Raw byte run of exactly N bytes                            |
//! | `x`     | Padding byte; consumes no argument                         |
//!
//! The count applies to everything except the endian switches. Errors name
//! the offending format character and its 1-based position.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::array;
use super::buffer;
use super::context::Context;
use super::error::{ErrorKind, Result};
use super::string::{self, StringIter};
use super::value::{TypeTag, Value};

/// Counts at or above this are rejected; the cap is part of the format
/// contract.
const MAX_COUNT: u32 = 429_496_729;

#[derive(Clone, Copy, Debug)]
struct FmtItem {
    /// 0-based position of the format character.
    offs: usize,
    ch: char,
    /// None for bare `s` (variable length).
    size: Option<u32>,
    count: u32,
}

fn is_space(c: u32) -> bool {
    c == 0x20 || c == 0x09 || c == 0x0A || c == 0x0D
}

fn skip_spaces(codes: &[u32], pos: &mut usize) {
    while *pos < codes.len() && is_space(codes[*pos]) {
        *pos += 1;
    }
}

fn parse_count(codes: &[u32], pos: &mut usize) -> Option<u32> {
    let mut count = 0u32;
    while *pos < codes.len() {
        let c = codes[*pos];
        if !(0x30..=0x39).contains(&c) {
            break;
        }
        if count >= MAX_COUNT {
            return None;
        }
        count = count * 10 + (c - 0x30);
        *pos += 1;
    }
    Some(count)
}

fn describe_char(c: u32) -> String {
    if (0x20..0x7F).contains(&c) {
        format!("'{}'", char::from_u32(c).unwrap_or('?'))
    } else {
        format!("'\\x{{{:x}}}'", c)
    }
}

/// Parse the next format item. Endian switches come back as items with
/// `ch` of `<` or `>` and no size.
fn next_item(ctx: &mut Context, codes: &[u32], pos: &mut usize) -> Result<Option<FmtItem>> {
    skip_spaces(codes, pos);
    if *pos >= codes.len() {
        return Ok(None);
    }

    let mut offs = *pos;
    let mut count = 1u32;
    let mut c = codes[*pos];

    if (0x30..=0x39).contains(&c) {
        count = match parse_count(codes, pos) {
            Some(count) => count,
            None => {
                return Err(ctx.raise_format(
                    ErrorKind::FormatError,
                    format_args!("invalid count at position {}", offs + 1),
                ));
            }
        };
        skip_spaces(codes, pos);
        if *pos >= codes.len() {
            return Err(ctx.raise_format(
                ErrorKind::FormatError,
                format_args!(
                    "missing format character at the end of format string after count {} at position {}",
                    count,
                    offs + 1
                ),
            ));
        }
        offs = *pos;
        c = codes[*pos];
    }
    *pos += 1;

    let ch = match char::from_u32(c) {
        Some(ch) => ch,
        None => '\0',
    };

    match ch {
        '<' | '>' => Ok(Some(FmtItem {
            offs,
            ch,
            size: None,
            count,
        })),

        'x' => Ok(Some(FmtItem {
            offs,
            ch,
            size: Some(1),
            count,
        })),

        'u' | 'i' | 'f' | 'b' | 's' => {
            let next_c = codes.get(*pos).copied();
            match next_c {
                Some(d) if (0x30..=0x39).contains(&d) => {
                    let size_offs = *pos;
                    let size = match parse_count(codes, pos) {
                        Some(size) => size,
                        None => {
                            return Err(ctx.raise_format(
                                ErrorKind::FormatError,
                                format_args!(
                                    "invalid size for format character '{}' at position {}",
                                    ch,
                                    size_offs + 1
                                ),
                            ));
                        }
                    };
                    Ok(Some(FmtItem {
                        offs,
                        ch,
                        size: Some(size),
                        count,
                    }))
                }
                _ if ch == 's' => Ok(Some(FmtItem {
                    offs,
                    ch,
                    size: None,
                    count,
                })),
                Some(d) => Err(ctx.raise_format(
                    ErrorKind::FormatError,
                    format_args!(
                        "unexpected character {} at position {}, expected size",
                        describe_char(d),
                        *pos + 1
                    ),
                )),
                None => Err(ctx.raise_format(
                    ErrorKind::FormatError,
                    format_args!(
                        "missing size for format character '{}' at position {}",
                        ch,
                        offs + 1
                    ),
                )),
            }
        }

        _ => Err(ctx.raise_format(
            ErrorKind::FormatError,
            format_args!(
                "invalid format character {} at position {}",
                describe_char(c),
                *pos
            ),
        )),
    }
}

fn format_codes(ctx: &mut Context, fmt: Value) -> Result<Vec<u32>> {
    if !fmt.is_heap_object() || fmt.type_tag() != TypeTag::String {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "format is not a string"));
    }
    Ok(unsafe { StringIter::new(fmt) }.collect())
}

fn check_int_size(ctx: &mut Context, item: &FmtItem, size: u32) -> Result<()> {
    let valid = match item.ch {
        'f' => size == 4 || size == 8,
        _ => size == 1 || size == 2 || size == 4 || size == 8,
    };
    if !valid {
        return Err(ctx.raise_format(
            ErrorKind::FormatError,
            format_args!(
                "invalid size in '{}{}' at position {}",
                item.ch,
                size,
                item.offs + 1
            ),
        ));
    }
    Ok(())
}

fn check_arg_supply(
    ctx: &mut Context,
    item: &FmtItem,
    arg_idx: u32,
    num_args: u32,
) -> Result<()> {
    if arg_idx + item.count > num_args {
        let size = item.size.unwrap_or(0);
        return Err(ctx.raise_format(
            ErrorKind::FormatError,
            format_args!(
                "not enough values to pack '{}{}' count {} at position {}; \
                 input has {} elements but required {}",
                item.ch,
                size,
                item.count,
                item.offs + 1,
                num_args,
                arg_idx + item.count
            ),
        ));
    }
    Ok(())
}

fn write_endian_uint(dst: &mut [u8], value: u64, big_end: bool) {
    let size = dst.len();
    if size == 8 {
        if big_end {
            BigEndian::write_u64(dst, value);
        } else {
            LittleEndian::write_u64(dst, value);
        }
    } else {
        let masked = value & (!0u64 >> (64 - 8 * size));
        if big_end {
            BigEndian::write_uint(dst, masked, size);
        } else {
            LittleEndian::write_uint(dst, masked, size);
        }
    }
}

fn read_endian_uint(src: &[u8], big_end: bool) -> u64 {
    if src.len() == 8 {
        if big_end {
            BigEndian::read_u64(src)
        } else {
            LittleEndian::read_u64(src)
        }
    } else if big_end {
        BigEndian::read_uint(src, src.len())
    } else {
        LittleEndian::read_uint(src, src.len())
    }
}

fn read_endian_int(src: &[u8], big_end: bool) -> i64 {
    if src.len() == 8 {
        if big_end {
            BigEndian::read_i64(src)
        } else {
            LittleEndian::read_i64(src)
        }
    } else if big_end {
        BigEndian::read_int(src, src.len())
    } else {
        LittleEndian::read_int(src, src.len())
    }
}

/// Convert `args` (an array) to binary per `fmt` and append to `buf`.
/// Returns the buffer.
pub fn buffer_pack(ctx: &mut Context, buf: Value, fmt: Value, args: Value) -> Result<Value> {
    if !buf.is_heap_object() || buf.type_tag() != TypeTag::Buffer {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not a buffer"));
    }
    if !args.is_heap_object() || args.type_tag() != TypeTag::Array {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not an array"));
    }
    let codes = format_codes(ctx, fmt)?;

    ctx.with_scope(|ctx| {
        let buf_loc = ctx.push_local(buf);
        let args_loc = ctx.push_local(args);

        let mut pos = 0usize;
        let mut big_end = false;
        let mut arg_idx = 0u32;

        while let Some(item) = next_item(ctx, &codes, &mut pos)? {
            match item.ch {
                '<' => big_end = false,
                '>' => big_end = true,

                'x' => {
                    if item.count > 0 {
                        let buf = ctx.local(buf_loc);
                        let dst = buffer::buffer_make_room(ctx, buf, item.count)?;
                        unsafe { std::ptr::write_bytes(dst, 0, item.count as usize) };
                    }
                }

                'u' | 'i' | 'f' => {
                    let size = item.size.expect("numeric formats always carry a size");
                    check_int_size(ctx, &item, size)?;
                    let num_args = array::array_size(ctx.local(args_loc));
                    check_arg_supply(ctx, &item, arg_idx, num_args)?;

                    let run = u64::from(size) * u64::from(item.count);
                    if run > u64::from(u32::MAX) {
                        return Err(ctx.raise(ErrorKind::NumericOutOfRange, "number out of range"));
                    }

                    // Reserve the whole run up front, then fill it in place.
                    let start = buffer::buffer_size(ctx.local(buf_loc));
                    if run > 0 {
                        let buf = ctx.local(buf_loc);
                        buffer::buffer_make_room(ctx, buf, run as u32)?;
                    }

                    for k in 0..item.count {
                        let args = ctx.local(args_loc);
                        let value = array::array_read(ctx, args, i64::from(arg_idx))?;
                        arg_idx += 1;
                        if !value.is_numeric() {
                            return Err(ctx.raise_format(
                                ErrorKind::FormatError,
                                format_args!(
                                    "expected numeric value at index {} for '{}{}' at position {}",
                                    arg_idx - 1,
                                    item.ch,
                                    size,
                                    item.offs + 1
                                ),
                            ));
                        }

                        let mut tmp = [0u8; 8];
                        if item.ch == 'f' {
                            let value = super::utils::get_float(ctx, value)?;
                            let bits = if size == 4 {
                                u64::from((value as f32).to_bits())
                            } else {
                                value.to_bits()
                            };
                            write_endian_uint(&mut tmp[..size as usize], bits, big_end);
                        } else {
                            let value = super::utils::get_integer(ctx, value)?;
                            write_endian_uint(&mut tmp[..size as usize], value as u64, big_end);
                        }

                        let buf = ctx.local(buf_loc);
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                tmp.as_ptr(),
                                buffer::buffer_data_ptr(buf).add((start + k * size) as usize),
                                size as usize,
                            );
                        }
                    }
                }

                'b' => {
                    let size = item.size.expect("byte runs always carry a size");
                    let num_args = array::array_size(ctx.local(args_loc));
                    check_arg_supply(ctx, &item, arg_idx, num_args)?;

                    for _ in 0..item.count {
                        let args = ctx.local(args_loc);
                        let value = array::array_read(ctx, args, i64::from(arg_idx))?;
                        arg_idx += 1;
                        if !value.is_heap_object() || value.type_tag() != TypeTag::Buffer {
                            return Err(ctx.raise_format(
                                ErrorKind::FormatError,
                                format_args!(
                                    "expected buffer at index {} for '{}{}' at position {}",
                                    arg_idx - 1,
                                    item.ch,
                                    size,
                                    item.offs + 1
                                ),
                            ));
                        }

                        let src_loc = ctx.push_local(value);
                        let buf = ctx.local(buf_loc);
                        let dst = buffer::buffer_make_room(ctx, buf, size)?;
                        let src = ctx.local(src_loc);

                        let src_size = buffer::buffer_size(src);
                        let mut copy_size = size.min(src_size);
                        unsafe {
                            let src_ptr = buffer::buffer_data_ptr(src);
                            let src_end = src_ptr.add(copy_size as usize);
                            // Packing a buffer into itself: keep only the
                            // prefix that precedes the destination.
                            if src_end > dst && (src_ptr as usize) < (dst as usize) {
                                copy_size = (dst as usize - src_ptr as usize) as u32;
                            }
                            if copy_size > 0 {
                                std::ptr::copy(src_ptr, dst, copy_size as usize);
                            }
                            if copy_size < size {
                                std::ptr::write_bytes(
                                    dst.add(copy_size as usize),
                                    0,
                                    (size - copy_size) as usize,
                                );
                            }
                        }
                    }
                }

                's' => {
                    let num_args = array::array_size(ctx.local(args_loc));
                    check_arg_supply(ctx, &item, arg_idx, num_args)?;

                    for _ in 0..item.count {
                        let args = ctx.local(args_loc);
                        let value = array::array_read(ctx, args, i64::from(arg_idx))?;
                        arg_idx += 1;
                        if !value.is_heap_object() || value.type_tag() != TypeTag::String {
                            return Err(ctx.raise_format(
                                ErrorKind::FormatError,
                                format_args!(
                                    "expected string at index {} for '{}{}' at position {}",
                                    arg_idx - 1,
                                    item.ch,
                                    item.size.unwrap_or(0),
                                    item.offs + 1
                                ),
                            ));
                        }

                        let bytes = string::string_to_utf8(ctx, value)?;
                        let write_size = match item.size {
                            Some(size) => size,
                            None => bytes.len() as u32,
                        };
                        let copy_size = (bytes.len() as u32).min(write_size) as usize;

                        let buf = ctx.local(buf_loc);
                        let dst = buffer::buffer_make_room(ctx, buf, write_size)?;
                        unsafe {
                            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, copy_size);
                            std::ptr::write_bytes(
                                dst.add(copy_size),
                                0,
                                write_size as usize - copy_size,
                            );
                        }
                    }
                }

                _ => unreachable!("parser rejects unknown format characters"),
            }
        }
        Ok(ctx.local(buf_loc))
    })
}

/// Unpack values from `buf` starting at `pos` per `fmt`. Returns an array
/// of the decoded values.
pub fn buffer_unpack(ctx: &mut Context, buf: Value, pos: i64, fmt: Value) -> Result<Value> {
    if !buf.is_heap_object() || buf.type_tag() != TypeTag::Buffer {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not a buffer"));
    }
    let codes = format_codes(ctx, fmt)?;
    let data_size = buffer::buffer_size(buf);
    let mut at = super::value::normalize_index(pos, data_size);

    ctx.with_scope(|ctx| {
        let buf_loc = ctx.push_local(buf);
        let out = array::new_array(ctx, 0)?;
        let out_loc = ctx.push_local(out);

        let mut fmt_pos = 0usize;
        let mut big_end = false;

        while let Some(item) = next_item(ctx, &codes, &mut fmt_pos)? {
            match item.ch {
                '<' => {
                    big_end = false;
                    continue;
                }
                '>' => {
                    big_end = true;
                    continue;
                }
                _ => {}
            }

            let size = match item.size {
                Some(size) => size,
                None => {
                    // Bare `s`: the rest of the buffer, exactly once.
                    if item.count != 1 {
                        return Err(ctx.raise_format(
                            ErrorKind::FormatError,
                            format_args!(
                                "invalid count {} for format character 's' without size at \
                                 position {}, expected count 1",
                                item.count,
                                item.offs + 1
                            ),
                        ));
                    }
                    data_size.saturating_sub(at)
                }
            };

            if matches!(item.ch, 'u' | 'i' | 'f') {
                check_int_size(ctx, &item, size)?;
            }

            if u64::from(at) + u64::from(size) * u64::from(item.count) > u64::from(data_size) {
                return Err(ctx.raise_format(
                    ErrorKind::FormatError,
                    format_args!(
                        "buffer with size {} too short to unpack data for format character \
                         '{}{}' at position {}, need size to be at least {}",
                        data_size,
                        item.ch,
                        size,
                        item.offs + 1,
                        u64::from(at) + u64::from(size) * u64::from(item.count)
                    ),
                ));
            }

            match item.ch {
                'x' => {
                    at += size * item.count;
                }

                'u' | 'i' | 'f' => {
                    for _ in 0..item.count {
                        let mut tmp = [0u8; 8];
                        {
                            let buf = ctx.local(buf_loc);
                            unsafe {
                                std::ptr::copy_nonoverlapping(
                                    buffer::buffer_data_ptr(buf).add(at as usize),
                                    tmp.as_mut_ptr(),
                                    size as usize,
                                );
                            }
                        }
                        let value = match item.ch {
                            'i' => {
                                let v = read_endian_int(&tmp[..size as usize], big_end);
                                ctx.new_int(v)?
                            }
                            'f' => {
                                let bits = read_endian_uint(&tmp[..size as usize], big_end);
                                let v = if size == 4 {
                                    f64::from(f32::from_bits(bits as u32))
                                } else {
                                    f64::from_bits(bits)
                                };
                                ctx.new_float(v)?
                            }
                            _ => {
                                let v = read_endian_uint(&tmp[..size as usize], big_end);
                                ctx.new_int(v as i64)?
                            }
                        };
                        let out = ctx.local(out_loc);
                        array::array_push(ctx, out, value)?;
                        at += size;
                    }
                }

                'b' => {
                    for _ in 0..item.count {
                        let buf = ctx.local(buf_loc);
                        let chunk =
                            buffer::buffer_slice(ctx, buf, i64::from(at), i64::from(at + size))?;
                        let out = ctx.local(out_loc);
                        array::array_push(ctx, out, chunk)?;
                        at += size;
                    }
                }

                's' => {
                    for _ in 0..item.count {
                        let buf = ctx.local(buf_loc);
                        let s = string::new_string_from_buffer(ctx, buf, at, at + size)?;
                        let out = ctx.local(out_loc);
                        array::array_push(ctx, out, s)?;
                        at += size;
                    }
                }

                _ => unreachable!("parser rejects unknown format characters"),
            }
        }

        Ok(ctx.local(out_loc))
    })
}
