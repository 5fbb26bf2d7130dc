//! String behavior tests: widths, storage forms, hashing, search and
//! transforms.

use std::cmp::Ordering as CmpOrdering;

use super::context::Context;
use super::error::ErrorKind;
use super::string::*;
use super::value::{TypeTag, Value};

fn ctx() -> Context {
    Context::new().unwrap()
}

fn utf8(ctx: &mut Context, v: Value) -> Vec<u8> {
    string_to_utf8(ctx, v).unwrap()
}

#[test]
fn test_tri_width_selection_and_roundtrip() {
    let mut ctx = ctx();

    // "a" + U+0100 + U+10000: widest element wins for the whole string.
    let bytes = "a\u{100}\u{10000}".as_bytes();
    let s = new_string_utf8(&mut ctx, bytes).unwrap();
    assert_eq!(s.type_tag(), TypeTag::String);
    assert_eq!(string_length(s), 3);
    let obj = unsafe { &*s.as_obj::<StringObj>() };
    assert_eq!(obj.elem(), ElemSize::U32);
    assert_eq!(utf8(&mut ctx, s), bytes);

    // The middle character alone narrows to 16-bit storage.
    let mid = string_slice(&mut ctx, s, 1, 2).unwrap();
    assert_eq!(string_length(mid), 1);
    let obj = unsafe { &*mid.as_obj::<StringObj>() };
    assert_eq!(obj.elem(), ElemSize::U16);
    assert_eq!(utf8(&mut ctx, mid), "\u{100}".as_bytes());

    let ascii = new_string(&mut ctx, "plain").unwrap();
    let obj = unsafe { &*ascii.as_obj::<StringObj>() };
    assert_eq!(obj.elem(), ElemSize::U8);
}

#[test]
fn test_slice_full_range_returns_source() {
    let mut ctx = ctx();
    let s = new_string(&mut ctx, "whole").unwrap();
    let t = string_slice(&mut ctx, s, 0, 5).unwrap();
    assert_eq!(s, t);

    let empty = string_slice(&mut ctx, s, 2, 2).unwrap();
    assert_eq!(string_length(empty), 0);
    assert_ne!(empty, s);
}

#[test]
fn test_slice_negative_indices() {
    let mut ctx = ctx();
    let s = new_string(&mut ctx, "abcdefgh").unwrap();
    let t = string_slice(&mut ctx, s, -5, -1).unwrap();
    assert_eq!(utf8(&mut ctx, t), b"defg");

    // Out-of-range clamps.
    let t = string_slice(&mut ctx, s, -100, 100).unwrap();
    assert_eq!(s, t);
}

#[test]
fn test_long_slice_shares_storage() {
    let mut ctx = ctx();
    let s = new_string(&mut ctx, "0123456789abcdefghij-tail").unwrap();
    let t = string_slice(&mut ctx, s, 0, 20).unwrap();
    let obj = unsafe { &*t.as_obj::<StringObj>() };
    assert_eq!(obj.storage_kind(), StringStorage::Reference);
    assert_eq!(utf8(&mut ctx, t), b"0123456789abcdefghij");

    // Slicing the slice re-targets the original backer.
    let u = string_slice(&mut ctx, t, 2, 19).unwrap();
    let obj = unsafe { &*u.as_obj::<StringObj>() };
    assert_eq!(obj.storage_kind(), StringStorage::Reference);
    assert_eq!(
        Value::from_bits(unsafe { obj.ref_backer() }.load(std::sync::atomic::Ordering::Relaxed)),
        s
    );
    assert_eq!(utf8(&mut ctx, u), b"23456789abcdefghi");
}

#[test]
fn test_const_string_and_slice() {
    let mut ctx = ctx();
    let s = new_const_string(&mut ctx, "static payload in rodata").unwrap();
    let obj = unsafe { &*s.as_obj::<StringObj>() };
    assert_eq!(obj.storage_kind(), StringStorage::Constant);
    assert_eq!(utf8(&mut ctx, s), b"static payload in rodata");

    let t = string_slice(&mut ctx, s, 7, 24).unwrap();
    let obj = unsafe { &*t.as_obj::<StringObj>() };
    assert_eq!(obj.storage_kind(), StringStorage::Constant);
    assert_eq!(utf8(&mut ctx, t), b"payload in rodata");
}

#[test]
fn test_hash_identical_across_widths() {
    let mut ctx = ctx();
    let codes: Vec<u32> = "hash me".chars().map(u32::from).collect();

    let narrow = new_string_with_elem(&mut ctx, &codes, ElemSize::U8).unwrap();
    let mid = new_string_with_elem(&mut ctx, &codes, ElemSize::U16).unwrap();
    let wide = new_string_with_elem(&mut ctx, &codes, ElemSize::U32).unwrap();

    let h8 = string_hash(narrow);
    let h16 = string_hash(mid);
    let h32 = string_hash(wide);
    assert_ne!(h8, 0);
    assert_eq!(h8, h16);
    assert_eq!(h8, h32);

    assert!(string_equal(narrow, wide));
    assert_eq!(string_compare(narrow, mid), CmpOrdering::Equal);
}

#[test]
fn test_compare_cross_width_ordering() {
    let mut ctx = ctx();
    let a = new_string(&mut ctx, "abc").unwrap();
    let b = new_string(&mut ctx, "ab\u{100}").unwrap();
    // 'c' (0x63) < U+0100.
    assert_eq!(string_compare(a, b), CmpOrdering::Less);
    assert_eq!(string_compare(b, a), CmpOrdering::Greater);

    let prefix = new_string(&mut ctx, "ab").unwrap();
    assert_eq!(string_compare(prefix, a), CmpOrdering::Less);
}

#[test]
fn test_compare_slice() {
    let mut ctx = ctx();
    let a = new_string(&mut ctx, "xxabcxx").unwrap();
    let b = new_string(&mut ctx, "yyabcyy").unwrap();
    assert_eq!(string_compare_slice(a, 2, 5, b, 2, 5), CmpOrdering::Equal);
    assert_eq!(string_compare_slice(a, 0, 2, b, 0, 2), CmpOrdering::Less);
    assert_eq!(string_compare_slice(a, 2, 5, b, 2, 4), CmpOrdering::Greater);
}

#[test]
fn test_concat() {
    let mut ctx = ctx();
    let a = new_string(&mut ctx, "foo").unwrap();
    let a_loc = ctx.push_local(a);
    let b = new_string(&mut ctx, "\u{100}bar").unwrap();
    let b_loc = ctx.push_local(b);
    let c = new_string(&mut ctx, "").unwrap();
    let c_loc = ctx.push_local(c);

    let joined = string_concat(&mut ctx, &[a_loc, b_loc, c_loc]).unwrap();
    assert_eq!(string_length(joined), 7);
    let obj = unsafe { &*joined.as_obj::<StringObj>() };
    assert_eq!(obj.elem(), ElemSize::U16);
    assert_eq!(utf8(&mut ctx, joined), "foo\u{100}bar".as_bytes());

    // Single part comes back as-is.
    let single = string_concat(&mut ctx, &[a_loc]).unwrap();
    assert_eq!(single, ctx.local(a_loc));
}

#[test]
fn test_get_char_and_codes() {
    let mut ctx = ctx();
    let s = new_string(&mut ctx, "ab\u{1F600}").unwrap();

    assert_eq!(string_get_char_code(&mut ctx, s, 0).unwrap(), 0x61);
    assert_eq!(string_get_char_code(&mut ctx, s, -1).unwrap(), 0x1F600);

    let c = string_get_char(&mut ctx, s, 1).unwrap();
    assert_eq!(string_length(c), 1);
    assert_eq!(utf8(&mut ctx, c), b"b");

    let err = string_get_char_code(&mut ctx, s, 3).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidIndex);
    ctx.clear_exception();
    let err = string_get_char_code(&mut ctx, s, -4).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidIndex);
    ctx.clear_exception();
}

#[test]
fn test_from_codes_array() {
    let mut ctx = ctx();
    use super::array;
    let codes = array::new_array(&mut ctx, 3).unwrap();
    for (i, c) in [0x68i64, 0x69, 0x21].iter().enumerate() {
        array::array_write(&mut ctx, codes, i as i64, Value::from_small_int(*c)).unwrap();
    }
    let s = new_string_from_codes(&mut ctx, codes).unwrap();
    assert_eq!(utf8(&mut ctx, s), b"hi!");

    // Out-of-range code point is rejected.
    array::array_write(&mut ctx, codes, 0, Value::from_small_int(0x20_0000)).unwrap();
    let err = new_string_from_codes(&mut ctx, codes).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NumericOutOfRange);
    ctx.clear_exception();
}

#[test]
fn test_escape_construction() {
    let mut ctx = ctx();
    let s = new_string_esc(&mut ctx, b"A\\x42\\x{43}").unwrap();
    assert_eq!(utf8(&mut ctx, s), b"ABC");

    for bad in [
        &b"\\x4"[..],
        &b"\\x{44"[..],
        &b"\\q"[..],
        &b"trailing\\"[..],
    ] {
        let err = new_string_esc(&mut ctx, bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidString);
        ctx.clear_exception();
    }
}

#[test]
fn test_invalid_utf8_rejected() {
    let mut ctx = ctx();
    for bad in [&[0x80u8][..], &[0xE0, 0x80][..], &[0xFF][..]] {
        let err = new_string_utf8(&mut ctx, bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidString);
        ctx.clear_exception();
    }
}

#[test]
fn test_find_forward_and_reverse() {
    let mut ctx = ctx();
    let text = new_string(&mut ctx, "one two one two").unwrap();
    let pat = new_string(&mut ctx, "one").unwrap();

    let mut pos = 0i64;
    string_find(&mut ctx, text, pat, FindDir::Forward, &mut pos).unwrap();
    assert_eq!(pos, 0);

    pos = 1;
    string_find(&mut ctx, text, pat, FindDir::Forward, &mut pos).unwrap();
    assert_eq!(pos, 8);

    pos = 14;
    string_find(&mut ctx, text, pat, FindDir::Reverse, &mut pos).unwrap();
    assert_eq!(pos, 8);

    pos = 7;
    string_find(&mut ctx, text, pat, FindDir::Reverse, &mut pos).unwrap();
    assert_eq!(pos, 0);

    let absent = new_string(&mut ctx, "three").unwrap();
    pos = 0;
    string_find(&mut ctx, text, absent, FindDir::Forward, &mut pos).unwrap();
    assert_eq!(pos, -1);
}

#[test]
fn test_scan_include_exclude() {
    let mut ctx = ctx();
    let text = new_string(&mut ctx, "  \t hello").unwrap();
    let spaces = new_string(&mut ctx, " \t").unwrap();

    // First character not in the whitespace set.
    let mut pos = 0i64;
    string_scan(
        &mut ctx,
        text,
        spaces,
        FindDir::Forward,
        ScanInclude::Exclude,
        &mut pos,
    )
    .unwrap();
    assert_eq!(pos, 4);

    // First whitespace searching backwards from the end.
    pos = 8;
    string_scan(
        &mut ctx,
        text,
        spaces,
        FindDir::Reverse,
        ScanInclude::Include,
        &mut pos,
    )
    .unwrap();
    assert_eq!(pos, 3);
}

#[test]
fn test_reverse_repeat_case() {
    let mut ctx = ctx();
    let s = new_string(&mut ctx, "ab\u{100}").unwrap();
    let r = string_reverse(&mut ctx, s).unwrap();
    assert_eq!(utf8(&mut ctx, r), "\u{100}ba".as_bytes());

    let s = new_string(&mut ctx, "ab").unwrap();
    let r = string_repeat(&mut ctx, s, 3).unwrap();
    assert_eq!(utf8(&mut ctx, r), b"ababab");
    let r = string_repeat(&mut ctx, s, 0).unwrap();
    assert_eq!(string_length(r), 0);

    let s = new_string(&mut ctx, "MiXeD 42\u{100}").unwrap();
    let lower = string_lowercase(&mut ctx, s).unwrap();
    assert_eq!(utf8(&mut ctx, lower), "mixed 42\u{100}".as_bytes());
    let upper = string_uppercase(&mut ctx, s).unwrap();
    assert_eq!(utf8(&mut ctx, upper), "MIXED 42\u{100}".as_bytes());
}

#[test]
fn test_string_iter() {
    let mut ctx = ctx();
    let s = new_string(&mut ctx, "a\u{100}").unwrap();
    let mut iter = unsafe { StringIter::new(s) };
    assert!(!iter.is_end());
    assert_eq!(iter.peek_code(), 0x61);
    iter.advance();
    assert_eq!(iter.peek_code(), 0x100);
    iter.advance();
    assert!(iter.is_end());
}

#[test]
fn test_repeat_overflow_guard() {
    let mut ctx = ctx();
    let s = new_string(&mut ctx, "abcdefgh").unwrap();
    let err = string_repeat(&mut ctx, s, u32::MAX).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NumericOutOfRange);
    ctx.clear_exception();
}
