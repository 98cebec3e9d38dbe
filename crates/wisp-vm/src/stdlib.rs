//! Built-in command implementations.
//!
//! Every op here follows the same calling convention as the core set: a
//! result slot, then operand slots. Numeric one-argument ops broadcast
//! over lists; the unary string ops map over lists of strings.

use crate::context::{Context, RunResult};
use crate::pickle;
use crate::value::{hash_list, order, tostr, Value};
use std::cmp::Ordering;
use wisp_prog::Op;

/// 32-bit wrap of a double, the domain of the `int` group.
#[inline]
pub fn to_u32(n: f64) -> u32 {
    ((n as i64) & 0xFFFF_FFFF) as u32
}

/// Parse a string the way numeric literals read: optional sign, optional
/// `0b`/`0c`/`0x` prefix, fraction and exponent in the base.
pub fn parse_num(s: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(s).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    let (sign, text) = match text.as_bytes()[0] {
        b'-' => (-1.0, &text[1..]),
        b'+' => (1.0, &text[1..]),
        _ => (1.0, text),
    };
    let (base, digits) = if let Some(rest) = text.strip_prefix("0x") {
        (16, rest)
    } else if let Some(rest) = text.strip_prefix("0b") {
        (2, rest)
    } else if let Some(rest) = text.strip_prefix("0c") {
        (8, rest)
    } else {
        (10, text)
    };
    if digits.is_empty() {
        return None;
    }
    if base == 10 {
        return digits.parse::<f64>().ok().map(|n| sign * n);
    }
    let mut val = 0.0f64;
    for c in digits.chars() {
        if c == '_' {
            continue;
        }
        let d = c.to_digit(base)?;
        val = val * base as f64 + d as f64;
    }
    Some(sign * val)
}

/// One field of a packed struct description.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StructField {
    pub size: usize,
    pub signed: bool,
    pub float: bool,
    pub big_endian: bool,
}

/// Parse a field type name such as `U8`, `SL16`, `FB64`. Bare names are
/// little-endian.
pub fn struct_field(name: &[u8]) -> Option<StructField> {
    let text = std::str::from_utf8(name).ok()?;
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return None;
    }
    let (signed, float) = match bytes[0] {
        b'U' => (false, false),
        b'S' => (true, false),
        b'F' => (false, true),
        _ => return None,
    };
    let (big_endian, width) = match &bytes[1..] {
        [b'L', rest @ ..] => (false, rest),
        [b'B', rest @ ..] => (true, rest),
        rest => (false, rest),
    };
    let bits: usize = std::str::from_utf8(width).ok()?.parse().ok()?;
    let ok = match (float, bits) {
        (false, 8 | 16 | 32) => true,
        (true, 32 | 64) => true,
        _ => false,
    };
    if !ok || (float && signed) {
        return None;
    }
    Some(StructField {
        size: bits / 8,
        signed,
        float,
        big_endian,
    })
}

fn struct_pack(field: StructField, n: f64, out: &mut Vec<u8>) {
    if field.float {
        if field.size == 4 {
            let b = (n as f32).to_bits();
            if field.big_endian {
                out.extend_from_slice(&b.to_be_bytes());
            } else {
                out.extend_from_slice(&b.to_le_bytes());
            }
        } else {
            let b = n.to_bits();
            if field.big_endian {
                out.extend_from_slice(&b.to_be_bytes());
            } else {
                out.extend_from_slice(&b.to_le_bytes());
            }
        }
        return;
    }
    let v = to_u32(n);
    let bytes = v.to_le_bytes();
    if field.big_endian {
        for i in (0..field.size).rev() {
            out.push(bytes[i]);
        }
    } else {
        out.extend_from_slice(&bytes[..field.size]);
    }
}

fn struct_unpack(field: StructField, bytes: &[u8]) -> f64 {
    if field.float {
        return if field.size == 4 {
            let mut b = [0u8; 4];
            b.copy_from_slice(bytes);
            f32::from_bits(if field.big_endian {
                u32::from_be_bytes(b)
            } else {
                u32::from_le_bytes(b)
            }) as f64
        } else {
            let mut b = [0u8; 8];
            b.copy_from_slice(bytes);
            f64::from_bits(if field.big_endian {
                u64::from_be_bytes(b)
            } else {
                u64::from_le_bytes(b)
            })
        };
    }
    let mut v: u32 = 0;
    if field.big_endian {
        for &b in bytes {
            v = (v << 8) | b as u32;
        }
    } else {
        for (i, &b) in bytes.iter().enumerate() {
            v |= (b as u32) << (8 * i);
        }
    }
    if field.signed {
        let shift = 32 - field.size * 8;
        (((v << shift) as i32) >> shift) as f64
    } else {
        v as f64
    }
}

// ============================================================================
// UTF-8
// ============================================================================

/// Strict UTF-8 decode: overlong encodings, surrogates, and values above
/// U+10FFFF are rejected.
pub fn utf8_decode(bytes: &[u8]) -> Option<Vec<u32>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let (len, min, mut cp) = match b {
            0x00..=0x7F => (1, 0, b as u32),
            0xC0..=0xDF => (2, 0x80, (b & 0x1F) as u32),
            0xE0..=0xEF => (3, 0x800, (b & 0x0F) as u32),
            0xF0..=0xF7 => (4, 0x10000, (b & 0x07) as u32),
            _ => return None,
        };
        if i + len > bytes.len() {
            return None;
        }
        for &c in &bytes[i + 1..i + len] {
            if c & 0xC0 != 0x80 {
                return None;
            }
            cp = (cp << 6) | (c & 0x3F) as u32;
        }
        if cp < min || cp > 0x10FFFF || (0xD800..=0xDFFF).contains(&cp) {
            return None;
        }
        out.push(cp);
        i += len;
    }
    Some(out)
}

/// Encode code points; rejects surrogates and out-of-range values.
pub fn utf8_encode(cps: &[u32]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    for &cp in cps {
        if cp > 0x10FFFF || (0xD800..=0xDFFF).contains(&cp) {
            return None;
        }
        let c = char::from_u32(cp)?;
        let mut buf = [0u8; 4];
        out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    }
    Some(out)
}

// ============================================================================
// OP DISPATCH
// ============================================================================

/// Typed operand readers. Each failure becomes a runtime abort.
fn want_num(v: &Value) -> Result<f64, String> {
    match v {
        Value::Num(n) => Ok(*n),
        other => Err(format!("expecting number, found {}", other.type_name())),
    }
}

fn want_str(v: &Value) -> Result<std::rc::Rc<Vec<u8>>, String> {
    match v {
        Value::Str(s) => Ok(s.clone()),
        other => Err(format!("expecting string, found {}", other.type_name())),
    }
}

fn want_list(v: &Value) -> Result<crate::value::ListRef, String> {
    match v {
        Value::List(r) => Ok(*r),
        other => Err(format!("expecting list, found {}", other.type_name())),
    }
}

fn want_opt_num(v: &Value, dflt: f64) -> Result<f64, String> {
    match v {
        Value::Nil => Ok(dflt),
        other => want_num(other),
    }
}

impl Context {
    /// Flatten numbers and one level of lists for num.min/num.max.
    fn flat_nums(&self, args: &[Value]) -> Result<Vec<f64>, String> {
        let mut out = Vec::new();
        for v in args {
            match v {
                Value::Nil => {}
                Value::Num(n) => out.push(*n),
                Value::List(r) => {
                    for item in &self.arena.get(*r).items {
                        match item {
                            Value::Nil => {}
                            Value::Num(n) => out.push(*n),
                            other => {
                                return Err(format!(
                                    "expecting number, found {}",
                                    other.type_name()
                                ))
                            }
                        }
                    }
                }
                other => return Err(format!("expecting number, found {}", other.type_name())),
            }
        }
        Ok(out)
    }

    /// Apply a byte-string transform, mapping over lists of strings.
    fn str_map(
        &mut self,
        v: &Value,
        f: &dyn Fn(&[u8]) -> Vec<u8>,
        depth: u32,
    ) -> Result<Value, String> {
        if depth > 64 {
            return Err("list too deep".to_string());
        }
        match v {
            Value::Str(s) => Ok(Value::str(f(s))),
            Value::List(r) => {
                let items = self.arena.get(*r).items.clone();
                let mut out = Vec::with_capacity(items.len());
                for item in &items {
                    out.push(self.str_map(item, f, depth + 1)?);
                }
                Ok(Value::List(self.arena.alloc(out)))
            }
            other => Err(format!(
                "expecting string or list of strings, found {}",
                other.type_name()
            )),
        }
    }

    fn parse_fields(&self, types: &Value) -> Result<Vec<StructField>, String> {
        let r = want_list(types)?;
        let items = &self.arena.get(r).items;
        let mut fields = Vec::with_capacity(items.len());
        for item in items {
            let name = want_str(item)?;
            match struct_field(&name) {
                Some(f) => fields.push(f),
                None => {
                    return Err(format!(
                        "invalid struct field \"{}\"",
                        String::from_utf8_lossy(&name)
                    ))
                }
            }
        }
        if fields.is_empty() {
            return Err("expecting at least one struct field".to_string());
        }
        Ok(fields)
    }

    pub(crate) fn step_stdlib(&mut self, op: Op) -> Result<Option<RunResult>, String> {
        match op {
            // ================================================================
            // num
            // ================================================================
            Op::NumAbs
            | Op::NumSign
            | Op::NumFloor
            | Op::NumCeil
            | Op::NumRound
            | Op::NumTrunc
            | Op::NumSin
            | Op::NumCos
            | Op::NumTan
            | Op::NumAsin
            | Op::NumAcos
            | Op::NumAtan
            | Op::NumLog
            | Op::NumLog2
            | Op::NumLog10
            | Op::NumExp => {
                let dst = self.dv()?;
                let v = self.read()?;
                let f: &dyn Fn(f64) -> f64 = match op {
                    Op::NumAbs => &f64::abs,
                    Op::NumSign => &|n: f64| {
                        if n > 0.0 {
                            1.0
                        } else if n < 0.0 {
                            -1.0
                        } else {
                            n
                        }
                    },
                    Op::NumFloor => &f64::floor,
                    Op::NumCeil => &f64::ceil,
                    Op::NumRound => &|n: f64| (n + 0.5).floor(),
                    Op::NumTrunc => &f64::trunc,
                    Op::NumSin => &f64::sin,
                    Op::NumCos => &f64::cos,
                    Op::NumTan => &f64::tan,
                    Op::NumAsin => &f64::asin,
                    Op::NumAcos => &f64::acos,
                    Op::NumAtan => &f64::atan,
                    Op::NumLog => &f64::ln,
                    Op::NumLog2 => &f64::log2,
                    Op::NumLog10 => &f64::log10,
                    _ => &f64::exp,
                };
                let res = self.broadcast1(&v, f, 0)?;
                self.store(dst, res)?;
            }

            Op::NumNan => {
                let dst = self.dv()?;
                self.store(dst, Value::Num(f64::NAN))?;
            }
            Op::NumInf => {
                let dst = self.dv()?;
                self.store(dst, Value::Num(f64::INFINITY))?;
            }
            Op::NumIsNan => {
                let dst = self.dv()?;
                let n = want_num(&self.read()?)?;
                self.store(dst, Value::bool(n.is_nan()))?;
            }
            Op::NumIsFinite => {
                let dst = self.dv()?;
                let n = want_num(&self.read()?)?;
                self.store(dst, Value::bool(n.is_finite()))?;
            }
            Op::NumAtan2 => {
                let dst = self.dv()?;
                let a = self.read()?;
                let b = self.read()?;
                let res = self.broadcast2(&a, &b, &f64::atan2, 0)?;
                self.store(dst, res)?;
            }
            Op::NumLerp => {
                let dst = self.dv()?;
                let a = want_num(&self.read()?)?;
                let b = want_num(&self.read()?)?;
                let t = want_num(&self.read()?)?;
                self.store(dst, Value::Num(a + (b - a) * t))?;
            }
            Op::NumClamp => {
                let dst = self.dv()?;
                let n = want_num(&self.read()?)?;
                let lo = want_num(&self.read()?)?;
                let hi = want_num(&self.read()?)?;
                self.store(dst, Value::Num(n.max(lo).min(hi)))?;
            }
            Op::NumMax | Op::NumMin => {
                let dst = self.dv()?;
                let args = self.dargs()?;
                let nums = self.flat_nums(&args)?;
                let res = nums.into_iter().fold(f64::NAN, |acc, n| {
                    if acc.is_nan() {
                        n
                    } else if op == Op::NumMax {
                        acc.max(n)
                    } else {
                        acc.min(n)
                    }
                });
                self.store(dst, Value::Num(res))?;
            }
            Op::NumHex | Op::NumOct | Op::NumBin => {
                let dst = self.dv()?;
                let n = to_u32(want_num(&self.read()?)?);
                let digits = want_opt_num(&self.read()?, 0.0)? as usize;
                let body = match op {
                    Op::NumHex => format!("{:X}", n),
                    Op::NumOct => format!("{:o}", n),
                    _ => format!("{:b}", n),
                };
                let prefix = match op {
                    Op::NumHex => "0x",
                    Op::NumOct => "0c",
                    _ => "0b",
                };
                let padded = if body.len() < digits {
                    format!("{}{}{}", prefix, "0".repeat(digits - body.len()), body)
                } else {
                    format!("{}{}", prefix, body)
                };
                self.store(dst, Value::str(padded.into_bytes()))?;
            }

            // ================================================================
            // int (32-bit wrapping)
            // ================================================================
            Op::IntNew => {
                let dst = self.dv()?;
                let n = want_num(&self.read()?)?;
                self.store(dst, Value::Num(to_u32(n) as f64))?;
            }
            Op::IntNot => {
                let dst = self.dv()?;
                let n = to_u32(want_num(&self.read()?)?);
                self.store(dst, Value::Num((!n) as f64))?;
            }
            Op::IntAnd | Op::IntOr | Op::IntXor => {
                let dst = self.dv()?;
                let args = self.dargs()?;
                let mut acc = match op {
                    Op::IntAnd => 0xFFFF_FFFFu32,
                    _ => 0,
                };
                for v in &args {
                    let n = to_u32(want_num(v)?);
                    acc = match op {
                        Op::IntAnd => acc & n,
                        Op::IntOr => acc | n,
                        _ => acc ^ n,
                    };
                }
                self.store(dst, Value::Num(acc as f64))?;
            }
            Op::IntShl | Op::IntShr | Op::IntSar => {
                let dst = self.dv()?;
                let a = to_u32(want_num(&self.read()?)?);
                let b = to_u32(want_num(&self.read()?)?) & 31;
                let res = match op {
                    Op::IntShl => a.wrapping_shl(b),
                    Op::IntShr => a.wrapping_shr(b),
                    _ => ((a as i32) >> b) as u32,
                };
                self.store(dst, Value::Num(res as f64))?;
            }
            Op::IntAdd | Op::IntSub | Op::IntMul => {
                let dst = self.dv()?;
                let a = to_u32(want_num(&self.read()?)?);
                let b = to_u32(want_num(&self.read()?)?);
                let res = match op {
                    Op::IntAdd => a.wrapping_add(b),
                    Op::IntSub => a.wrapping_sub(b),
                    _ => a.wrapping_mul(b),
                };
                self.store(dst, Value::Num(res as f64))?;
            }
            Op::IntDiv | Op::IntMod => {
                let dst = self.dv()?;
                let a = to_u32(want_num(&self.read()?)?);
                let b = to_u32(want_num(&self.read()?)?);
                // Integer division by zero yields zero, deliberately.
                let res = if b == 0 {
                    0
                } else if op == Op::IntDiv {
                    a / b
                } else {
                    a % b
                };
                self.store(dst, Value::Num(res as f64))?;
            }
            Op::IntClz => {
                let dst = self.dv()?;
                let n = to_u32(want_num(&self.read()?)?);
                self.store(dst, Value::Num(n.leading_zeros() as f64))?;
            }
            Op::IntPop => {
                let dst = self.dv()?;
                let n = to_u32(want_num(&self.read()?)?);
                self.store(dst, Value::Num(n.count_ones() as f64))?;
            }
            Op::IntBswap => {
                let dst = self.dv()?;
                let n = to_u32(want_num(&self.read()?)?);
                self.store(dst, Value::Num(n.swap_bytes() as f64))?;
            }

            // ================================================================
            // rand
            // ================================================================
            Op::RandSeed => {
                let dst = self.dv()?;
                let n = want_num(&self.read()?)?;
                self.rand.seed(to_u32(n));
                self.store(dst, Value::Nil)?;
            }
            Op::RandSeedAuto => {
                let dst = self.dv()?;
                let nanos = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.subsec_nanos() ^ d.as_secs() as u32)
                    .unwrap_or(0x9E3779B9);
                self.rand.seed(nanos);
                self.store(dst, Value::Nil)?;
            }
            Op::RandInt => {
                let dst = self.dv()?;
                let n = self.rand.int();
                self.store(dst, Value::Num(n as f64))?;
            }
            Op::RandNum => {
                let dst = self.dv()?;
                let n = self.rand.num();
                self.store(dst, Value::Num(n))?;
            }
            Op::RandRange => {
                let dst = self.dv()?;
                let a = self.read()?;
                let b = self.read()?;
                let c = self.read()?;
                let (start, stop) = match (&a, &b) {
                    (Value::Num(x), Value::Nil) => (0.0, *x),
                    (Value::Num(x), Value::Num(y)) => (*x, *y),
                    _ => return Err("expecting number for rand.range".to_string()),
                };
                let step = want_opt_num(&c, 1.0)?;
                if step == 0.0 {
                    return Err("rand.range step cannot be 0".to_string());
                }
                let count = ((stop - start) / step).ceil();
                let res = if count <= 0.0 {
                    Value::Nil
                } else {
                    let k = self.rand.int() as f64 % count;
                    Value::Num(start + step * k.floor())
                };
                self.store(dst, res)?;
            }
            Op::RandGetState => {
                let dst = self.dv()?;
                let r = self.arena.alloc(vec![
                    Value::Num(self.rand.seed as f64),
                    Value::Num(self.rand.i as f64),
                ]);
                self.store(dst, Value::List(r))?;
            }
            Op::RandSetState => {
                let dst = self.dv()?;
                let v = self.read()?;
                let r = want_list(&v)?;
                let items = self.arena.get(r).items.clone();
                match items.as_slice() {
                    [Value::Num(seed), Value::Num(i)] => {
                        self.rand.seed = to_u32(*seed);
                        self.rand.i = to_u32(*i);
                    }
                    _ => return Err("expecting {seed, i} for rand.setstate".to_string()),
                }
                self.store(dst, Value::Nil)?;
            }
            Op::RandPick => {
                let dst = self.dv()?;
                let v = self.read()?;
                let r = want_list(&v)?;
                let len = self.arena.get(r).items.len();
                let res = if len == 0 {
                    Value::Nil
                } else {
                    let k = self.rand.int() as usize % len;
                    self.arena.get(r).items[k].clone()
                };
                self.store(dst, res)?;
            }
            Op::RandShuffle => {
                let dst = self.dv()?;
                let v = self.read()?;
                let r = want_list(&v)?;
                let len = self.arena.get(r).items.len();
                for i in (1..len).rev() {
                    let j = self.rand.int() as usize % (i + 1);
                    self.arena.get_mut(r).items.swap(i, j);
                }
                self.store(dst, v)?;
            }

            // ================================================================
            // str
            // ================================================================
            Op::StrNew => {
                let dst = self.dv()?;
                let args = self.dargs()?;
                let text = self.format_args(&args);
                self.store(dst, Value::str(text))?;
            }
            Op::StrSplit => {
                let dst = self.dv()?;
                let s = want_str(&self.read()?)?;
                let sep = want_str(&self.read()?)?;
                let parts: Vec<Value> = if sep.is_empty() {
                    s.iter().map(|&b| Value::str(vec![b])).collect()
                } else {
                    split_bytes(&s, &sep)
                        .into_iter()
                        .map(Value::str)
                        .collect()
                };
                let r = self.arena.alloc(parts);
                self.store(dst, Value::List(r))?;
            }
            Op::StrReplace => {
                let dst = self.dv()?;
                let s = want_str(&self.read()?)?;
                let find = want_str(&self.read()?)?;
                let repl = want_str(&self.read()?)?;
                let res = if find.is_empty() {
                    s.as_ref().clone()
                } else {
                    let mut out = Vec::new();
                    let mut i = 0;
                    while i < s.len() {
                        if s[i..].starts_with(&find[..]) {
                            out.extend_from_slice(&repl);
                            i += find.len();
                        } else {
                            out.push(s[i]);
                            i += 1;
                        }
                    }
                    out
                };
                self.store(dst, Value::str(res))?;
            }
            Op::StrBegins | Op::StrEnds => {
                let dst = self.dv()?;
                let s = want_str(&self.read()?)?;
                let probe = want_str(&self.read()?)?;
                let b = if op == Op::StrBegins {
                    s.starts_with(&probe[..])
                } else {
                    s.ends_with(&probe[..])
                };
                self.store(dst, Value::bool(b))?;
            }
            Op::StrPad => {
                let dst = self.dv()?;
                let s = want_str(&self.read()?)?;
                let amt = want_num(&self.read()?)? as i64;
                let width = amt.unsigned_abs() as usize;
                let mut out = Vec::new();
                if s.len() >= width {
                    out.extend_from_slice(&s);
                } else if amt >= 0 {
                    out.extend_from_slice(&s);
                    out.resize(width, b' ');
                } else {
                    out.resize(width - s.len(), b' ');
                    out.extend_from_slice(&s);
                }
                self.store(dst, Value::str(out))?;
            }
            Op::StrFind | Op::StrRFind => {
                let dst = self.dv()?;
                let s = want_str(&self.read()?)?;
                let needle = want_str(&self.read()?)?;
                let start = self.read()?;
                let res = if op == Op::StrFind {
                    let from = want_opt_num(&start, 0.0)?.max(0.0) as usize;
                    find_bytes(&s, &needle, from)
                } else {
                    let from = match &start {
                        Value::Nil => s.len(),
                        other => want_num(other)?.max(0.0) as usize,
                    };
                    rfind_bytes(&s, &needle, from)
                };
                self.store(dst, res.map(|i| Value::Num(i as f64)).unwrap_or(Value::Nil))?;
            }
            Op::StrLower | Op::StrUpper | Op::StrTrim | Op::StrRev => {
                let dst = self.dv()?;
                let v = self.read()?;
                let f: &dyn Fn(&[u8]) -> Vec<u8> = match op {
                    Op::StrLower => &|s| s.to_ascii_lowercase(),
                    Op::StrUpper => &|s| s.to_ascii_uppercase(),
                    Op::StrTrim => &|s| {
                        let start = s.iter().position(|b| !b.is_ascii_whitespace());
                        match start {
                            None => Vec::new(),
                            Some(start) => {
                                let end = s.iter().rposition(|b| !b.is_ascii_whitespace()).unwrap();
                                s[start..=end].to_vec()
                            }
                        }
                    },
                    _ => &|s| s.iter().rev().copied().collect(),
                };
                let res = self.str_map(&v, f, 0)?;
                self.store(dst, res)?;
            }
            Op::StrRep => {
                let dst = self.dv()?;
                let s = want_str(&self.read()?)?;
                let count = want_num(&self.read()?)?.max(0.0) as usize;
                if s.len().saturating_mul(count) > 100_000_000 {
                    return Err("string too large".to_string());
                }
                let mut out = Vec::with_capacity(s.len() * count);
                for _ in 0..count {
                    out.extend_from_slice(&s);
                }
                self.store(dst, Value::str(out))?;
            }
            Op::StrList => {
                let dst = self.dv()?;
                let s = want_str(&self.read()?)?;
                let items: Vec<Value> = s.iter().map(|&b| Value::Num(b as f64)).collect();
                let r = self.arena.alloc(items);
                self.store(dst, Value::List(r))?;
            }
            Op::StrByte => {
                let dst = self.dv()?;
                let s = want_str(&self.read()?)?;
                let i = want_opt_num(&self.read()?, 0.0)? as i64;
                let i = if i < 0 { i + s.len() as i64 } else { i };
                let res = if i < 0 || i as usize >= s.len() {
                    Value::Nil
                } else {
                    Value::Num(s[i as usize] as f64)
                };
                self.store(dst, res)?;
            }
            Op::StrHash => {
                let dst = self.dv()?;
                let s = want_str(&self.read()?)?;
                let seed = want_opt_num(&self.read()?, 0.0)?;
                let r = hash_list(&mut self.arena, &s, seed as u64);
                self.store(dst, Value::List(r))?;
            }

            // ================================================================
            // utf8
            // ================================================================
            Op::Utf8Valid => {
                let dst = self.dv()?;
                let s = want_str(&self.read()?)?;
                self.store(dst, Value::bool(utf8_decode(&s).is_some()))?;
            }
            Op::Utf8List => {
                let dst = self.dv()?;
                let s = want_str(&self.read()?)?;
                let cps = utf8_decode(&s).ok_or("invalid UTF-8 string")?;
                let items: Vec<Value> = cps.into_iter().map(|c| Value::Num(c as f64)).collect();
                let r = self.arena.alloc(items);
                self.store(dst, Value::List(r))?;
            }
            Op::Utf8Str => {
                let dst = self.dv()?;
                let v = self.read()?;
                let r = want_list(&v)?;
                let items = self.arena.get(r).items.clone();
                let mut cps = Vec::with_capacity(items.len());
                for item in &items {
                    cps.push(want_num(item)? as u32);
                }
                let bytes = utf8_encode(&cps).ok_or("invalid code point")?;
                self.store(dst, Value::str(bytes))?;
            }

            // ================================================================
            // struct
            // ================================================================
            Op::StructSize => {
                let dst = self.dv()?;
                let types = self.read()?;
                let fields = self.parse_fields(&types)?;
                let size: usize = fields.iter().map(|f| f.size).sum();
                self.store(dst, Value::Num(size as f64))?;
            }
            Op::StructStr => {
                let dst = self.dv()?;
                let values = self.read()?;
                let types = self.read()?;
                let fields = self.parse_fields(&types)?;
                let vr = want_list(&values)?;
                let items = self.arena.get(vr).items.clone();
                if items.len() % fields.len() != 0 {
                    return Err("struct values do not fill the fields".to_string());
                }
                let mut out = Vec::new();
                for (i, item) in items.iter().enumerate() {
                    let n = want_num(item)?;
                    struct_pack(fields[i % fields.len()], n, &mut out);
                }
                self.store(dst, Value::str(out))?;
            }
            Op::StructList => {
                let dst = self.dv()?;
                let s = want_str(&self.read()?)?;
                let types = self.read()?;
                let fields = self.parse_fields(&types)?;
                let stride: usize = fields.iter().map(|f| f.size).sum();
                if stride == 0 || s.len() % stride != 0 {
                    return Err("string does not fit the struct".to_string());
                }
                let mut items = Vec::new();
                let mut at = 0;
                while at < s.len() {
                    for f in &fields {
                        items.push(Value::Num(struct_unpack(*f, &s[at..at + f.size])));
                        at += f.size;
                    }
                }
                let r = self.arena.alloc(items);
                self.store(dst, Value::List(r))?;
            }
            Op::StructIsLE => {
                let dst = self.dv()?;
                self.store(dst, Value::bool(true))?;
            }

            // ================================================================
            // list
            // ================================================================
            Op::ListNew => {
                let dst = self.dv()?;
                let size = want_opt_num(&self.read()?, 0.0)?.max(0.0) as usize;
                let init = self.read()?;
                if size > 10_000_000 {
                    return Err("list too large".to_string());
                }
                let r = self.arena.alloc(vec![init; size]);
                self.store(dst, Value::List(r))?;
            }
            Op::ListShift | Op::ListPop => {
                let dst = self.dv()?;
                let v = self.read()?;
                let r = want_list(&v)?;
                let items = &mut self.arena.get_mut(r).items;
                let res = if items.is_empty() {
                    Value::Nil
                } else if op == Op::ListShift {
                    items.remove(0)
                } else {
                    items.pop().unwrap()
                };
                self.store(dst, res)?;
            }
            Op::ListPush | Op::ListUnshift => {
                let dst = self.dv()?;
                let v = self.read()?;
                let item = self.read()?;
                let r = want_list(&v)?;
                let items = &mut self.arena.get_mut(r).items;
                if op == Op::ListPush {
                    items.push(item);
                } else {
                    items.insert(0, item);
                }
                self.store(dst, v)?;
            }
            Op::ListAppend | Op::ListPrepend => {
                let dst = self.dv()?;
                let a = self.read()?;
                let b = self.read()?;
                let ar = want_list(&a)?;
                let br = want_list(&b)?;
                let extra = self.arena.get(br).items.clone();
                let items = &mut self.arena.get_mut(ar).items;
                if op == Op::ListAppend {
                    items.extend(extra);
                } else {
                    items.splice(0..0, extra);
                }
                self.store(dst, a)?;
            }
            Op::ListFind | Op::ListRFind => {
                let dst = self.dv()?;
                let v = self.read()?;
                let probe = self.read()?;
                let start = self.read()?;
                let r = want_list(&v)?;
                let items = self.arena.get(r).items.clone();
                let res = if op == Op::ListFind {
                    let from = want_opt_num(&start, 0.0)?.max(0.0) as usize;
                    items
                        .iter()
                        .enumerate()
                        .skip(from)
                        .find(|(_, x)| x.equals(&probe))
                        .map(|(i, _)| i)
                } else {
                    let from = match &start {
                        Value::Nil => items.len(),
                        other => (want_num(other)?.max(0.0) as usize).min(items.len()),
                    };
                    items[..from.min(items.len())]
                        .iter()
                        .rposition(|x| x.equals(&probe))
                };
                self.store(dst, res.map(|i| Value::Num(i as f64)).unwrap_or(Value::Nil))?;
            }
            Op::ListJoin => {
                let dst = self.dv()?;
                let v = self.read()?;
                let sep = self.read()?;
                let r = want_list(&v)?;
                let sep = match &sep {
                    Value::Nil => Vec::new(),
                    other => tostr(&self.arena, other),
                };
                let items = self.arena.get(r).items.clone();
                let mut out = Vec::new();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.extend_from_slice(&sep);
                    }
                    out.extend(tostr(&self.arena, item));
                }
                self.store(dst, Value::str(out))?;
            }
            Op::ListRev => {
                let dst = self.dv()?;
                let v = self.read()?;
                let r = want_list(&v)?;
                self.arena.get_mut(r).items.reverse();
                self.store(dst, v)?;
            }
            Op::ListStr => {
                let dst = self.dv()?;
                let v = self.read()?;
                let r = want_list(&v)?;
                let items = self.arena.get(r).items.clone();
                let mut out = Vec::with_capacity(items.len());
                for item in &items {
                    out.push((to_u32(want_num(item)?) & 0xFF) as u8);
                }
                self.store(dst, Value::str(out))?;
            }
            Op::ListSort | Op::ListRSort => {
                let dst = self.dv()?;
                let v = self.read()?;
                let r = want_list(&v)?;
                let mut items = self.arena.get(r).items.clone();
                let mut err: Option<String> = None;
                items.sort_by(|a, b| {
                    if err.is_some() {
                        return Ordering::Equal;
                    }
                    match order(&self.arena, a, b) {
                        Ok(o) => {
                            if op == Op::ListSort {
                                o
                            } else {
                                o.reverse()
                            }
                        }
                        Err(e) => {
                            err = Some(e);
                            Ordering::Equal
                        }
                    }
                });
                if let Some(e) = err {
                    return Err(e);
                }
                self.arena.get_mut(r).items = items;
                self.store(dst, v)?;
            }

            // ================================================================
            // pickle
            // ================================================================
            Op::PickleJson => {
                let dst = self.dv()?;
                let v = self.read()?;
                let bytes = pickle::json(&self.arena, &v)?;
                self.store(dst, Value::str(bytes))?;
            }
            Op::PickleBin => {
                let dst = self.dv()?;
                let v = self.read()?;
                let bytes = pickle::bin(&self.arena, &v)?;
                self.store(dst, Value::str(bytes))?;
            }
            Op::PickleVal => {
                let dst = self.dv()?;
                let s = want_str(&self.read()?)?;
                let res = pickle::val(&mut self.arena, &s).unwrap_or(Value::Nil);
                self.store(dst, res)?;
            }
            Op::PickleValid => {
                let dst = self.dv()?;
                let s = want_str(&self.read()?)?;
                let res = pickle::valid(&s)
                    .map(|n| Value::Num(n as f64))
                    .unwrap_or(Value::Nil);
                self.store(dst, res)?;
            }
            Op::PickleSibling => {
                let dst = self.dv()?;
                let v = self.read()?;
                self.store(dst, Value::bool(pickle::sibling(&self.arena, &v)))?;
            }
            Op::PickleCircular => {
                let dst = self.dv()?;
                let v = self.read()?;
                self.store(dst, Value::bool(pickle::circular(&self.arena, &v)))?;
            }
            Op::PickleCopy => {
                let dst = self.dv()?;
                let v = self.read()?;
                let res = pickle::copy(&mut self.arena, &v)?;
                self.store(dst, res)?;
            }

            other => return Err(format!("unhandled opcode {:?}", other)),
        }
        Ok(None)
    }
}

fn split_bytes(s: &[u8], sep: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + sep.len() <= s.len() {
        if &s[i..i + sep.len()] == sep {
            out.push(s[start..i].to_vec());
            i += sep.len();
            start = i;
        } else {
            i += 1;
        }
    }
    out.push(s[start..].to_vec());
    out
}

fn find_bytes(s: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(from.min(s.len()));
    }
    if needle.len() > s.len() {
        return None;
    }
    (from..=s.len() - needle.len()).find(|&i| &s[i..i + needle.len()] == needle)
}

fn rfind_bytes(s: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(from.min(s.len()));
    }
    if needle.len() > s.len() {
        return None;
    }
    let last = from.min(s.len() - needle.len());
    (0..=last).rev().find(|&i| &s[i..i + needle.len()] == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_num_bases() {
        assert_eq!(parse_num(b"42"), Some(42.0));
        assert_eq!(parse_num(b"-1.5"), Some(-1.5));
        assert_eq!(parse_num(b"0xFF"), Some(255.0));
        assert_eq!(parse_num(b"0b101"), Some(5.0));
        assert_eq!(parse_num(b"0c10"), Some(8.0));
        assert_eq!(parse_num(b"  7 "), Some(7.0));
        assert_eq!(parse_num(b"abc"), None);
        assert_eq!(parse_num(b""), None);
    }

    #[test]
    fn test_to_u32_wraps() {
        assert_eq!(to_u32(-1.0), 0xFFFF_FFFF);
        assert_eq!(to_u32(4_294_967_296.0), 0);
        assert_eq!(to_u32(255.0), 255);
    }

    #[test]
    fn test_struct_field_parse() {
        assert_eq!(
            struct_field(b"U8"),
            Some(StructField {
                size: 1,
                signed: false,
                float: false,
                big_endian: false
            })
        );
        assert_eq!(struct_field(b"UB16").unwrap().big_endian, true);
        assert_eq!(struct_field(b"SL32").unwrap().signed, true);
        assert_eq!(struct_field(b"FL64").unwrap().size, 8);
        assert_eq!(struct_field(b"X8"), None);
        assert_eq!(struct_field(b"U64"), None);
    }

    #[test]
    fn test_struct_pack_unpack() {
        let f = struct_field(b"UB16").unwrap();
        let mut out = Vec::new();
        struct_pack(f, 0x1234 as f64, &mut out);
        assert_eq!(out, vec![0x12, 0x34]);
        assert_eq!(struct_unpack(f, &out), 0x1234 as f64);

        let f = struct_field(b"S8").unwrap();
        let mut out = Vec::new();
        struct_pack(f, -1.0, &mut out);
        assert_eq!(out, vec![0xFF]);
        assert_eq!(struct_unpack(f, &out), -1.0);
    }

    #[test]
    fn test_utf8_valid_rules() {
        assert!(utf8_decode(b"hello").is_some());
        assert!(utf8_decode("héllo".as_bytes()).is_some());
        // Overlong encoding of '/' is rejected.
        assert!(utf8_decode(&[0xC0, 0xAF]).is_none());
        // Surrogate half is rejected.
        assert!(utf8_decode(&[0xED, 0xA0, 0x80]).is_none());
        // Truncated sequence.
        assert!(utf8_decode(&[0xE2, 0x82]).is_none());
    }

    #[test]
    fn test_utf8_round_trip() {
        let text = "wisp \u{1F300}";
        let cps = utf8_decode(text.as_bytes()).unwrap();
        assert_eq!(utf8_encode(&cps).unwrap(), text.as_bytes());
        assert!(utf8_encode(&[0xD800]).is_none());
    }

    #[test]
    fn test_split_and_find() {
        assert_eq!(
            split_bytes(b"a,b,,c", b","),
            vec![b"a".to_vec(), b"b".to_vec(), b"".to_vec(), b"c".to_vec()]
        );
        assert_eq!(find_bytes(b"hello", b"ll", 0), Some(2));
        assert_eq!(find_bytes(b"hello", b"ll", 3), None);
        assert_eq!(rfind_bytes(b"ababab", b"ab", 6), Some(4));
    }
}
