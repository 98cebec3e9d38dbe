//! Value pickling: JSON text and a compact binary form.
//!
//! JSON covers the nil/number/string/list subset (no objects, no
//! booleans); serializing a cyclic graph is an error. The binary form
//! tags every node and writes shared lists as back-references, so sibling
//! and cyclic structure survive a round trip.
//!
//! # Binary layout
//!
//! ```text
//! 01                      version
//! F0                      nil
//! F1 <8 bytes LE>         number (double)
//! F2 <varint>             non-negative integer
//! F3 <varint>             negative integer (absolute value)
//! F4 <varint> <bytes>     string
//! F5 <varint> <items>     list (assigned the next back-ref index)
//! F6 <varint>             back-reference to an earlier list
//! ```
//!
//! Varints are 1 byte for values under 128, else 4 bytes with the top bit
//! of the first byte set and the remaining 31 bits big-endian.

use crate::value::{ListArena, ListRef, Value};
use wisp_util::{FxHashMap, FxHashSet};

const VERSION: u8 = 0x01;
const T_NIL: u8 = 0xF0;
const T_NUM: u8 = 0xF1;
const T_POS: u8 = 0xF2;
const T_NEG: u8 = 0xF3;
const T_STR: u8 = 0xF4;
const T_LIST: u8 = 0xF5;
const T_REF: u8 = 0xF6;

fn write_varint(out: &mut Vec<u8>, v: u32) {
    if v < 128 {
        out.push(v as u8);
    } else {
        out.push(0x80 | ((v >> 24) as u8 & 0x7F));
        out.push((v >> 16) as u8);
        out.push((v >> 8) as u8);
        out.push(v as u8);
    }
}

fn read_varint(bytes: &[u8], at: &mut usize) -> Option<u32> {
    let first = *bytes.get(*at)?;
    if first < 128 {
        *at += 1;
        return Some(first as u32);
    }
    if *at + 4 > bytes.len() {
        return None;
    }
    let v = ((first as u32 & 0x7F) << 24)
        | ((bytes[*at + 1] as u32) << 16)
        | ((bytes[*at + 2] as u32) << 8)
        | bytes[*at + 3] as u32;
    *at += 4;
    Some(v)
}

// ============================================================================
// JSON
// ============================================================================

/// Serialize to strict JSON. Cyclic graphs and user-typed lists error.
pub fn json(arena: &ListArena, v: &Value) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    let mut on_path = FxHashSet::default();
    json_value(arena, v, &mut on_path, &mut out)?;
    Ok(out)
}

fn json_value(
    arena: &ListArena,
    v: &Value,
    on_path: &mut FxHashSet<u32>,
    out: &mut Vec<u8>,
) -> Result<(), String> {
    match v {
        Value::Nil => out.extend_from_slice(b"null"),
        Value::Num(n) => {
            if n.is_finite() {
                if n.fract() == 0.0 && n.abs() < 1e17 {
                    out.extend_from_slice(format!("{}", *n as i64).as_bytes());
                } else {
                    out.extend_from_slice(format!("{}", n).as_bytes());
                }
            } else {
                out.extend_from_slice(b"null");
            }
        }
        Value::Str(s) => {
            out.push(b'"');
            for &b in s.iter() {
                match b {
                    b'"' => out.extend_from_slice(b"\\\""),
                    b'\\' => out.extend_from_slice(b"\\\\"),
                    0x08 => out.extend_from_slice(b"\\b"),
                    0x09 => out.extend_from_slice(b"\\t"),
                    0x0A => out.extend_from_slice(b"\\n"),
                    0x0C => out.extend_from_slice(b"\\f"),
                    0x0D => out.extend_from_slice(b"\\r"),
                    b if b < 0x20 || b >= 0x7F => {
                        out.extend_from_slice(format!("\\u{:04x}", b).as_bytes());
                    }
                    b => out.push(b),
                }
            }
            out.push(b'"');
        }
        Value::List(r) => {
            let cell = arena.get(*r);
            if cell.user.is_some() {
                return Err("cannot pickle a user type".to_string());
            }
            if !on_path.insert(r.0) {
                return Err("circular".to_string());
            }
            out.push(b'[');
            let items = cell.items.clone();
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                json_value(arena, item, on_path, out)?;
            }
            out.push(b']');
            on_path.remove(&r.0);
        }
    }
    Ok(())
}

struct JsonParser<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> JsonParser<'a> {
    fn ws(&mut self) {
        while matches!(self.bytes.get(self.at), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.at += 1;
        }
    }

    fn value(&mut self, arena: &mut ListArena) -> Option<Value> {
        self.ws();
        match *self.bytes.get(self.at)? {
            b'n' => {
                if self.bytes[self.at..].starts_with(b"null") {
                    self.at += 4;
                    Some(Value::Nil)
                } else {
                    None
                }
            }
            b'[' => {
                self.at += 1;
                let r = arena.alloc(Vec::new());
                self.ws();
                if self.bytes.get(self.at) == Some(&b']') {
                    self.at += 1;
                    return Some(Value::List(r));
                }
                loop {
                    let item = self.value(arena)?;
                    arena.get_mut(r).items.push(item);
                    self.ws();
                    match self.bytes.get(self.at)? {
                        b',' => self.at += 1,
                        b']' => {
                            self.at += 1;
                            return Some(Value::List(r));
                        }
                        _ => return None,
                    }
                }
            }
            b'"' => self.string().map(Value::str),
            _ => self.number().map(Value::Num),
        }
    }

    fn string(&mut self) -> Option<Vec<u8>> {
        if self.bytes.get(self.at) != Some(&b'"') {
            return None;
        }
        self.at += 1;
        let mut out = Vec::new();
        loop {
            match *self.bytes.get(self.at)? {
                b'"' => {
                    self.at += 1;
                    return Some(out);
                }
                b'\\' => {
                    self.at += 1;
                    match *self.bytes.get(self.at)? {
                        b'"' => out.push(b'"'),
                        b'\\' => out.push(b'\\'),
                        b'/' => out.push(b'/'),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0C),
                        b'n' => out.push(0x0A),
                        b'r' => out.push(0x0D),
                        b't' => out.push(0x09),
                        b'u' => {
                            if self.at + 4 >= self.bytes.len() {
                                return None;
                            }
                            let hex =
                                std::str::from_utf8(&self.bytes[self.at + 1..self.at + 5]).ok()?;
                            let cp = u32::from_str_radix(hex, 16).ok()?;
                            self.at += 4;
                            if cp < 0x100 {
                                out.push(cp as u8);
                            } else {
                                let c = char::from_u32(cp)?;
                                let mut buf = [0u8; 4];
                                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                            }
                        }
                        _ => return None,
                    }
                    self.at += 1;
                }
                b if b < 0x20 => return None,
                b => {
                    out.push(b);
                    self.at += 1;
                }
            }
        }
    }

    fn number(&mut self) -> Option<f64> {
        let start = self.at;
        if self.bytes.get(self.at) == Some(&b'-') {
            self.at += 1;
        }
        while matches!(self.bytes.get(self.at), Some(b'0'..=b'9')) {
            self.at += 1;
        }
        if self.bytes.get(self.at) == Some(&b'.') {
            self.at += 1;
            while matches!(self.bytes.get(self.at), Some(b'0'..=b'9')) {
                self.at += 1;
            }
        }
        if matches!(self.bytes.get(self.at), Some(b'e' | b'E')) {
            self.at += 1;
            if matches!(self.bytes.get(self.at), Some(b'+' | b'-')) {
                self.at += 1;
            }
            while matches!(self.bytes.get(self.at), Some(b'0'..=b'9')) {
                self.at += 1;
            }
        }
        if self.at == start {
            return None;
        }
        std::str::from_utf8(&self.bytes[start..self.at])
            .ok()?
            .parse()
            .ok()
    }
}

// ============================================================================
// BINARY
// ============================================================================

/// Serialize to the binary form. Shared and cyclic lists become
/// back-references, so this never loops.
pub fn bin(arena: &ListArena, v: &Value) -> Result<Vec<u8>, String> {
    let mut out = vec![VERSION];
    let mut indices: FxHashMap<u32, u32> = FxHashMap::default();
    bin_value(arena, v, &mut indices, &mut out)?;
    Ok(out)
}

fn bin_value(
    arena: &ListArena,
    v: &Value,
    indices: &mut FxHashMap<u32, u32>,
    out: &mut Vec<u8>,
) -> Result<(), String> {
    match v {
        Value::Nil => out.push(T_NIL),
        Value::Num(n) => {
            if n.fract() == 0.0 && n.abs() < 2_147_483_648.0 && (*n != 0.0 || !n.is_sign_negative())
            {
                if *n >= 0.0 {
                    out.push(T_POS);
                    write_varint(out, *n as u32);
                } else {
                    out.push(T_NEG);
                    write_varint(out, (-*n) as u32);
                }
            } else {
                out.push(T_NUM);
                out.extend_from_slice(&n.to_le_bytes());
            }
        }
        Value::Str(s) => {
            out.push(T_STR);
            write_varint(out, s.len() as u32);
            out.extend_from_slice(s);
        }
        Value::List(r) => {
            if arena.get(*r).user.is_some() {
                return Err("cannot pickle a user type".to_string());
            }
            if let Some(&idx) = indices.get(&r.0) {
                out.push(T_REF);
                write_varint(out, idx);
                return Ok(());
            }
            let idx = indices.len() as u32;
            indices.insert(r.0, idx);
            let items = arena.get(*r).items.clone();
            out.push(T_LIST);
            write_varint(out, items.len() as u32);
            for item in &items {
                bin_value(arena, item, indices, out)?;
            }
        }
    }
    Ok(())
}

fn bin_parse(arena: &mut ListArena, bytes: &[u8], at: &mut usize, lists: &mut Vec<ListRef>) -> Option<Value> {
    let tag = *bytes.get(*at)?;
    *at += 1;
    match tag {
        T_NIL => Some(Value::Nil),
        T_NUM => {
            if *at + 8 > bytes.len() {
                return None;
            }
            let n = f64::from_le_bytes(bytes[*at..*at + 8].try_into().unwrap());
            *at += 8;
            Some(Value::Num(n))
        }
        T_POS => Some(Value::Num(read_varint(bytes, at)? as f64)),
        T_NEG => Some(Value::Num(-(read_varint(bytes, at)? as f64))),
        T_STR => {
            let len = read_varint(bytes, at)? as usize;
            if *at + len > bytes.len() {
                return None;
            }
            let s = bytes[*at..*at + len].to_vec();
            *at += len;
            Some(Value::str(s))
        }
        T_LIST => {
            let count = read_varint(bytes, at)? as usize;
            let r = arena.alloc(Vec::new());
            lists.push(r);
            for _ in 0..count {
                let item = bin_parse(arena, bytes, at, lists)?;
                arena.get_mut(r).items.push(item);
            }
            Some(Value::List(r))
        }
        T_REF => {
            let idx = read_varint(bytes, at)? as usize;
            lists.get(idx).map(|r| Value::List(*r))
        }
        _ => None,
    }
}

/// Deserialize either format, detected by the leading version byte.
/// Returns `None` for malformed input.
pub fn val(arena: &mut ListArena, bytes: &[u8]) -> Option<Value> {
    if bytes.first() == Some(&VERSION) {
        let mut at = 1;
        let mut lists = Vec::new();
        let v = bin_parse(arena, bytes, &mut at, &mut lists)?;
        if at != bytes.len() {
            return None;
        }
        return Some(v);
    }
    let mut p = JsonParser { bytes, at: 0 };
    let v = p.value(arena)?;
    p.ws();
    if p.at != bytes.len() {
        return None;
    }
    Some(v)
}

/// Check validity without building values: 1 for JSON, 2 for binary,
/// `None` for malformed input.
pub fn valid(bytes: &[u8]) -> Option<u8> {
    let mut scratch = ListArena::new();
    if bytes.first() == Some(&VERSION) {
        val(&mut scratch, bytes).map(|_| 2)
    } else {
        val(&mut scratch, bytes).map(|_| 1)
    }
}

// ============================================================================
// STRUCTURE QUERIES
// ============================================================================

/// True if the graph shares any list between two reachable positions
/// (including through a cycle).
pub fn sibling(arena: &ListArena, v: &Value) -> bool {
    fn go(arena: &ListArena, v: &Value, seen: &mut FxHashSet<u32>) -> bool {
        if let Value::List(r) = v {
            if !seen.insert(r.0) {
                return true;
            }
            let items = arena.get(*r).items.clone();
            for item in &items {
                if go(arena, item, seen) {
                    return true;
                }
            }
        }
        false
    }
    let mut seen = FxHashSet::default();
    go(arena, v, &mut seen)
}

/// True if any list is reachable from itself.
pub fn circular(arena: &ListArena, v: &Value) -> bool {
    fn go(
        arena: &ListArena,
        v: &Value,
        on_path: &mut FxHashSet<u32>,
        done: &mut FxHashSet<u32>,
    ) -> bool {
        if let Value::List(r) = v {
            if on_path.contains(&r.0) {
                return true;
            }
            if done.contains(&r.0) {
                return false;
            }
            on_path.insert(r.0);
            let items = arena.get(*r).items.clone();
            for item in &items {
                if go(arena, item, on_path, done) {
                    return true;
                }
            }
            on_path.remove(&r.0);
            done.insert(r.0);
        }
        false
    }
    let mut on_path = FxHashSet::default();
    let mut done = FxHashSet::default();
    go(arena, v, &mut on_path, &mut done)
}

/// Deep copy preserving shared and cyclic structure.
pub fn copy(arena: &mut ListArena, v: &Value) -> Result<Value, String> {
    fn go(
        arena: &mut ListArena,
        v: &Value,
        map: &mut FxHashMap<u32, ListRef>,
    ) -> Result<Value, String> {
        match v {
            Value::List(r) => {
                if arena.get(*r).user.is_some() {
                    return Err("cannot pickle a user type".to_string());
                }
                if let Some(&n) = map.get(&r.0) {
                    return Ok(Value::List(n));
                }
                let n = arena.alloc(Vec::new());
                map.insert(r.0, n);
                let items = arena.get(*r).items.clone();
                for item in &items {
                    let c = go(arena, item, map)?;
                    arena.get_mut(n).items.push(c);
                }
                Ok(Value::List(n))
            }
            other => Ok(other.clone()),
        }
    }
    let mut map = FxHashMap::default();
    go(arena, v, &mut map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_scalars() {
        let arena = ListArena::new();
        assert_eq!(json(&arena, &Value::Nil).unwrap(), b"null");
        assert_eq!(json(&arena, &Value::Num(1.0)).unwrap(), b"1");
        assert_eq!(json(&arena, &Value::Num(1.5)).unwrap(), b"1.5");
        assert_eq!(json(&arena, &Value::Num(f64::NAN)).unwrap(), b"null");
        assert_eq!(json(&arena, &Value::str("a\"b")).unwrap(), b"\"a\\\"b\"");
    }

    #[test]
    fn test_json_list() {
        let mut arena = ListArena::new();
        let l = arena.alloc(vec![Value::Num(1.0), Value::str("a"), Value::Nil]);
        assert_eq!(json(&arena, &Value::List(l)).unwrap(), b"[1,\"a\",null]");
    }

    #[test]
    fn test_json_cyclic_errors() {
        let mut arena = ListArena::new();
        let l = arena.alloc(vec![]);
        arena.get_mut(l).items.push(Value::List(l));
        assert_eq!(json(&arena, &Value::List(l)), Err("circular".to_string()));
    }

    #[test]
    fn test_json_parse_round_trip() {
        let mut arena = ListArena::new();
        let v = val(&mut arena, b" [1, \"a\", null, [2.5]] ").unwrap();
        let text = json(&arena, &v).unwrap();
        assert_eq!(text, b"[1,\"a\",null,[2.5]]");
    }

    #[test]
    fn test_json_rejects_objects_and_bools() {
        let mut arena = ListArena::new();
        assert!(val(&mut arena, b"{\"a\":1}").is_none());
        assert!(val(&mut arena, b"true").is_none());
        assert!(val(&mut arena, b"[1,]").is_none());
    }

    #[test]
    fn test_bin_round_trip_scalars() {
        let mut arena = ListArena::new();
        for v in [Value::Nil, Value::Num(5.0), Value::Num(-3.25), Value::str("xyz")] {
            let bytes = bin(&arena, &v).unwrap();
            let back = val(&mut arena, &bytes).unwrap();
            match (&v, &back) {
                (Value::Num(a), Value::Num(b)) => assert_eq!(a, b),
                (Value::Str(a), Value::Str(b)) => assert_eq!(a, b),
                (Value::Nil, Value::Nil) => {}
                other => panic!("mismatch {:?}", other),
            }
        }
    }

    #[test]
    fn test_bin_varint_boundaries() {
        let mut out = Vec::new();
        write_varint(&mut out, 127);
        assert_eq!(out.len(), 1);
        out.clear();
        write_varint(&mut out, 128);
        assert_eq!(out.len(), 4);
        let mut at = 0;
        assert_eq!(read_varint(&out, &mut at), Some(128));
    }

    #[test]
    fn test_bin_preserves_cycles() {
        let mut arena = ListArena::new();
        let l = arena.alloc(vec![Value::Num(1.0)]);
        arena.get_mut(l).items.push(Value::List(l));
        let bytes = bin(&arena, &Value::List(l)).unwrap();
        let back = val(&mut arena, &bytes).unwrap();
        match back {
            Value::List(r) => {
                let items = &arena.get(r).items;
                assert_eq!(items.len(), 2);
                match items[1] {
                    Value::List(inner) => assert_eq!(inner, r),
                    _ => panic!("expected self reference"),
                }
            }
            _ => panic!("expected list"),
        }
    }

    #[test]
    fn test_bin_preserves_sharing() {
        let mut arena = ListArena::new();
        let shared = arena.alloc(vec![Value::Num(7.0)]);
        let outer = arena.alloc(vec![Value::List(shared), Value::List(shared)]);
        let bytes = bin(&arena, &Value::List(outer)).unwrap();
        let back = val(&mut arena, &bytes).unwrap();
        match back {
            Value::List(r) => {
                let items = &arena.get(r).items;
                match (&items[0], &items[1]) {
                    (Value::List(a), Value::List(b)) => assert_eq!(a, b),
                    _ => panic!("expected lists"),
                }
            }
            _ => panic!("expected list"),
        }
    }

    #[test]
    fn test_valid_discriminates() {
        let mut arena = ListArena::new();
        let l = arena.alloc(vec![Value::Num(1.0)]);
        let b = bin(&arena, &Value::List(l)).unwrap();
        assert_eq!(valid(&b), Some(2));
        assert_eq!(valid(b"[1,2]"), Some(1));
        assert_eq!(valid(b"[1,"), None);
    }

    #[test]
    fn test_sibling_and_circular() {
        let mut arena = ListArena::new();
        let shared = arena.alloc(vec![]);
        let dag = arena.alloc(vec![Value::List(shared), Value::List(shared)]);
        assert!(sibling(&arena, &Value::List(dag)));
        assert!(!circular(&arena, &Value::List(dag)));

        let cyc = arena.alloc(vec![Value::Num(1.0)]);
        arena.get_mut(cyc).items.push(Value::List(cyc));
        assert!(circular(&arena, &Value::List(cyc)));
        assert!(sibling(&arena, &Value::List(cyc)));

        let plain = arena.alloc(vec![Value::Num(1.0)]);
        assert!(!sibling(&arena, &Value::List(plain)));
        assert!(!circular(&arena, &Value::List(plain)));
    }

    #[test]
    fn test_copy_preserves_structure() {
        let mut arena = ListArena::new();
        let cyc = arena.alloc(vec![Value::Num(1.0)]);
        arena.get_mut(cyc).items.push(Value::List(cyc));
        let copied = copy(&mut arena, &Value::List(cyc)).unwrap();
        match copied {
            Value::List(r) => {
                assert_ne!(r, cyc);
                match arena.get(r).items[1] {
                    Value::List(inner) => assert_eq!(inner, r),
                    _ => panic!("expected self reference"),
                }
            }
            _ => panic!("expected list"),
        }
    }
}
