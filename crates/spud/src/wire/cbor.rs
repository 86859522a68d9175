//! A CBOR (RFC 7049) subset sufficient for SPUD payloads: integers, byte and
//! text strings, arrays, maps, tags, floats, booleans, and the null/
//! undefined/simple values, in both definite- and indefinite-length forms.
//!
//! The error taxonomy mirrors `cn-cbor`, the C decoder the original SPUDlib
//! embedded, rather than inventing a new one — callers porting behavior from
//! the original get the same failure granularity.

use winnow::token::take;
use winnow::Parser;

/// Errors produced while decoding a CBOR byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CborError {
    #[error("ran out of data before a value was complete")]
    OutOfData,
    #[error("trailing bytes after a complete top-level value")]
    NotAllDataConsumed,
    #[error("indefinite-length map closed with an odd number of entries")]
    OddSizeIndefMap,
    #[error("break code encountered outside an indefinite-length container")]
    BreakOutsideIndef,
    #[error("indefinite length used where the major type forbids it")]
    MtUndefForIndef,
    #[error("additional info value 28-30 is reserved")]
    ReservedAi,
    #[error("indefinite-length string contains a chunk of the wrong type or itself indefinite")]
    WrongNestingInIndefString,
    #[error("a value's encoding is structurally invalid")]
    InvalidParameter,
    #[error("allocation limit exceeded while decoding")]
    OutOfMemory,
}

/// A decoded CBOR value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A non-negative integer, stored as its literal value.
    Uint(u64),
    /// A negative integer, stored as `-1 - n` per the wire encoding; use
    /// [`Value::as_i64`] to recover a signed value when it fits.
    Neg(u64),
    Bytes(Vec<u8>),
    Text(String),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Tag(u64, Box<Value>),
    Float(f64),
    Bool(bool),
    Null,
    Undefined,
    /// A simple value outside the named ones above (RFC 7049 §2.3).
    Simple(u8),
}

impl Value {
    pub fn uint(v: u64) -> Self {
        Value::Uint(v)
    }

    pub fn int(v: i64) -> Self {
        if v >= 0 {
            Value::Uint(v as u64)
        } else {
            Value::Neg((-1 - v) as u64)
        }
    }

    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(b.into())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Uint(v) => i64::try_from(*v).ok(),
            Value::Neg(v) => i64::try_from(*v).ok().map(|v| -1 - v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Looks up a text key in a map value. Returns `None` if this isn't a
    /// map or the key isn't present.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?.iter().find_map(|(k, v)| {
            if k.as_text() == Some(key) {
                Some(v)
            } else {
                None
            }
        })
    }
}

type PResult<'a, T> = Result<T, CborError>;

fn read_u8<'a>(input: &mut &'a [u8]) -> PResult<'a, u8> {
    winnow::token::any::<_, ()>
        .parse_next(input)
        .map_err(|_| CborError::OutOfData)
}

fn read_be<const N: usize>(input: &mut &[u8]) -> PResult<'static, u64> {
    let bytes: &[u8] = take(N)
        .parse_next(input)
        .map_err(|_: winnow::error::ErrMode<()>| CborError::OutOfData)?;
    let mut buf = [0u8; 8];
    buf[8 - N..].copy_from_slice(bytes);
    Ok(u64::from_be_bytes(buf))
}

fn take_n<'a>(input: &mut &'a [u8], n: usize) -> PResult<'a, &'a [u8]> {
    take(n)
        .parse_next(input)
        .map_err(|_: winnow::error::ErrMode<()>| CborError::OutOfData)
}

enum Len {
    Definite(u64),
    Indefinite,
}

fn read_length(ai: u8, input: &mut &[u8]) -> PResult<'static, Len> {
    match ai {
        0..=23 => Ok(Len::Definite(ai as u64)),
        24 => Ok(Len::Definite(read_u8(input)? as u64)),
        25 => Ok(Len::Definite(read_be::<2>(input)?)),
        26 => Ok(Len::Definite(read_be::<4>(input)?)),
        27 => Ok(Len::Definite(read_be::<8>(input)?)),
        28..=30 => Err(CborError::ReservedAi),
        31 => Ok(Len::Indefinite),
        _ => unreachable!("additional info is five bits"),
    }
}

fn half_to_f64(half: u16) -> f64 {
    let sign = (half >> 15) & 1;
    let exp = (half >> 10) & 0x1F;
    let frac = half & 0x3FF;
    let value = if exp == 0 {
        (frac as f64) * 2f64.powi(-24)
    } else if exp == 0x1F {
        if frac == 0 {
            f64::INFINITY
        } else {
            f64::NAN
        }
    } else {
        (1.0 + frac as f64 / 1024.0) * 2f64.powi(exp as i32 - 15)
    };
    if sign == 1 {
        -value
    } else {
        value
    }
}

/// Decode exactly one top-level CBOR value from `input`, erroring if any
/// bytes remain afterward.
pub fn decode(input: &[u8]) -> Result<Value, CborError> {
    let mut cursor = input;
    let value = parse_value(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(CborError::NotAllDataConsumed);
    }
    Ok(value)
}

fn parse_value<'a>(input: &mut &'a [u8]) -> PResult<'a, Value> {
    let byte = read_u8(input)?;
    let mt = byte >> 5;
    let ai = byte & 0x1F;

    match mt {
        0 => match read_length(ai, input)? {
            Len::Definite(v) => Ok(Value::Uint(v)),
            Len::Indefinite => Err(CborError::MtUndefForIndef),
        },
        1 => match read_length(ai, input)? {
            Len::Definite(v) => Ok(Value::Neg(v)),
            Len::Indefinite => Err(CborError::MtUndefForIndef),
        },
        2 => parse_string_like(ai, input, false),
        3 => parse_string_like(ai, input, true),
        4 => parse_array(ai, input),
        5 => parse_map(ai, input),
        6 => parse_tag(ai, input),
        7 => parse_simple_or_float(ai, input),
        _ => unreachable!("major type is three bits"),
    }
}

fn parse_string_like<'a>(ai: u8, input: &mut &'a [u8], is_text: bool) -> PResult<'a, Value> {
    match read_length(ai, input)? {
        Len::Definite(len) => {
            let len = usize::try_from(len).map_err(|_| CborError::OutOfMemory)?;
            let bytes = take_n(input, len)?.to_vec();
            wrap_string(bytes, is_text)
        }
        Len::Indefinite => {
            let mut joined = Vec::new();
            loop {
                if peek_is_break(input)? {
                    let _ = read_u8(input)?;
                    break;
                }
                let chunk_byte = read_u8(input)?;
                let chunk_mt = chunk_byte >> 5;
                let chunk_ai = chunk_byte & 0x1F;
                if chunk_mt != mt_of(is_text) {
                    return Err(CborError::WrongNestingInIndefString);
                }
                match read_length(chunk_ai, input)? {
                    Len::Definite(len) => {
                        let len = usize::try_from(len).map_err(|_| CborError::OutOfMemory)?;
                        joined.extend_from_slice(take_n(input, len)?);
                    }
                    Len::Indefinite => return Err(CborError::WrongNestingInIndefString),
                }
            }
            wrap_string(joined, is_text)
        }
    }
}

fn mt_of(is_text: bool) -> u8 {
    if is_text {
        3
    } else {
        2
    }
}

fn wrap_string(bytes: Vec<u8>, is_text: bool) -> Result<Value, CborError> {
    if is_text {
        String::from_utf8(bytes)
            .map(Value::Text)
            .map_err(|_| CborError::InvalidParameter)
    } else {
        Ok(Value::Bytes(bytes))
    }
}

fn peek_is_break(input: &&[u8]) -> PResult<'static, bool> {
    match input.first() {
        Some(0xFF) => Ok(true),
        Some(_) => Ok(false),
        None => Err(CborError::OutOfData),
    }
}

fn parse_array<'a>(ai: u8, input: &mut &'a [u8]) -> PResult<'a, Value> {
    match read_length(ai, input)? {
        Len::Definite(len) => {
            let len = usize::try_from(len).map_err(|_| CborError::OutOfMemory)?;
            let mut items = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                items.push(parse_value(input)?);
            }
            Ok(Value::Array(items))
        }
        Len::Indefinite => {
            let mut items = Vec::new();
            loop {
                if peek_is_break(input)? {
                    let _ = read_u8(input)?;
                    break;
                }
                items.push(parse_value(input)?);
            }
            Ok(Value::Array(items))
        }
    }
}

fn parse_map<'a>(ai: u8, input: &mut &'a [u8]) -> PResult<'a, Value> {
    match read_length(ai, input)? {
        Len::Definite(pairs) => {
            let pairs = usize::try_from(pairs).map_err(|_| CborError::OutOfMemory)?;
            let mut entries = Vec::with_capacity(pairs.min(4096));
            for _ in 0..pairs {
                let key = parse_value(input)?;
                let value = parse_value(input)?;
                entries.push((key, value));
            }
            Ok(Value::Map(entries))
        }
        Len::Indefinite => {
            let mut entries = Vec::new();
            loop {
                if peek_is_break(input)? {
                    let _ = read_u8(input)?;
                    break;
                }
                let key = parse_value(input)?;
                if peek_is_break(input)? {
                    return Err(CborError::OddSizeIndefMap);
                }
                let value = parse_value(input)?;
                entries.push((key, value));
            }
            Ok(Value::Map(entries))
        }
    }
}

fn parse_tag<'a>(ai: u8, input: &mut &'a [u8]) -> PResult<'a, Value> {
    match read_length(ai, input)? {
        Len::Definite(tag) => {
            let inner = parse_value(input)?;
            Ok(Value::Tag(tag, Box::new(inner)))
        }
        Len::Indefinite => Err(CborError::MtUndefForIndef),
    }
}

fn parse_simple_or_float<'a>(ai: u8, input: &mut &'a [u8]) -> PResult<'a, Value> {
    match ai {
        0..=19 => Ok(Value::Simple(ai)),
        20 => Ok(Value::Bool(false)),
        21 => Ok(Value::Bool(true)),
        22 => Ok(Value::Null),
        23 => Ok(Value::Undefined),
        24 => {
            let b = read_u8(input)?;
            if b < 32 {
                Err(CborError::ReservedAi)
            } else {
                Ok(Value::Simple(b))
            }
        }
        25 => {
            let half = read_be::<2>(input)? as u16;
            Ok(Value::Float(half_to_f64(half)))
        }
        26 => {
            let bits = read_be::<4>(input)? as u32;
            Ok(Value::Float(f32::from_bits(bits) as f64))
        }
        27 => {
            let bits = read_be::<8>(input)?;
            Ok(Value::Float(f64::from_bits(bits)))
        }
        28..=30 => Err(CborError::ReservedAi),
        31 => Err(CborError::BreakOutsideIndef),
        _ => unreachable!("additional info is five bits"),
    }
}

/// Append the canonical (shortest definite-length) encoding of `value` to
/// `out`.
pub fn encode(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Uint(v) => write_header(out, 0, *v),
        Value::Neg(v) => write_header(out, 1, *v),
        Value::Bytes(b) => {
            write_header(out, 2, b.len() as u64);
            out.extend_from_slice(b);
        }
        Value::Text(s) => {
            write_header(out, 3, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            write_header(out, 4, items.len() as u64);
            for item in items {
                encode(item, out);
            }
        }
        Value::Map(entries) => {
            write_header(out, 5, entries.len() as u64);
            for (k, v) in entries {
                encode(k, out);
                encode(v, out);
            }
        }
        Value::Tag(tag, inner) => {
            write_header(out, 6, *tag);
            encode(inner, out);
        }
        Value::Float(f) => {
            out.push((7 << 5) | 27);
            out.extend_from_slice(&f.to_bits().to_be_bytes());
        }
        Value::Bool(false) => out.push((7 << 5) | 20),
        Value::Bool(true) => out.push((7 << 5) | 21),
        Value::Null => out.push((7 << 5) | 22),
        Value::Undefined => out.push((7 << 5) | 23),
        Value::Simple(v) if *v < 24 => out.push((7 << 5) | v),
        Value::Simple(v) => {
            out.push((7 << 5) | 24);
            out.push(*v);
        }
    }
}

fn write_header(out: &mut Vec<u8>, mt: u8, len: u64) {
    let top = mt << 5;
    if len < 24 {
        out.push(top | len as u8);
    } else if len <= u8::MAX as u64 {
        out.push(top | 24);
        out.push(len as u8);
    } else if len <= u16::MAX as u64 {
        out.push(top | 25);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else if len <= u32::MAX as u64 {
        out.push(top | 26);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    } else {
        out.push(top | 27);
        out.extend_from_slice(&len.to_be_bytes());
    }
}
