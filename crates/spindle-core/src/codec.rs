//! Payload values and their wire form.
//!
//! Scalars travel entirely inside a header slot: the type tag plus a 64-bit
//! pattern packed into the `start`/`end` words, zero payload bytes. Buffered
//! kinds serialize to a byte run that lands either in the slot's 512-byte
//! static area or in the dynamic arena; each buffered kind has two tags so
//! the consumer knows where to look without extra flags.
//!
//! The codec is placement-agnostic: [`to_wire`] produces a [`Wire`] value
//! and the ring layer decides where the bytes go.

use std::collections::HashSet;
use std::sync::OnceLock;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DecodeError, EncodeCode, EncodeError};

/// A value crossing the host/worker boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    F64(f64),
    I64(i64),
    U64(u64),
    Bool(bool),
    Null,
    /// The absence of a value, distinct from an explicit null.
    Unit,
    /// Milliseconds since the Unix epoch.
    Timestamp(f64),
    Str(String),
    /// A registered interned key. Encoding fails if the key was never
    /// registered on this side; decoding registers it.
    Symbol(String),
    Bytes(Bytes),
    I32Array(Vec<i32>),
    F64Array(Vec<f64>),
    I64Array(Vec<i64>),
    U64Array(Vec<u64>),
    Json(serde_json::Value),
    /// An opaque binary-serialized value. See [`Payload::native`].
    Native(Bytes),
    /// A plain numeric sequence, decoded back as numbers rather than a
    /// typed array.
    Numeric(Vec<f64>),
    /// Arbitrary-precision integer: sign plus little-endian magnitude.
    BigInt { negative: bool, magnitude: Vec<u8> },
}

impl Payload {
    /// Binary-serialize `value` into a [`Payload::Native`].
    pub fn native<T: Serialize>(value: &T) -> Result<Self, EncodeError> {
        let bytes = postcard::to_allocvec(value)
            .map_err(|e| EncodeError::new(EncodeCode::Native, e.to_string()))?;
        Ok(Self::Native(Bytes::from(bytes)))
    }

    /// Recover a value from a [`Payload::Native`].
    pub fn decode_native<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        match self {
            Self::Native(bytes) => {
                postcard::from_bytes(bytes).map_err(|e| DecodeError::Native(e.to_string()))
            }
            other => Err(DecodeError::Native(format!(
                "not a native payload: {other:?}"
            ))),
        }
    }

    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<f64> for Payload {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<bool> for Payload {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Wire type tags. Buffered kinds come in static/dynamic pairs; the
/// low bit of the pair distinguishes placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TypeTag {
    F64 = 0,
    I64 = 1,
    U64 = 2,
    Bool = 3,
    Null = 4,
    Unit = 5,
    Timestamp = 6,

    StrStatic = 8,
    StrDynamic = 9,
    SymbolStatic = 10,
    SymbolDynamic = 11,
    BytesStatic = 12,
    BytesDynamic = 13,
    I32ArrayStatic = 14,
    I32ArrayDynamic = 15,
    F64ArrayStatic = 16,
    F64ArrayDynamic = 17,
    I64ArrayStatic = 18,
    I64ArrayDynamic = 19,
    U64ArrayStatic = 20,
    U64ArrayDynamic = 21,
    JsonStatic = 22,
    JsonDynamic = 23,
    NativeStatic = 24,
    NativeDynamic = 25,
    NumericStatic = 26,
    NumericDynamic = 27,
    BigIntStatic = 28,
    BigIntDynamic = 29,
}

impl TypeTag {
    pub fn from_u32(v: u32) -> Option<Self> {
        use TypeTag::*;
        Some(match v {
            0 => F64,
            1 => I64,
            2 => U64,
            3 => Bool,
            4 => Null,
            5 => Unit,
            6 => Timestamp,
            8 => StrStatic,
            9 => StrDynamic,
            10 => SymbolStatic,
            11 => SymbolDynamic,
            12 => BytesStatic,
            13 => BytesDynamic,
            14 => I32ArrayStatic,
            15 => I32ArrayDynamic,
            16 => F64ArrayStatic,
            17 => F64ArrayDynamic,
            18 => I64ArrayStatic,
            19 => I64ArrayDynamic,
            20 => U64ArrayStatic,
            21 => U64ArrayDynamic,
            22 => JsonStatic,
            23 => JsonDynamic,
            24 => NativeStatic,
            25 => NativeDynamic,
            26 => NumericStatic,
            27 => NumericDynamic,
            28 => BigIntStatic,
            29 => BigIntDynamic,
            _ => return None,
        })
    }

    /// Whether the payload bytes live in the dynamic arena.
    pub fn is_dynamic(self) -> bool {
        (self as u32) >= 8 && (self as u32) & 1 == 1
    }

    /// The buffered kind behind a buffered tag, if any.
    pub fn buffer_kind(self) -> Option<BufferKind> {
        use BufferKind::*;
        Some(match (self as u32) & !1 {
            8 => Str,
            10 => Symbol,
            12 => Bytes,
            14 => I32Array,
            16 => F64Array,
            18 => I64Array,
            20 => U64Array,
            22 => Json,
            24 => Native,
            26 => Numeric,
            28 => BigInt,
            _ => return None,
        })
    }
}

/// The buffered payload kinds, placement left open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Str,
    Symbol,
    Bytes,
    I32Array,
    F64Array,
    I64Array,
    U64Array,
    Json,
    Native,
    Numeric,
    BigInt,
}

impl BufferKind {
    pub fn tag(self, dynamic: bool) -> TypeTag {
        use TypeTag::*;
        match (self, dynamic) {
            (Self::Str, false) => StrStatic,
            (Self::Str, true) => StrDynamic,
            (Self::Symbol, false) => SymbolStatic,
            (Self::Symbol, true) => SymbolDynamic,
            (Self::Bytes, false) => BytesStatic,
            (Self::Bytes, true) => BytesDynamic,
            (Self::I32Array, false) => I32ArrayStatic,
            (Self::I32Array, true) => I32ArrayDynamic,
            (Self::F64Array, false) => F64ArrayStatic,
            (Self::F64Array, true) => F64ArrayDynamic,
            (Self::I64Array, false) => I64ArrayStatic,
            (Self::I64Array, true) => I64ArrayDynamic,
            (Self::U64Array, false) => U64ArrayStatic,
            (Self::U64Array, true) => U64ArrayDynamic,
            (Self::Json, false) => JsonStatic,
            (Self::Json, true) => JsonDynamic,
            (Self::Native, false) => NativeStatic,
            (Self::Native, true) => NativeDynamic,
            (Self::Numeric, false) => NumericStatic,
            (Self::Numeric, true) => NumericDynamic,
            (Self::BigInt, false) => BigIntStatic,
            (Self::BigInt, true) => BigIntDynamic,
        }
    }
}

/// Serialized form of a payload, before placement.
#[derive(Debug, Clone, PartialEq)]
pub enum Wire {
    /// Fits entirely in the header: a tag and a 64-bit pattern.
    Scalar { tag: TypeTag, bits: u64 },
    /// A byte run still in need of a home.
    Buffer { kind: BufferKind, bytes: Vec<u8> },
}

/// Serialize a payload to its wire form.
///
/// Fails only for unregistered symbols and serializer errors; size never
/// fails here (oversized buffers become arena backpressure downstream).
pub fn to_wire(payload: &Payload) -> Result<Wire, EncodeError> {
    let wire = match payload {
        Payload::F64(v) => scalar(TypeTag::F64, v.to_bits()),
        Payload::I64(v) => scalar(TypeTag::I64, *v as u64),
        Payload::U64(v) => scalar(TypeTag::U64, *v),
        Payload::Bool(v) => scalar(TypeTag::Bool, *v as u64),
        Payload::Null => scalar(TypeTag::Null, 0),
        Payload::Unit => scalar(TypeTag::Unit, 0),
        Payload::Timestamp(v) => scalar(TypeTag::Timestamp, v.to_bits()),

        Payload::Str(s) => buffer(BufferKind::Str, s.as_bytes().to_vec()),
        Payload::Symbol(key) => {
            if !symbol_registered(key) {
                return Err(EncodeError::new(
                    EncodeCode::Symbol,
                    format!("unregistered symbol {key:?}"),
                ));
            }
            buffer(BufferKind::Symbol, key.as_bytes().to_vec())
        }
        Payload::Bytes(b) => buffer(BufferKind::Bytes, b.to_vec()),
        Payload::I32Array(v) => buffer(BufferKind::I32Array, le_bytes(v, |x| x.to_le_bytes())),
        Payload::F64Array(v) => buffer(BufferKind::F64Array, le_bytes(v, |x| x.to_le_bytes())),
        Payload::I64Array(v) => buffer(BufferKind::I64Array, le_bytes(v, |x| x.to_le_bytes())),
        Payload::U64Array(v) => buffer(BufferKind::U64Array, le_bytes(v, |x| x.to_le_bytes())),
        Payload::Json(v) => {
            let bytes = serde_json::to_vec(v)
                .map_err(|e| EncodeError::new(EncodeCode::Json, e.to_string()))?;
            buffer(BufferKind::Json, bytes)
        }
        Payload::Native(b) => buffer(BufferKind::Native, b.to_vec()),
        Payload::Numeric(v) => buffer(BufferKind::Numeric, le_bytes(v, |x| x.to_le_bytes())),
        Payload::BigInt {
            negative,
            magnitude,
        } => {
            let mut bytes = Vec::with_capacity(1 + magnitude.len());
            bytes.push(*negative as u8);
            bytes.extend_from_slice(magnitude);
            buffer(BufferKind::BigInt, bytes)
        }
    };
    Ok(wire)
}

fn scalar(tag: TypeTag, bits: u64) -> Wire {
    Wire::Scalar { tag, bits }
}

fn buffer(kind: BufferKind, bytes: Vec<u8>) -> Wire {
    Wire::Buffer { kind, bytes }
}

fn le_bytes<T: Copy, const N: usize>(values: &[T], to: impl Fn(T) -> [u8; N]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * N);
    for &v in values {
        out.extend_from_slice(&to(v));
    }
    out
}

/// Decode a header-only scalar. Returns `None` for buffered tags.
pub fn scalar_from_wire(tag: TypeTag, bits: u64) -> Option<Payload> {
    Some(match tag {
        TypeTag::F64 => Payload::F64(f64::from_bits(bits)),
        TypeTag::I64 => Payload::I64(bits as i64),
        TypeTag::U64 => Payload::U64(bits),
        TypeTag::Bool => Payload::Bool(bits != 0),
        TypeTag::Null => Payload::Null,
        TypeTag::Unit => Payload::Unit,
        TypeTag::Timestamp => Payload::Timestamp(f64::from_bits(bits)),
        _ => return None,
    })
}

/// Decode a buffered payload from its byte run.
pub fn buffer_from_wire(kind: BufferKind, bytes: &[u8]) -> Result<Payload, DecodeError> {
    let payload = match kind {
        BufferKind::Str => Payload::Str(utf8(bytes)?),
        BufferKind::Symbol => {
            let key = utf8(bytes)?;
            register_symbol(&key);
            Payload::Symbol(key)
        }
        BufferKind::Bytes => Payload::Bytes(Bytes::copy_from_slice(bytes)),
        BufferKind::I32Array => Payload::I32Array(from_le(bytes, i32::from_le_bytes)?),
        BufferKind::F64Array => Payload::F64Array(from_le(bytes, f64::from_le_bytes)?),
        BufferKind::I64Array => Payload::I64Array(from_le(bytes, i64::from_le_bytes)?),
        BufferKind::U64Array => Payload::U64Array(from_le(bytes, u64::from_le_bytes)?),
        BufferKind::Json => Payload::Json(
            serde_json::from_slice(bytes).map_err(|e| DecodeError::Json(e.to_string()))?,
        ),
        BufferKind::Native => Payload::Native(Bytes::copy_from_slice(bytes)),
        BufferKind::Numeric => Payload::Numeric(from_le(bytes, f64::from_le_bytes)?),
        BufferKind::BigInt => {
            let (&sign, magnitude) = bytes
                .split_first()
                .ok_or(DecodeError::Truncated { len: 0, elem: 1 })?;
            Payload::BigInt {
                negative: sign != 0,
                magnitude: magnitude.to_vec(),
            }
        }
    };
    Ok(payload)
}

fn utf8(bytes: &[u8]) -> Result<String, DecodeError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::Utf8)
}

fn from_le<T, const N: usize>(
    bytes: &[u8],
    from: impl Fn([u8; N]) -> T,
) -> Result<Vec<T>, DecodeError> {
    if bytes.len() % N != 0 {
        return Err(DecodeError::Truncated {
            len: bytes.len(),
            elem: N,
        });
    }
    Ok(bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut arr = [0u8; N];
            arr.copy_from_slice(chunk);
            from(arr)
        })
        .collect())
}

fn symbols() -> &'static RwLock<HashSet<String>> {
    static SYMBOLS: OnceLock<RwLock<HashSet<String>>> = OnceLock::new();
    SYMBOLS.get_or_init(|| RwLock::new(HashSet::new()))
}

/// Add a symbol key to the process-wide registry.
pub fn register_symbol(key: &str) {
    symbols().write().insert(key.to_owned());
}

pub fn symbol_registered(key: &str) -> bool {
    symbols().read().contains(key)
}
