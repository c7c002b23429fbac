//! Canonical form and the byte codec
//!
//! [`decode`] copies each declared field out of a raw parameter buffer into a
//! [`CanonicalStruct`]; [`encode`] writes one back. Both are driven entirely
//! by a [`LayoutDescriptor`] and do no semantic validation of field values.
//!
//! Encoding starts from an all-zero buffer, so padding bytes and any bytes
//! not covered by a data field are always zero in the output.

pub mod convert;

pub use convert::{convert, translate};

use crate::error::{AbiError, AbiResult};
use crate::layout::{Field, FieldType, LayoutDescriptor};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::fmt;

/// Value of one field in canonical form
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Unsigned integer, zero-extended to 64 bits
    Uint(u64),
    /// Signed integer, sign-extended to 64 bits
    Int(i64),
    /// Byte array
    Bytes(Vec<u8>),
    /// Array of nested structures
    Array(Vec<CanonicalStruct>),
}

impl Value {
    /// Zero value for a field type
    pub fn zero(ty: &FieldType) -> Value {
        match ty {
            FieldType::Uint(_) => Value::Uint(0),
            FieldType::Int(_) => Value::Int(0),
            FieldType::Bytes(n) | FieldType::Padding(n) => Value::Bytes(vec![0; *n]),
            FieldType::Array { element, count } => {
                Value::Array((0..*count).map(|_| CanonicalStruct::zeroed(element)).collect())
            }
        }
    }

    /// Unsigned value, if this is one
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    /// Signed value, if this is one
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Byte contents, if this is a byte array
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Elements, if this is a structure array
    pub fn as_array(&self) -> Option<&[CanonicalStruct]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Uint(_) => "unsigned integer",
            Value::Int(_) => "signed integer",
            Value::Bytes(_) => "byte array",
            Value::Array(_) => "structure array",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Uint(v) => write!(f, "{:#x}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Bytes(b) => {
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Value::Array(a) => write!(f, "[{} elements]", a.len()),
        }
    }
}

/// Named field values of one structure, in layout order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalStruct {
    name: &'static str,
    fields: Vec<(&'static str, Value)>,
}

impl CanonicalStruct {
    /// Empty structure named after its layout
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fields: Vec::new(),
        }
    }

    /// Every data field of `layout` set to zero
    pub fn zeroed(layout: &LayoutDescriptor) -> Self {
        let mut s = Self::new(layout.name());
        for field in layout.data_fields() {
            s.fields.push((field.name, Value::zero(&field.ty)));
        }
        s
    }

    /// Builder-style [`set`](Self::set)
    pub fn with(mut self, field: &'static str, value: Value) -> Self {
        self.set(field, value);
        self
    }

    /// Layout name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Value of `field`
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| *n == field).map(|(_, v)| v)
    }

    /// Unsigned value of `field`
    pub fn get_uint(&self, field: &str) -> Option<u64> {
        self.get(field).and_then(Value::as_uint)
    }

    /// Replace `field` or append it
    pub fn set(&mut self, field: &'static str, value: Value) {
        match self.fields.iter_mut().find(|(n, _)| *n == field) {
            Some((_, v)) => *v = value,
            None => self.fields.push((field, value)),
        }
    }

    /// All fields in insertion order
    pub fn fields(&self) -> &[(&'static str, Value)] {
        &self.fields
    }
}

impl Serialize for CanonicalStruct {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Mask `value` to its low `width` bytes
pub(crate) fn truncate(value: u64, width: usize) -> u64 {
    if width >= 8 {
        value
    } else {
        value & ((1u64 << (width * 8)) - 1)
    }
}

/// Interpret the low `width` bytes of `value` as two's complement
pub(crate) fn sign_extend(value: u64, width: usize) -> i64 {
    let shift = 64 - (width.min(8) * 8) as u32;
    ((value << shift) as i64) >> shift
}

fn read_uint(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn write_uint(dst: &mut [u8], value: u64) {
    let len = dst.len();
    dst.copy_from_slice(&value.to_le_bytes()[..len]);
}

/// Decode a raw buffer laid out as `layout`
pub fn decode(raw: &[u8], layout: &LayoutDescriptor) -> AbiResult<CanonicalStruct> {
    if raw.len() != layout.total_width() {
        return Err(AbiError::SizeMismatch {
            layout: layout.name(),
            expected: layout.total_width(),
            actual: raw.len(),
        });
    }

    let mut out = CanonicalStruct::new(layout.name());
    out.fields.reserve(layout.fields().len());
    for field in layout.data_fields() {
        let bytes = &raw[field.offset..field.end()];
        out.fields.push((field.name, decode_field(bytes, field, layout)?));
    }
    Ok(out)
}

fn decode_field(bytes: &[u8], field: &Field, layout: &LayoutDescriptor) -> AbiResult<Value> {
    Ok(match &field.ty {
        FieldType::Uint(_) => Value::Uint(read_uint(bytes)),
        FieldType::Int(w) => Value::Int(sign_extend(read_uint(bytes), *w)),
        FieldType::Bytes(_) | FieldType::Padding(_) => Value::Bytes(bytes.to_vec()),
        FieldType::Array { element, count } => {
            let stride = element.total_width();
            if stride == 0 || bytes.len() % stride != 0 || bytes.len() / stride != *count {
                return Err(AbiError::malformed(
                    layout.name(),
                    field.name,
                    format!("{} bytes do not hold {} {} elements", bytes.len(), count, element.name()),
                ));
            }
            let elements = bytes
                .chunks_exact(stride)
                .map(|chunk| decode(chunk, element))
                .collect::<AbiResult<Vec<_>>>()?;
            Value::Array(elements)
        }
    })
}

/// Encode `value` into a freshly zeroed buffer of `layout.total_width()` bytes
pub fn encode(value: &CanonicalStruct, layout: &LayoutDescriptor) -> AbiResult<Vec<u8>> {
    let mut buf = vec![0u8; layout.total_width()];
    encode_into(value, layout, &mut buf)?;
    Ok(buf)
}

/// Encode `value` into `out`, which must be exactly `layout.total_width()` bytes
///
/// Every byte of `out` is overwritten; padding is zeroed whatever it held before.
pub fn encode_into(value: &CanonicalStruct, layout: &LayoutDescriptor, out: &mut [u8]) -> AbiResult<()> {
    if out.len() != layout.total_width() {
        return Err(AbiError::SizeMismatch {
            layout: layout.name(),
            expected: layout.total_width(),
            actual: out.len(),
        });
    }

    out.fill(0);
    for field in layout.data_fields() {
        let v = value
            .get(field.name)
            .ok_or_else(|| AbiError::malformed(layout.name(), field.name, "no value supplied"))?;
        encode_field(v, field, layout, &mut out[field.offset..field.end()])?;
    }
    Ok(())
}

fn encode_field(value: &Value, field: &Field, layout: &LayoutDescriptor, dst: &mut [u8]) -> AbiResult<()> {
    let mismatch = || {
        AbiError::malformed(
            layout.name(),
            field.name,
            format!("{} value for {} field", value.kind(), field.ty),
        )
    };

    match (&field.ty, value) {
        (FieldType::Uint(w), Value::Uint(v)) => {
            if truncate(*v, *w) != *v {
                return Err(AbiError::malformed(
                    layout.name(),
                    field.name,
                    format!("{:#x} does not fit in {}", v, field.ty),
                ));
            }
            write_uint(dst, *v);
        }
        (FieldType::Int(w), Value::Int(v)) => {
            let raw = *v as u64;
            if sign_extend(truncate(raw, *w), *w) != *v {
                return Err(AbiError::malformed(
                    layout.name(),
                    field.name,
                    format!("{} does not fit in {}", v, field.ty),
                ));
            }
            write_uint(dst, raw);
        }
        (FieldType::Bytes(n), Value::Bytes(b)) => {
            if b.len() != *n {
                return Err(AbiError::malformed(
                    layout.name(),
                    field.name,
                    format!("{} bytes for {}", b.len(), field.ty),
                ));
            }
            dst.copy_from_slice(b);
        }
        (FieldType::Array { element, count }, Value::Array(items)) => {
            if items.len() != *count {
                return Err(AbiError::malformed(
                    layout.name(),
                    field.name,
                    format!("{} elements for {}", items.len(), field.ty),
                ));
            }
            for (item, chunk) in items.iter().zip(dst.chunks_exact_mut(element.total_width())) {
                encode_into(item, element, chunk)?;
            }
        }
        _ => return Err(mismatch()),
    }
    Ok(())
}
