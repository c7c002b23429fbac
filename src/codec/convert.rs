//! Carrying values between layout variants of one structure

use super::{decode, encode, sign_extend, truncate, CanonicalStruct, Value};
use crate::error::{AbiError, AbiResult};
use crate::layout::{Compat, Field, FieldType, LayoutDescriptor};
use std::ptr;

/// Reshape a canonical struct decoded under `from` into the shape of `to`
///
/// Fields are matched by name. `Identical` and `RenamedFrom` fields must keep
/// their width and kind. `VersionSpecific` fields are truncated or
/// zero-extended; arrays keep their leading elements and gain zeroed ones.
/// A field present on only one side is acceptable only when that side tags
/// it `VersionSpecific`.
pub fn convert(value: &CanonicalStruct, from: &LayoutDescriptor, to: &LayoutDescriptor) -> AbiResult<CanonicalStruct> {
    if from.lineage() != to.lineage() {
        return Err(AbiError::incompatible(
            from.name(),
            to.name(),
            format!("{} and {} are different structures", from.lineage(), to.lineage()),
        ));
    }

    let mut out = CanonicalStruct::new(to.name());
    for target in to.data_fields() {
        let carried = match from.field(target.name) {
            Some(source) => {
                let v = value
                    .get(source.name)
                    .ok_or_else(|| AbiError::malformed(from.name(), source.name, "no value supplied"))?;
                carry(v, source, target, from, to)?
            }
            None if target.compat == Compat::VersionSpecific => Value::zero(&target.ty),
            None => {
                return Err(AbiError::incompatible(
                    from.name(),
                    to.name(),
                    format!("{} field {} has no source", target.compat, target.name),
                ));
            }
        };
        out.set(target.name, carried);
    }

    for source in from.data_fields() {
        if to.field(source.name).is_none() && source.compat != Compat::VersionSpecific {
            return Err(AbiError::incompatible(
                from.name(),
                to.name(),
                format!("{} field {} would be dropped", source.compat, source.name),
            ));
        }
    }

    Ok(out)
}

fn carry(
    value: &Value,
    source: &Field,
    target: &Field,
    from: &LayoutDescriptor,
    to: &LayoutDescriptor,
) -> AbiResult<Value> {
    if !source.ty.same_kind(&target.ty) {
        return Err(AbiError::incompatible(
            from.name(),
            to.name(),
            format!("{} changes type from {} to {}", target.name, source.ty, target.ty),
        ));
    }

    let reshape = source.compat == Compat::VersionSpecific || target.compat == Compat::VersionSpecific;
    if !reshape {
        if source.ty.width() != target.ty.width() {
            return Err(AbiError::incompatible(
                from.name(),
                to.name(),
                format!("{} field {} changes width", target.compat, target.name),
            ));
        }
        if let (FieldType::Array { element: a, .. }, FieldType::Array { element: b, .. }) = (&source.ty, &target.ty) {
            return carry_elements(value, source, a, b, None, from);
        }
        return Ok(value.clone());
    }

    let malformed = || AbiError::malformed(from.name(), source.name, format!("value does not match {}", source.ty));
    match &target.ty {
        FieldType::Uint(w) => {
            let v = value.as_uint().ok_or_else(malformed)?;
            Ok(Value::Uint(truncate(v, *w)))
        }
        FieldType::Int(w) => {
            let v = value.as_int().ok_or_else(malformed)?;
            Ok(Value::Int(sign_extend(truncate(v as u64, *w), *w)))
        }
        FieldType::Bytes(n) => {
            let mut b = value.as_bytes().ok_or_else(malformed)?.to_vec();
            b.resize(*n, 0);
            Ok(Value::Bytes(b))
        }
        FieldType::Array { element, count } => match &source.ty {
            FieldType::Array { element: src_elem, .. } => {
                carry_elements(value, source, src_elem, element, Some(*count), from)
            }
            _ => Err(malformed()),
        },
        FieldType::Padding(_) => Ok(Value::zero(&target.ty)),
    }
}

/// Convert up to `count` elements (all when `None`), zero-filling slots the source lacks
fn carry_elements(
    value: &Value,
    source: &Field,
    from_elem: &LayoutDescriptor,
    to_elem: &LayoutDescriptor,
    count: Option<usize>,
    from: &LayoutDescriptor,
) -> AbiResult<Value> {
    let items = value
        .as_array()
        .ok_or_else(|| AbiError::malformed(from.name(), source.name, "value is not a structure array"))?;
    let same = ptr::eq(from_elem, to_elem) || from_elem == to_elem;
    let count = count.unwrap_or(items.len());

    let mut out = Vec::with_capacity(count);
    for item in items.iter().take(count) {
        out.push(if same { item.clone() } else { convert(item, from_elem, to_elem)? });
    }
    while out.len() < count {
        out.push(CanonicalStruct::zeroed(to_elem));
    }
    Ok(Value::Array(out))
}

/// Re-express a raw buffer laid out as `from` in the layout `to`
///
/// Translating a buffer into its own layout returns it unchanged.
pub fn translate(raw: &[u8], from: &LayoutDescriptor, to: &LayoutDescriptor) -> AbiResult<Vec<u8>> {
    if ptr::eq(from, to) || from == to {
        if raw.len() != from.total_width() {
            return Err(AbiError::SizeMismatch {
                layout: from.name(),
                expected: from.total_width(),
                actual: raw.len(),
            });
        }
        return Ok(raw.to_vec());
    }

    let decoded = decode(raw, from)?;
    let converted = convert(&decoded, from, to)?;
    encode(&converted, to)
}
