//! Layout descriptors for driver parameter structures
//!
//! Structures are described as data rather than as one Rust type per driver
//! version. A [`LayoutBuilder`] lists the fields of a structure in declaration
//! order and lays them out against an [`AbiConfig`], producing an immutable
//! [`LayoutDescriptor`] in which every offset, width and padding byte is
//! explicit.

pub mod uvm;

use crate::config::AbiConfig;
use crate::error::{AbiError, AbiResult};
use crate::handles::{HandleKind, HandleRelocator, HandleSlot};
use std::fmt;
use std::sync::Arc;

/// Semantic type of one field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// Unsigned little-endian integer of the given byte width
    Uint(usize),
    /// Signed little-endian integer of the given byte width
    Int(usize),
    /// Fixed-size byte array
    Bytes(usize),
    /// Fixed-size array of nested structures
    Array {
        /// Element layout
        element: Arc<LayoutDescriptor>,
        /// Number of elements
        count: usize,
    },
    /// Opaque padding, always zero on encode
    Padding(usize),
}

impl FieldType {
    /// Width in bytes
    pub fn width(&self) -> usize {
        match self {
            FieldType::Uint(w) | FieldType::Int(w) | FieldType::Bytes(w) | FieldType::Padding(w) => *w,
            FieldType::Array { element, count } => element.total_width() * count,
        }
    }

    /// Natural alignment on the host platform
    pub fn align(&self) -> usize {
        match self {
            FieldType::Uint(w) | FieldType::Int(w) => *w,
            FieldType::Bytes(_) | FieldType::Padding(_) => 1,
            FieldType::Array { element, .. } => element.align(),
        }
    }

    /// Whether two types carry the same kind of value, ignoring width
    pub fn same_kind(&self, other: &FieldType) -> bool {
        match (self, other) {
            (FieldType::Uint(_), FieldType::Uint(_))
            | (FieldType::Int(_), FieldType::Int(_))
            | (FieldType::Bytes(_), FieldType::Bytes(_))
            | (FieldType::Padding(_), FieldType::Padding(_)) => true,
            (FieldType::Array { element: a, .. }, FieldType::Array { element: b, .. }) => {
                a.lineage() == b.lineage()
            }
            _ => false,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Uint(w) => write!(f, "u{}", w * 8),
            FieldType::Int(w) => write!(f, "i{}", w * 8),
            FieldType::Bytes(n) => write!(f, "u8[{}]", n),
            FieldType::Array { element, count } => write!(f, "{}[{}]", element.name(), count),
            FieldType::Padding(n) => write!(f, "pad[{}]", n),
        }
    }
}

/// How a field behaves across driver versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compat {
    /// Same offset, width and meaning in every variant
    Identical,
    /// Same bytes carried over from the named earlier structure
    RenamedFrom(&'static str),
    /// Width or presence depends on a version-dependent constant
    VersionSpecific,
}

impl fmt::Display for Compat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compat::Identical => write!(f, "identical"),
            Compat::RenamedFrom(name) => write!(f, "renamed-from({})", name),
            Compat::VersionSpecific => write!(f, "version-specific"),
        }
    }
}

/// What a field is used for by the translation pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    /// Ordinary payload
    Data,
    /// Driver-reported status word
    Status,
    /// Process-local resource handle that must be relocated
    Handle(HandleKind),
}

/// One laid-out field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Field name
    pub name: &'static str,
    /// Byte offset from the start of the structure
    pub offset: usize,
    /// Semantic type
    pub ty: FieldType,
    /// Compatibility tag
    pub compat: Compat,
    /// Pipeline role
    pub role: FieldRole,
}

impl Field {
    /// Width in bytes
    pub fn width(&self) -> usize {
        self.ty.width()
    }

    /// Offset one past the last byte
    pub fn end(&self) -> usize {
        self.offset + self.width()
    }

    /// Whether this field is padding
    pub fn is_padding(&self) -> bool {
        matches!(self.ty, FieldType::Padding(_))
    }
}

/// Length of a fixed-size array field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayLen {
    /// Same length on every host
    Fixed(usize),
    /// `UVM_MAX_GPUS`, i.e. the device count
    MaxGpus,
    /// `UVM_MAX_GPUS_V2`, i.e. devices times sub-devices
    MaxGpusV2,
}

impl ArrayLen {
    /// Effective element count for a configuration
    pub fn resolve(&self, config: &AbiConfig) -> usize {
        match self {
            ArrayLen::Fixed(n) => *n,
            ArrayLen::MaxGpus => config.max_gpus(),
            ArrayLen::MaxGpusV2 => config.max_gpus_v2(),
        }
    }

    fn is_symbolic(&self) -> bool {
        !matches!(self, ArrayLen::Fixed(_))
    }
}

/// Bits forced on in a host request and reverted in the response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    /// Unsigned field the bits are OR-ed into
    pub field: &'static str,
    /// Bits to set
    pub set_bits: u64,
}

const PADDING_NAME: &str = "_pad";

/// Immutable byte layout of one structure shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutDescriptor {
    name: &'static str,
    renamed_from: Option<&'static str>,
    fields: Vec<Field>,
    total_width: usize,
    align: usize,
    handles: Vec<HandleSlot>,
    fixups: Vec<Fixup>,
}

impl LayoutDescriptor {
    /// Structure name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Earlier structure this one absorbs, if any
    pub fn renamed_from(&self) -> Option<&'static str> {
        self.renamed_from
    }

    /// Identity shared by every variant of the same structure
    pub fn lineage(&self) -> &'static str {
        self.renamed_from.unwrap_or(self.name)
    }

    /// All fields, padding included, in offset order
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Non-padding fields in offset order
    pub fn data_fields(&self) -> impl Iterator<Item = &Field> + '_ {
        self.fields.iter().filter(|f| !f.is_padding())
    }

    /// Look up a non-padding field by name
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.data_fields().find(|f| f.name == name)
    }

    /// Total size in bytes
    pub fn total_width(&self) -> usize {
        self.total_width
    }

    /// Structure alignment
    pub fn align(&self) -> usize {
        self.align
    }

    /// Declared handle fields
    pub fn handle_slots(&self) -> &[HandleSlot] {
        &self.handles
    }

    /// Whether any handle field is declared
    pub fn has_handles(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Relocator over this layout's handle fields
    pub fn relocator(&self) -> HandleRelocator<'_> {
        HandleRelocator::new(self)
    }

    /// The trailing status word, absent only for parameterless commands and elements
    pub fn status_field(&self) -> Option<&Field> {
        self.data_fields().find(|f| f.role == FieldRole::Status)
    }

    /// Request fixups
    pub fn fixups(&self) -> &[Fixup] {
        &self.fixups
    }

    /// Whether the command carries no parameter structure
    pub fn is_parameterless(&self) -> bool {
        self.fields.is_empty()
    }

    /// Byte ranges occupied by padding
    pub fn padding_ranges(&self) -> impl Iterator<Item = std::ops::Range<usize>> + '_ {
        self.fields.iter().filter(|f| f.is_padding()).map(|f| f.offset..f.end())
    }

    /// JSON description of the layout
    pub fn to_json(&self) -> serde_json::Value {
        let fields: Vec<serde_json::Value> = self
            .fields
            .iter()
            .map(|f| {
                serde_json::json!({
                    "name": f.name,
                    "offset": f.offset,
                    "width": f.width(),
                    "type": f.ty.to_string(),
                    "compat": f.compat.to_string(),
                    "role": match f.role {
                        FieldRole::Data => "data".to_string(),
                        FieldRole::Status => "status".to_string(),
                        FieldRole::Handle(kind) => format!("handle:{}", kind),
                    },
                })
            })
            .collect();

        serde_json::json!({
            "name": self.name,
            "renamed_from": self.renamed_from,
            "total_width": self.total_width,
            "align": self.align,
            "fields": fields,
        })
    }

    fn defect(&self, msg: impl fmt::Display) -> AbiError {
        AbiError::Registry(format!("{}: {}", self.name, msg))
    }

    /// Check the layout invariants
    fn validate(&self, require_status: bool) -> AbiResult<()> {
        let mut expected = 0;
        for field in &self.fields {
            if field.offset != expected {
                return Err(self.defect(format_args!(
                    "field {} at offset {} overlaps or leaves an undeclared gap (expected {})",
                    field.name, field.offset, expected
                )));
            }
            if field.offset % field.ty.align() != 0 {
                return Err(self.defect(format_args!(
                    "field {} at offset {} is not {}-byte aligned",
                    field.name,
                    field.offset,
                    field.ty.align()
                )));
            }
            match &field.ty {
                FieldType::Uint(w) | FieldType::Int(w) if !matches!(*w, 1 | 2 | 4 | 8) => {
                    return Err(self.defect(format_args!("field {} has unsupported integer width {}", field.name, w)));
                }
                FieldType::Array { element, .. } if element.total_width() == 0 => {
                    return Err(self.defect(format_args!("array {} has zero-width elements", field.name)));
                }
                _ => {}
            }
            if let Compat::RenamedFrom(earlier) = field.compat {
                if self.renamed_from != Some(earlier) {
                    return Err(self.defect(format_args!(
                        "field {} is renamed from {} but the structure is not",
                        field.name, earlier
                    )));
                }
            }
            expected = field.end();
        }

        if expected != self.total_width {
            return Err(self.defect(format_args!("fields cover {} of {} bytes", expected, self.total_width)));
        }
        if self.total_width % self.align != 0 {
            return Err(self.defect(format_args!(
                "size {} needs implicit tail padding to {}-byte alignment",
                self.total_width, self.align
            )));
        }

        let names: Vec<&str> = self.data_fields().map(|f| f.name).collect();
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(self.defect(format_args!("duplicate field {}", name)));
            }
        }

        let status_count = self.data_fields().filter(|f| f.role == FieldRole::Status).count();
        if require_status && !self.fields.is_empty() {
            let last = self.data_fields().last();
            let ends_with_status = matches!(
                last,
                Some(Field { role: FieldRole::Status, ty: FieldType::Uint(4), .. })
            );
            if !ends_with_status || status_count != 1 {
                return Err(self.defect("payload must end with exactly one u32 status field"));
            }
        }

        for field in self.data_fields() {
            if let FieldRole::Handle(_) = field.role {
                if field.ty != FieldType::Int(4) {
                    return Err(self.defect(format_args!("handle field {} must be i32", field.name)));
                }
            }
        }

        for fixup in &self.fixups {
            match self.field(fixup.field) {
                Some(Field { ty: FieldType::Uint(_), .. }) => {}
                _ => {
                    return Err(self.defect(format_args!("fixup targets missing or non-integer field {}", fixup.field)));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone)]
enum SpecKind {
    Uint(usize),
    Int(usize),
    Bytes(usize),
    Array { element: Arc<LayoutDescriptor>, len: ArrayLen },
}

#[derive(Debug, Clone)]
enum Spec {
    Field {
        name: &'static str,
        kind: SpecKind,
        compat: Option<Compat>,
        role: FieldRole,
    },
    Pad(usize),
    Align(usize),
}

/// Declarative description of a structure, laid out by [`LayoutBuilder::build`]
///
/// # Example
///
/// ```
/// use nvshim::layout::LayoutBuilder;
/// use nvshim::AbiConfig;
///
/// let layout = LayoutBuilder::new("UVM_FREE_PARAMS")
///     .u64("Base")
///     .u64("Length")
///     .status("RMStatus")
///     .pad(4)
///     .build(&AbiConfig::default())
///     .unwrap();
/// assert_eq!(layout.total_width(), 24);
/// ```
#[derive(Debug, Clone)]
pub struct LayoutBuilder {
    name: &'static str,
    renamed_from: Option<&'static str>,
    require_status: bool,
    specs: Vec<Spec>,
    fixups: Vec<Fixup>,
    stray_tag: Option<Compat>,
}

impl LayoutBuilder {
    /// Command parameter structure; must end with a status field
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            renamed_from: None,
            require_status: true,
            specs: Vec::new(),
            fixups: Vec::new(),
            stray_tag: None,
        }
    }

    /// Nested element structure without a status field
    pub fn element(name: &'static str) -> Self {
        Self {
            require_status: false,
            ..Self::new(name)
        }
    }

    /// Command that takes no parameter structure
    pub fn parameterless(name: &'static str) -> Self {
        Self::element(name)
    }

    /// Mark this structure as a later shape of `earlier`
    ///
    /// Fields default to [`Compat::RenamedFrom`] instead of [`Compat::Identical`].
    pub fn renamed_from(mut self, earlier: &'static str) -> Self {
        self.renamed_from = Some(earlier);
        self
    }

    fn push(mut self, name: &'static str, kind: SpecKind, role: FieldRole) -> Self {
        self.specs.push(Spec::Field { name, kind, compat: None, role });
        self
    }

    /// `u8` field
    pub fn u8(self, name: &'static str) -> Self {
        self.push(name, SpecKind::Uint(1), FieldRole::Data)
    }

    /// `u32` field
    pub fn u32(self, name: &'static str) -> Self {
        self.push(name, SpecKind::Uint(4), FieldRole::Data)
    }

    /// `u64` field
    pub fn u64(self, name: &'static str) -> Self {
        self.push(name, SpecKind::Uint(8), FieldRole::Data)
    }

    /// `i32` field
    pub fn i32(self, name: &'static str) -> Self {
        self.push(name, SpecKind::Int(4), FieldRole::Data)
    }

    /// Fixed-size byte array
    pub fn bytes(self, name: &'static str, len: usize) -> Self {
        self.push(name, SpecKind::Bytes(len), FieldRole::Data)
    }

    /// 16-byte GPU UUID
    pub fn uuid(self, name: &'static str) -> Self {
        self.bytes(name, 16)
    }

    /// Fixed-size array of nested structures
    ///
    /// Arrays sized by a device constant are tagged [`Compat::VersionSpecific`].
    pub fn array(self, name: &'static str, element: &Arc<LayoutDescriptor>, len: ArrayLen) -> Self {
        let kind = SpecKind::Array {
            element: Arc::clone(element),
            len,
        };
        self.push(name, kind, FieldRole::Data)
    }

    /// `i32` file descriptor relocated between handle tables
    pub fn handle(self, name: &'static str, kind: HandleKind) -> Self {
        self.push(name, SpecKind::Int(4), FieldRole::Handle(kind))
    }

    /// `u32` driver status word
    pub fn status(self, name: &'static str) -> Self {
        self.push(name, SpecKind::Uint(4), FieldRole::Status)
    }

    /// Explicit padding bytes
    pub fn pad(mut self, len: usize) -> Self {
        self.specs.push(Spec::Pad(len));
        self
    }

    /// Padding up to the next multiple of `align`, possibly none
    pub fn align(mut self, align: usize) -> Self {
        self.specs.push(Spec::Align(align.max(1)));
        self
    }

    /// Override the compatibility tag of the most recently added field
    ///
    /// A tag given before any field is reported by [`build`](Self::build).
    pub fn tagged(mut self, tag: Compat) -> Self {
        match self.specs.iter_mut().rev().find(|s| matches!(s, Spec::Field { .. })) {
            Some(Spec::Field { compat, .. }) => *compat = Some(tag),
            _ => {
                self.stray_tag.get_or_insert(tag);
            }
        }
        self
    }

    /// Tag the most recent field [`Compat::Identical`]
    pub fn identical(self) -> Self {
        self.tagged(Compat::Identical)
    }

    /// Tag the most recent field [`Compat::VersionSpecific`]
    pub fn version_specific(self) -> Self {
        self.tagged(Compat::VersionSpecific)
    }

    /// Force `bits` on in `field` for host requests
    pub fn force_bits(mut self, field: &'static str, bits: u64) -> Self {
        self.fixups.push(Fixup { field, set_bits: bits });
        self
    }

    fn default_compat(&self) -> Compat {
        match self.renamed_from {
            Some(earlier) => Compat::RenamedFrom(earlier),
            None => Compat::Identical,
        }
    }

    /// Lay out the structure, resolving array lengths from `config`
    pub fn build(&self, config: &AbiConfig) -> AbiResult<LayoutDescriptor> {
        if let Some(tag) = self.stray_tag {
            return Err(AbiError::Registry(format!("{}: {} tag given before any field", self.name, tag)));
        }

        let default_compat = self.default_compat();
        let mut fields = Vec::with_capacity(self.specs.len());
        let mut offset = 0usize;

        let padding = |offset: usize, len: usize| Field {
            name: PADDING_NAME,
            offset,
            ty: FieldType::Padding(len),
            compat: default_compat,
            role: FieldRole::Data,
        };

        for spec in &self.specs {
            match spec {
                Spec::Pad(len) => {
                    if *len > 0 {
                        fields.push(padding(offset, *len));
                        offset += len;
                    }
                }
                Spec::Align(align) => {
                    let len = (align - offset % align) % align;
                    if len > 0 {
                        fields.push(padding(offset, len));
                        offset += len;
                    }
                }
                Spec::Field { name, kind, compat, role } => {
                    let (ty, symbolic) = match kind {
                        SpecKind::Uint(w) => (FieldType::Uint(*w), false),
                        SpecKind::Int(w) => (FieldType::Int(*w), false),
                        SpecKind::Bytes(n) => (FieldType::Bytes(*n), false),
                        SpecKind::Array { element, len } => (
                            FieldType::Array {
                                element: Arc::clone(element),
                                count: len.resolve(config),
                            },
                            len.is_symbolic(),
                        ),
                    };
                    let compat = compat.unwrap_or(if symbolic { Compat::VersionSpecific } else { default_compat });
                    let width = ty.width();
                    fields.push(Field {
                        name: *name,
                        offset,
                        ty,
                        compat,
                        role: *role,
                    });
                    offset += width;
                }
            }
        }

        let align = fields.iter().map(|f| f.ty.align()).max().unwrap_or(1);
        let handles = fields
            .iter()
            .filter_map(|f| match f.role {
                FieldRole::Handle(kind) => Some(HandleSlot {
                    field: f.name,
                    offset: f.offset,
                    kind,
                }),
                _ => None,
            })
            .collect();

        let layout = LayoutDescriptor {
            name: self.name,
            renamed_from: self.renamed_from,
            fields,
            total_width: offset,
            align,
            handles,
            fixups: self.fixups.clone(),
        };
        layout.validate(self.require_status)?;
        Ok(layout)
    }
}
