//! Handle fields and their relocation
//!
//! Some parameter structures embed file descriptors that are only meaningful
//! in the process that opened them. Layouts declare those fields up front as
//! [`HandleSlot`]s, and a [`HandleRelocator`] rewrites them in place through
//! an external [`HandleTranslator`] as a buffer crosses between client and
//! host. Layouts without handle fields never reach the translator.

use crate::codec::{CanonicalStruct, Value};
use crate::error::{AbiError, AbiResult};
use crate::layout::LayoutDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Raw handle value as stored in a parameter structure
pub type HandleValue = i32;

/// What a handle field refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandleKind {
    /// Resource-manager control file (`RMCtrlFD`)
    ControlFd,
    /// UVM device file (`UvmFD`)
    UvmFd,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::ControlFd => write!(f, "control-fd"),
            HandleKind::UvmFd => write!(f, "uvm-fd"),
        }
    }
}

/// Which way a buffer is crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Client request on its way to the host driver
    ToHost,
    /// Host response on its way back to the client
    ToClient,
}

/// Declared location of one handle field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleSlot {
    /// Field name
    pub field: &'static str,
    /// Byte offset of the `i32` value
    pub offset: usize,
    /// What the handle refers to
    pub kind: HandleKind,
}

impl HandleSlot {
    /// Read the handle from a raw buffer
    pub fn read(&self, raw: &[u8]) -> Option<HandleValue> {
        let bytes = raw.get(self.offset..self.offset + 4)?;
        Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Overwrite the handle in a raw buffer
    pub fn write(&self, raw: &mut [u8], value: HandleValue) -> Option<()> {
        raw.get_mut(self.offset..self.offset + 4)?.copy_from_slice(&value.to_le_bytes());
        Some(())
    }
}

/// External handle table mapping values between client and host
#[cfg_attr(test, mockall::automock)]
pub trait HandleTranslator {
    /// Map `value` across the boundary, or explain why it is refused
    fn translate_handle(&self, direction: Direction, kind: HandleKind, value: HandleValue) -> Result<HandleValue, String>;
}

/// Reads and rewrites the handle fields of one layout
#[derive(Debug, Clone, Copy)]
pub struct HandleRelocator<'a> {
    layout: &'a LayoutDescriptor,
}

impl<'a> HandleRelocator<'a> {
    /// Relocator over `layout`'s declared handle slots
    pub fn new(layout: &'a LayoutDescriptor) -> Self {
        Self { layout }
    }

    /// Declared slots
    pub fn slots(&self) -> &'a [HandleSlot] {
        self.layout.handle_slots()
    }

    /// Whether the layout has no handle fields
    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Slot for the handle field `field`
    pub fn slot(&self, field: &str) -> Option<&'a HandleSlot> {
        self.slots().iter().find(|s| s.field == field)
    }

    fn check_size(&self, raw: &[u8]) -> AbiResult<()> {
        if raw.len() != self.layout.total_width() {
            return Err(AbiError::SizeMismatch {
                layout: self.layout.name(),
                expected: self.layout.total_width(),
                actual: raw.len(),
            });
        }
        Ok(())
    }

    fn out_of_range(&self, slot: &HandleSlot) -> AbiError {
        AbiError::malformed(self.layout.name(), slot.field, "handle lies outside the buffer")
    }

    /// Handle value stored in a raw buffer
    pub fn get_handle(&self, raw: &[u8], slot: &HandleSlot) -> AbiResult<HandleValue> {
        self.check_size(raw)?;
        slot.read(raw).ok_or_else(|| self.out_of_range(slot))
    }

    /// Store a handle value in a raw buffer
    pub fn set_handle(&self, raw: &mut [u8], slot: &HandleSlot, value: HandleValue) -> AbiResult<()> {
        self.check_size(raw)?;
        slot.write(raw, value).ok_or_else(|| self.out_of_range(slot))
    }

    /// Handle value held by a canonical struct
    pub fn get_canonical(&self, value: &CanonicalStruct, slot: &HandleSlot) -> AbiResult<HandleValue> {
        let v = value
            .get(slot.field)
            .and_then(Value::as_int)
            .ok_or_else(|| AbiError::malformed(self.layout.name(), slot.field, "missing handle value"))?;
        HandleValue::try_from(v)
            .map_err(|_| AbiError::malformed(self.layout.name(), slot.field, format!("{} is not an i32 handle", v)))
    }

    /// Store a handle value in a canonical struct
    pub fn set_canonical(&self, value: &mut CanonicalStruct, slot: &HandleSlot, handle: HandleValue) {
        value.set(slot.field, Value::Int(handle.into()));
    }

    /// Translate every handle field of `raw` in place, returning how many were rewritten
    ///
    /// Stops at the first refused handle. The buffer may then hold a mix of
    /// translated and untranslated values and must be discarded.
    pub fn relocate(&self, raw: &mut [u8], direction: Direction, translator: &dyn HandleTranslator) -> AbiResult<usize> {
        let slots = self.slots();
        if slots.is_empty() {
            return Ok(0);
        }
        self.check_size(raw)?;

        for slot in slots {
            let value = slot.read(raw).ok_or_else(|| self.out_of_range(slot))?;
            let mapped = translator
                .translate_handle(direction, slot.kind, value)
                .map_err(|reason| {
                    log::warn!(
                        "{}.{}: {} handle {} refused ({:?}): {}",
                        self.layout.name(),
                        slot.field,
                        slot.kind,
                        value,
                        direction,
                        reason
                    );
                    AbiError::HandleTranslationDenied {
                        layout: self.layout.name(),
                        field: slot.field,
                        value,
                        reason,
                    }
                })?;
            slot.write(raw, mapped).ok_or_else(|| self.out_of_range(slot))?;
            log::trace!("{}.{}: {} -> {}", self.layout.name(), slot.field, value, mapped);
        }

        Ok(slots.len())
    }
}

/// In-memory bidirectional handle table
#[derive(Debug, Clone, Default)]
pub struct HandleMap {
    to_host: HashMap<(HandleKind, HandleValue), HandleValue>,
    to_client: HashMap<(HandleKind, HandleValue), HandleValue>,
}

impl HandleMap {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair a client handle with the host handle it stands for
    ///
    /// The table stays one-to-one. Re-pairing a client handle forgets its old
    /// host handle, and a host handle already paired with another client is
    /// taken away from it: that client handle is returned and no longer
    /// translates in either direction.
    pub fn insert(&mut self, kind: HandleKind, client: HandleValue, host: HandleValue) -> Option<HandleValue> {
        if let Some(old_host) = self.to_host.insert((kind, client), host) {
            if old_host != host {
                self.to_client.remove(&(kind, old_host));
            }
        }
        let displaced = self.to_client.insert((kind, host), client).filter(|&old| old != client);
        if let Some(old_client) = displaced {
            log::debug!("{} {} now stands for {} instead of {}", kind, host, client, old_client);
            self.to_host.remove(&(kind, old_client));
        }
        displaced
    }

    /// Forget a client handle, returning the host handle it mapped to
    pub fn remove(&mut self, kind: HandleKind, client: HandleValue) -> Option<HandleValue> {
        let host = self.to_host.remove(&(kind, client))?;
        self.to_client.remove(&(kind, host));
        Some(host)
    }

    /// Number of pairings
    pub fn len(&self) -> usize {
        self.to_host.len()
    }

    /// Whether the table holds no pairings
    pub fn is_empty(&self) -> bool {
        self.to_host.is_empty()
    }
}

impl HandleTranslator for HandleMap {
    fn translate_handle(&self, direction: Direction, kind: HandleKind, value: HandleValue) -> Result<HandleValue, String> {
        let table = match direction {
            Direction::ToHost => &self.to_host,
            Direction::ToClient => &self.to_client,
        };
        table
            .get(&(kind, value))
            .copied()
            .ok_or_else(|| format!("{} {} is not registered", kind, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AbiConfig;
    use crate::layout::LayoutBuilder;
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;

    fn vaspace() -> LayoutDescriptor {
        LayoutBuilder::new("UVM_REGISTER_GPU_VASPACE_PARAMS")
            .uuid("GPUUUID")
            .handle("RMCtrlFD", HandleKind::ControlFd)
            .u32("HClient")
            .u32("HVASpace")
            .status("RMStatus")
            .build(&AbiConfig::default())
            .unwrap()
    }

    #[test]
    fn test_get_and_set_raw() {
        let layout = vaspace();
        let relocator = layout.relocator();
        let slot = relocator.slot("RMCtrlFD").unwrap();

        let mut raw = vec![0u8; 32];
        raw[16..20].copy_from_slice(&5i32.to_le_bytes());
        assert_eq!(relocator.get_handle(&raw, slot).unwrap(), 5);

        relocator.set_handle(&mut raw, slot, -3).unwrap();
        assert_eq!(&raw[16..20], &(-3i32).to_le_bytes());
        assert!(relocator.get_handle(&raw[..20], slot).is_err());
    }

    #[test]
    fn test_get_and_set_canonical() {
        let layout = vaspace();
        let relocator = layout.relocator();
        let slot = relocator.slot("RMCtrlFD").unwrap();

        let mut value = CanonicalStruct::zeroed(&layout);
        relocator.set_canonical(&mut value, slot, 12);
        assert_eq!(relocator.get_canonical(&value, slot).unwrap(), 12);

        value.set("RMCtrlFD", Value::Int(i64::MAX));
        assert!(relocator.get_canonical(&value, slot).is_err());
    }

    #[test]
    fn test_relocate_rewrites_in_place() {
        let layout = vaspace();
        let mut raw = vec![0u8; 32];
        raw[16..20].copy_from_slice(&5i32.to_le_bytes());

        let mut translator = MockHandleTranslator::new();
        translator
            .expect_translate_handle()
            .with(eq(Direction::ToHost), eq(HandleKind::ControlFd), eq(5))
            .times(1)
            .returning(|_, _, _| Ok(42));

        let count = layout.relocator().relocate(&mut raw, Direction::ToHost, &translator).unwrap();
        assert_eq!(count, 1);
        assert_eq!(&raw[16..20], &42i32.to_le_bytes());
    }

    #[test]
    fn test_relocate_denied() {
        let layout = vaspace();
        let mut raw = vec![0u8; 32];
        raw[16..20].copy_from_slice(&99i32.to_le_bytes());

        let mut translator = MockHandleTranslator::new();
        translator
            .expect_translate_handle()
            .returning(|_, _, _| Err("not owned by caller".to_string()));

        let err = layout.relocator().relocate(&mut raw, Direction::ToHost, &translator).unwrap_err();
        match err {
            AbiError::HandleTranslationDenied { field, value, reason, .. } => {
                assert_eq!(field, "RMCtrlFD");
                assert_eq!(value, 99);
                assert_eq!(reason, "not owned by caller");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_handle_free_layout_never_calls_translator() {
        let layout = LayoutBuilder::new("UVM_FREE_PARAMS")
            .u64("Base")
            .u64("Length")
            .status("RMStatus")
            .pad(4)
            .build(&AbiConfig::default())
            .unwrap();
        let mut translator = MockHandleTranslator::new();
        translator.expect_translate_handle().never();

        // wrong size too: handle-free layouts are not inspected at all
        let mut raw = vec![0u8; 3];
        assert_eq!(layout.relocator().relocate(&mut raw, Direction::ToHost, &translator).unwrap(), 0);
    }

    #[test]
    fn test_handle_map_round_trip() {
        let mut map = HandleMap::new();
        map.insert(HandleKind::ControlFd, 5, 105);
        map.insert(HandleKind::UvmFd, 5, 205);
        assert_eq!(map.len(), 2);

        assert_eq!(map.translate_handle(Direction::ToHost, HandleKind::ControlFd, 5), Ok(105));
        assert_eq!(map.translate_handle(Direction::ToClient, HandleKind::ControlFd, 105), Ok(5));
        assert_eq!(map.translate_handle(Direction::ToHost, HandleKind::UvmFd, 5), Ok(205));
        assert!(map.translate_handle(Direction::ToHost, HandleKind::ControlFd, 6).is_err());

        map.insert(HandleKind::ControlFd, 5, 106);
        assert!(map.translate_handle(Direction::ToClient, HandleKind::ControlFd, 105).is_err());

        assert_eq!(map.remove(HandleKind::ControlFd, 5), Some(106));
        assert!(map.translate_handle(Direction::ToClient, HandleKind::ControlFd, 106).is_err());
    }

    #[test]
    fn test_handle_map_displaces_earlier_client() {
        let mut map = HandleMap::new();
        assert_eq!(map.insert(HandleKind::ControlFd, 3, 103), None);
        assert_eq!(map.insert(HandleKind::ControlFd, 3, 103), None);
        assert_eq!(map.insert(HandleKind::ControlFd, 4, 103), Some(3));

        assert_eq!(map.len(), 1);
        assert!(map.translate_handle(Direction::ToHost, HandleKind::ControlFd, 3).is_err());
        assert_eq!(map.translate_handle(Direction::ToHost, HandleKind::ControlFd, 4), Ok(103));
        assert_eq!(map.translate_handle(Direction::ToClient, HandleKind::ControlFd, 103), Ok(4));
    }
}
