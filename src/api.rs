//! High-level request translation pipeline
//!
//! [`UvmProxy`] takes a client's raw parameter buffer for a command and
//! carries it through resolution, reshaping, request fixups and handle
//! relocation to produce the exact bytes the host driver expects, then runs
//! the driver's answer back the other way.

use crate::codec::{convert, decode, encode, CanonicalStruct, Value};
use crate::config::AbiConfig;
use crate::driver::HostDriver;
use crate::error::{AbiError, AbiResult};
use crate::handles::{Direction, HandleTranslator, HandleValue};
use crate::layout::LayoutDescriptor;
use crate::registry::{Command, CommandRegistry};
use crate::version::DriverVersion;
use std::ptr;
use std::sync::Arc;

/// A request translated into host shape, ready for submission
///
/// Dropping it discards the host buffer; nothing is submitted on its own.
#[derive(Debug)]
pub struct HostRequest<'a> {
    command: Command,
    host: &'a LayoutDescriptor,
    client: &'a LayoutDescriptor,
    buffer: Vec<u8>,
    saved: Vec<(&'static str, u64)>,
    client_handles: Vec<(&'static str, HandleValue)>,
}

impl<'a> HostRequest<'a> {
    /// Command being issued
    pub fn command(&self) -> Command {
        self.command
    }

    /// Layout the host driver expects
    pub fn host_layout(&self) -> &'a LayoutDescriptor {
        self.host
    }

    /// Layout the client sent
    pub fn client_layout(&self) -> &'a LayoutDescriptor {
        self.client
    }

    /// Host-shaped parameter bytes
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Host-shaped parameter bytes, for the driver to answer into
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

/// Translates UVM requests between client and host ABI versions
///
/// Cloning is cheap; every clone shares the same immutable registry.
#[derive(Debug, Clone)]
pub struct UvmProxy {
    registry: Arc<CommandRegistry>,
}

impl UvmProxy {
    /// Proxy over the full UVM command table
    pub fn new(config: AbiConfig) -> AbiResult<Self> {
        Ok(Self::with_registry(Arc::new(CommandRegistry::uvm(config)?)))
    }

    /// Proxy over an existing registry
    pub fn with_registry(registry: Arc<CommandRegistry>) -> Self {
        Self { registry }
    }

    /// Registry used for resolution
    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Active configuration
    pub fn config(&self) -> &AbiConfig {
        self.registry.config()
    }

    /// Translate a client request into host shape
    ///
    /// `driver_version` is the installed host driver. The client's layout is
    /// taken from [`AbiConfig::client_version`] when set.
    pub fn prepare(
        &self,
        code: u32,
        driver_version: DriverVersion,
        raw: &[u8],
        translator: &dyn HandleTranslator,
    ) -> AbiResult<HostRequest<'_>> {
        // 1. Reject unknown commands before touching the buffer
        let command = *self.registry.command(code).ok_or(AbiError::UnknownCommand(code))?;

        // 2. Resolve both sides
        let host = self.registry.resolve(code, driver_version)?;
        let client_version = self.config().client_version.unwrap_or(driver_version);
        let client = self.registry.resolve(code, client_version)?;

        // 3. Decode and reshape
        let decoded = decode(raw, client)?;
        let mut value = if ptr::eq(client, host) {
            decoded
        } else {
            convert(&decoded, client, host)?
        };

        // 4. Force required bits, remembering what the client sent
        let mut saved = Vec::new();
        if self.config().apply_request_fixups {
            for fixup in host.fixups() {
                let original = value
                    .get_uint(fixup.field)
                    .ok_or_else(|| AbiError::malformed(host.name(), fixup.field, "fixup target has no value"))?;
                saved.push((fixup.field, original));
                value.set(fixup.field, Value::Uint(original | fixup.set_bits));
            }
        }

        // 5. Remember the client's handles, encode and relocate into the host's table
        let relocator = host.relocator();
        let client_handles = relocator
            .slots()
            .iter()
            .map(|slot| relocator.get_canonical(&value, slot).map(|handle| (slot.field, handle)))
            .collect::<AbiResult<Vec<_>>>()?;
        let mut buffer = encode(&value, host)?;
        let relocated = relocator.relocate(&mut buffer, Direction::ToHost, translator)?;

        log::debug!(
            "{}: {} -> {} ({} bytes, {} handles)",
            command,
            client.name(),
            host.name(),
            buffer.len(),
            relocated
        );

        Ok(HostRequest {
            command,
            host,
            client,
            buffer,
            saved,
            client_handles,
        })
    }

    /// Translate the host's answer back into the client's shape
    ///
    /// Handle fields are input-only: they get back the values the client
    /// sent, so the handle table is not consulted once the driver has run.
    pub fn complete(&self, request: HostRequest<'_>) -> AbiResult<Vec<u8>> {
        let HostRequest {
            command,
            host,
            client,
            buffer,
            saved,
            client_handles,
        } = request;

        let decoded = decode(&buffer, host)?;
        let mut value: CanonicalStruct = if ptr::eq(client, host) {
            decoded
        } else {
            convert(&decoded, host, client)?
        };

        for (field, original) in saved {
            if client.field(field).is_some() {
                value.set(field, Value::Uint(original));
            }
        }
        for (field, handle) in client_handles {
            if client.field(field).is_some() {
                value.set(field, Value::Int(handle.into()));
            }
        }

        log::trace!("{}: response {} -> {}", command, host.name(), client.name());
        encode(&value, client)
    }

    /// Full round trip: translate, submit to `driver`, translate back
    ///
    /// On any error nothing further is submitted and no response is produced.
    pub fn handle(
        &self,
        driver: &mut dyn HostDriver,
        code: u32,
        driver_version: DriverVersion,
        raw: &[u8],
        translator: &dyn HandleTranslator,
    ) -> AbiResult<Vec<u8>> {
        let mut request = self.prepare(code, driver_version, raw, translator)?;

        if let Err(e) = driver.submit(code, request.buffer_mut()) {
            log::warn!("{} failed in the host driver: {}", request.command(), e);
            return Err(e.into());
        }

        self.complete(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::{HandleKind, HandleMap};
    use crate::layout::uvm::UVM_INIT_FLAGS_MULTI_PROCESS_SHARING_MODE;
    use crate::registry::commands::*;
    use pretty_assertions::assert_eq;
    use std::io;

    const V535: DriverVersion = DriverVersion::new(535, 104, 5);
    const V550: DriverVersion = DriverVersion::new(550, 54, 14);

    /// Records submissions and answers with a fixed status word
    #[derive(Default)]
    struct RecordingDriver {
        calls: Vec<(u32, Vec<u8>)>,
        answer: Option<(usize, u32)>,
        fail: bool,
    }

    impl HostDriver for RecordingDriver {
        fn submit(&mut self, command: u32, params: &mut [u8]) -> io::Result<()> {
            self.calls.push((command, params.to_vec()));
            if self.fail {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            if let Some((offset, status)) = self.answer {
                params[offset..offset + 4].copy_from_slice(&status.to_le_bytes());
                // scribble over everything past the status word
                params[offset + 4..].fill(0xee);
            }
            Ok(())
        }
    }

    fn free_params(base: u64) -> Vec<u8> {
        let mut raw = vec![0u8; 24];
        raw[0..8].copy_from_slice(&base.to_le_bytes());
        raw[8..16].copy_from_slice(&0x1000u64.to_le_bytes());
        raw
    }

    #[test]
    fn test_unknown_command_is_rejected_first() {
        let proxy = UvmProxy::new(AbiConfig::default()).unwrap();
        let err = proxy.prepare(0xdead, V535, &[], &HandleMap::new()).unwrap_err();
        assert!(matches!(err, AbiError::UnknownCommand(0xdead)));
    }

    #[test]
    fn test_same_version_passes_payload_through() {
        let proxy = UvmProxy::new(AbiConfig::default()).unwrap();
        let raw = free_params(0x7000);
        let request = proxy.prepare(UVM_FREE, V535, &raw, &HandleMap::new()).unwrap();
        assert_eq!(request.buffer(), &raw[..]);
        assert!(ptr::eq(request.host_layout(), request.client_layout()));
    }

    #[test]
    fn test_handle_returns_driver_status() {
        let proxy = UvmProxy::new(AbiConfig::default()).unwrap();
        let status_offset = proxy.registry().resolve(UVM_FREE, V535).unwrap().status_field().unwrap().offset;
        let mut driver = RecordingDriver {
            answer: Some((status_offset, 0x1f)),
            ..Default::default()
        };

        let response = proxy.handle(&mut driver, UVM_FREE, V535, &free_params(0x7000), &HandleMap::new()).unwrap();
        assert_eq!(driver.calls.len(), 1);
        assert_eq!(driver.calls[0].0, UVM_FREE);
        assert_eq!(&response[0..8], &0x7000u64.to_le_bytes());
        assert_eq!(&response[16..20], &0x1fu32.to_le_bytes());
        // padding written by the driver is zeroed on the way back
        assert_eq!(&response[20..24], &[0u8; 4]);
    }

    #[test]
    fn test_driver_failure_produces_no_response() {
        let proxy = UvmProxy::new(AbiConfig::default()).unwrap();
        let mut driver = RecordingDriver {
            fail: true,
            ..Default::default()
        };
        let err = proxy.handle(&mut driver, UVM_FREE, V535, &free_params(1), &HandleMap::new()).unwrap_err();
        assert!(matches!(err, AbiError::Driver(_)));
    }

    #[test]
    fn test_initialize_fixup_is_restored() {
        let proxy = UvmProxy::new(AbiConfig::default()).unwrap();
        let mut raw = vec![0u8; 16];
        raw[0..8].copy_from_slice(&0x1u64.to_le_bytes());

        let request = proxy.prepare(UVM_INITIALIZE, V535, &raw, &HandleMap::new()).unwrap();
        let flags = u64::from_le_bytes(request.buffer()[0..8].try_into().unwrap());
        assert_eq!(flags, 0x1 | UVM_INIT_FLAGS_MULTI_PROCESS_SHARING_MODE);

        let response = proxy.complete(request).unwrap();
        assert_eq!(&response[0..8], &0x1u64.to_le_bytes());
    }

    #[test]
    fn test_fixups_can_be_disabled() {
        let config = AbiConfig {
            apply_request_fixups: false,
            ..AbiConfig::default()
        };
        let proxy = UvmProxy::new(config).unwrap();
        let request = proxy.prepare(UVM_INITIALIZE, V535, &[0u8; 16], &HandleMap::new()).unwrap();
        assert_eq!(request.buffer(), &[0u8; 16]);
    }

    #[test]
    fn test_parameterless_command() {
        let proxy = UvmProxy::new(AbiConfig::default()).unwrap();
        let mut driver = RecordingDriver::default();
        let response = proxy.handle(&mut driver, UVM_DEINITIALIZE, V535, &[], &HandleMap::new()).unwrap();
        assert!(response.is_empty());
        assert_eq!(driver.calls, vec![(UVM_DEINITIALIZE, Vec::new())]);
    }

    #[test]
    fn test_older_client_on_newer_host() {
        let config = AbiConfig {
            client_version: Some(V535),
            ..AbiConfig::default()
        };
        let proxy = UvmProxy::new(config).unwrap();
        let mut map = HandleMap::new();
        map.insert(HandleKind::ControlFd, 3, 103);

        let client = proxy.registry().resolve(UVM_MAP_EXTERNAL_ALLOCATION, V535).unwrap();
        let mut raw = vec![0u8; client.total_width()];
        raw[1184..1188].copy_from_slice(&3i32.to_le_bytes());

        let request = proxy.prepare(UVM_MAP_EXTERNAL_ALLOCATION, V550, &raw, &map).unwrap();
        assert_eq!(request.buffer().len(), 9264);
        assert_eq!(&request.buffer()[9248..9252], &103i32.to_le_bytes());

        let response = proxy.complete(request).unwrap();
        assert_eq!(response, raw);
    }

    /// Grants every fd to the host and refuses every reverse lookup
    struct OneWayTable;

    impl HandleTranslator for OneWayTable {
        fn translate_handle(&self, direction: Direction, _kind: HandleKind, value: HandleValue) -> Result<HandleValue, String> {
            match direction {
                Direction::ToHost => Ok(value + 1000),
                Direction::ToClient => Err("closed".to_string()),
            }
        }
    }

    #[test]
    fn test_response_restores_client_handle_without_reverse_lookup() {
        let proxy = UvmProxy::new(AbiConfig::default()).unwrap();
        let layout = proxy.registry().resolve(UVM_REGISTER_GPU, V535).unwrap();
        let status_offset = layout.status_field().unwrap().offset;
        let mut driver = RecordingDriver {
            answer: Some((status_offset, 0)),
            ..Default::default()
        };
        let mut raw = vec![0u8; layout.total_width()];
        raw[24..28].copy_from_slice(&7i32.to_le_bytes());

        let response = proxy.handle(&mut driver, UVM_REGISTER_GPU, V535, &raw, &OneWayTable).unwrap();
        assert_eq!(driver.calls.len(), 1);
        assert_eq!(&driver.calls[0].1[24..28], &1007i32.to_le_bytes());
        assert_eq!(&response[24..28], &7i32.to_le_bytes());
        assert_eq!(response, raw);
    }
}
