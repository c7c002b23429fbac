//! Translate a UVM_REGISTER_GPU request and submit it to a stand-in driver

use nvshim::registry::commands::UVM_REGISTER_GPU;
use nvshim::{AbiConfig, DriverVersion, HandleKind, HandleMap, HostDriver, LayoutDescriptor, UvmProxy};
use std::io;

/// Pretends to be the UVM driver: reports success in the status word
struct FakeUvm<'a> {
    layout: &'a LayoutDescriptor,
}

impl HostDriver for FakeUvm<'_> {
    fn submit(&mut self, command: u32, params: &mut [u8]) -> io::Result<()> {
        println!("  → ioctl {:#x} with {} bytes", command, params.len());

        let relocator = self.layout.relocator();
        if let Some(slot) = relocator.slot("RMCtrlFD") {
            let fd = relocator
                .get_handle(params, slot)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            println!("    RMCtrlFD seen by host: {}", fd);
        }

        if let Some(status) = self.layout.status_field() {
            if let Some(word) = params.get_mut(status.offset..status.offset + 4) {
                word.copy_from_slice(&0u32.to_le_bytes());
            }
        }
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("🖥️  nvshim UVM_REGISTER_GPU Example");
    println!("==================================\n");

    let proxy = UvmProxy::new(AbiConfig::default())?;
    let driver_version: DriverVersion = "535.104.05".parse()?;

    // The sandboxed client knows the control file as fd 7, the host as fd 31
    let mut handles = HandleMap::new();
    handles.insert(HandleKind::ControlFd, 7, 31);

    let layout = proxy.registry().resolve(UVM_REGISTER_GPU, driver_version)?;
    println!("📊 {} ({} bytes)", layout.name(), layout.total_width());

    let mut request = vec![0u8; layout.total_width()];
    request[..16].copy_from_slice(&[0x42; 16]);
    request[24..28].copy_from_slice(&7i32.to_le_bytes());
    request[28..32].copy_from_slice(&0xc1d0_0001u32.to_le_bytes());

    match proxy.handle(&mut FakeUvm { layout }, UVM_REGISTER_GPU, driver_version, &request, &handles) {
        Ok(response) => {
            let value = nvshim::decode(&response, layout)?;
            println!("\n✅ Response for the client:");
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Err(e) => {
            println!("❌ Error ({:?}): {}", e.kind(), e);
        }
    }

    Ok(())
}
