//! UVM ioctl command table
//!
//! Codes match `kernel-open/nvidia-uvm/uvm_ioctl.h` and `uvm_linux_ioctl.h`.
//! UVM ioctls use the bare code as the request number, so this table is part
//! of the wire contract and must never be renumbered.

use serde::Serialize;
use std::fmt;

/// One driver operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Command {
    /// Request number assigned by the driver vendor
    pub code: u32,
    /// Vendor name of the operation
    pub name: &'static str,
}

impl Command {
    /// Create a command entry
    pub const fn new(code: u32, name: &'static str) -> Self {
        Self { code, name }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#x})", self.name, self.code)
    }
}

// From kernel-open/nvidia-uvm/uvm_linux_ioctl.h:
/// Request number of `UVM_INITIALIZE`
pub const UVM_INITIALIZE: u32 = 0x3000_0001;
/// Request number of `UVM_DEINITIALIZE`
pub const UVM_DEINITIALIZE: u32 = 0x3000_0002;

// From kernel-open/nvidia-uvm/uvm_ioctl.h:
/// Request number of `UVM_CREATE_RANGE_GROUP`
pub const UVM_CREATE_RANGE_GROUP: u32 = 23;
/// Request number of `UVM_DESTROY_RANGE_GROUP`
pub const UVM_DESTROY_RANGE_GROUP: u32 = 24;
/// Request number of `UVM_REGISTER_GPU_VASPACE`
pub const UVM_REGISTER_GPU_VASPACE: u32 = 25;
/// Request number of `UVM_UNREGISTER_GPU_VASPACE`
pub const UVM_UNREGISTER_GPU_VASPACE: u32 = 26;
/// Request number of `UVM_REGISTER_CHANNEL`
pub const UVM_REGISTER_CHANNEL: u32 = 27;
/// Request number of `UVM_UNREGISTER_CHANNEL`
pub const UVM_UNREGISTER_CHANNEL: u32 = 28;
/// Request number of `UVM_ENABLE_PEER_ACCESS`
pub const UVM_ENABLE_PEER_ACCESS: u32 = 29;
/// Request number of `UVM_DISABLE_PEER_ACCESS`
pub const UVM_DISABLE_PEER_ACCESS: u32 = 30;
/// Request number of `UVM_SET_RANGE_GROUP`
pub const UVM_SET_RANGE_GROUP: u32 = 31;
/// Request number of `UVM_MAP_EXTERNAL_ALLOCATION`
pub const UVM_MAP_EXTERNAL_ALLOCATION: u32 = 33;
/// Request number of `UVM_FREE`
pub const UVM_FREE: u32 = 34;
/// Request number of `UVM_REGISTER_GPU`
pub const UVM_REGISTER_GPU: u32 = 37;
/// Request number of `UVM_UNREGISTER_GPU`
pub const UVM_UNREGISTER_GPU: u32 = 38;
/// Request number of `UVM_PAGEABLE_MEM_ACCESS`
pub const UVM_PAGEABLE_MEM_ACCESS: u32 = 39;
/// Request number of `UVM_SET_PREFERRED_LOCATION`
pub const UVM_SET_PREFERRED_LOCATION: u32 = 42;
/// Request number of `UVM_DISABLE_READ_DUPLICATION`
pub const UVM_DISABLE_READ_DUPLICATION: u32 = 45;
/// Request number of `UVM_MIGRATE_RANGE_GROUP`
pub const UVM_MIGRATE_RANGE_GROUP: u32 = 53;
/// Request number of `UVM_TOOLS_READ_PROCESS_MEMORY`
pub const UVM_TOOLS_READ_PROCESS_MEMORY: u32 = 62;
/// Request number of `UVM_TOOLS_WRITE_PROCESS_MEMORY`
pub const UVM_TOOLS_WRITE_PROCESS_MEMORY: u32 = 63;
/// Request number of `UVM_MAP_DYNAMIC_PARALLELISM_REGION`
pub const UVM_MAP_DYNAMIC_PARALLELISM_REGION: u32 = 65;
/// Request number of `UVM_UNMAP_EXTERNAL`
pub const UVM_UNMAP_EXTERNAL: u32 = 66;
/// Request number of `UVM_ALLOC_SEMAPHORE_POOL`
pub const UVM_ALLOC_SEMAPHORE_POOL: u32 = 68;
/// Request number of `UVM_VALIDATE_VA_RANGE`
pub const UVM_VALIDATE_VA_RANGE: u32 = 72;
/// Request number of `UVM_CREATE_EXTERNAL_RANGE`
pub const UVM_CREATE_EXTERNAL_RANGE: u32 = 73;
/// Request number of `UVM_MM_INITIALIZE`
pub const UVM_MM_INITIALIZE: u32 = 75;

/// Every UVM command known to this crate
pub const UVM_COMMANDS: &[Command] = &[
    Command::new(UVM_INITIALIZE, "UVM_INITIALIZE"),
    Command::new(UVM_DEINITIALIZE, "UVM_DEINITIALIZE"),
    Command::new(UVM_CREATE_RANGE_GROUP, "UVM_CREATE_RANGE_GROUP"),
    Command::new(UVM_DESTROY_RANGE_GROUP, "UVM_DESTROY_RANGE_GROUP"),
    Command::new(UVM_REGISTER_GPU_VASPACE, "UVM_REGISTER_GPU_VASPACE"),
    Command::new(UVM_UNREGISTER_GPU_VASPACE, "UVM_UNREGISTER_GPU_VASPACE"),
    Command::new(UVM_REGISTER_CHANNEL, "UVM_REGISTER_CHANNEL"),
    Command::new(UVM_UNREGISTER_CHANNEL, "UVM_UNREGISTER_CHANNEL"),
    Command::new(UVM_ENABLE_PEER_ACCESS, "UVM_ENABLE_PEER_ACCESS"),
    Command::new(UVM_DISABLE_PEER_ACCESS, "UVM_DISABLE_PEER_ACCESS"),
    Command::new(UVM_SET_RANGE_GROUP, "UVM_SET_RANGE_GROUP"),
    Command::new(UVM_MAP_EXTERNAL_ALLOCATION, "UVM_MAP_EXTERNAL_ALLOCATION"),
    Command::new(UVM_FREE, "UVM_FREE"),
    Command::new(UVM_REGISTER_GPU, "UVM_REGISTER_GPU"),
    Command::new(UVM_UNREGISTER_GPU, "UVM_UNREGISTER_GPU"),
    Command::new(UVM_PAGEABLE_MEM_ACCESS, "UVM_PAGEABLE_MEM_ACCESS"),
    Command::new(UVM_SET_PREFERRED_LOCATION, "UVM_SET_PREFERRED_LOCATION"),
    Command::new(UVM_DISABLE_READ_DUPLICATION, "UVM_DISABLE_READ_DUPLICATION"),
    Command::new(UVM_MIGRATE_RANGE_GROUP, "UVM_MIGRATE_RANGE_GROUP"),
    Command::new(UVM_TOOLS_READ_PROCESS_MEMORY, "UVM_TOOLS_READ_PROCESS_MEMORY"),
    Command::new(UVM_TOOLS_WRITE_PROCESS_MEMORY, "UVM_TOOLS_WRITE_PROCESS_MEMORY"),
    Command::new(UVM_MAP_DYNAMIC_PARALLELISM_REGION, "UVM_MAP_DYNAMIC_PARALLELISM_REGION"),
    Command::new(UVM_UNMAP_EXTERNAL, "UVM_UNMAP_EXTERNAL"),
    Command::new(UVM_ALLOC_SEMAPHORE_POOL, "UVM_ALLOC_SEMAPHORE_POOL"),
    Command::new(UVM_VALIDATE_VA_RANGE, "UVM_VALIDATE_VA_RANGE"),
    Command::new(UVM_CREATE_EXTERNAL_RANGE, "UVM_CREATE_EXTERNAL_RANGE"),
    Command::new(UVM_MM_INITIALIZE, "UVM_MM_INITIALIZE"),
];

/// Look up a command by request number
pub fn lookup_command(code: u32) -> Option<&'static Command> {
    UVM_COMMANDS.iter().find(|c| c.code == code)
}

/// Look up a command by name (case-insensitive, `UVM_` prefix optional) or number
///
/// Numbers may be decimal or `0x`-prefixed hexadecimal.
pub fn find_command(query: &str) -> Option<&'static Command> {
    let query = query.trim();
    let code = match query.strip_prefix("0x").or_else(|| query.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => query.parse::<u32>().ok(),
    };
    if let Some(code) = code {
        return lookup_command(code);
    }

    let upper = query.to_ascii_uppercase();
    let full = if upper.starts_with("UVM_") { upper } else { format!("UVM_{}", upper) };
    UVM_COMMANDS.iter().find(|c| c.name == full)
}
