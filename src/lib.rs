//! # nvshim - UVM ioctl ABI translation
//!
//! A library for carrying NVIDIA UVM ioctl parameter structures between an
//! unprivileged client and the host driver when the two were built against
//! different driver versions.
//!
//! ## Features
//!
//! - **Structures as data**: every parameter structure is a layout descriptor
//!   with explicit offsets, widths and padding
//! - **Versioned layouts** selected by driver version, with fail-closed
//!   resolution
//! - **Compatibility tags** driving conversion between layout variants
//! - **Handle relocation** of embedded file descriptors through an external
//!   handle table
//! - **Zeroed padding** in every buffer the library produces
//! - **JSON export** of the full command table for diffing across versions
//!
//! ## Quick Start
//!
//! ```rust
//! use nvshim::{AbiConfig, DriverVersion, HandleMap, UvmProxy};
//! use nvshim::registry::commands::UVM_FREE;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let proxy = UvmProxy::new(AbiConfig::default())?;
//!     let driver: DriverVersion = "535.104.05".parse()?;
//!
//!     let request = proxy.prepare(UVM_FREE, driver, &[0u8; 24], &HandleMap::new())?;
//!     println!("{} needs {} bytes", request.command(), request.buffer().len());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod api;
pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
pub mod handles;
pub mod layout;
pub mod registry;
pub mod version;

// Re-export main API for easy access
pub use api::{HostRequest, UvmProxy};
pub use codec::{convert, decode, encode, encode_into, translate, CanonicalStruct, Value};
pub use config::AbiConfig;
pub use driver::{FdDriver, HostDriver};
pub use error::{AbiError, AbiResult, ErrorKind};
pub use handles::{Direction, HandleKind, HandleMap, HandleRelocator, HandleSlot, HandleTranslator, HandleValue};
pub use layout::{Compat, LayoutBuilder, LayoutDescriptor};
pub use registry::{Command, CommandRegistry};
pub use version::{DriverVersion, VersionRange};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Every UVM command this library can translate
///
/// # Example
///
/// ```
/// for cmd in nvshim::supported_commands() {
///     println!("{}", cmd);
/// }
/// ```
pub fn supported_commands() -> &'static [Command] {
    registry::UVM_COMMANDS
}

/// Whether `code` is a known UVM command
pub fn is_supported(code: u32) -> bool {
    registry::lookup_command(code).is_some()
}

/// Get library information
///
/// # Example
///
/// ```
/// println!("Using nvshim v{}", nvshim::version());
/// ```
pub fn version() -> &'static str {
    VERSION
}


/// Prelude module for convenient imports
///
/// # Example
///
/// ```
/// use nvshim::prelude::*;
///
/// let proxy = UvmProxy::new(AbiConfig::default()).unwrap();
/// assert!(!proxy.registry().is_empty());
/// ```
pub mod prelude {
    pub use crate::api::{HostRequest, UvmProxy};
    pub use crate::codec::{decode, encode, translate, CanonicalStruct, Value};
    pub use crate::config::AbiConfig;
    pub use crate::driver::{FdDriver, HostDriver};
    pub use crate::error::{AbiError, AbiResult};
    pub use crate::handles::{Direction, HandleKind, HandleMap, HandleTranslator};
    pub use crate::registry::CommandRegistry;
    pub use crate::version::DriverVersion;
    pub use crate::{is_supported, supported_commands, version};
}
