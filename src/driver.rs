//! Submission of translated requests to the host driver

use crate::error::{AbiError, AbiResult};
use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;

/// Path of the UVM character device
pub const UVM_DEVICE_PATH: &str = "/dev/nvidia-uvm";

/// Receives host-shaped parameter buffers
///
/// The driver reads the request from `params` and writes its response,
/// including the status word, back into the same bytes.
pub trait HostDriver {
    /// Issue `command` against the driver
    fn submit(&mut self, command: u32, params: &mut [u8]) -> io::Result<()>;
}

/// Host driver reached through an open device file
#[derive(Debug)]
pub struct FdDriver {
    fd: RawFd,
}

impl FdDriver {
    /// Open a device node read-write
    pub fn open(path: &str) -> AbiResult<Self> {
        let c_path = CString::new(path)
            .map_err(|_| AbiError::InvalidConfig(format!("device path contains a NUL byte: {:?}", path)))?;

        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            log::debug!("cannot open {}: {}", path, err);
            return Err(AbiError::Io {
                path: path.to_string(),
                err,
            });
        }

        log::debug!("opened {} (fd {})", path, fd);
        Ok(Self { fd })
    }

    /// Open `/dev/nvidia-uvm`
    pub fn open_uvm() -> AbiResult<Self> {
        Self::open(UVM_DEVICE_PATH)
    }

    /// Underlying file descriptor
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl HostDriver for FdDriver {
    fn submit(&mut self, command: u32, params: &mut [u8]) -> io::Result<()> {
        let arg = if params.is_empty() {
            std::ptr::null_mut()
        } else {
            params.as_mut_ptr()
        };

        // UVM takes the bare command code as the request number
        let ret = unsafe { libc::ioctl(self.fd, command as _, arg) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            log::debug!("ioctl {:#x} on fd {} failed: {}", command, self.fd, err);
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for FdDriver {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}
