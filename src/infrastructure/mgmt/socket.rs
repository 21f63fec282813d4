//! Raw Bluetooth management socket.
//!
//! An HCI socket bound to the control channel with no device, registered
//! with the tokio reactor for reading. Writes go through [`SocketSink`],
//! which shares the descriptor.

use crate::infrastructure::mgmt::client::FrameSink;
use crate::infrastructure::mgmt::codec::HEADER_SIZE;
use nix::libc;
use nix::sys::socket::{recv, send, MsgFlags};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tracing::info;

const BTPROTO_HCI: libc::c_int = 1;
const HCI_DEV_NONE: u16 = 0xffff;
const HCI_CHANNEL_CONTROL: u16 = 3;

/// Largest frame the kernel can deliver.
pub const MAX_FRAME: usize = u16::MAX as usize + HEADER_SIZE;

#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

pub struct MgmtSocket {
    fd: AsyncFd<Arc<OwnedFd>>,
}

impl MgmtSocket {
    pub fn open() -> io::Result<Self> {
        let fd = unsafe {
            let raw_fd = libc::socket(
                libc::PF_BLUETOOTH,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                BTPROTO_HCI,
            );
            if raw_fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let fd = OwnedFd::from_raw_fd(raw_fd);

            let addr = SockaddrHci {
                hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
                hci_dev: HCI_DEV_NONE,
                hci_channel: HCI_CHANNEL_CONTROL,
            };
            let addr_ptr = &addr as *const SockaddrHci as *const libc::sockaddr;
            let addr_len = std::mem::size_of::<SockaddrHci>() as libc::socklen_t;
            if libc::bind(fd.as_raw_fd(), addr_ptr, addr_len) < 0 {
                return Err(io::Error::last_os_error());
            }
            fd
        };

        info!("Management socket opened (fd {})", fd.as_raw_fd());
        Ok(Self {
            fd: AsyncFd::new(Arc::new(fd))?,
        })
    }

    pub fn sink(&self) -> SocketSink {
        SocketSink {
            fd: Arc::clone(self.fd.get_ref()),
        }
    }

    /// Wait for the next frame and copy it into `buf`.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                recv(inner.get_ref().as_raw_fd(), buf, MsgFlags::empty()).map_err(io::Error::from)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// Receive errors the loop should log and ride out.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    ) || err.raw_os_error() == Some(libc::ENOBUFS)
}

pub struct SocketSink {
    fd: Arc<OwnedFd>,
}

impl FrameSink for SocketSink {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let sent = send(self.fd.as_raw_fd(), frame, MsgFlags::empty()).map_err(io::Error::from)?;
        if sent != frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", sent, frame.len()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EINTR)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EAGAIN)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::ENOBUFS)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::ENODEV)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EBADF)));
    }
}
