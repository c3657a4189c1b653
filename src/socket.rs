//! Raw `AF_QIPCRTR` socket plumbing.
//!
//! `tokio::net::UdpSocket` has no constructor for a custom address family,
//! so sockets here are opened and addressed directly through `libc` and
//! handed to `tokio::io::unix::AsyncFd` for read-readiness, the same shape
//! used to drive a C library's own socket handle inside an async runtime.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use tokio::io::unix::AsyncFd;
use wire::{AF_QIPCRTR, SockAddrQrtr};

/// Owns one `AF_QIPCRTR` file descriptor; closes it on drop.
#[derive(Debug)]
struct QrtrFd(RawFd);

impl AsRawFd for QrtrFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for QrtrFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn open_raw() -> io::Result<QrtrFd> {
    let fd = unsafe { libc::socket(AF_QIPCRTR, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    if let Err(err) = check(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }) {
        unsafe { libc::close(fd) };
        return Err(err);
    }

    Ok(QrtrFd(fd))
}

/// A non-blocking `AF_QIPCRTR` datagram socket wired into the event loop.
///
/// Shared by the bus observer (kernel-assigned local address, read back via
/// `getsockname`) and client channels (connected, never bound) — both need
/// the same open/read/write primitives over a socket kind the standard
/// library can't name.
pub(crate) struct QrtrSocket {
    inner: AsyncFd<QrtrFd>,
}

impl QrtrSocket {
    pub(crate) fn open() -> io::Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(open_raw()?)?,
        })
    }

    pub(crate) fn connect(&self, addr: &SockAddrQrtr) -> io::Result<()> {
        let (ptr, len) = addr.as_raw();
        check(unsafe { libc::connect(self.inner.get_ref().as_raw_fd(), ptr, len) })
    }

    pub(crate) fn getsockname(&self) -> io::Result<SockAddrQrtr> {
        let mut addr = SockAddrQrtr::new(0, 0);
        let (ptr, mut len) = addr.as_raw_mut();

        check(unsafe { libc::getsockname(self.inner.get_ref().as_raw_fd(), ptr, &mut len) })?;
        Ok(addr)
    }

    /// Sends `buf` as one datagram to `addr`. Non-blocking; a `sendto` that
    /// would block is surfaced as `WouldBlock` rather than retried, matching
    /// the spec's no-queueing send path.
    pub(crate) fn send_to(&self, buf: &[u8], addr: &SockAddrQrtr) -> io::Result<usize> {
        let (ptr, len) = addr.as_raw();
        let rc = unsafe {
            libc::sendto(
                self.inner.get_ref().as_raw_fd(),
                buf.as_ptr().cast(),
                buf.len(),
                0,
                ptr,
                len,
            )
        };

        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(rc as usize)
    }

    /// Sends `buf` on the socket's connected remote address.
    pub(crate) fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let rc = unsafe {
            libc::send(
                self.inner.get_ref().as_raw_fd(),
                buf.as_ptr().cast(),
                buf.len(),
                0,
            )
        };

        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(rc as usize)
    }

    /// Awaits read-readiness and receives exactly one datagram into `buf`,
    /// returning the number of bytes written.
    pub(crate) async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;

            let recv_once = |fd: &AsyncFd<QrtrFd>| -> io::Result<usize> {
                let rc = unsafe {
                    libc::recv(fd.get_ref().as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0)
                };
                if rc < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(rc as usize)
            };

            match guard.try_io(recv_once) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Awaits write-readiness, for retrying a `send`/`send_to` that returned
    /// `WouldBlock`.
    pub(crate) async fn writable(&self) -> io::Result<()> {
        self.inner.writable().await?.retain_ready();
        Ok(())
    }
}
