use super::{AF_QIPCRTR, Error};

/// The `sockaddr_qrtr` address structure the kernel uses for `AF_QIPCRTR`
/// sockets: `{ sq_family: u16, sq_node: u32, sq_port: u32 }`.
///
/// `#[repr(C)]` here mirrors the kernel ABI struct exactly (including the
/// two bytes of padding the compiler inserts between `sq_family` and
/// `sq_node` to align the latter) because this type's only job is to be
/// handed to `bind`/`connect`/`sendto`/`getsockname` by pointer. This is
/// distinct from [`crate::CtrlPacket`], which travels as a buffer payload
/// and is therefore decoded field-by-field rather than cast.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockAddrQrtr {
    pub sq_family: u16,
    pub sq_node: u32,
    pub sq_port: u32,
}

/// Size in bytes of `struct sockaddr_qrtr` on the wire, padding included.
pub const SOCKADDR_QRTR_SIZE: usize = 12;

impl SockAddrQrtr {
    /// Build the address of the well-known control port on `node`.
    ///
    /// # Test
    ///
    /// ```
    /// use qrtr_wire::SockAddrQrtr;
    ///
    /// let addr = SockAddrQrtr::control(3);
    /// assert_eq!(addr.sq_node, 3);
    /// assert_eq!(addr.sq_port, qrtr_wire::QRTR_PORT_CTRL);
    /// ```
    pub fn control(node: u32) -> Self {
        Self {
            sq_family: AF_QIPCRTR as u16,
            sq_node: node,
            sq_port: super::QRTR_PORT_CTRL,
        }
    }

    pub fn new(node: u32, port: u32) -> Self {
        Self {
            sq_family: AF_QIPCRTR as u16,
            sq_node: node,
            sq_port: port,
        }
    }

    /// Decode an address returned by `getsockname`/`recvfrom`, reading each
    /// field from its known offset rather than casting the buffer.
    ///
    /// # Test
    ///
    /// ```
    /// use qrtr_wire::SockAddrQrtr;
    ///
    /// let mut buf = [0u8; 12];
    /// buf[0..2].copy_from_slice(&42u16.to_ne_bytes());
    /// buf[4..8].copy_from_slice(&7u32.to_ne_bytes());
    /// buf[8..12].copy_from_slice(&99u32.to_ne_bytes());
    ///
    /// let addr = SockAddrQrtr::decode(&buf).unwrap();
    /// assert_eq!(addr.sq_node, 7);
    /// assert_eq!(addr.sq_port, 99);
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < SOCKADDR_QRTR_SIZE {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            sq_family: u16::from_ne_bytes(bytes[0..2].try_into()?),
            sq_node: u32::from_ne_bytes(bytes[4..8].try_into()?),
            sq_port: u32::from_ne_bytes(bytes[8..12].try_into()?),
        })
    }

    /// View this address as a generic `sockaddr` pointer/length pair
    /// suitable for `libc::bind`/`connect`/`sendto`.
    pub fn as_raw(&self) -> (*const libc::sockaddr, libc::socklen_t) {
        (
            (self as *const Self).cast(),
            SOCKADDR_QRTR_SIZE as libc::socklen_t,
        )
    }

    pub fn as_raw_mut(&mut self) -> (*mut libc::sockaddr, libc::socklen_t) {
        (
            (self as *mut Self).cast(),
            SOCKADDR_QRTR_SIZE as libc::socklen_t,
        )
    }
}
