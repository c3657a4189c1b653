use super::{CMD_DEL_SERVER, CMD_NEW_LOOKUP, CMD_NEW_SERVER, Error};

/// Size in bytes of `struct qrtr_ctrl_pkt` on the wire.
pub const CTRL_PACKET_SIZE: usize = 20;

/// The control packet's `cmd` field, decoded. Unrecognized values are not an
/// error: the decoding loop logs and drops them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    NewServer,
    DelServer,
    NewLookup,
    Unknown(u32),
}

impl From<u32> for Cmd {
    fn from(value: u32) -> Self {
        match value {
            CMD_NEW_SERVER => Self::NewServer,
            CMD_DEL_SERVER => Self::DelServer,
            CMD_NEW_LOOKUP => Self::NewLookup,
            other => Self::Unknown(other),
        }
    }
}

impl From<Cmd> for u32 {
    fn from(cmd: Cmd) -> Self {
        match cmd {
            Cmd::NewServer => CMD_NEW_SERVER,
            Cmd::DelServer => CMD_DEL_SERVER,
            Cmd::NewLookup => CMD_NEW_LOOKUP,
            Cmd::Unknown(value) => value,
        }
    }
}

/// The `NEW_SERVER`/`DEL_SERVER` payload union. Zeroed for `NEW_LOOKUP`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Payload {
    pub service: u32,
    pub node: u32,
    pub port: u32,
    /// Raw packed `instance` field: low 8 bits are the version, high 24
    /// bits are the instance id. See [`Payload::version`]/[`Payload::instance`].
    pub instance_raw: u32,
}

impl Payload {
    /// Low 8 bits of the packed instance field.
    ///
    /// # Test
    ///
    /// ```
    /// use qrtr_wire::ctrl::Payload;
    ///
    /// let p = Payload { instance_raw: 0x0000_0301, ..Default::default() };
    /// assert_eq!(p.version(), 1);
    /// assert_eq!(p.instance(), 3);
    /// ```
    pub fn version(&self) -> u8 {
        (self.instance_raw & 0xff) as u8
    }

    /// High 24 bits of the packed instance field.
    pub fn instance(&self) -> u32 {
        self.instance_raw >> 8
    }

    pub fn pack(version: u8, instance: u32) -> u32 {
        (instance << 8) | version as u32
    }
}

/// A fixed-size `struct qrtr_ctrl_pkt`, little-endian on the wire.
///
/// ```text
/// offset 0   : cmd        : u32
/// offset 4   : service    : u32
/// offset 8   : instance   : u32   // low 8 bits version, high 24 bits instance
/// offset 12  : node       : u32
/// offset 16  : port       : u32
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtrlPacket {
    pub cmd: Cmd,
    pub payload: Payload,
}

impl CtrlPacket {
    /// Build the `NEW_LOOKUP` packet sent once at startup; payload zeroed.
    pub fn new_lookup() -> Self {
        Self {
            cmd: Cmd::NewLookup,
            payload: Payload::default(),
        }
    }

    /// Decode a control packet from a buffer, reading each field from its
    /// known little-endian offset. Returns [`Error::InvalidInput`] on a
    /// short read rather than panicking or reading past the buffer.
    ///
    /// # Test
    ///
    /// ```
    /// use qrtr_wire::ctrl::{Cmd, CtrlPacket};
    ///
    /// let mut buf = [0u8; 20];
    /// buf[0..4].copy_from_slice(&2u32.to_le_bytes());   // NEW_SERVER
    /// buf[4..8].copy_from_slice(&100u32.to_le_bytes()); // service
    /// buf[8..12].copy_from_slice(&1u32.to_le_bytes());  // version=1, instance=0
    /// buf[12..16].copy_from_slice(&5u32.to_le_bytes()); // node
    /// buf[16..20].copy_from_slice(&10u32.to_le_bytes()); // port
    ///
    /// let pkt = CtrlPacket::decode(&buf).unwrap();
    /// assert_eq!(pkt.cmd, Cmd::NewServer);
    /// assert_eq!(pkt.payload.node, 5);
    /// assert_eq!(pkt.payload.port, 10);
    /// assert_eq!(pkt.payload.service, 100);
    /// assert_eq!(pkt.payload.version(), 1);
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < CTRL_PACKET_SIZE {
            return Err(Error::InvalidInput);
        }

        let cmd = Cmd::from(u32::from_le_bytes(bytes[0..4].try_into()?));
        let service = u32::from_le_bytes(bytes[4..8].try_into()?);
        let instance_raw = u32::from_le_bytes(bytes[8..12].try_into()?);
        let node = u32::from_le_bytes(bytes[12..16].try_into()?);
        let port = u32::from_le_bytes(bytes[16..20].try_into()?);

        Ok(Self {
            cmd,
            payload: Payload {
                service,
                node,
                port,
                instance_raw,
            },
        })
    }

    /// Encode this packet into a fixed 20-byte little-endian buffer.
    ///
    /// # Test
    ///
    /// ```
    /// use qrtr_wire::ctrl::CtrlPacket;
    ///
    /// let buf = CtrlPacket::new_lookup().encode();
    /// assert_eq!(&buf[0..4], &4u32.to_le_bytes()); // NEW_LOOKUP
    /// assert_eq!(&buf[4..], &[0u8; 16]);
    /// ```
    pub fn encode(&self) -> [u8; CTRL_PACKET_SIZE] {
        let mut buf = [0u8; CTRL_PACKET_SIZE];

        buf[0..4].copy_from_slice(&u32::from(self.cmd).to_le_bytes());
        buf[4..8].copy_from_slice(&self.payload.service.to_le_bytes());
        buf[8..12].copy_from_slice(&self.payload.instance_raw.to_le_bytes());
        buf[12..16].copy_from_slice(&self.payload.node.to_le_bytes());
        buf[16..20].copy_from_slice(&self.payload.port.to_le_bytes());

        buf
    }
}
