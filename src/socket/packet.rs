//! The on-wire framing. Every pipe message is one packet: a fixed
//! little-endian header followed by three contiguous regions holding the
//! sender's address, ancillary data, and user payload, in that order. A
//! packet never exceeds 64 KiB including the header.

use nix::errno::Errno;

use crate::utility::sockaddr::SunName;

pub const HEADER_LEN: usize = 8;
pub const MAX_PACKET_LEN: usize = u16::MAX as usize;

/// The largest user payload a single packet can carry next to the given name
/// and ancillary blocks.
pub fn max_data_len(name_len: usize, cmsg_len: usize) -> usize {
    MAX_PACKET_LEN - HEADER_LEN - name_len - cmsg_len
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Size of the packet including the header.
    pub pckt_len: u16,
    /// Shutdown state observed by the local side; 0, SHUT_RD, SHUT_WR, or
    /// SHUT_RDWR.
    pub shut_info: u8,
    /// Size of the sender's address block.
    pub name_len: u8,
    /// Size of the ancillary data block.
    pub cmsg_len: u16,
    /// Size of the user data block.
    pub data_len: u16,
}

impl PacketHeader {
    pub fn init(shut_info: u8, name_len: u8, cmsg_len: u16, data_len: u16) -> Self {
        let pckt_len =
            HEADER_LEN + name_len as usize + cmsg_len as usize + data_len as usize;
        debug_assert!(pckt_len <= MAX_PACKET_LEN);
        Self {
            pckt_len: pckt_len as u16,
            shut_info,
            name_len,
            cmsg_len,
            data_len,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.pckt_len.to_le_bytes());
        buf[2] = self.shut_info;
        buf[3] = self.name_len;
        buf[4..6].copy_from_slice(&self.cmsg_len.to_le_bytes());
        buf[6..8].copy_from_slice(&self.data_len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Errno> {
        if buf.len() < HEADER_LEN {
            return Err(Errno::EPROTO);
        }
        Ok(Self {
            pckt_len: u16::from_le_bytes([buf[0], buf[1]]),
            shut_info: buf[2],
            name_len: buf[3],
            cmsg_len: u16::from_le_bytes([buf[4], buf[5]]),
            data_len: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }

    /// A receiver only ever trusts the header's length fields, and only after
    /// this check: the declared packet length must equal both the sum of the
    /// component lengths and the number of bytes actually received.
    pub fn validate(&self, received_len: usize) -> Result<(), Errno> {
        let expected = HEADER_LEN
            + self.name_len as usize
            + self.cmsg_len as usize
            + self.data_len as usize;
        if self.pckt_len as usize != expected || self.pckt_len as usize != received_len {
            return Err(Errno::EPROTO);
        }
        Ok(())
    }

    fn name_range(&self) -> std::ops::Range<usize> {
        HEADER_LEN..HEADER_LEN + self.name_len as usize
    }

    fn cmsg_range(&self) -> std::ops::Range<usize> {
        let start = self.name_range().end;
        start..start + self.cmsg_len as usize
    }

    fn data_range(&self) -> std::ops::Range<usize> {
        let start = self.cmsg_range().end;
        start..start + self.data_len as usize
    }
}

/// Build one packet from its parts. `name` is the sender's bound address, or
/// `None` for an anonymous packet.
pub fn encode_packet(
    shut_info: u8,
    name: Option<&SunName>,
    cmsg: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, Errno> {
    let name_bytes = name.map(SunName::as_bytes).unwrap_or(&[]);

    if name_bytes.len() > u8::MAX as usize
        || cmsg.len() > u16::MAX as usize
        || data.len() > u16::MAX as usize
    {
        return Err(Errno::EMSGSIZE);
    }
    let total = HEADER_LEN + name_bytes.len() + cmsg.len() + data.len();
    if total > MAX_PACKET_LEN {
        return Err(Errno::EMSGSIZE);
    }

    let header = PacketHeader::init(
        shut_info,
        name_bytes.len() as u8,
        cmsg.len() as u16,
        data.len() as u16,
    );

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(name_bytes);
    buf.extend_from_slice(cmsg);
    buf.extend_from_slice(data);
    Ok(buf)
}

/// A received, validated packet.
pub struct Packet {
    header: PacketHeader,
    buf: Vec<u8>,
}

impl Packet {
    /// Parse and validate a received pipe message. Any length disagreement is
    /// a fatal framing error.
    pub fn decode(buf: Vec<u8>) -> Result<Self, Errno> {
        let header = PacketHeader::decode(&buf)?;
        header.validate(buf.len())?;
        Ok(Self { header, buf })
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    /// The sender's address, when one was embedded.
    pub fn name(&self) -> Option<SunName> {
        if self.header.name_len == 0 {
            return None;
        }
        Some(SunName::from_raw(&self.buf[self.header.name_range()]))
    }

    pub fn cmsg(&self) -> &[u8] {
        &self.buf[self.header.cmsg_range()]
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.header.data_range()]
    }
}
