use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{Error, HEADER_LEN};

/// Top-level class of a mailbox datagram.
///
/// Datagrams whose type byte is not `Channel` belong to other users of the
/// mailbox (system discovery and maintenance traffic) and are dropped by the
/// channel engine without further inspection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum PacketType {
    System = 0xAA,
    Channel = 0x55,
}

/// Channel operation carried by a datagram.
///
/// `ConnReq`, `ConnAck` and `ConnClose` form the in-band connection
/// handshake; `Data` carries application payload on an established channel.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum ChanOp {
    ConnReq = 0,
    ConnAck = 1,
    ConnClose = 2,
    Data = 3,
}

/// The channel header.
///
/// Wire layout, network byte order, packed, no padding:
///
/// | Offset | Size | Field |
/// |---|---|---|
/// | 0 | 4 | src_destid |
/// | 4 | 4 | dst_destid |
/// | 8 | 1 | src_mbox |
/// | 9 | 1 | dst_mbox |
/// | 10 | 1 | packet_type |
/// | 11 | 1 | ch_op |
/// | 12 | 2 | dst_ch |
/// | 14 | 2 | src_ch |
/// | 16 | 2 | msg_len |
/// | 18 | 2 | reserved |
///
/// `msg_len` counts the whole datagram, header included. A NACK reply
/// repurposes the field as an error code; the engine never sends NACKs but
/// the reading is part of the wire contract. The reserved field is
/// transmitted as zero and ignored on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub src_destid: u32,
    pub dst_destid: u32,
    pub src_mbox: u8,
    pub dst_mbox: u8,
    pub packet_type: PacketType,
    pub ch_op: ChanOp,
    pub dst_ch: u16,
    pub src_ch: u16,
    pub msg_len: u16,
}

impl Header {
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use chanmux_codec::{ChanOp, Header, PacketType};
    ///
    /// let mut bytes = BytesMut::with_capacity(20);
    ///
    /// Header {
    ///     src_destid: 0x01,
    ///     dst_destid: 0x02,
    ///     src_mbox: 1,
    ///     dst_mbox: 1,
    ///     packet_type: PacketType::Channel,
    ///     ch_op: ChanOp::Data,
    ///     dst_ch: 100,
    ///     src_ch: 200,
    ///     msg_len: 25,
    /// }
    /// .encode(&mut bytes);
    ///
    /// assert_eq!(bytes.len(), 20);
    /// assert_eq!(bytes[10], 0x55);
    /// assert_eq!(&bytes[12..14], &[0x00, 0x64]);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.clear();
        bytes.put_u32(self.src_destid);
        bytes.put_u32(self.dst_destid);
        bytes.put_u8(self.src_mbox);
        bytes.put_u8(self.dst_mbox);
        bytes.put_u8(self.packet_type.into());
        bytes.put_u8(self.ch_op.into());
        bytes.put_u16(self.dst_ch);
        bytes.put_u16(self.src_ch);
        bytes.put_u16(self.msg_len);
        bytes.put_u16(0);
    }

    /// Write the header over the first 20 bytes of an outbound datagram.
    ///
    /// # Test
    ///
    /// ```
    /// use chanmux_codec::{ChanOp, Header, PacketType};
    ///
    /// let mut buf = vec![0u8; 25];
    ///
    /// Header {
    ///     src_destid: 0x01,
    ///     dst_destid: 0x02,
    ///     src_mbox: 1,
    ///     dst_mbox: 1,
    ///     packet_type: PacketType::Channel,
    ///     ch_op: ChanOp::Data,
    ///     dst_ch: 100,
    ///     src_ch: 200,
    ///     msg_len: 25,
    /// }
    /// .write_to(&mut buf);
    ///
    /// let decoded = Header::decode(&buf).unwrap();
    ///
    /// assert_eq!(decoded.dst_ch, 100);
    /// assert_eq!(decoded.msg_len, 25);
    /// ```
    pub fn write_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= HEADER_LEN);

        buf[0..4].copy_from_slice(&self.src_destid.to_be_bytes());
        buf[4..8].copy_from_slice(&self.dst_destid.to_be_bytes());
        buf[8] = self.src_mbox;
        buf[9] = self.dst_mbox;
        buf[10] = self.packet_type.into();
        buf[11] = self.ch_op.into();
        buf[12..14].copy_from_slice(&self.dst_ch.to_be_bytes());
        buf[14..16].copy_from_slice(&self.src_ch.to_be_bytes());
        buf[16..18].copy_from_slice(&self.msg_len.to_be_bytes());
        buf[18..20].copy_from_slice(&0u16.to_be_bytes());
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use chanmux_codec::{ChanOp, Header, PacketType};
    ///
    /// let header = Header {
    ///     src_destid: 0x01,
    ///     dst_destid: 0x02,
    ///     src_mbox: 1,
    ///     dst_mbox: 1,
    ///     packet_type: PacketType::Channel,
    ///     ch_op: ChanOp::ConnReq,
    ///     dst_ch: 500,
    ///     src_ch: 256,
    ///     msg_len: 20,
    /// };
    ///
    /// let mut bytes = BytesMut::with_capacity(20);
    /// header.encode(&mut bytes);
    ///
    /// assert_eq!(Header::decode(&bytes).unwrap(), header);
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            src_destid: u32::from_be_bytes(bytes[0..4].try_into()?),
            dst_destid: u32::from_be_bytes(bytes[4..8].try_into()?),
            src_mbox: bytes[8],
            dst_mbox: bytes[9],
            packet_type: PacketType::try_from(bytes[10])
                .map_err(|_| Error::UnknownPacketType(bytes[10]))?,
            ch_op: ChanOp::try_from(bytes[11]).map_err(|_| Error::UnknownOperation(bytes[11]))?,
            dst_ch: u16::from_be_bytes(bytes[12..14].try_into()?),
            src_ch: u16::from_be_bytes(bytes[14..16].try_into()?),
            msg_len: u16::from_be_bytes(bytes[16..18].try_into()?),
        })
    }
}
