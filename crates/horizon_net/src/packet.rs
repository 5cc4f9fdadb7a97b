//! Packet definitions for the framing layer.
//!
//! Every frame on the wire is a packet: one type byte, a three byte big-endian
//! length and the payload. Packets carry either protocol control traffic
//! (handshake, heartbeat, kick) or a [`Message`](crate::message::Message) in a
//! `Data` packet.

use crate::error::NetError;
use bytes::Bytes;
use std::fmt;

/// Length of a packet header: 1 byte type + 3 bytes length.
pub const HEAD_LENGTH: usize = 4;

/// Largest payload a single packet may carry.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Packet types understood by the framing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client hello, answered with the server's handshake response
    Handshake = 0x01,
    /// Client confirmation that the handshake response was accepted
    HandshakeAck = 0x02,
    /// Keep-alive in both directions
    Heartbeat = 0x03,
    /// Carries an encoded message
    Data = 0x04,
    /// Server-initiated disconnect
    Kick = 0x05,
}

impl PacketType {
    /// Returns the wire value of this packet type.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = NetError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Handshake),
            0x02 => Ok(PacketType::HandshakeAck),
            0x03 => Ok(PacketType::Heartbeat),
            0x04 => Ok(PacketType::Data),
            0x05 => Ok(PacketType::Kick),
            other => Err(NetError::WrongPacketType(other)),
        }
    }
}

/// A fully decoded packet.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub length: usize,
    pub data: Bytes,
}

impl Packet {
    pub fn new(kind: PacketType, data: Bytes) -> Self {
        Self {
            kind,
            length: data.len(),
            data,
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet{{kind: {:?}, length: {}}}", self.kind, self.length)
    }
}
