//! Message envelope carried inside `Data` packets.
//!
//! Layout of an encoded message:
//!
//! ```text
//! +------+------------------+---------------------------+---------+
//! | flag | id (varint, opt) | route (code or len+utf8)  | payload |
//! +------+------------------+---------------------------+---------+
//! ```
//!
//! The flag byte holds the message type in bits 1..=3 and the route compression
//! marker in bit 0. Only requests and responses carry an id; only requests,
//! notifies and pushes carry a route.

use crate::error::NetError;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

const MSG_ROUTE_COMPRESS_MASK: u8 = 0x01;
const MSG_TYPE_MASK: u8 = 0x07;
const MSG_ROUTE_LENGTH_MASK: usize = 0xFF;
const MSG_HEAD_LENGTH: usize = 0x02;
const MAX_VARINT_LEN: usize = 10;

/// Message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x00,
    Notify = 0x01,
    Response = 0x02,
    Push = 0x03,
}

impl MessageType {
    /// Whether messages of this type carry a route.
    pub fn routable(self) -> bool {
        matches!(self, MessageType::Request | MessageType::Notify | MessageType::Push)
    }

    /// Whether messages of this type carry an id.
    pub fn has_id(self) -> bool {
        matches!(self, MessageType::Request | MessageType::Response)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = NetError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MessageType::Request),
            0x01 => Ok(MessageType::Notify),
            0x02 => Ok(MessageType::Response),
            0x03 => Ok(MessageType::Push),
            other => Err(NetError::WrongMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Request => "Request",
            MessageType::Notify => "Notify",
            MessageType::Response => "Response",
            MessageType::Push => "Push",
        };
        f.write_str(name)
    }
}

/// A decoded message.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub id: u64,
    pub route: String,
    pub data: Bytes,
    /// Set on decode when the route arrived as a dictionary code
    pub compressed: bool,
}

impl Message {
    pub fn new(kind: MessageType, id: u64, route: impl Into<String>, data: Bytes) -> Self {
        Self {
            kind,
            id,
            route: route.into(),
            data,
            compressed: false,
        }
    }

    pub fn request(id: u64, route: impl Into<String>, data: Bytes) -> Self {
        Self::new(MessageType::Request, id, route, data)
    }

    pub fn notify(route: impl Into<String>, data: Bytes) -> Self {
        Self::new(MessageType::Notify, 0, route, data)
    }

    pub fn response(id: u64, data: Bytes) -> Self {
        Self::new(MessageType::Response, id, String::new(), data)
    }

    pub fn push(route: impl Into<String>, data: Bytes) -> Self {
        Self::new(MessageType::Push, 0, route, data)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}, Type: {}, ID: {}, Len: {}",
            self.route,
            if self.compressed { "(compressed)" } else { "" },
            self.kind,
            self.id,
            self.data.len()
        )
    }
}

/// Two-way mapping between routes and short numeric codes.
///
/// Built once before the server starts accepting traffic and shared read-only
/// afterwards. An empty dictionary disables route compression.
#[derive(Debug, Clone, Default)]
pub struct RouteDictionary {
    routes: HashMap<String, u16>,
    codes: HashMap<u16, String>,
}

impl RouteDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a dictionary from `(route, code)` pairs.
    ///
    /// Duplicated routes or codes are reported and the later entry wins.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u16)>,
        S: Into<String>,
    {
        let mut dict = Self::new();
        for (route, code) in entries {
            dict.insert(route.into(), code);
        }
        dict
    }

    fn insert(&mut self, route: String, code: u16) {
        if let Some(old) = self.routes.get(&route) {
            warn!("Duplicated route (route: {}, code: {}), replaced by code {}", route, old, code);
            self.codes.remove(old);
        }
        if let Some(old) = self.codes.get(&code) {
            warn!("Duplicated route code (route: {}, code: {}), replaced by route {}", old, code, route);
            self.routes.remove(old);
        }
        self.codes.insert(code, route.clone());
        self.routes.insert(route, code);
    }

    pub fn code(&self, route: &str) -> Option<u16> {
        self.routes.get(route).copied()
    }

    pub fn route(&self, code: u16) -> Option<&str> {
        self.codes.get(&code).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Encodes a message, compressing its route when the dictionary knows it.
pub fn encode(msg: &Message, dict: &RouteDictionary) -> Result<Bytes, NetError> {
    let mut buf = BytesMut::with_capacity(MSG_HEAD_LENGTH + msg.route.len() + msg.data.len() + 8);

    let code = if msg.kind.routable() {
        dict.code(&msg.route)
    } else {
        None
    };

    let mut flag = (msg.kind as u8) << 1;
    if code.is_some() {
        flag |= MSG_ROUTE_COMPRESS_MASK;
    }
    buf.put_u8(flag);

    if msg.kind.has_id() {
        let mut id = msg.id;
        loop {
            let b = (id % 128) as u8;
            id /= 128;
            if id != 0 {
                buf.put_u8(b | 0x80);
            } else {
                buf.put_u8(b);
                break;
            }
        }
    }

    if msg.kind.routable() {
        match code {
            Some(code) => buf.put_u16(code),
            None => {
                let len = msg.route.len();
                if len > MSG_ROUTE_LENGTH_MASK {
                    return Err(NetError::RouteTooLong(len));
                }
                buf.put_u8(len as u8);
                buf.put_slice(msg.route.as_bytes());
            }
        }
    }

    buf.put_slice(&msg.data);
    Ok(buf.freeze())
}

/// Decodes a message, expanding compressed routes through the dictionary.
pub fn decode(data: &Bytes, dict: &RouteDictionary) -> Result<Message, NetError> {
    if data.len() < MSG_HEAD_LENGTH {
        return Err(NetError::InvalidMessage);
    }

    let flag = data[0];
    let mut offset = 1;
    let kind = MessageType::try_from((flag >> 1) & MSG_TYPE_MASK)?;

    let mut id = 0u64;
    if kind.has_id() {
        let mut terminated = false;
        for (shift, &b) in data[offset..].iter().enumerate().take(MAX_VARINT_LEN) {
            id |= u64::from(b & 0x7F) << (7 * shift);
            if b < 0x80 {
                offset += shift + 1;
                terminated = true;
                break;
            }
        }
        if !terminated {
            return Err(NetError::InvalidMessage);
        }
    }

    let mut route = String::new();
    let compressed = flag & MSG_ROUTE_COMPRESS_MASK == MSG_ROUTE_COMPRESS_MASK;
    if kind.routable() {
        if compressed {
            if data.len() < offset + 2 {
                return Err(NetError::InvalidMessage);
            }
            let code = u16::from_be_bytes([data[offset], data[offset + 1]]);
            route = dict
                .route(code)
                .ok_or(NetError::RouteInfoNotFound(code))?
                .to_string();
            offset += 2;
        } else {
            let len = *data.get(offset).ok_or(NetError::InvalidMessage)? as usize;
            offset += 1;
            if data.len() < offset + len {
                return Err(NetError::InvalidMessage);
            }
            route = std::str::from_utf8(&data[offset..offset + len])
                .map_err(|_| NetError::InvalidMessage)?
                .to_string();
            offset += len;
        }
    }

    Ok(Message {
        kind,
        id,
        route,
        data: data.slice(offset..),
        compressed: kind.routable() && compressed,
    })
}
