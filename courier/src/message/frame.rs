/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Binary framing for envelopes on the broker.
//!
//! The broker delimits messages, so a frame carries no length prefix.
//!
//! # Wire Format
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ Protocol Version (1 byte, currently 0x01)                     │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Frame Kind (1 byte)                                           │
//! │   0x01 = Event                                                │
//! │   0x02 = Request                                              │
//! │   0x03 = Reply                                                │
//! │   0x04 = Error reply                                          │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Format (1 byte)                                               │
//! │   0x01 = JSON                                                 │
//! │   0x02 = MessagePack                                          │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Envelope (remaining bytes, encoding depends on format)        │
//! └───────────────────────────────────────────────────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use derive_new::new;

use super::{Envelope, Format};
use crate::common::{DecodeError, SchemaError};

/// Protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Frame header size: 1 byte version + 1 byte kind + 1 byte format.
pub const HEADER_SIZE: usize = 3;

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// A fire-and-forget message.
    Event = 0x01,
    /// An RPC request expecting a reply.
    Request = 0x02,
    /// A successful RPC reply.
    Reply = 0x03,
    /// A structured RPC error reply.
    ErrorReply = 0x04,
}

impl FrameKind {
    /// Parse a frame kind from its wire byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Event),
            0x02 => Some(Self::Request),
            0x03 => Some(Self::Reply),
            0x04 => Some(Self::ErrorReply),
            _ => None,
        }
    }

    /// Returns `true` for both reply kinds.
    #[must_use]
    pub const fn is_reply(self) -> bool {
        matches!(self, Self::Reply | Self::ErrorReply)
    }
}

/// A decoded frame: header fields plus the envelope.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct Frame {
    /// What the frame carries.
    pub kind: FrameKind,
    /// Format the envelope and payload are serialized in.
    pub format: Format,
    /// The envelope.
    pub envelope: Envelope,
}

impl Frame {
    /// Serializes the frame for the transport.
    pub fn encode(&self) -> Result<Bytes, SchemaError> {
        let body = self
            .format
            .serialize(&self.envelope)
            .map_err(|reason| SchemaError::Encode {
                type_name: self.envelope.message_type.clone(),
                reason,
            })?;

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.format.to_byte());
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Parses a frame received from the transport.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let Some((header, body)) = bytes.split_first_chunk::<HEADER_SIZE>() else {
            return Err(DecodeError::MalformedFrame(format!(
                "frame of {} bytes is shorter than the {HEADER_SIZE}-byte header",
                bytes.len()
            )));
        };
        let [version, kind, format] = *header;

        if version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedProtocol {
                found: version,
                expected: PROTOCOL_VERSION,
            });
        }

        let kind = FrameKind::from_byte(kind).ok_or_else(|| {
            DecodeError::MalformedFrame(format!("unknown frame kind: {kind:#04x}"))
        })?;
        let format = Format::from_byte(format).ok_or(DecodeError::UnknownFormat(format))?;

        let envelope: Envelope = format
            .deserialize(body)
            .map_err(DecodeError::MalformedFrame)?;

        Ok(Self {
            kind,
            format,
            envelope,
        })
    }
}
