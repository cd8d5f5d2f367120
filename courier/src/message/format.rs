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

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Serialization format for envelopes and payloads.
///
/// The format is recorded in every frame header, so a receiver decodes with
/// whatever format the sender chose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// `MessagePack` format (binary, compact).
    #[default]
    MessagePack,
    /// JSON format (UTF-8 encoded, human-readable).
    Json,
}

impl Format {
    /// Format byte for JSON.
    pub const JSON_BYTE: u8 = 0x01;
    /// Format byte for `MessagePack`.
    pub const MESSAGEPACK_BYTE: u8 = 0x02;

    /// Convert format to wire byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Json => Self::JSON_BYTE,
            Self::MessagePack => Self::MESSAGEPACK_BYTE,
        }
    }

    /// Parse format from wire byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            Self::JSON_BYTE => Some(Self::Json),
            Self::MESSAGEPACK_BYTE => Some(Self::MessagePack),
            _ => None,
        }
    }

    /// Serialize a value using this format.
    ///
    /// `MessagePack` output uses named fields so optional fields can be skipped.
    pub fn serialize<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, String> {
        match self {
            Self::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
            Self::MessagePack => rmp_serde::to_vec_named(value).map_err(|e| e.to_string()),
        }
    }

    /// Deserialize a value using this format, rejecting trailing bytes.
    pub fn deserialize<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, String> {
        match self {
            Self::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
            Self::MessagePack => {
                let mut de = rmp_serde::Deserializer::new(bytes);
                let value = T::deserialize(&mut de).map_err(|e| e.to_string())?;
                let consumed = de.into_inner().len();
                if consumed != 0 {
                    return Err(format!("{consumed} trailing bytes after MessagePack value"));
                }
                Ok(value)
            }
        }
    }
}
