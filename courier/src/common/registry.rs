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

//! Schema registry for message encoding and decoding.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{DecodeError, SchemaError};
use crate::message::{ErrorReply, Format};
use crate::traits::Message;

/// Size of the schema version prefix on every payload.
pub const SCHEMA_VERSION_SIZE: usize = 2;

/// Type alias for the encoder stored in the registry.
///
/// Takes a type-erased value and returns the serialized body (without the
/// version prefix).
type EncodeFn = Arc<dyn Fn(&dyn Any, Format) -> Result<Vec<u8>, SchemaError> + Send + Sync>;

/// Type alias for the decoder stored in the registry.
///
/// Takes a body (without the version prefix) and returns the boxed value.
type DecodeFn = Arc<dyn Fn(&[u8], Format) -> Result<Box<dyn Any + Send>, DecodeError> + Send + Sync>;

#[derive(Clone)]
struct SchemaEntry {
    version: u16,
    rust_type: &'static str,
    type_id: TypeId,
    encode: EncodeFn,
    decode: DecodeFn,
}

impl SchemaEntry {
    fn of<M: Message>() -> Self {
        let encode: EncodeFn = Arc::new(|value: &dyn Any, format: Format| {
            let concrete = value
                .downcast_ref::<M>()
                .ok_or_else(|| SchemaError::ShapeMismatch {
                    type_name: M::TYPE.to_string(),
                    expected: std::any::type_name::<M>(),
                })?;
            format
                .serialize(concrete)
                .map_err(|reason| SchemaError::Encode {
                    type_name: M::TYPE.to_string(),
                    reason,
                })
        });
        let decode: DecodeFn = Arc::new(|bytes: &[u8], format: Format| {
            let value: M = format
                .deserialize(bytes)
                .map_err(|reason| DecodeError::Payload {
                    type_name: M::TYPE.to_string(),
                    reason,
                })?;
            Ok(Box::new(value) as Box<dyn Any + Send>)
        });

        Self {
            version: M::VERSION,
            rust_type: std::any::type_name::<M>(),
            type_id: TypeId::of::<M>(),
            encode,
            decode,
        }
    }
}

/// Immutable mapping from type tags to payload schemas.
///
/// Built once at process start with [`SchemaRegistry::builder`] and shared by
/// every publisher and consumer; clones share the same table. There is no
/// runtime registration, so the consume loop never races a writer.
///
/// Every registry knows [`ErrorReply`].
///
/// # Example
///
/// ```rust,ignore
/// let registry = SchemaRegistry::builder()
///     .register::<CreateBatch>()?
///     .register::<BatchesRequest>()?
///     .register::<Batches>()?
///     .build();
/// ```
#[derive(Clone)]
pub struct SchemaRegistry {
    schemas: Arc<HashMap<String, SchemaEntry>>,
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("registered_types", &self.schemas.len())
            .finish()
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        SchemaRegistryBuilder::default().build()
    }
}

impl SchemaRegistry {
    /// Starts building a registry.
    #[must_use]
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::default()
    }

    /// Checks if a type tag is registered.
    #[must_use]
    pub fn is_registered(&self, type_name: &str) -> bool {
        self.schemas.contains_key(type_name)
    }

    /// Checks that `M::TYPE` is registered for the Rust type `M`.
    #[must_use]
    pub fn is_registered_as<M: Message>(&self) -> bool {
        self.schemas
            .get(M::TYPE)
            .is_some_and(|entry| entry.type_id == TypeId::of::<M>())
    }

    /// Rust type name registered under a tag.
    #[must_use]
    pub fn rust_type_of(&self, type_name: &str) -> Option<&'static str> {
        self.schemas.get(type_name).map(|entry| entry.rust_type)
    }

    /// Schema version registered for a tag.
    #[must_use]
    pub fn version_of(&self, type_name: &str) -> Option<u16> {
        self.schemas.get(type_name).map(|entry| entry.version)
    }

    /// Registered type tags, in no particular order.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Returns the number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Returns `true` if no types are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Encodes a typed value into a versioned payload.
    ///
    /// # Errors
    ///
    /// * [`SchemaError::UnregisteredType`] if `M::TYPE` is unknown.
    /// * [`SchemaError::ShapeMismatch`] if the tag is registered for another Rust type.
    /// * [`SchemaError::Encode`] if serialization fails.
    pub fn encode<M: Message>(&self, value: &M, format: Format) -> Result<Vec<u8>, SchemaError> {
        self.encode_dyn(M::TYPE, value, format)
    }

    /// Encodes a type-erased value under a tag.
    ///
    /// The value must be the Rust type registered for `type_name`.
    pub fn encode_dyn(
        &self,
        type_name: &str,
        value: &dyn Any,
        format: Format,
    ) -> Result<Vec<u8>, SchemaError> {
        let entry = self
            .schemas
            .get(type_name)
            .ok_or_else(|| SchemaError::UnregisteredType(type_name.to_string()))?;

        let body = (entry.encode)(value, format)?;
        let mut payload = Vec::with_capacity(SCHEMA_VERSION_SIZE + body.len());
        payload.extend_from_slice(&entry.version.to_be_bytes());
        payload.extend_from_slice(&body);
        Ok(payload)
    }

    /// Decodes a versioned payload into a type-erased value.
    ///
    /// # Errors
    ///
    /// * [`DecodeError::UnknownType`] if `type_name` is unknown here.
    /// * [`DecodeError::VersionMismatch`] if the sender used another schema version.
    /// * [`DecodeError::Payload`] if the body is truncated, malformed, or has trailing bytes.
    pub fn decode_dyn(
        &self,
        type_name: &str,
        payload: &[u8],
        format: Format,
    ) -> Result<Box<dyn Any + Send>, DecodeError> {
        let entry = self
            .schemas
            .get(type_name)
            .ok_or_else(|| DecodeError::UnknownType(type_name.to_string()))?;

        let Some((version, body)) = payload.split_first_chunk::<SCHEMA_VERSION_SIZE>() else {
            return Err(DecodeError::Payload {
                type_name: type_name.to_string(),
                reason: "payload is missing its schema version".to_string(),
            });
        };
        let version = u16::from_be_bytes(*version);
        if version != entry.version {
            return Err(DecodeError::VersionMismatch {
                type_name: type_name.to_string(),
                expected: entry.version,
                found: version,
            });
        }

        (entry.decode)(body, format)
    }

    /// Decodes a versioned payload into `M`.
    ///
    /// Fails with [`DecodeError::TypeMismatch`] if `type_name` is registered for
    /// a Rust type other than `M`.
    pub fn decode<M: Message>(
        &self,
        type_name: &str,
        payload: &[u8],
        format: Format,
    ) -> Result<M, DecodeError> {
        let value = self.decode_dyn(type_name, payload, format)?;
        value
            .downcast::<M>()
            .map(|boxed| *boxed)
            .map_err(|_| DecodeError::TypeMismatch {
                type_name: type_name.to_string(),
                registered: self.rust_type_of(type_name).unwrap_or("unknown"),
                requested: std::any::type_name::<M>(),
            })
    }
}

/// Builder for [`SchemaRegistry`].
#[derive(Clone)]
pub struct SchemaRegistryBuilder {
    schemas: HashMap<String, SchemaEntry>,
}

impl Default for SchemaRegistryBuilder {
    fn default() -> Self {
        let mut schemas = HashMap::new();
        schemas.insert(ErrorReply::TYPE.to_string(), SchemaEntry::of::<ErrorReply>());
        Self { schemas }
    }
}

impl fmt::Debug for SchemaRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistryBuilder")
            .field("registered_types", &self.schemas.len())
            .finish()
    }
}

impl SchemaRegistryBuilder {
    /// Registers `M` under `M::TYPE`.
    ///
    /// # Errors
    ///
    /// [`SchemaError::DuplicateType`] if the tag is already registered, even
    /// for the same Rust type.
    pub fn register<M: Message>(mut self) -> Result<Self, SchemaError> {
        if self.schemas.contains_key(M::TYPE) {
            return Err(SchemaError::DuplicateType(M::TYPE.to_string()));
        }
        self.schemas.insert(M::TYPE.to_string(), SchemaEntry::of::<M>());
        Ok(self)
    }

    /// Freezes the registry.
    #[must_use]
    pub fn build(self) -> SchemaRegistry {
        SchemaRegistry {
            schemas: Arc::new(self.schemas),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct CreateBatch {
        uuid: String,
    }

    impl Message for CreateBatch {
        const TYPE: &'static str = "commands.CreateBatch";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct CreateBatchV2 {
        uuid: String,
        size: u32,
    }

    impl Message for CreateBatchV2 {
        const TYPE: &'static str = "commands.CreateBatch";
        const VERSION: u16 = 2;
    }

    fn registry() -> SchemaRegistry {
        SchemaRegistry::builder()
            .register::<CreateBatch>()
            .unwrap()
            .build()
    }

    #[test]
    fn error_reply_is_always_registered() {
        let registry = SchemaRegistry::default();
        assert!(registry.is_registered(ErrorReply::TYPE));
        assert!(registry.is_registered_as::<ErrorReply>());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_registration_fails() {
        let err = SchemaRegistry::builder()
            .register::<CreateBatch>()
            .unwrap()
            .register::<CreateBatchV2>()
            .unwrap_err();
        assert_eq!(err, SchemaError::DuplicateType("commands.CreateBatch".into()));
    }

    #[test]
    fn payload_starts_with_schema_version() {
        let payload = registry()
            .encode(&CreateBatch { uuid: "u1".into() }, Format::Json)
            .unwrap();
        assert_eq!(&payload[..2], &[0, 1]);
        assert_eq!(&payload[2..], br#"{"uuid":"u1"}"#);
    }

    #[test]
    fn unregistered_type_fails_fast_on_encode() {
        let err = SchemaRegistry::default()
            .encode(&CreateBatch { uuid: "u1".into() }, Format::MessagePack)
            .unwrap_err();
        assert_eq!(err, SchemaError::UnregisteredType("commands.CreateBatch".into()));
    }

    #[test]
    fn encode_dyn_rejects_wrong_shape() {
        let err = registry()
            .encode_dyn("commands.CreateBatch", &42u32, Format::Json)
            .unwrap_err();
        assert!(matches!(err, SchemaError::ShapeMismatch { .. }));
    }

    #[test]
    fn unknown_type_fails_on_decode() {
        let err = SchemaRegistry::default()
            .decode::<CreateBatch>("commands.CreateBatch", &[0, 1], Format::Json)
            .unwrap_err();
        assert_eq!(err, DecodeError::UnknownType("commands.CreateBatch".into()));
    }

    #[test]
    fn newer_sender_schema_fails_closed() {
        let sender = SchemaRegistry::builder()
            .register::<CreateBatchV2>()
            .unwrap()
            .build();
        let payload = sender
            .encode(
                &CreateBatchV2 {
                    uuid: "u1".into(),
                    size: 3,
                },
                Format::MessagePack,
            )
            .unwrap();

        let err = registry()
            .decode::<CreateBatch>("commands.CreateBatch", &payload, Format::MessagePack)
            .unwrap_err();
        assert_eq!(
            err,
            DecodeError::VersionMismatch {
                type_name: "commands.CreateBatch".into(),
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn malformed_and_truncated_payloads_fail() {
        let registry = registry();
        for payload in [&b""[..], &[0][..], &[0, 1, b'{'][..], &[0, 1, b'[', b']'][..]] {
            let err = registry
                .decode::<CreateBatch>("commands.CreateBatch", payload, Format::Json)
                .unwrap_err();
            assert!(matches!(err, DecodeError::Payload { .. }), "{payload:?}: {err:?}");
        }
    }

    #[test]
    fn decode_into_the_wrong_rust_type_is_rejected() {
        let registry = registry();
        let payload = registry
            .encode(&CreateBatch { uuid: "u1".into() }, Format::Json)
            .unwrap();
        let err = registry
            .decode::<CreateBatchV2>("commands.CreateBatch", &payload, Format::Json)
            .unwrap_err();
        assert!(matches!(err, DecodeError::TypeMismatch { .. }));
    }

    #[test]
    fn clones_share_the_table() {
        let registry = registry();
        let clone = registry.clone();
        assert!(Arc::ptr_eq(&registry.schemas, &clone.schemas));
    }
}
