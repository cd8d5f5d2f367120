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

use serde::{Deserialize, Serialize};

use super::Envelope;
use crate::common::HandlerError;
use crate::traits::{ErrorAdapter, Message};

/// Structured error reply sent to an RPC caller instead of a success value.
///
/// Always registered in every [`SchemaRegistry`](crate::common::SchemaRegistry)
/// under [`ErrorReply::TYPE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Correlation id of the request this answers.
    pub correlation_id: String,
    /// Machine-readable error code.
    pub error_code: String,
    /// Human-readable description. Never empty when produced by the gateway.
    pub error_message: String,
}

impl ErrorReply {
    /// The request could not be decoded by the server.
    pub const DECODE_ERROR: &'static str = "DECODE_ERROR";
    /// The request type is known but the server has no handler for it.
    pub const NO_HANDLER: &'static str = "NO_HANDLER";
    /// The handler failed on every permitted delivery.
    pub const HANDLER_ERROR: &'static str = "HANDLER_ERROR";
    /// The handler succeeded but its reply could not be encoded.
    pub const REPLY_ENCODE_ERROR: &'static str = "REPLY_ENCODE_ERROR";
    /// The handler succeeded without producing a reply value.
    pub const NO_REPLY: &'static str = "NO_REPLY";

    /// Creates an error reply.
    #[must_use]
    pub fn new(
        correlation_id: impl Into<String>,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            error_code: error_code.into(),
            error_message: error_message.into(),
        }
    }
}

impl Message for ErrorReply {
    const TYPE: &'static str = "courier.ErrorReply";
}

/// Error adapter used when the application does not supply one.
///
/// Uses the handler's code when it attached one and
/// [`ErrorReply::HANDLER_ERROR`] otherwise; the message is the error's
/// display form including its cause chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorAdapter;

impl ErrorAdapter for DefaultErrorAdapter {
    fn adapt(&self, error: &HandlerError, envelope: &Envelope) -> ErrorReply {
        let mut message = format!("{:#}", error.source());
        if message.is_empty() {
            message = format!("handler for {} failed", envelope.message_type);
        }
        ErrorReply {
            correlation_id: envelope.correlation_id.clone().unwrap_or_default(),
            error_code: error
                .code()
                .unwrap_or(ErrorReply::HANDLER_ERROR)
                .to_string(),
            error_message: message,
        }
    }
}
