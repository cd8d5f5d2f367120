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

//! Envelope, framing and per-delivery records.

mod delivery;
mod envelope;
mod error_reply;
mod format;
mod frame;

pub use delivery::{AckToken, DeadLetter, DeliveryFault, FaultKind, MessageContext, RawDelivery};
pub use envelope::{Envelope, MessageContextMap};
pub use error_reply::{DefaultErrorAdapter, ErrorReply};
pub use format::Format;
pub use frame::{Frame, FrameKind, HEADER_SIZE, PROTOCOL_VERSION};
