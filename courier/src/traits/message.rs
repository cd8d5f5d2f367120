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

use std::any::Any;
use std::fmt::{self, Debug};

use serde::de::DeserializeOwned;
use serde::Serialize;
use static_assertions::assert_impl_all;

assert_impl_all!(ReplyValue: Send, Sync);

/// A typed message that can cross the broker.
///
/// Implement with the [`courier_message`](crate::courier_message) attribute
/// rather than by hand:
///
/// ```rust,ignore
/// #[courier_message("commands.CreateBatch")]
/// struct CreateBatch {
///     uuid: String,
/// }
/// ```
///
/// `TYPE` is the tag carried in every envelope and the key the schema
/// registry resolves; `VERSION` is the schema revision written in front of
/// every payload. A receiver registered with a different version rejects
/// the payload instead of decoding it partially.
pub trait Message: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Type tag identifying the schema.
    const TYPE: &'static str;

    /// Schema revision.
    const VERSION: u16 = 1;
}

/// A type-erased handler result on its way to the reply publisher.
pub struct ReplyValue {
    type_name: &'static str,
    value: Box<dyn Any + Send + Sync>,
}

impl ReplyValue {
    /// Wraps a message for encoding under its registered tag.
    pub fn of<M: Message>(message: M) -> Self {
        Self {
            type_name: M::TYPE,
            value: Box::new(message),
        }
    }

    /// Type tag the value is encoded under.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The value itself.
    #[must_use]
    pub fn value(&self) -> &(dyn Any + Sync) {
        &*self.value
    }
}

impl Debug for ReplyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyValue")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// What a handler may return on success.
///
/// `()` means "nothing to reply with"; any [`Message`] is a reply value.
pub trait IntoReply: Send + 'static {
    /// Tag of the reply type, checked against the registry when the handler
    /// is registered.
    fn reply_type() -> Option<&'static str>;

    /// Converts the handler result into a reply, if there is one.
    fn into_reply(self) -> Option<ReplyValue>;
}

impl IntoReply for () {
    fn reply_type() -> Option<&'static str> {
        None
    }

    fn into_reply(self) -> Option<ReplyValue> {
        None
    }
}

impl<M: Message> IntoReply for M {
    fn reply_type() -> Option<&'static str> {
        Some(M::TYPE)
    }

    fn into_reply(self) -> Option<ReplyValue> {
        Some(ReplyValue::of(self))
    }
}
