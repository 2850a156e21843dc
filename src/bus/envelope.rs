use std::collections::BTreeMap;

use serde::de::DeserializeOwned;

use crate::codec::{Codec, CodecError};
use crate::message::OutboxMessage;

/// A message as it travels over the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Broker message id; the outbox row id for messages we publish.
    pub id: String,
    /// Event name, used as the routing key.
    pub name: String,
    /// Serialized payload.
    pub content: Vec<u8>,
    /// Headers (content type, correlation ids, etc.)
    pub headers: BTreeMap<String, String>,
}

impl Envelope {
    pub const CONTENT_TYPE: &'static str = "content-type";

    pub fn new(id: impl Into<String>, name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            content,
            headers: BTreeMap::new(),
        }
    }

    /// Create an envelope with a string payload.
    pub fn with_string_payload(
        id: impl Into<String>,
        name: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self::new(id, name, payload.into().into_bytes())
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }

    /// Content type header, defaulting to JSON.
    pub fn content_type(&self) -> &str {
        self.header(Self::CONTENT_TYPE)
            .unwrap_or(Codec::JSON_CONTENT_TYPE)
    }

    /// Decode the payload with the codec named by the content type header.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Codec::from_content_type(self.content_type())?.decode(&self.content)
    }

    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }
}

impl From<&OutboxMessage> for Envelope {
    fn from(message: &OutboxMessage) -> Self {
        let mut envelope = Envelope::new(
            message.id.to_string(),
            message.name.clone(),
            message.content.clone(),
        );
        envelope.headers = message.headers.clone();
        envelope
            .headers
            .insert(Self::CONTENT_TYPE.to_string(), message.content_type.clone());
        envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Deserialize, serde::Serialize)]
    struct Shipped {
        order_id: String,
    }

    #[test]
    fn envelope_construction() {
        let envelope = Envelope::with_string_payload("evt-1", "OrderCreated", "{}")
            .with_header("correlation_id", "abc-123");
        assert_eq!(envelope.id, "evt-1");
        assert_eq!(envelope.name, "OrderCreated");
        assert_eq!(envelope.payload_str(), Some("{}"));
        assert_eq!(envelope.header("correlation_id"), Some("abc-123"));
        assert_eq!(envelope.content_type(), "application/json");
    }

    #[test]
    fn from_outbox_message_carries_id_and_content_type() {
        let content = Codec::Bitcode
            .encode(&Shipped {
                order_id: "o-9".into(),
            })
            .unwrap();
        let message = OutboxMessage::new("OrderShipped", content)
            .with_content_type(Codec::Bitcode.content_type())
            .with_header("tenant", "acme");

        let envelope = Envelope::from(&message);
        assert_eq!(envelope.id, message.id.to_string());
        assert_eq!(envelope.header("tenant"), Some("acme"));

        let decoded: Shipped = envelope.decode().unwrap();
        assert_eq!(decoded.order_id, "o-9");
    }
}
