use std::collections::BTreeMap;

use serde_json::Value;

/// Message headers, broker field tables flattened into JSON values.
pub type Headers = BTreeMap<String, Value>;

/// Message payload as handed over by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Bytes(Vec<u8>),
    Text(String),
}

impl Body {
    /// Binary payloads are decoded as UTF-8 (lossily), text passes through.
    pub fn into_text(self) -> String {
        match self {
            Body::Bytes(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
            },
            Body::Text(text) => text,
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(bytes)
    }
}

impl From<&[u8]> for Body {
    fn from(bytes: &[u8]) -> Self {
        Body::Bytes(bytes.to_vec())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Text(text)
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Text(text.to_string())
    }
}

/// One received message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub info: DeliveryInfo,
    pub headers: Headers,
    pub body: Body,
}

/// The part of a delivery needed to settle it with the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_and_text_normalize_alike() {
        assert_eq!(Body::from(&b"message"[..]).into_text(), "message");
        assert_eq!(Body::from("message").into_text(), "message");
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let body = Body::Bytes(vec![b'o', b'k', 0xff]);
        assert_eq!(body.into_text(), "ok\u{fffd}");
    }
}
