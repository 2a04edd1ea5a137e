//! Device client abstraction
//!
//! [`DeviceClient`] is the surface the integration needs from an IoT Hub
//! device SDK. [`crate::mqtt::MqttDeviceClient`] implements it over MQTT;
//! tests substitute their own through [`ClientFactory`].

use async_trait::async_trait;

use crate::error::{IotHubError, IotHubResult};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_ENCODING_UTF8: &str = "utf-8";

/// Largest device-to-cloud message body IoT Hub accepts
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// A device-to-cloud message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            content_type: None,
            content_encoding: None,
        }
    }

    /// A UTF-8 JSON message
    pub fn json(body: String) -> Self {
        Self {
            body: body.into_bytes(),
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            content_encoding: Some(CONTENT_ENCODING_UTF8.to_string()),
        }
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Reject bodies the hub would refuse
    pub fn check_size(&self) -> IotHubResult<()> {
        if self.body.len() > MAX_MESSAGE_SIZE {
            return Err(IotHubError::MessageTooLarge {
                size: self.body.len(),
                limit: MAX_MESSAGE_SIZE,
            });
        }
        Ok(())
    }
}

/// Connection to one IoT Hub device identity
///
/// Calls take `&mut self`; callers serialize access (the integration keeps
/// each client behind a `tokio::sync::Mutex`).
#[async_trait]
pub trait DeviceClient: Send {
    async fn connect(&mut self) -> IotHubResult<()>;

    async fn send_message(&mut self, message: Message) -> IotHubResult<()>;

    /// Close the connection. Idempotent; the client may connect again.
    async fn disconnect(&mut self) -> IotHubResult<()>;

    /// Disconnect and release the client for good. Idempotent.
    async fn shutdown(&mut self) -> IotHubResult<()>;

    fn is_connected(&self) -> bool;
}

pub trait ClientFactory: Send + Sync {
    /// Build an unconnected client; fails on a malformed connection string
    fn create_from_connection_string(
        &self,
        connection_string: &str,
    ) -> IotHubResult<Box<dyn DeviceClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_message() {
        let message = Message::json(r#"{"a":1}"#.to_string());
        assert_eq!(message.body_str(), Some(r#"{"a":1}"#));
        assert_eq!(message.content_type.as_deref(), Some("application/json"));
        assert_eq!(message.content_encoding.as_deref(), Some("utf-8"));

        assert_eq!(Message::new(vec![0xff]).body_str(), None);
    }

    #[test]
    fn test_size_limit() {
        assert!(Message::new(vec![b'x'; MAX_MESSAGE_SIZE]).check_size().is_ok());
        assert!(matches!(
            Message::new(vec![b'x'; MAX_MESSAGE_SIZE + 1]).check_size(),
            Err(IotHubError::MessageTooLarge { size, .. }) if size == MAX_MESSAGE_SIZE + 1
        ));
    }
}
