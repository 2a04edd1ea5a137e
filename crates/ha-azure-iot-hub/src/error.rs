use thiserror::Error;

#[derive(Debug, Error)]
pub enum IotHubError {
    #[error("Malformed connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Cannot connect to IoT Hub: {0}")]
    CannotConnect(String),

    #[error("IoT Hub rejected the credentials: {0}")]
    InvalidAuth(String),

    #[error("Client is not connected")]
    NotConnected,

    #[error("Client has been shut down")]
    ShutDown,

    #[error("Failed to send message: {0}")]
    Send(String),

    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Failed to serialize telemetry: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type IotHubResult<T> = Result<T, IotHubError>;

impl IotHubError {
    /// Error code shown on the config flow form
    pub fn flow_error_code(&self) -> &'static str {
        match self {
            IotHubError::InvalidConnectionString(_) | IotHubError::CannotConnect(_) => {
                "cannot_connect"
            }
            IotHubError::InvalidAuth(_) => "invalid_auth",
            _ => "unknown",
        }
    }

    /// Whether sending the same message again over a new connection can help
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            IotHubError::MessageTooLarge { .. } | IotHubError::Serialization(_)
        )
    }
}
