use crate::errors::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyListenerConfig {
    /// Upper bound on the first request head read off a new connection.
    pub max_request_head_bytes: usize,
    /// Depth of the input and output queues; a slow consumer throttles
    /// translators here.
    pub queue_capacity: usize,
}

impl Default for ProxyListenerConfig {
    fn default() -> Self {
        Self {
            max_request_head_bytes: 64 * 1024,
            queue_capacity: 16,
        }
    }
}

impl ProxyListenerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_request_head_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_request_head_bytes must be greater than zero".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
