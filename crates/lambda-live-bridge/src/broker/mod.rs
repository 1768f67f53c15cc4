pub mod memory;
pub mod mqtt;

use async_trait::async_trait;

use crate::error::BrokerError;

/// A raw message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A persistent publish/subscribe connection.
///
/// Inbound messages for subscribed topics are delivered through the channel
/// returned when the connection is created. Implementations resume their
/// subscriptions after a reconnect.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;

    /// Publishes with at-least-once delivery, returning once the broker has
    /// acknowledged the message.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
}

/// Topic naming scoped to one service and stage.
///
/// Sessions for different services or stages never see each other's traffic;
/// peers in the same scope share the broadcast topic on purpose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(service: &str, stage: &str) -> Self {
        Self {
            prefix: format!("serverless/{service}/{stage}"),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Broadcast topic every local session subscribes to.
    pub fn events(&self) -> String {
        format!("{}/events", self.prefix)
    }

    /// Reply topic of one remote instance.
    pub fn worker(&self, worker_id: &str) -> String {
        format!("{}/events/{worker_id}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_scoped_by_service_and_stage() {
        let topics = Topics::new("todos", "dev");
        assert_eq!(topics.events(), "serverless/todos/dev/events");
        assert_eq!(topics.worker("abc"), "serverless/todos/dev/events/abc");
        assert_ne!(Topics::new("todos", "prod").events(), topics.events());
    }
}
