use std::sync::Arc;

use async_trait::async_trait;

use super::{send_value, Broker, PublishError, Publisher};
use crate::core::{deadline::Deadline, settings::BrokerSettings};

/// Sends each value as-is to `{topic_prefix}/{name}`.
pub struct Simple {
    broker: Arc<dyn Broker>,
    settings: BrokerSettings,
}

impl Simple {
    pub fn new(broker: Arc<dyn Broker>, settings: BrokerSettings) -> Self {
        Self { broker, settings }
    }

    pub fn topic(&self, name: &str) -> String {
        format!("{}/{}", self.settings.topic_prefix, name)
    }
}

#[async_trait]
impl Publisher for Simple {
    async fn publish(
        &self,
        deadline: &Deadline,
        name: &str,
        value: &str,
    ) -> Result<(), PublishError> {
        let topic = self.topic(name);
        send_value(self.broker.as_ref(), &self.settings, deadline, &topic, value).await
    }
}
