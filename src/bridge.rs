use crate::broker_session::{CommandPublisher, MessageHandler};
use crate::models::{Category, LaneSet};
use crate::recorder::RecorderHandle;
use crate::translator::{translate, Rejection};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Terminal outcome of one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Arrived on a topic other than the control topic.
    Ignored,
    Rejected(Rejection),
    /// Accepted but the publish failed; nothing was recorded.
    CommandLost(Category),
    Forwarded(Category),
}

/// Routes control messages through the translator to the command topic and
/// the activity log.
pub struct BridgeController {
    publisher: Arc<dyn CommandPublisher>,
    recorder: RecorderHandle,
    lanes: LaneSet,
    control_topic: String,
    command_topic: String,
}

impl BridgeController {
    pub fn new(
        publisher: Arc<dyn CommandPublisher>,
        recorder: RecorderHandle,
        lanes: LaneSet,
        control_topic: String,
        command_topic: String,
    ) -> Self {
        Self {
            publisher,
            recorder,
            lanes,
            control_topic,
            command_topic,
        }
    }

    pub async fn handle(&self, topic: &str, payload: &[u8]) -> Outcome {
        if topic != self.control_topic {
            warn!("Unknown topic received: {}", topic);
            return Outcome::Ignored;
        }
        debug!("Received message: {}", String::from_utf8_lossy(payload));

        let translation = match translate(payload, &self.lanes) {
            Ok(translation) => translation,
            Err(rejection) => {
                match &rejection {
                    Rejection::Decode(_) => warn!(
                        "Dropping control message: {} (payload: {:?})",
                        rejection,
                        String::from_utf8_lossy(payload)
                    ),
                    _ => info!("Ignoring control message: {}", rejection),
                }
                return Outcome::Rejected(rejection);
            }
        };

        let category = translation.category;
        let body = match translation.command.to_payload() {
            Ok(body) => body,
            Err(e) => {
                error!("Lost command for '{}': failed to encode: {}", category, e);
                return Outcome::CommandLost(category);
            }
        };

        if let Err(e) = self.publisher.publish(&self.command_topic, body).await {
            error!("Lost command for '{}': {}", category, e);
            return Outcome::CommandLost(category);
        }
        let command = &translation.command;
        match command.lane() {
            Some(lane) => info!(
                "Forwarded {:?} command for {} to '{}'.",
                command.mode(),
                lane,
                self.command_topic
            ),
            None => info!(
                "Forwarded {:?} command to '{}'.",
                command.mode(),
                self.command_topic
            ),
        }

        if let Err(e) = self.recorder.submit(category.clone()) {
            error!("Lost audit event for '{}': {}", category, e);
        }
        Outcome::Forwarded(category)
    }
}

#[async_trait]
impl MessageHandler for BridgeController {
    async fn on_message(&self, topic: &str, payload: &[u8]) {
        self.handle(topic, payload).await;
    }
}
