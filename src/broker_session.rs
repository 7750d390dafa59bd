use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Outgoing, Packet, QoS, SubscribeReasonCode,
};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60);
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribed,
    ConnectFailed(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => f.write_str("disconnected"),
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::Subscribed => f.write_str("subscribed"),
            SessionState::ConnectFailed(reason) => write!(f, "connect_failed: {}", reason),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not connected to the MQTT broker (state: {0})")]
    NotConnected(SessionState),
    #[error("failed to publish to '{topic}': {source}")]
    Publish {
        topic: String,
        #[source]
        source: ClientError,
    },
    #[error("giving up on {broker} after {attempts} failed connection attempts")]
    RetriesExhausted { broker: String, attempts: u32 },
}

/// Outbound side of the session, as seen by the bridge.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError>;
}

/// Receives every message delivered on a subscribed topic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, topic: &str, payload: &[u8]);
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub control_topic: String,
    pub retry_interval: Duration,
    /// Consecutive failures tolerated before giving up; negative means forever.
    pub max_retries: i32,
}

/// How a failed attempt is retried once the backoff has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    /// Poll the event loop again, which reconnects.
    Reconnect,
    /// The connection is up; ask for the subscription again.
    Resubscribe,
}

/// Consecutive-failure budget with a doubling delay capped at one minute.
struct Backoff {
    initial: Duration,
    current: Duration,
    max_retries: i32,
    failures: u32,
}

impl Backoff {
    fn new(initial: Duration, max_retries: i32) -> Self {
        Self {
            initial,
            current: initial,
            max_retries,
            failures: 0,
        }
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.current = self.initial;
    }

    /// Counts one failure; returns the attempt count once the budget is spent.
    fn exhausted(&mut self) -> Option<u32> {
        self.failures += 1;
        (self.max_retries >= 0 && self.failures > self.max_retries as u32).then_some(self.failures)
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_RETRY_INTERVAL);
        delay
    }
}

/// Owns the broker connection: connect, subscribe, publish, reconnect.
pub struct BrokerSession {
    client_state: Mutex<SessionState>,
    client: Mutex<Option<AsyncClient>>,
    config: SessionConfig,
}

impl BrokerSession {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            client_state: Mutex::new(SessionState::Disconnected),
            client: Mutex::new(None),
            config,
        })
    }

    pub async fn state(&self) -> SessionState {
        self.client_state.lock().await.clone()
    }

    async fn set_state(&self, state: SessionState) {
        let mut client_state = self.client_state.lock().await;
        *client_state = state;
    }

    fn broker(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// Drives the connection until `shutdown` fires, delivering inbound
    /// messages to `handler`.
    ///
    /// Every failed attempt (refused or lost connection, refused or
    /// unsendable subscription) counts against the retry budget and is
    /// followed by a backoff. Returns an error only when that budget is
    /// exhausted.
    pub async fn run(
        self: Arc<Self>,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        info!("Starting broker session with {}...", self.broker());

        let mut mqtt_options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        mqtt_options.set_keep_alive(Duration::from_secs(10));
        mqtt_options.set_clean_session(true);

        if !self.config.username.is_empty() && !self.config.password.is_empty() {
            mqtt_options.set_credentials(&self.config.username, &self.config.password);
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        {
            let mut client_lock = self.client.lock().await;
            *client_lock = Some(client.clone());
        }
        self.set_state(SessionState::Connecting).await;

        let mut backoff = Backoff::new(self.config.retry_interval, self.config.max_retries);

        'session: loop {
            if *shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                polled = eventloop.poll() => polled,
            };

            let mut failure = match polled {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!("Connected to MQTT broker {}.", self.broker());
                        backoff.reset();
                        self.request_subscription(&client).await
                    } else {
                        error!("Connection failed with code {:?}", ack.code);
                        Some((
                            SessionState::ConnectFailed(format!("{:?}", ack.code)),
                            Recovery::Reconnect,
                        ))
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let accepted = ack
                        .return_codes
                        .iter()
                        .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
                    if accepted {
                        info!(
                            "Successfully subscribed to topic '{}'.",
                            self.config.control_topic
                        );
                        backoff.reset();
                        self.set_state(SessionState::Subscribed).await;
                        None
                    } else {
                        error!(
                            "Broker refused subscription to '{}': {:?}",
                            self.config.control_topic, ack.return_codes
                        );
                        Some((
                            SessionState::ConnectFailed("subscription refused".to_string()),
                            Recovery::Resubscribe,
                        ))
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if self.state().await == SessionState::Subscribed {
                        handler.on_message(&publish.topic, &publish.payload).await;
                    } else {
                        warn!(
                            "Dropping message on '{}' received before the subscription was confirmed.",
                            publish.topic
                        );
                    }
                    None
                }
                Ok(Event::Outgoing(outgoing)) => {
                    debug!("Outgoing event: {:?}", outgoing);
                    None
                }
                Ok(event) => {
                    debug!("Unhandled event: {:?}", event);
                    None
                }
                Err(e) => {
                    let state = match &e {
                        ConnectionError::ConnectionRefused(code) => {
                            error!("Connection failed with code {:?}", code);
                            SessionState::ConnectFailed(format!("{:?}", code))
                        }
                        other => {
                            error!("Error in MQTT event loop: {:?}", other);
                            SessionState::Disconnected
                        }
                    };
                    Some((state, Recovery::Reconnect))
                }
            };

            while let Some((state, recovery)) = failure.take() {
                self.set_state(state).await;

                if let Some(attempts) = backoff.exhausted() {
                    error!(
                        "Maximum number of retries ({}) reached. Stopping the session.",
                        self.config.max_retries
                    );
                    self.forget_client().await;
                    return Err(SessionError::RetriesExhausted {
                        broker: self.broker(),
                        attempts,
                    });
                }

                let delay = backoff.next_delay();
                match recovery {
                    Recovery::Reconnect => {
                        warn!("Lost connection to MQTT broker. Retrying in {:?}...", delay)
                    }
                    Recovery::Resubscribe => warn!(
                        "Subscription to '{}' not in place. Retrying in {:?}...",
                        self.config.control_topic, delay
                    ),
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break 'session;
                        }
                    }
                    _ = sleep(delay) => {}
                }

                self.set_state(SessionState::Connecting).await;
                if recovery == Recovery::Resubscribe {
                    failure = self.request_subscription(&client).await;
                }
            }
        }

        self.close(client, eventloop).await;
        Ok(())
    }

    /// Queues a SUBSCRIBE for the control topic without waiting on the event loop.
    async fn request_subscription(
        &self,
        client: &AsyncClient,
    ) -> Option<(SessionState, Recovery)> {
        let control_topic = &self.config.control_topic;
        match client.try_subscribe(control_topic, QoS::AtLeastOnce) {
            Ok(_) => {
                debug!("Subscription to '{}' requested.", control_topic);
                None
            }
            Err(e) => {
                error!("Failed to subscribe to topic '{}': {}", control_topic, e);
                Some((
                    SessionState::ConnectFailed(e.to_string()),
                    Recovery::Resubscribe,
                ))
            }
        }
    }

    async fn forget_client(&self) {
        let mut client_lock = self.client.lock().await;
        *client_lock = None;
    }

    /// Sends DISCONNECT and polls until it has been written or the flush
    /// deadline passes.
    async fn close(&self, client: AsyncClient, mut eventloop: EventLoop) {
        info!("Closing broker session...");
        self.set_state(SessionState::Disconnected).await;
        self.forget_client().await;

        if let Err(e) = client.try_disconnect() {
            warn!("Failed to request disconnect: {}", e);
            return;
        }

        let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
        })
        .await;

        match flushed {
            Ok(true) => info!("Disconnected from MQTT broker."),
            _ => warn!("Broker connection closed without a clean DISCONNECT."),
        }
    }
}

#[async_trait]
impl CommandPublisher for BrokerSession {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError> {
        let state = self.state().await;
        if state != SessionState::Subscribed {
            return Err(SessionError::NotConnected(state));
        }

        let client = self.client.lock().await;
        let client = client
            .as_ref()
            .ok_or(SessionError::NotConnected(SessionState::Disconnected))?;

        // Non-blocking so publishing from the delivery path cannot stall the event loop.
        client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|source| SessionError::Publish {
                topic: topic.to_string(),
                source,
            })?;
        debug!("Command queued for '{}'.", topic);
        Ok(())
    }
}
