//! Reconnecting real-time channel.
//!
//! A single driver task owns the link, the state machine and every timer.
//! It multiplexes commands from the handle, handshake completions, link
//! events and the retry / keep-alive deadlines with `tokio::select!`, so
//! handlers and transitions never run concurrently with each other.

use std::{sync::Arc, time::Duration};

use pulsewire_core::{
    Action, ChannelConfig, ChannelError, ConfigError, ConnectionMachine, ConnectionState,
    ConnectionStatus, Connector, Dispatcher, Inbound, Link, LinkEvent, MachineEvent, Message,
    Payload, Registry, Subscription, TransportError,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use uuid::Uuid;

use crate::protocol::{self, CodecError};

/// Send error.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Not connected (state: {0})")]
    NotConnected(ConnectionState),
    #[error("Encode failed: {0}")]
    Encode(#[from] CodecError),
    #[error("Connection task is not running")]
    DriverStopped,
}

enum Command {
    Connect,
    Disconnect,
    Send(String),
    Shutdown,
}

type HandshakeResult = (u64, Result<Box<dyn Link>, TransportError>);

/// Handle to one reconnecting real-time channel.
///
/// Must be created inside a tokio runtime. Dropping the handle stops the
/// driver and closes the connection.
pub struct RealtimeChannel {
    commands: mpsc::UnboundedSender<Command>,
    registry: Registry,
    status: watch::Receiver<ConnectionStatus>,
    client_id: String,
    task: Option<JoinHandle<()>>,
}

impl RealtimeChannel {
    /// Create a channel backed by the WebSocket connector.
    ///
    /// The channel starts `disconnected`; call [`RealtimeChannel::connect`].
    ///
    /// # Errors
    /// Returns error if the configuration is invalid.
    #[cfg(feature = "websocket")]
    pub fn new(config: ChannelConfig) -> Result<Self, ConfigError> {
        Self::with_connector(config, Arc::new(crate::websocket::WsConnector))
    }

    /// Create a channel that opens links through `connector`.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid.
    pub fn with_connector(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let endpoint = config.endpoint()?;
        let mut endpoint_label = endpoint.clone();
        endpoint_label.set_query(None);

        let registry = Registry::new();
        let machine = ConnectionMachine::new(config.backoff_policy());
        let (status_tx, status_rx) = watch::channel(machine.status());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (handshakes_tx, handshakes_rx) = mpsc::unbounded_channel();
        let client_id = Uuid::new_v4().to_string();

        let driver = Driver {
            machine,
            connector,
            endpoint: endpoint.to_string(),
            endpoint_label: endpoint_label.to_string(),
            dispatcher: Dispatcher::new(registry.clone()),
            status: status_tx,
            keep_alive: config.keep_alive_interval(),
            pong_timeout: config.pong_timeout(),
            connect_timeout: config.connect_timeout(),
            client_name: config.client_name,
            client_id: client_id.clone(),
            link: None,
            link_generation: 0,
            handshake: None,
            handshakes_tx,
            retry_at: None,
            next_ping: None,
            pong_deadline: None,
        };
        let task = tokio::spawn(driver.run(commands_rx, handshakes_rx));

        Ok(Self {
            commands: commands_tx,
            registry,
            status: status_rx,
            client_id,
            task: Some(task),
        })
    }

    /// Start connecting. No-op while connecting or connected.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Close the connection and cancel pending retries. No-op when already
    /// disconnected.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Publish a message to the server.
    ///
    /// The message is stamped with the current time if it has no
    /// timestamp. Messages are never queued: while the channel is not
    /// connected the send is rejected.
    ///
    /// # Errors
    /// Returns [`SendError::NotConnected`] unless connected, or an encode
    /// error for unserializable payloads.
    pub fn send(&self, message: Message) -> Result<(), SendError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            tracing::warn!(kind = %message.kind, %state, "Rejecting send while not connected");
            return Err(SendError::NotConnected(state));
        }
        let text = protocol::encode(message)?;
        self.commands
            .send(Command::Send(text))
            .map_err(|_| SendError::DriverStopped)
    }

    /// Publish a typed payload under its message type.
    ///
    /// # Errors
    /// Same as [`RealtimeChannel::send`].
    pub fn send_payload<P: Payload>(&self, payload: &P) -> Result<(), SendError> {
        let message = payload.to_message().map_err(CodecError::from)?;
        self.send(message)
    }

    /// Register a handler for one message type, or `"*"` for all.
    pub fn subscribe<F>(&self, kind: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.registry.subscribe(kind, handler)
    }

    /// Register a handler receiving decoded `P` payloads.
    pub fn subscribe_typed<P, F>(&self, handler: F) -> Subscription
    where
        P: Payload,
        F: Fn(P) + Send + Sync + 'static,
    {
        self.registry.subscribe_typed::<P, F>(handler)
    }

    /// Registry inbound messages are dispatched to.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    #[must_use]
    pub fn last_error(&self) -> Option<ChannelError> {
        self.status.borrow().last_error.clone()
    }

    /// Receiver notified on every status change.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Identifier sent in every `connect` announcement.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Stop the driver and wait for it to close the connection.
    pub async fn shutdown(mut self) {
        self.command(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Connection driver failed");
            }
        }
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::warn!("Connection driver is not running");
        }
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

struct Driver {
    machine: ConnectionMachine,
    connector: Arc<dyn Connector>,
    endpoint: String,
    /// Endpoint without the query string, safe to log.
    endpoint_label: String,
    dispatcher: Dispatcher,
    status: watch::Sender<ConnectionStatus>,
    client_name: String,
    client_id: String,
    keep_alive: Duration,
    pong_timeout: Option<Duration>,
    connect_timeout: Duration,
    link: Option<Box<dyn Link>>,
    link_generation: u64,
    handshake: Option<JoinHandle<()>>,
    handshakes_tx: mpsc::UnboundedSender<HandshakeResult>,
    retry_at: Option<Instant>,
    next_ping: Option<Instant>,
    pong_deadline: Option<Instant>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut handshakes: mpsc::UnboundedReceiver<HandshakeResult>,
    ) {
        loop {
            let retry_at = self.retry_at;
            let next_ping = self.next_ping;
            let pong_deadline = self.pong_deadline;

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Connect) => self.apply(MachineEvent::ConnectRequested).await,
                    Some(Command::Disconnect) => {
                        self.apply(MachineEvent::DisconnectRequested).await;
                    }
                    Some(Command::Send(text)) => self.write(text).await,
                    Some(Command::Shutdown) | None => break,
                },

                Some((generation, result)) = handshakes.recv() => {
                    self.on_handshake(generation, result).await;
                }

                event = next_link_event(&mut self.link) => self.on_link_event(event).await,

                () = sleep_until(pong_deadline) => self.on_pong_timeout().await,

                () = sleep_until(retry_at) => {
                    self.retry_at = None;
                    self.apply(MachineEvent::RetryElapsed).await;
                }

                () = sleep_until(next_ping) => self.send_ping().await,
            }
        }

        self.teardown().await;
        tracing::debug!(endpoint = %self.endpoint_label, "Connection driver stopped");
    }

    async fn apply(&mut self, event: MachineEvent) {
        for action in self.machine.handle(event) {
            self.execute(action).await;
        }
        let status = self.machine.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::Open { generation } => self.open(generation),
            Action::Established => self.on_established().await,
            Action::ScheduleRetry { attempt, delay } => {
                tracing::info!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Scheduling reconnection"
                );
                self.retry_at = Some(Instant::now() + delay);
            }
            Action::Exhausted { attempts } => {
                tracing::error!(
                    attempts,
                    endpoint = %self.endpoint_label,
                    "Maximum reconnection attempts reached"
                );
                self.retry_at = None;
            }
            Action::Teardown => self.teardown().await,
        }
    }

    fn open(&mut self, generation: u64) {
        if let Some(previous) = self.handshake.take() {
            previous.abort();
        }
        tracing::debug!(generation, endpoint = %self.endpoint_label, "Opening connection");

        let connector = Arc::clone(&self.connector);
        let endpoint = self.endpoint.clone();
        let timeout = self.connect_timeout;
        let tx = self.handshakes_tx.clone();
        self.handshake = Some(tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, connector.connect(&endpoint))
                .await
                .unwrap_or(Err(TransportError::Timeout));
            let _ = tx.send((generation, result));
        }));
    }

    async fn on_handshake(
        &mut self,
        generation: u64,
        result: Result<Box<dyn Link>, TransportError>,
    ) {
        if self.machine.is_current(generation) {
            self.handshake = None;
        }
        match result {
            Ok(mut link) => {
                if !self.machine.is_current(generation)
                    || self.machine.state() != ConnectionState::Connecting
                {
                    tracing::debug!(generation, "Closing link from abandoned handshake");
                    link.close().await;
                    return;
                }
                self.link = Some(link);
                self.link_generation = generation;
                self.apply(MachineEvent::HandshakeSucceeded { generation }).await;
            }
            Err(e) => {
                tracing::warn!(
                    generation,
                    error = %e,
                    endpoint = %self.endpoint_label,
                    "Handshake failed"
                );
                self.apply(MachineEvent::HandshakeFailed {
                    generation,
                    reason: e.to_string(),
                })
                .await;
            }
        }
    }

    async fn on_established(&mut self) {
        tracing::info!(endpoint = %self.endpoint_label, client_id = %self.client_id, "Connected");
        match protocol::announcement(&self.client_name, &self.client_id)
            .and_then(protocol::encode)
        {
            Ok(text) => self.write(text).await,
            Err(e) => tracing::error!(error = %e, "Failed to encode connect announcement"),
        }
        self.next_ping = Some(Instant::now() + self.keep_alive);
        self.pong_deadline = None;
    }

    async fn on_link_event(&mut self, event: Option<LinkEvent>) {
        let generation = self.link_generation;
        match event {
            Some(LinkEvent::Text(text)) => match self.dispatcher.handle_frame(&text) {
                Inbound::Pong => self.pong_deadline = None,
                Inbound::Ping => self.write_message(Message::pong()).await,
                Inbound::Dispatched(_) | Inbound::Malformed => {}
            },
            Some(LinkEvent::Closed { clean: true, reason }) => {
                tracing::info!(%reason, "Connection closed by peer");
                self.drop_link();
                self.apply(MachineEvent::ClosedCleanly { generation }).await;
            }
            Some(LinkEvent::Closed { clean: false, reason }) => {
                tracing::warn!(%reason, "Connection closed abnormally");
                self.drop_link();
                self.apply(MachineEvent::ClosedAbnormally { generation, reason })
                    .await;
            }
            Some(LinkEvent::Error(reason)) => {
                tracing::warn!(%reason, "Connection error");
                self.drop_link();
                self.apply(MachineEvent::TransportErrored {
                    generation,
                    reason: reason.clone(),
                })
                .await;
                self.apply(MachineEvent::ClosedAbnormally { generation, reason })
                    .await;
            }
            None => {
                tracing::warn!("Connection stream ended");
                self.drop_link();
                self.apply(MachineEvent::ClosedAbnormally {
                    generation,
                    reason: "stream ended".to_string(),
                })
                .await;
            }
        }
    }

    async fn on_pong_timeout(&mut self) {
        tracing::warn!(
            timeout_ms = self
                .pong_timeout
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            "No pong received, treating connection as dead"
        );
        let generation = self.link_generation;
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.drop_link();
        self.apply(MachineEvent::ClosedAbnormally {
            generation,
            reason: "keep-alive timed out".to_string(),
        })
        .await;
    }

    async fn send_ping(&mut self) {
        let now = Instant::now();
        self.next_ping = Some(now + self.keep_alive);
        if let (Some(timeout), None) = (self.pong_timeout, self.pong_deadline) {
            self.pong_deadline = Some(now + timeout);
        }
        self.write_message(Message::ping()).await;
    }

    async fn write_message(&mut self, message: Message) {
        match protocol::encode(message) {
            Ok(text) => self.write(text).await,
            Err(e) => tracing::error!(error = %e, "Failed to encode frame"),
        }
    }

    async fn write(&mut self, text: String) {
        let Some(link) = self.link.as_mut() else {
            tracing::warn!("Dropping outbound frame: no open connection");
            return;
        };
        // A failed write surfaces as a close on the read side.
        if let Err(e) = link.send_text(text).await {
            tracing::warn!(error = %e, "Failed to write frame");
        }
    }

    fn drop_link(&mut self) {
        self.link = None;
        self.next_ping = None;
        self.pong_deadline = None;
    }

    async fn teardown(&mut self) {
        if let Some(handshake) = self.handshake.take() {
            handshake.abort();
        }
        self.retry_at = None;
        self.next_ping = None;
        self.pong_deadline = None;
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
    }
}

async fn next_link_event(link: &mut Option<Box<dyn Link>>) -> Option<LinkEvent> {
    match link {
        Some(link) => link.next_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
