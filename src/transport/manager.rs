//! Transport manager
//!
//! One driver task owns the live channel, the reconnect timer, heartbeats,
//! and the polling queue. The public handle only sends commands to it, so
//! [`TransportManager::send`] never blocks and every status change happens
//! in one place.

use super::backoff::Backoff;
use super::channel::{HttpPollingClient, LiveConnector, LiveLink, PollingClient, WsConnector};
use super::config::TransportConfig;
use super::state_machine::{Action, Event, ReconnectMachine};
use super::{ConnectionStatus, DeliveryOutcome, DeliveryReceipt, TransportError, TransportHealth};
use consult_chat_backend::protocol::{ClientFrame, MessageRequest, ServerFrame};
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sentinel for "no round trip measured"
const NO_RTT: u64 = u64::MAX;

/// Heartbeats that may go unanswered before the channel counts as dropped
const MISSED_HEARTBEATS_LIMIT: u32 = 2;

/// Deadline for one polling request; covers the server's provider call
const POLL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type StatusCallback = Box<dyn Fn(ConnectionStatus) + Send + Sync>;

/// State shared between the handle and the driver
struct Shared {
    status: watch::Sender<ConnectionStatus>,
    callbacks: Mutex<Vec<StatusCallback>>,
    last_rtt_ms: AtomicU64,
}

impl Shared {
    fn publish(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
        let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        for callback in callbacks.iter() {
            callback(status);
        }
    }
}

/// A send waiting for its outcome
struct Pending {
    request: MessageRequest,
    reply: oneshot::Sender<DeliveryOutcome>,
}

impl Pending {
    fn resolve(self, outcome: DeliveryOutcome) {
        // The caller may have dropped its receipt
        let _ = self.reply.send(outcome);
    }

    fn correlates(&self, client_message_id: Option<&str>) -> bool {
        client_message_id.is_some() && self.request.client_message_id.as_deref() == client_message_id
    }
}

enum Command {
    Connect {
        session_id: String,
        ack: oneshot::Sender<ConnectionStatus>,
    },
    Send(Pending),
    Disconnect {
        ack: oneshot::Sender<()>,
    },
}

/// Handle to the client transport
///
/// Must be created inside a tokio runtime. Dropping the handle stops the
/// driver and closes the live channel.
pub struct TransportManager {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    status_rx: watch::Receiver<ConnectionStatus>,
    unhealthy_latency_ms: u64,
}

impl TransportManager {
    /// Start a manager over the given channel capabilities
    ///
    /// # Arguments
    /// * `config` - Reconnect, heartbeat, and polling settings
    /// * `connector` - Opens the live channel
    /// * `poller` - Request/response fallback path
    pub fn new(
        config: TransportConfig,
        connector: Arc<dyn LiveConnector>,
        poller: Arc<dyn PollingClient>,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let shared = Arc::new(Shared {
            status: status_tx,
            callbacks: Mutex::new(Vec::new()),
            last_rtt_ms: AtomicU64::new(NO_RTT),
        });
        let (commands, command_rx) = mpsc::unbounded_channel();
        let unhealthy_latency_ms = config.unhealthy_latency_ms;

        let driver = Driver::new(config, connector, poller, shared.clone());
        tokio::spawn(driver.run(command_rx));

        Self {
            commands,
            shared,
            status_rx,
            unhealthy_latency_ms,
        }
    }

    /// Start a manager speaking WebSocket and HTTP polling to `config.server_url`
    pub fn from_config(config: TransportConfig) -> Self {
        let connector = Arc::new(WsConnector::new(config.websocket_url()));
        let poller = Arc::new(HttpPollingClient::new(config.poll_url(), POLL_REQUEST_TIMEOUT));
        Self::new(config, connector, poller)
    }

    /// Open the live channel for a session
    ///
    /// Resolves once the first attempt settles: `connected` on success,
    /// `reconnecting` when retries are scheduled, `polling` when the server
    /// has no live channel, `failed` when no attempts are allowed.
    pub async fn connect(&self, session_id: impl Into<String>) -> ConnectionStatus {
        let (ack, rx) = oneshot::channel();
        let command = Command::Connect {
            session_id: session_id.into(),
            ack,
        };
        if self.commands.send(command).is_err() {
            return self.status();
        }
        rx.await.unwrap_or_else(|_| self.status())
    }

    /// Queue a message; the receipt resolves with its terminal outcome
    ///
    /// Uses the live channel when it is open and polling otherwise. A
    /// `client_message_id` is generated when the request has none.
    pub fn send(&self, mut request: MessageRequest) -> DeliveryReceipt {
        let client_message_id = request
            .client_message_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let (reply, rx) = oneshot::channel();

        // When the driver is gone the pending send is dropped and the
        // receipt resolves as cancelled
        let _ = self.commands.send(Command::Send(Pending { request, reply }));

        DeliveryReceipt::new(client_message_id, rx)
    }

    /// Register a callback for every status change
    ///
    /// Callbacks run on the driver task and must not block or register
    /// further callbacks.
    pub fn on_status_change<F>(&self, callback: F)
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    /// Watch the status
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Current status
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Status plus heartbeat latency
    pub fn health(&self) -> TransportHealth {
        let status = self.status();
        let rtt = self.shared.last_rtt_ms.load(Ordering::Relaxed);
        let last_rtt_ms = (rtt != NO_RTT).then_some(rtt);
        let healthy = status == ConnectionStatus::Connected
            && last_rtt_ms.map_or(true, |rtt| rtt <= self.unhealthy_latency_ms);

        TransportHealth {
            status,
            last_rtt_ms,
            healthy,
        }
    }

    /// Close the live channel and cancel reconnects and pending sends
    pub async fn disconnect(&self) {
        let (ack, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { ack }).is_ok() {
            let _ = rx.await;
        }
    }
}

type OpenFuture = BoxFuture<'static, Result<Box<dyn LiveLink>, TransportError>>;

/// The task that owns every connection resource
struct Driver {
    config: TransportConfig,
    connector: Arc<dyn LiveConnector>,
    poller: Arc<dyn PollingClient>,
    shared: Arc<Shared>,
    machine: ReconnectMachine,
    backoff: Backoff,
    session_id: Option<String>,
    link: Option<Box<dyn LiveLink>>,
    opening: Option<OpenFuture>,
    retry_at: Option<Instant>,
    heartbeat: Interval,
    unanswered_heartbeats: u32,
    epoch: Instant,
    // Sent over the live channel, awaiting the answer (send order)
    in_flight: VecDeque<Pending>,
    // Waiting for the single polling slot (send order)
    poll_queue: VecDeque<Pending>,
    polls: JoinSet<()>,
    connect_waiters: Vec<oneshot::Sender<ConnectionStatus>>,
}

impl Driver {
    fn new(
        config: TransportConfig,
        connector: Arc<dyn LiveConnector>,
        poller: Arc<dyn PollingClient>,
        shared: Arc<Shared>,
    ) -> Self {
        let period = config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            machine: ReconnectMachine::new(config.max_reconnect_attempts),
            backoff: Backoff::new(
                Duration::from_millis(config.reconnect_base_ms),
                Duration::from_millis(config.reconnect_max_delay_ms),
            ),
            config,
            connector,
            poller,
            shared,
            session_id: None,
            link: None,
            opening: None,
            retry_at: None,
            heartbeat,
            unanswered_heartbeats: 0,
            epoch: Instant::now(),
            in_flight: VecDeque::new(),
            poll_queue: VecDeque::new(),
            polls: JoinSet::new(),
            connect_waiters: Vec::new(),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let event = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                opened = next_open(&mut self.opening) => {
                    self.opening = None;
                    self.on_open_result(opened)
                }
                frame = next_frame(&mut self.link) => self.on_frame(frame),
                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    Some(Event::RetryDue)
                }
                _ = self.heartbeat.tick() => self.on_heartbeat().await,
                Some(_) = self.polls.join_next(), if !self.polls.is_empty() => {
                    self.on_poll_finished().await
                }
            };

            if let Some(event) = event {
                self.dispatch(event).await;
            }
        }

        debug!("Transport handle dropped, stopping driver");
        self.dispatch(Event::Disconnect).await;
    }

    /// Apply an event and every follow-up event it causes
    async fn dispatch(&mut self, event: Event) {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            next = self.apply(event).await;
        }
    }

    async fn apply(&mut self, event: Event) -> Option<Event> {
        if event == Event::Dropped {
            self.detach_link();
        }

        let Some(transition) = self.machine.handle(event) else {
            debug!(?event, status = %self.machine.status(), "Event ignored");
            return None;
        };

        if transition.from != transition.to {
            info!(from = %transition.from, to = %transition.to, "Transport status changed");
            self.shared.publish(transition.to);
            if transition.to != ConnectionStatus::Connecting {
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(transition.to);
                }
            }
        }

        match transition.action {
            Action::OpenLink => {
                self.start_open();
                None
            }
            Action::ScheduleRetry(attempt) => {
                let delay = self.backoff.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
                self.retry_at = Some(Instant::now() + delay);
                None
            }
            Action::StartHeartbeat => {
                self.unanswered_heartbeats = 0;
                self.heartbeat.reset();
                self.flush_queue().await
            }
            Action::GiveUp => {
                self.retry_at = None;
                warn!(
                    status = %transition.to,
                    failures = self.machine.failures(),
                    "Live channel unavailable, continuing over polling"
                );
                None
            }
            Action::Teardown => {
                self.teardown().await;
                None
            }
        }
    }

    async fn on_command(&mut self, command: Command) -> Option<Event> {
        match command {
            Command::Connect { session_id, ack } => {
                self.session_id = Some(session_id);
                self.dispatch(Event::Connect).await;
                let status = self.machine.status();
                if status == ConnectionStatus::Connecting {
                    self.connect_waiters.push(ack);
                } else {
                    let _ = ack.send(status);
                }
                None
            }
            Command::Send(pending) => self.route(pending).await,
            Command::Disconnect { ack } => {
                self.dispatch(Event::Disconnect).await;
                let _ = ack.send(());
                None
            }
        }
    }

    /// Whether earlier sends still wait on the polling path
    fn polling_busy(&self) -> bool {
        !self.polls.is_empty() || !self.poll_queue.is_empty()
    }

    /// Send over the live channel when it is open, otherwise queue for polling
    ///
    /// While earlier sends are still on the polling path, later ones queue
    /// behind them even if the live channel is open.
    async fn route(&mut self, mut pending: Pending) -> Option<Event> {
        if pending.request.session_id.is_none() {
            pending.request.session_id = self.session_id.clone();
        }

        if self.machine.status() == ConnectionStatus::Connected && self.polling_busy() {
            self.poll_queue.push_back(pending);
            return None;
        }

        if self.machine.status() == ConnectionStatus::Connected {
            if let Some(link) = self.link.as_mut() {
                let frame = ClientFrame::Message(pending.request.clone());
                return match link.send(&frame).await {
                    Ok(()) => {
                        self.in_flight.push_back(pending);
                        None
                    }
                    Err(e) => {
                        warn!(error = %e, "Live send failed, falling back to polling");
                        self.poll_queue.push_back(pending);
                        Some(Event::Dropped)
                    }
                };
            }
        }

        self.poll_queue.push_back(pending);
        self.start_next_poll();
        None
    }

    /// Move queued sends onto the live channel
    ///
    /// Waits while a poll is still running so its message is answered first.
    async fn flush_queue(&mut self) -> Option<Event> {
        if !self.polls.is_empty() {
            return None;
        }
        let Some(link) = self.link.as_mut() else {
            return None;
        };

        while let Some(pending) = self.poll_queue.pop_front() {
            let frame = ClientFrame::Message(pending.request.clone());
            if let Err(e) = link.send(&frame).await {
                warn!(error = %e, "Flush over live channel failed");
                self.poll_queue.push_front(pending);
                return Some(Event::Dropped);
            }
            self.in_flight.push_back(pending);
        }
        None
    }

    fn start_open(&mut self) {
        self.retry_at = None;
        let connector = self.connector.clone();
        let deadline = self.config.connect_timeout();
        self.opening = Some(Box::pin(async move {
            match tokio::time::timeout(deadline, connector.open()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(deadline)),
            }
        }));
    }

    fn on_open_result(&mut self, result: Result<Box<dyn LiveLink>, TransportError>) -> Option<Event> {
        match result {
            Ok(link) => {
                self.link = Some(link);
                Some(Event::Opened)
            }
            Err(TransportError::Unsupported(reason)) => {
                info!(%reason, "Server has no live channel");
                Some(Event::LiveUnsupported)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    failures = self.machine.failures() + 1,
                    "Live channel attempt failed"
                );
                Some(Event::OpenFailed { exhausted: false })
            }
        }
    }

    fn on_frame(&mut self, frame: Result<Option<ServerFrame>, TransportError>) -> Option<Event> {
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Live channel closed by server");
                return Some(Event::Dropped);
            }
            Err(e) => {
                warn!(error = %e, "Live channel lost");
                return Some(Event::Dropped);
            }
        };

        let (correlation, outcome) = match frame {
            ServerFrame::Pong { sent_at_ms } => {
                let rtt = self.now_ms().saturating_sub(sent_at_ms);
                self.unanswered_heartbeats = 0;
                self.shared.last_rtt_ms.store(rtt, Ordering::Relaxed);
                if rtt > self.config.unhealthy_latency_ms {
                    warn!(rtt_ms = rtt, "Heartbeat round trip above threshold");
                }
                return None;
            }
            ServerFrame::Reply(reply) => (reply.client_message_id.clone(), DeliveryOutcome::Delivered(reply)),
            ServerFrame::Busy {
                retry_after_secs,
                message,
                client_message_id,
            } => (
                client_message_id,
                DeliveryOutcome::Busy {
                    retry_after: Duration::from_secs(retry_after_secs),
                    message,
                },
            ),
            ServerFrame::Error {
                message,
                client_message_id,
            } => (
                client_message_id,
                DeliveryOutcome::Failed(TransportError::Rejected(message)),
            ),
        };

        let position = self
            .in_flight
            .iter()
            .position(|p| p.correlates(correlation.as_deref()));
        // Uncorrelated answers belong to the oldest message (answers come in order)
        let pending = match position {
            Some(index) => self.in_flight.remove(index),
            None => self.in_flight.pop_front(),
        };
        match pending {
            Some(pending) => pending.resolve(outcome),
            None => debug!("Answer without a pending message"),
        }
        None
    }

    async fn on_heartbeat(&mut self) -> Option<Event> {
        if self.machine.status() != ConnectionStatus::Connected {
            return None;
        }
        if self.unanswered_heartbeats >= MISSED_HEARTBEATS_LIMIT {
            warn!(
                missed = self.unanswered_heartbeats,
                "Heartbeats unanswered, treating live channel as lost"
            );
            return Some(Event::Dropped);
        }

        let sent_at_ms = self.now_ms();
        let link = self.link.as_mut()?;
        match link.send(&ClientFrame::Ping { sent_at_ms }).await {
            Ok(()) => {
                self.unanswered_heartbeats += 1;
                None
            }
            Err(e) => {
                warn!(error = %e, "Heartbeat send failed");
                Some(Event::Dropped)
            }
        }
    }

    /// Forget the dead channel; unanswered messages go to polling first
    fn detach_link(&mut self) {
        self.link = None;
        self.unanswered_heartbeats = 0;
        self.shared.last_rtt_ms.store(NO_RTT, Ordering::Relaxed);
        while let Some(pending) = self.in_flight.pop_back() {
            self.poll_queue.push_front(pending);
        }
        self.start_next_poll();
    }

    /// A poll finished; hand the rest of the queue to whichever path is up
    async fn on_poll_finished(&mut self) -> Option<Event> {
        if self.machine.status() == ConnectionStatus::Connected && self.link.is_some() {
            self.flush_queue().await
        } else {
            self.start_next_poll();
            None
        }
    }

    /// Start the next polling request if the slot is free
    ///
    /// One request at a time keeps the session's messages in send order.
    fn start_next_poll(&mut self) {
        if !self.polls.is_empty() {
            return;
        }
        let Some(pending) = self.poll_queue.pop_front() else {
            return;
        };

        let poller = self.poller.clone();
        let max_attempts = self.config.poll_max_attempts;
        let interval = self.config.poll_interval();
        self.polls.spawn(async move {
            let Pending { request, reply } = pending;
            let frame = ClientFrame::Message(request);
            let outcome = match poll_with_retry(poller.as_ref(), &frame, max_attempts, interval).await {
                Ok(answer) => outcome_from_frame(answer),
                Err(e) => {
                    warn!(error = %e, "Polling request failed");
                    DeliveryOutcome::Failed(e)
                }
            };
            let _ = reply.send(outcome);
        });
    }

    async fn teardown(&mut self) {
        self.opening = None;
        self.retry_at = None;
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.unanswered_heartbeats = 0;
        self.shared.last_rtt_ms.store(NO_RTT, Ordering::Relaxed);

        // Aborted polls drop their reply senders, which cancels their receipts
        self.polls.abort_all();
        for pending in self.in_flight.drain(..).chain(self.poll_queue.drain(..)) {
            pending.resolve(DeliveryOutcome::Failed(TransportError::Cancelled));
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

async fn next_open(opening: &mut Option<OpenFuture>) -> Result<Box<dyn LiveLink>, TransportError> {
    match opening {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(
    link: &mut Option<Box<dyn LiveLink>>,
) -> Result<Option<ServerFrame>, TransportError> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn poll_with_retry(
    poller: &dyn PollingClient,
    frame: &ClientFrame,
    max_attempts: u32,
    interval: Duration,
) -> Result<ServerFrame, TransportError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match poller.exchange(frame).await {
            Ok(answer) => return Ok(answer),
            Err(e) if attempt < max_attempts => {
                debug!(attempt, error = %e, "Polling request failed, retrying");
                tokio::time::sleep(interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn outcome_from_frame(frame: ServerFrame) -> DeliveryOutcome {
    match frame {
        ServerFrame::Reply(reply) => DeliveryOutcome::Delivered(reply),
        ServerFrame::Busy {
            retry_after_secs,
            message,
            ..
        } => DeliveryOutcome::Busy {
            retry_after: Duration::from_secs(retry_after_secs),
            message,
        },
        ServerFrame::Error { message, .. } => {
            DeliveryOutcome::Failed(TransportError::Rejected(message))
        }
        ServerFrame::Pong { .. } => DeliveryOutcome::Failed(TransportError::Protocol(
            "pong received for a message".to_string(),
        )),
    }
}
