//! Per-session channel ownership, routing and reconnection.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{ClientMessage, ServerMessage};
use super::reconnect::{reconnect, ReconnectOutcome, ReconnectPolicy};
use super::{ConnectionError, Transport};
use crate::config::ServerConfig;
use crate::metrics::{CHANNELS_OPEN, REMOTE_MESSAGES};

/// Signals delivered to a task's route.
#[derive(Debug, Clone)]
pub enum TaskSignal {
    /// A frame from the service about this task.
    Remote(ServerMessage),
    /// The channel dropped and came back; remote state should be re-queried.
    Reconnected,
    /// The channel dropped and every reconnect attempt failed.
    ConnectionLost(String),
}

pub type SignalReceiver = mpsc::UnboundedReceiver<TaskSignal>;

/// How a submit frame was answered.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    Accepted {
        task_id: String,
        session_id: Option<String>,
    },
    Rejected(String),
    /// The channel dropped and could not be re-established before an answer arrived.
    ConnectionLost,
}

/// Handles returned by [`ChannelHandle::submit`].
pub struct Submission {
    pub ack: oneshot::Receiver<AckOutcome>,
    /// Signals for the task, routed under the remote id once accepted.
    pub signals: SignalReceiver,
}

/// Timing knobs for channels.
#[derive(Debug, Clone)]
pub struct ConnectionPolicy {
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl From<&ServerConfig> for ConnectionPolicy {
    fn from(config: &ServerConfig) -> Self {
        Self {
            acquire_timeout: config.timeout(),
            idle_timeout: config.idle_timeout(),
            reconnect: ReconnectPolicy::from(config),
        }
    }
}

/// Snapshot of one channel, for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub session_id: String,
    pub state: &'static str,
    pub routes: usize,
    pub pending_acks: usize,
}

#[derive(Clone)]
enum Link {
    Down,
    Connecting,
    Up(mpsc::Sender<ClientMessage>),
    Reconnecting,
}

impl Link {
    fn name(&self) -> &'static str {
        match self {
            Link::Down => "down",
            Link::Connecting => "connecting",
            Link::Up(_) => "up",
            Link::Reconnecting => "reconnecting",
        }
    }
}

struct PendingAck {
    client_ref: String,
    /// The submit frame, resent if the channel is re-established.
    frame: ClientMessage,
    ack: oneshot::Sender<AckOutcome>,
    route: mpsc::UnboundedSender<TaskSignal>,
}

/// One session's connection, its routing table and its pending acknowledgments.
struct SessionChannel {
    session_id: String,
    transport: Arc<dyn Transport>,
    policy: ConnectionPolicy,
    cancel: CancellationToken,
    link: watch::Sender<Link>,
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<TaskSignal>>>,
    pending: Mutex<VecDeque<PendingAck>>,
    last_activity: Mutex<Instant>,
}

impl SessionChannel {
    fn new(
        session_id: &str,
        transport: Arc<dyn Transport>,
        policy: ConnectionPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let (link, _) = watch::channel(Link::Down);
        Self {
            session_id: session_id.to_string(),
            transport,
            policy,
            cancel,
            link,
            routes: Mutex::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    fn set_link(&self, link: Link) {
        let was_up = matches!(*self.link.borrow(), Link::Up(_));
        let is_up = matches!(link, Link::Up(_));
        self.link.send_replace(link);
        match (was_up, is_up) {
            (false, true) => CHANNELS_OPEN.inc(),
            (true, false) => CHANNELS_OPEN.dec(),
            _ => {}
        }
    }

    /// Live outbound half, connecting if the channel is down.
    ///
    /// Waits out an in-progress connect or reconnect, bounded by the
    /// acquisition timeout.
    async fn outbound(self: &Arc<Self>) -> Result<mpsc::Sender<ClientMessage>, ConnectionError> {
        if self.cancel.is_cancelled() {
            return Err(ConnectionError::Shutdown);
        }
        let deadline = Instant::now() + self.policy.acquire_timeout;
        let mut watcher = self.link.subscribe();

        loop {
            let current = watcher.borrow_and_update().clone();
            match current {
                Link::Up(outbound) if !outbound.is_closed() => return Ok(outbound),
                Link::Down => {
                    let claimed = self.link.send_if_modified(|link| {
                        if matches!(link, Link::Down) {
                            *link = Link::Connecting;
                            true
                        } else {
                            false
                        }
                    });
                    if claimed {
                        return self.connect(deadline).await;
                    }
                }
                // Connecting, reconnecting, or an Up link whose pump has not
                // yet noticed the loss.
                _ => match tokio::time::timeout_at(deadline, watcher.changed()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return Err(ConnectionError::Closed),
                    Err(_) => {
                        return Err(ConnectionError::AcquireTimeout(self.policy.acquire_timeout))
                    }
                },
            }
        }
    }

    async fn connect(
        self: &Arc<Self>,
        deadline: Instant,
    ) -> Result<mpsc::Sender<ClientMessage>, ConnectionError> {
        match tokio::time::timeout_at(deadline, self.transport.connect()).await {
            Ok(Ok(connection)) => {
                let outbound = connection.outbound.clone();
                self.touch().await;
                self.set_link(Link::Up(connection.outbound));
                info!(session_id = %self.session_id, "Session channel open");
                tokio::spawn(Arc::clone(self).pump(connection.inbound));
                Ok(outbound)
            }
            Ok(Err(e)) => {
                self.link.send_replace(Link::Down);
                warn!(session_id = %self.session_id, error = %e, "Failed to open session channel");
                Err(ConnectionError::Unavailable(e))
            }
            Err(_) => {
                self.link.send_replace(Link::Down);
                Err(ConnectionError::AcquireTimeout(self.policy.acquire_timeout))
            }
        }
    }

    async fn send(self: &Arc<Self>, msg: ClientMessage) -> Result<(), ConnectionError> {
        let outbound = self.outbound().await?;
        let command = msg.command();
        outbound
            .send(msg)
            .await
            .map_err(|_| ConnectionError::Closed)?;
        self.touch().await;
        debug!(session_id = %self.session_id, command, "Sent frame");
        Ok(())
    }

    /// Read inbound frames until the channel closes for good.
    async fn pump(self: Arc<Self>, mut inbound: mpsc::Receiver<ServerMessage>) {
        let period = (self.policy.idle_timeout / 4)
            .clamp(Duration::from_millis(10), Duration::from_secs(30));
        let mut idle_check = tokio::time::interval(period);
        idle_check.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.fail_pending().await;
                    self.set_link(Link::Down);
                    return;
                }
                frame = inbound.recv() => match frame {
                    Some(msg) => {
                        self.touch().await;
                        self.dispatch(msg).await;
                    }
                    None => {
                        warn!(session_id = %self.session_id, "Session channel lost");
                        match self.recover().await {
                            Some(next) => inbound = next,
                            None => return,
                        }
                    }
                },
                _ = idle_check.tick() => {
                    if self.is_idle().await {
                        info!(session_id = %self.session_id, "Closing idle session channel");
                        self.set_link(Link::Down);
                        return;
                    }
                }
            }
        }
    }

    async fn is_idle(&self) -> bool {
        self.routes.lock().await.is_empty()
            && self.pending.lock().await.is_empty()
            && self.last_activity.lock().await.elapsed() >= self.policy.idle_timeout
    }

    /// Reconnect after a loss. Returns the new inbound half, or `None` if the
    /// channel is now down.
    ///
    /// Unacknowledged submissions are resent on the new connection; they fail
    /// only once the reconnect budget is spent.
    async fn recover(&self) -> Option<mpsc::Receiver<ServerMessage>> {
        let quiet =
            self.routes.lock().await.is_empty() && self.pending.lock().await.is_empty();
        if quiet {
            debug!(session_id = %self.session_id, "No routed tasks, reconnecting lazily");
            self.set_link(Link::Down);
            return None;
        }

        self.set_link(Link::Reconnecting);
        match reconnect(
            self.transport.as_ref(),
            &self.policy.reconnect,
            &self.cancel,
            &self.session_id,
        )
        .await
        {
            ReconnectOutcome::Connected(connection) => {
                // Collected before the new link is published, so every frame
                // here went out on a connection that is gone.
                let unanswered: Vec<ClientMessage> = self
                    .pending
                    .lock()
                    .await
                    .iter()
                    .map(|p| p.frame.clone())
                    .collect();
                self.touch().await;
                let outbound = connection.outbound.clone();
                self.set_link(Link::Up(connection.outbound));
                if !unanswered.is_empty() {
                    info!(
                        session_id = %self.session_id,
                        count = unanswered.len(),
                        "Resending unacknowledged submissions"
                    );
                    for frame in unanswered {
                        if outbound.send(frame).await.is_err() {
                            warn!(session_id = %self.session_id, "Channel closed while resending submissions");
                            break;
                        }
                    }
                }
                self.broadcast(TaskSignal::Reconnected).await;
                Some(connection.inbound)
            }
            ReconnectOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                self.set_link(Link::Down);
                let reason = format!(
                    "connection lost after {} reconnect attempts: {}",
                    attempts, last_error
                );
                warn!(session_id = %self.session_id, "{}", reason);
                self.fail_pending().await;
                let routes: Vec<_> = self.routes.lock().await.drain().collect();
                for (_, route) in routes {
                    let _ = route.send(TaskSignal::ConnectionLost(reason.clone()));
                }
                None
            }
            ReconnectOutcome::Cancelled => {
                self.fail_pending().await;
                self.set_link(Link::Down);
                None
            }
        }
    }

    async fn broadcast(&self, signal: TaskSignal) {
        self.routes
            .lock()
            .await
            .retain(|_, route| route.send(signal.clone()).is_ok());
    }

    async fn fail_pending(&self) {
        let pending: Vec<_> = self.pending.lock().await.drain(..).collect();
        for entry in pending {
            debug!(session_id = %self.session_id, client_ref = %entry.client_ref, "Dropping pending acknowledgment");
            let _ = entry.ack.send(AckOutcome::ConnectionLost);
        }
    }

    async fn dispatch(&self, msg: ServerMessage) {
        REMOTE_MESSAGES
            .with_label_values(&[msg.message_type()])
            .inc();

        match msg {
            ServerMessage::Accepted {
                task_id,
                client_ref,
                session_id,
            } => {
                let Some(entry) = self.take_pending(client_ref.as_deref()).await else {
                    warn!(session_id = %self.session_id, task_id = %task_id, "Acknowledgment with no pending submission");
                    return;
                };
                // Route first so frames right after the ack are not lost.
                self.routes
                    .lock()
                    .await
                    .insert(task_id.clone(), entry.route);
                let _ = entry.ack.send(AckOutcome::Accepted {
                    task_id,
                    session_id,
                });
            }
            ServerMessage::Rejected {
                client_ref,
                message,
            } => match self.take_pending(client_ref.as_deref()).await {
                Some(entry) => {
                    let _ = entry.ack.send(AckOutcome::Rejected(message));
                }
                None => {
                    warn!(session_id = %self.session_id, "Rejection with no pending submission: {}", message)
                }
            },
            other => {
                let Some(task_id) = other.task_id().map(str::to_string) else {
                    return;
                };
                let mut routes = self.routes.lock().await;
                match routes.get(&task_id) {
                    Some(route) => {
                        if route.send(TaskSignal::Remote(other)).is_err() {
                            routes.remove(&task_id);
                        }
                    }
                    None => debug!(
                        session_id = %self.session_id,
                        task_id = %task_id,
                        "No route for frame, dropping"
                    ),
                }
            }
        }
    }

    /// Match by `client_ref` when the service echoes it, else oldest first.
    async fn take_pending(&self, client_ref: Option<&str>) -> Option<PendingAck> {
        let mut pending = self.pending.lock().await;
        match client_ref {
            Some(client_ref) => {
                let index = pending.iter().position(|p| p.client_ref == client_ref)?;
                pending.remove(index)
            }
            None => pending.pop_front(),
        }
    }

    /// Down, unused, and referenced only by the manager's map.
    fn is_disposable(self: &Arc<Self>) -> bool {
        Arc::strong_count(self) == 1
            && matches!(*self.link.borrow(), Link::Down)
            && self.routes.try_lock().is_ok_and(|r| r.is_empty())
            && self.pending.try_lock().is_ok_and(|p| p.is_empty())
    }

    async fn status(&self) -> ChannelStatus {
        // The watch guard is not Send; release it before awaiting.
        let state = self.link.borrow().name();
        ChannelStatus {
            session_id: self.session_id.clone(),
            state,
            routes: self.routes.lock().await.len(),
            pending_acks: self.pending.lock().await.len(),
        }
    }
}

/// A session's channel, as handed to task drivers.
#[derive(Clone)]
pub struct ChannelHandle {
    channel: Arc<SessionChannel>,
}

impl ChannelHandle {
    pub fn session_id(&self) -> &str {
        &self.channel.session_id
    }

    /// Send a frame, reconnecting lazily if the channel was closed.
    pub async fn send(&self, msg: ClientMessage) -> Result<(), ConnectionError> {
        self.channel.send(msg).await
    }

    /// Send a submit frame and register for its acknowledgment.
    ///
    /// The pending entry exists before the frame leaves, so the answer cannot
    /// race ahead of it. If the channel drops first, the frame is resent after
    /// a successful reconnect.
    pub async fn submit(
        &self,
        client_ref: &str,
        msg: ClientMessage,
    ) -> Result<Submission, ConnectionError> {
        let outbound = self.channel.outbound().await?;
        let (ack_tx, ack_rx) = oneshot::channel();
        let (route_tx, route_rx) = mpsc::unbounded_channel();
        self.channel.pending.lock().await.push_back(PendingAck {
            client_ref: client_ref.to_string(),
            frame: msg.clone(),
            ack: ack_tx,
            route: route_tx,
        });

        if outbound.send(msg).await.is_err() {
            self.abandon(client_ref).await;
            return Err(ConnectionError::Closed);
        }
        self.channel.touch().await;
        debug!(session_id = %self.channel.session_id, client_ref, "Sent submission");

        Ok(Submission {
            ack: ack_rx,
            signals: route_rx,
        })
    }

    /// Stop waiting for the acknowledgment of `client_ref`.
    pub async fn abandon(&self, client_ref: &str) {
        self.channel
            .pending
            .lock()
            .await
            .retain(|p| p.client_ref != client_ref);
    }

    /// Route frames for an already-acknowledged `task_id` to the returned receiver.
    ///
    /// Replaces any previous route for the same id.
    pub async fn register_route(&self, task_id: &str) -> SignalReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channel
            .routes
            .lock()
            .await
            .insert(task_id.to_string(), tx);
        rx
    }

    pub async fn unregister_route(&self, task_id: &str) {
        self.channel.routes.lock().await.remove(task_id);
    }
}

/// Owns one channel per session over a shared [`Transport`].
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    policy: ConnectionPolicy,
    channels: Mutex<HashMap<String, Arc<SessionChannel>>>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, policy: ConnectionPolicy) -> Self {
        Self {
            transport,
            policy,
            channels: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn policy(&self) -> &ConnectionPolicy {
        &self.policy
    }

    async fn entry(&self, session_id: &str) -> Arc<SessionChannel> {
        let mut channels = self.channels.lock().await;
        prune(&mut channels);
        Arc::clone(channels.entry(session_id.to_string()).or_insert_with(|| {
            Arc::new(SessionChannel::new(
                session_id,
                Arc::clone(&self.transport),
                self.policy.clone(),
                self.cancel.child_token(),
            ))
        }))
    }

    /// The session's channel, connected. Fails after the acquisition timeout.
    pub async fn acquire_channel(&self, session_id: &str) -> Result<ChannelHandle, ConnectionError> {
        let channel = self.entry(session_id).await;
        channel.outbound().await?;
        Ok(ChannelHandle { channel })
    }

    /// The session's channel without forcing a connection; sends connect lazily.
    pub async fn channel(&self, session_id: &str) -> ChannelHandle {
        ChannelHandle {
            channel: self.entry(session_id).await,
        }
    }

    pub async fn send(&self, session_id: &str, msg: ClientMessage) -> Result<(), ConnectionError> {
        self.entry(session_id).await.send(msg).await
    }

    pub async fn register_route(&self, session_id: &str, task_id: &str) -> SignalReceiver {
        self.channel(session_id).await.register_route(task_id).await
    }

    pub async fn status(&self) -> Vec<ChannelStatus> {
        let channels: Vec<_> = {
            let mut channels = self.channels.lock().await;
            prune(&mut channels);
            channels.values().cloned().collect()
        };
        let mut statuses = Vec::with_capacity(channels.len());
        for channel in channels {
            statuses.push(channel.status().await);
        }
        statuses.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        statuses
    }

    /// Close a session's channel and forget it.
    ///
    /// Pending acknowledgments resolve as lost. Returns false if the session
    /// had no channel.
    pub async fn close_session(&self, session_id: &str) -> bool {
        let removed = self.channels.lock().await.remove(session_id);
        match removed {
            Some(channel) => {
                channel.cancel.cancel();
                info!(session_id, "Session channel closed");
                true
            }
            None => false,
        }
    }

    /// Close every channel and refuse further sends.
    pub fn shutdown(&self) {
        info!("Shutting down connection manager");
        self.cancel.cancel();
    }
}

/// Drop channels that went down with nothing left to serve.
fn prune(channels: &mut HashMap<String, Arc<SessionChannel>>) {
    channels.retain(|_, channel| !channel.is_disposable());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTrellisService;

    fn policy() -> ConnectionPolicy {
        ConnectionPolicy {
            acquire_timeout: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(60),
            reconnect: ReconnectPolicy {
                max_attempts: 2,
                delay: Duration::from_millis(10),
                connect_timeout: Duration::from_millis(200),
            },
        }
    }

    fn check_status(task_id: &str) -> ClientMessage {
        ClientMessage::CheckStatus {
            task_id: task_id.to_string(),
            session_id: None,
        }
    }

    #[tokio::test]
    async fn acquire_connects_once_per_session() {
        let service = MockTrellisService::new();
        let manager = ConnectionManager::new(service.transport(), policy());

        manager.acquire_channel("a").await.unwrap();
        manager.acquire_channel("a").await.unwrap();
        manager.acquire_channel("b").await.unwrap();

        assert_eq!(service.connect_count().await, 2);
    }

    #[tokio::test]
    async fn acquire_fails_when_service_unreachable() {
        let service = MockTrellisService::new();
        service.set_reachable(false).await;
        let manager = ConnectionManager::new(service.transport(), policy());

        let err = manager.acquire_channel("a").await.err().unwrap();
        assert!(matches!(err, ConnectionError::Unavailable(_)));
    }

    #[tokio::test]
    async fn frames_are_routed_by_task_id() {
        let service = MockTrellisService::new();
        let manager = ConnectionManager::new(service.transport(), policy());
        let handle = manager.acquire_channel("s").await.unwrap();

        let mut first = handle.register_route("t-1").await;
        let mut second = handle.register_route("t-2").await;
        service
            .push(ServerMessage::Error {
                task_id: "t-2".to_string(),
                message: "boom".to_string(),
            })
            .await;

        match second.recv().await.unwrap() {
            TaskSignal::Remote(ServerMessage::Error { message, .. }) => assert_eq!(message, "boom"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(first.try_recv().is_err());
    }

    #[tokio::test]
    async fn submit_ack_installs_route() {
        let service = MockTrellisService::new();
        let manager = ConnectionManager::new(service.transport(), policy());
        let handle = manager.acquire_channel("s").await.unwrap();

        let submission = handle
            .submit("local-1", check_status("ignored"))
            .await
            .unwrap();
        service
            .push(ServerMessage::Accepted {
                task_id: "remote-1".to_string(),
                client_ref: Some("local-1".to_string()),
                session_id: None,
            })
            .await;
        service
            .push(ServerMessage::Progress {
                task_id: "remote-1".to_string(),
                stage: "sparse".to_string(),
                progress: 0.5,
            })
            .await;

        assert_eq!(
            submission.ack.await.unwrap(),
            AckOutcome::Accepted {
                task_id: "remote-1".to_string(),
                session_id: None
            }
        );
        let mut signals = submission.signals;
        assert!(matches!(
            signals.recv().await.unwrap(),
            TaskSignal::Remote(ServerMessage::Progress { .. })
        ));
    }

    #[tokio::test]
    async fn unmatched_acks_resolve_in_fifo_order() {
        let service = MockTrellisService::new();
        let manager = ConnectionManager::new(service.transport(), policy());
        let handle = manager.acquire_channel("s").await.unwrap();

        let first = handle.submit("a", check_status("x")).await.unwrap();
        let second = handle.submit("b", check_status("y")).await.unwrap();
        service
            .push(ServerMessage::Rejected {
                client_ref: None,
                message: "busy".to_string(),
            })
            .await;
        service
            .push(ServerMessage::Accepted {
                task_id: "r-b".to_string(),
                client_ref: None,
                session_id: None,
            })
            .await;

        assert_eq!(
            first.ack.await.unwrap(),
            AckOutcome::Rejected("busy".to_string())
        );
        assert!(matches!(
            second.ack.await.unwrap(),
            AckOutcome::Accepted { task_id, .. } if task_id == "r-b"
        ));
    }

    #[tokio::test]
    async fn drop_resends_pending_submissions_and_reconnects_routed_tasks() {
        let service = MockTrellisService::new();
        let manager = ConnectionManager::new(service.transport(), policy());
        let handle = manager.acquire_channel("s").await.unwrap();

        let mut routed = handle.register_route("t-1").await;
        let pending = handle.submit("local-2", check_status("z")).await.unwrap();

        service.drop_connections().await;

        assert!(matches!(
            routed.recv().await.unwrap(),
            TaskSignal::Reconnected
        ));
        assert_eq!(service.connect_count().await, 2);
        // Sent once on the lost connection and once after reconnecting.
        let sent = service.sent_messages().await;
        assert_eq!(sent.iter().filter(|m| **m == check_status("z")).count(), 2);

        service
            .push(ServerMessage::Accepted {
                task_id: "r-2".to_string(),
                client_ref: Some("local-2".to_string()),
                session_id: None,
            })
            .await;
        assert!(matches!(
            pending.ack.await.unwrap(),
            AckOutcome::Accepted { task_id, .. } if task_id == "r-2"
        ));
    }

    #[tokio::test]
    async fn drop_with_only_pending_submission_reconnects() {
        let service = MockTrellisService::new();
        let manager = ConnectionManager::new(service.transport(), policy());
        let handle = manager.acquire_channel("s").await.unwrap();
        let _pending = handle.submit("local-1", check_status("q")).await.unwrap();

        service.drop_connections().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(service.connect_count().await, 2);
        let status = manager.status().await;
        assert_eq!(status[0].state, "up");
        assert_eq!(status[0].pending_acks, 1);
    }

    #[tokio::test]
    async fn exhausted_reconnect_signals_connection_lost() {
        let service = MockTrellisService::new();
        let manager = ConnectionManager::new(service.transport(), policy());
        let handle = manager.acquire_channel("s").await.unwrap();
        let mut routed = handle.register_route("t-1").await;
        let pending = handle.submit("local-1", check_status("q")).await.unwrap();

        service.set_reachable(false).await;
        service.drop_connections().await;

        match routed.recv().await.unwrap() {
            TaskSignal::ConnectionLost(reason) => {
                assert!(reason.contains("after 2 reconnect attempts"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pending.ack.await.unwrap(), AckOutcome::ConnectionLost);
        // 1 initial + 2 failed attempts.
        assert_eq!(service.connect_count().await, 3);
    }

    #[tokio::test]
    async fn drop_without_routes_reconnects_lazily() {
        let service = MockTrellisService::new();
        let manager = ConnectionManager::new(service.transport(), policy());
        manager.acquire_channel("s").await.unwrap();

        service.drop_connections().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.connect_count().await, 1);

        manager.send("s", check_status("t")).await.unwrap();
        assert_eq!(service.connect_count().await, 2);
    }

    #[tokio::test]
    async fn idle_channel_is_closed() {
        let service = MockTrellisService::new();
        let mut policy = policy();
        policy.idle_timeout = Duration::from_millis(40);
        let manager = ConnectionManager::new(service.transport(), policy);
        manager.acquire_channel("s").await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(manager.status().await.is_empty());

        manager.send("s", check_status("t")).await.unwrap();
        assert_eq!(service.connect_count().await, 2);
        assert_eq!(manager.status().await[0].state, "up");
    }

    #[tokio::test]
    async fn idle_channel_held_by_a_handle_is_kept() {
        let service = MockTrellisService::new();
        let mut policy = policy();
        policy.idle_timeout = Duration::from_millis(40);
        let manager = ConnectionManager::new(service.transport(), policy);
        let _handle = manager.acquire_channel("s").await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = manager.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].state, "down");
    }

    #[tokio::test]
    async fn close_session_forgets_the_channel() {
        let service = MockTrellisService::new();
        let manager = ConnectionManager::new(service.transport(), policy());
        let handle = manager.acquire_channel("s").await.unwrap();
        manager.acquire_channel("other").await.unwrap();
        let pending = handle.submit("local-1", check_status("q")).await.unwrap();

        assert!(manager.close_session("s").await);
        assert!(!manager.close_session("s").await);

        assert_eq!(pending.ack.await.unwrap(), AckOutcome::ConnectionLost);
        let status = manager.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].session_id, "other");
        assert!(matches!(
            handle.send(check_status("q")).await,
            Err(ConnectionError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn status_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let service = MockTrellisService::new();
        let manager = ConnectionManager::new(service.transport(), policy());
        let status = manager.status();
        assert_send(&status);
        assert!(status.await.is_empty());
    }
}
