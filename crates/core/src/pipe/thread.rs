//! The per-client state machine.
//!
//! Each accepted client owns one task and one bounded message queue. The
//! task runs the subscription handshake, then drains the queue, writing
//! one message per dequeue. During idle waits the connection is probed so
//! a silently vanished client is detected within one timeout interval.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::app::ApplicationData;
use crate::msg::{
    timestamp_ms, Message, MessageCategory, MessageProtocol, MessageType, ProtocolMask,
    SUBSCRIBABLE_CATEGORIES,
};
use crate::pipe::platform::{is_disconnect, PipeStream, Probe};
use crate::pipe::tracking::MessageTracking;

/// Items flowing through a client queue. `Wake` is the shutdown sentinel:
/// it only rouses a blocked waiter and is never written to the pipe.
pub(crate) enum QueueItem {
    /// A message to deliver.
    Deliver(Arc<Message>),
    /// Discarded by the consumer.
    Wake,
}

/// Subscription request read from a freshly connected client.
#[derive(Debug, Deserialize)]
struct SubscribeRequest {
    #[serde(default)]
    subscribe: u8,
    #[serde(default)]
    protocol: String,
}

/// Handle to one client connection, shared between the fan-out path and
/// the client task itself.
pub(crate) struct PipeThread {
    id: usize,
    tx: mpsc::Sender<QueueItem>,
    subscription: AtomicU8,
    protocol: AtomicU8,
    running: AtomicBool,
    bridge_validator: AtomicU64,
    cancel: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl PipeThread {
    /// Start the client task. `bridge_validator` is the revision already
    /// delivered inside the `ConnectionStatus` handshake.
    pub(crate) fn spawn(
        id: usize,
        stream: PipeStream,
        app: Arc<ApplicationData>,
        tracking: Arc<MessageTracking>,
        bridge_validator: u64,
        cancel: CancellationToken,
    ) -> Arc<PipeThread> {
        let (tx, rx) = mpsc::channel(app.config.msg_queue_size.max(1));

        let thread = Arc::new(PipeThread {
            id,
            tx,
            subscription: AtomicU8::new(0),
            protocol: AtomicU8::new(0),
            running: AtomicBool::new(true),
            bridge_validator: AtomicU64::new(bridge_validator),
            cancel,
            join: Mutex::new(None),
        });

        let task = tokio::spawn(run_client(Arc::clone(&thread), stream, rx, app, tracking));
        *thread.join.lock().unwrap() = Some(task);
        thread
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// The task is still alive (connection not yet closed).
    pub(crate) fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Committed protocol, if the handshake has completed.
    pub(crate) fn protocol(&self) -> Option<MessageProtocol> {
        match self.protocol.load(Ordering::Acquire) {
            1 => Some(MessageProtocol::Binary),
            2 => Some(MessageProtocol::Text),
            _ => None,
        }
    }

    /// Does this client subscribe to `category`?
    pub(crate) fn subscribes(&self, category: MessageCategory) -> bool {
        self.subscription.load(Ordering::Acquire) & category.bit() != 0
    }

    /// Fan one message out to this client if its subscription and
    /// protocol match. Never blocks; a full queue tail-drops.
    pub(crate) fn send(&self, msg: &Arc<Message>) {
        if !self.running() {
            return;
        }
        let protocol = match self.protocol() {
            Some(p) => p,
            None => return,
        };
        if !self.subscribes(msg.category()) || msg.encoded(protocol).is_none() {
            return;
        }
        self.enqueue(msg);
    }

    /// Enqueue a BridgeInfo revision, at most once and in increasing
    /// validator order.
    pub(crate) fn send_bridge_info(&self, msg: &Arc<Message>, validator: u64) {
        if !self.running() {
            return;
        }
        let protocol = match self.protocol() {
            Some(p) => p,
            None => return,
        };
        if msg.encoded(protocol).is_none() {
            return;
        }
        let previous = self.bridge_validator.fetch_max(validator, Ordering::AcqRel);
        if previous >= validator {
            return;
        }
        log::debug!("[ptid {}] Sending BridgeInfo revision {}", self.id, validator);
        self.enqueue(msg);
    }

    fn enqueue(&self, msg: &Arc<Message>) {
        if let Err(mpsc::error::TrySendError::Full(_)) =
            self.tx.try_send(QueueItem::Deliver(Arc::clone(msg)))
        {
            log::warn!(
                "[ptid {}] Message queue full, dropping message {}",
                self.id,
                msg.id()
            );
        }
    }

    /// Stop the task: cancel, wake any blocked waiter with a sentinel and
    /// join.
    pub(crate) async fn stop(&self) {
        self.cancel.cancel();
        let _ = self.tx.try_send(QueueItem::Wake);
        let task = self.join.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

fn parse_subscription(bytes: &[u8]) -> crate::Result<(u8, MessageProtocol)> {
    let request: SubscribeRequest = serde_json::from_slice(bytes)
        .map_err(|_| crate::Error::Subscription("no subscription"))?;

    let mask = request.subscribe & SUBSCRIBABLE_CATEGORIES;
    if mask == 0 {
        return Err(crate::Error::Subscription("no subscription"));
    }

    let protocol = MessageProtocol::from_name(&request.protocol)
        .ok_or(crate::Error::Subscription("no such protocol"))?;

    Ok((mask, protocol))
}

fn status_message(app: &ApplicationData, success: bool, error: Option<&str>) -> Message {
    let mut data = json!({ "success": success });
    if let Some(error) = error {
        data["error"] = error.into();
    }
    Message::new(MessageType::Status, app.next_id(), timestamp_ms(), None, Some(data))
}

fn squad_status_message(app: &ApplicationData, protocol: MessageProtocol) -> Message {
    let container = app.squad.container();

    let serial = if protocol == MessageProtocol::Binary {
        Some(container.to_serial(0))
    } else {
        None
    };

    let text = if protocol == MessageProtocol::Text {
        let self_account = app.self_account();
        let mut data = container.to_text();
        data["self"] = if self_account.is_empty() {
            serde_json::Value::Null
        } else {
            self_account.into()
        };
        Some(data)
    } else {
        None
    };

    Message::new(MessageType::SquadStatus, app.next_id(), timestamp_ms(), serial, text)
}

async fn run_client(
    thread: Arc<PipeThread>,
    mut stream: PipeStream,
    mut rx: mpsc::Receiver<QueueItem>,
    app: Arc<ApplicationData>,
    tracking: Arc<MessageTracking>,
) {
    let ptid = thread.id;
    log::info!("[ptid {}] Client task started", ptid);

    let disconnected = match handshake(&thread, &mut stream, &app, &tracking).await {
        Ok(()) => client_loop(&thread, &mut stream, &mut rx, &app).await,
        Err(HandshakeError::Rejected) => false,
        Err(HandshakeError::Transport) => true,
    };

    if !disconnected && thread.protocol().is_some() {
        // Peer is still there; say goodbye before dropping the pipe.
        let protocols = ProtocolMask::from_bits(thread.protocol.load(Ordering::Acquire));
        let closing = Message::header_only(
            MessageType::Closing,
            app.next_id(),
            timestamp_ms(),
            protocols,
        );
        if let Some(protocol) = thread.protocol() {
            if let Some(bytes) = closing.encoded(protocol) {
                let _ = stream.write_message(bytes).await;
            }
        }
    }

    // Decrement whatever the handshake committed, exactly once.
    let mask = thread.subscription.swap(0, Ordering::AcqRel);
    for category in [
        MessageCategory::Combat,
        MessageCategory::Extras,
        MessageCategory::Squad,
    ] {
        if mask & category.bit() != 0 {
            tracking.untrack_category(category);
        }
    }
    if let Some(protocol) = thread.protocol() {
        tracking.unuse_protocol(protocol);
    }

    thread.running.store(false, Ordering::Release);
    log::info!("[ptid {}] Closed client connection", ptid);
}

enum HandshakeError {
    /// The client sent an unusable request and was told so.
    Rejected,
    /// The pipe died underneath the handshake.
    Transport,
}

async fn handshake(
    thread: &PipeThread,
    stream: &mut PipeStream,
    app: &ApplicationData,
    tracking: &MessageTracking,
) -> Result<(), HandshakeError> {
    let ptid = thread.id;

    log::debug!("[ptid {}] Waiting for client to subscribe...", ptid);
    let request = tokio::select! {
        _ = thread.cancel.cancelled() => return Err(HandshakeError::Transport),
        request = stream.read_message() => request.map_err(|e| {
            log::error!("[ptid {}] Failed to read subscription: {}", ptid, e);
            HandshakeError::Transport
        })?,
    };

    let (mask, protocol) = match parse_subscription(&request) {
        Ok(parsed) => parsed,
        Err(e) => {
            let reason = match &e {
                crate::Error::Subscription(reason) => *reason,
                _ => "no subscription",
            };
            log::error!("[ptid {}] {}, ending client task", ptid, e);
            let reject = status_message(app, false, Some(reason));
            let _ = stream.write_message(reject.text().unwrap().as_bytes()).await;
            return Err(HandshakeError::Rejected);
        }
    };

    // Commit the subscription before publishing success, so producers
    // never skip work this client needs.
    for category in [
        MessageCategory::Combat,
        MessageCategory::Extras,
        MessageCategory::Squad,
    ] {
        if mask & category.bit() != 0 {
            log::info!("[ptid {}] Subscribed to \"{}\"", ptid, category.as_str());
            tracking.track_category(category);
        }
    }
    tracking.use_protocol(protocol);
    thread.subscription.store(mask, Ordering::Release);
    thread.protocol.store(protocol as u8, Ordering::Release);
    log::info!("[ptid {}] Using protocol \"{}\"", ptid, protocol.as_str());

    let accepted = status_message(app, true, None);
    stream
        .write_message(accepted.text().unwrap().as_bytes())
        .await
        .map_err(|e| {
            log::error!("[ptid {}] Failed to send status: {}", ptid, e);
            HandshakeError::Transport
        })?;

    if mask & MessageCategory::Squad.bit() != 0 {
        let snapshot = squad_status_message(app, protocol);
        let bytes = snapshot.encoded(protocol).expect("snapshot built for this protocol");
        stream.write_message(bytes).await.map_err(|e| {
            log::error!("[ptid {}] Failed to send squad snapshot: {}", ptid, e);
            HandshakeError::Transport
        })?;
    }

    Ok(())
}

/// Steady-state send loop. Returns true when the client disconnected.
async fn client_loop(
    thread: &PipeThread,
    stream: &mut PipeStream,
    rx: &mut mpsc::Receiver<QueueItem>,
    app: &ApplicationData,
) -> bool {
    let ptid = thread.id;
    let protocol = thread.protocol().expect("handshake committed a protocol");
    let timeout = app.config.client_timeout;
    let mut write_failures = 0u32;

    loop {
        let item = tokio::select! {
            _ = thread.cancel.cancelled() => return false,
            item = rx.recv() => item,
            _ = sleep(timeout) => {
                log::debug!("[ptid {}] Checking pipe status...", ptid);
                match stream.probe() {
                    Probe::Alive => continue,
                    Probe::Disconnected => {
                        log::error!("[ptid {}] Client unexpectedly disconnected", ptid);
                        return true;
                    }
                }
            }
        };

        let msg = match item {
            Some(QueueItem::Deliver(msg)) => msg,
            // Sentinel: only wakes the waiter.
            Some(QueueItem::Wake) => continue,
            None => return false,
        };

        let bytes = match msg.encoded(protocol) {
            Some(bytes) => bytes,
            None => continue,
        };

        match stream.write_message(bytes).await {
            Ok(()) => write_failures = 0,
            Err(e) if is_disconnect(&e) => {
                log::error!("[ptid {}] Client unexpectedly disconnected", ptid);
                return true;
            }
            Err(e) => {
                write_failures += 1;
                log::error!("[ptid {}] Error sending message: {}", ptid, e);
                if write_failures > 1 {
                    return true;
                }
            }
        }
    }
}
