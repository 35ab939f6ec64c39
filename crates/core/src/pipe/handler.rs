//! The accept loop and message fan-out.
//!
//! One long-lived acceptor task creates a fresh pipe instance per
//! iteration and admits clients up to the configured fleet size. Fan-out
//! walks the live client handles under one lock and enqueues a shared
//! reference into every matching bounded queue; producers never block on
//! a slow client.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::ApplicationData;
use crate::info::{BridgeInfo, BRIDGE_VERSION, MAJOR_API_VERSION, MINOR_API_VERSION};
use crate::msg::{timestamp_ms, Message, MessageType, MESSAGE_TYPE_NAMES};
use crate::pipe::platform::{PipeListener, PipeStream};
use crate::pipe::thread::PipeThread;
use crate::pipe::tracking::MessageTracking;

/// The pipe server: acceptor, client fleet and fan-out dispatch.
pub struct PipeHandler {
    shared: Arc<Shared>,
}

struct Shared {
    addr: String,
    app: Arc<ApplicationData>,
    tracking: Arc<MessageTracking>,
    threads: Mutex<Vec<Arc<PipeThread>>>,
    run: AtomicBool,
    running: AtomicBool,
    started: AtomicBool,
    thread_counter: AtomicUsize,
    cancel: Mutex<CancellationToken>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl PipeHandler {
    /// Server for the endpoint `addr` over the given shared state.
    pub fn new(addr: impl Into<String>, app: Arc<ApplicationData>) -> PipeHandler {
        PipeHandler {
            shared: Arc::new(Shared {
                addr: addr.into(),
                app,
                tracking: Arc::new(MessageTracking::default()),
                threads: Mutex::new(Vec::new()),
                run: AtomicBool::new(false),
                running: AtomicBool::new(false),
                started: AtomicBool::new(false),
                thread_counter: AtomicUsize::new(1),
                cancel: Mutex::new(CancellationToken::new()),
                acceptor: Mutex::new(None),
            }),
        }
    }

    /// Subscription and protocol usage counters, for producers.
    pub fn tracking(&self) -> &MessageTracking {
        &self.shared.tracking
    }

    /// Number of live client connections.
    pub fn client_count(&self) -> usize {
        let threads = self.shared.threads.lock().unwrap();
        threads.iter().filter(|t| t.running()).count()
    }

    /// Spawn the acceptor. Must run inside a tokio runtime. A started
    /// handler has to be stopped before it can be started again.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.run.store(true, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);

        let cancel = CancellationToken::new();
        *self.shared.cancel.lock().unwrap() = cancel.clone();

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(accept_loop(shared, cancel));
        *self.shared.acceptor.lock().unwrap() = Some(task);
    }

    /// Orderly shutdown: stop accepting, wake the acceptor, stop and join
    /// every client task.
    pub async fn stop(&self) {
        if !self.shared.started.swap(false, Ordering::AcqRel) {
            return;
        }
        log::debug!("Closing pipe server");
        self.shared.run.store(false, Ordering::Release);
        self.shared.cancel.lock().unwrap().cancel();

        // A blocked acceptor only wakes on a connection; give it one.
        let _ = tokio::time::timeout(
            Duration::from_millis(250),
            PipeStream::connect(&self.shared.addr),
        )
        .await;

        let acceptor = self.shared.acceptor.lock().unwrap().take();
        if let Some(acceptor) = acceptor {
            let _ = acceptor.await;
        }

        let threads: Vec<Arc<PipeThread>> = {
            let mut threads = self.shared.threads.lock().unwrap();
            threads.drain(..).collect()
        };
        for thread in threads {
            thread.stop().await;
        }

        self.shared.running.store(false, Ordering::Release);
        log::info!("Pipe server stopped");
    }

    /// Fan one message out to every matching client.
    pub fn send_message(&self, msg: Message) {
        self.send_messages(std::iter::once(msg));
    }

    /// Deliver a batch atomically with respect to the handler lock (each
    /// client still interleaves its own writes independently).
    pub fn send_messages<I>(&self, msgs: I)
    where
        I: IntoIterator<Item = Message>,
    {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        let threads = self.shared.threads.lock().unwrap();
        for msg in msgs {
            let msg = Arc::new(msg);
            for thread in threads.iter() {
                thread.send(&msg);
            }
        }
    }

    /// Broadcast a BridgeInfo revision; each client receives it at most
    /// once, in increasing validator order.
    pub fn send_bridge_info(&self, msg: Message, validator: u64) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        let msg = Arc::new(msg);
        let threads = self.shared.threads.lock().unwrap();
        for thread in threads.iter() {
            thread.send_bridge_info(&msg, validator);
        }
    }
}

/// The `ConnectionStatus` handshake message (always text).
fn connection_status(
    app: &ApplicationData,
    info: &BridgeInfo,
    success: bool,
    error: Option<&str>,
) -> Message {
    let mut data = json!({
        "version": BRIDGE_VERSION,
        "majorApiVersion": MAJOR_API_VERSION,
        "minorApiVersion": MINOR_API_VERSION,
        "info": crate::msg::Encode::to_text(info),
        "success": success,
        "types": MESSAGE_TYPE_NAMES,
    });
    if let Some(error) = error {
        data["error"] = error.into();
    }
    Message::new(
        MessageType::ConnectionStatus,
        app.next_id(),
        timestamp_ms(),
        None,
        Some(data),
    )
}

async fn accept_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut listener = match PipeListener::bind(&shared.addr) {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Could not create pipe endpoint \"{}\": {}", shared.addr, e);
            shared.running.store(false, Ordering::Release);
            return;
        }
    };

    log::debug!("Started pipe acceptor");
    while shared.run.load(Ordering::Acquire) {
        let conn = tokio::select! {
            _ = cancel.cancelled() => break,
            conn = listener.accept() => conn,
        };

        let mut stream = match conn {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("Error accepting client: {}", e);
                continue;
            }
        };

        if !shared.run.load(Ordering::Acquire) {
            log::warn!("Client connected while the server is closing");
            break;
        }

        // Reap clients that already closed their connection.
        {
            let mut threads = shared.threads.lock().unwrap();
            threads.retain(|t| t.running());
        }

        let info = shared.app.info();
        let at_capacity = {
            let threads = shared.threads.lock().unwrap();
            threads.len() >= shared.app.config.max_clients
        };

        if at_capacity {
            log::error!(
                "Rejecting client: max amount of clients connected ({})",
                shared.app.config.max_clients
            );
            let reject = connection_status(
                &shared.app,
                &info,
                false,
                Some("max amount of clients connected"),
            );
            let _ = stream.write_message(reject.text().unwrap().as_bytes()).await;
            continue;
        }

        let id = shared.thread_counter.fetch_add(1, Ordering::AcqRel);
        log::info!("Client connected, starting client task [ptid {}]", id);

        let accepted = connection_status(&shared.app, &info, true, None);
        match stream.write_message(accepted.text().unwrap().as_bytes()).await {
            Ok(()) => {
                let thread = PipeThread::spawn(
                    id,
                    stream,
                    Arc::clone(&shared.app),
                    Arc::clone(&shared.tracking),
                    info.validator,
                    cancel.child_token(),
                );
                shared.threads.lock().unwrap().push(thread);
            }
            Err(e) => {
                log::error!("[ptid {}] Failed to send connection status: {}", id, e);
            }
        }
    }

    log::debug!("Ended pipe acceptor");
}
