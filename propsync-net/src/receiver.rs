//! Inbound dispatcher.
//!
//! The receive loop runs on its own network thread: it reads messages from
//! the relay, pushes them onto the inbound queue and arms a
//! [`MutationTask::DispatchInbound`] tick. The tick itself runs on the host's
//! mutation thread via [`dispatch_message`], which is the only place inbound
//! values touch host state.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{debug, error, info, trace, warn};

use propsync_types::{
    normalize_path, Channel, Command, MainThreadScheduler, MutationTask, PropertyHost, SyncValue,
    Topic,
};

use crate::addr::resolve;
use crate::error::{Result, SyncError};
use crate::framing::{Multipart, MultipartReader};
use crate::protocol::{decode_message, is_subscribed, InboundMessage};
use crate::registry::{PollRequests, ReceiveRegistry};

/// Bounds both message latency and shutdown latency of the receive loop.
pub const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

const SUBSCRIBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Kept short so a dead relay does not stall `disconnect`.
const RESUBSCRIBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Lifecycle of the receive loop within one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    /// No loop thread.
    Idle,
    /// Loop thread running, connection live.
    Listening,
    /// Connection torn down, loop thread not joined yet.
    Draining,
}

/// Handle to the receive loop thread.
pub struct ReceiveLoop {
    live: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReceiveLoop {
    /// Subscribe to `address:port` and start the loop thread.
    ///
    /// The loop runs while `live` is set.
    pub fn launch(
        address: &str,
        port: u16,
        live: Arc<AtomicBool>,
        inbound_tx: Sender<InboundMessage>,
        scheduler: Arc<dyn MainThreadScheduler>,
    ) -> Result<Self> {
        let connect_err = |source: io::Error| SyncError::Connect {
            address: address.to_string(),
            port,
            source,
        };
        let addr = resolve(address, port).map_err(connect_err)?;
        let stream = open_subscription(addr, SUBSCRIBE_CONNECT_TIMEOUT).map_err(connect_err)?;

        let worker = ReceiveWorker {
            addr,
            live: Arc::clone(&live),
            inbound_tx,
            scheduler,
        };
        let handle = thread::Builder::new()
            .name("propsync-receiver".into())
            .spawn(move || worker.run(stream))
            .map_err(|e| SyncError::Transport(format!("failed to spawn receiver thread: {}", e)))?;

        info!(target: "propsync::receiver", "subscribed to {}", addr);

        Ok(Self {
            live,
            handle: Some(handle),
        })
    }

    pub fn state(&self) -> ReceiverState {
        match &self.handle {
            None => ReceiverState::Idle,
            Some(_) if self.live.load(Ordering::Acquire) => ReceiverState::Listening,
            Some(_) => ReceiverState::Draining,
        }
    }

    /// Block until the loop thread exited. Callers clear the live flag first.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(target: "propsync::receiver", "receiver thread panicked");
            }
        }
    }
}

fn open_subscription(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(RECEIVE_POLL_INTERVAL))?;
    Ok(stream)
}

struct ReceiveWorker {
    addr: SocketAddr,
    live: Arc<AtomicBool>,
    inbound_tx: Sender<InboundMessage>,
    scheduler: Arc<dyn MainThreadScheduler>,
}

impl ReceiveWorker {
    fn run(self, stream: TcpStream) {
        let mut reader = Some(MultipartReader::new(stream));

        while self.live.load(Ordering::Acquire) {
            let Some(current) = reader.as_mut() else {
                thread::sleep(RECEIVE_POLL_INTERVAL);
                reader = self.resubscribe();
                continue;
            };

            match current.poll_message() {
                Ok(Some(frames)) => self.handle_frames(frames),
                Ok(None) => {}
                Err(e) => {
                    warn!(target: "propsync::receiver", "subscription to {} lost: {}", self.addr, e);
                    reader = None;
                }
            }
        }

        debug!(target: "propsync::receiver", "receive loop for {} exiting", self.addr);
    }

    fn resubscribe(&self) -> Option<MultipartReader<TcpStream>> {
        match open_subscription(self.addr, RESUBSCRIBE_TIMEOUT) {
            Ok(stream) => {
                info!(target: "propsync::receiver", "resubscribed to {}", self.addr);
                Some(MultipartReader::new(stream))
            }
            Err(e) => {
                debug!(target: "propsync::receiver", "resubscribe to {} failed: {}", self.addr, e);
                None
            }
        }
    }

    fn handle_frames(&self, frames: Multipart) {
        if !frames.first().is_some_and(|topic| is_subscribed(topic)) {
            trace!(target: "propsync::receiver", "ignoring unsubscribed message");
            return;
        }

        match decode_message(frames) {
            Ok(message) => {
                trace!(target: "propsync::receiver", "received {}", message.topic);
                if self.inbound_tx.send(message).is_err() {
                    // Session dropped
                    return;
                }
                self.scheduler.arm_if_not_armed(MutationTask::DispatchInbound);
            }
            Err(e) => warn!(target: "propsync::receiver", "cannot read received data: {}", e),
        }
    }
}

/// Apply one inbound message to host state. Mutation thread only.
pub fn dispatch_message<H: PropertyHost>(
    message: &InboundMessage,
    host: &mut H,
    bindings: &mut ReceiveRegistry<H::Object>,
    polls: &mut PollRequests<H::Object>,
) {
    match Topic::classify(&message.topic) {
        Topic::Property(path) => {
            let object = host.create_placeholder(path.object());
            let channel = Channel::parse(path.channel());
            if let Err(source) = channel.apply(host, &object, &message.payload) {
                let err = SyncError::Apply {
                    path: path.to_string(),
                    source,
                };
                warn!(target: "propsync::receiver", "{}", err);
            }
            bindings.apply(&message.topic, host, &message.payload);
        }
        Topic::Command(Command::PublishPath) => resolve_polls(&message.payload, host, polls),
        Topic::UnknownCommand(name) => {
            warn!(target: "propsync::receiver", "ignoring unknown command {}", name);
        }
        Topic::Foreign(topic) => {
            trace!(target: "propsync::receiver", "ignoring topic {}", topic);
        }
    }
}

/// Hand an announced path to every object waiting on a poll request.
fn resolve_polls<H: PropertyHost>(
    payload: &SyncValue,
    host: &mut H,
    polls: &mut PollRequests<H::Object>,
) {
    let Some(path) = payload.as_text() else {
        warn!(
            target: "propsync::receiver",
            "publish-path payload is a {}, expected text",
            payload.kind()
        );
        return;
    };
    let path = normalize_path(path);

    let waiting = polls.drain();
    for (object, recv_only) in &waiting {
        let send_path = if *recv_only { None } else { Some(path.as_str()) };
        if let Err(e) = host.assign_sync_paths(object, &path, send_path) {
            warn!(target: "propsync::receiver", "cannot assign {} to {:?}: {}", path, object, e);
        }
    }
    if !waiting.is_empty() {
        info!(target: "propsync::receiver", "resolved {} poll request(s) to {}", waiting.len(), path);
    }

    host.create_placeholder(&path);
}
