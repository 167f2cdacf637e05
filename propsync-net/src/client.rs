//! Connection Manager.
//!
//! A [`Connection`] bundles the three resources one bus membership needs: a
//! publisher socket with its sender thread, the receive loop, and (when this
//! instance hosts the bus) the relay. They are torn down together.

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{debug, error, info, trace, warn};

use propsync_types::{Command, MainThreadScheduler, SyncValue};

use crate::addr::{
    is_loopback, is_port_available, resolve, DEFAULT_ADDRESS, DEFAULT_PUBLISH_PORT,
    DEFAULT_SUBSCRIBE_PORT,
};
use crate::error::{Result, SyncError};
use crate::framing::{write_multipart, Multipart};
use crate::protocol::{encode_message, publish_path_message, InboundMessage};
use crate::receiver::{ReceiveLoop, ReceiverState};
use crate::relay::Relay;

/// Channel capacity for the publish queue.
const SEND_QUEUE_CAPACITY: usize = 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Kept short so a dead relay does not back up the publish queue.
const RECONNECT_TIMEOUT: Duration = Duration::from_millis(200);

/// Minimum spacing between reconnect attempts while the relay is down.
const REPUBLISH_INTERVAL: Duration = Duration::from_millis(100);

/// Parameters of one connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub address: String,
    /// Port this instance publishes to (the relay's receive side).
    pub publish_port: u16,
    /// Port this instance subscribes on (the relay's send side).
    pub subscribe_port: u16,
    /// Host the relay when connecting to a loopback address with no relay running.
    pub launch_relay: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            publish_port: DEFAULT_PUBLISH_PORT,
            subscribe_port: DEFAULT_SUBSCRIBE_PORT,
            launch_relay: false,
        }
    }
}

impl ConnectOptions {
    pub fn new(address: impl Into<String>, publish_port: u16, subscribe_port: u16) -> Self {
        Self {
            address: address.into(),
            publish_port,
            subscribe_port,
            launch_relay: false,
        }
    }

    pub fn launch_relay(mut self, launch: bool) -> Self {
        self.launch_relay = launch;
        self
    }
}

/// Snapshot of the connection for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub address: String,
    pub publish_port: u16,
    pub subscribe_port: u16,
    pub is_connected: bool,
    pub is_host: bool,
}

impl ConnectionStatus {
    pub fn disconnected() -> Self {
        Self {
            address: String::new(),
            publish_port: 0,
            subscribe_port: 0,
            is_connected: false,
            is_host: false,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_connected {
            return write!(f, "Disconnected");
        }
        write!(
            f,
            "Connected to {} (ports {} send, {} recv)",
            self.address, self.publish_port, self.subscribe_port
        )?;
        if self.is_host {
            write!(f, ", hosting relay")?;
        }
        Ok(())
    }
}

/// Outbound socket plus the thread that writes to it.
///
/// Callers only ever push into a bounded channel, so publishing never blocks
/// the mutation thread on network I/O.
struct Publisher {
    tx: Option<Sender<Multipart>>,
    handle: Option<JoinHandle<()>>,
}

impl Publisher {
    fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = open_publish_stream(addr, CONNECT_TIMEOUT)?;

        let (tx, rx) = crossbeam_channel::bounded::<Multipart>(SEND_QUEUE_CAPACITY);
        let worker = PublishWorker {
            addr,
            stream: Some(stream),
            last_attempt: None,
        };
        let handle = thread::Builder::new()
            .name("propsync-publisher".into())
            .spawn(move || worker.run(rx))?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Returns `false` if the message was dropped.
    fn try_queue(&self, topic: &str, frames: Multipart) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(frames) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(target: "propsync::client", "publish queue full, dropping {}", topic);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(target: "propsync::client", "publisher gone, dropping {}", topic);
                false
            }
        }
    }

    /// Flush queued messages and join the sender thread.
    fn close(&mut self) {
        // Dropping the sender ends the loop once the queue is empty
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(target: "propsync::client", "publisher thread panicked");
            }
        }
    }
}

fn open_publish_stream(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    Ok(stream)
}

/// Writes queued messages, reconnecting after the relay went away.
///
/// A failed message is retried once on a fresh stream. While the relay stays
/// unreachable, reconnects are attempted at most once per `REPUBLISH_INTERVAL`
/// and messages in between are dropped.
struct PublishWorker {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    last_attempt: Option<Instant>,
}

impl PublishWorker {
    fn run(mut self, rx: Receiver<Multipart>) {
        while let Ok(frames) = rx.recv() {
            self.publish(&frames);
        }
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        debug!(target: "propsync::client", "publisher for {} exiting", self.addr);
    }

    fn publish(&mut self, frames: &Multipart) {
        if let Some(stream) = self.stream.as_mut() {
            match write_multipart(stream, frames) {
                Ok(()) => return,
                Err(e) => {
                    warn!(target: "propsync::client", "publish to {} failed: {}", self.addr, e);
                    self.stream = None;
                    self.last_attempt = None;
                }
            }
        }

        let Some(stream) = self.reconnect() else {
            debug!(target: "propsync::client", "relay {} unreachable, dropping message", self.addr);
            return;
        };
        if let Err(e) = write_multipart(stream, frames) {
            error!(target: "propsync::client", "publish to {} failed after reconnect: {}", self.addr, e);
            self.stream = None;
        }
    }

    fn reconnect(&mut self) -> Option<&mut TcpStream> {
        if self
            .last_attempt
            .is_some_and(|at| at.elapsed() < REPUBLISH_INTERVAL)
        {
            return None;
        }
        self.last_attempt = Some(Instant::now());

        match open_publish_stream(self.addr, RECONNECT_TIMEOUT) {
            Ok(stream) => {
                info!(target: "propsync::client", "republishing to {}", self.addr);
                self.last_attempt = None;
                Some(self.stream.insert(stream))
            }
            Err(e) => {
                debug!(target: "propsync::client", "reconnect to {} failed: {}", self.addr, e);
                None
            }
        }
    }
}

/// One live bus membership.
pub struct Connection {
    options: ConnectOptions,
    live: Arc<AtomicBool>,
    publisher: Publisher,
    receiver: ReceiveLoop,
    relay: Option<Relay>,
}

impl Connection {
    /// Join the bus described by `options`.
    ///
    /// On a loopback address with nothing listening on the publish port, a
    /// relay is launched if `options.launch_relay` is set; otherwise this fails
    /// with [`SyncError::RelayNotRunning`]. Inbound messages are pushed to
    /// `inbound_tx` and announced through `scheduler`.
    pub fn open(
        options: ConnectOptions,
        inbound_tx: Sender<InboundMessage>,
        scheduler: Arc<dyn MainThreadScheduler>,
    ) -> Result<Self> {
        let mut relay = None;
        if is_loopback(&options.address) && is_port_available(options.publish_port) {
            if !options.launch_relay {
                return Err(SyncError::RelayNotRunning {
                    address: options.address.clone(),
                    port: options.publish_port,
                });
            }
            relay = Some(Relay::launch(options.publish_port, options.subscribe_port)?);
            info!(
                target: "propsync::client",
                "hosting relay on ports {}/{}", options.publish_port, options.subscribe_port
            );
        }

        // A relay launched above is stopped by its Drop on any early return
        let live = Arc::new(AtomicBool::new(true));
        let mut receiver = ReceiveLoop::launch(
            &options.address,
            options.subscribe_port,
            Arc::clone(&live),
            inbound_tx,
            scheduler,
        )?;

        let publisher = match resolve(&options.address, options.publish_port).and_then(Publisher::connect) {
            Ok(publisher) => publisher,
            Err(source) => {
                live.store(false, Ordering::Release);
                receiver.join();
                return Err(SyncError::Connect {
                    address: options.address.clone(),
                    port: options.publish_port,
                    source,
                });
            }
        };

        info!(
            target: "propsync::client",
            "connected to {} (publish {}, subscribe {})",
            options.address, options.publish_port, options.subscribe_port
        );

        Ok(Self {
            options,
            live,
            publisher,
            receiver,
            relay,
        })
    }

    /// Queue `value` for publishing under `topic`. Failures are logged and the message dropped.
    pub fn send(&self, topic: &str, value: &SyncValue) -> bool {
        self.publish(topic, encode_message(topic, value))
    }

    /// Announce `path` on the publish-path command topic.
    pub fn publish_path(&self, path: &str) -> bool {
        self.publish(Command::PublishPath.topic(), publish_path_message(path))
    }

    fn publish(&self, topic: &str, encoded: Result<Multipart>) -> bool {
        if !self.is_connected() {
            return false;
        }
        match encoded {
            Ok(frames) => {
                trace!(target: "propsync::client", "publishing {}", topic);
                self.publisher.try_queue(topic, frames)
            }
            Err(e) => {
                warn!(target: "propsync::client", "cannot encode {}: {}", topic, e);
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_host(&self) -> bool {
        self.relay.as_ref().is_some_and(Relay::is_running)
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// The relay this instance hosts, if any.
    pub fn relay(&self) -> Option<&Relay> {
        self.relay.as_ref()
    }

    pub fn receiver_state(&self) -> ReceiverState {
        self.receiver.state()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            address: self.options.address.clone(),
            publish_port: self.options.publish_port,
            subscribe_port: self.options.subscribe_port,
            is_connected: self.is_connected(),
            is_host: self.is_host(),
        }
    }

    /// Leave the bus. Returns once every thread of this connection has exited.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.publisher.close();
        let was_live = self.live.swap(false, Ordering::AcqRel);
        self.receiver.join();
        if let Some(mut relay) = self.relay.take() {
            relay.stop();
        }
        if was_live {
            info!(target: "propsync::client", "disconnected from {}", self.options.address);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}
