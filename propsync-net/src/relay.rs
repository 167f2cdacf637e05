//! Transport relay: a stateless fan-in/fan-out forwarder.
//!
//! Publishers connect to the recv port and write multipart messages. Every
//! message is forwarded verbatim, in receipt order, to every connection on the
//! send port. The relay keeps no per-topic state and does not filter.
//!
//! Each subscriber is fed by its own writer thread through a bounded queue, so
//! one slow reader delays neither the others nor shutdown. When a queue is
//! full the message is dropped for that subscriber only. Messages with more
//! than [`MAX_FRAMES`] frames are skipped with a warning and the publisher
//! stays connected.
//!
//! [`MAX_FRAMES`]: crate::framing::MAX_FRAMES

use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::framing::{encode_multipart, is_timeout, Multipart, MultipartReader};

/// Bounds shutdown latency and the delay before new connections are accepted.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A subscriber that makes no write progress for this long is dropped.
const SUBSCRIBER_STALL_LIMIT: Duration = Duration::from_secs(1);

/// Messages waiting between publisher readers and the relay loop.
const RELAY_QUEUE_CAPACITY: usize = 1024;

/// Encoded messages waiting for one subscriber's writer.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Messages forwarded per loop pass before accepting connections again.
const FORWARD_BATCH: usize = 256;

/// A running relay. Dropping it stops the relay.
pub struct Relay {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    recv_addr: SocketAddr,
    send_addr: SocketAddr,
    publishers: Arc<AtomicUsize>,
    subscribers: Arc<AtomicUsize>,
}

impl Relay {
    /// Bind `recv_port` (publishers) and `send_port` (subscribers) on all
    /// interfaces and start forwarding.
    pub fn launch(recv_port: u16, send_port: u16) -> Result<Self> {
        Self::launch_on(IpAddr::V4(Ipv4Addr::UNSPECIFIED), recv_port, send_port)
    }

    /// Like [`Relay::launch`] with an explicit bind address. Port 0 picks a free port.
    pub fn launch_on(bind_ip: IpAddr, recv_port: u16, send_port: u16) -> Result<Self> {
        let recv_listener = bind_listener(bind_ip, recv_port)?;
        let send_listener = bind_listener(bind_ip, send_port)?;
        let recv_addr = local_addr(&recv_listener, recv_port)?;
        let send_addr = local_addr(&send_listener, send_port)?;

        let running = Arc::new(AtomicBool::new(true));
        let publishers = Arc::new(AtomicUsize::new(0));
        let subscribers = Arc::new(AtomicUsize::new(0));

        let relay_loop = RelayLoop {
            recv_listener,
            send_listener,
            running: Arc::clone(&running),
            publishers: Arc::clone(&publishers),
            subscriber_count: Arc::clone(&subscribers),
        };
        let handle = thread::Builder::new()
            .name("propsync-relay".into())
            .spawn(move || relay_loop.run())
            .map_err(|e| SyncError::Transport(format!("failed to spawn relay thread: {}", e)))?;

        info!(target: "propsync::relay", "relay listening: recv {} send {}", recv_addr, send_addr);

        Ok(Self {
            running,
            handle: Some(handle),
            recv_addr,
            send_addr,
            publishers,
            subscribers,
        })
    }

    /// Address publishers connect to.
    pub fn recv_addr(&self) -> SocketAddr {
        self.recv_addr
    }

    /// Address subscribers connect to.
    pub fn send_addr(&self) -> SocketAddr {
        self.send_addr
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn publisher_count(&self) -> usize {
        self.publishers.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Relaxed)
    }

    /// Stop forwarding and join the relay threads. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(target: "propsync::relay", "relay thread panicked");
            }
            info!(target: "propsync::relay", "relay on {} stopped", self.recv_addr);
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_listener(ip: IpAddr, port: u16) -> Result<TcpListener> {
    let listener =
        TcpListener::bind((ip, port)).map_err(|source| SyncError::RelayBind { port, source })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| SyncError::RelayBind { port, source })?;
    Ok(listener)
}

fn local_addr(listener: &TcpListener, port: u16) -> Result<SocketAddr> {
    listener
        .local_addr()
        .map_err(|source| SyncError::RelayBind { port, source })
}

/// Relay-loop side of one subscriber: its queue and writer thread.
struct Subscriber {
    peer: SocketAddr,
    tx: Sender<Arc<Vec<u8>>>,
    handle: JoinHandle<()>,
    lagging: bool,
}

struct RelayLoop {
    recv_listener: TcpListener,
    send_listener: TcpListener,
    running: Arc<AtomicBool>,
    publishers: Arc<AtomicUsize>,
    subscriber_count: Arc<AtomicUsize>,
}

impl RelayLoop {
    fn run(self) {
        let (message_tx, message_rx) = crossbeam_channel::bounded::<Multipart>(RELAY_QUEUE_CAPACITY);
        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        let mut subscribers: Vec<Subscriber> = Vec::new();

        while self.running.load(Ordering::Acquire) {
            self.accept_publishers(&message_tx, &mut readers);
            self.accept_subscribers(&mut subscribers);

            match message_rx.recv_timeout(POLL_INTERVAL) {
                Ok(message) => {
                    self.forward(&mut subscribers, &message);
                    for message in message_rx.try_iter().take(FORWARD_BATCH) {
                        if !self.running.load(Ordering::Acquire) {
                            break;
                        }
                        self.forward(&mut subscribers, &message);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            readers.retain(|h| !h.is_finished());
            self.prune_subscribers(&mut subscribers);
        }

        drop(message_rx);
        for handle in readers {
            let _ = handle.join();
        }
        for sub in subscribers {
            drop(sub.tx);
            let _ = sub.handle.join();
        }
        self.subscriber_count.store(0, Ordering::Relaxed);
        debug!(target: "propsync::relay", "relay loop exiting");
    }

    fn accept_publishers(&self, message_tx: &Sender<Multipart>, readers: &mut Vec<JoinHandle<()>>) {
        loop {
            match self.recv_listener.accept() {
                Ok((stream, peer)) => {
                    let message_tx = message_tx.clone();
                    let running = Arc::clone(&self.running);
                    let publishers = Arc::clone(&self.publishers);
                    publishers.fetch_add(1, Ordering::Relaxed);

                    let spawned = thread::Builder::new()
                        .name(format!("propsync-relay-pub-{}", peer))
                        .spawn(move || {
                            publisher_reader(stream, peer, message_tx, running);
                            publishers.fetch_sub(1, Ordering::Relaxed);
                        });
                    match spawned {
                        Ok(handle) => {
                            readers.push(handle);
                            debug!(target: "propsync::relay", "publisher connected from {}", peer);
                        }
                        Err(e) => {
                            self.publishers.fetch_sub(1, Ordering::Relaxed);
                            error!(target: "propsync::relay", "failed to spawn reader for {}: {}", peer, e);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(target: "propsync::relay", "publisher accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn accept_subscribers(&self, subscribers: &mut Vec<Subscriber>) {
        loop {
            match self.send_listener.accept() {
                Ok((stream, peer)) => {
                    // Accepted sockets inherit non-blocking mode on some platforms.
                    let setup = stream
                        .set_nonblocking(false)
                        .and_then(|()| stream.set_write_timeout(Some(POLL_INTERVAL)))
                        .and_then(|()| stream.set_nodelay(true));
                    if let Err(e) = setup {
                        warn!(target: "propsync::relay", "rejecting subscriber {}: {}", peer, e);
                        continue;
                    }

                    let (tx, rx) = crossbeam_channel::bounded(SUBSCRIBER_QUEUE_CAPACITY);
                    let running = Arc::clone(&self.running);
                    let spawned = thread::Builder::new()
                        .name(format!("propsync-relay-sub-{}", peer))
                        .spawn(move || subscriber_writer(stream, peer, rx, running));
                    match spawned {
                        Ok(handle) => {
                            subscribers.push(Subscriber {
                                peer,
                                tx,
                                handle,
                                lagging: false,
                            });
                            self.subscriber_count.store(subscribers.len(), Ordering::Relaxed);
                            debug!(target: "propsync::relay", "subscriber connected from {}", peer);
                        }
                        Err(e) => {
                            error!(target: "propsync::relay", "failed to spawn writer for {}: {}", peer, e);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(target: "propsync::relay", "subscriber accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Queue `message` for every subscriber. Never blocks on the network.
    fn forward(&self, subscribers: &mut [Subscriber], message: &Multipart) {
        let bytes = match encode_multipart(message) {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                warn!(target: "propsync::relay", "dropping unencodable message: {}", e);
                return;
            }
        };

        for sub in subscribers.iter_mut() {
            match sub.tx.try_send(Arc::clone(&bytes)) {
                Ok(()) => sub.lagging = false,
                Err(TrySendError::Full(_)) => {
                    if !sub.lagging {
                        warn!(target: "propsync::relay", "subscriber {} is lagging, dropping messages", sub.peer);
                        sub.lagging = true;
                    }
                }
                // Writer already gone; pruned below.
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    fn prune_subscribers(&self, subscribers: &mut Vec<Subscriber>) {
        let before = subscribers.len();
        subscribers.retain(|sub| !sub.handle.is_finished());
        if subscribers.len() != before {
            self.subscriber_count.store(subscribers.len(), Ordering::Relaxed);
        }
    }
}

/// Per-subscriber thread: write queued messages until the queue closes, the
/// relay stops, or the subscriber stalls.
fn subscriber_writer(
    mut stream: TcpStream,
    peer: SocketAddr,
    rx: Receiver<Arc<Vec<u8>>>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        let bytes = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(bytes) => bytes,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if let Err(e) = write_with_stall_limit(&mut stream, &bytes, &running) {
            debug!(target: "propsync::relay", "dropping subscriber {}: {}", peer, e);
            break;
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// `write_all` that gives up once the relay stops or no byte has gone out for
/// `SUBSCRIBER_STALL_LIMIT`. The stream's write timeout sets how often the
/// flag is checked.
fn write_with_stall_limit(stream: &mut TcpStream, bytes: &[u8], running: &AtomicBool) -> io::Result<()> {
    let mut written = 0;
    let mut stalled_since: Option<Instant> = None;
    while written < bytes.len() {
        match stream.write(&bytes[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                written += n;
                stalled_since = None;
            }
            Err(e) if is_timeout(&e) => {
                if !running.load(Ordering::Acquire) {
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "relay stopping"));
                }
                let since = *stalled_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= SUBSCRIBER_STALL_LIMIT {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "subscriber stalled"));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Per-publisher thread: decode messages and hand them to the relay loop.
fn publisher_reader(
    stream: TcpStream,
    peer: SocketAddr,
    message_tx: Sender<Multipart>,
    running: Arc<AtomicBool>,
) {
    let setup = stream
        .set_nonblocking(false)
        .and_then(|()| stream.set_read_timeout(Some(POLL_INTERVAL)));
    if let Err(e) = setup {
        warn!(target: "propsync::relay", "dropping publisher {}: {}", peer, e);
        return;
    }

    let mut reader = MultipartReader::new(stream);
    let mut skipped = 0;
    let mut backlogged = false;
    while running.load(Ordering::Acquire) {
        let polled = reader.poll_message();
        if reader.skipped() != skipped {
            warn!(
                target: "propsync::relay",
                "publisher {} sent {} message(s) with too many frames, skipped",
                peer,
                reader.skipped() - skipped
            );
            skipped = reader.skipped();
        }

        match polled {
            Ok(Some(message)) => match message_tx.try_send(message) {
                Ok(()) => backlogged = false,
                Err(TrySendError::Full(_)) => {
                    if !backlogged {
                        warn!(target: "propsync::relay", "relay queue full, dropping messages from {}", peer);
                        backlogged = true;
                    }
                }
                // Relay loop gone
                Err(TrySendError::Disconnected(_)) => break,
            },
            Ok(None) => {}
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    warn!(target: "propsync::relay", "publisher {} read error: {}", peer, e);
                }
                break;
            }
        }
    }

    debug!(target: "propsync::relay", "publisher {} disconnected", peer);
}
