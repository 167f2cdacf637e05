//! Network layer for propsync live property sync.
//!
//! Instances exchange change notifications through a relay. One instance per
//! bus hosts the [`Relay`]; every instance, the host included, connects to it
//! with a publish socket and a subscribe socket. A [`SyncSession`] ties the
//! connection to the registries that decide what is sent and where received
//! values land.

pub mod addr;
pub mod client;
pub mod error;
pub mod framing;
pub mod poller;
pub mod protocol;
pub mod receiver;
pub mod registry;
pub mod relay;
pub mod session;

pub use addr::{local_ip, DEFAULT_ADDRESS, DEFAULT_PUBLISH_PORT, DEFAULT_SUBSCRIBE_PORT};
pub use client::{ConnectOptions, Connection, ConnectionStatus};
pub use error::{Result, SyncError};
pub use poller::{PollReport, PropertyAccessor, SendRegistry};
pub use protocol::InboundMessage;
pub use receiver::ReceiverState;
pub use registry::{PollRequests, ReceiveRegistry};
pub use relay::Relay;
pub use session::SyncSession;
