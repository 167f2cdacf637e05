//! # propsync-types
//!
//! Shared type definitions for propsync.
//! This crate holds the values carried over the wire, path handling, and the
//! capabilities the sync engine expects from the host application.

pub mod host;
pub mod path;
pub mod scheduler;
pub mod value;

pub use host::{Channel, HostError, PropertyHost, TransformField, TRANSFORM_CHANNELS};
pub use path::{normalize_path, ChannelPath, Command, Topic, DEFAULT_SEGMENT};
pub use scheduler::{MainThreadScheduler, MutationTask, TaskQueue};
pub use value::SyncValue;
