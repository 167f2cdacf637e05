//! Host application capability.
//!
//! The sync engine never owns scene data. It reads and writes it through a
//! [`PropertyHost`], always on the host's mutation thread.

use std::fmt::Debug;
use std::hash::Hash;

use thiserror::Error;

use crate::value::SyncValue;

/// Why the host refused a read or write.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HostError {
    #[error("object '{0}' does not exist")]
    MissingObject(String),
    #[error("object '{object}' has no property '{property}'")]
    MissingProperty { object: String, property: String },
    #[error("property '{property}' expects a {expected} value, got {got}")]
    TypeMismatch {
        property: String,
        expected: &'static str,
        got: &'static str,
    },
    #[error("{0}")]
    Other(String),
}

/// Transform fields that get dedicated host setters instead of generic attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformField {
    Location,
    Rotation,
    Scale,
}

/// Channel name to transform field lookup.
pub const TRANSFORM_CHANNELS: [(&str, TransformField); 3] = [
    ("location", TransformField::Location),
    ("rotation", TransformField::Rotation),
    ("scale", TransformField::Scale),
];

impl TransformField {
    pub fn from_channel(name: &str) -> Option<Self> {
        TRANSFORM_CHANNELS
            .iter()
            .find(|(channel, _)| *channel == name)
            .map(|&(_, field)| field)
    }

    pub fn channel_name(self) -> &'static str {
        TRANSFORM_CHANNELS
            .iter()
            .find(|(_, field)| *field == self)
            .map(|&(channel, _)| channel)
            .unwrap_or("default")
    }
}

/// Where an inbound channel value lands on a host object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    Transform(TransformField),
    Attribute(String),
}

impl Channel {
    pub fn parse(name: &str) -> Self {
        match TransformField::from_channel(name) {
            Some(field) => Channel::Transform(field),
            None => Channel::Attribute(name.to_string()),
        }
    }

    /// Write `value` to this channel of `object`.
    pub fn apply<H: PropertyHost + ?Sized>(
        &self,
        host: &mut H,
        object: &H::Object,
        value: &SyncValue,
    ) -> Result<(), HostError> {
        match self {
            Channel::Transform(field) => host.set_transform(object, *field, value),
            Channel::Attribute(name) => host.set_property(object, name, value),
        }
    }
}

/// Capabilities the host application provides to the sync engine.
///
/// All methods are called on the mutation thread only.
pub trait PropertyHost {
    /// Handle to a host object. Handles may outlive the object they point to;
    /// operations on such a handle must fail rather than panic.
    type Object: Clone + Eq + Hash + Debug;

    fn get_property(&self, object: &Self::Object, name: &str) -> Result<SyncValue, HostError>;

    fn set_property(
        &mut self,
        object: &Self::Object,
        name: &str,
        value: &SyncValue,
    ) -> Result<(), HostError>;

    fn set_transform(
        &mut self,
        object: &Self::Object,
        field: TransformField,
        value: &SyncValue,
    ) -> Result<(), HostError>;

    /// Paths the host currently knows about, for pickers and status displays.
    fn known_paths(&self) -> Vec<String>;

    /// Return the object for `object_path`, creating a flagged placeholder if
    /// none exists yet.
    fn create_placeholder(&mut self, object_path: &str) -> Self::Object;

    fn is_placeholder(&self, object: &Self::Object) -> bool;

    fn remove_all_placeholders(&mut self);

    /// Store resolved sync paths on `object` and clear its "poll" indicator.
    ///
    /// `send_path` is `None` for receive-only poll requests.
    fn assign_sync_paths(
        &mut self,
        object: &Self::Object,
        recv_path: &str,
        send_path: Option<&str>,
    ) -> Result<(), HostError>;
}
