//! Path handling.
//!
//! Property topics have the form `/<namespace>/<object>[/<channel>]`. Command
//! topics start with `>` instead of `/`.

use std::fmt;

/// First byte of every property path.
pub const PATH_SENTINEL: char = '/';

/// First byte of every command topic.
pub const COMMAND_SENTINEL: char = '>';

/// Substitute for empty object or channel segments.
pub const DEFAULT_SEGMENT: &str = "default";

/// Prepend `/` if missing. Idempotent.
pub fn normalize_path(path: &str) -> String {
    if path.starts_with(PATH_SENTINEL) {
        path.to_string()
    } else {
        format!("{}{}", PATH_SENTINEL, path)
    }
}

/// A property topic split into its object path and channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelPath {
    object: String,
    channel: String,
}

impl ChannelPath {
    /// Split a topic at its last `/`, filling empty segments with defaults.
    ///
    /// `/` becomes `/default/default`, `/location` becomes
    /// `/default/location` and `/scene/cube/` becomes `/scene/cube/default`.
    pub fn parse(topic: &str) -> Self {
        let topic = normalize_path(topic);
        let (object, channel) = topic.rsplit_once(PATH_SENTINEL).unwrap_or(("", topic.as_str()));

        let object = if object.is_empty() {
            format!("{}{}", PATH_SENTINEL, DEFAULT_SEGMENT)
        } else {
            object.to_string()
        };
        let channel = if channel.is_empty() {
            DEFAULT_SEGMENT.to_string()
        } else {
            channel.to_string()
        };

        Self { object, channel }
    }

    /// Object part, always starting with `/`.
    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl fmt::Display for ChannelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.object, PATH_SENTINEL, self.channel)
    }
}

/// Control messages carried on command topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Payload is a path; every instance with a pending poll adopts it.
    PublishPath,
}

impl Command {
    pub const fn topic(self) -> &'static str {
        match self {
            Command::PublishPath => ">PUB",
        }
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        match topic {
            ">PUB" => Some(Command::PublishPath),
            _ => None,
        }
    }
}

/// Classification of an inbound topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Property(ChannelPath),
    Command(Command),
    /// Starts with the command sentinel but names no known command.
    UnknownCommand(String),
    /// Neither a path nor a command.
    Foreign(String),
}

impl Topic {
    pub fn classify(topic: &str) -> Self {
        if topic.starts_with(PATH_SENTINEL) {
            Topic::Property(ChannelPath::parse(topic))
        } else if topic.starts_with(COMMAND_SENTINEL) {
            match Command::from_topic(topic) {
                Some(command) => Topic::Command(command),
                None => Topic::UnknownCommand(topic.to_string()),
            }
        } else {
            Topic::Foreign(topic.to_string())
        }
    }
}
