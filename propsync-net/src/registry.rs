//! Receive-side registries: path bindings and pending poll requests.
//!
//! Both are owned by the session and only touched on the mutation thread.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use log::warn;

use propsync_types::{normalize_path, Channel, PropertyHost, SyncValue};

use crate::error::SyncError;

/// `(object, property) -> path` bindings. Several bindings may share a path.
#[derive(Debug, Clone)]
pub struct ReceiveRegistry<O> {
    bindings: HashMap<(O, String), String>,
}

impl<O> Default for ReceiveRegistry<O> {
    fn default() -> Self {
        Self {
            bindings: HashMap::new(),
        }
    }
}

impl<O: Clone + Eq + Hash + Debug> ReceiveRegistry<O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `object.property` to `path`, returning the path it was bound to before.
    pub fn register(&mut self, object: O, property: &str, path: &str) -> Option<String> {
        self.bindings
            .insert((object, property.to_string()), normalize_path(path))
    }

    pub fn unregister(&mut self, object: &O, property: &str) -> Option<String> {
        self.bindings.remove(&(object.clone(), property.to_string()))
    }

    pub fn path_for(&self, object: &O, property: &str) -> Option<&str> {
        self.bindings
            .get(&(object.clone(), property.to_string()))
            .map(String::as_str)
    }

    /// Every `(object, property)` bound to `path`.
    pub fn targets<'a>(&'a self, path: &'a str) -> impl Iterator<Item = (&'a O, &'a str)> + 'a {
        self.bindings
            .iter()
            .filter(move |(_, bound)| bound.as_str() == path)
            .map(|((object, property), _)| (object, property.as_str()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&O, &str, &str)> {
        self.bindings
            .iter()
            .map(|((object, property), path)| (object, property.as_str(), path.as_str()))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Write `value` to every target bound to `path`.
    ///
    /// Targets the host rejects are unbound. Returns how many were written.
    pub fn apply<H>(&mut self, path: &str, host: &mut H, value: &SyncValue) -> usize
    where
        H: PropertyHost<Object = O> + ?Sized,
    {
        let mut applied = 0;
        let mut stale = Vec::new();

        for ((object, property), bound) in &self.bindings {
            if bound != path {
                continue;
            }
            match Channel::parse(property).apply(host, object, value) {
                Ok(()) => applied += 1,
                Err(source) => {
                    let err = SyncError::Apply {
                        path: path.to_string(),
                        source,
                    };
                    warn!(target: "propsync::receiver", "{}; unbinding {:?}.{}", err, object, property);
                    stale.push((object.clone(), property.clone()));
                }
            }
        }

        for key in stale {
            self.bindings.remove(&key);
        }
        applied
    }
}

/// Objects waiting to learn their path from a publish-path broadcast.
///
/// The flag is `recv_only`: when set, only the receive path is assigned.
#[derive(Debug, Clone)]
pub struct PollRequests<O> {
    requests: HashMap<O, bool>,
}

impl<O> Default for PollRequests<O> {
    fn default() -> Self {
        Self {
            requests: HashMap::new(),
        }
    }
}

impl<O: Eq + Hash> PollRequests<O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, object: O, recv_only: bool) -> Option<bool> {
        self.requests.insert(object, recv_only)
    }

    pub fn unregister(&mut self, object: &O) -> bool {
        self.requests.remove(object).is_some()
    }

    pub fn contains(&self, object: &O) -> bool {
        self.requests.contains_key(object)
    }

    pub fn is_recv_only(&self, object: &O) -> Option<bool> {
        self.requests.get(object).copied()
    }

    /// Remove and return every pending request.
    pub fn drain(&mut self) -> Vec<(O, bool)> {
        self.requests.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_fan_in_on_one_path() {
        let mut registry = ReceiveRegistry::new();
        registry.register("lamp", "intensity", "/rig/level");
        registry.register("fog", "density", "rig/level");
        registry.register("cube", "location", "/rig/other");

        let mut targets: Vec<_> = registry.targets("/rig/level").collect();
        targets.sort();
        assert_eq!(targets, vec![(&"fog", "density"), (&"lamp", "intensity")]);
    }

    #[test]
    fn register_replaces_previous_path() {
        let mut registry = ReceiveRegistry::new();
        assert_eq!(registry.register(1u32, "scale", "/a"), None);
        assert_eq!(registry.register(1u32, "scale", "/b"), Some("/a".to_string()));
        assert_eq!(registry.path_for(&1, "scale"), Some("/b"));
        assert_eq!(registry.unregister(&1, "scale"), Some("/b".to_string()));
        assert!(registry.is_empty());
    }

    #[test]
    fn poll_requests_drain_empties() {
        let mut polls = PollRequests::new();
        polls.register("x", false);
        polls.register("y", true);
        assert_eq!(polls.is_recv_only(&"y"), Some(true));

        let mut drained = polls.drain();
        drained.sort();
        assert_eq!(drained, vec![("x", false), ("y", true)]);
        assert!(polls.is_empty());
    }

    #[test]
    fn unregister_poll() {
        let mut polls = PollRequests::new();
        polls.register(7u8, false);
        assert!(polls.unregister(&7));
        assert!(!polls.unregister(&7));
    }
}
