//! Outbound Change Detector.
//!
//! Runs once per tick on the mutation thread. Each registered send path is
//! read through its accessor and published only when the value changed since
//! the last tick.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use log::{debug, warn};

use propsync_types::{normalize_path, HostError, PropertyHost, SyncValue};

use crate::error::SyncError;

/// Reads one property of one host object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyAccessor<O> {
    pub object: O,
    pub property: String,
}

impl<O> PropertyAccessor<O> {
    pub fn new(object: O, property: impl Into<String>) -> Self {
        Self {
            object,
            property: property.into(),
        }
    }

    pub fn read<H>(&self, host: &H) -> Result<SyncValue, HostError>
    where
        H: PropertyHost<Object = O> + ?Sized,
    {
        host.get_property(&self.object, &self.property)
    }
}

#[derive(Debug, Clone)]
pub struct SendRegistration<O> {
    accessor: PropertyAccessor<O>,
    /// `None` until the first read, so the first tick always publishes.
    last_observed: Option<SyncValue>,
    publish_count: u64,
}

impl<O> SendRegistration<O> {
    fn new(accessor: PropertyAccessor<O>) -> Self {
        Self {
            accessor,
            last_observed: None,
            publish_count: 0,
        }
    }

    pub fn accessor(&self) -> &PropertyAccessor<O> {
        &self.accessor
    }

    pub fn last_observed(&self) -> Option<&SyncValue> {
        self.last_observed.as_ref()
    }

    pub fn publish_count(&self) -> u64 {
        self.publish_count
    }
}

/// Outcome of one poll tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub published: usize,
    pub removed: usize,
}

/// Send path to accessor registrations.
#[derive(Debug, Clone)]
pub struct SendRegistry<O> {
    entries: HashMap<String, SendRegistration<O>>,
}

impl<O> Default for SendRegistry<O> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<O: Clone + Eq + Hash + Debug> SendRegistry<O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `accessor` under `path`, replacing any previous registration.
    /// Returns the normalized path.
    pub fn enable(&mut self, path: &str, accessor: PropertyAccessor<O>) -> String {
        let path = normalize_path(path);
        self.entries
            .insert(path.clone(), SendRegistration::new(accessor));
        path
    }

    /// Remove `path` if present.
    pub fn disable(&mut self, path: &str) -> bool {
        self.entries.remove(&normalize_path(path)).is_some()
    }

    /// Move the registration at `old` to `new`.
    ///
    /// Fails without touching anything if `new` is taken or `old` is missing.
    pub fn update(&mut self, old: &str, new: &str) -> bool {
        let old = normalize_path(old);
        let new = normalize_path(new);
        if self.entries.contains_key(&new) {
            return false;
        }
        match self.entries.remove(&old) {
            Some(registration) => {
                self.entries.insert(new, registration);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(&normalize_path(path))
    }

    pub fn get(&self, path: &str) -> Option<&SendRegistration<O>> {
        self.entries.get(&normalize_path(path))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SendRegistration<O>)> {
        self.entries.iter().map(|(path, reg)| (path.as_str(), reg))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every observed value so the next tick publishes all paths.
    pub fn reset_observed(&mut self) {
        for registration in self.entries.values_mut() {
            registration.last_observed = None;
        }
    }

    /// Read every accessor and call `publish` for each changed value.
    ///
    /// Registrations whose accessor fails are removed after the pass.
    pub fn poll<H, F>(&mut self, host: &H, mut publish: F) -> PollReport
    where
        H: PropertyHost<Object = O> + ?Sized,
        F: FnMut(&str, &SyncValue),
    {
        let mut report = PollReport::default();
        let mut stale = Vec::new();

        for (path, registration) in self.entries.iter_mut() {
            let value = match registration.accessor.read(host) {
                Ok(value) => value.normalized(),
                Err(source) => {
                    let err = SyncError::StaleAccessor {
                        path: path.clone(),
                        source,
                    };
                    warn!(target: "propsync::poller", "{}", err);
                    stale.push(path.clone());
                    continue;
                }
            };

            let changed = registration
                .last_observed
                .as_ref()
                .map_or(true, |previous| !previous.same_as(&value));
            if changed {
                publish(path, &value);
                registration.publish_count += 1;
                registration.last_observed = Some(value);
                report.published += 1;
            }
        }

        for path in stale {
            self.entries.remove(&path);
            report.removed += 1;
        }

        if report.published > 0 || report.removed > 0 {
            debug!(
                target: "propsync::poller",
                "tick: {} published, {} removed", report.published, report.removed
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use propsync_types::TransformField;

    /// Objects are indices into a vector of optional values; `None` means deleted.
    #[derive(Default)]
    struct Values(Vec<Option<SyncValue>>);

    impl PropertyHost for Values {
        type Object = usize;

        fn get_property(&self, object: &usize, name: &str) -> Result<SyncValue, HostError> {
            self.0
                .get(*object)
                .cloned()
                .flatten()
                .ok_or_else(|| HostError::MissingObject(format!("{}.{}", object, name)))
        }

        fn set_property(&mut self, object: &usize, _: &str, value: &SyncValue) -> Result<(), HostError> {
            match self.0.get_mut(*object) {
                Some(slot) => {
                    *slot = Some(value.clone());
                    Ok(())
                }
                None => Err(HostError::MissingObject(object.to_string())),
            }
        }

        fn set_transform(&mut self, object: &usize, _: TransformField, value: &SyncValue) -> Result<(), HostError> {
            self.set_property(object, "", value)
        }

        fn known_paths(&self) -> Vec<String> {
            Vec::new()
        }

        fn create_placeholder(&mut self, _: &str) -> usize {
            self.0.push(None);
            self.0.len() - 1
        }

        fn is_placeholder(&self, _: &usize) -> bool {
            false
        }

        fn remove_all_placeholders(&mut self) {}

        fn assign_sync_paths(&mut self, _: &usize, _: &str, _: Option<&str>) -> Result<(), HostError> {
            Ok(())
        }
    }

    fn collect(registry: &mut SendRegistry<usize>, host: &Values) -> Vec<(String, SyncValue)> {
        let mut sent = Vec::new();
        registry.poll(host, |path, value| sent.push((path.to_string(), value.clone())));
        sent
    }

    #[test]
    fn first_tick_always_publishes() {
        let host = Values(vec![Some(SyncValue::Number(0.0))]);
        let mut registry = SendRegistry::new();
        registry.enable("obj/value", PropertyAccessor::new(0, "value"));

        let sent = collect(&mut registry, &host);
        assert_eq!(sent, vec![("/obj/value".to_string(), SyncValue::Number(0.0))]);
    }

    #[test]
    fn unchanged_value_is_not_republished() {
        let mut host = Values(vec![Some(SyncValue::from([1.0, 2.0, 3.0]))]);
        let mut registry = SendRegistry::new();
        registry.enable("/obj/location", PropertyAccessor::new(0, "location"));

        assert_eq!(collect(&mut registry, &host).len(), 1);
        assert!(collect(&mut registry, &host).is_empty());

        host.0[0] = Some(SyncValue::from([1.0, 2.0, 4.0]));
        assert_eq!(collect(&mut registry, &host).len(), 1);
        assert_eq!(registry.get("/obj/location").unwrap().publish_count(), 2);
    }

    #[test]
    fn matrix_is_published_flat() {
        let host = Values(vec![Some(SyncValue::Matrix(vec![vec![1.0, 0.0], vec![0.0, 1.0]]))]);
        let mut registry = SendRegistry::new();
        registry.enable("/cam/matrix", PropertyAccessor::new(0, "matrix"));

        let sent = collect(&mut registry, &host);
        assert_eq!(sent[0].1, SyncValue::Vector(vec![1.0, 0.0, 0.0, 1.0]));
    }

    #[test]
    fn stale_accessor_removed_after_tick() {
        let host = Values(vec![Some(SyncValue::Number(1.0)), None]);
        let mut registry = SendRegistry::new();
        registry.enable("/alive/x", PropertyAccessor::new(0, "x"));
        registry.enable("/gone/x", PropertyAccessor::new(1, "x"));

        let report = registry.poll(&host, |_, _| {});
        assert_eq!(report, PollReport { published: 1, removed: 1 });
        assert!(registry.contains("/alive/x"));
        assert!(!registry.contains("/gone/x"));
    }

    #[test]
    fn update_refuses_taken_path() {
        let mut registry = SendRegistry::new();
        registry.enable("/a", PropertyAccessor::new(0, "x"));
        registry.enable("/b", PropertyAccessor::new(1, "x"));

        assert!(!registry.update("/a", "/b"));
        assert_eq!(registry.get("/a").unwrap().accessor().object, 0);
        assert_eq!(registry.get("/b").unwrap().accessor().object, 1);

        assert!(registry.update("a", "c"));
        assert!(!registry.contains("/a"));
        assert_eq!(registry.get("/c").unwrap().accessor().object, 0);
    }

    #[test]
    fn update_of_missing_path_fails() {
        let mut registry: SendRegistry<usize> = SendRegistry::new();
        assert!(!registry.update("/nope", "/other"));
        assert!(registry.is_empty());
    }

    #[test]
    fn disable_is_idempotent() {
        let mut registry = SendRegistry::new();
        registry.enable("/a", PropertyAccessor::new(0, "x"));
        assert!(registry.disable("a"));
        assert!(!registry.disable("/a"));
    }

    #[test]
    fn reset_observed_republishes() {
        let host = Values(vec![Some(SyncValue::Integer(3))]);
        let mut registry = SendRegistry::new();
        registry.enable("/n", PropertyAccessor::new(0, "n"));

        collect(&mut registry, &host);
        registry.reset_observed();
        assert_eq!(collect(&mut registry, &host).len(), 1);
    }
}
