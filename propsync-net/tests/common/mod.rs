#![allow(dead_code)]
//! Test harness utilities for propsync-net integration tests.

use std::collections::{BTreeMap, HashMap};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use propsync_net::{ConnectOptions, SyncSession};
use propsync_types::{
    normalize_path, HostError, PropertyHost, SyncValue, TaskQueue, TransformField,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// One object in the mock scene.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MockObject {
    pub placeholder: bool,
    pub transform: HashMap<TransformField, SyncValue>,
    pub props: HashMap<String, SyncValue>,
    pub recv_path: Option<String>,
    pub send_path: Option<String>,
    pub polling: bool,
}

/// In-memory host keyed by object path.
#[derive(Debug, Default)]
pub struct MockHost {
    pub objects: BTreeMap<String, MockObject>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_object(&mut self, name: &str) -> String {
        self.objects.entry(name.to_string()).or_default();
        name.to_string()
    }

    pub fn set(&mut self, name: &str, property: &str, value: impl Into<SyncValue>) {
        let object = self.objects.entry(name.to_string()).or_default();
        let value = value.into();
        match TransformField::from_channel(property) {
            Some(field) => object.transform.insert(field, value),
            None => object.props.insert(property.to_string(), value),
        };
    }

    pub fn object(&self, name: &str) -> Option<&MockObject> {
        self.objects.get(name)
    }

    pub fn delete(&mut self, name: &str) {
        self.objects.remove(name);
    }

    pub fn mark_polling(&mut self, name: &str) {
        self.objects.entry(name.to_string()).or_default().polling = true;
    }

    fn existing_mut(&mut self, name: &str) -> Result<&mut MockObject, HostError> {
        self.objects
            .get_mut(name)
            .ok_or_else(|| HostError::MissingObject(name.to_string()))
    }
}

impl PropertyHost for MockHost {
    type Object = String;

    fn get_property(&self, object: &String, name: &str) -> Result<SyncValue, HostError> {
        let entry = self
            .objects
            .get(object)
            .ok_or_else(|| HostError::MissingObject(object.clone()))?;
        let value = match TransformField::from_channel(name) {
            Some(field) => entry.transform.get(&field),
            None => entry.props.get(name),
        };
        value.cloned().ok_or_else(|| HostError::MissingProperty {
            object: object.clone(),
            property: name.to_string(),
        })
    }

    fn set_property(&mut self, object: &String, name: &str, value: &SyncValue) -> Result<(), HostError> {
        let entry = self.existing_mut(object)?;
        entry.props.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn set_transform(
        &mut self,
        object: &String,
        field: TransformField,
        value: &SyncValue,
    ) -> Result<(), HostError> {
        if value.as_vector().is_none() {
            return Err(HostError::TypeMismatch {
                property: field.channel_name().to_string(),
                expected: "vector",
                got: value.kind(),
            });
        }
        let entry = self.existing_mut(object)?;
        entry.transform.insert(field, value.clone());
        Ok(())
    }

    fn known_paths(&self) -> Vec<String> {
        self.objects.keys().cloned().collect()
    }

    fn create_placeholder(&mut self, object_path: &str) -> String {
        let path = normalize_path(object_path);
        self.objects.entry(path.clone()).or_insert_with(|| MockObject {
            placeholder: true,
            ..MockObject::default()
        });
        path
    }

    fn is_placeholder(&self, object: &String) -> bool {
        self.objects.get(object).is_some_and(|o| o.placeholder)
    }

    fn remove_all_placeholders(&mut self) {
        self.objects.retain(|_, o| !o.placeholder);
    }

    fn assign_sync_paths(
        &mut self,
        object: &String,
        recv_path: &str,
        send_path: Option<&str>,
    ) -> Result<(), HostError> {
        let entry = self.existing_mut(object)?;
        entry.recv_path = Some(recv_path.to_string());
        if let Some(path) = send_path {
            entry.send_path = Some(path.to_string());
        }
        entry.polling = false;
        Ok(())
    }
}

/// A session together with its host and the task queue it schedules on.
pub struct Instance {
    pub queue: Arc<TaskQueue>,
    pub host: MockHost,
    pub session: SyncSession<MockHost>,
}

impl Instance {
    pub fn new() -> Self {
        let queue = Arc::new(TaskQueue::new());
        let session = SyncSession::new(queue.clone());
        Self {
            queue,
            host: MockHost::new(),
            session,
        }
    }

    /// Run every pending task, like one pass of the host's main loop.
    pub fn tick(&mut self) -> usize {
        let tasks = self.queue.drain();
        for task in &tasks {
            self.session.run_task(*task, &mut self.host);
        }
        tasks.len()
    }

    /// Keep ticking until `cond` holds for this instance or the timeout expires.
    pub fn tick_until(&mut self, what: &str, mut cond: impl FnMut(&Self) -> bool) {
        let start = Instant::now();
        while start.elapsed() < TIMEOUT {
            self.tick();
            if cond(self) {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("Timed out waiting for {}", what);
    }
}

/// Reserve a port the OS considers free right now.
pub fn free_port() -> u16 {
    free_ports::<1>()[0]
}

/// Reserve `N` distinct free ports.
pub fn free_ports<const N: usize>() -> [u16; N] {
    let listeners: Vec<TcpListener> = (0..N)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let mut ports = [0u16; N];
    for (slot, listener) in ports.iter_mut().zip(&listeners) {
        *slot = listener.local_addr().unwrap().port();
    }
    ports
}

pub fn loopback_options(publish_port: u16, subscribe_port: u16) -> ConnectOptions {
    ConnectOptions::new("127.0.0.1", publish_port, subscribe_port)
}

/// Poll `cond` until it holds, panicking after `TIMEOUT`.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < TIMEOUT {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("Timed out waiting for {}", what);
}

/// Host instance `a` plus client instance `b`, both subscribed to the relay.
pub fn connected_pair() -> (Instance, Instance) {
    let [publish_port, subscribe_port] = free_ports::<2>();

    let mut a = Instance::new();
    a.session
        .connect(loopback_options(publish_port, subscribe_port).launch_relay(true))
        .unwrap();

    let mut b = Instance::new();
    b.session
        .connect(loopback_options(publish_port, subscribe_port))
        .unwrap();

    let relay = a.session.connection().and_then(|c| c.relay()).unwrap();
    wait_until("both subscribers at the relay", || relay.subscriber_count() == 2);
    wait_until("both publishers at the relay", || relay.publisher_count() == 2);

    (a, b)
}
