//! Sync session: the context object tying registries to one connection.
//!
//! A [`SyncSession`] lives on the host's mutation thread. Background threads
//! never see it; they only push into its inbound queue and arm tasks on the
//! scheduler, and the host answers by calling [`SyncSession::run_task`].

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info};

use propsync_types::{
    normalize_path, MainThreadScheduler, MutationTask, PropertyHost, SyncValue,
};

use crate::client::{ConnectOptions, Connection, ConnectionStatus};
use crate::error::Result;
use crate::poller::{PollReport, PropertyAccessor, SendRegistry};
use crate::protocol::InboundMessage;
use crate::receiver::dispatch_message;
use crate::registry::{PollRequests, ReceiveRegistry};

pub struct SyncSession<H: PropertyHost> {
    scheduler: Arc<dyn MainThreadScheduler>,
    connection: Option<Connection>,
    inbound_tx: Sender<InboundMessage>,
    inbound_rx: Receiver<InboundMessage>,
    sends: SendRegistry<H::Object>,
    bindings: ReceiveRegistry<H::Object>,
    polls: PollRequests<H::Object>,
}

impl<H: PropertyHost> SyncSession<H> {
    pub fn new(scheduler: Arc<dyn MainThreadScheduler>) -> Self {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        Self {
            scheduler,
            connection: None,
            inbound_tx,
            inbound_rx,
            sends: SendRegistry::new(),
            bindings: ReceiveRegistry::new(),
            polls: PollRequests::new(),
        }
    }

    // ── Connection ──────────────────────────────────────────────

    /// Join a bus, dropping any current connection first.
    pub fn connect(&mut self, options: ConnectOptions) -> Result<()> {
        self.disconnect();
        let connection = Connection::open(
            options,
            self.inbound_tx.clone(),
            Arc::clone(&self.scheduler),
        )?;
        self.connection = Some(connection);
        // New peers have never seen our values
        self.sends.reset_observed();
        Ok(())
    }

    /// Leave the bus. No-op when not connected.
    pub fn disconnect(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        connection.close();
        if !self.inbound_rx.is_empty() {
            self.scheduler.arm_if_not_armed(MutationTask::DispatchInbound);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(Connection::is_connected)
    }

    pub fn is_host(&self) -> bool {
        self.connection.as_ref().is_some_and(Connection::is_host)
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection
            .as_ref()
            .map_or_else(ConnectionStatus::disconnected, Connection::status)
    }

    /// Publish `value` under `path`. Returns `false` if nothing was queued.
    pub fn send(&self, path: &str, value: &SyncValue) -> bool {
        match &self.connection {
            Some(connection) => connection.send(&normalize_path(path), value),
            None => false,
        }
    }

    /// Announce `path` to every instance with a pending poll request.
    pub fn publish_path(&self, path: &str) -> bool {
        let Some(connection) = &self.connection else {
            return false;
        };
        let path = normalize_path(path);
        info!(target: "propsync::client", "announcing {}", path);
        connection.publish_path(&path)
    }

    // ── Send registrations ──────────────────────────────────────

    /// Start publishing `accessor` under `path`. Returns the normalized path.
    pub fn enable_sync(&mut self, path: &str, accessor: PropertyAccessor<H::Object>) -> String {
        let path = self.sends.enable(path, accessor);
        debug!(target: "propsync::poller", "sending {}", path);
        path
    }

    pub fn disable_sync(&mut self, path: &str) -> bool {
        self.sends.disable(path)
    }

    pub fn update_sync(&mut self, old_path: &str, new_path: &str) -> bool {
        self.sends.update(old_path, new_path)
    }

    // ── Receive registrations ───────────────────────────────────

    /// Apply values arriving on `path` to `object.property`.
    pub fn register_sync(&mut self, object: H::Object, property: &str, path: &str) {
        self.bindings.register(object, property, path);
    }

    pub fn unregister_sync(&mut self, object: &H::Object, property: &str) -> bool {
        self.bindings.unregister(object, property).is_some()
    }

    /// Wait for the next announced path and assign it to `object`.
    pub fn register_poll(&mut self, object: H::Object, recv_only: bool) {
        self.polls.register(object, recv_only);
    }

    pub fn unregister_poll(&mut self, object: &H::Object) -> bool {
        self.polls.unregister(object)
    }

    // ── Mutation-thread ticks ───────────────────────────────────

    /// Ask for a [`MutationTask::PollOutbound`] tick. Hosts call this from
    /// their change-notification hook.
    pub fn request_poll(&self) -> bool {
        self.scheduler.arm_if_not_armed(MutationTask::PollOutbound)
    }

    /// Publish every send path whose value changed since the last tick.
    ///
    /// Does nothing while disconnected; observed values are reset on connect.
    pub fn poll_outbound(&mut self, host: &H) -> PollReport {
        let Some(connection) = &self.connection else {
            return PollReport::default();
        };
        self.sends
            .poll(host, |path, value| {
                connection.send(path, value);
            })
    }

    /// Apply every queued inbound message. Returns how many were handled.
    pub fn dispatch_inbound(&mut self, host: &mut H) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.inbound_rx.try_recv() {
            dispatch_message(&message, host, &mut self.bindings, &mut self.polls);
            handled += 1;
        }
        handled
    }

    pub fn run_task(&mut self, task: MutationTask, host: &mut H) {
        match task {
            MutationTask::DispatchInbound => {
                self.dispatch_inbound(host);
            }
            MutationTask::PollOutbound => {
                self.poll_outbound(host);
            }
        }
    }

    /// Remove every placeholder object created for unknown remote paths.
    pub fn clear_placeholders(&mut self, host: &mut H) {
        host.remove_all_placeholders();
        info!(target: "propsync::receiver", "cleared placeholder objects");
    }

    // ── Views ───────────────────────────────────────────────────

    pub fn send_paths(&self) -> &SendRegistry<H::Object> {
        &self.sends
    }

    pub fn receive_bindings(&self) -> &ReceiveRegistry<H::Object> {
        &self.bindings
    }

    pub fn pending_polls(&self) -> &PollRequests<H::Object> {
        &self.polls
    }

    /// Messages received but not yet dispatched.
    pub fn pending_inbound(&self) -> usize {
        self.inbound_rx.len()
    }
}

impl<H: PropertyHost> Drop for SyncSession<H> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
