//! Connection registry.
//!
//! The table of live connections is owned by one task and only ever touched
//! through [`RegistryHandle`] messages, so no lock guards it. Connection
//! tasks report their state changes; the shutdown path asks the registry to
//! drain and waits for it to empty.
//!
//! ```text
//! accept loop ── add ──────────┐
//! connection ─── mark/remove ──┼─► ConnectionRegistry::run ── close ─► connection
//! coordinator ── drain ────────┘                          └── drained ─► coordinator
//! ```

use async_channel::{Receiver, Sender};
use async_executor::{Executor, Task};
use bevy_log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

/// Point of a single connection in its protocol lifecycle, as reported by the
/// transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    /// Accepted, no request read yet
    New,
    /// A request is being served
    Active,
    /// Waiting for the next request
    Idle,
    /// Connection is closed
    Closed,
    /// Connection was taken over by a protocol upgrade
    Hijacked,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Hijacked)
    }
}

/// Registry key of an accepted connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What the registry keeps about a connection: where it came from and how to
/// ask its task to close it.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    closer: Sender<()>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, peer: SocketAddr, closer: Sender<()>) -> Self {
        Self { id, peer, closer }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn close(&self) {
        // A full channel means a close request is already pending.
        let _ = self.closer.try_send(());
    }
}

/// Point-in-time view of the registry, used for status reporting and for
/// checking the registry invariants in tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub live: usize,
    pub new: usize,
    pub active: usize,
    pub idle: usize,
    pub total_added: u64,
    pub total_removed: u64,
    /// Removals caused by a protocol upgrade taking the connection over.
    pub hijacked: u64,
    pub duplicate_adds: u64,
    pub unknown_removes: u64,
    pub draining: bool,
}

impl RegistrySnapshot {
    /// No connection was added twice and none was removed without being added.
    pub fn is_consistent(&self) -> bool {
        self.duplicate_adds == 0 && self.unknown_removes == 0
    }
}

pub(crate) enum Command {
    Add(ConnectionHandle),
    Mark(ConnectionId, ConnectionState),
    Remove(ConnectionId, ConnectionState),
    Drain(Sender<()>),
    Snapshot(Sender<RegistrySnapshot>),
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Flow {
    Continue,
    Drained,
}

struct Entry {
    handle: ConnectionHandle,
    state: ConnectionState,
    closing: bool,
}

impl Entry {
    fn request_close(&mut self) {
        if !self.closing {
            self.closing = true;
            self.handle.close();
        }
    }
}

#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Entry>,
    drained: Option<Sender<()>>,
    total_added: u64,
    total_removed: u64,
    hijacked: u64,
    duplicate_adds: u64,
    unknown_removes: u64,
}

impl ConnectionRegistry {
    /// Spawn the owner task on `executor` and return the handle used to talk to it.
    pub fn spawn(executor: &Executor<'static>) -> (RegistryHandle, Task<RegistrySnapshot>) {
        let (tx, rx) = async_channel::unbounded();
        let task = executor.spawn(Self::default().run(rx));
        (RegistryHandle { tx }, task)
    }

    /// Process commands until a drain completes or every handle is dropped.
    /// Returns the final snapshot.
    pub async fn run(mut self, commands: Receiver<Command>) -> RegistrySnapshot {
        while let Ok(command) = commands.recv().await {
            if self.apply(command) == Flow::Drained {
                break;
            }
        }
        debug!("Connection registry finished: {:?}", self.snapshot());
        self.snapshot()
    }

    pub fn apply(&mut self, command: Command) -> Flow {
        match command {
            Command::Add(handle) => self.add(handle),
            Command::Mark(id, state) => self.mark(id, state),
            Command::Remove(id, state) => self.remove(id, state),
            Command::Drain(done) => self.begin_drain(done),
            Command::Snapshot(reply) => {
                let _ = reply.try_send(self.snapshot());
            }
        }
        self.check_drained()
    }

    fn add(&mut self, handle: ConnectionHandle) {
        let id = handle.id();
        if self.connections.contains_key(&id) {
            self.duplicate_adds += 1;
            warn!("Connection {} registered twice, ignoring", id);
            return;
        }

        debug!("Connection {} from {} is new", id, handle.peer);
        self.total_added += 1;
        self.connections.insert(
            id,
            Entry {
                handle,
                state: ConnectionState::New,
                closing: false,
            },
        );
    }

    fn mark(&mut self, id: ConnectionId, state: ConnectionState) {
        let draining = self.is_draining();
        let Some(entry) = self.connections.get_mut(&id) else {
            // Multiplexed streams can report after their connection is gone.
            debug!("Ignoring {:?} for unknown connection {}", state, id);
            return;
        };

        entry.state = state;
        if draining && state == ConnectionState::Idle {
            debug!("Connection {} became idle while draining, closing", id);
            entry.request_close();
        }
    }

    fn remove(&mut self, id: ConnectionId, state: ConnectionState) {
        match self.connections.remove(&id) {
            Some(entry) => {
                self.total_removed += 1;
                if state == ConnectionState::Hijacked {
                    self.hijacked += 1;
                }
                debug!(
                    "Connection {} from {} removed ({:?})",
                    id, entry.handle.peer, state
                );
            }
            None => {
                self.unknown_removes += 1;
                warn!("Connection {} removed but was never registered", id);
            }
        }
    }

    fn begin_drain(&mut self, done: Sender<()>) {
        let mut idle = 0;
        for entry in self.connections.values_mut() {
            if entry.state == ConnectionState::Idle {
                entry.request_close();
                idle += 1;
            }
        }

        info!(
            "Draining {} connections ({} idle closed immediately)",
            self.connections.len(),
            idle
        );
        self.drained = Some(done);
    }

    fn check_drained(&mut self) -> Flow {
        if !self.connections.is_empty() {
            return Flow::Continue;
        }
        match self.drained.take() {
            Some(done) => {
                let _ = done.try_send(());
                Flow::Drained
            }
            None => Flow::Continue,
        }
    }

    fn is_draining(&self) -> bool {
        self.drained.is_some()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let count = |state| {
            self.connections
                .values()
                .filter(|entry| entry.state == state)
                .count()
        };

        RegistrySnapshot {
            live: self.connections.len(),
            new: count(ConnectionState::New),
            active: count(ConnectionState::Active),
            idle: count(ConnectionState::Idle),
            total_added: self.total_added,
            total_removed: self.total_removed,
            hijacked: self.hijacked,
            duplicate_adds: self.duplicate_adds,
            unknown_removes: self.unknown_removes,
            draining: self.is_draining(),
        }
    }
}

/// Sending side of the registry. Cheap to clone; every connection task holds one.
#[derive(Clone, Debug)]
pub(crate) struct RegistryHandle {
    tx: Sender<Command>,
}

impl RegistryHandle {
    #[cfg(test)]
    pub fn from_sender(tx: Sender<Command>) -> Self {
        Self { tx }
    }

    pub fn add(&self, handle: ConnectionHandle) {
        self.send(Command::Add(handle));
    }

    pub fn mark(&self, id: ConnectionId, state: ConnectionState) {
        self.send(Command::Mark(id, state));
    }

    pub fn remove(&self, id: ConnectionId, state: ConnectionState) {
        self.send(Command::Remove(id, state));
    }

    /// Connection-state-change callback: routes a transport-reported state to
    /// the matching registry operation.
    pub fn notify(&self, id: ConnectionId, state: ConnectionState) {
        match state {
            state if state.is_terminal() => self.remove(id, state),
            ConnectionState::Active | ConnectionState::Idle => self.mark(id, state),
            _ => {
                warn!("Connection {} reported New without a handle", id);
            }
        }
    }

    /// Start draining and wait until no connection is left.
    pub async fn drain(&self) {
        let (done, drained) = async_channel::bounded(1);
        if self.tx.send(Command::Drain(done)).await.is_err() {
            return;
        }
        // The owner task only exits without replying once all handles are gone.
        let _ = drained.recv().await;
    }

    pub async fn snapshot(&self) -> Option<RegistrySnapshot> {
        let (reply, snapshot) = async_channel::bounded(1);
        self.tx.send(Command::Snapshot(reply)).await.ok()?;
        snapshot.recv().await.ok()
    }

    fn send(&self, command: Command) {
        if self.tx.try_send(command).is_err() {
            debug!("Connection registry is gone, dropping notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000)
    }

    fn handle(raw: u64) -> (ConnectionHandle, Receiver<()>) {
        let (closer, close_rx) = async_channel::bounded(1);
        (
            ConnectionHandle::new(ConnectionId::new(raw), peer(), closer),
            close_rx,
        )
    }

    #[test]
    fn test_registry_tracks_states() {
        let mut registry = ConnectionRegistry::default();
        let id = ConnectionId::new(1);
        let (conn, _close) = handle(1);

        registry.apply(Command::Add(conn));
        assert_eq!(registry.snapshot().new, 1);

        registry.apply(Command::Mark(id, ConnectionState::Active));
        assert_eq!(registry.snapshot().active, 1);

        registry.apply(Command::Mark(id, ConnectionState::Idle));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.idle, 1);
        assert_eq!(snapshot.live, 1);

        registry.apply(Command::Remove(id, ConnectionState::Closed));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.live, 0);
        assert_eq!(snapshot.total_added, 1);
        assert_eq!(snapshot.total_removed, 1);
        assert!(snapshot.is_consistent());
    }

    #[test]
    fn test_registry_rejects_duplicates_and_unknown_removes() {
        let mut registry = ConnectionRegistry::default();
        let (first, _a) = handle(7);
        let (again, _b) = handle(7);

        registry.apply(Command::Add(first));
        registry.apply(Command::Add(again));
        registry.apply(Command::Remove(ConnectionId::new(99), ConnectionState::Closed));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.live, 1);
        assert_eq!(snapshot.total_added, 1);
        assert_eq!(snapshot.duplicate_adds, 1);
        assert_eq!(snapshot.unknown_removes, 1);
        assert!(!snapshot.is_consistent());
    }

    #[test]
    fn test_mark_for_unknown_connection_is_ignored() {
        let mut registry = ConnectionRegistry::default();
        registry.apply(Command::Mark(ConnectionId::new(3), ConnectionState::Idle));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.live, 0);
        assert!(snapshot.is_consistent());
    }

    #[test]
    fn test_drain_empty_registry_completes_immediately() {
        let mut registry = ConnectionRegistry::default();
        let (done, drained) = async_channel::bounded(1);

        assert_eq!(registry.apply(Command::Drain(done)), Flow::Drained);
        assert!(drained.try_recv().is_ok());
    }

    #[test]
    fn test_drain_closes_idle_connections_only() {
        let mut registry = ConnectionRegistry::default();
        let (idle, idle_close) = handle(1);
        let (active, active_close) = handle(2);
        let (fresh, fresh_close) = handle(3);

        registry.apply(Command::Add(idle));
        registry.apply(Command::Add(active));
        registry.apply(Command::Add(fresh));
        registry.apply(Command::Mark(ConnectionId::new(1), ConnectionState::Idle));
        registry.apply(Command::Mark(ConnectionId::new(2), ConnectionState::Active));

        let (done, drained) = async_channel::bounded(1);
        assert_eq!(registry.apply(Command::Drain(done)), Flow::Continue);

        assert!(idle_close.try_recv().is_ok());
        assert!(active_close.try_recv().is_err());
        assert!(fresh_close.try_recv().is_err());
        // Closing does not remove; the Closed notification does.
        assert_eq!(registry.snapshot().live, 3);
        assert!(registry.snapshot().draining);
        assert!(drained.try_recv().is_err());
    }

    #[test]
    fn test_active_connection_closed_once_idle_during_drain() {
        let mut registry = ConnectionRegistry::default();
        let id = ConnectionId::new(5);
        let (conn, close) = handle(5);

        registry.apply(Command::Add(conn));
        registry.apply(Command::Mark(id, ConnectionState::Active));

        let (done, drained) = async_channel::bounded(1);
        registry.apply(Command::Drain(done));
        assert!(close.try_recv().is_err());

        registry.apply(Command::Mark(id, ConnectionState::Idle));
        assert!(close.try_recv().is_ok());
        assert!(drained.try_recv().is_err());

        // A second idle report must not queue another close request.
        registry.apply(Command::Mark(id, ConnectionState::Active));
        registry.apply(Command::Mark(id, ConnectionState::Idle));
        assert!(close.try_recv().is_err());

        assert_eq!(
            registry.apply(Command::Remove(id, ConnectionState::Closed)),
            Flow::Drained
        );
        assert!(drained.try_recv().is_ok());
        assert!(registry.snapshot().is_consistent());
    }

    #[test]
    fn test_drain_waits_for_every_connection() {
        let mut registry = ConnectionRegistry::default();
        let handles: Vec<_> = (0..4).map(handle).collect();

        for (conn, _) in &handles {
            registry.apply(Command::Add(conn.clone()));
            registry.apply(Command::Mark(conn.id(), ConnectionState::Idle));
        }

        let (done, drained) = async_channel::bounded(1);
        registry.apply(Command::Drain(done));
        for (_, close) in &handles {
            assert!(close.try_recv().is_ok());
        }

        for (i, (conn, _)) in handles.iter().enumerate() {
            let flow = registry.apply(Command::Remove(conn.id(), ConnectionState::Closed));
            if i + 1 < handles.len() {
                assert_eq!(flow, Flow::Continue);
                assert!(drained.try_recv().is_err());
            } else {
                assert_eq!(flow, Flow::Drained);
            }
        }
        assert!(drained.try_recv().is_ok());
    }

    #[test]
    fn test_hijacked_connection_counts_as_removed() {
        let mut registry = ConnectionRegistry::default();
        let id = ConnectionId::new(11);
        let (conn, _close) = handle(11);

        registry.apply(Command::Add(conn));
        registry.apply(Command::Mark(id, ConnectionState::Active));
        registry.apply(Command::Remove(id, ConnectionState::Hijacked));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.live, 0);
        assert_eq!(snapshot.total_removed, 1);
        assert_eq!(snapshot.hijacked, 1);
    }

    #[test]
    fn test_owner_task_drains_through_handle() {
        let executor = Executor::new();
        let (registry, task) = ConnectionRegistry::spawn(&executor);
        let (conn, close) = handle(1);
        let id = conn.id();

        let snapshot = future::block_on(executor.run(async {
            registry.add(conn);
            registry.notify(id, ConnectionState::Active);
            registry.notify(id, ConnectionState::Idle);

            let live = registry.snapshot().await.unwrap();
            assert_eq!(live.idle, 1);

            let closer = executor.spawn({
                let registry = registry.clone();
                async move {
                    close.recv().await.unwrap();
                    registry.notify(id, ConnectionState::Closed);
                }
            });

            registry.drain().await;
            closer.await;
            task.await
        }));

        assert_eq!(snapshot.live, 0);
        assert_eq!(snapshot.total_added, 1);
        assert_eq!(snapshot.total_removed, 1);
        assert!(snapshot.is_consistent());
    }
}
