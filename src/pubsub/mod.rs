// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # PubSub control plane
//!
//! The subscribe-side object graph and its lifecycle:
//!
//! ```text
//! PubSub (service lock)
//! +-- Connection            state machine, transport channels
//!     +-- ReaderGroup       cadence, security context, freeze level
//!     |   +-- DataSetReader identifier match, target variables
//!     +-- WriterGroup       publish side, shares the lifecycle
//! ```
//!
//! All configuration RPCs and every event-loop callback serialize on one
//! process-wide service mutex; there are no finer-grained locks. Entities
//! are owned top-down ([`Connection`] owns its groups, groups own their
//! readers); children refer to parents by identifier, resolved under the
//! lock.
//!
//! Teardown is lazy: a removed Connection or ReaderGroup that still has
//! transport channels open moves to a graveyard, unreachable from the
//! API, and is freed by a delayed callback on the event loop once the
//! last channel has closed.
//!
//! [`Connection`]: connection::Connection

pub(crate) mod connection;
pub(crate) mod manager;
pub(crate) mod pipeline;
pub(crate) mod reader;
pub(crate) mod reader_group;
pub(crate) mod writer_group;

use crate::config::{
    ConnectionConfig, DataSetReaderConfig, FieldTarget, ReaderGroupConfig, WriterGroupConfig,
};
use crate::event::{EventLoop, ManualEventLoop};
use crate::transport::{TransportFactory, TransportRegistry};
use manager::PubSubManager;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

#[cfg(feature = "encryption")]
use crate::security::KeySet;

/// Stable identifier of a PubSub entity (Connection, ReaderGroup,
/// DataSetReader or WriterGroup). Unique across all entity classes of one
/// stack for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PubSubId(pub u32);

impl fmt::Display for PubSubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a PubSub entity.
///
/// `Disabled < Paused < PreOperational < Operational` form the working
/// lattice; `Error` is orthogonal and reached from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubSubState {
    Disabled,
    Paused,
    PreOperational,
    Operational,
    Error,
}

impl PubSubState {
    /// True for `PreOperational` and `Operational`.
    #[must_use]
    pub fn is_enabled(self) -> bool {
        matches!(self, PubSubState::PreOperational | PubSubState::Operational)
    }
}

impl fmt::Display for PubSubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PubSubState::Disabled => "Disabled",
            PubSubState::Paused => "Paused",
            PubSubState::PreOperational => "PreOperational",
            PubSubState::Operational => "Operational",
            PubSubState::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Secondary status carried alongside a state transition, explaining it
/// to the user callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    Good,
    /// Stamped on state changes cascaded from a parent.
    ResourceUnavailable,
    /// The parent connection disappeared underneath the entity.
    ConnectionClosed,
    /// Stamped during teardown.
    Shutdown,
    /// Receive-timeout monitor expired.
    Timeout,
    /// Transport connect failed.
    ConnectFailed,
    /// Fatal decode failure while dispatching to a reader.
    DecodeFailed,
    InternalError,
}

/// Errors returned by PubSub operations.
#[derive(Debug)]
pub enum Error {
    /// Null/missing/contradictory input.
    InvalidArgument(String),
    /// Unknown identifier.
    NotFound,
    /// Kept for API parity with the boundary taxonomy; allocation failure
    /// is not observable in safe Rust, so nothing constructs it.
    OutOfMemory,
    /// Feature gated off or the combination is illegal (e.g. blocking
    /// sockets without a custom scheduler).
    NotSupported(String),
    /// The configuration is frozen.
    ConfigurationError(String),
    /// Unreachable state or codec contract violation.
    InternalError(String),
    ResourceUnavailable,
    ConnectionClosed,
    Shutdown,
    Timeout,
    /// Malformed wire data.
    Decode(String),
    /// Signature/decryption failure or missing security material.
    Security(String),
    /// Transport-level failure.
    Transport(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::NotFound => write!(f, "Not found"),
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::NotSupported(msg) => write!(f, "Not supported: {}", msg),
            Error::ConfigurationError(msg) => write!(f, "Configuration error: {}", msg),
            Error::InternalError(msg) => write!(f, "Internal error: {}", msg),
            Error::ResourceUnavailable => write!(f, "Resource unavailable"),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::Shutdown => write!(f, "Shutdown"),
            Error::Timeout => write!(f, "Timeout"),
            Error::Decode(msg) => write!(f, "Decode error: {}", msg),
            Error::Security(msg) => write!(f, "Security error: {}", msg),
            Error::Transport(msg) => write!(f, "Transport error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Cause to stamp on a state transition provoked by this error.
    #[must_use]
    pub fn as_cause(&self) -> Cause {
        match self {
            Error::ResourceUnavailable => Cause::ResourceUnavailable,
            Error::ConnectionClosed => Cause::ConnectionClosed,
            Error::Shutdown => Cause::Shutdown,
            Error::Timeout => Cause::Timeout,
            Error::Transport(_) | Error::NotFound => Cause::ConnectFailed,
            _ => Cause::InternalError,
        }
    }
}

/// Convenient alias for PubSub results.
pub type Result<T> = core::result::Result<T, Error>;

/// User callback invoked on every observable state transition:
/// `(entity id, new state, cause)`. Runs under the service lock; keep it
/// short.
pub type StateChangeCallback = Box<dyn Fn(PubSubId, PubSubState, Cause) + Send + Sync>;

// ============================================================================
// Shared stack state
// ============================================================================

pub(crate) struct Shared {
    pub(crate) manager: Mutex<PubSubManager>,
    pub(crate) event_loop: Arc<dyn EventLoop>,
    pub(crate) transports: TransportRegistry,
    pub(crate) state_cb: Option<StateChangeCallback>,
    pub(crate) self_weak: Weak<Shared>,
}

/// Borrowed view of the stack ambience handed down into entity methods.
pub(crate) struct Ctx<'a> {
    pub(crate) event_loop: &'a Arc<dyn EventLoop>,
    pub(crate) transports: &'a TransportRegistry,
    pub(crate) state_cb: Option<&'a StateChangeCallback>,
    pub(crate) shared: &'a Weak<Shared>,
}

impl Ctx<'_> {
    pub(crate) fn notify(&self, id: PubSubId, state: PubSubState, cause: Cause) {
        if let Some(cb) = self.state_cb {
            cb(id, state, cause);
        }
    }

    /// Event loop effective for a connection (per-connection override or
    /// the stack default).
    pub(crate) fn loop_for<'b>(&'b self, cfg: &'b ConnectionConfig) -> &'b Arc<dyn EventLoop> {
        cfg.event_loop.as_ref().unwrap_or(self.event_loop)
    }
}

impl Shared {
    pub(crate) fn ctx(&self) -> Ctx<'_> {
        Ctx {
            event_loop: &self.event_loop,
            transports: &self.transports,
            state_cb: self.state_cb.as_ref(),
            shared: &self.self_weak,
        }
    }

    /// Subscribe tick of one ReaderGroup (registered on the event loop).
    pub(crate) fn subscribe_tick(self: &Arc<Self>, conn_id: PubSubId, group_id: PubSubId) {
        let mut mgr = self.manager.lock();
        let ctx = self.ctx();

        let Some(ci) = mgr.connection_index(conn_id) else {
            // The parent vanished underneath the tick. Only reachable for
            // groups deferred in the graveyard.
            if let Some(rg) = mgr.group_graveyard.iter_mut().find(|g| g.id == group_id) {
                rg.fail_orphaned(&ctx);
            }
            return;
        };
        let conn = &mut mgr.connections[ci];
        let Some(gi) = conn.reader_group_index(group_id) else {
            return;
        };

        let datagrams = conn.drain_for_group(gi);
        for mut buf in datagrams {
            let rt = {
                let rg = &conn.reader_groups[gi];
                rg.frozen && rg.config.rt_level == crate::config::RtLevel::FixedSize
            };
            let res = if rt {
                pipeline::process_rt(conn, gi, &mut buf, &ctx)
            } else {
                pipeline::process(conn, &mut buf, &ctx)
            };
            if let Err(e) = res {
                log::warn!(
                    "[Pipeline] connection {} dropped datagram: {}",
                    conn_id,
                    e
                );
            }
        }
    }

    /// Receive-timeout monitor expiry of one DataSetReader.
    pub(crate) fn reader_receive_timeout(self: &Arc<Self>, reader_id: PubSubId) {
        let mut mgr = self.manager.lock();
        let ctx = self.ctx();
        if let Some((ci, gi, ri)) = mgr.locate_reader(reader_id) {
            let reader = &mut mgr.connections[ci].reader_groups[gi].readers[ri];
            log::warn!("[Reader] {} message receive timeout", reader_id);
            let _ = reader.set_state(PubSubState::Error, Cause::Timeout, &ctx);
        }
    }

    /// One transport channel of a removed connection finished closing.
    pub(crate) fn connection_channel_closed(self: &Arc<Self>, conn_id: PubSubId) {
        let mut mgr = self.manager.lock();
        if let Some(idx) = mgr
            .connection_graveyard
            .iter()
            .position(|c| c.id == conn_id)
        {
            let done = {
                let conn = &mut mgr.connection_graveyard[idx];
                conn.pending_channel_closures = conn.pending_channel_closures.saturating_sub(1);
                conn.pending_channel_closures == 0
            };
            if done {
                // Free on the loop thread, after the service lock dropped.
                let weak = self.self_weak.clone();
                self.event_loop.add_delayed_callback(Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        let mut mgr = shared.manager.lock();
                        mgr.connection_graveyard.retain(|c| c.id != conn_id);
                        log::debug!("[Connection] {} freed", conn_id);
                    }
                }));
            }
        }
    }

    /// One receive channel of a removed ReaderGroup finished closing.
    pub(crate) fn group_channel_closed(self: &Arc<Self>, group_id: PubSubId) {
        let mut mgr = self.manager.lock();
        if let Some(idx) = mgr.group_graveyard.iter().position(|g| g.id == group_id) {
            let done = {
                let rg = &mut mgr.group_graveyard[idx];
                rg.pending_channel_closures = rg.pending_channel_closures.saturating_sub(1);
                rg.pending_channel_closures == 0
            };
            if done {
                let weak = self.self_weak.clone();
                self.event_loop.add_delayed_callback(Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        let mut mgr = shared.manager.lock();
                        mgr.group_graveyard.retain(|g| g.id != group_id);
                        log::debug!("[ReaderGroup] {} freed", group_id);
                    }
                }));
            }
        }
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// Builder for a [`PubSub`] stack.
pub struct PubSubBuilder {
    event_loop: Option<Arc<dyn EventLoop>>,
    transports: TransportRegistry,
    state_cb: Option<StateChangeCallback>,
}

impl PubSubBuilder {
    /// Default event loop for the stack. Connections may override it in
    /// their config.
    #[must_use]
    pub fn event_loop(mut self, el: Arc<dyn EventLoop>) -> Self {
        self.event_loop = Some(el);
        self
    }

    /// Register a transport factory (repeatable, keyed by profile URI).
    #[must_use]
    pub fn transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transports.register(factory);
        self
    }

    /// State-change callback invoked on every observable transition.
    #[must_use]
    pub fn state_change_callback<F>(mut self, cb: F) -> Self
    where
        F: Fn(PubSubId, PubSubState, Cause) + Send + Sync + 'static,
    {
        self.state_cb = Some(Box::new(cb));
        self
    }

    #[must_use]
    pub fn build(self) -> PubSub {
        let event_loop: Arc<dyn EventLoop> = match self.event_loop {
            Some(el) => el,
            None => ManualEventLoop::new(),
        };
        let shared = Arc::new_cyclic(|weak| Shared {
            manager: Mutex::new(PubSubManager::new()),
            event_loop,
            transports: self.transports,
            state_cb: self.state_cb,
            self_weak: weak.clone(),
        });
        PubSub { shared }
    }
}

/// Top-level handle of one PubSub stack. Cheap to clone.
#[derive(Clone)]
pub struct PubSub {
    shared: Arc<Shared>,
}

impl PubSub {
    #[must_use]
    pub fn builder() -> PubSubBuilder {
        PubSubBuilder {
            event_loop: None,
            transports: TransportRegistry::new(),
            state_cb: None,
        }
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Create a connection. With `enabled` set in the config the
    /// connection is driven towards operation right away.
    pub fn add_connection(&self, config: ConnectionConfig) -> Result<PubSubId> {
        let ctx = self.shared.ctx();
        let mut mgr = self.shared.manager.lock();

        // The transport must exist before we commit anything.
        ctx.transports.find(&config.transport_profile_uri)?;

        let id = mgr.mint_unique_id();
        let enabled = config.enabled;
        mgr.connections
            .push(connection::Connection::new(id, config));
        log::info!("[Connection] {} created", id);

        if enabled {
            let ci = mgr.connections.len() - 1;
            mgr.connections[ci].set_state(PubSubState::PreOperational, Cause::Good, &ctx)?;
        }
        Ok(id)
    }

    /// Remove a connection: children are stopped and removed, channels
    /// closed, and the memory released once the event loop reports the
    /// last channel closed. Removing an unknown id fails with `NotFound`.
    pub fn remove_connection(&self, id: PubSubId) -> Result<()> {
        let ctx = self.shared.ctx();
        let mut mgr = self.shared.manager.lock();
        let ci = mgr.connection_index(id).ok_or(Error::NotFound)?;
        mgr.remove_connection_at(ci, &ctx)
    }

    /// Enable: `DISABLED/PAUSED/ERROR -> PREOPERATIONAL` (or straight to
    /// `OPERATIONAL` when the transport reports the channel ready).
    pub fn enable_connection(&self, id: PubSubId) -> Result<()> {
        self.set_connection_state(id, PubSubState::PreOperational, Cause::Good)
    }

    pub fn set_connection_operational(&self, id: PubSubId) -> Result<()> {
        self.set_connection_state(id, PubSubState::Operational, Cause::Good)
    }

    pub fn disable_connection(&self, id: PubSubId) -> Result<()> {
        self.set_connection_state(id, PubSubState::Disabled, Cause::Good)
    }

    fn set_connection_state(&self, id: PubSubId, state: PubSubState, cause: Cause) -> Result<()> {
        let ctx = self.shared.ctx();
        let mut mgr = self.shared.manager.lock();
        let ci = mgr.connection_index(id).ok_or(Error::NotFound)?;
        mgr.connections[ci].set_state(state, cause, &ctx)
    }

    pub fn connection_config(&self, id: PubSubId) -> Result<ConnectionConfig> {
        let mgr = self.shared.manager.lock();
        let ci = mgr.connection_index(id).ok_or(Error::NotFound)?;
        Ok(mgr.connections[ci].config.clone())
    }

    pub fn connection_state(&self, id: PubSubId) -> Result<PubSubState> {
        let mgr = self.shared.manager.lock();
        let ci = mgr.connection_index(id).ok_or(Error::NotFound)?;
        Ok(mgr.connections[ci].state)
    }

    // ------------------------------------------------------------------
    // ReaderGroups
    // ------------------------------------------------------------------

    /// Create a ReaderGroup under a connection. The group starts
    /// `DISABLED`; [`enable_reader_group`](Self::enable_reader_group)
    /// activates it.
    pub fn add_reader_group(
        &self,
        connection: PubSubId,
        config: ReaderGroupConfig,
    ) -> Result<PubSubId> {
        let ctx = self.shared.ctx();
        let mut mgr = self.shared.manager.lock();
        mgr.create_reader_group(connection, config, &ctx)
    }

    /// Remove a ReaderGroup. Rejected while frozen. Deletion defers until
    /// group-owned receive channels have closed.
    pub fn remove_reader_group(&self, id: PubSubId) -> Result<()> {
        let ctx = self.shared.ctx();
        let mut mgr = self.shared.manager.lock();
        let (ci, gi) = mgr.locate_reader_group(id).ok_or(Error::NotFound)?;
        mgr.remove_reader_group_at(ci, gi, &ctx)
    }

    /// Enable: register the subscribe tick and go `PREOPERATIONAL`. The
    /// first successfully dispatched message promotes to `OPERATIONAL`.
    pub fn enable_reader_group(&self, id: PubSubId) -> Result<()> {
        let ctx = self.shared.ctx();
        let mut mgr = self.shared.manager.lock();
        let (ci, gi) = mgr.locate_reader_group(id).ok_or(Error::NotFound)?;
        let conn = &mut mgr.connections[ci];
        // An idempotent connect may open receive channels a new group
        // needs; it also completes a pending PRE -> OP promotion.
        if conn.state == PubSubState::PreOperational {
            let _ = conn.set_state(PubSubState::Operational, Cause::Good, &ctx);
        }
        conn.set_reader_group_state(gi, PubSubState::PreOperational, Cause::Good, &ctx)
    }

    pub fn disable_reader_group(&self, id: PubSubId) -> Result<()> {
        let ctx = self.shared.ctx();
        let mut mgr = self.shared.manager.lock();
        let (ci, gi) = mgr.locate_reader_group(id).ok_or(Error::NotFound)?;
        mgr.connections[ci].set_reader_group_state(
            gi,
            PubSubState::Disabled,
            Cause::ResourceUnavailable,
            &ctx,
        )
    }

    pub fn reader_group_config(&self, id: PubSubId) -> Result<ReaderGroupConfig> {
        let mgr = self.shared.manager.lock();
        let (ci, gi) = mgr.locate_reader_group(id).ok_or(Error::NotFound)?;
        Ok(mgr.connections[ci].reader_groups[gi].config.clone())
    }

    pub fn reader_group_state(&self, id: PubSubId) -> Result<PubSubState> {
        let mgr = self.shared.manager.lock();
        let (ci, gi) = mgr.locate_reader_group(id).ok_or(Error::NotFound)?;
        Ok(mgr.connections[ci].reader_groups[gi].state)
    }

    /// Freeze the group configuration. Under `FIXED_SIZE` this validates
    /// the RT compatibility matrix and arms the offset-buffer fast path.
    pub fn freeze_reader_group(&self, id: PubSubId) -> Result<()> {
        let ctx = self.shared.ctx();
        let mut mgr = self.shared.manager.lock();
        let (ci, gi) = mgr.locate_reader_group(id).ok_or(Error::NotFound)?;
        mgr.connections[ci].freeze_reader_group(gi, &ctx)
    }

    pub fn unfreeze_reader_group(&self, id: PubSubId) -> Result<()> {
        let mut mgr = self.shared.manager.lock();
        let (ci, gi) = mgr.locate_reader_group(id).ok_or(Error::NotFound)?;
        mgr.connections[ci].unfreeze_reader_group(gi);
        Ok(())
    }

    /// Install (or roll over) the signing/encryption keys of a group.
    #[cfg(feature = "encryption")]
    pub fn set_reader_group_encryption_keys(
        &self,
        id: PubSubId,
        token_id: u32,
        keys: KeySet,
    ) -> Result<()> {
        let mut mgr = self.shared.manager.lock();
        let (ci, gi) = mgr.locate_reader_group(id).ok_or(Error::NotFound)?;
        mgr.connections[ci].reader_groups[gi].set_encryption_keys(token_id, &keys)
    }

    /// Push the current key set of the group's security-group storage
    /// into its policy context (SKS).
    #[cfg(feature = "sks")]
    pub fn activate_reader_group_key(&self, id: PubSubId) -> Result<()> {
        let mut mgr = self.shared.manager.lock();
        mgr.activate_reader_group_key(id)
    }

    /// Install a key set into the storage of a security group (SKS
    /// distribution path).
    #[cfg(feature = "sks")]
    pub fn set_security_group_keys(
        &self,
        security_group_id: &str,
        current_token_id: u32,
        keys: Vec<(u32, KeySet)>,
    ) -> Result<()> {
        let mut mgr = self.shared.manager.lock();
        let storage = mgr
            .key_storage_mut(security_group_id)
            .ok_or(Error::NotFound)?;
        storage.set_keys(current_token_id, keys)
    }

    // ------------------------------------------------------------------
    // DataSetReaders
    // ------------------------------------------------------------------

    pub fn add_data_set_reader(
        &self,
        group: PubSubId,
        config: DataSetReaderConfig,
    ) -> Result<PubSubId> {
        let ctx = self.shared.ctx();
        let mut mgr = self.shared.manager.lock();
        mgr.create_data_set_reader(group, config, &ctx)
    }

    pub fn remove_data_set_reader(&self, id: PubSubId) -> Result<()> {
        let ctx = self.shared.ctx();
        let mut mgr = self.shared.manager.lock();
        let (ci, gi, ri) = mgr.locate_reader(id).ok_or(Error::NotFound)?;
        mgr.connections[ci].reader_groups[gi].remove_reader(ri, &ctx)
    }

    /// Update the mutable subset of a reader config (writer ids, targets,
    /// receive timeout). Rejected while the reader or its group is
    /// frozen.
    pub fn update_data_set_reader(&self, id: PubSubId, config: &DataSetReaderConfig) -> Result<()> {
        let ctx = self.shared.ctx();
        let mut mgr = self.shared.manager.lock();
        let (ci, gi, ri) = mgr.locate_reader(id).ok_or(Error::NotFound)?;
        let rg = &mut mgr.connections[ci].reader_groups[gi];
        let group_frozen = rg.frozen;
        rg.readers[ri].update_config(config, group_frozen, &ctx)
    }

    /// Replace the target-variable bindings of a reader wholesale.
    pub fn create_target_variables(
        &self,
        reader: PubSubId,
        targets: Vec<FieldTarget>,
    ) -> Result<()> {
        let mut mgr = self.shared.manager.lock();
        let (ci, gi, ri) = mgr.locate_reader(reader).ok_or(Error::NotFound)?;
        let rg = &mut mgr.connections[ci].reader_groups[gi];
        let group_frozen = rg.frozen;
        rg.readers[ri].create_target_variables(targets, group_frozen)
    }

    pub fn data_set_reader_config(&self, id: PubSubId) -> Result<DataSetReaderConfig> {
        let mgr = self.shared.manager.lock();
        let (ci, gi, ri) = mgr.locate_reader(id).ok_or(Error::NotFound)?;
        Ok(mgr.connections[ci].reader_groups[gi].readers[ri]
            .config
            .clone())
    }

    pub fn data_set_reader_state(&self, id: PubSubId) -> Result<PubSubState> {
        let mgr = self.shared.manager.lock();
        let (ci, gi, ri) = mgr.locate_reader(id).ok_or(Error::NotFound)?;
        Ok(mgr.connections[ci].reader_groups[gi].readers[ri].state)
    }

    // ------------------------------------------------------------------
    // WriterGroups (publish side, lifecycle only)
    // ------------------------------------------------------------------

    pub fn add_writer_group(
        &self,
        connection: PubSubId,
        config: WriterGroupConfig,
    ) -> Result<PubSubId> {
        let mut mgr = self.shared.manager.lock();
        let ci = mgr.connection_index(connection).ok_or(Error::NotFound)?;
        if mgr.connections[ci].freeze_counter > 0 {
            return Err(Error::ConfigurationError(
                "connection configuration is frozen".into(),
            ));
        }
        let id = mgr.mint_unique_id();
        mgr.connections[ci]
            .writer_groups
            .insert(0, writer_group::WriterGroup::new(id, connection, config));
        Ok(id)
    }

    pub fn remove_writer_group(&self, id: PubSubId) -> Result<()> {
        let ctx = self.shared.ctx();
        let mut mgr = self.shared.manager.lock();
        let (ci, wi) = mgr.locate_writer_group(id).ok_or(Error::NotFound)?;
        let mut wg = mgr.connections[ci].writer_groups.remove(wi);
        let _ = wg.set_state(PubSubState::Disabled, Cause::Shutdown, &ctx);
        Ok(())
    }

    pub fn writer_group_state(&self, id: PubSubId) -> Result<PubSubState> {
        let mgr = self.shared.manager.lock();
        let (ci, wi) = mgr.locate_writer_group(id).ok_or(Error::NotFound)?;
        Ok(mgr.connections[ci].writer_groups[wi].state)
    }

    // ------------------------------------------------------------------
    // Receive entry points
    // ------------------------------------------------------------------

    /// Process one inbound datagram on a connection. This is the entry
    /// point push transports (e.g. an MQTT PUBLISH callback) use; pull
    /// transports converge here through the subscribe tick.
    pub fn process(&self, connection: PubSubId, datagram: &[u8]) -> Result<()> {
        let ctx = self.shared.ctx();
        let mut mgr = self.shared.manager.lock();
        let ci = mgr.connection_index(connection).ok_or(Error::NotFound)?;
        let mut buf = datagram.to_vec();
        pipeline::process(&mut mgr.connections[ci], &mut buf, &ctx)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Entities whose removal is waiting on transport-channel closure.
    #[must_use]
    pub fn pending_teardowns(&self) -> usize {
        let mgr = self.shared.manager.lock();
        mgr.connection_graveyard.len() + mgr.group_graveyard.len()
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.manager.lock().connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkAddress;
    use crate::config::profiles;
    use crate::transport::{LoopbackBus, LoopbackTransport};
    use crate::types::PublisherId;

    fn stack() -> PubSub {
        let bus = LoopbackBus::new();
        PubSub::builder()
            .transport(Arc::new(LoopbackTransport::new(profiles::UDP_UADP, bus)))
            .build()
    }

    fn conn_cfg(enabled: bool) -> ConnectionConfig {
        ConnectionConfig {
            name: "c".into(),
            publisher_id: PublisherId::UInt16(1),
            address: NetworkAddress::url("opc.udp://224.0.0.22:4840"),
            enabled,
            ..Default::default()
        }
    }

    #[test]
    fn test_connection_pause_only_from_disabled() {
        let ps = stack();
        let c = ps.add_connection(conn_cfg(false)).expect("add");
        let ctx = ps.shared.ctx();
        let mut mgr = ps.shared.manager.lock();
        let ci = mgr.connection_index(c).expect("index");

        mgr.connections[ci]
            .set_state(PubSubState::Paused, Cause::Good, &ctx)
            .expect("pause from disabled");
        assert_eq!(mgr.connections[ci].state, PubSubState::Paused);

        mgr.connections[ci]
            .set_state(PubSubState::PreOperational, Cause::Good, &ctx)
            .expect("enable from paused");
        assert!(mgr.connections[ci].state.is_enabled());

        assert!(matches!(
            mgr.connections[ci].set_state(PubSubState::Paused, Cause::Good, &ctx),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_group_error_requires_disable_before_reenable() {
        let ps = stack();
        let c = ps.add_connection(conn_cfg(true)).expect("add");
        let g = ps
            .add_reader_group(c, ReaderGroupConfig::default())
            .expect("group");
        let ctx = ps.shared.ctx();
        let mut mgr = ps.shared.manager.lock();
        let (ci, gi) = mgr.locate_reader_group(g).expect("locate");

        mgr.connections[ci]
            .set_reader_group_state(gi, PubSubState::Paused, Cause::Good, &ctx)
            .expect("pause from disabled");
        mgr.connections[ci]
            .set_reader_group_state(gi, PubSubState::PreOperational, Cause::Good, &ctx)
            .expect("enable from paused");
        assert!(matches!(
            mgr.connections[ci].set_reader_group_state(gi, PubSubState::Paused, Cause::Good, &ctx),
            Err(Error::NotSupported(_))
        ));

        mgr.connections[ci]
            .set_reader_group_state(gi, PubSubState::Error, Cause::InternalError, &ctx)
            .expect("force error");
        assert!(matches!(
            mgr.connections[ci].set_reader_group_state(
                gi,
                PubSubState::PreOperational,
                Cause::Good,
                &ctx
            ),
            Err(Error::NotSupported(_))
        ));

        mgr.connections[ci]
            .set_reader_group_state(gi, PubSubState::Disabled, Cause::Good, &ctx)
            .expect("disable");
        mgr.connections[ci]
            .set_reader_group_state(gi, PubSubState::PreOperational, Cause::Good, &ctx)
            .expect("re-enable after disable");
    }

    #[test]
    fn test_mint_skips_ids_in_use() {
        let ps = stack();
        let mut mgr = ps.shared.manager.lock();
        let a = mgr.mint_unique_id();
        // Occupy the id the counter would hand out next.
        mgr.connections.push(connection::Connection::new(
            PubSubId(a.0 + 1),
            ConnectionConfig::default(),
        ));
        let b = mgr.mint_unique_id();
        assert_ne!(b.0, a.0 + 1);
        assert!(!mgr.id_in_use(b));
    }

    #[test]
    fn test_operational_only_from_preoperational() {
        let ps = stack();
        let c = ps.add_connection(conn_cfg(true)).expect("add");
        let g = ps
            .add_reader_group(c, ReaderGroupConfig::default())
            .expect("group");
        let ctx = ps.shared.ctx();
        let mut mgr = ps.shared.manager.lock();
        let (ci, gi) = mgr.locate_reader_group(g).expect("locate");

        // Straight to OPERATIONAL from DISABLED is rejected.
        assert!(matches!(
            mgr.connections[ci].set_reader_group_state(
                gi,
                PubSubState::Operational,
                Cause::Good,
                &ctx
            ),
            Err(Error::NotSupported(_))
        ));
    }
}
