// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide PubSub registry.
//!
//! Owns the ordered connection sequence, mints identifiers unique across
//! every entity class, and keeps the graveyards for lazily freed
//! entities. All access happens under the service lock.

use super::connection::Connection;
use super::reader_group::ReaderGroup;
use super::{Cause, Ctx, Error, PubSubId, PubSubState, Result};
use crate::config::{
    DataSetReaderConfig, GroupTransportSettings, ReaderGroupConfig,
    DEFAULT_SOCKET_TIMEOUT_MS, DEFAULT_SUBSCRIBING_INTERVAL_MS,
};
use std::collections::HashMap;

#[cfg(feature = "sks")]
use crate::config::SecurityMode;
#[cfg(feature = "sks")]
use crate::security::key_storage::KeyStorage;

pub(crate) struct PubSubManager {
    /// Live connections, in creation order.
    pub(crate) connections: Vec<Connection>,
    /// Removed connections waiting for their channels to close.
    pub(crate) connection_graveyard: Vec<Connection>,
    /// Removed reader groups waiting for their channels to close.
    pub(crate) group_graveyard: Vec<ReaderGroup>,
    /// Broker topic -> ReaderGroup binding (MQTT transports).
    pub(crate) topic_bindings: HashMap<String, PubSubId>,
    #[cfg(feature = "sks")]
    pub(crate) key_storages: Vec<KeyStorage>,
    next_id: u32,
}

impl PubSubManager {
    pub(crate) fn new() -> Self {
        PubSubManager {
            connections: Vec::new(),
            connection_graveyard: Vec::new(),
            group_graveyard: Vec::new(),
            topic_bindings: HashMap::new(),
            #[cfg(feature = "sks")]
            key_storages: Vec::new(),
            next_id: 1,
        }
    }

    // ------------------------------------------------------------------
    // Identifiers
    // ------------------------------------------------------------------

    /// Mint an identifier not used by any live entity of any class
    /// (graveyards included, so a pending free can never alias).
    pub(crate) fn mint_unique_id(&mut self) -> PubSubId {
        loop {
            let id = PubSubId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.id_in_use(id) {
                return id;
            }
        }
    }

    pub(crate) fn id_in_use(&self, id: PubSubId) -> bool {
        let groups = |c: &Connection| {
            c.reader_groups.iter().any(|g| {
                g.id == id || g.readers.iter().any(|r| r.id == id)
            }) || c.writer_groups.iter().any(|w| w.id == id)
        };
        self.connections.iter().any(|c| c.id == id || groups(c))
            || self.connection_graveyard.iter().any(|c| c.id == id || groups(c))
            || self
                .group_graveyard
                .iter()
                .any(|g| g.id == id || g.readers.iter().any(|r| r.id == id))
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub(crate) fn connection_index(&self, id: PubSubId) -> Option<usize> {
        self.connections.iter().position(|c| c.id == id)
    }

    pub(crate) fn locate_reader_group(&self, id: PubSubId) -> Option<(usize, usize)> {
        for (ci, c) in self.connections.iter().enumerate() {
            if let Some(gi) = c.reader_groups.iter().position(|g| g.id == id) {
                return Some((ci, gi));
            }
        }
        None
    }

    pub(crate) fn locate_reader(&self, id: PubSubId) -> Option<(usize, usize, usize)> {
        for (ci, c) in self.connections.iter().enumerate() {
            for (gi, g) in c.reader_groups.iter().enumerate() {
                if let Some(ri) = g.readers.iter().position(|r| r.id == id) {
                    return Some((ci, gi, ri));
                }
            }
        }
        None
    }

    pub(crate) fn locate_writer_group(&self, id: PubSubId) -> Option<(usize, usize)> {
        for (ci, c) in self.connections.iter().enumerate() {
            if let Some(wi) = c.writer_groups.iter().position(|w| w.id == id) {
                return Some((ci, wi));
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // ReaderGroup lifecycle
    // ------------------------------------------------------------------

    pub(crate) fn create_reader_group(
        &mut self,
        connection: PubSubId,
        mut config: ReaderGroupConfig,
        ctx: &Ctx,
    ) -> Result<PubSubId> {
        let ci = self.connection_index(connection).ok_or(Error::NotFound)?;

        if config.enable_blocking_socket && config.scheduler.is_none() {
            log::warn!(
                "[ReaderGroup] create on connection {} failed: blocking sockets \
                 require a custom scheduler",
                connection
            );
            return Err(Error::NotSupported(
                "blocking sockets require a custom scheduler".into(),
            ));
        }

        if self.connections[ci].freeze_counter > 0 {
            log::warn!(
                "[ReaderGroup] create on connection {} failed: connection \
                 configuration is frozen",
                connection
            );
            return Err(Error::ConfigurationError(
                "connection configuration is frozen".into(),
            ));
        }

        // Apply defaults.
        if config.subscribing_interval_ms == 0 {
            config.subscribing_interval_ms = DEFAULT_SUBSCRIBING_INTERVAL_MS;
        }
        if config.enable_blocking_socket {
            config.timeout_ms = 0;
        } else if config.timeout_ms == 0 {
            config.timeout_ms = DEFAULT_SOCKET_TIMEOUT_MS;
        }

        // Broker transports need the topic before anything is committed.
        let requires_binding = ctx
            .transports
            .find(&self.connections[ci].config.transport_profile_uri)?
            .requires_topic_binding();
        let queue_name = if requires_binding {
            match &config.transport_settings {
                GroupTransportSettings::Broker { queue_name } => Some(queue_name.clone()),
                GroupTransportSettings::Default => {
                    return Err(Error::InvalidArgument(
                        "broker transport requires broker transport settings with a queue name"
                            .into(),
                    ))
                }
            }
        } else {
            None
        };

        #[cfg(feature = "sks")]
        let attached_group = self.attach_key_storage(&config);

        let id = self.mint_unique_id();
        if let Some(queue) = queue_name {
            self.topic_bindings.insert(queue, id);
        }

        #[allow(unused_mut)]
        let mut rg = ReaderGroup::new(id, connection, config);
        #[cfg(feature = "sks")]
        {
            rg.key_storage_attached = attached_group;
        }

        // Newest group first: deterministic first-match-wins in dispatch.
        self.connections[ci].reader_groups.insert(0, rg);
        log::info!("[ReaderGroup] {} created on connection {}", id, connection);

        // Reconnect so a group-specific receive channel can open. The
        // connection stays in charge of its own state on failure.
        if self.connections[ci].state.is_enabled() {
            let _ = self.connections[ci].connect(ctx);
        }

        Ok(id)
    }

    pub(crate) fn remove_reader_group_at(
        &mut self,
        ci: usize,
        gi: usize,
        ctx: &Ctx,
    ) -> Result<()> {
        if self.connections[ci].reader_groups[gi].frozen {
            log::warn!(
                "[ReaderGroup] remove {} failed: configuration is frozen",
                self.connections[ci].reader_groups[gi].id
            );
            return Err(Error::ConfigurationError(
                "subscriber configuration is frozen".into(),
            ));
        }

        let mut rg = self.connections[ci].reader_groups.remove(gi);
        rg.disable(Cause::Shutdown, ctx);
        rg.teardown_readers(ctx);
        self.release_group_resources(&mut rg);
        self.bury_reader_group(rg, ctx);
        Ok(())
    }

    /// Detach manager-held resources of a group (key storage, topic
    /// bindings). Safe to call once per group.
    pub(crate) fn release_group_resources(&mut self, rg: &mut ReaderGroup) {
        self.topic_bindings.retain(|_, v| *v != rg.id);
        #[cfg(feature = "sks")]
        if rg.key_storage_attached {
            rg.key_storage_attached = false;
            if let Some(sg) = rg.config.security_group_id.clone() {
                if let Some(i) = self
                    .key_storages
                    .iter()
                    .position(|s| s.security_group_id() == sg)
                {
                    if self.key_storages[i].detach() {
                        self.key_storages.remove(i);
                        log::debug!("[KeyStorage] '{}' dropped (last reference)", sg);
                    }
                }
            }
        }
    }

    /// Finish removing a group: drop it immediately when it owns no
    /// channels, otherwise defer the free until its channels close.
    pub(crate) fn bury_reader_group(&mut self, mut rg: ReaderGroup, ctx: &Ctx) {
        rg.delete_flag = true;
        let pending = rg.close_channels();
        if pending == 0 {
            log::debug!("[ReaderGroup] {} removed", rg.id);
            return;
        }
        rg.pending_channel_closures = pending;
        let id = rg.id;
        for _ in 0..pending {
            let weak = ctx.shared.clone();
            ctx.event_loop.add_delayed_callback(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.group_channel_closed(id);
                }
            }));
        }
        log::debug!(
            "[ReaderGroup] {} removal deferred ({} channels closing)",
            id,
            pending
        );
        self.group_graveyard.push(rg);
    }

    // ------------------------------------------------------------------
    // DataSetReader lifecycle
    // ------------------------------------------------------------------

    pub(crate) fn create_data_set_reader(
        &mut self,
        group: PubSubId,
        mut config: DataSetReaderConfig,
        ctx: &Ctx,
    ) -> Result<PubSubId> {
        let (ci, gi) = self.locate_reader_group(group).ok_or(Error::NotFound)?;
        if self.connections[ci].reader_groups[gi].frozen {
            log::warn!(
                "[Reader] create in group {} failed: subscriber configuration is frozen",
                group
            );
            return Err(Error::ConfigurationError(
                "subscriber configuration is frozen".into(),
            ));
        }

        if config.message_settings.network_message_number != 0
            || config.message_settings.data_set_offset != 0
        {
            log::warn!(
                "[Reader] static DataSetMessage configuration not supported, using defaults"
            );
            config.message_settings.network_message_number = 0;
            config.message_settings.data_set_offset = 0;
        }

        let id = self.mint_unique_id();
        let rg = &mut self.connections[ci].reader_groups[gi];
        let group_state = rg.state;
        rg.readers.insert(0, super::reader::DataSetReader::new(id, group, config));
        log::info!("[Reader] {} created in group {}", id, group);

        if group_state.is_enabled() {
            rg.readers[0].set_state(PubSubState::PreOperational, Cause::Good, ctx)?;
        }
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Connection teardown
    // ------------------------------------------------------------------

    /// Delete protocol of spec behavior: cascade-stop and remove the
    /// children, close the transport, unlink, and defer the free until
    /// the event loop reports every channel closed.
    pub(crate) fn remove_connection_at(&mut self, ci: usize, ctx: &Ctx) -> Result<()> {
        let mut conn = self.connections.remove(ci);
        let id = conn.id;

        // Stop and remove WriterGroups.
        for wg in conn.writer_groups.iter_mut() {
            let _ = wg.set_state(PubSubState::Disabled, Cause::Shutdown, ctx);
        }
        conn.writer_groups.clear();

        // Stop, unfreeze and remove ReaderGroups.
        while let Some(mut rg) = conn.reader_groups.pop() {
            rg.disable(Cause::Shutdown, ctx);
            rg.unfreeze_into(&mut conn.freeze_counter);
            rg.teardown_readers(ctx);
            self.release_group_resources(&mut rg);
            self.bury_reader_group(rg, ctx);
        }

        // Close the transport and defer the free.
        conn.delete_flag = true;
        let pending = conn.close_channels();
        if pending == 0 {
            log::info!("[Connection] {} removed", id);
            return Ok(());
        }
        conn.pending_channel_closures = pending;
        let el = ctx.loop_for(&conn.config).clone();
        for _ in 0..pending {
            let weak = ctx.shared.clone();
            el.add_delayed_callback(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.connection_channel_closed(id);
                }
            }));
        }
        log::info!(
            "[Connection] {} removal deferred ({} channels closing)",
            id,
            pending
        );
        self.connection_graveyard.push(conn);
        Ok(())
    }

    // ------------------------------------------------------------------
    // SKS key storage
    // ------------------------------------------------------------------

    #[cfg(feature = "sks")]
    fn attach_key_storage(&mut self, config: &ReaderGroupConfig) -> bool {
        if config.security_mode == SecurityMode::None {
            return false;
        }
        let (Some(sg), Some(policy)) = (&config.security_group_id, &config.security_policy)
        else {
            return false;
        };
        let idx = match self
            .key_storages
            .iter()
            .position(|s| s.security_group_id() == sg.as_str())
        {
            Some(i) => i,
            None => {
                self.key_storages
                    .push(KeyStorage::new(sg.clone(), policy.clone()));
                log::debug!("[KeyStorage] '{}' created", sg);
                self.key_storages.len() - 1
            }
        };
        self.key_storages[idx].attach();
        true
    }

    #[cfg(feature = "sks")]
    pub(crate) fn key_storage_mut(&mut self, security_group_id: &str) -> Option<&mut KeyStorage> {
        self.key_storages
            .iter_mut()
            .find(|s| s.security_group_id() == security_group_id)
    }

    #[cfg(feature = "sks")]
    pub(crate) fn activate_reader_group_key(&mut self, group: PubSubId) -> Result<()> {
        let (ci, gi) = self.locate_reader_group(group).ok_or(Error::NotFound)?;
        let sg = self.connections[ci].reader_groups[gi]
            .config
            .security_group_id
            .clone()
            .ok_or_else(|| Error::NotSupported("group has no security group id".into()))?;
        let (token, keys) = {
            let storage = self
                .key_storages
                .iter()
                .find(|s| s.security_group_id() == sg)
                .ok_or(Error::NotFound)?;
            let keys = storage
                .current_keys()
                .ok_or_else(|| Error::NotSupported("no keys distributed yet".into()))?
                .clone();
            (storage.current_token_id(), keys)
        };
        self.connections[ci].reader_groups[gi].set_encryption_keys(token, &keys)
    }
}
