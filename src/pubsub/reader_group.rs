// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ReaderGroup: a set of DataSetReaders sharing a subscribe cadence and
//! (optionally) a security context.
//!
//! The group owns the periodic subscribe tick. Enabling registers the
//! tick and goes `PREOPERATIONAL`; the first successfully dispatched
//! NetworkMessage promotes the group (and its readers) to `OPERATIONAL`.
//! Freezing pins the configuration and, at the `FIXED_SIZE` level,
//! validates the real-time compatibility matrix so decoding can run over
//! a precomputed offset table.

use super::reader::DataSetReader;
use super::{Cause, Ctx, Error, PubSubId, PubSubState, Result};
use crate::config::{ConnectionConfig, MessageEncoding, ReaderGroupConfig, RtLevel};
use crate::event::{CallbackId, EventLoop};
use crate::transport::Channel;
use crate::types::DataType;
use std::sync::Arc;

#[cfg(feature = "encryption")]
use crate::security::{KeySet, PolicyContext};

pub(crate) struct ReaderGroup {
    pub(crate) id: PubSubId,
    /// Parent connection, resolved by identifier under the service lock.
    pub(crate) parent: PubSubId,
    pub(crate) config: ReaderGroupConfig,
    pub(crate) state: PubSubState,
    /// Newest reader first (head insertion).
    pub(crate) readers: Vec<DataSetReader>,
    pub(crate) frozen: bool,
    pub(crate) delete_flag: bool,
    /// Group-owned receive channels (broker transports).
    pub(crate) recv_channels: Vec<Box<dyn Channel>>,
    pub(crate) pending_channel_closures: usize,
    /// Registered subscribe tick: the loop it lives on plus its id.
    subscribe_callback: Option<(Arc<dyn EventLoop>, CallbackId)>,
    #[cfg(feature = "encryption")]
    pub(crate) security_token_id: u32,
    #[cfg(feature = "encryption")]
    pub(crate) nonce_sequence_number: u32,
    #[cfg(feature = "encryption")]
    pub(crate) security_context: Option<Box<dyn PolicyContext>>,
    #[cfg(feature = "sks")]
    pub(crate) key_storage_attached: bool,
}

impl ReaderGroup {
    pub(crate) fn new(id: PubSubId, parent: PubSubId, config: ReaderGroupConfig) -> Self {
        ReaderGroup {
            id,
            parent,
            config,
            state: PubSubState::Disabled,
            readers: Vec::new(),
            frozen: false,
            delete_flag: false,
            recv_channels: Vec::new(),
            pending_channel_closures: 0,
            subscribe_callback: None,
            #[cfg(feature = "encryption")]
            security_token_id: 0,
            #[cfg(feature = "encryption")]
            nonce_sequence_number: 0,
            #[cfg(feature = "encryption")]
            security_context: None,
            #[cfg(feature = "sks")]
            key_storage_attached: false,
        }
    }

    fn transition(&mut self, new: PubSubState, cause: Cause, ctx: &Ctx) {
        if self.state != new {
            log::info!("[ReaderGroup] {} {} -> {}", self.id, self.state, new);
            self.state = new;
            ctx.notify(self.id, new, cause);
        }
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    /// `DISABLED`: unregister the subscribe tick and drive every reader
    /// down with the same cause.
    pub(crate) fn disable(&mut self, cause: Cause, ctx: &Ctx) {
        if self.state == PubSubState::Disabled {
            return;
        }
        self.stop_subscribe_callback();
        for r in &mut self.readers {
            let _ = r.set_state(PubSubState::Disabled, cause, ctx);
        }
        self.transition(PubSubState::Disabled, cause, ctx);
    }

    /// `PAUSED` is only reachable from `DISABLED` (parent not ready).
    pub(crate) fn pause(&mut self, cause: Cause, ctx: &Ctx) -> Result<()> {
        match self.state {
            PubSubState::Paused => Ok(()),
            PubSubState::Disabled => {
                self.transition(PubSubState::Paused, cause, ctx);
                Ok(())
            }
            _ => Err(Error::NotSupported(
                "PAUSED is only reachable from DISABLED".into(),
            )),
        }
    }

    /// `PREOPERATIONAL`: requires the parent enabled; registers the
    /// subscribe tick. Readers stay where they are until the first valid
    /// message.
    pub(crate) fn enable(
        &mut self,
        parent_id: PubSubId,
        parent_state: PubSubState,
        conn_config: &ConnectionConfig,
        ctx: &Ctx,
    ) -> Result<()> {
        match self.state {
            PubSubState::Disabled | PubSubState::Paused => {
                if !parent_state.is_enabled() {
                    log::warn!(
                        "[ReaderGroup] {} enable failed: connection {} not operational",
                        self.id,
                        parent_id
                    );
                    return Err(Error::InternalError("connection not operational".into()));
                }
                self.register_subscribe_callback(parent_id, conn_config, ctx);
                self.transition(PubSubState::PreOperational, Cause::Good, ctx);
                Ok(())
            }
            PubSubState::PreOperational | PubSubState::Operational => Ok(()),
            PubSubState::Error => Err(Error::NotSupported(
                "a failed group must be disabled before re-enabling".into(),
            )),
        }
    }

    /// `OPERATIONAL` is reached on the first successful dispatch and
    /// promotes every reader.
    pub(crate) fn promote_operational(&mut self, cause: Cause, ctx: &Ctx) -> Result<()> {
        match self.state {
            PubSubState::Operational => Ok(()),
            PubSubState::PreOperational => {
                self.transition(PubSubState::Operational, cause, ctx);
                for r in &mut self.readers {
                    let _ = r.set_state(PubSubState::Operational, cause, ctx);
                }
                Ok(())
            }
            _ => Err(Error::NotSupported(
                "OPERATIONAL is only reachable from PREOPERATIONAL".into(),
            )),
        }
    }

    /// `ERROR`: unregister the tick, cascade to readers.
    pub(crate) fn fail(&mut self, cause: Cause, ctx: &Ctx) {
        if self.state == PubSubState::Error {
            return;
        }
        self.stop_subscribe_callback();
        if self.state.is_enabled() {
            for r in &mut self.readers {
                let _ = r.set_state(PubSubState::Error, cause, ctx);
            }
        }
        self.transition(PubSubState::Error, cause, ctx);
    }

    /// The subscribe tick found the parent connection gone.
    pub(crate) fn fail_orphaned(&mut self, ctx: &Ctx) {
        log::warn!(
            "[ReaderGroup] {} parent connection {} disappeared",
            self.id,
            self.parent
        );
        self.fail(Cause::ConnectionClosed, ctx);
    }

    // ------------------------------------------------------------------
    // Subscribe tick
    // ------------------------------------------------------------------

    fn register_subscribe_callback(
        &mut self,
        parent_id: PubSubId,
        conn_config: &ConnectionConfig,
        ctx: &Ctx,
    ) {
        // Double registration would double-process every datagram.
        debug_assert!(self.subscribe_callback.is_none());
        if self.subscribe_callback.is_some() {
            return;
        }
        let el: Arc<dyn EventLoop> = match &self.config.scheduler {
            Some(custom) => Arc::clone(custom),
            None => Arc::clone(ctx.loop_for(conn_config)),
        };
        let weak = ctx.shared.clone();
        let (cid, gid) = (parent_id, self.id);
        let cb_id = el.add_cyclic_callback(
            self.config.subscribing_interval_ms,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.subscribe_tick(cid, gid);
                }
            }),
        );
        self.subscribe_callback = Some((el, cb_id));
    }

    pub(crate) fn stop_subscribe_callback(&mut self) {
        if let Some((el, id)) = self.subscribe_callback.take() {
            el.remove_callback(id);
        }
    }

    // ------------------------------------------------------------------
    // Freezing
    // ------------------------------------------------------------------

    /// Freeze the configuration. For `FIXED_SIZE` the RT matrix is
    /// validated; a rejected freeze is rolled back completely.
    pub(crate) fn freeze(&mut self, freeze_counter: &mut u32, ctx: &Ctx) -> Result<()> {
        if self.frozen {
            return Ok(());
        }
        *freeze_counter += 1;
        self.frozen = true;
        for r in &mut self.readers {
            r.frozen = true;
        }

        if self.config.rt_level != RtLevel::FixedSize {
            return Ok(());
        }

        if let Err(e) = self.validate_fixed_size() {
            self.unfreeze_into(freeze_counter);
            return Err(e);
        }

        // The offset buffer is rebuilt from the first received frame;
        // until then the group is PreOperational.
        if let Some(r) = self.readers.first_mut() {
            r.offset_buffer = None;
        }
        if self.state == PubSubState::Operational {
            for r in &mut self.readers {
                let _ = r.set_state(PubSubState::PreOperational, Cause::Good, ctx);
            }
            self.transition(PubSubState::PreOperational, Cause::Good, ctx);
        }
        Ok(())
    }

    fn validate_fixed_size(&self) -> Result<()> {
        if self.readers.len() > 1 {
            log::warn!(
                "[ReaderGroup] {} freeze failed: multiple readers in a fixed-size group",
                self.id
            );
            return Err(Error::NotSupported(
                "fixed-size groups take exactly one reader".into(),
            ));
        }
        let Some(reader) = self.readers.first() else {
            return Ok(());
        };

        if self.config.encoding != MessageEncoding::Uadp {
            log::warn!(
                "[ReaderGroup] {} freeze failed: encoding is not RT capable",
                self.id
            );
            return Err(Error::NotSupported(
                "fixed-size mode requires UADP encoding".into(),
            ));
        }

        if !reader.config.publisher_id.is_fixed_size() {
            log::warn!(
                "[ReaderGroup] {} freeze failed: string PublisherId on the fast path",
                self.id
            );
            return Err(Error::NotSupported(
                "string PublisherIds are not RT capable".into(),
            ));
        }

        for (i, field) in reader.config.data_set_meta_data.fields.iter().enumerate() {
            let has_backend = reader
                .config
                .field_targets
                .get(i)
                .and_then(|t| t.external_value.as_ref())
                .is_some();
            if !has_backend {
                log::warn!(
                    "[ReaderGroup] {} freeze failed: field '{}' has no external data source",
                    self.id,
                    field.name
                );
                return Err(Error::NotSupported(
                    "every fixed-size field needs an external data source".into(),
                ));
            }
            match field.data_type {
                DataType::String | DataType::ByteString if field.max_string_length == 0 => {
                    log::warn!(
                        "[ReaderGroup] {} freeze failed: field '{}' has dynamic length",
                        self.id,
                        field.name
                    );
                    return Err(Error::NotSupported(
                        "variable-length fields need a length bound".into(),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Undo a freeze: counter, flags and offset buffers.
    pub(crate) fn unfreeze_into(&mut self, freeze_counter: &mut u32) {
        if !self.frozen {
            return;
        }
        *freeze_counter = freeze_counter.saturating_sub(1);
        self.frozen = false;
        for r in &mut self.readers {
            r.frozen = false;
            r.offset_buffer = None;
        }
    }

    // ------------------------------------------------------------------
    // Encryption keys
    // ------------------------------------------------------------------

    /// Install or roll over the group keys. A changed token id resets the
    /// nonce sequence; the policy context object survives rollover.
    #[cfg(feature = "encryption")]
    pub(crate) fn set_encryption_keys(&mut self, token_id: u32, keys: &KeySet) -> Result<()> {
        if self.config.encoding == MessageEncoding::Json {
            log::warn!(
                "[ReaderGroup] {} key install failed: message security is only \
                 defined for the UADP mapping",
                self.id
            );
            return Err(Error::InternalError(
                "message security is only defined for the UADP mapping".into(),
            ));
        }
        let Some(policy) = self.config.security_policy.clone() else {
            log::warn!(
                "[ReaderGroup] {} key install failed: no security policy configured",
                self.id
            );
            return Err(Error::InternalError(
                "no security policy configured for the group".into(),
            ));
        };

        if token_id != self.security_token_id {
            self.security_token_id = token_id;
            self.nonce_sequence_number = 1;
        }

        match &mut self.security_context {
            None => {
                self.security_context = Some(policy.new_context(keys)?);
            }
            Some(ctx) => ctx.set_keys(keys)?,
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Stop monitors and drop all readers (the group is going away).
    pub(crate) fn teardown_readers(&mut self, _ctx: &Ctx) {
        for r in &mut self.readers {
            r.stop_receive_monitor();
        }
        self.readers.clear();
        #[cfg(feature = "encryption")]
        {
            self.security_context = None;
        }
    }

    /// Remove one reader by index.
    pub(crate) fn remove_reader(&mut self, ri: usize, _ctx: &Ctx) -> Result<()> {
        if self.readers[ri].frozen {
            log::warn!(
                "[Reader] remove {} failed: subscriber configuration is frozen",
                self.readers[ri].id
            );
            return Err(Error::ConfigurationError(
                "subscriber configuration is frozen".into(),
            ));
        }
        let mut reader = self.readers.remove(ri);
        reader.stop_receive_monitor();
        log::info!("[Reader] {} removed from group {}", reader.id, self.id);
        Ok(())
    }

    /// Initiate close of group-owned receive channels; returns how many
    /// closures the event loop will report.
    pub(crate) fn close_channels(&mut self) -> usize {
        let mut n = 0;
        for mut ch in self.recv_channels.drain(..) {
            ch.close();
            n += 1;
        }
        n
    }
}

#[cfg(all(test, feature = "encryption"))]
mod tests {
    use super::*;
    use crate::config::SecurityMode;
    use crate::security::Aes256Sha256Policy;

    fn keys() -> KeySet {
        KeySet::new(vec![0x11; 32], vec![0x22; 32], vec![1, 2, 3, 4])
    }

    fn secure_group() -> ReaderGroup {
        ReaderGroup::new(
            PubSubId(1),
            PubSubId(0),
            ReaderGroupConfig {
                security_mode: SecurityMode::SignAndEncrypt,
                security_policy: Some(Arc::new(Aes256Sha256Policy::new())),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_token_change_resets_nonce_sequence() {
        let mut rg = secure_group();
        rg.set_encryption_keys(1, &keys()).expect("install");
        assert_eq!(rg.security_token_id, 1);
        assert_eq!(rg.nonce_sequence_number, 1);

        rg.nonce_sequence_number = 7;
        rg.set_encryption_keys(1, &keys()).expect("same token");
        assert_eq!(rg.nonce_sequence_number, 7, "same token keeps the sequence");

        rg.set_encryption_keys(2, &keys()).expect("rollover");
        assert_eq!(rg.security_token_id, 2);
        assert_eq!(rg.nonce_sequence_number, 1, "token change resets the sequence");
        assert!(rg.security_context.is_some());
    }

    #[test]
    fn test_key_install_requires_policy() {
        let mut rg = ReaderGroup::new(PubSubId(1), PubSubId(0), ReaderGroupConfig::default());
        assert!(matches!(
            rg.set_encryption_keys(1, &keys()),
            Err(Error::InternalError(_))
        ));
    }

    #[test]
    fn test_unfreeze_without_freeze_is_a_noop() {
        let mut rg = secure_group();
        let mut counter = 3u32;
        rg.unfreeze_into(&mut counter);
        assert_eq!(counter, 3, "an unfrozen group never touches the counter");
    }
}
