// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PubSub connection: one transport endpoint parenting reader and writer
//! groups.
//!
//! The connection runs the top level of the state cascade. Entering
//! `DISABLED`/`ERROR` drives every child group to the same state with
//! cause `ResourceUnavailable`; entering `PRE`/`OPERATIONAL` never
//! auto-promotes children, it only (re)opens transport channels --
//! including receive channels a newly added group needs, which is why
//! `connect` stays idempotent.

use super::writer_group::WriterGroup;
use super::{Cause, Ctx, Error, PubSubId, PubSubState, Result};
use crate::config::{ConnectionConfig, GroupTransportSettings};
use crate::pubsub::reader_group::ReaderGroup;
use crate::transport::{Channel, ChannelState};

pub(crate) struct Connection {
    pub(crate) id: PubSubId,
    pub(crate) config: ConnectionConfig,
    pub(crate) state: PubSubState,
    /// Newest group first (head insertion).
    pub(crate) reader_groups: Vec<ReaderGroup>,
    pub(crate) writer_groups: Vec<WriterGroup>,
    /// Number of frozen reader groups parented here. While non-zero, no
    /// new group may be added.
    pub(crate) freeze_counter: u32,
    pub(crate) delete_flag: bool,
    /// Primary channel (send plus default receive).
    pub(crate) channel: Option<Box<dyn Channel>>,
    /// Channels whose close completion is still outstanding (set while
    /// the connection sits in the graveyard).
    pub(crate) pending_channel_closures: usize,
}

impl Connection {
    pub(crate) fn new(id: PubSubId, config: ConnectionConfig) -> Self {
        Connection {
            id,
            config,
            state: PubSubState::Disabled,
            reader_groups: Vec::new(),
            writer_groups: Vec::new(),
            freeze_counter: 0,
            delete_flag: false,
            channel: None,
            pending_channel_closures: 0,
        }
    }

    pub(crate) fn reader_group_index(&self, id: PubSubId) -> Option<usize> {
        self.reader_groups.iter().position(|g| g.id == id)
    }

    fn transition(&mut self, new: PubSubState, cause: Cause, ctx: &Ctx) {
        if self.state != new {
            log::info!("[Connection] {} {} -> {}", self.id, self.state, new);
            self.state = new;
            ctx.notify(self.id, new, cause);
        }
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    pub(crate) fn set_state(
        &mut self,
        target: PubSubState,
        cause: Cause,
        ctx: &Ctx,
    ) -> Result<()> {
        match target {
            PubSubState::Disabled => self.state_disable(cause, ctx),
            PubSubState::Paused => self.state_pause(cause, ctx),
            PubSubState::PreOperational | PubSubState::Operational => {
                self.state_enable(target, cause, ctx)
            }
            PubSubState::Error => {
                self.state_error(cause, ctx);
                Ok(())
            }
        }
    }

    fn state_disable(&mut self, cause: Cause, ctx: &Ctx) -> Result<()> {
        if self.state == PubSubState::Disabled {
            return Ok(());
        }
        if self.state.is_enabled() {
            self.cascade_children(PubSubState::Disabled, Cause::ResourceUnavailable, ctx);
        }
        if let Some(mut ch) = self.channel.take() {
            ch.close();
        }
        self.transition(PubSubState::Disabled, cause, ctx);
        Ok(())
    }

    fn state_pause(&mut self, cause: Cause, ctx: &Ctx) -> Result<()> {
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

    fn state_enable(&mut self, target: PubSubState, cause: Cause, ctx: &Ctx) -> Result<()> {
        match self.state {
            PubSubState::Disabled | PubSubState::Paused | PubSubState::Error => {
                let ready = self.connect(ctx)?;
                let new = if ready {
                    PubSubState::Operational
                } else {
                    PubSubState::PreOperational
                };
                self.transition(new, cause, ctx);
                Ok(())
            }
            PubSubState::PreOperational => {
                // Idempotent connect: may open additional receive
                // channels for newly added groups.
                let ready = self.connect(ctx)?;
                if target == PubSubState::Operational {
                    if !ready {
                        return Err(Error::InternalError(
                            "transport channel not ready".into(),
                        ));
                    }
                    // Children are not auto-promoted.
                    self.transition(PubSubState::Operational, cause, ctx);
                }
                Ok(())
            }
            PubSubState::Operational => {
                let _ = self.connect(ctx)?;
                Ok(())
            }
        }
    }

    fn state_error(&mut self, cause: Cause, ctx: &Ctx) {
        if self.state == PubSubState::Error {
            return;
        }
        if self.state.is_enabled() {
            self.cascade_children(PubSubState::Error, Cause::ResourceUnavailable, ctx);
        }
        self.transition(PubSubState::Error, cause, ctx);
    }

    fn cascade_children(&mut self, target: PubSubState, cause: Cause, ctx: &Ctx) {
        let Connection {
            writer_groups,
            reader_groups,
            ..
        } = self;
        for wg in writer_groups.iter_mut() {
            let _ = wg.set_state(target, cause, ctx);
        }
        for rg in reader_groups.iter_mut() {
            match target {
                PubSubState::Disabled => rg.disable(cause, ctx),
                PubSubState::Error => rg.fail(cause, ctx),
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    /// Open the transport. Idempotent: an existing channel is kept, and
    /// receive channels of broker-bound groups are opened as needed.
    /// Returns whether the primary channel is ready. Failure drives the
    /// connection to `ERROR` with the failure as cause.
    pub(crate) fn connect(&mut self, ctx: &Ctx) -> Result<bool> {
        let factory = match ctx.transports.find(&self.config.transport_profile_uri) {
            Ok(f) => f,
            Err(e) => {
                log::error!(
                    "[Connection] {} connect failed: no transport for '{}'",
                    self.id,
                    self.config.transport_profile_uri
                );
                let cause = e.as_cause();
                self.state_error(cause, ctx);
                return Err(e);
            }
        };

        if self.channel.is_none() {
            match factory.open(&self.config) {
                Ok(ch) => self.channel = Some(ch),
                Err(e) => {
                    log::error!("[Connection] {} transport open failed: {}", self.id, e);
                    let cause = e.as_cause();
                    self.state_error(cause, ctx);
                    return Err(e);
                }
            }
        }

        if factory.requires_topic_binding() {
            let mut open_err = None;
            let Connection {
                id,
                config,
                reader_groups,
                ..
            } = &mut *self;
            for rg in reader_groups.iter_mut() {
                if !rg.recv_channels.is_empty() {
                    continue;
                }
                if let GroupTransportSettings::Broker { queue_name } =
                    &rg.config.transport_settings
                {
                    match factory.open_receive(config, queue_name) {
                        Ok(ch) => {
                            log::debug!(
                                "[Connection] {} opened receive channel for group {} \
                                 (topic '{}')",
                                id,
                                rg.id,
                                queue_name
                            );
                            rg.recv_channels.push(ch);
                        }
                        Err(e) => {
                            log::error!(
                                "[Connection] {} receive channel for group {} failed: {}",
                                id,
                                rg.id,
                                e
                            );
                            open_err = Some(e);
                            break;
                        }
                    }
                }
            }
            if let Some(e) = open_err {
                let cause = e.as_cause();
                self.state_error(cause, ctx);
                return Err(e);
            }
        }

        Ok(self
            .channel
            .as_ref()
            .is_some_and(|c| c.state() == ChannelState::Ready))
    }

    /// Drain inbound datagrams for the tick of group `gi`: the group's
    /// own channels when it has any, else the shared primary channel.
    pub(crate) fn drain_for_group(&mut self, gi: usize) -> Vec<Vec<u8>> {
        let Connection {
            reader_groups,
            channel,
            ..
        } = self;
        let rg = &mut reader_groups[gi];
        let timeout = rg.config.timeout_ms;
        if !rg.recv_channels.is_empty() {
            let mut out = Vec::new();
            for ch in rg.recv_channels.iter_mut() {
                out.extend(ch.receive(timeout));
            }
            out
        } else if let Some(ch) = channel.as_mut() {
            ch.receive(timeout)
        } else {
            Vec::new()
        }
    }

    /// Initiate close of the primary channel; returns how many closures
    /// the event loop will report.
    pub(crate) fn close_channels(&mut self) -> usize {
        let mut n = 0;
        if let Some(mut ch) = self.channel.take() {
            ch.close();
            n += 1;
        }
        n
    }

    // ------------------------------------------------------------------
    // ReaderGroup plumbing that needs connection context
    // ------------------------------------------------------------------

    pub(crate) fn set_reader_group_state(
        &mut self,
        gi: usize,
        target: PubSubState,
        cause: Cause,
        ctx: &Ctx,
    ) -> Result<()> {
        let Connection {
            id,
            state,
            config,
            reader_groups,
            ..
        } = self;
        let rg = &mut reader_groups[gi];
        match target {
            PubSubState::Disabled => {
                rg.disable(cause, ctx);
                Ok(())
            }
            PubSubState::Paused => rg.pause(cause, ctx),
            PubSubState::PreOperational => rg.enable(*id, *state, config, ctx),
            PubSubState::Operational => rg.promote_operational(cause, ctx),
            PubSubState::Error => {
                rg.fail(cause, ctx);
                Ok(())
            }
        }
    }

    pub(crate) fn freeze_reader_group(&mut self, gi: usize, ctx: &Ctx) -> Result<()> {
        let Connection {
            freeze_counter,
            reader_groups,
            ..
        } = self;
        reader_groups[gi].freeze(freeze_counter, ctx)
    }

    pub(crate) fn unfreeze_reader_group(&mut self, gi: usize) {
        let Connection {
            freeze_counter,
            reader_groups,
            ..
        } = self;
        reader_groups[gi].unfreeze_into(freeze_counter);
    }
}
