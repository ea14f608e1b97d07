// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! WriterGroup: the publish-side sibling of the ReaderGroup.
//!
//! Send-side algorithms (publish callbacks, message batching) live
//! outside this crate; the group exists here so the shared connection
//! lifecycle has something to cascade into and so identifier uniqueness
//! spans both sides.

use super::{Cause, Ctx, Error, PubSubId, PubSubState, Result};
use crate::config::WriterGroupConfig;

pub(crate) struct WriterGroup {
    pub(crate) id: PubSubId,
    #[allow(dead_code)]
    pub(crate) parent: PubSubId,
    pub(crate) config: WriterGroupConfig,
    pub(crate) state: PubSubState,
}

impl WriterGroup {
    pub(crate) fn new(id: PubSubId, parent: PubSubId, config: WriterGroupConfig) -> Self {
        WriterGroup {
            id,
            parent,
            config,
            state: PubSubState::Disabled,
        }
    }

    fn transition(&mut self, new: PubSubState, cause: Cause, ctx: &Ctx) {
        if self.state != new {
            log::info!(
                "[WriterGroup] {} ('{}') {} -> {}",
                self.id,
                self.config.name,
                self.state,
                new
            );
            self.state = new;
            ctx.notify(self.id, new, cause);
        }
    }

    pub(crate) fn set_state(
        &mut self,
        target: PubSubState,
        cause: Cause,
        ctx: &Ctx,
    ) -> Result<()> {
        match target {
            PubSubState::Disabled | PubSubState::Error => {
                self.transition(target, cause, ctx);
                Ok(())
            }
            PubSubState::Paused => match self.state {
                PubSubState::Disabled | PubSubState::Paused => {
                    self.transition(PubSubState::Paused, cause, ctx);
                    Ok(())
                }
                _ => Err(Error::NotSupported(
                    "PAUSED is only reachable from DISABLED".into(),
                )),
            },
            PubSubState::PreOperational => {
                self.transition(PubSubState::PreOperational, cause, ctx);
                Ok(())
            }
            PubSubState::Operational => match self.state {
                PubSubState::PreOperational | PubSubState::Operational => {
                    self.transition(PubSubState::Operational, cause, ctx);
                    Ok(())
                }
                _ => Err(Error::NotSupported(
                    "OPERATIONAL is only reachable from PREOPERATIONAL".into(),
                )),
            },
        }
    }
}
