// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pluggable transport surface.
//!
//! A transport is selected per connection by its profile URI
//! ([`crate::config::profiles`]). The PubSub layer only sees channels: an
//! abstract send/receive pair whose lifetime is tied to the connection
//! (or, for broker transports, to an individual ReaderGroup bound to a
//! topic). Real socket handling lives with the embedding; this crate
//! ships only the in-memory [`loopback`] transport.

pub mod loopback;

use crate::config::ConnectionConfig;
use crate::pubsub::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

pub use loopback::{LoopbackBus, LoopbackTransport};

/// Readiness of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Opened but the link is not established yet; the owning connection
    /// stays `PREOPERATIONAL` until the transport reports `Ready`.
    Opening,
    /// Open and usable.
    Ready,
    /// Close initiated; completion is reported through the event loop.
    Closing,
    Closed,
}

/// A bidirectional transport channel.
///
/// `receive` is pull-style: the subscribe tick drains whatever datagrams
/// arrived since the last call. Push transports invoke
/// [`crate::PubSub::process`] from their own callback instead.
pub trait Channel: Send {
    fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Drain pending datagrams, waiting up to `timeout_ms` (0 blocks, if
    /// the transport supports blocking at all).
    fn receive(&mut self, timeout_ms: u32) -> Vec<Vec<u8>>;

    fn state(&self) -> ChannelState;

    /// Initiate close. Completion is observed by the owner via the event
    /// loop's delayed-callback path.
    fn close(&mut self);
}

/// Factory for channels of one transport profile.
pub trait TransportFactory: Send + Sync {
    /// Profile URI this factory serves.
    fn profile(&self) -> &str;

    /// Open the connection's primary channel (send plus default receive).
    fn open(&self, cfg: &ConnectionConfig) -> Result<Box<dyn Channel>>;

    /// Broker transports bind receive channels per topic and return true
    /// here; ReaderGroup creation then calls [`open_receive`].
    ///
    /// [`open_receive`]: TransportFactory::open_receive
    fn requires_topic_binding(&self) -> bool {
        false
    }

    /// Open a group-owned receive channel bound to `topic`.
    fn open_receive(&self, _cfg: &ConnectionConfig, topic: &str) -> Result<Box<dyn Channel>> {
        Err(Error::NotSupported(format!(
            "transport does not support topic binding ('{}')",
            topic
        )))
    }
}

/// Registry of transport factories, keyed by profile URI.
#[derive(Default)]
pub struct TransportRegistry {
    factories: HashMap<String, Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
    #[must_use]
    pub fn new() -> Self {
        TransportRegistry {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, factory: Arc<dyn TransportFactory>) {
        self.factories.insert(factory.profile().to_string(), factory);
    }

    /// Look up the factory for a profile URI.
    pub fn find(&self, profile_uri: &str) -> Result<&Arc<dyn TransportFactory>> {
        self.factories.get(profile_uri).ok_or(Error::NotFound)
    }
}
