// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory loopback transport.
//!
//! All channels created from one [`LoopbackBus`] share a broadcast
//! domain: a datagram sent (or injected) on an address is queued for
//! every open channel on that address, emulating a multicast group.
//! Topic-bound channels get their own per-topic queues.

use super::{Channel, ChannelState, TransportFactory};
use crate::config::ConnectionConfig;
use crate::pubsub::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

type Queue = Arc<Mutex<VecDeque<Vec<u8>>>>;

struct BusState {
    /// address (or address#topic) -> receive queues of open channels
    endpoints: HashMap<String, Vec<Queue>>,
    /// Simulated link state; while down, channels report `Opening`.
    link_up: bool,
}

/// Shared broadcast domain for loopback channels.
pub struct LoopbackBus {
    state: Mutex<BusState>,
}

impl LoopbackBus {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(LoopbackBus {
            state: Mutex::new(BusState {
                endpoints: HashMap::new(),
                link_up: true,
            }),
        })
    }

    /// Simulate the link coming up or going down. While down, channels
    /// report [`ChannelState::Opening`] and neither send nor receive.
    pub fn set_link_up(&self, up: bool) {
        self.state.lock().link_up = up;
    }

    fn link_up(&self) -> bool {
        self.state.lock().link_up
    }

    /// Inject a raw datagram on an address, as if a remote publisher had
    /// sent it. Every open channel on the address receives a copy.
    pub fn inject(&self, address: &str, datagram: &[u8]) {
        let st = self.state.lock();
        if let Some(queues) = st.endpoints.get(address) {
            for q in queues {
                q.lock().push_back(datagram.to_vec());
            }
        }
    }

    /// Inject a datagram on a topic endpoint (broker emulation).
    pub fn inject_topic(&self, address: &str, topic: &str, datagram: &[u8]) {
        self.inject(&format!("{}#{}", address, topic), datagram);
    }

    fn attach(&self, endpoint: &str) -> Queue {
        let q: Queue = Arc::new(Mutex::new(VecDeque::new()));
        self.state
            .lock()
            .endpoints
            .entry(endpoint.to_string())
            .or_default()
            .push(Arc::clone(&q));
        q
    }

    fn detach(&self, endpoint: &str, q: &Queue) {
        let mut st = self.state.lock();
        if let Some(queues) = st.endpoints.get_mut(endpoint) {
            queues.retain(|other| !Arc::ptr_eq(other, q));
            if queues.is_empty() {
                st.endpoints.remove(endpoint);
            }
        }
    }
}

struct LoopbackChannel {
    bus: Arc<LoopbackBus>,
    endpoint: String,
    rx: Queue,
    closed: bool,
}

impl Channel for LoopbackChannel {
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        if !self.bus.link_up() {
            return Err(Error::Transport("link down".into()));
        }
        self.bus.inject(&self.endpoint, payload);
        Ok(())
    }

    fn receive(&mut self, _timeout_ms: u32) -> Vec<Vec<u8>> {
        if self.state() != ChannelState::Ready {
            return Vec::new();
        }
        let mut q = self.rx.lock();
        q.drain(..).collect()
    }

    fn state(&self) -> ChannelState {
        if self.closed {
            ChannelState::Closed
        } else if self.bus.link_up() {
            ChannelState::Ready
        } else {
            ChannelState::Opening
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.bus.detach(&self.endpoint, &self.rx);
        }
        self.closed = true;
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Loopback transport factory. Registered under an arbitrary profile URI
/// so tests can stand in for UDP or MQTT transports.
pub struct LoopbackTransport {
    profile: String,
    bus: Arc<LoopbackBus>,
    topic_binding: bool,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new(profile: impl Into<String>, bus: Arc<LoopbackBus>) -> Self {
        LoopbackTransport {
            profile: profile.into(),
            bus,
            topic_binding: false,
        }
    }

    /// Loopback emulating a broker: ReaderGroups must bind topics.
    #[must_use]
    pub fn with_topic_binding(profile: impl Into<String>, bus: Arc<LoopbackBus>) -> Self {
        LoopbackTransport {
            profile: profile.into(),
            bus,
            topic_binding: true,
        }
    }
}

impl TransportFactory for LoopbackTransport {
    fn profile(&self) -> &str {
        &self.profile
    }

    fn open(&self, cfg: &ConnectionConfig) -> Result<Box<dyn Channel>> {
        if cfg.address.url.is_empty() {
            return Err(Error::InvalidArgument("connection address is empty".into()));
        }
        let endpoint = cfg.address.url.clone();
        let rx = self.bus.attach(&endpoint);
        Ok(Box::new(LoopbackChannel {
            bus: Arc::clone(&self.bus),
            endpoint,
            rx,
            closed: false,
        }))
    }

    fn requires_topic_binding(&self) -> bool {
        self.topic_binding
    }

    fn open_receive(&self, cfg: &ConnectionConfig, topic: &str) -> Result<Box<dyn Channel>> {
        let endpoint = format!("{}#{}", cfg.address.url, topic);
        let rx = self.bus.attach(&endpoint);
        Ok(Box::new(LoopbackChannel {
            bus: Arc::clone(&self.bus),
            endpoint,
            rx,
            closed: false,
        }))
    }
}
