// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # HUAP - High-performance UA PubSub
//!
//! A pure Rust implementation of the OPC UA PubSub (IEC 62541 Part 14)
//! subscribe side: connection management, ReaderGroups, DataSetReaders,
//! the UADP/JSON receive pipeline and optional message security.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use huap::{PubSub, ManualEventLoop, LoopbackBus, LoopbackTransport};
//! use huap::config::{profiles, ConnectionConfig, NetworkAddress, ReaderGroupConfig};
//! use huap::types::PublisherId;
//! use std::sync::Arc;
//!
//! let el = ManualEventLoop::new();
//! let bus = LoopbackBus::new();
//! let pubsub = PubSub::builder()
//!     .event_loop(el.clone())
//!     .transport(Arc::new(LoopbackTransport::new(profiles::UDP_UADP, bus)))
//!     .build();
//!
//! let conn = pubsub.add_connection(ConnectionConfig {
//!     name: "plant".into(),
//!     publisher_id: PublisherId::UInt16(7),
//!     address: NetworkAddress::url("opc.udp://224.0.0.22:4840"),
//!     enabled: true,
//!     ..Default::default()
//! })?;
//! let group = pubsub.add_reader_group(conn, ReaderGroupConfig::default())?;
//! pubsub.enable_reader_group(group)?;
//! # Ok::<(), huap::Error>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------------------------------------------+
//! |                       Management API                             |
//! |   PubSub -> Connection -> ReaderGroup -> DataSetReader           |
//! +------------------------------------------------------------------+
//! |                      Receive pipeline                            |
//! |   decode headers | select group | verify+decrypt | dispatch      |
//! +------------------------------------------------------------------+
//! |                       Message codecs                             |
//! |          UADP binary (Part 14) | JSON mapping                    |
//! +------------------------------------------------------------------+
//! |                   Event loop + transports                        |
//! |   cyclic ticks, delayed frees | pluggable channels by URI        |
//! +------------------------------------------------------------------+
//! ```
//!
//! ## Concurrency model
//!
//! One process-wide service mutex serializes configuration RPCs against
//! event-loop callbacks; the entity graph has no finer-grained locks.
//! Periodic work runs on an [`event::EventLoop`]; the bundled
//! [`ManualEventLoop`] is single-threaded and virtual-time, which makes
//! interval behavior exactly reproducible.
//!
//! ## Feature flags
//!
//! - `encryption` (default) - message security and the policy SPI
//! - `sks` - shared key storage per security group
//! - `json` (default) - the JSON NetworkMessage mapping

/// Configuration types for connections, groups and readers.
pub mod config;
/// Event-loop interface and the bundled deterministic implementation.
pub mod event;
/// NetworkMessage / DataSetMessage model and codecs.
pub mod message;
/// The PubSub entity graph, state machines and receive pipeline.
pub mod pubsub;
/// Message security SPI and the bundled reference policy.
#[cfg(feature = "encryption")]
pub mod security;
/// Pluggable transport surface and the in-memory loopback transport.
pub mod transport;
/// Built-in scalar value model for DataSet fields.
pub mod types;

pub use event::{CallbackId, EventLoop, ManualEventLoop};
pub use pubsub::{
    Cause, Error, PubSub, PubSubBuilder, PubSubId, PubSubState, Result, StateChangeCallback,
};
pub use transport::{Channel, ChannelState, LoopbackBus, LoopbackTransport, TransportFactory};

#[cfg(feature = "encryption")]
pub use security::{Aes256Sha256Policy, KeySet, PolicyContext, SecurityPolicy};
