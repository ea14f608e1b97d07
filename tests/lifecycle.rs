// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Entity lifecycle integration tests: state cascades, callback ordering
//! and the delayed-deletion protocol.

use huap::config::{profiles, ConnectionConfig, DataSetReaderConfig, FieldMetaData,
    NetworkAddress, ReaderGroupConfig, WriterGroupConfig};
use huap::types::{DataType, PublisherId};
use huap::{
    Cause, Error, EventLoop, LoopbackBus, LoopbackTransport, ManualEventLoop, PubSub, PubSubId,
    PubSubState,
};
use parking_lot::Mutex;
use std::sync::Arc;

const ADDR: &str = "opc.udp://224.0.0.22:4840";

type Events = Arc<Mutex<Vec<(PubSubId, PubSubState, Cause)>>>;

fn stack() -> (PubSub, Arc<ManualEventLoop>, Arc<LoopbackBus>, Events) {
    let el = ManualEventLoop::new();
    let bus = LoopbackBus::new();
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let pubsub = PubSub::builder()
        .event_loop(el.clone())
        .transport(Arc::new(LoopbackTransport::new(
            profiles::UDP_UADP,
            Arc::clone(&bus),
        )))
        .state_change_callback(move |id, state, cause| {
            sink.lock().push((id, state, cause));
        })
        .build();
    (pubsub, el, bus, events)
}

fn conn_cfg(enabled: bool) -> ConnectionConfig {
    ConnectionConfig {
        name: "c1".into(),
        publisher_id: PublisherId::UInt16(7),
        address: NetworkAddress::url(ADDR),
        enabled,
        ..Default::default()
    }
}

fn reader_cfg() -> DataSetReaderConfig {
    DataSetReaderConfig {
        name: "r1".into(),
        publisher_id: PublisherId::UInt16(7),
        writer_group_id: 1,
        data_set_writer_id: 42,
        data_set_meta_data: huap::config::DataSetMetaData {
            name: "ds".into(),
            fields: vec![FieldMetaData::scalar("counter", DataType::Int32)],
            configuration_version: huap::config::ConfigurationVersion { major: 1, minor: 0 },
        },
        field_targets: vec![huap::config::FieldTarget::default()],
        ..Default::default()
    }
}

#[test]
fn test_connection_create_enable_disable() {
    let (ps, _el, _bus, _ev) = stack();
    let c = ps.add_connection(conn_cfg(false)).expect("add connection");
    assert_eq!(ps.connection_state(c).unwrap(), PubSubState::Disabled);

    ps.enable_connection(c).expect("enable");
    // The loopback channel is ready immediately, so enable lands in
    // Operational.
    assert_eq!(ps.connection_state(c).unwrap(), PubSubState::Operational);

    ps.disable_connection(c).expect("disable");
    assert_eq!(ps.connection_state(c).unwrap(), PubSubState::Disabled);
}

#[test]
fn test_connection_enabled_at_create() {
    let (ps, _el, _bus, _ev) = stack();
    let c = ps.add_connection(conn_cfg(true)).expect("add connection");
    assert_eq!(ps.connection_state(c).unwrap(), PubSubState::Operational);
}

#[test]
fn test_add_connection_unknown_transport() {
    let (ps, _el, _bus, _ev) = stack();
    let cfg = ConnectionConfig {
        transport_profile_uri: profiles::ETH_UADP.to_string(),
        ..conn_cfg(false)
    };
    assert!(matches!(ps.add_connection(cfg), Err(Error::NotFound)));
    assert_eq!(ps.connection_count(), 0);
}

#[test]
fn test_remove_unknown_connection_not_found() {
    let (ps, _el, _bus, _ev) = stack();
    let c = ps.add_connection(conn_cfg(false)).expect("add connection");
    ps.remove_connection(c).expect("remove");
    assert!(matches!(ps.remove_connection(c), Err(Error::NotFound)));
}

#[test]
fn test_group_enable_requires_enabled_parent() {
    let (ps, _el, _bus, _ev) = stack();
    let c = ps.add_connection(conn_cfg(false)).expect("add connection");
    let g = ps
        .add_reader_group(c, ReaderGroupConfig::default())
        .expect("add group");
    assert_eq!(ps.reader_group_state(g).unwrap(), PubSubState::Disabled);
    assert!(matches!(
        ps.enable_reader_group(g),
        Err(Error::InternalError(_))
    ));
    assert_eq!(ps.reader_group_state(g).unwrap(), PubSubState::Disabled);
}

#[test]
fn test_group_config_roundtrip_with_defaults() {
    let (ps, _el, _bus, _ev) = stack();
    let c = ps.add_connection(conn_cfg(false)).expect("add connection");
    let g = ps
        .add_reader_group(
            c,
            ReaderGroupConfig {
                name: "g1".into(),
                subscribing_interval_ms: 0,
                timeout_ms: 0,
                ..Default::default()
            },
        )
        .expect("add group");

    let cfg = ps.reader_group_config(g).expect("config");
    assert_eq!(cfg.name, "g1");
    // Defaults applied on the way in.
    assert_eq!(cfg.subscribing_interval_ms, 5);
    assert_eq!(cfg.timeout_ms, 1000);
}

#[test]
fn test_blocking_socket_without_scheduler_rejected() {
    let (ps, _el, _bus, _ev) = stack();
    let c = ps.add_connection(conn_cfg(false)).expect("add connection");
    let cfg = ReaderGroupConfig {
        enable_blocking_socket: true,
        ..Default::default()
    };
    assert!(matches!(
        ps.add_reader_group(c, cfg),
        Err(Error::NotSupported(_))
    ));
}

#[test]
fn test_blocking_socket_with_scheduler_forces_zero_timeout() {
    let (ps, el, _bus, _ev) = stack();
    let scheduler: Arc<dyn EventLoop> = el;
    let c = ps.add_connection(conn_cfg(false)).expect("add connection");
    let g = ps
        .add_reader_group(
            c,
            ReaderGroupConfig {
                enable_blocking_socket: true,
                scheduler: Some(scheduler),
                timeout_ms: 500,
                ..Default::default()
            },
        )
        .expect("add group");
    assert_eq!(ps.reader_group_config(g).unwrap().timeout_ms, 0);
}

#[test]
fn test_unique_ids_across_entity_classes() {
    let (ps, _el, _bus, _ev) = stack();
    let c = ps.add_connection(conn_cfg(true)).expect("add connection");
    let g = ps
        .add_reader_group(c, ReaderGroupConfig::default())
        .expect("add group");
    let r = ps.add_data_set_reader(g, reader_cfg()).expect("add reader");
    let w = ps
        .add_writer_group(c, WriterGroupConfig::default())
        .expect("add writer group");

    let mut ids = vec![c.0, g.0, r.0, w.0];
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4, "identifiers must be unique across classes");
}

#[test]
fn test_disable_cascade_callback_order_children_first() {
    let (ps, _el, _bus, events) = stack();
    let c = ps.add_connection(conn_cfg(true)).expect("add connection");
    let g = ps
        .add_reader_group(c, ReaderGroupConfig::default())
        .expect("add group");
    ps.enable_reader_group(g).expect("enable group");
    let r = ps.add_data_set_reader(g, reader_cfg()).expect("add reader");
    assert_eq!(
        ps.data_set_reader_state(r).unwrap(),
        PubSubState::PreOperational
    );

    events.lock().clear();
    ps.disable_connection(c).expect("disable");

    let ev = events.lock().clone();
    assert_eq!(ev.len(), 3, "reader, group, connection: {:?}", ev);
    assert_eq!(ev[0], (r, PubSubState::Disabled, Cause::ResourceUnavailable));
    assert_eq!(ev[1], (g, PubSubState::Disabled, Cause::ResourceUnavailable));
    assert_eq!(ev[2], (c, PubSubState::Disabled, Cause::Good));
}

#[test]
fn test_parent_child_state_dominance() {
    let (ps, _el, _bus, _ev) = stack();
    let c = ps.add_connection(conn_cfg(true)).expect("add connection");
    let g = ps
        .add_reader_group(c, ReaderGroupConfig::default())
        .expect("add group");
    ps.enable_reader_group(g).expect("enable group");
    let r = ps.add_data_set_reader(g, reader_cfg()).expect("add reader");

    ps.disable_connection(c).expect("disable");
    // P1: children never sit above a disabled parent.
    assert_eq!(ps.reader_group_state(g).unwrap(), PubSubState::Disabled);
    assert_eq!(ps.data_set_reader_state(r).unwrap(), PubSubState::Disabled);
}

#[test]
fn test_remove_connection_removes_children() {
    let (ps, _el, _bus, _ev) = stack();
    let c = ps.add_connection(conn_cfg(true)).expect("add connection");
    let g = ps
        .add_reader_group(c, ReaderGroupConfig::default())
        .expect("add group");
    let r = ps.add_data_set_reader(g, reader_cfg()).expect("add reader");

    ps.remove_connection(c).expect("remove");
    assert!(matches!(ps.connection_state(c), Err(Error::NotFound)));
    assert!(matches!(ps.reader_group_state(g), Err(Error::NotFound)));
    assert!(matches!(ps.data_set_reader_state(r), Err(Error::NotFound)));
}

#[test]
fn test_delayed_free_waits_for_channel_close() {
    let (ps, el, _bus, events) = stack();
    let c = ps.add_connection(conn_cfg(true)).expect("add connection");
    let g = ps
        .add_reader_group(c, ReaderGroupConfig::default())
        .expect("add group");
    ps.enable_reader_group(g).expect("enable group");

    ps.remove_connection(c).expect("remove");

    // Unreachable via the manager, but the memory is still parked until
    // the event loop reports the channel closed.
    assert!(matches!(ps.connection_state(c), Err(Error::NotFound)));
    assert_eq!(ps.pending_teardowns(), 1);
    events.lock().clear();

    // Channel-close completion, then the delayed free.
    el.run_iterate();
    el.run_iterate();
    assert_eq!(ps.pending_teardowns(), 0);

    // No user callback may fire for entities rooted at the removed
    // connection after removal returned.
    let after: Vec<_> = events.lock().clone();
    assert!(
        after.is_empty(),
        "no callbacks after removal, got {:?}",
        after
    );

    // Ticks of the removed group are gone as well.
    el.advance(100);
    assert!(events.lock().is_empty());
}

#[test]
fn test_remove_group_then_recreate() {
    let (ps, _el, _bus, _ev) = stack();
    let c = ps.add_connection(conn_cfg(true)).expect("add connection");
    let g1 = ps
        .add_reader_group(c, ReaderGroupConfig::default())
        .expect("add group");
    ps.remove_reader_group(g1).expect("remove group");
    assert!(matches!(ps.reader_group_state(g1), Err(Error::NotFound)));

    let g2 = ps
        .add_reader_group(c, ReaderGroupConfig::default())
        .expect("re-add group");
    assert_ne!(g1, g2);
}

#[test]
fn test_writer_group_shares_connection_lifecycle() {
    let (ps, _el, _bus, events) = stack();
    let c = ps.add_connection(conn_cfg(true)).expect("add connection");
    let w = ps
        .add_writer_group(c, WriterGroupConfig { name: "wg".into(), ..Default::default() })
        .expect("add writer group");
    assert_eq!(ps.writer_group_state(w).unwrap(), PubSubState::Disabled);

    events.lock().clear();
    ps.remove_connection(c).expect("remove");
    assert!(matches!(ps.writer_group_state(w), Err(Error::NotFound)));
    // Disabled writer group produced no transition on teardown.
    assert!(events.lock().iter().all(|(id, _, _)| *id != w));
}
