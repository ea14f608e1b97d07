// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Freeze / real-time configuration tests: the FIXED_SIZE compatibility
//! matrix, freeze-counter gating and the offset-buffer fast path.

use huap::config::{
    external_value, profiles, ConfigurationVersion, ConnectionConfig, DataSetMetaData,
    DataSetReaderConfig, ExternalDataValue, FieldMetaData, FieldTarget, NetworkAddress,
    ReaderGroupConfig, RtLevel,
};
use huap::message::{
    uadp, DataSetMessage, DataSetMessageHeader, DataSetPayload, FieldEncoding, GroupHeader,
    NetworkMessage, PayloadHeader, RawPayload,
};
use huap::types::{DataType, PublisherId, Variant};
use huap::{Error, LoopbackBus, LoopbackTransport, ManualEventLoop, PubSub, PubSubState};
use std::sync::Arc;

const ADDR: &str = "opc.udp://224.0.0.22:4840";

fn stack() -> (PubSub, Arc<ManualEventLoop>, Arc<LoopbackBus>) {
    let el = ManualEventLoop::new();
    let bus = LoopbackBus::new();
    let pubsub = PubSub::builder()
        .event_loop(el.clone())
        .transport(Arc::new(LoopbackTransport::new(
            profiles::UDP_UADP,
            Arc::clone(&bus),
        )))
        .build();
    (pubsub, el, bus)
}

fn conn_cfg() -> ConnectionConfig {
    ConnectionConfig {
        name: "c1".into(),
        publisher_id: PublisherId::UInt16(7),
        address: NetworkAddress::url(ADDR),
        enabled: true,
        ..Default::default()
    }
}

fn rt_group_cfg() -> ReaderGroupConfig {
    ReaderGroupConfig {
        name: "rt".into(),
        subscribing_interval_ms: 10,
        rt_level: RtLevel::FixedSize,
        ..Default::default()
    }
}

fn rt_reader_cfg(fields: Vec<FieldMetaData>, targets: Vec<FieldTarget>) -> DataSetReaderConfig {
    DataSetReaderConfig {
        name: "r1".into(),
        publisher_id: PublisherId::UInt16(7),
        writer_group_id: 1,
        data_set_writer_id: 42,
        data_set_meta_data: DataSetMetaData {
            name: "ds".into(),
            fields,
            configuration_version: ConfigurationVersion { major: 1, minor: 0 },
        },
        field_targets: targets,
        ..Default::default()
    }
}

fn int32_reader(cell: &ExternalDataValue) -> DataSetReaderConfig {
    rt_reader_cfg(
        vec![FieldMetaData::scalar("counter", DataType::Int32)],
        vec![FieldTarget::external(Arc::clone(cell))],
    )
}

/// Raw-encoded frame carrying one Int32.
fn raw_frame(value: i32) -> Vec<u8> {
    let nm = NetworkMessage {
        publisher_id: Some(PublisherId::UInt16(7)),
        group_header: Some(GroupHeader {
            writer_group_id: Some(1),
            ..Default::default()
        }),
        payload_header: Some(PayloadHeader {
            data_set_writer_ids: vec![42],
        }),
        messages: vec![DataSetMessage {
            header: DataSetMessageHeader {
                valid: true,
                field_encoding: FieldEncoding::RawData,
                ..Default::default()
            },
            payload: DataSetPayload::Raw(RawPayload {
                offset_in_datagram: 0,
                bytes: value.to_le_bytes().to_vec(),
            }),
        }],
        ..Default::default()
    };
    uadp::encode(&nm).expect("encode")
}

#[test]
fn test_freeze_counter_blocks_new_groups() {
    let (ps, _el, _bus) = stack();
    let c = ps.add_connection(conn_cfg()).expect("add connection");
    let g1 = ps
        .add_reader_group(c, ReaderGroupConfig::default())
        .expect("add g1");
    let _g2 = ps
        .add_reader_group(c, ReaderGroupConfig::default())
        .expect("add g2");

    ps.freeze_reader_group(g1).expect("freeze");

    // Any non-zero freeze counter on the connection blocks creation.
    assert!(matches!(
        ps.add_reader_group(c, ReaderGroupConfig::default()),
        Err(Error::ConfigurationError(_))
    ));

    ps.unfreeze_reader_group(g1).expect("unfreeze");
    ps.add_reader_group(c, ReaderGroupConfig::default())
        .expect("counter back to zero, creation allowed");
}

#[test]
fn test_freeze_is_idempotent() {
    let (ps, _el, _bus) = stack();
    let c = ps.add_connection(conn_cfg()).expect("add connection");
    let g = ps
        .add_reader_group(c, ReaderGroupConfig::default())
        .expect("add group");
    ps.freeze_reader_group(g).expect("freeze");
    ps.freeze_reader_group(g).expect("freeze again");
    ps.unfreeze_reader_group(g).expect("unfreeze");
    // A single unfreeze clears a doubly-requested freeze.
    ps.add_reader_group(c, ReaderGroupConfig::default())
        .expect("creation allowed again");
}

#[test]
fn test_frozen_group_rejects_structural_changes() {
    let (ps, _el, _bus) = stack();
    let c = ps.add_connection(conn_cfg()).expect("add connection");
    let g = ps
        .add_reader_group(c, ReaderGroupConfig::default())
        .expect("add group");
    let cell = external_value();
    let r = ps.add_data_set_reader(g, int32_reader(&cell)).expect("add reader");
    ps.freeze_reader_group(g).expect("freeze");

    assert!(matches!(
        ps.add_data_set_reader(g, int32_reader(&cell)),
        Err(Error::ConfigurationError(_))
    ));
    assert!(matches!(
        ps.remove_reader_group(g),
        Err(Error::ConfigurationError(_))
    ));
    assert!(matches!(
        ps.remove_data_set_reader(r),
        Err(Error::ConfigurationError(_))
    ));
    assert!(matches!(
        ps.update_data_set_reader(r, &int32_reader(&cell)),
        Err(Error::ConfigurationError(_))
    ));
    assert!(matches!(
        ps.create_target_variables(r, vec![FieldTarget::external(cell)]),
        Err(Error::ConfigurationError(_))
    ));

    ps.unfreeze_reader_group(g).expect("unfreeze");
    ps.remove_reader_group(g).expect("removable again");
}

#[test]
fn test_fixed_size_rejects_two_readers() {
    let (ps, _el, _bus) = stack();
    let c = ps.add_connection(conn_cfg()).expect("add connection");
    let g = ps.add_reader_group(c, rt_group_cfg()).expect("add group");
    let cell = external_value();
    ps.add_data_set_reader(g, int32_reader(&cell)).expect("r1");
    ps.add_data_set_reader(g, int32_reader(&cell)).expect("r2");

    assert!(matches!(
        ps.freeze_reader_group(g),
        Err(Error::NotSupported(_))
    ));
    // The rejected freeze left no trace: creation is not blocked.
    ps.add_reader_group(c, ReaderGroupConfig::default())
        .expect("freeze counter untouched");
}

#[test]
fn test_fixed_size_rejects_unbounded_string() {
    let (ps, _el, _bus) = stack();
    let c = ps.add_connection(conn_cfg()).expect("add connection");
    let g = ps.add_reader_group(c, rt_group_cfg()).expect("add group");
    let cell = external_value();
    ps.add_data_set_reader(
        g,
        rt_reader_cfg(
            vec![FieldMetaData {
                name: "label".into(),
                data_type: DataType::String,
                max_string_length: 0,
            }],
            vec![FieldTarget::external(Arc::clone(&cell))],
        ),
    )
    .expect("add reader");

    assert!(matches!(
        ps.freeze_reader_group(g),
        Err(Error::NotSupported(_))
    ));
}

#[test]
fn test_fixed_size_accepts_bounded_string() {
    let (ps, _el, _bus) = stack();
    let c = ps.add_connection(conn_cfg()).expect("add connection");
    let g = ps.add_reader_group(c, rt_group_cfg()).expect("add group");
    let cell = external_value();
    ps.add_data_set_reader(
        g,
        rt_reader_cfg(
            vec![FieldMetaData {
                name: "label".into(),
                data_type: DataType::String,
                max_string_length: 16,
            }],
            vec![FieldTarget::external(Arc::clone(&cell))],
        ),
    )
    .expect("add reader");

    ps.freeze_reader_group(g).expect("bounded strings are RT capable");
}

#[test]
fn test_fixed_size_rejects_missing_backend() {
    let (ps, _el, _bus) = stack();
    let c = ps.add_connection(conn_cfg()).expect("add connection");
    let g = ps.add_reader_group(c, rt_group_cfg()).expect("add group");
    ps.add_data_set_reader(
        g,
        rt_reader_cfg(
            vec![FieldMetaData::scalar("counter", DataType::Int32)],
            vec![FieldTarget::default()],
        ),
    )
    .expect("add reader");

    assert!(matches!(
        ps.freeze_reader_group(g),
        Err(Error::NotSupported(_))
    ));
}

#[test]
fn test_fixed_size_rejects_string_publisher_id() {
    let (ps, _el, _bus) = stack();
    let c = ps.add_connection(conn_cfg()).expect("add connection");
    let g = ps.add_reader_group(c, rt_group_cfg()).expect("add group");
    let cell = external_value();
    let mut cfg = int32_reader(&cell);
    cfg.publisher_id = PublisherId::String("press-17".into());
    ps.add_data_set_reader(g, cfg).expect("add reader");

    assert!(matches!(
        ps.freeze_reader_group(g),
        Err(Error::NotSupported(_))
    ));
}

#[test]
fn test_rt_fast_path_end_to_end() {
    let (ps, el, bus) = stack();
    let c = ps.add_connection(conn_cfg()).expect("add connection");
    let g = ps.add_reader_group(c, rt_group_cfg()).expect("add group");
    let cell = external_value();
    let r = ps.add_data_set_reader(g, int32_reader(&cell)).expect("add reader");

    ps.freeze_reader_group(g).expect("freeze");
    ps.enable_reader_group(g).expect("enable");
    assert_eq!(ps.reader_group_state(g).unwrap(), PubSubState::PreOperational);

    // First frame: full decode, offset table built, states promote.
    bus.inject(ADDR, &raw_frame(99));
    el.advance(10);
    assert_eq!(cell.read().value, Some(Variant::Int32(99)));
    assert_eq!(ps.reader_group_state(g).unwrap(), PubSubState::Operational);
    assert_eq!(ps.data_set_reader_state(r).unwrap(), PubSubState::Operational);

    // Subsequent frames run through the precomputed offsets.
    bus.inject(ADDR, &raw_frame(100));
    el.advance(10);
    assert_eq!(cell.read().value, Some(Variant::Int32(100)));

    bus.inject(ADDR, &raw_frame(-7));
    el.advance(10);
    assert_eq!(cell.read().value, Some(Variant::Int32(-7)));
}

#[test]
fn test_freeze_demotes_operational_group() {
    let (ps, el, bus) = stack();
    let c = ps.add_connection(conn_cfg()).expect("add connection");
    let g = ps.add_reader_group(c, rt_group_cfg()).expect("add group");
    let cell = external_value();
    ps.add_data_set_reader(g, int32_reader(&cell)).expect("add reader");
    ps.enable_reader_group(g).expect("enable");

    bus.inject(ADDR, &raw_frame(1));
    el.advance(10);
    assert_eq!(ps.reader_group_state(g).unwrap(), PubSubState::Operational);

    // Freezing clears the layout; the group waits for the first frame
    // again.
    ps.freeze_reader_group(g).expect("freeze");
    assert_eq!(ps.reader_group_state(g).unwrap(), PubSubState::PreOperational);

    bus.inject(ADDR, &raw_frame(2));
    el.advance(10);
    assert_eq!(ps.reader_group_state(g).unwrap(), PubSubState::Operational);
    assert_eq!(cell.read().value, Some(Variant::Int32(2)));
}
