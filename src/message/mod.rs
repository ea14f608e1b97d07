// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! NetworkMessage / DataSetMessage model.
//!
//! The two-level framing of Part 14: a NetworkMessage carries headers
//! (identification, group, payload layout, security) around one or more
//! DataSetMessages, each with its own header and field data. The binary
//! UADP mapping lives in [`uadp`], the JSON mapping in [`json`].

pub mod uadp;

#[cfg(feature = "json")]
pub mod json;

use crate::types::{DataValue, PublisherId};

/// UADP protocol version emitted and accepted by this stack.
pub const UADP_VERSION: u8 = 1;

/// Group-level header of a NetworkMessage.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupHeader {
    pub writer_group_id: Option<u16>,
    pub group_version: Option<u32>,
    pub network_message_number: Option<u16>,
    pub sequence_number: Option<u16>,
}

/// Payload header: the DataSetWriterIds of the contained messages, in
/// payload order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PayloadHeader {
    pub data_set_writer_ids: Vec<u16>,
}

/// Security header of a signed and/or encrypted NetworkMessage.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecurityHeader {
    pub signed: bool,
    pub encrypted: bool,
    pub footer_enabled: bool,
    pub token_id: u32,
    pub message_nonce: Vec<u8>,
    pub footer_size: u16,
}

/// Type of a DataSetMessage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSetMessageType {
    #[default]
    KeyFrame,
    DeltaFrame,
    Event,
    KeepAlive,
}

/// Field encoding of a DataSetMessage payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldEncoding {
    #[default]
    Variant,
    RawData,
    DataValue,
}

/// Header of one DataSetMessage.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataSetMessageHeader {
    pub valid: bool,
    pub field_encoding: FieldEncoding,
    pub message_type: DataSetMessageType,
    pub sequence_number: Option<u16>,
    pub timestamp: Option<i64>,
    pub picoseconds: Option<u16>,
    pub status: Option<u16>,
    pub config_version_major: Option<u32>,
    pub config_version_minor: Option<u32>,
}

/// Raw (fixed-layout) keyframe payload. The byte offset of the region
/// within the datagram is kept so a frozen reader can precompute its
/// field offset table from the first frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawPayload {
    pub offset_in_datagram: usize,
    pub bytes: Vec<u8>,
}

/// Decoded field data of a DataSetMessage.
#[derive(Debug, Clone, PartialEq)]
pub enum DataSetPayload {
    /// Variant- or DataValue-encoded keyframe: positional values.
    KeyFrame(Vec<DataValue>),
    /// Raw keyframe: undecoded field bytes, interpreted against the
    /// reader's metadata.
    Raw(RawPayload),
    /// Name-keyed fields (JSON mapping).
    #[cfg(feature = "json")]
    NamedFields(Vec<(String, DataValue)>),
}

impl Default for DataSetPayload {
    fn default() -> Self {
        DataSetPayload::KeyFrame(Vec::new())
    }
}

impl DataSetPayload {
    /// Number of fields carried, where known (raw payloads are opaque
    /// until matched against metadata).
    #[must_use]
    pub fn field_count(&self) -> Option<usize> {
        match self {
            DataSetPayload::KeyFrame(v) => Some(v.len()),
            DataSetPayload::Raw(_) => None,
            #[cfg(feature = "json")]
            DataSetPayload::NamedFields(v) => Some(v.len()),
        }
    }
}

/// One DataSetMessage.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataSetMessage {
    pub header: DataSetMessageHeader,
    pub payload: DataSetPayload,
}

impl DataSetMessage {
    /// A valid keyframe with Variant-encoded values.
    #[must_use]
    pub fn key_frame(values: Vec<DataValue>) -> Self {
        DataSetMessage {
            header: DataSetMessageHeader {
                valid: true,
                ..Default::default()
            },
            payload: DataSetPayload::KeyFrame(values),
        }
    }
}

/// A decoded (or to-be-encoded) NetworkMessage.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NetworkMessage {
    pub publisher_id: Option<PublisherId>,
    pub data_set_class_id: Option<[u8; 16]>,
    pub group_header: Option<GroupHeader>,
    pub payload_header: Option<PayloadHeader>,
    pub timestamp: Option<i64>,
    pub picoseconds: Option<u16>,
    pub security_header: Option<SecurityHeader>,
    pub messages: Vec<DataSetMessage>,
}

impl NetworkMessage {
    /// DataSetWriterId announced for message `index`, when a payload
    /// header is present.
    #[must_use]
    pub fn writer_id_at(&self, index: usize) -> Option<u16> {
        self.payload_header
            .as_ref()
            .and_then(|ph| ph.data_set_writer_ids.get(index).copied())
    }
}
