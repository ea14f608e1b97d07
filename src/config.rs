// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Configuration types for Connections, ReaderGroups, DataSetReaders and
//! WriterGroups.
//!
//! Configs are plain structs with `Default` impls; the create RPCs
//! deep-copy them into the entity and apply defaults (subscribe interval,
//! socket timeout) on the way in. Once a group is frozen its
//! configuration is immutable until unfreeze.

use crate::event::EventLoop;
use crate::types::{DataType, DataValue, PublisherId};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "encryption")]
use crate::security::SecurityPolicy;

/// Default subscribing interval when the config leaves it at zero.
pub const DEFAULT_SUBSCRIBING_INTERVAL_MS: u64 = 5;
/// Default socket timeout for non-blocking receive channels.
pub const DEFAULT_SOCKET_TIMEOUT_MS: u32 = 1000;

/// Transport profile URIs (OPC UA Part 14, Annex A).
pub mod profiles {
    pub const UDP_UADP: &str = "http://opcfoundation.org/UA-Profile/Transport/pubsub-udp-uadp";
    pub const ETH_UADP: &str = "http://opcfoundation.org/UA-Profile/Transport/pubsub-eth-uadp";
    pub const MQTT_UADP: &str = "http://opcfoundation.org/UA-Profile/Transport/pubsub-mqtt-uadp";
    pub const MQTT_JSON: &str = "http://opcfoundation.org/UA-Profile/Transport/pubsub-mqtt-json";
}

/// Free-form key/value property attached to connections and groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValuePair {
    pub key: String,
    pub value: String,
}

/// Network address of a connection (NetworkAddressUrl in the standard).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkAddress {
    /// Endpoint URL, e.g. `opc.udp://224.0.0.22:4840`.
    pub url: String,
    /// Optional interface name to bind on.
    pub network_interface: Option<String>,
}

impl NetworkAddress {
    #[must_use]
    pub fn url(url: impl Into<String>) -> Self {
        NetworkAddress {
            url: url.into(),
            network_interface: None,
        }
    }
}

/// Connection configuration.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub name: String,
    /// Publisher identity carried in outbound NetworkMessages and used by
    /// readers for type-aware matching.
    pub publisher_id: PublisherId,
    /// Transport profile URI selecting the registered transport.
    pub transport_profile_uri: String,
    pub address: NetworkAddress,
    pub properties: Vec<KeyValuePair>,
    /// Per-connection event loop override; the stack default is used when
    /// unset.
    pub event_loop: Option<Arc<dyn EventLoop>>,
    /// Drive the connection to `PREOPERATIONAL` right after creation.
    pub enabled: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            name: String::new(),
            publisher_id: PublisherId::UInt16(0),
            transport_profile_uri: profiles::UDP_UADP.to_string(),
            address: NetworkAddress::default(),
            properties: Vec::new(),
            event_loop: None,
            enabled: false,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("name", &self.name)
            .field("publisher_id", &self.publisher_id)
            .field("transport_profile_uri", &self.transport_profile_uri)
            .field("address", &self.address)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Real-time level of a ReaderGroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RtLevel {
    /// No layout restrictions, field-by-field dispatch.
    #[default]
    None,
    /// Fixed message layout; decoding runs over a precomputed offset
    /// table into the wire buffer.
    FixedSize,
}

/// NetworkMessage encoding of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageEncoding {
    #[default]
    Uadp,
    Json,
}

/// Message security mode of a ReaderGroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    #[default]
    None,
    Sign,
    SignAndEncrypt,
}

/// Transport settings a group hands to its connection's transport.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GroupTransportSettings {
    /// Share the connection's receive channel.
    #[default]
    Default,
    /// Broker transports (MQTT): the group binds its own receive channel
    /// to a topic.
    Broker {
        /// Topic / queue the group subscribes on.
        queue_name: String,
    },
}

/// ReaderGroup configuration.
#[derive(Clone, Default)]
pub struct ReaderGroupConfig {
    pub name: String,
    /// Subscribe-tick period in milliseconds; 0 selects the default of
    /// [`DEFAULT_SUBSCRIBING_INTERVAL_MS`].
    pub subscribing_interval_ms: u64,
    /// Receive timeout in milliseconds; 0 selects
    /// [`DEFAULT_SOCKET_TIMEOUT_MS`] unless the socket is blocking.
    pub timeout_ms: u32,
    /// Blocking receive sockets stall the shared loop and are only
    /// accepted together with a custom [`scheduler`](Self::scheduler).
    pub enable_blocking_socket: bool,
    /// User-supplied scheduler for the subscribe tick; required for
    /// blocking sockets.
    pub scheduler: Option<Arc<dyn EventLoop>>,
    pub rt_level: RtLevel,
    pub encoding: MessageEncoding,
    pub security_mode: SecurityMode,
    #[cfg(feature = "encryption")]
    pub security_group_id: Option<String>,
    #[cfg(feature = "encryption")]
    pub security_policy: Option<Arc<dyn SecurityPolicy>>,
    pub transport_settings: GroupTransportSettings,
    pub properties: Vec<KeyValuePair>,
}

impl fmt::Debug for ReaderGroupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderGroupConfig")
            .field("name", &self.name)
            .field("subscribing_interval_ms", &self.subscribing_interval_ms)
            .field("timeout_ms", &self.timeout_ms)
            .field("rt_level", &self.rt_level)
            .field("encoding", &self.encoding)
            .field("security_mode", &self.security_mode)
            .finish_non_exhaustive()
    }
}

/// Major/minor configuration version of a DataSet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigurationVersion {
    pub major: u32,
    pub minor: u32,
}

/// Metadata of one DataSet field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMetaData {
    pub name: String,
    pub data_type: DataType,
    /// Upper bound for String/ByteString fields; 0 means unbounded.
    /// `FIXED_SIZE` groups reject unbounded variable-length fields.
    pub max_string_length: u32,
}

impl FieldMetaData {
    #[must_use]
    pub fn scalar(name: impl Into<String>, data_type: DataType) -> Self {
        FieldMetaData {
            name: name.into(),
            data_type,
            max_string_length: 0,
        }
    }
}

/// DataSet metadata: the published layout a reader expects.
///
/// A metadata block with zero fields and version 0/0 declares a
/// heartbeat reader: it expects empty keyframes and touches no target
/// variables.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataSetMetaData {
    pub name: String,
    pub fields: Vec<FieldMetaData>,
    pub configuration_version: ConfigurationVersion,
}

impl DataSetMetaData {
    /// True when this metadata declares a heartbeat reader.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.fields.is_empty()
            && self.configuration_version.major == 0
            && self.configuration_version.minor == 0
    }
}

/// Shared cell backing a target variable. The receive path writes decoded
/// values here; the application reads them out (or registers the cell
/// with its own sampling machinery).
pub type ExternalDataValue = Arc<RwLock<DataValue>>;

/// Create a fresh external data-value cell.
#[must_use]
pub fn external_value() -> ExternalDataValue {
    Arc::new(RwLock::new(DataValue::default()))
}

/// Binding of one DataSet field (positional, aligned with
/// [`DataSetMetaData::fields`]) to its target storage.
#[derive(Clone, Default)]
pub struct FieldTarget {
    /// External storage cell. Required for `FIXED_SIZE` groups; without
    /// it the slow path skips the field.
    pub external_value: Option<ExternalDataValue>,
}

impl FieldTarget {
    #[must_use]
    pub fn external(cell: ExternalDataValue) -> Self {
        FieldTarget {
            external_value: Some(cell),
        }
    }
}

impl fmt::Debug for FieldTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldTarget")
            .field("external", &self.external_value.is_some())
            .finish()
    }
}

/// UADP message settings of a DataSetReader. Static layout pinning
/// (`network_message_number` / `data_set_offset`) is not supported and is
/// reset to zero on creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReaderMessageSettings {
    pub group_version: u32,
    pub network_message_number: u16,
    pub data_set_offset: u16,
}

/// DataSetReader configuration.
#[derive(Clone)]
pub struct DataSetReaderConfig {
    pub name: String,
    /// Expected PublisherId (type-aware match).
    pub publisher_id: PublisherId,
    pub writer_group_id: u16,
    pub data_set_writer_id: u16,
    pub data_set_meta_data: DataSetMetaData,
    /// Target bindings, positional with the metadata fields.
    pub field_targets: Vec<FieldTarget>,
    /// Receive-timeout monitoring: without a message for this long the
    /// reader is driven to `ERROR` with cause `Timeout`. `None` disables
    /// monitoring.
    pub message_receive_timeout_ms: Option<u64>,
    pub message_settings: ReaderMessageSettings,
}

impl Default for DataSetReaderConfig {
    fn default() -> Self {
        DataSetReaderConfig {
            name: String::new(),
            publisher_id: PublisherId::UInt16(0),
            writer_group_id: 0,
            data_set_writer_id: 0,
            data_set_meta_data: DataSetMetaData::default(),
            field_targets: Vec::new(),
            message_receive_timeout_ms: None,
            message_settings: ReaderMessageSettings::default(),
        }
    }
}

impl fmt::Debug for DataSetReaderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSetReaderConfig")
            .field("name", &self.name)
            .field("publisher_id", &self.publisher_id)
            .field("writer_group_id", &self.writer_group_id)
            .field("data_set_writer_id", &self.data_set_writer_id)
            .field("fields", &self.data_set_meta_data.fields.len())
            .finish_non_exhaustive()
    }
}

/// WriterGroup configuration. The publish-side algorithms live elsewhere;
/// the group participates in the connection lifecycle only.
#[derive(Debug, Clone, Default)]
pub struct WriterGroupConfig {
    pub name: String,
    pub writer_group_id: u16,
    pub publishing_interval_ms: u64,
    pub properties: Vec<KeyValuePair>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_metadata() {
        let md = DataSetMetaData::default();
        assert!(md.is_heartbeat());

        let md = DataSetMetaData {
            fields: vec![FieldMetaData::scalar("f", DataType::Int32)],
            ..Default::default()
        };
        assert!(!md.is_heartbeat());

        let md = DataSetMetaData {
            configuration_version: ConfigurationVersion { major: 1, minor: 0 },
            ..Default::default()
        };
        assert!(!md.is_heartbeat());
    }

    #[test]
    fn test_field_target_external() {
        let cell = external_value();
        let t = FieldTarget::external(Arc::clone(&cell));
        assert!(t.external_value.is_some());
        assert!(FieldTarget::default().external_value.is_none());
    }
}
