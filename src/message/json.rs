// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! JSON NetworkMessage mapping (Part 14 Sec.7.2.3 subset).
//!
//! A `ua-data` document carries PublisherId, optional WriterGroupId and
//! an array of DataSetMessages whose payload is a name-keyed object.
//! Field values decode to the closest JSON-representable variant; the
//! dispatch path coerces them onto the reader's metadata types. Message
//! security is not defined for the JSON mapping.

use super::{
    DataSetMessage, DataSetMessageHeader, DataSetPayload, GroupHeader, NetworkMessage,
    PayloadHeader,
};
use crate::pubsub::{Error, Result};
use crate::types::{DataValue, PublisherId, Variant};
use serde_json::{json, Map, Value};

fn bad(msg: impl Into<String>) -> Error {
    Error::Decode(msg.into())
}

fn publisher_id_from_json(v: &Value) -> Result<PublisherId> {
    match v {
        Value::String(s) => Ok(PublisherId::String(s.clone())),
        Value::Number(n) => {
            let n = n
                .as_u64()
                .ok_or_else(|| bad("PublisherId must be an unsigned integer or string"))?;
            Ok(if n <= u64::from(u8::MAX) {
                PublisherId::Byte(n as u8)
            } else if n <= u64::from(u16::MAX) {
                PublisherId::UInt16(n as u16)
            } else if n <= u64::from(u32::MAX) {
                PublisherId::UInt32(n as u32)
            } else {
                PublisherId::UInt64(n)
            })
        }
        _ => Err(bad("PublisherId must be an unsigned integer or string")),
    }
}

fn variant_from_json(v: &Value) -> Result<Variant> {
    match v {
        Value::Bool(b) => Ok(Variant::Boolean(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Variant::Int64(i))
            } else if let Some(u) = n.as_u64() {
                Ok(Variant::UInt64(u))
            } else {
                Ok(Variant::Double(n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        Value::String(s) => Ok(Variant::String(s.clone())),
        _ => Err(bad("unsupported JSON field value")),
    }
}

fn variant_to_json(v: &Variant) -> Value {
    match v {
        Variant::Boolean(b) => json!(b),
        Variant::SByte(x) => json!(x),
        Variant::Byte(x) => json!(x),
        Variant::Int16(x) => json!(x),
        Variant::UInt16(x) => json!(x),
        Variant::Int32(x) => json!(x),
        Variant::UInt32(x) => json!(x),
        Variant::Int64(x) => json!(x),
        Variant::UInt64(x) => json!(x),
        Variant::Float(x) => json!(x),
        Variant::Double(x) => json!(x),
        Variant::String(s) => json!(s),
        Variant::ByteString(b) => {
            // Part 6 JSON mapping encodes ByteString as base64; plain hex
            // keeps the dependency footprint down and round-trips.
            json!(b.iter().map(|x| format!("{:02x}", x)).collect::<String>())
        }
    }
}

/// Decode a JSON `ua-data` NetworkMessage.
pub fn decode(buf: &[u8]) -> Result<NetworkMessage> {
    let doc: Value =
        serde_json::from_slice(buf).map_err(|e| bad(format!("invalid JSON: {}", e)))?;
    let obj = doc.as_object().ok_or_else(|| bad("top level must be an object"))?;

    let mtype = obj
        .get("MessageType")
        .and_then(Value::as_str)
        .ok_or_else(|| bad("missing MessageType"))?;
    if mtype != "ua-data" {
        return Err(bad(format!("unsupported MessageType '{}'", mtype)));
    }

    let mut nm = NetworkMessage {
        publisher_id: Some(publisher_id_from_json(
            obj.get("PublisherId").ok_or_else(|| bad("missing PublisherId"))?,
        )?),
        ..Default::default()
    };

    if let Some(wgid) = obj.get("WriterGroupId").and_then(Value::as_u64) {
        nm.group_header = Some(GroupHeader {
            writer_group_id: Some(wgid as u16),
            ..Default::default()
        });
    }

    let messages = obj
        .get("Messages")
        .and_then(Value::as_array)
        .ok_or_else(|| bad("missing Messages array"))?;

    let mut writer_ids = Vec::with_capacity(messages.len());
    for m in messages {
        let m = m.as_object().ok_or_else(|| bad("message must be an object"))?;
        let writer_id = m
            .get("DataSetWriterId")
            .and_then(Value::as_u64)
            .ok_or_else(|| bad("missing DataSetWriterId"))? as u16;
        writer_ids.push(writer_id);

        let mut header = DataSetMessageHeader {
            valid: true,
            ..Default::default()
        };
        if let Some(sn) = m.get("SequenceNumber").and_then(Value::as_u64) {
            header.sequence_number = Some(sn as u16);
        }
        if let Some(st) = m.get("Status").and_then(Value::as_u64) {
            header.status = Some(st as u16);
        }
        if let Some(md) = m.get("MetaDataVersion").and_then(Value::as_object) {
            header.config_version_major =
                md.get("MajorVersion").and_then(Value::as_u64).map(|v| v as u32);
            header.config_version_minor =
                md.get("MinorVersion").and_then(Value::as_u64).map(|v| v as u32);
        }

        let payload = m
            .get("Payload")
            .and_then(Value::as_object)
            .map(|p| {
                p.iter()
                    .map(|(name, value)| {
                        Ok((name.clone(), DataValue::from_variant(variant_from_json(value)?)))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        nm.messages.push(DataSetMessage {
            header,
            payload: DataSetPayload::NamedFields(payload),
        });
    }

    nm.payload_header = Some(PayloadHeader {
        data_set_writer_ids: writer_ids,
    });
    Ok(nm)
}

/// Encode a NetworkMessage as a JSON `ua-data` document. Only name-keyed
/// payloads are representable.
pub fn encode(nm: &NetworkMessage) -> Result<Vec<u8>> {
    let publisher = match &nm.publisher_id {
        Some(PublisherId::String(s)) => json!(s),
        Some(PublisherId::Byte(v)) => json!(v),
        Some(PublisherId::UInt16(v)) => json!(v),
        Some(PublisherId::UInt32(v)) => json!(v),
        Some(PublisherId::UInt64(v)) => json!(v),
        None => return Err(Error::InternalError("JSON mapping requires a PublisherId".into())),
    };

    let mut messages = Vec::with_capacity(nm.messages.len());
    for (i, dsm) in nm.messages.iter().enumerate() {
        let fields = match &dsm.payload {
            DataSetPayload::NamedFields(fields) => fields,
            _ => {
                return Err(Error::InternalError(
                    "JSON mapping requires name-keyed payloads".into(),
                ))
            }
        };
        let mut payload = Map::new();
        for (name, dv) in fields {
            if let Some(v) = &dv.value {
                payload.insert(name.clone(), variant_to_json(v));
            }
        }
        let mut msg = Map::new();
        msg.insert(
            "DataSetWriterId".into(),
            json!(nm.writer_id_at(i).unwrap_or(0)),
        );
        if let Some(sn) = dsm.header.sequence_number {
            msg.insert("SequenceNumber".into(), json!(sn));
        }
        msg.insert("Payload".into(), Value::Object(payload));
        messages.push(Value::Object(msg));
    }

    let mut doc = Map::new();
    doc.insert("MessageType".into(), json!("ua-data"));
    doc.insert("PublisherId".into(), publisher);
    if let Some(wgid) = nm.group_header.as_ref().and_then(|gh| gh.writer_group_id) {
        doc.insert("WriterGroupId".into(), json!(wgid));
    }
    doc.insert("Messages".into(), Value::Array(messages));

    serde_json::to_vec(&Value::Object(doc))
        .map_err(|e| Error::InternalError(format!("JSON encode failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_basic_document() {
        let doc = br#"{
            "MessageType": "ua-data",
            "PublisherId": 7,
            "WriterGroupId": 1,
            "Messages": [
                {"DataSetWriterId": 42, "SequenceNumber": 3, "Payload": {"counter": 99}}
            ]
        }"#;
        let nm = decode(doc).expect("decode");
        assert_eq!(nm.publisher_id, Some(PublisherId::Byte(7)));
        assert_eq!(nm.writer_id_at(0), Some(42));
        assert_eq!(
            nm.group_header.as_ref().and_then(|g| g.writer_group_id),
            Some(1)
        );
        match &nm.messages[0].payload {
            DataSetPayload::NamedFields(fields) => {
                assert_eq!(fields[0].0, "counter");
                assert_eq!(fields[0].1.value, Some(Variant::Int64(99)));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_wrong_message_type() {
        let doc = br#"{"MessageType": "ua-metadata", "PublisherId": 1, "Messages": []}"#;
        assert!(matches!(decode(doc), Err(Error::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_missing_writer_id() {
        let doc = br#"{"MessageType": "ua-data", "PublisherId": 1,
                       "Messages": [{"Payload": {}}]}"#;
        assert!(matches!(decode(doc), Err(Error::Decode(_))));
    }

    #[test]
    fn test_roundtrip() {
        let nm = NetworkMessage {
            publisher_id: Some(PublisherId::String("press-17".into())),
            payload_header: Some(PayloadHeader {
                data_set_writer_ids: vec![9],
            }),
            messages: vec![DataSetMessage {
                header: DataSetMessageHeader {
                    valid: true,
                    sequence_number: Some(8),
                    ..Default::default()
                },
                payload: DataSetPayload::NamedFields(vec![(
                    "temperature".into(),
                    DataValue::from_variant(Variant::Double(21.5)),
                )]),
            }],
            ..Default::default()
        };
        let buf = encode(&nm).expect("encode");
        let out = decode(&buf).expect("decode");
        assert_eq!(out.publisher_id, Some(PublisherId::String("press-17".into())));
        assert_eq!(out.writer_id_at(0), Some(9));
        match &out.messages[0].payload {
            DataSetPayload::NamedFields(fields) => {
                assert_eq!(fields[0].0, "temperature");
                assert_eq!(fields[0].1.value, Some(Variant::Double(21.5)));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
