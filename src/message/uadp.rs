// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UADP binary mapping (Part 14 Sec.7.2.2 subset).
//!
//! Little-endian throughout. Supported: publisher id (all five types),
//! group header, payload header, timestamp/picoseconds, security header,
//! keyframe DataSetMessages in Variant, DataValue and RawData field
//! encoding. Not supported: chunking, promoted fields, delta frames --
//! these decode to an error, never to garbage.
//!
//! Decoding is split into the three pipeline stages: headers, payload,
//! footers. `pos` always advances past whatever was consumed so a
//! datagram holding several NetworkMessages can be processed in a loop.

use super::{
    DataSetMessage, DataSetMessageHeader, DataSetMessageType, DataSetPayload, FieldEncoding,
    GroupHeader, NetworkMessage, PayloadHeader, RawPayload, SecurityHeader, UADP_VERSION,
};
use crate::pubsub::{Error, Result};
use crate::types::{DataValue, PublisherId, Variant};

// UADPFlags
const F_PUBLISHER_ID: u8 = 0x10;
const F_GROUP_HEADER: u8 = 0x20;
const F_PAYLOAD_HEADER: u8 = 0x40;
const F_EXTENDED1: u8 = 0x80;
// ExtendedFlags1
const E1_PID_TYPE_MASK: u8 = 0x07;
const E1_DATASET_CLASS_ID: u8 = 0x08;
const E1_SECURITY: u8 = 0x10;
const E1_TIMESTAMP: u8 = 0x20;
const E1_PICOSECONDS: u8 = 0x40;
const E1_EXTENDED2: u8 = 0x80;
// GroupFlags
const G_WRITER_GROUP_ID: u8 = 0x01;
const G_GROUP_VERSION: u8 = 0x02;
const G_NETWORK_MESSAGE_NUMBER: u8 = 0x04;
const G_SEQUENCE_NUMBER: u8 = 0x08;
// SecurityFlags
const S_SIGNED: u8 = 0x01;
const S_ENCRYPTED: u8 = 0x02;
const S_FOOTER: u8 = 0x04;
// DataSetFlags1
const D1_VALID: u8 = 0x01;
const D1_ENCODING_SHIFT: u8 = 1;
const D1_ENCODING_MASK: u8 = 0x06;
const D1_SEQUENCE_NUMBER: u8 = 0x08;
const D1_STATUS: u8 = 0x10;
const D1_CFG_MAJOR: u8 = 0x20;
const D1_CFG_MINOR: u8 = 0x40;
const D1_FLAGS2: u8 = 0x80;
// DataSetFlags2
const D2_TYPE_MASK: u8 = 0x0F;
const D2_TIMESTAMP: u8 = 0x10;
const D2_PICOSECONDS: u8 = 0x20;
// DataValue encoding mask
const DV_VALUE: u8 = 0x01;
const DV_STATUS: u8 = 0x02;
const DV_SOURCE_TS: u8 = 0x04;

fn short(what: &str) -> Error {
    Error::Decode(format!("buffer too short reading {}", what))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Reader { buf, pos }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        let b = *self.buf.get(self.pos).ok_or_else(|| short(what))?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(short(what));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u16(&mut self, what: &str) -> Result<u16> {
        let b = self.bytes(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        let b = self.bytes(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        let b = self.bytes(8, what)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }

    fn i64(&mut self, what: &str) -> Result<i64> {
        Ok(self.u64(what)? as i64)
    }

    fn ua_string(&mut self, what: &str) -> Result<String> {
        let len = self.u32(what)? as i32;
        if len <= 0 {
            return Ok(String::new());
        }
        let bytes = self.bytes(len as usize, what)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Decode(format!("invalid UTF-8 in {}", what)))
    }

    fn ua_byte_string(&mut self, what: &str) -> Result<Vec<u8>> {
        let len = self.u32(what)? as i32;
        if len <= 0 {
            return Ok(Vec::new());
        }
        Ok(self.bytes(len as usize, what)?.to_vec())
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.u64(v as u64);
    }

    fn raw(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn ua_string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.raw(s.as_bytes());
    }

    fn ua_byte_string(&mut self, s: &[u8]) {
        self.u32(s.len() as u32);
        self.raw(s);
    }
}

// ============================================================================
// Variant / DataValue field coding
// ============================================================================

fn decode_variant(r: &mut Reader) -> Result<Variant> {
    let mask = r.u8("variant encoding mask")?;
    if mask & 0xC0 != 0 {
        return Err(Error::Decode("array variants are not supported".into()));
    }
    let dt = crate::types::DataType::from_type_id(mask & 0x3F)
        .ok_or_else(|| Error::Decode(format!("unknown variant type id {}", mask & 0x3F)))?;
    use crate::types::DataType as T;
    Ok(match dt {
        T::Boolean => Variant::Boolean(r.u8("Boolean")? != 0),
        T::SByte => Variant::SByte(r.u8("SByte")? as i8),
        T::Byte => Variant::Byte(r.u8("Byte")?),
        T::Int16 => Variant::Int16(r.u16("Int16")? as i16),
        T::UInt16 => Variant::UInt16(r.u16("UInt16")?),
        T::Int32 => Variant::Int32(r.u32("Int32")? as i32),
        T::UInt32 => Variant::UInt32(r.u32("UInt32")?),
        T::Int64 => Variant::Int64(r.i64("Int64")?),
        T::UInt64 => Variant::UInt64(r.u64("UInt64")?),
        T::Float => Variant::Float(f32::from_le_bytes({
            let b = r.bytes(4, "Float")?;
            [b[0], b[1], b[2], b[3]]
        })),
        T::Double => Variant::Double(f64::from_le_bytes({
            let b = r.bytes(8, "Double")?;
            let mut a = [0u8; 8];
            a.copy_from_slice(b);
            a
        })),
        T::String => Variant::String(r.ua_string("String")?),
        T::ByteString => Variant::ByteString(r.ua_byte_string("ByteString")?),
    })
}

fn encode_variant(w: &mut Writer, v: &Variant) {
    w.u8(v.data_type().type_id());
    encode_variant_value(w, v);
}

/// Value bytes without the encoding mask (raw field encoding reuses this).
fn encode_variant_value(w: &mut Writer, v: &Variant) {
    match v {
        Variant::Boolean(b) => w.u8(u8::from(*b)),
        Variant::SByte(x) => w.u8(*x as u8),
        Variant::Byte(x) => w.u8(*x),
        Variant::Int16(x) => w.u16(*x as u16),
        Variant::UInt16(x) => w.u16(*x),
        Variant::Int32(x) => w.u32(*x as u32),
        Variant::UInt32(x) => w.u32(*x),
        Variant::Int64(x) => w.u64(*x as u64),
        Variant::UInt64(x) => w.u64(*x),
        Variant::Float(x) => w.raw(&x.to_le_bytes()),
        Variant::Double(x) => w.raw(&x.to_le_bytes()),
        Variant::String(s) => w.ua_string(s),
        Variant::ByteString(s) => w.ua_byte_string(s),
    }
}

fn decode_data_value(r: &mut Reader) -> Result<DataValue> {
    let mask = r.u8("DataValue encoding mask")?;
    if mask & !(DV_VALUE | DV_STATUS | DV_SOURCE_TS) != 0 {
        return Err(Error::Decode(format!(
            "unsupported DataValue encoding mask {:#04x}",
            mask
        )));
    }
    let mut dv = DataValue::default();
    if mask & DV_VALUE != 0 {
        dv.value = Some(decode_variant(r)?);
    }
    if mask & DV_STATUS != 0 {
        dv.status = Some(r.u32("DataValue status")?);
    }
    if mask & DV_SOURCE_TS != 0 {
        dv.source_timestamp = Some(r.i64("DataValue source timestamp")?);
    }
    Ok(dv)
}

fn encode_data_value(w: &mut Writer, dv: &DataValue) {
    let mut mask = 0u8;
    if dv.value.is_some() {
        mask |= DV_VALUE;
    }
    if dv.status.is_some() {
        mask |= DV_STATUS;
    }
    if dv.source_timestamp.is_some() {
        mask |= DV_SOURCE_TS;
    }
    w.u8(mask);
    if let Some(v) = &dv.value {
        encode_variant(w, v);
    }
    if let Some(s) = dv.status {
        w.u32(s);
    }
    if let Some(ts) = dv.source_timestamp {
        w.i64(ts);
    }
}

// ============================================================================
// Header decoding
// ============================================================================

/// Decode the NetworkMessage headers starting at `*pos`. Leaves `*pos` at
/// the first payload byte (the sizes array or the first DataSetMessage).
pub fn decode_headers(buf: &[u8], pos: &mut usize) -> Result<NetworkMessage> {
    let mut r = Reader::new(buf, *pos);
    let flags = r.u8("UADP flags")?;
    let version = flags & 0x0F;
    if version != UADP_VERSION {
        return Err(Error::Decode(format!("unsupported UADP version {}", version)));
    }

    let ext1 = if flags & F_EXTENDED1 != 0 {
        r.u8("extended flags 1")?
    } else {
        0
    };
    if ext1 & E1_EXTENDED2 != 0 {
        // Chunked messages and promoted fields live behind ExtendedFlags2.
        return Err(Error::Decode("extended flags 2 not supported".into()));
    }

    let mut nm = NetworkMessage::default();

    if flags & F_PUBLISHER_ID != 0 {
        nm.publisher_id = Some(match ext1 & E1_PID_TYPE_MASK {
            0 => PublisherId::Byte(r.u8("publisher id")?),
            1 => PublisherId::UInt16(r.u16("publisher id")?),
            2 => PublisherId::UInt32(r.u32("publisher id")?),
            3 => PublisherId::UInt64(r.u64("publisher id")?),
            4 => PublisherId::String(r.ua_string("publisher id")?),
            other => {
                return Err(Error::Decode(format!("unknown publisher id type {}", other)))
            }
        });
    }

    if ext1 & E1_DATASET_CLASS_ID != 0 {
        let b = r.bytes(16, "dataset class id")?;
        let mut id = [0u8; 16];
        id.copy_from_slice(b);
        nm.data_set_class_id = Some(id);
    }

    if flags & F_GROUP_HEADER != 0 {
        let gf = r.u8("group flags")?;
        let mut gh = GroupHeader::default();
        if gf & G_WRITER_GROUP_ID != 0 {
            gh.writer_group_id = Some(r.u16("writer group id")?);
        }
        if gf & G_GROUP_VERSION != 0 {
            gh.group_version = Some(r.u32("group version")?);
        }
        if gf & G_NETWORK_MESSAGE_NUMBER != 0 {
            gh.network_message_number = Some(r.u16("network message number")?);
        }
        if gf & G_SEQUENCE_NUMBER != 0 {
            gh.sequence_number = Some(r.u16("sequence number")?);
        }
        nm.group_header = Some(gh);
    }

    if flags & F_PAYLOAD_HEADER != 0 {
        let count = r.u8("payload message count")?;
        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ids.push(r.u16("dataset writer id")?);
        }
        nm.payload_header = Some(PayloadHeader {
            data_set_writer_ids: ids,
        });
    }

    if ext1 & E1_TIMESTAMP != 0 {
        nm.timestamp = Some(r.i64("timestamp")?);
    }
    if ext1 & E1_PICOSECONDS != 0 {
        nm.picoseconds = Some(r.u16("picoseconds")?);
    }

    if ext1 & E1_SECURITY != 0 {
        let sf = r.u8("security flags")?;
        let token_id = r.u32("security token id")?;
        let nonce_len = r.u8("nonce length")?;
        let nonce = r.bytes(nonce_len as usize, "message nonce")?.to_vec();
        let footer_size = if sf & S_FOOTER != 0 {
            r.u16("security footer size")?
        } else {
            0
        };
        nm.security_header = Some(SecurityHeader {
            signed: sf & S_SIGNED != 0,
            encrypted: sf & S_ENCRYPTED != 0,
            footer_enabled: sf & S_FOOTER != 0,
            token_id,
            message_nonce: nonce,
            footer_size,
        });
    }

    *pos = r.pos;
    Ok(nm)
}

// ============================================================================
// Payload / footer decoding
// ============================================================================

fn decode_dsm_header(r: &mut Reader) -> Result<DataSetMessageHeader> {
    let f1 = r.u8("dataset flags 1")?;
    let mut hdr = DataSetMessageHeader {
        valid: f1 & D1_VALID != 0,
        field_encoding: match (f1 & D1_ENCODING_MASK) >> D1_ENCODING_SHIFT {
            0 => FieldEncoding::Variant,
            1 => FieldEncoding::RawData,
            2 => FieldEncoding::DataValue,
            other => {
                return Err(Error::Decode(format!("unknown field encoding {}", other)))
            }
        },
        ..Default::default()
    };

    let f2 = if f1 & D1_FLAGS2 != 0 {
        r.u8("dataset flags 2")?
    } else {
        0
    };
    hdr.message_type = match f2 & D2_TYPE_MASK {
        0 => DataSetMessageType::KeyFrame,
        1 => DataSetMessageType::DeltaFrame,
        2 => DataSetMessageType::Event,
        3 => DataSetMessageType::KeepAlive,
        other => return Err(Error::Decode(format!("unknown dataset message type {}", other))),
    };

    if f1 & D1_SEQUENCE_NUMBER != 0 {
        hdr.sequence_number = Some(r.u16("dsm sequence number")?);
    }
    if f2 & D2_TIMESTAMP != 0 {
        hdr.timestamp = Some(r.i64("dsm timestamp")?);
    }
    if f2 & D2_PICOSECONDS != 0 {
        hdr.picoseconds = Some(r.u16("dsm picoseconds")?);
    }
    if f1 & D1_STATUS != 0 {
        hdr.status = Some(r.u16("dsm status")?);
    }
    if f1 & D1_CFG_MAJOR != 0 {
        hdr.config_version_major = Some(r.u32("dsm config major")?);
    }
    if f1 & D1_CFG_MINOR != 0 {
        hdr.config_version_minor = Some(r.u32("dsm config minor")?);
    }
    Ok(hdr)
}

/// Decode one DataSetMessage. `limit` is the exclusive end of the message
/// within the buffer (raw payloads run to the limit; the other encodings
/// are self-delimiting).
fn decode_dsm(buf: &[u8], pos: &mut usize, limit: usize) -> Result<DataSetMessage> {
    let mut r = Reader::new(&buf[..limit], *pos);
    let header = decode_dsm_header(&mut r)?;
    if header.message_type != DataSetMessageType::KeyFrame {
        return Err(Error::Decode(
            "only keyframe DataSetMessages are supported".into(),
        ));
    }

    let payload = match header.field_encoding {
        FieldEncoding::RawData => {
            let start = r.pos;
            let len = limit.checked_sub(start).ok_or_else(|| short("raw payload"))?;
            let bytes = r.bytes(len, "raw payload")?.to_vec();
            DataSetPayload::Raw(RawPayload {
                offset_in_datagram: start,
                bytes,
            })
        }
        FieldEncoding::Variant => {
            let count = r.u16("field count")?;
            let mut values = Vec::with_capacity(count as usize);
            for _ in 0..count {
                values.push(DataValue::from_variant(decode_variant(&mut r)?));
            }
            DataSetPayload::KeyFrame(values)
        }
        FieldEncoding::DataValue => {
            let count = r.u16("field count")?;
            let mut values = Vec::with_capacity(count as usize);
            for _ in 0..count {
                values.push(decode_data_value(&mut r)?);
            }
            DataSetPayload::KeyFrame(values)
        }
    };

    *pos = r.pos;
    Ok(DataSetMessage { header, payload })
}

/// Decode the payload (sizes array plus DataSetMessages) into `nm`.
///
/// With a payload header announcing more than one message the sizes array
/// delimits them; a single message runs to the end of the buffer minus
/// the security footer.
pub fn decode_payload(buf: &[u8], pos: &mut usize, nm: &mut NetworkMessage) -> Result<()> {
    let count = nm
        .payload_header
        .as_ref()
        .map_or(1, |ph| ph.data_set_writer_ids.len());
    let footer_size = nm
        .security_header
        .as_ref()
        .map_or(0, |sh| sh.footer_size as usize);

    if count > 1 {
        let mut r = Reader::new(buf, *pos);
        let mut sizes = Vec::with_capacity(count);
        for _ in 0..count {
            sizes.push(r.u16("payload sizes")? as usize);
        }
        *pos = r.pos;
        for size in sizes {
            let limit = pos
                .checked_add(size)
                .filter(|&end| end <= buf.len())
                .ok_or_else(|| short("dataset message"))?;
            let start = *pos;
            nm.messages.push(decode_dsm(buf, pos, limit)?);
            // The announced size wins over how much the decoder consumed.
            *pos = start + size;
        }
    } else {
        let limit = buf
            .len()
            .checked_sub(footer_size)
            .ok_or_else(|| short("security footer"))?;
        nm.messages.push(decode_dsm(buf, pos, limit)?);
    }
    Ok(())
}

/// Decode the footers. The signature was already stripped during
/// verification; only the opaque security footer remains to skip.
pub fn decode_footers(buf: &[u8], pos: &mut usize, nm: &NetworkMessage) -> Result<()> {
    let footer_size = nm
        .security_header
        .as_ref()
        .map_or(0, |sh| sh.footer_size as usize);
    if footer_size > 0 {
        if buf.len().saturating_sub(*pos) < footer_size {
            return Err(short("security footer"));
        }
        *pos += footer_size;
    }
    Ok(())
}

// ============================================================================
// Encoding
// ============================================================================

fn encode_dsm(w: &mut Writer, dsm: &DataSetMessage) -> Result<()> {
    let hdr = &dsm.header;
    let mut f1 = 0u8;
    if hdr.valid {
        f1 |= D1_VALID;
    }
    let enc = match hdr.field_encoding {
        FieldEncoding::Variant => 0u8,
        FieldEncoding::RawData => 1,
        FieldEncoding::DataValue => 2,
    };
    f1 |= (enc << D1_ENCODING_SHIFT) & D1_ENCODING_MASK;
    if hdr.sequence_number.is_some() {
        f1 |= D1_SEQUENCE_NUMBER;
    }
    if hdr.status.is_some() {
        f1 |= D1_STATUS;
    }
    if hdr.config_version_major.is_some() {
        f1 |= D1_CFG_MAJOR;
    }
    if hdr.config_version_minor.is_some() {
        f1 |= D1_CFG_MINOR;
    }
    let mut f2 = 0u8;
    if hdr.timestamp.is_some() {
        f2 |= D2_TIMESTAMP;
    }
    if hdr.picoseconds.is_some() {
        f2 |= D2_PICOSECONDS;
    }
    f2 |= match hdr.message_type {
        DataSetMessageType::KeyFrame => 0,
        DataSetMessageType::DeltaFrame => 1,
        DataSetMessageType::Event => 2,
        DataSetMessageType::KeepAlive => 3,
    };
    if f2 != 0 {
        f1 |= D1_FLAGS2;
    }

    w.u8(f1);
    if f1 & D1_FLAGS2 != 0 {
        w.u8(f2);
    }
    if let Some(sn) = hdr.sequence_number {
        w.u16(sn);
    }
    if let Some(ts) = hdr.timestamp {
        w.i64(ts);
    }
    if let Some(ps) = hdr.picoseconds {
        w.u16(ps);
    }
    if let Some(st) = hdr.status {
        w.u16(st);
    }
    if let Some(v) = hdr.config_version_major {
        w.u32(v);
    }
    if let Some(v) = hdr.config_version_minor {
        w.u32(v);
    }

    match (&dsm.payload, hdr.field_encoding) {
        (DataSetPayload::Raw(raw), FieldEncoding::RawData) => {
            w.raw(&raw.bytes);
        }
        (DataSetPayload::KeyFrame(values), FieldEncoding::Variant) => {
            w.u16(values.len() as u16);
            for dv in values {
                let v = dv.value.as_ref().ok_or_else(|| {
                    Error::InternalError("variant-encoded field without value".into())
                })?;
                encode_variant(w, v);
            }
        }
        (DataSetPayload::KeyFrame(values), FieldEncoding::DataValue) => {
            w.u16(values.len() as u16);
            for dv in values {
                encode_data_value(w, dv);
            }
        }
        _ => {
            return Err(Error::InternalError(
                "payload does not match the declared field encoding".into(),
            ))
        }
    }
    Ok(())
}

/// Encode a NetworkMessage. Security (encrypt + sign) is applied by the
/// caller afterwards; the security header is emitted as given.
pub fn encode(nm: &NetworkMessage) -> Result<Vec<u8>> {
    let mut w = Writer::new();

    let mut flags = UADP_VERSION;
    let mut ext1 = 0u8;
    if let Some(pid) = &nm.publisher_id {
        flags |= F_PUBLISHER_ID;
        ext1 |= pid.wire_type() & E1_PID_TYPE_MASK;
    }
    if nm.group_header.is_some() {
        flags |= F_GROUP_HEADER;
    }
    if nm.payload_header.is_some() {
        flags |= F_PAYLOAD_HEADER;
    }
    if nm.data_set_class_id.is_some() {
        ext1 |= E1_DATASET_CLASS_ID;
    }
    if nm.security_header.is_some() {
        ext1 |= E1_SECURITY;
    }
    if nm.timestamp.is_some() {
        ext1 |= E1_TIMESTAMP;
    }
    if nm.picoseconds.is_some() {
        ext1 |= E1_PICOSECONDS;
    }
    if ext1 != 0 {
        flags |= F_EXTENDED1;
    }

    w.u8(flags);
    if ext1 != 0 {
        w.u8(ext1);
    }

    if let Some(pid) = &nm.publisher_id {
        match pid {
            PublisherId::Byte(v) => w.u8(*v),
            PublisherId::UInt16(v) => w.u16(*v),
            PublisherId::UInt32(v) => w.u32(*v),
            PublisherId::UInt64(v) => w.u64(*v),
            PublisherId::String(v) => w.ua_string(v),
        }
    }
    if let Some(id) = &nm.data_set_class_id {
        w.raw(id);
    }

    if let Some(gh) = &nm.group_header {
        let mut gf = 0u8;
        if gh.writer_group_id.is_some() {
            gf |= G_WRITER_GROUP_ID;
        }
        if gh.group_version.is_some() {
            gf |= G_GROUP_VERSION;
        }
        if gh.network_message_number.is_some() {
            gf |= G_NETWORK_MESSAGE_NUMBER;
        }
        if gh.sequence_number.is_some() {
            gf |= G_SEQUENCE_NUMBER;
        }
        w.u8(gf);
        if let Some(v) = gh.writer_group_id {
            w.u16(v);
        }
        if let Some(v) = gh.group_version {
            w.u32(v);
        }
        if let Some(v) = gh.network_message_number {
            w.u16(v);
        }
        if let Some(v) = gh.sequence_number {
            w.u16(v);
        }
    }

    if let Some(ph) = &nm.payload_header {
        w.u8(ph.data_set_writer_ids.len() as u8);
        for id in &ph.data_set_writer_ids {
            w.u16(*id);
        }
    }

    if let Some(ts) = nm.timestamp {
        w.i64(ts);
    }
    if let Some(ps) = nm.picoseconds {
        w.u16(ps);
    }

    if let Some(sh) = &nm.security_header {
        let mut sf = 0u8;
        if sh.signed {
            sf |= S_SIGNED;
        }
        if sh.encrypted {
            sf |= S_ENCRYPTED;
        }
        if sh.footer_enabled {
            sf |= S_FOOTER;
        }
        w.u8(sf);
        w.u32(sh.token_id);
        w.u8(sh.message_nonce.len() as u8);
        w.raw(&sh.message_nonce);
        if sh.footer_enabled {
            w.u16(sh.footer_size);
        }
    }

    let count = nm
        .payload_header
        .as_ref()
        .map_or(nm.messages.len(), |ph| ph.data_set_writer_ids.len());
    if count != nm.messages.len() {
        return Err(Error::InternalError(
            "payload header count does not match message count".into(),
        ));
    }
    if count > 1 && nm.payload_header.is_none() {
        // The sizes array is only decodable alongside a payload header.
        return Err(Error::InternalError(
            "multiple DataSetMessages require a payload header".into(),
        ));
    }

    if count > 1 {
        let mut encoded: Vec<Vec<u8>> = Vec::with_capacity(count);
        for dsm in &nm.messages {
            let mut dw = Writer::new();
            encode_dsm(&mut dw, dsm)?;
            encoded.push(dw.buf);
        }
        for e in &encoded {
            w.u16(e.len() as u16);
        }
        for e in &encoded {
            w.raw(e);
        }
    } else {
        for dsm in &nm.messages {
            encode_dsm(&mut w, dsm)?;
        }
    }

    Ok(w.buf)
}

/// Byte offset where the payload region starts (first byte after the
/// security header). Needed by the security layer to know which region to
/// encrypt/decrypt.
pub fn payload_offset(buf: &[u8]) -> Result<usize> {
    let mut pos = 0;
    decode_headers(buf, &mut pos)?;
    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    fn simple_message() -> NetworkMessage {
        NetworkMessage {
            publisher_id: Some(PublisherId::UInt16(7)),
            group_header: Some(GroupHeader {
                writer_group_id: Some(1),
                ..Default::default()
            }),
            payload_header: Some(PayloadHeader {
                data_set_writer_ids: vec![42],
            }),
            messages: vec![DataSetMessage::key_frame(vec![DataValue::from_variant(
                Variant::Int32(99),
            )])],
            ..Default::default()
        }
    }

    fn decode_all(buf: &[u8]) -> NetworkMessage {
        let mut pos = 0;
        let mut nm = decode_headers(buf, &mut pos).expect("headers");
        decode_payload(buf, &mut pos, &mut nm).expect("payload");
        decode_footers(buf, &mut pos, &nm).expect("footers");
        assert_eq!(pos, buf.len());
        nm
    }

    #[test]
    fn test_roundtrip_simple() {
        let nm = simple_message();
        let buf = encode(&nm).expect("encode");
        let out = decode_all(&buf);
        assert_eq!(out.publisher_id, Some(PublisherId::UInt16(7)));
        assert_eq!(
            out.group_header.as_ref().unwrap().writer_group_id,
            Some(1)
        );
        assert_eq!(out.writer_id_at(0), Some(42));
        assert_eq!(
            out.messages[0].payload,
            DataSetPayload::KeyFrame(vec![DataValue::from_variant(Variant::Int32(99))])
        );
    }

    #[test]
    fn test_roundtrip_publisher_id_types() {
        for pid in [
            PublisherId::Byte(3),
            PublisherId::UInt16(300),
            PublisherId::UInt32(70_000),
            PublisherId::UInt64(u64::MAX),
            PublisherId::String("pub-a".into()),
        ] {
            let nm = NetworkMessage {
                publisher_id: Some(pid.clone()),
                messages: vec![DataSetMessage::key_frame(vec![])],
                ..Default::default()
            };
            let buf = encode(&nm).expect("encode");
            let out = decode_all(&buf);
            assert_eq!(out.publisher_id, Some(pid));
        }
    }

    #[test]
    fn test_roundtrip_multiple_messages() {
        let nm = NetworkMessage {
            publisher_id: Some(PublisherId::Byte(1)),
            payload_header: Some(PayloadHeader {
                data_set_writer_ids: vec![10, 11],
            }),
            messages: vec![
                DataSetMessage::key_frame(vec![DataValue::from_variant(Variant::Boolean(true))]),
                DataSetMessage::key_frame(vec![DataValue::from_variant(Variant::Double(2.5))]),
            ],
            ..Default::default()
        };
        let buf = encode(&nm).expect("encode");
        let out = decode_all(&buf);
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.writer_id_at(1), Some(11));
        assert_eq!(
            out.messages[1].payload,
            DataSetPayload::KeyFrame(vec![DataValue::from_variant(Variant::Double(2.5))])
        );
    }

    #[test]
    fn test_roundtrip_data_value_encoding() {
        let mut dsm = DataSetMessage {
            header: DataSetMessageHeader {
                valid: true,
                field_encoding: FieldEncoding::DataValue,
                sequence_number: Some(12),
                config_version_major: Some(3),
                ..Default::default()
            },
            payload: DataSetPayload::KeyFrame(vec![DataValue {
                value: Some(Variant::Float(1.5)),
                status: Some(0),
                source_timestamp: Some(1_700_000),
            }]),
        };
        dsm.header.timestamp = Some(42);
        let nm = NetworkMessage {
            publisher_id: Some(PublisherId::UInt32(9)),
            messages: vec![dsm.clone()],
            ..Default::default()
        };
        let buf = encode(&nm).expect("encode");
        let out = decode_all(&buf);
        assert_eq!(out.messages[0], dsm);
    }

    #[test]
    fn test_roundtrip_raw_payload() {
        let raw = vec![0x63, 0x00, 0x00, 0x00]; // Int32 99 LE
        let nm = NetworkMessage {
            publisher_id: Some(PublisherId::UInt16(7)),
            messages: vec![DataSetMessage {
                header: DataSetMessageHeader {
                    valid: true,
                    field_encoding: FieldEncoding::RawData,
                    ..Default::default()
                },
                payload: DataSetPayload::Raw(RawPayload {
                    offset_in_datagram: 0,
                    bytes: raw.clone(),
                }),
            }],
            ..Default::default()
        };
        let buf = encode(&nm).expect("encode");
        let out = decode_all(&buf);
        match &out.messages[0].payload {
            DataSetPayload::Raw(rp) => {
                assert_eq!(rp.bytes, raw);
                assert!(rp.offset_in_datagram > 0);
            }
            other => panic!("expected raw payload, got {:?}", other),
        }
    }

    #[test]
    fn test_two_network_messages_in_one_datagram() {
        let a = encode(&simple_message()).expect("encode a");
        let b = encode(&simple_message()).expect("encode b");
        let mut datagram = a.clone();
        datagram.extend_from_slice(&b);

        let mut pos = 0;
        let mut count = 0;
        while pos < datagram.len() {
            let mut nm = decode_headers(&datagram, &mut pos).expect("headers");
            decode_payload(&datagram, &mut pos, &mut nm).expect("payload");
            decode_footers(&datagram, &mut pos, &nm).expect("footers");
            count += 1;
        }
        assert_eq!(count, 2);
        assert_eq!(pos, datagram.len());
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let buf = [0x02u8];
        let mut pos = 0;
        assert!(matches!(
            decode_headers(&buf, &mut pos),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let nm = simple_message();
        let buf = encode(&nm).expect("encode");
        let mut pos = 0;
        let truncated = &buf[..buf.len() - 2];
        let mut decoded = decode_headers(truncated, &mut pos).expect("headers fit");
        assert!(decode_payload(truncated, &mut pos, &mut decoded).is_err());
    }

    #[test]
    fn test_security_header_roundtrip() {
        let nm = NetworkMessage {
            publisher_id: Some(PublisherId::UInt16(7)),
            security_header: Some(SecurityHeader {
                signed: true,
                encrypted: true,
                footer_enabled: false,
                token_id: 5,
                message_nonce: vec![1, 2, 3, 4, 5, 6, 7, 8],
                footer_size: 0,
            }),
            messages: vec![DataSetMessage::key_frame(vec![DataValue::from_variant(
                Variant::UInt16(1),
            )])],
            ..Default::default()
        };
        let buf = encode(&nm).expect("encode");
        let mut pos = 0;
        let decoded = decode_headers(&buf, &mut pos).expect("headers");
        let sh = decoded.security_header.expect("security header");
        assert!(sh.signed);
        assert!(sh.encrypted);
        assert_eq!(sh.token_id, 5);
        assert_eq!(sh.message_nonce.len(), 8);
        assert_eq!(pos, payload_offset(&buf).expect("payload offset"));
    }

    #[test]
    fn test_variant_string_roundtrip() {
        let nm = NetworkMessage {
            publisher_id: Some(PublisherId::Byte(2)),
            messages: vec![DataSetMessage::key_frame(vec![
                DataValue::from_variant(Variant::String("hello".into())),
                DataValue::from_variant(Variant::ByteString(vec![0xde, 0xad])),
            ])],
            ..Default::default()
        };
        let buf = encode(&nm).expect("encode");
        let out = decode_all(&buf);
        match &out.messages[0].payload {
            DataSetPayload::KeyFrame(values) => {
                assert_eq!(values[0].value, Some(Variant::String("hello".into())));
                assert_eq!(
                    values[1].value,
                    Some(Variant::ByteString(vec![0xde, 0xad]))
                );
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_fixed_sizes_match_wire() {
        assert_eq!(DataType::Int32.fixed_size(), Some(4));
        assert_eq!(DataType::Boolean.fixed_size(), Some(1));
        assert_eq!(DataType::String.fixed_size(), None);
    }
}
