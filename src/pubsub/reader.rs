// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DataSetReader: a subscription to one (PublisherId, WriterGroupId,
//! DataSetWriterId) tuple with bindings to target variables.
//!
//! The reader owns the last mile of the receive pipeline: identifier
//! matching, field decoding (slow path field-by-field, fast path over a
//! precomputed offset table when the group is frozen at `FIXED_SIZE`),
//! heartbeat bookkeeping and the optional receive-timeout monitor.

use super::{Cause, Ctx, Error, PubSubId, PubSubState, Result};
use crate::config::{DataSetReaderConfig, FieldMetaData, FieldTarget, RtLevel};
use crate::event::{CallbackId, EventLoop};
use crate::message::{DataSetMessage, DataSetMessageType, DataSetPayload, NetworkMessage, RawPayload};
use crate::types::{DataType, DataValue, PublisherId, Variant};
use std::sync::Arc;
use std::time::Instant;

/// Precomputed byte offsets of the DataSet fields inside a fixed-layout
/// datagram. Built from the first frame received after freezing.
pub(crate) struct OffsetBuffer {
    /// Datagram length the offsets were computed for.
    pub(crate) expected_len: usize,
    pub(crate) fields: Vec<FieldSlot>,
}

pub(crate) struct FieldSlot {
    pub(crate) offset: usize,
    pub(crate) data_type: DataType,
    pub(crate) max_len: u32,
}

/// Outcome of handing one DataSetMessage to a reader.
///
/// Only [`Data`](DispatchOutcome::Data) counts as a successful dispatch
/// for state promotion; a heartbeat refreshes the reader's bookkeeping
/// and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// Field data was written into the target variables.
    Data,
    /// A heartbeat was accepted.
    Heartbeat,
    /// The message was discarded.
    Rejected,
}

pub(crate) struct DataSetReader {
    pub(crate) id: PubSubId,
    /// Parent group, resolved by identifier under the service lock.
    pub(crate) parent: PubSubId,
    pub(crate) config: DataSetReaderConfig,
    pub(crate) state: PubSubState,
    pub(crate) frozen: bool,
    pub(crate) offset_buffer: Option<OffsetBuffer>,
    pub(crate) last_heartbeat: Option<Instant>,
    receive_monitor: Option<(Arc<dyn EventLoop>, CallbackId)>,
}

impl DataSetReader {
    pub(crate) fn new(id: PubSubId, parent: PubSubId, config: DataSetReaderConfig) -> Self {
        DataSetReader {
            id,
            parent,
            config,
            state: PubSubState::Disabled,
            frozen: false,
            offset_buffer: None,
            last_heartbeat: None,
            receive_monitor: None,
        }
    }

    fn transition(&mut self, new: PubSubState, cause: Cause, ctx: &Ctx) {
        if self.state != new {
            log::debug!("[Reader] {} {} -> {}", self.id, self.state, new);
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
            PubSubState::Disabled => {
                self.stop_receive_monitor();
                self.transition(PubSubState::Disabled, cause, ctx);
                Ok(())
            }
            PubSubState::Paused => Err(Error::NotSupported(
                "PAUSED is not defined for DataSetReaders".into(),
            )),
            PubSubState::PreOperational => {
                self.transition(PubSubState::PreOperational, cause, ctx);
                Ok(())
            }
            PubSubState::Operational => {
                self.transition(PubSubState::Operational, cause, ctx);
                Ok(())
            }
            PubSubState::Error => {
                self.stop_receive_monitor();
                self.transition(PubSubState::Error, cause, ctx);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Identifier matching
    // ------------------------------------------------------------------

    /// Match the decoded headers against this reader. Mismatch is silent:
    /// in a multicast group most frames are simply addressed elsewhere.
    ///
    /// `loose_publisher` relaxes the PublisherId comparison to numeric
    /// value equality (JSON mapping, where the wire does not preserve the
    /// integer width).
    pub(crate) fn matches(&self, nm: &NetworkMessage, loose_publisher: bool) -> bool {
        let Some(pid) = &nm.publisher_id else {
            return false;
        };
        let pid_ok = if loose_publisher {
            publisher_value_eq(pid, &self.config.publisher_id)
        } else {
            *pid == self.config.publisher_id
        };
        if !pid_ok {
            return false;
        }
        if let Some(wgid) = nm.group_header.as_ref().and_then(|g| g.writer_group_id) {
            if wgid != self.config.writer_group_id {
                log::debug!("[Reader] {} WriterGroupId {} does not match", self.id, wgid);
                return false;
            }
        }
        if let Some(ph) = &nm.payload_header {
            if !ph
                .data_set_writer_ids
                .contains(&self.config.data_set_writer_id)
            {
                log::debug!("[Reader] {} DataSetWriterId does not match", self.id);
                return false;
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Dispatch (slow path)
    // ------------------------------------------------------------------

    /// Process one DataSetMessage addressed to this reader.
    ///
    /// `may_promote` is false while the parent connection is not yet
    /// `OPERATIONAL`: data is still delivered, but the reader stays in
    /// its pre-state so children never sit above the parent in the
    /// lattice.
    pub(crate) fn process(
        &mut self,
        dsm: &DataSetMessage,
        rt: RtLevel,
        may_promote: bool,
        ctx: &Ctx,
        el: &Arc<dyn EventLoop>,
    ) -> DispatchOutcome {
        // Heartbeat readers expect empty keyframes and touch no targets.
        if self.config.data_set_meta_data.is_heartbeat() {
            return self.process_heartbeat(dsm, ctx, el);
        }

        if !dsm.header.valid {
            log::info!("[Reader] {} DataSetMessage discarded: not valid", self.id);
            return DispatchOutcome::Rejected;
        }

        // A fresh message heals a reader that timed out.
        if self.state == PubSubState::Error && self.config.message_receive_timeout_ms.is_some() {
            let _ = self.set_state(PubSubState::Operational, Cause::Good, ctx);
        }
        if may_promote && self.state == PubSubState::PreOperational {
            let _ = self.set_state(PubSubState::Operational, Cause::Good, ctx);
        }

        if dsm.header.message_type != DataSetMessageType::KeyFrame {
            log::warn!(
                "[Reader] {} DataSetMessage discarded: only keyframes are supported",
                self.id
            );
            return DispatchOutcome::Rejected;
        }

        match &dsm.payload {
            DataSetPayload::Raw(raw) => {
                // A raw frame that cannot be decoded against the metadata
                // is fatal for this reader, not for the group.
                if let Err(e) = self.process_raw(raw, rt) {
                    log::warn!("[Reader] {} raw decode failed: {}", self.id, e);
                    let _ = self.set_state(PubSubState::Error, Cause::DecodeFailed, ctx);
                    return DispatchOutcome::Rejected;
                }
            }
            DataSetPayload::KeyFrame(values) => self.process_key_frame(values),
            #[cfg(feature = "json")]
            DataSetPayload::NamedFields(fields) => self.process_named(fields),
        }

        self.restart_receive_monitor(ctx, el);
        DispatchOutcome::Data
    }

    /// A heartbeat only refreshes the reader: last-heartbeat timestamp
    /// and the receive-timeout monitor. No state changes, no targets.
    fn process_heartbeat(
        &mut self,
        dsm: &DataSetMessage,
        ctx: &Ctx,
        el: &Arc<dyn EventLoop>,
    ) -> DispatchOutcome {
        let empty = dsm.header.message_type == DataSetMessageType::KeyFrame
            && dsm.header.config_version_major.unwrap_or(0) == 0
            && dsm.header.config_version_minor.unwrap_or(0) == 0
            && dsm.payload.field_count().unwrap_or(0) == 0;
        if !empty {
            log::info!(
                "[Reader] {} expects heartbeats but the received message is not one",
                self.id
            );
        }
        if let Some(prev) = self.last_heartbeat {
            log::debug!(
                "[Reader] {} heartbeat after {} ms",
                self.id,
                prev.elapsed().as_millis()
            );
        }
        self.last_heartbeat = Some(Instant::now());
        self.restart_receive_monitor(ctx, el);
        DispatchOutcome::Heartbeat
    }

    fn process_key_frame(&mut self, values: &[DataValue]) {
        let fields = self.config.data_set_meta_data.fields.len();
        let targets = self.config.field_targets.len();
        let count = values.len().min(fields).min(targets);
        for i in 0..count {
            if values[i].value.is_none() {
                continue;
            }
            self.write_target(i, values[i].clone());
        }
    }

    #[cfg(feature = "json")]
    fn process_named(&mut self, fields: &[(String, DataValue)]) {
        for (name, dv) in fields {
            let Some(i) = self
                .config
                .data_set_meta_data
                .fields
                .iter()
                .position(|f| f.name == *name)
            else {
                log::debug!("[Reader] {} unknown field '{}' ignored", self.id, name);
                continue;
            };
            let expected = self.config.data_set_meta_data.fields[i].data_type;
            let Some(value) = dv.value.clone() else {
                continue;
            };
            match coerce(value, expected) {
                Some(v) => self.write_target(
                    i,
                    DataValue {
                        value: Some(v),
                        status: dv.status,
                        source_timestamp: dv.source_timestamp,
                    },
                ),
                None => log::info!(
                    "[Reader] {} field '{}' has an incompatible type",
                    self.id,
                    name
                ),
            }
        }
    }

    fn process_raw(&mut self, raw: &RawPayload, _rt: RtLevel) -> Result<()> {
        let mut off = 0usize;
        for i in 0..self.config.data_set_meta_data.fields.len() {
            let field = &self.config.data_set_meta_data.fields[i];
            let (variant, consumed) =
                decode_raw_field(&raw.bytes[off.min(raw.bytes.len())..], field)?;
            off += consumed;
            self.write_target(i, DataValue::from_variant(variant));
        }
        Ok(())
    }

    fn write_target(&mut self, index: usize, value: DataValue) {
        match self
            .config
            .field_targets
            .get(index)
            .and_then(|t| t.external_value.as_ref())
        {
            Some(cell) => *cell.write() = value,
            None => log::debug!(
                "[Reader] {} field {} has no target backend, skipped",
                self.id,
                index
            ),
        }
    }

    // ------------------------------------------------------------------
    // Fast path (frozen FIXED_SIZE groups)
    // ------------------------------------------------------------------

    /// Build the offset table from the first raw frame after freezing.
    pub(crate) fn build_offset_buffer(&mut self, raw: &RawPayload, datagram_len: usize) {
        let mut fields = Vec::with_capacity(self.config.data_set_meta_data.fields.len());
        let mut off = raw.offset_in_datagram;
        for field in &self.config.data_set_meta_data.fields {
            let size = match field.data_type.fixed_size() {
                Some(s) => s,
                // Bounded string: 4-byte length prefix plus the bound.
                None if field.max_string_length > 0 => 4 + field.max_string_length as usize,
                None => return,
            };
            fields.push(FieldSlot {
                offset: off,
                data_type: field.data_type,
                max_len: field.max_string_length,
            });
            off += size;
        }
        log::debug!(
            "[Reader] {} offset buffer built ({} fields, {} bytes)",
            self.id,
            fields.len(),
            datagram_len
        );
        self.offset_buffer = Some(OffsetBuffer {
            expected_len: datagram_len,
            fields,
        });
    }

    /// Decode a fixed-layout datagram through the offset table.
    pub(crate) fn process_fast(
        &mut self,
        buf: &[u8],
        may_promote: bool,
        ctx: &Ctx,
        el: &Arc<dyn EventLoop>,
    ) -> Result<()> {
        let Some(ob) = self.offset_buffer.as_ref() else {
            return Err(Error::InternalError("no offset buffer".into()));
        };
        if buf.len() != ob.expected_len {
            return Err(Error::Decode(format!(
                "datagram length {} does not match the frozen layout ({})",
                buf.len(),
                ob.expected_len
            )));
        }
        let mut decoded: Vec<(usize, DataValue)> = Vec::with_capacity(ob.fields.len());
        for (i, slot) in ob.fields.iter().enumerate() {
            let meta = FieldMetaData {
                name: String::new(),
                data_type: slot.data_type,
                max_string_length: slot.max_len,
            };
            let (variant, _) = decode_raw_field(&buf[slot.offset.min(buf.len())..], &meta)?;
            decoded.push((i, DataValue::from_variant(variant)));
        }
        for (i, dv) in decoded {
            self.write_target(i, dv);
        }
        if may_promote && self.state == PubSubState::PreOperational {
            let _ = self.set_state(PubSubState::Operational, Cause::Good, ctx);
        }
        self.restart_receive_monitor(ctx, el);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Receive-timeout monitoring
    // ------------------------------------------------------------------

    fn restart_receive_monitor(&mut self, ctx: &Ctx, el: &Arc<dyn EventLoop>) {
        let Some(timeout) = self.config.message_receive_timeout_ms else {
            return;
        };
        self.stop_receive_monitor();
        let weak = ctx.shared.clone();
        let id = self.id;
        let cb = el.add_timed_callback(
            timeout,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.reader_receive_timeout(id);
                }
            }),
        );
        self.receive_monitor = Some((Arc::clone(el), cb));
    }

    pub(crate) fn stop_receive_monitor(&mut self) {
        if let Some((el, id)) = self.receive_monitor.take() {
            el.remove_callback(id);
        }
    }

    // ------------------------------------------------------------------
    // Config updates
    // ------------------------------------------------------------------

    /// Update the mutable subset of the configuration.
    pub(crate) fn update_config(
        &mut self,
        cfg: &DataSetReaderConfig,
        group_frozen: bool,
        _ctx: &Ctx,
    ) -> Result<()> {
        if self.frozen || group_frozen {
            log::warn!(
                "[Reader] {} config update failed: subscriber configuration is frozen",
                self.id
            );
            return Err(Error::ConfigurationError(
                "subscriber configuration is frozen".into(),
            ));
        }
        self.config.writer_group_id = cfg.writer_group_id;
        self.config.data_set_writer_id = cfg.data_set_writer_id;
        self.config.field_targets = cfg.field_targets.clone();
        if self.config.message_receive_timeout_ms != cfg.message_receive_timeout_ms {
            self.config.message_receive_timeout_ms = cfg.message_receive_timeout_ms;
            // Re-armed with the new timeout on the next message.
            self.stop_receive_monitor();
        }
        Ok(())
    }

    /// Replace the target bindings wholesale.
    pub(crate) fn create_target_variables(
        &mut self,
        targets: Vec<FieldTarget>,
        group_frozen: bool,
    ) -> Result<()> {
        if self.frozen || group_frozen {
            log::warn!(
                "[Reader] {} target update failed: subscriber configuration is frozen",
                self.id
            );
            return Err(Error::ConfigurationError(
                "subscriber configuration is frozen".into(),
            ));
        }
        self.config.field_targets = targets;
        Ok(())
    }
}

// ============================================================================
// Field decoding helpers
// ============================================================================

fn publisher_value_eq(a: &PublisherId, b: &PublisherId) -> bool {
    fn numeric(p: &PublisherId) -> Option<u64> {
        match p {
            PublisherId::Byte(v) => Some(u64::from(*v)),
            PublisherId::UInt16(v) => Some(u64::from(*v)),
            PublisherId::UInt32(v) => Some(u64::from(*v)),
            PublisherId::UInt64(v) => Some(*v),
            PublisherId::String(_) => None,
        }
    }
    match (numeric(a), numeric(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Decode one raw-encoded field. Returns the value and the bytes
/// consumed (bounded strings occupy their full bound on the wire).
fn decode_raw_field(buf: &[u8], field: &FieldMetaData) -> Result<(Variant, usize)> {
    fn need(buf: &[u8], n: usize, field: &FieldMetaData) -> Result<()> {
        if buf.len() < n {
            return Err(Error::Decode(format!(
                "raw field '{}' truncated ({} of {} bytes)",
                field.name,
                buf.len(),
                n
            )));
        }
        Ok(())
    }

    use DataType as T;
    let v = match field.data_type {
        T::Boolean => {
            need(buf, 1, field)?;
            (Variant::Boolean(buf[0] != 0), 1)
        }
        T::SByte => {
            need(buf, 1, field)?;
            (Variant::SByte(buf[0] as i8), 1)
        }
        T::Byte => {
            need(buf, 1, field)?;
            (Variant::Byte(buf[0]), 1)
        }
        T::Int16 => {
            need(buf, 2, field)?;
            (Variant::Int16(i16::from_le_bytes([buf[0], buf[1]])), 2)
        }
        T::UInt16 => {
            need(buf, 2, field)?;
            (Variant::UInt16(u16::from_le_bytes([buf[0], buf[1]])), 2)
        }
        T::Int32 => {
            need(buf, 4, field)?;
            (
                Variant::Int32(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
                4,
            )
        }
        T::UInt32 => {
            need(buf, 4, field)?;
            (
                Variant::UInt32(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
                4,
            )
        }
        T::Int64 => {
            need(buf, 8, field)?;
            let mut a = [0u8; 8];
            a.copy_from_slice(&buf[..8]);
            (Variant::Int64(i64::from_le_bytes(a)), 8)
        }
        T::UInt64 => {
            need(buf, 8, field)?;
            let mut a = [0u8; 8];
            a.copy_from_slice(&buf[..8]);
            (Variant::UInt64(u64::from_le_bytes(a)), 8)
        }
        T::Float => {
            need(buf, 4, field)?;
            (
                Variant::Float(f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
                4,
            )
        }
        T::Double => {
            need(buf, 8, field)?;
            let mut a = [0u8; 8];
            a.copy_from_slice(&buf[..8]);
            (Variant::Double(f64::from_le_bytes(a)), 8)
        }
        T::String | T::ByteString => {
            need(buf, 4, field)?;
            let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as i32;
            let len = if len <= 0 { 0 } else { len as usize };
            let bound = field.max_string_length as usize;
            if bound > 0 && len > bound {
                return Err(Error::Decode(format!(
                    "raw field '{}' exceeds its length bound ({} > {})",
                    field.name, len, bound
                )));
            }
            need(buf, 4 + len, field)?;
            let bytes = buf[4..4 + len].to_vec();
            // Bounded fields occupy the full bound so the layout stays
            // fixed.
            let consumed = if bound > 0 { 4 + bound } else { 4 + len };
            need(buf, consumed, field)?;
            let variant = if field.data_type == T::String {
                Variant::String(
                    String::from_utf8(bytes)
                        .map_err(|_| Error::Decode(format!("field '{}' is not UTF-8", field.name)))?,
                )
            } else {
                Variant::ByteString(bytes)
            };
            (variant, consumed)
        }
    };
    Ok(v)
}

/// Coerce a decoded variant onto the metadata type (JSON mapping: the
/// wire does not preserve integer widths).
#[cfg(feature = "json")]
fn coerce(v: Variant, target: DataType) -> Option<Variant> {
    use DataType as T;
    if v.data_type() == target {
        return Some(v);
    }
    let as_i128: Option<i128> = match &v {
        Variant::SByte(x) => Some(i128::from(*x)),
        Variant::Byte(x) => Some(i128::from(*x)),
        Variant::Int16(x) => Some(i128::from(*x)),
        Variant::UInt16(x) => Some(i128::from(*x)),
        Variant::Int32(x) => Some(i128::from(*x)),
        Variant::UInt32(x) => Some(i128::from(*x)),
        Variant::Int64(x) => Some(i128::from(*x)),
        Variant::UInt64(x) => Some(i128::from(*x)),
        _ => None,
    };
    match target {
        T::Boolean => match v {
            Variant::Boolean(b) => Some(Variant::Boolean(b)),
            _ => None,
        },
        T::SByte => as_i128.and_then(|x| i8::try_from(x).ok()).map(Variant::SByte),
        T::Byte => as_i128.and_then(|x| u8::try_from(x).ok()).map(Variant::Byte),
        T::Int16 => as_i128.and_then(|x| i16::try_from(x).ok()).map(Variant::Int16),
        T::UInt16 => as_i128.and_then(|x| u16::try_from(x).ok()).map(Variant::UInt16),
        T::Int32 => as_i128.and_then(|x| i32::try_from(x).ok()).map(Variant::Int32),
        T::UInt32 => as_i128.and_then(|x| u32::try_from(x).ok()).map(Variant::UInt32),
        T::Int64 => as_i128.and_then(|x| i64::try_from(x).ok()).map(Variant::Int64),
        T::UInt64 => as_i128.and_then(|x| u64::try_from(x).ok()).map(Variant::UInt64),
        T::Float => match (&v, as_i128) {
            (Variant::Double(d), _) => Some(Variant::Float(*d as f32)),
            (_, Some(x)) => Some(Variant::Float(x as f32)),
            _ => None,
        },
        T::Double => match (&v, as_i128) {
            (Variant::Float(f), _) => Some(Variant::Double(f64::from(*f))),
            (_, Some(x)) => Some(Variant::Double(x as f64)),
            _ => None,
        },
        T::String => match v {
            Variant::String(s) => Some(Variant::String(s)),
            _ => None,
        },
        T::ByteString => match v {
            Variant::ByteString(b) => Some(Variant::ByteString(b)),
            _ => None,
        },
    }
}
