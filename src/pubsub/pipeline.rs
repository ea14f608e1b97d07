// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receive pipeline: decode, select, verify, dispatch.
//!
//! Stages per datagram:
//! 1. decode the NetworkMessage headers (failure drops the datagram,
//!    never the connection);
//! 2. pick the ReaderGroup whose reader matches the identifiers and
//!    verify/decrypt under its security context;
//! 3. decode payload and footers;
//! 4. hand each DataSetMessage to every matching reader. The first
//!    successful dispatch promotes reader and group to `OPERATIONAL`.
//!
//! A frame without any matching reader is not an error: in a multicast
//! group, most datagrams are addressed to someone else. The loop keeps
//! advancing so a datagram carrying several NetworkMessages is processed
//! to the end.

use super::connection::Connection;
use super::reader::DispatchOutcome;
use super::reader_group::ReaderGroup;
use super::{Cause, Ctx, Error, PubSubState, Result};
use crate::config::{ConnectionConfig, MessageEncoding, RtLevel, SecurityMode};
use crate::event::EventLoop;
use crate::message::{uadp, DataSetPayload, NetworkMessage};
use std::sync::Arc;

#[cfg(feature = "json")]
use crate::message::json;
#[cfg(feature = "encryption")]
use crate::message::SecurityHeader;
#[cfg(feature = "encryption")]
use crate::security;

/// Process one inbound datagram on a connection.
pub(crate) fn process(conn: &mut Connection, buf: &mut Vec<u8>, ctx: &Ctx) -> Result<()> {
    // Groups on one connection share the encoding (mixed encodings get
    // their own connection).
    let encoding = conn
        .reader_groups
        .first()
        .map_or(MessageEncoding::Uadp, |g| g.config.encoding);
    match encoding {
        MessageEncoding::Uadp => process_uadp(conn, buf, ctx),
        #[cfg(feature = "json")]
        MessageEncoding::Json => process_json(conn, buf, ctx),
        #[cfg(not(feature = "json"))]
        MessageEncoding::Json => Err(Error::NotSupported(
            "JSON mapping support is not compiled in".into(),
        )),
    }
}

fn process_uadp(conn: &mut Connection, buf: &mut Vec<u8>, ctx: &Ctx) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let mut nm = match uadp::decode_headers(buf, &mut pos) {
            Ok(nm) => nm,
            Err(e) => {
                log::warn!(
                    "[Pipeline] connection {} header decode failed: {}",
                    conn.id,
                    e
                );
                return Err(e);
            }
        };

        if let Some(sh) = nm.security_header.clone() {
            if sh.signed || sh.encrypted {
                #[cfg(feature = "encryption")]
                unprotect_with_matching_group(conn, &sh, &nm, buf, pos)?;
                #[cfg(not(feature = "encryption"))]
                {
                    let _ = sh;
                    return Err(Error::Security(
                        "message security support is not compiled in".into(),
                    ));
                }
            }
        }

        if let Err(e) = uadp::decode_payload(buf, &mut pos, &mut nm) {
            log::warn!(
                "[Pipeline] connection {} payload decode failed: {}",
                conn.id,
                e
            );
            return Err(e);
        }
        if let Err(e) = uadp::decode_footers(buf, &mut pos, &nm) {
            log::warn!(
                "[Pipeline] connection {} footer decode failed: {}",
                conn.id,
                e
            );
            return Err(e);
        }

        dispatch(conn, &nm, MessageEncoding::Uadp, ctx);
    }
    Ok(())
}

#[cfg(feature = "json")]
fn process_json(conn: &mut Connection, buf: &mut Vec<u8>, ctx: &Ctx) -> Result<()> {
    let nm = match json::decode(buf) {
        Ok(nm) => nm,
        Err(e) => {
            log::warn!("[Pipeline] connection {} JSON decode failed: {}", conn.id, e);
            return Err(e);
        }
    };
    dispatch(conn, &nm, MessageEncoding::Json, ctx);
    Ok(())
}

/// Select the ReaderGroup for verify/decrypt: first group (in insertion
/// order, newest first) containing a reader whose identifiers match.
#[cfg(feature = "encryption")]
fn unprotect_with_matching_group(
    conn: &mut Connection,
    sh: &SecurityHeader,
    nm: &NetworkMessage,
    buf: &mut Vec<u8>,
    payload_start: usize,
) -> Result<()> {
    let conn_id = conn.id;
    for rg in conn.reader_groups.iter_mut() {
        if rg.config.encoding != MessageEncoding::Uadp {
            continue;
        }
        if !rg.readers.iter().any(|r| r.matches(nm, false)) {
            continue;
        }
        let Some(pctx) = rg.security_context.as_ref() else {
            log::warn!(
                "[Pipeline] connection {} secured frame for group {} without keys",
                conn_id,
                rg.id
            );
            return Err(Error::Security(
                "no keys installed for the matching group".into(),
            ));
        };
        return security::unprotect(pctx.as_ref(), sh, buf, payload_start).map_err(|e| {
            log::warn!(
                "[Pipeline] connection {} verify/decrypt failed: {}",
                conn_id,
                e
            );
            e
        });
    }
    log::info!(
        "[Pipeline] connection {} secured frame without a matching reader",
        conn_id
    );
    Err(Error::Security(
        "no matching reader for the secured frame".into(),
    ))
}

fn group_loop(
    rg: &ReaderGroup,
    conn_config: &ConnectionConfig,
    ctx: &Ctx,
) -> Arc<dyn EventLoop> {
    match &rg.config.scheduler {
        Some(custom) => Arc::clone(custom),
        None => Arc::clone(ctx.loop_for(conn_config)),
    }
}

/// Hand the decoded NetworkMessage to every matching reader.
///
/// Only data dispatches promote: a heartbeat refreshes its reader and
/// nothing else, and while the connection itself is not `OPERATIONAL`
/// all promotion is deferred so children never sit above the parent.
fn dispatch(conn: &mut Connection, nm: &NetworkMessage, encoding: MessageEncoding, ctx: &Ctx) {
    if nm.publisher_id.is_none() {
        log::info!(
            "[Pipeline] connection {} cannot match readers without a PublisherId",
            conn.id
        );
        return;
    }

    let loose = encoding == MessageEncoding::Json;
    let mut processed = false;
    let Connection {
        id,
        state,
        config,
        reader_groups,
        ..
    } = conn;
    let conn_operational = *state == PubSubState::Operational;

    for rg in reader_groups.iter_mut() {
        if rg.config.encoding != encoding {
            continue;
        }
        // Frozen fixed-size groups run the offset-buffer path instead.
        if rg.frozen && rg.config.rt_level == RtLevel::FixedSize {
            continue;
        }
        // A group expecting secured frames never accepts plain ones.
        if rg.config.security_mode != SecurityMode::None && nm.security_header.is_none() {
            continue;
        }

        let el = group_loop(rg, config, ctx);
        let rt = rg.config.rt_level;
        let mut any_data = false;
        for reader in rg.readers.iter_mut() {
            if !reader.matches(nm, loose) {
                continue;
            }
            for (i, dsm) in nm.messages.iter().enumerate() {
                let addressed = match nm.writer_id_at(i) {
                    Some(w) => w == reader.config.data_set_writer_id,
                    None => true,
                };
                if !addressed {
                    continue;
                }
                match reader.process(dsm, rt, conn_operational, ctx, &el) {
                    DispatchOutcome::Data => any_data = true,
                    DispatchOutcome::Heartbeat => processed = true,
                    DispatchOutcome::Rejected => {}
                }
            }
        }
        if any_data {
            processed = true;
            if conn_operational {
                let _ = rg.promote_operational(Cause::Good, ctx);
            } else {
                log::debug!(
                    "[Pipeline] group {} promotion deferred, connection {} not operational",
                    rg.id,
                    id
                );
            }
        }
    }

    if !processed {
        log::info!(
            "[Pipeline] connection {} no matching reader; check PublisherId, \
             WriterGroupId and DataSetWriterId",
            id
        );
    }
}

/// Fixed-size fast path of one frozen group: verify, then decode through
/// the reader's offset table. The table is built from the first frame.
pub(crate) fn process_rt(
    conn: &mut Connection,
    gi: usize,
    buf: &mut Vec<u8>,
    ctx: &Ctx,
) -> Result<()> {
    let conn_id = conn.id;
    let Connection {
        state,
        config,
        reader_groups,
        ..
    } = conn;
    let conn_operational = *state == PubSubState::Operational;
    let rg = &mut reader_groups[gi];
    if rg.readers.is_empty() {
        return Ok(());
    }
    let el = group_loop(rg, config, ctx);

    // Verify and decrypt before anything else.
    if rg.config.security_mode != SecurityMode::None {
        let mut hpos = 0;
        let hdr = uadp::decode_headers(buf, &mut hpos)?;
        let Some(sh) = hdr.security_header else {
            return Err(Error::Security("expected a secured frame".into()));
        };
        #[cfg(feature = "encryption")]
        {
            let Some(pctx) = rg.security_context.as_ref() else {
                return Err(Error::Security(
                    "no keys installed for the frozen group".into(),
                ));
            };
            security::unprotect(pctx.as_ref(), &sh, buf, hpos)?;
        }
        #[cfg(not(feature = "encryption"))]
        {
            let _ = sh;
            return Err(Error::Security(
                "message security support is not compiled in".into(),
            ));
        }
    }

    // Armed fast path.
    if rg.readers[0].offset_buffer.is_some() {
        match rg.readers[0].process_fast(buf, conn_operational, ctx, &el) {
            Ok(()) => {
                if conn_operational {
                    let _ = rg.promote_operational(Cause::Good, ctx);
                }
                return Ok(());
            }
            Err(e) => {
                log::warn!(
                    "[Pipeline] connection {} fast path failed ({}), full decode",
                    conn_id,
                    e
                );
            }
        }
    }

    // First frame (or fallback): full decode, then arm the offset table.
    let mut pos = 0;
    let mut nm = uadp::decode_headers(buf, &mut pos)?;
    uadp::decode_payload(buf, &mut pos, &mut nm)?;
    uadp::decode_footers(buf, &mut pos, &nm)?;

    let reader = &mut rg.readers[0];
    if !reader.matches(&nm, false) {
        log::info!(
            "[Pipeline] connection {} frozen group {}: unknown message, not processed",
            conn_id,
            rg.id
        );
        return Ok(());
    }

    let mut any_data = false;
    for (i, dsm) in nm.messages.iter().enumerate() {
        let addressed = match nm.writer_id_at(i) {
            Some(w) => w == reader.config.data_set_writer_id,
            None => true,
        };
        if !addressed {
            continue;
        }
        if reader.offset_buffer.is_none() {
            if let DataSetPayload::Raw(raw) = &dsm.payload {
                reader.build_offset_buffer(raw, buf.len());
            }
        }
        if reader.process(dsm, RtLevel::FixedSize, conn_operational, ctx, &el)
            == DispatchOutcome::Data
        {
            any_data = true;
        }
    }
    if any_data && conn_operational {
        let _ = rg.promote_operational(Cause::Good, ctx);
    }
    Ok(())
}
