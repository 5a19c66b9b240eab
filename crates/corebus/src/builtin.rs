// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The org.freedesktop.DBus.Peer built-in service.
//!
//! Peer is answered for every object, before the tree is consulted.

use crate::connection::Connection;
use crate::error::Result;
use crate::id::machine_id;
use crate::message::{Message, MessageType, Value};

const PEER: &str = "org.freedesktop.DBus.Peer";

/// Answer Peer calls. `Ok(true)` consumes the message.
pub(crate) fn process_builtin(conn: &mut Connection, m: &mut Message) -> Result<bool> {
    if m.message_type() != MessageType::MethodCall {
        return Ok(false);
    }
    if m.interface() != Some(PEER) {
        return Ok(false);
    }

    // The sender is not waiting; the call is consumed without an answer.
    if m.no_reply_expected() {
        return Ok(true);
    }

    match m.member() {
        Some("Ping") => {
            let reply = Message::method_return(m)?;
            conn.send_reply(reply)?;
        }
        Some("GetMachineId") => {
            let id = machine_id()?;
            let mut reply = Message::method_return(m)?;
            reply.append(Value::Str(id))?;
            conn.send_reply(reply)?;
        }
        other => {
            conn.reply_error_parts(
                m,
                "org.freedesktop.DBus.Error.UnknownMethod",
                format!(
                    "Unknown method '{}' on interface '{}'.",
                    other.unwrap_or(""),
                    PEER
                ),
            )?;
        }
    }

    Ok(true)
}
