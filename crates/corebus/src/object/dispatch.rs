// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Object dispatch: routing incoming method calls through the tree.
//!
//! A call is offered to the exact path first with non-fallback
//! registrations, then to every ancestor prefix with fallback registrations.
//! Callbacks may mutate the tree; the traversal notices via the tree's
//! `modified` flag and restarts, while per-registration iteration stamps
//! keep any handler from running twice for one message.
//!
//! The standard Properties, Introspectable and ObjectManager interfaces are
//! answered here, next to the user vtables they describe.

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::message::{BusError, Message, MessageType, Value};
use crate::names::{interface_name_is_valid, object_path_is_valid, parent_path};
use crate::object::introspect::Introspection;
use crate::object::vtable::{PropertyContext, VtableEntry, VtableFlags};
use crate::object::MemberSlot;

const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";
const OBJECT_MANAGER: &str = "org.freedesktop.DBus.ObjectManager";

// ============================================================================
// Entry point
// ============================================================================

/// Route a method call through the object tree. `Ok(true)` consumes the
/// message (a reply or error reply went out, or a handler claimed it).
pub(crate) fn process_object(conn: &mut Connection, m: &mut Message) -> Result<bool> {
    if m.message_type() != MessageType::MethodCall {
        return Ok(false);
    }
    let Some(path) = m.path().map(str::to_string) else {
        return Ok(false);
    };
    if conn.objects.is_empty() {
        return Ok(false);
    }

    let mut found_object = false;

    'restart: loop {
        conn.objects.modified = false;

        if object_find_and_run(conn, m, &path, false, &mut found_object)? {
            return Ok(true);
        }

        // Fallback prefixes, one trailing segment at a time down to "/".
        let mut prefix = path.clone();
        while prefix != "/" {
            if conn.objects.modified {
                log::trace!("[object] tree modified, restarting dispatch of '{}'", path);
                continue 'restart;
            }

            prefix = match parent_path(&prefix) {
                Some(p) => p.to_string(),
                None => break,
            };

            if object_find_and_run(conn, m, &prefix, true, &mut found_object)? {
                return Ok(true);
            }
        }

        if !conn.objects.modified {
            break;
        }
    }

    if !found_object {
        return Ok(false);
    }

    if m.is_method_call(PROPERTIES, "Get") || m.is_method_call(PROPERTIES, "Set") {
        conn.reply_error_parts(
            m,
            "org.freedesktop.DBus.Error.UnknownProperty",
            "Unknown property or interface.".to_string(),
        )?;
    } else {
        conn.reply_error_parts(
            m,
            "org.freedesktop.DBus.Error.UnknownMethod",
            format!(
                "Unknown method '{}' or interface '{}'.",
                m.member().unwrap_or(""),
                m.interface().unwrap_or("")
            ),
        )?;
    }
    Ok(true)
}

/// Offer the message to the node at `node_path`.
fn object_find_and_run(
    conn: &mut Connection,
    m: &mut Message,
    node_path: &str,
    require_fallback: bool,
    found_object: &mut bool,
) -> Result<bool> {
    if !conn.objects.contains(node_path) {
        return Ok(false);
    }

    if node_callbacks_run(conn, m, node_path, require_fallback, found_object)? {
        return Ok(true);
    }

    let (Some(interface), Some(member)) = (
        m.interface().map(str::to_string),
        m.member().map(str::to_string),
    ) else {
        return Ok(false);
    };

    if let Some(slot) = conn.objects.method_slot(node_path, &interface, &member) {
        if method_callbacks_run(conn, m, node_path, &slot, require_fallback, found_object)? {
            return Ok(true);
        }
    }

    if interface == PROPERTIES {
        if member == "Get" || member == "Set" {
            let is_get = member == "Get";

            m.rewind();
            let (Some(target_interface), Some(target_member)) = (
                m.read_str().map(str::to_string),
                m.read_str().map(str::to_string),
            ) else {
                return Err(Error::Protocol("malformed Properties call".into()));
            };

            if let Some(slot) =
                conn.objects
                    .property_slot(node_path, &target_interface, &target_member)
            {
                if property_get_set_run(
                    conn,
                    m,
                    node_path,
                    &slot,
                    &target_member,
                    require_fallback,
                    is_get,
                    found_object,
                )? {
                    return Ok(true);
                }
            }
        } else if member == "GetAll" {
            m.rewind();
            let Some(target_interface) = m.read_str().map(str::to_string) else {
                return Err(Error::Protocol("malformed Properties call".into()));
            };
            let filter = if target_interface.is_empty() {
                None
            } else {
                Some(target_interface.as_str())
            };

            if property_get_all_run(conn, m, node_path, require_fallback, filter, found_object)? {
                return Ok(true);
            }
        }
    } else if m.is_method_call(INTROSPECTABLE, "Introspect") {
        if process_introspect(conn, m, node_path, require_fallback, found_object)? {
            return Ok(true);
        }
    } else if m.is_method_call(OBJECT_MANAGER, "GetManagedObjects") {
        if process_get_managed_objects(conn, m, node_path, require_fallback, found_object)? {
            return Ok(true);
        }
    }

    if !*found_object {
        let message_path = m.path().unwrap_or(node_path).to_string();
        if node_exists(conn, node_path, &message_path, require_fallback)? {
            *found_object = true;
        }
    }

    Ok(false)
}

/// Whether anything is attached directly to this node for the request.
fn node_exists(
    conn: &mut Connection,
    node_path: &str,
    message_path: &str,
    require_fallback: bool,
) -> Result<bool> {
    let Some(node) = conn.objects.node(node_path) else {
        return Ok(false);
    };

    if node
        .callbacks
        .iter()
        .any(|c| !require_fallback || c.is_fallback)
    {
        return Ok(true);
    }

    let has_enumerator_or_manager = !node.enumerators.is_empty() || node.object_manager;

    for reg in conn.objects.vtables_of(node_path) {
        if require_fallback && !reg.is_fallback {
            continue;
        }
        if vtable_object_exists(&reg.find, message_path, &reg.interface)? {
            return Ok(true);
        }
    }

    Ok(!require_fallback && has_enumerator_or_manager)
}

/// Run a fallback registration's find hook, if any.
fn vtable_object_exists(
    find: &Option<crate::object::vtable::FindHandler>,
    path: &str,
    interface: &str,
) -> Result<bool> {
    match find {
        None => Ok(true),
        Some(find) => find(path, interface),
    }
}

// ============================================================================
// Plain callbacks
// ============================================================================

fn node_callbacks_run(
    conn: &mut Connection,
    m: &mut Message,
    node_path: &str,
    require_fallback: bool,
    found_object: &mut bool,
) -> Result<bool> {
    // Snapshot the registrations; callbacks may mutate the node.
    let snapshot: Vec<_> = match conn.objects.node(node_path) {
        Some(node) => node
            .callbacks
            .iter()
            .map(|c| (c.slot, c.callback.clone(), c.is_fallback))
            .collect(),
        None => return Ok(false),
    };

    let iteration = conn.iteration;
    for (slot, callback, is_fallback) in snapshot {
        if require_fallback && !is_fallback {
            continue;
        }

        *found_object = true;

        if !conn.objects.stamp_callback(node_path, slot, iteration) {
            continue; // removed meanwhile, or already ran this iteration
        }

        m.rewind();
        if callback(conn, m)? {
            return Ok(true);
        }
    }

    Ok(false)
}

// ============================================================================
// Methods
// ============================================================================

fn method_callbacks_run(
    conn: &mut Connection,
    m: &mut Message,
    node_path: &str,
    slot: &MemberSlot,
    require_fallback: bool,
    found_object: &mut bool,
) -> Result<bool> {
    if require_fallback && !slot.is_fallback {
        return Ok(false);
    }

    let message_path = m.path().unwrap_or(node_path).to_string();
    if !vtable_object_exists(&slot.find, &message_path, &slot.interface)? {
        return Ok(false);
    }

    *found_object = true;

    let VtableEntry::Method(entry) = &slot.vtable.entries()[slot.entry_index] else {
        return Ok(false);
    };
    let member = entry.member.clone();

    if !conn
        .objects
        .stamp_method(node_path, &slot.interface, &member, conn.iteration)
    {
        return Ok(false);
    }

    m.rewind();
    let signature = m.signature();
    if entry.signature != signature {
        conn.reply_error_parts(
            m,
            "org.freedesktop.DBus.Error.InvalidArgs",
            format!(
                "Invalid arguments '{}' to call {}.{}, expecting '{}'.",
                signature, slot.interface, member, entry.signature
            ),
        )?;
        return Ok(true);
    }

    let handler = entry.handler.clone();
    handler(conn, m)
}

// ============================================================================
// Properties: Get and Set
// ============================================================================

#[allow(clippy::too_many_arguments)]
fn property_get_set_run(
    conn: &mut Connection,
    m: &mut Message,
    node_path: &str,
    slot: &MemberSlot,
    member: &str,
    require_fallback: bool,
    is_get: bool,
    found_object: &mut bool,
) -> Result<bool> {
    if require_fallback && !slot.is_fallback {
        return Ok(false);
    }

    let message_path = m.path().unwrap_or(node_path).to_string();
    if !vtable_object_exists(&slot.find, &message_path, &slot.interface)? {
        return Ok(false);
    }

    *found_object = true;

    if !conn
        .objects
        .stamp_property(node_path, &slot.interface, member, conn.iteration)
    {
        return Ok(false);
    }

    let VtableEntry::Property(entry) = &slot.vtable.entries()[slot.entry_index] else {
        return Ok(false);
    };

    let context = PropertyContext {
        path: &message_path,
        interface: &slot.interface,
        member,
    };

    if is_get {
        let value = match (entry.getter)(&context) {
            Ok(value) => value,
            Err(error) => {
                conn.reply_method_error(m, error)?;
                return Ok(true);
            }
        };

        let mut reply = Message::method_return(m)?;
        reply.append(Value::variant(value))?;
        conn.send_reply(reply)?;
        return Ok(true);
    }

    // Set: read-only properties reject, writable ones unwrap the variant.
    let Some(setter) = entry.setter.clone() else {
        conn.reply_error_parts(
            m,
            "org.freedesktop.DBus.Error.PropertyReadOnly",
            format!("Property '{}' is not writable.", member),
        )?;
        return Ok(true);
    };

    let value = match m.body().get(2) {
        Some(Value::Variant(inner)) => (**inner).clone(),
        _ => {
            return Err(Error::Protocol("malformed Properties.Set call".into()));
        }
    };

    if value.signature() != entry.signature {
        conn.reply_error_parts(
            m,
            "org.freedesktop.DBus.Error.InvalidArgs",
            format!(
                "Value of type '{}' for property '{}' of type '{}'.",
                value.signature(),
                member,
                entry.signature
            ),
        )?;
        return Ok(true);
    }

    match setter(&context, value) {
        Ok(()) => {
            let reply = Message::method_return(m)?;
            conn.send_reply(reply)?;
        }
        Err(error) => conn.reply_method_error(m, error)?,
    }
    Ok(true)
}

// ============================================================================
// Properties: GetAll
// ============================================================================

fn property_get_all_run(
    conn: &mut Connection,
    m: &mut Message,
    node_path: &str,
    require_fallback: bool,
    interface_filter: Option<&str>,
    found_object: &mut bool,
) -> Result<bool> {
    let message_path = m.path().unwrap_or(node_path).to_string();
    let regs = conn.objects.vtables_of(node_path);

    let mut found_interface = false;
    let mut entries: Vec<(String, Value)> = Vec::new();

    for reg in regs {
        if require_fallback && !reg.is_fallback {
            continue;
        }
        if !vtable_object_exists(&reg.find, &message_path, &reg.interface)? {
            continue;
        }

        *found_object = true;

        if let Some(filter) = interface_filter {
            if reg.interface != filter {
                continue;
            }
        }
        found_interface = true;

        conn.objects
            .stamp_vtable(node_path, &reg.interface, conn.iteration);

        for property in reg.vtable.properties() {
            let context = PropertyContext {
                path: &message_path,
                interface: &reg.interface,
                member: &property.member,
            };
            match (property.getter)(&context) {
                Ok(value) => entries.push((property.member.clone(), value)),
                Err(error) => {
                    conn.reply_method_error(m, error)?;
                    return Ok(true);
                }
            }
        }
    }

    if !found_interface {
        if let Some(filter) = interface_filter {
            if *found_object {
                conn.reply_error_parts(
                    m,
                    "org.freedesktop.DBus.Error.UnknownInterface",
                    format!("Unknown interface '{}'.", filter),
                )?;
                return Ok(true);
            }
        }
        return Ok(false);
    }

    let mut reply = Message::method_return(m)?;
    reply.append(Value::property_dict(entries))?;
    conn.send_reply(reply)?;
    Ok(true)
}

// ============================================================================
// Introspection
// ============================================================================

fn process_introspect(
    conn: &mut Connection,
    m: &mut Message,
    node_path: &str,
    require_fallback: bool,
    found_object: &mut bool,
) -> Result<bool> {
    let message_path = m.path().unwrap_or(node_path).to_string();
    let children = conn.objects.child_paths_at(node_path, &message_path)?;

    let mut intro = Introspection::new();
    intro.write_default_interfaces(conn.objects.object_manager_covers(node_path));

    let mut empty = children.is_empty();
    for reg in conn.objects.vtables_of(node_path) {
        if require_fallback && !reg.is_fallback {
            continue;
        }
        if !vtable_object_exists(&reg.find, &message_path, &reg.interface)? {
            continue;
        }

        empty = false;
        intro.write_interface(&reg.interface, &reg.vtable);
    }

    if empty && !node_exists(conn, node_path, &message_path, require_fallback)? {
        // Nothing here at all; refuse to claim the object.
        return Ok(false);
    }

    *found_object = true;

    intro.write_child_nodes(&children, &message_path);

    let mut reply = Message::method_return(m)?;
    reply.append(Value::string(intro.finish()))?;
    conn.send_reply(reply)?;
    Ok(true)
}

// ============================================================================
// Object manager
// ============================================================================

fn process_get_managed_objects(
    conn: &mut Connection,
    m: &mut Message,
    node_path: &str,
    require_fallback: bool,
    found_object: &mut bool,
) -> Result<bool> {
    if !conn.objects.object_manager_covers(node_path) {
        return Ok(false);
    }

    let message_path = m.path().unwrap_or(node_path).to_string();
    let children = conn.objects.child_paths_at(node_path, &message_path)?;

    if children.is_empty() {
        // No children: only answer if at least one vtable lives here.
        let any = conn
            .objects
            .vtables_of(node_path)
            .iter()
            .any(|reg| !require_fallback || reg.is_fallback);
        if !any {
            return Ok(false);
        }
    }

    let mut objects: Vec<Value> = Vec::new();
    for child in &children {
        match serialize_managed_path(conn, child)? {
            Ok(interfaces) => objects.push(Value::DictEntry(
                Box::new(Value::object_path(child.clone())),
                Box::new(Value::Array {
                    element: "{sa{sv}}".into(),
                    items: interfaces,
                }),
            )),
            Err(error) => {
                conn.reply_method_error(m, error)?;
                return Ok(true);
            }
        }
    }

    *found_object = true;

    let mut reply = Message::method_return(m)?;
    reply.append(Value::Array {
        element: "{oa{sa{sv}}}".into(),
        items: objects,
    })?;
    conn.send_reply(reply)?;
    Ok(true)
}

/// Serialize one managed path: its own vtables, then fallback vtables
/// inherited from every proper ancestor.
fn serialize_managed_path(
    conn: &mut Connection,
    path: &str,
) -> Result<std::result::Result<Vec<Value>, BusError>> {
    let mut interfaces = Vec::new();

    match serialize_vtables_at(conn, path, path, false)? {
        Ok(items) => interfaces.extend(items),
        Err(e) => return Ok(Err(e)),
    }

    let mut prefix = path.to_string();
    loop {
        let Some(parent) = parent_path(&prefix) else {
            break;
        };
        if parent == "/" {
            break;
        }
        prefix = parent.to_string();

        match serialize_vtables_at(conn, &prefix, path, true)? {
            Ok(items) => interfaces.extend(items),
            Err(e) => return Ok(Err(e)),
        }
    }

    Ok(Ok(interfaces))
}

fn serialize_vtables_at(
    conn: &mut Connection,
    node_path: &str,
    object_path: &str,
    require_fallback: bool,
) -> Result<std::result::Result<Vec<Value>, BusError>> {
    let mut out = Vec::new();

    for reg in conn.objects.vtables_of(node_path) {
        if require_fallback && !reg.is_fallback {
            continue;
        }
        if !vtable_object_exists(&reg.find, object_path, &reg.interface)? {
            continue;
        }

        let mut entries: Vec<(String, Value)> = Vec::new();
        for property in reg.vtable.properties() {
            let context = PropertyContext {
                path: object_path,
                interface: &reg.interface,
                member: &property.member,
            };
            match (property.getter)(&context) {
                Ok(value) => entries.push((property.member.clone(), value)),
                Err(error) => return Ok(Err(error)),
            }
        }

        out.push(Value::DictEntry(
            Box::new(Value::Str(reg.interface.clone())),
            Box::new(Value::property_dict(entries)),
        ));
    }

    Ok(Ok(out))
}

// ============================================================================
// PropertiesChanged emission
// ============================================================================

/// Emit the PropertiesChanged signal for `names` on `interface` at `path`.
///
/// The responsible vtable is searched at the exact path first, then at
/// ancestor prefixes; every named property must exist there and carry the
/// emits-change flag.
pub(crate) fn emit_properties_changed(
    conn: &mut Connection,
    path: &str,
    interface: &str,
    names: &[&str],
) -> Result<()> {
    if !object_path_is_valid(path) {
        return Err(Error::InvalidArgument(format!("object path '{}'", path)));
    }
    if !interface_name_is_valid(interface) {
        return Err(Error::InvalidArgument(format!(
            "interface name '{}'",
            interface
        )));
    }

    if emit_properties_changed_on_prefix(conn, path, path, interface, false, names)? {
        return Ok(());
    }

    let mut prefix = path.to_string();
    while prefix != "/" {
        prefix = match parent_path(&prefix) {
            Some(p) => p.to_string(),
            None => break,
        };
        if emit_properties_changed_on_prefix(conn, &prefix, path, interface, true, names)? {
            return Ok(());
        }
    }

    Err(Error::NotFound(format!(
        "no vtable for '{}' at '{}'",
        interface, path
    )))
}

fn emit_properties_changed_on_prefix(
    conn: &mut Connection,
    prefix: &str,
    path: &str,
    interface: &str,
    require_fallback: bool,
    names: &[&str],
) -> Result<bool> {
    if !conn.objects.contains(prefix) {
        return Ok(false);
    }

    let matched = conn.objects.vtables_of(prefix).into_iter().find(|reg| {
        (!require_fallback || reg.is_fallback) && reg.interface == interface
    });
    let Some(reg) = matched else {
        return Ok(false);
    };
    if !vtable_object_exists(&reg.find, path, interface)? {
        return Ok(false);
    }

    let mut changed: Vec<(String, Value)> = Vec::new();
    let mut invalidated: Vec<Value> = Vec::new();

    for name in names {
        let Some(slot) = conn.objects.property_slot(prefix, interface, name) else {
            return Err(Error::NotFound(format!(
                "property '{}' on '{}'",
                name, interface
            )));
        };

        let VtableEntry::Property(entry) = &slot.vtable.entries()[slot.entry_index] else {
            return Err(Error::NotFound(format!("property '{}'", name)));
        };

        if !entry.flags.contains(VtableFlags::EMITS_CHANGE) {
            return Err(Error::InvalidArgument(format!(
                "property '{}' does not emit change notifications",
                name
            )));
        }

        if entry.flags.contains(VtableFlags::INVALIDATE_ONLY) {
            invalidated.push(Value::string(*name));
            continue;
        }

        let context = PropertyContext {
            path,
            interface,
            member: name,
        };
        match (entry.getter)(&context) {
            Ok(value) => changed.push(((*name).to_string(), value)),
            Err(error) => return Err(Error::Remote(error)),
        }
    }

    let mut signal = Message::signal(path, PROPERTIES, "PropertiesChanged")?;
    signal.append(Value::string(interface))?;
    signal.append(Value::property_dict(changed))?;
    signal.append(Value::Array {
        element: "s".into(),
        items: invalidated,
    })?;
    conn.send(signal)?;

    Ok(true)
}
