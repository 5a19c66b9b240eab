// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Interface vtables.
//!
//! A vtable describes one interface: its methods, properties and signals, in
//! declaration order. Vtables are built with [`VtableBuilder`] and validated
//! when they are attached to the object tree, so dispatch can trust every
//! entry.

use std::rc::Rc;

use crate::connection::MessageHandler;
use crate::error::{Error, Result};
use crate::message::{BusError, Value};
use crate::names::{member_name_is_valid, signature_is_single, signature_is_valid};

// ============================================================================
// Handler types
// ============================================================================

/// Addressing context handed to property accessors.
#[derive(Clone, Copy, Debug)]
pub struct PropertyContext<'a> {
    pub path: &'a str,
    pub interface: &'a str,
    pub member: &'a str,
}

/// Produces the current value of a property.
pub type PropertyGetter = Rc<dyn Fn(&PropertyContext<'_>) -> std::result::Result<Value, BusError>>;

/// Applies a new value to a writable property.
pub type PropertySetter =
    Rc<dyn Fn(&PropertyContext<'_>, Value) -> std::result::Result<(), BusError>>;

/// Decides whether a dynamic object exists at a path served by a fallback
/// vtable. Arguments are the concrete path and the interface.
pub type FindHandler = Rc<dyn Fn(&str, &str) -> Result<bool>>;

/// Produces dynamic child paths below a prefix.
pub type EnumeratorHandler = Rc<dyn Fn(&str) -> Result<Vec<String>>>;

// ============================================================================
// Flags
// ============================================================================

/// Per-entry flag bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VtableFlags(u32);

impl VtableFlags {
    /// Entry is deprecated; reflected in introspection.
    pub const DEPRECATED: VtableFlags = VtableFlags(0x1);
    /// Entry is hidden from introspection.
    pub const HIDDEN: VtableFlags = VtableFlags(0x2);
    /// Method callers are expected not to wait for a reply.
    pub const METHOD_NO_REPLY: VtableFlags = VtableFlags(0x4);
    /// Property changes are announced with PropertiesChanged.
    pub const EMITS_CHANGE: VtableFlags = VtableFlags(0x8);
    /// PropertiesChanged carries the name only, not the new value.
    /// Requires [`VtableFlags::EMITS_CHANGE`].
    pub const INVALIDATE_ONLY: VtableFlags = VtableFlags(0x10);

    pub fn empty() -> VtableFlags {
        VtableFlags(0)
    }

    pub fn contains(self, other: VtableFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: VtableFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for VtableFlags {
    type Output = VtableFlags;

    fn bitor(self, rhs: VtableFlags) -> VtableFlags {
        VtableFlags(self.0 | rhs.0)
    }
}

// ============================================================================
// Entries
// ============================================================================

pub struct MethodEntry {
    pub member: String,
    /// Input signature, compared against incoming calls.
    pub signature: String,
    /// Output signature, for introspection.
    pub result: String,
    pub handler: MessageHandler,
    pub flags: VtableFlags,
}

pub struct PropertyEntry {
    pub member: String,
    /// Single complete type.
    pub signature: String,
    pub getter: PropertyGetter,
    /// Present on writable properties.
    pub setter: Option<PropertySetter>,
    pub flags: VtableFlags,
}

impl PropertyEntry {
    pub fn writable(&self) -> bool {
        self.setter.is_some()
    }
}

pub struct SignalEntry {
    pub member: String,
    pub signature: String,
    pub flags: VtableFlags,
}

pub enum VtableEntry {
    Method(MethodEntry),
    Property(PropertyEntry),
    Signal(SignalEntry),
}

// ============================================================================
// Vtable
// ============================================================================

/// An ordered interface description.
pub struct Vtable {
    entries: Vec<VtableEntry>,
}

impl Vtable {
    pub fn builder() -> VtableBuilder {
        VtableBuilder {
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[VtableEntry] {
        &self.entries
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodEntry> {
        self.entries.iter().filter_map(|e| match e {
            VtableEntry::Method(m) => Some(m),
            _ => None,
        })
    }

    pub fn properties(&self) -> impl Iterator<Item = &PropertyEntry> {
        self.entries.iter().filter_map(|e| match e {
            VtableEntry::Property(p) => Some(p),
            _ => None,
        })
    }

    pub fn signals(&self) -> impl Iterator<Item = &SignalEntry> {
        self.entries.iter().filter_map(|e| match e {
            VtableEntry::Signal(s) => Some(s),
            _ => None,
        })
    }

    /// Find a property entry and its index by member name.
    pub(crate) fn property(&self, member: &str) -> Option<(usize, &PropertyEntry)> {
        self.entries.iter().enumerate().find_map(|(i, e)| match e {
            VtableEntry::Property(p) if p.member == member => Some((i, p)),
            _ => None,
        })
    }

    /// Validate every entry; run when the vtable is attached to a node.
    pub(crate) fn validate(&self) -> Result<()> {
        let mut members: Vec<&str> = Vec::new();

        for entry in &self.entries {
            let member = match entry {
                VtableEntry::Method(m) => {
                    if !signature_is_valid(&m.signature) || !signature_is_valid(&m.result) {
                        return Err(Error::InvalidArgument(format!(
                            "method '{}' has a malformed signature",
                            m.member
                        )));
                    }
                    if m.flags
                        .intersects(VtableFlags::EMITS_CHANGE | VtableFlags::INVALIDATE_ONLY)
                    {
                        return Err(Error::InvalidArgument(format!(
                            "method '{}' carries property flags",
                            m.member
                        )));
                    }
                    &m.member
                }

                VtableEntry::Property(p) => {
                    if !signature_is_single(&p.signature) {
                        return Err(Error::InvalidArgument(format!(
                            "property '{}' needs a single complete type",
                            p.member
                        )));
                    }
                    if p.flags.contains(VtableFlags::METHOD_NO_REPLY) {
                        return Err(Error::InvalidArgument(format!(
                            "property '{}' carries method flags",
                            p.member
                        )));
                    }
                    if p.flags.contains(VtableFlags::INVALIDATE_ONLY)
                        && !p.flags.contains(VtableFlags::EMITS_CHANGE)
                    {
                        return Err(Error::InvalidArgument(format!(
                            "property '{}': invalidate-only requires emits-change",
                            p.member
                        )));
                    }
                    &p.member
                }

                VtableEntry::Signal(s) => {
                    if !signature_is_valid(&s.signature) {
                        return Err(Error::InvalidArgument(format!(
                            "signal '{}' has a malformed signature",
                            s.member
                        )));
                    }
                    &s.member
                }
            };

            if !member_name_is_valid(member) {
                return Err(Error::InvalidArgument(format!("member name '{}'", member)));
            }
            if members.contains(&member.as_str()) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate member '{}'",
                    member
                )));
            }
            members.push(member.as_str());
        }

        Ok(())
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct VtableBuilder {
    entries: Vec<VtableEntry>,
}

impl VtableBuilder {
    /// Add a method with empty flags.
    pub fn method(
        self,
        member: impl Into<String>,
        signature: impl Into<String>,
        result: impl Into<String>,
        handler: MessageHandler,
    ) -> VtableBuilder {
        self.method_with_flags(member, signature, result, handler, VtableFlags::empty())
    }

    pub fn method_with_flags(
        mut self,
        member: impl Into<String>,
        signature: impl Into<String>,
        result: impl Into<String>,
        handler: MessageHandler,
        flags: VtableFlags,
    ) -> VtableBuilder {
        self.entries.push(VtableEntry::Method(MethodEntry {
            member: member.into(),
            signature: signature.into(),
            result: result.into(),
            handler,
            flags,
        }));
        self
    }

    /// Add a read-only property.
    pub fn property(
        self,
        member: impl Into<String>,
        signature: impl Into<String>,
        getter: PropertyGetter,
    ) -> VtableBuilder {
        self.property_full(member, signature, getter, None, VtableFlags::empty())
    }

    /// Add a writable property.
    pub fn writable_property(
        self,
        member: impl Into<String>,
        signature: impl Into<String>,
        getter: PropertyGetter,
        setter: PropertySetter,
    ) -> VtableBuilder {
        self.property_full(member, signature, getter, Some(setter), VtableFlags::empty())
    }

    pub fn property_full(
        mut self,
        member: impl Into<String>,
        signature: impl Into<String>,
        getter: PropertyGetter,
        setter: Option<PropertySetter>,
        flags: VtableFlags,
    ) -> VtableBuilder {
        self.entries.push(VtableEntry::Property(PropertyEntry {
            member: member.into(),
            signature: signature.into(),
            getter,
            setter,
            flags,
        }));
        self
    }

    pub fn signal(self, member: impl Into<String>, signature: impl Into<String>) -> VtableBuilder {
        self.signal_with_flags(member, signature, VtableFlags::empty())
    }

    pub fn signal_with_flags(
        mut self,
        member: impl Into<String>,
        signature: impl Into<String>,
        flags: VtableFlags,
    ) -> VtableBuilder {
        self.entries.push(VtableEntry::Signal(SignalEntry {
            member: member.into(),
            signature: signature.into(),
            flags,
        }));
        self
    }

    pub fn build(self) -> Vtable {
        Vtable {
            entries: self.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> MessageHandler {
        Rc::new(|_, _| Ok(true))
    }

    fn getter() -> PropertyGetter {
        Rc::new(|_| Ok(Value::string("v")))
    }

    fn setter() -> PropertySetter {
        Rc::new(|_, _| Ok(()))
    }

    #[test]
    fn test_valid_vtable() {
        let vt = Vtable::builder()
            .method("Frob", "su", "b", handler())
            .property("Color", "s", getter())
            .writable_property("Level", "u", getter(), setter())
            .signal("Changed", "sa{sv}as")
            .build();
        assert!(vt.validate().is_ok());
        assert_eq!(vt.methods().count(), 1);
        assert_eq!(vt.properties().count(), 2);
        assert_eq!(vt.signals().count(), 1);
    }

    #[test]
    fn test_bad_member_name() {
        let vt = Vtable::builder().method("2Fast", "", "", handler()).build();
        assert!(vt.validate().is_err());
    }

    #[test]
    fn test_bad_signatures() {
        let vt = Vtable::builder().method("M", "a", "", handler()).build();
        assert!(vt.validate().is_err());

        // Property signature must be a single complete type.
        let vt = Vtable::builder().property("P", "ss", getter()).build();
        assert!(vt.validate().is_err());
    }

    #[test]
    fn test_invalidate_only_requires_emits_change() {
        let vt = Vtable::builder()
            .property_full("P", "s", getter(), None, VtableFlags::INVALIDATE_ONLY)
            .build();
        assert!(vt.validate().is_err());

        let vt = Vtable::builder()
            .property_full(
                "P",
                "s",
                getter(),
                None,
                VtableFlags::EMITS_CHANGE | VtableFlags::INVALIDATE_ONLY,
            )
            .build();
        assert!(vt.validate().is_ok());
    }

    #[test]
    fn test_flag_kind_mismatch() {
        let vt = Vtable::builder()
            .method_with_flags("M", "", "", handler(), VtableFlags::EMITS_CHANGE)
            .build();
        assert!(vt.validate().is_err());

        let vt = Vtable::builder()
            .property_full("P", "s", getter(), None, VtableFlags::METHOD_NO_REPLY)
            .build();
        assert!(vt.validate().is_err());
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let vt = Vtable::builder()
            .method("M", "", "", handler())
            .method("M", "s", "", handler())
            .build();
        assert!(vt.validate().is_err());
    }

    #[test]
    fn test_property_lookup() {
        let vt = Vtable::builder()
            .method("M", "", "", handler())
            .property("P", "s", getter())
            .build();
        let (index, entry) = vt.property("P").expect("property");
        assert_eq!(index, 1);
        assert_eq!(entry.member, "P");
        assert!(vt.property("Q").is_none());
    }
}
