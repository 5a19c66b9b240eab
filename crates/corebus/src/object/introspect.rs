// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Introspection XML generation.
//!
//! Renders the standard D-Bus introspection document for a node: the default
//! interfaces, every interface vtable attached (or inherited via fallback),
//! and the child nodes. Names never need XML escaping; everything written
//! here has passed the naming validators.

use std::collections::BTreeSet;

use crate::names::{object_path_startswith, signature_split};
use crate::object::vtable::{Vtable, VtableFlags};

const DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\" \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

/// Incremental introspection document builder.
pub(crate) struct Introspection {
    xml: String,
}

impl Introspection {
    pub fn new() -> Introspection {
        let mut xml = String::from(DOCTYPE);
        xml.push_str("<node>\n");
        Introspection { xml }
    }

    /// The interfaces every object answers for.
    pub fn write_default_interfaces(&mut self, with_object_manager: bool) {
        self.xml.push_str(
            " <interface name=\"org.freedesktop.DBus.Peer\">\n\
             \x20 <method name=\"Ping\"/>\n\
             \x20 <method name=\"GetMachineId\">\n\
             \x20  <arg type=\"s\" name=\"machine_uuid\" direction=\"out\"/>\n\
             \x20 </method>\n\
             \x20</interface>\n\
             \x20<interface name=\"org.freedesktop.DBus.Introspectable\">\n\
             \x20 <method name=\"Introspect\">\n\
             \x20  <arg name=\"data\" type=\"s\" direction=\"out\"/>\n\
             \x20 </method>\n\
             \x20</interface>\n\
             \x20<interface name=\"org.freedesktop.DBus.Properties\">\n\
             \x20 <method name=\"Get\">\n\
             \x20  <arg name=\"interface\" direction=\"in\" type=\"s\"/>\n\
             \x20  <arg name=\"property\" direction=\"in\" type=\"s\"/>\n\
             \x20  <arg name=\"value\" direction=\"out\" type=\"v\"/>\n\
             \x20 </method>\n\
             \x20 <method name=\"GetAll\">\n\
             \x20  <arg name=\"interface\" direction=\"in\" type=\"s\"/>\n\
             \x20  <arg name=\"properties\" direction=\"out\" type=\"a{sv}\"/>\n\
             \x20 </method>\n\
             \x20 <method name=\"Set\">\n\
             \x20  <arg name=\"interface\" direction=\"in\" type=\"s\"/>\n\
             \x20  <arg name=\"property\" direction=\"in\" type=\"s\"/>\n\
             \x20  <arg name=\"value\" direction=\"in\" type=\"v\"/>\n\
             \x20 </method>\n\
             \x20 <signal name=\"PropertiesChanged\">\n\
             \x20  <arg type=\"s\" name=\"interface\"/>\n\
             \x20  <arg type=\"a{sv}\" name=\"changed_properties\"/>\n\
             \x20  <arg type=\"as\" name=\"invalidated_properties\"/>\n\
             \x20 </signal>\n\
             \x20</interface>\n",
        );

        if with_object_manager {
            self.xml.push_str(
                " <interface name=\"org.freedesktop.DBus.ObjectManager\">\n\
                 \x20 <method name=\"GetManagedObjects\">\n\
                 \x20  <arg type=\"a{oa{sa{sv}}}\" name=\"object_paths_interfaces_and_properties\" direction=\"out\"/>\n\
                 \x20 </method>\n\
                 \x20</interface>\n",
            );
        }
    }

    /// One user interface with its methods, properties and signals.
    pub fn write_interface(&mut self, name: &str, vtable: &Vtable) {
        self.xml.push_str(&format!(" <interface name=\"{}\">\n", name));

        for method in vtable.methods() {
            if method.flags.contains(VtableFlags::HIDDEN) {
                continue;
            }

            self.xml
                .push_str(&format!("  <method name=\"{}\">\n", method.member));
            self.write_args(&method.signature, "in");
            self.write_args(&method.result, "out");
            if method.flags.contains(VtableFlags::DEPRECATED) {
                self.xml.push_str(
                    "   <annotation name=\"org.freedesktop.DBus.Deprecated\" value=\"true\"/>\n",
                );
            }
            if method.flags.contains(VtableFlags::METHOD_NO_REPLY) {
                self.xml.push_str(
                    "   <annotation name=\"org.freedesktop.DBus.Method.NoReply\" value=\"true\"/>\n",
                );
            }
            self.xml.push_str("  </method>\n");
        }

        for property in vtable.properties() {
            if property.flags.contains(VtableFlags::HIDDEN) {
                continue;
            }

            let access = if property.writable() {
                "readwrite"
            } else {
                "read"
            };
            self.xml.push_str(&format!(
                "  <property name=\"{}\" type=\"{}\" access=\"{}\">\n",
                property.member, property.signature, access
            ));
            if property.flags.contains(VtableFlags::DEPRECATED) {
                self.xml.push_str(
                    "   <annotation name=\"org.freedesktop.DBus.Deprecated\" value=\"true\"/>\n",
                );
            }
            if property.flags.contains(VtableFlags::EMITS_CHANGE) {
                let value = if property.flags.contains(VtableFlags::INVALIDATE_ONLY) {
                    "invalidates"
                } else {
                    "true"
                };
                self.xml.push_str(&format!(
                    "   <annotation name=\"org.freedesktop.DBus.Property.EmitsChangedSignal\" value=\"{}\"/>\n",
                    value
                ));
            }
            self.xml.push_str("  </property>\n");
        }

        for signal in vtable.signals() {
            if signal.flags.contains(VtableFlags::HIDDEN) {
                continue;
            }

            self.xml
                .push_str(&format!("  <signal name=\"{}\">\n", signal.member));
            self.write_args(&signal.signature, "");
            if signal.flags.contains(VtableFlags::DEPRECATED) {
                self.xml.push_str(
                    "   <annotation name=\"org.freedesktop.DBus.Deprecated\" value=\"true\"/>\n",
                );
            }
            self.xml.push_str("  </signal>\n");
        }

        self.xml.push_str(" </interface>\n");
    }

    fn write_args(&mut self, signature: &str, direction: &str) {
        let Some(types) = signature_split(signature) else {
            return;
        };
        for ty in types {
            if direction.is_empty() {
                self.xml.push_str(&format!("   <arg type=\"{}\"/>\n", ty));
            } else {
                self.xml.push_str(&format!(
                    "   <arg type=\"{}\" direction=\"{}\"/>\n",
                    ty, direction
                ));
            }
        }
    }

    /// Child node elements, named relative to `prefix`.
    pub fn write_child_nodes(&mut self, children: &BTreeSet<String>, prefix: &str) {
        for child in children {
            if let Some(relative) = object_path_startswith(child, prefix) {
                if !relative.is_empty() {
                    self.xml
                        .push_str(&format!(" <node name=\"{}\"/>\n", relative));
                }
            }
        }
    }

    pub fn finish(mut self) -> String {
        self.xml.push_str("</node>\n");
        self.xml
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Value;
    use std::rc::Rc;

    fn sample_vtable() -> Vtable {
        Vtable::builder()
            .method("Frob", "su", "b", Rc::new(|_, _| Ok(true)))
            .property("Color", "s", Rc::new(|_| Ok(Value::string("red"))))
            .property_full(
                "Level",
                "u",
                Rc::new(|_| Ok(Value::U32(1))),
                Some(Rc::new(|_, _| Ok(()))),
                VtableFlags::EMITS_CHANGE,
            )
            .signal("Changed", "s")
            .build()
    }

    #[test]
    fn test_document_shape() {
        let mut intro = Introspection::new();
        intro.write_default_interfaces(false);
        intro.write_interface("org.example.Iface", &sample_vtable());

        let mut children = BTreeSet::new();
        children.insert("/o/a".to_string());
        children.insert("/o/a/b".to_string());
        intro.write_child_nodes(&children, "/o");

        let xml = intro.finish();
        assert!(xml.starts_with("<!DOCTYPE node"));
        assert!(xml.ends_with("</node>\n"));
        assert!(xml.contains("<interface name=\"org.freedesktop.DBus.Peer\">"));
        assert!(xml.contains("<interface name=\"org.freedesktop.DBus.Properties\">"));
        assert!(!xml.contains("ObjectManager"));
        assert!(xml.contains("<interface name=\"org.example.Iface\">"));
        assert!(xml.contains("<method name=\"Frob\">"));
        assert!(xml.contains("<arg type=\"s\" direction=\"in\"/>"));
        assert!(xml.contains("<arg type=\"u\" direction=\"in\"/>"));
        assert!(xml.contains("<arg type=\"b\" direction=\"out\"/>"));
        assert!(xml.contains("<property name=\"Color\" type=\"s\" access=\"read\">"));
        assert!(xml.contains("<property name=\"Level\" type=\"u\" access=\"readwrite\">"));
        assert!(xml.contains("EmitsChangedSignal\" value=\"true\""));
        assert!(xml.contains("<signal name=\"Changed\">"));
        assert!(xml.contains("<node name=\"a\"/>"));
        assert!(xml.contains("<node name=\"a/b\"/>"));
    }

    #[test]
    fn test_object_manager_advertised_when_flagged() {
        let mut intro = Introspection::new();
        intro.write_default_interfaces(true);
        let xml = intro.finish();
        assert!(xml.contains("org.freedesktop.DBus.ObjectManager"));
        assert!(xml.contains("GetManagedObjects"));
    }

    #[test]
    fn test_hidden_entries_skipped() {
        let vt = Vtable::builder()
            .method_with_flags("Secret", "", "", Rc::new(|_, _| Ok(true)), VtableFlags::HIDDEN)
            .method("Public", "", "", Rc::new(|_, _| Ok(true)))
            .build();

        let mut intro = Introspection::new();
        intro.write_interface("org.example.Iface", &vt);
        let xml = intro.finish();
        assert!(!xml.contains("Secret"));
        assert!(xml.contains("Public"));
    }

    #[test]
    fn test_invalidates_annotation() {
        let vt = Vtable::builder()
            .property_full(
                "P",
                "s",
                Rc::new(|_| Ok(Value::string(""))),
                None,
                VtableFlags::EMITS_CHANGE | VtableFlags::INVALIDATE_ONLY,
            )
            .build();

        let mut intro = Introspection::new();
        intro.write_interface("org.example.Iface", &vt);
        let xml = intro.finish();
        assert!(xml.contains("value=\"invalidates\""));
    }
}
