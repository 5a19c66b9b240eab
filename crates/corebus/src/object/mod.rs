// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The server-side object tree.
//!
//! Registered paths form a tree keyed by path string; registering any path
//! implicitly creates its ancestors as structural placeholders. A node can
//! carry plain callbacks, interface vtables, enumerators and the
//! object-manager flag. Two global `(path, interface, member)` indices
//! accelerate method and property dispatch.
//!
//! A node persists only while it has at least one child or attachment;
//! removals garbage-collect empty nodes up the parent chain. Every
//! structural mutation flips `modified`, which tells an in-flight dispatch
//! traversal to restart.

pub mod dispatch;
pub mod introspect;
pub mod vtable;

use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use crate::connection::MessageHandler;
use crate::error::{Error, Result};
use crate::names::{
    interface_name_is_valid, object_path_is_valid, object_path_startswith, parent_path,
};
use vtable::{EnumeratorHandler, FindHandler, Vtable, VtableEntry};

/// Opaque handle identifying one callback or enumerator registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotId(pub(crate) u64);

// ============================================================================
// Node contents
// ============================================================================

pub(crate) struct NodeCallback {
    pub slot: SlotId,
    pub callback: MessageHandler,
    pub is_fallback: bool,
    pub last_iteration: u64,
}

#[derive(Clone)]
pub(crate) struct NodeVtable {
    pub interface: String,
    pub is_fallback: bool,
    pub vtable: Rc<Vtable>,
    pub find: Option<FindHandler>,
    pub last_iteration: u64,
}

pub(crate) struct NodeEnumerator {
    pub slot: SlotId,
    pub callback: EnumeratorHandler,
}

pub(crate) struct Node {
    pub path: String,
    pub parent: Option<String>,
    pub children: BTreeSet<String>,
    pub callbacks: Vec<NodeCallback>,
    pub vtables: Vec<NodeVtable>,
    pub enumerators: Vec<NodeEnumerator>,
    pub object_manager: bool,
}

impl Node {
    fn new(path: &str, parent: Option<String>) -> Node {
        Node {
            path: path.to_string(),
            parent,
            children: BTreeSet::new(),
            callbacks: Vec::new(),
            vtables: Vec::new(),
            enumerators: Vec::new(),
            object_manager: false,
        }
    }

    /// A node with no attachment and no children is garbage.
    fn is_removable(&self) -> bool {
        self.children.is_empty()
            && self.callbacks.is_empty()
            && self.vtables.is_empty()
            && self.enumerators.is_empty()
            && !self.object_manager
    }
}

/// Everything dispatch needs about one indexed vtable member.
#[derive(Clone)]
pub(crate) struct MemberSlot {
    pub interface: String,
    pub is_fallback: bool,
    pub vtable: Rc<Vtable>,
    pub entry_index: usize,
    pub find: Option<FindHandler>,
    /// Dispatcher iteration this member last ran in.
    pub last_iteration: u64,
}

type MemberKey = (String, String, String);

// ============================================================================
// Tree
// ============================================================================

#[derive(Default)]
pub(crate) struct ObjectTree {
    nodes: HashMap<String, Node>,
    methods: HashMap<MemberKey, MemberSlot>,
    properties: HashMap<MemberKey, MemberSlot>,
    next_slot: u64,
    /// Structural change marker; dispatch restarts its traversal on it.
    pub modified: bool,
}

impl ObjectTree {
    pub fn new() -> ObjectTree {
        ObjectTree::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, path: &str) -> Option<&Node> {
        self.nodes.get(path)
    }

    pub fn node_mut(&mut self, path: &str) -> Option<&mut Node> {
        self.nodes.get_mut(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn method_slot(&self, path: &str, interface: &str, member: &str) -> Option<MemberSlot> {
        self.methods
            .get(&(path.to_string(), interface.to_string(), member.to_string()))
            .cloned()
    }

    pub fn property_slot(&self, path: &str, interface: &str, member: &str) -> Option<MemberSlot> {
        self.properties
            .get(&(path.to_string(), interface.to_string(), member.to_string()))
            .cloned()
    }

    fn next_slot(&mut self) -> SlotId {
        self.next_slot += 1;
        SlotId(self.next_slot)
    }

    /// Get or create the node at `path`, creating ancestors as needed.
    fn allocate(&mut self, path: &str) {
        if self.nodes.contains_key(path) {
            return;
        }

        let parent = parent_path(path).map(str::to_string);
        self.nodes
            .insert(path.to_string(), Node::new(path, parent.clone()));
        self.modified = true;

        if let Some(parent) = parent {
            self.allocate(&parent);
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.children.insert(path.to_string());
            }
        }
    }

    /// Release `path` and its ancestors while they stay removable.
    fn gc(&mut self, path: &str) {
        let mut cursor = Some(path.to_string());
        while let Some(p) = cursor {
            let removable = match self.nodes.get(&p) {
                Some(node) => node.is_removable(),
                None => false,
            };
            if !removable {
                break;
            }

            let parent = self.nodes.remove(&p).and_then(|n| n.parent);
            self.modified = true;
            if let Some(parent) = &parent {
                if let Some(pn) = self.nodes.get_mut(parent) {
                    pn.children.remove(&p);
                }
            }
            cursor = parent;
        }
    }

    // ========================================================================
    // Plain callbacks
    // ========================================================================

    pub fn add_callback(
        &mut self,
        path: &str,
        callback: MessageHandler,
        is_fallback: bool,
        current_iteration: u64,
    ) -> Result<SlotId> {
        if !object_path_is_valid(path) {
            return Err(Error::InvalidArgument(format!("object path '{}'", path)));
        }

        let slot = self.next_slot();
        self.allocate(path);
        if let Some(node) = self.nodes.get_mut(path) {
            node.callbacks.insert(
                0,
                NodeCallback {
                    slot,
                    callback,
                    is_fallback,
                    last_iteration: current_iteration,
                },
            );
        }
        self.modified = true;
        Ok(slot)
    }

    pub fn remove_callback(&mut self, path: &str, slot: SlotId) -> Result<bool> {
        if !object_path_is_valid(path) {
            return Err(Error::InvalidArgument(format!("object path '{}'", path)));
        }

        let Some(node) = self.nodes.get_mut(path) else {
            return Ok(false);
        };
        let before = node.callbacks.len();
        node.callbacks.retain(|c| c.slot != slot);
        if node.callbacks.len() == before {
            return Ok(false);
        }

        self.modified = true;
        self.gc(path);
        Ok(true)
    }

    // ========================================================================
    // Vtables
    // ========================================================================

    pub fn add_vtable(
        &mut self,
        path: &str,
        interface: &str,
        vtable: Vtable,
        is_fallback: bool,
        find: Option<FindHandler>,
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
        vtable.validate()?;

        if let Some(node) = self.nodes.get(path) {
            for existing in &node.vtables {
                if existing.interface == interface {
                    return Err(Error::AlreadyExists(format!(
                        "interface '{}' at '{}'",
                        interface, path
                    )));
                }
                if existing.is_fallback != is_fallback {
                    return Err(Error::WrongProtocol(format!(
                        "fallback and non-fallback vtables mixed at '{}'",
                        path
                    )));
                }
            }
        }

        self.allocate(path);
        let vtable = Rc::new(vtable);

        for (index, entry) in vtable.entries().iter().enumerate() {
            let (table, member) = match entry {
                VtableEntry::Method(m) => (&mut self.methods, m.member.as_str()),
                VtableEntry::Property(p) => (&mut self.properties, p.member.as_str()),
                VtableEntry::Signal(_) => continue,
            };

            table.insert(
                (path.to_string(), interface.to_string(), member.to_string()),
                MemberSlot {
                    interface: interface.to_string(),
                    is_fallback,
                    vtable: vtable.clone(),
                    entry_index: index,
                    find: find.clone(),
                    last_iteration: 0,
                },
            );
        }

        if let Some(node) = self.nodes.get_mut(path) {
            node.vtables.insert(
                0,
                NodeVtable {
                    interface: interface.to_string(),
                    is_fallback,
                    vtable,
                    find,
                    last_iteration: 0,
                },
            );
        }
        self.modified = true;
        Ok(())
    }

    pub fn remove_vtable(&mut self, path: &str, interface: &str, is_fallback: bool) -> Result<bool> {
        if !object_path_is_valid(path) {
            return Err(Error::InvalidArgument(format!("object path '{}'", path)));
        }
        if !interface_name_is_valid(interface) {
            return Err(Error::InvalidArgument(format!(
                "interface name '{}'",
                interface
            )));
        }

        let Some(node) = self.nodes.get_mut(path) else {
            return Ok(false);
        };
        let Some(position) = node
            .vtables
            .iter()
            .position(|v| v.interface == interface && v.is_fallback == is_fallback)
        else {
            return Ok(false);
        };
        let removed = node.vtables.remove(position);

        // Unindex by walking the vtable entries themselves, keyed on the
        // node path, the vtable's interface and each entry's member.
        for entry in removed.vtable.entries() {
            let (table, member) = match entry {
                VtableEntry::Method(m) => (&mut self.methods, m.member.as_str()),
                VtableEntry::Property(p) => (&mut self.properties, p.member.as_str()),
                VtableEntry::Signal(_) => continue,
            };
            table.remove(&(path.to_string(), interface.to_string(), member.to_string()));
        }

        self.modified = true;
        self.gc(path);
        Ok(true)
    }

    /// The vtable registrations at `path`, cloned for borrow-free dispatch.
    pub fn vtables_of(&self, path: &str) -> Vec<NodeVtable> {
        self.nodes
            .get(path)
            .map(|n| n.vtables.clone())
            .unwrap_or_default()
    }

    // ========================================================================
    // Enumerators
    // ========================================================================

    pub fn add_enumerator(&mut self, path: &str, callback: EnumeratorHandler) -> Result<SlotId> {
        if !object_path_is_valid(path) {
            return Err(Error::InvalidArgument(format!("object path '{}'", path)));
        }

        let slot = self.next_slot();
        self.allocate(path);
        if let Some(node) = self.nodes.get_mut(path) {
            node.enumerators.insert(0, NodeEnumerator { slot, callback });
        }
        self.modified = true;
        Ok(slot)
    }

    pub fn remove_enumerator(&mut self, path: &str, slot: SlotId) -> Result<bool> {
        if !object_path_is_valid(path) {
            return Err(Error::InvalidArgument(format!("object path '{}'", path)));
        }

        let Some(node) = self.nodes.get_mut(path) else {
            return Ok(false);
        };
        let before = node.enumerators.len();
        node.enumerators.retain(|e| e.slot != slot);
        if node.enumerators.len() == before {
            return Ok(false);
        }

        self.modified = true;
        self.gc(path);
        Ok(true)
    }

    // ========================================================================
    // Object manager flag
    // ========================================================================

    pub fn add_object_manager(&mut self, path: &str) -> Result<()> {
        if !object_path_is_valid(path) {
            return Err(Error::InvalidArgument(format!("object path '{}'", path)));
        }

        self.allocate(path);
        if let Some(node) = self.nodes.get_mut(path) {
            node.object_manager = true;
        }
        self.modified = true;
        Ok(())
    }

    pub fn remove_object_manager(&mut self, path: &str) -> Result<bool> {
        if !object_path_is_valid(path) {
            return Err(Error::InvalidArgument(format!("object path '{}'", path)));
        }

        let Some(node) = self.nodes.get_mut(path) else {
            return Ok(false);
        };
        if !node.object_manager {
            return Ok(false);
        }
        node.object_manager = false;

        self.modified = true;
        self.gc(path);
        Ok(true)
    }

    /// Whether `path` or any ancestor carries the object-manager flag.
    pub fn object_manager_covers(&self, path: &str) -> bool {
        let mut cursor = Some(path);
        while let Some(p) = cursor {
            if self.nodes.get(p).is_some_and(|n| n.object_manager) {
                return true;
            }
            cursor = parent_path(p);
        }
        false
    }

    // ========================================================================
    // Iteration stamps
    // ========================================================================

    /// Check-and-stamp a method member for `iteration`. `false` means it
    /// already ran this iteration (a restarted traversal must skip it).
    pub fn stamp_method(
        &mut self,
        path: &str,
        interface: &str,
        member: &str,
        iteration: u64,
    ) -> bool {
        Self::stamp_member(&mut self.methods, path, interface, member, iteration)
    }

    /// Check-and-stamp a property member for `iteration`.
    pub fn stamp_property(
        &mut self,
        path: &str,
        interface: &str,
        member: &str,
        iteration: u64,
    ) -> bool {
        Self::stamp_member(&mut self.properties, path, interface, member, iteration)
    }

    fn stamp_member(
        table: &mut HashMap<MemberKey, MemberSlot>,
        path: &str,
        interface: &str,
        member: &str,
        iteration: u64,
    ) -> bool {
        let Some(slot) =
            table.get_mut(&(path.to_string(), interface.to_string(), member.to_string()))
        else {
            return false;
        };
        if slot.last_iteration == iteration {
            return false;
        }
        slot.last_iteration = iteration;
        true
    }

    /// Check-and-stamp a whole vtable registration (used by GetAll).
    pub fn stamp_vtable(&mut self, path: &str, interface: &str, iteration: u64) -> bool {
        let Some(node) = self.nodes.get_mut(path) else {
            return false;
        };
        let Some(reg) = node.vtables.iter_mut().find(|v| v.interface == interface) else {
            return false;
        };
        if reg.last_iteration == iteration {
            return false;
        }
        reg.last_iteration = iteration;
        true
    }

    /// Check-and-stamp one plain callback registration.
    pub fn stamp_callback(&mut self, path: &str, slot: SlotId, iteration: u64) -> bool {
        let Some(node) = self.nodes.get_mut(path) else {
            return false;
        };
        let Some(cb) = node.callbacks.iter_mut().find(|c| c.slot == slot) else {
            return false;
        };
        if cb.last_iteration == iteration {
            return false;
        }
        cb.last_iteration = iteration;
        true
    }

    // ========================================================================
    // Enumeration
    // ========================================================================

    /// All child paths below `prefix`: registered descendants plus
    /// enumerator-produced names. Invalid enumerator output is dropped and
    /// reported after the walk.
    pub fn child_paths(&self, prefix: &str) -> Result<BTreeSet<String>> {
        self.child_paths_at(prefix, prefix)
    }

    /// Like [`ObjectTree::child_paths`], but walking the subtree rooted at
    /// `node_path` while enumerators and validation see `prefix` (the
    /// message path). The two differ during fallback dispatch.
    pub fn child_paths_at(&self, node_path: &str, prefix: &str) -> Result<BTreeSet<String>> {
        let mut out = BTreeSet::new();
        let mut invalid = false;
        self.collect_subtree(prefix, node_path, &mut out, &mut invalid)?;

        if invalid {
            return Err(Error::InvalidArgument(format!(
                "enumerator produced paths outside '{}'",
                prefix
            )));
        }
        Ok(out)
    }

    fn collect_subtree(
        &self,
        prefix: &str,
        node_path: &str,
        out: &mut BTreeSet<String>,
        invalid: &mut bool,
    ) -> Result<()> {
        let Some(node) = self.nodes.get(node_path) else {
            return Ok(());
        };

        for enumerator in &node.enumerators {
            for produced in (enumerator.callback)(prefix)? {
                if object_path_is_valid(&produced)
                    && object_path_startswith(&produced, prefix).is_some()
                {
                    out.insert(produced);
                } else {
                    *invalid = true;
                }
            }
        }

        for child in &node.children {
            out.insert(child.clone());
            self.collect_subtree(prefix, child, out, invalid)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Value;
    use vtable::PropertyGetter;

    fn handler() -> MessageHandler {
        Rc::new(|_, _| Ok(true))
    }

    fn getter() -> PropertyGetter {
        Rc::new(|_| Ok(Value::string("x")))
    }

    fn simple_vtable() -> Vtable {
        Vtable::builder()
            .method("Frob", "s", "", handler())
            .property("Color", "s", getter())
            .build()
    }

    #[test]
    fn test_ancestors_created_and_linked() {
        let mut tree = ObjectTree::new();
        tree.add_callback("/a/b/c", handler(), false, 0).unwrap();

        for path in ["/", "/a", "/a/b", "/a/b/c"] {
            assert!(tree.contains(path), "missing {}", path);
        }
        assert!(tree.node("/a").unwrap().children.contains("/a/b"));
        assert_eq!(tree.node("/a/b/c").unwrap().parent.as_deref(), Some("/a/b"));
    }

    #[test]
    fn test_gc_releases_chain() {
        let mut tree = ObjectTree::new();
        let slot = tree.add_callback("/a/b/c", handler(), false, 0).unwrap();

        assert!(tree.remove_callback("/a/b/c", slot).unwrap());
        assert!(tree.is_empty());
    }

    #[test]
    fn test_gc_stops_at_occupied_ancestor() {
        let mut tree = ObjectTree::new();
        let keep = tree.add_callback("/a", handler(), false, 0).unwrap();
        let slot = tree.add_callback("/a/b/c", handler(), false, 0).unwrap();

        assert!(tree.remove_callback("/a/b/c", slot).unwrap());
        assert!(!tree.contains("/a/b/c"));
        assert!(!tree.contains("/a/b"));
        assert!(tree.contains("/a"));
        assert!(tree.contains("/"));

        assert!(tree.remove_callback("/a", keep).unwrap());
        assert!(tree.is_empty());
    }

    #[test]
    fn test_vtable_indices() {
        let mut tree = ObjectTree::new();
        tree.add_vtable("/o", "org.example.Iface", simple_vtable(), false, None)
            .unwrap();

        assert!(tree.method_slot("/o", "org.example.Iface", "Frob").is_some());
        assert!(tree
            .property_slot("/o", "org.example.Iface", "Color")
            .is_some());
        assert!(tree.method_slot("/o", "org.example.Iface", "Color").is_none());
        assert!(tree.method_slot("/x", "org.example.Iface", "Frob").is_none());
    }

    #[test]
    fn test_duplicate_interface_rejected() {
        let mut tree = ObjectTree::new();
        tree.add_vtable("/o", "org.example.Iface", simple_vtable(), false, None)
            .unwrap();
        let err = tree
            .add_vtable("/o", "org.example.Iface", simple_vtable(), false, None)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_fallback_mixing_rejected() {
        let mut tree = ObjectTree::new();
        tree.add_vtable("/o", "org.example.A", simple_vtable(), false, None)
            .unwrap();
        let err = tree
            .add_vtable("/o", "org.example.B", simple_vtable(), true, None)
            .unwrap_err();
        assert!(matches!(err, Error::WrongProtocol(_)));
    }

    #[test]
    fn test_remove_vtable_idempotent_and_unindexes() {
        let mut tree = ObjectTree::new();
        tree.add_vtable("/o", "org.example.Iface", simple_vtable(), false, None)
            .unwrap();

        assert!(tree.remove_vtable("/o", "org.example.Iface", false).unwrap());
        assert!(tree.method_slot("/o", "org.example.Iface", "Frob").is_none());
        assert!(tree
            .property_slot("/o", "org.example.Iface", "Color")
            .is_none());
        assert!(tree.is_empty());

        // Second removal reports "no change".
        assert!(!tree.remove_vtable("/o", "org.example.Iface", false).unwrap());
    }

    #[test]
    fn test_object_manager_coverage() {
        let mut tree = ObjectTree::new();
        tree.add_object_manager("/o").unwrap();
        tree.add_callback("/o/a/b", handler(), false, 0).unwrap();

        assert!(tree.object_manager_covers("/o"));
        assert!(tree.object_manager_covers("/o/a/b"));
        assert!(!tree.object_manager_covers("/elsewhere"));

        assert!(tree.remove_object_manager("/o").unwrap());
        assert!(!tree.object_manager_covers("/o/a/b"));
        assert!(!tree.remove_object_manager("/o").unwrap());
    }

    #[test]
    fn test_child_paths_merges_sources() {
        let mut tree = ObjectTree::new();
        tree.add_vtable("/o/a", "org.example.Iface", simple_vtable(), false, None)
            .unwrap();
        tree.add_enumerator(
            "/o",
            Rc::new(|_| Ok(vec!["/o/b".to_string(), "/o/a".to_string()])),
        )
        .unwrap();

        let children = tree.child_paths("/o").unwrap();
        // Registered and enumerated children collapse into one set.
        assert!(children.contains("/o/a"));
        assert!(children.contains("/o/b"));
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn test_child_paths_rejects_stray_enumerator_output() {
        let mut tree = ObjectTree::new();
        tree.add_enumerator("/o", Rc::new(|_| Ok(vec!["/elsewhere/x".to_string()])))
            .unwrap();

        assert!(tree.child_paths("/o").is_err());
    }

    #[test]
    fn test_modified_flag_tracks_mutations() {
        let mut tree = ObjectTree::new();
        assert!(!tree.modified);

        tree.add_callback("/a", handler(), false, 0).unwrap();
        assert!(tree.modified);

        tree.modified = false;
        let slot = tree.add_enumerator("/a", Rc::new(|_| Ok(vec![]))).unwrap();
        assert!(tree.modified);

        tree.modified = false;
        tree.remove_enumerator("/a", slot).unwrap();
        assert!(tree.modified);
    }
}
