// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Match registrations.
//!
//! A match subscribes a callback to the subset of inbound traffic its rule
//! selects. The rule string grammar and its parser belong to an external
//! collaborator; here a rule is a typed record built field by field, and
//! evaluation is plain equality on the populated fields. The registry runs
//! under the same modified-flag/iteration-counter discipline as the filter
//! chain.

use crate::connection::MessageHandler;
use crate::message::{Message, MessageType};

/// Opaque handle identifying one registered match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MatchId(pub(crate) u64);

/// A typed match rule. Unset fields match anything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchRule {
    message_type: Option<MessageType>,
    sender: Option<String>,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    destination: Option<String>,
}

impl MatchRule {
    /// A rule matching every message.
    pub fn new() -> MatchRule {
        MatchRule::default()
    }

    pub fn message_type(mut self, ty: MessageType) -> MatchRule {
        self.message_type = Some(ty);
        self
    }

    pub fn sender(mut self, sender: impl Into<String>) -> MatchRule {
        self.sender = Some(sender.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> MatchRule {
        self.path = Some(path.into());
        self
    }

    pub fn interface(mut self, interface: impl Into<String>) -> MatchRule {
        self.interface = Some(interface.into());
        self
    }

    pub fn member(mut self, member: impl Into<String>) -> MatchRule {
        self.member = Some(member.into());
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> MatchRule {
        self.destination = Some(destination.into());
        self
    }

    /// Whether `message` satisfies every populated field.
    pub fn matches(&self, message: &Message) -> bool {
        if let Some(ty) = self.message_type {
            if message.message_type() != ty {
                return false;
            }
        }

        fn field(expected: &Option<String>, actual: Option<&str>) -> bool {
            match expected {
                None => true,
                Some(want) => actual == Some(want.as_str()),
            }
        }

        field(&self.sender, message.sender())
            && field(&self.path, message.path())
            && field(&self.interface, message.interface())
            && field(&self.member, message.member())
            && field(&self.destination, message.destination())
    }
}

struct MatchEntry {
    id: MatchId,
    rule: MatchRule,
    callback: MessageHandler,
    last_iteration: u64,
}

/// The per-connection match registry.
#[derive(Default)]
pub(crate) struct MatchRegistry {
    entries: Vec<MatchEntry>,
    next_id: u64,
    pub modified: bool,
}

impl MatchRegistry {
    pub fn new() -> MatchRegistry {
        MatchRegistry::default()
    }

    /// Register `rule`. The entry is stamped with the current iteration so
    /// it first fires on the next inbound message.
    pub fn add(&mut self, rule: MatchRule, callback: MessageHandler, current_iteration: u64) -> MatchId {
        self.next_id += 1;
        let id = MatchId(self.next_id);
        self.entries.push(MatchEntry {
            id,
            rule,
            callback,
            last_iteration: current_iteration,
        });
        self.modified = true;
        id
    }

    /// Remove a match by handle. Reports whether it existed.
    pub fn remove(&mut self, id: MatchId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        let removed = self.entries.len() != before;
        if removed {
            self.modified = true;
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hand out the first matching entry not yet run in `iteration`.
    pub fn next_pending(&mut self, message: &Message, iteration: u64) -> Option<MessageHandler> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.last_iteration != iteration && e.rule.matches(message))?;
        entry.last_iteration = iteration;
        Some(entry.callback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn noop() -> MessageHandler {
        Rc::new(|_, _| Ok(false))
    }

    fn signal() -> Message {
        Message::signal("/org/example/obj", "org.example.Events", "Tick").unwrap()
    }

    #[test]
    fn test_empty_rule_matches_everything() {
        let rule = MatchRule::new();
        assert!(rule.matches(&signal()));
    }

    #[test]
    fn test_fields_and_type() {
        let rule = MatchRule::new()
            .message_type(MessageType::Signal)
            .path("/org/example/obj")
            .interface("org.example.Events")
            .member("Tick");
        assert!(rule.matches(&signal()));

        let wrong_member = MatchRule::new().member("Tock");
        assert!(!wrong_member.matches(&signal()));

        let wrong_type = MatchRule::new().message_type(MessageType::MethodCall);
        assert!(!wrong_type.matches(&signal()));
    }

    #[test]
    fn test_registry_offers_matching_entries_once() {
        let mut registry = MatchRegistry::new();
        registry.add(MatchRule::new().member("Tick"), noop(), 0);
        registry.add(MatchRule::new().member("Tock"), noop(), 0);

        let m = signal();
        assert!(registry.next_pending(&m, 1).is_some());
        // The Tock rule does not match; the Tick rule already ran.
        assert!(registry.next_pending(&m, 1).is_none());
    }

    #[test]
    fn test_remove() {
        let mut registry = MatchRegistry::new();
        let id = registry.add(MatchRule::new(), noop(), 0);
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
    }
}
