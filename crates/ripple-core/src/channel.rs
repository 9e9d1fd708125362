//! Channel — a named topic with a kind fixed by its name prefix.

use std::collections::HashSet;

use crate::presence::PresenceLedger;

/// Channel kind, determined once from the name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// No auth required.
    Public,
    /// Requires a subscription signature.
    Private,
    /// Requires a signature and tracks member identity.
    Presence,
}

impl ChannelKind {
    /// Classify a channel name by prefix convention.
    pub fn of(name: &str) -> Self {
        if name.starts_with("presence-") {
            Self::Presence
        } else if name.starts_with("private-") {
            Self::Private
        } else {
            Self::Public
        }
    }

    /// Whether subscribing requires a verified auth signature.
    pub fn requires_auth(self) -> bool {
        !matches!(self, Self::Public)
    }
}

/// A live channel. Exists in the registry iff its subscriber set is
/// non-empty; created on first subscribe, removed on last unsubscribe.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Channel name (unique per app).
    pub name: String,
    /// Kind, fixed at creation.
    pub kind: ChannelKind,
    /// Socket ids currently subscribed.
    subscribers: HashSet<String>,
    /// Member ledger; populated only for presence channels.
    pub presence: Option<PresenceLedger>,
}

impl Channel {
    /// Create a channel of the kind implied by `name`.
    pub fn new(name: &str) -> Self {
        let kind = ChannelKind::of(name);
        Self {
            name: name.to_owned(),
            kind,
            subscribers: HashSet::new(),
            presence: (kind == ChannelKind::Presence).then(PresenceLedger::new),
        }
    }

    /// Add a subscriber. Returns `false` if already subscribed.
    pub fn subscribe(&mut self, socket_id: &str) -> bool {
        self.subscribers.insert(socket_id.to_owned())
    }

    /// Remove a subscriber. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&mut self, socket_id: &str) -> bool {
        self.subscribers.remove(socket_id)
    }

    /// Whether the socket is subscribed.
    pub fn has_subscriber(&self, socket_id: &str) -> bool {
        self.subscribers.contains(socket_id)
    }

    /// Current subscriber socket ids.
    pub fn subscriber_ids(&self) -> impl Iterator<Item = &String> {
        self.subscribers.iter()
    }

    /// Number of subscribed sockets.
    pub fn subscription_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Whether the subscriber set is empty (channel must then be removed).
    pub fn is_vacant(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_prefix() {
        assert_eq!(ChannelKind::of("news"), ChannelKind::Public);
        assert_eq!(ChannelKind::of("private-news"), ChannelKind::Private);
        assert_eq!(ChannelKind::of("presence-room"), ChannelKind::Presence);
        // Prefix must be at the start.
        assert_eq!(ChannelKind::of("my-private-news"), ChannelKind::Public);
    }

    #[test]
    fn auth_requirements() {
        assert!(!ChannelKind::Public.requires_auth());
        assert!(ChannelKind::Private.requires_auth());
        assert!(ChannelKind::Presence.requires_auth());
    }

    #[test]
    fn presence_ledger_only_for_presence() {
        assert!(Channel::new("presence-room").presence.is_some());
        assert!(Channel::new("private-room").presence.is_none());
        assert!(Channel::new("room").presence.is_none());
    }

    #[test]
    fn subscribe_unsubscribe() {
        let mut ch = Channel::new("room");
        assert!(ch.is_vacant());
        assert!(ch.subscribe("1.1"));
        assert!(!ch.subscribe("1.1"));
        assert_eq!(ch.subscription_count(), 1);
        assert!(ch.has_subscriber("1.1"));
        assert!(ch.unsubscribe("1.1"));
        assert!(!ch.unsubscribe("1.1"));
        assert!(ch.is_vacant());
    }
}
