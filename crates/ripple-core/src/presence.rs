//! Presence ledger — member identity tracking for `presence-*` channels.
//!
//! One member id may map to several simultaneous connections (multiple
//! devices). The ledger reports first-join and last-leave so callers emit
//! `member_added`/`member_removed` exactly once per member.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

/// One member's entry: client-supplied info plus the sockets holding it.
#[derive(Debug, Clone)]
pub struct Member {
    /// Arbitrary client-supplied metadata (`user_info` in the wire frames).
    pub info: Value,
    /// Socket ids currently subscribed under this member id.
    sockets: HashSet<String>,
}

/// Per-channel map of member id → member info.
///
/// Keys are always a subset of the channel's subscriber set; mutation only
/// happens through channel operations under the registry's app lock.
#[derive(Debug, Default, Clone)]
pub struct PresenceLedger {
    // BTreeMap keeps member listings in a stable order.
    members: BTreeMap<String, Member>,
}

impl PresenceLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection joining under `user_id`.
    ///
    /// Returns `true` when this is the member's first live connection
    /// (i.e. a `member_added` should be broadcast). The stored info is
    /// refreshed on every join so a reconnecting device wins.
    pub fn join(&mut self, user_id: &str, socket_id: &str, info: Value) -> bool {
        match self.members.get_mut(user_id) {
            Some(member) => {
                let _ = member.sockets.insert(socket_id.to_owned());
                member.info = info;
                false
            }
            None => {
                let mut sockets = HashSet::new();
                let _ = sockets.insert(socket_id.to_owned());
                let _ = self.members.insert(user_id.to_owned(), Member { info, sockets });
                true
            }
        }
    }

    /// Record a connection leaving.
    ///
    /// Returns `Some(user_id)` when that was the member's last connection
    /// (a `member_removed` should be broadcast). Unknown sockets are a no-op.
    pub fn leave(&mut self, socket_id: &str) -> Option<String> {
        let user_id = self.user_for_socket(socket_id)?;
        let member = self.members.get_mut(&user_id)?;
        let _ = member.sockets.remove(socket_id);
        if member.sockets.is_empty() {
            let _ = self.members.remove(&user_id);
            Some(user_id)
        } else {
            None
        }
    }

    /// Member id a socket is registered under, if any.
    pub fn user_for_socket(&self, socket_id: &str) -> Option<String> {
        self.members
            .iter()
            .find(|(_, m)| m.sockets.contains(socket_id))
            .map(|(id, _)| id.clone())
    }

    /// Distinct member ids, in stable order.
    pub fn member_ids(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    /// Member id → info map for `subscription_succeeded` hashes.
    pub fn member_hash(&self) -> serde_json::Map<String, Value> {
        self.members
            .iter()
            .map(|(id, m)| (id.clone(), m.info.clone()))
            .collect()
    }

    /// Number of distinct members.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Whether no members remain.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
