//! Peer allow-list.
//!
//! Entries are compared as opaque strings against the textual peer address.
//! `*` or `all` anywhere in the list allows every peer. No CIDR, no hostname
//! resolution, no normalisation beyond what the engine does when it renders
//! the peer address.

/// Decides whether a peer may be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessFilter {
    allow_all: bool,
    entries: Vec<String>,
}

impl AccessFilter {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries: Vec<String> = entries.into_iter().map(Into::into).collect();
        let allow_all = entries.iter().any(|e| is_wildcard(e));
        Self { allow_all, entries }
    }

    /// A filter that admits every peer.
    pub fn allow_all() -> Self {
        Self::new(["*"])
    }

    /// `true` when the peer matches an entry or the list holds a wildcard.
    ///
    /// An empty list denies everyone; an empty peer string only passes a
    /// wildcard.
    pub fn is_allowed(&self, peer: &str) -> bool {
        if self.allow_all {
            return true;
        }
        !peer.is_empty() && self.entries.iter().any(|e| e == peer)
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

impl Default for AccessFilter {
    fn default() -> Self {
        Self::allow_all()
    }
}

fn is_wildcard(entry: &str) -> bool {
    entry == "*" || entry == "all"
}
