//! CAPABILITIES parsing (RFC 3977 Section 5.2)
//!
//! The CAPABILITIES command returns a dot-terminated list of capability
//! tokens, each with optional arguments. The peering handshake only cares
//! about a handful of them, summarized by [`RemoteCapabilities`].

use std::collections::HashMap;

/// Capability tokens advertised by a remote peer
#[must_use]
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// Map of capability name to its arguments, e.g. "VERSION" -> ["2"]
    capabilities: HashMap<String, Vec<String>>,
}

impl Capabilities {
    /// Create an empty Capabilities instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse capabilities from the dot-list lines
    ///
    /// Each line is `CAPABILITY [arg1 arg2 ...]`; names match
    /// case-insensitively.
    pub fn parse(lines: &[String]) -> Self {
        let mut capabilities = HashMap::new();

        for line in lines {
            let mut parts = line.split_whitespace();
            let Some(name) = parts.next() else { continue };
            let args: Vec<String> = parts.map(|s| s.to_string()).collect();
            capabilities.insert(name.to_uppercase(), args);
        }

        Self { capabilities }
    }

    /// Check if a capability is advertised
    #[must_use]
    pub fn has(&self, capability: &str) -> bool {
        self.capabilities.contains_key(&capability.to_uppercase())
    }

    /// Get arguments for a capability, None if not advertised
    #[must_use]
    pub fn get_args(&self, capability: &str) -> Option<&Vec<String>> {
        self.capabilities.get(&capability.to_uppercase())
    }

    /// Summarize the tokens the peering handshake acts on
    pub fn peering(&self) -> RemoteCapabilities {
        let mut summary = RemoteCapabilities {
            streaming: self.has("STREAMING"),
            reader: self.has("READER") || self.has("MODE-READER"),
            starttls: self.has("STARTTLS"),
        };
        // Vendor token from sibling implementations: implies streaming and
        // a reader mode we must not use.
        if self.has("POSTIHAVESTREAMING") {
            summary.streaming = true;
            summary.reader = false;
        }
        summary
    }
}

/// What the remote peer supports, as far as mode selection is concerned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteCapabilities {
    /// Peer accepts MODE STREAM (CHECK/TAKETHIS)
    pub streaming: bool,
    /// Peer accepts MODE READER
    pub reader: bool,
    /// Peer offers a STARTTLS upgrade
    pub starttls: bool,
}
