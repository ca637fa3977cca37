//! Per-feed configuration and federation policy

/// Which mode an outbound connection tries first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PreferredMode {
    /// CHECK/TAKETHIS streaming push
    #[default]
    Stream,
    /// ARTICLE fetching and scraping
    Reader,
}

/// Configuration for one peer feed
#[must_use]
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FeedConfig {
    /// Feed name, used in logs and connection identity
    pub name: String,
    /// Remote address, `host:port`
    pub addr: String,
    /// AUTHINFO username, empty to skip authentication
    pub username: String,
    /// AUTHINFO password
    pub password: String,
    /// Never attempt a STARTTLS upgrade on this feed
    pub tls_off: bool,
    /// Mode tried first on outbound connections
    pub prefer_mode: PreferredMode,
    /// Which newsgroups this feed may send or receive
    pub policy: Option<FeedPolicy>,
}

impl FeedConfig {
    /// Whether this feed carries credentials for AUTHINFO
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// One federation rule: a newsgroup pattern and its decision
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PolicyRule {
    /// Exact group, `prefix.*`, or `*`
    pub pattern: String,
    /// Allow or deny groups matching the pattern
    pub allow: bool,
}

/// Ordered newsgroup allow/deny rules; first match wins
///
/// A group matching no rule is allowed (open federation default).
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FeedPolicy {
    /// Rules in evaluation order
    pub rules: Vec<PolicyRule>,
}

impl FeedPolicy {
    /// Build a policy from `(pattern, allow)` pairs
    pub fn from_rules<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = (S, bool)>,
        S: Into<String>,
    {
        Self {
            rules: rules
                .into_iter()
                .map(|(pattern, allow)| PolicyRule {
                    pattern: pattern.into(),
                    allow,
                })
                .collect(),
        }
    }

    /// Decide whether this feed carries `newsgroup`
    pub fn allows_newsgroup(&self, newsgroup: &str) -> bool {
        for rule in &self.rules {
            if Self::matches(&rule.pattern, newsgroup) {
                return rule.allow;
            }
        }
        true
    }

    fn matches(pattern: &str, newsgroup: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix(".*") {
            return newsgroup == prefix
                || newsgroup
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'));
        }
        pattern == newsgroup
    }
}

/// Moderation switches captured at connection setup
///
/// These mirror daemon-wide flags; they are copied once when the
/// connection is created so a mid-flight reconfiguration cannot change an
/// in-progress admission decision.
#[derive(Debug, Clone, Copy)]
pub struct ModerationFlags {
    /// Accept articles from anonymous posters
    pub allow_anon: bool,
    /// Accept attachments from anonymous posters
    pub allow_anon_attachments: bool,
    /// Accept attachments at all
    pub allow_attachments: bool,
    /// Keep the historical message-id/reference predicate
    ///
    /// The historical rule accepts an invalid message-id whenever the
    /// References value is itself invalid. Set to `false` for the repaired
    /// rule that rejects on either being invalid.
    pub legacy_msgid_rule: bool,
}

impl Default for ModerationFlags {
    fn default() -> Self {
        Self {
            allow_anon: false,
            allow_anon_attachments: false,
            allow_attachments: true,
            legacy_msgid_rule: true,
        }
    }
}
