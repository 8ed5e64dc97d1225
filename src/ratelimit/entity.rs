//! Rate-limited subjects and how their keys and rules are derived.

use std::sync::Arc;

use super::rules::{RuleSet, RuleTable, DEFAULT_USER_DOMAIN};
use crate::error::Result;

/// Something that can be rate limited.
///
/// Implementors supply a stable key and their resolved rules; the sliding
/// window algorithm itself lives in [`super::RateLimiter`] and the backends.
pub trait RateLimitedEntity: Send + Sync {
    /// Stable identifier, unique per subject and domain.
    fn key(&self) -> String;

    /// Rules to evaluate for this subject, finest window first.
    fn rules(&self) -> Result<RuleSet>;
}

/// A user acting within a domain.
///
/// A user may carry a custom rule string such as `"1:5,60:100"`. When it is
/// non-empty and the domain is [`DEFAULT_USER_DOMAIN`], it replaces the
/// domain's rules entirely.
#[derive(Debug, Clone)]
pub struct RateLimitedUser {
    user_id: u64,
    domain: String,
    custom_rules: String,
    table: Arc<RuleTable>,
}

impl RateLimitedUser {
    /// A user limited under the default `api_by_user` domain.
    pub fn new(user_id: u64, table: Arc<RuleTable>) -> Self {
        Self::with_domain(user_id, DEFAULT_USER_DOMAIN, table)
    }

    /// A user limited under an explicit domain.
    pub fn with_domain(user_id: u64, domain: impl Into<String>, table: Arc<RuleTable>) -> Self {
        Self {
            user_id,
            domain: domain.into(),
            custom_rules: String::new(),
            table,
        }
    }

    /// Attach the user's custom rule string.
    pub fn with_custom_rules(mut self, custom_rules: impl Into<String>) -> Self {
        self.custom_rules = custom_rules.into();
        self
    }
}

impl RateLimitedEntity for RateLimitedUser {
    fn key(&self) -> String {
        format!("RateLimitedUser:{}:{}", self.user_id, self.domain)
    }

    fn rules(&self) -> Result<RuleSet> {
        let custom = self.custom_rules.trim();
        if !custom.is_empty() && self.domain == DEFAULT_USER_DOMAIN {
            return RuleSet::parse(custom);
        }
        self.table.rules_for(&self.domain)
    }
}

/// Any other kind of subject, e.g. a realm or a remote address.
#[derive(Debug, Clone)]
pub struct RateLimitedSubject {
    kind: String,
    id: String,
    domain: String,
    table: Arc<RuleTable>,
}

impl RateLimitedSubject {
    /// Create a subject of `kind` (such as `"RateLimitedRealm"`) identified by `id`.
    pub fn new(
        kind: impl Into<String>,
        id: impl Into<String>,
        domain: impl Into<String>,
        table: Arc<RuleTable>,
    ) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            domain: domain.into(),
            table,
        }
    }
}

impl RateLimitedEntity for RateLimitedSubject {
    fn key(&self) -> String {
        format!("{}:{}:{}", self.kind, self.id, self.domain)
    }

    fn rules(&self) -> Result<RuleSet> {
        self.table.rules_for(&self.domain)
    }
}
