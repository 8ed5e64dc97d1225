//! Rate limit rules and the per-domain rule table.
//!
//! A domain (for example `api_by_user`) owns an ordered set of
//! `(window_secs, max_calls)` rules. The table is injected into entities at
//! construction instead of living in a global, so tests can mutate their own
//! copy without affecting anyone else.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{Result, WindowguardError};

/// The domain used for general per-user API limits.
pub const DEFAULT_USER_DOMAIN: &str = "api_by_user";

/// At most `max_calls` calls in any `window_secs`-second sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    /// Length of the sliding window in seconds
    pub window_secs: u64,
    /// Calls allowed within the window
    pub max_calls: u32,
}

impl Rule {
    /// Create a rule, rejecting zero windows or zero budgets.
    pub fn new(window_secs: u64, max_calls: u32) -> Result<Self> {
        if window_secs == 0 {
            return Err(WindowguardError::InvalidRule(
                "window_secs must be greater than zero".to_string(),
            ));
        }
        if max_calls == 0 {
            return Err(WindowguardError::InvalidRule(
                "max_calls must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            window_secs,
            max_calls,
        })
    }
}

/// An ordered set of rules, finest window first.
///
/// The ascending-by-window order is an invariant of the type: every
/// constructor sorts, so the evaluation loop can rely on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Build a rule set from rules in any order.
    pub fn new(mut rules: Vec<Rule>) -> Self {
        rules.sort_by_key(|rule| rule.window_secs);
        Self { rules }
    }

    /// Build a validated rule set from `(window_secs, max_calls)` pairs.
    pub fn from_pairs(pairs: &[(u64, u32)]) -> Result<Self> {
        let rules = pairs
            .iter()
            .map(|&(window, calls)| Rule::new(window, calls))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(rules))
    }

    /// Parse a per-subject override of the form `"seconds:count,seconds:count"`.
    ///
    /// Any malformed part fails the whole string; there is no partial result.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();
            let (seconds, count) = part.split_once(':').ok_or_else(|| {
                WindowguardError::InvalidRule(format!("expected seconds:count, got {:?}", part))
            })?;
            let window_secs = seconds.trim().parse::<u64>().map_err(|e| {
                WindowguardError::InvalidRule(format!("bad window {:?}: {}", seconds, e))
            })?;
            let max_calls = count.trim().parse::<u32>().map_err(|e| {
                WindowguardError::InvalidRule(format!("bad call count {:?}: {}", count, e))
            })?;
            rules.push(Rule::new(window_secs, max_calls)?);
        }
        Ok(Self::new(rules))
    }

    /// Iterate finest window first.
    pub fn iter(&self) -> std::slice::Iter<'_, Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Length cap for the call history: the largest `max_calls` of any rule.
    pub fn max_calls(&self) -> u32 {
        self.rules.iter().map(|r| r.max_calls).max().unwrap_or(0)
    }

    /// History time-to-live: the largest window of any rule.
    pub fn max_window(&self) -> u64 {
        self.rules.iter().map(|r| r.window_secs).max().unwrap_or(0)
    }

    /// The widest-window rule, used for remaining-quota metadata.
    pub fn widest(&self) -> Option<&Rule> {
        self.rules.last()
    }

    fn insert(&mut self, rule: Rule) {
        self.rules.push(rule);
        self.rules.sort_by_key(|r| r.window_secs);
    }

    fn remove(&mut self, rule: Rule) -> usize {
        let before = self.rules.len();
        self.rules.retain(|r| *r != rule);
        before - self.rules.len()
    }
}

impl<'de> Deserialize<'de> for RuleSet {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let rules = Vec::<Rule>::deserialize(deserializer)?;
        for rule in &rules {
            Rule::new(rule.window_secs, rule.max_calls).map_err(serde::de::Error::custom)?;
        }
        Ok(RuleSet::new(rules))
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type Item = &'a Rule;
    type IntoIter = std::slice::Iter<'a, Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}

/// Serialized form of a rule table, as found in configuration files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleTableConfig {
    /// Map of domain name to its rules
    #[serde(default)]
    pub domains: HashMap<String, RuleSet>,
}

impl RuleTableConfig {
    /// Load a rule table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a rule table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            WindowguardError::Config(format!("Failed to parse rate limit rules: {}", e))
        })
    }
}

/// Domain name to rule set mapping shared by every entity of a process.
///
/// Mutations only affect evaluations that resolve rules afterwards; stored
/// call history is never touched.
#[derive(Debug, Default)]
pub struct RuleTable {
    domains: RwLock<HashMap<String, RuleSet>>,
}

impl RuleTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table from its configuration form.
    pub fn from_config(config: RuleTableConfig) -> Self {
        Self {
            domains: RwLock::new(config.domains),
        }
    }

    /// Rules currently configured for `domain`.
    pub fn rules_for(&self, domain: &str) -> Result<RuleSet> {
        self.domains
            .read()
            .get(domain)
            .cloned()
            .ok_or_else(|| {
                WindowguardError::Config(format!("no rate limit rules for domain {:?}", domain))
            })
    }

    /// Replace the rules of a domain wholesale.
    pub fn set_rules(&self, domain: &str, rules: RuleSet) {
        self.domains.write().insert(domain.to_string(), rules);
    }

    /// Add a rule to `domain`, creating the domain if needed.
    pub fn add_rule(&self, domain: &str, window_secs: u64, max_calls: u32) -> Result<()> {
        let rule = Rule::new(window_secs, max_calls)?;
        self.domains
            .write()
            .entry(domain.to_string())
            .or_default()
            .insert(rule);

        info!(domain = %domain, window_secs, max_calls, "Added rate limit rule");
        Ok(())
    }

    /// Remove every rule of `domain` exactly equal to `(window_secs, max_calls)`.
    ///
    /// Returns how many rules were removed.
    pub fn remove_rule(&self, domain: &str, window_secs: u64, max_calls: u32) -> usize {
        let rule = Rule {
            window_secs,
            max_calls,
        };
        let removed = self
            .domains
            .write()
            .get_mut(domain)
            .map(|rules| rules.remove(rule))
            .unwrap_or(0);

        info!(domain = %domain, window_secs, max_calls, removed, "Removed rate limit rule");
        removed
    }

    /// Names of all configured domains, sorted.
    pub fn domains(&self) -> Vec<String> {
        let mut names: Vec<String> = self.domains.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of the table in its configuration form.
    pub fn snapshot(&self) -> RuleTableConfig {
        RuleTableConfig {
            domains: self.domains.read().clone(),
        }
    }
}
