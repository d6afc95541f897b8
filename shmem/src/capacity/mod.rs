use regex::Regex;
use serde_derive::{Deserialize, Serialize};

use crate::errors::{IpcError, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Glob,
    Regex,
}

impl Default for PatternKind {
    fn default() -> Self {
        PatternKind::Glob
    }
}

/// One `channel_capacity` entry as written in configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRule {
    pub pattern: String,
    #[serde(default)]
    pub kind: PatternKind,
    pub capacity: usize,
}

impl CapacityRule {
    pub fn glob<S: Into<String>>(pattern: S, capacity: usize) -> CapacityRule {
        CapacityRule {
            pattern: pattern.into(),
            kind: PatternKind::Glob,
            capacity,
        }
    }

    pub fn regex<S: Into<String>>(pattern: S, capacity: usize) -> CapacityRule {
        CapacityRule {
            pattern: pattern.into(),
            kind: PatternKind::Regex,
            capacity,
        }
    }
}

#[derive(Clone, Debug)]
pub enum ChannelPattern {
    /// Must match the whole channel name.
    Glob(glob::Pattern),
    /// Anchored at the start of the channel name only.
    Regex(Regex),
}

impl ChannelPattern {
    pub fn compile(pattern: &str, kind: PatternKind) -> Result<ChannelPattern> {
        match kind {
            PatternKind::Glob => glob::Pattern::new(pattern)
                .map(ChannelPattern::Glob)
                .map_err(|e| IpcError::Config(format!("bad glob {:?}: {}", pattern, e))),
            PatternKind::Regex => Regex::new(&format!("^(?:{})", pattern))
                .map(ChannelPattern::Regex)
                .map_err(|e| IpcError::Config(format!("bad regex {:?}: {}", pattern, e))),
        }
    }

    pub fn matches(&self, channel: &str) -> bool {
        match self {
            ChannelPattern::Glob(p) => p.matches(channel),
            ChannelPattern::Regex(r) => r.is_match(channel),
        }
    }
}

/// Process-local admission policy: rules are tried in order and the first
/// match decides; otherwise the default applies.
#[derive(Clone, Debug)]
pub struct CapacityTable {
    rules: Vec<(ChannelPattern, usize)>,
    default: usize,
}

impl CapacityTable {
    pub fn new(default: usize, rules: &[CapacityRule]) -> Result<CapacityTable> {
        let rules = rules
            .iter()
            .map(|r| Ok((ChannelPattern::compile(&r.pattern, r.kind)?, r.capacity)))
            .collect::<Result<Vec<_>>>()?;
        Ok(CapacityTable { rules, default })
    }

    pub fn capacity_for(&self, channel: &str) -> usize {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.matches(channel))
            .map(|(_, capacity)| *capacity)
            .unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_wins() -> Result<()> {
        let table = CapacityTable::new(
            100,
            &[
                CapacityRule::glob("http.request", 200),
                CapacityRule::glob("http.response!*", 10),
                CapacityRule::glob("http.*", 50),
            ],
        )?;
        assert_eq!(table.capacity_for("http.request"), 200);
        assert_eq!(table.capacity_for("http.response!abc"), 10);
        assert_eq!(table.capacity_for("http.disconnect"), 50);
        assert_eq!(table.capacity_for("other.channel"), 100);
        Ok(())
    }

    #[test]
    fn glob_matches_whole_name() -> Result<()> {
        let table = CapacityTable::new(1, &[CapacityRule::glob("http.request", 5)])?;
        assert_eq!(table.capacity_for("http.request.body"), 1);
        assert_eq!(table.capacity_for("xhttp.request"), 1);
        Ok(())
    }

    #[test]
    fn regex_and_glob_mixed() -> Result<()> {
        let table = CapacityTable::new(
            3,
            &[
                CapacityRule::regex(r"websocket\.(send|receive)", 20),
                CapacityRule::glob("websocket.*", 7),
            ],
        )?;
        assert_eq!(table.capacity_for("websocket.send!xyz"), 20);
        assert_eq!(table.capacity_for("websocket.connect"), 7);
        // Regex rules are anchored at the start only.
        assert_eq!(table.capacity_for("my.websocket.send"), 3);
        Ok(())
    }

    #[test]
    fn bad_patterns_are_config_errors() {
        assert!(matches!(
            CapacityTable::new(1, &[CapacityRule::regex("(", 1)]),
            Err(IpcError::Config(_))
        ));
        assert!(matches!(
            CapacityTable::new(1, &[CapacityRule::glob("[", 1)]),
            Err(IpcError::Config(_))
        ));
    }
}
