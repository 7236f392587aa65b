use std::sync::Arc;

use serde::{Deserialize, Serialize};

const MATCH: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// What a capability is about to do to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Read file contents.
    Read,
    /// Enumerate a directory or walk the area.
    List,
    /// Create or overwrite a file.
    Write,
    /// Remove a file.
    Delete,
}

/// The operations a rule applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    /// `Read` and `List`.
    Read,
    /// `Write` and `Delete`.
    Write,
    /// Every operation.
    #[default]
    All,
}

impl Access {
    fn covers(self, operation: Operation) -> bool {
        match self {
            Access::All => true,
            Access::Read => matches!(operation, Operation::Read | Operation::List),
            Access::Write => matches!(operation, Operation::Write | Operation::Delete),
        }
    }
}

/// What a matching rule does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    /// Let the operation through.
    Allow,
    /// Fail the capability call.
    Deny,
}

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The operation may proceed.
    Allow,
    /// The operation is refused, with a reason shown to the snippet.
    Deny(String),
}

impl PolicyDecision {
    /// Whether the operation may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }

    /// The refusal reason, if any.
    pub fn denial_reason(&self) -> Option<&str> {
        match self {
            PolicyDecision::Allow => None,
            PolicyDecision::Deny(reason) => Some(reason),
        }
    }
}

/// Decides whether a capability may touch a path in the files area.
///
/// `path` is rooted at `/` (the files directory) and already confined;
/// `capability` is the JS-visible name of the calling capability, such as
/// `writeFile` or `search`.
pub trait PolicyHandler: Send + Sync {
    /// Check one operation.
    fn check_access(&self, path: &str, operation: Operation, capability: &str) -> PolicyDecision;
}

impl<T: PolicyHandler + ?Sized> PolicyHandler for Arc<T> {
    fn check_access(&self, path: &str, operation: Operation, capability: &str) -> PolicyDecision {
        (**self).check_access(path, operation, capability)
    }
}

/// Permits everything. Used when no policy is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPolicy;

impl PolicyHandler for AllowAllPolicy {
    fn check_access(&self, _path: &str, _operation: Operation, _capability: &str) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

/// Errors compiling configured rules.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The path is not a valid glob.
    #[error("invalid rule pattern {pattern:?}: {source}")]
    Pattern {
        /// The offending pattern.
        pattern: String,
        /// Parser error.
        source: glob::PatternError,
    },

    /// Rule paths must start at the files root.
    #[error("rule pattern {0:?} must start with /")]
    Relative(String),
}

/// One rule as written in the `[[files.rules]]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Glob over files-area paths, e.g. `/output/**`.
    pub path: String,
    /// Operations covered.
    #[serde(default)]
    pub access: Access,
    /// Allow or deny.
    pub effect: Effect,
    /// Capabilities the rule is limited to; empty means all of them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

impl RuleConfig {
    fn new(path: &str, access: Access, effect: Effect) -> Self {
        Self {
            path: path.to_string(),
            access,
            effect,
            capabilities: Vec::new(),
        }
    }
}

/// Baseline behaviour that configured rules refine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// Everything is allowed.
    #[default]
    Open,
    /// Reads anywhere, no writes or deletes.
    ReadOnly,
    /// Reads anywhere, writes and deletes only under `/downloads`.
    DownloadsOnly,
    /// Nothing is allowed unless a rule says so.
    Locked,
}

impl Preset {
    fn rules(self) -> Vec<RuleConfig> {
        match self {
            Preset::Open | Preset::Locked => Vec::new(),
            Preset::ReadOnly => vec![RuleConfig::new("/**", Access::Read, Effect::Allow)],
            Preset::DownloadsOnly => vec![
                RuleConfig::new("/**", Access::Read, Effect::Allow),
                RuleConfig::new("/downloads/**", Access::Write, Effect::Allow),
            ],
        }
    }

    fn fallback(self) -> Effect {
        match self {
            Preset::Open => Effect::Allow,
            Preset::ReadOnly | Preset::DownloadsOnly | Preset::Locked => Effect::Deny,
        }
    }
}

/// The `[files]` section of the configuration.
///
/// Rules are tried in order, then the preset's own rules; the first one
/// that covers the path, operation and capability decides. With no match
/// the preset's fallback applies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilePolicyConfig {
    /// Baseline.
    pub preset: Preset,
    /// Rules evaluated before the preset.
    pub rules: Vec<RuleConfig>,
}

impl FilePolicyConfig {
    /// Just `preset`, no extra rules.
    pub fn preset(preset: Preset) -> Self {
        Self {
            preset,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: glob::Pattern,
    /// `/dir` for a `/dir/**` pattern, so the directory itself is covered.
    base: Option<String>,
    access: Access,
    effect: Effect,
    capabilities: Vec<String>,
}

impl Rule {
    fn compile(config: &RuleConfig) -> Result<Self, PolicyError> {
        if !config.path.starts_with('/') {
            return Err(PolicyError::Relative(config.path.clone()));
        }
        let pattern = glob::Pattern::new(&config.path).map_err(|source| PolicyError::Pattern {
            pattern: config.path.clone(),
            source,
        })?;
        let base = config
            .path
            .strip_suffix("/**")
            .map(|dir| if dir.is_empty() { "/".to_string() } else { dir.to_string() });
        Ok(Self {
            pattern,
            base,
            access: config.access,
            effect: config.effect,
            capabilities: config.capabilities.clone(),
        })
    }

    fn covers(&self, path: &str, operation: Operation, capability: &str) -> bool {
        self.access.covers(operation)
            && (self.capabilities.is_empty() || self.capabilities.iter().any(|c| c == capability))
            && (self.base.as_deref() == Some(path) || self.pattern.matches_with(path, MATCH))
    }
}

/// Compiled [`FilePolicyConfig`].
#[derive(Debug, Clone)]
pub struct Policy {
    rules: Vec<Rule>,
    fallback: Effect,
}

impl Policy {
    /// Compile `config`, failing on malformed patterns.
    pub fn from_config(config: &FilePolicyConfig) -> Result<Self, PolicyError> {
        let rules = config
            .rules
            .iter()
            .chain(config.preset.rules().iter())
            .map(Rule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            rules,
            fallback: config.preset.fallback(),
        })
    }
}

impl PolicyHandler for Policy {
    fn check_access(&self, path: &str, operation: Operation, capability: &str) -> PolicyDecision {
        match self.rules.iter().find(|rule| rule.covers(path, operation, capability)) {
            Some(rule) if rule.effect == Effect::Allow => PolicyDecision::Allow,
            Some(rule) => PolicyDecision::Deny(format!(
                "{capability} may not {} {path} (rule {})",
                verb(operation),
                rule.pattern
            )),
            None if self.fallback == Effect::Allow => PolicyDecision::Allow,
            None => PolicyDecision::Deny(format!("{capability} may not {} {path}", verb(operation))),
        }
    }
}

fn verb(operation: Operation) -> &'static str {
    match operation {
        Operation::Read => "read",
        Operation::List => "list",
        Operation::Write => "write",
        Operation::Delete => "delete",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn policy(preset: Preset, rules: Vec<RuleConfig>) -> Policy {
        Policy::from_config(&FilePolicyConfig { preset, rules }).unwrap()
    }

    #[test]
    fn test_open_preset_allows_everything() {
        let policy = policy(Preset::Open, Vec::new());
        for op in [Operation::Read, Operation::List, Operation::Write, Operation::Delete] {
            assert!(policy.check_access("/a/b.txt", op, "writeFile").is_allowed());
        }
    }

    #[test]
    fn test_read_only_preset() {
        let policy = policy(Preset::ReadOnly, Vec::new());
        assert!(policy.check_access("/", Operation::List, "listFiles").is_allowed());
        assert!(policy.check_access("/data/x.csv", Operation::Read, "readFile").is_allowed());

        let decision = policy.check_access("/data/x.csv", Operation::Write, "writeFile");
        assert_eq!(decision.denial_reason(), Some("writeFile may not write /data/x.csv"));
        assert!(!policy.check_access("/x", Operation::Delete, "deleteFile").is_allowed());
    }

    #[test]
    fn test_downloads_only_covers_directory_itself() {
        let policy = policy(Preset::DownloadsOnly, Vec::new());
        assert!(policy.check_access("/downloads", Operation::Write, "mkdir").is_allowed());
        assert!(policy.check_access("/downloads/a/b.pdf", Operation::Delete, "deleteFile").is_allowed());
        assert!(!policy.check_access("/downloads-old/a", Operation::Write, "writeFile").is_allowed());
        assert!(!policy.check_access("/report.md", Operation::Write, "writeFile").is_allowed());
    }

    #[test]
    fn test_rules_run_before_preset() {
        let policy = policy(
            Preset::ReadOnly,
            vec![
                RuleConfig::new("/secrets/**", Access::All, Effect::Deny),
                RuleConfig::new("/output/**", Access::Write, Effect::Allow),
            ],
        );
        assert!(!policy.check_access("/secrets/key", Operation::Read, "readFile").is_allowed());
        assert!(policy.check_access("/secrets-public/key", Operation::Read, "readFile").is_allowed());
        assert!(policy.check_access("/output/r.md", Operation::Write, "writeFile").is_allowed());
    }

    #[test]
    fn test_single_star_stays_in_one_directory() {
        let policy = policy(
            Preset::Locked,
            vec![RuleConfig::new("/*.csv", Access::Read, Effect::Allow)],
        );
        assert!(policy.check_access("/a.csv", Operation::Read, "readFile").is_allowed());
        assert!(!policy.check_access("/data/a.csv", Operation::Read, "readFile").is_allowed());
    }

    #[test]
    fn test_rule_limited_to_capabilities() {
        let mut rule = RuleConfig::new("/**", Access::Write, Effect::Deny);
        rule.capabilities = vec!["deleteFile".to_string()];
        let policy = policy(Preset::Open, vec![rule]);

        assert!(!policy.check_access("/a.txt", Operation::Delete, "deleteFile").is_allowed());
        assert!(policy.check_access("/a.txt", Operation::Write, "writeFile").is_allowed());
    }

    #[test]
    fn test_malformed_rules_are_rejected() {
        let err = Policy::from_config(&FilePolicyConfig {
            preset: Preset::Open,
            rules: vec![RuleConfig::new("data/**", Access::Read, Effect::Allow)],
        })
        .unwrap_err();
        assert!(matches!(err, PolicyError::Relative(_)));

        let err = Policy::from_config(&FilePolicyConfig {
            preset: Preset::Open,
            rules: vec![RuleConfig::new("/[", Access::Read, Effect::Allow)],
        })
        .unwrap_err();
        assert!(matches!(err, PolicyError::Pattern { .. }));
    }

    #[test]
    fn test_shared_handler() {
        let shared: Arc<dyn PolicyHandler> = Arc::new(policy(Preset::Locked, Vec::new()));
        assert!(!shared.check_access("/a", Operation::Read, "readFile").is_allowed());
    }
}
