//! Access control for the workspace files area.
//!
//! Path confinement (no absolute paths, no `..`) keeps snippets inside the
//! files area; the policy decides what they may do there. Checks run during
//! execution against rules loaded from the `[files]` config section and
//! never prompt: a denied operation fails the capability call with an error
//! the snippet can catch.
//!
//! Paths are rooted at `/`, which is the workspace's files directory.
//!
//! ## Example
//!
//! ```rust
//! use easel::config::EaselConfig;
//! use easel::policy::{Operation, Policy, PolicyHandler};
//!
//! let config = EaselConfig::from_toml_str(
//!     r#"
//!     [files]
//!     preset = "read_only"
//!
//!     [[files.rules]]
//!     path = "/output/**"
//!     access = "write"
//!     effect = "allow"
//!     "#,
//! )
//! .unwrap();
//!
//! let policy = Policy::from_config(&config.files).unwrap();
//! assert!(policy.check_access("/output/report.md", Operation::Write, "writeFile").is_allowed());
//! assert!(!policy.check_access("/report.md", Operation::Write, "writeFile").is_allowed());
//! ```

mod rules;

pub use rules::{
    Access, AllowAllPolicy, Effect, FilePolicyConfig, Operation, Policy, PolicyDecision, PolicyError,
    PolicyHandler, Preset, RuleConfig,
};
