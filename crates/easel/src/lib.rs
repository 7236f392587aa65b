//! Easel: capability-scoped code execution for canvas workspaces
//!
//! An agent edits a workspace (tables, charts, cards, markdown and PDF
//! panels on a canvas, plus a files area) by writing JavaScript snippets.
//! Snippets run in an embedded QuickJS engine whose only view of the world
//! is a fixed table of host capabilities. Every panel change a snippet makes
//! is pushed onto a queue as it happens, and the agent runtime merges that
//! queue with the model's event stream so clients see updates live.
//!
//! # Modules
//!
//! - [`store`]: on-disk workspace documents, per-workspace locking and
//!   atomic UI-state writes.
//! - [`sandbox`]: the JavaScript sandbox, its capabilities, the network
//!   guard, and per-workspace session caching.
//! - [`panel`]: panel-update events, the update queue, and the text marker
//!   format for carrying updates inside tool results.
//! - [`agent`]: the model backend, stream merge loop, and transcript
//!   accumulator.
//! - [`policy`]: access rules for the files area.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use easel::sandbox::Sandbox;
//! use easel::store::WorkspaceStore;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = WorkspaceStore::new("data", Duration::from_secs(10));
//! store.create_workspace_with_id("demo", "Demo", "").await?;
//!
//! let sandbox = Sandbox::builder("demo", store).build()?;
//! let output = sandbox
//!     .execute("await setTable('people', { data: [{ name: 'Ada' }] }); return 'ok';")
//!     .await?;
//! println!("{}", output.text);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod limits;
pub mod panel;
pub mod policy;
pub mod sandbox;
pub mod store;

pub use config::{AnthropicConfig, ConfigError, EaselConfig};
pub use limits::SandboxLimits;
pub use panel::{PanelUpdate, PanelUpdateQueue};
pub use sandbox::{ExecuteOutput, Sandbox, SandboxError};
pub use store::{StoreError, WorkspaceStore};
