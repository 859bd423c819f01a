//! Persistence provider and recovery sequencing for Recall.
//!
//! The host runtime talks to one [`PersistenceProvider`] per process. Each
//! actor it hosts is a [`PersistentActor`] that recovers its state through
//! the provider before it accepts new events.
//!
//! ```text
//! recall.yaml --> PersistenceConfig --> PersistenceProvider::connect
//!                                            |
//!     PersistentActor::recover  <------------+
//!         NotRecovering -> Recovering -> Replaying -> Live
//! ```
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `recall.yaml` into
//!   strongly-typed structs.
//! - [`provider`] -- [`PersistenceProvider`] facade over the journal and
//!   snapshot store.
//! - [`recovery`] -- [`PersistentState`] trait and the [`PersistentActor`]
//!   lifecycle.
//! - [`telemetry`] -- `tracing` subscriber setup.
//! - [`error`] -- Provider and recovery errors.

pub mod config;
pub mod error;
pub mod provider;
pub mod recovery;
pub mod telemetry;

pub use config::{ConfigError, PersistenceConfig};
pub use error::{CoreError, RecoveryCause, RecoveryError};
pub use provider::{DEFAULT_SNAPSHOT_INTERVAL, PersistenceProvider};
pub use recovery::{PersistentActor, PersistentState, RecoveryPhase, RecoveryReport};
pub use telemetry::init_tracing;
