//! edsync - Editor Configuration Synchronization
//!
//! Keeps editor settings, keybindings, locale, snippets, and the installed
//! extension list in sync with a single remote gist. The reconciliation
//! engine decides what to write, gates risky overwrites behind a
//! confirmation step, and keeps user-marked local-only keys out of the
//! remote copy.

pub mod config;
pub mod diff;
pub mod env;
pub mod errors;
pub mod extensions;
pub mod filter;
pub mod gist;
pub mod jsonc;
pub mod orchestrator;
pub mod setting;
pub mod watcher;

pub use config::SyncingConfig;
pub use env::Environment;
pub use errors::SyncError;
pub use gist::{GistClient, RemoteSnapshot, RemoteStorage};
pub use orchestrator::{Confirmer, SyncOrchestrator, SyncOutcome, SyncSummary};
pub use watcher::{ChangeSignal, ChangeWatcher};
