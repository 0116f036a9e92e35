//! Video pipeline orchestration: watch directories for finished exports,
//! run each project through an idempotent stage sequence (audio cleanup,
//! captions, branding, aspect renditions), publish the results to a CDN
//! library and keep a public showcase manifest in sync.

pub mod bunny;
pub mod captions;
pub mod config;
pub mod manifest;
pub mod probe;
pub mod stable;
pub mod stage;
pub mod status;
pub mod sync;
pub mod tools;
pub mod watch;
pub mod worker;

pub use bunny::BunnyClient;
pub use config::{DaemonConfig, ProjectConfig};
pub use manifest::Manifest;
pub use stable::is_stable;
pub use status::{StageOutcome, StatusRecord};
pub use sync::{run_sync, retry_stuck, SyncOptions};
pub use tools::ToolSet;
pub use watch::Watcher;
pub use worker::{process_project, WorkerContext};
