//! # ue-lfs
//!
//! Large File Storage client core for game-engine projects.
//!
//! This crate provides:
//! - LFS pointer file parsing and generation
//! - A content-addressed local store with verified, atomic writes
//! - LFS Batch API client for upload/download
//! - Server-side file locking
//! - Checkout and push planning and execution over a working tree
//!
//! ## Example
//!
//! ```no_run
//! use ue_lfs::{CancellationToken, LfsConfig, LockCoordinator, SyncEngine};
//!
//! let mut config = LfsConfig::new("https://git.example.com/studio/game.git", "alice");
//! config.repo_root = Some("/work/game".into());
//!
//! // Lock an asset before editing it
//! let locks = LockCoordinator::new(ue_lfs::BatchClient::from_config(&config).unwrap());
//! locks.acquire("Content/Maps/Arena.umap", "alice").unwrap();
//!
//! // Materialize committed pointers
//! let engine = SyncEngine::from_config(&config).unwrap();
//! let plan = engine.plan_checkout(&["Content/Maps/Arena.umap"]).unwrap();
//! let report = engine.execute(&plan, &CancellationToken::new()).unwrap();
//! assert!(report.is_success());
//! ```

mod attributes;
mod batch;
mod cancel;
mod client;
mod config;
mod error;
mod lock;
mod oid;
mod pointer;
mod retry;
mod store;
mod sync;
mod tree;

pub use attributes::TrackPatterns;
pub use batch::{
    Action, BatchError, BatchObject, BatchRequest, BatchResponse, ObjectSpec, Operation, RefInfo,
    TransferAction, VerifyAction,
};
pub use cancel::CancellationToken;
pub use client::{BatchClient, CredentialProvider, Credentials, Negotiation};
pub use config::{LfsConfig, RetryConfig, TimeoutConfig};
pub use error::{Error, Result};
pub use lock::{LockCoordinator, LockPhase, LockRecord, LockState};
pub use oid::{Oid, OidHasher};
pub use pointer::{Pointer, LFS_SPEC_V1, MAX_POINTER_SIZE};
pub use retry::RetryPolicy;
pub use store::{BlobEntry, ContentStore, TempBlob};
pub use sync::{
    FailedItem, ItemStatus, PlanItem, Progress, ProgressFn, SyncAction, SyncEngine, SyncPlan,
    SyncReport,
};
pub use tree::{normalize_path, FsWorkingTree, WorkingTree};
