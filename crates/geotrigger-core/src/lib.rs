//! Geotrigger core: rule execution orchestration for geofence-triggered
//! contract calls.
//!
//! A *rule* pairs a geofence with a contract function and an authorization
//! policy; a *match event* is an externally-produced observation that a
//! wallet satisfied the rule's trigger condition. This crate drives
//! rule/match pairs through authorization, quorum and rate gating,
//! submission to the external execution service, and idempotent
//! completion. Geofence matching, ledger submission and credential storage
//! are external collaborators behind the traits in [`services`].

pub mod auth;
pub mod batch;
pub mod cancel;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod gate;
pub mod lifecycle;
pub mod model;
pub mod quorum;
pub mod services;

pub use batch::{BatchItem, BatchReport};
pub use cancel::CancelToken;
pub use engine::Engine;
pub use errors::EngineError;
pub use executor::{ExecCredentials, Executor};
pub use lifecycle::LifecycleStore;
pub use model::{EventKey, MatchEvent, Rule};
