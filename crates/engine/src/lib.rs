//! Rule execution engines.
//!
//! Engines take a set of rules (see `ruleflow-rule`), resolve their
//! declared dependencies into stages, and walk items through those stages.
//! Four variants cover the sync/async and single-object/pipeline axes:
//!
//! - [`Engine`] — synchronous, one subject type
//! - [`AsyncEngine`] — asynchronous with cancellation, one subject type
//! - [`PipelineEngine`] — synchronous pre/main/post phases over an input
//!   and an output object
//! - [`AsyncPipelineEngine`] — the async pipeline, including a streaming
//!   input source
//!
//! Rules halt execution through typed signals ([`HaltKind::Item`] ends the
//! current item, [`HaltKind::Engine`] ends the batch); halts are recorded
//! as [`FailureRecord`]s, not returned as errors. Everything else goes
//! through the engine's [`FailurePolicy`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
mod exec;
pub mod pipeline;
pub mod policy;
pub mod record;
pub mod single;

pub use error::EngineError;
pub use exec::EngineOptions;
pub use pipeline::{AsyncPipelineEngine, PipelineEngine};
pub use policy::{FailureDecision, FailurePolicy, HaltEngine, HaltItem, Ignore, Rethrow};
pub use record::{FailureRecord, HaltKind, Phase};
pub use single::{AsyncEngine, Engine};
