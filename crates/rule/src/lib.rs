#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Ruleflow Rule
//!
//! Rule model, dependency resolver, engine context, and predicate cache for
//! the Ruleflow engine.
//!
//! This crate defines everything the execution engines consume — it does
//! NOT contain the engines themselves. It provides:
//!
//! - [`RuleMetadata`] — name, dependencies, provides, cache declarations
//! - [`Rule`], [`JointRule`], [`AsyncRule`], [`AsyncJointRule`] — behavior traits
//! - [`Applicability`] — predicate result shared by boolean and scored rules
//! - [`DependencyGraph`] and [`resolve_stages`] — Kahn level batching with
//!   cycle and missing-provider detection
//! - [`EngineContext`] — per-call mutable state threaded through every rule
//! - [`PredicateCache`] — keyed predicate memoization, per-input or per-execution
//! - [`RuleBuilder`] — fluent construction of closure-backed rules

pub mod applicability;
pub mod builder;
pub mod cache;
pub mod context;
pub mod error;
pub mod graph;
pub mod metadata;
pub mod rule;

pub use applicability::Applicability;
pub use builder::RuleBuilder;
pub use cache::PredicateCache;
pub use context::{EngineContext, EngineInfo};
pub use error::{RuleError, RuleSetError};
pub use graph::{DependencyGraph, resolve_stages};
pub use metadata::{CacheScope, CacheSpec, RuleMetadata};
pub use rule::{AsyncJointRule, AsyncRule, JointRule, Rule};
