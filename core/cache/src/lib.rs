//! Cache strategy engine for fiscalgate.
//!
//! Decides per call whether to answer from the response cache or the
//! network, and keeps the cache consistent after mutations:
//! - [`QualityAssessor`]: short-lived network quality assessment
//! - [`EndpointClassifier`]: static endpoint table producing a [`CachePolicy`]
//! - [`select`]: strategy choice from policy, cache state and quality
//! - [`CacheStrategyEngine`]: strategy execution, background refresh and
//!   post-mutation invalidation

pub mod engine;
pub mod invalidation;
pub mod key;
pub mod policy;
pub mod quality;
pub mod strategy;

pub use engine::{CacheEvent, CacheOutcome, CacheStrategyEngine, ServedFrom};
pub use invalidation::patterns_for_mutation;
pub use key::cache_key;
pub use policy::{CacheConfig, CachePolicy, EndpointClass, EndpointClassifier};
pub use quality::{NetworkQuality, NetworkSpeed, QualityAssessor, Reliability};
pub use strategy::{select, CacheState, CacheStrategy};
