//! Layered sandbox policy: documents, validation, tighten-only merge,
//! command classification and the engine that records every decision.

pub mod classifier;
pub mod engine;
pub mod error;
pub mod integrity;
pub mod merge;
pub mod network;
pub mod schema;
pub mod store;
pub mod types;
pub mod units;

pub use classifier::{blocked_commands, decide, review_required_commands, Verdict};
pub use engine::{actions, PolicyEngine, UnmetHosts};
pub use error::{FieldError, MergeError, PolicyError, Violation};
pub use merge::{merge, merge_hierarchy, EffectivePolicy};
pub use store::{PolicyHierarchy, PolicyStore};
pub use types::{
    AllowRule, NetworkMode, PolicyDocument, PolicyLevel, RiskClass, ToolRule, ToolRuleConfig,
};
