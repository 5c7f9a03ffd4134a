//! aibox: policy engine and enforcement gate for AI development sandboxes
//!
//! This library provides:
//! - Layered org/team/project policies merged with tighten-only semantics
//! - First-match command risk classification
//! - An append-only decision log of every gated action
//! - A git remote helper that stages review-required pushes for approval

pub mod audit;
pub mod config;
pub mod gate;
pub mod policy;

pub use audit::{DecisionContext, DecisionEntry, DecisionLog};
pub use config::Config;
pub use gate::PushGate;
pub use policy::{EffectivePolicy, PolicyEngine, RiskClass};
