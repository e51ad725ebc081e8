// skyplan-core - Shared model for intent-driven provisioning
//
// Holds everything the planner, the provider implementation and the CLI agree on:
// - Intents parsed from short commands
// - Plans (ordered step graphs) and their builder
// - State documents
// - Error types and exit codes
// - Provider capability traits

pub mod error;
pub mod intent;
pub mod names;
pub mod plan;
pub mod provider;
pub mod state;
pub mod validation;

pub use error::{ErrorCode, Result, SkyError};
pub use intent::{Intent, IntentKind};
pub use plan::{CostEstimate, CostItem, Permissions, Plan, PlanBuilder, Step};
pub use provider::{ProviderKind, ResourceProbe, StateStore};
pub use state::{LockInfo, StateDocument};
