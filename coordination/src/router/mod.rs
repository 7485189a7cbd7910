//! Task Router Module
//!
//! Maps logical task types onto a provider, model and sampling parameters.
//!
//! # Resolution
//!
//! ```text
//! Task type            | Override provider | Result
//! ---------------------|-------------------|-------------------------------------------
//! comprehensive_report | claude            | claude + override model or claude default
//! single_interpretation| (none)            | global primary + its default, 4096 / 0.7
//! anything else        | (no override)     | global primary + its default model
//! ```

pub mod routing;
pub mod task_router;

pub use routing::{GlobalRouting, GlobalUpdate, RoutingConfig, TaskAssignment, TaskKind};
pub use task_router::{PersistenceError, RouteDecision, SharedTaskRouter, TaskRouter};
