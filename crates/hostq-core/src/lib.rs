pub mod delivery;
pub mod effects;
pub mod error;
pub mod ids;
pub mod model;
pub mod outcomes;
pub mod planner;
pub mod reconcile;
pub mod scope;
pub mod snapshot;
pub mod types;

pub use delivery::Transition;
pub use effects::*;
pub use error::*;
pub use ids::*;
pub use model::*;
pub use outcomes::*;
pub use planner::*;
pub use scope::{HostLabelState, LabelScope, LabelScopeRow, ScopeDecision};
pub use snapshot::*;
pub use types::*;
