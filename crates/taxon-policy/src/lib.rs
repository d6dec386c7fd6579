//! Routing policy and the pending-decision queue.

pub mod queue;
pub mod router;

pub use queue::DecisionQueue;
pub use router::{
    AutoApplyBar, OperationRouter, Routed, RoutingContext, RoutingPolicy, RoutingSignals,
    build_pending, describe,
};
