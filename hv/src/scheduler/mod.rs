//! Story scheduling
//!
//! Dependency ordering, assignment of planned stories to agents, agent
//! spawning and senior pool scaling.

mod assign;
mod graph;
mod scaling;
mod spawn;

pub use assign::{
    Assignment, AssignmentEngine, AssignmentReport, SkippedStory, TeamCycle, assignment_message,
    dependencies_satisfied, route_tier, select_agent,
};
pub use graph::{CycleError, sort_stories, topological_sort};
pub use scaling::{ScalingController, ScalingReport, recommended_seniors};
pub use spawn::{AgentSpawner, SpawnError};
