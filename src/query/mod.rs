//! Query planning and execution.

pub mod document;
pub mod engine;
pub mod planner;
pub mod scan;

pub use document::{OrderKey, Query, SelectItem, parse_query};
pub use engine::QueryEngine;
pub use planner::RollupRoute;
