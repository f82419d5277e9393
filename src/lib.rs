pub mod brain;
pub mod cache;
pub mod config;
pub mod extract;
pub mod face;
pub mod learning;
pub mod metrics;
pub mod monitor;
pub mod optimizer;
pub mod planner;
pub mod selectors;
pub mod types;
pub mod validator;

pub use face::{AppState, router};
pub use learning::LearningStore;
pub use planner::{Plan, PlanError, PlanSource, Planner, RulePlanner};
pub use types::{Action, Envelope, Selector, TaskClass, TaskRequest};
