pub mod engine;
pub mod models;
pub mod stats;

pub use engine::{ActuatorWriter, AutomationEngine};
pub use models::{AutomationRule, RuleDefinition};
