pub mod csv;
pub mod models;
pub mod scheduler;

pub use models::{ReportJob, ReportJobDefinition, StatType};
pub use scheduler::ReportScheduler;
