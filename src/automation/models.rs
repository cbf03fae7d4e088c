use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::formula;
use crate::utils::error::GatewayError;

fn default_cooldown() -> u64 {
    60
}
fn default_enabled() -> bool {
    true
}

/// Operator-editable part of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub name: String,
    /// Expression over sensor names and `stat_<sensor>_<func>_<window>` variables.
    pub condition: String,
    pub target_sensor_id: i64,
    pub target_value: f64,
    #[serde(default = "default_cooldown")]
    pub cooldown_s: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl RuleDefinition {
    /// Checks everything that does not need the sensor registry.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::Validation("rule name must not be empty".into()));
        }
        if !self.target_value.is_finite() {
            return Err(GatewayError::Validation("target_value must be finite".into()));
        }
        formula::validate(&self.condition)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: i64,
    #[serde(flatten)]
    pub definition: RuleDefinition,
    pub last_triggered: Option<DateTime<Utc>>,
}
