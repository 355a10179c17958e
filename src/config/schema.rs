use serde::{Deserialize, Serialize};

use crate::control::ControlConfig;
use crate::serial::SerialConfig;

/// Main application configuration
///
/// Every tunable the bridge relies on lives here rather than in code:
/// serial framing and timeouts, the sensor range, the debounce threshold,
/// loop pacing, and the read-failure limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Serial link settings
    pub serial: SerialConfig,
    /// Control loop settings
    pub control: ControlConfig,
}
