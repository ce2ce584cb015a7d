//! Runtime limits

use serde::{Deserialize, Serialize};

/// Limits and tuning knobs of a [`Vm`](crate::vm::Vm).
///
/// Every field has a default, so a partial JSON document is a valid configuration:
///
/// ```
/// use stashvm::VmConfig;
///
/// let config = VmConfig::from_json(r#"{ "max_call_stack_size": 500 }"#).unwrap();
/// assert_eq!(config.max_call_stack_size, 500);
/// assert_eq!(config.stack_trace_limit, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Frame ceiling checked whenever a frame is pushed (0 disables)
    pub max_call_stack_size: usize,
    /// Frame ceiling checked by call instructions (0 disables)
    pub stack_depth_limit: usize,
    /// Nested dispatch loops (calls made from Rust back into scripts) before the run aborts
    pub max_native_depth: usize,
    /// Frames captured per exception
    pub stack_trace_limit: usize,
    /// Instructions between cooperative scheduler yields (0 disables)
    pub yield_interval: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_stack_size: i32::MAX as usize,
            stack_depth_limit: 0,
            max_native_depth: 256,
            stack_trace_limit: 10,
            yield_interval: 10_000,
        }
    }
}

impl VmConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
