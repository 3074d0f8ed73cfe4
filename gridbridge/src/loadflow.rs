//! Load flow execution.

use serde::{Deserialize, Serialize};

use crate::array::{NativeArray, read_c_str};
use crate::error::{BridgeError, Result};
use crate::native::LoadFlowComponentResultRaw;
use crate::network::{Network, c_string};
use crate::params::{LoadFlowParameters, LocalParams};
use crate::runtime::Runtime;

native_enum! {
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum ComponentStatus {
        Converged = 0,
        MaxIterationReached = 1,
        Failed = 2,
        NoCalculation = 3,
    }
}

/// Outcome of a load flow on one connected component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentResult {
    pub connected_component_num: i32,
    pub synchronous_component_num: i32,
    pub status: ComponentStatus,
    pub iteration_count: i32,
    pub slack_bus_id: String,
    /// MW.
    pub slack_bus_active_power_mismatch: f64,
}

impl ComponentResult {
    pub fn converged(&self) -> bool {
        self.status == ComponentStatus::Converged
    }

    /// # Safety
    ///
    /// `slack_bus_id` must be null or a NUL-terminated string.
    unsafe fn from_raw(raw: &LoadFlowComponentResultRaw) -> Result<Self> {
        let status = ComponentStatus::try_from(raw.status).map_err(|status| {
            BridgeError::marshal("status", format!("unknown component status {status}"))
        })?;
        Ok(Self {
            connected_component_num: raw.connected_component_num,
            synchronous_component_num: raw.synchronous_component_num,
            status,
            iteration_count: raw.iteration_count,
            slack_bus_id: unsafe { read_c_str(raw.slack_bus_id) },
            slack_bus_active_power_mismatch: raw.slack_bus_active_power_mismatch,
        })
    }
}

/// Run an AC (or DC when `dc` is set) load flow on `network`, updating its
/// state in place. An empty `provider` selects the engine's default.
pub fn run(
    runtime: &Runtime,
    network: &Network,
    dc: bool,
    parameters: &LoadFlowParameters,
    provider: &str,
) -> Result<Vec<ComponentResult>> {
    let parameters = LocalParams::new(parameters)?;
    let provider = c_string(provider, "provider")?;
    let network = network.handle().as_ptr();
    let results = runtime.call_with(
        |api, thread, exc| unsafe {
            (api.run_load_flow)(
                thread,
                network,
                u8::from(dc),
                parameters.as_ptr(),
                provider.as_ptr(),
                exc,
            )
        },
        |raw| unsafe { NativeArray::<LoadFlowComponentResultRaw>::from_raw(runtime, raw) },
    )?;
    let results = results
        .as_slice()
        .iter()
        .map(|raw| unsafe { ComponentResult::from_raw(raw) })
        .collect::<Result<Vec<_>>>()?;
    tracing::debug!(
        dc,
        components = results.len(),
        converged = results.iter().filter(|r| r.converged()).count(),
        "load flow finished"
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn raw_result_is_copied() {
        let slack = CString::new("VLHV1_0").unwrap();
        let raw = LoadFlowComponentResultRaw {
            connected_component_num: 0,
            synchronous_component_num: 0,
            status: 1,
            iteration_count: 15,
            slack_bus_id: slack.as_ptr().cast_mut(),
            slack_bus_active_power_mismatch: -0.006,
        };
        let result = unsafe { ComponentResult::from_raw(&raw) }.unwrap();
        assert_eq!(result.status, ComponentStatus::MaxIterationReached);
        assert!(!result.converged());
        assert_eq!(result.slack_bus_id, "VLHV1_0");
    }

    #[test]
    fn unknown_status_is_rejected() {
        let raw = LoadFlowComponentResultRaw {
            connected_component_num: 0,
            synchronous_component_num: 0,
            status: 12,
            iteration_count: 0,
            slack_bus_id: std::ptr::null_mut(),
            slack_bus_active_power_mismatch: 0.0,
        };
        let err = unsafe { ComponentResult::from_raw(&raw) }.unwrap_err();
        assert!(err.to_string().contains("unknown component status 12"));
    }
}
