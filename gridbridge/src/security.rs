//! Contingency (N-1) security analysis.

use crate::array::LocalStringArray;
use crate::dataframe::{NativeSeriesArray, Series};
use crate::error::Result;
use crate::handle::Handle;
use crate::native_call;
use crate::network::{Network, c_string};
use crate::params::{LocalParams, SecurityAnalysisParameters};
use crate::runtime::Runtime;

/// A security analysis context: the contingencies to simulate.
#[derive(Debug, Clone)]
pub struct SecurityAnalysis {
    handle: Handle,
    runtime: Runtime,
}

impl SecurityAnalysis {
    pub fn create(runtime: &Runtime) -> Result<Self> {
        let handle = runtime.call_handle(|api, thread, exc| unsafe {
            (api.create_security_analysis)(thread, exc)
        })?;
        Ok(Self {
            handle,
            runtime: runtime.clone(),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Register a contingency tripping every element in `elements`.
    pub fn add_contingency<S: AsRef<str>>(&self, id: &str, elements: &[S]) -> Result<()> {
        let id = c_string(id, "contingency id")?;
        let mut elements = LocalStringArray::new(elements, "contingency elements")?;
        native_call!(
            self.runtime,
            add_contingency(
                self.handle.as_ptr(),
                id.as_ptr(),
                elements.as_mut_ptr(),
                elements.length()
            )
        )
    }

    /// Simulate every registered contingency on `network`.
    pub fn run(
        &self,
        network: &Network,
        parameters: &SecurityAnalysisParameters,
        provider: &str,
        dc: bool,
    ) -> Result<SecurityAnalysisResult> {
        let parameters = LocalParams::new(parameters)?;
        let provider = c_string(provider, "provider")?;
        let analysis = self.handle.as_ptr();
        let network = network.handle().as_ptr();
        let handle = self.runtime.call_handle(|api, thread, exc| unsafe {
            (api.run_security_analysis)(
                thread,
                analysis,
                network,
                parameters.as_ptr(),
                provider.as_ptr(),
                u8::from(dc),
                exc,
            )
        })?;
        tracing::debug!(dc, "security analysis finished");
        Ok(SecurityAnalysisResult {
            handle,
            runtime: self.runtime.clone(),
        })
    }
}

/// Results of a security analysis run, held by the native side.
#[derive(Debug, Clone)]
pub struct SecurityAnalysisResult {
    handle: Handle,
    runtime: Runtime,
}

impl SecurityAnalysisResult {
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Limit violations of the base case and every contingency, as columns
    /// (`contingency_id`, `subject_id`, `limit_type`, `limit`, `value`, ...).
    pub fn limit_violations(&self) -> Result<Vec<Series>> {
        let result = self.handle.as_ptr();
        let series = self.runtime.call_with(
            |api, thread, exc| unsafe { (api.get_limit_violations)(thread, result, exc) },
            |raw| unsafe { NativeSeriesArray::from_raw(&self.runtime, raw) },
        )?;
        series.to_series()
    }
}
