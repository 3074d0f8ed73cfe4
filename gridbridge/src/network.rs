//! Grid network objects.

use std::ffi::CString;

use crate::array::NativeStringArray;
use crate::dataframe::{Dataframe, DataframeArray, NativeSeriesArray, Series};
use crate::error::{BridgeError, Result};
use crate::handle::Handle;
use crate::native_call;
use crate::runtime::Runtime;

native_enum! {
    /// Kind of network element addressed by element-wise operations.
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum ElementType {
        Bus = 0,
        Line = 1,
        TwoWindingsTransformer = 2,
        Generator = 3,
        Load = 4,
        Substation = 5,
        VoltageLevel = 6,
    }
}

/// A network living inside the native engine.
#[derive(Debug, Clone)]
pub struct Network {
    handle: Handle,
    runtime: Runtime,
}

impl Network {
    /// Create a network from one of the engine's built-in factories, e.g.
    /// `"ieee14"` or `"eurostag_tutorial_example1"`.
    pub fn create(runtime: &Runtime, factory: &str) -> Result<Self> {
        let factory = c_string(factory, "factory")?;
        let handle = runtime.call_handle(|api, thread, exc| unsafe {
            (api.create_network)(thread, factory.as_ptr(), exc)
        })?;
        tracing::debug!(factory = ?factory, "network created");
        Ok(Self::from_handle(runtime, handle))
    }

    /// Wrap a handle returned by another native call.
    pub fn from_handle(runtime: &Runtime, handle: Handle) -> Self {
        Self {
            handle,
            runtime: runtime.clone(),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Extract the sub-network of one substation or voltage level.
    ///
    /// The returned network owns its own handle, independent of `self`.
    pub fn sub_network(&self, id: &str) -> Result<Self> {
        let id = c_string(id, "sub_network id")?;
        let parent = self.handle.as_ptr();
        let handle = self.runtime.call_handle(|api, thread, exc| unsafe {
            (api.get_sub_network)(thread, parent, id.as_ptr(), exc)
        })?;
        Ok(Self::from_handle(&self.runtime, handle))
    }

    /// Identifiers of every element of one type.
    pub fn element_ids(&self, element_type: ElementType) -> Result<Vec<String>> {
        let network = self.handle.as_ptr();
        let ids = self.runtime.call_with(
            |api, thread, exc| unsafe {
                (api.get_network_elements_ids)(thread, network, element_type.as_raw(), exc)
            },
            |raw| unsafe { NativeStringArray::from_raw(&self.runtime, raw) },
        )?;
        Ok(ids.to_vec())
    }

    /// Attributes of every element of one type, one series per attribute.
    pub fn elements(&self, element_type: ElementType) -> Result<Vec<Series>> {
        let network = self.handle.as_ptr();
        let series = self.runtime.call_with(
            |api, thread, exc| unsafe {
                (api.create_network_elements_series_array)(thread, network, element_type.as_raw(), exc)
            },
            |raw| unsafe { NativeSeriesArray::from_raw(&self.runtime, raw) },
        )?;
        series.to_series()
    }

    /// Update existing elements. The index column selects the elements.
    pub fn update_elements(&self, element_type: ElementType, frame: &Dataframe) -> Result<()> {
        native_call!(
            self.runtime,
            update_network_elements_with_series(
                self.handle.as_ptr(),
                frame.as_ptr(),
                element_type.as_raw()
            )
        )
    }

    /// Create elements from one or more tables in a single native call.
    pub fn create_elements(&self, element_type: ElementType, frames: &DataframeArray<'_>) -> Result<()> {
        native_call!(
            self.runtime,
            create_element(self.handle.as_ptr(), frames.as_ptr(), element_type.as_raw())
        )
    }
}

pub(crate) fn c_string(value: &str, field: &str) -> Result<CString> {
    CString::new(value).map_err(|_| BridgeError::invalid_string(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_type_tags_round_trip() {
        for element_type in [ElementType::Bus, ElementType::Generator, ElementType::VoltageLevel] {
            assert_eq!(ElementType::try_from(element_type.as_raw()), Ok(element_type));
        }
        assert_eq!(ElementType::try_from(7), Err(7));
    }

    #[test]
    fn nul_in_identifier_is_rejected() {
        let err = c_string("VL\01", "sub_network id").unwrap_err();
        assert_eq!(err.to_string(), "`sub_network id` contains an interior NUL byte");
    }
}
