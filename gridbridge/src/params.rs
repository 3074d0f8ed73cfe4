//! Analysis parameter structs and their two ownership paths.
//!
//! Parameters copied out of the native side arrive in a [`NativeParams`],
//! which frees the struct with the native `free_*_parameters` function.
//! Parameters sent into the native side are built in a [`LocalParams`],
//! which deep-frees every field locally and never calls a native free.

use std::collections::BTreeMap;
use std::ffi::{c_char, c_int, c_uchar};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::array::{alloc_string_array, free_string_array, read_string_array};
use crate::error::{BridgeError, Result};
use crate::native::{Exc, LoadFlowParametersRaw, NativeApi, SecurityAnalysisParametersRaw, Thread};
use crate::runtime::Runtime;

/// A parameter object with a flat `#[repr(C)]` counterpart.
pub trait ParameterStruct: Sized {
    type Raw;

    /// Name used in diagnostics.
    const KIND: &'static str;

    /// The native function releasing a natively allocated `Raw`.
    fn native_free(api: &NativeApi) -> unsafe extern "C" fn(Thread, *mut Self::Raw, Exc);

    /// Deep-copy a raw struct. Never frees it.
    ///
    /// # Safety
    ///
    /// Every pointer field must be null or valid for its declared count.
    unsafe fn from_raw(raw: &Self::Raw) -> Result<Self>;

    /// Build a locally allocated raw struct. On error nothing stays allocated.
    fn to_raw(&self) -> Result<Self::Raw>;

    /// Free every locally allocated field of `raw` and null it out.
    ///
    /// # Safety
    ///
    /// `raw` must come from [`ParameterStruct::to_raw`].
    unsafe fn free_raw(raw: &mut Self::Raw);
}

/// A parameter struct allocated by the native side.
pub struct NativeParams<P: ParameterStruct> {
    runtime: Runtime,
    raw: NonNull<P::Raw>,
}

impl<P: ParameterStruct> NativeParams<P> {
    /// Take ownership of a struct returned by the native side.
    ///
    /// # Safety
    ///
    /// `raw` must be null or a struct the native side expects back through
    /// [`ParameterStruct::native_free`].
    pub unsafe fn from_raw(runtime: &Runtime, raw: *mut P::Raw) -> Result<Self> {
        let raw = NonNull::new(raw)
            .ok_or_else(|| BridgeError::marshal(P::KIND, "native side returned no parameters"))?;
        Ok(Self {
            runtime: runtime.clone(),
            raw,
        })
    }

    /// Deep-copy the parameters into host-owned values.
    pub fn copy(&self) -> Result<P> {
        unsafe { P::from_raw(self.raw.as_ref()) }
    }

    /// Copy the parameters and release the native struct right away.
    pub fn into_parameters(self) -> Result<P> {
        self.copy()
    }
}

impl<P: ParameterStruct> Drop for NativeParams<P> {
    fn drop(&mut self) {
        let raw = self.raw.as_ptr();
        let free = P::native_free(self.runtime.api());
        if let Err(err) = self
            .runtime
            .call_void(|_, thread, exc| unsafe { free(thread, raw, exc) })
        {
            tracing::error!(kind = P::KIND, %err, "failed to release native parameters");
        }
    }
}

/// A locally built parameter struct, shared by reference count.
///
/// The last clone deep-frees the struct, including embedded parameter
/// structs, with the local allocator.
pub struct LocalParams<P: ParameterStruct> {
    inner: Arc<LocalRaw<P>>,
}

struct LocalRaw<P: ParameterStruct> {
    raw: Box<P::Raw>,
}

// Safety: the raw struct is only read after construction, and every buffer
// it points to is owned by it.
unsafe impl<P: ParameterStruct> Send for LocalRaw<P> {}
unsafe impl<P: ParameterStruct> Sync for LocalRaw<P> {}

impl<P: ParameterStruct> LocalParams<P> {
    pub fn new(parameters: &P) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(LocalRaw {
                raw: Box::new(parameters.to_raw()?),
            }),
        })
    }

    pub fn raw(&self) -> &P::Raw {
        &self.inner.raw
    }

    /// Pointer for a native call. The native side only reads through it.
    pub fn as_ptr(&self) -> *mut P::Raw {
        ptr::from_ref::<P::Raw>(&self.inner.raw).cast_mut()
    }
}

impl<P: ParameterStruct> Clone for LocalParams<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: ParameterStruct> fmt::Debug for LocalParams<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LocalParams").field(&P::KIND).finish()
    }
}

impl<P: ParameterStruct> Drop for LocalRaw<P> {
    fn drop(&mut self) {
        unsafe { P::free_raw(&mut self.raw) };
    }
}

native_enum! {
    #[derive(Default)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum VoltageInitMode {
        #[default]
        UniformValues = 0,
        PreviousValues = 1,
        DcValues = 2,
    }
}

native_enum! {
    /// How active power mismatch is spread when the slack is distributed.
    #[derive(Default)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum BalanceType {
        ProportionalToGenerationP = 0,
        #[default]
        ProportionalToGenerationPMax = 1,
        ProportionalToLoad = 2,
        ProportionalToConformLoad = 3,
    }
}

native_enum! {
    #[derive(Default)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum ConnectedComponentMode {
        #[default]
        Main = 0,
        All = 1,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadFlowParameters {
    pub voltage_init_mode: VoltageInitMode,
    pub transformer_voltage_control_on: bool,
    pub use_reactive_limits: bool,
    pub phase_shifter_regulation_on: bool,
    pub twt_split_shunt_admittance: bool,
    pub shunt_compensator_voltage_control_on: bool,
    pub read_slack_bus: bool,
    pub write_slack_bus: bool,
    pub distributed_slack: bool,
    pub balance_type: BalanceType,
    pub dc_use_transformer_ratio: bool,
    /// ISO country codes whose injections take part in balancing.
    pub countries_to_balance: Vec<String>,
    pub connected_component_mode: ConnectedComponentMode,
    pub dc_power_factor: f64,
    /// Options for the selected load flow provider.
    pub provider_parameters: BTreeMap<String, String>,
}

impl Default for LoadFlowParameters {
    fn default() -> Self {
        Self {
            voltage_init_mode: VoltageInitMode::default(),
            transformer_voltage_control_on: false,
            use_reactive_limits: true,
            phase_shifter_regulation_on: false,
            twt_split_shunt_admittance: false,
            shunt_compensator_voltage_control_on: false,
            read_slack_bus: true,
            write_slack_bus: true,
            distributed_slack: true,
            balance_type: BalanceType::default(),
            dc_use_transformer_ratio: true,
            countries_to_balance: Vec::new(),
            connected_component_mode: ConnectedComponentMode::default(),
            dc_power_factor: 1.0,
            provider_parameters: BTreeMap::new(),
        }
    }
}

impl LoadFlowParameters {
    /// The engine's default parameters.
    pub fn native_defaults(runtime: &Runtime) -> Result<Self> {
        runtime
            .call_with(
                |api, thread, exc| unsafe { (api.create_load_flow_parameters)(thread, exc) },
                |raw| unsafe { NativeParams::<Self>::from_raw(runtime, raw) },
            )??
            .into_parameters()
    }
}

impl ParameterStruct for LoadFlowParameters {
    type Raw = LoadFlowParametersRaw;

    const KIND: &'static str = "load flow parameters";

    fn native_free(api: &NativeApi) -> unsafe extern "C" fn(Thread, *mut Self::Raw, Exc) {
        api.free_load_flow_parameters
    }

    unsafe fn from_raw(raw: &Self::Raw) -> Result<Self> {
        Ok(Self {
            voltage_init_mode: tag(raw.voltage_init_mode, "voltage_init_mode")?,
            transformer_voltage_control_on: raw.transformer_voltage_control_on != 0,
            use_reactive_limits: raw.use_reactive_limits != 0,
            phase_shifter_regulation_on: raw.phase_shifter_regulation_on != 0,
            twt_split_shunt_admittance: raw.twt_split_shunt_admittance != 0,
            shunt_compensator_voltage_control_on: raw.shunt_compensator_voltage_control_on != 0,
            read_slack_bus: raw.read_slack_bus != 0,
            write_slack_bus: raw.write_slack_bus != 0,
            distributed_slack: raw.distributed_slack != 0,
            balance_type: tag(raw.balance_type, "balance_type")?,
            dc_use_transformer_ratio: raw.dc_use_transformer_ratio != 0,
            countries_to_balance: unsafe {
                read_string_array(raw.countries_to_balance, raw.countries_to_balance_count)
            },
            connected_component_mode: tag(raw.connected_component_mode, "connected_component_mode")?,
            dc_power_factor: raw.dc_power_factor,
            provider_parameters: unsafe {
                read_provider_parameters(
                    (raw.provider_parameters_keys, raw.provider_parameters_keys_count),
                    (raw.provider_parameters_values, raw.provider_parameters_values_count),
                )
            }?,
        })
    }

    fn to_raw(&self) -> Result<Self::Raw> {
        let mut raw = LoadFlowParametersRaw {
            voltage_init_mode: self.voltage_init_mode.as_raw(),
            transformer_voltage_control_on: flag(self.transformer_voltage_control_on),
            use_reactive_limits: flag(self.use_reactive_limits),
            phase_shifter_regulation_on: flag(self.phase_shifter_regulation_on),
            twt_split_shunt_admittance: flag(self.twt_split_shunt_admittance),
            shunt_compensator_voltage_control_on: flag(self.shunt_compensator_voltage_control_on),
            read_slack_bus: flag(self.read_slack_bus),
            write_slack_bus: flag(self.write_slack_bus),
            distributed_slack: flag(self.distributed_slack),
            balance_type: self.balance_type.as_raw(),
            dc_use_transformer_ratio: flag(self.dc_use_transformer_ratio),
            countries_to_balance: ptr::null_mut(),
            countries_to_balance_count: 0,
            connected_component_mode: self.connected_component_mode.as_raw(),
            dc_power_factor: self.dc_power_factor,
            provider_parameters_keys: ptr::null_mut(),
            provider_parameters_keys_count: 0,
            provider_parameters_values: ptr::null_mut(),
            provider_parameters_values_count: 0,
        };
        let filled = (|| -> Result<()> {
            (raw.countries_to_balance, raw.countries_to_balance_count) =
                alloc_string_array(&self.countries_to_balance, "countries_to_balance")?;
            let (keys, values) = alloc_provider_parameters(&self.provider_parameters)?;
            (raw.provider_parameters_keys, raw.provider_parameters_keys_count) = keys;
            (raw.provider_parameters_values, raw.provider_parameters_values_count) = values;
            Ok(())
        })();
        if let Err(err) = filled {
            unsafe { Self::free_raw(&mut raw) };
            return Err(err);
        }
        Ok(raw)
    }

    unsafe fn free_raw(raw: &mut Self::Raw) {
        unsafe {
            free_strings(&mut raw.countries_to_balance, &mut raw.countries_to_balance_count);
            free_strings(&mut raw.provider_parameters_keys, &mut raw.provider_parameters_keys_count);
            free_strings(
                &mut raw.provider_parameters_values,
                &mut raw.provider_parameters_values_count,
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityAnalysisParameters {
    pub load_flow_parameters: LoadFlowParameters,
    pub flow_proportional_threshold: f64,
    pub low_voltage_proportional_threshold: f64,
    pub low_voltage_absolute_threshold: f64,
    pub high_voltage_proportional_threshold: f64,
    pub high_voltage_absolute_threshold: f64,
    pub provider_parameters: BTreeMap<String, String>,
}

impl Default for SecurityAnalysisParameters {
    fn default() -> Self {
        Self {
            load_flow_parameters: LoadFlowParameters::default(),
            flow_proportional_threshold: 0.1,
            low_voltage_proportional_threshold: 0.0,
            low_voltage_absolute_threshold: 0.0,
            high_voltage_proportional_threshold: 0.0,
            high_voltage_absolute_threshold: 0.0,
            provider_parameters: BTreeMap::new(),
        }
    }
}

impl SecurityAnalysisParameters {
    /// The engine's default parameters.
    pub fn native_defaults(runtime: &Runtime) -> Result<Self> {
        runtime
            .call_with(
                |api, thread, exc| unsafe { (api.create_security_analysis_parameters)(thread, exc) },
                |raw| unsafe { NativeParams::<Self>::from_raw(runtime, raw) },
            )??
            .into_parameters()
    }
}

impl ParameterStruct for SecurityAnalysisParameters {
    type Raw = SecurityAnalysisParametersRaw;

    const KIND: &'static str = "security analysis parameters";

    fn native_free(api: &NativeApi) -> unsafe extern "C" fn(Thread, *mut Self::Raw, Exc) {
        api.free_security_analysis_parameters
    }

    unsafe fn from_raw(raw: &Self::Raw) -> Result<Self> {
        Ok(Self {
            load_flow_parameters: unsafe { LoadFlowParameters::from_raw(&raw.load_flow_parameters) }?,
            flow_proportional_threshold: raw.flow_proportional_threshold,
            low_voltage_proportional_threshold: raw.low_voltage_proportional_threshold,
            low_voltage_absolute_threshold: raw.low_voltage_absolute_threshold,
            high_voltage_proportional_threshold: raw.high_voltage_proportional_threshold,
            high_voltage_absolute_threshold: raw.high_voltage_absolute_threshold,
            provider_parameters: unsafe {
                read_provider_parameters(
                    (raw.provider_parameters_keys, raw.provider_parameters_keys_count),
                    (raw.provider_parameters_values, raw.provider_parameters_values_count),
                )
            }?,
        })
    }

    fn to_raw(&self) -> Result<Self::Raw> {
        let mut raw = SecurityAnalysisParametersRaw {
            load_flow_parameters: self.load_flow_parameters.to_raw()?,
            flow_proportional_threshold: self.flow_proportional_threshold,
            low_voltage_proportional_threshold: self.low_voltage_proportional_threshold,
            low_voltage_absolute_threshold: self.low_voltage_absolute_threshold,
            high_voltage_proportional_threshold: self.high_voltage_proportional_threshold,
            high_voltage_absolute_threshold: self.high_voltage_absolute_threshold,
            provider_parameters_keys: ptr::null_mut(),
            provider_parameters_keys_count: 0,
            provider_parameters_values: ptr::null_mut(),
            provider_parameters_values_count: 0,
        };
        match alloc_provider_parameters(&self.provider_parameters) {
            Ok((keys, values)) => {
                (raw.provider_parameters_keys, raw.provider_parameters_keys_count) = keys;
                (raw.provider_parameters_values, raw.provider_parameters_values_count) = values;
                Ok(raw)
            }
            Err(err) => {
                unsafe { Self::free_raw(&mut raw) };
                Err(err)
            }
        }
    }

    unsafe fn free_raw(raw: &mut Self::Raw) {
        unsafe {
            LoadFlowParameters::free_raw(&mut raw.load_flow_parameters);
            free_strings(&mut raw.provider_parameters_keys, &mut raw.provider_parameters_keys_count);
            free_strings(
                &mut raw.provider_parameters_values,
                &mut raw.provider_parameters_values_count,
            );
        }
    }
}

fn flag(value: bool) -> c_uchar {
    c_uchar::from(value)
}

fn tag<T: TryFrom<c_int, Error = c_int>>(value: c_int, field: &str) -> Result<T> {
    T::try_from(value).map_err(|value| BridgeError::marshal(field, format!("unknown value {value}")))
}

type StringArray = (*mut *mut c_char, c_int);

fn alloc_provider_parameters(
    parameters: &BTreeMap<String, String>,
) -> Result<(StringArray, StringArray)> {
    let keys: Vec<&str> = parameters.keys().map(String::as_str).collect();
    let values: Vec<&str> = parameters.values().map(String::as_str).collect();
    let keys = alloc_string_array(&keys, "provider_parameters")?;
    match alloc_string_array(&values, "provider_parameters") {
        Ok(values) => Ok((keys, values)),
        Err(err) => {
            unsafe { free_string_array(keys.0, keys.1) };
            Err(err)
        }
    }
}

unsafe fn read_provider_parameters(
    (keys, keys_count): (*mut *mut c_char, c_int),
    (values, values_count): (*mut *mut c_char, c_int),
) -> Result<BTreeMap<String, String>> {
    if keys_count != values_count {
        return Err(BridgeError::marshal(
            "provider_parameters",
            format!("{keys_count} keys but {values_count} values"),
        ));
    }
    let keys = unsafe { read_string_array(keys, keys_count) };
    let values = unsafe { read_string_array(values, values_count) };
    Ok(keys.into_iter().zip(values).collect())
}

unsafe fn free_strings(ptr: &mut *mut *mut c_char, count: &mut c_int) {
    unsafe { free_string_array(*ptr, *count) };
    *ptr = ptr::null_mut();
    *count = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::tracker;

    fn tuned_security_parameters() -> SecurityAnalysisParameters {
        SecurityAnalysisParameters {
            load_flow_parameters: LoadFlowParameters {
                voltage_init_mode: VoltageInitMode::DcValues,
                balance_type: BalanceType::ProportionalToLoad,
                countries_to_balance: vec!["FR".into(), "BE".into()],
                dc_power_factor: 0.95,
                provider_parameters: BTreeMap::from([
                    ("maxNewtonRaphsonIterations".into(), "30".into()),
                    ("slackBusSelectionMode".into(), "MOST_MESHED".into()),
                ]),
                ..LoadFlowParameters::default()
            },
            flow_proportional_threshold: 0.2,
            high_voltage_absolute_threshold: 5.0,
            provider_parameters: BTreeMap::from([("threads".into(), "4".into())]),
            ..SecurityAnalysisParameters::default()
        }
    }

    #[test]
    fn local_struct_mirrors_parameters() {
        let parameters = tuned_security_parameters();
        let local = LocalParams::new(&parameters).unwrap();
        let raw = local.raw();
        assert_eq!(raw.load_flow_parameters.voltage_init_mode, 2);
        assert_eq!(raw.load_flow_parameters.countries_to_balance_count, 2);
        assert_eq!(raw.load_flow_parameters.provider_parameters_keys_count, 2);
        assert_eq!(raw.provider_parameters_values_count, 1);
        let copied = unsafe { SecurityAnalysisParameters::from_raw(raw) }.unwrap();
        assert_eq!(copied, parameters);
    }

    #[test]
    fn last_clone_deep_frees_nested_struct() {
        let before = tracker::live();
        let local = LocalParams::new(&tuned_security_parameters()).unwrap();
        // Load flow: 2 countries + array, 2 keys + array, 2 values + array.
        // Security analysis: 1 key + array, 1 value + array.
        assert_eq!(tracker::live(), before + 13);

        let shared = local.clone();
        drop(local);
        assert_eq!(tracker::live(), before + 13);
        drop(shared);
        assert_eq!(tracker::live(), before);
    }

    #[test]
    fn invalid_provider_value_leaves_nothing_allocated() {
        let before = tracker::live();
        let mut parameters = tuned_security_parameters();
        parameters
            .provider_parameters
            .insert("bad".into(), "nul\0value".into());
        let err = LocalParams::new(&parameters).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidString { field } if field == "provider_parameters"));
        assert_eq!(tracker::live(), before);
    }

    #[test]
    fn mismatched_provider_arrays_are_rejected() {
        let local = LocalParams::new(&LoadFlowParameters {
            provider_parameters: BTreeMap::from([("a".into(), "1".into())]),
            ..LoadFlowParameters::default()
        })
        .unwrap();
        let mut raw = *local.raw();
        raw.provider_parameters_values_count = 0;
        let err = unsafe { LoadFlowParameters::from_raw(&raw) }.unwrap_err();
        assert!(err.to_string().contains("1 keys but 0 values"));
    }

    #[test]
    fn unknown_enum_value_names_field() {
        let local = LocalParams::new(&LoadFlowParameters::default()).unwrap();
        let mut raw = *local.raw();
        raw.balance_type = 42;
        let err = unsafe { LoadFlowParameters::from_raw(&raw) }.unwrap_err();
        assert!(matches!(err, BridgeError::Marshal { field, .. } if field == "balance_type"));
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let parameters: SecurityAnalysisParameters = serde_json::from_str(
            r#"{"load_flow_parameters": {"balance_type": "PROPORTIONAL_TO_LOAD"}}"#,
        )
        .unwrap();
        assert_eq!(parameters.flow_proportional_threshold, 0.1);
        assert_eq!(
            parameters.load_flow_parameters.balance_type,
            BalanceType::ProportionalToLoad
        );
        assert!(parameters.load_flow_parameters.use_reactive_limits);
    }
}
