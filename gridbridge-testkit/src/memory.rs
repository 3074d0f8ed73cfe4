//! The fake engine's allocator.
//!
//! Every top-level buffer handed to the bridge is registered with its kind
//! in the engine's allocation table, so a free through the wrong entry point
//! or a second free is detected instead of corrupting memory.

use std::ffi::{CString, c_char, c_int, c_void};
use std::ptr;

use gridbridge::native::{ArrayDescriptor, LoadFlowComponentResultRaw, SeriesRaw};
use gridbridge::{Series, SeriesValues};

/// Kind of a registered native allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alloc {
    Message,
    StringArray,
    SeriesArray,
    ComponentResults,
    LoadFlowParameters,
    SecurityAnalysisParameters,
}

pub(crate) fn native_string(value: &str) -> *mut c_char {
    CString::new(value.replace('\0', ""))
        .unwrap_or_default()
        .into_raw()
}

pub(crate) unsafe fn drop_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(unsafe { CString::from_raw(ptr) });
    }
}

fn buffer<T>(items: Vec<T>) -> ArrayDescriptor {
    let length = c_int::try_from(items.len()).unwrap_or(c_int::MAX);
    ArrayDescriptor {
        ptr: Box::into_raw(items.into_boxed_slice()).cast::<c_void>(),
        length,
    }
}

unsafe fn take_buffer<T>(data: ArrayDescriptor) -> Box<[T]> {
    unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(data.ptr.cast::<T>(), data.len())) }
}

fn descriptor<T>(items: Vec<T>) -> *mut ArrayDescriptor {
    Box::into_raw(Box::new(buffer(items)))
}

unsafe fn take_descriptor<T>(raw: *mut ArrayDescriptor) -> Box<[T]> {
    let descriptor = unsafe { Box::from_raw(raw) };
    unsafe { take_buffer(*descriptor) }
}

pub(crate) fn string_array(values: &[String]) -> *mut ArrayDescriptor {
    descriptor(values.iter().map(|v| native_string(v)).collect())
}

pub(crate) unsafe fn free_string_array(raw: *mut ArrayDescriptor) {
    for &string in unsafe { take_descriptor::<*mut c_char>(raw) }.iter() {
        unsafe { drop_string(string) };
    }
}

pub(crate) fn series_array(series: &[Series]) -> *mut ArrayDescriptor {
    descriptor(series.iter().map(series_raw).collect())
}

fn series_raw(series: &Series) -> SeriesRaw {
    let data = match &series.values {
        SeriesValues::Strings(values) => buffer(values.iter().map(|v| native_string(v)).collect()),
        SeriesValues::Doubles(values) => buffer(values.clone()),
        SeriesValues::Ints(values) => buffer(values.clone()),
        SeriesValues::Bools(values) => buffer(values.iter().map(|&v| i32::from(v)).collect()),
    };
    SeriesRaw {
        name: native_string(&series.name),
        index: c_int::from(series.index),
        series_type: series.values.series_type().as_raw(),
        data,
    }
}

pub(crate) unsafe fn free_series_array(raw: *mut ArrayDescriptor) {
    for series in unsafe { take_descriptor::<SeriesRaw>(raw) }.iter() {
        unsafe { drop_string(series.name) };
        match series.series_type {
            0 => {
                for &string in unsafe { take_buffer::<*mut c_char>(series.data) }.iter() {
                    unsafe { drop_string(string) };
                }
            }
            1 => drop(unsafe { take_buffer::<f64>(series.data) }),
            _ => drop(unsafe { take_buffer::<i32>(series.data) }),
        }
    }
}

pub(crate) fn component_results(results: Vec<LoadFlowComponentResultRaw>) -> *mut ArrayDescriptor {
    descriptor(results)
}

pub(crate) unsafe fn free_component_results(raw: *mut ArrayDescriptor) {
    for result in unsafe { take_descriptor::<LoadFlowComponentResultRaw>(raw) }.iter() {
        unsafe { drop_string(result.slack_bus_id) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridbridge::dataframe::read_series;
    use gridbridge::array::{raw_slice, read_string_array};

    #[test]
    fn string_array_is_readable_and_freeable() {
        let values = vec!["GEN".to_string(), String::new()];
        let raw = string_array(&values);
        let read = unsafe { read_string_array((*raw).ptr.cast(), (*raw).length) };
        assert_eq!(read, values);
        unsafe { free_string_array(raw) };
    }

    #[test]
    fn series_array_preserves_types() {
        let series = vec![
            Series::index("id", SeriesValues::Strings(vec!["LOAD".into()])),
            Series::new("connected", SeriesValues::Bools(vec![true])),
        ];
        let raw = series_array(&series);
        let read: Vec<Series> = unsafe { raw_slice((*raw).ptr.cast::<SeriesRaw>(), (*raw).length) }
            .iter()
            .map(|s| unsafe { read_series(s) }.unwrap())
            .collect();
        assert_eq!(read, series);
        unsafe { free_series_array(raw) };
    }
}
