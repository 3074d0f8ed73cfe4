//! Columnar data exchanged with the native side.
//!
//! A [`Series`] is one named, typed column; a [`Dataframe`] is an ordered set
//! of columns in the order the native side expects them. Dataframes built
//! here are local-origin and free their buffers locally. Series returned by
//! the native side arrive as a [`NativeSeriesArray`] and are released with
//! the native `free_series_array`.

use std::ffi::{c_char, c_int};
use std::marker::PhantomData;
use std::ptr;

use serde::{Deserialize, Serialize};

use crate::array::{
    NativeDescriptor, alloc_c_string, alloc_slice, alloc_string_array, c_length, free_c_string,
    free_slice, free_string_array, raw_slice, read_c_str, read_string_array,
};
use crate::error::{BridgeError, Result};
use crate::native::{ArrayDescriptor, DataframeArrayRaw, DataframeRaw, SeriesRaw};
use crate::runtime::Runtime;

native_enum! {
    /// Element type tag of a series.
    #[serde(rename_all = "snake_case")]
    pub enum SeriesType {
        String = 0,
        Double = 1,
        Int = 2,
        Boolean = 3,
    }
}

/// Host-side values of a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum SeriesValues {
    Strings(Vec<String>),
    Doubles(Vec<f64>),
    Ints(Vec<i32>),
    Bools(Vec<bool>),
}

impl SeriesValues {
    /// The tag these values would be sent with.
    pub fn series_type(&self) -> SeriesType {
        match self {
            Self::Strings(_) => SeriesType::String,
            Self::Doubles(_) => SeriesType::Double,
            Self::Ints(_) => SeriesType::Int,
            Self::Bools(_) => SeriesType::Boolean,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Strings(v) => v.len(),
            Self::Doubles(v) => v.len(),
            Self::Ints(v) => v.len(),
            Self::Bools(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A named column with its declared type.
///
/// The declared type is kept separately from the values because binding
/// layers receive it from the caller; [`Dataframe::build`] rejects columns
/// whose values do not match it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    pub index: bool,
    pub series_type: SeriesType,
    pub values: SeriesValues,
}

impl Series {
    /// A data column typed after its values.
    pub fn new(name: impl Into<String>, values: SeriesValues) -> Self {
        Self {
            name: name.into(),
            index: false,
            series_type: values.series_type(),
            values,
        }
    }

    /// An index column typed after its values.
    pub fn index(name: impl Into<String>, values: SeriesValues) -> Self {
        Self {
            index: true,
            ..Self::new(name, values)
        }
    }

    /// A column with an explicitly declared type.
    pub fn declared(name: impl Into<String>, series_type: SeriesType, values: SeriesValues) -> Self {
        Self {
            name: name.into(),
            index: false,
            series_type,
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A locally allocated table ready to be passed into native calls.
pub struct Dataframe {
    raw: DataframeRaw,
}

// Safety: the dataframe exclusively owns every buffer it points to.
unsafe impl Send for Dataframe {}

impl Dataframe {
    /// Copy `columns` into native-compatible buffers.
    ///
    /// Every column is checked before anything is allocated: the declared
    /// type must match the values, all columns must have the same number of
    /// rows, and names and string values must not contain NUL bytes. Errors
    /// name the offending column.
    pub fn build(columns: &[Series]) -> Result<Self> {
        let series_count = c_length(columns.len(), "dataframe")?;
        validate(columns)?;

        let mut series = Vec::with_capacity(columns.len());
        for column in columns {
            match alloc_series(column) {
                Ok(raw) => series.push(raw),
                Err(err) => {
                    for raw in &series {
                        unsafe { free_series(raw) };
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self {
            raw: DataframeRaw {
                series: alloc_slice(series),
                series_count,
            },
        })
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        usize::try_from(self.raw.series_count).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.raw.series_count == 0
    }

    /// Copy the columns back out.
    pub fn to_series(&self) -> Result<Vec<Series>> {
        unsafe { read_dataframe(&self.raw) }
    }

    /// Pointer for a native call. The native side only reads through it.
    pub fn as_ptr(&self) -> *mut DataframeRaw {
        ptr::from_ref(&self.raw).cast_mut()
    }
}

impl Drop for Dataframe {
    fn drop(&mut self) {
        let series = unsafe { raw_slice(self.raw.series, self.raw.series_count) };
        for raw in series {
            unsafe { free_series(raw) };
        }
        unsafe { free_slice(self.raw.series, self.raw.series_count) };
    }
}

fn validate(columns: &[Series]) -> Result<()> {
    let rows = columns.first().map(Series::len);
    for column in columns {
        let actual = column.values.series_type();
        if actual != column.series_type {
            return Err(BridgeError::marshal(
                &column.name,
                format!(
                    "declared {:?} column but got {:?} values",
                    column.series_type, actual
                ),
            ));
        }
        if let Some(rows) = rows.filter(|&rows| rows != column.len()) {
            return Err(BridgeError::marshal(
                &column.name,
                format!("column has {} rows, expected {rows}", column.len()),
            ));
        }
        c_length(column.len(), &column.name)?;
        if column.name.contains('\0') {
            return Err(BridgeError::invalid_string(&column.name));
        }
        if let SeriesValues::Strings(values) = &column.values {
            if values.iter().any(|value| value.contains('\0')) {
                return Err(BridgeError::invalid_string(&column.name));
            }
        }
    }
    Ok(())
}

fn alloc_series(column: &Series) -> Result<SeriesRaw> {
    let name = alloc_c_string(&column.name, &column.name)?;
    let data = match &column.values {
        SeriesValues::Strings(values) => alloc_string_array(values, &column.name).map(|(ptr, length)| {
            ArrayDescriptor {
                ptr: ptr.cast(),
                length,
            }
        }),
        SeriesValues::Doubles(values) => primitive_descriptor(values.clone(), &column.name),
        SeriesValues::Ints(values) => primitive_descriptor(values.clone(), &column.name),
        SeriesValues::Bools(values) => primitive_descriptor(
            values.iter().map(|&v| i32::from(v)).collect(),
            &column.name,
        ),
    };
    match data {
        Ok(data) => Ok(SeriesRaw {
            name,
            index: c_int::from(column.index),
            series_type: column.series_type.as_raw(),
            data,
        }),
        Err(err) => {
            unsafe { free_c_string(name) };
            Err(err)
        }
    }
}

fn primitive_descriptor<T>(values: Vec<T>, field: &str) -> Result<ArrayDescriptor> {
    let length = c_length(values.len(), field)?;
    Ok(ArrayDescriptor {
        ptr: alloc_slice(values).cast(),
        length,
    })
}

/// Free one locally built series, choosing the element free from its tag.
unsafe fn free_series(raw: &SeriesRaw) {
    unsafe { free_c_string(raw.name) };
    let data = raw.data;
    match SeriesType::try_from(raw.series_type) {
        Ok(SeriesType::String) => unsafe {
            free_string_array(data.ptr.cast::<*mut c_char>(), data.length)
        },
        Ok(SeriesType::Double) => unsafe { free_slice(data.ptr.cast::<f64>(), data.length) },
        Ok(SeriesType::Int | SeriesType::Boolean) => unsafe {
            free_slice(data.ptr.cast::<i32>(), data.length)
        },
        Err(tag) => tracing::error!(tag, "leaking series buffer with unknown type tag"),
    }
}

/// Copy a series out of native-compatible memory.
///
/// # Safety
///
/// The name and data pointers must be null or valid for the declared type
/// and length.
pub unsafe fn read_series(raw: &SeriesRaw) -> Result<Series> {
    let name = unsafe { read_c_str(raw.name) };
    let series_type = SeriesType::try_from(raw.series_type)
        .map_err(|tag| BridgeError::marshal(&name, format!("unknown series type tag {tag}")))?;
    let data = raw.data;
    let values = match series_type {
        SeriesType::String => SeriesValues::Strings(unsafe {
            read_string_array(data.ptr.cast::<*mut c_char>(), data.length)
        }),
        SeriesType::Double => {
            SeriesValues::Doubles(unsafe { raw_slice(data.ptr.cast::<f64>(), data.length) }.to_vec())
        }
        SeriesType::Int => {
            SeriesValues::Ints(unsafe { raw_slice(data.ptr.cast::<i32>(), data.length) }.to_vec())
        }
        SeriesType::Boolean => SeriesValues::Bools(
            unsafe { raw_slice(data.ptr.cast::<i32>(), data.length) }
                .iter()
                .map(|&v| v != 0)
                .collect(),
        ),
    };
    Ok(Series {
        name,
        index: raw.index != 0,
        series_type,
        values,
    })
}

/// Copy every series of a dataframe.
///
/// # Safety
///
/// `raw.series` must be null or valid for `raw.series_count` series, each
/// satisfying [`read_series`].
pub unsafe fn read_dataframe(raw: &DataframeRaw) -> Result<Vec<Series>> {
    unsafe { raw_slice(raw.series, raw.series_count) }
        .iter()
        .map(|series| unsafe { read_series(series) })
        .collect()
}

/// Dataframe headers for bulk operations.
///
/// The headers are copied by value, so the series buffers stay owned by the
/// borrowed [`Dataframe`]s; dropping the array frees only the header array.
pub struct DataframeArray<'a> {
    raw: DataframeArrayRaw,
    _frames: PhantomData<&'a Dataframe>,
}

impl<'a> DataframeArray<'a> {
    pub fn new(frames: impl IntoIterator<Item = &'a Dataframe>) -> Result<Self> {
        let headers: Vec<DataframeRaw> = frames.into_iter().map(|frame| frame.raw).collect();
        let dataframes_count = c_length(headers.len(), "dataframe array")?;
        Ok(Self {
            raw: DataframeArrayRaw {
                dataframes: alloc_slice(headers),
                dataframes_count,
            },
            _frames: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        usize::try_from(self.raw.dataframes_count).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.raw.dataframes_count == 0
    }

    /// Pointer for a native call. The native side only reads through it.
    pub fn as_ptr(&self) -> *mut DataframeArrayRaw {
        ptr::from_ref(&self.raw).cast_mut()
    }
}

impl Drop for DataframeArray<'_> {
    fn drop(&mut self) {
        unsafe { free_slice(self.raw.dataframes, self.raw.dataframes_count) };
    }
}

/// Native-allocated array of series, freed with `free_series_array`.
pub struct NativeSeriesArray {
    descriptor: NativeDescriptor,
}

impl NativeSeriesArray {
    /// # Safety
    ///
    /// `raw` must be null or a native `free_series_array`-owned descriptor
    /// of [`SeriesRaw`] elements.
    pub unsafe fn from_raw(runtime: &Runtime, raw: *mut ArrayDescriptor) -> Self {
        Self {
            descriptor: unsafe {
                NativeDescriptor::new(runtime, raw, |api| api.free_series_array, "series array")
            },
        }
    }

    pub fn len(&self) -> usize {
        self.descriptor.descriptor().len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.descriptor().is_empty()
    }

    /// Copy every series.
    pub fn to_series(&self) -> Result<Vec<Series>> {
        let raw = self.descriptor.descriptor();
        unsafe { raw_slice(raw.ptr.cast::<SeriesRaw>(), raw.length) }
            .iter()
            .map(|series| unsafe { read_series(series) })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::tracker;

    fn generators() -> Vec<Series> {
        vec![
            Series::index("id", SeriesValues::Strings(vec!["GEN".into(), "GEN2".into()])),
            Series::new("target_p", SeriesValues::Doubles(vec![607.0, 302.5])),
            Series::new("bus_count", SeriesValues::Ints(vec![1, 3])),
            Series::new("voltage_regulator_on", SeriesValues::Bools(vec![true, false])),
        ]
    }

    #[test]
    fn build_copies_every_column_type() {
        let columns = generators();
        let frame = Dataframe::build(&columns).unwrap();
        assert_eq!(frame.len(), 4);
        assert_eq!(frame.to_series().unwrap(), columns);
    }

    #[test]
    fn drop_frees_each_buffer_exactly_once() {
        let before = tracker::live();
        let frame = Dataframe::build(&generators()).unwrap();
        // Names (4), id strings (2) and their array, three primitive buffers,
        // and the series array itself.
        assert_eq!(tracker::live(), before + 11);
        drop(frame);
        assert_eq!(tracker::live(), before);
    }

    #[test]
    fn type_mismatch_names_column_and_allocates_nothing() {
        let before = tracker::live();
        let columns = vec![
            Series::index("id", SeriesValues::Strings(vec!["L1".into()])),
            Series::declared(
                "p0",
                SeriesType::Double,
                SeriesValues::Strings(vec!["12.5".into()]),
            ),
        ];
        let err = Dataframe::build(&columns).err().unwrap();
        match err {
            BridgeError::Marshal { field, reason } => {
                assert_eq!(field, "p0");
                assert!(reason.contains("Double"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(tracker::live(), before);
    }

    #[test]
    fn ragged_columns_are_rejected() {
        let columns = vec![
            Series::index("id", SeriesValues::Strings(vec!["L1".into(), "L2".into()])),
            Series::new("q0", SeriesValues::Doubles(vec![1.0])),
        ];
        let err = Dataframe::build(&columns).err().unwrap();
        assert!(matches!(err, BridgeError::Marshal { field, .. } if field == "q0"));
    }

    #[test]
    fn nul_in_string_values_is_rejected() {
        let columns = vec![Series::index("id", SeriesValues::Strings(vec!["a\0b".into()]))];
        let err = Dataframe::build(&columns).err().unwrap();
        assert!(matches!(err, BridgeError::InvalidString { field } if field == "id"));
    }

    #[test]
    fn empty_dataframe_has_no_buffers() {
        let before = tracker::live();
        let frame = Dataframe::build(&[]).unwrap();
        assert!(frame.is_empty());
        assert!(frame.to_series().unwrap().is_empty());
        drop(frame);
        assert_eq!(tracker::live(), before);
    }

    #[test]
    fn dataframe_array_frees_only_headers() {
        let first = Dataframe::build(&generators()).unwrap();
        let second = Dataframe::build(&generators()[..2]).unwrap();
        let with_frames = tracker::live();

        let array = DataframeArray::new([&first, &second]).unwrap();
        assert_eq!(array.len(), 2);
        assert_eq!(tracker::live(), with_frames + 1);
        drop(array);
        assert_eq!(tracker::live(), with_frames);

        // The frames are still intact after the array is gone.
        assert_eq!(second.to_series().unwrap(), generators()[..2].to_vec());
    }

    #[test]
    fn unknown_tag_is_a_marshal_error() {
        let name = std::ffi::CString::new("mystery").unwrap();
        let raw = SeriesRaw {
            name: name.as_ptr().cast_mut(),
            index: 0,
            series_type: 9,
            data: ArrayDescriptor::empty(),
        };
        let err = unsafe { read_series(&raw) }.unwrap_err();
        assert!(err.to_string().contains("unknown series type tag 9"));
    }

    #[test]
    fn series_values_serialize_with_type_tag() {
        let values = SeriesValues::Ints(vec![1, 2]);
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"{"type":"ints","values":[1,2]}"#);
    }
}
