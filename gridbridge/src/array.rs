//! Array marshaling with the allocation origin encoded in the type.
//!
//! - [`NativeArray`] and [`NativeStringArray`] wrap buffers allocated by the
//!   native runtime. They copy out on demand and release the buffer with the
//!   matching native free function when dropped.
//! - [`LocalArray`] and [`LocalStringArray`] wrap buffers built here to be
//!   passed into native calls. They are released with the local allocator
//!   and never reach a native free function.
//!
//! The `alloc_*`/`free_*` helpers below are the crate's local allocator;
//! dataframes and parameter structs use them too.

use std::ffi::{CStr, CString, c_char, c_int};
use std::marker::PhantomData;
use std::ptr;

use crate::error::{BridgeError, Result};
use crate::native::{ArrayDescriptor, Exc, NativeApi, Thread};
use crate::runtime::Runtime;

pub(crate) type ArrayFree = unsafe extern "C" fn(Thread, *mut ArrayDescriptor, Exc);

/// Convert a host length to the native `int` length, naming `field` on overflow.
pub(crate) fn c_length(len: usize, field: &str) -> Result<c_int> {
    c_int::try_from(len).map_err(|_| {
        BridgeError::marshal(field, format!("{len} elements exceed the native length limit"))
    })
}

/// Copy a C string. Null reads as the empty string; invalid UTF-8 is replaced.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string.
pub unsafe fn read_c_str(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

/// View `length` elements at `ptr`; null or non-positive lengths give an empty slice.
///
/// # Safety
///
/// A non-null `ptr` must be valid for `length` reads of `T` for `'a`.
pub unsafe fn raw_slice<'a, T>(ptr: *const T, length: c_int) -> &'a [T] {
    match usize::try_from(length) {
        Ok(len) if len > 0 && !ptr.is_null() => unsafe { std::slice::from_raw_parts(ptr, len) },
        _ => &[],
    }
}

/// Copy an array of C strings. Null entries become empty strings.
///
/// # Safety
///
/// See [`raw_slice`] and [`read_c_str`].
pub unsafe fn read_string_array(ptr: *const *mut c_char, length: c_int) -> Vec<String> {
    unsafe { raw_slice(ptr, length) }
        .iter()
        .map(|&s| unsafe { read_c_str(s) })
        .collect()
}

pub(crate) fn alloc_c_string(value: &str, field: &str) -> Result<*mut c_char> {
    let ptr = CString::new(value)
        .map(CString::into_raw)
        .map_err(|_| BridgeError::invalid_string(field))?;
    #[cfg(test)]
    tracker::record(ptr.addr());
    Ok(ptr)
}

pub(crate) unsafe fn free_c_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        #[cfg(test)]
        tracker::release(ptr.addr());
        drop(unsafe { CString::from_raw(ptr) });
    }
}

/// Allocate an array of C strings. Nothing is allocated if any value is invalid.
pub(crate) fn alloc_string_array<S: AsRef<str>>(
    values: &[S],
    field: &str,
) -> Result<(*mut *mut c_char, c_int)> {
    let length = c_length(values.len(), field)?;
    let owned = values
        .iter()
        .map(|value| CString::new(value.as_ref()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| BridgeError::invalid_string(field))?;
    let pointers: Vec<*mut c_char> = owned
        .into_iter()
        .map(|value| {
            let ptr = value.into_raw();
            #[cfg(test)]
            tracker::record(ptr.addr());
            ptr
        })
        .collect();
    Ok((alloc_slice(pointers), length))
}

pub(crate) unsafe fn free_string_array(ptr: *mut *mut c_char, length: c_int) {
    let pointers = unsafe { take_slice(ptr, length) };
    for &string in pointers.iter() {
        unsafe { free_c_string(string) };
    }
}

/// Move `values` to a leaked boxed slice. Empty input yields null.
pub(crate) fn alloc_slice<T>(values: Vec<T>) -> *mut T {
    if values.is_empty() {
        return ptr::null_mut();
    }
    let ptr = Box::into_raw(values.into_boxed_slice()).cast::<T>();
    #[cfg(test)]
    tracker::record(ptr.addr());
    ptr
}

pub(crate) unsafe fn free_slice<T>(ptr: *mut T, length: c_int) {
    drop(unsafe { take_slice(ptr, length) });
}

unsafe fn take_slice<T>(ptr: *mut T, length: c_int) -> Box<[T]> {
    match usize::try_from(length) {
        Ok(len) if len > 0 && !ptr.is_null() => {
            #[cfg(test)]
            tracker::release(ptr.addr());
            unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, len)) }
        }
        _ => Box::default(),
    }
}

/// Per-thread registry of live local allocations, used by unit tests to
/// catch leaks and double frees.
#[cfg(test)]
pub(crate) mod tracker {
    use std::cell::RefCell;
    use std::collections::HashSet;

    thread_local! {
        static LIVE: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
    }

    pub(crate) fn record(addr: usize) {
        LIVE.with(|live| assert!(live.borrow_mut().insert(addr), "{addr:#x} allocated twice"));
    }

    pub(crate) fn release(addr: usize) {
        LIVE.with(|live| assert!(live.borrow_mut().remove(&addr), "{addr:#x} freed but not live"));
    }

    pub(crate) fn live() -> usize {
        LIVE.with(|live| live.borrow().len())
    }
}

/// A native-allocated descriptor, released through the dispatcher on drop.
pub(crate) struct NativeDescriptor {
    runtime: Runtime,
    raw: *mut ArrayDescriptor,
    free: fn(&NativeApi) -> ArrayFree,
    kind: &'static str,
}

impl NativeDescriptor {
    /// # Safety
    ///
    /// `raw` must be null or a descriptor returned by the native side that
    /// is released by the function `free` selects.
    pub(crate) unsafe fn new(
        runtime: &Runtime,
        raw: *mut ArrayDescriptor,
        free: fn(&NativeApi) -> ArrayFree,
        kind: &'static str,
    ) -> Self {
        Self {
            runtime: runtime.clone(),
            raw,
            free,
            kind,
        }
    }

    pub(crate) fn descriptor(&self) -> ArrayDescriptor {
        if self.raw.is_null() {
            ArrayDescriptor::empty()
        } else {
            unsafe { *self.raw }
        }
    }
}

impl Drop for NativeDescriptor {
    fn drop(&mut self) {
        if self.raw.is_null() {
            return;
        }
        let raw = self.raw;
        let free = (self.free)(self.runtime.api());
        if let Err(err) = self
            .runtime
            .call_void(|_, thread, exc| unsafe { free(thread, raw, exc) })
        {
            tracing::error!(kind = self.kind, %err, "failed to release native array");
        }
    }
}

/// Native-allocated array of plain `#[repr(C)]` values, freed with `free_array`.
pub struct NativeArray<T> {
    descriptor: NativeDescriptor,
    _element: PhantomData<T>,
}

impl<T: Copy> NativeArray<T> {
    /// # Safety
    ///
    /// `raw` must be null or a native `free_array`-owned descriptor whose
    /// elements are `T`.
    pub unsafe fn from_raw(runtime: &Runtime, raw: *mut ArrayDescriptor) -> Self {
        Self {
            descriptor: unsafe { NativeDescriptor::new(runtime, raw, |api| api.free_array, "array") },
            _element: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.descriptor.descriptor().len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.descriptor().is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        let raw = self.descriptor.descriptor();
        unsafe { raw_slice(raw.ptr.cast::<T>(), raw.length) }
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.as_slice().to_vec()
    }
}

/// Native-allocated array of C strings, freed with `free_string_array`.
pub struct NativeStringArray {
    descriptor: NativeDescriptor,
}

impl NativeStringArray {
    /// # Safety
    ///
    /// `raw` must be null or a native `free_string_array`-owned descriptor of
    /// C string pointers.
    pub unsafe fn from_raw(runtime: &Runtime, raw: *mut ArrayDescriptor) -> Self {
        Self {
            descriptor: unsafe {
                NativeDescriptor::new(runtime, raw, |api| api.free_string_array, "string array")
            },
        }
    }

    pub fn len(&self) -> usize {
        self.descriptor.descriptor().len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.descriptor().is_empty()
    }

    /// Copy every entry. Null entries become empty strings.
    pub fn to_vec(&self) -> Vec<String> {
        let raw = self.descriptor.descriptor();
        unsafe { read_string_array(raw.ptr.cast::<*mut c_char>(), raw.length) }
    }
}

/// Locally allocated array passed into native calls.
pub struct LocalArray<T> {
    descriptor: ArrayDescriptor,
    _owned: PhantomData<Box<[T]>>,
}

impl<T> LocalArray<T> {
    pub fn new(values: Vec<T>, field: &str) -> Result<Self> {
        let length = c_length(values.len(), field)?;
        Ok(Self {
            descriptor: ArrayDescriptor {
                ptr: alloc_slice(values).cast(),
                length,
            },
            _owned: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.descriptor.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe { raw_slice(self.descriptor.ptr.cast::<T>(), self.descriptor.length) }
    }

    /// Descriptor pointer for a native call; valid while `self` is borrowed.
    pub fn as_mut_ptr(&mut self) -> *mut ArrayDescriptor {
        &raw mut self.descriptor
    }
}

impl<T> Drop for LocalArray<T> {
    fn drop(&mut self) {
        unsafe { free_slice(self.descriptor.ptr.cast::<T>(), self.descriptor.length) };
    }
}

/// Locally allocated array of C strings passed into native calls.
pub struct LocalStringArray {
    ptr: *mut *mut c_char,
    length: c_int,
}

impl LocalStringArray {
    /// Copy `values` into C strings. Fails with
    /// [`BridgeError::InvalidString`] naming `field`, before allocating
    /// anything, if a value contains a NUL byte.
    pub fn new<S: AsRef<str>>(values: &[S], field: &str) -> Result<Self> {
        let (ptr, length) = alloc_string_array(values, field)?;
        Ok(Self { ptr, length })
    }

    pub fn len(&self) -> usize {
        usize::try_from(self.length).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Native length of the array.
    pub fn length(&self) -> c_int {
        self.length
    }

    /// Pointer to the first C string pointer; null when empty.
    pub fn as_mut_ptr(&mut self) -> *mut *mut c_char {
        self.ptr
    }

    /// The array as a weakly typed descriptor.
    pub fn descriptor(&self) -> ArrayDescriptor {
        ArrayDescriptor {
            ptr: self.ptr.cast(),
            length: self.length,
        }
    }

    pub fn to_vec(&self) -> Vec<String> {
        unsafe { read_string_array(self.ptr, self.length) }
    }
}

impl Drop for LocalStringArray {
    fn drop(&mut self) {
        unsafe { free_string_array(self.ptr, self.length) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_array_exposes_values_through_descriptor() {
        let mut array = LocalArray::new(vec![1.5_f64, -2.0, 3.25], "p0").unwrap();
        assert_eq!(array.len(), 3);
        let raw = unsafe { *array.as_mut_ptr() };
        assert_eq!(raw.length, 3);
        let values = unsafe { raw_slice(raw.ptr.cast::<f64>(), raw.length) };
        assert_eq!(values, &[1.5, -2.0, 3.25]);
    }

    #[test]
    fn empty_local_array_has_null_buffer() {
        let array = LocalArray::<i32>::new(Vec::new(), "bus").unwrap();
        assert!(array.is_empty());
        assert!(array.descriptor.ptr.is_null());
        assert!(array.as_slice().is_empty());
    }

    #[test]
    fn local_string_array_round_trips_values() {
        let ids = ["GEN", "LOAD", "NHV1_NHV2_1"];
        let array = LocalStringArray::new(&ids, "ids").unwrap();
        assert_eq!(array.length(), 3);
        assert_eq!(array.to_vec(), ids);
    }

    #[test]
    fn dropping_local_arrays_frees_every_buffer_once() {
        let before = tracker::live();
        let strings = LocalStringArray::new(&["FR", "BE", "DE"], "countries").unwrap();
        let doubles = LocalArray::new(vec![0.5_f64; 8], "dc_power_factor").unwrap();
        // Three strings, their pointer array and the doubles buffer.
        assert_eq!(tracker::live(), before + 5);
        drop(strings);
        drop(doubles);
        assert_eq!(tracker::live(), before);
    }

    #[test]
    fn local_string_array_rejects_nul() {
        let before = tracker::live();
        let err = LocalStringArray::new(&["ok", "bad\0id"], "elements")
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::InvalidString { field } if field == "elements"));
        assert_eq!(tracker::live(), before);
    }

    #[test]
    fn null_strings_read_as_empty() {
        let entries = [ptr::null_mut::<c_char>()];
        let values = unsafe { read_string_array(entries.as_ptr(), 1) };
        assert_eq!(values, vec![String::new()]);
    }

    #[test]
    fn negative_length_reads_as_empty() {
        let values = [1_i32, 2];
        assert!(unsafe { raw_slice(values.as_ptr(), -4) }.is_empty());
    }

    #[test]
    fn length_overflow_names_field() {
        let err = c_length(usize::MAX, "countries").unwrap_err();
        assert!(err.to_string().contains("`countries`"));
    }
}
