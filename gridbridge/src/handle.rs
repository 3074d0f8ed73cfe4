//! Reference-counted ownership of native objects.

use std::ffi::c_void;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::native::ObjectHandle;
use crate::runtime::Runtime;

/// A shared reference to an object living inside the native runtime.
///
/// Clones share one ownership block. When the last clone is dropped the
/// native `destroy_object_handle` is called exactly once, through the
/// runtime's dispatcher. A null handle (the default) never reaches the
/// native side.
///
/// Each [`Handle::wrap`] creates an independent block, even when the native
/// side returns a pointer it considers to be the same resource. How aliased
/// native objects relate is the native runtime's business.
#[derive(Clone, Default)]
pub struct Handle {
    inner: Option<Arc<HandleInner>>,
}

struct HandleInner {
    ptr: NonNull<c_void>,
    runtime: Runtime,
}

// Safety: native object references may be used from any attached thread;
// the bridge adds no locking around them.
unsafe impl Send for HandleInner {}
unsafe impl Sync for HandleInner {}

impl Handle {
    /// Take ownership of a native object reference.
    pub fn wrap(runtime: &Runtime, ptr: ObjectHandle) -> Self {
        Self {
            inner: NonNull::new(ptr).map(|ptr| {
                Arc::new(HandleInner {
                    ptr,
                    runtime: runtime.clone(),
                })
            }),
        }
    }

    /// The raw reference, for passing into native calls. Null for a null handle.
    pub fn as_ptr(&self) -> ObjectHandle {
        self.inner
            .as_ref()
            .map_or(ptr::null_mut(), |inner| inner.ptr.as_ptr())
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// The runtime that will destroy this object.
    pub fn runtime(&self) -> Option<&Runtime> {
        self.inner.as_ref().map(|inner| &inner.runtime)
    }

    /// Number of live clones sharing this handle's ownership block.
    pub fn share_count(&self) -> usize {
        self.inner.as_ref().map_or(0, Arc::strong_count)
    }
}

impl From<&Handle> for ObjectHandle {
    fn from(handle: &Handle) -> Self {
        handle.as_ptr()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.as_ptr()).finish()
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let ptr = self.ptr.as_ptr();
        let destroyed = self.runtime.call_void(|api, thread, exc| unsafe {
            (api.destroy_object_handle)(thread, ptr, exc)
        });
        match destroyed {
            Ok(()) => tracing::debug!(?ptr, "native object destroyed"),
            Err(err) => tracing::error!(?ptr, %err, "failed to destroy native object"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_handle_is_null_and_unshared() {
        let handle = Handle::default();
        assert!(handle.is_null());
        assert!(handle.as_ptr().is_null());
        assert_eq!(handle.share_count(), 0);
        assert!(handle.runtime().is_none());
        // Dropping a null handle never touches a runtime.
        drop(handle.clone());
    }
}
