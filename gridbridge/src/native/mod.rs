//! Raw C ABI shared with the native engine.
//!
//! Nothing in here owns memory. Ownership is decided by the wrapper that
//! produced or received a value (see [`crate::array`], [`crate::dataframe`]
//! and [`crate::params`]).

mod api;
mod types;

pub use api::*;
pub use types::*;
