//! REST implementation of the sitesync remote store contract.

pub mod client;
pub mod error;

pub use client::RestRemoteStore;
pub use error::{RemoteClientError, Result};
