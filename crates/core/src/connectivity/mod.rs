//! Online/offline tracking.

mod debounce;
mod monitor;

pub use debounce::Debouncer;
pub use monitor::ConnectivityMonitor;
