//! Sync domain models and services.

mod coordinator;
mod cursor;
mod merge;
mod remote;
mod retry;
mod scheduler;
mod store_traits;
mod sync_model;

pub use coordinator::*;
pub use cursor::*;
pub use merge::*;
pub use remote::*;
pub use retry::*;
pub use scheduler::*;
pub use store_traits::*;
pub use sync_model::*;
