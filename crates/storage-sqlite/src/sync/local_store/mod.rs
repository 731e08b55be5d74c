//! Local Store persistence.

mod model;
mod repository;

pub use model::LocalRecordDB;
pub use repository::LocalStoreRepository;
