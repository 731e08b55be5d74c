mod model;
mod repository;

pub use model::SyncEngineStateDB;
pub use repository::SyncEngineStateRepository;
