//! Database model for cached records.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(table_name, record_key))]
#[diesel(table_name = crate::schema::local_records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct LocalRecordDB {
    pub table_name: String,
    pub record_key: String,
    pub payload: String,
    pub version: i64,
    pub sync_state: String,
    pub updated_at: String,
}
