use super::schema::*;
use diesel::prelude::*;

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = kv_entry)]
#[diesel(primary_key(store_key))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct KvEntry {
    pub store_key: String,
    pub value_json: String,
    pub updated_at: String,
}
