//! Durable key-value substrate for the sale queue and the cached read models.
//!
//! Every write replaces the whole value stored under a key, and the backends
//! make that replacement atomic per key. Callers never merge partial values.

use color_eyre::{Result, eyre::Context};
use serde::{Serialize, de::DeserializeOwned};

mod memory;
mod model;
mod schema;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[allow(async_fn_in_trait)]
pub trait KvStore {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: String) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

pub async fn load_json<S, T>(store: &S, key: &str) -> Result<Option<T>>
where
    S: KvStore,
    T: DeserializeOwned,
{
    let Some(raw) = store.get(key).await? else {
        return Ok(None);
    };
    let value = serde_json::from_str(&raw).wrap_err_with(|| format!("decoding {key}"))?;
    Ok(Some(value))
}

pub async fn save_json<S, T>(store: &S, key: &str, value: &T) -> Result<()>
where
    S: KvStore,
    T: Serialize,
{
    let raw = serde_json::to_string(value).wrap_err_with(|| format!("encoding {key}"))?;
    store.put(key, raw).await
}
