use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    rc::Rc,
};

use color_eyre::{Result, eyre::bail};

use super::KvStore;

/// In-process store. Clones share the same entries, so a component rebuilt over a
/// clone sees exactly what survived, which is how tests simulate a restart.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Rc<RefCell<BTreeMap<String, String>>>,
    failing_writes: Rc<Cell<bool>>,
    failing_reads: Rc<Cell<u32>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every `put` and `remove` fails and leaves the entries untouched.
    pub fn fail_writes(&self, failing: bool) {
        self.failing_writes.set(failing);
    }

    /// Makes the next `count` calls to `get` fail.
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.set(count);
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.borrow().get(key).cloned()
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .borrow()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }
}

impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let failing = self.failing_reads.get();
        if failing > 0 {
            self.failing_reads.set(failing - 1);
            bail!("store could not read {key}");
        }
        Ok(self.raw(key))
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        if self.failing_writes.get() {
            bail!("store rejected write of {key}");
        }
        self.entries.borrow_mut().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if self.failing_writes.get() {
            bail!("store rejected removal of {key}");
        }
        self.entries.borrow_mut().remove(key);
        Ok(())
    }
}
