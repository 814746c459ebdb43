use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    future::Future,
    hash::Hash,
    rc::Rc,
    time::Duration,
};

use tokio::task::JoinHandle;

struct Timer {
    ticket: u64,
    handle: JoinHandle<()>,
}

/// One cancelable timer per key. Scheduling a key again replaces its timer.
///
/// A timer takes itself out of the map before running its action, so neither
/// `schedule` nor `cancel` can abort an action that has already started.
pub struct DebounceScheduler<K> {
    timers: Rc<RefCell<HashMap<K, Timer>>>,
    next_ticket: Cell<u64>,
}

impl<K> Default for DebounceScheduler<K> {
    fn default() -> Self {
        Self {
            timers: Rc::new(RefCell::new(HashMap::new())),
            next_ticket: Cell::new(1),
        }
    }
}

impl<K: Eq + Hash + Clone + 'static> DebounceScheduler<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `action` after `delay` unless `key` is scheduled or cancelled again first.
    /// Needs a `LocalSet`.
    pub fn schedule<F>(&self, key: K, delay: Duration, action: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let ticket = self.next_ticket.get();
        self.next_ticket.set(ticket + 1);
        let timers = Rc::downgrade(&self.timers);
        let fired_key = key.clone();
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            if let Some(timers) = timers.upgrade() {
                let mut timers = timers.borrow_mut();
                if timers
                    .get(&fired_key)
                    .is_some_and(|timer| timer.ticket == ticket)
                {
                    timers.remove(&fired_key);
                }
            }
            action.await;
        });
        let replaced = self
            .timers
            .borrow_mut()
            .insert(key, Timer { ticket, handle });
        if let Some(replaced) = replaced {
            replaced.handle.abort();
        }
    }

    pub fn cancel(&self, key: &K) -> bool {
        let removed = self.timers.borrow_mut().remove(key);
        match removed {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.timers.borrow().contains_key(key)
    }

    pub fn pending(&self) -> usize {
        self.timers.borrow().len()
    }

    pub fn cancel_all(&self) {
        let timers: Vec<Timer> = self.timers.borrow_mut().drain().map(|(_, timer)| timer).collect();
        for timer in timers {
            timer.handle.abort();
        }
    }
}

impl<K> Drop for DebounceScheduler<K> {
    fn drop(&mut self) {
        for (_, timer) in self.timers.borrow_mut().drain() {
            timer.handle.abort();
        }
    }
}
