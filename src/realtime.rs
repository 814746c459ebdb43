//! Turns the server's change feed into "go re-read this scope" signals.
//!
//! The listener owns at most one feed channel at a time. Subscribers of the same
//! scope share it; subscribing to another scope replaces it.

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, info, trace};

use crate::{
    model::Scope,
    remote::{ChangeFeed, ChannelId, FeedChannel},
};

const SIGNAL_CAPACITY: usize = 16;

/// Something in `scope` may have changed. Carries no payload on purpose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSignal {
    pub scope: Scope,
}

struct ActiveChannel {
    generation: u64,
    scope: Scope,
    channel: ChannelId,
    signals: broadcast::Sender<ChangeSignal>,
    pump: JoinHandle<()>,
    subscribers: usize,
}

struct ListenerState {
    feed: Rc<dyn ChangeFeed>,
    active: Option<ActiveChannel>,
    next_generation: u64,
}

impl ListenerState {
    /// Consumes the active channel, so its feed channel is released exactly once.
    fn teardown(&mut self) {
        if let Some(active) = self.active.take() {
            info!("Leaving change feed for {}", active.scope);
            active.pump.abort();
            self.feed.release(active.channel);
        }
    }
}

pub struct ChangeListener {
    state: Rc<RefCell<ListenerState>>,
}

impl ChangeListener {
    pub fn new(feed: Rc<dyn ChangeFeed>) -> Self {
        Self {
            state: Rc::new(RefCell::new(ListenerState {
                feed,
                active: None,
                next_generation: 1,
            })),
        }
    }

    /// Must run inside a `LocalSet`: the first subscriber of a scope spawns its pump.
    pub fn subscribe(&self, scope: &Scope) -> ScopeSubscription {
        let mut state = self.state.borrow_mut();
        if let Some(active) = state.active.as_mut().filter(|active| active.scope == *scope) {
            active.subscribers += 1;
            debug!("Sharing change feed for {scope} ({} subscribers)", active.subscribers);
            return ScopeSubscription {
                scope: scope.clone(),
                generation: active.generation,
                signals: active.signals.subscribe(),
                listener: Rc::downgrade(&self.state),
            };
        }

        state.teardown();
        let generation = state.next_generation;
        state.next_generation += 1;
        let FeedChannel {
            id: channel,
            mut notices,
        } = state.feed.open(scope);
        info!("Joined change feed for {scope}");
        let (signals, receiver) = broadcast::channel(SIGNAL_CAPACITY);
        let pump = {
            let signals = signals.clone();
            let scope = scope.clone();
            tokio::task::spawn_local(async move {
                while let Some(notice) = notices.recv().await {
                    if notice.scope == scope {
                        let _ = signals.send(ChangeSignal {
                            scope: scope.clone(),
                        });
                    } else {
                        trace!("Ignoring change for {}", notice.scope);
                    }
                }
            })
        };
        state.active = Some(ActiveChannel {
            generation,
            scope: scope.clone(),
            channel,
            signals,
            pump,
            subscribers: 1,
        });
        ScopeSubscription {
            scope: scope.clone(),
            generation,
            signals: receiver,
            listener: Rc::downgrade(&self.state),
        }
    }

    pub fn active_scope(&self) -> Option<Scope> {
        self.state
            .borrow()
            .active
            .as_ref()
            .map(|active| active.scope.clone())
    }

    /// Releases the feed channel, if any. Outstanding subscriptions then yield `None`.
    pub fn close(&self) {
        self.state.borrow_mut().teardown();
    }
}

impl Drop for ChangeListener {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct ScopeSubscription {
    scope: Scope,
    generation: u64,
    signals: broadcast::Receiver<ChangeSignal>,
    listener: Weak<RefCell<ListenerState>>,
}

impl ScopeSubscription {
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Waits for the next change. Signals missed while lagging collapse into one.
    /// Returns `None` once the feed for this scope is gone.
    pub async fn changed(&mut self) -> Option<ChangeSignal> {
        match self.signals.recv().await {
            Ok(signal) => Some(signal),
            Err(RecvError::Lagged(skipped)) => {
                debug!("Coalescing {skipped} missed change signals for {}", self.scope);
                Some(ChangeSignal {
                    scope: self.scope.clone(),
                })
            }
            Err(RecvError::Closed) => None,
        }
    }

    pub fn unsubscribe(self) {}
}

impl Drop for ScopeSubscription {
    fn drop(&mut self) {
        let Some(listener) = self.listener.upgrade() else {
            return;
        };
        let mut state = listener.borrow_mut();
        let last = match state.active.as_mut() {
            Some(active) if active.generation == self.generation => {
                active.subscribers -= 1;
                active.subscribers == 0
            }
            _ => false,
        };
        if last {
            state.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        remote::fake::FakeRemote,
        test_support::{bar, run_local},
    };

    fn listener_on(remote: &Rc<FakeRemote>) -> ChangeListener {
        ChangeListener::new(remote.clone())
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_of_one_scope_share_a_channel() {
        run_local(async {
            let remote = Rc::new(FakeRemote::new());
            let listener = listener_on(&remote);

            let mut first = listener.subscribe(&bar());
            let mut second = listener.subscribe(&bar());
            remote.push_change(&bar());

            assert_eq!(remote.opened_channels(), 1);
            assert_eq!(first.changed().await, Some(ChangeSignal { scope: bar() }));
            assert_eq!(second.changed().await, Some(ChangeSignal { scope: bar() }));
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn channel_is_released_once_after_the_last_subscriber_leaves() {
        run_local(async {
            let remote = Rc::new(FakeRemote::new());
            let listener = listener_on(&remote);
            let first = listener.subscribe(&bar());
            let second = listener.subscribe(&bar());

            first.unsubscribe();
            assert_eq!(remote.open_channels(), 1);
            second.unsubscribe();
            listener.close();

            assert_eq!(remote.open_channels(), 0);
            assert_eq!(remote.released_channels(), vec![ChannelId(1)]);
            assert_eq!(listener.active_scope(), None);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn switching_scope_tears_down_the_previous_channel() {
        run_local(async {
            let remote = Rc::new(FakeRemote::new());
            let listener = listener_on(&remote);
            let kitchen = Scope::new("feria-2026", "kitchen");
            let mut old = listener.subscribe(&bar());

            let mut new = listener.subscribe(&kitchen);
            settle().await;

            assert_eq!(remote.released_channels(), vec![ChannelId(1)]);
            assert_eq!(remote.open_channels(), 1);
            assert_eq!(old.changed().await, None);

            remote.push_change(&kitchen);
            assert_eq!(new.changed().await, Some(ChangeSignal { scope: kitchen }));

            // The stale subscription must not release the new channel.
            drop(old);
            assert_eq!(remote.open_channels(), 1);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn changes_of_sibling_cantinas_are_ignored() {
        run_local(async {
            let remote = Rc::new(FakeRemote::new());
            let listener = listener_on(&remote);
            let mut subscription = listener.subscribe(&bar());

            remote.push_change(&Scope::new("feria-2026", "kitchen"));
            settle().await;
            let nothing =
                tokio::time::timeout(Duration::from_secs(1), subscription.changed()).await;
            assert!(nothing.is_err());

            remote.push_change(&bar());
            assert!(subscription.changed().await.is_some());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_collapse_when_the_consumer_falls_behind() {
        run_local(async {
            let remote = Rc::new(FakeRemote::new());
            let listener = listener_on(&remote);
            let mut subscription = listener.subscribe(&bar());

            for _ in 0..(SIGNAL_CAPACITY * 3) {
                remote.push_change(&bar());
            }
            settle().await;

            let mut received = 0;
            while let Ok(Some(_)) =
                tokio::time::timeout(Duration::from_millis(5), subscription.changed()).await
            {
                received += 1;
            }
            assert!(received > 0);
            assert!(received <= SIGNAL_CAPACITY + 1);
        })
        .await;
    }
}
