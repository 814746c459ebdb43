use std::rc::Rc;

use strum::Display;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Connectivity {
    Online,
    Offline,
    Unknown,
}

/// Latest known network state, fed by the embedding app from its platform signal.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    status: Rc<watch::Sender<Connectivity>>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Unknown)
    }
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (status, _) = watch::channel(initial);
        Self {
            status: Rc::new(status),
        }
    }

    /// Records a new state; repeated reports of the same state are not transitions.
    pub fn set(&self, next: Connectivity) {
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            match next {
                Connectivity::Online => info!("Network: online"),
                Connectivity::Offline => warn!("Network: offline"),
                Connectivity::Unknown => info!("Network: unknown"),
            }
        }
    }

    pub fn current(&self) -> Connectivity {
        *self.status.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current() == Connectivity::Online
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.status.subscribe()
    }
}
