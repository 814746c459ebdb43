use std::{cell::Cell, rc::Rc};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    config::RejectedSalePolicy,
    connectivity::Connectivity,
    model::{PendingSale, SaleId},
    persist::KvStore,
    queue::SaleQueue,
    remote::{RemoteError, RemoteService},
    views::{Invalidator, Stale},
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub delivered: Vec<SaleId>,
    pub retained: Vec<SaleId>,
    pub parked: Vec<SaleId>,
}

impl FlushReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.retained.len() + self.parked.len()
    }
}

/// Delivers queued sales whenever the device (re)gains connectivity.
pub struct FlushOrchestrator<S, R> {
    queue: SaleQueue<S>,
    remote: Rc<R>,
    policy: RejectedSalePolicy,
    invalidator: Option<Invalidator>,
    flushing: Rc<Cell<bool>>,
}

/// Clears the in-flight flag even if the flush future is dropped midway.
struct FlushGuard(Rc<Cell<bool>>);

impl FlushGuard {
    fn acquire(flag: &Rc<Cell<bool>>) -> Option<Self> {
        if flag.replace(true) {
            return None;
        }
        Some(Self(flag.clone()))
    }
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl<S: KvStore, R: RemoteService> FlushOrchestrator<S, R> {
    pub fn new(queue: SaleQueue<S>, remote: Rc<R>, policy: RejectedSalePolicy) -> Self {
        Self {
            queue,
            remote,
            policy,
            invalidator: None,
            flushing: Rc::new(Cell::new(false)),
        }
    }

    /// Views to mark stale once a cycle has touched the server.
    pub fn with_invalidator(mut self, invalidator: Invalidator) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.get()
    }

    /// Runs one flush cycle. Returns `None` if a cycle is already in flight.
    pub async fn flush(&self) -> Option<FlushReport> {
        let Some(_guard) = FlushGuard::acquire(&self.flushing) else {
            debug!("Flush already in flight, ignoring trigger");
            return None;
        };
        let pending = self.queue.list_pending().await;
        if pending.is_empty() {
            return Some(FlushReport::default());
        }
        info!("Flushing {} queued sales", pending.len());

        let mut report = FlushReport::default();
        let mut rejected: Vec<(PendingSale, String)> = vec![];
        for sale in pending {
            match self
                .remote
                .submit_sale(&sale.payload, &sale.idempotency_key())
                .await
            {
                Ok(()) => {
                    debug!("Delivered queued sale {}", sale.id);
                    report.delivered.push(sale.id);
                }
                Err(RemoteError::Rejected(reason)) if self.policy == RejectedSalePolicy::Park => {
                    report.parked.push(sale.id.clone());
                    rejected.push((sale, reason));
                }
                Err(err) => {
                    warn!("Keeping sale {} queued: {err}", sale.id);
                    report.retained.push(sale.id);
                }
            }
        }

        self.queue.park(rejected).await;
        self.queue.remove_succeeded(&report.delivered).await;
        info!(
            "Flush done: {} delivered, {} retained, {} parked",
            report.delivered.len(),
            report.retained.len(),
            report.parked.len()
        );
        if let Some(invalidator) = &self.invalidator {
            invalidator.invalidate(Stale::All);
        }
        Some(report)
    }

    /// Flushes at startup when online and on every transition into `Online`,
    /// until the connectivity source goes away.
    pub async fn run(&self, mut connectivity: watch::Receiver<Connectivity>) {
        let mut was_online = false;
        loop {
            let online = *connectivity.borrow_and_update() == Connectivity::Online;
            if online && !was_online {
                self.flush().await;
            }
            was_online = online;
            if connectivity.changed().await.is_err() {
                debug!("Connectivity source closed, stopping flush driver");
                return;
            }
        }
    }
}
