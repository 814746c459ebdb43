//! Durable queue of sales that could not be delivered yet.
//!
//! The whole queue lives under one store key and every change rewrites it
//! completely, so a crash leaves either the previous or the next snapshot.

use std::rc::Rc;

use color_eyre::Result;
use time::OffsetDateTime;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::{
    model::{PendingSale, SaleId, SalePayload, unix_millis},
    persist::KvStore,
};

mod snapshot;

pub const QUEUE_KEY: &str = "offline_sales_queue";
pub const CORRUPT_QUEUE_KEY: &str = "offline_sales_queue.corrupt";
pub const PARKED_KEY: &str = "offline_sales_parked";

/// A sale the server rejected, set aside instead of being retried.
#[derive(Debug, Clone, PartialEq)]
pub struct ParkedSale {
    pub sale: PendingSale,
    pub reason: String,
}

#[derive(Clone)]
pub struct SaleQueue<S> {
    store: S,
    // Serializes read-modify-write cycles across await points.
    write_lock: Rc<Mutex<()>>,
    pending_count: Rc<watch::Sender<usize>>,
}

impl<S: KvStore> SaleQueue<S> {
    pub async fn open(store: S) -> Self {
        let (pending_count, _) = watch::channel(0);
        let queue = Self {
            store,
            write_lock: Rc::new(Mutex::new(())),
            pending_count: Rc::new(pending_count),
        };
        let pending = queue.list_pending().await.len();
        if pending > 0 {
            info!("{pending} sales still queued from a previous session");
        }
        queue.pending_count.send_replace(pending);
        queue
    }

    /// Queues a new sale and returns its idempotency id. Store failures are logged only.
    pub async fn enqueue(&self, payload: SalePayload) -> SaleId {
        let sale = PendingSale::new(payload);
        let id = sale.id.clone();
        self.push(sale).await;
        id
    }

    /// Queues a sale that already has an id, e.g. after a failed direct submission.
    pub async fn push(&self, sale: PendingSale) {
        let _guard = self.write_lock.lock().await;
        let Ok(mut sales) = self.read_sales().await else {
            error!("Sale {} not queued, the current queue could not be read", sale.id);
            return;
        };
        debug!("Queueing sale {} with {} lines", sale.id, sale.payload.lines.len());
        sales.push(sale);
        self.write_sales(&sales).await;
    }

    pub async fn list_pending(&self) -> Vec<PendingSale> {
        self.read_sales().await.unwrap_or_default()
    }

    /// Drops the given sales from the queue, keeping the rest in their original order.
    pub async fn remove_succeeded(&self, ids: &[SaleId]) {
        if ids.is_empty() {
            return;
        }
        let _guard = self.write_lock.lock().await;
        let Ok(mut sales) = self.read_sales().await else {
            warn!("Delivered sales stay queued until the queue can be read again");
            return;
        };
        let before = sales.len();
        sales.retain(|sale| !ids.contains(&sale.id));
        if sales.len() != before {
            self.write_sales(&sales).await;
        }
    }

    /// Moves rejected sales from the queue to the parked list.
    ///
    /// The parked list is written first; a crash in between leaves the sale in both
    /// places, and its idempotency id keeps a later redelivery from booking it twice.
    pub async fn park(&self, rejected: Vec<(PendingSale, String)>) {
        if rejected.is_empty() {
            return;
        }
        let _guard = self.write_lock.lock().await;
        let Ok(mut parked) = self.read_parked_raw().await else {
            warn!("Rejected sales stay queued until the parked list can be read again");
            return;
        };
        let ids: Vec<SaleId> = rejected.iter().map(|(sale, _)| sale.id.clone()).collect();
        for (sale, reason) in rejected {
            warn!("Parking sale {} rejected by the server: {reason}", sale.id);
            parked.push((sale, reason));
        }
        if !self.write_parked(&parked).await {
            return;
        }
        let Ok(mut sales) = self.read_sales().await else {
            warn!("Parked sales also stay queued until the queue can be read again");
            return;
        };
        sales.retain(|sale| !ids.contains(&sale.id));
        self.write_sales(&sales).await;
    }

    pub async fn list_parked(&self) -> Vec<ParkedSale> {
        self.read_parked_raw()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|(sale, reason)| ParkedSale { sale, reason })
            .collect()
    }

    pub async fn discard_parked(&self, id: &SaleId) {
        let _guard = self.write_lock.lock().await;
        let Ok(mut parked) = self.read_parked_raw().await else {
            return;
        };
        let before = parked.len();
        parked.retain(|(sale, _)| sale.id != *id);
        if parked.len() != before {
            info!("Discarding parked sale {id}");
            self.write_parked(&parked).await;
        }
    }

    pub fn pending_count(&self) -> usize {
        *self.pending_count.borrow()
    }

    pub fn subscribe_pending_count(&self) -> watch::Receiver<usize> {
        self.pending_count.subscribe()
    }

    /// Fails only when the store itself cannot be read. Unreadable contents are
    /// kept aside and read as an empty queue.
    async fn read_sales(&self) -> Result<Vec<PendingSale>> {
        let raw = match self.store.get(QUEUE_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(vec![]),
            Err(err) => {
                error!("Unable to read the sale queue: {err:?}");
                return Err(err);
            }
        };
        match snapshot::decode_sales(&raw) {
            Ok(sales) => Ok(sales),
            Err(err) => {
                error!("Sale queue is unreadable, treating it as empty: {err:?}");
                self.preserve_corrupt(raw).await;
                Ok(vec![])
            }
        }
    }

    /// The first unreadable snapshot goes to `CORRUPT_QUEUE_KEY`, later different
    /// ones to a key suffixed with the time they were found.
    async fn preserve_corrupt(&self, raw: String) {
        let key = match self.store.get(CORRUPT_QUEUE_KEY).await {
            Ok(None) => CORRUPT_QUEUE_KEY.to_string(),
            Ok(Some(kept)) if kept == raw => return,
            Ok(Some(_)) => {
                format!("{CORRUPT_QUEUE_KEY}.{}", unix_millis(OffsetDateTime::now_utc()))
            }
            Err(err) => {
                error!("Unable to check for an earlier copy of an unreadable queue: {err:?}");
                return;
            }
        };
        match self.store.put(&key, raw).await {
            Ok(()) => warn!("Kept a copy of the unreadable sale queue under {key}"),
            Err(err) => error!("Unable to keep a copy of the unreadable queue: {err:?}"),
        }
    }

    async fn write_sales(&self, sales: &[PendingSale]) {
        let written = match snapshot::encode_sales(sales) {
            Ok(raw) => self.store.put(QUEUE_KEY, raw).await,
            Err(err) => Err(err),
        };
        match written {
            Ok(()) => {
                self.pending_count.send_replace(sales.len());
            }
            Err(err) => error!("Failed to persist the sale queue ({} sales): {err:?}", sales.len()),
        }
    }

    async fn read_parked_raw(&self) -> Result<Vec<(PendingSale, String)>> {
        match self.store.get(PARKED_KEY).await {
            Ok(Some(raw)) => Ok(snapshot::decode_parked(&raw).unwrap_or_else(|err| {
                error!("Parked sales are unreadable, treating them as empty: {err:?}");
                vec![]
            })),
            Ok(None) => Ok(vec![]),
            Err(err) => {
                error!("Unable to read parked sales: {err:?}");
                Err(err)
            }
        }
    }

    async fn write_parked(&self, parked: &[(PendingSale, String)]) -> bool {
        let written = match snapshot::encode_parked(parked) {
            Ok(raw) => self.store.put(PARKED_KEY, raw).await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            error!("Failed to persist parked sales: {err:?}");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        model::{SaleLine, Scope, UserId},
        persist::MemoryStore,
    };

    fn sale_of(product: &str, qty: u32) -> SalePayload {
        SalePayload::new(
            &Scope::new("evt", "bar"),
            &UserId::from("u-1"),
            vec![SaleLine::new(product, qty)],
        )
    }

    fn ids(sales: &[PendingSale]) -> Vec<SaleId> {
        sales.iter().map(|sale| sale.id.clone()).collect()
    }

    #[tokio::test]
    async fn queued_sales_survive_a_restart() {
        let store = MemoryStore::new();
        let queue = SaleQueue::open(store.clone()).await;
        let first = queue.enqueue(sale_of("beer", 2)).await;
        let second = queue.enqueue(sale_of("water", 1)).await;
        drop(queue);

        let restarted = SaleQueue::open(store).await;

        assert_eq!(ids(&restarted.list_pending().await), vec![first, second]);
        assert_eq!(restarted.pending_count(), 2);
    }

    #[tokio::test]
    async fn removal_keeps_the_remaining_order() {
        let queue = SaleQueue::open(MemoryStore::new()).await;
        let a = queue.enqueue(sale_of("a", 1)).await;
        let b = queue.enqueue(sale_of("b", 1)).await;
        let c = queue.enqueue(sale_of("c", 1)).await;
        let d = queue.enqueue(sale_of("d", 1)).await;

        queue.remove_succeeded(&[c.clone(), a.clone()]).await;

        assert_eq!(ids(&queue.list_pending().await), vec![b, d]);
        assert_eq!(queue.pending_count(), 2);
    }

    #[tokio::test]
    async fn a_failed_write_does_not_fail_the_caller() {
        let store = MemoryStore::new();
        let queue = SaleQueue::open(store.clone()).await;
        store.fail_writes(true);

        let id = queue.enqueue(sale_of("beer", 1)).await;

        assert!(id.to_string().starts_with("sale_"));
        assert_eq!(queue.pending_count(), 0);
        store.fail_writes(false);
        queue.enqueue(sale_of("beer", 1)).await;
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn unreadable_snapshot_reads_as_empty_and_is_kept_aside() {
        let store = MemoryStore::new();
        store.put(QUEUE_KEY, "{not json".into()).await.unwrap();

        let queue = SaleQueue::open(store.clone()).await;
        assert!(queue.list_pending().await.is_empty());

        queue.enqueue(sale_of("beer", 1)).await;
        assert_eq!(queue.list_pending().await.len(), 1);
        assert_eq!(store.raw(CORRUPT_QUEUE_KEY), Some("{not json".to_string()));
    }

    #[tokio::test]
    async fn a_failed_read_never_replaces_the_queue() {
        let store = MemoryStore::new();
        let queue = SaleQueue::open(store.clone()).await;
        let a = queue.enqueue(sale_of("a", 1)).await;
        let b = queue.enqueue(sale_of("b", 1)).await;
        let c = queue.enqueue(sale_of("c", 1)).await;

        store.fail_next_reads(1);
        queue.enqueue(sale_of("d", 1)).await;
        store.fail_next_reads(1);
        queue.remove_succeeded(&[a.clone()]).await;
        let pending = queue.list_pending().await;
        store.fail_next_reads(1);
        queue.park(vec![(pending[1].clone(), "unknown product".into())]).await;

        assert_eq!(ids(&queue.list_pending().await), vec![a, b, c]);
        assert_eq!(queue.pending_count(), 3);
        assert!(queue.list_parked().await.is_empty());

        let d = queue.enqueue(sale_of("d", 1)).await;
        assert_eq!(queue.list_pending().await.len(), 4);
        assert_eq!(queue.list_pending().await[3].id, d);
    }

    #[tokio::test]
    async fn a_different_unreadable_snapshot_is_kept_too() {
        let store = MemoryStore::new();
        store.put(QUEUE_KEY, "{not json".into()).await.unwrap();
        let queue = SaleQueue::open(store.clone()).await;

        store.put(QUEUE_KEY, "[oops".into()).await.unwrap();
        assert!(queue.list_pending().await.is_empty());

        assert_eq!(store.raw(CORRUPT_QUEUE_KEY), Some("{not json".to_string()));
        let kept = store.keys_with_prefix(&format!("{CORRUPT_QUEUE_KEY}."));
        assert_eq!(kept.len(), 1);
        assert_eq!(store.raw(&kept[0]), Some("[oops".to_string()));
    }

    #[tokio::test]
    async fn parking_moves_sales_out_of_the_queue() {
        let queue = SaleQueue::open(MemoryStore::new()).await;
        queue.enqueue(sale_of("beer", 1)).await;
        queue.enqueue(sale_of("ghost", 1)).await;
        let pending = queue.list_pending().await;
        let ghost = pending[1].clone();

        queue.park(vec![(ghost.clone(), "unknown product".into())]).await;

        assert_eq!(ids(&queue.list_pending().await), vec![pending[0].id.clone()]);
        let parked = queue.list_parked().await;
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].sale.id, ghost.id);
        assert_eq!(parked[0].reason, "unknown product");

        queue.discard_parked(&ghost.id).await;
        assert!(queue.list_parked().await.is_empty());
    }
}
