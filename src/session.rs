//! One operator's session on one cantina: recording sales, keeping the queue
//! flushed, and keeping views and baseline inputs in step with the server.

use std::{rc::Rc, time::Duration};

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    autosave::{AutosaveEngine, AutosaveSettings},
    cart::Cart,
    config::{RejectedSalePolicy, SyncConfig},
    connectivity::{Connectivity, ConnectivityMonitor},
    flush::{FlushOrchestrator, FlushReport},
    model::{ProductId, PendingSale, SaleId, SaleLine, SalePayload, Scope, UserId},
    persist::KvStore,
    queue::{ParkedSale, SaleQueue},
    realtime::ChangeListener,
    remote::{ChangeFeed, RemoteError, RemoteService},
    views::{Stale, ViewCache},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaleOutcome {
    /// Booked by the server right away.
    Delivered(SaleId),
    /// Stored locally; the next flush delivers it.
    Queued(SaleId),
    /// The server refused it and rejected sales are not retried.
    Rejected { id: SaleId, reason: String },
}

impl SaleOutcome {
    pub fn id(&self) -> &SaleId {
        match self {
            SaleOutcome::Delivered(id) | SaleOutcome::Queued(id) => id,
            SaleOutcome::Rejected { id, .. } => id,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SaleError {
    #[error("a sale needs at least one item")]
    Empty,
}

pub struct PosSession<S, R> {
    scope: Scope,
    user_id: UserId,
    remote: Rc<R>,
    connectivity: ConnectivityMonitor,
    policy: RejectedSalePolicy,
    refresh_interval: Duration,
    queue: SaleQueue<S>,
    flush: FlushOrchestrator<S, R>,
    listener: ChangeListener,
    views: ViewCache<S, R>,
    autosave: AutosaveEngine<R>,
    shutdown: CancellationToken,
}

impl<S, R> PosSession<S, R>
where
    S: KvStore + Clone + 'static,
    R: RemoteService + ChangeFeed + 'static,
{
    pub async fn open(
        scope: Scope,
        user_id: UserId,
        products: impl IntoIterator<Item = ProductId>,
        store: S,
        remote: Rc<R>,
        connectivity: ConnectivityMonitor,
        config: &SyncConfig,
    ) -> Self {
        info!("Opening session of {user_id} on {scope}");
        let queue = SaleQueue::open(store.clone()).await;
        let views = ViewCache::open(scope.clone(), store, remote.clone()).await;
        let flush = FlushOrchestrator::new(queue.clone(), remote.clone(), config.rejected_sales)
            .with_invalidator(views.invalidator());
        let feed: Rc<dyn ChangeFeed> = remote.clone();
        let autosave = AutosaveEngine::new(
            scope.clone(),
            user_id.clone(),
            products,
            remote.clone(),
            AutosaveSettings::from(config),
        );
        Self {
            scope,
            user_id,
            remote,
            connectivity,
            policy: config.rejected_sales,
            refresh_interval: config.refresh_interval,
            queue,
            flush,
            listener: ChangeListener::new(feed),
            views,
            autosave,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn views(&self) -> &ViewCache<S, R> {
        &self.views
    }

    pub fn autosave(&self) -> &AutosaveEngine<R> {
        &self.autosave
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Books a sale, or queues it when the server cannot be reached. The sale's
    /// idempotency id is fixed before the first attempt, so a queued copy of a
    /// sale the server did book is recognized on redelivery.
    pub async fn record_sale(&self, lines: Vec<SaleLine>) -> Result<SaleOutcome, SaleError> {
        let lines: Vec<SaleLine> = lines.into_iter().filter(|line| line.qty > 0).collect();
        if lines.is_empty() {
            return Err(SaleError::Empty);
        }
        let sale = PendingSale::new(SalePayload::new(&self.scope, &self.user_id, lines));
        let id = sale.id.clone();

        if self.connectivity.current() == Connectivity::Offline {
            info!("Offline, queueing sale {id}");
            self.queue.push(sale).await;
            return Ok(SaleOutcome::Queued(id));
        }

        match self
            .remote
            .submit_sale(&sale.payload, &sale.idempotency_key())
            .await
        {
            Ok(()) => {
                self.views.invalidator().invalidate(Stale::All);
                Ok(SaleOutcome::Delivered(id))
            }
            Err(RemoteError::Rejected(reason)) if self.policy == RejectedSalePolicy::Park => {
                warn!("Sale {id} rejected: {reason}");
                Ok(SaleOutcome::Rejected { id, reason })
            }
            Err(err) => {
                warn!("Queueing sale {id} after failed submission: {err}");
                self.queue.push(sale).await;
                Ok(SaleOutcome::Queued(id))
            }
        }
    }

    /// Records the cart as one sale. The cart is emptied unless the sale was rejected.
    pub async fn checkout(&self, cart: &mut Cart) -> Result<SaleOutcome, SaleError> {
        let outcome = self.record_sale(cart.lines().to_vec()).await?;
        if !matches!(outcome, SaleOutcome::Rejected { .. }) {
            cart.clear();
        }
        Ok(outcome)
    }

    /// Flushes the queue now, regardless of connectivity transitions.
    pub async fn sync_now(&self) -> Option<FlushReport> {
        self.flush.flush().await
    }

    pub fn pending_count(&self) -> usize {
        self.queue.pending_count()
    }

    pub fn subscribe_pending_count(&self) -> watch::Receiver<usize> {
        self.queue.subscribe_pending_count()
    }

    pub async fn parked_sales(&self) -> Vec<ParkedSale> {
        self.queue.list_parked().await
    }

    pub async fn discard_parked(&self, id: &SaleId) {
        self.queue.discard_parked(id).await;
    }

    /// Keeps the queue flushed and the views and baselines fresh until `close`.
    /// Must run inside a `LocalSet`.
    pub async fn run(&self) {
        let view_changes = self.listener.subscribe(&self.scope);
        let baseline_changes = self.listener.subscribe(&self.scope);
        let loops = async {
            tokio::join!(
                self.flush.run(self.connectivity.subscribe()),
                self.views.run(view_changes, self.refresh_interval),
                self.autosave.run(baseline_changes, self.refresh_interval),
            )
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = loops => {}
        }
        info!("Session on {} stopped", self.scope);
    }

    /// Stops `run`, drops unsent autosaves and leaves the change feed.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.autosave.close();
        self.listener.close();
    }
}
