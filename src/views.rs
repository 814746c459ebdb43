//! Cached read models for one scope: live inventory and sales totals.
//!
//! Views are never patched from change signals. Anything that might have made
//! them stale asks for a full re-read, which is published and written to the
//! store so the next start has something to show offline.

use std::{rc::Rc, time::Duration};

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};
use strum::Display;
use time::OffsetDateTime;
use tokio::{
    sync::{Mutex, mpsc, watch},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    model::{InventoryRow, ProductId, SalesTotals, Scope, unix_millis},
    persist::{self, KvStore},
    realtime::ScopeSubscription,
    remote::RemoteService,
};

/// Which views need a re-read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Stale {
    Inventory,
    Totals,
    All,
}

impl Stale {
    fn merge(self, other: Stale) -> Stale {
        if self == other { self } else { Stale::All }
    }
}

/// Cheap handle for marking views stale from anywhere, e.g. after a flush.
#[derive(Clone)]
pub struct Invalidator {
    tx: mpsc::UnboundedSender<Stale>,
}

impl Invalidator {
    pub fn invalidate(&self, stale: Stale) {
        if self.tx.send(stale).is_err() {
            debug!("View cache is gone, dropping invalidation of {stale}");
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeView {
    pub inventory: Vec<InventoryRow>,
    pub totals: SalesTotals,
    /// Unset until the first successful read.
    pub refreshed_at_ms: Option<i64>,
}

impl ScopeView {
    pub fn level(&self, product_id: &ProductId) -> Option<i64> {
        self.inventory
            .iter()
            .find(|row| row.product_id == *product_id)
            .map(|row| row.current_qty)
    }

    pub fn low_stock(&self) -> Vec<&InventoryRow> {
        self.inventory.iter().filter(|row| row.is_low()).collect()
    }
}

fn cache_key(scope: &Scope) -> String {
    format!("views/{}/{}", scope.event_id, scope.cantina_id)
}

pub struct ViewCache<S, R> {
    scope: Scope,
    store: S,
    remote: Rc<R>,
    view: watch::Sender<ScopeView>,
    invalidator: Invalidator,
    invalidations: Mutex<mpsc::UnboundedReceiver<Stale>>,
}

impl<S: KvStore, R: RemoteService> ViewCache<S, R> {
    /// Starts from whatever was cached for `scope` last time, or an empty view.
    pub async fn open(scope: Scope, store: S, remote: Rc<R>) -> Self {
        let cached = match persist::load_json::<_, ScopeView>(&store, &cache_key(&scope)).await {
            Ok(cached) => cached.unwrap_or_default(),
            Err(err) => {
                warn!("Ignoring unreadable cached views for {scope}: {err:?}");
                ScopeView::default()
            }
        };
        let (view, _) = watch::channel(cached);
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            scope,
            store,
            remote,
            view,
            invalidator: Invalidator { tx },
            invalidations: Mutex::new(rx),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn invalidator(&self) -> Invalidator {
        self.invalidator.clone()
    }

    pub fn current(&self) -> ScopeView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScopeView> {
        self.view.subscribe()
    }

    /// Re-reads the stale views. On failure the previous view stays in place.
    pub async fn refresh(&self, stale: Stale) -> Result<()> {
        let scope = &self.scope;
        let inventory = match stale {
            Stale::Inventory | Stale::All => Some(
                self.remote
                    .read_inventory(scope)
                    .await
                    .wrap_err_with(|| format!("reading inventory of {scope}"))?,
            ),
            Stale::Totals => None,
        };
        let totals = match stale {
            Stale::Totals | Stale::All => Some(
                self.remote
                    .read_totals(scope)
                    .await
                    .wrap_err_with(|| format!("reading totals of {scope}"))?,
            ),
            Stale::Inventory => None,
        };

        self.view.send_modify(|view| {
            if let Some(inventory) = inventory {
                view.inventory = inventory;
            }
            if let Some(totals) = totals {
                view.totals = totals;
            }
            view.refreshed_at_ms = Some(unix_millis(OffsetDateTime::now_utc()));
        });
        debug!("Refreshed {stale} views of {scope}");

        let snapshot = self.current();
        if let Err(err) = persist::save_json(&self.store, &cache_key(scope), &snapshot).await {
            warn!("Unable to cache views of {scope}: {err:?}");
        }
        Ok(())
    }

    /// Refreshes right away, then on every invalidation, every change signal and
    /// every `refresh_interval`. Returns when the change subscription ends.
    pub async fn run(&self, mut changes: ScopeSubscription, refresh_interval: Duration) {
        let mut invalidations = self.invalidations.lock().await;
        let mut ticker = tokio::time::interval(refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Keeping views of {} fresh", self.scope);
        loop {
            let mut stale = tokio::select! {
                biased;
                Some(stale) = invalidations.recv() => stale,
                signal = changes.changed() => match signal {
                    Some(_) => Stale::All,
                    None => {
                        info!("Change feed for {} ended, views go idle", self.scope);
                        return;
                    }
                },
                _ = ticker.tick() => Stale::All,
            };
            while let Ok(more) = invalidations.try_recv() {
                stale = stale.merge(more);
            }
            if let Err(err) = self.refresh(stale).await {
                warn!("Keeping previous views: {err:?}");
            }
        }
    }
}
