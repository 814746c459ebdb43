//! Debounced per-field saving of baseline stock counts.
//!
//! Every keystroke updates the shown value right away and (re)starts that
//! field's quiet period. When it elapses, the latest value is sent. While a
//! field is being edited, reloads from the server leave it alone.

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    rc::{Rc, Weak},
    time::Duration,
};

use color_eyre::{Result, eyre::Context};
use strum::Display;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{
    config::SyncConfig,
    model::{ProductId, Scope, StockLevel, UserId},
    realtime::ScopeSubscription,
    remote::{QuantityUpdate, RemoteError, RemoteService},
};

mod debounce;
mod field;

pub use debounce::DebounceScheduler;
pub use field::FieldVersion;
use field::{FieldState, VersionNumber};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
pub enum SaveStatus {
    #[default]
    Idle,
    Saving,
    Saved,
    Error,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("{0:?} is not a whole, non-negative count")]
    NotACount(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutosaveSettings {
    pub debounce: Duration,
    /// How long `Saved` stays up before falling back to `Idle`.
    pub saved_display: Duration,
}

impl Default for AutosaveSettings {
    fn default() -> Self {
        (&SyncConfig::default()).into()
    }
}

impl From<&SyncConfig> for AutosaveSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            debounce: config.debounce,
            saved_display: config.saved_display,
        }
    }
}

/// What the input for one product should show.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldView {
    pub value: Option<u32>,
    pub editing: bool,
    pub status: SaveStatus,
}

struct Inner<R> {
    scope: Scope,
    user_id: UserId,
    remote: Rc<R>,
    settings: AutosaveSettings,
    fields: RefCell<BTreeMap<ProductId, FieldState>>,
    tracked: RefCell<BTreeSet<ProductId>>,
    saves: DebounceScheduler<ProductId>,
    status_resets: DebounceScheduler<ProductId>,
}

pub struct AutosaveEngine<R> {
    inner: Rc<Inner<R>>,
}

impl<R> Clone for AutosaveEngine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: RemoteService + 'static> AutosaveEngine<R> {
    pub fn new(
        scope: Scope,
        user_id: UserId,
        products: impl IntoIterator<Item = ProductId>,
        remote: Rc<R>,
        settings: AutosaveSettings,
    ) -> Self {
        let tracked: BTreeSet<ProductId> = products.into_iter().collect();
        let fields = tracked
            .iter()
            .map(|product| (product.clone(), FieldState::default()))
            .collect();
        Self {
            inner: Rc::new(Inner {
                scope,
                user_id,
                remote,
                settings,
                fields: RefCell::new(fields),
                tracked: RefCell::new(tracked),
                saves: DebounceScheduler::new(),
                status_resets: DebounceScheduler::new(),
            }),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    pub fn products(&self) -> Vec<ProductId> {
        self.inner.tracked.borrow().iter().cloned().collect()
    }

    pub fn field(&self, product: &ProductId) -> FieldView {
        self.inner
            .fields
            .borrow()
            .get(product)
            .map(|field| FieldView {
                value: field.value,
                editing: field.editing,
                status: field.status,
            })
            .unwrap_or_default()
    }

    pub fn value(&self, product: &ProductId) -> Option<u32> {
        self.field(product).value
    }

    pub fn status(&self, product: &ProductId) -> SaveStatus {
        self.field(product).status
    }

    pub fn is_editing(&self, product: &ProductId) -> bool {
        self.field(product).editing
    }

    /// Shows `value` immediately and saves it once the field has been quiet for
    /// the debounce period. `None` (an emptied input) is never saved.
    pub fn set_value(&self, product: &ProductId, value: Option<u32>) {
        self.inner.tracked.borrow_mut().insert(product.clone());
        {
            let mut fields = self.inner.fields.borrow_mut();
            let field = fields.entry(product.clone()).or_default();
            field.value = value;
            field.editing = true;
            field.version.touch();
            if value.is_none() {
                if !field.in_flight {
                    field.status = SaveStatus::Idle;
                }
                self.inner.saves.cancel(product);
                debug!("{product} emptied, nothing to save");
                return;
            }
            field.status = SaveStatus::Saving;
        }
        self.inner.status_resets.cancel(product);

        let engine = Rc::downgrade(&self.inner);
        let key = product.clone();
        self.inner
            .saves
            .schedule(product.clone(), self.inner.settings.debounce, async move {
                if let Some(inner) = engine.upgrade() {
                    AutosaveEngine { inner }.save_latest(&key).await;
                }
            });
    }

    /// Like `set_value`, from the raw input text. Empty text clears the field.
    pub fn set_raw(&self, product: &ProductId, raw: &str) -> Result<(), InputError> {
        let raw = raw.trim();
        let value = if raw.is_empty() {
            None
        } else {
            Some(
                raw.parse::<u32>()
                    .map_err(|_| InputError::NotACount(raw.to_string()))?,
            )
        };
        self.set_value(product, value);
        Ok(())
    }

    pub fn increment(&self, product: &ProductId) {
        let next = self.value(product).unwrap_or(0).saturating_add(1);
        self.set_value(product, Some(next));
    }

    pub fn decrement(&self, product: &ProductId) {
        let next = self.value(product).unwrap_or(0).saturating_sub(1);
        self.set_value(product, Some(next));
    }

    /// Saves the current value right away, e.g. after an error.
    pub async fn retry(&self, product: &ProductId) {
        self.inner.saves.cancel(product);
        self.save_latest(product).await;
    }

    /// Takes fresh baselines from the server for every field not being edited.
    pub fn apply_baseline(&self, levels: &[StockLevel]) -> usize {
        let mut tracked = self.inner.tracked.borrow_mut();
        let mut fields = self.inner.fields.borrow_mut();
        let mut applied = 0;
        for level in levels {
            tracked.insert(level.product_id.clone());
            let field = fields.entry(level.product_id.clone()).or_default();
            if field.editing {
                debug!(
                    "Keeping local edit of {} over baseline {}",
                    level.product_id, level.quantity
                );
                continue;
            }
            field.value = Some(level.quantity);
            applied += 1;
        }
        applied
    }

    pub async fn reload(&self) -> Result<usize> {
        let scope = &self.inner.scope;
        let levels = self
            .inner
            .remote
            .read_inventory_snapshot(scope)
            .await
            .wrap_err_with(|| format!("reading baselines of {scope}"))?;
        Ok(self.apply_baseline(&levels))
    }

    /// Reloads right away, on every change signal and every `refresh_interval`,
    /// until the change subscription ends.
    pub async fn run(&self, mut changes: ScopeSubscription, refresh_interval: Duration) {
        let mut ticker = tokio::time::interval(refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                signal = changes.changed() => {
                    if signal.is_none() {
                        let scope = &self.inner.scope;
                        debug!("Change feed for {scope} ended, autosave stops reloading");
                        return;
                    }
                }
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.reload().await {
                warn!("Keeping current baselines: {err:?}");
            }
        }
    }

    /// Drops pending saves. A save already in flight still settles.
    pub fn close(&self) {
        let pending = self.inner.saves.pending();
        if pending > 0 {
            info!("Closing autosave with {pending} unsaved fields");
        }
        self.inner.saves.cancel_all();
        self.inner.status_resets.cancel_all();
    }

    /// Sends the field's latest value, then keeps going while newer values were
    /// requested in the meantime. At most one save per field is in flight.
    async fn save_latest(&self, product: &ProductId) {
        loop {
            let Some((update, sent)) = self.begin_save(product) else {
                return;
            };
            let result = self.inner.remote.set_quantity(&update).await;
            if !self.settle(product, sent, result) {
                return;
            }
        }
    }

    fn begin_save(&self, product: &ProductId) -> Option<(QuantityUpdate, VersionNumber)> {
        let mut fields = self.inner.fields.borrow_mut();
        let field = fields.get_mut(product)?;
        if field.in_flight {
            debug!("Save of {product} in flight, sending the newer value afterwards");
            field.resave = true;
            return None;
        }
        let quantity = field.value?;
        field.in_flight = true;
        field.resave = false;
        field.status = SaveStatus::Saving;
        field.version.mark_sent();
        let sent = field.version.local;
        Some((
            QuantityUpdate {
                scope: self.inner.scope.clone(),
                user_id: self.inner.user_id.clone(),
                product_id: product.clone(),
                quantity,
            },
            sent,
        ))
    }

    /// Applies a save response. Returns whether the caller should send the newer
    /// value right away; a pending debounce timer sends it instead.
    fn settle(
        &self,
        product: &ProductId,
        sent: VersionNumber,
        result: Result<(), RemoteError>,
    ) -> bool {
        let mut fields = self.inner.fields.borrow_mut();
        let Some(field) = fields.get_mut(product) else {
            return false;
        };
        field.in_flight = false;
        let resave = std::mem::take(&mut field.resave);
        let timer_pending = self.inner.saves.is_pending(product);
        // Nothing newer will be sent, e.g. the field was emptied meanwhile.
        let last_word = field.version.is_current(sent) || !(resave || timer_pending);
        match result {
            Ok(()) => {
                field.version.notify_saved(sent);
                if field.version.is_current(sent) {
                    debug!("Saved {product} = {:?}", field.value);
                    field.editing = false;
                }
                if last_word {
                    field.status = SaveStatus::Saved;
                    self.schedule_status_reset(product, field.version.saved);
                }
            }
            Err(err) => {
                field.version.settle_failed();
                warn!("Saving {product} failed: {err}");
                if field.version.is_current(sent) {
                    field.editing = false;
                }
                if last_word {
                    field.status = SaveStatus::Error;
                }
            }
        }
        if resave && timer_pending {
            debug!("Newer value of {product} waits for its quiet period to end");
        }
        resave && !timer_pending
    }

    fn schedule_status_reset(&self, product: &ProductId, saved: VersionNumber) {
        let engine: Weak<Inner<R>> = Rc::downgrade(&self.inner);
        let key = product.clone();
        self.inner.status_resets.schedule(
            product.clone(),
            self.inner.settings.saved_display,
            async move {
                let Some(inner) = engine.upgrade() else {
                    return;
                };
                let mut fields = inner.fields.borrow_mut();
                if let Some(field) = fields.get_mut(&key)
                    && field.status == SaveStatus::Saved
                    && field.version.saved == saved
                {
                    field.status = SaveStatus::Idle;
                }
            },
        );
    }
}
