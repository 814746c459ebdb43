use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, HashMap},
    time::Duration,
};

use tokio::sync::mpsc::{self, UnboundedSender};

use super::{
    ChangeFeed, ChangeNotice, ChannelId, FeedChannel, QuantityUpdate, RemoteError, RemoteService,
};
use crate::model::{InventoryRow, ProductId, SalePayload, SalesTotals, Scope, StockLevel};

/// In-process stand-in for the server: an idempotent sale ledger, per-scope
/// baselines, and a realtime fan-out to every open channel of the same event.
pub struct FakeRemote {
    state: RefCell<FakeState>,
}

struct FakeState {
    reachable: bool,
    latency: Duration,
    rejected_products: BTreeSet<ProductId>,
    lose_next_sale_response: bool,
    prices: HashMap<ProductId, i64>,
    thresholds: HashMap<ProductId, i64>,
    baselines: BTreeMap<(Scope, ProductId), u32>,
    ledger: Vec<(String, SalePayload)>,
    sale_attempts: Vec<String>,
    quantity_calls: Vec<QuantityUpdate>,
    in_flight: HashMap<ProductId, usize>,
    max_in_flight: usize,
    channels: BTreeMap<ChannelId, (Scope, UnboundedSender<ChangeNotice>)>,
    next_channel: u64,
    opened: usize,
    released: Vec<ChannelId>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self {
            state: RefCell::new(FakeState {
                reachable: true,
                latency: Duration::ZERO,
                rejected_products: BTreeSet::new(),
                lose_next_sale_response: false,
                prices: HashMap::new(),
                thresholds: HashMap::new(),
                baselines: BTreeMap::new(),
                ledger: Vec::new(),
                sale_attempts: Vec::new(),
                quantity_calls: Vec::new(),
                in_flight: HashMap::new(),
                max_in_flight: 0,
                channels: BTreeMap::new(),
                next_channel: 1,
                opened: 0,
                released: Vec::new(),
            }),
        }
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.borrow_mut().reachable = reachable;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.borrow_mut().latency = latency;
    }

    pub fn reject_product(&self, product: &str) {
        self.state
            .borrow_mut()
            .rejected_products
            .insert(ProductId::from(product));
    }

    /// The next sale is booked, but the caller sees a transport failure.
    pub fn lose_next_sale_response(&self) {
        self.state.borrow_mut().lose_next_sale_response = true;
    }

    pub fn set_price(&self, product: &str, cents: i64) {
        self.state.borrow_mut().prices.insert(ProductId::from(product), cents);
    }

    pub fn set_threshold(&self, product: &str, threshold: i64) {
        self.state
            .borrow_mut()
            .thresholds
            .insert(ProductId::from(product), threshold);
    }

    /// Another device changed a baseline: store it and push the change.
    pub fn set_baseline(&self, scope: &Scope, product: &str, quantity: u32) {
        self.state
            .borrow_mut()
            .baselines
            .insert((scope.clone(), ProductId::from(product)), quantity);
        self.push_change(scope);
    }

    pub fn baseline(&self, scope: &Scope, product: &str) -> Option<u32> {
        self.state
            .borrow()
            .baselines
            .get(&(scope.clone(), ProductId::from(product)))
            .copied()
    }

    pub fn push_change(&self, scope: &Scope) {
        let state = self.state.borrow();
        for (channel_scope, tx) in state.channels.values() {
            if channel_scope.event_id == scope.event_id {
                let _ = tx.send(ChangeNotice {
                    scope: scope.clone(),
                });
            }
        }
    }

    pub fn booked_sales(&self) -> Vec<SalePayload> {
        self.state
            .borrow()
            .ledger
            .iter()
            .map(|(_, sale)| sale.clone())
            .collect()
    }

    pub fn sale_attempts(&self) -> Vec<String> {
        self.state.borrow().sale_attempts.clone()
    }

    pub fn quantity_calls(&self) -> Vec<QuantityUpdate> {
        self.state.borrow().quantity_calls.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.borrow().max_in_flight
    }

    pub fn opened_channels(&self) -> usize {
        self.state.borrow().opened
    }

    pub fn open_channels(&self) -> usize {
        self.state.borrow().channels.len()
    }

    pub fn released_channels(&self) -> Vec<ChannelId> {
        self.state.borrow().released.clone()
    }

    fn sold(&self, scope: &Scope, product: &ProductId) -> u32 {
        self.state
            .borrow()
            .ledger
            .iter()
            .filter(|(_, sale)| sale.scope() == *scope)
            .flat_map(|(_, sale)| sale.lines.iter())
            .filter(|line| line.product_id == *product)
            .map(|line| line.qty)
            .sum()
    }

    async fn wait(&self) -> Result<(), RemoteError> {
        let latency = self.state.borrow().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.state.borrow().reachable {
            Ok(())
        } else {
            Err(RemoteError::Transport("network down".into()))
        }
    }
}

impl RemoteService for FakeRemote {
    async fn submit_sale(
        &self,
        sale: &SalePayload,
        idempotency_key: &str,
    ) -> Result<(), RemoteError> {
        self.state
            .borrow_mut()
            .sale_attempts
            .push(idempotency_key.to_string());
        self.wait().await?;
        {
            let mut state = self.state.borrow_mut();
            if let Some(line) = sale
                .lines
                .iter()
                .find(|line| state.rejected_products.contains(&line.product_id))
            {
                return Err(RemoteError::Rejected(format!(
                    "{} is not sold here",
                    line.product_id
                )));
            }
            if !state.ledger.iter().any(|(key, _)| key == idempotency_key) {
                state.ledger.push((idempotency_key.to_string(), sale.clone()));
            }
            if std::mem::take(&mut state.lose_next_sale_response) {
                return Err(RemoteError::Transport("connection reset".into()));
            }
        }
        self.push_change(&sale.scope());
        Ok(())
    }

    async fn set_quantity(&self, update: &QuantityUpdate) -> Result<(), RemoteError> {
        {
            let mut state = self.state.borrow_mut();
            let running = state.in_flight.entry(update.product_id.clone()).or_default();
            *running += 1;
            let running = *running;
            state.max_in_flight = state.max_in_flight.max(running);
            state.quantity_calls.push(update.clone());
        }
        let outcome = self.wait().await;
        {
            let mut state = self.state.borrow_mut();
            if let Some(running) = state.in_flight.get_mut(&update.product_id) {
                *running -= 1;
            }
            outcome?;
            if state.rejected_products.contains(&update.product_id) {
                return Err(RemoteError::Rejected("product is locked".into()));
            }
            state.baselines.insert(
                (update.scope.clone(), update.product_id.clone()),
                update.quantity,
            );
        }
        self.push_change(&update.scope);
        Ok(())
    }

    async fn read_inventory_snapshot(&self, scope: &Scope) -> Result<Vec<StockLevel>, RemoteError> {
        self.wait().await?;
        Ok(self
            .state
            .borrow()
            .baselines
            .iter()
            .filter(|((baseline_scope, _), _)| baseline_scope == scope)
            .map(|((_, product_id), quantity)| StockLevel {
                product_id: product_id.clone(),
                quantity: *quantity,
            })
            .collect())
    }

    async fn read_inventory(&self, scope: &Scope) -> Result<Vec<InventoryRow>, RemoteError> {
        let levels = self.read_inventory_snapshot(scope).await?;
        Ok(levels
            .into_iter()
            .map(|level| {
                let sold = self.sold(scope, &level.product_id);
                let threshold = self
                    .state
                    .borrow()
                    .thresholds
                    .get(&level.product_id)
                    .copied()
                    .unwrap_or_default();
                InventoryRow {
                    current_qty: i64::from(level.quantity) - i64::from(sold),
                    low_stock_threshold: threshold,
                    product_id: level.product_id,
                }
            })
            .collect())
    }

    async fn read_totals(&self, scope: &Scope) -> Result<SalesTotals, RemoteError> {
        self.wait().await?;
        let state = self.state.borrow();
        let mut totals = SalesTotals::default();
        for (_, sale) in state.ledger.iter().filter(|(_, sale)| sale.scope() == *scope) {
            totals.num_sales += 1;
            for line in &sale.lines {
                totals.total_items += u64::from(line.qty);
                totals.total_cents +=
                    state.prices.get(&line.product_id).copied().unwrap_or_default()
                        * i64::from(line.qty);
            }
        }
        Ok(totals)
    }
}

impl ChangeFeed for FakeRemote {
    fn open(&self, scope: &Scope) -> FeedChannel {
        let mut state = self.state.borrow_mut();
        let id = ChannelId(state.next_channel);
        state.next_channel += 1;
        state.opened += 1;
        let (tx, notices) = mpsc::unbounded_channel();
        state.channels.insert(id, (scope.clone(), tx));
        FeedChannel { id, notices }
    }

    fn release(&self, channel: ChannelId) {
        let mut state = self.state.borrow_mut();
        state.channels.remove(&channel);
        state.released.push(channel);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::{SaleLine, UserId};

    #[tokio::test]
    async fn replaying_an_idempotency_key_books_the_sale_once() {
        let remote = FakeRemote::new();
        let scope = Scope::new("evt", "bar");
        let sale = SalePayload::new(&scope, &UserId::from("u"), vec![SaleLine::new("beer", 2)]);

        remote.submit_sale(&sale, "sale_a").await.unwrap();
        remote.submit_sale(&sale, "sale_a").await.unwrap();
        remote.submit_sale(&sale, "sale_b").await.unwrap();

        assert_eq!(remote.booked_sales().len(), 2);
        assert_eq!(remote.read_totals(&scope).await.unwrap().total_items, 4);
    }

    #[tokio::test]
    async fn lost_response_still_books_and_retry_does_not_double_book() {
        let remote = FakeRemote::new();
        let sale = SalePayload::new(
            &Scope::new("evt", "bar"),
            &UserId::from("u"),
            vec![SaleLine::new("beer", 1)],
        );
        remote.lose_next_sale_response();

        let first = remote.submit_sale(&sale, "sale_a").await;
        let second = remote.submit_sale(&sale, "sale_a").await;

        assert!(matches!(first, Err(RemoteError::Transport(_))));
        assert_eq!(second, Ok(()));
        assert_eq!(remote.booked_sales().len(), 1);
    }
}
