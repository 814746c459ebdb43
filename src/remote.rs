//! Boundary to the remote service that owns the shared inventory.
//!
//! Only the shape of the calls lives here; the wire format belongs to whoever
//! implements these traits for a concrete backend.

use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::model::{InventoryRow, ProductId, SalePayload, SalesTotals, Scope, StockLevel, UserId};

#[cfg(test)]
pub mod fake;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// No usable answer: offline, timed out, connection dropped.
    #[error("remote unreachable: {0}")]
    Transport(String),
    /// The server answered and refused the operation.
    #[error("rejected by remote: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, RemoteError::Rejected(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantityUpdate {
    pub scope: Scope,
    pub user_id: UserId,
    pub product_id: ProductId,
    pub quantity: u32,
}

#[allow(async_fn_in_trait)]
pub trait RemoteService {
    /// Books a sale. Calling it again with the same `idempotency_key` must not book it twice.
    async fn submit_sale(&self, sale: &SalePayload, idempotency_key: &str)
    -> Result<(), RemoteError>;

    /// Sets a baseline count, last write wins.
    async fn set_quantity(&self, update: &QuantityUpdate) -> Result<(), RemoteError>;

    async fn read_inventory_snapshot(&self, scope: &Scope) -> Result<Vec<StockLevel>, RemoteError>;

    async fn read_inventory(&self, scope: &Scope) -> Result<Vec<InventoryRow>, RemoteError>;

    async fn read_totals(&self, scope: &Scope) -> Result<SalesTotals, RemoteError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u64);

/// "Something changed here", as pushed by the server. Delivery is at-least-once and unordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub scope: Scope,
}

pub struct FeedChannel {
    pub id: ChannelId,
    pub notices: UnboundedReceiver<ChangeNotice>,
}

/// Server-pushed change stream. The server may deliver notices for other cantinas
/// of the same event on a channel; filtering by cantina is up to the consumer.
pub trait ChangeFeed {
    fn open(&self, scope: &Scope) -> FeedChannel;
    fn release(&self, channel: ChannelId);
}
