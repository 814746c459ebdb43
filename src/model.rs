//! Domain types shared by the queue, the remote boundary and the read models.

use std::fmt;

use derive_deref::Deref;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use type_safe_id::{StaticType, TypeSafeId};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Deref,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// An event, e.g. one festival day.
    EventId
);
string_id!(
    /// A cantina (stall) taking part in an event.
    CantinaId
);
string_id!(ProductId);
string_id!(UserId);

/// The (event, cantina) pair all inventory and sale data is partitioned by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub event_id: EventId,
    pub cantina_id: CantinaId,
}

impl Scope {
    pub fn new(event_id: impl Into<String>, cantina_id: impl Into<String>) -> Self {
        Self {
            event_id: EventId::new(event_id),
            cantina_id: CantinaId::new(cantina_id),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.event_id, self.cantina_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleLine {
    pub product_id: ProductId,
    pub qty: u32,
}

impl SaleLine {
    pub fn new(product_id: impl Into<String>, qty: u32) -> Self {
        Self {
            product_id: ProductId::new(product_id),
            qty,
        }
    }
}

/// The business operation behind a sale, exactly what the server needs to book it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalePayload {
    pub event_id: EventId,
    pub cantina_id: CantinaId,
    pub user_id: UserId,
    pub lines: Vec<SaleLine>,
}

impl SalePayload {
    pub fn new(scope: &Scope, user_id: &UserId, lines: Vec<SaleLine>) -> Self {
        Self {
            event_id: scope.event_id.clone(),
            cantina_id: scope.cantina_id.clone(),
            user_id: user_id.clone(),
            lines,
        }
    }

    pub fn scope(&self) -> Scope {
        Scope {
            event_id: self.event_id.clone(),
            cantina_id: self.cantina_id.clone(),
        }
    }

    pub fn total_items(&self) -> u32 {
        self.lines.iter().map(|line| line.qty).sum()
    }
}

/// A sale waiting in the durable queue. Never mutated once enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSale {
    pub id: SaleId,
    pub payload: SalePayload,
    pub enqueued_at: OffsetDateTime,
}

/// Id prefix of queued sales.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SaleTag;

impl StaticType for SaleTag {
    const TYPE: &'static str = "sale";
}

/// Locally generated, doubles as the idempotency key sent with every delivery attempt.
pub type SaleId = TypeSafeId<SaleTag>;

impl PendingSale {
    pub fn new(payload: SalePayload) -> Self {
        Self {
            id: SaleId::from_uuid(Uuid::new_v4()),
            payload,
            enqueued_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn idempotency_key(&self) -> String {
        self.id.to_string()
    }
}

/// Baseline count for one product, as edited through autosave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockLevel {
    pub product_id: ProductId,
    pub quantity: u32,
}

/// Live stock of one product in a cantina.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRow {
    pub product_id: ProductId,
    pub current_qty: i64,
    pub low_stock_threshold: i64,
}

impl InventoryRow {
    pub fn is_low(&self) -> bool {
        self.current_qty <= self.low_stock_threshold
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesTotals {
    pub num_sales: u64,
    pub total_cents: i64,
    pub total_items: u64,
}

/// Milliseconds since the epoch, the timestamp format the queue and the view cache persist.
pub fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_unix_millis(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}
