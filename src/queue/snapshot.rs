//! On-disk layout of the sale queue.
//!
//! Version 1 wraps the records: `{"version": 1, "sales": [...]}`. A bare array is
//! the older unversioned layout and is read as version 0.

use std::str::FromStr;

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use crate::model::{PendingSale, SaleId, SalePayload, from_unix_millis, unix_millis};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSale {
    id: String,
    payload: SalePayload,
    timestamp: i64,
}

impl From<&PendingSale> for StoredSale {
    fn from(sale: &PendingSale) -> Self {
        Self {
            id: sale.id.to_string(),
            payload: sale.payload.clone(),
            timestamp: unix_millis(sale.enqueued_at),
        }
    }
}

impl TryFrom<StoredSale> for PendingSale {
    type Error = color_eyre::Report;

    fn try_from(stored: StoredSale) -> Result<Self> {
        let id = match SaleId::from_str(&stored.id) {
            Ok(id) => id,
            // Records from the unversioned layout carry plain UUIDs.
            Err(_) => SaleId::from_uuid(
                Uuid::parse_str(&stored.id).wrap_err_with(|| format!("sale id {}", stored.id))?,
            ),
        };
        let enqueued_at = from_unix_millis(stored.timestamp)
            .ok_or_else(|| eyre!("timestamp {} out of range", stored.timestamp))?;
        Ok(PendingSale {
            id,
            payload: stored.payload,
            enqueued_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredParked {
    #[serde(flatten)]
    sale: StoredSale,
    reason: String,
}

#[derive(Serialize)]
struct SalesSnapshot<'a> {
    version: u32,
    sales: &'a [StoredSale],
}

// Records stay raw JSON until `into_sales`, so one malformed record cannot fail the
// whole snapshot.
#[derive(Deserialize)]
#[serde(untagged)]
enum AnySalesSnapshot {
    Versioned { version: u32, sales: Vec<Value> },
    Legacy(Vec<Value>),
}

#[derive(Serialize)]
struct ParkedSnapshot {
    version: u32,
    parked: Vec<StoredParked>,
}

#[derive(Deserialize)]
struct AnyParkedSnapshot {
    version: u32,
    parked: Vec<Value>,
}

pub fn encode_sales(sales: &[PendingSale]) -> Result<String> {
    let stored: Vec<StoredSale> = sales.iter().map(StoredSale::from).collect();
    serde_json::to_string(&SalesSnapshot {
        version: FORMAT_VERSION,
        sales: &stored,
    })
    .wrap_err("encoding sale queue")
}

pub fn decode_sales(raw: &str) -> Result<Vec<PendingSale>> {
    let snapshot: AnySalesSnapshot =
        serde_json::from_str(raw).wrap_err("decoding sale queue")?;
    let stored = match snapshot {
        AnySalesSnapshot::Versioned { version, sales } if version == FORMAT_VERSION => sales,
        AnySalesSnapshot::Versioned { version, .. } => {
            bail!("sale queue has unsupported format version {version}")
        }
        AnySalesSnapshot::Legacy(sales) => {
            info!("Reading {} sales from the unversioned queue layout", sales.len());
            sales
        }
    };
    Ok(into_sales(stored))
}

fn into_sales(records: Vec<Value>) -> Vec<PendingSale> {
    records
        .into_iter()
        .enumerate()
        .filter_map(|(index, record)| match decode_record::<StoredSale>(record) {
            Ok(stored) => Some(stored),
            Err(err) => {
                error!("Dropping malformed queued sale #{index}: {err:?}");
                None
            }
        })
        .filter_map(|sale| {
            let id = sale.id.clone();
            match PendingSale::try_from(sale) {
                Ok(ok) => Some(ok),
                Err(err) => {
                    error!("Dropping corrupted queued sale {id}: {err:?}");
                    None
                }
            }
        })
        .collect()
}

fn decode_record<T: for<'de> Deserialize<'de>>(record: Value) -> Result<T> {
    serde_json::from_value(record).wrap_err("decoding record")
}

pub fn encode_parked(parked: &[(PendingSale, String)]) -> Result<String> {
    let parked = parked
        .iter()
        .map(|(sale, reason)| StoredParked {
            sale: sale.into(),
            reason: reason.clone(),
        })
        .collect();
    serde_json::to_string(&ParkedSnapshot {
        version: FORMAT_VERSION,
        parked,
    })
    .wrap_err("encoding parked sales")
}

pub fn decode_parked(raw: &str) -> Result<Vec<(PendingSale, String)>> {
    let snapshot: AnyParkedSnapshot =
        serde_json::from_str(raw).wrap_err("decoding parked sales")?;
    if snapshot.version != FORMAT_VERSION {
        bail!("parked sales have unsupported format version {}", snapshot.version);
    }
    Ok(snapshot
        .parked
        .into_iter()
        .filter_map(|record| {
            let parked = decode_record::<StoredParked>(record)
                .and_then(|parked| Ok((PendingSale::try_from(parked.sale)?, parked.reason)));
            match parked {
                Ok(parked) => Some(parked),
                Err(err) => {
                    error!("Dropping corrupted parked sale: {err:?}");
                    None
                }
            }
        })
        .collect())
}
