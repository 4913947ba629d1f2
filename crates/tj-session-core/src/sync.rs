use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;
use tj_api_types::{Account, RawMemo, Record};
use tracing::{debug, warn};

use crate::error::Result;
use crate::gateway::ContractGateway;

/// An entry of the contract log that could not be turned into a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    /// Position in the contract log.
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Normalized {
    /// Most recent first.
    pub records: Vec<Record>,
    pub skipped: Vec<SkippedRecord>,
}

/// Rebuilds the displayed memo list from the contract log.
pub struct RecordSynchronizer {
    gateway: Arc<ContractGateway>,
}

impl RecordSynchronizer {
    pub fn new(gateway: Arc<ContractGateway>) -> Self {
        Self { gateway }
    }

    /// Fetches the whole log and returns it as a fresh, display-ordered list.
    /// Nothing from a previous refresh is reused.
    pub async fn refresh(&self) -> Result<Vec<Record>> {
        let entries = self.gateway.fetch_memos().await?;
        let total = entries.len();
        let normalized = normalize(entries);
        for skipped in &normalized.skipped {
            warn!("dropping memo #{}: {}", skipped.index, skipped.reason);
        }
        debug!(
            "refreshed {} of {} memos",
            normalized.records.len(),
            total
        );
        Ok(normalized.records)
    }
}

/// Maps raw log entries to records, most recent submission first.
///
/// Later log positions win timestamp ties since the log is append-only.
pub fn normalize(entries: Vec<Value>) -> Normalized {
    let mut indexed = Vec::with_capacity(entries.len());
    let mut skipped = Vec::new();

    for (index, entry) in entries.into_iter().enumerate() {
        match map_entry(index, entry) {
            Ok(record) => indexed.push((index, record)),
            Err(reason) => skipped.push(SkippedRecord { index, reason }),
        }
    }

    indexed.sort_by(|(a_index, a), (b_index, b)| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b_index.cmp(a_index))
    });

    Normalized {
        records: indexed.into_iter().map(|(_, record)| record).collect(),
        skipped,
    }
}

fn map_entry(index: usize, mut entry: Value) -> std::result::Result<Record, String> {
    let tip = take_tip(index, &mut entry);
    let raw: RawMemo = serde_json::from_value(entry).map_err(|err| format!("unreadable entry: {err}"))?;

    let author = raw
        .from
        .filter(|from| !from.trim().is_empty())
        .map(Account::new)
        .ok_or_else(|| "missing author".to_owned())?;
    let message = raw.message.ok_or_else(|| "missing message".to_owned())?;
    let seconds = raw
        .timestamp
        .ok_or_else(|| "missing timestamp".to_owned())?
        .to_u128()
        .ok_or_else(|| "timestamp is not an integer".to_owned())?;
    let timestamp = instant_from_epoch_seconds(seconds)
        .ok_or_else(|| format!("timestamp {seconds} is out of range"))?;
    Ok(Record {
        author,
        display_name: raw.name.filter(|name| !name.trim().is_empty()),
        message,
        timestamp,
        value: tip,
    })
}

/// Pulls the optional tip out of the entry before the strict parse.
///
/// Nodes hand large integers over as JSON floats, and a tip that cannot be read
/// must not cost the memo itself.
fn take_tip(index: usize, entry: &mut Value) -> Option<u128> {
    let object = entry.as_object_mut()?;
    let value = object.remove("value");
    let amount = object.remove("amount");
    let raw = value.or(amount)?;
    let units = match &raw {
        Value::Null => return None,
        Value::String(text) => text.trim().parse::<u128>().ok(),
        Value::Number(number) => number.as_u64().map(u128::from).or_else(|| {
            number
                .as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0 && *f < u128::MAX as f64)
                .map(|f| f as u128)
        }),
        _ => None,
    };
    if units.is_none() {
        warn!("memo #{} has an unreadable tip {}, showing it without one", index, raw);
    }
    units
}

fn instant_from_epoch_seconds(seconds: u128) -> Option<DateTime<Utc>> {
    let millis = i64::try_from(seconds.checked_mul(1000)?).ok()?;
    Utc.timestamp_millis_opt(millis).single()
}
