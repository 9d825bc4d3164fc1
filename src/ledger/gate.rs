//! Entitlement gate: the guard conjunction evaluated on every consume and
//! canCreate call. Pure functions over a record snapshot and a clock instant.

use chrono::{DateTime, Utc};

use super::models::{BalanceRecord, DenialReason, Eligibility};

/// key: entitlement-gate -> consume preconditions
/// Checks in a fixed order so the reported reason is stable.
pub fn evaluate(
    record: Option<&BalanceRecord>,
    amount: i64,
    now: DateTime<Utc>,
) -> Result<(), DenialReason> {
    let record = record.ok_or(DenialReason::NotConfigured)?;
    if !record.is_enabled {
        return Err(DenialReason::Disabled);
    }
    if !record.is_active {
        return Err(DenialReason::Inactive);
    }
    if record.is_expired(now) {
        return Err(DenialReason::Expired);
    }
    if record.available < amount {
        return Err(DenialReason::InsufficientBalance);
    }
    Ok(())
}

/// `available` as callers may spend it right now; zero for disabled,
/// inactive, or lapsed records even before the reaper has swept them.
pub fn effective_available(record: &BalanceRecord, now: DateTime<Utc>) -> i64 {
    if record.is_enabled && record.is_active && !record.is_expired(now) {
        record.available
    } else {
        0
    }
}

pub fn is_usable(record: &BalanceRecord, now: DateTime<Utc>) -> bool {
    evaluate(Some(record), 1, now).is_ok()
}

pub fn eligibility(record: Option<&BalanceRecord>, now: DateTime<Utc>) -> Eligibility {
    let available = record
        .map(|record| effective_available(record, now))
        .unwrap_or(0);
    match evaluate(record, 1, now) {
        Ok(()) => Eligibility {
            can_create: true,
            reason: None,
            available,
        },
        Err(reason) => Eligibility {
            can_create: false,
            reason: Some(reason),
            available,
        },
    }
}
