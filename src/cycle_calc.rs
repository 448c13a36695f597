//! Pure, deterministic cycle and pricing arithmetic
//!
//! Nothing here touches the durable store or a clock directly — callers
//! always pass `now` in. That keeps every function trivially testable and
//! lets `GrantsManager`/`BillingService` reuse the exact same arithmetic for
//! both live verification and historical reconciliation.

use crate::errors::{CycleCalcError, CycleCalcResult};
use crate::types::{Anchor, BillingIntervalUnit, CyclePolicy, EpochMillis, FeatureTypeConfig, PriceTier, TierMode};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

/// A half-open `[start, end)` cycle window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleWindow {
    pub start: EpochMillis,
    pub end: EpochMillis,
}

fn to_datetime(ms: EpochMillis) -> CycleCalcResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(CycleCalcError::NonFiniteInput)
}

fn to_millis(dt: DateTime<Utc>) -> EpochMillis {
    dt.timestamp_millis()
}

/// Clamps a day-of-month request to the last real day of that month (e.g.
/// anchor day 31 in February becomes the 28th/29th).
fn clamp_day_of_month(year: i32, month: u32, day: u32) -> u32 {
    let days_in_month = match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 {
                29
            } else {
                28
            }
        }
        _ => 30,
    };
    day.min(days_in_month)
}

fn add_interval(dt: DateTime<Utc>, unit: BillingIntervalUnit, count: u32) -> CycleCalcResult<DateTime<Utc>> {
    let count = count.max(1) as i64;
    let result = match unit {
        BillingIntervalUnit::Minute => dt + ChronoDuration::minutes(count),
        BillingIntervalUnit::Hour => dt + ChronoDuration::hours(count),
        BillingIntervalUnit::Day => dt + ChronoDuration::days(count),
        BillingIntervalUnit::Week => dt + ChronoDuration::weeks(count),
        BillingIntervalUnit::Month => {
            let total_months = dt.year() as i64 * 12 + (dt.month() as i64 - 1) + count;
            let year = (total_months.div_euclid(12)) as i32;
            let month = (total_months.rem_euclid(12)) as u32 + 1;
            let day = clamp_day_of_month(year, month, dt.day());
            Utc.with_ymd_and_hms(year, month, day, dt.hour(), dt.minute(), dt.second())
                .single()
                .ok_or(CycleCalcError::NonFiniteInput)?
        }
        BillingIntervalUnit::Year => {
            let year = dt.year() + count as i32;
            let day = clamp_day_of_month(year, dt.month(), dt.day());
            Utc.with_ymd_and_hms(year, dt.month(), day, dt.hour(), dt.minute(), dt.second())
                .single()
                .ok_or(CycleCalcError::NonFiniteInput)?
        }
    };
    Ok(result)
}

/// Pulls `now` back to the most recent anchor boundary at or before it, per
/// the policy's calendar unit.
fn align_to_anchor(now: DateTime<Utc>, policy: &CyclePolicy) -> CycleCalcResult<DateTime<Utc>> {
    let aligned = match (policy.interval, policy.anchor) {
        (BillingIntervalUnit::Month | BillingIntervalUnit::Year, Anchor::DayOfMonth(day)) => {
            let day = clamp_day_of_month(now.year(), now.month(), day as u32);
            let mut candidate = Utc
                .with_ymd_and_hms(now.year(), now.month(), day, 0, 0, 0)
                .single()
                .ok_or(CycleCalcError::NonFiniteInput)?;
            if candidate > now {
                candidate = add_interval(candidate, BillingIntervalUnit::Month, 1)?;
                let total_months = candidate.year() as i64 * 12 + candidate.month() as i64 - 1 - 1;
                let year = (total_months.div_euclid(12)) as i32;
                let month = (total_months.rem_euclid(12)) as u32 + 1;
                let day = clamp_day_of_month(year, month, day);
                candidate = Utc
                    .with_ymd_and_hms(year, month, day, 0, 0, 0)
                    .single()
                    .ok_or(CycleCalcError::NonFiniteInput)?;
            }
            candidate
        }
        (BillingIntervalUnit::Week, Anchor::DayOfWeek(weekday)) => {
            let current = now.weekday().num_days_from_sunday() as i64;
            let target = weekday as i64;
            let back = (current - target).rem_euclid(7);
            (now - ChronoDuration::days(back))
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .and_then(|naive| Utc.from_local_datetime(&naive).single())
                .ok_or(CycleCalcError::NonFiniteInput)?
        }
        (BillingIntervalUnit::Day, Anchor::Hour(hour)) => {
            let mut candidate = now
                .date_naive()
                .and_hms_opt(hour as u32, 0, 0)
                .and_then(|naive| Utc.from_local_datetime(&naive).single())
                .ok_or(CycleCalcError::NonFiniteInput)?;
            if candidate > now {
                candidate -= ChronoDuration::days(1);
            }
            candidate
        }
        (BillingIntervalUnit::Hour, Anchor::Minute(minute)) => {
            let mut candidate = now
                .date_naive()
                .and_hms_opt(now.hour(), minute as u32, 0)
                .and_then(|naive| Utc.from_local_datetime(&naive).single())
                .ok_or(CycleCalcError::NonFiniteInput)?;
            if candidate > now {
                candidate -= ChronoDuration::hours(1);
            }
            candidate
        }
        _ => now,
    };
    Ok(aligned)
}

/// Computes the cycle window containing `now`, aligned to the policy's
/// anchor.
pub fn calculate_cycle_window(policy: &CyclePolicy, now: EpochMillis) -> CycleCalcResult<CycleWindow> {
    let now_dt = to_datetime(now)?;
    let mut start = align_to_anchor(now_dt, policy)?;

    // Step forward/backward until `now` falls in [start, start + interval).
    loop {
        let end = add_interval(start, policy.interval, policy.interval_count)?;
        if start <= now_dt && now_dt < end {
            return Ok(CycleWindow {
                start: to_millis(start),
                end: to_millis(end),
            });
        }
        if end <= now_dt {
            start = end;
        } else {
            start = step_back(start, policy.interval, policy.interval_count)?;
        }
    }
}

fn step_back(dt: DateTime<Utc>, unit: BillingIntervalUnit, count: u32) -> CycleCalcResult<DateTime<Utc>> {
    let count = count.max(1) as i64;
    let result = match unit {
        BillingIntervalUnit::Minute => dt - ChronoDuration::minutes(count),
        BillingIntervalUnit::Hour => dt - ChronoDuration::hours(count),
        BillingIntervalUnit::Day => dt - ChronoDuration::days(count),
        BillingIntervalUnit::Week => dt - ChronoDuration::weeks(count),
        BillingIntervalUnit::Month => {
            let total_months = dt.year() as i64 * 12 + (dt.month() as i64 - 1) - count;
            let year = (total_months.div_euclid(12)) as i32;
            let month = (total_months.rem_euclid(12)) as u32 + 1;
            let day = clamp_day_of_month(year, month, dt.day());
            Utc.with_ymd_and_hms(year, month, day, dt.hour(), dt.minute(), dt.second())
                .single()
                .ok_or(CycleCalcError::NonFiniteInput)?
        }
        BillingIntervalUnit::Year => {
            let year = dt.year() - count as i32;
            let day = clamp_day_of_month(year, dt.month(), dt.day());
            Utc.with_ymd_and_hms(year, dt.month(), day, dt.hour(), dt.minute(), dt.second())
                .single()
                .ok_or(CycleCalcError::NonFiniteInput)?
        }
    };
    Ok(result)
}

/// Computes the next `n` cycle windows starting after `window`.
pub fn calculate_next_n_cycles(policy: &CyclePolicy, window: CycleWindow, n: u32) -> CycleCalcResult<Vec<CycleWindow>> {
    let mut out = Vec::with_capacity(n as usize);
    let mut start = to_datetime(window.end)?;
    for _ in 0..n {
        let end = add_interval(start, policy.interval, policy.interval_count)?;
        out.push(CycleWindow {
            start: to_millis(start),
            end: to_millis(end),
        });
        start = end;
    }
    Ok(out)
}

/// Fraction `[0, 1]` of a cycle actually covered by a service window, for
/// proration of mid-cycle upgrades/downgrades.
pub fn calculate_proration(
    service_start: EpochMillis,
    service_end: EpochMillis,
    cycle: CycleWindow,
) -> CycleCalcResult<f64> {
    if service_start >= service_end {
        return Err(CycleCalcError::InvalidServiceWindow { service_start, service_end });
    }
    let cycle_len = (cycle.end - cycle.start).max(1) as f64;
    let covered_start = service_start.max(cycle.start);
    let covered_end = service_end.min(cycle.end);
    let covered = (covered_end - covered_start).max(0) as f64;
    Ok((covered / cycle_len).clamp(0.0, 1.0))
}

/// Subtracts a per-cycle free allowance from reported quantity before tier
/// pricing is applied.
pub fn calculate_free_units(quantity: Decimal, free_units: Decimal) -> Decimal {
    let billable = quantity - free_units;
    if billable.is_sign_negative() {
        Decimal::ZERO
    } else {
        billable
    }
}

fn validate_tiers(tiers: &[PriceTier]) -> CycleCalcResult<()> {
    if tiers.is_empty() {
        return Err(CycleCalcError::InvalidTierConfig {
            message: "no tiers configured".to_string(),
        });
    }
    let mut sorted: Vec<&PriceTier> = tiers.iter().collect();
    sorted.sort_by_key(|t| t.first_unit);
    let mut expected_next = sorted[0].first_unit;
    for (i, tier) in sorted.iter().enumerate() {
        if tier.first_unit != expected_next {
            return Err(CycleCalcError::InvalidTierConfig {
                message: format!("gap or overlap before tier starting at {}", tier.first_unit),
            });
        }
        match tier.last_unit {
            Some(last) => {
                if last < tier.first_unit {
                    return Err(CycleCalcError::InvalidTierConfig {
                        message: format!("tier {} has lastUnit before firstUnit", i),
                    });
                }
                expected_next = last + 1;
            }
            None if i != sorted.len() - 1 => {
                return Err(CycleCalcError::InvalidTierConfig {
                    message: "only the final tier may be open-ended".to_string(),
                });
            }
            None => {}
        }
    }
    Ok(())
}

fn quantity_to_units(quantity: Decimal) -> CycleCalcResult<i64> {
    quantity.ceil().to_i64().ok_or(CycleCalcError::NonFiniteInput)
}

fn graduated_price_cents(tiers: &[PriceTier], units: i64) -> i64 {
    let mut total = 0i64;
    for tier in tiers {
        if units < tier.first_unit {
            continue;
        }
        let tier_last = tier.last_unit.unwrap_or(units);
        let units_in_tier = (units.min(tier_last) - tier.first_unit + 1).max(0);
        if units_in_tier > 0 {
            total += units_in_tier * tier.unit_price_cents + tier.flat_price_cents;
        }
    }
    total
}

fn volume_price_cents(tiers: &[PriceTier], units: i64) -> i64 {
    for tier in tiers {
        let covers = match tier.last_unit {
            Some(last) => units >= tier.first_unit && units <= last,
            None => units >= tier.first_unit,
        };
        if covers {
            return units * tier.unit_price_cents + tier.flat_price_cents;
        }
    }
    0
}

/// Computes the price in minor units for `quantity` units of a feature,
/// dispatching on its `FeatureTypeConfig` variant.
pub fn calculate_price_per_feature(config: &FeatureTypeConfig, quantity: Decimal) -> CycleCalcResult<i64> {
    if quantity.is_sign_negative() {
        return Err(CycleCalcError::NegativeQuantity {
            quantity: quantity.to_string(),
            aggregation: "price".to_string(),
        });
    }
    match config {
        FeatureTypeConfig::Flat { flat_price_cents } => Ok(*flat_price_cents),
        FeatureTypeConfig::Package { units, price_per_package_cents } => {
            let unit_count = quantity_to_units(quantity)?;
            let packages = if *units <= 0 {
                0
            } else {
                (unit_count + units - 1) / units
            };
            Ok(packages * price_per_package_cents)
        }
        FeatureTypeConfig::Tier { mode, tiers } | FeatureTypeConfig::Usage { mode, tiers } => {
            validate_tiers(tiers)?;
            let units = quantity_to_units(quantity)?;
            Ok(match mode {
                TierMode::Graduated => graduated_price_cents(tiers, units),
                TierMode::Volume => volume_price_cents(tiers, units),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PlanType;

    fn monthly_anchored_on(day: u8) -> CyclePolicy {
        CyclePolicy {
            interval: BillingIntervalUnit::Month,
            interval_count: 1,
            anchor: Anchor::DayOfMonth(day),
            plan_type: PlanType::Recurring,
        }
    }

    #[test]
    fn tiered_graduated_pricing_matches_worked_example() {
        let tiers = vec![
            PriceTier { first_unit: 1, last_unit: Some(10), unit_price_cents: 100, flat_price_cents: 0 },
            PriceTier { first_unit: 11, last_unit: Some(20), unit_price_cents: 50, flat_price_cents: 0 },
            PriceTier { first_unit: 21, last_unit: None, unit_price_cents: 20, flat_price_cents: 0 },
        ];
        let config = FeatureTypeConfig::Tier { mode: TierMode::Graduated, tiers };
        let price = calculate_price_per_feature(&config, Decimal::from(25)).unwrap();
        assert_eq!(price, 1600);
    }

    #[test]
    fn volume_pricing_applies_single_bracket() {
        let tiers = vec![
            PriceTier { first_unit: 1, last_unit: Some(10), unit_price_cents: 100, flat_price_cents: 0 },
            PriceTier { first_unit: 11, last_unit: None, unit_price_cents: 50, flat_price_cents: 500 },
        ];
        let config = FeatureTypeConfig::Tier { mode: TierMode::Volume, tiers };
        let price = calculate_price_per_feature(&config, Decimal::from(25)).unwrap();
        assert_eq!(price, 25 * 50 + 500);
    }

    #[test]
    fn package_pricing_rounds_up() {
        let config = FeatureTypeConfig::Package { units: 1000, price_per_package_cents: 200 };
        let price = calculate_price_per_feature(&config, Decimal::from(1001)).unwrap();
        assert_eq!(price, 400);
    }

    #[test]
    fn negative_quantity_rejected() {
        let config = FeatureTypeConfig::Flat { flat_price_cents: 100 };
        let err = calculate_price_per_feature(&config, Decimal::from(-1)).unwrap_err();
        assert!(matches!(err, CycleCalcError::NegativeQuantity { .. }));
    }

    #[test]
    fn free_units_floor_at_zero() {
        assert_eq!(calculate_free_units(Decimal::from(5), Decimal::from(10)), Decimal::ZERO);
        assert_eq!(calculate_free_units(Decimal::from(15), Decimal::from(10)), Decimal::from(5));
    }

    #[test]
    fn proration_covers_half_a_thirty_day_cycle() {
        let cycle = CycleWindow { start: 0, end: 30 * 24 * 60 * 60 * 1000 };
        let factor = calculate_proration(0, 15 * 24 * 60 * 60 * 1000, cycle).unwrap();
        assert!((factor - 0.5).abs() < 0.001);
    }

    #[test]
    fn proration_rejects_inverted_window() {
        let cycle = CycleWindow { start: 0, end: 1000 };
        let err = calculate_proration(500, 100, cycle).unwrap_err();
        assert!(matches!(err, CycleCalcError::InvalidServiceWindow { .. }));
    }

    #[test]
    fn cycle_window_contains_anchor_day() {
        let policy = monthly_anchored_on(1);
        let now = Utc.with_ymd_and_hms(2026, 7, 15, 12, 0, 0).single().unwrap();
        let window = calculate_cycle_window(&policy, now.timestamp_millis()).unwrap();
        let start = to_datetime(window.start).unwrap();
        let end = to_datetime(window.end).unwrap();
        assert_eq!(start.day(), 1);
        assert_eq!(start.month(), 7);
        assert_eq!(end.month(), 8);
    }

    #[test]
    fn next_n_cycles_chain_without_gaps() {
        let policy = monthly_anchored_on(1);
        let now = Utc.with_ymd_and_hms(2026, 7, 15, 12, 0, 0).single().unwrap();
        let window = calculate_cycle_window(&policy, now.timestamp_millis()).unwrap();
        let cycles = calculate_next_n_cycles(&policy, window, 3).unwrap();
        assert_eq!(cycles.len(), 3);
        assert_eq!(cycles[0].start, window.end);
        assert_eq!(cycles[0].end, cycles[1].start);
        assert_eq!(cycles[1].end, cycles[2].start);
    }

    #[test]
    fn invalid_tier_config_detected() {
        let tiers = vec![
            PriceTier { first_unit: 1, last_unit: Some(5), unit_price_cents: 100, flat_price_cents: 0 },
            PriceTier { first_unit: 10, last_unit: None, unit_price_cents: 50, flat_price_cents: 0 },
        ];
        let config = FeatureTypeConfig::Tier { mode: TierMode::Graduated, tiers };
        let err = calculate_price_per_feature(&config, Decimal::from(20)).unwrap_err();
        assert!(matches!(err, CycleCalcError::InvalidTierConfig { .. }));
    }
}
