//! Client-side bounds checks, applied before any command leaves the process.

use std::ops::RangeInclusive;

use sw_protocol::TimerSettings;

use crate::model::SettingsPatch;

pub const CUTOFF_VOLTAGE: RangeInclusive<f64> = 10.5..=13.5;
pub const MOTOR_CURRENT_THRESHOLD: RangeInclusive<f64> = 50.0..=200.0;
pub const SWITCH_CURRENT_THRESHOLD: RangeInclusive<f64> = 0.1..=50.0;
pub const CYCLE_LIMIT: RangeInclusive<u32> = 1..=1_000_000;
pub const FAILURE_THRESHOLD: RangeInclusive<u32> = 1..=1000;
pub const CYCLES_PER_MINUTE: RangeInclusive<u32> = 1..=12;
pub const TIMER_MAX_HOURS: u32 = 99;
pub const TIMER_MAX_MINUTES: u32 = 59;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{field} must be between {min} and {max}, got {value}")]
pub struct ValidationError {
    pub field: &'static str,
    pub min: String,
    pub max: String,
    pub value: String,
}

fn check_f64(
    field: &'static str,
    value: Option<f64>,
    range: &RangeInclusive<f64>,
) -> Result<(), ValidationError> {
    match value {
        Some(v) if !v.is_finite() || !range.contains(&v) => Err(ValidationError {
            field,
            min: range.start().to_string(),
            max: range.end().to_string(),
            value: v.to_string(),
        }),
        _ => Ok(()),
    }
}

fn check_u32(
    field: &'static str,
    value: Option<u32>,
    range: &RangeInclusive<u32>,
) -> Result<(), ValidationError> {
    match value {
        Some(v) if !range.contains(&v) => Err(ValidationError {
            field,
            min: range.start().to_string(),
            max: range.end().to_string(),
            value: v.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Check every field the patch touches. Untouched fields are not checked:
/// the service may report stored values outside the edit bounds.
pub fn validate_patch(patch: &SettingsPatch) -> Result<(), ValidationError> {
    check_f64("cutoff_voltage", patch.cutoff_voltage, &CUTOFF_VOLTAGE)?;
    check_f64(
        "motor_current_threshold",
        patch.motor_current_threshold,
        &MOTOR_CURRENT_THRESHOLD,
    )?;
    check_f64(
        "switch_current_threshold",
        patch.switch_current_threshold,
        &SWITCH_CURRENT_THRESHOLD,
    )?;
    check_u32("cycle_limit", patch.cycle_limit, &CYCLE_LIMIT)?;
    check_u32(
        "motor_failure_threshold",
        patch.motor_failure_threshold,
        &FAILURE_THRESHOLD,
    )?;
    check_u32(
        "switch_failure_threshold",
        patch.switch_failure_threshold,
        &FAILURE_THRESHOLD,
    )?;
    check_u32("cycles_per_minute", patch.cycles_per_minute, &CYCLES_PER_MINUTE)
}

pub fn validate_timer(timer: &TimerSettings) -> Result<(), ValidationError> {
    check_u32("hours", Some(timer.hours), &(0..=TIMER_MAX_HOURS))?;
    check_u32("minutes", Some(timer.minutes), &(0..=TIMER_MAX_MINUTES))
}
