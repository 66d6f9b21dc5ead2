//! Next-run computation for every schedule type.

use chrono::{Duration, NaiveDateTime};
use std::str::FromStr;

use crate::{
    database::models::schedule_type::ScheduleType, error::SchedulerError, store::JobDefinition,
};

/// Parses a cron expression. Five-field expressions get a leading `0`
/// seconds field so both the classic and the seconds-aware forms work.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, SchedulerError> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };

    cron::Schedule::from_str(&normalized).map_err(|e| {
        SchedulerError::InvalidSchedule(format!("invalid cron expression '{expression}': {e}"))
    })
}

/// First cron occurrence strictly after `after`.
pub fn next_cron_occurrence(
    expression: &str,
    after: NaiveDateTime,
) -> Result<Option<NaiveDateTime>, SchedulerError> {
    let schedule = parse_cron(expression)?;
    Ok(schedule
        .after(&after.and_utc())
        .next()
        .map(|occurrence| occurrence.naive_utc()))
}

/// Checks that the field selected by the schedule type is present and usable,
/// and that the field it does not use is absent.
pub fn validate_schedule(
    schedule_type: ScheduleType,
    cron_expression: Option<&str>,
    interval_seconds: Option<i64>,
) -> Result<(), SchedulerError> {
    if schedule_type.uses_cron() {
        let expression = cron_expression.ok_or_else(|| {
            SchedulerError::InvalidSchedule("cron schedules need a cron_expression".into())
        })?;
        parse_cron(expression)?;
    } else if cron_expression.is_some() {
        return Err(SchedulerError::InvalidSchedule(format!(
            "{schedule_type} schedules take no cron_expression"
        )));
    }

    if schedule_type.uses_interval() {
        if !interval_seconds.is_some_and(|seconds| seconds > 0) {
            return Err(SchedulerError::InvalidSchedule(format!(
                "{schedule_type} schedules need a positive interval_seconds"
            )));
        }
    } else if interval_seconds.is_some() {
        return Err(SchedulerError::InvalidSchedule(format!(
            "{schedule_type} schedules take no interval_seconds"
        )));
    }

    Ok(())
}

fn interval(definition: &JobDefinition) -> Result<Duration, SchedulerError> {
    definition
        .interval_seconds
        .filter(|seconds| *seconds > 0)
        .map(Duration::seconds)
        .ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!(
                "definition '{}' has no positive interval_seconds",
                definition.job_key
            ))
        })
}

fn cron_expression(definition: &JobDefinition) -> Result<&str, SchedulerError> {
    definition.cron_expression.as_deref().ok_or_else(|| {
        SchedulerError::InvalidSchedule(format!(
            "definition '{}' has no cron_expression",
            definition.job_key
        ))
    })
}

/// `next_run_at` for a freshly created or rescheduled definition.
pub fn initial_next_run(
    definition: &JobDefinition,
    now: NaiveDateTime,
) -> Result<Option<NaiveDateTime>, SchedulerError> {
    match definition.schedule_type {
        ScheduleType::Once => Ok(Some(definition.start_at.unwrap_or(now))),
        ScheduleType::Delayed => Ok(Some(now + interval(definition)?)),
        ScheduleType::Recurring => {
            let interval = interval(definition)?;
            Ok(Some(definition.start_at.unwrap_or(now + interval)))
        }
        ScheduleType::Cron => {
            let after = definition.start_at.map_or(now, |start_at| start_at.max(now));
            next_cron_occurrence(cron_expression(definition)?, after)
        }
        ScheduleType::Manual => Ok(None),
    }
}

/// `next_run_at` after the tick due at `due_at` was enqueued.
///
/// Recurring schedules keep their phase: missed ticks are skipped by adding
/// whole intervals until the result lies strictly after `now`.
pub fn next_run_after_tick(
    definition: &JobDefinition,
    due_at: NaiveDateTime,
    now: NaiveDateTime,
) -> Result<Option<NaiveDateTime>, SchedulerError> {
    match definition.schedule_type {
        ScheduleType::Once | ScheduleType::Delayed | ScheduleType::Manual => Ok(None),
        ScheduleType::Recurring => {
            let interval = interval(definition)?;
            Ok(Some(advance_by_interval(due_at, interval, now)))
        }
        ScheduleType::Cron => {
            next_cron_occurrence(cron_expression(definition)?, now.max(due_at))
        }
    }
}

/// Whether a recurring or cron definition points at a tick that is already
/// in the past and should be recomputed when it is switched back on.
#[must_use]
pub fn is_stale(definition: &JobDefinition, now: NaiveDateTime) -> bool {
    matches!(
        definition.schedule_type,
        ScheduleType::Recurring | ScheduleType::Cron
    ) && definition
        .next_run_at
        .is_none_or(|next_run_at| next_run_at < now)
}

fn advance_by_interval(due_at: NaiveDateTime, interval: Duration, now: NaiveDateTime) -> NaiveDateTime {
    if due_at > now {
        return due_at + interval;
    }

    let elapsed = (now - due_at).num_seconds();
    let step = interval.num_seconds();
    due_at + Duration::seconds((elapsed / step + 1) * step)
}
