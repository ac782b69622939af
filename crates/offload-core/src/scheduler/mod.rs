//! Scheduled execution: cron/one-time schedules, their front-door API, and
//! the timer-driven executor that finds due schedules and fires them.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use offload_db::models::{
    MissedRunPolicy, Schedule, ScheduleExecution, ScheduleStatus, ScheduleType,
};
use offload_db::queries::{schedules, tasks};

use crate::config::KernelConfig;
use crate::error::{ErrorCode, KernelError, KernelResult};
use crate::events::{Event, EventBus};
use crate::manager::{DelegateRequest, validate_request};

/// Accept standard five-field cron expressions by prefixing a seconds
/// field; the parser wants six or seven fields.
pub fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

/// The next occurrence of a cron expression after `after`, computed in the
/// schedule's timezone and returned in UTC. `None` when the expression has
/// no future occurrence.
pub fn next_occurrence(
    expression: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> KernelResult<Option<DateTime<Utc>>> {
    let tz: Tz = timezone.parse().map_err(|_| {
        KernelError::validation(format!("unknown timezone {timezone:?}"))
    })?;
    let schedule = CronSchedule::from_str(&normalize_cron(expression)).map_err(|e| {
        KernelError::validation(format!("invalid cron expression {expression:?}: {e}"))
    })?;

    Ok(schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|occurrence| occurrence.with_timezone(&Utc)))
}

// ---------------------------------------------------------------------------
// Schedule front door
// ---------------------------------------------------------------------------

/// A request to create a schedule.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CreateScheduleRequest {
    /// The delegate request each run materializes.
    pub task_template: DelegateRequest,
    pub schedule_type: ScheduleType,
    pub cron_expression: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// IANA zone id; defaults to UTC.
    pub timezone: Option<String>,
    pub missed_run_policy: Option<MissedRunPolicy>,
    pub max_runs: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub after_schedule_id: Option<String>,
}

/// Validates and persists schedules; pause/resume/cancel run through here
/// as well.
pub struct ScheduleManager {
    pool: SqlitePool,
    config: Arc<KernelConfig>,
}

impl ScheduleManager {
    pub fn new(pool: SqlitePool, config: Arc<KernelConfig>) -> Self {
        Self { pool, config }
    }

    pub async fn create(&self, request: CreateScheduleRequest) -> KernelResult<Schedule> {
        validate_request(&request.task_template, &self.config)?;

        let timezone = request.timezone.unwrap_or_else(|| "UTC".to_string());
        let now = Utc::now();

        let (cron_expression, scheduled_at, next_run_at) = match request.schedule_type {
            ScheduleType::Cron => {
                let expression = request.cron_expression.ok_or_else(|| {
                    KernelError::validation("cron schedule requires a cron expression")
                })?;
                if request.scheduled_at.is_some() {
                    return Err(KernelError::validation(
                        "cron schedule must not carry a scheduled_at time",
                    ));
                }
                let next = next_occurrence(&expression, &timezone, now)?.ok_or_else(|| {
                    KernelError::validation("cron expression has no future occurrence")
                })?;
                (Some(expression), None, Some(next))
            }
            ScheduleType::OneTime => {
                let at = request.scheduled_at.ok_or_else(|| {
                    KernelError::validation("one-time schedule requires scheduled_at")
                })?;
                if request.cron_expression.is_some() {
                    return Err(KernelError::validation(
                        "one-time schedule must not carry a cron expression",
                    ));
                }
                // The timezone must still be valid so a later cron edit
                // cannot wedge the executor.
                let _: Tz = timezone.parse().map_err(|_| {
                    KernelError::validation(format!("unknown timezone {timezone:?}"))
                })?;
                (None, Some(at), Some(at))
            }
        };

        if let Some(ref after) = request.after_schedule_id {
            schedules::get_schedule(&self.pool, after)
                .await
                .map_err(KernelError::from)?
                .ok_or_else(|| KernelError::schedule_not_found(after))?;
        }

        let template = serde_json::to_string(&request.task_template)
            .map_err(|e| KernelError::validation(format!("unserializable template: {e}")))?;

        let schedule = Schedule {
            id: format!("sch_{}", Uuid::new_v4().simple()),
            task_template: template,
            schedule_type: request.schedule_type,
            cron_expression,
            scheduled_at,
            timezone,
            missed_run_policy: request.missed_run_policy.unwrap_or(MissedRunPolicy::Skip),
            status: ScheduleStatus::Active,
            max_runs: request.max_runs,
            run_count: 0,
            last_run_at: None,
            next_run_at,
            expires_at: request.expires_at,
            after_schedule_id: request.after_schedule_id,
            created_at: now,
        };

        schedules::insert_schedule(&self.pool, &schedule)
            .await
            .map_err(KernelError::from)?;
        info!(schedule_id = %schedule.id, kind = %schedule.schedule_type, "schedule created");
        Ok(schedule)
    }

    pub async fn list(
        &self,
        status: Option<ScheduleStatus>,
        limit: i64,
        offset: i64,
    ) -> KernelResult<Vec<Schedule>> {
        schedules::list_schedules(&self.pool, status, limit.clamp(1, 1_000), offset.max(0))
            .await
            .map_err(KernelError::from)
    }

    pub async fn get(
        &self,
        id: &str,
        include_history: bool,
    ) -> KernelResult<(Schedule, Vec<ScheduleExecution>)> {
        let schedule = schedules::get_schedule(&self.pool, id)
            .await
            .map_err(KernelError::from)?
            .ok_or_else(|| KernelError::schedule_not_found(id))?;
        let history = if include_history {
            schedules::list_executions(&self.pool, id, 100)
                .await
                .map_err(KernelError::from)?
        } else {
            Vec::new()
        };
        Ok((schedule, history))
    }

    pub async fn pause(&self, id: &str) -> KernelResult<()> {
        self.transition(id, ScheduleStatus::Active, ScheduleStatus::Paused, "pause")
            .await
    }

    pub async fn resume(&self, id: &str) -> KernelResult<()> {
        self.transition(id, ScheduleStatus::Paused, ScheduleStatus::Active, "resume")
            .await?;

        // Recompute the next slot so a long pause does not register as a
        // pile of missed runs.
        let schedule = schedules::get_schedule(&self.pool, id)
            .await
            .map_err(KernelError::from)?
            .ok_or_else(|| KernelError::schedule_not_found(id))?;
        if schedule.schedule_type == ScheduleType::Cron {
            if let Some(ref expression) = schedule.cron_expression {
                let next = next_occurrence(expression, &schedule.timezone, Utc::now())?;
                schedules::set_next_run(&self.pool, id, next)
                    .await
                    .map_err(KernelError::from)?;
            }
        }
        Ok(())
    }

    pub async fn cancel(&self, id: &str) -> KernelResult<()> {
        // A schedule can be cancelled from either live status.
        for from in [ScheduleStatus::Active, ScheduleStatus::Paused] {
            let rows =
                schedules::transition_status(&self.pool, id, from, ScheduleStatus::Cancelled)
                    .await
                    .map_err(KernelError::from)?;
            if rows > 0 {
                info!(schedule_id = %id, "schedule cancelled");
                return Ok(());
            }
        }
        match schedules::get_schedule(&self.pool, id)
            .await
            .map_err(KernelError::from)?
        {
            None => Err(KernelError::schedule_not_found(id)),
            Some(schedule) => Err(KernelError::invalid_operation(format!(
                "cannot cancel schedule {id} in status {}",
                schedule.status
            ))),
        }
    }

    async fn transition(
        &self,
        id: &str,
        from: ScheduleStatus,
        to: ScheduleStatus,
        verb: &str,
    ) -> KernelResult<()> {
        let rows = schedules::transition_status(&self.pool, id, from, to)
            .await
            .map_err(KernelError::from)?;
        if rows > 0 {
            info!(schedule_id = %id, %from, %to, "schedule transitioned");
            return Ok(());
        }
        match schedules::get_schedule(&self.pool, id)
            .await
            .map_err(KernelError::from)?
        {
            None => Err(KernelError::schedule_not_found(id)),
            Some(schedule) => Err(KernelError::invalid_operation(format!(
                "cannot {verb} schedule {id} in status {}",
                schedule.status
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Timer loop that fires due schedules onto the bus.
pub struct ScheduleExecutor {
    pool: SqlitePool,
    bus: Arc<EventBus>,
    check_interval: Duration,
    missed_run_grace: chrono::Duration,
    /// schedule id -> task from its most recent trigger, used to avoid
    /// double-scheduling while that task is still live.
    live_runs: Mutex<HashMap<String, Uuid>>,
}

impl ScheduleExecutor {
    pub fn new(pool: SqlitePool, bus: Arc<EventBus>, config: &KernelConfig) -> Arc<Self> {
        Arc::new(Self {
            pool,
            bus,
            check_interval: config.schedule_check_interval(),
            missed_run_grace: chrono::Duration::milliseconds(
                config.missed_run_grace_period_ms as i64,
            ),
            live_runs: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn the tick loop. The timer never blocks process exit: it stops
    /// as soon as the token fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_ms = executor.check_interval.as_millis() as u64,
                "schedule executor started"
            );
            let mut ticker = tokio::time::interval(executor.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        executor.tick(Utc::now()).await;
                    }
                    _ = cancel.cancelled() => {
                        info!("schedule executor stopped");
                        break;
                    }
                }
            }
        })
    }

    /// One pass over the due schedules. Public so tests (and the CLI's
    /// single-shot mode) can force ticks without waiting out the interval.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let due = match schedules::find_due(&self.pool, now).await {
            Ok(due) => due,
            Err(err) => {
                warn!(error = %err, "failed to query due schedules");
                return;
            }
        };

        for schedule in due {
            if self.has_live_run(&schedule.id).await {
                info!(schedule_id = %schedule.id, "previous run still live, skipping this slot");
                continue;
            }
            self.fire(&schedule, now).await;
        }
    }

    /// Whether the task from this schedule's last trigger is still
    /// non-terminal. Settled or vanished tasks clear the guard.
    async fn has_live_run(&self, schedule_id: &str) -> bool {
        let tracked = self
            .live_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(schedule_id)
            .copied();
        let Some(task_id) = tracked else {
            return false;
        };

        match tasks::get_task(&self.pool, task_id).await {
            Ok(Some(task)) if !task.status.is_terminal() => true,
            Ok(_) => {
                self.live_runs
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(schedule_id);
                false
            }
            Err(err) => {
                warn!(schedule_id, error = %err, "failed to check live run, skipping slot");
                true
            }
        }
    }

    async fn fire(&self, schedule: &Schedule, now: DateTime<Utc>) {
        let scheduled_for = schedule.next_run_at.unwrap_or(now);
        let delay = now - scheduled_for;

        let event = if delay > self.missed_run_grace {
            match schedule.missed_run_policy {
                // Catch-up still fires, as one coalesced trigger for the
                // original slot; lateness is visible in the timestamps.
                MissedRunPolicy::Catchup => {
                    info!(schedule_id = %schedule.id, delay_s = delay.num_seconds(), "catching up missed run");
                    Event::ScheduleTriggered {
                        schedule_id: schedule.id.clone(),
                        scheduled_for,
                    }
                }
                MissedRunPolicy::Skip | MissedRunPolicy::Fail => Event::ScheduleMissed {
                    schedule_id: schedule.id.clone(),
                    scheduled_for,
                },
            }
        } else {
            Event::ScheduleTriggered {
                schedule_id: schedule.id.clone(),
                scheduled_for,
            }
        };

        let triggered = matches!(event, Event::ScheduleTriggered { .. });
        if let Err(err) = self.bus.emit(event).await {
            warn!(schedule_id = %schedule.id, error = %err, "schedule event emit failed");
            return;
        }

        if triggered {
            // The schedule handler ran inside the emit, so the execution
            // row (and its task id) is already visible.
            match schedules::latest_execution(&self.pool, &schedule.id).await {
                Ok(Some(execution)) => {
                    if let Some(task_id) = execution.task_id {
                        self.live_runs
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(schedule.id.clone(), task_id);
                    }
                }
                Ok(None) => {
                    debug!(schedule_id = %schedule.id, "trigger produced no execution record");
                }
                Err(err) => {
                    warn!(schedule_id = %schedule.id, error = %err, "failed to read execution record");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expressions_gain_a_seconds_field() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("0 */5 * * * *"), "0 */5 * * * *");
    }

    #[test]
    fn next_occurrence_advances_strictly() {
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 30).unwrap();
        let next = next_occurrence("*/1 * * * *", "UTC", after)
            .unwrap()
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 12, 1, 0).unwrap());
        assert!(next > after);
    }

    #[test]
    fn next_occurrence_respects_timezone() {
        // 09:00 in New York is 13:00/14:00 UTC depending on DST; either
        // way it is not 09:00 UTC.
        let after = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let next = next_occurrence("0 9 * * *", "America/New_York", after)
            .unwrap()
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 6, 1, 13, 0, 0).unwrap());
    }

    #[test]
    fn bad_expression_and_zone_are_validation_errors() {
        let now = Utc::now();
        let err = next_occurrence("not a cron", "UTC", now).unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);

        let err = next_occurrence("* * * * *", "Mars/Olympus", now).unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);
    }
}
