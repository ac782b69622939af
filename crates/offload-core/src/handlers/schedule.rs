//! Schedule handler: turns trigger events into concrete tasks and keeps
//! the schedule rows honest.
//!
//! Each trigger materializes a task from the stored template, records an
//! execution row, and advances `next_run_at` (or completes the schedule) —
//! all in one transaction before the task is announced on the bus.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use offload_db::models::{
    ExecutionStatus, MissedRunPolicy, Schedule, ScheduleExecution, ScheduleStatus, ScheduleType,
    TaskStatus,
};
use offload_db::queries::{schedules, tasks};

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::events::{Event, EventBus, EventKind, handler};
use crate::manager::{DelegateRequest, build_task};
use crate::scheduler::next_occurrence;

use super::{Handler, SubscriptionSet};

pub struct ScheduleHandler {
    pool: SqlitePool,
    config: Arc<KernelConfig>,
    subscriptions: SubscriptionSet,
}

impl ScheduleHandler {
    pub fn new(pool: SqlitePool, config: Arc<KernelConfig>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            config,
            subscriptions: SubscriptionSet::new(),
        })
    }

    async fn handle(&self, event: Event, bus: &EventBus) -> KernelResult<()> {
        match event {
            Event::ScheduleTriggered {
                schedule_id,
                scheduled_for,
            } => self.on_triggered(&schedule_id, scheduled_for, bus).await,
            Event::ScheduleMissed {
                schedule_id,
                scheduled_for,
            } => self.on_missed(&schedule_id, scheduled_for).await,
            other => {
                debug!(kind = ?other.kind(), "schedule handler ignoring event");
                Ok(())
            }
        }
    }

    async fn on_triggered(
        &self,
        schedule_id: &str,
        scheduled_for: DateTime<Utc>,
        bus: &EventBus,
    ) -> KernelResult<()> {
        let schedule = schedules::get_schedule(&self.pool, schedule_id)
            .await
            .map_err(KernelError::from)?
            .ok_or_else(|| KernelError::schedule_not_found(schedule_id))?;
        if schedule.status != ScheduleStatus::Active {
            debug!(schedule_id, status = %schedule.status, "trigger raced a status change, ignoring");
            return Ok(());
        }

        // A schedule past its expiry expires on touch instead of firing.
        if let Some(expires_at) = schedule.expires_at {
            if Utc::now() > expires_at {
                info!(schedule_id, "schedule expired, not firing");
                schedules::transition_status(
                    &self.pool,
                    schedule_id,
                    ScheduleStatus::Active,
                    ScheduleStatus::Expired,
                )
                .await
                .map_err(KernelError::from)?;
                schedules::set_next_run(&self.pool, schedule_id, None)
                    .await
                    .map_err(KernelError::from)?;
                return Ok(());
            }
        }

        let mut request: DelegateRequest = serde_json::from_str(&schedule.task_template)
            .map_err(|e| {
                KernelError::validation(format!(
                    "schedule {schedule_id} carries an unreadable template: {e}"
                ))
            })?;

        self.apply_chaining(&schedule, &mut request).await;

        let task = build_task(&request, &self.config);
        let now = Utc::now();

        let (new_status, next_run_at) = self.advance_after_run(&schedule, now)?;
        let execution = ScheduleExecution {
            id: Uuid::new_v4(),
            schedule_id: schedule.id.clone(),
            task_id: Some(task.id),
            scheduled_for,
            executed_at: Some(now),
            status: ExecutionStatus::Triggered,
            error_message: None,
        };

        schedules::record_trigger(
            &self.pool,
            &schedule.id,
            new_status,
            next_run_at,
            now,
            &execution,
        )
        .await
        .map_err(KernelError::from)?;

        info!(
            schedule_id,
            task_id = %task.id,
            run = schedule.run_count + 1,
            "schedule materialized a task"
        );

        if let Err(err) = bus.emit(Event::TaskDelegated { task }).await {
            warn!(schedule_id, error = %err, "materialized task was rejected");
            let _ = schedules::fail_execution(&self.pool, execution.id, &err.to_string()).await;
        }
        Ok(())
    }

    /// `after_schedule_id` chaining: depend on the chained schedule's most
    /// recent task when that task is still live; otherwise the dependency
    /// is silently omitted.
    async fn apply_chaining(&self, schedule: &Schedule, request: &mut DelegateRequest) {
        let Some(ref after_id) = schedule.after_schedule_id else {
            return;
        };

        let execution = match schedules::latest_execution(&self.pool, after_id).await {
            Ok(Some(execution)) => execution,
            Ok(None) => return,
            Err(err) => {
                warn!(schedule_id = %schedule.id, error = %err, "failed to look up chained schedule");
                return;
            }
        };
        let Some(task_id) = execution.task_id else {
            return;
        };

        match tasks::get_task(&self.pool, task_id).await {
            Ok(Some(task)) if task.status == TaskStatus::Queued || task.status == TaskStatus::Running => {
                debug!(schedule_id = %schedule.id, depends_on = %task_id, "chaining onto live task");
                request.depends_on.push(task_id);
            }
            Ok(_) => {}
            Err(err) => {
                warn!(schedule_id = %schedule.id, error = %err, "failed to check chained task");
            }
        }
    }

    /// Where the schedule goes after a successful trigger: the next cron
    /// slot, or a terminal status for one-time / exhausted / expired
    /// schedules.
    fn advance_after_run(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> KernelResult<(ScheduleStatus, Option<DateTime<Utc>>)> {
        let run_count_after = schedule.run_count + 1;
        if let Some(max_runs) = schedule.max_runs {
            if run_count_after >= max_runs {
                return Ok((ScheduleStatus::Completed, None));
            }
        }

        match schedule.schedule_type {
            ScheduleType::OneTime => Ok((ScheduleStatus::Completed, None)),
            ScheduleType::Cron => {
                let expression = schedule.cron_expression.as_deref().ok_or_else(|| {
                    KernelError::validation(format!(
                        "cron schedule {} has no expression",
                        schedule.id
                    ))
                })?;
                let next = next_occurrence(expression, &schedule.timezone, now)?;
                match next {
                    Some(next) => {
                        if let Some(expires_at) = schedule.expires_at {
                            if next > expires_at {
                                return Ok((ScheduleStatus::Expired, None));
                            }
                        }
                        Ok((ScheduleStatus::Active, Some(next)))
                    }
                    None => Ok((ScheduleStatus::Completed, None)),
                }
            }
        }
    }

    async fn on_missed(
        &self,
        schedule_id: &str,
        scheduled_for: DateTime<Utc>,
    ) -> KernelResult<()> {
        let schedule = schedules::get_schedule(&self.pool, schedule_id)
            .await
            .map_err(KernelError::from)?
            .ok_or_else(|| KernelError::schedule_not_found(schedule_id))?;

        match schedule.missed_run_policy {
            MissedRunPolicy::Skip => {
                let (new_status, next_run_at) = match schedule.schedule_type {
                    ScheduleType::OneTime => (ScheduleStatus::Completed, None),
                    ScheduleType::Cron => {
                        let expression =
                            schedule.cron_expression.as_deref().unwrap_or_default();
                        match next_occurrence(expression, &schedule.timezone, Utc::now())? {
                            Some(next) => (ScheduleStatus::Active, Some(next)),
                            None => (ScheduleStatus::Completed, None),
                        }
                    }
                };
                info!(schedule_id, "skipping missed run");
                schedules::advance_schedule(
                    &self.pool,
                    schedule_id,
                    new_status,
                    next_run_at,
                    &missed_execution(&schedule, scheduled_for, ExecutionStatus::Skipped),
                )
                .await
                .map_err(KernelError::from)?;
            }
            MissedRunPolicy::Fail => {
                warn!(schedule_id, "missed run cancels the schedule");
                schedules::advance_schedule(
                    &self.pool,
                    schedule_id,
                    ScheduleStatus::Cancelled,
                    None,
                    &missed_execution(&schedule, scheduled_for, ExecutionStatus::Missed),
                )
                .await
                .map_err(KernelError::from)?;
            }
            MissedRunPolicy::Catchup => {
                // The executor fires catch-up runs as triggers; a missed
                // event for this policy means nothing to do.
                debug!(schedule_id, "catch-up schedule received a missed event, ignoring");
            }
        }
        Ok(())
    }
}

fn missed_execution(
    schedule: &Schedule,
    scheduled_for: DateTime<Utc>,
    status: ExecutionStatus,
) -> ScheduleExecution {
    ScheduleExecution {
        id: Uuid::new_v4(),
        schedule_id: schedule.id.clone(),
        task_id: None,
        scheduled_for,
        executed_at: Some(Utc::now()),
        status,
        error_message: match status {
            ExecutionStatus::Missed => {
                Some("run missed beyond the grace period".to_string())
            }
            _ => None,
        },
    }
}

#[async_trait]
impl Handler for ScheduleHandler {
    fn name(&self) -> &'static str {
        "schedule"
    }

    async fn start(self: Arc<Self>, bus: Arc<EventBus>) -> KernelResult<()> {
        for kind in [EventKind::ScheduleTriggered, EventKind::ScheduleMissed] {
            let this = Arc::clone(&self);
            let bus_ref = Arc::clone(&bus);
            let id = bus.subscribe(
                kind,
                handler(move |event| {
                    let this = Arc::clone(&this);
                    let bus_ref = Arc::clone(&bus_ref);
                    async move { this.handle(event, &bus_ref).await }
                }),
            )?;
            self.subscriptions.record(id);
        }
        Ok(())
    }

    async fn stop(&self, bus: &EventBus) -> KernelResult<()> {
        self.subscriptions.clear(bus);
        Ok(())
    }
}
