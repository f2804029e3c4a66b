//! Automation worker: cron scheduler, event trigger matching, and job
//! execution with per-tenant bounded concurrency.

pub mod connectors;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use diesel::prelude::*;
use log::{error, info, trace, warn};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::orchestrator::admin::automation::normalize_cron;
use crate::shared::error::AppResult;
use crate::shared::events::{DomainEvent, EventBus};
use crate::shared::models::{
    automation_jobs, automation_rules, AutomationJob, AutomationJobStatus, AutomationRule,
    NewAutomationJob,
};
use crate::shared::retry::BackoffSchedule;
use crate::shared::state::AppState;

use connectors::{build_connector, ConnectorContext};

const SCHEDULER_INTERVAL: Duration = Duration::from_secs(60);
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(5);
const JOB_BATCH: i64 = 10;
const EVENT_CONSUMER_GROUP: &str = "automation";

pub struct AutomationWorker {
    state: Arc<AppState>,
    tenant_slots: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
    last_enqueued: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl AutomationWorker {
    pub fn new(state: Arc<AppState>) -> Arc<Self> {
        Arc::new(Self {
            state,
            tenant_slots: Mutex::new(HashMap::new()),
            last_enqueued: Mutex::new(HashMap::new()),
        })
    }

    pub async fn run(self: Arc<Self>) -> AppResult<()> {
        info!("automation worker starting");
        self.clone().spawn_scheduler();
        self.clone().spawn_event_listener();

        let mut tick = tokio::time::interval(JOB_POLL_INTERVAL);
        loop {
            tick.tick().await;
            if let Err(e) = Arc::clone(&self).process_due_jobs().await {
                error!("automation job sweep failed: {}", e);
            }
            if let Err(e) = self.update_queue_depth().await {
                trace!("queue depth update failed: {}", e);
            }
        }
    }

    /// Cron triggers: wake each minute, enqueue one job per due rule.
    fn spawn_scheduler(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SCHEDULER_INTERVAL);
            loop {
                tick.tick().await;
                if let Err(e) = self.enqueue_due_cron_rules().await {
                    error!("cron scheduler pass failed: {}", e);
                }
            }
        });
    }

    async fn enqueue_due_cron_rules(&self) -> AppResult<()> {
        let rules: Vec<AutomationRule> = {
            let mut conn = self.state.conn.get()?;
            automation_rules::table
                .filter(automation_rules::is_active.eq(true))
                .filter(automation_rules::trigger_type.eq("cron"))
                .filter(automation_rules::schedule.is_not_null())
                .load(&mut conn)?
        };

        let now = Utc::now();
        for rule in rules {
            let Some(ref expression) = rule.schedule else {
                continue;
            };
            let schedule = match Schedule::from_str(&normalize_cron(expression)) {
                Ok(s) => s,
                Err(e) => {
                    trace!("rule {} has invalid schedule {}: {}", rule.id, expression, e);
                    continue;
                }
            };
            let due = schedule
                .after(&(now - ChronoDuration::seconds(60)))
                .next()
                .map(|fire| fire <= now)
                .unwrap_or(false);
            if !due {
                continue;
            }

            // One job per rule per scheduler window.
            {
                let mut last = self.last_enqueued.lock().await;
                if let Some(enqueued_at) = last.get(&rule.id) {
                    if now - *enqueued_at < ChronoDuration::seconds(59) {
                        continue;
                    }
                }
                last.insert(rule.id, now);
            }

            self.enqueue_job(&rule, serde_json::json!({"trigger": "schedule"}), now)?;
        }
        Ok(())
    }

    /// Event triggers: match bus events against rule conditions.
    fn spawn_event_listener(self: Arc<Self>) {
        let bus = EventBus::new(self.state.redis.clone());
        tokio::spawn(async move {
            if let Err(e) = bus.ensure_group(EVENT_CONSUMER_GROUP).await {
                error!("automation event group creation failed: {}", e);
                return;
            }
            loop {
                match bus.read_batch(EVENT_CONSUMER_GROUP, "automation", 32, 5_000).await {
                    Ok(events) => {
                        for event in events {
                            if let Err(e) = self.handle_event(&event).await {
                                warn!("event trigger handling failed: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        warn!("automation event read failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    async fn handle_event(&self, event: &DomainEvent) -> AppResult<()> {
        let rules: Vec<AutomationRule> = {
            let mut conn = self.state.conn.get()?;
            automation_rules::table
                .filter(automation_rules::is_active.eq(true))
                .filter(automation_rules::trigger_type.eq("event"))
                .filter(automation_rules::tenant_id.eq(event.tenant_id))
                .filter(automation_rules::trigger_event.eq(&event.event))
                .load(&mut conn)?
        };

        for rule in rules {
            if !condition_matches(rule.condition.as_ref(), &event.payload) {
                continue;
            }
            self.enqueue_job(
                &rule,
                serde_json::json!({"trigger": "event", "event": event.event, "payload": event.payload}),
                Utc::now(),
            )?;
        }
        Ok(())
    }

    fn enqueue_job(
        &self,
        rule: &AutomationRule,
        payload: serde_json::Value,
        scheduled_for: DateTime<Utc>,
    ) -> AppResult<()> {
        let job = NewAutomationJob {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            tenant_id: rule.tenant_id,
            brand_id: rule.brand_id,
            status: AutomationJobStatus::Pending.as_str().to_string(),
            attempts: 0,
            scheduled_for,
            payload,
        };
        let mut conn = self.state.conn.get()?;
        diesel::insert_into(automation_jobs::table)
            .values(&job)
            .execute(&mut conn)?;
        trace!("enqueued automation job for rule {}", rule.id);
        Ok(())
    }

    async fn process_due_jobs(self: Arc<Self>) -> AppResult<()> {
        let jobs: Vec<AutomationJob> = {
            let mut conn = self.state.conn.get()?;
            automation_jobs::table
                .filter(automation_jobs::status.eq(AutomationJobStatus::Pending.as_str()))
                .filter(automation_jobs::scheduled_for.le(Utc::now()))
                .order(automation_jobs::created_at.asc())
                .limit(JOB_BATCH)
                .load(&mut conn)?
        };

        for job in jobs {
            let slot = self.tenant_slot(job.tenant_id).await;
            let Ok(permit) = slot.acquire_owned().await else {
                continue;
            };
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = worker.execute_job(job).await {
                    error!("automation job execution failed: {}", e);
                }
            });
        }
        Ok(())
    }

    async fn tenant_slot(&self, tenant_id: Uuid) -> Arc<Semaphore> {
        let mut slots = self.tenant_slots.lock().await;
        Arc::clone(slots.entry(tenant_id).or_insert_with(|| {
            Arc::new(Semaphore::new(
                self.state.config.runtime.automation_max_concurrency_per_tenant,
            ))
        }))
    }

    async fn execute_job(&self, job: AutomationJob) -> AppResult<()> {
        // Claim: only one worker moves pending -> running.
        let Some(job) = self.claim_job(&job)? else {
            return Ok(());
        };

        let rule: Option<AutomationRule> = {
            let mut conn = self.state.conn.get()?;
            automation_rules::table
                .find(job.rule_id)
                .first(&mut conn)
                .optional()?
        };
        let Some(rule) = rule else {
            self.finish_job(&job, AutomationJobStatus::Cancelled, Some("rule deleted"))?;
            return Ok(());
        };

        if !rule.is_active {
            self.finish_job(&job, AutomationJobStatus::Skipped, Some("rule_inactive"))?;
            return Ok(());
        }
        if let Some(last_run_at) = rule.last_run_at {
            let window = ChronoDuration::seconds(rule.throttle_seconds as i64);
            if Utc::now() - last_run_at < window {
                self.state.metrics.incr("automation_skipped").await;
                self.finish_job(&job, AutomationJobStatus::Skipped, Some("throttled"))?;
                return Ok(());
            }
        }

        let started = std::time::Instant::now();
        let connector = build_connector(&rule.action_type, &self.state);
        let context = ConnectorContext {
            tenant_id: job.tenant_id,
            brand_id: job.brand_id,
            rule_id: Some(rule.id),
            dry_run: false,
        };

        let outcome = connector.invoke(&rule.action_payload, &context).await;
        self.state
            .metrics
            .observe_latency("automation_latency", started.elapsed().as_millis() as u64)
            .await;

        match outcome {
            Ok(_) => {
                self.finish_job(&job, AutomationJobStatus::Succeeded, None)?;
                let mut conn = self.state.conn.get()?;
                diesel::update(automation_rules::table.find(rule.id))
                    .set(automation_rules::last_run_at.eq(Some(Utc::now())))
                    .execute(&mut conn)?;
                info!("automation rule {} ran successfully", rule.id);
                Ok(())
            }
            Err(e) => {
                self.state.metrics.incr("automation_failures").await;
                warn!(
                    "automation job {} attempt {} failed: {}",
                    job.id, job.attempts, e
                );
                if e.is_retryable() && job.attempts < rule.max_retries {
                    self.requeue_with_backoff(&job)?;
                } else {
                    self.finish_job(&job, AutomationJobStatus::Failed, Some(&e.to_string()))?;
                }
                Ok(())
            }
        }
    }

    fn claim_job(&self, job: &AutomationJob) -> AppResult<Option<AutomationJob>> {
        let mut conn = self.state.conn.get()?;
        let claimed: Option<AutomationJob> = diesel::update(
            automation_jobs::table
                .find(job.id)
                .filter(automation_jobs::status.eq(AutomationJobStatus::Pending.as_str())),
        )
        .set((
            automation_jobs::status.eq(AutomationJobStatus::Running.as_str()),
            automation_jobs::started_at.eq(Some(Utc::now())),
            automation_jobs::attempts.eq(job.attempts + 1),
        ))
        .get_result(&mut conn)
        .optional()?;
        Ok(claimed)
    }

    fn finish_job(
        &self,
        job: &AutomationJob,
        status: AutomationJobStatus,
        reason: Option<&str>,
    ) -> AppResult<()> {
        let mut conn = self.state.conn.get()?;
        diesel::update(automation_jobs::table.find(job.id))
            .set((
                automation_jobs::status.eq(status.as_str()),
                automation_jobs::completed_at.eq(Some(Utc::now())),
                automation_jobs::failure_reason.eq(reason),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn requeue_with_backoff(&self, job: &AutomationJob) -> AppResult<()> {
        let schedule = BackoffSchedule::default();
        let delay = schedule.delay_for(job.attempts as u32);
        let mut conn = self.state.conn.get()?;
        diesel::update(automation_jobs::table.find(job.id))
            .set((
                automation_jobs::status.eq(AutomationJobStatus::Pending.as_str()),
                automation_jobs::scheduled_for
                    .eq(Utc::now() + ChronoDuration::milliseconds(delay.as_millis() as i64)),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    async fn update_queue_depth(&self) -> AppResult<()> {
        let mut conn = self.state.conn.get()?;
        let depth: i64 = automation_jobs::table
            .filter(automation_jobs::status.eq(AutomationJobStatus::Pending.as_str()))
            .count()
            .first(&mut conn)?;
        self.state
            .metrics
            .set_gauge("automation_queue_depth", depth)
            .await;
        Ok(())
    }
}

/// A rule condition matches when every key it names equals the event
/// payload's value for that key.
pub fn condition_matches(
    condition: Option<&serde_json::Value>,
    payload: &serde_json::Value,
) -> bool {
    let Some(condition) = condition.and_then(|c| c.as_object()) else {
        return true;
    };
    condition
        .iter()
        .all(|(key, expected)| payload.get(key) == Some(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_condition_matches_everything() {
        assert!(condition_matches(None, &json!({"a": 1})));
        assert!(condition_matches(Some(&json!({})), &json!({"a": 1})));
    }

    #[test]
    fn condition_requires_exact_values() {
        let condition = json!({"channel": "web", "priority": 2});
        assert!(condition_matches(
            Some(&condition),
            &json!({"channel": "web", "priority": 2, "extra": true})
        ));
        assert!(!condition_matches(
            Some(&condition),
            &json!({"channel": "web", "priority": 3})
        ));
        assert!(!condition_matches(Some(&condition), &json!({"channel": "web"})));
    }
}
