/// Background cron trigger source
///
/// Fires trigger types on a schedule using tokio-cron-scheduler. Schedules can
/// be added, replaced and removed while the scheduler runs; each schedule is
/// tracked by trigger type so an update removes the old job first.

use crate::runtime::triggers::TriggerManager;
use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

pub struct CronTriggerSource {
    scheduler: Arc<RwLock<JobScheduler>>,
    /// trigger type -> scheduler job UUID
    job_uuid_map: Arc<RwLock<HashMap<String, Uuid>>>,
    triggers: Arc<TriggerManager>,
}

impl CronTriggerSource {
    pub async fn new(triggers: Arc<TriggerManager>) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job_uuid_map: Arc::new(RwLock::new(HashMap::new())),
            triggers,
        })
    }

    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting cron trigger source");
        {
            let scheduler = self.scheduler.read().await;
            scheduler.start().await?;
        }
        tracing::info!("✅ Cron trigger source started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping cron trigger source");
        {
            let mut job_uuid_map = self.job_uuid_map.write().await;
            job_uuid_map.clear();
        }
        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }
        tracing::info!("✅ Cron trigger source stopped");
        Ok(())
    }

    /// Fire `trigger_type` on `schedule` (six fields, seconds first),
    /// replacing any schedule it already had
    pub async fn add_or_update_schedule(&self, trigger_type: &str, schedule: &str) -> Result<()> {
        if !self.triggers.contains(trigger_type) {
            return Err(anyhow::anyhow!("Unknown trigger type: {}", trigger_type));
        }

        let trigger_type_owned = trigger_type.to_string();
        let schedule_owned = schedule.to_string();
        let triggers = Arc::clone(&self.triggers);

        let job = Job::new_async(schedule, move |_uuid, _l| {
            let trigger_type = trigger_type_owned.clone();
            let schedule = schedule_owned.clone();
            let triggers = Arc::clone(&triggers);

            Box::pin(async move {
                tracing::debug!("🔔 Cron trigger activated: {}", trigger_type);
                let event = json!({
                    "trigger_type": "cron",
                    "schedule": schedule,
                    "timestamp": Utc::now().to_rfc3339(),
                });
                match triggers.fire(&trigger_type, event).await {
                    Ok(flow_instance_id) => {
                        tracing::info!("✅ Cron trigger '{}' started run {}", trigger_type, flow_instance_id)
                    }
                    // Trigger may have been unregistered since the job was added
                    Err(e) if e.is_not_found() => {
                        tracing::debug!("⏭️ Skipping cron fire for removed trigger: {}", trigger_type)
                    }
                    Err(e) => tracing::error!("❌ Cron trigger '{}' failed: {}", trigger_type, e),
                }
            })
        })?;

        self.remove_schedule(trigger_type).await;

        let new_job_uuid = {
            let scheduler = self.scheduler.write().await;
            scheduler.add(job).await?
        };
        {
            let mut job_uuid_map = self.job_uuid_map.write().await;
            job_uuid_map.insert(trigger_type.to_string(), new_job_uuid);
        }

        tracing::info!("🔥 Scheduled trigger '{}' ({})", trigger_type, schedule);
        Ok(())
    }

    /// Remove the schedule of `trigger_type`. Returns whether one existed.
    pub async fn remove_schedule(&self, trigger_type: &str) -> bool {
        let old_job_uuid = {
            let mut job_uuid_map = self.job_uuid_map.write().await;
            job_uuid_map.remove(trigger_type)
        };
        let Some(old_job_uuid) = old_job_uuid else {
            return false;
        };

        let scheduler = self.scheduler.read().await;
        if let Err(e) = scheduler.remove(&old_job_uuid).await {
            tracing::warn!("⚠️ Failed to remove cron job for {}: {}", trigger_type, e);
        } else {
            tracing::debug!("🛑 Removed cron job for trigger: {}", trigger_type);
        }
        true
    }

    pub async fn scheduled(&self) -> Vec<String> {
        let job_uuid_map = self.job_uuid_map.read().await;
        let mut types: Vec<String> = job_uuid_map.keys().cloned().collect();
        types.sort();
        types
    }
}
