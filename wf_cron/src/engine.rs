//! ABOUTME: Live cron entry set with a single sleeper task firing due entries
//! ABOUTME: Each fire enqueues one flow_execution job with trigger schedule

use crate::schedule::{next_fire, parse_timezone, validate_expression};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wf_store::{EnqueueRequest, FlowExecutionPayload, JobStore, PayloadType};

/// Identity of a live entry; the syncer diffs on this
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryIdentity {
    pub flow_id: i64,
    pub cron_expr: String,
    pub timezone: String,
    pub is_user_created: bool,
}

/// One registered schedule
#[derive(Debug, Clone)]
pub struct CronEntry {
    pub flow_id: i64,
    pub namespace: String,
    pub flow_slug: String,
    pub cron_expr: String,
    pub timezone: String,
    pub inputs: serde_json::Value,
    pub created_by: String,
    pub is_user_created: bool,
}

impl CronEntry {
    pub fn identity(&self) -> EntryIdentity {
        EntryIdentity {
            flow_id: self.flow_id,
            cron_expr: self.cron_expr.clone(),
            timezone: self.timezone.clone(),
            is_user_created: self.is_user_created,
        }
    }
}

struct LiveEntry {
    entry: CronEntry,
    next_at: DateTime<Utc>,
}

/// Cron engine. Registration changes wake the sleeper so the minimum next
/// fire time is always current. Misfired instants are never replayed: after
/// any wake the next fire is computed strictly in the future.
pub struct CronEngine {
    entries: Mutex<HashMap<EntryIdentity, LiveEntry>>,
    changed: Notify,
    store: Arc<dyn JobStore>,
}

impl CronEngine {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            store,
        }
    }

    /// Register an entry. Invalid expressions or timezones are rejected and
    /// nothing changes.
    pub fn register(&self, entry: CronEntry) -> wf_core::Result<()> {
        validate_expression(&entry.cron_expr)?;
        parse_timezone(&entry.timezone)?;

        let next_at = next_fire(&entry.cron_expr, &entry.timezone, Utc::now())?
            .ok_or_else(|| {
                wf_core::Error::Validation(format!(
                    "Cron expression '{}' never fires",
                    entry.cron_expr
                ))
            })?;

        info!(
            flow = %entry.flow_slug,
            expr = %entry.cron_expr,
            timezone = %entry.timezone,
            next_at = %next_at,
            user_created = entry.is_user_created,
            "Registering cron entry"
        );

        self.entries
            .lock()
            .unwrap()
            .insert(entry.identity(), LiveEntry { entry, next_at });
        self.changed.notify_one();
        Ok(())
    }

    /// Remove an entry by identity; true when something was removed
    pub fn remove(&self, identity: &EntryIdentity) -> bool {
        let removed = self.entries.lock().unwrap().remove(identity).is_some();
        if removed {
            debug!(?identity, "Removed cron entry");
            self.changed.notify_one();
        }
        removed
    }

    /// Identities currently live in the engine
    pub fn live_identities(&self) -> Vec<EntryIdentity> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the sleeper loop until shutdown
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Cron engine started");
        loop {
            let due = self.collect_due();
            for (entry, fire_time) in due {
                if let Err(e) = self.fire(&entry, fire_time).await {
                    error!(
                        flow = %entry.flow_slug,
                        expr = %entry.cron_expr,
                        error = %e,
                        "Failed to enqueue scheduled execution"
                    );
                }
            }

            let sleep_until = self.min_next_at();
            let sleep = match sleep_until {
                Some(at) => {
                    let delta = (at - Utc::now()).to_std().unwrap_or_default();
                    tokio::time::sleep(delta)
                }
                // No entries: park until the set changes
                None => tokio::time::sleep(std::time::Duration::from_secs(3600)),
            };

            tokio::select! {
                _ = sleep => {}
                _ = self.changed.notified() => {
                    debug!("Cron entry set changed, recomputing");
                }
                _ = shutdown.cancelled() => {
                    info!("Cron engine stopping");
                    return;
                }
            }
        }
    }

    /// Pop entries whose fire time has arrived and advance their next_at.
    /// Advancing from `now` (not from the stored fire time) is what skips
    /// instants missed while the process was down.
    fn collect_due(&self) -> Vec<(CronEntry, DateTime<Utc>)> {
        let now = Utc::now();
        let mut due = Vec::new();
        let mut entries = self.entries.lock().unwrap();
        for live in entries.values_mut() {
            if live.next_at > now {
                continue;
            }
            let fire_time = live.next_at;
            match next_fire(&live.entry.cron_expr, &live.entry.timezone, now) {
                Ok(Some(next)) => live.next_at = next,
                Ok(None) => {
                    warn!(expr = %live.entry.cron_expr, "Schedule exhausted");
                    live.next_at = now + chrono::Duration::days(3650);
                }
                Err(e) => {
                    // Validated at registration; only reachable if the crate's
                    // parser changes underneath us.
                    error!(expr = %live.entry.cron_expr, error = %e, "Schedule became unparseable");
                    live.next_at = now + chrono::Duration::days(3650);
                }
            }
            due.push((live.entry.clone(), fire_time));
        }
        due
    }

    fn min_next_at(&self) -> Option<DateTime<Utc>> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .map(|l| l.next_at)
            .min()
    }

    async fn fire(&self, entry: &CronEntry, fire_time: DateTime<Utc>) -> wf_core::Result<()> {
        let exec_id = Uuid::new_v4();
        let payload = FlowExecutionPayload {
            exec_id,
            flow_slug: entry.flow_slug.clone(),
            namespace: entry.namespace.clone(),
            input: entry.inputs.clone(),
            trigger_type: "schedule".to_string(),
            triggered_by: entry.created_by.clone(),
            retry_from_action: None,
            scheduled_at: Some(fire_time),
        };

        let job_id = self
            .store
            .enqueue(EnqueueRequest::now(
                PayloadType::FlowExecution,
                serde_json::to_value(&payload)?,
                1,
            ))
            .await?;

        info!(
            flow = %entry.flow_slug,
            exec_id = %exec_id,
            job_id = %job_id,
            scheduled_at = %fire_time,
            "Scheduled execution enqueued"
        );
        Ok(())
    }
}
