//! ABOUTME: Reconciles the desired schedule set with the live cron engine
//! ABOUTME: System entries follow flow declarations; user entries persist

use crate::engine::{CronEngine, CronEntry, EntryIdentity};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wf_core::Result;
use wf_db::{CronScheduleRepository, NewCronSchedule};

/// A flow the registry considers schedulable, with its declarations
#[derive(Debug, Clone)]
pub struct ScheduledFlow {
    pub flow_id: i64,
    pub namespace: String,
    pub slug: String,
    /// Declared cron expressions (5-field, fire in UTC)
    pub schedules: Vec<String>,
    /// Input defaults used as the inputs of every scheduled run
    pub default_inputs: serde_json::Value,
}

/// The syncer's view of the Flow Registry
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    /// Active flows with declared schedules whose every input has a default
    async fn scheduled_flows(&self) -> Vec<ScheduledFlow>;

    /// Namespace and slug of an active flow, by its database id. None means
    /// the flow is gone or inactive.
    async fn flow_route(&self, flow_id: i64) -> Option<(String, String)>;
}

/// Outcome of one reconcile pass
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncReport {
    pub added: usize,
    pub removed: usize,
    pub deactivated_flows: usize,
}

/// Periodic reconciler between registry, database, and cron engine
pub struct CronSyncer {
    engine: Arc<CronEngine>,
    source: Arc<dyn ScheduleSource>,
    schedules: CronScheduleRepository,
    interval: Duration,
}

impl CronSyncer {
    pub fn new(
        engine: Arc<CronEngine>,
        source: Arc<dyn ScheduleSource>,
        schedules: CronScheduleRepository,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            source,
            schedules,
            interval,
        }
    }

    /// Run the reconcile ticker until shutdown. Errors are logged and the
    /// next tick retries; a broken database never kills the loop.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Cron syncer started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sync_now().await {
                        Ok(report) => {
                            if report.added > 0 || report.removed > 0 {
                                info!(
                                    added = report.added,
                                    removed = report.removed,
                                    "Cron schedules reconciled"
                                );
                            }
                        }
                        Err(e) => error!(error = %e, "Cron sync failed"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Cron syncer stopping");
                    return;
                }
            }
        }
    }

    /// One reconcile pass
    pub async fn sync_now(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut desired: HashMap<EntryIdentity, CronEntry> = HashMap::new();

        // System entries follow the flow declarations exactly.
        let scheduled_flows = self.source.scheduled_flows().await;
        for flow in &scheduled_flows {
            let rows: Vec<NewCronSchedule> = flow
                .schedules
                .iter()
                .map(|expr| NewCronSchedule {
                    flow_id: flow.flow_id,
                    cron_expr: expr.clone(),
                    timezone: "UTC".to_string(),
                    inputs: flow.default_inputs.clone(),
                    created_by: "system".to_string(),
                    is_user_created: false,
                })
                .collect();
            self.schedules
                .replace_system_for_flow(flow.flow_id, &rows)
                .await?;

            for expr in &flow.schedules {
                let entry = CronEntry {
                    flow_id: flow.flow_id,
                    namespace: flow.namespace.clone(),
                    flow_slug: flow.slug.clone(),
                    cron_expr: expr.clone(),
                    timezone: "UTC".to_string(),
                    inputs: flow.default_inputs.clone(),
                    created_by: "system".to_string(),
                    is_user_created: false,
                };
                desired.insert(entry.identity(), entry);
            }
        }

        // Flows that still hold system rows but no longer appear in the
        // declarations: the flow either went inactive (drop everything it
        // scheduled) or stopped declaring schedules (drop just the system
        // rows). Without this pass a deactivated flow with no user-created
        // rows would keep its stale system rows forever.
        let declared_ids: HashSet<i64> = scheduled_flows.iter().map(|f| f.flow_id).collect();
        for flow_id in self.schedules.list_system_flow_ids().await? {
            if declared_ids.contains(&flow_id) {
                continue;
            }
            match self.source.flow_route(flow_id).await {
                Some(_) => {
                    debug!(flow_id, "Flow no longer declares schedules, clearing system rows");
                    self.schedules.replace_system_for_flow(flow_id, &[]).await?;
                }
                None => {
                    warn!(flow_id, "Flow inactive, disabling its schedules");
                    self.schedules.deactivate_for_flow(flow_id).await?;
                    report.deactivated_flows += 1;
                }
            }
        }

        // User entries persist independently, but die with their flow.
        for row in self.schedules.list_active_user_created().await? {
            match self.source.flow_route(row.flow_id).await {
                Some((namespace, slug)) => {
                    let entry = CronEntry {
                        flow_id: row.flow_id,
                        namespace,
                        flow_slug: slug,
                        cron_expr: row.cron_expr.clone(),
                        timezone: row.timezone.clone(),
                        inputs: row.inputs.clone(),
                        created_by: row.created_by.clone(),
                        is_user_created: true,
                    };
                    desired.insert(entry.identity(), entry);
                }
                None => {
                    warn!(
                        flow_id = row.flow_id,
                        expr = %row.cron_expr,
                        "Flow inactive, disabling its schedules"
                    );
                    self.schedules.deactivate_for_flow(row.flow_id).await?;
                    report.deactivated_flows += 1;
                }
            }
        }

        // Diff against the live set.
        let live: HashSet<EntryIdentity> = self.engine.live_identities().into_iter().collect();

        for (identity, entry) in &desired {
            if !live.contains(identity) {
                match self.engine.register(entry.clone()) {
                    Ok(()) => report.added += 1,
                    Err(e) => {
                        // Bad user-entered expressions land here; the row
                        // stays for the operator to fix.
                        error!(
                            flow = %entry.flow_slug,
                            expr = %entry.cron_expr,
                            error = %e,
                            "Rejected cron entry during sync"
                        );
                    }
                }
            }
        }

        for identity in live {
            if !desired.contains_key(&identity) {
                debug!(?identity, "Removing stale cron entry");
                if self.engine.remove(&identity) {
                    report.removed += 1;
                }
            }
        }

        Ok(report)
    }
}
