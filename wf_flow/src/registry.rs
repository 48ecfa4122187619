//! ABOUTME: In-memory flow registry rebuilt from the flow directory and DB
//! ABOUTME: Each subdirectory is a namespace; files tombstone on removal

use crate::model::Flow;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use wf_core::{Error, Result};
use wf_cron::{ScheduleSource, ScheduledFlow};
use wf_db::FlowRepository;

/// A flow parsed and validated from disk, before the DB upsert
#[derive(Debug, Clone)]
pub struct LoadedFlow {
    pub namespace: String,
    pub checksum: String,
    pub flow: Flow,
    pub path: PathBuf,
}

/// Outcome of a registry rebuild
#[derive(Debug, Default, Clone, Copy)]
pub struct RebuildReport {
    pub loaded: usize,
    pub skipped: usize,
}

/// Walk a flow directory tree. Each subdirectory is a namespace; each
/// `.yaml`/`.yml` file inside defines one flow. Broken files are returned
/// as failures, not errors: one bad flow never hides the rest.
pub fn load_directory(
    dir: &Path,
    known_executors: &HashSet<String>,
) -> Result<(Vec<LoadedFlow>, Vec<(PathBuf, Error)>)> {
    let mut loaded = Vec::new();
    let mut failures = Vec::new();

    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::Config(format!("Cannot read flow directory {:?}: {}", dir, e)))?;

    for entry in entries {
        let entry = entry.map_err(Error::Io)?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let namespace = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };

        let files = std::fs::read_dir(&path)
            .map_err(|e| Error::Config(format!("Cannot read namespace {:?}: {}", path, e)))?;
        for file in files {
            let file = file.map_err(Error::Io)?;
            let file_path = file.path();
            let is_flow_file = file_path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_flow_file {
                continue;
            }

            match load_file(&file_path, &namespace, known_executors) {
                Ok(flow) => loaded.push(flow),
                Err(e) => failures.push((file_path, e)),
            }
        }
    }

    Ok((loaded, failures))
}

fn load_file(
    path: &Path,
    namespace: &str,
    known_executors: &HashSet<String>,
) -> Result<LoadedFlow> {
    let bytes = std::fs::read(path).map_err(Error::Io)?;
    let checksum = hex::encode(Sha256::digest(&bytes));

    let mut flow = Flow::parse_yaml(&bytes)?;
    flow.validate(known_executors)?;

    if let Some(declared) = &flow.metadata.namespace {
        if declared != namespace {
            return Err(Error::Validation(format!(
                "Flow '{}' declares namespace '{}' but lives in '{}'",
                flow.metadata.id, declared, namespace
            )));
        }
    }
    flow.namespace = namespace.to_string();
    flow.checksum = checksum.clone();

    Ok(LoadedFlow {
        namespace: namespace.to_string(),
        checksum,
        flow,
        path: path.to_path_buf(),
    })
}

struct State {
    by_slug: HashMap<(String, String), Arc<Flow>>,
    by_dbid: HashMap<i64, Arc<Flow>>,
}

/// Flow registry. Read-mostly: rebuilds assemble a fresh map and swap it
/// wholesale under the write lock.
pub struct FlowRegistry {
    directory: PathBuf,
    known_executors: HashSet<String>,
    flows_repo: FlowRepository,
    state: RwLock<State>,
}

impl FlowRegistry {
    pub fn new(
        directory: impl Into<PathBuf>,
        known_executors: HashSet<String>,
        flows_repo: FlowRepository,
    ) -> Self {
        Self {
            directory: directory.into(),
            known_executors,
            flows_repo,
            state: RwLock::new(State {
                by_slug: HashMap::new(),
                by_dbid: HashMap::new(),
            }),
        }
    }

    /// Rescan the flow directory, reconcile the database, and swap the map
    pub async fn rebuild(&self) -> Result<RebuildReport> {
        let (loaded, failures) = load_directory(&self.directory, &self.known_executors)?;
        for (path, error) in &failures {
            warn!(path = %path.display(), error = %error, "Skipping broken flow file");
        }

        // Group by namespace so each gets one tombstone pass.
        let mut by_namespace: HashMap<String, Vec<LoadedFlow>> = HashMap::new();
        for flow in loaded {
            by_namespace.entry(flow.namespace.clone()).or_default().push(flow);
        }

        let mut by_slug = HashMap::new();
        let mut by_dbid = HashMap::new();
        let mut count = 0usize;

        for (namespace, flows) in by_namespace {
            let namespace_id = self.flows_repo.ensure_namespace(&namespace).await?;
            // Deactivate everything first; upserts below re-activate the
            // files that still exist, tombstoning the removed ones.
            self.flows_repo.deactivate_all(namespace_id).await?;

            for loaded_flow in flows {
                let row = self
                    .flows_repo
                    .upsert(
                        namespace_id,
                        loaded_flow.flow.slug(),
                        &loaded_flow.flow.metadata.name,
                        &loaded_flow.checksum,
                    )
                    .await?;

                let mut flow = loaded_flow.flow;
                flow.flow_dbid = row.id;
                flow.namespace_dbid = namespace_id;
                let flow = Arc::new(flow);

                debug!(
                    namespace = %namespace,
                    slug = %flow.slug(),
                    flow_id = row.id,
                    "Flow registered"
                );
                by_slug.insert((namespace.clone(), flow.slug().to_string()), flow.clone());
                by_dbid.insert(row.id, flow);
                count += 1;
            }
        }

        let mut state = self.state.write().await;
        state.by_slug = by_slug;
        state.by_dbid = by_dbid;
        drop(state);

        info!(loaded = count, skipped = failures.len(), "Flow registry rebuilt");
        Ok(RebuildReport {
            loaded: count,
            skipped: failures.len(),
        })
    }

    pub async fn get_by_slug(&self, namespace: &str, slug: &str) -> Option<Arc<Flow>> {
        self.state
            .read()
            .await
            .by_slug
            .get(&(namespace.to_string(), slug.to_string()))
            .cloned()
    }

    pub async fn get_by_dbid(&self, flow_dbid: i64) -> Option<Arc<Flow>> {
        self.state.read().await.by_dbid.get(&flow_dbid).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.by_slug.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ScheduleSource for FlowRegistry {
    async fn scheduled_flows(&self) -> Vec<ScheduledFlow> {
        self.state
            .read()
            .await
            .by_dbid
            .values()
            .filter(|f| !f.metadata.schedules.is_empty() && f.is_schedulable())
            .map(|f| ScheduledFlow {
                flow_id: f.flow_dbid,
                namespace: f.namespace.clone(),
                slug: f.slug().to_string(),
                schedules: f.metadata.schedules.clone(),
                default_inputs: f.default_inputs(),
            })
            .collect()
    }

    async fn flow_route(&self, flow_id: i64) -> Option<(String, String)> {
        self.state
            .read()
            .await
            .by_dbid
            .get(&flow_id)
            .map(|f| (f.namespace.clone(), f.slug().to_string()))
    }
}
