use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    data_model::DataModel,
    job_poller::{JobPoller, JobState},
    jobs::{ExportOutcome, PlotOutcome},
    lims::LimsClient,
};

/// Tiempo que se conserva un trabajo terminado cuyo resultado nadie ha leído.
const FINISHED_JOB_RETENTION_MINUTES: i64 = 10;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub lims: Arc<dyn LimsClient>,
    pub data_model: DataModel,
    pub poller: JobPoller,
    pub status: Arc<Mutex<Status>>,
    pub jobs: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
    pub plot_cache: Arc<Mutex<PlotCache>>,
    /// Token padre de todos los trabajos; se cancela al apagar.
    pub shutdown: CancellationToken,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AppState {
    pub fn new(config: AppConfig, lims: Arc<dyn LimsClient>) -> Self {
        let poller = JobPoller::new(lims.clone(), config.poll_interval);
        Self {
            data_model: DataModel::new(lims.clone()),
            poller,
            lims,
            config,
            status: Arc::new(Mutex::new(Status::ready())),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            plot_cache: Arc::new(Mutex::new(PlotCache::default())),
            shutdown: CancellationToken::new(),
            shutdown_sender: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_status(&self, message: impl Into<String>, level: StatusLevel, is_busy: bool) {
        let mut status = lock(&self.status);
        status.message = message.into();
        status.level = level;
        status.is_busy = is_busy;
    }

    pub fn clear_status(&self) {
        *lock(&self.status) = Status::ready();
    }

    /// Guarda el desenlace de un trabajo y lo marca como terminado.
    pub fn finish_job(&self, id: Uuid, outcome: JobOutcome) {
        if let Some(entry) = lock(&self.jobs).get_mut(&id) {
            entry.outcome = Some(outcome);
            entry.finished_at = Some(Utc::now());
        }
    }

    /// Olvida los trabajos terminados hace más del tiempo de retención.
    pub fn prune_finished_jobs(&self, now: DateTime<Utc>) {
        let retention = chrono::Duration::minutes(FINISHED_JOB_RETENTION_MINUTES);
        lock(&self.jobs).retain(|_, entry| match entry.finished_at {
            Some(finished_at) => now - finished_at < retention,
            None => true,
        });
    }

    /// Cancela todos los trabajos en curso y devuelve sus tareas para esperarlas.
    pub fn cancel_all_jobs(&self) -> Vec<JoinHandle<()>> {
        self.shutdown.cancel();
        lock(&self.jobs)
            .values_mut()
            .filter_map(|entry| entry.handle.take())
            .collect()
    }
}

/// Bloquea ignorando el envenenamiento: el estado protegido sigue siendo válido
/// aunque otro hilo haya fallado con el candado tomado.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Success,
    Warning,
    Danger,
}

/// Último mensaje visible para el usuario.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub level: StatusLevel,
}

impl Status {
    fn ready() -> Self {
        Self {
            is_busy: false,
            message: String::new(),
            level: StatusLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Export,
    Plot,
}

/// Resultado final de un trabajo, ya interpretado.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Export {
        #[serde(flatten)]
        result: ExportOutcome,
        download_url: Option<String>,
    },
    Plot(PlotOutcome),
    Error { message: String },
}

pub struct JobEntry {
    pub kind: JobKind,
    pub created_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    pub progress: watch::Receiver<JobState>,
    pub outcome: Option<JobOutcome>,
    pub finished_at: Option<DateTime<Utc>>,
    pub handle: Option<JoinHandle<()>>,
}

/// Datos de gráficos ya descargados: nodo -> clave de la petición -> eventos.
#[derive(Debug, Default)]
pub struct PlotCache {
    entries: HashMap<String, HashMap<String, String>>,
}

impl PlotCache {
    pub fn get(&self, node_key: &str, data_key: &str) -> Option<&String> {
        self.entries.get(node_key).and_then(|m| m.get(data_key))
    }

    pub fn insert(&mut self, node_key: String, data_key: String, data: String) {
        self.entries.entry(node_key).or_default().insert(data_key, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plot_cache_is_keyed_by_node_and_request() {
        let mut cache = PlotCache::default();
        cache.insert("_1".into(), "FCS1_A_B_100_LIN_LIN_1".into(), "[[1,2]]".into());

        assert_eq!(cache.get("_1", "FCS1_A_B_100_LIN_LIN_1").map(String::as_str), Some("[[1,2]]"));
        assert!(cache.get("_1", "FCS1_A_B_100_LOG_LIN_1").is_none());
        assert!(cache.get("_2", "FCS1_A_B_100_LIN_LIN_1").is_none());
    }
}
