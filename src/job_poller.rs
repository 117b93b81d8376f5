//! Ejecución de servicios de agregación de larga duración.
//!
//! Convención de los plug-ins: cada llamada devuelve una única fila
//! `[uid, completed, ...columnas propias]`. Mientras `completed` sea falso se
//! vuelve a llamar al servicio, tras un intervalo fijo, sólo con `{ uid }`.
//! Cualquier error de transporte o fila inesperada termina el trabajo; no hay
//! reintentos ni límite de consultas, sólo cancelación explícita.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lims::{Cell, LimsClient, Parameters, ResultTable, ServiceHandle};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("could not resolve service '{service}': {reason}")]
    ServiceUnavailable { service: String, reason: String },
    #[error("{0}")]
    Transport(String),
    #[error("unexpected server response: {0}")]
    UnexpectedResponse(String),
    #[error("the request was cancelled")]
    Cancelled,
}

impl JobError {
    /// Mensaje para el usuario final.
    pub fn user_message(&self) -> String {
        match self {
            Self::UnexpectedResponse(_) => {
                "Unexpected server response. Please contact your administrator.".to_string()
            }
            Self::Cancelled => "The request was cancelled.".to_string(),
            other => format!("Sorry, there was an error: \"{other}\"."),
        }
    }
}

/// Estado observable de un trabajo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Pending { job_id: String, polls: u32 },
    Completed { job_id: String, polls: u32 },
    Failed { reason: String },
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled)
    }
}

/// Fila final de un trabajo completado, sin las columnas `uid`/`completed`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedJob {
    pub job_id: String,
    pub polls: u32,
    pub columns: Vec<Cell>,
}

#[derive(Clone)]
pub struct JobPoller {
    lims: Arc<dyn LimsClient>,
    poll_interval: Duration,
    services: Arc<RwLock<HashMap<String, ServiceHandle>>>,
}

impl JobPoller {
    pub fn new(lims: Arc<dyn LimsClient>, poll_interval: Duration) -> Self {
        Self {
            lims,
            poll_interval,
            services: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Resuelve (y cachea) el servicio de agregación por nombre.
    pub async fn resolve(&self, service_name: &str) -> Result<ServiceHandle, JobError> {
        if let Some(handle) = self.services.read().await.get(service_name) {
            return Ok(handle.clone());
        }

        let handle = self
            .lims
            .find_aggregation_service(service_name)
            .await
            .map_err(|e| JobError::ServiceUnavailable {
                service: service_name.to_string(),
                reason: e.detail(),
            })?;

        info!("Servicio de agregación '{service_name}' resuelto");
        self.services
            .write()
            .await
            .entry(service_name.to_string())
            .or_insert_with(|| handle.clone());
        Ok(handle)
    }

    /// Ejecuta el trabajo hasta el final publicando los estados intermedios en
    /// `progress`. El estado terminal se devuelve sin publicar: quien llama lo
    /// publica cuando el resultado ya está entregado.
    async fn execute(
        &self,
        service_name: &str,
        parameters: Parameters,
        cancel: &CancellationToken,
        progress: &watch::Sender<JobState>,
    ) -> (Result<CompletedJob, JobError>, JobState) {
        progress.send_replace(JobState::Submitted);
        let result = self.drive(service_name, parameters, cancel, progress).await;

        let terminal = match &result {
            Ok(job) => JobState::Completed {
                job_id: job.job_id.clone(),
                polls: job.polls,
            },
            Err(JobError::Cancelled) => JobState::Cancelled,
            Err(err) => JobState::Failed {
                reason: err.to_string(),
            },
        };
        match &result {
            Ok(job) => info!("'{service_name}' completado (uid {}, {} llamadas)", job.job_id, job.polls),
            Err(err) => warn!("'{service_name}' terminó sin éxito: {err}"),
        }
        (result, terminal)
    }

    async fn drive(
        &self,
        service_name: &str,
        parameters: Parameters,
        cancel: &CancellationToken,
        progress: &watch::Sender<JobState>,
    ) -> Result<CompletedJob, JobError> {
        let service = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JobError::Cancelled),
            handle = self.resolve(service_name) => handle?,
        };

        let mut parameters = parameters;
        let mut polls = 0u32;

        loop {
            let table = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(JobError::Cancelled),
                table = self.lims.execute_aggregation_service(&service, &parameters) => {
                    table.map_err(|e| JobError::Transport(e.detail()))?
                }
            };
            polls += 1;
            debug!("'{service_name}' respondió (columnas {:?})", table.columns);

            let (job_id, completed, columns) = split_status_row(table)?;
            if completed {
                return Ok(CompletedJob {
                    job_id,
                    polls,
                    columns,
                });
            }

            debug!("'{service_name}' sigue en curso (uid {job_id}, llamada {polls})");
            progress.send_replace(JobState::Pending {
                job_id: job_id.clone(),
                polls,
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(JobError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            parameters = Parameters::new();
            parameters.insert("uid".to_string(), Value::String(job_id));
        }
    }

    /// Lanza el trabajo en segundo plano. `on_result` se llama exactamente una
    /// vez y siempre antes de que `progress` muestre un estado terminal.
    pub fn submit<F>(
        &self,
        service_name: impl Into<String>,
        parameters: Parameters,
        cancel: CancellationToken,
        on_result: F,
    ) -> (JoinHandle<()>, watch::Receiver<JobState>)
    where
        F: FnOnce(Result<CompletedJob, JobError>) + Send + 'static,
    {
        let (progress, receiver) = watch::channel(JobState::Submitted);
        let poller = self.clone();
        let service_name = service_name.into();

        let handle = tokio::spawn(async move {
            let (result, terminal) = poller
                .execute(&service_name, parameters, &cancel, &progress)
                .await;
            on_result(result);
            progress.send_replace(terminal);
        });

        (handle, receiver)
    }

    /// Llamada única a un servicio que responde sin `uid`/`completed`
    /// (p. ej. la actualización de experimentos). Devuelve la única fila.
    pub async fn invoke_once(&self, service_name: &str, parameters: Parameters) -> Result<Vec<Cell>, JobError> {
        let service = self.resolve(service_name).await?;
        let table = self
            .lims
            .execute_aggregation_service(&service, &parameters)
            .await
            .map_err(|e| JobError::Transport(e.detail()))?;
        single_row(table)
    }
}

fn single_row(table: ResultTable) -> Result<Vec<Cell>, JobError> {
    if table.rows.len() != 1 {
        return Err(JobError::UnexpectedResponse(format!(
            "expected 1 row, got {}",
            table.rows.len()
        )));
    }
    Ok(table.rows.into_iter().next().unwrap_or_default())
}

fn split_status_row(table: ResultTable) -> Result<(String, bool, Vec<Cell>), JobError> {
    let mut row = single_row(table)?.into_iter();

    let (Some(uid), Some(completed)) = (row.next(), row.next()) else {
        return Err(JobError::UnexpectedResponse(
            "missing uid/completed columns".to_string(),
        ));
    };
    let completed = completed.as_flag().ok_or_else(|| {
        JobError::UnexpectedResponse(format!("'completed' is not a flag: {}", completed.value))
    })?;

    Ok((uid.as_string(), completed, row.collect()))
}

/// Lee columnas por posición de una fila ya completada.
pub(crate) struct Columns<'a> {
    cells: &'a [Cell],
}

impl<'a> Columns<'a> {
    /// Falla si la fila tiene menos de `expected` columnas.
    pub(crate) fn new(cells: &'a [Cell], expected: usize) -> Result<Self, JobError> {
        if cells.len() < expected {
            return Err(JobError::UnexpectedResponse(format!(
                "expected {expected} columns, got {}",
                cells.len()
            )));
        }
        Ok(Self { cells })
    }

    pub(crate) fn string(&self, idx: usize) -> String {
        self.cells[idx].as_string()
    }

    pub(crate) fn flag(&self, idx: usize) -> Result<bool, JobError> {
        self.cells[idx].as_flag().ok_or_else(|| {
            JobError::UnexpectedResponse(format!("column {idx} is not a flag"))
        })
    }

    pub(crate) fn int(&self, idx: usize) -> Option<i64> {
        self.cells[idx].as_i64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lims::LimsError;
    use crate::testing::{status_row, FakeLims};
    use serde_json::json;
    use tokio::time::Instant;

    const INTERVAL: Duration = Duration::from_millis(500);

    async fn run(
        poller: &JobPoller,
        service_name: &str,
        parameters: Parameters,
        cancel: &CancellationToken,
    ) -> Result<CompletedJob, JobError> {
        let (progress, _) = watch::channel(JobState::Submitted);
        poller.execute(service_name, parameters, cancel, &progress).await.0
    }

    fn params(pairs: &[(&str, &str)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_completed_and_reports_once() {
        let lims = Arc::new(FakeLims::default().with_job_responses(vec![
            Ok(status_row("job-1", false, vec![])),
            Ok(status_row("job-1", false, vec![])),
            Ok(status_row("job-1", true, vec![json!(1), json!("done")])),
        ]));
        let poller = JobPoller::new(lims.clone(), INTERVAL);

        let started = Instant::now();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let (handle, progress) = poller.submit(
            "export_flow_datasets",
            params(&[("task", "PLATE")]),
            CancellationToken::new(),
            move |result| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let _ = tx.send(result);
            },
        );
        handle.await.unwrap();
        let job = rx.await.unwrap().unwrap();

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(job.job_id, "job-1");
        assert_eq!(job.polls, 3);
        assert_eq!(job.columns.len(), 2);
        assert!(started.elapsed() >= INTERVAL * 2);
        assert_eq!(
            *progress.borrow(),
            JobState::Completed {
                job_id: "job-1".into(),
                polls: 3
            }
        );

        // Primera llamada con los parámetros originales, las siguientes sólo con el uid.
        let sent = lims.job_calls();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], params(&[("task", "PLATE")]));
        assert_eq!(sent[1], params(&[("uid", "job-1")]));
        assert_eq!(sent[2], params(&[("uid", "job-1")]));
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_row_count_stops_polling() {
        let lims = Arc::new(FakeLims::default().with_job_responses(vec![
            Ok(status_row("job-2", false, vec![])),
            Ok(ResultTable::default()),
            Ok(status_row("job-2", true, vec![])),
        ]));
        let poller = JobPoller::new(lims.clone(), INTERVAL);

        let err = run(&poller, "retrieve_fcs_events", Parameters::new(), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, JobError::UnexpectedResponse(_)));
        assert_eq!(lims.job_calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_is_terminal() {
        let lims = Arc::new(FakeLims::default().with_job_responses(vec![
            Ok(status_row("job-3", false, vec![])),
            Err(LimsError::Transport("connection reset".into())),
            Ok(status_row("job-3", true, vec![])),
        ]));
        let poller = JobPoller::new(lims.clone(), INTERVAL);

        let err = run(&poller, "export_flow_datasets", Parameters::new(), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, JobError::Transport(_)));
        assert_eq!(lims.job_calls().len(), 2);
    }

    #[tokio::test]
    async fn unknown_service_fails_without_polling() {
        let lims = Arc::new(FakeLims::default().without_service("upgrade_experiment"));
        let poller = JobPoller::new(lims.clone(), INTERVAL);

        let err = run(&poller, "upgrade_experiment", Parameters::new(), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, JobError::ServiceUnavailable { .. }));
        assert!(lims.job_calls().is_empty());
    }

    #[tokio::test]
    async fn service_handles_are_cached() {
        let lims = Arc::new(FakeLims::default().with_job_responses(vec![
            Ok(status_row("a", true, vec![])),
            Ok(status_row("b", true, vec![])),
        ]));
        let poller = JobPoller::new(lims.clone(), INTERVAL);
        let cancel = CancellationToken::new();

        run(&poller, "export_flow_datasets", Parameters::new(), &cancel).await.unwrap();
        run(&poller, "export_flow_datasets", Parameters::new(), &cancel).await.unwrap();

        assert_eq!(lims.service_lookups(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_between_polls() {
        let lims = Arc::new(FakeLims::default().with_job_responses(vec![
            Ok(status_row("job-4", false, vec![])),
            Ok(status_row("job-4", true, vec![])),
        ]));
        let poller = JobPoller::new(lims.clone(), Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let (handle, mut progress) = poller.submit("export_flow_datasets", Parameters::new(), cancel.clone(), |result| {
            assert_eq!(result.unwrap_err(), JobError::Cancelled);
        });

        // Esperamos a la primera respuesta pendiente y cancelamos.
        progress
            .wait_for(|s| matches!(s, JobState::Pending { .. }))
            .await
            .unwrap();
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(*progress.borrow(), JobState::Cancelled);
        assert_eq!(lims.job_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_call_in_flight() {
        let lims = Arc::new(FakeLims::default().hanging());
        let poller = JobPoller::new(lims.clone(), INTERVAL);
        let cancel = CancellationToken::new();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let (handle, progress) = poller.submit("export_flow_datasets", Parameters::new(), cancel.clone(), move |result| {
            let _ = tx.send(result);
        });

        // La tarea llega a la llamada y se queda esperando la respuesta.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lims.job_calls().len(), 1);
        assert_eq!(*progress.borrow(), JobState::Submitted);

        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(rx.await.unwrap().unwrap_err(), JobError::Cancelled);
        assert_eq!(*progress.borrow(), JobState::Cancelled);
        assert_eq!(lims.job_calls().len(), 1);
    }

    #[tokio::test]
    async fn two_rows_are_unexpected() {
        let row = || vec![Cell::new(json!("job-5")), Cell::new(json!(1))];
        let lims = Arc::new(FakeLims::default().with_job_responses(vec![Ok(ResultTable {
            columns: Vec::new(),
            rows: vec![row(), row()],
        })]));
        let poller = JobPoller::new(lims.clone(), INTERVAL);

        let err = run(&poller, "retrieve_fcs_events", Parameters::new(), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, JobError::UnexpectedResponse(_)));
        assert_eq!(lims.job_calls().len(), 1);
    }

    #[tokio::test]
    async fn result_is_delivered_before_terminal_state() {
        let lims = Arc::new(FakeLims::default().with_job_responses(vec![Ok(status_row("job-6", true, vec![]))]));
        let poller = JobPoller::new(lims, INTERVAL);
        let delivered = Arc::new(std::sync::Mutex::new(None));
        let slot = delivered.clone();

        let (handle, mut progress) = poller.submit("export_flow_datasets", Parameters::new(), CancellationToken::new(), move |result| {
            *slot.lock().unwrap() = Some(result.is_ok());
        });

        progress.wait_for(JobState::is_terminal).await.unwrap();
        assert_eq!(*delivered.lock().unwrap(), Some(true));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn transport_detail_reaches_the_user_message() {
        let lims = Arc::new(FakeLims::default().with_job_responses(vec![Err(LimsError::Transport("connection reset".into()))]));
        let poller = JobPoller::new(lims, INTERVAL);

        let err = run(&poller, "export_flow_datasets", Parameters::new(), &CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.user_message(), "Sorry, there was an error: \"connection reset\".");
    }

    #[tokio::test]
    async fn non_flag_completed_is_unexpected() {
        let table = ResultTable::single_row(vec![Cell::new(json!("job")), Cell::new(json!("later"))]);
        assert!(matches!(split_status_row(table), Err(JobError::UnexpectedResponse(_))));
    }

    #[tokio::test]
    async fn invoke_once_returns_the_row() {
        let lims = Arc::new(FakeLims::default().with_job_responses(vec![Ok(ResultTable::single_row(vec![
            Cell::new(json!(1)),
            Cell::new(json!("Experiment upgraded")),
        ]))]));
        let poller = JobPoller::new(lims, INTERVAL);

        let row = poller.invoke_once("upgrade_experiment", Parameters::new()).await.unwrap();
        assert_eq!(row.len(), 2);
        assert_eq!(row[1].as_string(), "Experiment upgraded");
    }

    #[test]
    fn user_messages() {
        assert!(JobError::UnexpectedResponse("x".into())
            .user_message()
            .contains("contact your administrator"));
        assert!(JobError::Transport("down".into()).user_message().starts_with("Sorry"));
    }
}
