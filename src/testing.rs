//! LIMS en memoria para los tests: respuestas guionizadas y registro de llamadas.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::lims::{
    Cell, DataSetFile, LimsClient, LimsError, Parameters, ResultTable, SampleFetch, SampleQuery,
    ServiceHandle,
};
use crate::models::Entity;

/// Fila `[uid, completed, ...extra]` como la devuelven los plug-ins.
pub fn status_row(uid: &str, completed: bool, extra: Vec<Value>) -> ResultTable {
    let mut cells = vec![Cell::new(json!(uid)), Cell::new(json!(if completed { 1 } else { 0 }))];
    cells.extend(extra.into_iter().map(Cell::new));
    ResultTable::single_row(cells)
}

#[derive(Default)]
pub struct FakeLims {
    job_responses: Mutex<VecDeque<Result<ResultTable, LimsError>>>,
    job_calls: Mutex<Vec<Parameters>>,
    lookups: AtomicUsize,
    missing_services: Vec<String>,
    experiment: Option<Entity>,
    searches: HashMap<String, Vec<Entity>>,
    samples: HashMap<String, Entity>,
    files: HashMap<String, Vec<DataSetFile>>,
    failing: bool,
    hanging: bool,
}

impl FakeLims {
    pub fn with_job_responses(self, responses: Vec<Result<ResultTable, LimsError>>) -> Self {
        *self.job_responses.lock().unwrap() = responses.into();
        self
    }

    pub fn without_service(mut self, name: &str) -> Self {
        self.missing_services.push(name.to_string());
        self
    }

    pub fn with_experiment(mut self, experiment: Entity) -> Self {
        self.experiment = Some(experiment);
        self
    }

    /// Resultado de `search_samples` para un código de tipo.
    pub fn with_search(mut self, type_code: &str, entities: Vec<Entity>) -> Self {
        self.searches.insert(type_code.to_string(), entities);
        self
    }

    pub fn with_sample(mut self, entity: Entity) -> Self {
        self.samples.insert(entity.perm_id.clone(), entity);
        self
    }

    pub fn with_files(mut self, data_set_perm_id: &str, files: Vec<DataSetFile>) -> Self {
        self.files.insert(data_set_perm_id.to_string(), files);
        self
    }

    /// Todas las consultas de muestras fallan con error de servidor.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// Las llamadas a servicios quedan registradas pero nunca responden.
    pub fn hanging(mut self) -> Self {
        self.hanging = true;
        self
    }

    pub fn job_calls(&self) -> Vec<Parameters> {
        self.job_calls.lock().unwrap().clone()
    }

    pub fn service_lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), LimsError> {
        if self.failing {
            return Err(LimsError::Server {
                message: "session expired".into(),
                exception: Some("InvalidSessionException".into()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LimsClient for FakeLims {
    fn session_token(&self) -> String {
        "tester-0001".to_string()
    }

    fn data_store_url(&self) -> String {
        "https://openbis.test".to_string()
    }

    async fn find_experiment_sample(
        &self,
        _identifier: &str,
        _type_code: &str,
    ) -> Result<Option<Entity>, LimsError> {
        self.check()?;
        Ok(self.experiment.clone())
    }

    async fn search_samples(&self, _prefix: &str, query: &SampleQuery) -> Result<Vec<Entity>, LimsError> {
        self.check()?;
        Ok(self.searches.get(&query.type_code).cloned().unwrap_or_default())
    }

    async fn get_sample(
        &self,
        _prefix: &str,
        perm_id: &str,
        _fetch: SampleFetch,
    ) -> Result<Option<Entity>, LimsError> {
        self.check()?;
        Ok(self.samples.get(perm_id).cloned())
    }

    async fn search_dataset_files(&self, data_set_perm_id: &str) -> Result<Vec<DataSetFile>, LimsError> {
        self.check()?;
        Ok(self.files.get(data_set_perm_id).cloned().unwrap_or_default())
    }

    async fn find_aggregation_service(&self, name: &str) -> Result<ServiceHandle, LimsError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.missing_services.iter().any(|s| s == name) {
            return Err(LimsError::ServiceNotFound(name.to_string()));
        }
        Ok(ServiceHandle {
            name: name.to_string(),
            perm_id: json!({ "permId": name }),
        })
    }

    async fn execute_aggregation_service(
        &self,
        _service: &ServiceHandle,
        parameters: &Parameters,
    ) -> Result<ResultTable, LimsError> {
        self.job_calls.lock().unwrap().push(parameters.clone());
        if self.hanging {
            std::future::pending::<()>().await;
        }
        self.job_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LimsError::Transport("sin respuestas guionizadas".into())))
    }
}
