//! Cliente JSON-RPC para la API V3 de openBIS (servidor de aplicaciones y DSS).
//!
//! Las respuestas de openBIS serializan grafos de objetos: la primera aparición
//! de un objeto lleva un `@id` y las siguientes son sólo ese número. Antes de
//! convertir nada se resuelven esas referencias.

use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::config::{AppConfig, Credentials};
use crate::lims::{
    Cell, DataSetFile, LimsClient, LimsError, Parameters, ResultTable, SampleFetch, SampleQuery,
    ServiceHandle,
};
use crate::models::Entity;

const AS_ENDPOINT: &str = "openbis/openbis/rmi-application-server-v3.json";
const DSS_ENDPOINT: &str = "datastore_server/rmi-data-store-server-v3.json";

pub struct OpenBisClient {
    http: reqwest::Client,
    base_url: Url,
    session_token: String,
    data_store_id: String,
}

/// Abre la sesión con openBIS usando la configuración.
pub async fn connect_from_config(cfg: &AppConfig) -> Result<OpenBisClient> {
    let http = reqwest::Client::new();
    let base_url = cfg.openbis_url.clone();

    info!("Conectando a openBIS en {base_url}...");
    let session_token = match &cfg.credentials {
        Credentials::SessionToken(token) => token.clone(),
        Credentials::Login { user, password } => {
            let endpoint = base_url.join(AS_ENDPOINT)?;
            let token = rpc(&http, &endpoint, "login", json!([user, password])).await?;
            match token {
                Value::String(t) if !t.is_empty() => t,
                _ => return Err(anyhow!("openBIS rechazó las credenciales de {user}")),
            }
        }
    };
    info!("Sesión de openBIS OK");

    Ok(OpenBisClient {
        http,
        base_url,
        session_token,
        data_store_id: cfg.data_store_server_id.clone(),
    })
}

async fn rpc(
    http: &reqwest::Client,
    endpoint: &Url,
    method: &str,
    params: Value,
) -> Result<Value, LimsError> {
    let body = json!({
        "id": Uuid::new_v4().to_string(),
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    });

    debug!("openBIS RPC {method} -> {endpoint}");
    let response: Value = http
        .post(endpoint.clone())
        .json(&body)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
        return Err(LimsError::Server {
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("error desconocido")
                .to_string(),
            exception: error
                .pointer("/data/exceptionTypeName")
                .and_then(Value::as_str)
                .map(str::to_string),
        });
    }

    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

impl OpenBisClient {
    async fn call_as(&self, method: &str, params: Value) -> Result<Value, LimsError> {
        let endpoint = self
            .base_url
            .join(AS_ENDPOINT)
            .map_err(|e| LimsError::Malformed(e.to_string()))?;
        rpc(&self.http, &endpoint, method, params).await
    }

    async fn call_dss(&self, method: &str, params: Value) -> Result<Value, LimsError> {
        let endpoint = self
            .base_url
            .join(DSS_ENDPOINT)
            .map_err(|e| LimsError::Malformed(e.to_string()))?;
        rpc(&self.http, &endpoint, method, params).await
    }
}

#[async_trait]
impl LimsClient for OpenBisClient {
    fn session_token(&self) -> String {
        self.session_token.clone()
    }

    fn data_store_url(&self) -> String {
        self.base_url.as_str().trim_end_matches('/').to_string()
    }

    async fn find_experiment_sample(
        &self,
        identifier: &str,
        type_code: &str,
    ) -> Result<Option<Entity>, LimsError> {
        let criteria = and_criteria(vec![
            sample_type_is(type_code),
            json!({
                "@type": "as.dto.common.search.IdentifierSearchCriteria",
                "fieldValue": string_equal_to(identifier),
            }),
        ]);
        let fetch = sample_fetch_options(json!({
            "type": type_fetch(),
            "properties": properties_fetch(),
            "experiment": { "@type": "as.dto.experiment.fetchoptions.ExperimentFetchOptions" },
            "parents": simple_sample_fetch(),
        }));

        let result = self
            .call_as("searchSamples", json!([self.session_token, criteria, fetch]))
            .await?;
        let prefix = crate::models::experiment_prefix(type_code);
        let objects = objects_of(&result)?;
        objects
            .first()
            .map(|raw| entity_from_json(prefix, raw))
            .transpose()
    }

    async fn search_samples(&self, prefix: &str, query: &SampleQuery) -> Result<Vec<Entity>, LimsError> {
        let criteria = and_criteria(vec![
            sample_type_is(&query.type_code),
            json!({
                "@type": "as.dto.sample.search.SampleParentsSearchCriteria",
                "operator": "AND",
                "criteria": [
                    {
                        "@type": "as.dto.common.search.PermIdSearchCriteria",
                        "fieldValue": string_equal_to(&query.parent_perm_id),
                    },
                    sample_type_is(&query.parent_type_code),
                ],
            }),
        ]);

        let mut options = json!({
            "type": type_fetch(),
            "properties": properties_fetch(),
        });
        if query.with_children {
            options["children"] = sample_fetch_options(json!({
                "type": type_fetch(),
                "properties": properties_fetch(),
                "parents": simple_sample_fetch(),
            }));
        }

        let result = self
            .call_as(
                "searchSamples",
                json!([self.session_token, criteria, sample_fetch_options(options)]),
            )
            .await?;

        objects_of(&result)?
            .iter()
            .map(|raw| entity_from_json(prefix, raw))
            .collect()
    }

    async fn get_sample(
        &self,
        prefix: &str,
        perm_id: &str,
        fetch: SampleFetch,
    ) -> Result<Option<Entity>, LimsError> {
        let options = match fetch {
            SampleFetch::Children => json!({
                "type": type_fetch(),
                "properties": properties_fetch(),
                "children": sample_fetch_options(json!({
                    "type": type_fetch(),
                    "properties": properties_fetch(),
                    "parents": simple_sample_fetch(),
                })),
            }),
            SampleFetch::DataSets => json!({
                "type": type_fetch(),
                "properties": properties_fetch(),
                "dataSets": {
                    "@type": "as.dto.dataset.fetchoptions.DataSetFetchOptions",
                    "type": { "@type": "as.dto.dataset.fetchoptions.DataSetTypeFetchOptions" },
                    "properties": properties_fetch(),
                },
            }),
        };

        let ids = json!([{ "@type": "as.dto.sample.id.SamplePermId", "permId": perm_id }]);
        let result = self
            .call_as(
                "getSamples",
                json!([self.session_token, ids, sample_fetch_options(options)]),
            )
            .await?;

        let resolved = resolve_references(&result);
        match resolved.get(perm_id) {
            Some(raw) if raw.is_object() => entity_from_json(prefix, raw).map(Some),
            _ => Ok(None),
        }
    }

    async fn search_dataset_files(&self, data_set_perm_id: &str) -> Result<Vec<DataSetFile>, LimsError> {
        let criteria = json!({
            "@type": "dss.dto.datasetfile.search.DataSetFileSearchCriteria",
            "operator": "AND",
            "criteria": [{
                "@type": "as.dto.dataset.search.DataSetSearchCriteria",
                "operator": "OR",
                "criteria": [{
                    "@type": "as.dto.common.search.PermIdSearchCriteria",
                    "fieldValue": string_equal_to(data_set_perm_id),
                }],
            }],
        });
        let fetch = json!({ "@type": "dss.dto.datasetfile.fetchoptions.DataSetFileFetchOptions" });

        let result = self
            .call_dss("searchFiles", json!([self.session_token, criteria, fetch]))
            .await?;

        let default_url = self.data_store_url();
        objects_of(&result)?
            .iter()
            .map(|raw| {
                let path = raw
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| LimsError::Malformed("fichero de dataset sin 'path'".into()))?;
                Ok(DataSetFile {
                    data_set_perm_id: raw
                        .pointer("/permId/dataSetId/permId")
                        .or_else(|| raw.pointer("/dataSetPermId/permId"))
                        .and_then(Value::as_str)
                        .unwrap_or(data_set_perm_id)
                        .to_string(),
                    path: path.to_string(),
                    is_directory: raw.get("directory").and_then(Value::as_bool).unwrap_or(false),
                    download_url: raw
                        .pointer("/dataStore/downloadUrl")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| default_url.clone()),
                })
            })
            .collect()
    }

    async fn find_aggregation_service(&self, name: &str) -> Result<ServiceHandle, LimsError> {
        let criteria = json!({
            "@type": "as.dto.service.search.AggregationServiceSearchCriteria",
            "operator": "AND",
            "criteria": [{
                "@type": "as.dto.common.search.NameSearchCriteria",
                "fieldValue": string_equal_to(name),
            }],
        });
        let fetch = json!({ "@type": "as.dto.service.fetchoptions.AggregationServiceFetchOptions" });

        let result = self
            .call_as("searchAggregationServices", json!([self.session_token, criteria, fetch]))
            .await?;

        let objects = objects_of(&result)?;
        let mut perm_id = objects
            .first()
            .and_then(|o| o.get("permId"))
            .cloned()
            .ok_or_else(|| LimsError::ServiceNotFound(name.to_string()))?;

        // Algunas versiones no devuelven el DSS del servicio.
        if perm_id.is_object() && perm_id.get("dataStoreId").map_or(true, Value::is_null) {
            perm_id["dataStoreId"] = json!({
                "@type": "as.dto.datastore.id.DataStorePermId",
                "permId": self.data_store_id,
            });
        }

        Ok(ServiceHandle {
            name: name.to_string(),
            perm_id,
        })
    }

    async fn execute_aggregation_service(
        &self,
        service: &ServiceHandle,
        parameters: &Parameters,
    ) -> Result<ResultTable, LimsError> {
        let options = json!({
            "@type": "as.dto.service.execute.AggregationServiceExecutionOptions",
            "parameters": parameters,
        });
        let result = self
            .call_as(
                "executeAggregationService",
                json!([self.session_token, service.perm_id, options]),
            )
            .await?;
        table_from_json(&result)
    }
}

// --- Construcción de criterios y opciones de carga ---

fn string_equal_to(value: &str) -> Value {
    json!({ "@type": "as.dto.common.search.StringEqualToValue", "value": value })
}

fn and_criteria(criteria: Vec<Value>) -> Value {
    json!({
        "@type": "as.dto.sample.search.SampleSearchCriteria",
        "operator": "AND",
        "criteria": criteria,
    })
}

fn sample_type_is(code: &str) -> Value {
    json!({
        "@type": "as.dto.sample.search.SampleTypeSearchCriteria",
        "operator": "AND",
        "criteria": [{
            "@type": "as.dto.common.search.CodeSearchCriteria",
            "fieldValue": string_equal_to(code),
        }],
    })
}

fn type_fetch() -> Value {
    json!({ "@type": "as.dto.sample.fetchoptions.SampleTypeFetchOptions" })
}

fn properties_fetch() -> Value {
    json!({ "@type": "as.dto.property.fetchoptions.PropertyFetchOptions" })
}

fn simple_sample_fetch() -> Value {
    sample_fetch_options(json!({
        "type": type_fetch(),
        "properties": properties_fetch(),
    }))
}

fn sample_fetch_options(mut options: Value) -> Value {
    options["@type"] = json!("as.dto.sample.fetchoptions.SampleFetchOptions");
    options
}

// --- Conversión de respuestas ---

/// Sustituye las referencias numéricas `@id` por el objeto al que apuntan.
fn resolve_references(value: &Value) -> Value {
    let mut registry = HashMap::new();
    collect_ids(value, &mut registry);
    substitute(value, &registry, &mut Vec::new())
}

fn collect_ids(value: &Value, registry: &mut HashMap<i64, Value>) {
    match value {
        Value::Object(map) => {
            if let Some(id) = map.get("@id").and_then(Value::as_i64) {
                registry.insert(id, value.clone());
            }
            map.values().for_each(|v| collect_ids(v, registry));
        }
        Value::Array(items) => items.iter().for_each(|v| collect_ids(v, registry)),
        _ => {}
    }
}

/// `path` guarda los `@id` que se están expandiendo: una referencia a un
/// ancestro (padre <-> hijo) se corta en lugar de expandirse otra vez.
fn substitute(value: &Value, registry: &HashMap<i64, Value>, path: &mut Vec<i64>) -> Value {
    match value {
        Value::Object(map) => {
            let id = map.get("@id").and_then(Value::as_i64);
            if let Some(id) = id {
                path.push(id);
            }
            let out = map
                .iter()
                .map(|(k, v)| {
                    let v = match (k.as_str(), v) {
                        // Sólo las relaciones entre objetos pueden ser referencias.
                        ("parents" | "children" | "dataSets" | "objects", Value::Array(items)) => {
                            Value::Array(items.iter().map(|item| expand_ref(item, registry, path)).collect())
                        }
                        ("type" | "permId" | "experiment" | "dataStore", Value::Number(_)) => {
                            expand_ref(v, registry, path)
                        }
                        _ => substitute(v, registry, path),
                    };
                    (k.clone(), v)
                })
                .collect();
            if id.is_some() {
                path.pop();
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, registry, path)).collect()),
        other => other.clone(),
    }
}

fn expand_ref(item: &Value, registry: &HashMap<i64, Value>, path: &mut Vec<i64>) -> Value {
    match item.as_i64() {
        Some(id) if path.contains(&id) => Value::Null,
        Some(id) => registry
            .get(&id)
            .map(|target| substitute(target, registry, path))
            .unwrap_or(Value::Null),
        None => substitute(item, registry, path),
    }
}

fn objects_of(result: &Value) -> Result<Vec<Value>, LimsError> {
    let resolved = resolve_references(result);
    match resolved.get("objects") {
        Some(Value::Array(items)) => Ok(items.clone()),
        _ => Err(LimsError::Malformed("la respuesta no contiene 'objects'".into())),
    }
}

fn entity_from_json(prefix: &str, raw: &Value) -> Result<Entity, LimsError> {
    let perm_id = raw
        .pointer("/permId/permId")
        .and_then(Value::as_str)
        .ok_or_else(|| LimsError::Malformed("objeto sin permId".into()))?;
    let code = raw.get("code").and_then(Value::as_str).unwrap_or(perm_id);
    let type_code = raw
        .pointer("/type/code")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let properties: BTreeMap<String, String> = raw
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| {
            props
                .iter()
                .filter(|(k, _)| !k.starts_with('@'))
                .map(|(k, v)| {
                    let v = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                    (k.clone(), v)
                })
                .collect()
        })
        .unwrap_or_default();

    let mut entity = Entity::new(prefix, perm_id, code, type_code, properties);
    entity.collection_perm_id = raw
        .pointer("/experiment/permId/permId")
        .and_then(Value::as_str)
        .map(str::to_string);
    entity.parents = related(prefix, raw, "parents")?;
    entity.children = related(prefix, raw, "children")?;
    entity.data_sets = related(prefix, raw, "dataSets")?;
    Ok(entity)
}

fn related(prefix: &str, raw: &Value, key: &str) -> Result<Vec<Entity>, LimsError> {
    match raw.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter(|item| item.is_object())
            .map(|item| entity_from_json(prefix, item))
            .collect(),
        _ => Ok(Vec::new()),
    }
}

fn table_from_json(result: &Value) -> Result<ResultTable, LimsError> {
    let columns = result
        .get("columns")
        .and_then(Value::as_array)
        .map(|cols| {
            cols.iter()
                .map(|c| c.get("title").and_then(Value::as_str).unwrap_or_default().to_string())
                .collect()
        })
        .unwrap_or_default();

    let rows = match result.get("rows") {
        Some(Value::Array(rows)) => rows
            .iter()
            .map(|row| {
                row.as_array()
                    .map(|cells| {
                        cells
                            .iter()
                            .map(|c| Cell::new(c.get("value").cloned().unwrap_or(Value::Null)))
                            .collect()
                    })
                    .ok_or_else(|| LimsError::Malformed("fila de tabla no es una lista".into()))
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(Value::Null) | None => Vec::new(),
        Some(_) => return Err(LimsError::Malformed("'rows' no es una lista".into())),
    };

    Ok(ResultTable { columns, rows })
}
