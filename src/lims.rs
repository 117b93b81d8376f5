//! Contrato con el LIMS: lo que el visor necesita de openBIS y nada más.
//!
//! La implementación real vive en `openbis_client`; los tests usan un LIMS en
//! memoria que implementa el mismo trait.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::models::Entity;

/// Parámetros de un servicio de agregación.
pub type Parameters = serde_json::Map<String, Value>;

#[derive(Debug, Error)]
pub enum LimsError {
    #[error("error de transporte con openBIS: {0}")]
    Transport(String),
    #[error("openBIS devolvió un error: {message}")]
    Server {
        message: String,
        exception: Option<String>,
    },
    #[error("respuesta inesperada de openBIS: {0}")]
    Malformed(String),
    #[error("no se encontró el servicio de agregación '{0}'")]
    ServiceNotFound(String),
    #[error("openBIS no devolvió la muestra {0}")]
    NotFound(String),
}

impl From<reqwest::Error> for LimsError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl LimsError {
    /// Detalle sin el prefijo del `Display`, para mensajes al usuario.
    pub fn detail(&self) -> String {
        match self {
            Self::Transport(detail) | Self::Malformed(detail) => detail.clone(),
            Self::Server { message, .. } => message.clone(),
            Self::ServiceNotFound(name) => format!("aggregation service '{name}' not found"),
            Self::NotFound(perm_id) => format!("sample {perm_id} not found"),
        }
    }

    /// Texto corto para el tooltip de un nodo en error.
    pub fn tooltip(&self) -> String {
        match self {
            Self::Server {
                exception: Some(exception),
                ..
            } => exception.clone(),
            Self::Transport(_) => "TransportError".to_string(),
            Self::Malformed(_) => "MalformedResponse".to_string(),
            Self::Server { .. } => "ServerError".to_string(),
            Self::ServiceNotFound(name) => name.clone(),
            Self::NotFound(_) => "NotFound".to_string(),
        }
    }
}

/// Referencia opaca a un servicio de agregación ya resuelto.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceHandle {
    pub name: String,
    /// `permId` tal como lo devuelve openBIS; se reenvía sin interpretarlo.
    pub perm_id: Value,
}

/// Celda de una tabla de resultados.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Cell {
    #[serde(default)]
    pub value: Value,
}

impl Cell {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
        }
    }

    pub fn as_string(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// Los plug-ins devuelven banderas como booleanos o como 0/1.
    pub fn as_flag(&self) -> Option<bool> {
        match &self.value {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_f64().map(|v| v != 0.0),
            Value::String(s) => match s.trim() {
                "1" | "true" | "True" => Some(true),
                "0" | "false" | "False" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match &self.value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|v| v as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Tabla devuelta por `executeAggregationService`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

#[cfg(test)]
impl ResultTable {
    pub fn single_row(cells: Vec<Cell>) -> Self {
        Self {
            columns: Vec::new(),
            rows: vec![cells],
        }
    }
}

/// Búsqueda de muestras de un tipo cuyo padre es la muestra experimento.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleQuery {
    pub type_code: String,
    pub parent_perm_id: String,
    pub parent_type_code: String,
    /// Traer también los hijos (y los padres de éstos) de cada resultado.
    pub with_children: bool,
}

/// Qué relaciones cargar al pedir una muestra concreta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFetch {
    /// Hijos con sus padres (pocillos de una placa).
    Children,
    /// Datasets asociados (ficheros FCS de un pocillo/tubo).
    DataSets,
}

/// Fichero dentro de un dataset del DSS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSetFile {
    pub data_set_perm_id: String,
    pub path: String,
    pub is_directory: bool,
    /// URL base del DSS que sirve el fichero.
    pub download_url: String,
}

#[async_trait]
pub trait LimsClient: Send + Sync {
    /// Token de la sesión abierta; se incluye en las URLs de descarga.
    fn session_token(&self) -> String;

    /// URL base del DSS para descargas del espacio de trabajo de la sesión.
    fn data_store_url(&self) -> String;

    async fn find_experiment_sample(
        &self,
        identifier: &str,
        type_code: &str,
    ) -> Result<Option<Entity>, LimsError>;

    async fn search_samples(&self, prefix: &str, query: &SampleQuery) -> Result<Vec<Entity>, LimsError>;

    async fn get_sample(
        &self,
        prefix: &str,
        perm_id: &str,
        fetch: SampleFetch,
    ) -> Result<Option<Entity>, LimsError>;

    async fn search_dataset_files(&self, data_set_perm_id: &str) -> Result<Vec<DataSetFile>, LimsError>;

    async fn find_aggregation_service(&self, name: &str) -> Result<ServiceHandle, LimsError>;

    async fn execute_aggregation_service(
        &self,
        service: &ServiceHandle,
        parameters: &Parameters,
    ) -> Result<ResultTable, LimsError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flags_accept_bools_and_integers() {
        assert_eq!(Cell::new(json!(true)).as_flag(), Some(true));
        assert_eq!(Cell::new(json!(0)).as_flag(), Some(false));
        assert_eq!(Cell::new(json!(1)).as_flag(), Some(true));
        assert_eq!(Cell::new(json!("1")).as_flag(), Some(true));
        assert_eq!(Cell::new(json!("maybe")).as_flag(), None);
        assert_eq!(Cell::new(Value::Null).as_flag(), None);
    }

    #[test]
    fn strings_and_numbers() {
        assert_eq!(Cell::new(json!("abc")).as_string(), "abc");
        assert_eq!(Cell::new(json!(12)).as_string(), "12");
        assert_eq!(Cell::new(Value::Null).as_string(), "");
        assert_eq!(Cell::new(json!("42")).as_i64(), Some(42));
        assert_eq!(Cell::new(json!(7)).as_i64(), Some(7));
    }

    #[test]
    fn server_exception_is_used_as_tooltip() {
        let err = LimsError::Server {
            message: "boom".into(),
            exception: Some("UserFailureException".into()),
        };
        assert_eq!(err.tooltip(), "UserFailureException");
    }
}
