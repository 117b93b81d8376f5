//! Trabajos concretos del visor sobre los plug-ins de agregación de openBIS:
//! exportación de datasets, eventos FCS para gráficos y actualización de
//! experimentos. Cada uno sabe construir sus parámetros y leer su fila final.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use crate::app_state::StatusLevel;
use crate::job_poller::{Columns, CompletedJob, JobError};
use crate::lims::{Cell, Parameters};

pub const EXPORT_SERVICE: &str = "export_flow_datasets";
pub const FCS_EVENTS_SERVICE: &str = "retrieve_fcs_events";
pub const UPGRADE_SERVICE: &str = "upgrade_experiment";

/// Qué parte del experimento exportar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportTask {
    ExperimentSample,
    AllPlates,
    Plate,
    Tubeset,
}

impl ExportTask {
    fn as_str(self) -> &'static str {
        match self {
            Self::ExperimentSample => "EXPERIMENT_SAMPLE",
            Self::AllPlates => "ALL_PLATES",
            Self::Plate => "PLATE",
            Self::Tubeset => "TUBESET",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportMode {
    /// Copia a la carpeta del usuario en el DSS.
    Normal,
    /// Archivo zip en el espacio de trabajo de la sesión, para descargar.
    Zip,
}

impl ExportMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Zip => "zip",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "zip" => Some(Self::Zip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub task: ExportTask,
    pub collection_id: String,
    pub collection_type: String,
    pub exp_sample_id: String,
    pub exp_sample_perm_id: String,
    pub exp_sample_type: String,
    #[serde(default)]
    pub plate_perm_id: String,
    #[serde(default)]
    pub plate_type: String,
    pub mode: ExportMode,
}

impl ExportRequest {
    pub fn to_parameters(&self) -> Parameters {
        to_parameters(json!({
            "task": self.task.as_str(),
            "collectionId": self.collection_id,
            "collectionType": self.collection_type,
            "expSampleId": self.exp_sample_id,
            "expSamplePermId": self.exp_sample_perm_id,
            "expSampleType": self.exp_sample_type,
            "platePermId": self.plate_perm_id,
            "plateType": self.plate_type,
            "mode": self.mode.as_str(),
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportOutcome {
    pub success: bool,
    pub message: String,
    pub copied_files: i64,
    pub relative_exp_folder: String,
    pub zip_archive_file_name: String,
    pub mode: ExportMode,
}

impl ExportOutcome {
    pub fn from_job(job: &CompletedJob) -> Result<Self, JobError> {
        let cols = Columns::new(&job.columns, 6)?;
        let mode_raw = cols.string(5);
        let mode = ExportMode::parse(&mode_raw)
            .ok_or_else(|| JobError::UnexpectedResponse(format!("unknown export mode: {mode_raw}")))?;

        Ok(Self {
            success: cols.flag(0)?,
            message: cols.string(1),
            copied_files: cols.int(2).unwrap_or(0),
            relative_exp_folder: cols.string(3),
            zip_archive_file_name: cols.string(4),
            mode,
        })
    }

    pub fn status(&self) -> (String, StatusLevel) {
        if !self.success {
            let text = match self.mode {
                ExportMode::Normal => format!(
                    "Sorry, there was an error exporting to your user folder: \"{}\".",
                    self.message
                ),
                ExportMode::Zip => "Sorry, there was an error packaging your files for download!".to_string(),
            };
            return (text, StatusLevel::Danger);
        }

        let files = if self.copied_files == 1 {
            "1 file was".to_string()
        } else {
            format!("{} files were", self.copied_files)
        };
        let text = match self.mode {
            ExportMode::Normal => format!(
                "Congratulations! {files} successfully exported to {{...}}/{}.",
                self.relative_exp_folder
            ),
            ExportMode::Zip => format!("Congratulations! {files} successfully packaged."),
        };
        (text, StatusLevel::Success)
    }

    /// URL de descarga del zip en el espacio de trabajo de la sesión.
    pub fn download_url(&self, data_store_url: &str, session_token: &str) -> Option<String> {
        if !self.success || self.mode != ExportMode::Zip {
            return None;
        }
        let mut url = Url::parse(&format!(
            "{}/datastore_server/session_workspace_file_download",
            data_store_url.trim_end_matches('/')
        ))
        .ok()?;
        url.query_pairs_mut()
            .append_pair("sessionID", session_token)
            .append_pair("filePath", &self.zip_archive_file_name);
        Some(url.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlotRequest {
    /// Código openBIS del fichero FCS.
    pub code: String,
    pub param_x: String,
    pub param_y: String,
    /// "LIN" o "LOG".
    pub display_x: String,
    pub display_y: String,
    pub num_events: i64,
    pub max_num_events: i64,
    pub sampling_method: i64,
    pub node_key: String,
}

impl PlotRequest {
    pub fn cache_key(&self) -> String {
        plot_cache_key(
            &self.code,
            &self.param_x,
            &self.param_y,
            self.max_num_events,
            &self.display_x,
            &self.display_y,
            self.sampling_method,
        )
    }

    pub fn to_parameters(&self) -> Parameters {
        to_parameters(json!({
            "code": self.code,
            "paramX": self.param_x,
            "paramY": self.param_y,
            "displayX": self.display_x,
            "displayY": self.display_y,
            "numEvents": self.num_events,
            "maxNumEvents": self.max_num_events,
            "samplingMethod": self.sampling_method,
            "nodeKey": self.node_key,
        }))
    }
}

pub fn plot_cache_key(
    code: &str,
    param_x: &str,
    param_y: &str,
    max_num_events: i64,
    display_x: &str,
    display_y: &str,
    sampling_method: i64,
) -> String {
    format!("{code}_{param_x}_{param_y}_{max_num_events}_{display_x}_{display_y}_{sampling_method}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlotOutcome {
    pub success: bool,
    pub message: String,
    /// Eventos serializados tal cual los devuelve el plug-in.
    pub data: String,
    pub code: String,
    pub param_x: String,
    pub param_y: String,
    pub display_x: String,
    pub display_y: String,
    pub num_events: Option<i64>,
    pub max_num_events: i64,
    pub sampling_method: i64,
    pub node_key: String,
}

impl PlotOutcome {
    pub fn from_job(job: &CompletedJob) -> Result<Self, JobError> {
        let cols = Columns::new(&job.columns, 12)?;
        Ok(Self {
            success: cols.flag(0)?,
            message: cols.string(1),
            data: cols.string(2),
            code: cols.string(3),
            param_x: cols.string(4),
            param_y: cols.string(5),
            display_x: cols.string(6),
            display_y: cols.string(7),
            num_events: cols.int(8),
            max_num_events: cols.int(9).unwrap_or(0),
            sampling_method: cols.int(10).unwrap_or(0),
            node_key: cols.string(11),
        })
    }

    /// Clave de caché calculada a partir del eco de la petición.
    pub fn cache_key(&self) -> String {
        plot_cache_key(
            &self.code,
            &self.param_x,
            &self.param_y,
            self.max_num_events,
            &self.display_x,
            &self.display_y,
            self.sampling_method,
        )
    }

    /// Sólo se muestran los errores; un gráfico correcto limpia el estado.
    pub fn status(&self) -> Option<(String, StatusLevel)> {
        (!self.success).then(|| {
            (
                format!("Sorry, there was an error: \"{}\".", self.message),
                StatusLevel::Danger,
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRequest {
    pub collection_perm_id: String,
    pub exp_sample_perm_id: String,
}

impl UpgradeRequest {
    pub fn to_parameters(&self) -> Parameters {
        to_parameters(json!({
            "collectionPermId": self.collection_perm_id,
            "expSamplePermId": self.exp_sample_perm_id,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeOutcome {
    pub success: bool,
    pub message: String,
}

impl UpgradeOutcome {
    pub fn from_row(row: &[Cell]) -> Result<Self, JobError> {
        let cols = Columns::new(row, 2)?;
        Ok(Self {
            success: cols.flag(0)?,
            message: cols.string(1),
        })
    }

    pub fn status(&self) -> (String, StatusLevel) {
        if self.success {
            (self.message.clone(), StatusLevel::Success)
        } else {
            (
                format!("Sorry, there was an error: \"{}\".", self.message),
                StatusLevel::Danger,
            )
        }
    }
}

fn to_parameters(value: Value) -> Parameters {
    match value {
        Value::Object(map) => map,
        _ => Parameters::new(),
    }
}
