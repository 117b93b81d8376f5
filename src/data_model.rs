//! Carga perezosa del árbol del experimento.
//!
//! Cada tipo de nodo sabe qué preguntar a openBIS para obtener sus hijos; el
//! resultado pasa siempre por `tree_builder::add_to_tree`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::lims::{LimsClient, LimsError, SampleFetch, SampleQuery};
use crate::models::{
    experiment_prefix, supports_plate_acquisition, Entity, FcsFileRef, NodeType, TreeNode,
};
use crate::tree_builder;

/// Muestra experimento sobre la que trabaja una sesión del visor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentContext {
    pub perm_id: String,
    pub type_code: String,
}

impl ExperimentContext {
    pub fn prefix(&self) -> &str {
        experiment_prefix(&self.type_code)
    }

    fn sample_type(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.prefix())
    }
}

/// Experimento cargado: árbol inicial y si su versión está desfasada.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentView {
    pub context: ExperimentContext,
    pub collection_perm_id: Option<String>,
    pub version: u32,
    pub needs_upgrade: bool,
    pub tree: TreeNode,
}

#[derive(Clone)]
pub struct DataModel {
    lims: Arc<dyn LimsClient>,
}

impl DataModel {
    pub fn new(lims: Arc<dyn LimsClient>) -> Self {
        Self { lims }
    }

    /// Carga la muestra experimento y construye el árbol inicial.
    pub async fn load_experiment(
        &self,
        identifier: &str,
        type_code: &str,
        latest_version: u32,
    ) -> Result<ExperimentView, LimsError> {
        let experiment = self
            .lims
            .find_experiment_sample(identifier, type_code)
            .await?
            .ok_or_else(|| LimsError::NotFound(identifier.to_string()))?;

        let prefix = experiment_prefix(type_code);
        let version = experiment
            .properties
            .get(&format!("{prefix}_EXPERIMENT_VERSION"))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        let collection_perm_id = experiment.collection_perm_id.clone();

        info!("Experimento '{}' ({type_code}) versión {version}", experiment.name);

        let context = ExperimentContext {
            perm_id: experiment.perm_id.clone(),
            type_code: type_code.to_string(),
        };
        Ok(ExperimentView {
            context,
            collection_perm_id,
            version,
            needs_upgrade: version < latest_version,
            tree: tree_builder::experiment_root(experiment, supports_plate_acquisition(type_code)),
        })
    }

    /// Rellena los hijos de `node` (o le pone estado de error).
    pub async fn fetch(&self, ctx: &ExperimentContext, mut node: TreeNode) -> TreeNode {
        debug!("Carga perezosa de '{}' ({:?})", node.title, node.node_type);

        let result = match node.node_type {
            NodeType::PlateContainer => self.plates(ctx).await,
            NodeType::Tubeset => self.tubes(ctx).await,
            NodeType::Plate => self.wells(ctx, &node).await,
            NodeType::Well | NodeType::Tube => self.fcs_files(ctx, &node).await,
            other => {
                node.set_error_status(
                    format!("Type was: {}", node_type_tag(other)),
                    "Unknown type for the selected node!",
                );
                return node;
            }
        };

        tree_builder::add_to_tree(&mut node, result);
        node
    }

    async fn plates(&self, ctx: &ExperimentContext) -> Result<Vec<Entity>, LimsError> {
        let query = SampleQuery {
            type_code: ctx.sample_type("PLATE"),
            parent_perm_id: ctx.perm_id.clone(),
            parent_type_code: ctx.type_code.clone(),
            with_children: false,
        };
        self.lims.search_samples(ctx.prefix(), &query).await
    }

    /// Los tubos son hijos del (único) tubeset del experimento.
    async fn tubes(&self, ctx: &ExperimentContext) -> Result<Vec<Entity>, LimsError> {
        let query = SampleQuery {
            type_code: ctx.sample_type("TUBESET"),
            parent_perm_id: ctx.perm_id.clone(),
            parent_type_code: ctx.type_code.clone(),
            with_children: true,
        };
        let tubesets = self.lims.search_samples(ctx.prefix(), &query).await?;
        Ok(tubesets
            .into_iter()
            .next()
            .map(|tubeset| tubeset.children)
            .unwrap_or_default())
    }

    async fn wells(&self, ctx: &ExperimentContext, node: &TreeNode) -> Result<Vec<Entity>, LimsError> {
        let plate = self.reload(ctx, node, SampleFetch::Children).await?;
        Ok(plate.children)
    }

    /// Ficheros `.fcs` del primer dataset del pocillo o tubo.
    async fn fcs_files(&self, ctx: &ExperimentContext, node: &TreeNode) -> Result<Vec<Entity>, LimsError> {
        let sample = self.reload(ctx, node, SampleFetch::DataSets).await?;
        let Some(dataset) = sample.data_sets.into_iter().next() else {
            return Ok(Vec::new());
        };

        let token = self.lims.session_token();
        let files = self.lims.search_dataset_files(&dataset.perm_id).await?;

        files
            .into_iter()
            .filter(|f| !f.is_directory && f.path.to_lowercase().contains(".fcs"))
            .map(|f| {
                let url = fcs_download_url(&f.download_url, &f.data_set_perm_id, &f.path, &token)?;
                Ok(dataset.clone().into_fcs_file(FcsFileRef {
                    url,
                    filename: file_name(&f.path).to_string(),
                }))
            })
            .collect()
    }

    async fn reload(
        &self,
        ctx: &ExperimentContext,
        node: &TreeNode,
        fetch: SampleFetch,
    ) -> Result<Entity, LimsError> {
        let perm_id = node
            .perm_id()
            .ok_or_else(|| LimsError::Malformed(format!("el nodo '{}' no tiene muestra asociada", node.title)))?;
        self.lims
            .get_sample(ctx.prefix(), perm_id, fetch)
            .await?
            .ok_or_else(|| LimsError::NotFound(perm_id.to_string()))
    }
}

fn node_type_tag(node_type: NodeType) -> String {
    serde_json::to_value(node_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{node_type:?}"))
}

/// Último segmento de la ruta; la ruta completa si termina en '/'.
fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) if idx + 1 < path.len() => &path[idx + 1..],
        _ => path,
    }
}

fn fcs_download_url(base: &str, data_set_perm_id: &str, path: &str, token: &str) -> Result<String, LimsError> {
    let mut url = Url::parse(&format!("{}/datastore_server/", base.trim_end_matches('/')))
        .map_err(|e| LimsError::Malformed(format!("URL del DSS inválida: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| LimsError::Malformed("URL del DSS sin ruta".into()))?
        .pop_if_empty()
        .push(data_set_perm_id)
        .extend(path.split('/'));
    url.query_pairs_mut().append_pair("sessionID", token);
    // Los '+' literales del nombre se confundirían con espacios.
    Ok(url.as_str().replace('+', "%2B"))
}
