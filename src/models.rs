//! Modelos de dominio: entidades devueltas por openBIS y nodos del árbol del visor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Propiedad de openBIS con el nombre visible de una muestra.
pub const NAME_PROPERTY: &str = "$NAME";

/// Tipos de experimento que admiten adquisición en placas.
const PLATE_CAPABLE_EXPERIMENTS: &[&str] = &["LSR_FORTESSA_EXPERIMENT"];

/// Fichero FCS ya resuelto: nombre y URL de descarga en el DSS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FcsFileRef {
    pub url: String,
    pub filename: String,
}

/// Clase de una entidad, asignada una sola vez en el adaptador de openBIS.
/// El árbol trabaja siempre sobre esta etiqueta cerrada, nunca sobre la
/// presencia o ausencia de campos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityKind {
    Experiment,
    Plate,
    Tubeset,
    Well,
    Tube,
    Specimen,
    FcsFile(FcsFileRef),
    Unknown,
}

impl EntityKind {
    /// Clasifica un código de tipo de muestra (`<PREFIJO>_PLATE`, ...).
    ///
    /// Los datasets `<PREFIJO>_FCSFILE` no se clasifican aquí: sólo pasan a
    /// `FcsFile` cuando se conoce su fichero (ver [`Entity::into_fcs_file`]).
    pub fn classify(prefix: &str, type_code: &str) -> Self {
        let Some(suffix) = type_code
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('_'))
        else {
            return Self::Unknown;
        };

        match suffix {
            "EXPERIMENT" => Self::Experiment,
            "PLATE" => Self::Plate,
            "TUBESET" => Self::Tubeset,
            "WELL" => Self::Well,
            "TUBE" => Self::Tube,
            "SPECIMEN" => Self::Specimen,
            _ => Self::Unknown,
        }
    }
}

/// Prefijo del instrumento a partir del tipo de experimento
/// (`LSR_FORTESSA_EXPERIMENT` -> `LSR_FORTESSA`).
pub fn experiment_prefix(experiment_type_code: &str) -> &str {
    match experiment_type_code.find("_EXPERIMENT") {
        Some(idx) => &experiment_type_code[..idx],
        None => experiment_type_code,
    }
}

pub fn supports_plate_acquisition(experiment_type_code: &str) -> bool {
    PLATE_CAPABLE_EXPERIMENTS.contains(&experiment_type_code)
}

/// Instantánea inmutable de un objeto de openBIS (muestra o dataset).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub perm_id: String,
    pub code: String,
    pub type_code: String,
    #[serde(flatten)]
    pub kind: EntityKind,
    pub name: String,
    /// Colección (experimento de openBIS) a la que pertenece la muestra.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_perm_id: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<Entity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Entity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_sets: Vec<Entity>,
}

impl Entity {
    /// Construye una entidad y la clasifica con el prefijo del instrumento.
    /// El nombre visible es `$NAME` o, si falta, el código.
    pub fn new(
        prefix: &str,
        perm_id: impl Into<String>,
        code: impl Into<String>,
        type_code: impl Into<String>,
        properties: BTreeMap<String, String>,
    ) -> Self {
        let code = code.into();
        let type_code = type_code.into();
        let name = properties
            .get(NAME_PROPERTY)
            .cloned()
            .unwrap_or_else(|| code.clone());

        Self {
            perm_id: perm_id.into(),
            kind: EntityKind::classify(prefix, &type_code),
            code,
            type_code,
            name,
            collection_perm_id: None,
            properties,
            parents: Vec::new(),
            children: Vec::new(),
            data_sets: Vec::new(),
        }
    }

    /// Marca la entidad como fichero FCS resuelto.
    pub fn into_fcs_file(mut self, file: FcsFileRef) -> Self {
        self.kind = EntityKind::FcsFile(file);
        self
    }

    /// Primer padre de tipo espécimen, si existe.
    pub fn specimen_parent(&self) -> Option<&Entity> {
        self.parents
            .iter()
            .find(|p| matches!(p.kind, EntityKind::Specimen))
    }
}

/// Tipo de nodo en el árbol. Se serializa con las etiquetas que espera el
/// widget del frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[serde(rename = "EXPERIMENT_SAMPLE")]
    Experiment,
    #[serde(rename = "ALL_PLATES")]
    PlateContainer,
    #[serde(rename = "TUBESET")]
    Tubeset,
    #[serde(rename = "PLATE")]
    Plate,
    #[serde(rename = "WELL")]
    Well,
    #[serde(rename = "TUBE")]
    Tube,
    #[serde(rename = "SPECIMEN")]
    Specimen,
    #[serde(rename = "FCS")]
    FcsFile,
    #[serde(rename = "EMPTY")]
    Empty,
}

/// Estado de la última carga perezosa de un nodo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Ok,
    Error { tooltip: String, info: String },
}

/// Unidad de visualización del árbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub title: String,
    pub icon: String,
    pub is_container: bool,
    pub is_lazy: bool,
    pub node_type: NodeType,
    #[serde(default)]
    pub exp_code: Option<String>,
    #[serde(default)]
    pub unselectable: bool,
    #[serde(default)]
    pub entity: Option<Entity>,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn new(title: impl Into<String>, icon: &str, node_type: NodeType) -> Self {
        Self {
            title: title.into(),
            icon: icon.to_string(),
            is_container: false,
            is_lazy: false,
            node_type,
            exp_code: None,
            unselectable: false,
            entity: None,
            status: NodeStatus::Ok,
            children: Vec::new(),
        }
    }

    pub fn experiment(entity: Entity) -> Self {
        Self {
            is_container: true,
            exp_code: Some(entity.code.clone()),
            ..Self::new(entity.name.clone(), "experiment.png", NodeType::Experiment)
        }
        .with_entity(entity)
    }

    /// Contenedor perezoso "Plates" / "Tubes" bajo el experimento.
    pub fn folder(title: &str, node_type: NodeType, exp_code: Option<String>) -> Self {
        Self {
            is_container: true,
            is_lazy: true,
            exp_code,
            ..Self::new(title, "folder.png", node_type)
        }
    }

    pub fn plate(entity: Entity, exp_code: Option<String>) -> Self {
        Self {
            is_container: true,
            is_lazy: true,
            exp_code,
            ..Self::new(entity.name.clone(), "plate.png", NodeType::Plate)
        }
        .with_entity(entity)
    }

    pub fn well(entity: Entity, exp_code: Option<String>) -> Self {
        Self {
            is_container: true,
            is_lazy: true,
            exp_code,
            ..Self::new(entity.name.clone(), "well.png", NodeType::Well)
        }
        .with_entity(entity)
    }

    pub fn tube(entity: Entity, exp_code: Option<String>) -> Self {
        Self {
            is_container: true,
            is_lazy: true,
            exp_code,
            ..Self::new(entity.name.clone(), "tube.png", NodeType::Tube)
        }
        .with_entity(entity)
    }

    /// Nodo sintético que agrupa pocillos/tubos de un mismo espécimen.
    pub fn specimen(name: &str, exp_code: Option<String>) -> Self {
        Self {
            is_container: true,
            exp_code,
            ..Self::new(name, "specimen.png", NodeType::Specimen)
        }
    }

    pub fn fcs_file(entity: Entity, filename: &str, exp_code: Option<String>) -> Self {
        Self {
            exp_code,
            ..Self::new(filename, "fcs.png", NodeType::FcsFile)
        }
        .with_entity(entity)
    }

    /// Marcador "none": la carga funcionó pero no hay datos.
    pub fn empty() -> Self {
        Self {
            unselectable: true,
            ..Self::new("<i>none</i>", "empty.png", NodeType::Empty)
        }
    }

    fn with_entity(mut self, entity: Entity) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn set_ok_status(&mut self) {
        self.status = NodeStatus::Ok;
    }

    pub fn set_error_status(&mut self, tooltip: impl Into<String>, info: impl Into<String>) {
        self.status = NodeStatus::Error {
            tooltip: tooltip.into(),
            info: info.into(),
        };
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, NodeStatus::Error { .. })
    }

    pub fn perm_id(&self) -> Option<&str> {
        self.entity.as_ref().map(|e| e.perm_id.as_str())
    }
}
