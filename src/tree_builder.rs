//! Conversión de los resultados de openBIS en nodos del árbol del visor.
//!
//! Pocillos y tubos se agrupan bajo un nodo sintético por espécimen; el resto
//! de entidades se añade tal cual. No hay E/S: todo es síncrono y puro salvo
//! la mutación del nodo padre en [`add_to_tree`].

use std::cmp::Ordering;

use indexmap::map::Entry;
use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::lims::LimsError;
use crate::models::{Entity, EntityKind, NodeType, TreeNode};

const FETCH_ERROR_INFO: &str = "Error retrieving information.";
const UNEXPECTED_TYPE_INFO: &str = "Unexpected element type!";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("tipo de elemento inesperado: {type_code}")]
    UnexpectedType { type_code: String },
}

/// Posición en la salida: un nodo ya construido o el hueco del siguiente
/// espécimen (en orden de primera aparición).
enum Slot {
    Node(TreeNode),
    Specimen,
}

/// Construye los hijos de `parent` a partir de una lista plana de entidades.
///
/// Una lista vacía bajo "Plates" o "Tubes" produce el marcador `none`; bajo
/// cualquier otro nodo, nada. Un tipo desconocido aborta todo el lote.
pub fn build_children(entities: &[Entity], parent: &TreeNode) -> Result<Vec<TreeNode>, TreeError> {
    if entities.is_empty() {
        return Ok(match parent.node_type {
            NodeType::PlateContainer | NodeType::Tubeset => vec![TreeNode::empty()],
            _ => Vec::new(),
        });
    }

    let exp_code = parent.exp_code.clone();
    let mut slots = Vec::with_capacity(entities.len());
    let mut specimens: IndexMap<String, TreeNode> = IndexMap::new();

    for entity in entities {
        match &entity.kind {
            EntityKind::Plate => slots.push(Slot::Node(TreeNode::plate(entity.clone(), exp_code.clone()))),
            // Contenedor estructural: nunca se muestra.
            EntityKind::Tubeset => {}
            EntityKind::Well | EntityKind::Tube => {
                // Sin espécimen se agrupa bajo el nombre vacío.
                let key = entity
                    .specimen_parent()
                    .map(|specimen| specimen.name.clone())
                    .unwrap_or_default();

                let specimen = match specimens.entry(key) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        slots.push(Slot::Specimen);
                        let node = TreeNode::specimen(entry.key(), exp_code.clone());
                        entry.insert(node)
                    }
                };

                let child = if entity.kind == EntityKind::Well {
                    TreeNode::well(entity.clone(), exp_code.clone())
                } else {
                    TreeNode::tube(entity.clone(), exp_code.clone())
                };
                specimen.children.push(child);
            }
            EntityKind::FcsFile(file) => slots.push(Slot::Node(TreeNode::fcs_file(
                entity.clone(),
                &file.filename,
                exp_code.clone(),
            ))),
            EntityKind::Experiment | EntityKind::Specimen | EntityKind::Unknown => {
                return Err(TreeError::UnexpectedType {
                    type_code: entity.type_code.clone(),
                });
            }
        }
    }

    let mut specimens = specimens.into_values();
    Ok(slots
        .into_iter()
        .filter_map(|slot| match slot {
            Slot::Node(node) => Some(node),
            Slot::Specimen => specimens.next(),
        })
        .collect())
}

/// Aplica el resultado de una carga perezosa sobre `parent`: estado de error
/// si la carga o la conversión fallan, y si no, hijos añadidos y ordenados.
pub fn add_to_tree(parent: &mut TreeNode, result: Result<Vec<Entity>, LimsError>) {
    let entities = match result {
        Ok(entities) => entities,
        Err(err) => {
            warn!("Error cargando hijos de '{}': {err}", parent.title);
            parent.set_error_status(err.tooltip(), FETCH_ERROR_INFO);
            return;
        }
    };

    match build_children(&entities, parent) {
        Ok(children) => {
            debug!("'{}': {} nodos nuevos", parent.title, children.len());
            attach_children(parent, children);
        }
        Err(TreeError::UnexpectedType { type_code }) => {
            warn!("Tipo de elemento inesperado bajo '{}': {type_code}", parent.title);
            parent.set_error_status(type_code, UNEXPECTED_TYPE_INFO);
        }
    }
}

/// Sustituye los hijos de `parent`, lo marca como OK y los ordena. Volver a
/// expandir un nodo ya cargado no duplica nada.
pub fn attach_children(parent: &mut TreeNode, children: Vec<TreeNode>) {
    parent.set_ok_status();
    parent.children = children;
    sort_children(parent);
}

/// Orden natural estable sobre los títulos ("Well 2" < "Well 10").
/// Los hijos de cada espécimen conservan el orden de llegada.
pub fn sort_children(parent: &mut TreeNode) {
    parent.children.sort_by(|a, b| natural_cmp(&a.title, &b.title));
}

/// Distingue mayúsculas: "B" va antes que "a".
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    lexical_sort::natural_cmp(a, b)
}

/// Árbol inicial: el experimento, expandido, con los contenedores perezosos
/// "Plates" (sólo si el instrumento adquiere en placas) y "Tubes".
pub fn experiment_root(experiment: Entity, supports_plates: bool) -> TreeNode {
    let mut root = TreeNode::experiment(experiment);
    let exp_code = root.exp_code.clone();
    if supports_plates {
        root.children
            .push(TreeNode::folder("Plates", NodeType::PlateContainer, exp_code.clone()));
    }
    root.children
        .push(TreeNode::folder("Tubes", NodeType::Tubeset, exp_code));
    root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FcsFileRef, NodeStatus, NAME_PROPERTY};
    use std::collections::BTreeMap;

    const PREFIX: &str = "LSR_FORTESSA";

    fn sample(perm_id: &str, suffix: &str, name: &str) -> Entity {
        let props = BTreeMap::from([(NAME_PROPERTY.to_string(), name.to_string())]);
        Entity::new(PREFIX, perm_id, perm_id, format!("{PREFIX}_{suffix}"), props)
    }

    fn well(perm_id: &str, name: &str, specimen: Option<&str>) -> Entity {
        let mut w = sample(perm_id, "WELL", name);
        if let Some(s) = specimen {
            w.parents.push(sample(&format!("SP-{s}"), "SPECIMEN", s));
        }
        w
    }

    fn tube(perm_id: &str, name: &str, specimen: &str) -> Entity {
        let mut t = sample(perm_id, "TUBE", name);
        // El experimento también es padre; el espécimen no tiene por qué ser el primero.
        t.parents.push(sample("EXP", "EXPERIMENT", "Exp"));
        t.parents.push(sample(&format!("SP-{specimen}"), "SPECIMEN", specimen));
        t
    }

    fn fcs(perm_id: &str, filename: &str) -> Entity {
        let props = BTreeMap::new();
        Entity::new(PREFIX, perm_id, perm_id, format!("{PREFIX}_FCSFILE"), props).into_fcs_file(FcsFileRef {
            url: format!("https://dss/{filename}"),
            filename: filename.to_string(),
        })
    }

    fn parent(node_type: NodeType) -> TreeNode {
        TreeNode::folder("parent", node_type, Some("EXP1".into()))
    }

    fn titles(nodes: &[TreeNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.title.as_str()).collect()
    }

    #[test]
    fn empty_plate_container_gets_placeholder() {
        let children = build_children(&[], &parent(NodeType::PlateContainer)).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].node_type, NodeType::Empty);
        assert!(children[0].unselectable);
        assert!(!children[0].is_lazy);
    }

    #[test]
    fn empty_plate_gets_nothing() {
        let plate_node = TreeNode::plate(sample("P1", "PLATE", "Plate 1"), None);
        assert!(build_children(&[], &plate_node).unwrap().is_empty());
    }

    #[test]
    fn wells_with_same_specimen_share_one_group() {
        let entities = vec![well("W1", "B2", Some("Blood")), well("W2", "A1", Some("Blood"))];
        let children = build_children(&entities, &parent(NodeType::Plate)).unwrap();

        assert_eq!(children.len(), 1);
        let specimen = &children[0];
        assert_eq!(specimen.node_type, NodeType::Specimen);
        assert_eq!(specimen.title, "Blood");
        assert!(specimen.entity.is_none());
        assert!(!specimen.is_lazy);
        // Orden de llegada, no alfabético.
        assert_eq!(titles(&specimen.children), vec!["B2", "A1"]);
        assert!(specimen.children.iter().all(|c| c.is_lazy && c.is_container));
    }

    #[test]
    fn specimen_sits_at_first_occurrence() {
        let entities = vec![
            fcs("F1", "first.fcs"),
            tube("T1", "Tube 1", "Liver"),
            fcs("F2", "second.fcs"),
            tube("T2", "Tube 2", "Blood"),
            tube("T3", "Tube 3", "Liver"),
        ];
        let children = build_children(&entities, &parent(NodeType::Tubeset)).unwrap();

        assert_eq!(titles(&children), vec!["first.fcs", "Liver", "second.fcs", "Blood"]);
        assert_eq!(titles(&children[1].children), vec!["Tube 1", "Tube 3"]);
        assert_eq!(titles(&children[3].children), vec!["Tube 2"]);

        // Cada tubo aparece bajo exactamente un espécimen.
        let grouped: usize = children.iter().map(|c| c.children.len()).sum();
        assert_eq!(grouped, 3);
    }

    #[test]
    fn well_without_specimen_is_grouped_under_empty_name() {
        let entities = vec![well("W1", "A1", None), well("W2", "A2", None)];
        let children = build_children(&entities, &parent(NodeType::Plate)).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].title, "");
        assert_eq!(children[0].children.len(), 2);
    }

    #[test]
    fn tubesets_are_skipped_and_plates_are_lazy() {
        let entities = vec![sample("TS", "TUBESET", "Tubeset"), sample("P1", "PLATE", "Plate 1")];
        let children = build_children(&entities, &parent(NodeType::PlateContainer)).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].node_type, NodeType::Plate);
        assert!(children[0].is_lazy);
        assert_eq!(children[0].exp_code.as_deref(), Some("EXP1"));
    }

    #[test]
    fn fcs_files_are_leaves_titled_by_filename() {
        let children = build_children(&[fcs("F1", "A1.fcs")], &parent(NodeType::Well)).unwrap();
        assert_eq!(children[0].node_type, NodeType::FcsFile);
        assert_eq!(children[0].title, "A1.fcs");
        assert!(!children[0].is_lazy);
        assert!(!children[0].is_container);
    }

    #[test]
    fn unknown_type_sets_error_and_adds_nothing() {
        let mut node = parent(NodeType::Plate);
        let mut odd = sample("X", "WELL", "X");
        odd.type_code = "MICROSCOPY_IMAGE".into();
        odd.kind = EntityKind::Unknown;

        add_to_tree(&mut node, Ok(vec![well("W1", "A1", Some("Blood")), odd]));

        assert!(node.children.is_empty());
        assert_eq!(
            node.status,
            NodeStatus::Error {
                tooltip: "MICROSCOPY_IMAGE".into(),
                info: "Unexpected element type!".into(),
            }
        );
    }

    #[test]
    fn fetch_error_sets_error_without_children() {
        let mut node = parent(NodeType::Tubeset);
        add_to_tree(&mut node, Err(LimsError::Transport("connection refused".into())));
        assert!(node.is_error());
        assert!(node.children.is_empty());
    }

    #[test]
    fn children_are_sorted_naturally() {
        let mut node = parent(NodeType::PlateContainer);
        let plates = vec![
            sample("P10", "PLATE", "Well 10"),
            sample("P2", "PLATE", "Well 2"),
            sample("P1", "PLATE", "Well 1"),
        ];
        add_to_tree(&mut node, Ok(plates));
        assert_eq!(titles(&node.children), vec!["Well 1", "Well 2", "Well 10"]);
        assert_eq!(node.status, NodeStatus::Ok);
    }

    #[test]
    fn natural_order_of_titles() {
        let mut items = vec!["Well 10", "Well 2", "Well 1"];
        items.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(items, vec!["Well 1", "Well 2", "Well 10"]);
        assert_eq!(natural_cmp("Tube 9", "Tube 10"), Ordering::Less);
    }

    #[test]
    fn natural_order_is_case_sensitive() {
        let mut items = vec!["b", "Tube 10", "a", "tube 2", "B", "Tube 1", "A"];
        items.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(items, vec!["A", "B", "Tube 1", "Tube 10", "a", "b", "tube 2"]);
    }

    #[test]
    fn expanding_twice_does_not_duplicate_children() {
        let mut node = parent(NodeType::PlateContainer);
        let plates = vec![sample("P2", "PLATE", "Plate 2"), sample("P1", "PLATE", "Plate 1")];
        add_to_tree(&mut node, Ok(plates.clone()));
        add_to_tree(&mut node, Ok(plates));
        assert_eq!(titles(&node.children), vec!["Plate 1", "Plate 2"]);
    }

    #[test]
    fn same_input_builds_identical_trees() {
        let entities = vec![
            tube("T2", "Tube 2", "Blood"),
            tube("T1", "Tube 1", "Blood"),
            tube("T3", "Tube 3", "Liver"),
        ];
        let mut first = parent(NodeType::Tubeset);
        let mut second = parent(NodeType::Tubeset);
        add_to_tree(&mut first, Ok(entities.clone()));
        add_to_tree(&mut second, Ok(entities));
        assert_eq!(first, second);
    }

    #[test]
    fn root_has_plates_only_when_supported() {
        let exp = sample("E1", "EXPERIMENT", "My experiment");
        let with_plates = experiment_root(exp.clone(), true);
        let tubes_only = experiment_root(exp, false);

        assert_eq!(titles(&with_plates.children), vec!["Plates", "Tubes"]);
        assert_eq!(titles(&tubes_only.children), vec!["Tubes"]);
        assert_eq!(with_plates.title, "My experiment");
        assert!(!with_plates.is_lazy);
        assert!(with_plates.children.iter().all(|c| c.is_lazy));
    }
}
