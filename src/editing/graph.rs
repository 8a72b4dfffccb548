//! Dependency validation for the steps of a correction set.
//!
//! Structural checks (duplicate order, self-dependency, dangling reference)
//! are collected for every step before anything is reported. Cycle detection
//! only runs once the structure is sound, since a dangling or duplicated
//! order makes the edge set ambiguous.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use stepwright_common::CorrectionSet;

/// What is wrong with a step (or one of its fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationKind {
    DuplicateOrder,
    SelfDependency,
    UnknownDependency { depends_on: u32 },
    /// Orders along the cycle, starting and ending at the same step.
    Cycle { path: Vec<u32> },
    DuplicateFieldOrder { sort_order: u32 },
}

/// A single violation, keyed by the offending step's position in the set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub position: usize,
    pub step_order: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_index: Option<usize>,
    #[serde(flatten)]
    pub kind: ViolationKind,
}

impl Violation {
    pub fn step(position: usize, step_order: u32, kind: ViolationKind) -> Self {
        Self {
            position,
            step_order,
            field_index: None,
            kind,
        }
    }

    pub fn field(position: usize, step_order: u32, field_index: usize, kind: ViolationKind) -> Self {
        Self {
            position,
            step_order,
            field_index: Some(field_index),
            kind,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step #{} (order {})", self.position, self.step_order)?;
        if let Some(idx) = self.field_index {
            write!(f, ", field #{}", idx)?;
        }
        match &self.kind {
            ViolationKind::DuplicateOrder => write!(f, ": step_order is used by another step"),
            ViolationKind::SelfDependency => write!(f, ": step depends on itself"),
            ViolationKind::UnknownDependency { depends_on } => {
                write!(f, ": depends on unknown step order {}", depends_on)
            }
            ViolationKind::Cycle { path } => {
                let rendered: Vec<String> = path.iter().map(|o| o.to_string()).collect();
                write!(f, ": dependency cycle {}", rendered.join(" -> "))
            }
            ViolationKind::DuplicateFieldOrder { sort_order } => {
                write!(f, ": sort_order {} is used by another field", sort_order)
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// Validate `(step_order, depends_on_step_order)` pairs.
///
/// Empty input is valid.
pub fn validate_dependencies(edges: &[(u32, Option<u32>)]) -> Result<(), Vec<Violation>> {
    let mut violations = Vec::new();

    let mut index_map: HashMap<u32, usize> = HashMap::new();
    for (position, &(order, _)) in edges.iter().enumerate() {
        if index_map.contains_key(&order) {
            violations.push(Violation::step(position, order, ViolationKind::DuplicateOrder));
        } else {
            index_map.insert(order, position);
        }
    }

    for (position, &(order, depends_on)) in edges.iter().enumerate() {
        let Some(dep) = depends_on else { continue };
        if dep == order {
            violations.push(Violation::step(position, order, ViolationKind::SelfDependency));
        } else if !index_map.contains_key(&dep) {
            violations.push(Violation::step(
                position,
                order,
                ViolationKind::UnknownDependency { depends_on: dep },
            ));
        }
    }

    if !violations.is_empty() {
        violations.sort_by_key(|v| v.position);
        return Err(violations);
    }

    // Structure is sound: every dependency resolves to exactly one position.
    let adjacency: Vec<Option<usize>> = edges
        .iter()
        .map(|&(_, dep)| dep.and_then(|d| index_map.get(&d).copied()))
        .collect();

    let mut marks = vec![Mark::Unvisited; edges.len()];
    let mut stack = Vec::new();
    for start in 0..edges.len() {
        if marks[start] == Mark::Unvisited {
            visit(start, &adjacency, edges, &mut marks, &mut stack, &mut violations);
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

fn visit(
    node: usize,
    adjacency: &[Option<usize>],
    edges: &[(u32, Option<u32>)],
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
    violations: &mut Vec<Violation>,
) {
    marks[node] = Mark::Visiting;
    stack.push(node);

    if let Some(next) = adjacency[node] {
        match marks[next] {
            Mark::Unvisited => visit(next, adjacency, edges, marks, stack, violations),
            Mark::Visiting => {
                let from = stack.iter().position(|&n| n == next).unwrap_or(0);
                let mut path: Vec<u32> = stack[from..].iter().map(|&n| edges[n].0).collect();
                path.push(edges[next].0);
                violations.push(Violation::step(next, edges[next].0, ViolationKind::Cycle { path }));
            }
            Mark::Visited => {}
        }
    }

    stack.pop();
    marks[node] = Mark::Visited;
}

/// Full confirm-time validation of a document: dependency graph plus
/// duplicate field `sort_order` within each step. All violations are
/// returned together, ordered by step position.
pub fn validate_correction_set(set: &CorrectionSet) -> Result<(), Vec<Violation>> {
    let mut violations = match validate_dependencies(&set.dependency_edges()) {
        Ok(()) => Vec::new(),
        Err(v) => v,
    };

    for (position, step) in set.steps.iter().enumerate() {
        let mut seen = HashMap::new();
        for (field_index, field) in step.fields.iter().enumerate() {
            if seen.insert(field.sort_order, field_index).is_some() {
                violations.push(Violation::field(
                    position,
                    step.step_order,
                    field_index,
                    ViolationKind::DuplicateFieldOrder {
                        sort_order: field.sort_order,
                    },
                ));
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        violations.sort_by_key(|v| (v.position, v.field_index));
        Err(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwright_common::{Field, Step};

    #[test]
    fn test_empty_input_is_valid() {
        assert!(validate_dependencies(&[]).is_ok());
    }

    #[test]
    fn test_fan_out_from_root_is_valid() {
        assert!(validate_dependencies(&[(1, None), (2, Some(1)), (3, Some(1))]).is_ok());
    }

    #[test]
    fn test_chain_declared_out_of_order_is_valid() {
        assert!(validate_dependencies(&[(3, Some(2)), (1, None), (2, Some(1))]).is_ok());
    }

    #[test]
    fn test_two_cycle_is_rejected() {
        let errs = validate_dependencies(&[(1, Some(2)), (2, Some(1))]).unwrap_err();
        assert_eq!(errs.len(), 1);
        match &errs[0].kind {
            ViolationKind::Cycle { path } => {
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&1) && path.contains(&2));
            }
            other => panic!("Expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_longer_cycle_behind_a_tail_is_rejected() {
        // 0 -> 1 -> 2 -> 3 -> 1
        let errs =
            validate_dependencies(&[(0, Some(1)), (1, Some(2)), (2, Some(3)), (3, Some(1))])
                .unwrap_err();
        assert_eq!(errs.len(), 1);
        match &errs[0].kind {
            ViolationKind::Cycle { path } => assert_eq!(path, &vec![1, 2, 3, 1]),
            other => panic!("Expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_dangling_reference_is_rejected() {
        let errs = validate_dependencies(&[(1, None), (2, Some(99))]).unwrap_err();
        assert_eq!(
            errs,
            vec![Violation::step(1, 2, ViolationKind::UnknownDependency { depends_on: 99 })]
        );
        assert!(errs[0].to_string().contains("99"));
    }

    #[test]
    fn test_duplicate_order_is_rejected() {
        let errs = validate_dependencies(&[(1, None), (1, None)]).unwrap_err();
        assert_eq!(errs, vec![Violation::step(1, 1, ViolationKind::DuplicateOrder)]);
    }

    #[test]
    fn test_self_dependency_is_rejected() {
        let errs = validate_dependencies(&[(0, None), (4, Some(4))]).unwrap_err();
        assert_eq!(errs, vec![Violation::step(1, 4, ViolationKind::SelfDependency)]);
    }

    #[test]
    fn test_structural_violations_are_collected_not_fail_fast() {
        let errs =
            validate_dependencies(&[(1, Some(1)), (1, None), (2, Some(50)), (3, Some(2))])
                .unwrap_err();
        let kinds: Vec<_> = errs.iter().map(|v| (v.position, v.kind.clone())).collect();
        assert_eq!(
            kinds,
            vec![
                (0, ViolationKind::SelfDependency),
                (1, ViolationKind::DuplicateOrder),
                (2, ViolationKind::UnknownDependency { depends_on: 50 }),
            ]
        );
    }

    #[test]
    fn test_cycle_check_skipped_when_structure_is_broken() {
        // A real cycle (1 <-> 2) next to a dangling reference: only the
        // structural violation is reported.
        let errs =
            validate_dependencies(&[(1, Some(2)), (2, Some(1)), (3, Some(9))]).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[0].kind, ViolationKind::UnknownDependency { .. }));
    }

    #[test]
    fn test_two_disjoint_cycles_are_both_reported() {
        let errs =
            validate_dependencies(&[(1, Some(2)), (2, Some(1)), (3, Some(4)), (4, Some(3))])
                .unwrap_err();
        assert_eq!(errs.len(), 2);
        assert!(errs.iter().all(|v| matches!(v.kind, ViolationKind::Cycle { .. })));
    }

    #[test]
    fn test_acyclic_iff_valid_over_small_graphs() {
        // Exhaustive over every dependency assignment for three steps with
        // orders 0..3: the validator accepts exactly the acyclic ones.
        let choices = [None, Some(0u32), Some(1), Some(2)];
        for a in choices {
            for b in choices {
                for c in choices {
                    let deps = [a, b, c];
                    if deps.iter().enumerate().any(|(i, d)| *d == Some(i as u32)) {
                        continue;
                    }
                    let edges: Vec<(u32, Option<u32>)> =
                        deps.iter().enumerate().map(|(i, d)| (i as u32, *d)).collect();
                    let acyclic = (0..3).all(|start| {
                        let mut cur = Some(start as u32);
                        for _ in 0..4 {
                            cur = cur.and_then(|n| deps[n as usize]);
                        }
                        cur.is_none()
                    });
                    assert_eq!(validate_dependencies(&edges).is_ok(), acyclic, "{:?}", edges);
                }
            }
        }
    }

    #[test]
    fn test_duplicate_field_sort_order_is_reported_with_graph_violations() {
        let set = CorrectionSet::new(vec![
            Step {
                step_order: 0,
                fields: vec![
                    Field { sort_order: 0, ..Default::default() },
                    Field { sort_order: 0, ..Default::default() },
                ],
                ..Default::default()
            },
            Step {
                step_order: 1,
                depends_on_step_order: Some(7),
                ..Default::default()
            },
        ]);
        let errs = validate_correction_set(&set).unwrap_err();
        assert_eq!(errs.len(), 2);
        assert_eq!(errs[0].field_index, Some(1));
        assert!(matches!(errs[0].kind, ViolationKind::DuplicateFieldOrder { sort_order: 0 }));
        assert!(matches!(errs[1].kind, ViolationKind::UnknownDependency { depends_on: 7 }));
    }

    #[test]
    fn test_violation_serializes_flat() {
        let v = Violation::step(2, 5, ViolationKind::UnknownDependency { depends_on: 9 });
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["kind"], "unknown_dependency");
        assert_eq!(json["depends_on"], 9);
        assert_eq!(json["position"], 2);
        assert!(json.get("field_index").is_none());
    }
}
