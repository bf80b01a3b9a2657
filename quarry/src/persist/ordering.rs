//! Insertion ordering: Kahn's algorithm over the foreign-key edges between
//! subjects of one operation. A cycle is broken at a nullable relation by
//! deferring that foreign key to a post-insert UPDATE; a cycle with no
//! nullable edge is a hard error.

use std::sync::Arc;

use crate::entity::{same_instance, snapshot};
use crate::error::{QuarryError, QuarryResult};
use crate::metadata::MetadataRegistry;
use crate::persist::subject::{Subject, SubjectOperation};

pub struct InsertionPlan {
    /// Indexes into the subject slice, parents before dependents.
    pub order: Vec<usize>,
    /// (subject index, relation property) foreign keys that must be
    /// written after the insert wave because their edge broke a cycle.
    pub deferred: Vec<(usize, String)>,
}

struct Edge {
    /// Subject that must be inserted first.
    parent: usize,
    /// Subject whose foreign key references the parent.
    dependent: usize,
    relation_property: String,
    nullable: bool,
}

/// Order the insert subjects so that every foreign key target exists before
/// the row referencing it.
pub fn insertion_order(
    registry: &Arc<MetadataRegistry>,
    subjects: &[Subject],
) -> QuarryResult<InsertionPlan> {
    let inserts: Vec<usize> = subjects
        .iter()
        .enumerate()
        .filter(|(_, s)| s.operation == SubjectOperation::Insert)
        .map(|(i, _)| i)
        .collect();

    let mut edges: Vec<Edge> = Vec::new();
    for &i in &inserts {
        let subject = &subjects[i];
        let metadata = registry.get(subject.metadata);
        let instance = snapshot(&subject.entity);
        for relation in &metadata.relations {
            if !relation.is_owning
                || relation.join_columns.is_empty()
                || !instance.has_relation(&relation.property_name)
            {
                continue;
            }
            let Some(related) = instance.relation_one(&relation.property_name) else {
                continue;
            };
            let parent = inserts
                .iter()
                .copied()
                .find(|&j| same_instance(&subjects[j].entity, &related));
            if let Some(parent) = parent {
                if parent != i {
                    edges.push(Edge {
                        parent,
                        dependent: i,
                        relation_property: relation.property_name.clone(),
                        nullable: relation.is_nullable,
                    });
                }
            }
        }
    }

    let mut order = Vec::with_capacity(inserts.len());
    let mut deferred = Vec::new();
    let mut placed = vec![false; subjects.len()];
    let mut active: Vec<bool> = vec![true; edges.len()];

    while order.len() < inserts.len() {
        let mut progressed = false;
        for &i in &inserts {
            if placed[i] {
                continue;
            }
            let blocked = edges.iter().enumerate().any(|(e, edge)| {
                active[e] && edge.dependent == i && !placed[edge.parent]
            });
            if !blocked {
                placed[i] = true;
                order.push(i);
                progressed = true;
            }
        }
        if progressed {
            continue;
        }
        // Every remaining subject is blocked: break one nullable edge and
        // schedule its foreign key for after the wave.
        let breakable = edges.iter().enumerate().find(|(e, edge)| {
            active[*e] && edge.nullable && !placed[edge.dependent] && !placed[edge.parent]
        });
        match breakable {
            Some((e, _)) => {
                active[e] = false;
                deferred.push((edges[e].dependent, edges[e].relation_property.clone()));
            }
            None => {
                let entities: Vec<String> = inserts
                    .iter()
                    .filter(|&&i| !placed[i])
                    .map(|&i| registry.get(subjects[i].metadata).name.clone())
                    .collect();
                return Err(QuarryError::CyclicDependency { entities });
            }
        }
    }
    Ok(InsertionPlan { order, deferred })
}
