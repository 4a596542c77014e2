//! Deferred linking of references between local entities.

use crate::error::SyncResult;
use crate::local::{EntityTxn, LocalId};
use std::collections::HashMap;
use stratus_protocol::RecordId;
use tracing::{debug, warn};

/// A reference that could not be linked yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEdge {
    /// Entity holding the reference.
    pub source: LocalId,
    /// Relationship field on the source.
    pub field: String,
    /// Remote identifier of the referenced record.
    pub target: RecordId,
}

/// Outcome of [`ReferenceConnector::connect_unresolved`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectReport {
    /// Edges linked in this pass.
    pub resolved: usize,
    /// Edges whose source entity no longer exists.
    pub dropped: usize,
    /// Edges whose target never arrived; kept for the next pass.
    pub orphaned: Vec<PendingEdge>,
}

/// Links reference fields to local entities, deferring the ones whose
/// target has not been downloaded yet.
#[derive(Debug, Default)]
pub struct ReferenceConnector {
    unresolved: HashMap<RecordId, Vec<(LocalId, String)>>,
}

impl ReferenceConnector {
    /// Creates a connector with nothing queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Links `source.field` to the entity for `target`, or queues the edge.
    ///
    /// Returns true if the edge was linked immediately. Any older queued
    /// edge for the same source field is replaced.
    pub fn connect(
        &mut self,
        txn: &mut dyn EntityTxn,
        source: LocalId,
        field: &str,
        target: &RecordId,
    ) -> SyncResult<bool> {
        self.forget_edge(source, field);

        if link(txn, source, field, target)? {
            return Ok(true);
        }
        debug!(source = %source, field, target = %target, "deferring unresolved reference");
        self.unresolved
            .entry(target.clone())
            .or_default()
            .push((source, field.to_string()));
        Ok(false)
    }

    /// Retries every queued edge against the local store.
    ///
    /// Edges that still cannot be linked are logged as orphaned and kept.
    pub fn connect_unresolved(&mut self, txn: &mut dyn EntityTxn) -> SyncResult<ConnectReport> {
        let mut report = ConnectReport::default();
        let mut remaining: HashMap<RecordId, Vec<(LocalId, String)>> = HashMap::new();

        for (target, edges) in std::mem::take(&mut self.unresolved) {
            for (source, field) in edges {
                if txn.get(source).is_none() {
                    report.dropped += 1;
                } else if link(txn, source, &field, &target)? {
                    report.resolved += 1;
                } else {
                    warn!(source = %source, field = %field, target = %target, "orphaned reference");
                    report.orphaned.push(PendingEdge {
                        source,
                        field: field.clone(),
                        target: target.clone(),
                    });
                    remaining.entry(target.clone()).or_default().push((source, field));
                }
            }
        }

        self.unresolved = remaining;
        Ok(report)
    }

    /// Drops every queued edge from a deleted entity.
    pub fn forget_source(&mut self, source: LocalId) {
        self.unresolved.retain(|_, edges| {
            edges.retain(|(s, _)| *s != source);
            !edges.is_empty()
        });
    }

    /// Returns the number of queued edges.
    pub fn pending(&self) -> usize {
        self.unresolved.values().map(Vec::len).sum()
    }

    fn forget_edge(&mut self, source: LocalId, field: &str) {
        self.unresolved.retain(|_, edges| {
            edges.retain(|(s, f)| !(*s == source && f == field));
            !edges.is_empty()
        });
    }
}

fn link(
    txn: &mut dyn EntityTxn,
    source: LocalId,
    field: &str,
    target: &RecordId,
) -> SyncResult<bool> {
    let Some(target_entity) = txn.find_by_remote_id(target) else {
        return Ok(false);
    };
    let Some(mut entity) = txn.get(source) else {
        return Ok(false);
    };
    if entity.relationships.get(field) != Some(&target_entity.local_id) {
        entity
            .relationships
            .insert(field.to_string(), target_entity.local_id);
        txn.update(entity)?;
    }
    Ok(true)
}
