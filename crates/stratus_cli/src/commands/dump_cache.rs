//! Dump cache command implementation.

use super::{CliResult, Format, Workspace};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use stratus_engine::CachedSnapshot;
use stratus_protocol::FieldValue;

/// A cached snapshot prepared for output.
#[derive(Debug, Serialize)]
pub struct SnapshotInfo {
    /// Record identifier.
    pub id: String,
    /// Record type.
    pub record_type: String,
    /// Server change tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_tag: Option<String>,
    /// Last server modification, RFC 3339.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
    /// When the snapshot was cached, RFC 3339.
    pub cached_at: String,
    /// Field values.
    pub fields: BTreeMap<String, String>,
}

impl From<&CachedSnapshot> for SnapshotInfo {
    fn from(snapshot: &CachedSnapshot) -> Self {
        let record = &snapshot.record;
        Self {
            id: record.id.to_string(),
            record_type: record.record_type.clone(),
            change_tag: record.change_tag.clone(),
            modified_at: record.modified_at.map(|t| t.to_rfc3339()),
            cached_at: snapshot.cached_at.to_rfc3339(),
            fields: record
                .fields
                .iter()
                .map(|(name, value)| (name.clone(), render(value)))
                .collect(),
        }
    }
}

fn render(value: &FieldValue) -> String {
    match value {
        FieldValue::Text(text) => format!("{text:?}"),
        FieldValue::Reference(id) => format!("-> {id}"),
        FieldValue::List(items) => {
            let items: Vec<String> = items.iter().map(render).collect();
            format!("[{}]", items.join(", "))
        }
        other => format!("{other:?}"),
    }
}

/// Lists cached snapshots, optionally of one record type only.
pub fn collect(
    path: &Path,
    record_type: Option<&str>,
    limit: Option<usize>,
) -> CliResult<Vec<SnapshotInfo>> {
    let workspace = Workspace::open(path)?;
    let snapshots = match record_type {
        Some(record_type) => workspace.cache.all(record_type),
        None => workspace.cache.snapshots(),
    };
    Ok(snapshots
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(SnapshotInfo::from)
        .collect())
}

/// Runs the dump-cache command.
pub fn run(
    path: &Path,
    record_type: Option<&str>,
    limit: Option<usize>,
    format: Format,
) -> CliResult<()> {
    let snapshots = collect(path, record_type, limit)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&snapshots)?),
        Format::Text => print_text_output(&snapshots),
    }
    Ok(())
}

fn print_text_output(snapshots: &[SnapshotInfo]) {
    println!("Cached Records ({} shown)", snapshots.len());
    println!("==============");
    println!();

    for snapshot in snapshots {
        print!("{} [{}]", snapshot.id, snapshot.record_type);
        if let Some(tag) = &snapshot.change_tag {
            print!(" tag={tag}");
        }
        println!();
        for (name, value) in &snapshot.fields {
            println!("    {name} = {value}");
        }
    }
}
