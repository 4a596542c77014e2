//! Inspect command implementation.

use super::{CliResult, Format, Workspace};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Summary of a state directory.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// State directory.
    pub path: String,
    /// Signed-in identity at the last sign-in.
    pub last_identity: Option<String>,
    /// Provisioned partition names, if provisioning ran.
    pub provisioned_partitions: Option<Vec<String>>,
    /// Change token per partition, hex-encoded.
    pub change_tokens: BTreeMap<String, String>,
    /// Records waiting for a remote delete.
    pub pending_deletions: Vec<String>,
    /// Cached snapshots per record type.
    pub cached_records: BTreeMap<String, usize>,
}

/// Collects the summary of the state directory at `path`.
pub fn collect(path: &Path) -> CliResult<InspectResult> {
    let workspace = Workspace::open(path)?;
    let state = workspace.state.snapshot();

    Ok(InspectResult {
        path: path.display().to_string(),
        last_identity: state.last_identity.map(|identity| identity.to_string()),
        provisioned_partitions: state
            .provisioned_partitions
            .map(|names| names.into_iter().collect()),
        change_tokens: state
            .change_tokens
            .iter()
            .map(|(partition, token)| (partition.to_string(), token.to_string()))
            .collect(),
        pending_deletions: state
            .pending_deletions
            .iter()
            .map(|id| id.to_string())
            .collect(),
        cached_records: workspace.cache.counts_by_type(),
    })
}

/// Runs the inspect command.
pub fn run(path: &Path, format: Format) -> CliResult<()> {
    let result = collect(path)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Stratus Sync State");
    println!("==================");
    println!();
    println!("Path:     {}", result.path);
    println!(
        "Identity: {}",
        result.last_identity.as_deref().unwrap_or("(none)")
    );
    match &result.provisioned_partitions {
        Some(names) => println!("Provisioned partitions: {}", names.join(", ")),
        None => println!("Provisioned partitions: (not provisioned)"),
    }
    println!();

    println!("Change tokens ({}):", result.change_tokens.len());
    for (partition, token) in &result.change_tokens {
        println!("  {partition:<24} {token}");
    }
    println!();

    println!("Pending deletions ({}):", result.pending_deletions.len());
    for id in &result.pending_deletions {
        println!("  {id}");
    }
    println!();

    let total: usize = result.cached_records.values().sum();
    println!("Cached records ({total}):");
    for (record_type, count) in &result.cached_records {
        println!("  {record_type:<24} {count}");
    }
}
