use crate::database::Database;
use crate::error::Result;
use crate::export;
use crate::paths::RepoRoot;
use crate::record::{merge_record_lists, normalize_record, NormalizedRecord};
use crate::resources::extract_resources;
use serde_json::{Map, Value};
use std::path::Path;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestSummary {
    pub records_in: usize,
    pub records_out: usize,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ResourcesSummary {
    pub workflow_rows: usize,
    pub images_updated: usize,
    pub resources_inserted: usize,
}

fn to_map(rec: &NormalizedRecord) -> Result<Map<String, Value>> {
    match serde_json::to_value(rec)? {
        Value::Object(map) => Ok(map),
        _ => unreachable!("a struct record serializes to an object"),
    }
}

/// Full ingest pass: normalize every raw ExifTool object, store the batch
/// in SQLite, then rewrite the JSONL/CSV exports merged with any previous
/// run so fields discovered earlier are not lost.
pub fn run_ingest(
    db: &Database,
    root: &RepoRoot,
    in_jsonl: &Path,
    out_jsonl: &Path,
    out_csv: &Path,
) -> Result<IngestSummary> {
    let raw_objects = export::load_jsonl(in_jsonl)?;
    let records: Vec<NormalizedRecord> = raw_objects
        .iter()
        .map(|obj| normalize_record(obj, root))
        .collect();

    db.upsert_records(&records)?;

    let new_maps: Vec<Map<String, Value>> =
        records.iter().map(to_map).collect::<Result<Vec<_>>>()?;

    let old_jsonl = export::load_jsonl(out_jsonl)?;
    let old_csv = export::load_csv(out_csv)?;

    let merged_jsonl = merge_record_lists(new_maps.clone(), old_jsonl);
    let merged_csv = merge_record_lists(new_maps, old_csv.clone());

    let mut column_basis = old_csv;
    column_basis.extend(merged_csv.iter().cloned());
    let columns = export::compute_csv_columns(&column_basis);

    export::write_jsonl(out_jsonl, &merged_jsonl)?;
    export::write_csv(out_csv, &merged_csv, &columns)?;

    log::info!(
        "ingested {} records, exports now hold {}",
        records.len(),
        merged_csv.len()
    );
    Ok(IngestSummary {
        records_in: records.len(),
        records_out: merged_csv.len(),
    })
}

/// Resource pass over the stored workflows: every image's resources are
/// rebuilt from its `workflow_json`, so re-running never accumulates
/// duplicates. `limit` of zero means no limit.
pub fn run_resources_pass(db: &Database, limit: usize) -> Result<ResourcesSummary> {
    let rows = db.workflow_json_rows(limit)?;
    let mut summary = ResourcesSummary {
        workflow_rows: rows.len(),
        ..Default::default()
    };

    for (image_id, v_json) in rows {
        let Ok(workflow) = serde_json::from_str::<Value>(&v_json) else {
            log::warn!("image {image_id}: stored workflow_json is not valid JSON, skipped");
            continue;
        };

        let extracted = extract_resources(&workflow);
        db.replace_resources(&image_id, &extracted)?;

        if !extracted.is_empty() {
            summary.images_updated += 1;
            summary.resources_inserted += extracted.len();
        }
    }

    Ok(summary)
}
