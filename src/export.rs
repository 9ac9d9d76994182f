use crate::error::Result;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Fixed leading columns of the records CSV; extra top-level fields found
/// in the records are appended after these, sorted.
pub const CSV_COLUMNS: &[&str] = &[
    "id",
    "source_file",
    "file_name",
    "ext",
    "width",
    "height",
    "format_hint",
    "model",
    "sampler",
    "scheduler",
    "steps",
    "cfg_scale",
    "seed",
    "prompt",
    "negative_prompt",
];

/// Fields too bulky or structured for a spreadsheet row.
const CSV_EXCLUDED: &[&str] = &["kv", "resources", "workflow_json", "raw_text_preview"];

pub fn compute_csv_columns(records: &[Map<String, Value>]) -> Vec<String> {
    let mut extra: BTreeSet<String> = BTreeSet::new();
    for rec in records {
        for k in rec.keys() {
            if !CSV_COLUMNS.contains(&k.as_str()) && !CSV_EXCLUDED.contains(&k.as_str()) {
                extra.insert(k.clone());
            }
        }
    }
    CSV_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(extra)
        .collect()
}

fn value_to_cell(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    }
}

pub fn write_csv(csv_path: &Path, records: &[Map<String, Value>], columns: &[String]) -> Result<()> {
    if let Some(parent) = csv_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(csv_path)?;
    writer.write_record(columns)?;
    for rec in records {
        let row: Vec<String> = columns.iter().map(|c| value_to_cell(rec.get(c))).collect();
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_jsonl(jsonl_path: &Path, records: &[Map<String, Value>]) -> Result<()> {
    if let Some(parent) = jsonl_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(jsonl_path)?);
    for rec in records {
        let line = serde_json::to_string(rec)?;
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Loads JSONL records as JSON maps. Malformed lines are logged and
/// skipped; a missing file is just an empty batch.
pub fn load_jsonl(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let mut out = Vec::new();
    if !path.exists() {
        return Ok(out);
    }
    let reader = BufReader::new(File::open(path)?);
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim_start_matches('\u{feff}').trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => out.push(map),
            Ok(_) => {
                log::warn!("{}:{}: JSONL line is not an object, skipped", path.display(), lineno + 1);
            }
            Err(e) => {
                log::warn!("{}:{}: malformed JSONL line skipped: {}", path.display(), lineno + 1, e);
            }
        }
    }
    Ok(out)
}

/// Loads a previously written records CSV back into string-valued maps,
/// the way a spreadsheet round-trip would see it.
pub fn load_csv(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let mut out = Vec::new();
    if !path.exists() {
        return Ok(out);
    }
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    for row in reader.records() {
        let row = row?;
        let mut rec = Map::new();
        for (header, field) in headers.iter().zip(row.iter()) {
            rec.insert(header.to_string(), Value::String(field.to_string()));
        }
        out.push(rec);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn columns_are_fixed_set_plus_sorted_extras() {
        let records = vec![
            rec(&[("id", json!("1")), ("zeta", json!(1)), ("kv", json!({}))]),
            rec(&[("id", json!("2")), ("alpha", json!(2)), ("workflow_json", json!({}))]),
        ];
        let columns = compute_csv_columns(&records);
        assert_eq!(columns.len(), CSV_COLUMNS.len() + 2);
        assert_eq!(&columns[..CSV_COLUMNS.len()], CSV_COLUMNS.iter().map(|c| c.to_string()).collect::<Vec<_>>().as_slice());
        assert_eq!(&columns[CSV_COLUMNS.len()..], ["alpha", "zeta"]);
    }

    #[test]
    fn csv_round_trip_preserves_cells() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("records.csv");
        let records = vec![rec(&[
            ("id", json!("abc")),
            ("source_file", json!("input/a.png")),
            ("steps", json!(30)),
            ("prompt", json!("a cat, (fluffy:1.2)")),
        ])];
        let columns = compute_csv_columns(&records);
        write_csv(&path, &records, &columns).expect("write");

        let loaded = load_csv(&path).expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0]["id"], json!("abc"));
        assert_eq!(loaded[0]["steps"], json!("30"));
        assert_eq!(loaded[0]["prompt"], json!("a cat, (fluffy:1.2)"));
    }

    #[test]
    fn jsonl_round_trip_and_malformed_line_skipping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("records.jsonl");
        let records = vec![
            rec(&[("id", json!("1")), ("seed", json!(42))]),
            rec(&[("id", json!("2"))]),
        ];
        write_jsonl(&path, &records).expect("write");

        // Corrupt the file with a bad line in the middle.
        let mut text = fs::read_to_string(&path).expect("read");
        text.push_str("{not json\n");
        fs::write(&path, text).expect("rewrite");

        let loaded = load_jsonl(&path).expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0]["seed"], json!(42));
    }

    #[test]
    fn missing_files_load_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load_jsonl(&dir.path().join("nope.jsonl")).expect("jsonl").is_empty());
        assert!(load_csv(&dir.path().join("nope.csv")).expect("csv").is_empty());
    }
}
