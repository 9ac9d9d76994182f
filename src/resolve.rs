use crate::database::{Database, ModelVersionRow};
use crate::error::Result;
use crate::resources::merge_extra;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

static RE_MVID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^modelVersionId:(\d+)$").expect("valid mvid regex"));

/// Folds ecosystem spellings of a resource type into the normalized kinds
/// used by the `resources` table.
pub fn norm_kind(x: &str) -> Option<&'static str> {
    let s = x.trim().to_lowercase();
    if s.is_empty() {
        return None;
    }

    match s.as_str() {
        "checkpoint" | "model" | "ckpt" => return Some("checkpoint"),
        "lora" | "locon" | "lycoris" => return Some("lora"),
        "embedding" | "textualinversion" | "textual inversion" | "ti" => return Some("embedding"),
        "vae" => return Some("vae"),
        "controlnet" => return Some("controlnet"),
        "upscaler" => return Some("upscaler"),
        _ => {}
    }

    if s.contains("lora") || s.contains("lycoris") || s.contains("locon") {
        return Some("lora");
    }
    if s.contains("embed") || s.contains("textual") || s.contains("inversion") {
        return Some("embedding");
    }
    if s.contains("vae") {
        return Some("vae");
    }
    if s.contains("control") && s.contains("net") {
        return Some("controlnet");
    }
    if s.contains("upscal") {
        return Some("upscaler");
    }
    if s.contains("checkpoint") || s.contains("ckpt") {
        return Some("checkpoint");
    }

    None
}

fn looks_sha256(s: &str) -> bool {
    let s = s.trim();
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Best-effort sha256 from the shapes seen in exports:
/// `{"sha256": ...}`, `{"hashes": {"SHA256": ...}}`, or a bare `hash`
/// field that passes the 64-hex check. Always lowercased.
pub fn pick_sha256(obj: &Value) -> Option<String> {
    let map = obj.as_object()?;

    let direct = ["sha256", "SHA256"]
        .iter()
        .find_map(|k| map.get(*k).and_then(Value::as_str).filter(|s| looks_sha256(s)));
    if let Some(s) = direct {
        return Some(s.trim().to_lowercase());
    }

    if let Some(hashes) = map.get("hashes").and_then(Value::as_object) {
        let nested = ["sha256", "SHA256"]
            .iter()
            .find_map(|k| hashes.get(*k).and_then(Value::as_str).filter(|s| looks_sha256(s)));
        if let Some(s) = nested {
            return Some(s.trim().to_lowercase());
        }
    }

    map.get("hash")
        .and_then(Value::as_str)
        .filter(|s| looks_sha256(s))
        .map(|s| s.trim().to_lowercase())
}

/// Merges a patch into a possibly pre-existing `extra_json` column value.
/// Unparseable existing text is preserved under `_raw_extra_json` rather
/// than dropped; conflicts accumulate into lists.
pub fn merge_extra_json(existing: Option<&str>, patch: &Map<String, Value>) -> String {
    let mut base: Map<String, Value> = match existing {
        None => Map::new(),
        Some(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                let mut m = Map::new();
                m.insert("_raw_extra_json".to_string(), Value::String(text.to_string()));
                m
            }
        },
    };

    merge_extra(&mut base, patch);
    serde_json::to_string(&base).unwrap_or_else(|_| "{}".to_string())
}

fn mvid_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn item_str<'a>(item: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| {
        item.get(*k)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    })
}

fn extra_with_source(item: &Map<String, Value>, source: &str) -> Option<String> {
    let mut extra = item.clone();
    extra.insert("source".to_string(), Value::String(source.to_string()));
    serde_json::to_string(&extra).ok()
}

/// Imports model-version rows from a manual mapping file.
///
/// JSON: a list of objects (or one of the common `items`/`data`/`models`/
/// `versions` wrappers) with `model_version_id`, `kind`, `name`, `urn`,
/// `sha256`. CSV: the same columns, extras ignored. Returns the number of
/// rows imported.
pub fn import_manual_map(db: &Database, path: &Path) -> Result<usize> {
    let is_csv = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase() == "csv")
        .unwrap_or(false);

    if is_csv {
        return import_manual_csv(db, path);
    }

    let root: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
    let items: Vec<&Map<String, Value>> = match &root {
        Value::Array(list) => list.iter().filter_map(Value::as_object).collect(),
        Value::Object(map) => ["items", "data", "models", "versions"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_array))
            .map(|list| list.iter().filter_map(Value::as_object).collect())
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    let mut imported = 0;
    for item in items {
        let Some(mvid) = ["model_version_id", "modelVersionId", "id"]
            .iter()
            .find_map(|k| item.get(*k).and_then(mvid_i64))
        else {
            continue;
        };

        let kind = item_str(item, &["kind", "type"]).and_then(norm_kind);
        let name = item_str(item, &["name", "displayName", "title"]);
        let urn = item_str(item, &["urn"]);
        let sha = pick_sha256(&Value::Object(item.clone()))
            .or_else(|| item.get("file").and_then(|f| pick_sha256(f)))
            .or_else(|| item.get("files").and_then(|f| pick_sha256(f)));

        db.upsert_model_version(&ModelVersionRow {
            model_version_id: mvid,
            kind: kind.map(str::to_string),
            name: name.map(str::to_string),
            urn: urn.map(str::to_string),
            sha256: sha,
            extra_json: extra_with_source(item, "manual_json"),
        })?;
        imported += 1;
    }

    log::info!("imported {imported} model versions from manual map");
    Ok(imported)
}

fn import_manual_csv(db: &Database, path: &Path) -> Result<usize> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let col = |name: &str| headers.iter().position(|h| h == name);

    let idx_mvid = col("model_version_id").or_else(|| col("modelVersionId")).or_else(|| col("mvid"));
    let idx_kind = col("kind");
    let idx_name = col("name");
    let idx_urn = col("urn");
    let idx_sha = col("sha256");

    let mut imported = 0;
    for row in reader.records() {
        let row = row?;
        let field = |idx: Option<usize>| {
            idx.and_then(|i| row.get(i))
                .map(str::trim)
                .filter(|s| !s.is_empty())
        };

        let Some(mvid) = field(idx_mvid).and_then(|s| s.parse::<i64>().ok()) else {
            continue;
        };

        db.upsert_model_version(&ModelVersionRow {
            model_version_id: mvid,
            kind: field(idx_kind).and_then(norm_kind).map(str::to_string),
            name: field(idx_name).map(str::to_string),
            urn: field(idx_urn).map(str::to_string),
            sha256: field(idx_sha).map(str::to_lowercase),
            extra_json: Some(json!({"source": "manual_csv"}).to_string()),
        })?;
        imported += 1;
    }

    log::info!("imported {imported} model versions from manual CSV");
    Ok(imported)
}

fn iter_dicts_deep<'a>(x: &'a Value, out: &mut Vec<&'a Map<String, Value>>) {
    match x {
        Value::Object(map) => {
            out.push(map);
            for v in map.values() {
                iter_dicts_deep(v, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                iter_dicts_deep(item, out);
            }
        }
        _ => {}
    }
}

const VERSION_EVIDENCE_KEYS: &[&str] =
    &["files", "trainedWords", "baseModel", "downloadUrl", "images"];

fn has_version_evidence(d: &Map<String, Value>) -> bool {
    VERSION_EVIDENCE_KEYS.iter().any(|k| d.contains_key(*k))
}

/// Imports model versions from a bulk export dump of unknown layout by
/// walking every dict in the document.
///
/// A dict qualifies when it carries an explicit `modelVersionId`, wraps a
/// `modelVersion` object with an `id`, or has a bare integer `id` next to
/// version-record evidence (`files`, `trainedWords`, `baseModel`, ...).
/// The first dict seen for each id wins.
pub fn import_export_dump(db: &Database, path: &Path) -> Result<usize> {
    let root: Value = serde_json::from_str(&fs::read_to_string(path)?)?;

    let mut dicts = Vec::new();
    iter_dicts_deep(&root, &mut dicts);

    let mut imported = 0;
    let mut seen: std::collections::HashSet<i64> = std::collections::HashSet::new();

    for dict in dicts {
        let mut d = dict;
        let mvid = match d.get("modelVersionId").and_then(mvid_i64) {
            Some(id) => Some(id),
            None => match d.get("modelVersion").and_then(Value::as_object) {
                Some(mv) => mv.get("id").and_then(mvid_i64).inspect(|_| d = mv),
                None => d
                    .get("id")
                    .filter(|v| v.is_i64())
                    .and_then(mvid_i64)
                    .filter(|_| has_version_evidence(d)),
            },
        };
        let Some(mvid) = mvid else { continue };

        if !seen.insert(mvid) {
            continue;
        }

        let kind = item_str(d, &["type", "modelType", "kind"]).and_then(norm_kind);
        let name = item_str(d, &["name", "title"]).or_else(|| {
            d.get("model")
                .and_then(Value::as_object)
                .and_then(|m| m.get("name"))
                .and_then(Value::as_str)
        });

        let urn = item_str(d, &["urn"]).map(str::to_string).or_else(|| {
            let model_id = d
                .get("model")
                .and_then(Value::as_object)
                .and_then(|m| m.get("id"))
                .and_then(mvid_i64)
                .or_else(|| d.get("modelId").and_then(mvid_i64));
            Some(match model_id {
                Some(mid) => format!("urn:civitai:model:{mid}:version:{mvid}"),
                None => format!("urn:civitai:modelVersion:{mvid}"),
            })
        });

        let sha = d
            .get("files")
            .and_then(Value::as_array)
            .and_then(|files| files.iter().find_map(pick_sha256))
            .or_else(|| pick_sha256(&Value::Object(d.clone())));

        db.upsert_model_version(&ModelVersionRow {
            model_version_id: mvid,
            kind: kind.map(str::to_string),
            name: name.map(str::to_string),
            urn,
            sha256: sha,
            extra_json: extra_with_source(d, "export_dump_best_effort"),
        })?;
        imported += 1;
    }

    log::info!("imported {imported} model versions from export dump");
    Ok(imported)
}

/// Rewrites `resource_ref` rows whose model version id is present in the
/// lookup table into resolved resources, keeping the original reference
/// in `extra_json` for traceability. Unresolved rows are left untouched.
/// Returns `(rows_scanned, rows_rewritten)`.
pub fn rewrite_resources(db: &Database) -> Result<(usize, usize)> {
    let rows = db.resource_ref_rows()?;
    let scanned = rows.len();
    let mut rewritten = 0;

    for row in rows {
        let Some(name) = row.name.as_deref() else {
            continue;
        };
        let Some(caps) = RE_MVID.captures(name.trim()) else {
            continue;
        };
        let Ok(mvid) = caps[1].parse::<i64>() else {
            continue;
        };

        let Some(mv) = db.model_version(mvid)? else {
            continue; // unresolved, leave as-is
        };

        let resolved_kind = mv.kind.as_deref().unwrap_or("unknown");
        let resolved_name = mv
            .urn
            .as_deref()
            .or(mv.name.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| format!("modelVersionId:{mvid}"));
        let resolved_hash = mv.sha256.as_deref().or(row.hash.as_deref());

        let trace = json!({
            "resource_ref": {
                "original_kind": row.kind,
                "original_name": row.name,
                "original_hash": row.hash,
                "model_version_id": mvid,
            }
        });
        let patch = trace.as_object().cloned().unwrap_or_default();
        let new_extra = merge_extra_json(row.extra_json.as_deref(), &patch);

        db.rewrite_resource_row(row.rowid, resolved_kind, &resolved_name, resolved_hash, &new_extra)?;
        rewritten += 1;
    }

    log::info!("resource_ref rows scanned: {scanned}, rewritten: {rewritten}");
    Ok((scanned, rewritten))
}
