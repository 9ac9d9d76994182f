use crate::a1111;
use crate::graph;
use crate::params::{normalize_sampler, normalize_scheduler, value_as_str, value_to_float, value_to_int};
use crate::paths::{sha256_file, stable_id_for_path, RepoRoot};
use crate::prompts::{enforce_pos_neg_separation, looks_like_a1111_text};
use crate::resources::Resource;
use crate::text::{clean_ws, tokenize_prompt};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

const RAW_TEXT_PREVIEW_LIMIT: usize = 2000;

/// EXIF tag names that commonly carry AI generation text or workflow JSON.
const TEXT_CANDIDATE_KEYS: &[&str] = &[
    "PNG:Parameters",
    "PNG:Comment",
    "PNG:Description",
    "PNG:Prompt",
    "PNG:Workflow",
    "PNG:Software",
    "PNG:Title",
    "PNG:TextualData",
    "PNG:RawProfileType",
    "PNG:RawProfileData",
    "XMP:Description",
    "XMP:Subject",
    "XMP:CreatorTool",
    "EXIF:UserComment",
    "ExifIFD:UserComment",
    "EXIF:ImageDescription",
    "EXIF:Software",
    "IPTC:Caption-Abstract",
    "IPTC:Keywords",
    "EXIF:DocumentName",
    "IFD0:ImageDescription",
    "IFD0:Software",
];

/// One normalized image record: identity, file facts, generation fields,
/// and the free-form `kv` map that mirrors the database key/value rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub id: String,
    pub source_file: String,
    pub file_name: Option<String>,
    pub ext: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub imported_utc: String,
    pub created_utc: Option<String>,
    pub sha256: Option<String>,
    pub format_hint: Option<String>,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub steps: Option<i64>,
    pub cfg_scale: Option<f64>,
    pub seed: Option<i64>,
    pub sampler: Option<String>,
    pub scheduler: Option<String>,
    pub model: Option<String>,
    pub raw_text_preview: Option<String>,
    pub workflow_json: Option<Value>,
    pub resources: Vec<Resource>,
    pub kv: Map<String, Value>,
}

pub fn utc_now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn is_probably_json(s: &str) -> bool {
    let s = s.trim();
    (s.starts_with('{') && s.ends_with('}')) || (s.starts_with('[') && s.ends_with(']'))
}

fn first_present<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| {
        obj.get(*k)
            .filter(|v| !v.is_null() && **v != Value::String(String::new()))
    })
}

/// Nonnegative integer values only: JSON integers, or strings of digits.
/// Floats like `832.0` do not qualify.
fn digit_int(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().filter(|i| *i >= 0),
        Value::String(s) => {
            let s = s.trim();
            if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
                s.parse::<i64>().ok()
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Collects `(tag, text)` candidates that may hold AI metadata: the known
/// tag list first, then any string tag of 30+ characters containing a
/// generation marker. Duplicate pairs are dropped, order preserved.
pub fn extract_candidate_blobs(exif_obj: &Map<String, Value>) -> Vec<(String, String)> {
    let mut blobs: Vec<(String, String)> = Vec::new();

    for k in TEXT_CANDIDATE_KEYS {
        if let Some(v) = exif_obj.get(*k).and_then(value_as_str) {
            blobs.push((k.to_string(), v.to_string()));
        }
    }

    const AI_MARKERS: &[&str] = &[
        "steps:",
        "sampler:",
        "cfg scale:",
        "negative prompt:",
        "comfyui",
        "workflow",
        "seed:",
    ];
    for (k, v) in exif_obj {
        let Some(s) = value_as_str(v) else { continue };
        if s.len() < 30 {
            continue;
        }
        let low = s.to_lowercase();
        if AI_MARKERS.iter().any(|m| low.contains(m)) {
            blobs.push((k.clone(), s.to_string()));
        }
    }

    let mut seen: HashSet<(String, String)> = HashSet::new();
    blobs
        .into_iter()
        .filter(|pair| seen.insert(pair.clone()))
        .collect()
}

const PROMPT_KEY_HINTS: &[&str] = &["prompt", "positive", "pos_prompt", "positive_prompt"];
const NEG_PROMPT_KEY_HINTS: &[&str] =
    &["negative prompt", "negative_prompt", "neg_prompt", "negprompt", "negative"];
const MODEL_KEY_HINTS: &[&str] = &["model", "checkpoint", "ckpt"];

fn key_has_any(lk: &str, hints: &[&str]) -> bool {
    hints.iter().any(|h| lk.contains(h))
}

/// `EXIF:Model` and friends are camera bodies, not diffusion checkpoints.
fn is_camera_model_key(lk: &str) -> bool {
    if !lk.ends_with(":model") {
        return false;
    }
    matches!(
        lk.split(':').next(),
        Some("exif") | Some("ifd0") | Some("quicktime")
    )
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct KeyedFields {
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub model: Option<String>,
    pub sampler: Option<String>,
    pub scheduler: Option<String>,
    pub steps: Option<i64>,
    pub cfg_scale: Option<f64>,
    pub seed: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

fn best_prompt_candidate(values: &[String]) -> Option<String> {
    values
        .iter()
        .filter(|v| !v.trim().is_empty())
        .map(|v| clean_ws(v))
        .filter(|v| !v.is_empty())
        .max_by_key(String::len)
}

/// Extracts field values straight from EXIF tag names (not A1111 blocks):
/// a tag whose name contains a field hint contributes its value. Prompt
/// sides collect candidates and keep the longest; everything else is
/// first match wins. `workflow` tags are skipped here, they are graph
/// material.
pub fn extract_keyed_fields(exif_obj: &Map<String, Value>) -> KeyedFields {
    let mut out = KeyedFields::default();
    let mut pos_candidates: Vec<String> = Vec::new();
    let mut neg_candidates: Vec<String> = Vec::new();

    for (k, v) in exif_obj {
        if v.is_null() || *v == Value::String(String::new()) {
            continue;
        }
        let lk = k.to_lowercase();
        if lk.contains("workflow") {
            continue;
        }

        if let Some(s) = v.as_str() {
            if key_has_any(&lk, NEG_PROMPT_KEY_HINTS) && lk.contains("prompt") {
                neg_candidates.push(s.to_string());
                continue;
            }
            if key_has_any(&lk, PROMPT_KEY_HINTS) {
                pos_candidates.push(s.to_string());
                continue;
            }

            if key_has_any(&lk, MODEL_KEY_HINTS) && !is_camera_model_key(&lk) {
                if out.model.is_none() {
                    out.model = Some(clean_ws(s));
                }
                continue;
            }
            if lk.contains("sampler") && out.sampler.is_none() {
                out.sampler = Some(clean_ws(s));
                continue;
            }
            if lk.contains("scheduler") && out.scheduler.is_none() {
                out.scheduler = Some(clean_ws(s));
                continue;
            }
            if lk.contains("steps") && out.steps.is_none() {
                out.steps = value_to_int(v);
                continue;
            }
            if key_has_any(&lk, &["cfg scale", "cfg_scale", "cfgscale", "cfg"])
                && out.cfg_scale.is_none()
            {
                // "config"-ish tags are app settings, never a cfg scale.
                if !lk.contains("config") {
                    out.cfg_scale = value_to_float(v);
                }
                continue;
            }
            if lk.contains("seed") && out.seed.is_none() {
                out.seed = value_to_int(v);
                continue;
            }
            if lk.contains("width") && out.width.is_none() {
                out.width = value_to_int(v);
                continue;
            }
            if lk.contains("height") && out.height.is_none() {
                out.height = value_to_int(v);
            }
        } else if v.is_number() {
            if lk.contains("steps") && out.steps.is_none() {
                out.steps = value_to_int(v);
            }
            if lk.contains("seed") && out.seed.is_none() {
                out.seed = value_to_int(v);
            }
            if lk.contains("width") && out.width.is_none() {
                out.width = value_to_int(v);
            }
            if lk.contains("height") && out.height.is_none() {
                out.height = value_to_int(v);
            }
            if key_has_any(&lk, &["cfg scale", "cfg_scale", "cfgscale", "cfg"])
                && out.cfg_scale.is_none()
                && !lk.contains("config")
            {
                out.cfg_scale = value_to_float(v);
            }
        }
    }

    out.prompt = best_prompt_candidate(&pos_candidates);
    out.negative_prompt = best_prompt_candidate(&neg_candidates);
    out
}

/// Fallback id for records with no usable source path: a digest of the
/// whole EXIF object, so re-running over the same input stays stable.
fn fallback_id(exif_obj: &Map<String, Value>) -> String {
    let serialized = serde_json::to_string(exif_obj).unwrap_or_default();
    let digest = Sha256::digest(serialized.as_bytes());
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

fn truncate_chars(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}

/// Builds a normalized record from one ExifTool JSON object.
///
/// Field precedence: embedded workflow JSON first, then A1111 parameter
/// text, then tag-name hints, each filling only fields still unset. The
/// node-graph prompt extraction runs last and overrides both prompt
/// sides, since graph text is the authoritative source when present.
pub fn normalize_record(exif_obj: &Map<String, Value>, root: &RepoRoot) -> NormalizedRecord {
    let src_raw = first_present(exif_obj, &["SourceFile", "File:FileName"])
        .and_then(Value::as_str)
        .unwrap_or_default();

    let (src, src_abs) = if src_raw.is_empty() {
        (String::new(), None)
    } else {
        root.resolve_relative(src_raw)
    };

    let file_name = if src.is_empty() {
        None
    } else {
        src.rsplit('/').next().map(str::to_string)
    };
    let ext = file_name.as_deref().and_then(|n| {
        n.rsplit_once('.')
            .map(|(_, e)| e.to_lowercase())
            .filter(|e| !e.is_empty())
    });

    let width = first_present(
        exif_obj,
        &["File:ImageWidth", "EXIF:ImageWidth", "PNG:ImageWidth", "QuickTime:ImageWidth"],
    )
    .and_then(digit_int);
    let height = first_present(
        exif_obj,
        &["File:ImageHeight", "EXIF:ImageHeight", "PNG:ImageHeight", "QuickTime:ImageHeight"],
    )
    .and_then(digit_int);

    let mut rec = NormalizedRecord {
        id: if src.is_empty() {
            fallback_id(exif_obj)
        } else {
            stable_id_for_path(&src)
        },
        source_file: src,
        file_name,
        ext,
        width,
        height,
        imported_utc: utc_now_iso(),
        created_utc: None,
        sha256: src_abs
            .as_deref()
            .filter(|p| p.is_file())
            .and_then(sha256_file),
        format_hint: None,
        prompt: None,
        negative_prompt: None,
        steps: None,
        cfg_scale: None,
        seed: None,
        sampler: None,
        scheduler: None,
        model: None,
        raw_text_preview: None,
        workflow_json: None,
        resources: Vec::new(),
        kv: Map::new(),
    };

    let blobs = extract_candidate_blobs(exif_obj);

    // Embedded JSON first (ComfyUI-like).
    for (_k, v) in &blobs {
        if !is_probably_json(v) {
            continue;
        }
        let Ok(obj) = serde_json::from_str::<Value>(v) else {
            continue;
        };
        let Some(comfy) = graph::extract_embedded(&obj) else {
            continue;
        };

        rec.format_hint = Some("comfyui_like".to_string());
        rec.kv
            .insert("workflow_json".to_string(), comfy.workflow_json.clone());
        rec.workflow_json = Some(comfy.workflow_json);

        if rec.seed.is_none() {
            rec.seed = comfy.seed;
        }
        if rec.steps.is_none() {
            rec.steps = comfy.steps;
        }
        if rec.width.is_none() {
            rec.width = comfy.width;
        }
        if rec.height.is_none() {
            rec.height = comfy.height;
        }
        if rec.cfg_scale.is_none() {
            rec.cfg_scale = comfy.cfg_scale;
        }
        if rec.sampler.is_none() {
            rec.sampler = comfy.sampler;
        }
        if rec.scheduler.is_none() {
            rec.scheduler = comfy.scheduler;
        }
        if rec.model.is_none() {
            rec.model = comfy.model;
        }
        if rec.prompt.is_none() {
            rec.prompt = comfy.prompt;
        }
        if rec.negative_prompt.is_none() {
            rec.negative_prompt = comfy.negative_prompt;
        }
        break;
    }

    // A1111-like parameters text, also when a workflow JSON exists.
    for (k, v) in &blobs {
        if is_probably_json(v) || k.to_lowercase().contains("workflow") {
            continue;
        }
        if !looks_like_a1111_text(v) {
            continue;
        }
        let parsed = a1111::parse_parameters(v);
        if rec.raw_text_preview.is_none() && !parsed.raw_text.is_empty() {
            rec.raw_text_preview = Some(parsed.raw_text);
        }
        if rec.format_hint.is_none() {
            rec.format_hint = Some("a1111_like".to_string());
        }
        if rec.prompt.is_none() {
            rec.prompt = parsed.prompt;
        }
        if rec.negative_prompt.is_none() {
            rec.negative_prompt = parsed.negative_prompt;
        }
        if rec.steps.is_none() {
            rec.steps = parsed.steps;
        }
        if rec.cfg_scale.is_none() {
            rec.cfg_scale = parsed.cfg_scale;
        }
        if rec.seed.is_none() {
            rec.seed = parsed.seed;
        }
        if rec.width.is_none() {
            rec.width = parsed.width;
        }
        if rec.height.is_none() {
            rec.height = parsed.height;
        }
        if rec.sampler.is_none() {
            rec.sampler = parsed.sampler;
        }
        if rec.scheduler.is_none() {
            rec.scheduler = parsed.scheduler;
        }
        if rec.model.is_none() {
            rec.model = parsed.model;
        }
        break;
    }

    // Tag-name hints fill whatever is still missing.
    let keyed = extract_keyed_fields(exif_obj);
    if rec.prompt.is_none() {
        rec.prompt = keyed.prompt;
    }
    if rec.negative_prompt.is_none() {
        rec.negative_prompt = keyed.negative_prompt;
    }
    if rec.model.is_none() {
        rec.model = keyed.model;
    }
    if rec.sampler.is_none() {
        rec.sampler = keyed.sampler;
    }
    if rec.scheduler.is_none() {
        rec.scheduler = keyed.scheduler;
    }
    if rec.steps.is_none() {
        rec.steps = keyed.steps;
    }
    if rec.cfg_scale.is_none() {
        rec.cfg_scale = keyed.cfg_scale;
    }
    if rec.seed.is_none() {
        rec.seed = keyed.seed;
    }
    if rec.width.is_none() {
        rec.width = keyed.width;
    }
    if rec.height.is_none() {
        rec.height = keyed.height;
    }

    // Node-graph prompt text beats everything found so far.
    if let Some(wf) = &rec.workflow_json {
        let (wf_prompt, wf_neg) = graph::extract_prompts(wf);
        if wf_prompt.is_some() {
            rec.prompt = wf_prompt;
        }
        if wf_neg.is_some() {
            rec.negative_prompt = wf_neg;
        }
    }

    if rec.raw_text_preview.is_none() {
        if let Some((_k, v)) = blobs.first() {
            rec.raw_text_preview = Some(truncate_chars(v, RAW_TEXT_PREVIEW_LIMIT));
        }
    }

    populate_kv(&mut rec);

    if let Some(software) =
        first_present(exif_obj, &["EXIF:Software", "PNG:Software", "XMP:CreatorTool"])
            .and_then(value_as_str)
    {
        rec.kv
            .insert("software".to_string(), Value::String(software.to_string()));
    }

    finalize_prompts_and_params(&mut rec);

    rec
}

fn populate_kv(rec: &mut NormalizedRecord) {
    let string_fields: [(&str, &Option<String>); 6] = [
        ("prompt", &rec.prompt),
        ("negative_prompt", &rec.negative_prompt),
        ("sampler", &rec.sampler),
        ("scheduler", &rec.scheduler),
        ("model", &rec.model),
        ("format_hint", &rec.format_hint),
    ];
    let mut inserts: Vec<(String, Value)> = Vec::new();
    for (key, value) in string_fields {
        if let Some(v) = value {
            if !v.is_empty() {
                inserts.push((key.to_string(), Value::String(v.clone())));
            }
        }
    }
    for (key, value) in inserts {
        rec.kv.insert(key, value);
    }

    if let Some(steps) = rec.steps {
        rec.kv.insert("steps".to_string(), json!(steps));
    }
    if let Some(cfg) = rec.cfg_scale {
        rec.kv.insert("cfg_scale".to_string(), json!(cfg));
    }
    if let Some(seed) = rec.seed {
        rec.kv.insert("seed".to_string(), json!(seed));
    }
    if let Some(width) = rec.width {
        rec.kv.insert("width".to_string(), json!(width));
    }
    if let Some(height) = rec.height {
        rec.kv.insert("height".to_string(), json!(height));
    }
    if let Some(ext) = &rec.ext {
        if !ext.is_empty() {
            rec.kv.insert("ext".to_string(), Value::String(ext.clone()));
        }
    }
}

/// Prompt separation, tokenization, and parameter normalization over a
/// built record. Adds the derived kv entries (`prompt_text`,
/// `prompt_tokens`, `sampler_norm`, `size_norm`, ...) and removes stale
/// ones when separation empties a prompt side.
pub fn finalize_prompts_and_params(rec: &mut NormalizedRecord) {
    let pos_src = rec
        .kv
        .get("prompt")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| rec.prompt.clone());
    let neg_src = rec
        .kv
        .get("negative_prompt")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| rec.negative_prompt.clone());

    let (pos, neg) = enforce_pos_neg_separation(pos_src.as_deref(), neg_src.as_deref());

    match pos {
        Some(p) => {
            rec.prompt = Some(p.clone());
            rec.kv.insert("prompt".to_string(), Value::String(p.clone()));
            rec.kv
                .insert("prompt_text".to_string(), Value::String(p.clone()));
            let tokens = serde_json::to_value(tokenize_prompt(&p)).unwrap_or(Value::Null);
            rec.kv.insert("prompt_tokens".to_string(), tokens);
        }
        None => {
            rec.prompt = None;
            rec.kv.remove("prompt");
            rec.kv.remove("prompt_text");
            rec.kv.remove("prompt_tokens");
        }
    }

    match neg {
        Some(n) => {
            rec.negative_prompt = Some(n.clone());
            rec.kv
                .insert("negative_prompt".to_string(), Value::String(n.clone()));
            rec.kv
                .insert("neg_prompt_text".to_string(), Value::String(n.clone()));
            let tokens = serde_json::to_value(tokenize_prompt(&n)).unwrap_or(Value::Null);
            rec.kv.insert("neg_tokens".to_string(), tokens);
        }
        None => {
            rec.negative_prompt = None;
            rec.kv.remove("negative_prompt");
            rec.kv.remove("neg_prompt_text");
            rec.kv.remove("neg_tokens");
        }
    }

    if let Some(s_norm) = rec.sampler.as_deref().and_then(normalize_sampler) {
        rec.kv
            .insert("sampler_norm".to_string(), Value::String(s_norm));
    }
    if let Some(sch_norm) = rec.scheduler.as_deref().and_then(normalize_scheduler) {
        rec.kv
            .insert("scheduler_norm".to_string(), Value::String(sch_norm));
    }

    if let Some(steps) = rec.steps {
        rec.kv.insert("steps_norm".to_string(), json!(steps));
    }
    if let Some(cfg) = rec.cfg_scale {
        rec.kv.insert("cfg_scale_norm".to_string(), json!(cfg));
    }
    if let Some(seed) = rec.seed {
        rec.kv.insert("seed_norm".to_string(), json!(seed));
    }
    if let (Some(w), Some(h)) = (rec.width, rec.height) {
        if w > 0 && h > 0 {
            rec.kv
                .insert("size_norm".to_string(), Value::String(format!("{w}x{h}")));
        }
    }
}

fn is_missing(v: &Value) -> bool {
    v.is_null() || *v == Value::String(String::new())
}

/// Fills absent or empty keys in `target` from `source`, recursing into
/// nested maps. Present values are never replaced.
pub fn merge_missing_values(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (k, v) in source {
        match target.get_mut(k) {
            Some(Value::Object(t_inner)) => {
                if let Value::Object(s_inner) = v {
                    merge_missing_values(t_inner, s_inner);
                }
            }
            Some(existing) if is_missing(existing) => {
                *existing = v.clone();
            }
            Some(_) => {}
            None => {
                target.insert(k.clone(), v.clone());
            }
        }
    }
}

fn normalize_key(value: Option<&str>) -> String {
    value
        .map(|v| v.replace('\\', "/").to_lowercase())
        .unwrap_or_default()
}

/// Merge key for a serialized record: normalized source path, falling
/// back to bare file name.
pub fn record_merge_key(rec: &Map<String, Value>) -> String {
    let primary = rec
        .get("source_file")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());
    let fallback = rec.get("file_name").and_then(Value::as_str);
    normalize_key(primary.or(fallback))
}

/// Merges a fresh batch of records with records from a previous run.
///
/// New records are matched to old ones by merge key (file-name fallback
/// included) and missing values are filled from the old record. Old
/// records with no counterpart in the new batch are kept, appended after
/// the new ones.
pub fn merge_record_lists(
    mut new_records: Vec<Map<String, Value>>,
    old_records: Vec<Map<String, Value>>,
) -> Vec<Map<String, Value>> {
    let mut old_key_order: Vec<String> = Vec::new();
    let mut old_by_key: HashMap<String, Map<String, Value>> = HashMap::new();
    let mut old_by_name: HashMap<String, Map<String, Value>> = HashMap::new();

    for r in old_records {
        let key = record_merge_key(&r);
        if !key.is_empty() {
            if !old_by_key.contains_key(&key) {
                old_key_order.push(key.clone());
            }
            old_by_key.insert(key, r.clone());
        }
        if let Some(name) = r.get("file_name").and_then(Value::as_str) {
            old_by_name.entry(name.to_string()).or_insert(r);
        }
    }

    for rec in &mut new_records {
        let key = record_merge_key(rec);
        let name = rec
            .get("file_name")
            .and_then(Value::as_str)
            .map(str::to_string);
        let old = old_by_key
            .get(&key)
            .or_else(|| name.as_deref().and_then(|n| old_by_name.get(n)));
        if let Some(old) = old {
            merge_missing_values(rec, old);
        }
    }

    let new_keys: HashSet<String> = new_records
        .iter()
        .map(|r| record_merge_key(r))
        .filter(|k| !k.is_empty())
        .collect();

    for key in old_key_order {
        if !new_keys.contains(&key) {
            if let Some(r) = old_by_key.remove(&key) {
                new_records.push(r);
            }
        }
    }

    new_records
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_root() -> RepoRoot {
        RepoRoot::new(Path::new(".")).expect("repo root")
    }

    fn exif(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    const A1111_BLOCK: &str = "a castle on a hill\nNegative prompt: blurry\nSteps: 30, Sampler: Euler a, CFG scale: 7.5, Seed: 1234567890, Size: 832x1216, Model: juggernautXL";

    #[test]
    fn candidate_blobs_known_keys_then_marker_scan() {
        let obj = exif(&[
            ("PNG:Parameters", json!(A1111_BLOCK)),
            ("XMP:OddTag", json!("a long enough string mentioning Steps: 20 here")),
            ("XMP:Short", json!("Steps: 20")),
            ("File:FileSize", json!(1024)),
        ]);
        let blobs = extract_candidate_blobs(&obj);
        let keys: Vec<&str> = blobs.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"PNG:Parameters"));
        assert!(keys.contains(&"XMP:OddTag"));
        // Under the 30-char floor.
        assert!(!keys.contains(&"XMP:Short"));
    }

    #[test]
    fn candidate_blobs_dedupe_identical_pairs() {
        let long_block = "Steps: 20, Sampler: Euler a, Seed: 42, quite long";
        let obj = exif(&[("PNG:Parameters", json!(long_block))]);
        let blobs = extract_candidate_blobs(&obj);
        // Known-key pass and marker scan both hit PNG:Parameters once.
        assert_eq!(blobs.len(), 1);
    }

    #[test]
    fn a1111_record_end_to_end() {
        let obj = exif(&[
            ("SourceFile", json!("input/castle.png")),
            ("PNG:Parameters", json!(A1111_BLOCK)),
        ]);
        let rec = normalize_record(&obj, &test_root());

        assert_eq!(rec.format_hint.as_deref(), Some("a1111_like"));
        assert_eq!(rec.prompt.as_deref(), Some("a castle on a hill"));
        assert_eq!(rec.negative_prompt.as_deref(), Some("blurry"));
        assert_eq!(rec.steps, Some(30));
        assert_eq!(rec.cfg_scale, Some(7.5));
        assert_eq!(rec.seed, Some(1234567890));
        assert_eq!(rec.width, Some(832));
        assert_eq!(rec.height, Some(1216));
        assert_eq!(rec.model.as_deref(), Some("juggernautXL"));
        assert_eq!(rec.file_name.as_deref(), Some("castle.png"));
        assert_eq!(rec.ext.as_deref(), Some("png"));

        assert_eq!(rec.kv["sampler_norm"], json!("euler_a"));
        assert_eq!(rec.kv["size_norm"], json!("832x1216"));
        assert_eq!(rec.kv["steps_norm"], json!(30));
        assert!(rec.kv.contains_key("prompt_tokens"));
    }

    #[test]
    fn record_id_is_stable_across_runs() {
        let obj = exif(&[("SourceFile", json!("input/castle.png"))]);
        let a = normalize_record(&obj, &test_root());
        let b = normalize_record(&obj, &test_root());
        assert_eq!(a.id, b.id);
        assert!(!a.id.is_empty());
    }

    #[test]
    fn record_without_source_gets_deterministic_fallback_id() {
        let obj = exif(&[("PNG:Parameters", json!(A1111_BLOCK))]);
        let a = normalize_record(&obj, &test_root());
        let b = normalize_record(&obj, &test_root());
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn workflow_json_beats_a1111_for_scalars() {
        let wf = serde_json::json!({
            "3": {
                "class_type": "KSampler",
                "inputs": { "seed": 999, "steps": 40, "cfg": 5.0, "sampler_name": "dpmpp_2m" }
            }
        })
        .to_string();
        let obj = exif(&[
            ("SourceFile", json!("input/x.png")),
            ("PNG:Workflow", json!(wf)),
            ("PNG:Parameters", json!(A1111_BLOCK)),
        ]);
        let rec = normalize_record(&obj, &test_root());
        assert_eq!(rec.format_hint.as_deref(), Some("comfyui_like"));
        assert_eq!(rec.steps, Some(40));
        assert_eq!(rec.cfg_scale, Some(5.0));
        assert_eq!(rec.sampler.as_deref(), Some("dpmpp_2m"));
        // A1111 still fills what the graph never had.
        assert_eq!(rec.model.as_deref(), Some("juggernautXL"));
        assert!(rec.workflow_json.is_some());
        assert!(rec.kv.contains_key("workflow_json"));
    }

    #[test]
    fn node_graph_prompts_override_a1111_prompts() {
        let wf = serde_json::json!({
            "6": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": "graph positive prompt wins" }
            }
        })
        .to_string();
        let obj = exif(&[
            ("SourceFile", json!("input/x.png")),
            ("PNG:Workflow", json!(wf)),
            ("PNG:Parameters", json!(A1111_BLOCK)),
        ]);
        let rec = normalize_record(&obj, &test_root());
        assert_eq!(rec.prompt.as_deref(), Some("graph positive prompt wins"));
        // The A1111 negative stays, the graph had none.
        assert_eq!(rec.negative_prompt.as_deref(), Some("blurry"));
    }

    #[test]
    fn normalizer_leaves_resources_to_the_dedicated_pass() {
        let wf = serde_json::json!({
            "4": {
                "class_type": "CheckpointLoaderSimple",
                "inputs": { "ckpt_name": "base.safetensors" }
            },
            "5": {
                "class_type": "LoraLoader",
                "inputs": { "lora_name": "style", "strength_model": 0.8 }
            }
        })
        .to_string();
        let obj = exif(&[
            ("SourceFile", json!("input/x.png")),
            ("PNG:Workflow", json!(wf)),
        ]);
        let rec = normalize_record(&obj, &test_root());
        // The workflow is kept for the resources pass, which owns
        // resource extraction; the record itself stays empty.
        assert!(rec.workflow_json.is_some());
        assert!(rec.resources.is_empty());
    }

    #[test]
    fn keyed_fields_camera_model_excluded() {
        let obj = exif(&[
            ("EXIF:Model", json!("Canon EOS R5")),
            ("XMP:ModelUsed", json!("dreamshaper_8")),
        ]);
        let keyed = extract_keyed_fields(&obj);
        assert_eq!(keyed.model.as_deref(), Some("dreamshaper_8"));
    }

    #[test]
    fn keyed_fields_config_keys_are_not_cfg() {
        let obj = exif(&[
            ("XMP:CfgConfig", json!("7.5")),
            ("XMP:CfgScale", json!("6.0")),
        ]);
        let keyed = extract_keyed_fields(&obj);
        assert_eq!(keyed.cfg_scale, Some(6.0));
    }

    #[test]
    fn keyed_fields_negative_needs_prompt_in_key() {
        let obj = exif(&[
            ("XMP:NegativePrompt", json!("blurry and bad")),
            ("XMP:Negative", json!("a film negative")),
        ]);
        let keyed = extract_keyed_fields(&obj);
        assert_eq!(keyed.negative_prompt.as_deref(), Some("blurry and bad"));
    }

    #[test]
    fn stale_kv_entries_removed_when_prompt_empties() {
        let obj = exif(&[
            ("SourceFile", json!("input/x.png")),
            // The whole "prompt" is really a negative block.
            ("XMP:Prompt", json!("Negative prompt: blurry, lowres")),
        ]);
        let rec = normalize_record(&obj, &test_root());
        assert_eq!(rec.prompt, None);
        assert!(!rec.kv.contains_key("prompt"));
        assert!(!rec.kv.contains_key("prompt_tokens"));
        assert_eq!(rec.negative_prompt.as_deref(), Some("blurry, lowres"));
        assert_eq!(rec.kv["neg_prompt_text"], json!("blurry, lowres"));
    }

    #[test]
    fn software_kv_from_exif_tags() {
        let obj = exif(&[
            ("SourceFile", json!("input/x.png")),
            ("PNG:Software", json!("ComfyUI")),
        ]);
        let rec = normalize_record(&obj, &test_root());
        assert_eq!(rec.kv["software"], json!("ComfyUI"));
    }

    #[test]
    fn merge_missing_fills_nulls_and_recurses() {
        let mut target = serde_json::json!({
            "a": null,
            "b": "keep",
            "nested": { "x": "", "y": "stay" }
        })
        .as_object()
        .cloned()
        .expect("object");
        let source = serde_json::json!({
            "a": 1,
            "b": "discard",
            "nested": { "x": "filled", "y": "ignored" },
            "extra": true
        })
        .as_object()
        .cloned()
        .expect("object");

        merge_missing_values(&mut target, &source);
        assert_eq!(target["a"], json!(1));
        assert_eq!(target["b"], json!("keep"));
        assert_eq!(target["nested"]["x"], json!("filled"));
        assert_eq!(target["nested"]["y"], json!("stay"));
        assert_eq!(target["extra"], json!(true));
    }

    #[test]
    fn merge_record_lists_keeps_unmatched_old_records() {
        let new = vec![exif(&[
            ("source_file", json!("a.png")),
            ("prompt", json!(null)),
        ])];
        let old = vec![
            exif(&[("source_file", json!("A.PNG")), ("prompt", json!("old prompt"))]),
            exif(&[("source_file", json!("gone.png")), ("prompt", json!("kept"))]),
        ];
        let merged = merge_record_lists(new, old);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0]["prompt"], json!("old prompt"));
        assert_eq!(merged[1]["source_file"], json!("gone.png"));
    }

    #[test]
    fn merge_key_folds_backslashes_and_case() {
        let rec = exif(&[("source_file", json!("Input\\Sub\\A.PNG"))]);
        assert_eq!(record_merge_key(&rec), "input/sub/a.png");
    }

    #[test]
    fn merge_falls_back_to_file_name() {
        let new = vec![exif(&[
            ("source_file", json!("moved/b.png")),
            ("file_name", json!("b.png")),
            ("seed", json!(null)),
        ])];
        let old = vec![exif(&[
            ("source_file", json!("old/b.png")),
            ("file_name", json!("b.png")),
            ("seed", json!(42)),
        ])];
        let merged = merge_record_lists(new, old);
        assert_eq!(merged[0]["seed"], json!(42));
        // The old record keyed differently is still appended.
        assert_eq!(merged.len(), 2);
    }
}
