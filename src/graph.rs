use crate::params::{is_known_scheduler, looks_like_sampler, value_as_str, value_to_float, value_to_int};
use crate::text::clean_ws;
use serde_json::{Map, Value};

/// Walks a ComfyUI workflow and collects `(node_id, node)` pairs across the
/// common embed shapes:
///
///   A) id-keyed map: `{ "6": {"class_type": ..., "inputs": ...}, ... }`
///   B) nested containers: `{ "prompt"|"workflow"|"graph": {...} }`
///   C) nodes list: `{ "nodes": [ {"id": 6, "type": ...}, ... ] }`
///   D) nodes dict: `{ "nodes": { "6": {...}, ... } }`
///
/// Every graph consumer (prompt, param, and resource extraction) goes
/// through this one walker so they agree on what counts as a node.
pub fn collect_nodes(workflow: &Value) -> Vec<(String, &Map<String, Value>)> {
    let mut out = Vec::new();
    collect_into(workflow, &mut out);
    out
}

fn collect_into<'a>(workflow: &'a Value, out: &mut Vec<(String, &'a Map<String, Value>)>) {
    match workflow {
        Value::Object(map) => {
            for container_key in ["prompt", "workflow", "graph"] {
                if let Some(inner) = map.get(container_key) {
                    collect_into(inner, out);
                }
            }

            match map.get("nodes") {
                Some(nodes @ Value::Object(_)) => {
                    collect_into(nodes, out);
                }
                Some(Value::Array(nodes)) => {
                    for (i, item) in nodes.iter().enumerate() {
                        if let Value::Object(node) = item {
                            out.push((list_node_id(node, i), node));
                        }
                    }
                }
                _ => {}
            }

            for (k, v) in map {
                if let Value::Object(node) = v {
                    if node.contains_key("class_type")
                        || node.contains_key("inputs")
                        || node.contains_key("type")
                    {
                        out.push((k.clone(), node));
                    }
                }
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                if let Value::Object(node) = item {
                    out.push((list_node_id(node, i), node));
                }
            }
        }
        _ => {}
    }
}

fn list_node_id(node: &Map<String, Value>, index: usize) -> String {
    for key in ["id", "node_id", "key"] {
        match node.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return s.clone(),
            Some(Value::Number(n)) => return n.to_string(),
            _ => {}
        }
    }
    index.to_string()
}

/// Comfy nodes usually carry `class_type`; some exports use `type`.
pub fn node_class_type(node: &Map<String, Value>) -> String {
    node.get("class_type")
        .or_else(|| node.get("type"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub fn node_inputs(node: &Map<String, Value>) -> Option<&Map<String, Value>> {
    node.get("inputs").and_then(Value::as_object)
}

fn input_str<'a>(inputs: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| inputs.get(*k).and_then(value_as_str))
}

/// Generation parameters recovered from KSampler nodes and model loaders.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GraphParams {
    pub model: Option<String>,
    pub seed: Option<i64>,
    pub steps: Option<i64>,
    pub cfg_scale: Option<f64>,
    pub sampler: Option<String>,
    pub scheduler: Option<String>,
}

impl GraphParams {
    fn fill_missing(&mut self, other: &GraphParams) {
        if self.model.is_none() {
            self.model = other.model.clone();
        }
        if self.seed.is_none() {
            self.seed = other.seed;
        }
        if self.steps.is_none() {
            self.steps = other.steps;
        }
        if self.cfg_scale.is_none() {
            self.cfg_scale = other.cfg_scale;
        }
        if self.sampler.is_none() {
            self.sampler = other.sampler.clone();
        }
        if self.scheduler.is_none() {
            self.scheduler = other.scheduler.clone();
        }
    }
}

/// Positional `widgets_values` parsing for KSampler nodes.
///
/// Workflow exports do not label widget slots, so this leans on value
/// ranges: strings are claimed as sampler (name lookalike) or scheduler
/// (known spelling); integers >= 10000 become the seed and 1..=200 the
/// step count, first match wins; a float in [0.1, 30] becomes cfg unless
/// its truncation collides with the seed or step value already claimed.
/// Ambiguous inputs stay ambiguous on purpose.
pub fn parse_ksampler_widgets(values: &[Value]) -> GraphParams {
    let mut out = GraphParams::default();

    for v in values {
        let Some(s) = value_as_str(v) else { continue };
        // Sampler and scheduler are claimed independently: a spelling like
        // "sgm_uniform" satisfies both checks and fills both fields.
        if out.sampler.is_none() && looks_like_sampler(s) {
            out.sampler = Some(s.to_string());
        }
        if out.scheduler.is_none() && is_known_scheduler(s) {
            out.scheduler = Some(s.to_string());
        }
    }

    for v in values {
        let Some(i) = value_to_int(v) else { continue };
        if i >= 10000 && out.seed.is_none() {
            out.seed = Some(i);
            continue;
        }
        if (1..=200).contains(&i) && out.steps.is_none() {
            out.steps = Some(i);
        }
    }

    for v in values {
        let Some(f) = value_to_float(v) else { continue };
        if (0.1..=30.0).contains(&f) && out.cfg_scale.is_none() {
            let trunc = f.trunc() as i64;
            if out.steps == Some(trunc) || out.seed == Some(trunc) {
                continue;
            }
            out.cfg_scale = Some(f);
        }
    }

    out
}

/// Extracts generation parameters by walking the node graph: checkpoint
/// loaders contribute the model name, KSampler nodes the sampling scalars.
/// Labeled `inputs` win over positional `widgets_values`; across nodes the
/// first value found for a field wins.
pub fn extract_params(workflow: &Value) -> GraphParams {
    let mut out = GraphParams::default();

    for (_id, node) in collect_nodes(workflow) {
        let ct = node_class_type(node).to_lowercase();
        let inputs = node_inputs(node);

        if ct.contains("checkpoint") && (ct.contains("loader") || ct.contains("load")) && out.model.is_none() {
            if let Some(inputs) = inputs {
                if let Some(model) = input_str(inputs, &["ckpt_name", "model_name", "checkpoint"]) {
                    out.model = Some(model.to_string());
                }
            }
        }

        if ct.contains("ksampler") {
            let mut params = GraphParams::default();
            if let Some(inputs) = inputs {
                params.seed = inputs.get("seed").and_then(value_to_int);
                params.steps = inputs.get("steps").and_then(value_to_int);
                params.cfg_scale = inputs
                    .get("cfg")
                    .and_then(value_to_float)
                    .or_else(|| inputs.get("cfg_scale").and_then(value_to_float));
                params.sampler = input_str(inputs, &["sampler_name", "sampler"]).map(str::to_string);
                params.scheduler = input_str(inputs, &["scheduler"]).map(str::to_string);
            }

            if let Some(widgets) = node.get("widgets_values").and_then(Value::as_array) {
                params.fill_missing(&parse_ksampler_widgets(widgets));
            }

            out.fill_missing(&params);
        }
    }

    out
}

fn best_prompt_candidate(values: &[String]) -> Option<String> {
    values
        .iter()
        .filter(|v| !v.trim().is_empty())
        .map(|v| clean_ws(v))
        .filter(|v| !v.is_empty())
        .max_by_key(String::len)
}

/// Extracts likely positive/negative prompts from prompt-like nodes
/// (Prompt / CLIPTextEncode), preferring the longest candidate per side.
pub fn extract_prompts(workflow: &Value) -> (Option<String>, Option<String>) {
    if !workflow.is_object() && !workflow.is_array() {
        return (None, None);
    }

    let mut pos_candidates: Vec<String> = Vec::new();
    let mut neg_candidates: Vec<String> = Vec::new();

    for (_id, node) in collect_nodes(workflow) {
        let label = ["class_type", "type", "title", "name"]
            .iter()
            .filter_map(|k| node.get(*k).and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        if let Some(inputs) = node_inputs(node) {
            for (k, v) in inputs {
                let Some(text) = value_as_str(v) else { continue };
                let key = k.to_lowercase();
                if key.contains("negative") {
                    neg_candidates.push(text.to_string());
                } else if key == "text" || key == "prompt" || key.contains("positive") {
                    pos_candidates.push(text.to_string());
                }
            }
        }

        if let Some(widgets) = node.get("widgets_values").and_then(Value::as_array) {
            let widget_text: Vec<String> = widgets
                .iter()
                .filter_map(value_as_str)
                .map(str::to_string)
                .collect();
            if let Some(best) = best_prompt_candidate(&widget_text) {
                if label.contains("negative") {
                    neg_candidates.push(best);
                } else if label.contains("prompt") || label.contains("cliptextencode") {
                    pos_candidates.push(best);
                }
            }
        }
    }

    (
        best_prompt_candidate(&pos_candidates),
        best_prompt_candidate(&neg_candidates),
    )
}

/// Signals pulled from an embedded ComfyUI JSON blob before any node-level
/// prompt extraction. `workflow_json` keeps the full graph for storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ComfyExtract {
    pub workflow_json: Value,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub seed: Option<i64>,
    pub steps: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub cfg_scale: Option<f64>,
    pub sampler: Option<String>,
    pub scheduler: Option<String>,
    pub model: Option<String>,
}

const DEEP_NUMERIC_KEYS: &[&str] = &["seed", "steps", "cfg", "cfg_scale", "width", "height"];

fn deep_walk_numeric(blob: &Value, found: &mut Map<String, Value>) {
    match blob {
        Value::Object(map) => {
            for (k, v) in map {
                let lk = k.to_lowercase();
                if DEEP_NUMERIC_KEYS.contains(&lk.as_str())
                    && matches!(v, Value::Number(_) | Value::String(_))
                {
                    // Last occurrence wins, matching document order.
                    found.insert(lk, v.clone());
                }
                deep_walk_numeric(v, found);
            }
        }
        Value::Array(items) => {
            for v in items {
                deep_walk_numeric(v, found);
            }
        }
        _ => {}
    }
}

/// Conservative deep search for a paired positive/negative prompt: a dict
/// carrying both `prompt`/`negative_prompt` (or `positive`/`negative`) as
/// strings. Anything less paired is not guessed at here.
fn find_prompt_pair(blob: &Value) -> Option<(String, String)> {
    match blob {
        Value::Object(map) => {
            let lookup = |want: &str| {
                map.iter()
                    .find(|(k, _)| k.to_lowercase() == want)
                    .map(|(_, v)| v)
            };

            for (pos_key, neg_keys) in [
                ("prompt", &["negative_prompt", "negative prompt"][..]),
                ("positive", &["negative"][..]),
            ] {
                if let Some(Value::String(p)) = lookup(pos_key) {
                    for nk in neg_keys {
                        if let Some(Value::String(n)) = lookup(nk) {
                            return Some((p.clone(), n.clone()));
                        }
                    }
                }
            }

            map.values().find_map(find_prompt_pair)
        }
        Value::Array(items) => items.iter().find_map(find_prompt_pair),
        _ => None,
    }
}

/// Parses an embedded ComfyUI-like JSON blob without assuming an exact
/// structure: the graph is kept verbatim and a few common signals are
/// pulled out of it. Returns `None` for non-container JSON.
pub fn extract_embedded(blob: &Value) -> Option<ComfyExtract> {
    if !blob.is_object() && !blob.is_array() {
        return None;
    }

    let mut numeric = Map::new();
    deep_walk_numeric(blob, &mut numeric);

    let pair = find_prompt_pair(blob);
    let params = extract_params(blob);

    let scalar_int = |key: &str| numeric.get(key).and_then(value_to_int);
    let scalar_float = |key: &str| numeric.get(key).and_then(value_to_float);

    // Deep-walk values win; node params only fill what the walk missed.
    // cfg can be stored as cfg or cfg_scale, the explicit key preferred.
    Some(ComfyExtract {
        workflow_json: blob.clone(),
        prompt: pair.as_ref().map(|(p, _)| p.clone()),
        negative_prompt: pair.as_ref().map(|(_, n)| n.clone()),
        seed: scalar_int("seed").or(params.seed),
        steps: scalar_int("steps").or(params.steps),
        width: scalar_int("width"),
        height: scalar_int("height"),
        cfg_scale: scalar_float("cfg_scale")
            .or_else(|| scalar_float("cfg"))
            .or(params.cfg_scale),
        sampler: params.sampler,
        scheduler: params.scheduler,
        model: params.model,
    })
}
