use crate::graph::{collect_nodes, node_class_type, node_inputs};
use crate::params::{value_as_str, value_to_float};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// A model resource referenced by a generation workflow: checkpoint, lora,
/// upscaler, controlnet, vae, embedding, or an unresolved `resource_ref`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub extra: Option<Value>,
}

impl Resource {
    fn new(kind: &str, name: &str, weight: Option<f64>, extra: Value) -> Self {
        Resource {
            kind: kind.to_string(),
            name: name.to_string(),
            version: None,
            hash: None,
            weight,
            extra: Some(extra),
        }
    }
}

/// Classifies a URN-ish resource string into a kind, e.g.
/// `urn:air:sdxl:checkpoint:civitai:...@...` is a checkpoint.
pub fn classify_urn(name: &str) -> Option<&'static str> {
    let n = name.to_lowercase();

    if n.contains(":checkpoint:") {
        return Some("checkpoint");
    }
    if n.contains(":lora:") {
        return Some("lora");
    }
    if n.contains(":controlnet:") || n.contains("controlnet") {
        return Some("controlnet");
    }
    if n.contains(":vae:") || n.contains(":vae-") || (n.contains(":sd") && n.contains(":vae")) {
        return Some("vae");
    }
    if n.contains(":upscaler:") || n.contains("upscale") {
        return Some("upscaler");
    }
    if n.contains(":embedding:") || n.contains("textual") || n.contains("embedding") {
        return Some("embedding");
    }

    None
}

fn input_str<'a>(inputs: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| inputs.get(*k).and_then(value_as_str))
}

fn input_float(inputs: &Map<String, Value>, key: &str) -> Option<f64> {
    inputs.get(key).and_then(value_to_float)
}

/// Extracts resources by walking node dictionaries and inspecting the
/// class type plus loader inputs.
pub fn extract_from_nodes(workflow: &Value) -> Vec<Resource> {
    let mut out = Vec::new();

    for (node_id, node) in collect_nodes(workflow) {
        let ct_raw = node_class_type(node);
        let ct = ct_raw.to_lowercase();
        let Some(inputs) = node_inputs(node) else {
            continue;
        };

        if ct.contains("checkpointloader") || ct.contains("checkpoint_loader") {
            if let Some(name) = input_str(inputs, &["ckpt_name", "checkpoint", "model_name"]) {
                out.push(Resource::new(
                    "checkpoint",
                    name,
                    Some(1.0),
                    json!({"node_id": node_id, "class_type": ct_raw}),
                ));
            }
            continue;
        }

        if ct.contains("loraloader") || ct.contains("lora_loader") {
            if let Some(name) = input_str(inputs, &["lora_name", "lora", "model_name"]) {
                let w_model = input_float(inputs, "strength_model");
                let w_clip = input_float(inputs, "strength_clip");
                let weight = w_model
                    .or_else(|| input_float(inputs, "strength"))
                    .unwrap_or(1.0);
                out.push(Resource::new(
                    "lora",
                    name,
                    Some(weight),
                    json!({
                        "node_id": node_id,
                        "class_type": ct_raw,
                        "strength_model": w_model,
                        "strength_clip": w_clip,
                    }),
                ));
            }
            continue;
        }

        if ct.contains("upscalemodelloader")
            || ct.contains("upscalerloader")
            || ct.contains("upscale_model_loader")
        {
            if let Some(name) = input_str(inputs, &["model_name", "upscale_model", "upscaler_name"]) {
                out.push(Resource::new(
                    "upscaler",
                    name,
                    Some(1.0),
                    json!({"node_id": node_id, "class_type": ct_raw}),
                ));
            }
            continue;
        }

        if ct.contains("controlnet") && (ct.contains("loader") || ct.contains("load")) {
            if let Some(name) = input_str(
                inputs,
                &["control_net_name", "controlnet_name", "controlnet_model", "model_name"],
            ) {
                let weight = input_float(inputs, "strength")
                    .or_else(|| input_float(inputs, "weight"))
                    .unwrap_or(1.0);
                out.push(Resource::new(
                    "controlnet",
                    name,
                    Some(weight),
                    json!({"node_id": node_id, "class_type": ct_raw}),
                ));
            }
            continue;
        }

        if ct.contains("vaeloader") || ct.contains("vae_loader") {
            if let Some(name) = input_str(inputs, &["vae_name", "vae", "model_name"]) {
                out.push(Resource::new(
                    "vae",
                    name,
                    Some(1.0),
                    json!({"node_id": node_id, "class_type": ct_raw}),
                ));
            }
            continue;
        }

        if ct.contains("embedding") && (ct.contains("loader") || ct.contains("load")) {
            if let Some(name) = input_str(inputs, &["embedding_name", "name", "model_name"]) {
                out.push(Resource::new(
                    "embedding",
                    name,
                    Some(1.0),
                    json!({"node_id": node_id, "class_type": ct_raw}),
                ));
            }
        }
    }

    out
}

/// Resources listed as URNs under `extra.airs`, a compact and reliable
/// fallback many embeds carry.
pub fn extract_from_extra_airs(workflow: &Value) -> Vec<Resource> {
    let mut out = Vec::new();

    let Some(airs) = workflow
        .get("extra")
        .and_then(|e| e.get("airs"))
        .and_then(Value::as_array)
    else {
        return out;
    };

    for s in airs {
        let Some(urn) = value_as_str(s) else { continue };
        let Some(kind) = classify_urn(urn) else { continue };
        out.push(Resource::new(
            kind,
            urn,
            Some(1.0),
            json!({"source": "extra.airs"}),
        ));
    }

    out
}

/// Resource references from an `extraMetadata` JSON string containing
/// `resources: [{modelVersionId, strength}, ...]`. Without names or URNs
/// these are stored as `resource_ref` / `modelVersionId:<id>` pairs for a
/// later resolution pass.
pub fn extract_from_extra_metadata(workflow: &Value) -> Vec<Resource> {
    let mut out = Vec::new();

    let Some(em) = workflow.get("extraMetadata").and_then(value_as_str) else {
        return out;
    };
    let Ok(obj) = serde_json::from_str::<Value>(em) else {
        return out;
    };
    let Some(resources) = obj.get("resources").and_then(Value::as_array) else {
        return out;
    };

    for r in resources {
        let Some(map) = r.as_object() else { continue };
        let mvid = match map.get("modelVersionId") {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            _ => continue,
        };
        let strength = map.get("strength").and_then(value_to_float).unwrap_or(1.0);
        out.push(Resource::new(
            "resource_ref",
            &format!("modelVersionId:{mvid}"),
            Some(strength),
            json!({"source": "extraMetadata.resources"}),
        ));
    }

    out
}

/// Non-destructive merge of extra metadata maps: missing keys are copied,
/// equal values are left alone, and conflicting values accumulate into a
/// list instead of being overwritten.
pub fn merge_extra(base: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (k, v) in patch {
        match base.get_mut(k) {
            None => {
                base.insert(k.clone(), v.clone());
            }
            Some(existing) if *existing == *v => {}
            Some(Value::Array(list)) => {
                if !list.contains(v) {
                    list.push(v.clone());
                }
            }
            Some(existing) => {
                let old = existing.take();
                *existing = Value::Array(vec![old, v.clone()]);
            }
        }
    }
}

/// Dedupes by `(kind, name)`, keeping first-seen order. Later duplicates
/// can fill a missing weight and contribute extra metadata via
/// [`merge_extra`].
pub fn dedupe_resources(items: Vec<Resource>) -> Vec<Resource> {
    let mut out: Vec<Resource> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();

    for item in items {
        if item.kind.is_empty() || item.name.is_empty() {
            continue;
        }
        let key = (item.kind.clone(), item.name.clone());

        match index.get(&key) {
            None => {
                index.insert(key, out.len());
                out.push(item);
            }
            Some(&i) => {
                let kept = &mut out[i];
                if kept.weight.is_none() {
                    kept.weight = item.weight;
                }
                if let Some(Value::Object(patch)) = &item.extra {
                    match &mut kept.extra {
                        Some(Value::Object(base)) => merge_extra(base, patch),
                        _ => kept.extra = item.extra.clone(),
                    }
                }
            }
        }
    }

    out
}

/// Full resource extraction over one workflow: node walk, `extra.airs`
/// URNs, and `extraMetadata` references, deduplicated.
pub fn extract_resources(workflow: &Value) -> Vec<Resource> {
    let mut items = extract_from_nodes(workflow);
    items.extend(extract_from_extra_airs(workflow));
    items.extend(extract_from_extra_metadata(workflow));
    dedupe_resources(items)
}
