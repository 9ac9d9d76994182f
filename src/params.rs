use serde_json::Value;

/// Sampler spellings seen across A1111 and ComfyUI metadata, folded to a
/// canonical snake_case name. Keys are already `norm_keyish`-folded.
const SAMPLER_ALIASES: &[(&str, &str)] = &[
    ("euler a", "euler_a"),
    ("euler ancestral", "euler_a"),
    ("euler", "euler"),
    ("heun", "heun"),
    ("lms", "lms"),
    ("ddim", "ddim"),
    ("plms", "plms"),
    ("dpm2", "dpm2"),
    ("dpm 2", "dpm2"),
    ("dpm2 a", "dpm2_a"),
    ("dpm 2 a", "dpm2_a"),
    ("dpm++ 2m", "dpmpp_2m"),
    ("dpmpp 2m", "dpmpp_2m"),
    ("dpm++ 2m karras", "dpmpp_2m_karras"),
    ("dpmpp 2m karras", "dpmpp_2m_karras"),
    ("dpm++ sde", "dpmpp_sde"),
    ("dpmpp sde", "dpmpp_sde"),
    ("dpm++ sde karras", "dpmpp_sde_karras"),
    ("dpmpp sde karras", "dpmpp_sde_karras"),
    ("uni pc", "uni_pc"),
    ("unipc", "uni_pc"),
];

const SCHEDULER_ALIASES: &[(&str, &str)] = &[
    ("karras", "karras"),
    ("exponential", "exponential"),
    ("normal", "normal"),
    ("simple", "simple"),
    ("ddim", "ddim"),
    ("sgm uniform", "sgm_uniform"),
];

/// Folds a sampler/scheduler spelling for alias lookup: lowercased, `-` and
/// `_` become spaces, whitespace runs collapse.
pub fn norm_keyish(s: &str) -> String {
    let folded: String = s
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '-' || c == '_' { ' ' } else { c })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical sampler name, or `None` for blank input. Unknown samplers are
/// kept, just snake_cased.
pub fn normalize_sampler(s: &str) -> Option<String> {
    if s.trim().is_empty() {
        return None;
    }
    let k = norm_keyish(s);
    let mapped = SAMPLER_ALIASES
        .iter()
        .find(|(alias, _)| *alias == k)
        .map(|(_, canon)| canon.to_string());
    Some(mapped.unwrap_or_else(|| k.replace(' ', "_")))
}

/// Canonical scheduler name, or `None` for blank input.
pub fn normalize_scheduler(s: &str) -> Option<String> {
    if s.trim().is_empty() {
        return None;
    }
    let k = norm_keyish(s);
    let mapped = SCHEDULER_ALIASES
        .iter()
        .find(|(alias, _)| *alias == k)
        .map(|(_, canon)| canon.to_string());
    Some(mapped.unwrap_or_else(|| k.replace(' ', "_")))
}

/// Whether a raw string is one of the scheduler spellings we recognize.
/// Used by the KSampler widget heuristic, which must not mistake arbitrary
/// strings for schedulers.
pub fn is_known_scheduler(s: &str) -> bool {
    let low = s.to_lowercase();
    SCHEDULER_ALIASES.iter().any(|(alias, _)| *alias == low) || low == "sgm_uniform"
}

/// Whether a string looks like a sampler name (substring check).
pub fn looks_like_sampler(s: &str) -> bool {
    let low = s.to_lowercase();
    ["euler", "dpm", "ddim", "heun", "lms", "uni", "plms", "ancestral"]
        .iter()
        .any(|t| low.contains(t))
}

/// Integer coercion via float truncation: accepts numbers and numeric
/// strings ("20", "20.0"), rejects booleans and anything unparseable.
pub fn value_to_int(v: &Value) -> Option<i64> {
    match v {
        Value::Bool(_) | Value::Null => None,
        Value::Number(n) => n.as_f64().map(|f| f.trunc() as i64),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            s.parse::<f64>().ok().map(|f| f.trunc() as i64)
        }
        _ => None,
    }
}

/// Float coercion with the same acceptance rules as [`value_to_int`].
pub fn value_to_float(v: &Value) -> Option<f64> {
    match v {
        Value::Bool(_) | Value::Null => None,
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            s.parse::<f64>().ok()
        }
        _ => None,
    }
}

/// Trimmed non-empty string view of a JSON value.
pub fn value_as_str(v: &Value) -> Option<&str> {
    match v {
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t)
            }
        }
        _ => None,
    }
}

/// Like [`value_to_int`] but for plain strings, used by the text parsers.
pub fn str_to_int(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok().map(|f| f.trunc() as i64)
}

pub fn str_to_float(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sampler_aliases_fold_to_canonical_names() {
        assert_eq!(normalize_sampler("Euler a").as_deref(), Some("euler_a"));
        assert_eq!(
            normalize_sampler("euler_ancestral").as_deref(),
            Some("euler_a")
        );
        assert_eq!(
            normalize_sampler("DPM++ 2M Karras").as_deref(),
            Some("dpmpp_2m_karras")
        );
        assert_eq!(normalize_sampler("UniPC").as_deref(), Some("uni_pc"));
    }

    #[test]
    fn unknown_sampler_is_snake_cased_not_dropped() {
        assert_eq!(
            normalize_sampler("Restart Sampler").as_deref(),
            Some("restart_sampler")
        );
    }

    #[test]
    fn blank_sampler_and_scheduler_are_none() {
        assert_eq!(normalize_sampler("  "), None);
        assert_eq!(normalize_scheduler(""), None);
    }

    #[test]
    fn scheduler_aliases() {
        assert_eq!(
            normalize_scheduler("SGM Uniform").as_deref(),
            Some("sgm_uniform")
        );
        assert_eq!(normalize_scheduler("Karras").as_deref(), Some("karras"));
        assert_eq!(normalize_scheduler("weird").as_deref(), Some("weird"));
    }

    #[test]
    fn known_scheduler_is_exact_not_fuzzy() {
        assert!(is_known_scheduler("karras"));
        assert!(is_known_scheduler("sgm_uniform"));
        assert!(!is_known_scheduler("karras-ish"));
    }

    #[test]
    fn sampler_lookalike_substrings() {
        assert!(looks_like_sampler("dpmpp_2m"));
        assert!(looks_like_sampler("Euler"));
        assert!(!looks_like_sampler("model.safetensors"));
    }

    #[test]
    fn int_coercion_truncates_through_float() {
        assert_eq!(value_to_int(&json!(20)), Some(20));
        assert_eq!(value_to_int(&json!("20.7")), Some(20));
        assert_eq!(value_to_int(&json!(20.9)), Some(20));
        assert_eq!(value_to_int(&json!(true)), None);
        assert_eq!(value_to_int(&json!("")), None);
        assert_eq!(value_to_int(&json!("x")), None);
        assert_eq!(value_to_int(&Value::Null), None);
    }

    #[test]
    fn float_coercion() {
        assert_eq!(value_to_float(&json!("7.5")), Some(7.5));
        assert_eq!(value_to_float(&json!(7)), Some(7.0));
        assert_eq!(value_to_float(&json!(false)), None);
        assert_eq!(value_to_float(&json!([1])), None);
    }

    #[test]
    fn string_view_trims_and_rejects_empty() {
        assert_eq!(value_as_str(&json!("  hi  ")), Some("hi"));
        assert_eq!(value_as_str(&json!("   ")), None);
        assert_eq!(value_as_str(&json!(5)), None);
    }
}
