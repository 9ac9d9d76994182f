use crate::prompts::{cut_at_tail_markers, RE_NEG_MARKER};
use crate::text::clean_ws;
use regex::Regex;
use std::sync::LazyLock;

const RAW_TEXT_PREVIEW_LIMIT: usize = 2000;

static RE_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bSize:\s*(\d+)\s*x\s*(\d+)\b").expect("valid Size regex"));
static RE_STEPS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bSteps:\s*(\d+)\b").expect("valid Steps regex"));
static RE_CFG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bCFG\s*scale:\s*([0-9.]+)\b").expect("valid CFG regex"));
static RE_SEED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bSeed:\s*(\d+)\b").expect("valid Seed regex"));
static RE_SAMPLER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bSampler:\s*([^,\n]+)").expect("valid Sampler regex"));
static RE_SCHEDULER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bScheduler:\s*([^,\n]+)").expect("valid Scheduler regex"));
static RE_MODEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bModel:\s*([^,\n]+)").expect("valid Model regex"));

/// Fields recovered from an A1111-style parameters block. Absent fields
/// stay `None` so the caller can fill per-field from other sources.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct A1111Fields {
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub steps: Option<i64>,
    pub cfg_scale: Option<f64>,
    pub seed: Option<i64>,
    pub sampler: Option<String>,
    pub scheduler: Option<String>,
    pub model: Option<String>,
    pub raw_text: String,
}

fn capture_str(re: &Regex, t: &str) -> Option<String> {
    re.captures(t).map(|c| c[1].trim().to_string())
}

/// Best-effort parse of an A1111-like parameters block.
///
/// The text above `Negative prompt:` is the positive prompt; the text after
/// it, cut at the first tail marker, is the negative. Scalar fields come
/// from labeled `Key: value` pairs anywhere in the block.
pub fn parse_parameters(text: &str) -> A1111Fields {
    let t = clean_ws(text);
    let mut out = A1111Fields::default();

    match RE_NEG_MARKER.find(&t) {
        Some(m) => {
            let pos = t[..m.start()].trim();
            if !pos.is_empty() {
                out.prompt = Some(pos.to_string());
            }
            let neg = cut_at_tail_markers(t[m.end()..].trim());
            if !neg.is_empty() {
                out.negative_prompt = Some(neg);
            }
        }
        None => {
            let pos = cut_at_tail_markers(&t);
            if !pos.is_empty() {
                out.prompt = Some(pos);
            }
        }
    }

    if let Some(caps) = RE_SIZE.captures(&t) {
        out.width = caps[1].parse::<i64>().ok();
        out.height = caps[2].parse::<i64>().ok();
    }
    if let Some(caps) = RE_STEPS.captures(&t) {
        out.steps = caps[1].parse::<i64>().ok();
    }
    if let Some(caps) = RE_CFG.captures(&t) {
        out.cfg_scale = caps[1].parse::<f64>().ok();
    }
    if let Some(caps) = RE_SEED.captures(&t) {
        out.seed = caps[1].parse::<i64>().ok();
    }
    out.sampler = capture_str(&RE_SAMPLER, &t);
    out.scheduler = capture_str(&RE_SCHEDULER, &t);
    out.model = capture_str(&RE_MODEL, &t);

    out.raw_text = t.chars().take(RAW_TEXT_PREVIEW_LIMIT).collect();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: &str = "a castle on a hill, dramatic light\n\
        Negative prompt: blurry, lowres\n\
        Steps: 30, Sampler: DPM++ 2M Karras, Scheduler: Karras, CFG scale: 7.5, \
        Seed: 1234567890, Size: 832x1216, Model hash: abc123, Model: juggernautXL";

    #[test]
    fn full_block_extracts_every_field() {
        let f = parse_parameters(BLOCK);
        assert_eq!(f.prompt.as_deref(), Some("a castle on a hill, dramatic light"));
        assert_eq!(f.negative_prompt.as_deref(), Some("blurry, lowres"));
        assert_eq!(f.steps, Some(30));
        assert_eq!(f.cfg_scale, Some(7.5));
        assert_eq!(f.seed, Some(1234567890));
        assert_eq!(f.width, Some(832));
        assert_eq!(f.height, Some(1216));
        assert_eq!(f.sampler.as_deref(), Some("DPM++ 2M Karras"));
        assert_eq!(f.scheduler.as_deref(), Some("Karras"));
        assert_eq!(f.model.as_deref(), Some("juggernautXL"));
    }

    #[test]
    fn prompt_only_block_has_no_scalars() {
        let f = parse_parameters("a serene lake at dawn");
        assert_eq!(f.prompt.as_deref(), Some("a serene lake at dawn"));
        assert_eq!(f.negative_prompt, None);
        assert_eq!(f.steps, None);
        assert_eq!(f.seed, None);
    }

    #[test]
    fn missing_negative_marker_cuts_prompt_at_tail() {
        let f = parse_parameters("a cat.Steps: 20, Seed: 42");
        assert_eq!(f.prompt.as_deref(), Some("a cat."));
        assert_eq!(f.negative_prompt, None);
        assert_eq!(f.steps, Some(20));
        assert_eq!(f.seed, Some(42));
    }

    #[test]
    fn negative_is_cut_at_first_tail_marker() {
        let f = parse_parameters("good\nNegative prompt: bad, worse Steps: 25");
        assert_eq!(f.negative_prompt.as_deref(), Some("bad, worse"));
        assert_eq!(f.steps, Some(25));
    }

    #[test]
    fn sampler_capture_stops_at_comma_or_newline() {
        let f = parse_parameters("x\nSampler: Euler a, CFG scale: 7");
        assert_eq!(f.sampler.as_deref(), Some("Euler a"));
    }

    #[test]
    fn raw_text_is_truncated() {
        let long = "p".repeat(5000);
        let f = parse_parameters(&long);
        assert_eq!(f.raw_text.len(), 2000);
    }
}
