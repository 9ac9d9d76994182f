use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

static RE_RUNS_OF_BLANKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("valid blank-run regex"));
static RE_RUNS_OF_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid newline-run regex"));
static RE_BREAK_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bBREAK\b").expect("valid BREAK regex"));
// (token:1.2)
static RE_WEIGHT_PAREN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\((.+?):\s*([0-9.]+)\)\s*$").expect("valid paren-weight regex"));
// <lora:name:1.0>
static RE_WEIGHT_ANGLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^<lora:([^:>]+):\s*([0-9.]+)\s*>\s*$").expect("valid lora-weight regex")
});

/// One prompt token with its normalized form and explicit weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptToken {
    pub t: String,
    pub t_norm: String,
    pub w: f64,
}

/// Normalizes whitespace: CRLF/CR to LF, runs of spaces/tabs to one space,
/// three or more consecutive newlines to exactly two, trimmed.
pub fn clean_ws(s: &str) -> String {
    let s = s.replace("\r\n", "\n").replace('\r', "\n");
    let s = RE_RUNS_OF_BLANKS.replace_all(&s, " ");
    let s = RE_RUNS_OF_NEWLINES.replace_all(&s, "\n\n");
    s.trim().to_string()
}

/// Splits on commas/newlines, ignoring commas nested inside `()`, `[]`,
/// `{}`. The A1111 `BREAK` marker also acts as a delimiter.
pub fn split_tokens_top_level(s: &str) -> Vec<String> {
    let s = clean_ws(s).replace('\n', ",");
    let s = RE_BREAK_MARKER.replace_all(&s, ",");

    let mut out = Vec::new();
    let mut buf = String::new();
    let mut depth_paren = 0i32;
    let mut depth_brack = 0i32;
    let mut depth_brace = 0i32;

    for ch in s.chars() {
        match ch {
            '(' => depth_paren += 1,
            ')' => depth_paren = (depth_paren - 1).max(0),
            '[' => depth_brack += 1,
            ']' => depth_brack = (depth_brack - 1).max(0),
            '{' => depth_brace += 1,
            '}' => depth_brace = (depth_brace - 1).max(0),
            _ => {}
        }

        if ch == ',' && depth_paren == 0 && depth_brack == 0 && depth_brace == 0 {
            let tok = buf.trim();
            if !tok.is_empty() {
                out.push(tok.to_string());
            }
            buf.clear();
        } else {
            buf.push(ch);
        }
    }

    let tail = buf.trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }

    out
}

/// Case/whitespace-folded token key used for deduplication.
pub fn token_norm(t: &str) -> String {
    let lowered = t.trim().to_lowercase();
    RE_RUNS_OF_BLANKS.replace_all(&lowered, " ").to_string()
}

/// Returns `(token_text, weight)`, default weight 1.0.
///
/// Supports `(token:1.2)` and `<lora:name:1.0>` (the latter becomes
/// `lora:name`). A weight that fails to parse silently defaults to 1.0.
pub fn parse_weighted_token(raw: &str) -> (String, f64) {
    let r = raw.trim();

    if let Some(caps) = RE_WEIGHT_PAREN.captures(r) {
        let token = caps[1].trim().to_string();
        let w = caps[2].parse::<f64>().unwrap_or(1.0);
        return (token, w);
    }

    if let Some(caps) = RE_WEIGHT_ANGLE.captures(r) {
        let name = caps[1].trim();
        let w = caps[2].parse::<f64>().unwrap_or(1.0);
        return (format!("lora:{name}"), w);
    }

    (r.to_string(), 1.0)
}

/// Tokenizes a prompt into comma-separated weighted tokens.
///
/// Dedupes by normalized token text: order follows the first appearance of
/// each key, while the stored text/weight reflect the last occurrence.
pub fn tokenize_prompt(s: &str) -> Vec<PromptToken> {
    let mut order: Vec<String> = Vec::new();
    let mut by_norm: HashMap<String, PromptToken> = HashMap::new();

    for raw in split_tokens_top_level(s) {
        let (token, w) = parse_weighted_token(&raw);
        let token = token.trim().to_string();
        if token.is_empty() {
            continue;
        }

        let tn = token_norm(&token);
        // Pure BREAK tokens are separator artifacts, not content.
        if tn == "break" {
            continue;
        }

        if !by_norm.contains_key(&tn) {
            order.push(tn.clone());
        }
        by_norm.insert(
            tn.clone(),
            PromptToken {
                t: token,
                t_norm: tn,
                w,
            },
        );
    }

    order
        .into_iter()
        .filter_map(|tn| by_norm.remove(&tn))
        .collect()
}
