use crate::text::clean_ws;
use regex::Regex;
use std::sync::LazyLock;

pub(crate) static RE_NEG_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bNegative prompt:\s*").expect("valid negative-marker regex"));

// Tail markers that begin the parameter/resource section in A1111-style
// blocks. Some sources jam these inline (".Steps: 30, Sampler: ..."), so
// they are detected anywhere, not just at line starts.
static RE_TAIL_ANY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:Steps:|Sampler:|CFG\s*scale:|Seed:|Size:|Model hash:|Model:|Denoising strength:|Hires|Clip skip:|Created Date:|Civitai resources:|Civitai metadata:|Hashes:)\s*",
    )
    .expect("valid tail-marker regex")
});

const A1111_MARKERS: &[&str] = &[
    "steps:",
    "sampler:",
    "cfg scale:",
    "seed:",
    "size:",
    "model hash:",
    "model:",
    "denoising strength:",
    "clip skip:",
    "hires",
    "lora:",
    "<lora:",
];

/// Whether a text blob smells like an A1111 parameter block.
pub fn looks_like_a1111_text(s: &str) -> bool {
    let low = s.to_lowercase();
    A1111_MARKERS.iter().any(|m| low.contains(m)) || low.contains("negative prompt:")
}

/// Truncates at the first parameter tail marker, trimmed.
pub fn cut_at_tail_markers(s: &str) -> String {
    match RE_TAIL_ANY.find(s) {
        Some(m) => s[..m.start()].trim().to_string(),
        None => s.trim().to_string(),
    }
}

/// Keeps negative text out of positive text when the blob is messy.
///
/// If `Negative prompt:` appears inside the positive side, splits at its
/// first occurrence; the right side fills an unset negative. Both sides are
/// then cut at parameter tail markers, and empty sides become `None`.
pub fn enforce_pos_neg_separation(
    pos: Option<&str>,
    neg: Option<&str>,
) -> (Option<String>, Option<String>) {
    let mut p = pos
        .filter(|s| !s.trim().is_empty())
        .map(clean_ws)
        .filter(|s| !s.is_empty());
    let mut n = neg
        .filter(|s| !s.trim().is_empty())
        .map(clean_ws)
        .filter(|s| !s.is_empty());

    if let Some(ptext) = p.take() {
        if let Some(m) = RE_NEG_MARKER.find(&ptext) {
            let left = ptext[..m.start()].trim().to_string();
            let right = ptext[m.end()..].trim().to_string();
            p = if left.is_empty() { None } else { Some(left) };
            if !right.is_empty() && n.is_none() {
                n = Some(right);
            }
        } else {
            p = Some(ptext);
        }
    }

    p = p
        .map(|s| cut_at_tail_markers(&s))
        .filter(|s| !s.is_empty());
    n = n
        .map(|s| cut_at_tail_markers(&s))
        .filter(|s| !s.is_empty());

    (p, n)
}
