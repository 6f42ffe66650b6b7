use std::sync::LazyLock;

use regex::Regex;

use crate::types::ContainerKey;

static RE_FLAIR_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":[^:\s]+:").unwrap());
static RE_LEADING_DECOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\p{L}\p{N}]+").unwrap());
static RE_TRAILING_DECOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}]+$").unwrap());
static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static RE_LABEL_EPISODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bepisode\s*(\d{1,3})\b").unwrap());
static RE_LABEL_PRESEASON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)pre[-\s]?season").unwrap());
static RE_LABEL_POSTSEASON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)post[-\s]?season").unwrap());

static RE_COMMUNITY_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^https?://(?:www\.)?reddit\.com/r/").unwrap());
static RE_COMMUNITY_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^/?r/").unwrap());

// --- Flair ---

fn collapse_whitespace(value: &str) -> String {
    RE_WHITESPACE.replace_all(value, " ").trim().to_string()
}

/// Display form of a flair: `:emoji:` markers removed, edge decoration
/// stripped, whitespace collapsed. `None` when nothing is left.
pub fn normalize_flair(raw: &str) -> Option<String> {
    let without_tokens = RE_FLAIR_TOKEN.replace_all(raw, " ");
    let mut next = collapse_whitespace(&without_tokens);

    loop {
        let stripped = RE_LEADING_DECOR.replace(&next, "");
        let stripped = RE_TRAILING_DECOR.replace(&stripped, "").into_owned();
        if stripped == next {
            break;
        }
        next = stripped;
    }

    let next = collapse_whitespace(&next);
    (!next.is_empty()).then_some(next)
}

/// Comparison key for flairs. Two flairs are the same if their keys match.
pub fn flair_key(raw: &str) -> Option<String> {
    normalize_flair(raw).map(|f| f.to_lowercase())
}

// --- Window tokens ---

/// Parse a window token from a URL or a canonical key.
///
/// Accepts `w0`, `w-postseason`, `eN`, legacy `wN`, and the canonical
/// `period-preseason` / `period-postseason` / `episode-N`.
pub fn parse_window_token(token: &str) -> Option<ContainerKey> {
    let normalized = token.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "" => None,
        "w0" | "period-preseason" => Some(ContainerKey::PreSeason),
        "w-postseason" | "period-postseason" => Some(ContainerKey::PostSeason),
        other => {
            let digits = other
                .strip_prefix("episode-")
                .or_else(|| other.strip_prefix('e'))
                .or_else(|| other.strip_prefix('w'))?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse().ok().map(ContainerKey::Episode)
        }
    }
}

/// Short URL token for a window.
pub fn to_window_token(key: ContainerKey) -> String {
    match key {
        ContainerKey::PreSeason => "w0".to_string(),
        ContainerKey::PostSeason => "w-postseason".to_string(),
        ContainerKey::Episode(n) => format!("e{n}"),
    }
}

// --- Period labels ---

/// Match a free-text period label. Episode numbers win over season markers.
pub fn match_period_label(label: &str) -> Option<ContainerKey> {
    let label = label.trim();
    if label.is_empty() {
        return None;
    }
    if let Some(caps) = RE_LABEL_EPISODE.captures(label) {
        if let Ok(n) = caps[1].parse::<u32>() {
            return Some(ContainerKey::Episode(n));
        }
    }
    if RE_LABEL_PRESEASON.is_match(label) {
        return Some(ContainerKey::PreSeason);
    }
    if RE_LABEL_POSTSEASON.is_match(label) {
        return Some(ContainerKey::PostSeason);
    }
    None
}

// --- Communities ---

/// Bare lowercase community slug from a URL, `r/name`, or plain name.
pub fn normalize_community(value: &str) -> Option<String> {
    let cleaned = RE_COMMUNITY_URL.replace(value.trim(), "");
    let cleaned = RE_COMMUNITY_PREFIX.replace(&cleaned, "");
    let cleaned = cleaned.trim_matches('/');
    let slug = cleaned
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .to_lowercase();
    (!slug.is_empty()).then_some(slug)
}
