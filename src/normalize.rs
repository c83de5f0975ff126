//! # Key Normalization
//!
//! Artist and title strings coming from tags are messy: mixed case, accents,
//! punctuation, full-width characters. Repetition accounting compares the
//! *normalized key* instead of the raw string, so `"Beyoncé"`, `"BEYONCE"` and
//! `"beyonce!"` all land in the same history bucket.

use unicode_normalization::UnicodeNormalization;

/// Shared key for every file whose artist normalizes to nothing.
pub const UNKNOWN_ARTIST: &str = "__unknown__";

/// Canonical comparison form of `raw`.
///
/// Lowercases, applies NFKD decomposition and keeps only alphanumeric
/// characters. Combining marks produced by the decomposition are dropped,
/// which is what folds `é` into `e`.
///
/// # Examples
///
/// ```
/// use spindle::normalize::key_norm;
///
/// assert_eq!(key_norm("Beyoncé"), "beyonce");
/// assert_eq!(key_norm("  AC/DC  "), "acdc");
/// ```
#[must_use]
pub fn key_norm(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .nfkd()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Artist key for history accounting.
///
/// Empty keys go to [`UNKNOWN_ARTIST`] when `unknown_bucket` is enabled,
/// so all untagged files share one artist slot. Otherwise `None`.
#[must_use]
pub fn artist_key(raw: &str, unknown_bucket: bool) -> Option<String> {
    let key = key_norm(raw);
    if !key.is_empty() {
        Some(key)
    } else if unknown_bucket {
        Some(UNKNOWN_ARTIST.to_string())
    } else {
        None
    }
}

/// Title key for history accounting. `None` when nothing survives.
#[must_use]
pub fn title_key(raw: &str) -> Option<String> {
    let key = key_norm(raw);
    (!key.is_empty()).then_some(key)
}
