use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::MergeError;

/// Lower-cased, diacritic-free `[a-z0-9]` slug of `display_name`, or `fallback`
/// when nothing survives.
pub fn login_slug(display_name: &str, fallback: &str) -> String {
    let slug = slugify(display_name);
    if slug.is_empty() {
        let fallback = slugify(fallback);
        if fallback.is_empty() {
            return "team".to_string();
        }
        return fallback;
    }
    slug
}

/// Fallback slug source for an actor: its internal code, else `team` plus the
/// first eight hex digits of its id.
pub fn fallback_for(code: Option<&str>, id: Uuid) -> String {
    code.map(slugify)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("team{}", &id.simple().to_string()[..8]))
}

fn slugify(text: &str) -> String {
    text.nfd()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Try `base`, then `base1`, `base2`, ... until `is_taken` says no. Gives up
/// after `max_attempts` candidates.
pub fn reserve_unique_key(
    base: &str,
    max_attempts: usize,
    mut is_taken: impl FnMut(&str) -> bool,
) -> Result<String, MergeError> {
    for attempt in 0..max_attempts {
        let candidate = if attempt == 0 {
            base.to_string()
        } else {
            format!("{base}{attempt}")
        };
        if !is_taken(&candidate) {
            return Ok(candidate);
        }
    }
    Err(MergeError::CollisionExhausted {
        base: base.to_string(),
        attempts: max_attempts,
    })
}
