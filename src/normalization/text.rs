use std::collections::HashSet;

/// Delimiter used inside catalog keys.
pub const KEY_DELIMITER: char = '_';
/// Delimiter used inside slugs.
pub const SLUG_DELIMITER: char = '-';
/// Upper bound for the label part of a slug; the disambiguator is appended after.
pub const MAX_SLUG_LEN: usize = 96;

/// Build the case-insensitive comparison key for a free-text label.
///
/// Normalization steps:
/// - trim whitespace and lowercase
/// - fold accented Latin letters to their ASCII base via a fixed map
/// - turn whitespace and separators into a single `_`
/// - drop anything that is not an ASCII letter or digit
///
/// The result is empty for blank input. Never fails.
pub fn normalize(label: &str) -> String {
    fold(label, KEY_DELIMITER)
}

/// URL-safe slug for a label, with an optional disambiguator appended
/// (for example an external source id) when distinct entities share a name.
pub fn slug(label: &str, disambiguator: Option<&str>) -> String {
    let base = clamp_slug(&fold(label, SLUG_DELIMITER));
    let suffix = disambiguator
        .map(|d| fold(d, SLUG_DELIMITER))
        .unwrap_or_default();
    match (base.is_empty(), suffix.is_empty()) {
        (_, true) => base,
        (true, false) => suffix,
        (false, false) => format!("{base}{SLUG_DELIMITER}{suffix}"),
    }
}

/// Hands out slugs that are unique within one allocator, appending `-2`,
/// `-3`, ... to repeats.
#[derive(Debug, Default)]
pub struct SlugAllocator {
    taken: HashSet<String>,
}

impl SlugAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, candidate: &str) -> String {
        if self.taken.insert(candidate.to_string()) {
            return candidate.to_string();
        }
        let mut n = 2u32;
        loop {
            let attempt = format!("{candidate}{SLUG_DELIMITER}{n}");
            if self.taken.insert(attempt.clone()) {
                return attempt;
            }
            n += 1;
        }
    }
}

fn fold(label: &str, delimiter: char) -> String {
    let mut out = String::with_capacity(label.len());
    let mut pending_delim = false;
    for raw in label.trim().chars().flat_map(char::to_lowercase) {
        let ch = strip_diacritic(raw);
        if ch.is_ascii_alphanumeric() {
            if pending_delim && !out.is_empty() {
                out.push(delimiter);
            }
            pending_delim = false;
            out.push(ch);
        } else if is_separator(ch) {
            pending_delim = true;
        }
    }
    out
}

fn is_separator(ch: char) -> bool {
    ch.is_whitespace() || matches!(ch, '-' | '_' | '/' | '\\' | '.' | ',' | ';' | ':' | '|' | '+')
}

fn strip_diacritic(ch: char) -> char {
    match ch {
        'á' | 'à' | 'ä' | 'â' | 'ã' | 'å' => 'a',
        'é' | 'è' | 'ë' | 'ê' => 'e',
        'í' | 'ì' | 'ï' | 'î' => 'i',
        'ó' | 'ò' | 'ö' | 'ô' | 'õ' => 'o',
        'ú' | 'ù' | 'ü' | 'û' => 'u',
        'ñ' => 'n',
        'ç' => 'c',
        'ý' | 'ÿ' => 'y',
        other => other,
    }
}

fn clamp_slug(slug: &str) -> String {
    if slug.len() <= MAX_SLUG_LEN {
        return slug.to_string();
    }
    // slug is pure ASCII at this point, so byte slicing is safe
    slug[..MAX_SLUG_LEN]
        .trim_end_matches(SLUG_DELIMITER)
        .to_string()
}
