use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const LEVELS: [&str; 2] = ["basico", "medio"];

/// Comparison key for free text: lower-cased, accents stripped, whitespace collapsed.
///
/// Lower-casing happens before decomposition so characters whose lower-case
/// form introduces a combining mark (e.g. `İ`) still normalize in one pass.
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped = lowered
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>();
    collapse_whitespace(&stripped)
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for word in s.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Canonical course key of the form `"<number> <level>"`, e.g. `"4 basico"`.
///
/// Falls back to the normalized text when no number/level pair is present.
pub fn canonicalize_course(text: &str) -> String {
    let base = normalize(text)
        .chars()
        .filter(|c| !matches!(c, 'º' | '°' | 'ª'))
        .collect::<String>();
    let base = collapse_whitespace(&base);

    let Some(start) = base.find(|c: char| c.is_ascii_digit()) else {
        return base;
    };
    let digits = base[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .take(2)
        .collect::<String>();
    let rest = &base[start + digits.len()..];

    // Last level token after the number wins.
    let level = LEVELS
        .iter()
        .filter_map(|lvl| rest.rfind(lvl).map(|pos| (pos, *lvl)))
        .max_by_key(|(pos, _)| *pos)
        .map(|(_, lvl)| lvl);

    match level {
        Some(lvl) => format!("{} {}", digits, lvl),
        None => base,
    }
}

/// Government identifier key: punctuation and spaces removed, lower-cased.
pub fn identifier_key(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Id-safe slug: normalized words joined by `_`, restricted to `[a-z0-9_-]`.
pub fn slug(text: &str) -> String {
    normalize(text)
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect()
}

/// Joins non-empty slugs with `-`.
pub fn slug_join(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| slug(p))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
