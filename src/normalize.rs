//! String normalization shared by the download and tagging phases.
//!
//! Output filenames are derived here. They depend on the Spotify title only,
//! never on anything the video provider returns, and are made unique per
//! batch before any worker starts, so two workers can never race on the
//! same file.

use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::{FxHashSet, FxHasher};
use std::hash::Hasher;
use unicode_normalization::UnicodeNormalization;

// ============================================================================
// REGEX PATTERNS
// ============================================================================

/// Control characters (C0, DEL, C1).
static CONTROL_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\x00-\x1f\x7f-\x9f]").unwrap());

/// Characters that are illegal in file names on at least one major platform.
static ILLEGAL_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f\x7f]"#).unwrap());

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").unwrap());

/// Video title suffixes that never belong in a track title.
static YOUTUBE_TITLE_SUFFIXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\s*\(Official\s+Music\s+Video\)").unwrap(),
        Regex::new(r"(?i)\s*\(Official\s+Video\)").unwrap(),
        Regex::new(r"(?i)\s*\(Lyrics?\)").unwrap(),
        Regex::new(r"(?i)\s*\(Lyric\s+Video\)").unwrap(),
        Regex::new(r"(?i)\s*\[Official\s+Music\s+Video\]").unwrap(),
        Regex::new(r"(?i)\s*\[Official\s+Video\]").unwrap(),
        Regex::new(r"(?i)\s*\[Lyrics?\]").unwrap(),
        Regex::new(r"(?i)\s*\[Lyric\s+Video\]").unwrap(),
        Regex::new(r"(?i)\s*\|\s*Official\s+Music\s+Video").unwrap(),
        Regex::new(r"(?i)\s*-\s*Official\s+Music\s+Video").unwrap(),
        Regex::new(r"(?i)\s*[\(\[]HD[\)\]]").unwrap(),
        Regex::new(r"(?i)\s*[\(\[]4K[\)\]]").unwrap(),
    ]
});

/// Noise stripped when a title has to be recovered from a file name.
static FILENAME_TITLE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\s*\(feat\..*?\)").unwrap(),
        Regex::new(r"\s*\[.*?\]").unwrap(),
        Regex::new(r"(?i)\s*-\s*Official.*").unwrap(),
    ]
});

/// DOS device names that cannot be used as a file stem on Windows.
const RESERVED_STEMS: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "LPT1", "LPT2", "LPT3",
];

/// Maximum length of a derived file stem, in characters.
pub const MAX_STEM_CHARS: usize = 120;

// ============================================================================
// CLEANING
// ============================================================================

/// Strip control characters, trim, and cap the length (in characters).
pub fn clean_string(text: &str, max_chars: Option<usize>) -> String {
    let cleaned = CONTROL_CHARS.replace_all(text.trim(), "");
    let cleaned = cleaned.trim();
    match max_chars {
        Some(max) if cleaned.chars().count() > max => {
            cleaned.chars().take(max).collect::<String>().trim().to_string()
        }
        _ => cleaned.to_string(),
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Length of the ` [xxxxxxxx]` suffix added to sanitized stems.
const HASH_SUFFIX_CHARS: usize = 11;

/// Stable 32-bit digest of a title, as 8 hex digits.
fn title_hash(title: &str) -> String {
    let mut hasher = FxHasher::default();
    hasher.write(title.as_bytes());
    let h = hasher.finish();
    format!("{:08x}", (h >> 32) as u32 ^ h as u32)
}

/// Strip illegal characters, collapse whitespace, cap the length and guard
/// DOS device names.
fn sanitize_stem(title: &str) -> String {
    let spaced = WHITESPACE_RUN.replace_all(title, " ");
    let stripped = ILLEGAL_FILENAME_CHARS.replace_all(&spaced, "");
    let collapsed = WHITESPACE_RUN.replace_all(stripped.trim(), " ");
    let capped = truncate_chars(&collapsed, MAX_STEM_CHARS);
    let stem = capped.trim_end_matches(['.', ' ']).trim_start();
    if RESERVED_STEMS.iter().any(|r| r.eq_ignore_ascii_case(stem)) {
        format!("{}_", stem)
    } else {
        stem.to_string()
    }
}

/// Derive the output file stem for a track from its Spotify title.
///
/// A pure function of the title: the matched video never affects it. A
/// title that is already a safe file name is used as is. Otherwise the
/// sanitized form gets a hash of the full title appended, so "Why?" and
/// "Why" land in different files. Tracks without a usable title fall back
/// to `untitled-{index}`.
pub fn output_stem(spotify_title: Option<&str>, original_index: usize) -> String {
    let composed: String = spotify_title.unwrap_or("").nfc().collect();
    let sanitized = sanitize_stem(&composed);

    if sanitized.is_empty() {
        return format!("untitled-{}", original_index);
    }
    if sanitized == composed {
        return sanitized;
    }

    let base = truncate_chars(&sanitized, MAX_STEM_CHARS - HASH_SUFFIX_CHARS)
        .trim_end_matches(['.', ' ']);
    let base = if base.is_empty() { "untitled" } else { base };
    format!("{} [{}]", base, title_hash(&composed))
}

/// Make stems unique within one batch, ignoring case.
///
/// Input is in playlist order; later duplicates get ` (2)`, ` (3)`, ...
pub fn disambiguate_stems(stems: Vec<String>) -> Vec<String> {
    let mut taken: FxHashSet<String> = FxHashSet::default();
    stems
        .into_iter()
        .map(|stem| {
            let mut candidate = stem.clone();
            let mut n = 2;
            while !taken.insert(candidate.to_lowercase()) {
                candidate = format!("{} ({})", stem, n);
                n += 1;
            }
            candidate
        })
        .collect()
}

/// Remove "Official Video" / "Lyrics" / "HD" / "4K" style decorations.
pub fn clean_youtube_title(title: &str) -> String {
    let mut cleaned = title.to_string();
    for pattern in YOUTUBE_TITLE_SUFFIXES.iter() {
        cleaned = pattern.replace_all(&cleaned, "").to_string();
    }
    cleaned.trim().to_string()
}

/// Recover a plausible title from a file name (last-resort tag fallback).
pub fn title_from_filename(filename: &str) -> String {
    let stem = match filename.rfind('.') {
        Some(idx) if idx > 0 => &filename[..idx],
        _ => filename,
    };
    let mut name = stem.to_string();
    for pattern in FILENAME_TITLE_PATTERNS.iter() {
        name = pattern.replace_all(&name, "").to_string();
    }
    name.trim().to_string()
}

/// Strip punctuation from a search term.
pub fn clean_search_term(term: &str) -> String {
    let stripped = NON_WORD.replace_all(term, "");
    WHITESPACE_RUN.replace_all(stripped.trim(), " ").to_string()
}
