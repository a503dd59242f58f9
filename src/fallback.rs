//! Fallback Resolver: finds a lyrics video when the primary video is blocked.
//!
//! Four fixed query variants are tried in order, five results each. A result
//! qualifies when its title carries a lyrics keyword and, if both durations
//! are known, it is within [`DURATION_TOLERANCE_SECS`] of the track. If no
//! result qualifies anywhere, the first result of the first non-empty query
//! is returned.

use std::process::Command;
use std::time::Duration;

use log::{debug, warn};

use crate::error::SearchError;
use crate::fetcher::{run_with_timeout, YtDlp};
use crate::normalize::clean_search_term;

pub const RESULTS_PER_QUERY: usize = 5;
pub const DURATION_TOLERANCE_SECS: f64 = 30.0;
const LYRICS_KEYWORDS: &[&str] = &["lyrics", "lyric", "official lyric"];
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// One search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub video_id: String,
    pub title: String,
    pub duration_secs: Option<f64>,
}

impl SearchHit {
    pub fn is_lyrics_video(&self) -> bool {
        let lower = self.title.to_lowercase();
        LYRICS_KEYWORDS.iter().any(|k| lower.contains(k))
    }
}

/// External video search collaborator.
pub trait VideoSearch: Send + Sync {
    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, SearchError>;
}

/// The four query variants, in the order they are tried.
pub fn query_variants(song_name: &str, artist_name: &str) -> [String; 4] {
    let song = clean_search_term(song_name);
    let artist = clean_search_term(artist_name);
    [
        format!("{} {} lyrics", artist, song),
        format!("{} {} lyric video", artist, song),
        format!("{} {} lyrics", song, artist),
        format!("{} lyrics {}", song, artist),
    ]
}

fn qualifies(hit: &SearchHit, expected_duration: Option<f64>) -> bool {
    if !hit.is_lyrics_video() {
        return false;
    }
    match (expected_duration, hit.duration_secs) {
        (Some(expected), Some(actual)) => (actual - expected).abs() <= DURATION_TOLERANCE_SECS,
        // No duration check possible: the keyword alone decides.
        _ => true,
    }
}

/// Find an alternative video id for a blocked track.
///
/// Search failures are treated as empty result sets. Returns `None` only if
/// every query came back empty.
pub fn find_alternative(
    search: &dyn VideoSearch,
    song_name: &str,
    artist_name: &str,
    expected_duration_secs: Option<f64>,
) -> Option<String> {
    let mut first_result: Option<String> = None;

    for query in query_variants(song_name, artist_name) {
        let hits = match search.search(&query, RESULTS_PER_QUERY) {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Lyrics search '{}' failed: {}", query, e);
                continue;
            }
        };
        debug!("Lyrics search '{}' returned {} results", query, hits.len());

        if first_result.is_none() {
            first_result = hits.first().map(|h| h.video_id.clone());
        }

        if let Some(hit) = hits.iter().find(|h| qualifies(h, expected_duration_secs)) {
            debug!("Lyrics video accepted: {} ({})", hit.video_id, hit.title);
            return Some(hit.video_id.clone());
        }
    }

    if let Some(id) = &first_result {
        debug!("No lyrics-tagged result qualified, using first result {}", id);
    }
    first_result
}

// ============================================================================
// Duration Parsing
// ============================================================================

/// Parse `"213"`, `"213.0"`, `"3:33"` or `"1:02:03"` into seconds.
pub fn parse_duration(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("na") {
        return None;
    }
    let parts: Vec<&str> = text.split(':').collect();
    let secs = match parts.as_slice() {
        [s] => s.parse::<f64>().ok()?,
        [m, s] => m.parse::<u64>().ok()? as f64 * 60.0 + s.parse::<f64>().ok()?,
        [h, m, s] => {
            h.parse::<u64>().ok()? as f64 * 3600.0
                + m.parse::<u64>().ok()? as f64 * 60.0
                + s.parse::<f64>().ok()?
        }
        _ => return None,
    };
    (secs >= 0.0).then_some(secs)
}

// ============================================================================
// yt-dlp Search
// ============================================================================

/// Parse `id<TAB>duration<TAB>title` lines.
pub fn parse_search_output(stdout: &str) -> Vec<SearchHit> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(3, '\t');
            let video_id = fields.next()?.trim();
            let duration = fields.next()?;
            let title = fields.next().unwrap_or("").trim();
            if video_id.is_empty() {
                return None;
            }
            Some(SearchHit {
                video_id: video_id.to_string(),
                title: title.to_string(),
                duration_secs: parse_duration(duration),
            })
        })
        .collect()
}

impl VideoSearch for YtDlp {
    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, SearchError> {
        let mut cmd = Command::new(self.program());
        cmd.arg("--flat-playlist")
            .arg("--no-warnings")
            .args(["--print", "%(id)s\t%(duration)s\t%(title)s"])
            .arg(format!("ytsearch{}:{}", limit, query));

        let output = run_with_timeout(cmd, SEARCH_TIMEOUT)?.ok_or(SearchError::Timeout {
            secs: SEARCH_TIMEOUT.as_secs(),
        })?;
        if !output.status.success() {
            return Err(SearchError::Failed(output.stderr.trim().to_string()));
        }
        Ok(parse_search_output(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSearch;

    fn hit(id: &str, title: &str, duration: Option<f64>) -> SearchHit {
        SearchHit {
            video_id: id.to_string(),
            title: title.to_string(),
            duration_secs: duration,
        }
    }

    #[test]
    fn test_query_variants() {
        let q = query_variants("Don't Stop", "Queen");
        assert_eq!(q[0], "Queen Dont Stop lyrics");
        assert_eq!(q[1], "Queen Dont Stop lyric video");
        assert_eq!(q[2], "Dont Stop Queen lyrics");
        assert_eq!(q[3], "Dont Stop lyrics Queen");
    }

    #[test]
    fn test_accepts_lyrics_video_within_tolerance() {
        let search = ScriptedSearch::new(vec![vec![
            hit("far", "Song (Lyrics)", Some(300.0)),
            hit("near", "Song [Lyric Video]", Some(215.0)),
        ]]);
        assert_eq!(
            find_alternative(&search, "Song", "Artist", Some(210.0)),
            Some("near".to_string())
        );
    }

    #[test]
    fn test_missing_candidate_duration_skips_check() {
        let search = ScriptedSearch::new(vec![vec![
            hit("plain", "Song official audio", None),
            hit("lyrics", "Song lyrics", None),
        ]]);
        assert_eq!(
            find_alternative(&search, "Song", "Artist", Some(210.0)),
            Some("lyrics".to_string())
        );
    }

    #[test]
    fn test_no_expected_duration_accepts_first_lyrics_hit() {
        let search = ScriptedSearch::new(vec![vec![
            hit("a", "Song live", Some(100.0)),
            hit("b", "Song lyrics", Some(999.0)),
        ]]);
        assert_eq!(
            find_alternative(&search, "Song", "Artist", None),
            Some("b".to_string())
        );
    }

    #[test]
    fn test_later_query_can_qualify() {
        let search = ScriptedSearch::new(vec![
            vec![hit("first", "Song remix", Some(210.0))],
            vec![],
            vec![hit("third", "Song (Lyrics)", Some(205.0))],
        ]);
        assert_eq!(
            find_alternative(&search, "Song", "Artist", Some(210.0)),
            Some("third".to_string())
        );
        assert_eq!(search.queries().len(), 3);
    }

    #[test]
    fn test_falls_back_to_first_result_of_first_nonempty_query() {
        let search = ScriptedSearch::new(vec![
            vec![],
            vec![hit("x", "Song remix", None), hit("y", "Song cover", None)],
            vec![hit("z", "Song (Lyrics)", Some(500.0))],
            vec![],
        ]);
        assert_eq!(
            find_alternative(&search, "Song", "Artist", Some(210.0)),
            Some("x".to_string())
        );
        assert_eq!(search.queries().len(), 4);
    }

    #[test]
    fn test_all_queries_empty() {
        let search = ScriptedSearch::new(vec![]);
        assert_eq!(find_alternative(&search, "Song", "Artist", Some(210.0)), None);
        assert_eq!(search.queries().len(), 4);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("213"), Some(213.0));
        assert_eq!(parse_duration("213.5"), Some(213.5));
        assert_eq!(parse_duration("3:45"), Some(225.0));
        assert_eq!(parse_duration("1:02:03"), Some(3723.0));
        assert_eq!(parse_duration("NA"), None);
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration("1:2:3:4"), None);
    }

    #[test]
    fn test_parse_search_output() {
        let out = "abc\t213.0\tSong (Lyrics)\ndef\tNA\tOther\tTitle\n\n";
        let hits = parse_search_output(out);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0], hit("abc", "Song (Lyrics)", Some(213.0)));
        assert_eq!(hits[1].title, "Other\tTitle");
        assert_eq!(hits[1].duration_secs, None);
    }
}
