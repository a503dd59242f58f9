//! In-memory collaborators for unit tests. None of them sleep or touch the network.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::artwork::{ArtworkService, ImageData};
use crate::backoff::Pause;
use crate::error::{ArtworkError, FetchError, SearchError, TagError};
use crate::fallback::{SearchHit, VideoSearch};
use crate::fetcher::{AudioFetcher, FetchRequest, FetchedAudio};
use crate::scheduler::StopFlag;
use crate::tagger::{TagRecord, TagWriter};

const MP3_FRAME_LEN: usize = 417;

/// A few hundred silent MPEG-1 Layer III frames (128 kbps, 44.1 kHz).
pub fn silent_mp3_bytes() -> Vec<u8> {
    let mut frame = vec![0u8; MP3_FRAME_LEN];
    frame[..4].copy_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);
    frame.repeat(40)
}

pub fn write_silent_mp3(path: &Path) {
    std::fs::write(path, silent_mp3_bytes()).unwrap();
}

/// JPEG signature followed by padding; enough to pass validation.
pub fn fake_jpeg() -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
    bytes.resize(256, 0);
    bytes
}

// ============================================================================
// Search
// ============================================================================

/// Returns the scripted result lists in call order, then empty lists.
pub struct ScriptedSearch {
    responses: Mutex<Vec<Vec<SearchHit>>>,
    queries: Mutex<Vec<String>>,
}

impl ScriptedSearch {
    pub fn new(mut responses: Vec<Vec<SearchHit>>) -> Self {
        responses.reverse();
        Self {
            responses: Mutex::new(responses),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

impl VideoSearch for ScriptedSearch {
    fn search(&self, query: &str, _limit: usize) -> Result<Vec<SearchHit>, SearchError> {
        self.queries.lock().unwrap().push(query.to_string());
        Ok(self.responses.lock().unwrap().pop().unwrap_or_default())
    }
}

// ============================================================================
// Fetching
// ============================================================================

#[derive(Debug, Clone)]
pub enum FetchScript {
    /// Fails with `FetchError::Failed` carrying this provider text
    Fail(&'static str),
    Unavailable(&'static str),
    Timeout,
    /// Reports success but writes nothing
    SucceedWithoutFile,
    /// Sleeps, then succeeds
    Delayed(Duration),
    Panic,
}

/// Succeeds for every video id unless scripted otherwise. Success writes a
/// silent MP3 to the expected path.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: HashMap<String, FetchScript>,
    stop_after: Option<(String, StopFlag)>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedFetcher {
    pub fn script(mut self, video_id: &str, script: FetchScript) -> Self {
        self.scripts.insert(video_id.to_string(), script);
        self
    }

    /// Raise `stop` once `video_id` has been fetched.
    pub fn stop_after(mut self, video_id: &str, stop: StopFlag) -> Self {
        self.stop_after = Some((video_id.to_string(), stop));
        self
    }

    /// `(video_id, filename_stem)` for every fetch, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn write(request: &FetchRequest<'_>) -> Result<FetchedAudio, FetchError> {
        let path = request.expected_path();
        std::fs::create_dir_all(request.target_dir)?;
        std::fs::write(&path, silent_mp3_bytes())?;
        Ok(FetchedAudio { path })
    }
}

impl AudioFetcher for ScriptedFetcher {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchedAudio, FetchError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.video_id.to_string(), request.filename_stem.to_string()));

        let result = match self.scripts.get(request.video_id) {
            None => Self::write(request),
            Some(FetchScript::Fail(text)) => Err(FetchError::Failed {
                message: text.to_string(),
            }),
            Some(FetchScript::Unavailable(text)) => Err(FetchError::Unavailable {
                message: text.to_string(),
            }),
            Some(FetchScript::Timeout) => Err(FetchError::Timeout { secs: 300 }),
            Some(FetchScript::SucceedWithoutFile) => Ok(FetchedAudio {
                path: request.expected_path(),
            }),
            Some(FetchScript::Delayed(d)) => {
                std::thread::sleep(*d);
                Self::write(request)
            }
            Some(FetchScript::Panic) => panic!("scripted panic for {}", request.video_id),
        };

        if let Some((id, stop)) = &self.stop_after {
            if id == request.video_id {
                stop.stop();
            }
        }
        result
    }
}

// ============================================================================
// Pausing
// ============================================================================

#[derive(Default)]
pub struct RecordingPause {
    pauses: Mutex<Vec<Duration>>,
}

impl RecordingPause {
    pub fn pauses(&self) -> Vec<Duration> {
        self.pauses.lock().unwrap().clone()
    }
}

impl Pause for RecordingPause {
    fn pause(&self, duration: Duration) {
        self.pauses.lock().unwrap().push(duration);
    }
}

// ============================================================================
// Tagging and Artwork
// ============================================================================

/// Records tag writes; fails for file names listed with `failing_on`.
#[derive(Default)]
pub struct RecordingTagger {
    failing: Vec<String>,
    writes: Mutex<Vec<(PathBuf, TagRecord)>>,
}

impl RecordingTagger {
    pub fn failing_on(mut self, file_name: &str) -> Self {
        self.failing.push(file_name.to_string());
        self
    }

    pub fn writes(&self) -> Vec<(PathBuf, TagRecord)> {
        self.writes.lock().unwrap().clone()
    }
}

impl TagWriter for RecordingTagger {
    fn apply_tags(&self, path: &Path, record: &TagRecord) -> Result<(), TagError> {
        self.writes
            .lock()
            .unwrap()
            .push((path.to_path_buf(), record.clone()));
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.failing.contains(&name) {
            return Err(TagError::Corrupted(path.to_path_buf()));
        }
        Ok(())
    }
}

/// Serves configured image bytes by URL; unknown URLs fail.
#[derive(Default)]
pub struct FakeArtwork {
    cover_urls: Option<Vec<String>>,
    images: HashMap<String, Vec<u8>>,
    fetched: Mutex<Vec<String>>,
    embedded: Mutex<Vec<PathBuf>>,
}

impl FakeArtwork {
    pub fn with_cover_urls(mut self, urls: Vec<String>) -> Self {
        self.cover_urls = Some(urls);
        self
    }

    pub fn with_image(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.images.insert(url.to_string(), bytes);
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn embedded(&self) -> Vec<PathBuf> {
        self.embedded.lock().unwrap().clone()
    }
}

impl ArtworkService for FakeArtwork {
    fn cover_urls(&self, _spotify_url: &str) -> Result<Vec<String>, ArtworkError> {
        self.cover_urls
            .clone()
            .ok_or_else(|| ArtworkError::Http("oEmbed unavailable".to_string()))
    }

    fn fetch_image(&self, url: &str) -> Result<Vec<u8>, ArtworkError> {
        self.fetched.lock().unwrap().push(url.to_string());
        self.images
            .get(url)
            .cloned()
            .ok_or_else(|| ArtworkError::Http(format!("404 for {}", url)))
    }

    fn embed(&self, path: &Path, _image: &ImageData) -> Result<(), ArtworkError> {
        self.embedded.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}
