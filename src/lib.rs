//! Playlist fetch library - download and tagging pipeline shared by the binaries.

pub mod applier;
pub mod artwork;
pub mod backoff;
pub mod error;
pub mod fallback;
pub mod fetcher;
pub mod models;
pub mod normalize;
pub mod paths;
pub mod pipeline;
pub mod progress;
pub mod scheduler;
pub mod status;
pub mod tagger;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;
