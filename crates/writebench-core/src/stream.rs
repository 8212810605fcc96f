// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Episode stream codec.
//!
//! One episode per line, canonical JSON encoding, no partial loads: the
//! first malformed record aborts the load with its record index. The
//! write path renders through [`crate::canon`], so serialize-then-load
//! round-trips to a structurally equal episode list and the on-disk
//! bytes are stable across runs and platforms.

use crate::canon::to_canonical_string;
use crate::episode::{Episode, EpisodeError, EpisodeId, Labels, Step};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use thiserror::Error;

/// Wire record for one episode. Exactly `steps` and `labels`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct EpisodeRecord {
    steps: Vec<Step>,
    labels: Labels,
}

/// Errors from loading or writing an episode stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Underlying I/O failure.
    #[error("[WB_STREAM_IO] {0}")]
    Io(#[from] std::io::Error),
    /// A record failed to parse.
    #[error("[WB_STREAM_PARSE] record {index}: {source}")]
    Parse {
        /// Zero-based record index within the stream.
        index: usize,
        /// Parser diagnostic.
        source: serde_json::Error,
    },
    /// A record parsed but violated the episode rules.
    #[error("[WB_STREAM_INVALID] record {index}: {source}")]
    Invalid {
        /// Zero-based record index within the stream.
        index: usize,
        /// Structural violation.
        source: EpisodeError,
    },
    /// A record could not be rendered for writing.
    #[error("[WB_STREAM_ENCODE] record {index}: {source}")]
    Encode {
        /// Zero-based record index within the stream.
        index: usize,
        /// Encoder diagnostic.
        source: serde_json::Error,
    },
}

/// Loads every episode from `reader`, assigning ids under `set`.
///
/// Blank lines are skipped and do not consume a record index. The load
/// is all-or-nothing: any malformed or invalid record fails the whole
/// call.
pub fn read_episodes<R: BufRead>(reader: R, set: &str) -> Result<Vec<Episode>, StreamError> {
    let mut episodes = Vec::new();
    let mut index = 0usize;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: EpisodeRecord =
            serde_json::from_str(&line).map_err(|source| StreamError::Parse { index, source })?;
        let episode = Episode {
            id: EpisodeId::new(set, index),
            steps: record.steps,
            labels: record.labels,
        };
        episode
            .validate()
            .map_err(|source| StreamError::Invalid { index, source })?;
        episodes.push(episode);
        index += 1;
    }
    Ok(episodes)
}

/// Writes `episodes` to `writer`, one canonical record per line.
pub fn write_episodes<W: Write>(mut writer: W, episodes: &[Episode]) -> Result<(), StreamError> {
    for (index, episode) in episodes.iter().enumerate() {
        writer.write_all(episode_line(episode, index)?.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

/// Renders one episode as its canonical wire line (no trailing newline).
pub fn episode_line(episode: &Episode, index: usize) -> Result<String, StreamError> {
    let record = EpisodeRecord {
        steps: episode.steps.clone(),
        labels: episode.labels.clone(),
    };
    let value =
        serde_json::to_value(&record).map_err(|source| StreamError::Encode { index, source })?;
    Ok(to_canonical_string(&value))
}
