use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use thiserror::Error;
use tracing::info;

use super::ScheduleEntry;
use crate::channel::ChannelSource;

/// `day/month/year hour:minute:second`, local time.
pub const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("failed to read schedule {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("line {line}: expected `<timestamp>, <channel>`, got {text:?}")]
    Malformed { line: usize, text: String },
    #[error("line {line}: invalid timestamp {value:?}: {source}")]
    Timestamp {
        line: usize,
        value: String,
        source: chrono::ParseError,
    },
    #[error("line {line}: invalid channel: {code}")]
    UnknownChannel { line: usize, code: String },
}

/**
    Read and parse a schedule file.

    Any bad line fails the whole load, no entries are returned in that case.
*/
pub fn load_schedule(
    path: impl AsRef<Path>,
    channels: &ChannelSource,
) -> Result<Vec<ScheduleEntry>, ScheduleError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ScheduleError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let entries = parse_schedule(&contents, channels)?;
    info!(path = %path.display(), count = entries.len(), "loaded schedule");

    Ok(entries)
}

/**
    Parse schedule text, one `<dd/mm/yyyy HH:MM:SS>, <channel code>` per line.

    A leading byte order mark and blank lines are ignored. Channel codes are matched case-insensitively
    against the channel registry's schedule vocabulary.
*/
pub fn parse_schedule(
    contents: &str,
    channels: &ChannelSource,
) -> Result<Vec<ScheduleEntry>, ScheduleError> {
    contents
        .trim_start_matches('\u{feff}')
        .lines()
        .enumerate()
        .filter(|(_, text)| !text.trim().is_empty())
        .map(|(index, text)| parse_line(index + 1, text, channels))
        .collect()
}

fn parse_line(
    line: usize,
    text: &str,
    channels: &ChannelSource,
) -> Result<ScheduleEntry, ScheduleError> {
    let Some((timestamp, code)) = text.split_once(',') else {
        return Err(ScheduleError::Malformed {
            line,
            text: text.to_string(),
        });
    };

    let timestamp = timestamp.trim();
    let scheduled_at = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).map_err(
        |source| ScheduleError::Timestamp {
            line,
            value: timestamp.to_string(),
            source,
        },
    )?;

    let code = code.trim();
    let channel = channels
        .lookup_code(code)
        .ok_or_else(|| ScheduleError::UnknownChannel {
            line,
            code: code.to_string(),
        })?;

    Ok(ScheduleEntry::new(scheduled_at, channel.clone()))
}
