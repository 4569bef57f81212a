//! Reading and writing JSON-lines event logs.
//!
//! Tools driving the tracker print one JSON object per event, interleaved
//! with free-text progress output:
//!
//! ```text
//! issuing KVM_TRACK_PAGE call for page 1
//! entering poll loop
//! {"id":2,"faulted_gpa":985686016,"error_code":20,"have_rip_info":true,...}
//! done!
//! ```
//!
//! [`parse_log`] keeps every line starting with `{` and skips the rest.  A
//! `{` line that does not decode is an error for the whole log.

use crate::events::Event;
use log::warn;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed event on line {line_number}: {source} (line: {line})")]
    MalformedEvent {
        line_number: usize,
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode a single JSON-encoded event.
pub fn parse_event(line: &str) -> Result<Event, ParseError> {
    serde_json::from_str(line).map_err(|source| ParseError::MalformedEvent {
        line_number: 1,
        line: line.to_string(),
        source,
    })
}

/// One-shot operator notices.  Lives for a single parse call so that
/// concurrent parses never share "already warned" state.
#[derive(Debug, Default)]
struct LogNotices {
    skipped_lines: usize,
    events_without_rip: usize,
}

impl LogNotices {
    fn skipped(&mut self) {
        if self.skipped_lines == 0 {
            warn!("omitting non-JSON lines");
        }
        self.skipped_lines += 1;
    }

    fn missing_rip(&mut self) {
        if self.events_without_rip == 0 {
            warn!("some entries do not have RIP info");
        }
        self.events_without_rip += 1;
    }
}

fn parse_lines<R: BufRead>(
    mut reader: R,
    notices: &mut LogNotices,
) -> Result<Vec<Event>, ParseError> {
    let mut events = Vec::new();
    let mut buf = Vec::new();
    let mut line_number = 0;

    // Lines are handled as bytes; noise output need not be UTF-8.
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        line_number += 1;

        let line = trim_line_end(&buf);
        if !line.starts_with(b"{") {
            notices.skipped();
            continue;
        }

        let event: Event =
            serde_json::from_slice(line).map_err(|source| ParseError::MalformedEvent {
                line_number,
                line: String::from_utf8_lossy(line).into_owned(),
                source,
            })?;

        if !event.have_rip_info {
            notices.missing_rip();
        }
        events.push(event);
    }

    Ok(events)
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Parse a log, returning its events in file order.
///
/// Non-`{` lines are skipped (one warning per call).  Empty input yields
/// an empty vector.
pub fn parse_log<R: BufRead>(reader: R) -> Result<Vec<Event>, ParseError> {
    let mut notices = LogNotices::default();
    parse_lines(reader, &mut notices)
}

/// [`parse_log`] on a file.
pub fn parse_log_file(path: impl AsRef<Path>) -> Result<Vec<Event>, ParseError> {
    let file = File::open(path.as_ref())?;
    parse_log(BufReader::new(file))
}

/// Events satisfying `predicate`, in order.  Borrows; no records are copied.
pub fn filter_events<'a, F>(events: &'a [Event], mut predicate: F) -> Vec<&'a Event>
where
    F: FnMut(&Event) -> bool,
{
    events.iter().filter(|e| predicate(e)).collect()
}

/// Write `events` as JSON lines, readable again with [`parse_log`].
pub fn write_events<W: Write>(mut writer: W, events: &[Event]) -> Result<(), ParseError> {
    for event in events {
        serde_json::to_writer(&mut writer, event).map_err(std::io::Error::from)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}
