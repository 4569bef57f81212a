//! Marker-page segmentation of event logs.
//!
//! A victim program executes a "marker" page at known points (for example
//! before and after each call to a target function).  Events whose RIP lies
//! on the marker page split the trace; the events strictly between two
//! consecutive marker hits form one window.

use crate::events::Event;
use crate::verified::segmentation::segment_by_marker;

/// Indices (into `events`) of the events between consecutive marker-page
/// hits.
///
/// With fewer than two marker hits the result is empty.  Two adjacent
/// hits produce an empty window.  Events without RIP info never count as
/// marker hits but can appear inside a window.
pub fn events_between_marker(events: &[Event], marker_vaddr: u64) -> Vec<Vec<usize>> {
    let rips: Vec<Option<u64>> = events.iter().map(Event::rip).collect();
    segment_by_marker(&rips, marker_vaddr)
}

/// Like [`events_between_marker`] but resolves indices to the events
/// themselves.
pub fn event_windows(events: &[Event], marker_vaddr: u64) -> Vec<Vec<&Event>> {
    events_between_marker(events, marker_vaddr)
        .into_iter()
        .map(|window| window.into_iter().map(|i| &events[i]).collect())
        .collect()
}
