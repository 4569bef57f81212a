//! Host-side client and offline analysis for the sevstep page-fault tracker.
//!
//! The tracker is a patched KVM module that write- or access-protects guest
//! pages and reports each resulting fault to a registered userspace process.
//! This crate speaks its ioctl protocol and analyses the event logs that
//! tracking runs produce.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  Guest VM (plain or SEV)            │
//! └──────────────┬──────────────────────┘
//!                │ NPT fault on tracked page
//! ═══════════════╪══════════════════════════
//!                │ KVM + tracker patch
//! ┌──────────────▼──────────────────────┐
//! │  Tracker (kernel):                  │
//! │    page_fault_event_t queue,        │
//! │    batch buffer, retired-instr perf │
//! └──────────────┬──────────────────────┘
//!                │ ioctl(/dev/kvm)
//! ┌──────────────▼──────────────────────┐
//! │  sevstep-track (userspace)          │
//! │    TrackerClient → Event stream     │
//! │    → JSON-lines log (save/load)     │
//! │    → marker segmentation            │
//! └─────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ## Live tracking
//!
//! ```no_run
//! use sevstep_protocol::TrackMode;
//! use sevstep_track::client::{TrackerClient, TrackerConfig};
//!
//! let mut config = TrackerConfig::default();
//! config.want_rip = true;
//! let mut client = TrackerClient::open(&config).unwrap();
//!
//! client.track_all_pages(TrackMode::Access).unwrap();
//! if let Some(event) = client.poll_event().unwrap() {
//!     println!("{}", event);
//!     client.ack_event(event.id).unwrap();
//! }
//! client.close();
//! ```
//!
//! ## Log analysis
//!
//! ```no_run
//! use sevstep_track::parser::parse_log_file;
//! use sevstep_track::segmentation::events_between_marker;
//!
//! let events = parse_log_file("run.log").unwrap();
//! for window in events_between_marker(&events, 0x7ff1000) {
//!     println!("{} events between marker hits", window.len());
//! }
//! ```

pub mod client;
pub mod device;
pub mod events;
pub mod parser;
pub mod pf_error;
pub mod segmentation;
pub mod verified;

pub use sevstep_protocol::TrackMode;
