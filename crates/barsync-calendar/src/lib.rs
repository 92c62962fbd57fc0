#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/barsync/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

/// Single-venue calendars and their builder.
pub mod exchange;
/// Holiday and early-close rules.
pub mod rules;
/// Multi-venue oracle.
pub mod set;

pub use exchange::{ExchangeCalendar, ExchangeCalendarBuilder};
pub use set::{CalendarConfig, CalendarSet};
