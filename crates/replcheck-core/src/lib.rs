//! Foundational utilities shared across replcheck crates.
//!
//! Provides the EDN literal reader used to decode evaluation results, atomic
//! report writes, and the clock helpers behind request ids and deadlines.

pub mod atomic_io;
pub mod edn;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use edn::{parse_edn, EdnError, EdnValue};
pub use time_utils::{current_unix_timestamp_ms, remaining_until};
