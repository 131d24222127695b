//! Run scheduling: which window of history to archive and how to ask for it.

pub mod query;
pub mod window;

pub use query::{Candidate, ScopedQuery, Scope};
pub use window::{band_for_position, select_window, Band, CycleState, RunCursor, Window};
