pub mod snapshot;
pub mod status;
pub mod transition;

pub use snapshot::Snapshot;
pub use status::Status;
pub use transition::{event_type_matches, Transition};
