//! System plumbing: message types, shared flags, and the front-end facade
//! that owns the tracker thread.

pub mod frontend;
pub mod messages;
pub mod shared_state;

pub use frontend::FrontendSystem;
pub use shared_state::SharedState;
