//! Agent definitions and the registry the crew draws them from

pub mod profile;
pub mod roster;

pub use profile::AgentProfile;
pub use roster::AgentRoster;
