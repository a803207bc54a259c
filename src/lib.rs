pub mod attendance;
pub mod config;
pub mod directory;
pub mod identity;
pub mod lookup;
pub mod query;
pub mod rcon;

pub use attendance::{AttendanceTracker, SessionBuffer};
pub use config::{Config, OperationalWindow, POLL_INTERVAL, POLL_INTERVAL_MINUTES};
pub use identity::{IdentityMatch, IdentityResolver};
pub use rcon::RconClient;
