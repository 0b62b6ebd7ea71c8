/// Shared utilities

pub mod clock;
pub mod heartbeat;

pub use clock::{is_crypto, MarketCalendar, NyseCalendar};
pub use heartbeat::Heartbeat;
