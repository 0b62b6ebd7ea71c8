/// Broker plumbing: collaborator interface, retry executor, dry-run ledger

pub mod backoff;
pub mod dry_run;
pub mod http;
pub mod positions;
pub mod traits;

pub use backoff::{with_backoff, with_backoff_policy, BackoffPolicy};
pub use dry_run::{CloseFill, SimLedger, SimOrder, SimPosition, SimTrade};
pub use http::HttpBroker;
pub use positions::{snapshot_from_listing, PositionSnapshot};
pub use traits::{BrokerClient, LimitSell, MarketBuy, MarketSell, OrderAck, SellOrder};
