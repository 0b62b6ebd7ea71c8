// Core decision engine
pub mod execution;
pub mod momentum;
pub mod overrides;

// Broker plumbing and persistence
pub mod broker;
pub mod journal;

// Shared infrastructure
pub mod config;
pub mod error;
pub mod util;

// Re-export commonly used types for convenience
pub use broker::{BrokerClient, HttpBroker, SimLedger};
pub use config::Config;
pub use error::{BrokerError, BrokerResult};
pub use execution::{AdmissionController, BracketManager, BracketState, Engine};
pub use journal::TradeJournal;
pub use momentum::{MomentumDetector, SignalDecision};
pub use overrides::OverrideStore;
