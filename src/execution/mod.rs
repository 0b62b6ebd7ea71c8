/// Execution system: admission control, bracket management, polling engine

pub mod admission;
pub mod bracket;
pub mod engine;

pub use admission::{AdmissionController, PositionCheck};
pub use bracket::{BracketManager, BracketState};
pub use engine::Engine;
