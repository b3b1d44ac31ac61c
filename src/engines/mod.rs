//! Engine workers and their control plane.
//!
//! One worker per (user, engine kind) plus the global fund engine and
//! position tracker. Workers are plain async loops owning nothing but a
//! store handle, a gateway handle, and a cancellation receiver.

pub mod arbitrage;
pub mod copy_trader;
pub mod fund_manager;
pub mod positions;
pub mod supervisor;

pub use arbitrage::ArbitrageScanner;
pub use copy_trader::CopyTrader;
pub use fund_manager::FundManager;
pub use positions::PositionTracker;
pub use supervisor::{EngineKey, EngineKind, Supervisor};
