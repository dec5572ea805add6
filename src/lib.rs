pub mod config;
pub mod error;
pub mod notify;
pub mod orderbook;
pub mod pool;
pub mod registry;
pub mod simulator;
pub mod sync;

pub use config::Config;
pub use error::{EngineError, Result};
pub use notify::{BookUpdate, Notifier, Subscription, UpdateKind};
pub use orderbook::{BookLevel, BookSnapshot, LevelPool, LevelUpdate, Orderbook, OrderbookValidator};
pub use pool::{ObjectPool, PoolStats, Poolable, Pooled};
pub use registry::BookRegistry;
pub use simulator::VenueSimulator;
pub use sync::{DeltaEvent, Reconciler, SnapshotEvent, SnapshotSource, SyncOutcome};
