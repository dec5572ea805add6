pub mod level;
pub mod manager;
pub mod metrics;
pub mod snapshot;
pub mod validation;

pub use level::{BookLevel, CumulativeLevel, LevelPool, LevelUpdate, Price};
pub use manager::{BookSettings, BookStatus, Orderbook};
pub use metrics::BookMetrics;
pub use snapshot::BookSnapshot;
pub use validation::{OrderbookValidator, ValidationConfig, ValidationResult};
