pub mod error;
pub mod limit;
pub mod retry;
pub mod traits;
pub mod types;

pub use error::MarketError;
pub use limit::RequestBudget;
pub use retry::RetryPolicy;
pub use traits::{HistoricalDataProvider, MarketDataSource};
pub use types::{Bar, Interval, MarketKind, TimeRange};
