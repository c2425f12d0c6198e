// Settlement aggregation, lifecycle and payout statements
pub mod aggregator;
pub mod lifecycle;
pub mod notifier;
pub mod statement;

pub use aggregator::SettlementAggregator;
pub use lifecycle::SettlementLifecycle;
pub use notifier::{LoggingNotifier, SettlementNotifier};
pub use statement::SettlementStatement;
