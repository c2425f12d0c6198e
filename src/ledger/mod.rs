pub mod memory;
pub mod models;
pub mod repository;
pub mod store;

pub use memory::MemoryLedger;
pub use repository::PgLedgerRepository;
pub use store::{Page, PageRequest, QueueFilter, ReconStore, SettlementFilter, TransactionCallback};
