//! Transaction concurrency core: transactions, the row locker and the
//! process-wide transaction registry.

pub mod holder;
pub mod locker;
pub mod transaction;

pub use holder::TransactionHolder;
pub use locker::Locker;
pub use transaction::Transaction;
