pub mod lifecycle;
pub mod reconciler;
pub mod sizing;
pub mod sweeper;
pub mod trade_locks;
