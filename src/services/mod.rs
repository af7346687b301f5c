pub mod classifier;
pub mod dispatch;
pub mod fs_service;
pub mod pool;
pub mod watcher;
