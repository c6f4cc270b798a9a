//! Process lifecycle helpers for long-running hosts.

pub mod shutdown;

pub use shutdown::ShutdownCoordinator;
