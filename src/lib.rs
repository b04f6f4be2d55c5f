//! Test-harness supervisor for a FUSE filesystem running in foreground mount
//! mode: start it, wait for readiness, unmount it, and decide whether the run
//! was clean.

pub mod classify;
pub mod config;
pub mod lock;
pub mod memcheck;
pub mod report;
pub mod runner;
pub mod supervisor;
pub mod timestamp;
pub mod watcher;
