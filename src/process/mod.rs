//! Subprocess lifecycle management.

mod supervisor;

pub use supervisor::{ExitInfo, ProcessStreams, ProcessSupervisor};
