pub mod config;
pub mod classify;
pub mod exit_signal;
pub mod ipc;
pub mod manager;
pub mod poller;
pub mod process;
pub mod supervisor;
pub mod transcript;

pub use ipc::{CommandRequest, OutputMessage, Request, Stream};
pub use manager::{ManagerOptions, TerminalManager};
