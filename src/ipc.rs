mod dispatch;
mod pipeline;
mod runtime;
mod server;

pub use server::{DaemonOptions, client_request, run_daemon};
