mod actions;
mod cli;
mod conditioner;
mod config;
mod error;
mod event;
mod frame;
mod gsm;
mod ipc;
mod logging;
mod panic;
mod pinch;
mod queue;
mod session;
mod source;

fn main() -> anyhow::Result<()> {
    logging::init();
    cli::run()
}
