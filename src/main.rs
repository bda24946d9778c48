use clap::Parser;
use marimo_guard::{cancel::CancelToken, cli, error::GuardError};
use tracing::{error, warn};

fn main() {
    let args = cli::Args::parse();
    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("interrupt received; shutting down");
        on_signal.cancel();
    }) {
        eprintln!("marimo-guard: cannot install signal handler: {e}");
    }

    match cli::dispatch(args, &cancel) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("{:#}", err);
            eprintln!("marimo-guard: {err:#}");
            std::process::exit(GuardError::exit_code_for(&err));
        }
    }
}
