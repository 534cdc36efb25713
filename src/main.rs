mod app;
mod args;
mod error;
mod host;
mod hostfxr;
mod nethost;
mod status;

use std::error::Error as _;

use tracing_subscriber::EnvFilter;

use crate::app::AppData;
use crate::args::HostArgs;
use crate::error::{HostError, Result};
use crate::host::HostOptions;

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn report(err: &HostError) {
    eprintln!("{}: {}", err.category(), err);
    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {}", cause);
        source = cause.source();
    }
}

fn run(app: AppData, options: &HostOptions) -> Result<i32> {
    let exe = host::host_executable()?;
    let app = app.resolve()?;
    host::run_app(&exe, &app, options)
}

fn main() {
    let (app, options, verbose) = HostArgs::parse_process_args().into_parts();
    init_tracing(verbose);

    let display_path = app.path.clone();
    let exit_code = match run(app, &options) {
        Ok(code) => code,
        Err(err) => {
            report(&err);
            HostError::EXIT_CODE
        }
    };

    println!("\nC# app '{}' exit code: {}", display_path.display(), exit_code);
    std::process::exit(exit_code);
}
