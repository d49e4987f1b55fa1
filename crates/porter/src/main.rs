//! porter: pull, export and publish multi-platform OCI artifacts.

// The binary writes results to stdout and diagnostics to stderr.
#![allow(clippy::print_stdout, clippy::print_stderr)]

mod cli;
mod commands;
mod logging;

use clap::Parser;
use cli::{Cli, CliError, EXIT_CLI, EXIT_FAILURE, EXIT_OK, OkEnvelope, exit_code_for, render_error};
use logging::LogSettings;
use porter_oci::Client;
use tokio_util::sync::CancellationToken;

fn main() {
    // Tracing may not be usable during a panic.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panicked: {panic_info}");
        eprintln!("Internal error occurred. Run with RUST_LOG=debug for more information.");
    }));

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Fatal error: Failed to create tokio runtime: {e}");
            std::process::exit(EXIT_FAILURE);
        }
    };

    let exit_code = runtime.block_on(run(cli));
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> i32 {
    let config = match commands::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            render_error(e);
            return EXIT_CLI;
        }
    };

    let level = cli.level.as_deref().or(config.log_level.as_deref());
    let settings = LogSettings::resolve(level, Some(&cli.log_format));
    if let Err(e) = logging::init_tracing(&settings) {
        eprintln!("{e:?}");
        return EXIT_CLI;
    }

    let client = match Client::new(config) {
        Ok(client) => client,
        Err(e) => {
            let err = CliError::from(e);
            let code = exit_code_for(&err);
            render_error(err);
            return code;
        }
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    match commands::run(cli.command, &client, &cancel).await {
        Ok(data) => match serde_json::to_string_pretty(&OkEnvelope::new(data)) {
            Ok(json) => {
                println!("{json}");
                EXIT_OK
            }
            Err(e) => {
                render_error(CliError::other(format!("failed to encode result: {e}")));
                EXIT_FAILURE
            }
        },
        Err(err) => {
            let code = exit_code_for(&err);
            render_error(err);
            code
        }
    }
}
