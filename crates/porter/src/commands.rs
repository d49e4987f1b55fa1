//! Subcommand handlers. Each returns the JSON value printed on success.

use porter_oci::{Client, Config, ExportOptions, PushOptions};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::cli::{CliError, Commands};

/// Load the configuration file, or defaults when none is given.
pub fn load_config(path: Option<&Path>) -> Result<Config, CliError> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    if !path.is_file() {
        return Err(CliError::config_with_help(
            format!("config file not found: {}", path.display()),
            "Pass an existing file with --config or PORTER_CONFIG",
        ));
    }
    Config::load(path).map_err(|e| {
        CliError::config_with_help(
            format!("failed to load {}: {e}", path.display()),
            "The file must be YAML or JSON with registries, cache_dir and log_level keys",
        )
    })
}

/// Run one subcommand against `client`.
#[instrument(name = "command", skip_all, fields(command = command.name()))]
pub async fn run(
    command: Commands,
    client: &Client,
    cancel: &CancellationToken,
) -> Result<Value, CliError> {
    match command {
        Commands::Pull {
            reference,
            output,
            platforms,
            all_arch,
            insecure,
        } => {
            // Validate export flags before touching the network.
            let options = match output {
                Some(_) => Some(ExportOptions::from_selection(all_arch, &platforms)?),
                None => None,
            };
            let mut artifact = client.pull_artifact(&reference, insecure, cancel).await?;
            if let (Some(dest), Some(options)) = (output.as_deref(), options) {
                let files = client.export_artifact(&mut artifact, dest, &options)?;
                info!(files = files.len(), dest = %dest.display(), "Exported artifact");
            }
            to_json(&artifact)
        }
        Commands::Push {
            path,
            reference,
            insecure,
            no_tag_latest,
        } => {
            let options = PushOptions {
                insecure,
                tag_latest: !no_tag_latest,
            };
            let artifact = client
                .push_artifact(&path, &reference, options, cancel)
                .await?;
            to_json(&artifact)
        }
        Commands::List => to_json(&client.list_cached_artifacts()?),
        Commands::Export {
            id,
            dest,
            platforms,
            all_arch,
        } => {
            let options = ExportOptions::from_selection(all_arch, &platforms)?;
            let mut artifact = client.load_artifact(&id)?;
            client.export_artifact(&mut artifact, &dest, &options)?;
            to_json(&artifact)
        }
        Commands::Exec { id, plugin, args } => {
            to_json(&client.execute_plugin(&id, &plugin, args)?)
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, CliError> {
    serde_json::to_value(value).map_err(|e| CliError::Oci(e.into()))
}
