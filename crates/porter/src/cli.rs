//! Command-line surface: argument parsing, error types and exit codes.

use clap::{Parser, Subcommand};
use miette::{Diagnostic, Report};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Successful run.
pub const EXIT_OK: i32 = 0;
/// Usage, input or configuration error.
pub const EXIT_CLI: i32 = 2;
/// The requested operation failed.
pub const EXIT_FAILURE: i32 = 3;
/// Interrupted by SIGINT (128 + 2).
pub const EXIT_SIGINT: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "porter")]
#[command(about = "Pull, export and publish multi-platform OCI artifacts")]
#[command(version)]
pub struct Cli {
    /// Configuration file (YAML or JSON)
    #[arg(long, global = true, env = "PORTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn or error
    #[arg(short = 'L', long = "level", global = true)]
    pub level: Option<String>,

    /// Log output format: pretty or json
    #[arg(long = "log-format", global = true, default_value = "pretty")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Pull an artifact into the local cache
    Pull {
        /// Registry reference, e.g. ghcr.io/acme/deployer:1.4.0
        reference: String,
        /// Export the pulled artifact to this path
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Platform to export (os/arch[/variant]); repeatable
        #[arg(long = "platform")]
        platforms: Vec<String>,
        /// Export every platform in the index
        #[arg(long)]
        all_arch: bool,
        /// Use plain HTTP
        #[arg(long)]
        insecure: bool,
    },
    /// Publish a file, a directory or a platform manifest
    Push {
        /// Binary, directory or manifest file
        path: PathBuf,
        /// Target reference
        reference: String,
        /// Use plain HTTP
        #[arg(long)]
        insecure: bool,
        /// Do not also tag the index as latest
        #[arg(long)]
        no_tag_latest: bool,
    },
    /// List cached artifacts
    List,
    /// Export a cached artifact
    Export {
        /// Artifact id as shown by `list`
        id: String,
        /// Destination file or directory
        dest: PathBuf,
        /// Platform to export (os/arch[/variant]); repeatable
        #[arg(long = "platform")]
        platforms: Vec<String>,
        /// Export every platform in the index
        #[arg(long)]
        all_arch: bool,
    },
    /// Resolve a plugin run against a cached artifact
    Exec {
        /// Artifact id
        id: String,
        /// Plugin name
        plugin: String,
        /// Arguments passed to the plugin
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

impl Commands {
    /// Short name used in log spans.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pull { .. } => "pull",
            Self::Push { .. } => "push",
            Self::List => "list",
            Self::Export { .. } => "export",
            Self::Exec { .. } => "exec",
        }
    }
}

#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    #[error("Configuration error: {message}")]
    #[diagnostic(code(porter::cli::config))]
    Config {
        message: String,
        #[help]
        help: Option<String>,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Oci(#[from] porter_oci::Error),

    #[error("{message}")]
    #[diagnostic(code(porter::cli::other))]
    Other { message: String },
}

impl CliError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    pub fn config_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

/// Map an error to the process exit code.
pub const fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::Config { .. }
        | CliError::Oci(
            porter_oci::Error::InvalidInput(_)
            | porter_oci::Error::InvalidReference(..)
            | porter_oci::Error::InvalidPlatform { .. },
        ) => EXIT_CLI,
        CliError::Oci(porter_oci::Error::Cancelled) => EXIT_SIGINT,
        CliError::Oci(_) | CliError::Other { .. } => EXIT_FAILURE,
    }
}

#[allow(clippy::print_stderr)]
pub fn render_error(err: CliError) {
    let report = Report::new(err);
    eprintln!("{report:?}");
}

/// JSON envelope written to stdout on success.
#[derive(Debug, Serialize)]
pub struct OkEnvelope<T: Serialize> {
    pub status: &'static str,
    pub data: T,
}

impl<T: Serialize> OkEnvelope<T> {
    pub const fn new(data: T) -> Self {
        Self { status: "ok", data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_flags() {
        let cli = Cli::try_parse_from([
            "porter",
            "pull",
            "ghcr.io/acme/deployer:1.0.0",
            "-o",
            "out",
            "--platform",
            "linux/amd64",
            "--platform",
            "darwin/arm64",
            "--insecure",
        ])
        .unwrap();

        assert_eq!(
            cli.command,
            Commands::Pull {
                reference: "ghcr.io/acme/deployer:1.0.0".to_string(),
                output: Some(PathBuf::from("out")),
                platforms: vec!["linux/amd64".to_string(), "darwin/arm64".to_string()],
                all_arch: false,
                insecure: true,
            }
        );
        assert_eq!(cli.log_format, "pretty");
        assert!(cli.level.is_none());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "porter",
            "list",
            "-L",
            "debug",
            "--log-format",
            "json",
            "--config",
            "porter.yaml",
        ])
        .unwrap();

        assert_eq!(cli.command, Commands::List);
        assert_eq!(cli.level.as_deref(), Some("debug"));
        assert_eq!(cli.log_format, "json");
        assert_eq!(cli.config, Some(PathBuf::from("porter.yaml")));
    }

    #[test]
    fn test_push_no_tag_latest() {
        let cli = Cli::try_parse_from([
            "porter",
            "push",
            "./dist/porter.yaml",
            "localhost:5000/tools/tool:2.0.0",
            "--no-tag-latest",
        ])
        .unwrap();

        assert!(matches!(
            cli.command,
            Commands::Push {
                no_tag_latest: true,
                insecure: false,
                ..
            }
        ));
    }

    #[test]
    fn test_exec_trailing_args() {
        let cli =
            Cli::try_parse_from(["porter", "exec", "0123abcd", "deploy", "--dry-run", "-v"]).unwrap();

        assert_eq!(
            cli.command,
            Commands::Exec {
                id: "0123abcd".to_string(),
                plugin: "deploy".to_string(),
                args: vec!["--dry-run".to_string(), "-v".to_string()],
            }
        );
    }

    #[test]
    fn test_missing_subcommand_rejected() {
        assert!(Cli::try_parse_from(["porter"]).is_err());
        assert!(Cli::try_parse_from(["porter", "export", "only-id"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&CliError::config("missing file")), EXIT_CLI);
        assert_eq!(
            exit_code_for(&porter_oci::Error::invalid_input("empty path").into()),
            EXIT_CLI
        );
        assert_eq!(
            exit_code_for(&porter_oci::Error::invalid_reference("::", "bad").into()),
            EXIT_CLI
        );
        assert_eq!(
            exit_code_for(&porter_oci::Error::NotFound("abc".to_string()).into()),
            EXIT_FAILURE
        );
        assert_eq!(exit_code_for(&porter_oci::Error::Cancelled.into()), EXIT_SIGINT);
        assert_eq!(exit_code_for(&CliError::other("boom")), EXIT_FAILURE);
    }

    #[test]
    fn test_envelope_shape() {
        let value = serde_json::to_value(OkEnvelope::new(vec!["a"])).unwrap();
        assert_eq!(value, serde_json::json!({"status": "ok", "data": ["a"]}));
    }
}
