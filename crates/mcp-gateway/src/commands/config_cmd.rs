//! `config` subcommand: show resolved configuration.
//!
//! Prints the configuration after file and environment resolution, as TOML
//! or as JSON (`--json`).

use std::path::PathBuf;

use crate::cli::ConfigArgs;
use crate::config::resolve_config;

/// Run the `config` subcommand.
///
/// # Errors
///
/// Returns an error if config resolution or serialization fails.
pub async fn run(config_path: &Option<PathBuf>, args: ConfigArgs) -> anyhow::Result<()> {
    let cfg = resolve_config(config_path.as_deref())?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&cfg)?);
    } else {
        print!("{}", toml::to_string_pretty(&cfg)?);
    }
    Ok(())
}
