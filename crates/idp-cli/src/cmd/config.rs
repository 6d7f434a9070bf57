use std::path::Path;

use anyhow::Context;
use clap::Subcommand;
use idp_core::config::{Config, WarnLevel};

use crate::output::print_json;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration as YAML
    Show,

    /// Validate the config for common mistakes
    Validate,

    /// Write a config file populated with defaults
    Init {
        /// Destination (default: ./idp.yaml)
        #[arg(long)]
        path: Option<std::path::PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn run(config_path: Option<&Path>, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(config_path, json),
        ConfigSubcommand::Validate => validate(config_path, json),
        ConfigSubcommand::Init { path, force } => init(path.as_deref(), force),
    }
}

fn show(config_path: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let config = Config::load_or_default(config_path).context("failed to load config")?;
    if json {
        return print_json(&config);
    }
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

fn validate(config_path: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let config = Config::load_or_default(config_path).context("failed to load config")?;
    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if config.has_errors() {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}

fn init(path: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let path = path.unwrap_or(Path::new(idp_core::config::CONFIG_FILE));
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default()
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}
