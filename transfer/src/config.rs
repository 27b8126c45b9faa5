use std::path::{Path, PathBuf};

use anyhow::Context;
use config::environment::Environment;
use config::load::load_config_from;
use config::shared::TransferConfig;
use secrecy::SecretString;

/// Values given on the command line, applied on top of the loaded configuration.
#[derive(Debug, Default)]
pub struct Overrides {
    pub project: Option<String>,
    pub dataset: Option<String>,
    pub table: Option<String>,
    pub stage: Option<String>,
    pub service_account_key_path: Option<PathBuf>,
}

/// Loads the transfer configuration from `directory`, applies `overrides` and validates it.
pub fn load_transfer_config(
    directory: &Path,
    environment: Environment,
    overrides: Overrides,
) -> anyhow::Result<TransferConfig> {
    let mut config = load_config_from::<TransferConfig>(directory, environment)
        .with_context(|| format!("loading configuration from {}", directory.display()))?;

    apply_overrides(&mut config, overrides)?;
    config.validate().context("validating configuration")?;

    Ok(config)
}

fn apply_overrides(config: &mut TransferConfig, overrides: Overrides) -> anyhow::Result<()> {
    if let Some(project) = overrides.project {
        config.source.project_id = project;
    }
    if let Some(dataset) = overrides.dataset {
        config.source.dataset_id = dataset;
    }
    if let Some(table) = overrides.table {
        config.source.table_id = table;
    }
    if let Some(stage) = overrides.stage {
        config.stage = stage;
    }

    // An inline key from the configuration wins over the ambient credentials file.
    if config.source.service_account_key.is_none() {
        if let Some(path) = overrides.service_account_key_path {
            let key = std::fs::read_to_string(&path)
                .with_context(|| format!("reading service account key {}", path.display()))?;
            config.source.service_account_key = Some(SecretString::new(key));
        }
    }

    Ok(())
}
