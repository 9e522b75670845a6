pub mod cache;
pub mod options;
pub mod run;

use std::path::PathBuf;

use color_eyre::Result;
use taprun_core::ContextOptions;
use tracing::debug;

/// Load options from an optional YAML file and apply `key=value` overrides
pub fn load_options(file: Option<&PathBuf>, overrides: &[String]) -> Result<ContextOptions> {
    let options = match file {
        Some(path) => ContextOptions::from_yaml_file(path)?,
        None => ContextOptions::default(),
    };
    let options = options.merge_args(overrides)?;
    debug!(options = ?options, "resolved context options");
    Ok(options)
}
