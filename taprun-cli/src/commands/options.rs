use crate::commands::load_options;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

/// Print the options a job would run with
#[derive(Args, Debug)]
pub struct OptionsArgs {
    /// Options file (YAML)
    pub file: Option<PathBuf>,

    /// Set an option (can be repeated, format: key=value)
    #[arg(long = "set", short = 's', value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,
}

pub fn execute(args: OptionsArgs) -> Result<()> {
    if let Some(file) = &args.file {
        if !file.exists() {
            color_eyre::eyre::bail!("Options file not found: {}", file.display());
        }
        output::status("Loading", &file.display().to_string());
    }

    let options = load_options(args.file.as_ref(), &args.overrides)?;
    output::check(&format!("runner: {}", options.runner));
    if options.extra.is_empty() {
        output::dim("no extra options");
    }

    println!("{}", serde_json::to_string_pretty(&options)?);
    Ok(())
}
