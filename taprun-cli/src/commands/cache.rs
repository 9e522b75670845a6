use crate::output;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Subcommand};
use color_eyre::Result;

use taprun_core::{CacheDescriptor, ContextOptions, DistributedCache, LocalFileFetcher};

/// Inspect or populate the distributed cache directory
#[derive(Args, Debug)]
pub struct CacheArgs {
    /// Cache directory (default: from options)
    #[arg(long, value_name = "DIR", global = true)]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Print the cache directory
    Path,
    /// List cached files
    List,
    /// Remove every cached file
    Clear,
    /// Fetch resources into the cache
    Fetch {
        /// Resource locators (paths or file:// URIs)
        #[arg(required = true)]
        uris: Vec<String>,
    },
}

pub async fn execute(args: CacheArgs) -> Result<()> {
    let dir = args
        .dir
        .unwrap_or_else(|| ContextOptions::default().cache_dir);

    match args.command {
        CacheCommand::Path => println!("{}", dir.display()),
        CacheCommand::List => list(&dir)?,
        CacheCommand::Clear => {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
                output::success(&format!("cleared {}", dir.display()));
            } else {
                output::info("cache directory does not exist");
            }
        }
        CacheCommand::Fetch { uris } => {
            let descriptor = CacheDescriptor::many(uris);
            output::status("Fetching", &descriptor.to_string());
            let cache = DistributedCache::new(
                descriptor,
                dir.clone(),
                Arc::new(LocalFileFetcher),
                Box::new(|paths: &[PathBuf]| Ok(paths.to_vec())),
            );
            // Fetching copies files; keep it off the async workers
            let fetched = tokio::task::spawn_blocking(move || cache.get().map(|p| p.clone())).await??;
            for path in fetched {
                output::check(&path.display().to_string());
            }
        }
    }
    Ok(())
}

fn list(dir: &Path) -> Result<()> {
    if !dir.exists() {
        output::info("cache directory does not exist");
        return Ok(());
    }
    // Each fetched uri has its own keyed directory
    let mut files = Vec::new();
    for slot in fs::read_dir(dir)? {
        let slot = slot?;
        if !slot.file_type()?.is_dir() {
            continue;
        }
        for entry in fs::read_dir(slot.path())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".partial") {
                continue;
            }
            let key = slot.file_name().to_string_lossy().into_owned();
            files.push((format!("{}/{}", key, name), entry.metadata()?.len()));
        }
    }
    files.sort();
    for (name, len) in files {
        println!("{:>10}  {}", len, name);
    }
    Ok(())
}
