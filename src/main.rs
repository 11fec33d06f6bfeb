mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;

use crate::cli::Args;

fn main() -> Result<()> {
    let mut args = Args::parse();

    // Resolve before anything changes the working directory
    if args.download_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            args.download_dir = cwd.join(&args.download_dir);
        }
    }

    let _log_guard = coco_fetch::logging::init(args.verbose, args.log_file.as_deref())?;
    let files = coco_fetch::dataset::select(args.train_only, args.val_only)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if args.list {
            return crate::commands::list_downloads(&args.download_dir, &files).await;
        }
        if args.follow {
            return crate::commands::follow_log(&args.download_dir, &files).await;
        }

        let config = args.engine_config()?;
        if args.clean {
            return crate::commands::clear_cache(&args.download_dir, files, &config).await;
        }
        crate::commands::run_downloads(args.download_dir.clone(), files, config).await
    })
}
