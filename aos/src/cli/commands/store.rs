//! `aos store` - backup and restore of the evidence root.

use clap::Subcommand;
use std::path::PathBuf;

use crate::cli::CliContext;
use crate::errors::KernelResult;
use crate::store::StateStore;

#[derive(Debug, Subcommand)]
pub enum StoreCommand {
    /// Copy events, artifacts and state into a backup directory with an
    /// integrity manifest.
    Backup { dest: PathBuf },
    /// Verify a backup's manifest and restore it into the configured root.
    Restore { src: PathBuf },
}

pub async fn execute(ctx: &CliContext, command: StoreCommand) -> KernelResult<i32> {
    match command {
        StoreCommand::Backup { dest } => {
            if ctx.dry_run {
                ctx.output.warn("dry-run: backup not written");
                return Ok(0);
            }
            let kernel = ctx.kernel()?;
            let manifest = kernel.store().backup(&dest)?;
            ctx.output.json(&manifest);
            ctx.output.success(&format!(
                "backed up {} files to {} (integrity {})",
                manifest.files.len(),
                dest.display(),
                &manifest.integrity[..12]
            ));
            Ok(0)
        }
        StoreCommand::Restore { src } => {
            if ctx.dry_run {
                ctx.output.warn("dry-run: restore not performed");
                return Ok(0);
            }
            // Restore into the configured root without bootstrapping a
            // kernel first; the store may not exist yet.
            let root = PathBuf::from(&ctx.config.store.root);
            StateStore::restore(&src, &root)?;
            ctx.output
                .success(&format!("restored backup into {}", root.display()));
            Ok(0)
        }
    }
}
