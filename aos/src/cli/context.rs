//! CLI context - shared state and services for all commands.

use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AosConfig;
use crate::errors::KernelResult;
use crate::feedback::{FeedbackService, Tuner};
use crate::kernel::Kernel;

use super::output::{OutputFormat, OutputFormatter};

/// Shared context for CLI commands.
pub struct CliContext {
    pub config: AosConfig,
    pub output: OutputFormatter,
    pub verbose: bool,
    pub dry_run: bool,
    kernel: OnceCell<Arc<Kernel>>,
}

impl CliContext {
    pub fn new(
        config_path: Option<PathBuf>,
        format: OutputFormat,
        quiet: bool,
        verbose: bool,
        dry_run: bool,
    ) -> KernelResult<Self> {
        let config = AosConfig::load(config_path.as_deref())?;
        Ok(Self {
            config,
            output: OutputFormatter::new(format, quiet),
            verbose,
            dry_run,
            kernel: OnceCell::new(),
        })
    }

    /// Bootstrap the kernel on first use; later calls share the instance.
    pub fn kernel(&self) -> KernelResult<&Arc<Kernel>> {
        self.kernel
            .get_or_try_init(|| Kernel::bootstrap(self.config.clone()).map(Arc::new))
    }

    pub fn feedback_service(&self) -> KernelResult<FeedbackService> {
        Ok(FeedbackService::new(Arc::clone(self.kernel()?.store())))
    }

    pub fn tuner(&self) -> KernelResult<Tuner> {
        Ok(Tuner::new(
            self.config.tuner.clone(),
            Arc::clone(self.kernel()?.store()),
        ))
    }
}
