use std::process::ExitCode;

use clap::Parser;

use sharebox_daemon::cli::{Cli, Command};
use sharebox_daemon::{logging, AppConfig, CacheLayout};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = init_logging(&cli);
    cli.run().await
}

/// The mount daemon gets file logging under the cache directory; everything
/// else logs to stderr only.
fn init_logging(cli: &Cli) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    #[cfg(feature = "fuse")]
    if matches!(cli.command, Command::Mount { .. }) {
        let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
        if let Ok(config) = AppConfig::load(&config_path) {
            if let Ok((_, sync)) = config.resolve(Some(std::path::Path::new("/"))) {
                let layout = CacheLayout::new(&sync.cache_dir);
                if let Ok(guard) = logging::init_with_file(&layout.log_dir) {
                    return Some(guard);
                }
            }
        }
    }
    #[cfg(not(feature = "fuse"))]
    let _ = cli;
    logging::init();
    None
}
