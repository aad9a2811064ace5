use std::path::PathBuf;
use std::process::ExitCode;
use anyhow::{Context, Result};
use clap::Parser;
use reflectfs_core::{LogLevel, ProviderOptions, ReflectProvider};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "reflectfs")]
#[command(about = "Projects a layer directory into a virtualization root on demand")]
#[command(version)]
struct Cli {
    /// Layer directory whose contents are projected
    #[arg(long = "sourceroot", value_name = "PATH")]
    source_root: Option<PathBuf>,

    /// Virtualization root exposed to clients
    #[arg(long = "virtroot", value_name = "PATH")]
    virt_root: Option<PathBuf>,

    /// Register for all notification categories
    #[arg(short = 'n', long = "notifications")]
    notifications: bool,

    /// Deny every delete under the virtualization root
    #[arg(short = 'd', long = "denyDeletes")]
    deny_deletes: bool,

    /// Signal named test events; implies --notifications
    #[arg(short = 't', long = "testmode")]
    test_mode: bool,

    /// Verbose logging
    #[arg(long)]
    debug: bool,

    /// JSON options file; flags override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl Cli {
    fn provider_options(&self) -> Result<ProviderOptions> {
        let mut options = match &self.config {
            Some(path) => ProviderOptions::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ProviderOptions::default(),
        };

        if let Some(source_root) = &self.source_root {
            options.layer_root = source_root.clone();
        }
        if let Some(virt_root) = &self.virt_root {
            options.scratch_root = virt_root.clone();
        }
        options.enable_notifications |= self.notifications;
        options.deny_deletes |= self.deny_deletes;
        options.test_mode |= self.test_mode;
        if self.debug {
            options.log_level = LogLevel::Debug;
        }

        Ok(options)
    }
}

fn init_tracing(level: LogLevel) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("reflectfs={}", level.as_filter_directive()).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(windows)]
fn create_provider(options: ProviderOptions) -> Result<ReflectProvider> {
    use std::sync::Arc;
    use reflectfs_windows::{verify_projfs_available, NamedEventSignal, ProjFsCollation, ProjFsEngine};

    let level = verify_projfs_available().context("ProjFS is not available on this machine")?;
    let engine = Arc::new(ProjFsEngine::with_level(level).context("Failed to load ProjectedFSLib")?);
    let collation = Arc::new(ProjFsCollation::new().context("Failed to load ProjectedFSLib")?);
    ReflectProvider::with_platform(options, engine, collation, Box::new(NamedEventSignal))
        .context("Failed to create provider")
}

#[cfg(not(windows))]
fn create_provider(_options: ProviderOptions) -> Result<ReflectProvider> {
    anyhow::bail!("ReflectFS needs the Windows Projected File System; this platform is not supported")
}

/// Resolves when Ctrl+C is pressed or a line is read from stdin.
async fn wait_for_shutdown() {
    let (tx, rx) = tokio::sync::oneshot::channel();
    // A plain thread so a pending read never holds up runtime shutdown.
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        let _ = tx.send(());
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Ctrl+C received");
        }
        _ = rx => info!("Stop requested from stdin"),
    }
}

async fn run(options: ProviderOptions) -> Result<()> {
    let provider = create_provider(options)?;
    provider.start().context("Failed to start provider")?;

    println!(
        "Projecting {} into {}",
        provider.options().layer_root.display(),
        provider.options().scratch_root.display()
    );
    println!("Press Enter or Ctrl+C to stop.");

    wait_for_shutdown().await;

    provider.stop().context("Failed to stop provider")?;
    info!("Provider stopped. {}", provider.stats());
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let options = match cli.provider_options() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    init_tracing(options.log_level);

    match run(options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_flags_map_to_options() {
        let cli = Cli::try_parse_from([
            "reflectfs",
            "--sourceroot",
            "C:\\layer",
            "--virtroot",
            "C:\\scratch",
            "-d",
            "-t",
            "--debug",
        ])
        .unwrap();

        let options = cli.provider_options().unwrap();
        assert_eq!(options.layer_root, PathBuf::from("C:\\layer"));
        assert_eq!(options.scratch_root, PathBuf::from("C:\\scratch"));
        assert!(options.deny_deletes);
        assert!(options.test_mode);
        assert!(!options.enable_notifications);
        assert!(options.notifications_active());
        assert_eq!(options.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_long_flag_spellings() {
        let cli = Cli::try_parse_from(["reflectfs", "--notifications", "--denyDeletes", "--testmode"]).unwrap();
        assert!(cli.notifications && cli.deny_deletes && cli.test_mode);
    }

    #[test]
    fn test_flags_override_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reflectfs.json");
        std::fs::write(&path, r#"{"layer_root": "L", "scratch_root": "S", "log_level": "Warn"}"#).unwrap();

        let cli = Cli::try_parse_from([
            "reflectfs",
            "--config",
            path.to_str().unwrap(),
            "--virtroot",
            "V",
            "-n",
        ])
        .unwrap();

        let options = cli.provider_options().unwrap();
        assert_eq!(options.layer_root, PathBuf::from("L"));
        assert_eq!(options.scratch_root, PathBuf::from("V"));
        assert!(options.enable_notifications);
        assert_eq!(options.log_level, LogLevel::Warn);
    }

    #[test]
    fn test_missing_config_file() {
        let cli = Cli::try_parse_from(["reflectfs", "--config", "does-not-exist.json"]).unwrap();
        assert!(cli.provider_options().is_err());
    }

    #[cfg(not(windows))]
    #[test]
    fn test_non_windows_host_fails_to_create() {
        let layer = TempDir::new().unwrap();
        let options = ProviderOptions::new(layer.path(), layer.path().join("..").join("scratch"));
        assert!(create_provider(options).is_err());
    }
}
