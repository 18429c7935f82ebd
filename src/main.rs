mod config;
mod error;
mod fs;
mod handle_table;
mod hide;
mod node;
mod ops;
mod pathmap;
mod util;

use clap::Parser;
use config::Config;
use fs::FilterFs;
use fuse3::MountOptions;
use fuse3::path::Session;
use hide::{DEFAULT_HIDE_LIST, HideRules};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const UNMOUNT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "filterfs-rs")]
#[command(about = "FUSE3 passthrough mount that hides files and folders matching glob patterns")]
struct Cli {
    /// Directory whose contents are exposed through the mount.
    source: PathBuf,

    /// Mount point for the filtered view.
    mountpoint: PathBuf,

    /// Colon-separated glob patterns. Any path segment matching one of them
    /// makes the entry invisible. Links leading outside the source are not
    /// filtered.
    #[arg(long, default_value = DEFAULT_HIDE_LIST)]
    hide: String,

    /// Allow other users to access the mount (passes allow_other to FUSE).
    #[arg(long, default_value_t = false)]
    allow_other: bool,

    /// Permit mounting on a non-empty directory.
    #[arg(long, default_value_t = false)]
    nonempty: bool,

    /// Mount through fusermount3 instead of opening /dev/fuse directly.
    #[arg(long, default_value_t = false)]
    unprivileged: bool,

    /// Log every forwarded call and hide decision.
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Largest write the kernel may send in one request, in KiB.
    #[arg(long, default_value_t = 128)]
    max_write_kb: u32,
}

fn init_tracing(debug: bool) {
    let default = if debug { "info,filterfs_rs=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Runs the session's own unmount, then keeps asking fusermount3 until the
/// mount point is released.
async fn unmount_with_retry(
    unmount: impl Future<Output = std::io::Result<()>>,
    mountpoint: &Path,
) {
    info!("Unmounting...");
    if let Err(err) = unmount.await {
        error!(error = %err, "unmount failed");
        loop {
            match Command::new("fusermount3")
                .arg("-u")
                .arg(mountpoint)
                .status()
                .await
            {
                Ok(status) if status.success() => break,
                Ok(status) => warn!(%status, "fusermount3 -u failed"),
                Err(err) => warn!(error = %err, "cannot run fusermount3"),
            }
            tokio::time::sleep(UNMOUNT_RETRY_INTERVAL).await;
        }
    }
    info!("Unmounted");
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let hide = HideRules::parse(&cli.hide);
    let config = Arc::new(Config::new(
        &cli.source,
        &cli.mountpoint,
        hide,
        cli.allow_other,
    )?);
    let mountpoint = config.mount_root().to_path_buf();

    let fs = FilterFs::new(Arc::clone(&config), cli.max_write_kb);

    let mut mount_opts = MountOptions::default();
    mount_opts.fs_name("filterfs");
    mount_opts.allow_other(config.allow_other);
    mount_opts.nonempty(cli.nonempty);

    let session = Session::new(mount_opts);
    let mut handle = if cli.unprivileged {
        session.mount_with_unprivileged(fs, &mountpoint).await?
    } else {
        session.mount(fs, &mountpoint).await?
    };

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    info!("Serving...");
    info!(
        hide = ?config.hide.patterns().collect::<Vec<_>>(),
        "Hide list"
    );

    tokio::select! {
        res = &mut handle => res?,
        _ = sigint.recv() => unmount_with_retry(handle.unmount(), &mountpoint).await,
        _ = sigterm.recv() => unmount_with_retry(handle.unmount(), &mountpoint).await,
    }

    Ok(())
}
