use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fuser::MountOption;
use nix::errno::Errno;
use tokio::select;
use tracing::{debug, error, info, warn};

use crate::app_config::Config;
use mount0::config::ComposeError;
use mount0::fs::bridge::{MountError, ProtocolBridge};

/// Failures that stop the daemon.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid backend configuration: {0}")]
    Compose(#[from] ComposeError),

    #[error("Failed to mount: {0}")]
    Mount(#[from] MountError),
}

/// Keeps the filesystem mounted for as long as it lives.
///
/// Dropping the fuser session only performs a regular unmount, which leaves the mount point
/// attached while a reader is stuck inside it. The guard follows up with a lazy detach.
struct MountGuard {
    bridge: Arc<ProtocolBridge>,
    mount_point: PathBuf,
}

impl MountGuard {
    fn mount(
        bridge: Arc<ProtocolBridge>,
        config: &Config,
        handle: tokio::runtime::Handle,
    ) -> Result<Self, MountError> {
        bridge.mount(&config.mount_point, &mount_options(config), handle)?;
        Ok(Self {
            bridge,
            mount_point: config.mount_point.clone(),
        })
    }

    fn force_detach(&self) {
        const ATTEMPTS: usize = 10;
        const BACKOFF: Duration = Duration::from_millis(10);

        for attempt in 1..=ATTEMPTS {
            #[cfg(target_os = "linux")]
            let result = nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH);
            #[cfg(target_os = "macos")]
            let result = nix::mount::unmount(&self.mount_point, nix::mount::MntFlags::MNT_FORCE);

            match result {
                Ok(()) => {
                    debug!(attempt, "detached mount point");
                    return;
                }
                Err(Errno::EINVAL | Errno::ENOENT) => return,
                Err(Errno::EBUSY) => {
                    debug!(attempt, "mount point busy, retrying");
                    std::thread::sleep(BACKOFF);
                }
                Err(e) => {
                    error!(mount_point = %self.mount_point.display(), "failed to detach: {e}");
                    return;
                }
            }
        }
        warn!(mount_point = %self.mount_point.display(), "mount point stayed busy");
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if let Err(e) = self.bridge.unmount() {
            debug!("session already closed: {e}");
        }
        self.force_detach();
    }
}

fn mount_options(config: &Config) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("mount0".to_owned()),
        MountOption::Subtype("mount0".to_owned()),
        MountOption::NoDev,
        MountOption::Exec,
        MountOption::AutoUnmount,
        MountOption::DefaultPermissions,
        if config.read_only {
            MountOption::RO
        } else {
            MountOption::RW
        },
    ];
    if config.allow_other {
        opts.push(MountOption::AllowOther);
    }
    opts
}

/// Create the mount point if missing; refuse one that already holds entries.
async fn prepare_mount_point(mount_point: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::read_dir(mount_point).await {
        Ok(mut entries) => match entries.next_entry().await? {
            Some(_) => Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("mount point '{}' is not empty", mount_point.display()),
            )),
            None => Ok(()),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "Created mount point directory.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let reason = select! {
        _ = tokio::signal::ctrl_c() => "interrupt",
        _ = sigterm.recv() => "terminate",
        _ = sighup.recv() => "hangup",
    };
    debug!(signal = reason, "shutting down");
    Ok(())
}

/// Build the provider graph, mount it and serve until a shutdown signal arrives.
pub async fn run(config: Config, handle: tokio::runtime::Handle) -> Result<(), DaemonError> {
    let router = config.mount.build()?;
    for path in router.mount_paths() {
        debug!(path = %path.display(), "Mapped backend.");
    }
    let bridge = Arc::new(ProtocolBridge::new(Arc::new(router)));

    prepare_mount_point(&config.mount_point).await?;
    info!("Mounting filesystem at {}.", config.mount_point.display());

    let guard = MountGuard::mount(bridge, &config, handle)?;
    info!("mount0 is running. Press Ctrl+C to stop.");
    wait_for_exit().await?;
    drop(guard);
    Ok(())
}

pub fn spawn(config: Config) -> Result<(), DaemonError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, runtime.handle().clone()))
}
