//! Mount lifecycle: brings the filesystem up, waits for a signal, tears down.

use std::io;
use std::path::Path;

use nix::sys::signal::{SigSet, Signal};
use tracing::{debug, info};

use gz_fs::fs::fuser::FuserAdapter;
use gz_fs::fs::{GzFs, MountOptions};
use gz_fs::meta::tar::TarIndex;
use gz_fs::store::StoreOptions;

use crate::Args;

mod managed_fuse {
    //! Dropping a fuser `BackgroundSession` only issues a regular unmount,
    //! which fails if anything still has the mount point open. This wrapper
    //! keeps retrying with a forced/lazy unmount on drop so the mount point
    //! is not left dangling after shutdown.
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use fuser::BackgroundSession;
    use nix::errno::Errno;
    use tracing::{debug, error};

    use gz_fs::fs::fuser::FuserAdapter;
    use gz_fs::meta::tar::TarIndex;

    pub struct FuseCoreScope {
        _session: BackgroundSession,
    }

    pub struct ManagedFuse {
        mount_point: PathBuf,
    }

    impl ManagedFuse {
        pub fn new(mount_point: &Path) -> Self {
            Self {
                mount_point: mount_point.to_path_buf(),
            }
        }

        pub fn spawn(
            &self,
            adapter: FuserAdapter<TarIndex>,
            options: &[fuser::MountOption],
        ) -> Result<FuseCoreScope, std::io::Error> {
            Ok(FuseCoreScope {
                _session: fuser::spawn_mount2(adapter, &self.mount_point, options)?,
            })
        }

        fn force_unmount(&self) -> Result<(), Errno> {
            #[cfg(target_os = "macos")]
            {
                nix::mount::unmount(&self.mount_point, nix::mount::MntFlags::MNT_FORCE)
            }

            #[cfg(target_os = "linux")]
            {
                nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH)
            }
        }
    }

    impl Drop for ManagedFuse {
        fn drop(&mut self) {
            const UMOUNT_ATTEMPT_COUNT: usize = 10;
            const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

            debug!(mount_point = ?self.mount_point, "making sure the mount point is released");

            for attempt in 1..=UMOUNT_ATTEMPT_COUNT {
                match self.force_unmount() {
                    Ok(()) => {
                        debug!(attempt, "unmounted");
                        break;
                    }
                    Err(Errno::EBUSY) => {
                        debug!(attempt, "mount point still busy, retrying");
                        std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                    }
                    Err(Errno::EINVAL | Errno::ENOENT) => {
                        debug!(attempt, "mount point already gone");
                        break;
                    }
                    Err(e) => {
                        error!(attempt, "unmount failed: {e}");
                        break;
                    }
                }
            }
        }
    }
}

/// Prepares the mount point: an existing empty directory is used as-is, a
/// missing one is created with its parents, and a non-empty one is refused
/// rather than shadowed.
fn prepare_mount_point(mount_point: &Path) -> Result<(), io::Error> {
    match std::fs::read_dir(mount_point) {
        Ok(mut entries) => {
            if entries.next().transpose()?.is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("mount point '{}' is not empty", mount_point.display()),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(mount_point)?;
            info!(path = %mount_point.display(), "created the mount point directory");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn exit_signal_set() -> SigSet {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.add(Signal::SIGHUP);
    signals
}

fn wait_for_exit(signals: &SigSet) -> Result<(), io::Error> {
    let signal = signals.wait()?;
    debug!(?signal, "Received signal, shutting down...");
    Ok(())
}

/// Main entry point for the mount.
pub fn run(args: &Args) -> Result<(), io::Error> {
    // FUSE serving daemonizes away from the caller's working directory,
    // so pin the image down to an absolute path first.
    let image = args.filename.canonicalize().map_err(|e| {
        io::Error::new(
            e.kind(),
            format!(
                "Cannot resolve image path '{}': {e}",
                args.filename.display()
            ),
        )
    })?;

    prepare_mount_point(&args.mountpoint)?;

    let options = MountOptions {
        store: StoreOptions {
            block_size: args.block_size,
            cache_blocks: args.cache_blocks,
        },
        offset: args.offset,
    };
    let fs = GzFs::mount(&image, options, |device| TarIndex::open(device))
        .map_err(io::Error::other)?;

    info!("mounting {} at {}", image.display(), args.mountpoint.display());

    // Block the exit signals before the session thread spawns so it
    // inherits the mask and they land in our sigwait.
    let exit_signals = exit_signal_set();
    exit_signals.thread_block()?;

    let mut mount_opts = vec![
        fuser::MountOption::FSName("gz-fs".to_owned()),
        fuser::MountOption::RO,
        fuser::MountOption::NoDev,
        fuser::MountOption::Exec,
        fuser::MountOption::AutoUnmount,
        fuser::MountOption::DefaultPermissions,
    ];
    if args.allow_other {
        mount_opts.push(fuser::MountOption::AllowOther);
    }

    let fuse = managed_fuse::ManagedFuse::new(&args.mountpoint);
    {
        let _session = fuse.spawn(FuserAdapter::new(fs), &mount_opts)?;
        info!("gz-fs is serving; press Ctrl+C to stop");

        wait_for_exit(&exit_signals)?;
    }
    Ok(())
}
