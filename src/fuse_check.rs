//! Checks that the host can serve a FUSE mount before we try to mount one.

#[cfg(any(target_os = "linux", target_os = "macos"))]
use std::path::Path;

#[cfg(target_os = "linux")]
mod paths {
    pub const FUSE_DEVICE: &str = "/dev/fuse";
    pub const MOUNT_HELPERS: [&str; 4] = [
        "/usr/bin/fusermount3",
        "/bin/fusermount3",
        "/usr/bin/fusermount",
        "/bin/fusermount",
    ];
}

#[cfg(target_os = "macos")]
mod paths {
    pub const BUNDLES: [(&str, &str); 2] = [
        (
            "/Library/Filesystems/macfuse.fs",
            "/Library/Filesystems/macfuse.fs/Contents/Resources/mount_macfuse",
        ),
        (
            "/Library/Filesystems/osxfuse.fs",
            "/Library/Filesystems/osxfuse.fs/Contents/Resources/mount_osxfuse",
        ),
    ];
    pub const LIBFUSE_DYLIB: &str = "/usr/local/lib/libfuse.2.dylib";
}

/// Errors that can occur when verifying FUSE availability.
#[derive(Debug, thiserror::Error)]
pub enum FuseCheckError {
    /// The kernel exposes no FUSE device.
    #[error(
        "{path} does not exist. Load the fuse kernel module (`modprobe fuse`) and try again."
    )]
    DeviceMissing {
        /// Path where the device node was expected.
        path: &'static str,
    },

    /// No FUSE implementation is installed.
    #[error("FUSE is not installed. mount0 needs {package} to mount filesystems.")]
    NotInstalled {
        /// What the user should install.
        package: &'static str,
    },

    /// The mount helper binary is missing.
    #[error("FUSE mount helper not found at {path}. The installation may be corrupt.")]
    MountHelperMissing {
        /// Path where the mount helper was expected.
        path: &'static str,
    },

    /// The libfuse shared library is missing.
    #[error("libfuse is missing at {path}. FUSE may have been partially uninstalled.")]
    LibfuseMissing {
        /// Path where the library was expected.
        path: &'static str,
    },
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn exists(path: &str) -> bool {
    Path::new(path).exists()
}

/// Verify that FUSE is installed and usable on the current platform.
///
/// On Linux this looks for `/dev/fuse` and a `fusermount` helper. On macOS it looks for a
/// macFUSE or osxfuse bundle, its mount helper and the libfuse dylib.
#[cfg(target_os = "linux")]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    if !exists(paths::FUSE_DEVICE) {
        return Err(FuseCheckError::DeviceMissing {
            path: paths::FUSE_DEVICE,
        });
    }
    // Running as root mounts directly without the setuid helper.
    if nix::unistd::Uid::effective().is_root() {
        return Ok(());
    }
    if paths::MOUNT_HELPERS.iter().any(|p| exists(p)) {
        Ok(())
    } else {
        Err(FuseCheckError::NotInstalled {
            package: "fuse3 (fusermount3)",
        })
    }
}

/// Verify that FUSE is installed and usable on the current platform.
///
/// On Linux this looks for `/dev/fuse` and a `fusermount` helper. On macOS it looks for a
/// macFUSE or osxfuse bundle, its mount helper and the libfuse dylib.
#[cfg(target_os = "macos")]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    let &(_, helper) = paths::BUNDLES
        .iter()
        .find(|(bundle, _)| Path::new(bundle).is_dir())
        .ok_or(FuseCheckError::NotInstalled {
            package: "macFUSE (https://macfuse.github.io/)",
        })?;

    if !Path::new(helper).is_file() {
        return Err(FuseCheckError::MountHelperMissing { path: helper });
    }

    if !exists(paths::LIBFUSE_DYLIB) {
        return Err(FuseCheckError::LibfuseMissing {
            path: paths::LIBFUSE_DYLIB,
        });
    }

    Ok(())
}

/// Verify that FUSE is installed and usable on the current platform.
///
/// Other platforms are not checked.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    Ok(())
}
