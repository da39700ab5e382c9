use std::fs::{create_dir_all, remove_dir_all, File};
use std::path::{Path, PathBuf};

use log::error;
use nix::mount::{mount, umount, MsFlags};
use tar::Archive;

use crate::Error;

/// Splits a `<host-path>:<container-path>` volume specification. Returns
/// `None` when either side is missing or empty.
pub fn split_volume(volume: &str) -> Option<(&str, &str)> {
    let mut parts = volume.splitn(2, ':');
    let host = parts.next()?;
    let guest = parts.next()?;
    if host.is_empty() || guest.is_empty() {
        return None;
    }
    Some((host, guest))
}

/// Tar archive an image is extracted from; `commit` writes the same path.
pub fn image_archive_path(image: &str) -> PathBuf {
    PathBuf::from("resources").join(format!("{image}.tar"))
}

/// Layered container filesystems under a single base directory: a read-only
/// image layer shared between containers, a per-container writable layer,
/// and the merged overlay mount point.
#[derive(Clone, Debug)]
pub struct LayerStore {
    root: PathBuf,
}

impl LayerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Result<Self, Error> {
        let home = std::env::var("HOME").map_err(|_| "HOME is not set")?;
        Ok(Self::new(PathBuf::from(home).join("miniker")))
    }

    pub fn image_dir(&self, image: &str) -> PathBuf {
        self.root.join("images").join(image)
    }

    pub fn write_dir(&self, container: &str) -> PathBuf {
        self.root.join("write").join(container)
    }

    pub fn work_dir(&self, container: &str) -> PathBuf {
        self.root.join("work").join(container)
    }

    pub fn mnt_dir(&self, container: &str) -> PathBuf {
        self.root.join("mnt").join(container)
    }

    /// Builds the layered filesystem for a container and returns the merged
    /// mount point: image layer extracted from `resources/<image>.tar`,
    /// writable and work layers created if absent, overlay mounted, and the
    /// optional volume bound into the merged view.
    pub fn create_workspace(
        &self,
        image: &str,
        container: &str,
        volume: &str,
    ) -> Result<PathBuf, Error> {
        self.create_image_layer(image)
            .map_err(|v| format!("Cannot create image layer: {v}"))?;
        self.create_write_layer(container)
            .map_err(|v| format!("Cannot create write layer: {v}"))?;
        let mnt_dir = self
            .mount_overlay(image, container)
            .map_err(|v| format!("Cannot mount overlay: {v}"))?;
        if !volume.is_empty() {
            match split_volume(volume) {
                Some((host, guest)) => self.mount_volume(&mnt_dir, host, guest)?,
                None => error!("Wrong volume parameter: {volume}"),
            }
        }
        Ok(mnt_dir)
    }

    /// Unmounts the volume and the merged view, then removes the mount
    /// point tree. The writable layer and the image are retained. Each step
    /// is best-effort so a partial teardown still proceeds.
    pub fn delete_workspace(&self, container: &str, volume: &str) {
        let mnt_dir = self.mnt_dir(container);
        if let Some((_, guest)) = split_volume(volume) {
            let guest_dir = mnt_dir.join(guest.trim_start_matches('/'));
            if let Err(err) = umount(&guest_dir) {
                error!("Cannot unmount volume {}: {err}", guest_dir.display());
            }
        }
        if let Err(err) = umount(&mnt_dir) {
            error!("Cannot unmount {}: {err}", mnt_dir.display());
        }
        if let Err(err) = remove_dir_all(&mnt_dir) {
            error!("Cannot remove {}: {err}", mnt_dir.display());
        }
    }

    /// Unmounts the merged view, leaving the mount point tree in place.
    pub fn unmount_workspace(&self, container: &str) {
        let mnt_dir = self.mnt_dir(container);
        if let Err(err) = umount(&mnt_dir) {
            error!("Cannot unmount {}: {err}", mnt_dir.display());
        }
    }

    fn create_image_layer(&self, image: &str) -> Result<(), Error> {
        let image_dir = self.image_dir(image);
        if image_dir.is_dir() && image_dir.read_dir()?.next().is_some() {
            return Ok(());
        }
        let archive_path = image_archive_path(image);
        if !archive_path.is_file() {
            return Err(format!("No such image: {}", archive_path.display()).into());
        }
        create_dir_all(&image_dir)?;
        let mut archive = Archive::new(File::open(&archive_path)?);
        archive.set_preserve_permissions(true);
        archive.set_unpack_xattrs(true);
        Ok(archive.unpack(&image_dir)?)
    }

    /// Creates the writable and work layers if absent; an existing writable
    /// layer is kept as is.
    pub fn create_write_layer(&self, container: &str) -> Result<(), Error> {
        create_dir_all(self.write_dir(container))?;
        Ok(create_dir_all(self.work_dir(container))?)
    }

    fn mount_overlay(&self, image: &str, container: &str) -> Result<PathBuf, Error> {
        let mnt_dir = self.mnt_dir(container);
        create_dir_all(&mnt_dir)?;
        let mount_data = format!(
            "lowerdir={},upperdir={},workdir={}",
            self.image_dir(image).display(),
            self.write_dir(container).display(),
            self.work_dir(container).display(),
        );
        mount(
            "overlay".into(),
            &mnt_dir,
            "overlay".into(),
            MsFlags::empty(),
            Some(mount_data.as_str()),
        )?;
        Ok(mnt_dir)
    }

    fn mount_volume(&self, mnt_dir: &Path, host: &str, guest: &str) -> Result<(), Error> {
        let host_dir = PathBuf::from(host);
        create_dir_all(&host_dir)?;
        let guest_dir = mnt_dir.join(guest.trim_start_matches('/'));
        create_dir_all(&guest_dir)?;
        Ok(mount(
            Some(&host_dir),
            &guest_dir,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )?)
    }
}
