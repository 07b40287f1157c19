//! Symbolic links into the local namespace.

use {
    super::{FsCaps, FsOps, FsType, MountCx},
    crate::{mntfs::Mntfs, opts::FsOpts, platform::MountRequest},
    log::warn,
    nix::errno::Errno,
};

#[derive(Debug, Default)]
pub struct Link;

impl FsOps for Link {
    fn fstype(&self) -> FsType {
        FsType::Link
    }

    fn caps(&self) -> FsCaps {
        FsCaps::empty()
    }

    fn fs_match(&self, fo: &FsOpts) -> Option<String> {
        match fo.fs {
            Some(ref fs) if !fs.is_empty() => Some(fs.clone()),
            _ => {
                warn!("link: no fs specified");
                None
            }
        }
    }

    fn mount_request(&self, _mf: &Mntfs, _cx: &MountCx<'_>) -> Result<Option<MountRequest>, Errno> {
        Ok(None)
    }
}
