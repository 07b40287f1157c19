//! Stand-in for locations that could not be used.

use {
    super::{FsCaps, FsOps, FsType, InitCx, InitStatus, MountCx},
    crate::{mntfs::Mntfs, opts::FsOpts, platform::MountRequest},
    nix::errno::Errno,
};

#[derive(Debug, Default)]
pub struct ErrorFs;

impl FsOps for ErrorFs {
    fn fstype(&self) -> FsType {
        FsType::Error
    }

    fn caps(&self) -> FsCaps {
        FsCaps::empty()
    }

    fn fs_match(&self, _fo: &FsOpts) -> Option<String> {
        Some("(error-hook)".to_owned())
    }

    fn mount_point(&self, _fo: &FsOpts, path: &str) -> String {
        path.to_owned()
    }

    fn init(&self, _mf: &mut Mntfs, _cx: &mut InitCx<'_>) -> InitStatus {
        InitStatus::Failed(Errno::ENOENT)
    }

    fn mount_request(&self, _mf: &Mntfs, _cx: &MountCx<'_>) -> Result<Option<MountRequest>, Errno> {
        Err(Errno::ENOENT)
    }
}
