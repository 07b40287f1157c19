//! Automount points.
//!
//! A top-level point is an NFS mount of the daemon itself, so its children
//! are looked up through our NFS server. A nested `auto` point is just a
//! directory inside such a tree; it needs no kernel mount of its own.

use {
    super::{FsCaps, FsOps, FsType, MountCx},
    crate::{
        fhandle::NfsFh,
        mntfs::Mntfs,
        opts::FsOpts,
        platform::{MountArgs, MountFlags, MountRequest},
    },
    log::warn,
    nix::errno::Errno,
};

fn map_name(fo: &FsOpts, what: &str) -> Option<String> {
    match fo.fs {
        Some(ref map) if !map.is_empty() => Some(map.clone()),
        _ => {
            warn!("{}: no map name given", what);
            None
        }
    }
}

#[derive(Debug, Default)]
pub struct Toplvl;

impl FsOps for Toplvl {
    fn fstype(&self) -> FsType {
        FsType::Toplvl
    }

    fn caps(&self) -> FsCaps {
        FsCaps::BACKGROUND | FsCaps::DIRECTORY | FsCaps::MKMNT | FsCaps::AMQINFO
    }

    fn fs_match(&self, fo: &FsOpts) -> Option<String> {
        map_name(fo, "toplvl")
    }

    fn mount_point(&self, _fo: &FsOpts, path: &str) -> String {
        path.to_owned()
    }

    fn mount_request(&self, mf: &Mntfs, cx: &MountCx<'_>) -> Result<Option<MountRequest>, Errno> {
        let Some(addr) = cx.nfs_addr else {
            warn!("{}: NFS service is not running", mf.mount);
            return Err(Errno::ENXIO);
        };
        Ok(Some(MountRequest {
            fstype: "nfs".to_owned(),
            source: format!("pid{}@{}:{}", cx.pid, cx.config.hostname, mf.mount),
            target: mf.mount.clone(),
            flags: MountFlags::from_opts(&mf.opts) | MountFlags::NOSUID,
            opts: mf.opts.clone(),
            args: MountArgs::Nfs {
                fh: NfsFh::V2(cx.node_fh),
                addr,
                version: 2,
                mountport: Some(addr.port()),
            },
        }))
    }

    fn unmount_target(&self, mf: &Mntfs) -> Option<String> {
        Some(mf.mount.clone())
    }
}

#[derive(Debug, Default)]
pub struct Auto;

impl FsOps for Auto {
    fn fstype(&self) -> FsType {
        FsType::Auto
    }

    fn caps(&self) -> FsCaps {
        FsCaps::DIRECTORY | FsCaps::AMQINFO
    }

    fn fs_match(&self, fo: &FsOpts) -> Option<String> {
        map_name(fo, "auto")
    }

    fn mount_point(&self, _fo: &FsOpts, path: &str) -> String {
        path.to_owned()
    }

    fn mount_request(&self, _mf: &Mntfs, _cx: &MountCx<'_>) -> Result<Option<MountRequest>, Errno> {
        Ok(None)
    }
}
