//! Filesystem types.
//!
//! Each type implements [`FsOps`]: it validates the options of a map
//! location, names the server it needs, prepares the mount (which may
//! involve waiting for the network) and finally describes the kernel
//! mount, if any, as a [`MountRequest`].

use {
    crate::{
        automount::Callout,
        clock::Clock,
        config::Config,
        fhandle::{FHSIZE, FhCache},
        fserver::{FserverId, FserverRegistry},
        fwd::Forwarder,
        mntfs::{Mntfs, MntfsId},
        opts::FsOpts,
        platform::MountRequest,
    },
    bitflags::bitflags,
    nix::errno::Errno,
    std::{fmt, net::SocketAddr},
};

mod autofs;
mod error;
mod link;
mod nfs;

pub use self::{
    autofs::{Auto, Toplvl},
    error::ErrorFs,
    link::Link,
    nfs::Nfs,
};

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct FsCaps: u32 {
        /// Looks like a directory to NFS clients
        const DIRECTORY     = 0x01;
        /// Mount in a forked child
        const BACKGROUND    = 0x02;
        /// Create the mount point before mounting
        const MKMNT         = 0x04;
        /// Reported by amq
        const AMQINFO       = 0x10;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FsType {
    /// A top-level automount point
    Toplvl,
    /// A nested automount directory
    Auto,
    Link,
    Nfs,
    Error,
}

impl FsType {
    pub fn name(self) -> &'static str {
        match self {
            FsType::Toplvl => "toplvl",
            FsType::Auto => "auto",
            FsType::Link => "link",
            FsType::Nfs => "nfs",
            FsType::Error => "error",
        }
    }

    pub fn from_name(name: &str) -> Option<FsType> {
        Some(match name {
            "toplvl" => FsType::Toplvl,
            "auto" => FsType::Auto,
            "link" => FsType::Link,
            "nfs" => FsType::Nfs,
            "error" => FsType::Error,
            _ => return None,
        })
    }

    pub fn ops(self) -> &'static dyn FsOps {
        match self {
            FsType::Toplvl => &Toplvl,
            FsType::Auto => &Auto,
            FsType::Link => &Link,
            FsType::Nfs => &Nfs,
            FsType::Error => &ErrorFs,
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub fn by_name(name: &str) -> Option<&'static dyn FsOps> {
    FsType::from_name(name).map(FsType::ops)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InitStatus {
    Ready,
    /// Sleeping on the filesystem's wait channel
    Wait,
    Failed(Errno),
}

/// What a filesystem may use while preparing a mount.
pub struct InitCx<'a> {
    pub id: MntfsId,
    pub servers: &'a FserverRegistry,
    pub fh: &'a mut FhCache,
    pub fwd: &'a mut Forwarder,
    pub clock: &'a mut Clock<Callout>,
}

/// What a filesystem may use to describe its kernel mount.
pub struct MountCx<'a> {
    pub config: &'a Config,
    /// Address of the daemon's own NFS server
    pub nfs_addr: Option<SocketAddr>,
    /// Handle the daemon serves for the node being mounted
    pub node_fh: [u8; FHSIZE],
    pub pid: u32,
}

pub trait FsOps: Sync {
    fn fstype(&self) -> FsType;

    fn caps(&self) -> FsCaps;

    /// Check a location's options, returning the mount info that
    /// identifies the filesystem, or `None` if the location is unusable.
    fn fs_match(&self, fo: &FsOpts) -> Option<String>;

    /// Where the filesystem for the node at `path` is mounted.
    fn mount_point(&self, fo: &FsOpts, path: &str) -> String {
        fo.fs.clone().unwrap_or_else(|| path.to_owned())
    }

    /// Reference the server the filesystem lives on. True as the second
    /// element if the record is new.
    fn find_server(&self, _fo: &FsOpts, servers: &mut FserverRegistry) -> (FserverId, bool) {
        (servers.find_local(), false)
    }

    fn init(&self, _mf: &mut Mntfs, _cx: &mut InitCx<'_>) -> InitStatus {
        InitStatus::Ready
    }

    /// Describe the kernel mount. `None` means nothing has to be mounted.
    fn mount_request(&self, mf: &Mntfs, cx: &MountCx<'_>) -> Result<Option<MountRequest>, Errno>;

    /// What to unmount when the filesystem goes away, if anything.
    fn unmount_target(&self, _mf: &Mntfs) -> Option<String> {
        None
    }
}
