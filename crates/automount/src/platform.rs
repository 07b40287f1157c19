//! Kernel mount interface.
//!
//! The engine describes a mount as a [`MountRequest`]; a [`Platform`]
//! turns it into system calls. Mount requests run in forked children, so
//! implementations must not rely on state shared with the daemon.

use {
    crate::{error::errno_from_ioerror, fhandle::NfsFh},
    bitflags::bitflags,
    log::debug,
    nix::errno::Errno,
    std::{fs, net::SocketAddr},
};

bitflags! {
    /// Generic mount flags, derived from textual mount options.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        const RDONLY        = 0x01;
        const NOSUID        = 0x02;
        const NODEV         = 0x04;
        const NOEXEC        = 0x08;
        const SYNCHRONOUS   = 0x10;
        const NOATIME       = 0x20;
    }
}

/// Options consumed by amd itself or turned into flags; never passed on.
const GENERIC_OPTS: &[&str] = &[
    "ro", "rw", "nosuid", "suid", "nodev", "dev", "noexec", "exec", "sync", "async", "noatime",
    "atime", "defaults", "nounmount", "vers",
];

impl MountFlags {
    pub fn from_opts(opts: &str) -> MountFlags {
        let mut flags = MountFlags::empty();
        for opt in opts.split(',').map(str::trim) {
            match opt {
                "ro" => flags |= MountFlags::RDONLY,
                "rw" => flags -= MountFlags::RDONLY,
                "nosuid" => flags |= MountFlags::NOSUID,
                "nodev" => flags |= MountFlags::NODEV,
                "noexec" => flags |= MountFlags::NOEXEC,
                "sync" => flags |= MountFlags::SYNCHRONOUS,
                "noatime" => flags |= MountFlags::NOATIME,
                _ => {}
            }
        }
        flags
    }
}

/// Protocol specific part of a mount.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MountArgs {
    None,
    Nfs {
        fh: NfsFh,
        /// Address of the NFS server
        addr: SocketAddr,
        version: u32,
        /// Mount daemon port, when the kernel must not ask the port mapper
        mountport: Option<u16>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountRequest {
    pub fstype: String,
    pub source: String,
    pub target: String,
    pub flags: MountFlags,
    /// Mount options as written in the map
    pub opts: String,
    pub args: MountArgs,
}

impl MountRequest {
    /// Filesystem specific option string for the kernel.
    pub fn data(&self) -> String {
        let mut data: Vec<String> = self
            .opts
            .split(',')
            .map(str::trim)
            .filter(|o| {
                !o.is_empty()
                    && !GENERIC_OPTS.contains(&o.split_once('=').map_or(*o, |(name, _)| name))
            })
            .map(str::to_owned)
            .collect();

        if let MountArgs::Nfs {
            addr,
            version,
            mountport,
            ..
        } = self.args
        {
            data.push(format!("addr={}", addr.ip()));
            data.push(format!("port={}", addr.port()));
            data.push(format!("vers={}", version));
            if let Some(port) = mountport {
                data.push("proto=udp".to_owned());
                data.push(format!("mountport={}", port));
                data.push("mountproto=udp".to_owned());
                data.push("mountvers=1".to_owned());
                data.push("nolock".to_owned());
            }
        }
        data.join(",")
    }
}

pub trait Platform {
    fn mount(&self, req: &MountRequest) -> Result<(), Errno>;
    fn unmount(&self, target: &str, force: bool) -> Result<(), Errno>;
    /// Create `path` and any missing parents.
    fn mkdirs(&self, path: &str) -> Result<(), Errno>;
    fn rmdir(&self, path: &str) -> Result<(), Errno>;
}

/// Mounts through mount(2) and umount2(2).
#[derive(Debug, Default)]
pub struct LinuxPlatform;

#[cfg(target_os = "linux")]
impl Platform for LinuxPlatform {
    fn mount(&self, req: &MountRequest) -> Result<(), Errno> {
        use nix::mount::{MsFlags, mount};

        let mut flags = MsFlags::empty();
        for (ours, theirs) in [
            (MountFlags::RDONLY, MsFlags::MS_RDONLY),
            (MountFlags::NOSUID, MsFlags::MS_NOSUID),
            (MountFlags::NODEV, MsFlags::MS_NODEV),
            (MountFlags::NOEXEC, MsFlags::MS_NOEXEC),
            (MountFlags::SYNCHRONOUS, MsFlags::MS_SYNCHRONOUS),
            (MountFlags::NOATIME, MsFlags::MS_NOATIME),
        ] {
            if req.flags.contains(ours) {
                flags |= theirs;
            }
        }
        let data = req.data();
        debug!(
            "mount -t {} -o {} {} {}",
            req.fstype, data, req.source, req.target
        );
        mount(
            Some(req.source.as_str()),
            req.target.as_str(),
            Some(req.fstype.as_str()),
            flags,
            Some(data.as_str()),
        )
    }

    fn unmount(&self, target: &str, force: bool) -> Result<(), Errno> {
        use nix::mount::{MntFlags, umount2};

        debug!("umount {}{}", target, if force { " (forced)" } else { "" });
        umount2(
            target,
            if force {
                MntFlags::MNT_FORCE
            } else {
                MntFlags::empty()
            },
        )
    }

    fn mkdirs(&self, path: &str) -> Result<(), Errno> {
        fs::create_dir_all(path).map_err(|e| errno_from_ioerror(&e))
    }

    fn rmdir(&self, path: &str) -> Result<(), Errno> {
        fs::remove_dir(path).map_err(|e| errno_from_ioerror(&e))
    }
}

/// Records what would have been done instead of doing it.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    pub calls: std::cell::RefCell<Vec<String>>,
}

#[cfg(test)]
impl Platform for Recorder {
    fn mount(&self, req: &MountRequest) -> Result<(), Errno> {
        self.calls.borrow_mut().push(format!("mount {}", req.target));
        Ok(())
    }

    fn unmount(&self, target: &str, _force: bool) -> Result<(), Errno> {
        self.calls.borrow_mut().push(format!("umount {}", target));
        Ok(())
    }

    fn mkdirs(&self, path: &str) -> Result<(), Errno> {
        self.calls.borrow_mut().push(format!("mkdir {}", path));
        Ok(())
    }

    fn rmdir(&self, path: &str) -> Result<(), Errno> {
        self.calls.borrow_mut().push(format!("rmdir {}", path));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_come_from_options() {
        assert_eq!(
            MountFlags::from_opts("ro,nosuid,intr"),
            MountFlags::RDONLY | MountFlags::NOSUID
        );
        assert_eq!(MountFlags::from_opts("ro,rw"), MountFlags::empty());
        assert_eq!(MountFlags::from_opts(""), MountFlags::empty());
    }

    #[test]
    fn nfs_data_string() {
        let req = MountRequest {
            fstype: "nfs".to_owned(),
            source: "fs1:/export".to_owned(),
            target: "/a/fs1/export".to_owned(),
            flags: MountFlags::RDONLY,
            opts: "ro,intr,vers=3,timeo=7,nounmount".to_owned(),
            args: MountArgs::Nfs {
                fh: NfsFh::V3(vec![1, 2]),
                addr: "10.0.0.1:2049".parse().unwrap(),
                version: 3,
                mountport: None,
            },
        };
        assert_eq!(req.data(), "intr,timeo=7,addr=10.0.0.1,port=2049,vers=3");
    }

    #[test]
    fn self_mount_names_mount_port() {
        let req = MountRequest {
            fstype: "nfs".to_owned(),
            source: "pid1@h:/home".to_owned(),
            target: "/home".to_owned(),
            flags: MountFlags::empty(),
            opts: String::new(),
            args: MountArgs::Nfs {
                fh: NfsFh::V2([0; 32]),
                addr: "127.0.0.1:900".parse().unwrap(),
                version: 2,
                mountport: Some(900),
            },
        };
        assert_eq!(
            req.data(),
            "addr=127.0.0.1,port=900,vers=2,proto=udp,mountport=900,mountproto=udp,mountvers=1,nolock"
        );
    }
}
