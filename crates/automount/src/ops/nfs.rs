//! Remote NFS filesystems.

use {
    super::{FsCaps, FsOps, FsType, InitCx, InitStatus, MountCx},
    crate::{
        fhandle::FhLookup,
        fserver::{FserverId, FserverRegistry},
        mntfs::{MfPrivate, Mntfs},
        opts::{FsOpts, opt_value},
        platform::{MountArgs, MountFlags, MountRequest},
        rpc::NFS_PORT,
        sched::Wchan,
    },
    log::warn,
    nix::errno::Errno,
    std::net::SocketAddr,
};

#[derive(Debug, Default)]
pub struct Nfs;

impl FsOps for Nfs {
    fn fstype(&self) -> FsType {
        FsType::Nfs
    }

    fn caps(&self) -> FsCaps {
        FsCaps::BACKGROUND | FsCaps::MKMNT | FsCaps::AMQINFO
    }

    fn fs_match(&self, fo: &FsOpts) -> Option<String> {
        match (fo.rhost.as_deref(), fo.rfs.as_deref()) {
            (Some(rhost), Some(rfs)) if !rhost.is_empty() && !rfs.is_empty() => {
                Some(format!("{}:{}", rhost, rfs))
            }
            _ => {
                warn!("nfs: no remote host or filesystem specified");
                None
            }
        }
    }

    fn find_server(&self, fo: &FsOpts, servers: &mut FserverRegistry) -> (FserverId, bool) {
        servers.find_nfs(fo.rhost.as_deref().unwrap_or_default())
    }

    fn init(&self, mf: &mut Mntfs, cx: &mut InitCx<'_>) -> InitStatus {
        let Some(server) = cx.servers.get(mf.server) else {
            return InitStatus::Failed(Errno::EINVAL);
        };
        let Some(ip) = server.addr else {
            return InitStatus::Failed(Errno::EHOSTUNREACH);
        };
        if server.is_down() {
            return InitStatus::Failed(Errno::EHOSTDOWN);
        }

        let rfs = mf.fo.rfs.as_deref().unwrap_or("/");
        let force_v2 = opt_value(&mf.opts, "vers") == Some("2");
        match cx.fh.resolve(
            rfs,
            mf.server,
            ip,
            force_v2,
            Wchan::Mntfs(cx.id),
            &mut *cx.fwd,
            &mut *cx.clock,
        ) {
            FhLookup::Ready(fh) => {
                mf.private = Some(MfPrivate::Nfs {
                    fh,
                    addr: SocketAddr::new(ip, NFS_PORT),
                });
                InitStatus::Ready
            }
            FhLookup::Failed(e) => InitStatus::Failed(e),
            FhLookup::WouldBlock => InitStatus::Wait,
        }
    }

    fn mount_request(&self, mf: &Mntfs, _cx: &MountCx<'_>) -> Result<Option<MountRequest>, Errno> {
        let Some(MfPrivate::Nfs { ref fh, addr }) = mf.private else {
            return Err(Errno::EINVAL);
        };
        Ok(Some(MountRequest {
            fstype: "nfs".to_owned(),
            source: mf.info.clone(),
            target: mf.mount.clone(),
            flags: MountFlags::from_opts(&mf.opts),
            opts: mf.opts.clone(),
            args: MountArgs::Nfs {
                fh: fh.clone(),
                addr,
                version: fh.version(),
                mountport: None,
            },
        }))
    }

    fn unmount_target(&self, mf: &Mntfs) -> Option<String> {
        Some(mf.mount.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fo(rhost: Option<&str>, rfs: Option<&str>) -> FsOpts {
        FsOpts {
            fstype: Some("nfs".to_owned()),
            rhost: rhost.map(str::to_owned),
            rfs: rfs.map(str::to_owned),
            ..FsOpts::default()
        }
    }

    #[test]
    fn needs_host_and_path() {
        assert_eq!(
            Nfs.fs_match(&fo(Some("fs1"), Some("/export"))),
            Some("fs1:/export".to_owned())
        );
        assert_eq!(Nfs.fs_match(&fo(None, Some("/export"))), None);
        assert_eq!(Nfs.fs_match(&fo(Some("fs1"), Some(""))), None);
    }
}
