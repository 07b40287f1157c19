//! Mounted filesystem registry.
//!
//! A `Mntfs` stands for one real or pending mount. Nodes that resolve to
//! the same filesystem type, mount point, mount info, options and server
//! share one record; the record goes away with its last reference.

use {
    crate::{clock::CalloutId, fhandle::NfsFh, fserver::FserverId, ops::FsType, opts::FsOpts},
    bitflags::bitflags,
    log::{debug, warn},
    nix::errno::Errno,
    std::{collections::BTreeMap, fmt, net::SocketAddr},
};

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct MfFlags: u32 {
        const MOUNTED       = 0x01;
        const MOUNTING      = 0x02;
        const UNMOUNTING    = 0x04;
        /// The last mount attempt failed; `error` says why
        const ERROR         = 0x08;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MntfsId(u32);

impl fmt::Display for MntfsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mf#{}", self.0)
    }
}

/// Per-type state, dropped together with the record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MfPrivate {
    Nfs { fh: NfsFh, addr: SocketAddr },
}

#[derive(Debug)]
pub struct Mntfs {
    pub fstype: FsType,
    pub mount: String,
    pub info: String,
    pub opts: String,
    pub remopts: String,
    pub server: FserverId,
    pub fo: FsOpts,
    pub flags: MfFlags,
    pub error: Option<Errno>,
    pub refc: u32,
    pub cid: Option<CalloutId>,
    pub private: Option<MfPrivate>,
}

impl Mntfs {
    pub fn is_mounted(&self) -> bool {
        self.flags.contains(MfFlags::MOUNTED)
    }

    pub fn in_transit(&self) -> bool {
        self.flags.intersects(MfFlags::MOUNTING | MfFlags::UNMOUNTING)
    }

    pub fn set_error(&mut self, e: Errno) {
        self.flags.remove(MfFlags::MOUNTING | MfFlags::MOUNTED);
        self.flags.insert(MfFlags::ERROR);
        self.error = Some(e);
    }
}

/// What identifies a shareable mount.
pub struct MntfsKey<'a> {
    pub fstype: FsType,
    pub mount: &'a str,
    pub info: &'a str,
    pub opts: &'a str,
    pub server: FserverId,
}

#[derive(Debug, Default)]
pub struct MntfsRegistry {
    mfs: BTreeMap<MntfsId, Mntfs>,
    next: u32,
}

impl MntfsRegistry {
    pub fn new() -> MntfsRegistry {
        MntfsRegistry::default()
    }

    /// Reference the record matching `key`, creating it if needed.
    ///
    /// Returns true as the second element if the record is new; otherwise
    /// the server reference the caller took for it is surplus.
    pub fn find(&mut self, key: MntfsKey<'_>, remopts: &str, fo: FsOpts) -> (MntfsId, bool) {
        let found = self.mfs.iter_mut().find(|(_, mf)| {
            mf.fstype == key.fstype
                && mf.mount == key.mount
                && mf.info == key.info
                && mf.opts == key.opts
                && mf.server == key.server
        });
        if let Some((&id, mf)) = found {
            mf.refc += 1;
            return (id, false);
        }

        self.next += 1;
        let id = MntfsId(self.next);
        debug!("new mntfs {} for {} on {}", id, key.info, key.mount);
        self.mfs.insert(
            id,
            Mntfs {
                fstype: key.fstype,
                mount: key.mount.to_owned(),
                info: key.info.to_owned(),
                opts: key.opts.to_owned(),
                remopts: remopts.to_owned(),
                server: key.server,
                fo,
                flags: MfFlags::empty(),
                error: None,
                refc: 1,
                cid: None,
                private: None,
            },
        );
        (id, true)
    }

    /// Drop a reference; the record is removed and returned with the last.
    pub fn release(&mut self, id: MntfsId) -> Option<Mntfs> {
        let Some(mf) = self.mfs.get_mut(&id) else {
            warn!("release of unknown mntfs {}", id);
            return None;
        };
        mf.refc = mf.refc.saturating_sub(1);
        if mf.refc > 0 {
            return None;
        }
        if mf.is_mounted() {
            warn!("discarding {} while still mounted on {}", id, mf.mount);
        }
        self.mfs.remove(&id)
    }

    pub fn get(&self, id: MntfsId) -> Option<&Mntfs> {
        self.mfs.get(&id)
    }

    pub fn get_mut(&mut self, id: MntfsId) -> Option<&mut Mntfs> {
        self.mfs.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (MntfsId, &Mntfs)> {
        self.mfs.iter().map(|(id, mf)| (*id, mf))
    }

    pub fn len(&self) -> usize {
        self.mfs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mfs.is_empty()
    }
}
