//! Fileserver registry.
//!
//! One record per remote host, shared by every mount from that host and
//! kept alive by reference counts. Remote servers are pinged with the NFS
//! NULL procedure; a server that misses too many pings is marked down.

use {
    crate::clock::CalloutId,
    bitflags::bitflags,
    log::{debug, info, warn},
    std::{
        collections::BTreeMap,
        fmt,
        net::{IpAddr, Ipv4Addr, ToSocketAddrs},
        time::Duration,
    },
};

/// Ping interval while a server's state is unknown.
pub const FAST_PING: Duration = Duration::from_secs(3);
/// Consecutive unanswered pings before a server is declared down.
pub const MAX_ALLOWED_PINGS: u32 = 3;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct FsFlags: u32 {
        /// Liveness is known
        const VALID     = 0x01;
        const DOWN      = 0x02;
        /// Address lookup failed
        const ERROR     = 0x04;
        /// Keepalive pings are running
        const PINGING   = 0x08;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FserverId(pub u32);

impl fmt::Display for FserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fs#{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ServerKind {
    /// This host; used by filesystems that need no remote server
    Local,
    Nfs,
}

/// A liveness change worth acting on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Liveness {
    Up,
    Down,
}

#[derive(Debug)]
pub struct Fserver {
    pub host: String,
    pub addr: Option<IpAddr>,
    pub kind: ServerKind,
    pub flags: FsFlags,
    pub pinterval: Duration,
    /// Pending ping or discard callout
    pub cid: Option<CalloutId>,
    pub refc: u32,
    /// Pings sent since the last reply
    pub missed: u32,
}

impl Fserver {
    pub fn is_up(&self) -> bool {
        self.flags.contains(FsFlags::VALID) && !self.flags.contains(FsFlags::DOWN)
    }

    pub fn is_down(&self) -> bool {
        self.flags.contains(FsFlags::VALID | FsFlags::DOWN)
    }
}

fn resolve_host(host: &str) -> Option<IpAddr> {
    if let Ok(ip) = host.parse() {
        return Some(ip);
    }
    match (host, 0).to_socket_addrs() {
        Ok(mut addrs) => addrs.next().map(|a| a.ip()),
        Err(e) => {
            warn!("No IP address for host {}: {}", host, e);
            None
        }
    }
}

#[derive(Debug)]
pub struct FserverRegistry {
    servers: BTreeMap<FserverId, Fserver>,
    next: u32,
    pinterval: Duration,
}

impl FserverRegistry {
    pub fn new(pinterval: Duration) -> FserverRegistry {
        FserverRegistry {
            servers: BTreeMap::new(),
            next: 0,
            pinterval,
        }
    }

    fn insert(&mut self, server: Fserver) -> FserverId {
        self.next += 1;
        let id = FserverId(self.next);
        self.servers.insert(id, server);
        id
    }

    fn find(&mut self, kind: ServerKind, host: &str) -> Option<FserverId> {
        let (&id, fs) = self
            .servers
            .iter_mut()
            .find(|(_, fs)| fs.kind == kind && fs.host == host)?;
        fs.refc += 1;
        Some(id)
    }

    /// Reference the local server record, creating it on first use.
    pub fn find_local(&mut self) -> FserverId {
        if let Some(id) = self.find(ServerKind::Local, "localhost") {
            return id;
        }
        self.insert(Fserver {
            host: "localhost".to_owned(),
            addr: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            kind: ServerKind::Local,
            flags: FsFlags::VALID,
            pinterval: Duration::ZERO,
            cid: None,
            refc: 1,
            missed: 0,
        })
    }

    /// Reference the NFS server record for `host`.
    ///
    /// Returns true as the second element when a new record was created;
    /// the caller is then expected to start pinging it.
    pub fn find_nfs(&mut self, host: &str) -> (FserverId, bool) {
        if let Some(id) = self.find(ServerKind::Nfs, host) {
            return (id, false);
        }
        let addr = resolve_host(host);
        let flags = if addr.is_some() {
            FsFlags::empty()
        } else {
            FsFlags::VALID | FsFlags::DOWN | FsFlags::ERROR
        };
        debug!("New fileserver {}", host);
        let id = self.insert(Fserver {
            host: host.to_owned(),
            addr,
            kind: ServerKind::Nfs,
            flags,
            pinterval: self.pinterval,
            cid: None,
            refc: 1,
            missed: 0,
        });
        (id, addr.is_some())
    }

    /// Drop a reference. Returns true when the last one went away; the
    /// record stays until [`discard`](Self::discard) so a quick re-use keeps
    /// its liveness state.
    pub fn release(&mut self, id: FserverId) -> bool {
        match self.servers.get_mut(&id) {
            Some(fs) if fs.refc > 0 => {
                fs.refc -= 1;
                fs.refc == 0
            }
            Some(_) => false,
            None => {
                warn!("release of unknown fileserver {}", id);
                false
            }
        }
    }

    /// Remove an unreferenced server. Returns the record if it was removed.
    pub fn discard(&mut self, id: FserverId) -> Option<Fserver> {
        match self.servers.get(&id) {
            Some(fs) if fs.refc == 0 => {
                debug!("Discarding fileserver {}", fs.host);
                self.servers.remove(&id)
            }
            _ => None,
        }
    }

    pub fn get(&self, id: FserverId) -> Option<&Fserver> {
        self.servers.get(&id)
    }

    pub fn get_mut(&mut self, id: FserverId) -> Option<&mut Fserver> {
        self.servers.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FserverId, &Fserver)> {
        self.servers.iter().map(|(id, fs)| (*id, fs))
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Account for a ping about to be sent.
    ///
    /// Returns `Some(Down)` when this ping pushes the server over the
    /// missed-ping limit.
    pub fn keepalive(&mut self, id: FserverId) -> Option<Liveness> {
        let fs = self.servers.get_mut(&id)?;
        fs.flags |= FsFlags::PINGING;
        fs.missed += 1;
        if fs.missed > MAX_ALLOWED_PINGS && !fs.is_down() {
            warn!("file server {} is down - timeout", fs.host);
            fs.flags |= FsFlags::VALID | FsFlags::DOWN;
            return Some(Liveness::Down);
        }
        None
    }

    /// A ping reply arrived.
    pub fn ping_ok(&mut self, id: FserverId) -> Option<Liveness> {
        let fs = self.servers.get_mut(&id)?;
        fs.missed = 0;
        if fs.is_up() {
            return None;
        }
        if fs.is_down() {
            info!("file server {} is up", fs.host);
        } else {
            debug!("file server {} is up", fs.host);
        }
        fs.flags.remove(FsFlags::DOWN);
        fs.flags.insert(FsFlags::VALID);
        Some(Liveness::Up)
    }

    /// Delay before the next ping of `id`.
    pub fn next_ping(&self, id: FserverId) -> Duration {
        match self.servers.get(&id) {
            Some(fs) if fs.flags.contains(FsFlags::VALID) => fs.pinterval,
            _ => FAST_PING,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servers_are_shared_by_host() {
        let mut reg = FserverRegistry::new(Duration::from_secs(30));
        let (a, new_a) = reg.find_nfs("10.0.0.1");
        let (b, new_b) = reg.find_nfs("10.0.0.1");
        assert!(new_a);
        assert!(!new_b);
        assert_eq!(a, b);
        assert_eq!(reg.get(a).unwrap().refc, 2);

        assert!(!reg.release(a));
        assert!(reg.discard(a).is_none());
        assert!(reg.release(a));
        assert!(reg.discard(a).is_some());
        assert!(reg.is_empty());
    }

    #[test]
    fn missed_pings_mark_server_down() {
        let mut reg = FserverRegistry::new(Duration::from_secs(30));
        let (id, _) = reg.find_nfs("10.0.0.2");
        assert_eq!(reg.next_ping(id), FAST_PING);

        assert_eq!(reg.keepalive(id), None);
        assert_eq!(reg.ping_ok(id), Some(Liveness::Up));
        assert!(reg.get(id).unwrap().is_up());
        assert_eq!(reg.next_ping(id), Duration::from_secs(30));

        for _ in 0..MAX_ALLOWED_PINGS {
            assert_eq!(reg.keepalive(id), None);
        }
        assert_eq!(reg.keepalive(id), Some(Liveness::Down));
        assert_eq!(reg.keepalive(id), None);
        let fs = reg.get(id).unwrap();
        assert!(fs.is_down() && !fs.is_up());

        assert_eq!(reg.ping_ok(id), Some(Liveness::Up));
    }

    #[test]
    fn local_server_is_always_up() {
        let mut reg = FserverRegistry::new(Duration::from_secs(30));
        let a = reg.find_local();
        let b = reg.find_local();
        assert_eq!(a, b);
        assert!(reg.get(a).unwrap().is_up());
    }
}
