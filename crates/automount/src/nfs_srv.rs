//! The NFS version 2 server behind every automount point.
//!
//! Automount points are mounted from the daemon itself. The kernel then
//! resolves names in them through this server: a `LOOKUP` triggers the
//! mount of the key, and the node comes back as a symbolic link to where
//! the filesystem was really mounted. While a mount is still in progress
//! the request is dropped so the client retransmits.
//!
//! The same socket answers version 1 of the mount protocol, which the
//! kernel uses to fetch the root handle of an automount point.

use {
    crate::{
        automount::{Automounter, Lookup},
        fhandle::FHSIZE,
        node::{AmNode, NodeId},
        rpc::*,
        svc::{self, Refusal, Reply},
        xdr::{Decodable, Encodable, Encoder},
    },
    byteorder::{BigEndian, ByteOrder, WriteBytesExt},
    log::{debug, trace},
    nix::errno::Errno,
    std::io::{Cursor, Result},
};

pub type NfsHandle = [u8; FHSIZE];

pub const NFSPROC_GETATTR: u32 = 1;
pub const NFSPROC_SETATTR: u32 = 2;
pub const NFSPROC_ROOT: u32 = 3;
pub const NFSPROC_LOOKUP: u32 = 4;
pub const NFSPROC_READLINK: u32 = 5;
pub const NFSPROC_READ: u32 = 6;
pub const NFSPROC_WRITECACHE: u32 = 7;
pub const NFSPROC_WRITE: u32 = 8;
pub const NFSPROC_CREATE: u32 = 9;
pub const NFSPROC_REMOVE: u32 = 10;
pub const NFSPROC_RENAME: u32 = 11;
pub const NFSPROC_LINK: u32 = 12;
pub const NFSPROC_SYMLINK: u32 = 13;
pub const NFSPROC_MKDIR: u32 = 14;
pub const NFSPROC_RMDIR: u32 = 15;
pub const NFSPROC_READDIR: u32 = 16;
pub const NFSPROC_STATFS: u32 = 17;

pub const MOUNTPROC_NULL: u32 = 0;
pub const MOUNTPROC_DUMP: u32 = 2;
pub const MOUNTPROC_UMNT: u32 = 3;
pub const MOUNTPROC_UMNTALL: u32 = 4;
pub const MOUNTPROC_EXPORT: u32 = 5;

pub const NFS_OK: u32 = 0;
pub const NFSERR_NOENT: u32 = 2;
pub const NFSERR_IO: u32 = 5;
pub const NFSERR_NXIO: u32 = 6;
pub const NFSERR_ACCES: u32 = 13;
pub const NFSERR_NOTDIR: u32 = 20;
pub const NFSERR_ROFS: u32 = 30;
pub const NFSERR_NAMETOOLONG: u32 = 63;
pub const NFSERR_STALE: u32 = 70;

const NFDIR: u32 = 2;
const NFLNK: u32 = 5;
const NFS_MAXNAMLEN: usize = 255;
const NFS_MAXDATA: u32 = 8192;
const DEV_BSIZE: u32 = 512;

/// Handle of `node`. Handles of a previous daemon, or of a freed node,
/// are recognised as stale.
pub fn node_fh(pid: u32, node: NodeId, generation: u32) -> NfsHandle {
    let mut fh = [0; FHSIZE];
    BigEndian::write_u32(&mut fh[0..4], pid);
    BigEndian::write_u32(&mut fh[4..8], node.0);
    BigEndian::write_u32(&mut fh[8..12], generation);
    fh
}

fn fh_node(am: &Automounter, fh: &NfsHandle) -> Option<NodeId> {
    if BigEndian::read_u32(&fh[0..4]) != am.pid() {
        return None;
    }
    let id = NodeId(BigEndian::read_u32(&fh[4..8]));
    am.nodes
        .get_gen(id, BigEndian::read_u32(&fh[8..12]))
        .map(|_| id)
}

/// NFS status for an errno. NFS uses the historical BSD numbering.
pub fn nfs_error(e: Errno) -> u32 {
    use Errno::*;
    match e {
        EPERM | ENOENT | EIO | ENXIO | EACCES | EEXIST | ENODEV | ENOTDIR | EISDIR | EFBIG
        | ENOSPC | EROFS => e as u32,
        ENAMETOOLONG => NFSERR_NAMETOOLONG,
        ENOTEMPTY => 66,
        EDQUOT => 69,
        ESTALE => NFSERR_STALE,
        _ => NFSERR_IO,
    }
}

/// File attributes as NFS version 2 reports them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fattr {
    pub ftype: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub blocksize: u32,
    pub rdev: u32,
    pub blocks: u32,
    pub fsid: u32,
    pub fileid: u32,
    /// Seconds; used for access, modification and change time
    pub time: u32,
}

impl Encodable for Fattr {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w)
            << &self.ftype
            << &self.mode
            << &self.nlink
            << &self.uid
            << &self.gid
            << &self.size
            << &self.blocksize
            << &self.rdev
            << &self.blocks
            << &self.fsid
            << &self.fileid
            << &self.time
            << &0u32
            << &self.time
            << &0u32
            << &self.time
            << &0u32)
            .done()
    }
}

fn fattr(am: &Automounter, id: NodeId, node: &AmNode) -> Fattr {
    let common = Fattr {
        blocksize: NFS_MAXDATA,
        blocks: 1,
        fsid: am.pid(),
        fileid: id.0,
        time: node.stats.mounted_at as u32,
        ..Fattr::default()
    };
    match node.link {
        Some(ref link) => Fattr {
            ftype: NFLNK,
            mode: 0o120777,
            nlink: 1,
            size: link.len() as u32,
            ..common
        },
        None => Fattr {
            ftype: NFDIR,
            mode: 0o40555,
            nlink: 2 + am.nodes.children(id).len() as u32,
            size: DEV_BSIZE,
            ..common
        },
    }
}

fn status(stat: u32) -> Reply {
    svc::results(&stat)
}

/// Answer one datagram from the kernel.
pub fn dispatch(am: &mut Automounter, packet: &[u8]) -> Option<Vec<u8>> {
    svc::serve(packet, |call, args| match call.prog {
        NFS_PROGRAM => {
            svc::check_version(call, NFS_VERSION, NFS_VERSION)?;
            nfs_proc(am, call.proc_, args)
        }
        MOUNTPROG => {
            svc::check_version(call, MOUNTVERS, MOUNTVERS)?;
            mount_proc(am, call.proc_, args)
        }
        _ => Err(Refusal::Fail(AcceptBody::ProgUnavail)),
    })
}

fn nfs_proc(am: &mut Automounter, proc_: u32, args: &mut Cursor<&[u8]>) -> Reply {
    trace!("nfs: proc {}", proc_);
    match proc_ {
        NFSPROC_NULL | NFSPROC_ROOT | NFSPROC_WRITECACHE => svc::void(),
        NFSPROC_GETATTR => getattr(am, &Decodable::decode(args)?),
        NFSPROC_LOOKUP => {
            let dir = Decodable::decode(args)?;
            let name: String = Decodable::decode(args)?;
            lookup(am, &dir, &name)
        }
        NFSPROC_READLINK => readlink(am, &Decodable::decode(args)?),
        NFSPROC_READ => status(NFSERR_ACCES),
        NFSPROC_READDIR => {
            let dir = Decodable::decode(args)?;
            let cookie: u32 = Decodable::decode(args)?;
            let count: u32 = Decodable::decode(args)?;
            readdir(am, &dir, cookie, count)
        }
        NFSPROC_STATFS => statfs(am, &Decodable::decode(args)?),
        NFSPROC_SETATTR | NFSPROC_WRITE | NFSPROC_CREATE | NFSPROC_REMOVE | NFSPROC_RENAME
        | NFSPROC_LINK | NFSPROC_SYMLINK | NFSPROC_MKDIR | NFSPROC_RMDIR => status(NFSERR_ROFS),
        _ => Err(Refusal::Fail(AcceptBody::ProcUnavail)),
    }
}

/// Resolve a handle, counting stale ones.
fn node_or_stale(am: &mut Automounter, fh: &NfsHandle) -> std::result::Result<NodeId, Reply> {
    fh_node(am, fh).ok_or_else(|| {
        am.stats.stale += 1;
        status(NFSERR_STALE)
    })
}

fn getattr(am: &mut Automounter, fh: &NfsHandle) -> Reply {
    let id = match node_or_stale(am, fh) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    let Some(node) = am.nodes.get_mut(id) else {
        return status(NFSERR_STALE);
    };
    node.stats.getattr += 1;
    let Some(node) = am.nodes.get(id) else {
        return status(NFSERR_STALE);
    };
    svc::results(&(NFS_OK, fattr(am, id, node)))
}

fn lookup(am: &mut Automounter, dir: &NfsHandle, name: &str) -> Reply {
    let id = match node_or_stale(am, dir) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    if name.len() > NFS_MAXNAMLEN {
        return status(NFSERR_NAMETOOLONG);
    }
    if am.nodes.get(id).is_some_and(|n| n.link.is_some()) {
        return status(NFSERR_NOTDIR);
    }

    match am.lookup(id, name) {
        Lookup::Found(child) => {
            let Some(node) = am.nodes.get(child) else {
                return status(NFSERR_STALE);
            };
            debug!("nfs: lookup {} -> {}", name, node.path);
            let fh = node_fh(am.pid(), child, node.generation);
            svc::results(&(NFS_OK, fh, fattr(am, child, node)))
        }
        Lookup::Wait(_) => {
            debug!("nfs: lookup of {} dropped while mounting", name);
            am.stats.drops += 1;
            Err(Refusal::Drop)
        }
        Lookup::Failed(e) => status(nfs_error(e)),
    }
}

fn readlink(am: &mut Automounter, fh: &NfsHandle) -> Reply {
    let id = match node_or_stale(am, fh) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    let Some(node) = am.nodes.get_mut(id) else {
        return status(NFSERR_STALE);
    };
    node.stats.readlink += 1;
    match node.link {
        Some(ref link) => svc::results(&(NFS_OK, link.as_str())),
        None => status(NFSERR_NXIO),
    }
}

/// Entries are `.`, `..` and then the node's children; the cookie of an
/// entry is its position plus one.
fn readdir(am: &mut Automounter, dir: &NfsHandle, cookie: u32, count: u32) -> Reply {
    let id = match node_or_stale(am, dir) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    let Some(node) = am.nodes.get_mut(id) else {
        return status(NFSERR_STALE);
    };
    if node.link.is_some() {
        return status(NFSERR_NOTDIR);
    }
    node.stats.readdir += 1;
    let parent = node.parent().unwrap_or(id);

    let mut entries = vec![(id.0, ".".to_owned()), (parent.0, "..".to_owned())];
    entries.extend(
        am.nodes
            .children(id)
            .into_iter()
            .filter_map(|c| am.nodes.get(c).map(|n| (c.0, n.name.clone()))),
    );

    // status, end-of-list marker and eof flag
    let mut budget = (count.min(NFS_MAXDATA) as usize).saturating_sub(12);
    let mut out = Vec::new();
    NFS_OK.encode(&mut out).map_err(Refusal::from)?;
    let mut eof = true;
    for (i, (fileid, name)) in entries.iter().enumerate().skip(cookie as usize) {
        let size = 16 + name.len().div_ceil(4) * 4;
        if size > budget {
            eof = false;
            break;
        }
        budget -= size;
        (Encoder::new(&mut out) << &true << fileid << name << &(i as u32 + 1))
            .done()
            .map_err(Refusal::from)?;
    }
    (Encoder::new(&mut out) << &false << &eof)
        .done()
        .map_err(Refusal::from)?;
    Ok(out)
}

fn statfs(am: &mut Automounter, fh: &NfsHandle) -> Reply {
    let id = match node_or_stale(am, fh) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    if let Some(node) = am.nodes.get_mut(id) {
        node.stats.statfs += 1;
    }
    // tsize, bsize, blocks, bfree, bavail
    svc::results(&(NFS_OK, NFS_MAXDATA, DEV_BSIZE, 0u32, 0u32, 0u32))
}

fn mount_proc(am: &mut Automounter, proc_: u32, args: &mut Cursor<&[u8]>) -> Reply {
    match proc_ {
        MOUNTPROC_NULL | MOUNTPROC_UMNTALL => svc::void(),
        MOUNTPROC_MNT => {
            let dir: String = Decodable::decode(args)?;
            let top = am
                .root()
                .and_then(|root| am.nodes.find_child(root, &dir))
                .and_then(|id| am.nodes.get(id).map(|n| (id, n.generation)));
            match top {
                Some((id, generation)) => {
                    debug!("mountd: handing out handle for {}", dir);
                    svc::results(&(NFS_OK, node_fh(am.pid(), id, generation)))
                }
                None => status(NFSERR_NOENT),
            }
        }
        MOUNTPROC_UMNT => {
            let _: String = Decodable::decode(args)?;
            svc::void()
        }
        // empty mount and export lists
        MOUNTPROC_DUMP | MOUNTPROC_EXPORT => svc::results(&false),
        _ => Err(Refusal::Fail(AcceptBody::ProcUnavail)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        mapc::MapTypes,
        platform::Recorder,
        xdr::{read_msg, write_msg},
    };
    use std::{io::Write, rc::Rc, time::Instant};

    fn daemon(map: &tempfile::NamedTempFile) -> Automounter {
        let config = Config {
            background_mounts: false,
            ..Config::default()
        };
        let platform = Rc::new(Recorder::default());
        let mut am = Automounter::new(config, MapTypes::default(), platform, Instant::now());
        am.set_nfs_addr("127.0.0.1:700".parse().unwrap());
        am.add_map("/mnt", map.path().to_str().unwrap(), "").unwrap();
        am.start();
        let now = am.clock.now();
        am.tick(now);
        am
    }

    fn map(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    fn call(am: &mut Automounter, prog: u32, vers: u32, proc_: u32, args: &[u8]) -> Vec<u8> {
        let mut packet = Vec::new();
        write_msg(&mut packet, &RpcMsg::call(1, prog, vers, proc_, OpaqueAuth::none())).unwrap();
        packet.extend_from_slice(args);
        let reply = dispatch(am, &packet).unwrap();
        let mut cur = Cursor::new(&reply[..]);
        assert!(read_msg(&mut cur).unwrap().is_success());
        reply[cur.position() as usize..].to_vec()
    }

    fn top_fh(am: &Automounter) -> NfsHandle {
        let id = am.nodes.find_path("/mnt").unwrap();
        node_fh(am.pid(), id, am.nodes.get(id).unwrap().generation)
    }

    fn lookup_args(fh: &NfsHandle, name: &str) -> Vec<u8> {
        let mut args = Vec::new();
        (Encoder::new(&mut args) << fh << name).done().unwrap();
        args
    }

    #[test]
    fn mountd_hands_out_the_automount_point() {
        let m = map("x type:=link;fs:=/tmp\n");
        let mut am = daemon(&m);
        let mut args = Vec::new();
        "/mnt".encode(&mut args).unwrap();
        let res = call(&mut am, MOUNTPROG, MOUNTVERS, MOUNTPROC_MNT, &args);
        let mut cur = Cursor::new(&res[..]);
        assert_eq!(u32::decode(&mut cur).unwrap(), NFS_OK);
        assert_eq!(NfsHandle::decode(&mut cur).unwrap(), top_fh(&am));

        let mut args = Vec::new();
        "/elsewhere".encode(&mut args).unwrap();
        let res = call(&mut am, MOUNTPROG, MOUNTVERS, MOUNTPROC_MNT, &args);
        assert_eq!(u32::decode(&mut Cursor::new(&res[..])).unwrap(), NFSERR_NOENT);
    }

    #[test]
    fn lookup_returns_a_symlink() {
        let m = map("x type:=link;fs:=/tmp\n");
        let mut am = daemon(&m);
        let fh = top_fh(&am);

        let res = call(&mut am, NFS_PROGRAM, NFS_VERSION, NFSPROC_LOOKUP, &lookup_args(&fh, "x"));
        let mut cur = Cursor::new(&res[..]);
        assert_eq!(u32::decode(&mut cur).unwrap(), NFS_OK);
        let xfh = NfsHandle::decode(&mut cur).unwrap();
        assert_eq!(u32::decode(&mut cur).unwrap(), NFLNK);

        let res = call(&mut am, NFS_PROGRAM, NFS_VERSION, NFSPROC_READLINK, &xfh);
        let mut cur = Cursor::new(&res[..]);
        assert_eq!(u32::decode(&mut cur).unwrap(), NFS_OK);
        assert_eq!(String::decode(&mut cur).unwrap(), "/tmp");

        let res = call(&mut am, NFS_PROGRAM, NFS_VERSION, NFSPROC_LOOKUP, &lookup_args(&fh, "y"));
        assert_eq!(u32::decode(&mut Cursor::new(&res[..])).unwrap(), NFSERR_NOENT);
    }

    #[test]
    fn directory_attributes_and_listing() {
        let m = map("x type:=link;fs:=/tmp\n");
        let mut am = daemon(&m);
        let fh = top_fh(&am);
        call(&mut am, NFS_PROGRAM, NFS_VERSION, NFSPROC_LOOKUP, &lookup_args(&fh, "x"));

        let res = call(&mut am, NFS_PROGRAM, NFS_VERSION, NFSPROC_GETATTR, &fh);
        let mut cur = Cursor::new(&res[..]);
        assert_eq!(u32::decode(&mut cur).unwrap(), NFS_OK);
        assert_eq!(u32::decode(&mut cur).unwrap(), NFDIR);
        assert_eq!(u32::decode(&mut cur).unwrap(), 0o40555);
        assert_eq!(u32::decode(&mut cur).unwrap(), 3);

        let mut args = fh.to_vec();
        (Encoder::new(&mut args) << &0u32 << &4096u32).done().unwrap();
        let res = call(&mut am, NFS_PROGRAM, NFS_VERSION, NFSPROC_READDIR, &args);
        let mut cur = Cursor::new(&res[..]);
        assert_eq!(u32::decode(&mut cur).unwrap(), NFS_OK);
        let mut names = Vec::new();
        while bool::decode(&mut cur).unwrap() {
            let _fileid = u32::decode(&mut cur).unwrap();
            names.push(String::decode(&mut cur).unwrap());
            let _cookie = u32::decode(&mut cur).unwrap();
        }
        assert!(bool::decode(&mut cur).unwrap());
        assert_eq!(names, vec![".", "..", "x"]);

        let mut args = fh.to_vec();
        (Encoder::new(&mut args) << &2u32 << &4096u32).done().unwrap();
        let res = call(&mut am, NFS_PROGRAM, NFS_VERSION, NFSPROC_READDIR, &args);
        let mut cur = Cursor::new(&res[..]);
        assert_eq!(u32::decode(&mut cur).unwrap(), NFS_OK);
        assert!(bool::decode(&mut cur).unwrap());
        assert_eq!(u32::decode(&mut cur).unwrap(), am.nodes.find_path("/mnt/x").unwrap().0);
    }

    #[test]
    fn stale_and_read_only() {
        let m = map("x type:=link;fs:=/tmp\n");
        let mut am = daemon(&m);
        let bogus = node_fh(am.pid() + 1, NodeId(1), 0);
        let res = call(&mut am, NFS_PROGRAM, NFS_VERSION, NFSPROC_GETATTR, &bogus);
        assert_eq!(u32::decode(&mut Cursor::new(&res[..])).unwrap(), NFSERR_STALE);
        assert_eq!(am.stats.stale, 1);

        let fh = top_fh(&am);
        let res = call(&mut am, NFS_PROGRAM, NFS_VERSION, NFSPROC_MKDIR, &lookup_args(&fh, "z"));
        assert_eq!(u32::decode(&mut Cursor::new(&res[..])).unwrap(), NFSERR_ROFS);
    }

    #[test]
    fn errno_numbering() {
        assert_eq!(nfs_error(Errno::ENOENT), 2);
        assert_eq!(nfs_error(Errno::ESTALE), 70);
        assert_eq!(nfs_error(Errno::ENOTEMPTY), 66);
        assert_eq!(nfs_error(Errno::ETIMEDOUT), NFSERR_IO);
    }
}
