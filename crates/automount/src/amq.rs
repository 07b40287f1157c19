//! The amq query and control interface.
//!
//! Every procedure answers from a snapshot of the registries taken while
//! the call is dispatched; nothing here waits for a mount.

use {
    crate::{
        automount::Automounter,
        node::NodeId,
        ops::FsCaps,
        rpc::*,
        svc::{self, Refusal, Reply},
        xdr::{Decodable, Encodable, Encoder},
    },
    byteorder::{ReadBytesExt, WriteBytesExt},
    enum_primitive::*,
    log::{LevelFilter, info, warn},
    std::io::{Cursor, Result},
};

pub const AMQPROC_NULL: u32 = 0;
pub const AMQPROC_MNTTREE: u32 = 1;
pub const AMQPROC_UMNT: u32 = 2;
pub const AMQPROC_STATS: u32 = 3;
pub const AMQPROC_EXPORT: u32 = 4;
pub const AMQPROC_SETOPT: u32 = 5;
pub const AMQPROC_GETMNTFS: u32 = 6;
pub const AMQPROC_MOUNT: u32 = 7;
pub const AMQPROC_GETVERS: u32 = 8;

/// Longest string amq exchanges.
pub const AMQ_STRLEN: usize = 1024;

enum_from_primitive! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum AmqOpt {
        Debug       = 0,
        Logfile     = 1,
        Xlog        = 2,
        Flushmaps   = 3,
    }
}

/// A node and, through `child` and `next`, the subtree below it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MountTree {
    pub mountinfo: String,
    pub directory: String,
    pub mountpoint: String,
    pub fstype: String,
    pub mounttime: i32,
    pub mountuid: u32,
    pub getattr: i32,
    pub lookup: i32,
    pub readdir: i32,
    pub readlink: i32,
    pub statfs: i32,
    pub next: Option<Box<MountTree>>,
    pub child: Option<Box<MountTree>>,
}

impl Encodable for MountTree {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut n = (Encoder::new(&mut *w)
            << &self.mountinfo
            << &self.directory
            << &self.mountpoint
            << &self.fstype
            << &self.mounttime
            << &self.mountuid
            << &self.getattr
            << &self.lookup
            << &self.readdir
            << &self.readlink
            << &self.statfs)
            .done()?;
        n += self.next.encode(w)?;
        n += self.child.encode(w)?;
        Ok(n)
    }
}

impl Decodable for MountTree {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(MountTree {
            mountinfo: Decodable::decode(r)?,
            directory: Decodable::decode(r)?,
            mountpoint: Decodable::decode(r)?,
            fstype: Decodable::decode(r)?,
            mounttime: Decodable::decode(r)?,
            mountuid: Decodable::decode(r)?,
            getattr: Decodable::decode(r)?,
            lookup: Decodable::decode(r)?,
            readdir: Decodable::decode(r)?,
            readlink: Decodable::decode(r)?,
            statfs: Decodable::decode(r)?,
            next: Decodable::decode(r)?,
            child: Decodable::decode(r)?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MountInfo {
    pub fstype: String,
    pub mountpt: String,
    pub mountinfo: String,
    pub fserver: String,
    pub error: i32,
    pub refc: i32,
    /// 1 up, 0 down, -1 unknown
    pub up: i32,
}

impl Encodable for MountInfo {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w)
            << &self.fstype
            << &self.mountpt
            << &self.mountinfo
            << &self.fserver
            << &self.error
            << &self.refc
            << &self.up)
            .done()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MountStats {
    pub drops: i32,
    pub stale: i32,
    pub mok: i32,
    pub merr: i32,
    pub uerr: i32,
}

impl Encodable for MountStats {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w) << &self.drops << &self.stale << &self.mok << &self.merr << &self.uerr)
            .done()
    }
}

fn amq_string<R: ReadBytesExt>(r: &mut R) -> Result<String> {
    let s: String = Decodable::decode(r)?;
    if s.len() > AMQ_STRLEN {
        return Err(crate::io_err!(InvalidData, "amq string too long"));
    }
    Ok(s)
}

/// Snapshot of `id` and its subtree. Siblings are chained through `next`.
fn mount_tree(am: &Automounter, id: NodeId) -> Option<MountTree> {
    let node = am.nodes.get(id)?;
    let mf = am.mntfs.get(node.mf)?;
    let children = am.nodes.children(id);
    let mut child = None;
    for c in children {
        if let Some(mut t) = mount_tree(am, c) {
            t.next = child.take();
            child = Some(Box::new(t));
        }
    }
    Some(MountTree {
        mountinfo: mf.info.clone(),
        directory: node.path.clone(),
        mountpoint: node.link.clone().unwrap_or_else(|| mf.mount.clone()),
        fstype: mf.fstype.name().to_owned(),
        mounttime: node.stats.mounted_at as i32,
        mountuid: 0,
        getattr: node.stats.getattr as i32,
        lookup: node.stats.lookup as i32,
        readdir: node.stats.readdir as i32,
        readlink: node.stats.readlink as i32,
        statfs: node.stats.statfs as i32,
        next: None,
        child,
    })
}

fn mount_infos(am: &Automounter) -> Vec<MountInfo> {
    am.mntfs
        .iter()
        .filter(|(_, mf)| mf.fstype.ops().caps().contains(FsCaps::AMQINFO))
        .map(|(_, mf)| {
            let server = am.servers.get(mf.server);
            MountInfo {
                fstype: mf.fstype.name().to_owned(),
                mountpt: mf.mount.clone(),
                mountinfo: mf.info.clone(),
                fserver: server.map(|fs| fs.host.clone()).unwrap_or_default(),
                error: mf.error.map_or(0, |e| e as i32),
                refc: mf.refc as i32,
                up: match server {
                    Some(fs) if fs.is_up() => 1,
                    Some(fs) if fs.is_down() => 0,
                    _ => -1,
                },
            }
        })
        .collect()
}

/// Log level named by a `DEBUG` or `XLOG` option string. The most verbose
/// level named wins; `no` prefixed names are ignored.
pub fn log_level(opts: &str) -> Option<LevelFilter> {
    opts.split(',')
        .map(str::trim)
        .filter(|o| !o.starts_with("no"))
        .filter_map(|o| match o {
            "all" | "trace" => Some(LevelFilter::Trace),
            "debug" | "mem" | "str" | "trace_nfs" => Some(LevelFilter::Debug),
            "info" | "map" | "stats" => Some(LevelFilter::Info),
            "user" | "warn" | "warning" => Some(LevelFilter::Warn),
            "error" | "fatal" => Some(LevelFilter::Error),
            _ => None,
        })
        .max()
}

fn setopt(am: &mut Automounter, opt: u32, arg: &str) -> i32 {
    match AmqOpt::from_u32(opt) {
        Some(AmqOpt::Debug) | Some(AmqOpt::Xlog) => match log_level(arg) {
            Some(level) => {
                info!("amq: log level set to {}", level);
                log::set_max_level(level);
                0
            }
            None => 1,
        },
        Some(AmqOpt::Flushmaps) => {
            info!("amq: flushing maps");
            am.flush_maps();
            0
        }
        Some(AmqOpt::Logfile) | None => 1,
    }
}

/// `"dir map [opts]"`
fn mount(am: &mut Automounter, spec: &str) -> i32 {
    let mut words = spec.split_ascii_whitespace();
    let (Some(dir), Some(map)) = (words.next(), words.next()) else {
        warn!("amq: bad mount request \"{}\"", spec);
        return nix::errno::Errno::EINVAL as i32;
    };
    let opts = words.collect::<Vec<_>>().join(" ");
    info!("amq: mounting {} from {}", dir, map);
    match am.add_map(dir, map, &opts) {
        Ok(()) => 0,
        Err(e) => e as i32,
    }
}

pub fn version_string(am: &Automounter) -> String {
    format!(
        "amd {} ({}-{}) pid {}",
        env!("CARGO_PKG_VERSION"),
        am.config.arch,
        am.config.os,
        am.pid()
    )
}

/// Answer one amq call.
pub fn dispatch(am: &mut Automounter, packet: &[u8]) -> Option<Vec<u8>> {
    svc::serve(packet, |call, args| {
        if call.prog != AMQ_PROGRAM {
            return Err(Refusal::Fail(AcceptBody::ProgUnavail));
        }
        svc::check_version(call, AMQ_VERSION, AMQ_VERSION)?;
        amq_proc(am, call.proc_, args)
    })
}

fn amq_proc(am: &mut Automounter, proc_: u32, args: &mut Cursor<&[u8]>) -> Reply {
    match proc_ {
        AMQPROC_NULL => svc::void(),
        AMQPROC_MNTTREE => {
            let path = amq_string(args)?;
            let tree = am.nodes.find_path(&path).and_then(|id| mount_tree(am, id));
            svc::results(&tree)
        }
        AMQPROC_UMNT => {
            let path = amq_string(args)?;
            if let Err(e) = am.force_timeout(&path) {
                info!("amq: cannot unmount {}: {}", path, e);
            }
            svc::void()
        }
        AMQPROC_STATS => svc::results(&MountStats {
            drops: am.stats.drops as i32,
            stale: am.stats.stale as i32,
            mok: am.stats.mok as i32,
            merr: am.stats.merr as i32,
            uerr: am.stats.uerr as i32,
        }),
        AMQPROC_EXPORT => {
            let trees: Vec<Option<MountTree>> = match am.root() {
                Some(root) => am
                    .nodes
                    .children(root)
                    .into_iter()
                    .map(|id| mount_tree(am, id))
                    .filter(Option::is_some)
                    .collect(),
                None => Vec::new(),
            };
            svc::results(&trees)
        }
        AMQPROC_SETOPT => {
            let opt: u32 = Decodable::decode(args)?;
            let arg = amq_string(args)?;
            svc::results(&setopt(am, opt, &arg))
        }
        AMQPROC_GETMNTFS => svc::results(&mount_infos(am)),
        AMQPROC_MOUNT => {
            let spec = amq_string(args)?;
            svc::results(&mount(am, &spec))
        }
        AMQPROC_GETVERS => svc::results(&version_string(am)),
        _ => Err(Refusal::Fail(AcceptBody::ProcUnavail)),
    }
}
