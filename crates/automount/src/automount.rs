//! The automounter context.
//!
//! [`Automounter`] owns every registry of the daemon and implements the
//! automount state machine: lookups create nodes and start mounts, the
//! dismount scan unmounts idle nodes, and shutdown walks the daemon through
//! Finishing, Quit and Done. It never blocks and performs no I/O of its own;
//! the server loop feeds it time, forwarded replies and child exits, and
//! drains the forwarder's outbox.

use {
    crate::{
        clock::{CalloutId, Clock},
        config::Config,
        fhandle::{FH_TTL_ERROR, FhCache},
        fserver::{FserverId, FserverRegistry, Liveness, ServerKind},
        fwd::{Forwarder, FwdKind, make_xid, split_xid},
        mapc::{DEFAULTS, MapRegistry, MapTypes, WILDCARD},
        mntfs::{MfFlags, MntfsId, MntfsKey, MntfsRegistry},
        nfs_srv::node_fh,
        node::{AmFlags, AmNode, NodeId, NodeTree},
        ops::{FsCaps, FsType, InitCx, InitStatus, MountCx},
        opts::{self, OptsEnv, has_opt},
        platform::Platform,
        rpc::*,
        sched::{Scheduler, TaskContext, TaskStatus, Wchan, do_task_notify},
        xdr::{read_msg, write_msg},
    },
    log::{debug, error, info, warn},
    nix::errno::Errno,
    std::{
        collections::{BTreeSet, VecDeque},
        io::Cursor,
        net::SocketAddr,
        rc::Rc,
        time::{Duration, Instant},
    },
};

/// Longest the loop sleeps while shutting down.
const FINISH_POLL: Duration = Duration::from_secs(1);

/// Timed events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Callout {
    /// Evict the file handle resolved by this request
    FhEvict(u32),
    Ping(FserverId),
    /// Forget an unreferenced server
    DiscardServer(FserverId),
    /// Dismount scan
    TimeoutMp,
    /// Let a filesystem that failed transiently be tried again
    ClearError(MntfsId),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AmdState {
    Start,
    Run,
    /// Unmounting everything
    Finishing,
    /// Unmounting the top-level points
    Quit,
    Done,
}

/// Daemon-wide counters reported through amq.
#[derive(Clone, Debug, Default)]
pub struct AmdStats {
    /// Requests dropped because they had to wait
    pub drops: u32,
    /// Requests with stale handles
    pub stale: u32,
    pub mok: u32,
    pub merr: u32,
    pub uerr: u32,
}

/// Outcome of a lookup.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    Found(NodeId),
    /// Still mounting; ask again once `Wchan` is woken
    Wait(Wchan),
    Failed(Errno),
}

pub struct Automounter {
    pub config: Config,
    pub clock: Clock<Callout>,
    pub maps: MapRegistry,
    pub servers: FserverRegistry,
    pub mntfs: MntfsRegistry,
    pub nodes: NodeTree,
    pub fh: FhCache,
    pub fwd: Forwarder,
    pub stats: AmdStats,
    sched: Scheduler<Automounter>,
    platform: Rc<dyn Platform>,
    state: AmdState,
    root: Option<NodeId>,
    /// Nodes with a resume job queued
    resuming: BTreeSet<NodeId>,
    timeout_cid: Option<CalloutId>,
    next_reload: Instant,
    nfs_addr: Option<SocketAddr>,
    pid: u32,
}

impl TaskContext for Automounter {
    fn scheduler(&mut self) -> &mut Scheduler<Self> {
        &mut self.sched
    }
}

impl Automounter {
    pub fn new(
        config: Config,
        types: MapTypes,
        platform: Rc<dyn Platform>,
        now: Instant,
    ) -> Automounter {
        let machine = config.hostname.clone();
        let next_reload = now + config.map_reload_interval;
        Automounter {
            servers: FserverRegistry::new(config.ping_interval),
            config,
            clock: Clock::new(now),
            maps: MapRegistry::new(types),
            mntfs: MntfsRegistry::new(),
            nodes: NodeTree::new(),
            fh: FhCache::new(&machine),
            fwd: Forwarder::new(),
            stats: AmdStats::default(),
            sched: Scheduler::new(),
            platform,
            state: AmdState::Start,
            root: None,
            resuming: BTreeSet::new(),
            timeout_cid: None,
            next_reload,
            nfs_addr: None,
            pid: std::process::id(),
        }
    }

    pub fn state(&self) -> AmdState {
        self.state
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Address top-level points are mounted from.
    pub fn set_nfs_addr(&mut self, addr: SocketAddr) {
        self.nfs_addr = Some(addr);
    }

    /// Add a top-level automount point on `dir` served from `map`. Once
    /// running, the point is mounted straight away.
    pub fn add_map(&mut self, dir: &str, map: &str, opts: &str) -> Result<(), Errno> {
        if let Some(root) = self.root {
            if self.nodes.find_child(root, dir).is_some() {
                warn!("{}: already an automount point", dir);
                return Err(Errno::EEXIST);
            }
        }
        self.maps.root_newmap(dir, opts, Some(map));
        if self.state != AmdState::Run {
            return Ok(());
        }
        match self.mount_toplvl(dir) {
            Lookup::Failed(e) => Err(e),
            _ => Ok(()),
        }
    }

    /// Build the root of the namespace and mount every top-level point.
    pub fn start(&mut self) {
        if self.state != AmdState::Start {
            return;
        }
        let map = self.maps.root_map();
        let server = self.servers.find_local();
        let (mf, _) = self.mntfs.find(
            MntfsKey {
                fstype: FsType::Auto,
                mount: "/",
                info: crate::mapc::root::ROOT_MAP,
                opts: "",
                server,
            },
            "",
            opts::FsOpts::default(),
        );
        if let Some(mf) = self.mntfs.get_mut(mf) {
            mf.flags.insert(MfFlags::MOUNTED);
        }
        let mut node = AmNode::new("", "/", mf, self.clock.now());
        node.map = Some(map);
        node.flags = AmFlags::ROOT | AmFlags::NOTIMEOUT;
        node.mark_mounted();
        self.root = Some(self.nodes.insert_root(node));
        self.state = AmdState::Run;

        let mut dirs: Vec<String> = self
            .maps
            .keys(map)
            .into_iter()
            .filter(|k| k != DEFAULTS && k != WILDCARD)
            .collect();
        dirs.sort();
        for dir in dirs {
            self.mount_toplvl(&dir);
        }

        self.timeout_cid = Some(
            self.clock
                .timeout(self.config.dismount_interval, Callout::TimeoutMp),
        );
        info!("amd {} running", self.pid);
    }

    fn mount_toplvl(&mut self, dir: &str) -> Lookup {
        let Some(root) = self.root else {
            return Lookup::Failed(Errno::ENOENT);
        };
        let res = self.lookup(root, dir);
        if let Lookup::Failed(e) = res {
            error!("{}: cannot mount automount point: {}", dir, e);
        }
        res
    }

    /// Resolve `name` in the directory node `parent`, creating and mounting
    /// the child on first use.
    pub fn lookup(&mut self, parent: NodeId, name: &str) -> Lookup {
        let Some(pnode) = self.nodes.get_mut(parent) else {
            return Lookup::Failed(Errno::ESTALE);
        };
        pnode.stats.lookup += 1;
        match name {
            "." => return Lookup::Found(parent),
            ".." => return Lookup::Found(pnode.parent().unwrap_or(parent)),
            _ => {}
        }

        if let Some(child) = self.nodes.find_child(parent, name) {
            if self.state >= AmdState::Finishing {
                let mounted = self
                    .nodes
                    .get(child)
                    .and_then(|n| self.mntfs.get(n.mf))
                    .is_some_and(|mf| mf.is_mounted());
                return if mounted {
                    Lookup::Found(child)
                } else {
                    Lookup::Failed(Errno::ENOENT)
                };
            }
            let now = self.clock.now();
            let ttl = self.config.cache_duration;
            if let Some(n) = self.nodes.get_mut(child) {
                n.touch(now, ttl);
            }
            return self.try_mount(child);
        }

        if self.state >= AmdState::Finishing {
            debug!("lookup of {} refused while shutting down", name);
            return Lookup::Failed(Errno::ENOENT);
        }
        self.new_node(parent, name)
    }

    fn new_node(&mut self, parent: NodeId, name: &str) -> Lookup {
        let Some(pnode) = self.nodes.get(parent) else {
            return Lookup::Failed(Errno::ESTALE);
        };
        let Some(map) = pnode.map else {
            return Lookup::Failed(Errno::ENOENT);
        };
        let key = format!("{}{}", pnode.pref, name);
        let path = if Some(parent) == self.root {
            name.to_owned()
        } else {
            format!("{}/{}", pnode.path.trim_end_matches('/'), name)
        };

        let entry = match self.maps.search(map, &key) {
            Ok(entry) => entry,
            Err(e) => {
                debug!("no map entry for {}: {}", key, e);
                return Lookup::Failed(e);
            }
        };
        let dflts = self.maps.defaults(map);
        let env = OptsEnv {
            key: key.clone(),
            map: self.maps.name(map).unwrap_or_default().to_owned(),
            path: path.clone(),
            autodir: self.config.autodir.clone(),
            host: self.config.hostname.clone(),
            domain: self.config.domain.clone(),
            arch: self.config.arch.clone(),
            os: self.config.os.clone(),
        };

        let mut mfs = VecDeque::new();
        for (d, loc) in opts::locations(dflts.as_deref(), &entry) {
            let Some(fo) = opts::eval_fs_opts(&env, &d, &loc) else {
                continue;
            };
            let Some(ops) = fo.fstype.as_deref().and_then(crate::ops::by_name) else {
                warn!("{}: unknown filesystem type {:?}", path, fo.fstype);
                continue;
            };
            let Some(info) = ops.fs_match(&fo) else {
                continue;
            };
            let mount = ops.mount_point(&fo, &path);
            let mopts = fo.opts.clone().unwrap_or_default();
            let remopts = fo.remopts.clone().unwrap_or_else(|| mopts.clone());
            let (server, new_server) = ops.find_server(&fo, &mut self.servers);
            let (mf, new) = self.mntfs.find(
                MntfsKey {
                    fstype: ops.fstype(),
                    mount: &mount,
                    info: &info,
                    opts: &mopts,
                    server,
                },
                &remopts,
                fo,
            );
            if !new {
                self.release_server(server);
            } else if new_server {
                self.ensure_pinging(server);
            }
            mfs.push_back(mf);
        }

        let Some(first) = mfs.pop_front() else {
            warn!("{}: no usable location in \"{}\"", path, entry);
            return Lookup::Failed(Errno::ENOENT);
        };
        let ttl = self.clock.now() + self.config.cache_duration;
        let mut node = AmNode::new(name, &path, first, ttl);
        node.alts = mfs;
        match self.nodes.insert(parent, node) {
            Some(child) => {
                debug!("new node {} for {}", child.0, path);
                self.try_mount(child)
            }
            None => Lookup::Failed(Errno::ESTALE),
        }
    }

    /// Drive the node's current filesystem towards mounted, falling back
    /// to its alternatives on failure.
    fn try_mount(&mut self, node: NodeId) -> Lookup {
        loop {
            let Some(mf_id) = self.nodes.get(node).map(|n| n.mf) else {
                return Lookup::Failed(Errno::ESTALE);
            };
            let Some(mf) = self.mntfs.get(mf_id) else {
                return Lookup::Failed(Errno::ESTALE);
            };

            if mf.is_mounted() {
                self.am_mounted(node);
                return Lookup::Found(node);
            }
            if mf.flags.contains(MfFlags::ERROR) {
                let e = mf.error.unwrap_or(Errno::EIO);
                if self.next_alt(node) {
                    continue;
                }
                return Lookup::Failed(e);
            }
            if mf.in_transit() {
                return self.wait_for(node, mf_id);
            }

            let status = self.init_mntfs(mf_id);
            match status {
                InitStatus::Wait => return self.wait_for(node, mf_id),
                InitStatus::Failed(e) => {
                    self.mount_failed(mf_id, e);
                    continue;
                }
                InitStatus::Ready => {}
            }
            if let Some(res) = self.start_mount(node, mf_id) {
                return res;
            }
        }
    }

    fn init_mntfs(&mut self, mf_id: MntfsId) -> InitStatus {
        let Some(mf) = self.mntfs.get_mut(mf_id) else {
            return InitStatus::Failed(Errno::ESTALE);
        };
        let ops = mf.fstype.ops();
        let mut cx = InitCx {
            id: mf_id,
            servers: &self.servers,
            fh: &mut self.fh,
            fwd: &mut self.fwd,
            clock: &mut self.clock,
        };
        ops.init(mf, &mut cx)
    }

    /// Queue a resume of `node` for when `mf_id` changes state.
    fn wait_for(&mut self, node: NodeId, mf_id: MntfsId) -> Lookup {
        let Some(generation) = self.nodes.get(node).map(|n| n.generation) else {
            return Lookup::Failed(Errno::ESTALE);
        };
        if self.resuming.insert(node) {
            self.sched.sched_task(
                Box::new(move |am: &mut Automounter, _: TaskStatus| am.resume(node, generation)),
                Wchan::Mntfs(mf_id),
            );
        }
        Lookup::Wait(Wchan::Mntfs(mf_id))
    }

    fn resume(&mut self, node: NodeId, generation: u32) {
        if self.nodes.get_gen(node, generation).is_none() {
            return;
        }
        self.resuming.remove(&node);
        if self.state >= AmdState::Finishing {
            return;
        }
        if let Lookup::Failed(e) = self.try_mount(node) {
            let path = self.nodes.get(node).map(|n| n.path.clone());
            info!("{}: mount failed: {}", path.unwrap_or_default(), e);
        }
    }

    /// Start the kernel mount. `None` if the filesystem is already mounted
    /// on return.
    fn start_mount(&mut self, node: NodeId, mf_id: MntfsId) -> Option<Lookup> {
        let generation = self.nodes.get(node)?.generation;
        let mf = self.mntfs.get(mf_id)?;
        let ops = mf.fstype.ops();
        let cx = MountCx {
            config: &self.config,
            nfs_addr: self.nfs_addr,
            node_fh: node_fh(self.pid, node, generation),
            pid: self.pid,
        };
        let req = match ops.mount_request(mf, &cx) {
            Ok(Some(req)) => req,
            Ok(None) => {
                self.mount_done(mf_id, TaskStatus::default());
                return None;
            }
            Err(e) => {
                self.mount_failed(mf_id, e);
                return None;
            }
        };

        let caps = ops.caps();
        let background = caps.contains(FsCaps::BACKGROUND) && self.config.background_mounts;
        if let Some(mf) = self.mntfs.get_mut(mf_id) {
            mf.flags.insert(MfFlags::MOUNTING);
            mf.flags.remove(MfFlags::ERROR);
        }
        info!("mounting {} on {}", req.source, req.target);

        let platform = self.platform.clone();
        let mkmnt = caps.contains(FsCaps::MKMNT);
        self.sched.run_task(
            background,
            move || {
                if mkmnt {
                    if let Err(e) = platform.mkdirs(&req.target) {
                        return e as i32;
                    }
                }
                match platform.mount(&req) {
                    Ok(()) => 0,
                    Err(e) => e as i32,
                }
            },
            Box::new(move |am: &mut Automounter, status: TaskStatus| am.mount_done(mf_id, status)),
        );
        Some(self.wait_for(node, mf_id))
    }

    fn mount_done(&mut self, mf_id: MntfsId, status: TaskStatus) {
        let Some(mf) = self.mntfs.get_mut(mf_id) else {
            return;
        };
        mf.flags.remove(MfFlags::MOUNTING);
        if status.success() {
            mf.flags.insert(MfFlags::MOUNTED);
            mf.flags.remove(MfFlags::ERROR);
            mf.error = None;
            self.stats.mok += 1;
            debug!("{} ({}) mounted on {}", mf.info, mf.fstype, mf.mount);
            self.sched.wakeup(Wchan::Mntfs(mf_id));
        } else {
            self.mount_failed(mf_id, status.errno());
        }
    }

    fn mount_failed(&mut self, mf_id: MntfsId, e: Errno) {
        if let Some(mf) = self.mntfs.get_mut(mf_id) {
            warn!("mount of {} on {} failed: {}", mf.info, mf.mount, e);
            mf.set_error(e);
            self.stats.merr += 1;
            if let Some(cid) = mf.cid.take() {
                self.clock.untimeout(cid);
            }
            if is_transient(e) {
                mf.cid = Some(self.clock.timeout(FH_TTL_ERROR, Callout::ClearError(mf_id)));
            }
        }
        self.sched.wakeup(Wchan::Mntfs(mf_id));
    }

    fn clear_error(&mut self, mf_id: MntfsId, cid: CalloutId) {
        let Some(mf) = self.mntfs.get_mut(mf_id) else {
            return;
        };
        if mf.cid != Some(cid) {
            return;
        }
        mf.cid = None;
        if mf.flags.contains(MfFlags::ERROR) {
            debug!("{}: forgetting error {:?}", mf.info, mf.error);
            mf.flags.remove(MfFlags::ERROR);
            mf.error = None;
        }
    }

    /// Switch `node` to its next alternative. False if there is none.
    fn next_alt(&mut self, node: NodeId) -> bool {
        let Some(n) = self.nodes.get_mut(node) else {
            return false;
        };
        let Some(next) = n.alts.pop_front() else {
            return false;
        };
        let old = std::mem::replace(&mut n.mf, next);
        self.release_mntfs(old);
        true
    }

    /// Account for a mounted node.
    fn am_mounted(&mut self, node: NodeId) {
        let now = self.clock.now();
        let Some(n) = self.nodes.get(node) else {
            return;
        };
        if n.stats.mounted_at != 0 {
            return;
        }
        let Some(mf) = self.mntfs.get(n.mf) else {
            return;
        };
        let ops = mf.fstype.ops();
        let mut flags = AmFlags::empty();
        let mut link = None;
        let mut map = None;
        let mut pref = String::new();

        if ops.caps().contains(FsCaps::DIRECTORY) {
            let cache = mf.fo.cache.clone().unwrap_or_else(|| self.config.map_options.clone());
            map = Some((mf.info.clone(), cache));
            pref = mf.fo.pref.clone().unwrap_or_default();
            if mf.fstype == FsType::Toplvl {
                flags |= AmFlags::ROOT | AmFlags::NOTIMEOUT;
            }
        } else {
            link = Some(match mf.fo.sublink.as_deref() {
                Some(sub) if !sub.is_empty() => format!("{}/{}", mf.mount, sub),
                _ => mf.mount.clone(),
            });
        }
        if has_opt(&mf.opts, "nounmount") {
            flags |= AmFlags::NOTIMEOUT;
        }
        info!("{} mounted fstype {} on {}", mf.info, mf.fstype, mf.mount);

        let map = map.map(|(name, cache)| self.maps.find(&name, &cache));
        let ttl = self.config.cache_duration;
        if let Some(n) = self.nodes.get_mut(node) {
            n.flags |= flags;
            n.link = link;
            if n.map.is_none() {
                n.map = map;
            } else if let Some(extra) = map {
                self.maps.release(extra);
            }
            n.pref = pref;
            n.touch(now, ttl);
            n.mark_mounted();
        }
        self.sched.wakeup(Wchan::Node(node));
    }

    /// Unmount every idle node. With `force`, TTLs and NOTIMEOUT are
    /// ignored; top-level points are left to the Quit state.
    fn timeout_mp(&mut self, force: bool) {
        let now = self.clock.now();
        let root = self.root;
        let candidates: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(id, n)| {
                Some(*id) != root
                    && !n.has_children()
                    && !self.resuming.contains(id)
                    && !n.flags.contains(AmFlags::ROOT)
                    && (force || (!n.flags.contains(AmFlags::NOTIMEOUT) && n.ttl <= now))
            })
            .map(|(id, _)| id)
            .collect();
        for node in candidates {
            self.try_unmount(node, false);
        }
    }

    /// Unmount and free `node`. With `free_anyway` the node goes even if
    /// the unmount fails.
    fn try_unmount(&mut self, node: NodeId, free_anyway: bool) {
        let Some(n) = self.nodes.get(node) else {
            return;
        };
        let generation = n.generation;
        let mf_id = n.mf;
        let Some(mf) = self.mntfs.get(mf_id) else {
            self.free_node(node);
            return;
        };
        if mf.in_transit() {
            return;
        }
        if mf.refc > 1 || !mf.is_mounted() {
            self.free_node(node);
            return;
        }

        let ops = mf.fstype.ops();
        let Some(target) = ops.unmount_target(mf) else {
            if let Some(mf) = self.mntfs.get_mut(mf_id) {
                mf.flags.remove(MfFlags::MOUNTED);
            }
            self.free_node(node);
            return;
        };
        let caps = ops.caps();
        let background = caps.contains(FsCaps::BACKGROUND) && self.config.background_mounts;
        let rmdir = caps.contains(FsCaps::MKMNT);
        if let Some(mf) = self.mntfs.get_mut(mf_id) {
            mf.flags.insert(MfFlags::UNMOUNTING);
        }
        info!("unmounting {}", target);

        let platform = self.platform.clone();
        self.sched.run_task(
            background,
            move || match platform.unmount(&target, false) {
                Ok(()) => {
                    if rmdir {
                        let _ = platform.rmdir(&target);
                    }
                    0
                }
                Err(e) => e as i32,
            },
            Box::new(move |am: &mut Automounter, status: TaskStatus| {
                am.unmount_done(node, generation, mf_id, status, free_anyway)
            }),
        );
    }

    fn unmount_done(
        &mut self,
        node: NodeId,
        generation: u32,
        mf_id: MntfsId,
        status: TaskStatus,
        free_anyway: bool,
    ) {
        if let Some(mf) = self.mntfs.get_mut(mf_id) {
            mf.flags.remove(MfFlags::UNMOUNTING);
            if status.success() {
                mf.flags.remove(MfFlags::MOUNTED);
                debug!("{} unmounted from {}", mf.info, mf.mount);
            } else {
                warn!("unmount of {} failed: {}", mf.mount, status.errno());
                self.stats.uerr += 1;
            }
        }
        let alive = self.nodes.get_gen(node, generation).is_some();
        if alive {
            if status.success() || free_anyway {
                self.free_node(node);
            } else {
                let now = self.clock.now();
                let ttl = self.config.cache_duration;
                if let Some(n) = self.nodes.get_mut(node) {
                    n.touch(now, ttl);
                }
            }
        }
        self.sched.wakeup(Wchan::Mntfs(mf_id));
    }

    /// Remove a childless node and drop everything it references.
    fn free_node(&mut self, node: NodeId) {
        let Some(n) = self.nodes.remove(node) else {
            warn!("cannot free node {}", node.0);
            return;
        };
        debug!("freeing node {}", n.path);
        self.resuming.remove(&node);
        if let Some(map) = n.map {
            self.maps.release(map);
        }
        self.release_mntfs(n.mf);
        for alt in n.alts {
            self.release_mntfs(alt);
        }
        self.sched.wakeup(Wchan::Node(node));
    }

    fn release_mntfs(&mut self, id: MntfsId) {
        if let Some(mf) = self.mntfs.release(id) {
            if let Some(cid) = mf.cid {
                self.clock.untimeout(cid);
            }
            self.release_server(mf.server);
        }
    }

    fn release_server(&mut self, id: FserverId) {
        if !self.servers.release(id) {
            return;
        }
        if self.state >= AmdState::Finishing {
            self.discard_server(id);
            return;
        }
        let linger = self.config.cache_duration;
        if let Some(fs) = self.servers.get_mut(id) {
            if let Some(cid) = fs.cid.take() {
                self.clock.untimeout(cid);
            }
            fs.cid = Some(self.clock.timeout(linger, Callout::DiscardServer(id)));
        }
    }

    fn discard_server(&mut self, id: FserverId) {
        match self.servers.discard(id) {
            Some(fs) => {
                if let Some(cid) = fs.cid {
                    self.clock.untimeout(cid);
                }
                self.fh.purge(id, &mut self.clock);
            }
            None => {
                // Referenced again since it was released
                if let Some(fs) = self.servers.get_mut(id) {
                    fs.cid = None;
                }
                self.ensure_pinging(id);
            }
        }
    }

    fn ensure_pinging(&mut self, id: FserverId) {
        let idle = self
            .servers
            .get(id)
            .is_some_and(|fs| fs.kind == ServerKind::Nfs && fs.addr.is_some() && fs.cid.is_none());
        if idle {
            self.ping(id);
        }
    }

    /// Send an NFS NULL call to `id` and schedule the next one.
    fn ping(&mut self, id: FserverId) {
        let Some(ip) = self.servers.get(id).and_then(|fs| fs.addr) else {
            return;
        };
        if self.servers.keepalive(id) == Some(Liveness::Down) {
            self.server_changed(id);
        }

        let xid = make_xid(FwdKind::NfsPing, id.0);
        let msg = RpcMsg::call(xid, NFS_PROGRAM, NFS_VERSION, NFSPROC_NULL, OpaqueAuth::none());
        let mut packet = Vec::new();
        match write_msg(&mut packet, &msg) {
            Ok(_) => self.fwd.post(SocketAddr::new(ip, NFS_PORT), packet),
            Err(e) => error!("cannot encode ping: {}", e),
        }

        let next = self.servers.next_ping(id);
        let cid = self.clock.timeout(next, Callout::Ping(id));
        if let Some(fs) = self.servers.get_mut(id) {
            fs.cid = Some(cid);
        }
    }

    /// A server went up or down: its cached handles are no longer trusted.
    fn server_changed(&mut self, id: FserverId) {
        for w in self.fh.flush(Some(id), &mut self.clock) {
            self.sched.wakeup(w);
        }
    }

    /// A datagram arrived on the forwarding socket.
    pub fn fwd_reply(&mut self, packet: &[u8]) {
        let mut cur = Cursor::new(packet);
        let msg = match read_msg(&mut cur) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("fwd: undecodable reply: {}", e);
                return;
            }
        };
        let Some((kind, id)) = split_xid(msg.xid) else {
            debug!("fwd: reply with foreign xid {:#x}", msg.xid);
            return;
        };
        if kind == FwdKind::NfsPing {
            if msg.is_success() && self.servers.ping_ok(FserverId(id)) == Some(Liveness::Up) {
                self.server_changed(FserverId(id));
            }
            return;
        }
        if !self.fwd.reply(msg.xid) {
            debug!("fwd: late or duplicate reply {:#x}", msg.xid);
            return;
        }
        let woken = self
            .fh
            .on_reply(kind, id, &msg, &mut cur, &mut self.fwd, &mut self.clock);
        for w in woken {
            self.sched.wakeup(w);
        }
    }

    /// Advance to `now`: retransmit, fire callouts, run ready jobs and
    /// move the shutdown along.
    pub fn tick(&mut self, now: Instant) {
        self.clock.tick(now);

        for xid in self.fwd.retransmit(now) {
            if let Some((FwdKind::Portmap | FwdKind::Mountd, id)) = split_xid(xid) {
                for w in self.fh.on_timeout(id, &mut self.clock) {
                    self.sched.wakeup(w);
                }
            }
        }

        for (cid, callout) in self.clock.softclock() {
            match callout {
                Callout::FhEvict(id) => self.fh.evict(id),
                Callout::Ping(id) => {
                    if let Some(fs) = self.servers.get_mut(id) {
                        if fs.cid == Some(cid) {
                            fs.cid = None;
                        }
                    }
                    self.ping(id);
                }
                Callout::DiscardServer(id) => self.discard_server(id),
                Callout::ClearError(id) => self.clear_error(id, cid),
                Callout::TimeoutMp => {
                    self.timeout_mp(false);
                    self.timeout_cid = Some(
                        self.clock
                            .timeout(self.config.dismount_interval, Callout::TimeoutMp),
                    );
                }
            }
        }

        if self.state == AmdState::Run && now >= self.next_reload {
            self.maps.reload_all();
            self.next_reload = now + self.config.map_reload_interval;
        }

        do_task_notify(self);
        if self.state >= AmdState::Finishing {
            self.check_state();
            do_task_notify(self);
        }
    }

    /// Begin an orderly shutdown.
    pub fn shutdown(&mut self) {
        if self.state < AmdState::Finishing {
            info!("shutdown requested");
            self.state = AmdState::Finishing;
        }
    }

    fn check_state(&mut self) {
        let Some(root) = self.root else {
            self.state = AmdState::Done;
            return;
        };

        if self.state == AmdState::Finishing {
            self.timeout_mp(true);
            let busy = self.mntfs.iter().any(|(_, mf)| mf.in_transit());
            let only_toplvl = self.nodes.iter().all(|(id, n)| {
                id == root
                    || (n.parent() == Some(root)
                        && self
                            .mntfs
                            .get(n.mf)
                            .is_some_and(|mf| mf.fstype == FsType::Toplvl))
            });
            if busy || !only_toplvl {
                return;
            }
            info!("finishing with status 0");
            self.state = AmdState::Quit;
            for top in self.nodes.children(root) {
                self.try_unmount(top, true);
            }
        }

        if self.state == AmdState::Quit && self.nodes.len() == 1 {
            if let Some(cid) = self.timeout_cid.take() {
                self.clock.untimeout(cid);
            }
            self.free_node(root);
            self.root = None;
            self.state = AmdState::Done;
            info!("all automount points unmounted");
        }
    }

    /// Time out the node mounted at `path` right away (amq `-u`).
    pub fn force_timeout(&mut self, path: &str) -> Result<(), Errno> {
        let Some(node) = self.nodes.find_path(path) else {
            return Err(Errno::ENOENT);
        };
        let now = self.clock.now();
        let Some(n) = self.nodes.get_mut(node) else {
            return Err(Errno::ENOENT);
        };
        if n.flags.contains(AmFlags::ROOT) {
            info!("ignoring timeout request for automount point {}", path);
            return Err(Errno::EPERM);
        }
        n.flags.remove(AmFlags::NOTIMEOUT);
        n.ttl = now;
        self.timeout_mp(false);
        Ok(())
    }

    /// Reload every map and forget every cached file handle.
    pub fn flush_maps(&mut self) {
        self.maps.reload_all();
        for w in self.fh.flush(None, &mut self.clock) {
            self.sched.wakeup(w);
        }
    }

    /// Reload every map, as after SIGHUP.
    pub fn reload(&mut self) {
        self.maps.reload_all();
        self.next_reload = self.clock.now() + self.config.map_reload_interval;
    }

    /// Reap exited children.
    pub fn sigchld(&mut self) {
        self.sched.sigchld();
    }

    /// When the loop has to call [`tick`](Self::tick) next.
    pub fn next_deadline(&self) -> Option<Instant> {
        let now = self.clock.now();
        if self.sched.has_ready() {
            return Some(now);
        }
        let mut deadline = [self.clock.next_deadline(), self.fwd.next_deadline()]
            .into_iter()
            .flatten()
            .min();
        if self.state == AmdState::Run {
            deadline = Some(deadline.map_or(self.next_reload, |d| d.min(self.next_reload)));
        }
        if self.state >= AmdState::Finishing {
            deadline = Some(deadline.map_or(now + FINISH_POLL, |d| d.min(now + FINISH_POLL)));
        }
        deadline
    }

    /// Node a mounted path belongs to, if any.
    pub fn node_by_path(&self, path: &str) -> Option<NodeId> {
        self.nodes.find_path(path)
    }
}

/// Failures worth retrying once the server may be back.
fn is_transient(e: Errno) -> bool {
    matches!(
        e,
        Errno::ETIMEDOUT
            | Errno::ECONNREFUSED
            | Errno::EHOSTDOWN
            | Errno::EHOSTUNREACH
            | Errno::ENETUNREACH
            | Errno::EIO
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fhandle::FhState, platform::Recorder, xdr::Encodable};
    use std::io::Write;

    fn config() -> Config {
        Config {
            autodir: "/a".to_owned(),
            hostname: "client".to_owned(),
            domain: String::new(),
            background_mounts: false,
            ..Config::default()
        }
    }

    fn daemon(map: &str) -> (Automounter, Rc<Recorder>) {
        let rec = Rc::new(Recorder::default());
        let mut am = Automounter::new(config(), MapTypes::default(), rec.clone(), Instant::now());
        am.set_nfs_addr("127.0.0.1:700".parse().unwrap());
        am.add_map("/mnt", map, "").unwrap();
        am.start();
        let now = am.clock.now();
        am.tick(now);
        (am, rec)
    }

    fn map_file(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    /// Answer the first queued call to `prog`, dropping everything else.
    fn answer(am: &mut Automounter, prog: u32, payload: &[u8]) {
        let out = am.fwd.take_outbox();
        let call = out
            .iter()
            .map(|(_, p)| read_msg(&mut Cursor::new(&p[..])).unwrap())
            .find(|m| matches!(m.body, Body::Call(ref c) if c.prog == prog))
            .unwrap();
        let mut reply = Vec::new();
        write_msg(&mut reply, &RpcMsg::reply(call.xid, AcceptBody::Success)).unwrap();
        reply.extend_from_slice(payload);
        am.fwd_reply(&reply);
    }

    /// Run the clock forward one second at a time, answering every ping.
    /// Returns the other calls sent meanwhile.
    fn run_for(am: &mut Automounter, secs: u64) -> Vec<CallBody> {
        let mut calls = Vec::new();
        for _ in 0..secs {
            let now = am.clock.now() + Duration::from_secs(1);
            am.tick(now);
            for (_, packet) in am.fwd.take_outbox() {
                let msg = read_msg(&mut Cursor::new(&packet[..])).unwrap();
                let Body::Call(call) = msg.body else {
                    panic!("not a call")
                };
                if call.prog != NFS_PROGRAM {
                    calls.push(call);
                    continue;
                }
                let mut reply = Vec::new();
                write_msg(&mut reply, &RpcMsg::reply(msg.xid, AcceptBody::Success)).unwrap();
                am.fwd_reply(&reply);
            }
        }
        calls
    }

    fn words(ws: &[u32]) -> Vec<u8> {
        let mut buf = Vec::new();
        for w in ws {
            w.encode(&mut buf).unwrap();
        }
        buf
    }

    fn tick(am: &mut Automounter) {
        let now = am.clock.now();
        am.tick(now);
    }

    #[test]
    fn toplvl_points_mount_at_start() {
        let map = map_file("x type:=link;fs:=/tmp\n");
        let (am, rec) = daemon(map.path().to_str().unwrap());
        let top = am.node_by_path("/mnt").unwrap();
        let node = am.nodes.get(top).unwrap();
        assert!(node.flags.contains(AmFlags::ROOT | AmFlags::NOTIMEOUT));
        assert!(node.map.is_some());
        assert_eq!(
            *rec.calls.borrow(),
            vec!["mkdir /mnt".to_owned(), "mount /mnt".to_owned()]
        );
    }

    #[test]
    fn links_resolve_without_mounting() {
        let map = map_file("x type:=link;fs:=/tmp;sublink:=sub\n");
        let (mut am, rec) = daemon(map.path().to_str().unwrap());
        let top = am.node_by_path("/mnt").unwrap();
        let Lookup::Found(x) = am.lookup(top, "x") else {
            panic!("link did not resolve")
        };
        assert_eq!(am.nodes.get(x).unwrap().link.as_deref(), Some("/tmp/sub"));
        assert_eq!(am.lookup(top, "x"), Lookup::Found(x));
        assert_eq!(am.lookup(top, "nope"), Lookup::Failed(Errno::ENOENT));
        assert_eq!(rec.calls.borrow().len(), 2);
    }

    #[test]
    fn failed_locations_fall_back_to_alternatives() {
        let map = map_file("x type:=error type:=link;fs:=/tmp\n");
        let (mut am, _) = daemon(map.path().to_str().unwrap());
        let top = am.node_by_path("/mnt").unwrap();
        let Lookup::Found(x) = am.lookup(top, "x") else {
            panic!("alternative not tried")
        };
        assert_eq!(am.nodes.get(x).unwrap().link.as_deref(), Some("/tmp"));
        assert_eq!(am.stats.merr, 1);
    }

    #[test]
    fn idle_nodes_are_timed_out() {
        let map = map_file("x type:=link;fs:=/tmp\n");
        let (mut am, _) = daemon(map.path().to_str().unwrap());
        let top = am.node_by_path("/mnt").unwrap();
        assert!(matches!(am.lookup(top, "x"), Lookup::Found(_)));
        let mfs = am.mntfs.len();

        let later = am.clock.now() + am.config.cache_duration + am.config.dismount_interval;
        am.tick(later);
        assert!(am.node_by_path("/mnt/x").is_none());
        assert_eq!(am.mntfs.len(), mfs - 1);
        assert!(am.node_by_path("/mnt").is_some());
    }

    #[test]
    fn transient_failures_are_retried_after_a_while() {
        let map = map_file("x type:=nfs;rhost:=127.0.0.1;rfs:=/export\n");
        let (mut am, _) = daemon(map.path().to_str().unwrap());
        let top = am.node_by_path("/mnt").unwrap();

        let Lookup::Wait(_) = am.lookup(top, "x") else {
            panic!("nfs mount should wait for the file handle")
        };
        let mut failed = false;
        for _ in 0..30 {
            run_for(&mut am, 1);
            if am.lookup(top, "x") == Lookup::Failed(Errno::ETIMEDOUT) {
                failed = true;
                break;
            }
        }
        assert!(failed, "port mapper call never timed out");

        let quiet = FH_TTL_ERROR.as_secs() - 2;
        assert!(run_for(&mut am, quiet).is_empty());
        assert_eq!(am.lookup(top, "x"), Lookup::Failed(Errno::ETIMEDOUT));

        assert!(run_for(&mut am, 3).is_empty());
        let Lookup::Wait(_) = am.lookup(top, "x") else {
            panic!("failure outlived its ttl")
        };
        let retried = am
            .fwd
            .take_outbox()
            .iter()
            .map(|(_, p)| read_msg(&mut Cursor::new(&p[..])).unwrap().body)
            .any(|b| matches!(b, Body::Call(ref c) if c.prog == PMAPPROG));
        assert!(retried);
    }

    #[test]
    fn unanswered_pings_flush_file_handles() {
        let map = map_file("x type:=nfs;rhost:=127.0.0.1;rfs:=/export\n");
        let (mut am, _) = daemon(map.path().to_str().unwrap());
        let top = am.node_by_path("/mnt").unwrap();

        am.lookup(top, "x");
        answer(&mut am, PMAPPROG, &words(&[635]));
        let mut mountres3 = words(&[0, 4]);
        mountres3.extend_from_slice(&[1, 2, 3, 4]);
        mountres3.extend(words(&[1, 1]));
        answer(&mut am, MOUNTPROG, &mountres3);
        tick(&mut am);
        tick(&mut am);
        let Lookup::Found(_) = am.lookup(top, "x") else {
            panic!("nfs mount did not complete")
        };

        let server = am
            .servers
            .iter()
            .find(|(_, fs)| fs.kind == ServerKind::Nfs)
            .map(|(id, _)| id)
            .unwrap();
        let e = am.fh.get(server, "/export").unwrap();
        assert!(matches!(e.state, FhState::Ready(_)));
        assert_eq!(e.mount_addr().port(), 635);

        for _ in 0..30 {
            let now = am.clock.now() + Duration::from_secs(1);
            am.tick(now);
            am.fwd.take_outbox();
            if am.servers.get(server).unwrap().is_down() {
                break;
            }
        }
        assert!(am.servers.get(server).unwrap().is_down());
        let e = am.fh.get(server, "/export").unwrap();
        assert_eq!(e.state, FhState::Stale);
        assert_eq!(e.mount_addr().port(), 0);
    }

    #[test]
    fn shutdown_drains_mounts_then_quits() {
        let map = map_file("x type:=nfs;rhost:=127.0.0.1;rfs:=/export\n");
        let (mut am, rec) = daemon(map.path().to_str().unwrap());
        let top = am.node_by_path("/mnt").unwrap();

        let Lookup::Wait(_) = am.lookup(top, "x") else {
            panic!("nfs mount should wait for the file handle")
        };
        answer(&mut am, PMAPPROG, &words(&[635]));
        let mut mountres3 = words(&[0, 4]);
        mountres3.extend_from_slice(&[1, 2, 3, 4]);
        mountres3.extend(words(&[1, 1]));
        answer(&mut am, MOUNTPROG, &mountres3);
        tick(&mut am);
        tick(&mut am);

        let Lookup::Found(x) = am.lookup(top, "x") else {
            panic!("nfs mount did not complete")
        };
        assert_eq!(
            am.nodes.get(x).unwrap().link.as_deref(),
            Some("/a/127.0.0.1/export")
        );
        assert_eq!(am.stats.mok, 2);

        am.shutdown();
        assert_eq!(am.state(), AmdState::Finishing);
        assert_eq!(am.lookup(top, "y"), Lookup::Failed(Errno::ENOENT));

        for _ in 0..10 {
            tick(&mut am);
            if am.state() == AmdState::Done {
                break;
            }
        }
        assert_eq!(am.state(), AmdState::Done);
        assert!(am.mntfs.is_empty());
        assert!(am.nodes.is_empty());
        assert_eq!(am.maps.live(), 0);

        let calls = rec.calls.borrow();
        let inner = calls
            .iter()
            .position(|c| c == "umount /a/127.0.0.1/export")
            .unwrap();
        let outer = calls.iter().position(|c| c == "umount /mnt").unwrap();
        assert!(inner < outer);
        assert!(calls.contains(&"mount /a/127.0.0.1/export".to_owned()));
    }
}
