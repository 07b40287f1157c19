//! NFS file-handle cache.
//!
//! Before an NFS filesystem can be mounted its root file handle has to be
//! fetched from the server's mount daemon. Handles are cached per
//! (fileserver, path); concurrent requests for the same pair share one
//! outstanding RPC. Mount protocol v3 is tried first and a server that
//! rejects it is asked again, once, with v1.
//!
//! Every request goes through the [`Forwarder`]; replies come back through
//! [`FhCache::on_reply`] keyed by the entry id carried in the xid.

use {
    crate::{
        automount::Callout,
        clock::{CalloutId, Clock},
        fserver::FserverId,
        fwd::{Forwarder, FwdKind, ID_MASK, make_xid},
        rpc::*,
        sched::Wchan,
        xdr::{Decodable, Encoder},
    },
    log::{debug, info, warn},
    nix::errno::Errno,
    std::{
        io::{self, Cursor},
        net::{IpAddr, SocketAddr},
        time::{Duration, Instant},
    },
};

/// Lifetime of a resolved handle after its last use.
pub const FH_TTL: Duration = Duration::from_secs(5 * 60);
/// Lifetime of a failure.
pub const FH_TTL_ERROR: Duration = Duration::from_secs(30);

/// Size of a v1/v2 file handle.
pub const FHSIZE: usize = 32;
/// Largest v3 file handle.
pub const FHSIZE3: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NfsFh {
    V2([u8; FHSIZE]),
    V3(Vec<u8>),
}

impl NfsFh {
    /// NFS protocol version the handle belongs to.
    pub fn version(&self) -> u32 {
        match *self {
            NfsFh::V2(_) => 2,
            NfsFh::V3(_) => 3,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match *self {
            NfsFh::V2(ref fh) => &fh[..],
            NfsFh::V3(ref fh) => &fh[..],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FhState {
    /// Never resolved, or flushed; the slot is re-used on the next lookup
    Stale,
    /// An RPC is in flight
    Pending,
    Ready(NfsFh),
    /// Returned as-is until the entry is evicted
    Failed(Errno),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FhLookup {
    Ready(NfsFh),
    Failed(Errno),
    /// The caller's wait channel is woken when the answer arrives
    WouldBlock,
}

#[derive(Debug)]
pub struct FhEntry {
    pub server: FserverId,
    pub path: String,
    /// Unique per request; changes every time the entry is re-resolved
    pub id: u32,
    pub state: FhState,
    waiters: Vec<Wchan>,
    /// Mount daemon address; port 0 until the port mapper has answered
    addr: SocketAddr,
    mount_vers: u32,
    cid: Option<CalloutId>,
}

impl FhEntry {
    pub fn mount_addr(&self) -> SocketAddr {
        self.addr
    }
}

enum Step {
    /// Issue the next call of the chain
    Resend,
    Done(Result<NfsFh, Errno>),
}

#[derive(Debug)]
pub struct FhCache {
    entries: Vec<FhEntry>,
    next_id: u32,
    /// Host name sent in AUTH_UNIX credentials
    machine: String,
}

fn encode_call<F>(msg: RpcMsg, args: F) -> io::Result<Vec<u8>>
where
    F: FnOnce(Encoder<&mut Vec<u8>>) -> io::Result<usize>,
{
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.encode(&msg)?;
    args(enc)?;
    Ok(buf)
}

impl FhCache {
    pub fn new(machine: &str) -> FhCache {
        FhCache {
            entries: Vec::new(),
            next_id: 0,
            machine: machine.to_owned(),
        }
    }

    /// Look up the handle for `path` on `server`.
    ///
    /// When the handle is not known yet a request is started (or joined)
    /// and `wchan` will be returned by the call that completes it.
    #[allow(clippy::too_many_arguments)]
    pub fn resolve(
        &mut self,
        path: &str,
        server: FserverId,
        ip: IpAddr,
        force_v2: bool,
        wchan: Wchan,
        fwd: &mut Forwarder,
        clock: &mut Clock<Callout>,
    ) -> FhLookup {
        let idx = match self
            .entries
            .iter()
            .position(|e| e.server == server && e.path == path)
        {
            Some(i) => {
                let e = &mut self.entries[i];
                match e.state {
                    FhState::Ready(ref fh) => {
                        let fh = fh.clone();
                        if let Some(cid) = e.cid.take() {
                            clock.untimeout(cid);
                        }
                        e.cid = Some(clock.timeout(FH_TTL, Callout::FhEvict(e.id)));
                        return FhLookup::Ready(fh);
                    }
                    FhState::Failed(err) => return FhLookup::Failed(err),
                    FhState::Pending => {
                        debug!("fh for {} already requested; waiting", path);
                        if !e.waiters.contains(&wchan) {
                            e.waiters.push(wchan);
                        }
                        return FhLookup::WouldBlock;
                    }
                    FhState::Stale => i,
                }
            }
            None => {
                self.entries.push(FhEntry {
                    server,
                    path: path.to_owned(),
                    id: 0,
                    state: FhState::Stale,
                    waiters: Vec::new(),
                    addr: SocketAddr::new(ip, 0),
                    mount_vers: MOUNTVERS3,
                    cid: None,
                });
                self.entries.len() - 1
            }
        };

        self.next_id = self.next_id.wrapping_add(1) & ID_MASK;
        if self.next_id == 0 {
            self.next_id = 1;
        }
        let e = &mut self.entries[idx];
        e.id = self.next_id;
        e.state = FhState::Pending;
        e.waiters = vec![wchan];
        e.mount_vers = if force_v2 { MOUNTVERS } else { MOUNTVERS3 };
        if e.addr.ip() != ip {
            e.addr = SocketAddr::new(ip, 0);
        }
        if let Some(cid) = e.cid.take() {
            clock.untimeout(cid);
        }
        debug!("fh: requesting {} (request {})", path, e.id);
        self.send(idx, fwd, clock.now());
        FhLookup::WouldBlock
    }

    fn send(&mut self, idx: usize, fwd: &mut Forwarder, now: Instant) {
        let e = &self.entries[idx];
        let vers = e.mount_vers;
        let (xid, dest, packet) = if e.addr.port() == 0 {
            let xid = make_xid(FwdKind::Portmap, e.id);
            let msg = RpcMsg::call(xid, PMAPPROG, PMAPVERS, PMAPPROC_GETPORT, OpaqueAuth::none());
            let packet = encode_call(msg, |enc| {
                (enc << &MOUNTPROG << &vers << &IPPROTO_UDP << &0u32).done()
            });
            (xid, SocketAddr::new(e.addr.ip(), PMAP_PORT), packet)
        } else {
            let xid = make_xid(FwdKind::Mountd, e.id);
            let msg = RpcMsg::call(xid, MOUNTPROG, vers, MOUNTPROC_MNT, OpaqueAuth::unix(&self.machine));
            let packet = encode_call(msg, |enc| (enc << e.path.as_str()).done());
            (xid, e.addr, packet)
        };
        match packet {
            Ok(packet) => fwd.send(xid, dest, packet, now),
            Err(err) => warn!("fh: cannot encode request for {}: {}", e.path, err),
        }
    }

    fn downgrade(&mut self, idx: usize) {
        let e = &mut self.entries[idx];
        info!("{}: mount v3 not available; retrying with v1", e.path);
        e.mount_vers = MOUNTVERS;
        // v1 may be registered on another port
        e.addr.set_port(0);
    }

    fn portmap_reply(&mut self, idx: usize, msg: &RpcMsg, body: &mut Cursor<&[u8]>) -> Step {
        if !msg.is_success() {
            warn!("port mapper on {} refused request", self.entries[idx].addr.ip());
            return Step::Done(Err(Errno::ECONNREFUSED));
        }
        let port = match u32::decode(body) {
            Ok(port) => port,
            Err(_) => return Step::Done(Err(Errno::EIO)),
        };
        let e = &mut self.entries[idx];
        if port == 0 || port > u16::MAX as u32 {
            if e.mount_vers == MOUNTVERS3 {
                self.downgrade(idx);
                return Step::Resend;
            }
            warn!("no mount daemon registered on {}", e.addr.ip());
            return Step::Done(Err(Errno::ECONNREFUSED));
        }
        e.addr.set_port(port as u16);
        Step::Resend
    }

    fn mountd_reply(&mut self, idx: usize, msg: &RpcMsg, body: &mut Cursor<&[u8]>) -> Step {
        let v3 = self.entries[idx].mount_vers == MOUNTVERS3;
        match msg.body {
            Body::Reply(ReplyBody::Accepted {
                stat: AcceptBody::Success,
                ..
            }) => {}
            Body::Reply(ReplyBody::Accepted {
                stat: AcceptBody::ProgMismatch { .. },
                ..
            }) if v3 => {
                self.downgrade(idx);
                return Step::Resend;
            }
            ref other => {
                let e = &mut self.entries[idx];
                warn!("mount daemon on {} failed request for {}: {:?}", e.addr, e.path, other);
                e.addr.set_port(0);
                return Step::Done(Err(Errno::EIO));
            }
        }

        let res = if v3 {
            decode_mountres3(body)
        } else {
            decode_fhstatus(body)
        };
        match res {
            Ok(Ok(fh)) => Step::Done(Ok(fh)),
            Ok(Err(status)) => Step::Done(Err(Errno::from_raw(status as i32))),
            Err(_) if v3 => {
                self.downgrade(idx);
                Step::Resend
            }
            Err(err) => {
                warn!("undecodable mount reply for {}: {}", self.entries[idx].path, err);
                Step::Done(Err(Errno::EIO))
            }
        }
    }

    fn complete(
        &mut self,
        idx: usize,
        res: Result<NfsFh, Errno>,
        clock: &mut Clock<Callout>,
    ) -> Vec<Wchan> {
        let e = &mut self.entries[idx];
        let ttl = match res {
            Ok(fh) => {
                debug!("fh for {} resolved (v{})", e.path, fh.version());
                e.state = FhState::Ready(fh);
                FH_TTL
            }
            Err(err) => {
                info!("mount daemon: {}: {}", e.path, err);
                e.state = FhState::Failed(err);
                FH_TTL_ERROR
            }
        };
        e.cid = Some(clock.timeout(ttl, Callout::FhEvict(e.id)));
        std::mem::take(&mut e.waiters)
    }

    fn pending(&self, id: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.id == id && e.state == FhState::Pending)
    }

    /// A forwarded reply for request `id` arrived; `body` is positioned
    /// after the RPC header. Returns the channels to wake.
    pub fn on_reply(
        &mut self,
        kind: FwdKind,
        id: u32,
        msg: &RpcMsg,
        body: &mut Cursor<&[u8]>,
        fwd: &mut Forwarder,
        clock: &mut Clock<Callout>,
    ) -> Vec<Wchan> {
        let Some(idx) = self.pending(id) else {
            debug!("fh: reply for unknown request {}", id);
            return Vec::new();
        };
        let step = match kind {
            FwdKind::Portmap => self.portmap_reply(idx, msg, body),
            FwdKind::Mountd => self.mountd_reply(idx, msg, body),
            FwdKind::NfsPing => return Vec::new(),
        };
        match step {
            Step::Resend => {
                self.send(idx, fwd, clock.now());
                Vec::new()
            }
            Step::Done(res) => self.complete(idx, res, clock),
        }
    }

    /// The forwarder gave up on request `id`.
    pub fn on_timeout(&mut self, id: u32, clock: &mut Clock<Callout>) -> Vec<Wchan> {
        let Some(idx) = self.pending(id) else {
            return Vec::new();
        };
        self.entries[idx].addr.set_port(0);
        self.complete(idx, Err(Errno::ETIMEDOUT), clock)
    }

    /// TTL expiry of the entry resolved as request `id`.
    pub fn evict(&mut self, id: u32) {
        if let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.id == id && e.state != FhState::Pending)
        {
            let e = self.entries.swap_remove(idx);
            debug!("fh: discarding entry for {}", e.path);
        }
    }

    /// Invalidate every entry of `server`, or all entries. Slots are kept
    /// so the next lookup starts from scratch; waiters of in-flight
    /// requests are returned so they can retry.
    pub fn flush(&mut self, server: Option<FserverId>, clock: &mut Clock<Callout>) -> Vec<Wchan> {
        let mut woken = Vec::new();
        for e in self
            .entries
            .iter_mut()
            .filter(|e| server.is_none_or(|s| s == e.server))
        {
            debug!("flushed fh for {}", e.path);
            if let Some(cid) = e.cid.take() {
                clock.untimeout(cid);
            }
            e.state = FhState::Stale;
            e.addr.set_port(0);
            woken.append(&mut e.waiters);
        }
        woken
    }

    /// Drop every entry of a discarded server.
    pub fn purge(&mut self, server: FserverId, clock: &mut Clock<Callout>) {
        self.entries.retain(|e| {
            if e.server != server {
                return true;
            }
            if let Some(cid) = e.cid {
                clock.untimeout(cid);
            }
            false
        });
    }

    pub fn get(&self, server: FserverId, path: &str) -> Option<&FhEntry> {
        self.entries
            .iter()
            .find(|e| e.server == server && e.path == path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// MOUNTPROC_MNT v1 result: status, then a 32-byte handle on success.
fn decode_fhstatus(body: &mut Cursor<&[u8]>) -> io::Result<Result<NfsFh, u32>> {
    let status = u32::decode(body)?;
    if status != 0 {
        return Ok(Err(status));
    }
    Ok(Ok(NfsFh::V2(Decodable::decode(body)?)))
}

/// MOUNTPROC3_MNT result: status, then an opaque handle and the accepted
/// auth flavors on success.
fn decode_mountres3(body: &mut Cursor<&[u8]>) -> io::Result<Result<NfsFh, u32>> {
    let status = u32::decode(body)?;
    if status != 0 {
        return Ok(Err(status));
    }
    let fh = Opaque::decode(body)?;
    if fh.0.len() > FHSIZE3 {
        return Err(crate::io_err!(InvalidData, "v3 file handle too long"));
    }
    let _flavors: Vec<u32> = Decodable::decode(body)?;
    Ok(Ok(NfsFh::V3(fh.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fserver::FserverRegistry,
        fwd::split_xid,
        node::NodeId,
        xdr::{Encodable, read_msg, write_msg},
    };

    struct Harness {
        fh: FhCache,
        fwd: Forwarder,
        clock: Clock<Callout>,
        server: FserverId,
        ip: IpAddr,
    }

    impl Harness {
        fn new() -> Harness {
            let mut servers = FserverRegistry::new(Duration::from_secs(30));
            Harness {
                fh: FhCache::new("client"),
                fwd: Forwarder::new(),
                clock: Clock::new(Instant::now()),
                server: servers.find_nfs("127.0.0.1").0,
                ip: "127.0.0.1".parse().unwrap(),
            }
        }

        fn resolve(&mut self, path: &str, w: u32) -> FhLookup {
            self.fh.resolve(
                path,
                self.server,
                self.ip,
                false,
                Wchan::Node(NodeId(w)),
                &mut self.fwd,
                &mut self.clock,
            )
        }

        /// Answer the single queued call and return it with the channels
        /// the reply woke.
        fn answer(&mut self, stat: AcceptBody, payload: &[u8]) -> (SocketAddr, CallBody, Vec<Wchan>) {
            let mut out = self.fwd.take_outbox();
            assert_eq!(out.len(), 1);
            let (dest, packet) = out.remove(0);
            let call = read_msg(&mut Cursor::new(&packet[..])).unwrap();
            let Body::Call(body) = call.body else {
                panic!("not a call")
            };
            assert!(self.fwd.reply(call.xid));

            let mut reply = Vec::new();
            write_msg(&mut reply, &RpcMsg::reply(call.xid, stat)).unwrap();
            reply.extend_from_slice(payload);
            let mut cur = Cursor::new(&reply[..]);
            let msg = read_msg(&mut cur).unwrap();
            let (kind, id) = split_xid(call.xid).unwrap();
            let woken = self
                .fh
                .on_reply(kind, id, &msg, &mut cur, &mut self.fwd, &mut self.clock);
            (dest, body, woken)
        }
    }

    fn words(ws: &[u32]) -> Vec<u8> {
        let mut buf = Vec::new();
        for w in ws {
            w.encode(&mut buf).unwrap();
        }
        buf
    }

    fn fhstatus(fh: [u8; FHSIZE]) -> Vec<u8> {
        let mut buf = words(&[0]);
        buf.extend_from_slice(&fh);
        buf
    }

    #[test]
    fn v3_rejection_falls_back_to_v1_once() {
        let mut h = Harness::new();
        assert_eq!(h.resolve("/export/x", 1), FhLookup::WouldBlock);

        let (dest, call, woken) = h.answer(AcceptBody::Success, &words(&[635]));
        assert_eq!((dest.port(), call.prog, call.vers), (PMAP_PORT, PMAPPROG, PMAPVERS));
        assert!(woken.is_empty());

        let (dest, call, _) = h.answer(AcceptBody::ProgMismatch { low: 1, high: 1 }, &[]);
        assert_eq!((dest.port(), call.prog, call.vers), (635, MOUNTPROG, MOUNTVERS3));
        assert_eq!(call.cred.flavor, AuthFlavor::Unix as u32);

        let (_, call, _) = h.answer(AcceptBody::Success, &words(&[636]));
        assert_eq!((call.prog, call.vers), (PMAPPROG, PMAPVERS));

        let (dest, call, woken) = h.answer(AcceptBody::Success, &fhstatus([7; FHSIZE]));
        assert_eq!((dest.port(), call.prog, call.vers), (636, MOUNTPROG, MOUNTVERS));
        assert_eq!(woken, vec![Wchan::Node(NodeId(1))]);

        assert!(h.fwd.take_outbox().is_empty());
        assert_eq!(h.resolve("/export/x", 1), FhLookup::Ready(NfsFh::V2([7; FHSIZE])));
    }

    #[test]
    fn concurrent_lookups_share_one_request() {
        let mut h = Harness::new();
        assert_eq!(h.resolve("/export/x", 1), FhLookup::WouldBlock);
        assert_eq!(h.resolve("/export/x", 2), FhLookup::WouldBlock);
        assert_eq!(h.fwd.outstanding(), 1);

        h.answer(AcceptBody::Success, &words(&[635]));
        let mut v3 = words(&[0, 4, 0xdead_beef]);
        v3.extend(words(&[1, 1]));
        let (_, call, woken) = h.answer(AcceptBody::Success, &v3);
        assert_eq!(call.vers, MOUNTVERS3);
        assert_eq!(woken, vec![Wchan::Node(NodeId(1)), Wchan::Node(NodeId(2))]);
        assert_eq!(
            h.resolve("/export/x", 3),
            FhLookup::Ready(NfsFh::V3(vec![0xde, 0xad, 0xbe, 0xef]))
        );
    }

    #[test]
    fn failures_stick_until_evicted() {
        let mut h = Harness::new();
        h.resolve("/export/y", 1);
        h.answer(AcceptBody::Success, &words(&[635]));
        let (_, _, woken) = h.answer(AcceptBody::Success, &words(&[13]));
        assert_eq!(woken.len(), 1);

        assert_eq!(h.resolve("/export/y", 1), FhLookup::Failed(Errno::EACCES));
        assert!(h.fwd.take_outbox().is_empty());

        h.clock.advance(FH_TTL_ERROR);
        for (_, what) in h.clock.softclock() {
            let Callout::FhEvict(id) = what else {
                panic!("unexpected callout {:?}", what)
            };
            h.fh.evict(id);
        }
        assert!(h.fh.is_empty());
        assert_eq!(h.resolve("/export/y", 1), FhLookup::WouldBlock);
        assert_eq!(h.fwd.take_outbox().len(), 1);
    }

    #[test]
    fn timeout_is_a_short_lived_failure() {
        let mut h = Harness::new();
        h.resolve("/export/z", 1);
        let id = h.fh.get(h.server, "/export/z").unwrap().id;
        let woken = h.fh.on_timeout(id, &mut h.clock);
        assert_eq!(woken, vec![Wchan::Node(NodeId(1))]);
        assert_eq!(h.resolve("/export/z", 1), FhLookup::Failed(Errno::ETIMEDOUT));
        assert_eq!(h.clock.next_deadline(), Some(h.clock.now() + FH_TTL_ERROR));
    }

    #[test]
    fn request_ids_wrap_past_zero() {
        let mut h = Harness::new();
        h.fh.next_id = ID_MASK - 1;
        h.resolve("/export/a", 1);
        h.resolve("/export/b", 2);
        h.resolve("/export/c", 3);
        let ids: Vec<u32> = ["/export/a", "/export/b", "/export/c"]
            .iter()
            .map(|p| h.fh.get(h.server, p).unwrap().id)
            .collect();
        assert_eq!(ids, vec![ID_MASK, 1, 2]);

        let xids: Vec<u32> = h
            .fwd
            .take_outbox()
            .iter()
            .map(|(_, p)| read_msg(&mut Cursor::new(&p[..])).unwrap().xid)
            .collect();
        assert_eq!(xids.len(), 3);
        assert_eq!(split_xid(xids[0]), Some((FwdKind::Portmap, ID_MASK)));
        assert_eq!(split_xid(xids[1]), Some((FwdKind::Portmap, 1)));
    }

    #[test]
    fn flush_forces_a_fresh_lookup() {
        let mut h = Harness::new();
        h.resolve("/export/x", 1);
        h.answer(AcceptBody::Success, &words(&[635]));
        h.answer(AcceptBody::ProgMismatch { low: 1, high: 1 }, &[]);
        h.answer(AcceptBody::Success, &words(&[636]));
        h.answer(AcceptBody::Success, &fhstatus([1; FHSIZE]));
        let old = h.fh.get(h.server, "/export/x").unwrap().id;

        assert!(h.fh.flush(Some(h.server), &mut h.clock).is_empty());
        assert_eq!(h.clock.pending(), 0);
        assert_eq!(h.fh.len(), 1);

        assert_eq!(h.resolve("/export/x", 1), FhLookup::WouldBlock);
        assert_ne!(h.fh.get(h.server, "/export/x").unwrap().id, old);
        let (dest, call, _) = h.answer(AcceptBody::Success, &words(&[635]));
        assert_eq!((dest.port(), call.prog), (PMAP_PORT, PMAPPROG));
    }

    #[test]
    fn flush_wakes_pending_waiters() {
        let mut h = Harness::new();
        h.resolve("/export/x", 4);
        assert_eq!(h.fh.flush(None, &mut h.clock), vec![Wchan::Node(NodeId(4))]);
        // The late reply no longer matches a pending request
        let (_, _, woken) = h.answer(AcceptBody::Success, &words(&[635]));
        assert!(woken.is_empty());
        assert!(h.fwd.take_outbox().is_empty());
    }
}
