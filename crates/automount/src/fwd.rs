//! RPC forwarding: outbound calls on the private UDP socket.
//!
//! Every call is tagged with a transaction id that embeds the caller's
//! request id and the kind of request, so a reply can be routed back
//! without any per-socket state. Calls are retransmitted until they are
//! answered or have been sent [`FWD_MAX_TRIES`] times.

use {
    log::{debug, trace},
    std::{
        collections::{BTreeMap, VecDeque},
        net::SocketAddr,
        time::{Duration, Instant},
    },
};

/// Interval between retransmissions of an unanswered call.
pub const FWD_RETRANS: Duration = Duration::from_secs(3);
/// Transmissions before a call is given up.
pub const FWD_MAX_TRIES: u32 = 3;

/// Kind of outstanding call, kept in the low bits of the xid.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FwdKind {
    Portmap = 1,
    Mountd = 2,
    NfsPing = 3,
}

const KIND_BITS: u32 = 4;
const KIND_MASK: u32 = (1 << KIND_BITS) - 1;

/// Request ids an xid can carry.
pub const ID_MASK: u32 = u32::MAX >> KIND_BITS;

/// Build the xid for request `id` of the given kind.
pub fn make_xid(kind: FwdKind, id: u32) -> u32 {
    ((id & ID_MASK) << KIND_BITS) | kind as u32
}

/// Split an xid into its kind and request id.
pub fn split_xid(xid: u32) -> Option<(FwdKind, u32)> {
    let kind = match xid & KIND_MASK {
        1 => FwdKind::Portmap,
        2 => FwdKind::Mountd,
        3 => FwdKind::NfsPing,
        _ => return None,
    };
    Some((kind, xid >> KIND_BITS))
}

#[derive(Debug)]
struct Outstanding {
    dest: SocketAddr,
    packet: Vec<u8>,
    tries: u32,
    deadline: Instant,
}

/// Table of outstanding forwarded calls plus the queue of datagrams that
/// still have to be written to the socket.
#[derive(Debug, Default)]
pub struct Forwarder {
    pending: BTreeMap<u32, Outstanding>,
    outbox: VecDeque<(SocketAddr, Vec<u8>)>,
}

impl Forwarder {
    pub fn new() -> Forwarder {
        Forwarder::default()
    }

    /// Queue `packet` for `dest`. A call already outstanding under the same
    /// xid is replaced.
    pub fn send(&mut self, xid: u32, dest: SocketAddr, packet: Vec<u8>, now: Instant) {
        trace!("fwd: xid {:#x} to {} ({} bytes)", xid, dest, packet.len());
        self.outbox.push_back((dest, packet.clone()));
        self.pending.insert(
            xid,
            Outstanding {
                dest,
                packet,
                tries: 1,
                deadline: now + FWD_RETRANS,
            },
        );
    }

    /// Queue a one-shot datagram that is neither tracked nor retransmitted.
    pub fn post(&mut self, dest: SocketAddr, packet: Vec<u8>) {
        self.outbox.push_back((dest, packet));
    }

    /// Datagrams waiting to be written, oldest first.
    pub fn take_outbox(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.outbox.drain(..).collect()
    }

    /// A reply arrived; returns false if no call is outstanding for `xid`.
    pub fn reply(&mut self, xid: u32) -> bool {
        self.pending.remove(&xid).is_some()
    }

    /// Retransmit overdue calls and return the xids of those given up.
    pub fn retransmit(&mut self, now: Instant) -> Vec<u32> {
        let mut expired = Vec::new();
        for (xid, call) in self.pending.iter_mut() {
            if call.deadline > now {
                continue;
            }
            if call.tries >= FWD_MAX_TRIES {
                expired.push(*xid);
            } else {
                call.tries += 1;
                call.deadline = now + FWD_RETRANS;
                self.outbox.push_back((call.dest, call.packet.clone()));
            }
        }
        for xid in &expired {
            debug!("fwd: xid {:#x} timed out", xid);
            self.pending.remove(xid);
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|c| c.deadline).min()
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xid_carries_kind_and_id() {
        let xid = make_xid(FwdKind::Mountd, 77);
        assert_eq!(split_xid(xid), Some((FwdKind::Mountd, 77)));
        assert_eq!(split_xid(0x50), None);

        let xid = make_xid(FwdKind::Portmap, ID_MASK);
        assert_eq!(split_xid(xid), Some((FwdKind::Portmap, ID_MASK)));
    }

    #[test]
    fn unanswered_calls_are_retried_then_dropped() {
        let t0 = Instant::now();
        let dest: SocketAddr = "127.0.0.1:635".parse().unwrap();
        let mut fwd = Forwarder::new();
        fwd.send(17, dest, vec![1, 2, 3], t0);
        assert_eq!(fwd.take_outbox().len(), 1);

        assert!(fwd.retransmit(t0 + Duration::from_secs(1)).is_empty());
        assert!(fwd.retransmit(t0 + FWD_RETRANS).is_empty());
        assert_eq!(fwd.take_outbox(), vec![(dest, vec![1, 2, 3])]);
        assert!(fwd.retransmit(t0 + FWD_RETRANS * 2).is_empty());
        assert_eq!(fwd.retransmit(t0 + FWD_RETRANS * 3), vec![17]);
        assert_eq!(fwd.outstanding(), 0);
        assert!(!fwd.reply(17));
    }

    #[test]
    fn reply_retires_call() {
        let t0 = Instant::now();
        let dest: SocketAddr = "127.0.0.1:111".parse().unwrap();
        let mut fwd = Forwarder::new();
        fwd.send(33, dest, vec![0], t0);
        assert!(fwd.reply(33));
        assert!(fwd.next_deadline().is_none());
        assert!(fwd.retransmit(t0 + FWD_RETRANS * 5).is_empty());
    }
}
