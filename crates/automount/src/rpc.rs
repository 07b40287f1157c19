//! ONC RPC data types, program numbers and framing.
//!
//! # Protocol
//! RPC version 2 (RFC 5531). Only the message header is modelled here;
//! procedure arguments and results follow the header in the same buffer
//! and are handled by the module owning the program.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use enum_primitive::*;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// RPC protocol version
pub const RPC_VERS: u32 = 2;

/*
 * Program numbers
 */
/// Port mapper
pub const PMAPPROG: u32 = 100000;
pub const PMAPVERS: u32 = 2;
pub const PMAPPROC_GETPORT: u32 = 3;
pub const PMAP_PORT: u16 = 111;

/// NFS, as served by amd itself and pinged on remote servers
pub const NFS_PROGRAM: u32 = 100003;
pub const NFS_VERSION: u32 = 2;
pub const NFSPROC_NULL: u32 = 0;
pub const NFS_PORT: u16 = 2049;

/// Remote mount daemon
pub const MOUNTPROG: u32 = 100005;
pub const MOUNTVERS: u32 = 1;
pub const MOUNTVERS3: u32 = 3;
pub const MOUNTPROC_MNT: u32 = 1;

/// amq query program
pub const AMQ_PROGRAM: u32 = 300019;
pub const AMQ_VERSION: u32 = 1;

pub const IPPROTO_UDP: u32 = 17;

/// Largest UDP datagram the daemon reads or writes
pub const UDPMSGSIZE: usize = 8800;

enum_from_primitive! {
    #[doc = "Message direction"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum MsgType {
        Call    = 0,
        Reply   = 1,
    }
}

enum_from_primitive! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum ReplyStat {
        Accepted    = 0,
        Denied      = 1,
    }
}

enum_from_primitive! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum AcceptStat {
        Success         = 0,
        ProgUnavail     = 1,
        ProgMismatch    = 2,
        ProcUnavail     = 3,
        GarbageArgs     = 4,
        SystemErr       = 5,
    }
}

enum_from_primitive! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum RejectStat {
        RpcMismatch = 0,
        AuthError   = 1,
    }
}

enum_from_primitive! {
    #[doc = "Authentication flavors"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum AuthFlavor {
        None    = 0,
        Unix    = 1,
        Short   = 2,
    }
}

/// Variable-length opaque data
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Opaque(pub Vec<u8>);

/// Credential or verifier
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpaqueAuth {
    pub flavor: u32,
    pub body: Opaque,
}

/// AUTH_UNIX credential body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthUnix {
    pub stamp: u32,
    pub machine: String,
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
}

impl OpaqueAuth {
    pub fn none() -> OpaqueAuth {
        OpaqueAuth::default()
    }

    /// Root AUTH_UNIX credential, as mount daemons expect from a client.
    pub fn unix(machine: &str) -> OpaqueAuth {
        let cred = AuthUnix {
            stamp: 0,
            machine: machine.to_owned(),
            uid: 0,
            gid: 0,
            gids: vec![0],
        };
        let mut body = Vec::new();
        // Encoding into a Vec cannot fail
        let _ = crate::xdr::Encodable::encode(&cred, &mut body);
        OpaqueAuth {
            flavor: AuthFlavor::Unix as u32,
            body: Opaque(body),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallBody {
    pub rpcvers: u32,
    pub prog: u32,
    pub vers: u32,
    pub proc_: u32,
    pub cred: OpaqueAuth,
    pub verf: OpaqueAuth,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcceptBody {
    Success,
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
}

impl AcceptBody {
    pub fn stat(&self) -> AcceptStat {
        match *self {
            AcceptBody::Success => AcceptStat::Success,
            AcceptBody::ProgUnavail => AcceptStat::ProgUnavail,
            AcceptBody::ProgMismatch { .. } => AcceptStat::ProgMismatch,
            AcceptBody::ProcUnavail => AcceptStat::ProcUnavail,
            AcceptBody::GarbageArgs => AcceptStat::GarbageArgs,
            AcceptBody::SystemErr => AcceptStat::SystemErr,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectBody {
    RpcMismatch { low: u32, high: u32 },
    AuthError(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyBody {
    Accepted { verf: OpaqueAuth, stat: AcceptBody },
    Denied(RejectBody),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
    Call(CallBody),
    Reply(ReplyBody),
}

/// Envelope for RPC messages
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcMsg {
    /// Chosen by the caller; the reply carries the same xid
    pub xid: u32,
    pub body: Body,
}

impl RpcMsg {
    pub fn call(xid: u32, prog: u32, vers: u32, proc_: u32, cred: OpaqueAuth) -> RpcMsg {
        RpcMsg {
            xid,
            body: Body::Call(CallBody {
                rpcvers: RPC_VERS,
                prog,
                vers,
                proc_,
                cred,
                verf: OpaqueAuth::none(),
            }),
        }
    }

    pub fn reply(xid: u32, stat: AcceptBody) -> RpcMsg {
        RpcMsg {
            xid,
            body: Body::Reply(ReplyBody::Accepted {
                verf: OpaqueAuth::none(),
                stat,
            }),
        }
    }

    /// If the message is an accepted, successful reply
    pub fn is_success(&self) -> bool {
        matches!(
            self.body,
            Body::Reply(ReplyBody::Accepted {
                stat: AcceptBody::Success,
                ..
            })
        )
    }
}

/// Record marking for RPC over stream transports.
///
/// Each record is a sequence of fragments; a fragment header is a 32-bit
/// big-endian word whose top bit marks the last fragment of the record.
#[derive(Debug, Default)]
pub struct RecordCodec {
    record: BytesMut,
}

const LAST_FRAG: u32 = 0x8000_0000;

impl Decoder for RecordCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, io::Error> {
        loop {
            if src.len() < 4 {
                return Ok(None);
            }
            let header = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
            let len = (header & !LAST_FRAG) as usize;
            if self.record.len() + len > crate::xdr::MAX_OPAQUE * 8 {
                return Err(crate::io_err!(InvalidData, "RPC record too long"));
            }
            if src.len() < 4 + len {
                src.reserve(4 + len - src.len());
                return Ok(None);
            }
            src.advance(4);
            self.record.extend_from_slice(&src.split_to(len));
            if header & LAST_FRAG != 0 {
                return Ok(Some(std::mem::take(&mut self.record)));
            }
        }
    }
}

impl Encoder<Bytes> for RecordCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.reserve(4 + item.len());
        dst.put_u32(LAST_FRAG | item.len() as u32);
        dst.put(item);
        Ok(())
    }
}
