//! Server side of ONC RPC.
//!
//! [`serve`] decodes a call, hands its procedure arguments to a handler and
//! wraps the handler's results in a reply. Handlers decode their arguments
//! with `?`; a decoding failure becomes a `GARBAGE_ARGS` reply.

use {
    crate::{
        rpc::*,
        xdr::{Encodable, read_msg, write_msg},
    },
    log::debug,
    std::io::{self, Cursor},
};

/// Why a call produced no results.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Refusal {
    /// Reply with this accept status and no results
    Fail(AcceptBody),
    /// Send nothing; the client retransmits
    Drop,
}

impl From<io::Error> for Refusal {
    fn from(_: io::Error) -> Refusal {
        Refusal::Fail(AcceptBody::GarbageArgs)
    }
}

/// Encoded procedure results.
pub type Reply = Result<Vec<u8>, Refusal>;

/// Encode `res` as the results of a call.
pub fn results<T: Encodable + ?Sized>(res: &T) -> Reply {
    let mut out = Vec::new();
    res.encode(&mut out)
        .map_err(|_| Refusal::Fail(AcceptBody::SystemErr))?;
    Ok(out)
}

/// Results of a procedure returning nothing.
pub fn void() -> Reply {
    Ok(Vec::new())
}

/// Refuse calls for versions outside `low..=high`.
pub fn check_version(call: &CallBody, low: u32, high: u32) -> Result<(), Refusal> {
    if call.vers < low || call.vers > high {
        return Err(Refusal::Fail(AcceptBody::ProgMismatch { low, high }));
    }
    Ok(())
}

/// Answer one RPC call packet. `None` when nothing should be sent back.
pub fn serve<F>(packet: &[u8], handler: F) -> Option<Vec<u8>>
where
    F: FnOnce(&CallBody, &mut Cursor<&[u8]>) -> Reply,
{
    let mut args = Cursor::new(packet);
    let msg = match read_msg(&mut args) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("svc: undecodable call: {}", e);
            return None;
        }
    };
    let Body::Call(ref call) = msg.body else {
        debug!("svc: unexpected reply {:#x}", msg.xid);
        return None;
    };

    let mut out = Vec::new();
    if call.rpcvers != RPC_VERS {
        let denied = RpcMsg {
            xid: msg.xid,
            body: Body::Reply(ReplyBody::Denied(RejectBody::RpcMismatch {
                low: RPC_VERS,
                high: RPC_VERS,
            })),
        };
        write_msg(&mut out, &denied).ok()?;
        return Some(out);
    }

    let (stat, results) = match handler(call, &mut args) {
        Ok(results) => (AcceptBody::Success, results),
        Err(Refusal::Fail(stat)) => {
            debug!(
                "svc: prog {} vers {} proc {}: {:?}",
                call.prog, call.vers, call.proc_, stat
            );
            (stat, Vec::new())
        }
        Err(Refusal::Drop) => return None,
    };
    write_msg(&mut out, &RpcMsg::reply(msg.xid, stat)).ok()?;
    out.extend_from_slice(&results);
    Some(out)
}
