//! Serialize/deserialize XDR (RFC 4506) data into/from binary.
//!
//! Every item occupies a multiple of four bytes; integers are big-endian,
//! variable length data is prefixed by its length and padded with zeros.

use crate::rpc::*;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

/// Largest variable-length item accepted from the network.
pub const MAX_OPAQUE: usize = 8192;

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

fn read_padded<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    if size > MAX_OPAQUE {
        return res!(io_err!(InvalidData, "XDR item too long"));
    }
    let buf = read_exact(r, size)?;
    read_exact(r, padding(size))?;
    Ok(buf)
}

fn write_padded<W: WriteBytesExt + ?Sized>(w: &mut W, data: &[u8]) -> Result<usize> {
    w.write_all(data)?;
    let pad = padding(data.len());
    w.write_all(&[0u8; 3][..pad])?;
    Ok(data.len() + pad)
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable + ?Sized>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable + ?Sized, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable + ?Sized, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<W> SResult<Encoder<W>> {
    /// Finish a chain of `<<` and return the number of bytes written.
    pub fn done(self) -> Result<usize> {
        self.0.map(|enc| enc.bytes)
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<BigEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for i32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_i32::<BigEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<BigEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for i64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_i64::<BigEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for bool {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (*self as u32).encode(w)
    }
}

impl Encodable for str {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let bytes = (self.len() as u32).encode(w)?;
        Ok(bytes + write_padded(w, self.as_bytes())?)
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.as_str().encode(w)
    }
}

/// Fixed-length opaque data
impl<const N: usize> Encodable for [u8; N] {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        write_padded(w, &self[..])
    }
}

impl Encodable for Opaque {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let bytes = (self.0.len() as u32).encode(w)?;
        Ok(bytes + write_padded(w, &self.0)?)
    }
}

/// Optional-data: a boolean discriminant followed by the value if present.
impl<T: Encodable> Encodable for Option<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match *self {
            Some(ref v) => Ok(true.encode(w)? + v.encode(w)?),
            None => false.encode(w),
        }
    }
}

impl<T: Encodable> Encodable for Box<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (**self).encode(w)
    }
}

impl<T: Encodable + ?Sized> Encodable for &T {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (**self).encode(w)
    }
}

/// Structures are the concatenation of their members.
macro_rules! tuple_encodable {
    ($($name:ident)+) => {
        impl<$($name: Encodable),+> Encodable for ($($name,)+) {
            #[allow(non_snake_case)]
            fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
                let ($(ref $name,)+) = *self;
                Ok(0 $(+ $name.encode(w)?)+)
            }
        }
    };
}

tuple_encodable!(A B);
tuple_encodable!(A B C);
tuple_encodable!(A B C D);
tuple_encodable!(A B C D E);
tuple_encodable!(A B C D E F);

/// Variable-length array
impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.iter()
            .fold(Encoder::new(w) << &(self.len() as u32), |acc, s| acc << s)
            .done()
    }
}

impl Encodable for OpaqueAuth {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w) << &self.flavor << &self.body).done()
    }
}

impl Encodable for AuthUnix {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w) << &self.stamp << &self.machine << &self.uid << &self.gid << &self.gids)
            .done()
    }
}

impl Encodable for RpcMsg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let buf = Encoder::new(w) << &self.xid;

        let buf = match self.body {
            Body::Call(ref call) => {
                buf << &(MsgType::Call as u32)
                    << &call.rpcvers
                    << &call.prog
                    << &call.vers
                    << &call.proc_
                    << &call.cred
                    << &call.verf
            }
            Body::Reply(ReplyBody::Accepted { ref verf, ref stat }) => {
                let buf = buf
                    << &(MsgType::Reply as u32)
                    << &(ReplyStat::Accepted as u32)
                    << verf
                    << &(stat.stat() as u32);
                match *stat {
                    AcceptBody::ProgMismatch { ref low, ref high } => buf << low << high,
                    _ => buf,
                }
            }
            Body::Reply(ReplyBody::Denied(ref rejected)) => {
                let buf = buf << &(MsgType::Reply as u32) << &(ReplyStat::Denied as u32);
                match *rejected {
                    RejectBody::RpcMismatch { ref low, ref high } => {
                        buf << &(RejectStat::RpcMismatch as u32) << low << high
                    }
                    RejectBody::AuthError(ref why) => {
                        buf << &(RejectStat::AuthError as u32) << why
                    }
                }
            }
        };

        buf.done()
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<BigEndian>()
    }
}

impl Decodable for i32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_i32::<BigEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<BigEndian>()
    }
}

impl Decodable for i64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_i64::<BigEndian>()
    }
}

impl Decodable for bool {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        match u32::decode(r)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => res!(io_err!(InvalidData, "Invalid XDR boolean")),
        }
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        String::from_utf8(read_padded(r, len as usize)?)
            .map_err(|_| io_err!(InvalidData, "Invalid UTF-8 sequence"))
    }
}

impl<const N: usize> Decodable for [u8; N] {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let mut buf = [0u8; N];
        r.read_exact(&mut buf)?;
        read_exact(r, padding(N))?;
        Ok(buf)
    }
}

impl Decodable for Opaque {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Opaque(read_padded(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Option<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        if bool::decode(r)? {
            Ok(Some(Decodable::decode(r)?))
        } else {
            Ok(None)
        }
    }
}

impl<T: Decodable> Decodable for Box<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Box::new(T::decode(r)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        if len as usize > MAX_OPAQUE {
            return res!(io_err!(InvalidData, "XDR array too long"));
        }
        let mut buf = Vec::with_capacity(len as usize);
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

impl Decodable for OpaqueAuth {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(OpaqueAuth {
            flavor: Decodable::decode(r)?,
            body: Decodable::decode(r)?,
        })
    }
}

impl Decodable for RpcMsg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let mut buf = r;

        let xid = decode!(buf);
        let body = match MsgType::from_u32(decode!(buf)) {
            Some(MsgType::Call) => Body::Call(CallBody {
                rpcvers: decode!(buf),
                prog: decode!(buf),
                vers: decode!(buf),
                proc_: decode!(buf),
                cred: decode!(buf),
                verf: decode!(buf),
            }),
            Some(MsgType::Reply) => match ReplyStat::from_u32(decode!(buf)) {
                Some(ReplyStat::Accepted) => {
                    let verf = decode!(buf);
                    let stat = match AcceptStat::from_u32(decode!(buf)) {
                        Some(AcceptStat::Success) => AcceptBody::Success,
                        Some(AcceptStat::ProgUnavail) => AcceptBody::ProgUnavail,
                        Some(AcceptStat::ProgMismatch) => AcceptBody::ProgMismatch {
                            low: decode!(buf),
                            high: decode!(buf),
                        },
                        Some(AcceptStat::ProcUnavail) => AcceptBody::ProcUnavail,
                        Some(AcceptStat::GarbageArgs) => AcceptBody::GarbageArgs,
                        Some(AcceptStat::SystemErr) => AcceptBody::SystemErr,
                        None => return res!(io_err!(InvalidData, "Invalid accept status")),
                    };
                    Body::Reply(ReplyBody::Accepted { verf, stat })
                }
                Some(ReplyStat::Denied) => match RejectStat::from_u32(decode!(buf)) {
                    Some(RejectStat::RpcMismatch) => {
                        Body::Reply(ReplyBody::Denied(RejectBody::RpcMismatch {
                            low: decode!(buf),
                            high: decode!(buf),
                        }))
                    }
                    Some(RejectStat::AuthError) => {
                        Body::Reply(ReplyBody::Denied(RejectBody::AuthError(decode!(buf))))
                    }
                    None => return res!(io_err!(InvalidData, "Invalid reject status")),
                },
                None => return res!(io_err!(InvalidData, "Invalid reply status")),
            },
            None => return res!(io_err!(InvalidData, "Invalid message type")),
        };

        Ok(RpcMsg { xid, body })
    }
}

/// Helper function to read an RPC message header from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<RpcMsg> {
    Decodable::decode(r)
}

/// Helper function to write an RPC message header into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &RpcMsg) -> Result<usize> {
    msg.encode(w)
}

#[test]
fn encoder_pads_strings() {
    let mut buf = Vec::new();
    let n = "abcde".encode(&mut buf).unwrap();
    assert_eq!(n, 12);
    assert_eq!(buf, vec![0, 0, 0, 5, b'a', b'b', b'c', b'd', b'e', 0, 0, 0]);
}

#[test]
fn decoder_rejects_bad_boolean() {
    use std::io::Cursor;

    let mut r = Cursor::new(vec![0, 0, 0, 2]);
    assert!(bool::decode(&mut r).is_err());
}

#[test]
fn reply_header_encode_decode() {
    use std::io::Cursor;

    let expected = RpcMsg::reply(0x1234_5671, AcceptBody::ProgMismatch { low: 1, high: 1 });
    let mut buf = Vec::new();
    let _ = expected.encode(&mut buf);

    let actual = read_msg(&mut Cursor::new(buf)).unwrap();
    assert_eq!(expected, actual);
}
