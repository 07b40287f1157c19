//! The daemon's event loop.
//!
//! A single task owns the [`Automounter`] and multiplexes signals, the
//! forwarding socket, the NFS socket and the amq sockets. TCP amq
//! connections run as their own tasks and hand each record to the loop
//! over a channel, so the automounter itself is never shared.

use {
    crate::{
        amq,
        automount::{AmdState, Automounter},
        config::Config,
        nfs_srv,
        rpc::{RecordCodec, UDPMSGSIZE},
        utils::Result,
    },
    bytes::Bytes,
    futures::sink::SinkExt,
    log::{debug, error, info, warn},
    std::{
        net::{Ipv4Addr, SocketAddr},
        time::{Duration, Instant},
    },
    tokio::{
        net::{TcpListener, TcpStream, UdpSocket},
        signal::unix::{SignalKind, signal},
        sync::{mpsc, oneshot},
        time,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite},
};

/// Longest sleep when nothing is scheduled.
const IDLE: Duration = Duration::from_secs(60);

/// An amq record from a TCP connection and where to send the reply.
type AmqRequest = (Vec<u8>, oneshot::Sender<Option<Vec<u8>>>);

pub struct Server {
    fwd: UdpSocket,
    nfs: UdpSocket,
    amq: UdpSocket,
    amq_tcp: TcpListener,
}

impl Server {
    /// Bind every socket. amq listens on the same port over UDP and TCP.
    pub async fn bind(config: &Config) -> Result<Server> {
        let fwd = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let nfs = UdpSocket::bind((Ipv4Addr::LOCALHOST, config.nfs_port)).await?;
        let amq = UdpSocket::bind((Ipv4Addr::LOCALHOST, config.amq_port)).await?;
        let amq_tcp = TcpListener::bind(amq.local_addr()?).await?;
        info!(
            "nfs service on {}, amq service on {}",
            nfs.local_addr()?,
            amq.local_addr()?
        );
        Ok(Server {
            fwd,
            nfs,
            amq,
            amq_tcp,
        })
    }

    pub fn nfs_addr(&self) -> Result<SocketAddr> {
        Ok(self.nfs.local_addr()?)
    }

    pub fn amq_addr(&self) -> Result<SocketAddr> {
        Ok(self.amq.local_addr()?)
    }

    /// Start the automounter and serve until it is done.
    pub async fn run(self, am: &mut Automounter) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigchld = signal(SignalKind::child())?;

        let (tx, mut rx) = mpsc::channel::<AmqRequest>(16);
        let mut fwd_buf = vec![0u8; UDPMSGSIZE];
        let mut nfs_buf = vec![0u8; UDPMSGSIZE];
        let mut amq_buf = vec![0u8; UDPMSGSIZE];

        am.set_nfs_addr(self.nfs.local_addr()?);
        am.start();

        loop {
            am.tick(Instant::now());
            for (dest, packet) in am.fwd.take_outbox() {
                if let Err(e) = self.fwd.send_to(&packet, dest).await {
                    warn!("fwd: cannot send to {}: {}", dest, e);
                }
            }
            if am.state() == AmdState::Done {
                break;
            }

            let deadline = am
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE);

            tokio::select! {
                biased;
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    am.shutdown();
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    am.shutdown();
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading maps");
                    am.reload();
                }
                _ = sigchld.recv() => am.sigchld(),
                res = self.fwd.recv_from(&mut fwd_buf) => match res {
                    Ok((n, _)) => am.fwd_reply(&fwd_buf[..n]),
                    Err(e) => warn!("fwd: receive failed: {}", e),
                },
                res = self.nfs.recv_from(&mut nfs_buf) => match res {
                    Ok((n, peer)) => {
                        if let Some(reply) = nfs_srv::dispatch(am, &nfs_buf[..n]) {
                            if let Err(e) = self.nfs.send_to(&reply, peer).await {
                                warn!("nfs: cannot reply to {}: {}", peer, e);
                            }
                        }
                    }
                    Err(e) => warn!("nfs: receive failed: {}", e),
                },
                res = self.amq.recv_from(&mut amq_buf) => match res {
                    Ok((n, peer)) => {
                        if let Some(reply) = amq::dispatch(am, &amq_buf[..n]) {
                            if let Err(e) = self.amq.send_to(&reply, peer).await {
                                warn!("amq: cannot reply to {}: {}", peer, e);
                            }
                        }
                    }
                    Err(e) => warn!("amq: receive failed: {}", e),
                },
                res = self.amq_tcp.accept() => match res {
                    Ok((stream, peer)) => {
                        debug!("accepted: {:?}", peer);
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = amq_connection(stream, tx).await {
                                error!("amq connection from {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("amq: accept failed: {}", e),
                },
                Some((packet, reply)) = rx.recv() => {
                    let _ = reply.send(amq::dispatch(am, &packet));
                }
                _ = time::sleep_until(time::Instant::from_std(deadline)) => {}
            }
        }

        info!("Server shutdown complete");
        Ok(())
    }
}

async fn amq_connection(stream: TcpStream, tx: mpsc::Sender<AmqRequest>) -> Result<()> {
    let (readhalf, writehalf) = stream.into_split();
    let mut framedread = FramedRead::new(readhalf, RecordCodec::default());
    let mut framedwrite = FramedWrite::new(writehalf, RecordCodec::default());

    while let Some(record) = framedread.next().await {
        let record = record?;
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send((record.to_vec(), reply_tx)).await.is_err() {
            break;
        }
        if let Ok(Some(reply)) = reply_rx.await {
            framedwrite.send(Bytes::from(reply)).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        amq::AMQPROC_GETVERS,
        mapc::MapTypes,
        platform::Recorder,
        rpc::*,
        xdr::{Decodable, read_msg, write_msg},
    };
    use std::{
        io::{Cursor, Write},
        rc::Rc,
    };
    use tokio_util::codec::Framed;

    fn getvers(xid: u32) -> Vec<u8> {
        let msg = RpcMsg::call(xid, AMQ_PROGRAM, AMQ_VERSION, AMQPROC_GETVERS, OpaqueAuth::none());
        let mut packet = Vec::new();
        write_msg(&mut packet, &msg).unwrap();
        packet
    }

    fn version_of(reply: &[u8], xid: u32) -> String {
        let mut cur = Cursor::new(reply);
        let msg = read_msg(&mut cur).unwrap();
        assert_eq!(msg.xid, xid);
        assert!(msg.is_success());
        String::decode(&mut cur).unwrap()
    }

    #[tokio::test]
    async fn amq_answers_over_udp_and_tcp() {
        let mut map = tempfile::NamedTempFile::new().unwrap();
        map.write_all(b"x type:=link;fs:=/tmp\n").unwrap();
        let config = Config {
            background_mounts: false,
            ..Config::default()
        };
        let platform = Rc::new(Recorder::default());
        let mut am = Automounter::new(config, MapTypes::default(), platform, Instant::now());
        am.add_map("/mnt", map.path().to_str().unwrap(), "").unwrap();

        let server = Server::bind(&am.config).await.unwrap();
        let amq_addr = server.amq_addr().unwrap();

        let client = async {
            let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            sock.send_to(&getvers(1), amq_addr).await.unwrap();
            let mut buf = vec![0; 1024];
            let (n, _) = sock.recv_from(&mut buf).await.unwrap();
            let udp = version_of(&buf[..n], 1);

            let stream = TcpStream::connect(amq_addr).await.unwrap();
            let mut framed = Framed::new(stream, RecordCodec::default());
            framed.send(Bytes::from(getvers(2))).await.unwrap();
            let record = framed.next().await.unwrap().unwrap();
            let tcp = version_of(&record, 2);
            (udp, tcp)
        };

        let (udp, tcp) = tokio::select! {
            res = server.run(&mut am) => panic!("server stopped: {:?}", res.err()),
            versions = client => versions,
        };
        assert!(udp.starts_with("amd "));
        assert_eq!(udp, tcp);
        assert_eq!(am.state(), AmdState::Run);
        assert!(am.nodes.find_path("/mnt").is_some());
    }
}
