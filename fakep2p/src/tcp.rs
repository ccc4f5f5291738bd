use std::{collections::HashMap, io, net::SocketAddr, sync::Arc};

use bytes::{Buf, BufMut, BytesMut};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use postcard::{from_bytes, to_stdvec};
use serde::{Deserialize, Serialize};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::{io_err, Name, P2PMessageBody, P2PReceiver, P2PSender, RouteTable};

/// Frames larger than this are treated as a broken stream.
const MAX_FRAME: usize = 16 << 20;
const LEN_PREFIX: usize = 4;

/// Static view of a TCP deployment: every peer's listen address (our own
/// included) and the multicast groups.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct P2PConfig {
    pub name: Name,
    pub addr_map: HashMap<Name, String>,
    #[serde(default)]
    pub mcast_groups: HashMap<Name, Vec<Name>>,
}

impl P2PConfig {
    pub fn from_json(json: &str) -> Result<Self, io::Error> {
        serde_json::from_str(json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Big-endian u32 length, then the postcard body.
#[derive(Default)]
struct FrameCodec;

impl Encoder<P2PMessageBody> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: P2PMessageBody, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body = match to_stdvec(&item) {
            Ok(b) => b,
            Err(_) => return io_err("cannot serialize message"),
        };
        if body.len() > MAX_FRAME {
            return io_err("outgoing frame too large");
        }
        dst.reserve(LEN_PREFIX + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = P2PMessageBody;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<P2PMessageBody>, io::Error> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME {
            return io_err("incoming frame too large");
        }
        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }
        src.advance(LEN_PREFIX);
        let body = src.split_to(len);
        from_bytes(&body)
            .map(Some)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "cannot deserialize message"))
    }
}

type Wire = Framed<TcpStream, FrameCodec>;

/// Drains one peer's outgoing queue into its socket, flushing whenever the
/// queue runs dry.
async fn forward(mut queue: mpsc::UnboundedReceiver<P2PMessageBody>, mut sink: SplitSink<Wire, P2PMessageBody>) {
    while let Some(first) = queue.recv().await {
        if sink.feed(first).await.is_err() {
            return;
        }
        while let Ok(m) = queue.try_recv() {
            if sink.feed(m).await.is_err() {
                return;
            }
        }
        if sink.flush().await.is_err() {
            return;
        }
    }
}

/// TCP backend: one connection per remote peer, all outgoing traffic routed
/// through a shared `RouteTable`.
pub struct P2PComm {
    name: Name,
    listener: TcpListener,
    table: Arc<RouteTable>,
    // outgoing queues whose connection is not up yet
    queues: HashMap<Name, mpsc::UnboundedReceiver<P2PMessageBody>>,
    dialed: Vec<TcpStream>,
}

impl P2PComm {
    /// Binds our own address and dials every peer already listening. Peers
    /// that come up later dial us instead.
    pub async fn new(mut config: P2PConfig) -> Result<Self, io::Error> {
        let own = match config.addr_map.remove(&config.name) {
            Some(a) => a,
            None => return io_err("own name missing from addr_map"),
        };
        let listener = TcpListener::bind(&own).await?;

        let table = Arc::new(RouteTable::default());
        let mut queues = HashMap::new();
        for peer in config.addr_map.keys() {
            let (s, r) = mpsc::unbounded_channel();
            table.register(peer.clone(), s);
            queues.insert(peer.clone(), r);
        }
        for (group, members) in &config.mcast_groups {
            for m in members {
                table.add_to_group(group, m);
            }
        }

        let mut dialed = Vec::new();
        for addr in config.addr_map.values() {
            if let Ok(s) = TcpStream::connect(addr).await {
                dialed.push(s);
            }
        }

        Ok(Self {
            name: config.name,
            listener,
            table,
            queues,
            dialed,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.listener.local_addr()
    }

    /// Brings up the next connection, dialed ones first, and returns the
    /// receiving half. Each side opens with a hello naming itself.
    pub async fn accept(&mut self) -> Result<P2PReceiver, io::Error> {
        let stream = match self.dialed.pop() {
            Some(s) => s,
            None => self.listener.accept().await?.0,
        };
        let (mut sink, mut incoming) = Framed::new(stream, FrameCodec).split();

        sink.send(P2PMessageBody {
            dest: Name::new(),
            sender: self.name.clone(),
            content: Vec::new(),
            metadata: Vec::new(),
        })
        .await?;
        let remote = match incoming.next().await {
            Some(hello) => hello?.sender,
            None => return io_err("connection closed before hello"),
        };

        let queue = match self.queues.remove(&remote) {
            Some(q) => q,
            None => return io_err("unknown or already connected peer"),
        };
        tokio::spawn(forward(queue, sink));
        Ok(P2PReceiver::new(incoming))
    }

    pub fn new_sender(&self) -> P2PSender {
        P2PSender::new(self.name.clone(), self.table.clone())
    }
}
