use crate::protocol::{Request, decode_reply, frame_codec};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

pub type ClientResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Client side of the TCP bridge.
pub struct BridgeClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl BridgeClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> ClientResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, frame_codec()),
        })
    }

    /// Sends `body` to `address` and waits for the relayed reply.
    pub async fn request(&mut self, address: &str, body: Value) -> ClientResult<Value> {
        let frame = Request::new(address, body).encode()?;
        self.raw(frame).await
    }

    /// Delivers `body` without asking for a reply.
    pub async fn send(&mut self, address: &str, body: Value) -> ClientResult<()> {
        let frame = Request::new(address, body).without_reply().encode()?;
        self.framed.send(frame).await?;
        Ok(())
    }

    /// Writes an already encoded frame and reads one reply frame.
    pub async fn raw(&mut self, frame: Bytes) -> ClientResult<Value> {
        self.framed.send(frame).await?;
        match self.framed.next().await {
            Some(frame) => Ok(decode_reply(frame?.freeze())?),
            None => Err("connection closed by server".into()),
        }
    }
}
