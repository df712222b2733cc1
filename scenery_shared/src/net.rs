//! Networking primitives.
//!
//! Goals:
//! - A reliable (TCP) channel with length-prefixed frames.
//! - Message types for publishing scenes and moving resource bytes.
//! - Keep serialization explicit and versionable.
//!
//! Resource bytes travel as [`ResourceBlob`]s in the same encoding used inside
//! resource files, so the receiving side rebuilds resources with identical hashes.

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU32, Ordering},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
};

use crate::{
    error::ResourceResult,
    hash::ContentHash,
    persistation::{decode_resource, encode_resource},
    resource::Resource,
    scene::SceneId,
};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frames above this size are rejected as corrupt.
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

static NEXT_CLIENT_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl ClientId {
    pub fn new_unique() -> Self {
        ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// One resource in wire form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceBlob {
    pub hash: ContentHash,
    pub bytes: Vec<u8>,
}

impl ResourceBlob {
    pub fn from_resource(resource: &Resource, compress: bool) -> ResourceResult<Self> {
        let encoded = encode_resource(resource, compress)?;
        Ok(Self {
            hash: encoded.info.hash,
            bytes: encoded.bytes.to_vec(),
        })
    }

    pub fn to_resource(&self) -> ResourceResult<Resource> {
        decode_resource(&self.bytes)
    }
}

/// High-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetMsg {
    // ─── Connection handshake ───
    Hello {
        protocol: u32,
    },
    Welcome {
        client_id: ClientId,
    },

    // ─── Scenes (client -> renderer) ───
    /// Scene and every resource hash it uses.
    PublishScene {
        scene_id: SceneId,
        resources: Vec<ContentHash>,
    },
    UpdateSceneResources {
        scene_id: SceneId,
        added: Vec<ContentHash>,
        removed: Vec<ContentHash>,
    },
    ShowScene {
        scene_id: SceneId,
    },
    HideScene {
        scene_id: SceneId,
    },
    UnpublishScene {
        scene_id: SceneId,
    },

    // ─── Resources ───
    /// Renderer -> client: send these bytes.
    RequestResources {
        hashes: Vec<ContentHash>,
    },
    /// Renderer -> client: no longer needed, drop if not yet sent.
    CancelResourceRequests {
        hashes: Vec<ContentHash>,
    },
    /// Client -> renderer: requested bytes.
    ResourceData(Vec<ResourceBlob>),
    /// Client -> renderer: requested hashes it cannot provide.
    ResourcesUnavailable {
        hashes: Vec<ContentHash>,
    },
    /// Either direction: these hashes can be provided on request.
    ResourcesAvailable {
        hashes: Vec<ContentHash>,
    },

    // ─── Disconnect ───
    Disconnect {
        reason: String,
    },
}

fn frame(msg: &NetMsg) -> anyhow::Result<BytesMut> {
    let payload = serde_json::to_vec(msg).context("serialize msg")?;
    anyhow::ensure!(
        payload.len() <= MAX_FRAME_BYTES,
        "frame of {} bytes exceeds limit",
        payload.len()
    );
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<NetMsg> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .context("tcp read len")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    anyhow::ensure!(len <= MAX_FRAME_BYTES, "frame of {len} bytes exceeds limit");
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    let msg = serde_json::from_slice(&payload).context("deserialize msg")?;
    Ok(msg)
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        Ok(Self::new(stream))
    }

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        let buf = frame(msg)?;
        self.stream.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }

    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        read_frame(&mut self.stream).await
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Splits into independently owned halves, e.g. to read on a spawned task.
    pub fn into_split(self) -> (ReliableReader, ReliableWriter) {
        let (read, write) = self.stream.into_split();
        (ReliableReader { read }, ReliableWriter { write })
    }
}

/// Receiving half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableReader {
    read: OwnedReadHalf,
}

impl ReliableReader {
    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        read_frame(&mut self.read).await
    }
}

/// Sending half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableWriter {
    write: OwnedWriteHalf,
}

impl ReliableWriter {
    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        let buf = frame(msg)?;
        self.write.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Convenience codec helpers.
pub fn encode_to_bytes(msg: &NetMsg) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize")?;
    Ok(Bytes::from(payload))
}

pub fn decode_from_bytes(b: &[u8]) -> anyhow::Result<NetMsg> {
    serde_json::from_slice(b).context("deserialize")
}
