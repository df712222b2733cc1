//! Scene client.
//!
//! The client maintains:
//! - A reliable control stream (handshake, scene messages, resource bytes)
//! - A local resource component holding everything its scenes use
//! - An outgoing queue of requested resources, flushed once per poll
//!
//! Requests and cancels received in the same poll cancel each other out, so
//! bytes a renderer stopped wanting are never sent.

use std::{
    collections::{BTreeMap, VecDeque},
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use scenery_shared::{
    component::ResourceComponent,
    config::SceneryConfig,
    files::{resource_file_path, ResourceFileHandle},
    hash::ContentHash,
    net::{ClientId, NetMsg, ReliableConn, ReliableWriter, ResourceBlob, PROTOCOL_VERSION},
    resource::Resource,
    scene::{SceneId, SceneResources},
    storage::ManagedResource,
};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    Disconnected,
}

/// Counters for what the client answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStatistics {
    pub resources_sent: u64,
    pub bytes_sent: u64,
    pub resources_unavailable: u64,
    pub requests_cancelled: u64,
}

pub struct SceneClient {
    pub client_id: ClientId,
    pub state: ClientState,

    writer: ReliableWriter,
    inbox: mpsc::UnboundedReceiver<NetMsg>,
    peer: SocketAddr,

    resources: ResourceComponent,
    scenes: BTreeMap<SceneId, SceneResources>,
    /// Requested hashes not sent yet, in request order.
    outgoing: VecDeque<ContentHash>,

    compress: bool,
    resource_dir: PathBuf,
    stats: ClientStatistics,
}

impl SceneClient {
    /// Connects to a renderer and performs the handshake.
    pub async fn connect(cfg: &SceneryConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.renderer_addr.parse().context("parse renderer_addr")?;
        info!(renderer = %addr, "Connecting to renderer");

        let mut reliable = ReliableConn::connect(addr).await?;
        reliable
            .send(&NetMsg::Hello {
                protocol: PROTOCOL_VERSION,
            })
            .await?;
        let client_id = match reliable.recv().await? {
            NetMsg::Welcome { client_id } => client_id,
            other => anyhow::bail!("expected Welcome, got {other:?}"),
        };
        info!(client_id = ?client_id, "Connected to renderer");

        let peer = reliable.peer_addr()?;
        let (mut reader, writer) = reliable.into_split();
        let (tx, inbox) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "renderer connection closed");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            client_id,
            state: ClientState::Connected,
            writer,
            inbox,
            peer,
            resources: ResourceComponent::new(),
            scenes: BTreeMap::new(),
            outgoing: VecDeque::new(),
            compress: cfg.compress_resources,
            resource_dir: PathBuf::from(&cfg.resource_dir),
            stats: ClientStatistics::default(),
        })
    }

    pub fn renderer_peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn resources(&self) -> &ResourceComponent {
        &self.resources
    }

    pub fn statistics(&self) -> ClientStatistics {
        self.stats
    }

    pub fn scene(&self, scene_id: SceneId) -> Option<&SceneResources> {
        self.scenes.get(&scene_id)
    }

    /// Requested hashes waiting for the next flush.
    pub fn pending_sends(&self) -> Vec<ContentHash> {
        self.outgoing.iter().copied().collect()
    }

    /// Hands a freshly built resource to the local cache.
    pub fn create_resource(&self, resource: Resource) -> ManagedResource {
        self.resources.manage_resource(resource, true)
    }

    pub async fn publish_scene(
        &mut self,
        scene_id: SceneId,
        resources: Vec<ManagedResource>,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.scenes.contains_key(&scene_id),
            "{scene_id} is already published"
        );
        let mut scene = SceneResources::new();
        for resource in resources {
            scene.add_resource(resource);
        }
        let hashes = scene.hashes();
        self.scenes.insert(scene_id, scene);
        info!(scene = %scene_id, resources = hashes.len(), "publishing scene");
        self.send(&NetMsg::PublishScene {
            scene_id,
            resources: hashes,
        })
        .await
    }

    /// Adds and removes resources of a published scene.
    pub async fn update_scene(
        &mut self,
        scene_id: SceneId,
        added: Vec<ManagedResource>,
        removed: &[ContentHash],
    ) -> anyhow::Result<()> {
        let scene = self
            .scenes
            .get_mut(&scene_id)
            .with_context(|| format!("{scene_id} is not published"))?;
        let added: Vec<ContentHash> = added
            .into_iter()
            .filter_map(|r| {
                let hash = r.hash();
                scene.add_resource(r).then_some(hash)
            })
            .collect();
        let removed: Vec<ContentHash> = removed
            .iter()
            .copied()
            .filter(|h| scene.remove(*h))
            .collect();
        if added.is_empty() && removed.is_empty() {
            return Ok(());
        }
        self.send(&NetMsg::UpdateSceneResources {
            scene_id,
            added,
            removed,
        })
        .await
    }

    /// Makes a published scene use a hash known only from a resource file.
    pub async fn reference_resource(
        &mut self,
        scene_id: SceneId,
        hash: ContentHash,
    ) -> anyhow::Result<()> {
        let usage = self.resources.get_resource_hash_usage(hash)?;
        let scene = self
            .scenes
            .get_mut(&scene_id)
            .with_context(|| format!("{scene_id} is not published"))?;
        if !scene.add_reference(usage) {
            return Ok(());
        }
        self.send(&NetMsg::UpdateSceneResources {
            scene_id,
            added: vec![hash],
            removed: Vec::new(),
        })
        .await
    }

    pub async fn show_scene(&mut self, scene_id: SceneId) -> anyhow::Result<()> {
        self.send(&NetMsg::ShowScene { scene_id }).await
    }

    pub async fn hide_scene(&mut self, scene_id: SceneId) -> anyhow::Result<()> {
        self.send(&NetMsg::HideScene { scene_id }).await
    }

    /// Unpublishes and releases everything the scene held.
    pub async fn unpublish_scene(&mut self, scene_id: SceneId) -> anyhow::Result<()> {
        if self.scenes.remove(&scene_id).is_none() {
            return Ok(());
        }
        self.send(&NetMsg::UnpublishScene { scene_id }).await
    }

    /// Handles what the renderer sent, waiting up to `wait` for the first message,
    /// then answers outstanding requests. Returns the number of messages handled.
    pub async fn poll(&mut self, wait: Duration) -> anyhow::Result<usize> {
        let mut handled = 0;
        if self.state == ClientState::Disconnected {
            return Ok(0);
        }
        if let Ok(Some(msg)) = tokio::time::timeout(wait, self.inbox.recv()).await {
            self.handle_message(msg);
            handled += 1;
        }
        loop {
            match self.inbox.try_recv() {
                Ok(msg) => {
                    self.handle_message(msg);
                    handled += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    info!("renderer went away");
                    self.state = ClientState::Disconnected;
                    break;
                }
            }
        }
        self.flush_requested().await?;
        Ok(handled)
    }

    fn handle_message(&mut self, msg: NetMsg) {
        match msg {
            NetMsg::RequestResources { hashes } => {
                for hash in hashes {
                    if !self.outgoing.contains(&hash) {
                        self.outgoing.push_back(hash);
                    }
                }
            }
            NetMsg::CancelResourceRequests { hashes } => {
                let before = self.outgoing.len();
                self.outgoing.retain(|h| !hashes.contains(h));
                self.stats.requests_cancelled += (before - self.outgoing.len()) as u64;
            }
            NetMsg::Disconnect { reason } => {
                info!(%reason, "Disconnected by renderer");
                self.state = ClientState::Disconnected;
            }
            other => debug!(?other, "Unhandled message"),
        }
    }

    async fn flush_requested(&mut self) -> anyhow::Result<()> {
        if self.outgoing.is_empty() || self.state == ClientState::Disconnected {
            return Ok(());
        }
        let hashes: Vec<ContentHash> = self.outgoing.drain(..).collect();
        let resolved = self.resources.resolve_resources(&hashes);

        let mut blobs = Vec::with_capacity(resolved.len());
        for resource in &resolved {
            match ResourceBlob::from_resource(resource, self.compress) {
                Ok(blob) => blobs.push(blob),
                Err(e) => warn!(hash = %resource.hash(), error = %e, "cannot encode resource"),
            }
        }
        let unavailable: Vec<ContentHash> = hashes
            .into_iter()
            .filter(|h| !blobs.iter().any(|b| b.hash == *h))
            .collect();

        if !blobs.is_empty() {
            self.stats.resources_sent += blobs.len() as u64;
            self.stats.bytes_sent += blobs.iter().map(|b| b.bytes.len() as u64).sum::<u64>();
            debug!(count = blobs.len(), "sending resources");
            self.send(&NetMsg::ResourceData(blobs)).await?;
        }
        if !unavailable.is_empty() {
            self.stats.resources_unavailable += unavailable.len() as u64;
            self.send(&NetMsg::ResourcesUnavailable {
                hashes: unavailable,
            })
            .await?;
        }
        Ok(())
    }

    /// Tells the renderer these hashes can be provided again.
    pub async fn announce_resources(&mut self, hashes: Vec<ContentHash>) -> anyhow::Result<()> {
        self.send(&NetMsg::ResourcesAvailable { hashes }).await
    }

    /// Writes every resource of `scene_id` to `<resource_dir>/<name>.res`.
    pub fn save_resources(&self, scene_id: SceneId, name: &str) -> anyhow::Result<PathBuf> {
        let scene = self
            .scenes
            .get(&scene_id)
            .with_context(|| format!("{scene_id} is not published"))?;
        let resources: Vec<ManagedResource> = scene.managed_resources().cloned().collect();
        std::fs::create_dir_all(&self.resource_dir)
            .with_context(|| format!("create {}", self.resource_dir.display()))?;
        let path = resource_file_path(&self.resource_dir, name);
        let toc = self
            .resources
            .write_resource_file(&path, &resources, self.compress)?;
        info!(path = %path.display(), resources = toc.len(), "resources saved");
        Ok(path)
    }

    /// Registers a resource file so its resources can be referenced and served.
    pub fn load_resource_file(&self, path: &Path) -> anyhow::Result<ResourceFileHandle> {
        let handle = self
            .resources
            .open_resource_file(path)
            .with_context(|| format!("open {}", path.display()))?;
        info!(path = %path.display(), ?handle, "resource file registered");
        Ok(handle)
    }

    /// Executes a console command.
    pub async fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = tokens.first() else {
            return Ok(Vec::new());
        };
        let scene_arg = || -> anyhow::Result<SceneId> {
            let raw = tokens.get(1).context("missing scene id")?;
            Ok(SceneId(raw.parse().context("scene id")?))
        };

        match command {
            "status" => {
                let mut out = vec![
                    format!("State: {:?}", self.state),
                    format!("Client ID: {:?}", self.client_id),
                    format!("Resident resources: {}", self.resources.resources().len()),
                    format!("Pending sends: {}", self.outgoing.len()),
                ];
                for (id, scene) in &self.scenes {
                    out.push(format!("  {id}: {} resources", scene.len()));
                }
                let s = self.stats;
                out.push(format!(
                    "Sent {} ({} B), unavailable {}, cancelled {}",
                    s.resources_sent, s.bytes_sent, s.resources_unavailable, s.requests_cancelled
                ));
                Ok(out)
            }
            "show" => {
                let scene = scene_arg()?;
                self.show_scene(scene).await?;
                Ok(vec![format!("{scene} shown")])
            }
            "hide" => {
                let scene = scene_arg()?;
                self.hide_scene(scene).await?;
                Ok(vec![format!("{scene} hidden")])
            }
            "unpublish" => {
                let scene = scene_arg()?;
                self.unpublish_scene(scene).await?;
                Ok(vec![format!("{scene} unpublished")])
            }
            "save" => {
                let scene = scene_arg()?;
                let name = tokens.get(2).context("Usage: save <scene> <name>")?;
                let path = self.save_resources(scene, name)?;
                Ok(vec![format!("Saved to {}", path.display())])
            }
            "load" => {
                let path = tokens.get(1).context("Usage: load <path>")?;
                let handle = self.load_resource_file(Path::new(path))?;
                Ok(vec![format!("Registered {path} as {handle:?}")])
            }
            "quit" | "exit" => {
                self.send(&NetMsg::Disconnect {
                    reason: "client quit".to_string(),
                })
                .await?;
                self.state = ClientState::Disconnected;
                Ok(vec!["Bye".to_string()])
            }
            other => Ok(vec![format!("Unknown command: {other}")]),
        }
    }

    async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        self.writer.send(msg).await
    }
}
