//! Renderer server.
//!
//! Accepts scene clients, mirrors their published scenes into the resource
//! registry, pulls missing bytes and drives the uploading manager once per frame.
//!
//! Networking model:
//! - Each connection is read on its own task; messages land in one channel.
//! - Writes happen from the frame loop only.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use anyhow::Context;
use scenery_shared::{
    component::ResourceComponent,
    config::SceneryConfig,
    error::ResourceResult,
    event::ResourceEvent,
    files::ResourceFileHandle,
    hash::ContentHash,
    net::{
        ClientId, NetMsg, ReliableConn, ReliableListener, ReliableWriter, ResourceBlob,
        PROTOCOL_VERSION,
    },
    render::{NullBackend, NullShaderCompiler, RenderBackend, ShaderCompiler},
    requests::ResourceRequests,
    scene::SceneId,
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, trace, warn};

use crate::{
    frame_timer::FrameTimer,
    registry::ResourceStatus,
    uploading::ResourceUploadingManager,
};

enum Inbound {
    Message(ClientId, NetMsg),
    Closed(ClientId),
}

struct PublishedScene {
    owner: ClientId,
    resources: BTreeSet<ContentHash>,
}

pub struct RendererServer {
    pub cfg: SceneryConfig,
    tcp: ReliableListener,
    clients: HashMap<ClientId, ReliableWriter>,
    scenes: BTreeMap<SceneId, PublishedScene>,

    inbox_tx: mpsc::UnboundedSender<Inbound>,
    inbox: mpsc::UnboundedReceiver<Inbound>,

    requests: ResourceRequests,
    /// Bytes that arrived or are available from local resource files.
    resources: ResourceComponent,
    uploading: ResourceUploadingManager,
    timer: FrameTimer,

    frame: u64,
    quit: bool,
    console_rx: Option<mpsc::Receiver<String>>,
}

impl RendererServer {
    pub async fn new(
        cfg: SceneryConfig,
        backend: Box<dyn RenderBackend>,
        compiler: Box<dyn ShaderCompiler>,
    ) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.renderer_addr.parse().context("parse renderer_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        let timer = FrameTimer::default();
        let uploading =
            ResourceUploadingManager::new(backend, compiler, cfg.display.clone(), timer.clone())?;
        let (inbox_tx, inbox) = mpsc::unbounded_channel();

        Ok(Self {
            cfg,
            tcp,
            clients: HashMap::new(),
            scenes: BTreeMap::new(),
            inbox_tx,
            inbox,
            requests: ResourceRequests::new(),
            resources: ResourceComponent::new(),
            uploading,
            timer,
            frame: 0,
            quit: false,
            console_rx: None,
        })
    }

    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn should_quit(&self) -> bool {
        self.quit
    }

    pub fn uploading(&self) -> &ResourceUploadingManager {
        &self.uploading
    }

    pub fn resources(&self) -> &ResourceComponent {
        &self.resources
    }

    pub fn is_published(&self, scene: SceneId) -> bool {
        self.scenes.contains_key(&scene)
    }

    /// Local resource file consulted before asking clients for bytes.
    pub fn open_resource_file(&self, path: &Path) -> ResourceResult<ResourceFileHandle> {
        self.resources.open_resource_file(path)
    }

    /// Waits for one client and completes the handshake.
    pub async fn accept_one(&mut self) -> anyhow::Result<ClientId> {
        let (conn, peer) = self.tcp.accept().await?;
        self.handle_new_connection(conn, peer).await
    }

    /// Accepts a client if one connects within `timeout`.
    pub async fn try_accept(&mut self, timeout: Duration) -> anyhow::Result<Option<ClientId>> {
        match tokio::time::timeout(timeout, self.tcp.accept()).await {
            Ok(Ok((conn, peer))) => self.handle_new_connection(conn, peer).await.map(Some),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    async fn handle_new_connection(
        &mut self,
        mut conn: ReliableConn,
        peer: SocketAddr,
    ) -> anyhow::Result<ClientId> {
        match conn.recv().await? {
            NetMsg::Hello { protocol } if protocol == PROTOCOL_VERSION => {
                let id = ClientId::new_unique();
                conn.send(&NetMsg::Welcome { client_id: id }).await?;

                let (mut reader, writer) = conn.into_split();
                let tx = self.inbox_tx.clone();
                tokio::spawn(async move {
                    loop {
                        match reader.recv().await {
                            Ok(msg) => {
                                if tx.send(Inbound::Message(id, msg)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(client_id = ?id, error = %e, "connection closed");
                                let _ = tx.send(Inbound::Closed(id));
                                break;
                            }
                        }
                    }
                });
                self.clients.insert(id, writer);

                info!(client_id = ?id, %peer, "client connected");
                Ok(id)
            }
            other => anyhow::bail!("unexpected handshake msg: {other:?}"),
        }
    }

    /// Runs accept + step at `frame_hz` for a number of frames.
    pub async fn run_for_frames(&mut self, frames: u32) -> anyhow::Result<()> {
        let dt = Duration::from_secs_f32(1.0 / self.cfg.frame_hz.max(1) as f32);
        let mut next = Instant::now();

        for _ in 0..frames {
            next += dt;
            if let Err(e) = self.try_accept(Duration::from_millis(1)).await {
                warn!(error = %e, "failed to accept client");
            }
            self.step().await?;
            if self.quit {
                break;
            }
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// One render loop iteration.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        self.timer.start_frame();
        self.process_console_commands();
        self.process_messages().await;
        self.request_missing_resources().await;
        self.uploading.upload_and_unload_pending_resources();
        self.log_events();
        self.frame += 1;
        Ok(())
    }

    fn process_console_commands(&mut self) {
        let lines: Vec<String> = match self.console_rx.as_mut() {
            Some(rx) => std::iter::from_fn(|| rx.try_recv().ok()).collect(),
            None => Vec::new(),
        };
        for line in lines {
            for out in self.exec_console(&line) {
                println!("{out}");
            }
        }
    }

    /// Executes a console command and returns its output lines.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = tokens.first() else {
            return Vec::new();
        };

        match command {
            "status" => {
                let registry = self.uploading.registry();
                let mut out = vec![
                    format!("Frame: {}", self.frame),
                    format!("Clients: {}", self.clients.len()),
                    format!("Scenes: {}", self.scenes.len()),
                ];
                for (id, scene) in &self.scenes {
                    out.push(format!(
                        "  {id}: owner={:?} resources={} shown={}",
                        scene.owner,
                        scene.resources.len(),
                        self.uploading.is_scene_shown(*id)
                    ));
                }
                out.push(format!("Resources: {}", registry.len()));
                for (status, count) in registry.status_counts() {
                    out.push(format!("  {status:?}: {count}"));
                }
                out.push(format!(
                    "Uploaded: {} B (cache {} B)",
                    self.uploading.uploaded_bytes(),
                    self.uploading.config().gpu_cache_size
                ));
                out.push(format!("Pending requests: {}", self.requests.len()));
                out
            }
            "stats" if tokens.get(1) == Some(&"json") => {
                match serde_json::to_string(&self.uploading.statistics()) {
                    Ok(json) => vec![json],
                    Err(e) => vec![format!("Failed to encode statistics: {e}")],
                }
            }
            "stats" => {
                let cache = self.resources.statistics();
                vec![
                    self.uploading.statistics().summary(),
                    format!(
                        "loaded from file {}, resolve misses {}",
                        cache.loaded_from_file, cache.resolve_misses
                    ),
                ]
            }
            "quit" | "exit" => {
                info!("renderer shutting down");
                self.quit = true;
                vec!["Bye".to_string()]
            }
            other => vec![format!("Unknown command: {other}")],
        }
    }

    async fn process_messages(&mut self) {
        while let Ok(inbound) = self.inbox.try_recv() {
            match inbound {
                Inbound::Message(client, msg) => self.handle_message(client, msg).await,
                Inbound::Closed(client) => self.client_disconnected(client).await,
            }
        }
    }

    async fn handle_message(&mut self, client: ClientId, msg: NetMsg) {
        match msg {
            NetMsg::PublishScene {
                scene_id,
                resources,
            } => {
                if let Some(existing) = self.scenes.get(&scene_id) {
                    warn!(scene = %scene_id, owner = ?existing.owner, client_id = ?client, "scene already published");
                    return;
                }
                self.scenes.insert(
                    scene_id,
                    PublishedScene {
                        owner: client,
                        resources: BTreeSet::new(),
                    },
                );
                self.add_scene_resources(scene_id, &resources);
                info!(scene = %scene_id, resources = resources.len(), "scene published");
            }
            NetMsg::UpdateSceneResources {
                scene_id,
                added,
                removed,
            } => {
                if !self.owns(client, scene_id) {
                    return;
                }
                self.add_scene_resources(scene_id, &added);
                self.remove_scene_resources(scene_id, &removed).await;
            }
            NetMsg::ShowScene { scene_id } => {
                if self.owns(client, scene_id) {
                    self.uploading.show_scene(scene_id);
                    debug!(scene = %scene_id, "scene shown");
                }
            }
            NetMsg::HideScene { scene_id } => {
                if self.owns(client, scene_id) {
                    self.uploading.hide_scene(scene_id);
                    debug!(scene = %scene_id, "scene hidden");
                }
            }
            NetMsg::UnpublishScene { scene_id } => {
                if self.owns(client, scene_id) {
                    self.unpublish(scene_id).await;
                }
            }
            NetMsg::ResourceData(blobs) => self.store_blobs(blobs),
            NetMsg::ResourcesUnavailable { hashes } => self.resources_unavailable(&hashes),
            NetMsg::ResourcesAvailable { hashes } => {
                let registry = self.uploading.registry_mut();
                for hash in hashes {
                    if registry.status(hash) == Some(ResourceStatus::Broken) {
                        registry.set_resource_registered(hash);
                    }
                }
            }
            NetMsg::Disconnect { reason } => {
                info!(client_id = ?client, %reason, "client disconnecting");
                self.client_disconnected(client).await;
            }
            other => debug!(client_id = ?client, ?other, "unexpected message"),
        }
    }

    fn owns(&self, client: ClientId, scene: SceneId) -> bool {
        let owned = self.scenes.get(&scene).is_some_and(|s| s.owner == client);
        if !owned {
            warn!(scene = %scene, client_id = ?client, "message for scene not owned by client");
        }
        owned
    }

    fn add_scene_resources(&mut self, scene_id: SceneId, hashes: &[ContentHash]) {
        let Some(scene) = self.scenes.get_mut(&scene_id) else {
            return;
        };
        let registry = self.uploading.registry_mut();
        for &hash in hashes {
            if scene.resources.insert(hash) {
                registry.register_resource(hash);
                registry.add_resource_ref(hash, scene_id);
            }
        }
    }

    async fn remove_scene_resources(&mut self, scene_id: SceneId, hashes: &[ContentHash]) {
        let Some(scene) = self.scenes.get_mut(&scene_id) else {
            return;
        };
        let owner = scene.owner;
        let mut cancelled = Vec::new();
        for &hash in hashes {
            if !scene.resources.remove(&hash) {
                continue;
            }
            self.uploading.registry_mut().remove_resource_ref(hash, scene_id);
            if self.requests.cancel_resource_request(hash, scene_id) {
                cancelled.push(hash);
            }
        }
        self.cancel_requests(owner, cancelled).await;
    }

    async fn unpublish(&mut self, scene_id: SceneId) {
        let Some(scene) = self.scenes.remove(&scene_id) else {
            return;
        };
        self.uploading.remove_scene(scene_id);
        let cancelled = self.requests.cancel_all(scene_id);
        self.cancel_requests(scene.owner, cancelled).await;
        info!(scene = %scene_id, "scene unpublished");
    }

    /// Tells `owner` to drop `hashes`. Hashes other scenes still use are asked for again.
    async fn cancel_requests(&mut self, owner: ClientId, hashes: Vec<ContentHash>) {
        if hashes.is_empty() {
            return;
        }
        let registry = self.uploading.registry_mut();
        for &hash in &hashes {
            registry.set_resource_registered(hash);
        }
        self.send_to(owner, &NetMsg::CancelResourceRequests { hashes })
            .await;
    }

    async fn client_disconnected(&mut self, client: ClientId) {
        if self.clients.remove(&client).is_none() {
            return;
        }
        let owned: Vec<SceneId> = self
            .scenes
            .iter()
            .filter(|(_, s)| s.owner == client)
            .map(|(id, _)| *id)
            .collect();
        for scene in owned {
            self.unpublish(scene).await;
        }
        info!(client_id = ?client, "client disconnected");
    }

    fn store_blobs(&mut self, blobs: Vec<ResourceBlob>) {
        for blob in blobs {
            let resource = match blob.to_resource() {
                Ok(r) if r.hash() == blob.hash => r,
                Ok(r) => {
                    warn!(expected = %blob.hash, actual = %r.hash(), "resource data does not match its hash");
                    continue;
                }
                Err(e) => {
                    warn!(hash = %blob.hash, error = %e, "failed to decode resource data");
                    continue;
                }
            };
            self.requests.complete(blob.hash);
            let managed = self.resources.manage_resource(resource, true);
            trace!(hash = %blob.hash, "resource data arrived");
            self.uploading
                .registry_mut()
                .set_resource_data(blob.hash, managed);
        }
    }

    fn resources_unavailable(&mut self, hashes: &[ContentHash]) {
        let mut missing: BTreeMap<SceneId, Vec<ContentHash>> = BTreeMap::new();
        for &hash in hashes {
            for scene in self.requests.complete(hash) {
                missing.entry(scene).or_default().push(hash);
            }
            self.uploading.registry_mut().set_resource_broken(hash, false);
        }
        for (scene, hashes) in missing {
            self.uploading
                .report(ResourceEvent::ResourcesMissing { scene, hashes });
        }
    }

    /// Asks owners of shown scenes for bytes not yet available locally.
    async fn request_missing_resources(&mut self) {
        let shown: Vec<SceneId> = self.uploading.shown_scenes().collect();
        let mut wanted: Vec<(SceneId, Vec<ContentHash>)> = Vec::new();
        {
            let registry = self.uploading.registry();
            for scene in shown {
                let hashes: Vec<ContentHash> = registry
                    .resources_in_use_by_scene(scene)
                    .into_iter()
                    .filter(|h| registry.status(*h) == Some(ResourceStatus::Registered))
                    .collect();
                if !hashes.is_empty() {
                    wanted.push((scene, hashes));
                }
            }
        }

        for (scene, hashes) in wanted {
            let mut remote = Vec::new();
            for hash in hashes {
                match self.uploading.registry().status(hash) {
                    Some(ResourceStatus::Registered) => {
                        match self.resources.force_load_resource(hash) {
                            Ok(local) => self.uploading.registry_mut().set_resource_data(hash, local),
                            Err(_) => remote.push(hash),
                        }
                    }
                    // Shared with a scene processed earlier this frame.
                    Some(ResourceStatus::Requested) if self.requests.is_pending(hash) => {
                        remote.push(hash)
                    }
                    _ => {}
                }
            }
            if remote.is_empty() {
                continue;
            }
            for &hash in &remote {
                self.uploading.registry_mut().set_resource_requested(hash);
            }
            let fresh = self.requests.request(&remote, scene);
            let Some(owner) = self.scenes.get(&scene).map(|s| s.owner) else {
                continue;
            };
            if !fresh.is_empty() {
                debug!(scene = %scene, count = fresh.len(), "requesting resources");
                self.send_to(owner, &NetMsg::RequestResources { hashes: fresh })
                    .await;
            }
        }
    }

    async fn send_to(&mut self, client: ClientId, msg: &NetMsg) {
        let Some(writer) = self.clients.get_mut(&client) else {
            return;
        };
        if let Err(e) = writer.send(msg).await {
            warn!(client_id = ?client, error = %e, "failed to send to client");
        }
    }

    fn log_events(&mut self) {
        for event in self.uploading.drain_events() {
            match event {
                ResourceEvent::UploadFailed { hash, reason } => {
                    warn!(%hash, %reason, "upload failed")
                }
                ResourceEvent::Evicted {
                    hash,
                    bytes,
                    demoted,
                } => debug!(%hash, bytes, demoted, "resource evicted"),
                ResourceEvent::EffectCompiled { hash } => debug!(%hash, "effect compiled"),
                ResourceEvent::ResourcesMissing { scene, hashes } => {
                    warn!(scene = %scene, count = hashes.len(), "scene resources unavailable")
                }
                ResourceEvent::CacheBudgetExceeded {
                    uploaded_bytes,
                    budget,
                } => debug!(uploaded_bytes, budget, "over gpu cache size"),
            }
        }
    }
}

/// Helper for tests: a headless renderer on an ephemeral port.
pub async fn bind_ephemeral(frame_hz: u32) -> anyhow::Result<(RendererServer, SceneryConfig)> {
    let mut cfg = SceneryConfig {
        renderer_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        frame_hz,
        ..Default::default()
    };
    let server = RendererServer::new(
        cfg.clone(),
        Box::new(NullBackend::new()),
        Box::new(NullShaderCompiler::default()),
    )
    .await?;
    cfg.renderer_addr = server.local_addr()?.to_string();
    Ok((server, cfg))
}
