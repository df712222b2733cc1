//! Shared helpers for the integration tests.

use std::time::{Duration, Instant};

use scenery_client::SceneClient;
use scenery_renderer::RendererServer;
use scenery_shared::{
    config::SceneryConfig,
    resource::{Resource, ResourceType},
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// A 2000 byte texture whose content depends on `seed`.
pub fn texture(seed: u8) -> Resource {
    let pixels: Vec<u8> = (0..2000u32).map(|i| (i % 7) as u8 ^ seed).collect();
    Resource::new(ResourceType::Texture2D, pixels, &b"rgba8 25x20"[..], 1, format!("T{seed}"))
}

pub fn index_array(seed: u8) -> Resource {
    let indices: Vec<u8> = (0u16..60).flat_map(|i| (i + u16::from(seed)).to_le_bytes()).collect();
    Resource::new(ResourceType::IndexArray, indices, &b"u16"[..], 1, format!("I{seed}"))
}

/// A 500 byte effect.
pub fn effect(seed: u8) -> Resource {
    let mut source = format!("// effect {seed}\nvoid main() {{}}\n").into_bytes();
    source.resize(500, b' ');
    Resource::new(ResourceType::Effect, source, &b"uniforms: none"[..], 1, format!("E{seed}"))
}

/// Starts a renderer on an ephemeral port and connects one client to it.
/// `cfg_override` adjusts the client config.
pub async fn connected_pair(
    cfg_override: impl FnOnce(&mut SceneryConfig),
) -> anyhow::Result<(RendererServer, SceneClient)> {
    let (server, mut cfg) = scenery_renderer::renderer::bind_ephemeral(60).await?;
    cfg_override(&mut cfg);
    let mut server = server;
    let (accepted, client) = tokio::join!(server.accept_one(), SceneClient::connect(&cfg));
    accepted?;
    Ok((server, client?))
}

/// Alternates renderer frames and client polls until `done` holds or `timeout` passes.
pub async fn pump_until(
    server: &mut RendererServer,
    client: &mut SceneClient,
    timeout: Duration,
    mut done: impl FnMut(&RendererServer, &SceneClient) -> bool,
) -> anyhow::Result<bool> {
    let start = Instant::now();
    while start.elapsed() < timeout {
        server.step().await?;
        client.poll(Duration::from_millis(5)).await?;
        if done(server, client) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Runs a fixed number of renderer frames and client polls.
pub async fn pump(
    server: &mut RendererServer,
    client: &mut SceneClient,
    rounds: usize,
) -> anyhow::Result<()> {
    for _ in 0..rounds {
        server.step().await?;
        client.poll(Duration::from_millis(5)).await?;
    }
    Ok(())
}
