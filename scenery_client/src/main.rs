//! Standalone scene client.
//!
//! Usage:
//!   cargo run -p scenery_client -- [--config scenery.json] [--addr 127.0.0.1:41000]
//!       [--resource-dir resources] [--no-compress]
//!
//! Publishes a small demo scene, shows it and answers the renderer's resource
//! requests until told to quit.
//!
//! Console commands:
//!   status              - Show client status
//!   show <scene>        - Show a published scene
//!   hide <scene>        - Hide a published scene
//!   unpublish <scene>   - Unpublish a scene
//!   save <scene> <name> - Write a scene's resources to a resource file
//!   load <path>         - Register a resource file
//!   quit                - Disconnect and exit

use std::env;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::Context;
use scenery_client::client::{ClientState, SceneClient};
use scenery_shared::{
    config::SceneryConfig,
    resource::{Resource, ResourceType},
    scene::SceneId,
};
use tokio::sync::mpsc;
use tracing::info;

const DEMO_SCENE: SceneId = SceneId(1);

fn parse_args() -> anyhow::Result<SceneryConfig> {
    let mut cfg = SceneryConfig::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                let text = std::fs::read_to_string(&args[i + 1])
                    .with_context(|| format!("read config {}", args[i + 1]))?;
                cfg = SceneryConfig::from_json_str(&text).context("parse config")?;
                i += 2;
            }
            "--addr" if i + 1 < args.len() => {
                cfg.renderer_addr = args[i + 1].clone();
                i += 2;
            }
            "--resource-dir" if i + 1 < args.len() => {
                cfg.resource_dir = args[i + 1].clone();
                i += 2;
            }
            "--no-compress" => {
                cfg.compress_resources = false;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

fn demo_resources() -> Vec<Resource> {
    let pixels: Vec<u8> = (0..64 * 64 * 4).map(|i| (i % 251) as u8).collect();
    let indices: Vec<u8> = (0u16..600).flat_map(|i| (i % 300).to_le_bytes()).collect();
    vec![
        Resource::new(ResourceType::Texture2D, pixels, &b"rgba8 64x64"[..], 1, "checker"),
        Resource::new(ResourceType::IndexArray, indices, &b"u16"[..], 1, "quad indices"),
        Resource::new(
            ResourceType::Effect,
            &b"void main() { gl_FragColor = vec4(1.0); }"[..],
            &b"uniforms: none"[..],
            1,
            "flat",
        ),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(renderer = %cfg.renderer_addr, resource_dir = %cfg.resource_dir, "Starting client");

    let mut client = SceneClient::connect(&cfg).await.context("connect")?;

    let resources = demo_resources()
        .into_iter()
        .map(|r| client.create_resource(r))
        .collect();
    client.publish_scene(DEMO_SCENE, resources).await?;
    client.show_scene(DEMO_SCENE).await?;

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Client connected, {DEMO_SCENE} published. Type 'status' for info, 'quit' to exit.");
    println!();

    loop {
        while let Ok(line) = console_rx.try_recv() {
            match client.exec_console(&line).await {
                Ok(output) => {
                    for line in output {
                        println!("{line}");
                    }
                }
                Err(e) => println!("Error: {e:#}"),
            }
        }

        client.poll(Duration::from_millis(16)).await?;

        if client.state == ClientState::Disconnected {
            println!("Disconnected from renderer.");
            break;
        }
    }

    Ok(())
}
