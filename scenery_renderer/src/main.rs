//! Standalone renderer binary.
//!
//! Usage:
//!   cargo run -p scenery_renderer -- [--config scenery.json] [--addr 127.0.0.1:41000]
//!       [--frame-hz 60] [--cache-size bytes] [--resource-file path.res]...
//!
//! Console commands:
//!   status - Scenes, resources per status, uploaded bytes
//!   stats  - Upload statistics (`stats json` for machine-readable output)
//!   quit   - Shutdown renderer

use std::env;
use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use scenery_renderer::RendererServer;
use scenery_shared::{
    config::SceneryConfig,
    render::{NullBackend, NullShaderCompiler},
};
use tokio::sync::mpsc;
use tracing::{info, warn};

struct Args {
    cfg: SceneryConfig,
    resource_files: Vec<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = SceneryConfig::default();
    let mut resource_files = Vec::new();
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
            "--frame-hz" if i + 1 < args.len() => {
                cfg.frame_hz = args[i + 1].parse().unwrap_or(60);
                i += 2;
            }
            "--cache-size" if i + 1 < args.len() => {
                cfg.display.gpu_cache_size = args[i + 1].parse().context("parse --cache-size")?;
                i += 2;
            }
            "--resource-file" if i + 1 < args.len() => {
                resource_files.push(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(Args {
        cfg,
        resource_files,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args {
        cfg,
        resource_files,
    } = parse_args()?;
    info!(addr = %cfg.renderer_addr, frame_hz = cfg.frame_hz, cache = cfg.display.gpu_cache_size, "Starting renderer");

    let mut server = RendererServer::new(
        cfg.clone(),
        Box::new(NullBackend::new()),
        Box::new(NullShaderCompiler::default()),
    )
    .await
    .context("create renderer")?;
    for path in &resource_files {
        match server.open_resource_file(path) {
            Ok(handle) => info!(path = %path.display(), ?handle, "resource file opened"),
            Err(e) => warn!(path = %path.display(), error = %e, "cannot open resource file"),
        }
    }
    let local = server.local_addr()?;
    info!(%local, "Renderer listening");

    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

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

    println!("Renderer ready. Type 'status', 'stats' or 'quit'.");
    println!();

    let frame_interval = std::time::Duration::from_secs_f32(1.0 / cfg.frame_hz.max(1) as f32);
    let mut next_frame = tokio::time::Instant::now();

    while !server.should_quit() {
        if let Ok(Some(cid)) = server.try_accept(std::time::Duration::from_millis(1)).await {
            info!(client_id = ?cid, "New client accepted");
        }
        server.step().await?;

        next_frame += frame_interval;
        tokio::time::sleep_until(next_frame).await;
    }
    Ok(())
}
