//! Headless renderer smoke tests.

use scenery_renderer::renderer::bind_ephemeral;
use scenery_tests::init_tracing;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn renderer_runs_empty_frames() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, _cfg) = bind_ephemeral(120).await?;
    server.run_for_frames(3).await?;
    assert_eq!(server.frame(), 3);
    assert!(server.uploading().registry().is_empty());
    assert!(!server.should_quit());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn console_commands() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, _cfg) = bind_ephemeral(60).await?;

    let status = server.exec_console("status");
    assert_eq!(status[0], "Frame: 0");
    assert!(status.iter().any(|l| l == "Resources: 0"));

    let stats = server.exec_console("stats");
    assert!(stats[0].starts_with("uploaded 0"), "{stats:?}");
    let json = server.exec_console("stats json");
    assert!(json[0].contains("\"resources_uploaded\":0"), "{json:?}");

    assert_eq!(server.exec_console("fly"), vec!["Unknown command: fly"]);
    assert!(server.exec_console("   ").is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quit_from_console_input_stops_the_loop() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, _cfg) = bind_ephemeral(60).await?;
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    server.set_console_input(rx);

    tx.send("quit".to_string()).await?;
    server.run_for_frames(100).await?;
    assert!(server.should_quit());
    assert_eq!(server.frame(), 1);
    Ok(())
}
