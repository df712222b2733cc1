//! Socket-level tests: scene client <-> renderer.

use std::time::Duration;

use scenery_renderer::registry::ResourceStatus;
use scenery_shared::{
    hash::ContentHash,
    net::{
        decode_from_bytes, encode_to_bytes, NetMsg, ReliableConn, ReliableListener, ResourceBlob,
        PROTOCOL_VERSION,
    },
    scene::SceneId,
};
use scenery_tests::{connected_pair, effect, index_array, init_tracing, pump, pump_until, texture};

const SCENE: SceneId = SceneId(7);
const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn protocol_messages_roundtrip() -> anyhow::Result<()> {
    let hello = NetMsg::Hello {
        protocol: PROTOCOL_VERSION,
    };
    assert_eq!(decode_from_bytes(&encode_to_bytes(&hello)?)?, hello);

    let publish = NetMsg::PublishScene {
        scene_id: SCENE,
        resources: vec![ContentHash::new(1, 2), ContentHash::new(3, 4)],
    };
    assert_eq!(decode_from_bytes(&encode_to_bytes(&publish)?)?, publish);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn published_and_shown_scene_gets_uploaded() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, mut client) = connected_pair(|_| {}).await?;

    let resources: Vec<_> = [texture(1), index_array(1), effect(1)]
        .into_iter()
        .map(|r| client.create_resource(r))
        .collect();
    let hashes: Vec<ContentHash> = resources.iter().map(|r| r.hash()).collect();
    client.publish_scene(SCENE, resources).await?;
    client.show_scene(SCENE).await?;

    let uploaded = pump_until(&mut server, &mut client, TIMEOUT, |server, _| {
        hashes
            .iter()
            .all(|h| server.uploading().registry().status(*h) == Some(ResourceStatus::Uploaded))
    })
    .await?;
    assert!(uploaded, "all scene resources should reach the device");

    assert_eq!(client.statistics().resources_sent, 3);
    let stats = server.uploading().statistics();
    assert_eq!(stats.resources_uploaded, 3);
    assert_eq!(stats.effects_compiled, 1);
    // the renderer releases bytes once they are on the device
    assert!(server.resources().resources().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hidden_scene_is_not_requested_until_shown() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, mut client) = connected_pair(|_| {}).await?;

    let tex = client.create_resource(texture(2));
    let hash = tex.hash();
    client.publish_scene(SCENE, vec![tex]).await?;

    pump(&mut server, &mut client, 5).await?;
    assert!(server.is_published(SCENE));
    assert_eq!(server.uploading().registry().status(hash), Some(ResourceStatus::Registered));
    assert_eq!(client.statistics().resources_sent, 0);

    client.show_scene(SCENE).await?;
    let uploaded = pump_until(&mut server, &mut client, TIMEOUT, |server, _| {
        server.uploading().registry().status(hash) == Some(ResourceStatus::Uploaded)
    })
    .await?;
    assert!(uploaded);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unpublish_unloads_everything_but_kept_effects() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, mut client) = connected_pair(|_| {}).await?;

    let tex = client.create_resource(texture(3));
    let fx = client.create_resource(effect(3));
    let (tex_hash, fx_hash) = (tex.hash(), fx.hash());
    client.publish_scene(SCENE, vec![tex, fx]).await?;
    client.show_scene(SCENE).await?;
    assert!(
        pump_until(&mut server, &mut client, TIMEOUT, |server, _| {
            server.uploading().registry().uploaded_resources().len() == 2
        })
        .await?
    );

    client.unpublish_scene(SCENE).await?;
    assert!(
        pump_until(&mut server, &mut client, TIMEOUT, |server, _| {
            !server.is_published(SCENE)
                && !server.uploading().registry().contains_resource(tex_hash)
        })
        .await?
    );
    assert_eq!(
        server.uploading().registry().status(fx_hash),
        Some(ResourceStatus::Uploaded)
    );
    assert_eq!(server.uploading().statistics().resources_unloaded, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn update_adds_and_removes_scene_resources() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, mut client) = connected_pair(|_| {}).await?;

    let first = client.create_resource(index_array(4));
    let first_hash = first.hash();
    client.publish_scene(SCENE, vec![first]).await?;
    client.show_scene(SCENE).await?;
    pump(&mut server, &mut client, 3).await?;

    let second = client.create_resource(index_array(5));
    let second_hash = second.hash();
    client.update_scene(SCENE, vec![second], &[first_hash]).await?;

    assert!(
        pump_until(&mut server, &mut client, TIMEOUT, |server, _| {
            let registry = server.uploading().registry();
            registry.status(second_hash) == Some(ResourceStatus::Uploaded)
                && !registry.contains_resource(first_hash)
        })
        .await?
    );
    assert_eq!(
        server.uploading().registry().resources_in_use_by_scene(SCENE),
        vec![second_hash]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_quit_unpublishes_its_scenes() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, mut client) = connected_pair(|_| {}).await?;

    let tex = client.create_resource(texture(6));
    client.publish_scene(SCENE, vec![tex]).await?;
    pump(&mut server, &mut client, 3).await?;
    assert!(server.is_published(SCENE));

    client.exec_console("quit").await?;
    let gone = pump_until(&mut server, &mut client, TIMEOUT, |server, _| {
        !server.is_published(SCENE)
    })
    .await?;
    assert!(gone);
    assert!(server.uploading().registry().is_empty());
    Ok(())
}

/// Drives the client against a hand-rolled renderer to control message timing.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_honours_cancel_and_reports_unknown_hashes() -> anyhow::Result<()> {
    init_tracing();
    let listener = ReliableListener::bind("127.0.0.1:0".parse()?).await?;
    let cfg = scenery_shared::config::SceneryConfig {
        renderer_addr: listener.local_addr()?.to_string(),
        ..Default::default()
    };

    let fake_renderer = async {
        let (mut conn, _) = listener.accept().await?;
        assert!(matches!(conn.recv().await?, NetMsg::Hello { .. }));
        conn.send(&NetMsg::Welcome {
            client_id: scenery_shared::net::ClientId(99),
        })
        .await?;
        Ok::<_, anyhow::Error>(conn)
    };
    let (conn, client) = tokio::join!(
        fake_renderer,
        scenery_client::SceneClient::connect(&cfg)
    );
    let mut conn = conn?;
    let mut client = client?;

    let tex = client.create_resource(texture(8));
    let hash = tex.hash();
    client.publish_scene(SCENE, vec![tex]).await?;
    assert!(matches!(conn.recv().await?, NetMsg::PublishScene { .. }));

    // request and cancel land in the same poll: nothing is sent
    conn.send(&NetMsg::RequestResources { hashes: vec![hash] }).await?;
    conn.send(&NetMsg::CancelResourceRequests { hashes: vec![hash] })
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.poll(Duration::from_millis(50)).await?;
    assert_eq!(client.statistics().requests_cancelled, 1);
    assert_eq!(client.statistics().resources_sent, 0);

    let unknown = ContentHash::new(0xdead, 0xbeef);
    conn.send(&NetMsg::RequestResources {
        hashes: vec![hash, unknown],
    })
    .await?;
    client.poll(Duration::from_millis(500)).await?;

    match conn.recv().await? {
        NetMsg::ResourceData(blobs) => {
            assert_eq!(blobs.len(), 1);
            assert_eq!(blobs[0].to_resource()?.hash(), hash);
        }
        other => panic!("expected resource data, got {other:?}"),
    }
    assert_eq!(
        conn.recv().await?,
        NetMsg::ResourcesUnavailable {
            hashes: vec![unknown]
        }
    );
    Ok(())
}

/// Talks to a real renderer through a raw connection to send hand-made blobs.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn renderer_rejects_resource_data_with_corrupt_payload() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, cfg) = scenery_renderer::renderer::bind_ephemeral(60).await?;
    let addr: std::net::SocketAddr = cfg.renderer_addr.parse()?;
    let fake_client = async {
        let mut conn = ReliableConn::connect(addr).await?;
        conn.send(&NetMsg::Hello {
            protocol: PROTOCOL_VERSION,
        })
        .await?;
        Ok::<_, anyhow::Error>(conn)
    };
    let (accepted, conn) = tokio::join!(server.accept_one(), fake_client);
    accepted?;
    let mut conn = conn?;
    assert!(matches!(conn.recv().await?, NetMsg::Welcome { .. }));

    let tex = texture(11);
    let hash = tex.hash();
    conn.send(&NetMsg::PublishScene {
        scene_id: SCENE,
        resources: vec![hash],
    })
    .await?;
    conn.send(&NetMsg::ShowScene { scene_id: SCENE }).await?;

    let mut requested = false;
    for _ in 0..50 {
        server.step().await?;
        if server.uploading().registry().status(hash) == Some(ResourceStatus::Requested) {
            requested = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(requested, "renderer should ask for the texture");
    assert_eq!(
        conn.recv().await?,
        NetMsg::RequestResources { hashes: vec![hash] }
    );

    let good = ResourceBlob::from_resource(&tex, false)?;
    let mut corrupt = good.clone();
    if let Some(last) = corrupt.bytes.last_mut() {
        *last ^= 0x01;
    }
    conn.send(&NetMsg::ResourceData(vec![corrupt])).await?;
    for _ in 0..10 {
        server.step().await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        server.uploading().registry().status(hash),
        Some(ResourceStatus::Requested)
    );
    assert_eq!(server.uploading().statistics().resources_uploaded, 0);

    conn.send(&NetMsg::ResourceData(vec![good])).await?;
    let mut uploaded = false;
    for _ in 0..50 {
        server.step().await?;
        if server.uploading().registry().status(hash) == Some(ResourceStatus::Uploaded) {
            uploaded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(uploaded);
    Ok(())
}
