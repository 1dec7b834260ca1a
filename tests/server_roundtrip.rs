use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use multiverse_connector::config::RetrySection;
use multiverse_connector::server::{self, World};
use multiverse_connector::transport::TcpConnector;
use multiverse_connector::{
    AttributeValue, MemoryScene, ObjectDeclaration, ObjectKind, SyncConfig, SyncEngine, SyncError,
    SyncStatus,
};

const TICK: Duration = Duration::from_millis(16);

fn robot(attributes: &[&str]) -> ObjectDeclaration {
    ObjectDeclaration::new("robot1", ObjectKind::ArticulatedJoint, attributes.iter().copied())
}

fn cup(attributes: &[&str]) -> ObjectDeclaration {
    ObjectDeclaration::new("cup", ObjectKind::RigidBody, attributes.iter().copied())
}

fn config(address: &str, send: Vec<ObjectDeclaration>, receive: Vec<ObjectDeclaration>) -> SyncConfig {
    SyncConfig {
        server_address: address.to_string(),
        timeout_ms: 200,
        failure_threshold: 2,
        retry: RetrySection {
            max_attempts: 40,
            initial_delay_ms: 10,
            backoff_multiplier: 2.0,
            max_delay_ms: 50,
        },
        send,
        receive,
        ..Default::default()
    }
}

fn client(config: SyncConfig) -> Result<(SyncEngine, MemoryScene)> {
    let scene = MemoryScene::from_declarations(config.send.iter().chain(&config.receive));
    let mut engine = SyncEngine::new(config, TcpConnector)?;
    engine.connect()?;
    Ok((engine, scene))
}

/// Tick on a blocking thread until `want` or `max_ticks`, sleeping a little
/// between ticks so the server side can make progress.
async fn tick_until(
    mut engine: SyncEngine,
    mut scene: MemoryScene,
    want: SyncStatus,
    max_ticks: usize,
) -> Result<(SyncEngine, MemoryScene, bool)> {
    let reached = tokio::task::spawn_blocking(move || {
        for _ in 0..max_ticks {
            if engine.on_tick(&mut scene, TICK) == want {
                return (engine, scene, true);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        (engine, scene, false)
    })
    .await?;
    Ok(reached)
}

/// A few plain ticks so one more exchange lands
async fn settle(mut engine: SyncEngine, mut scene: MemoryScene) -> Result<(SyncEngine, MemoryScene)> {
    let settled = tokio::task::spawn_blocking(move || {
        for _ in 0..3 {
            engine.on_tick(&mut scene, TICK);
            std::thread::sleep(Duration::from_millis(5));
        }
        (engine, scene)
    })
    .await?;
    Ok(settled)
}

async fn finish(mut engine: SyncEngine) -> Result<()> {
    tokio::task::spawn_blocking(move || engine.shutdown()).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn robot_publishes_pose_and_receives_joint() -> Result<()> {
    let server = server::bind("127.0.0.1:0").await?;
    let world = server.world();
    world.set("robot1", ObjectKind::ArticulatedJoint, "joint1", 0.75);

    let (engine, mut scene) = client(config(
        &server.address(),
        vec![robot(&["position"])],
        vec![robot(&["joint1"])],
    ))?;
    scene.set("robot1", "position", [1.0, 2.0, 3.0]);

    let (engine, scene, synced) = tick_until(engine, scene, SyncStatus::Synchronizing, 50).await?;
    assert!(synced, "never synchronized: {:?}", engine.last_error());
    let (engine, scene) = settle(engine, scene).await?;

    let stored = world.get("robot1").expect("robot1 in world");
    assert_eq!(stored.get("position"), Some(&AttributeValue::Vector3([1.0, 2.0, 3.0])));
    assert_eq!(world.owner("robot1", "position"), Some(engine.client_id()));

    let robot = scene.get("robot1").expect("robot1 in scene");
    assert_eq!(robot.get("joint1"), Some(&AttributeValue::Scalar(0.75)));
    assert!(engine.remote_sim_time().is_some());

    finish(engine).await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_publisher_is_refused_until_first_leaves() -> Result<()> {
    let server = server::bind("127.0.0.1:0").await?;
    let world = server.world();

    let (first, first_scene) = client(config(&server.address(), vec![cup(&["position"])], vec![]))?;
    let (first, _first_scene, synced) =
        tick_until(first, first_scene, SyncStatus::Synchronizing, 50).await?;
    assert!(synced);

    let (second, second_scene) =
        client(config(&server.address(), vec![cup(&["position"])], vec![]))?;
    let (mut second, second_scene, failed) =
        tick_until(second, second_scene, SyncStatus::Failed, 50).await?;
    assert!(failed);
    assert!(
        matches!(second.last_error(), Some(SyncError::HandshakeMismatch(_))),
        "{:?}",
        second.last_error()
    );

    finish(first).await?;
    let deadline = Instant::now() + Duration::from_secs(3);
    while world.owner("cup", "position").is_some() {
        assert!(Instant::now() < deadline, "ownership never released");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    second.reconnect()?;
    let (second, _second_scene, synced) =
        tick_until(second, second_scene, SyncStatus::Synchronizing, 50).await?;
    assert!(synced, "{:?}", second.last_error());
    assert_eq!(world.owner("cup", "position"), Some(second.client_id()));

    finish(second).await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_server_never_blocks_a_tick() -> Result<()> {
    // Accepts connections and never answers
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let address = format!("tcp://{}", listener.local_addr()?);
    std::thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming().flatten() {
            held.push(stream);
        }
    });

    let mut settings = config(&address, vec![robot(&["position"])], vec![]);
    settings.timeout_ms = 50;
    settings.retry = RetrySection {
        max_attempts: 2,
        initial_delay_ms: 10,
        backoff_multiplier: 1.0,
        max_delay_ms: 10,
    };
    let (mut engine, mut scene) = client(settings)?;

    let engine = tokio::task::spawn_blocking(move || {
        for _ in 0..100 {
            let started = Instant::now();
            let status = engine.on_tick(&mut scene, TICK);
            assert!(
                started.elapsed() < Duration::from_millis(500),
                "tick took {:?}",
                started.elapsed()
            );
            if status == SyncStatus::Failed {
                break;
            }
        }
        engine
    })
    .await?;

    assert_eq!(engine.status(), SyncStatus::Failed);
    assert!(matches!(
        engine.last_error(),
        Some(SyncError::RetriesExhausted { .. })
    ));
    finish(engine).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumes_after_server_restart() -> Result<()> {
    let world = Arc::new(World::new());
    let server = server::bind_with_world("127.0.0.1:0", world.clone()).await?;
    let bind_addr = server.local_addr().to_string();

    let (engine, mut scene) = client(config(
        &server.address(),
        vec![robot(&["position"])],
        vec![robot(&["joint1"])],
    ))?;
    scene.set("robot1", "position", [0.5, 0.0, 0.0]);
    let (engine, scene, synced) = tick_until(engine, scene, SyncStatus::Synchronizing, 50).await?;
    assert!(synced);

    server.shutdown().await;
    let (engine, mut scene, degraded) = tick_until(engine, scene, SyncStatus::Degraded, 50).await?;
    assert!(degraded, "{:?}", engine.status());

    let server = server::bind_with_world(&bind_addr, world.clone()).await?;
    world.set("robot1", ObjectKind::ArticulatedJoint, "joint1", -1.25);
    scene.set("robot1", "position", [0.5, 0.5, 0.0]);

    let (engine, scene, synced) = tick_until(engine, scene, SyncStatus::Synchronizing, 200).await?;
    assert!(synced, "{:?}", engine.last_error());
    let (engine, scene) = settle(engine, scene).await?;

    let robot = scene.get("robot1").expect("robot1 in scene");
    assert_eq!(robot.get("joint1"), Some(&AttributeValue::Scalar(-1.25)));
    assert_eq!(
        world.get("robot1").and_then(|r| r.get("position").cloned()),
        Some(AttributeValue::Vector3([0.5, 0.5, 0.0]))
    );

    finish(engine).await?;
    server.shutdown().await;
    Ok(())
}
