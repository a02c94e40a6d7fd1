use std::time::Duration;

use fleetsync::sync::{SyncConfig, SyncSession};
use fleetsync::transport::{ActionOutcome, InMemoryTransport, PushMessage};
use serde_json::json;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    // A scriptable transport stands in for the fleet backend.
    let transport = InMemoryTransport::new();
    transport.seed_page(
        "vehicle",
        vec![
            json!({"id": "V1", "speed": 62, "status": "moving", "driver": "Sam"}),
            json!({"id": "V2", "speed": 0, "status": "parked"}),
        ],
    );
    transport.seed_page(
        "alert",
        vec![json!({"id": "A1", "severity": "high", "status": "OPEN", "vehicle_id": "V1"})],
    );
    transport.queue_action_outcome(ActionOutcome::ok_with_record(
        json!({"id": "A1", "severity": "high", "status": "RESOLVED", "vehicle_id": "V1"}),
    ));
    let push = transport.push_sender();

    let session = SyncSession::builder()
        .transport(transport.clone())
        .config(SyncConfig {
            poll_interval: Duration::from_millis(200),
            streaming_poll_interval: Some(Duration::from_millis(200)),
            ..SyncConfig::default()
        })
        .build()?;

    let _vehicles = session.subscribe("vehicle", None, |change| {
        dbg!(&change.ids);
    });
    session.watch("vehicle")?;
    session.watch("alert")?;

    std::thread::sleep(Duration::from_millis(300));
    println!("vehicles: {:?}", session.project_all("vehicle"));

    // A push event updates V1 between polls.
    push.send(PushMessage {
        event: "updated".to_string(),
        kind: "vehicle".to_string(),
        id: "V1".to_string(),
        payload: json!({"speed": 71}),
    })?;

    // Resolve the alert optimistically; the scripted response confirms it.
    session.submit_action(
        "alert",
        "A1",
        "resolve",
        json!({"status": "RESOLVED"}).as_object().cloned().unwrap(),
    )?;
    println!("alert right away: {:?}", session.project("alert", "A1"));

    std::thread::sleep(Duration::from_millis(500));
    println!("alert settled: {:?}", session.project("alert", "A1"));
    println!("mutation state: {:?}", session.mutation_state("alert", "A1"));
    println!("diagnostics: {:?}", session.diagnostics());

    session.dispose();
    Ok(())
}
