
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use nex_lite::control::{
    Envelope, InfoResponse, PayloadType, PingResponse, RunResponse, TAG_ARCH, TAG_CPUS, TAG_OS,
};
use nex_lite::node::ControlMessage;
use test_harness::{run_request, static_binary, TestNode};

fn decode<T: serde::de::DeserializeOwned>(reply: &[u8]) -> Envelope<T> {
    serde_json::from_slice(reply).unwrap()
}

#[tokio::test]
async fn test_ping_reports_node_state() {
    let node = TestNode::start().await;

    let reply = node.node.handle("$NEX.PING", b"").await.unwrap();
    let envelope: Envelope<PingResponse> = decode(&reply);

    assert_eq!(envelope.payload_type(), PayloadType::Ping);
    let ping = envelope.into_result().unwrap();
    assert_eq!(ping.node_id, "NTESTNODE");
    assert_eq!(ping.version, env!("CARGO_PKG_VERSION"));
    assert_eq!(ping.running_machines, 0);
    assert!(ping.uptime.ends_with('s'));
    assert_eq!(ping.tags.get("zone").map(String::as_str), Some("test"));
    assert!(ping.tags.contains_key(TAG_OS));
    assert!(ping.tags.contains_key(TAG_ARCH));
    assert!(ping.tags.contains_key(TAG_CPUS));
}

#[tokio::test]
async fn test_targeted_ping() {
    let node = TestNode::start().await;

    assert!(node.node.handle("$NEX.PING.NTESTNODE", b"").await.is_some());
    assert!(node.node.handle("$NEX.PING.NSOMEONEELSE", b"").await.is_none());
}

#[tokio::test]
async fn test_messages_for_other_nodes_ignored() {
    let node = TestNode::start().await;
    node.publish("echo", static_binary("x"));
    let payload = serde_json::to_vec(&run_request("WECHO", "echo")).unwrap();

    assert!(node.node.handle("$NEX.INFO.NOTHER", b"").await.is_none());
    assert!(node.node.handle("$NEX.RUN.NOTHER", &payload).await.is_none());
    assert!(node.runtime.dispatches().is_empty());
}

#[tokio::test]
async fn test_unknown_subjects_ignored() {
    let node = TestNode::start().await;

    assert!(node.node.handle("jobs.submit", b"").await.is_none());
    assert!(node.node.handle("$NEX.STOP.NTESTNODE", b"").await.is_none());
    assert!(node.node.handle("$NEX.INFO", b"").await.is_none());
    assert!(node.node.handle("$NEX.PING.", b"").await.is_none());
    assert!(node.node.handle("$NEX.RUN.", b"").await.is_none());
}

#[tokio::test]
async fn test_run_through_control_subject() {
    let node = TestNode::start().await;
    node.publish("echo", static_binary("x"));
    let payload = serde_json::to_vec(&run_request("WECHO", "echo")).unwrap();

    let reply = node.node.handle("$NEX.RUN.NTESTNODE", &payload).await.unwrap();
    let envelope: Envelope<RunResponse> = decode(&reply);

    assert_eq!(envelope.payload_type(), PayloadType::Run);
    let response = envelope.into_result().unwrap();
    assert!(response.started);
    assert_eq!(response.public_key, "WECHO");
}

#[tokio::test]
async fn test_malformed_run_payload() {
    let node = TestNode::start().await;

    let reply = node
        .node
        .handle("$NEX.RUN.NTESTNODE", b"{\"location\": 42}")
        .await
        .unwrap();
    let envelope: Envelope<RunResponse> = decode(&reply);

    assert_eq!(envelope.payload_type(), PayloadType::Run);
    assert!(envelope.error().unwrap().starts_with("Invalid request"));
}

#[tokio::test]
async fn test_reply_has_exactly_one_of_data_or_error() {
    let node = TestNode::start().await;
    node.publish("echo", static_binary("x"));
    let good = serde_json::to_vec(&run_request("WECHO", "echo")).unwrap();
    let bad = serde_json::to_vec(&run_request("WECHO", "missing")).unwrap();

    for payload in [good, bad] {
        let reply = node.node.handle("$NEX.RUN.NTESTNODE", &payload).await.unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        let object = raw.as_object().unwrap();

        assert_eq!(object["type"], "io.nats.nex.v1.run_response");
        assert!(object.contains_key("data") ^ object.contains_key("error"));
    }
}

#[tokio::test]
async fn test_info_lists_machines() {
    let node = TestNode::start().await;
    node.publish("echo", static_binary("x"));

    let mut request = run_request("WECHO", "echo");
    request.description = Some("echo service".to_string());
    let payload = serde_json::to_vec(&request).unwrap();
    let run: Envelope<RunResponse> =
        decode(&node.node.handle("$NEX.RUN.NTESTNODE", &payload).await.unwrap());
    let run = run.into_result().unwrap();

    let reply = node.node.handle("$NEX.INFO.NTESTNODE", b"").await.unwrap();
    let envelope: Envelope<InfoResponse> = decode(&reply);
    assert_eq!(envelope.payload_type(), PayloadType::Info);

    let info = envelope.into_result().unwrap();
    assert_eq!(info.node_id, "NTESTNODE");
    assert_eq!(info.machines.len(), 1);
    let machine = &info.machines[0];
    assert_eq!(machine.id, run.machine_id);
    assert!(machine.healthy);
    assert_eq!(machine.workload.description, "echo service");
    assert_eq!(machine.workload.hash, run.hash);
    assert_eq!(machine.workload.name, "WECHO");

    let ping: Envelope<PingResponse> =
        decode(&node.node.handle("$NEX.PING", b"").await.unwrap());
    assert_eq!(ping.into_result().unwrap().running_machines, 1);
}

async fn request(tx: &mpsc::Sender<ControlMessage>, subject: &str, payload: Vec<u8>) -> Vec<u8> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(ControlMessage {
        subject: subject.to_string(),
        payload,
        reply: Some(reply_tx),
    })
    .await
    .unwrap();
    tokio::time::timeout(Duration::from_secs(5), reply_rx)
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_run_loop_serves_until_shutdown() {
    let node = TestNode::start().await;
    node.publish("echo", static_binary("x"));

    let (tx, rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();
    let serving = tokio::spawn(node.node.clone().run(rx, shutdown.clone()));

    let ping: Envelope<PingResponse> = decode(&request(&tx, "$NEX.PING", Vec::new()).await);
    assert!(!ping.is_error());

    let payload = serde_json::to_vec(&run_request("WECHO", "echo")).unwrap();
    let run: Envelope<RunResponse> = decode(&request(&tx, "$NEX.RUN.NTESTNODE", payload).await);
    assert!(run.into_result().unwrap().started);
    assert_eq!(node.runtime.running(), 1);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .unwrap()
        .unwrap();

    // Shutdown stops every machine the node started
    assert_eq!(node.runtime.running(), 0);
    assert_eq!(node.node.manager.running_machines().await, 0);
}

#[tokio::test]
async fn test_run_loop_handles_requests_concurrently() {
    let node = TestNode::start_with(|config| {
        let mut config = config;
        config.max_concurrent_requests = 8;
        config
    })
    .await;
    for i in 0..20 {
        node.publish(&format!("w-{}", i), static_binary(&format!("w-{}", i)));
    }

    let (tx, rx) = mpsc::channel(64);
    let serving = tokio::spawn(node.node.clone().run(rx, CancellationToken::new()));

    let mut replies = Vec::new();
    for i in 0..20 {
        let (reply_tx, reply_rx) = oneshot::channel();
        let payload = serde_json::to_vec(&run_request(&format!("W{}", i), &format!("w-{}", i))).unwrap();
        tx.send(ControlMessage {
            subject: "$NEX.RUN.NTESTNODE".to_string(),
            payload,
            reply: Some(reply_tx),
        })
        .await
        .unwrap();
        replies.push(reply_rx);
    }
    // A closed channel ends the loop once in-flight requests drain
    drop(tx);

    for reply in replies {
        let envelope: Envelope<RunResponse> = decode(&reply.await.unwrap());
        assert!(!envelope.is_error(), "{:?}", envelope.error());
    }
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(node.runtime.dispatches().len(), 20);
    assert_eq!(node.staging_files(), 0);
}

#[tokio::test]
async fn test_run_loop_skips_unaddressed_messages() {
    let node = TestNode::start().await;
    let (tx, rx) = mpsc::channel(16);
    let serving = tokio::spawn(node.node.clone().run(rx, CancellationToken::new()));

    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(ControlMessage {
        subject: "$NEX.INFO.NOTHER".to_string(),
        payload: Vec::new(),
        reply: Some(reply_tx),
    })
    .await
    .unwrap();

    // No reply is sent; the sender is dropped with the task
    assert!(reply_rx.await.is_err());

    drop(tx);
    serving.await.unwrap();
}

#[tokio::test]
async fn test_exited_machines_are_not_reported_running() {
    let node = TestNode::start().await;
    node.publish("echo", static_binary("x"));

    let mut machine_ids = Vec::new();
    for identity in ["WFIRST", "WSECOND"] {
        let payload = serde_json::to_vec(&run_request(identity, "echo")).unwrap();
        let run: Envelope<RunResponse> =
            decode(&node.node.handle("$NEX.RUN.NTESTNODE", &payload).await.unwrap());
        machine_ids.push(run.into_result().unwrap().machine_id);
    }

    node.runtime.crash(&machine_ids[0]);

    let ping: Envelope<PingResponse> = decode(&node.node.handle("$NEX.PING", b"").await.unwrap());
    assert_eq!(ping.into_result().unwrap().running_machines, 1);

    let info: Envelope<InfoResponse> =
        decode(&node.node.handle("$NEX.INFO.NTESTNODE", b"").await.unwrap());
    let info = info.into_result().unwrap();
    assert_eq!(info.machines.len(), 1);
    assert_eq!(info.machines[0].id, machine_ids[1]);
    assert!(info.machines[0].healthy);

    // The exited machine was released back to the runtime
    assert_eq!(node.runtime.exited(), 0);
    assert!(info.machines.iter().all(|m| m.id != machine_ids[0]));
}
