//! Multi-agent scenarios over the in-process broker

use agent_mesh::coordinator::HelpOptions;
use agent_mesh::transport::{MemoryBackend, MemoryBroker};
use agent_mesh::{
    AgentCapabilities, AgentNetworkClient, ConnectionStatus, MessageKind, NetworkConfig, RequestStatus,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};

fn fast_config(url: &str) -> NetworkConfig {
    let mut config = NetworkConfig::default();
    config.transport.url = url.to_string();
    config.transport.channel = "team".to_string();
    config.transport.max_connect_attempts = 50;
    config.transport.base_delay_ms = 10;
    config.transport.max_delay_ms = 40;
    config.transport.health_check_interval_ms = 25;
    config.client.shutdown_grace_ms = 100;
    config
}

fn agent(id: &str, caps: &[&str]) -> AgentCapabilities {
    AgentCapabilities::new(id, caps, Vec::<String>::new()).unwrap()
}

fn on_broker(id: &str, caps: &[&str], broker: &Arc<MemoryBroker>) -> AgentNetworkClient {
    AgentNetworkClient::with_backend(
        agent(id, caps),
        fast_config(&format!("memory://{}", broker.name())),
        Arc::new(MemoryBackend::new(broker.clone())),
    )
}

async fn eventually<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(Duration::from_secs(3), async {
        while !check().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn test_clients_built_from_url_share_named_broker() {
    let url = "memory://network-test-named";
    let alice = AgentNetworkClient::new(agent("alice", &["python"]), fast_config(url)).unwrap();
    let bob = AgentNetworkClient::new(agent("bob", &["rust"]), fast_config(url)).unwrap();
    assert!(alice.connect().await);
    assert!(bob.connect().await);

    let (a, b) = (&alice, &bob);
    assert!(eventually(|| async move { a.registry().get_agent("bob").await.is_some() }).await);
    assert!(eventually(|| async move { b.registry().get_agent("alice").await.is_some() }).await);

    alice.disconnect().await;
    bob.disconnect().await;
}

#[tokio::test]
async fn test_trust_follows_outcomes() {
    let broker = MemoryBroker::new("network-test-trust");
    let asker = on_broker("asker", &["writing"], &broker);
    let good = on_broker("good", &["python"], &broker);
    let flaky = on_broker("flaky", &["python"], &broker);
    for c in [&asker, &good, &flaky] {
        assert!(c.connect().await);
    }
    let a = &asker;
    assert!(eventually(|| async move { a.registry().len().await == 2 }).await);

    for (helper, success) in [(&good, true), (&flaky, false)] {
        let request_id = asker
            .request_help(&["python"], "Fix my script", HelpOptions::default())
            .await
            .unwrap()
            .unwrap();
        let id = request_id.as_str();
        assert!(eventually(|| async move { helper.coordinator().get_request(id).await.is_some() }).await);
        helper
            .respond_to_help(id, "On it", &["python"], 5, 0.8)
            .await
            .unwrap()
            .unwrap();
        assert!(eventually(|| async move { a.best_responses(id, 5).await.len() == 1 }).await);
        assert!(asker.select_helper(id, helper.agent_id()).await);
        assert!(asker.complete_help_request(id, success, None).await);
        let status = asker.coordinator().get_request(id).await.unwrap().status;
        assert_eq!(status, if success { RequestStatus::Completed } else { RequestStatus::Failed });
    }

    let good_trust = asker.registry().get_agent("good").await.unwrap().trust_score;
    let flaky_trust = asker.registry().get_agent("flaky").await.unwrap().trust_score;
    assert!(good_trust > 0.5, "good trust {}", good_trust);
    assert!(flaky_trust < 0.5, "flaky trust {}", flaky_trust);

    let ranked = asker.find_best_agents(&["python"], 5).await;
    let order: Vec<&str> = ranked.iter().map(|m| m.agent.agent_id()).collect();
    assert_eq!(order, vec!["good", "flaky"]);

    for c in [&asker, &good, &flaky] {
        c.disconnect().await;
    }
}

#[tokio::test]
async fn test_expired_request_cannot_be_assigned() {
    let broker = MemoryBroker::new("network-test-expiry");
    let asker = on_broker("asker", &["writing"], &broker);
    let helper = on_broker("helper", &["python"], &broker);
    assert!(asker.connect().await);
    assert!(helper.connect().await);

    let options = HelpOptions {
        timeout_minutes: Some(1),
        ..Default::default()
    };
    let request_id = asker
        .request_help(&["python"], "Quick question", options)
        .await
        .unwrap()
        .unwrap();
    let id = request_id.as_str();
    let h = &helper;
    assert!(eventually(|| async move { h.coordinator().get_request(id).await.is_some() }).await);
    helper
        .respond_to_help(id, "Sure", &["python"], 1, 0.9)
        .await
        .unwrap()
        .unwrap();
    let a = &asker;
    assert!(eventually(|| async move { a.best_responses(id, 1).await.len() == 1 }).await);

    let report = asker
        .coordinator()
        .sweep_at(Utc::now() + ChronoDuration::minutes(2))
        .await;
    assert_eq!(report.timed_out, 1);
    assert_eq!(
        asker.coordinator().get_request(id).await.unwrap().status,
        RequestStatus::Timeout
    );
    assert!(!asker.select_helper(id, "helper").await);

    asker.disconnect().await;
    helper.disconnect().await;
}

#[tokio::test]
async fn test_recovers_after_broker_outage() {
    let broker = MemoryBroker::new("network-test-outage");
    let alice = on_broker("alice", &["python"], &broker);
    let bob = on_broker("bob", &["rust"], &broker);

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    bob.register_message_handler(MessageKind::Message, Some("alice"), move |_envelope| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        }
    });

    assert!(alice.connect().await);
    assert!(bob.connect().await);

    broker.set_available(false);
    let (a, b) = (&alice, &bob);
    assert!(eventually(|| async move { b.transport().status() != ConnectionStatus::Connected }).await);
    assert!(!alice.send_simple_message("lost", None).await.unwrap());

    broker.set_available(true);
    let brk = &broker;
    assert!(
        eventually(|| async move {
            a.transport().status() == ConnectionStatus::Connected
                && b.transport().status() == ConnectionStatus::Connected
                && brk.subscriber_count("team") == 2
        })
        .await
    );
    assert!(bob.transport().reconnect_count() >= 1);

    assert!(alice.send_simple_message("back again", None).await.unwrap());
    let count = &received;
    assert!(eventually(|| async move { count.load(Ordering::SeqCst) == 1 }).await);

    alice.disconnect().await;
    bob.disconnect().await;
}

#[tokio::test]
async fn test_discovery_answers_only_matching_agents() {
    let broker = MemoryBroker::new("network-test-discovery");
    let seeker = on_broker("seeker", &["writing"], &broker);
    let pythonista = on_broker("pythonista", &["python"], &broker);
    let gopher = on_broker("gopher", &["go"], &broker);

    let responses = Arc::new(AtomicUsize::new(0));
    let counter = responses.clone();
    seeker.register_message_handler(MessageKind::CapabilityResponse, None, move |envelope| {
        let counter = counter.clone();
        async move {
            anyhow::ensure!(envelope.target.as_deref() == Some("seeker"), "untargeted response");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    // Join the others first so the seeker's startup scan reaches them
    assert!(pythonista.connect().await);
    assert!(gopher.connect().await);
    assert!(seeker.connect().await);
    let s = &seeker;
    assert!(eventually(|| async move { s.registry().len().await == 2 }).await);

    sleep(Duration::from_millis(50)).await;
    let before = responses.load(Ordering::SeqCst);
    let found = seeker.discover_agents(&["python"]).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].agent.agent_id(), "pythonista");

    let count = &responses;
    assert!(eventually(|| async move { count.load(Ordering::SeqCst) == before + 1 }).await);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(responses.load(Ordering::SeqCst), before + 1);

    for c in [&seeker, &pythonista, &gopher] {
        c.disconnect().await;
    }
}
