//! Operator read endpoints over a live listener

use agentcom::config::HubConfig;
use agentcom::hub::{Hub, HubDeps, HubStorage};
use agentcom::queue::SubmitParams;
use agentcom::server;
use std::sync::Arc;

#[tokio::test]
async fn healthz_and_stats_respond() {
    let hub = Hub::start(HubConfig::default(), HubStorage::InMemory, HubDeps::default())
        .await
        .unwrap();
    hub.queue()
        .submit(SubmitParams::with_description("visible in stats"))
        .await
        .unwrap();

    let hub = Arc::new(hub);
    let (listener, local) = server::bind("127.0.0.1:0").await.unwrap();
    let router = server::create_router(hub.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    let base = format!("http://{local}");
    let health: serde_json::Value = reqwest::get(format!("{base}/healthz"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let stats: serde_json::Value = reqwest::get(format!("{base}/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["queue"]["by_status"]["queued"], 1);
    assert_eq!(stats["sessions"], 0);
    assert!(stats["agents"].as_array().unwrap().is_empty());
}
