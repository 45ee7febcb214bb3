//! Live platform tests
//!
//! Ignored by default. Run with a real device identity:
//!
//! ```text
//! CLOUDPLUGS_BROKER=mqtts://api.cloudplugs.com \
//! CLOUDPLUGS_PLUG_ID=dev-... CLOUDPLUGS_PASSWORD=... \
//! cargo test --test test_live_broker -- --ignored
//! ```

use cloudplugs_mqtt::config::BrokerSection;
use cloudplugs_mqtt::{ClientConfig, ClientError, CloudPlugsClient, SinkEvent};
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;

fn live_config() -> Option<ClientConfig> {
    let plug_id = std::env::var("CLOUDPLUGS_PLUG_ID").ok()?;
    let password = std::env::var("CLOUDPLUGS_PASSWORD").ok()?;
    let mut config = ClientConfig::with_credentials(plug_id, password);
    if let Ok(url) = std::env::var("CLOUDPLUGS_BROKER") {
        config.broker = BrokerSection::from_url(&url).expect("CLOUDPLUGS_BROKER must be a broker URL");
    }
    Some(config)
}

#[tokio::test]
#[ignore = "requires CloudPlugs credentials"]
async fn test_live_publish_and_receive_own_data() {
    let Some(config) = live_config() else {
        eprintln!("CLOUDPLUGS_PLUG_ID / CLOUDPLUGS_PASSWORD not set; skipping");
        return;
    };
    let client = CloudPlugsClient::new(config).unwrap();
    client.connect().await.unwrap();
    let mut messages = client.message_channel();

    client.subscribe("rust-client-test").await.unwrap();
    client
        .publish("rust-client-test", r#"{"check": true}"#)
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(10), messages.recv())
        .await
        .expect("Published data should come back within 10s");
    assert!(matches!(event, Some(SinkEvent::Message(_))));

    client.disconnect().await.unwrap();
}

#[tokio::test]
#[ignore = "requires CloudPlugs credentials"]
async fn test_live_property_round_trip() {
    let Some(config) = live_config() else {
        eprintln!("CLOUDPLUGS_PLUG_ID / CLOUDPLUGS_PASSWORD not set; skipping");
        return;
    };
    let client = CloudPlugsClient::new(config).unwrap();
    client.connect().await.unwrap();

    client
        .set_property("rust_client_test", json!({"ok": true}))
        .await
        .unwrap();
    let value = client.get_property("rust_client_test").await.unwrap();
    assert_eq!(value, json!({"ok": true}));

    client.disconnect().await.unwrap();
}

#[tokio::test]
#[ignore = "requires network access"]
async fn test_wrong_password_is_auth_error() {
    let Ok(plug_id) = std::env::var("CLOUDPLUGS_PLUG_ID") else {
        return;
    };
    let mut config = ClientConfig::with_credentials(plug_id, "definitely-wrong".to_string());
    if let Ok(url) = std::env::var("CLOUDPLUGS_BROKER") {
        config.broker = BrokerSection::from_url(&url).unwrap();
    }
    let client = CloudPlugsClient::new(config).unwrap();

    let result = client.connect().await;

    assert!(matches!(result, Err(ClientError::Auth { .. })));
    assert!(!client.is_connected());
}
