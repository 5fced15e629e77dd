//! Manager scenarios driven by fake workers and components

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use mediaplanet::config::document::ComponentConfig;
use mediaplanet::config::{ManagerConfig, PlanetDocument};
use mediaplanet::manager::{testing, Manager};
use mediaplanet::rpc::{ComponentCall, LoopbackPeer};
use mediaplanet::state::{MessageLevel, Mood};
use pretty_assertions::assert_eq;
use serde_json::Value;

fn producer() -> ComponentConfig {
    let mut config = ComponentConfig::new("f", "prod", "videotest-producer");
    config.worker = Some("w1".into());
    config.feed = vec!["default".into()];
    config
}

fn encoder() -> ComponentConfig {
    let mut config = ComponentConfig::new("f", "enc", "theora-encoder");
    config.worker = Some("w2".into());
    config.eater = BTreeMap::from([(
        "default".to_string(),
        vec![("prod:default".to_string(), "default-prime".to_string())],
    )]);
    config
}

/// Bring up `prod` on w1 at 10.0.0.1 and `enc` on w2 at `encoder_host`
async fn wire(encoder_host: &str) -> (Arc<Manager>, Vec<LoopbackPeer>, LoopbackPeer) {
    let manager = Manager::new(ManagerConfig::default());
    let w1 = testing::worker(&manager, "w1", "10.0.0.1", Some(8600), vec![]).await.unwrap();
    let w2 = testing::worker(&manager, "w2", encoder_host, Some(8601), vec![]).await.unwrap();
    let prod = testing::component(&manager, &producer(), "10.0.0.1", testing::job(Mood::Happy, "w1"), None).await.unwrap();
    let enc = testing::component(&manager, &encoder(), encoder_host, testing::job(Mood::Waking, "w2"), None).await.unwrap();
    (manager, vec![w1, w2, prod], enc)
}

#[tokio::test(start_paused = true)]
async fn test_silent_worker_is_dropped_and_its_components_lost() {
    let manager = Manager::new(ManagerConfig::default());
    let start = tokio::time::Instant::now();

    let worker = testing::worker(&manager, "w1", "10.0.0.1", Some(8600), vec![]).await.unwrap();
    let prod = testing::component(&manager, &producer(), "10.0.0.1", testing::job(Mood::Happy, "w1"), None).await.unwrap();
    assert_eq!(manager.component("/f/prod").unwrap().mood, Mood::Happy);

    let transport = worker.remote().clone();
    let prod_transport = prod.remote().clone();
    testing::ignore_all(worker);
    // The component itself stays responsive
    testing::answer_all(prod);

    transport.closed().await;
    assert_eq!(start.elapsed(), Duration::from_millis(12_500));

    while manager.is_worker_logged_in("w1") {
        tokio::task::yield_now().await;
    }
    assert!(manager.workers().is_empty());
    assert_eq!(manager.component("/f/prod").unwrap().mood, Mood::Lost);
    assert_eq!(manager.component("/f/prod").unwrap().worker_name, None);
    prod_transport.closed().await;
    assert!(!manager.is_component_attached("/f/prod"));
}

#[tokio::test]
async fn test_eater_wired_to_provider_once() {
    let (_manager, _peers, mut enc) = wire("10.0.0.2").await;

    let call = enc.next_call().await.unwrap();
    assert_eq!(
        call.decode::<ComponentCall>().unwrap(),
        ComponentCall::EatFrom {
            eater_alias: "default-prime".into(),
            full_feed_id: "/f/prod:default".into(),
            host: "10.0.0.1".into(),
            port: 8600,
        }
    );
    call.respond(Value::Null);

    let again = tokio::time::timeout(Duration::from_millis(200), enc.next_call()).await;
    assert!(again.is_err(), "eatFrom issued more than once");
}

#[tokio::test]
async fn test_shared_host_is_rewritten_to_loopback() {
    let (_manager, _peers, mut enc) = wire("10.0.0.1").await;

    let call = enc.next_call().await.unwrap();
    match call.decode::<ComponentCall>().unwrap() {
        ComponentCall::EatFrom { host, port, .. } => {
            assert_eq!(host, "127.0.0.1");
            assert_eq!(port, 8600);
        }
        other => panic!("unexpected {:?}", other),
    }
    call.respond(Value::Null);
}

const PLANET: &str = r#"
[[flow]]
name = "f1"

[[flow.component]]
name = "c1"
type = "videotest-producer"

[flow.component.properties]
width = 320
"#;

#[tokio::test]
async fn test_conflicting_reload_leaves_running_component_alone() {
    let manager = Manager::new(ManagerConfig::default());
    let document = PlanetDocument::from_toml_str(PLANET).unwrap();
    manager.load_configuration(&document).unwrap();

    let config = document.component_configs().remove(0);
    let _c1 = testing::component(&manager, &config, "10.0.0.1", testing::job(Mood::Happy, "w1"), None).await.unwrap();
    assert_eq!(manager.component("/f1/c1").unwrap().mood, Mood::Happy);
    let before = manager.planet_document();

    manager
        .load_configuration_str(&PLANET.replace("width = 320", "width = 640"))
        .unwrap();

    assert_eq!(manager.planet_document(), before);
    let warning = manager.planet_message("loadComponent-/f1/c1").unwrap();
    assert_eq!(warning.level, MessageLevel::Warning);
    assert!(warning.debug.unwrap().contains("width"));
}
