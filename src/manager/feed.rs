//! Feed graph wiring
//!
//! When a component attaches it is connected to the feeds it eats, and
//! every attached eater waiting on one of its feeds is connected to it.
//! In pull mode the eater is told to `eatFrom` the provider's worker feed
//! server; in push mode the provider is told to `feedTo` the eater's.
//!
//! Each `(alias, feed)` of an eater is wired once per provider session, so
//! a provider that re-attaches gets its eaters wired again.

use serde_json::Value;

use super::component::ComponentAvatar;
use super::{Manager, ManagerInner};
use crate::config::constants::{DEFAULT_FEED, LOCALHOST};
use crate::config::document::avatar_id;
use crate::config::FeedMode;
use crate::error::Result;
use crate::rpc::message::ComponentCall;
use crate::rpc::RemoteRef;
use crate::state::{Message, Mood};

/// One planned feed connection
struct FeedLink {
    eater_id: String,
    provider_session: u64,
    alias: String,
    feed: String,
    target: RemoteRef,
    call: ComponentCall,
}

/// `(providerId, feedName)` a configured feed reference points at
fn resolve_feed(inner: &ManagerInner, eater: &ComponentAvatar, feed: &str) -> Option<(String, String)> {
    let config = eater.config.as_ref()?;

    let virtual_provider = inner.components.attached().into_iter().find_map(|avatar| {
        let feeder = avatar.config.as_ref()?.virtual_feeds.get(feed)?;
        Some((avatar.avatar_id.clone(), feeder.clone()))
    });
    if virtual_provider.is_some() {
        return virtual_provider;
    }

    let (component, feed_name) = feed.split_once(':').unwrap_or((feed, DEFAULT_FEED));
    Some((avatar_id(&config.parent, component), feed_name.to_string()))
}

/// Use loopback when both ends share a host
fn route(host: String, from: &str) -> String {
    if host == from {
        LOCALHOST.to_string()
    } else {
        host
    }
}

impl ManagerInner {
    /// Links for `eater`, limited to feeds served by `provider` if given
    fn plan_eater(&self, eater: &ComponentAvatar, provider: Option<&str>, mode: FeedMode) -> Vec<FeedLink> {
        let Some(config) = eater.config.as_ref() else {
            return Vec::new();
        };
        let mut links = Vec::new();

        for (alias, feed) in config.eaten_feeds() {
            let Some((provider_id, feed_name)) = resolve_feed(self, eater, feed) else {
                continue;
            };
            if provider.is_some_and(|p| p != provider_id) || provider_id == eater.avatar_id {
                continue;
            }
            let Some(feeder) = self
                .components
                .get(&provider_id)
                .filter(|a| a.is_attached())
            else {
                tracing::debug!(eater = %eater.avatar_id, feed = feed, "Feed provider not attached yet");
                continue;
            };
            let key = (alias.to_string(), feed.to_string());
            if eater.wired.get(&key) == Some(&feeder.session) {
                continue;
            }
            let Some((host, port)) = feeder
                .worker_name
                .as_deref()
                .and_then(|w| self.workers.feed_server(w))
            else {
                tracing::debug!(eater = %eater.avatar_id, provider = %provider_id, "Feed server of provider unknown");
                continue;
            };

            let full_feed_id = format!("{}:{}", provider_id, feed_name);
            let (target, call) = match mode {
                FeedMode::Pull => (
                    eater.remote.clone(),
                    ComponentCall::EatFrom {
                        eater_alias: alias.to_string(),
                        full_feed_id,
                        host: route(host, &eater.remote.host()),
                        port,
                    },
                ),
                FeedMode::Push => {
                    let Some((eater_host, eater_port)) = eater
                        .worker_name
                        .as_deref()
                        .and_then(|w| self.workers.feed_server(w))
                    else {
                        tracing::debug!(eater = %eater.avatar_id, "Feed server of eater unknown");
                        continue;
                    };
                    (
                        feeder.remote.clone(),
                        ComponentCall::FeedTo {
                            feeder_name: feed_name,
                            full_feed_id: format!("{}:{}", eater.avatar_id, alias),
                            host: route(eater_host, &feeder.remote.host()),
                            port: eater_port,
                        },
                    )
                }
            };
            links.push(FeedLink {
                eater_id: eater.avatar_id.clone(),
                provider_session: feeder.session,
                alias: alias.to_string(),
                feed: feed.to_string(),
                target,
                call,
            });
        }
        links
    }

    /// Everything to wire now that `id` attached; marks the links wired
    fn plan_feeds(&mut self, id: &str, session: u64, mode: FeedMode) -> Vec<FeedLink> {
        let Some(attached) = self.components.current(id, session).filter(|a| a.is_attached()) else {
            return Vec::new();
        };

        let mut links = self.plan_eater(attached, None, mode);
        for eater in self.components.attached() {
            if eater.avatar_id != id {
                links.extend(self.plan_eater(eater, Some(id), mode));
            }
        }

        for link in &links {
            if let Some(eater) = self.components.get_mut(&link.eater_id) {
                eater
                    .wired
                    .insert((link.alias.clone(), link.feed.clone()), link.provider_session);
            }
        }
        links
    }

    fn feed_failed(&mut self, link: &FeedLink, error: &crate::error::Error) {
        if let Some(eater) = self.components.get_mut(&link.eater_id) {
            let key = (link.alias.clone(), link.feed.clone());
            if eater.wired.get(&key) == Some(&link.provider_session) {
                eater.wired.remove(&key);
            }
        }
        if error.is_disconnect() {
            return;
        }

        tracing::warn!(eater = %link.eater_id, alias = %link.alias, feed = %link.feed, error = %error, "Feed connection failed");
        if !error.kind().is_connect_failure() {
            return;
        }
        let Some(node) = self.planet.find_component(&link.eater_id) else {
            return;
        };
        let (host, port) = match &link.call {
            ComponentCall::EatFrom { host, port, .. } | ComponentCall::FeedTo { host, port, .. } => {
                (host.as_str(), *port)
            }
            _ => ("", 0),
        };
        let message = Message::error(
            format!("feed-{}", link.alias),
            format!(
                "Component {} could not connect to feed {} on {}:{}.",
                link.eater_id, link.feed, host, port
            ),
        )
        .with_debug(error.to_string());
        let _ = self.planet.add_component_message(node, message);
        let _ = self.planet.set_mood(node, Mood::Sad);
    }
}

impl Manager {
    /// Connect `id` to its providers and its waiting eaters to it
    pub(crate) async fn wire_feeds(&self, id: &str, session: u64) {
        let links = self.lock().plan_feeds(id, session, self.config.feed_mode);
        if links.is_empty() {
            return;
        }
        tracing::debug!(component = id, links = links.len(), "Wiring feeds");

        for link in links {
            let result: Result<Value> = link.target.call_remote(&link.call).await;
            match result {
                Ok(_) => tracing::debug!(eater = %link.eater_id, alias = %link.alias, feed = %link.feed, "Feed wired"),
                Err(e) => {
                    self.lock().feed_failed(&link, &e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::document::ComponentConfig;
    use crate::config::ManagerConfig;
    use crate::error::ErrorKind;
    use crate::manager::testing;
    use crate::rpc::LoopbackPeer;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn producer() -> ComponentConfig {
        let mut config = ComponentConfig::new("f", "prod", "videotest-producer");
        config.worker = Some("w1".into());
        config.feed = vec!["default".into()];
        config
    }

    fn encoder(feed: &str) -> ComponentConfig {
        let mut config = ComponentConfig::new("f", "enc", "theora-encoder");
        config.worker = Some("w2".into());
        config.eater = BTreeMap::from([(
            "default".to_string(),
            vec![(feed.to_string(), "default-prime".to_string())],
        )]);
        config
    }

    /// Manager with `w1` on 10.0.0.1 and `w2` on `eater_host`
    async fn setup(eater_host: &str) -> (Arc<Manager>, Vec<LoopbackPeer>) {
        let manager = Manager::new(ManagerConfig::default());
        let w1 = testing::worker(&manager, "w1", "10.0.0.1", Some(8600), vec![]).await.unwrap();
        let w2 = testing::worker(&manager, "w2", eater_host, Some(8601), vec![]).await.unwrap();
        (manager, vec![w1, w2])
    }

    #[tokio::test]
    async fn test_eater_wired_when_provider_attaches_later() {
        let (manager, _workers) = setup("10.0.0.2").await;
        let mut enc = testing::component(
            &manager,
            &encoder("prod:default"),
            "10.0.0.2",
            testing::job(Mood::Waking, "w2"),
            None,
        )
        .await
        .unwrap();
        let _prod = testing::component(
            &manager,
            &producer(),
            "10.0.0.1",
            testing::job(Mood::Happy, "w1"),
            None,
        )
        .await
        .unwrap();

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
    }

    #[tokio::test]
    async fn test_shared_host_uses_loopback() {
        let (manager, _workers) = setup("10.0.0.1").await;
        let _prod = testing::component(
            &manager,
            &producer(),
            "10.0.0.1",
            testing::job(Mood::Happy, "w1"),
            None,
        )
        .await
        .unwrap();
        // Bare component name means the default feed
        let mut enc = testing::component(
            &manager,
            &encoder("prod"),
            "10.0.0.1",
            testing::job(Mood::Waking, "w2"),
            None,
        )
        .await
        .unwrap();

        let call = enc.next_call().await.unwrap();
        match call.decode::<ComponentCall>().unwrap() {
            ComponentCall::EatFrom { host, full_feed_id, .. } => {
                assert_eq!(host, LOCALHOST);
                assert_eq!(full_feed_id, "/f/prod:default");
            }
            other => panic!("unexpected {:?}", other),
        }
        call.respond(Value::Null);
    }

    #[tokio::test]
    async fn test_connect_failure_makes_eater_sad() {
        let (manager, _workers) = setup("10.0.0.2").await;
        let _prod = testing::component(
            &manager,
            &producer(),
            "10.0.0.1",
            testing::job(Mood::Happy, "w1"),
            None,
        )
        .await
        .unwrap();
        let mut enc = testing::component(
            &manager,
            &encoder("prod:default"),
            "10.0.0.2",
            testing::job(Mood::Waking, "w2"),
            None,
        )
        .await
        .unwrap();

        enc.next_call()
            .await
            .unwrap()
            .fail(ErrorKind::ConnectionRefused, "refused");
        loop {
            if manager.component("/f/enc").unwrap().mood == Mood::Sad {
                break;
            }
            tokio::task::yield_now().await;
        }
        let enc_state = manager.component("/f/enc").unwrap();
        assert_eq!(enc_state.messages[0].id, "feed-default-prime");
        assert!(manager.lock().components.get("/f/enc").unwrap().wired.is_empty());
    }

    #[tokio::test]
    async fn test_virtual_feed_resolution() {
        let (manager, _workers) = setup("10.0.0.2").await;
        let mut prod = producer();
        prod.virtual_feeds = BTreeMap::from([("live".to_string(), "default".to_string())]);
        let _prod = testing::component(&manager, &prod, "10.0.0.1", testing::job(Mood::Happy, "w1"), None).await.unwrap();

        let mut enc = testing::component(
            &manager,
            &encoder("live"),
            "10.0.0.2",
            testing::job(Mood::Waking, "w2"),
            None,
        )
        .await
        .unwrap();
        let call = enc.next_call().await.unwrap();
        match call.decode::<ComponentCall>().unwrap() {
            ComponentCall::EatFrom { full_feed_id, port, .. } => {
                assert_eq!(full_feed_id, "/f/prod:default");
                assert_eq!(port, 8600);
            }
            other => panic!("unexpected {:?}", other),
        }
        call.respond(Value::Null);
    }

    #[tokio::test]
    async fn test_push_mode_calls_feed_to_on_provider() {
        let manager = Manager::new(ManagerConfig::default().feed_mode(FeedMode::Push));
        let _w1 = testing::worker(&manager, "w1", "10.0.0.1", Some(8600), vec![]).await.unwrap();
        let _w2 = testing::worker(&manager, "w2", "10.0.0.2", Some(8601), vec![]).await.unwrap();

        let _enc = testing::component(
            &manager,
            &encoder("prod:default"),
            "10.0.0.2",
            testing::job(Mood::Waking, "w2"),
            None,
        )
        .await
        .unwrap();
        let mut prod = testing::component(
            &manager,
            &producer(),
            "10.0.0.1",
            testing::job(Mood::Happy, "w1"),
            None,
        )
        .await
        .unwrap();

        let call = prod.next_call().await.unwrap();
        assert_eq!(
            call.decode::<ComponentCall>().unwrap(),
            ComponentCall::FeedTo {
                feeder_name: "default".into(),
                full_feed_id: "/f/enc:default-prime".into(),
                host: "10.0.0.2".into(),
                port: 8601,
            }
        );
        call.respond(Value::Null);
    }
}
