//! Worker heaven
//!
//! A worker logs in, reports its feed server port, its port pool and the
//! jobs it already runs, and then receives `create` calls for the
//! components assigned to it. Creations on one worker form a chain: the
//! next `create` goes out only once the previous one was acknowledged.

use std::collections::HashMap;
use std::sync::Weak;

use serde_json::Value;
use tokio::sync::mpsc;

use super::mood::{transition, MoodEvent};
use super::ports::{PortError, PortSet};
use super::{Manager, ManagerInner};
use crate::error::{Error, Result};
use crate::rpc::message::WorkerCall;
use crate::rpc::RemoteRef;
use crate::state::{Message, Mood, NodeId, Planet, WorkerInfo};

/// A component job to start on a worker
#[derive(Debug, Clone)]
pub(crate) struct Creation {
    pub avatar_id: String,
    pub kind: String,
    pub nice: i32,
    pub config: Value,
}

impl Creation {
    /// Build the creation for a component node from its planet config
    pub fn for_component(planet: &Planet, node: NodeId) -> Option<Self> {
        let config = planet.component_config(node)?;
        Some(Self {
            avatar_id: config.avatar_id.clone(),
            kind: config.kind.clone(),
            nice: config.nice,
            config: config.to_value(),
        })
    }
}

pub(crate) struct WorkerAvatar {
    pub session: u64,
    pub remote: RemoteRef,
    /// Set once the login RPCs completed
    pub attached: bool,
    pub feed_server_port: Option<u16>,
    pub ports: PortSet,
    creations: Option<mpsc::UnboundedSender<Creation>>,
}

#[derive(Default)]
pub(crate) struct WorkerHeaven {
    workers: HashMap<String, WorkerAvatar>,
}

impl WorkerHeaven {
    pub fn get(&self, name: &str) -> Option<&WorkerAvatar> {
        self.workers.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerAvatar> {
        self.workers.values()
    }

    /// Whether `name` is logged in and ready for creations
    pub fn is_logged_in(&self, name: &str) -> bool {
        self.workers.get(name).is_some_and(|w| w.attached)
    }

    /// Host and feed server port of a worker, when both are known
    pub fn feed_server(&self, name: &str) -> Option<(String, u16)> {
        let worker = self.workers.get(name).filter(|w| w.attached)?;
        Some((worker.remote.host(), worker.feed_server_port?))
    }

    pub fn reserve(&mut self, name: &str, n: usize) -> std::result::Result<Vec<u16>, PortError> {
        self.workers
            .get_mut(name)
            .filter(|w| w.attached)
            .ok_or_else(|| PortError::UnknownWorker(name.to_string()))?
            .ports
            .reserve(n)
    }

    /// Claim a port in use on `name`; false if it was not free there
    pub fn claim(&mut self, name: &str, port: u16) -> bool {
        self.workers
            .get_mut(name)
            .is_some_and(|worker| worker.ports.claim(port))
    }

    pub fn release(&mut self, name: &str, ports: &[u16]) {
        match self.workers.get_mut(name) {
            Some(worker) => worker.ports.release(ports),
            None => tracing::debug!(worker = name, "Not releasing ports of a gone worker"),
        }
    }

    /// Queue a creation on a worker's chain; false if it is not logged in
    pub fn enqueue(&self, name: &str, creation: Creation) -> bool {
        let Some(sender) = self.workers.get(name).and_then(|w| w.creations.as_ref()) else {
            return false;
        };
        sender.send(creation).is_ok()
    }
}

impl ManagerInner {
    /// Creations waiting for `worker`, skipping jobs it already runs
    fn pending_creations(&self, worker: &str, running: &[String]) -> Vec<Creation> {
        self.planet
            .all_components()
            .into_iter()
            .filter(|&node| {
                self.planet.worker_requested(node).as_deref() == Some(worker)
                    && self.planet.mood_pending(node) == Some(Mood::Happy)
                    && self.planet.mood(node) == Some(Mood::Sleeping)
            })
            .filter_map(|node| Creation::for_component(&self.planet, node))
            .filter(|c| !self.components.contains(&c.avatar_id))
            .filter(|c| {
                let skip = running.contains(&c.avatar_id);
                if skip {
                    tracing::debug!(worker = worker, component = %c.avatar_id, "Job already running");
                }
                !skip
            })
            .collect()
    }

    /// Queue a creation; false if the worker is not logged in
    pub fn enqueue_creation(&self, worker: &str, creation: Creation) -> bool {
        let avatar_id = creation.avatar_id.clone();
        let queued = self.workers.enqueue(worker, creation);
        if queued {
            tracing::debug!(worker = worker, component = %avatar_id, "Queued creation");
        } else {
            tracing::debug!(worker = worker, component = %avatar_id, "Worker not logged in, creation stays pending");
        }
        queued
    }
}

impl Manager {
    pub(crate) fn worker_login(&self, name: &str, session: u64, remote: RemoteRef) -> Result<()> {
        {
            let mut inner = self.lock();
            if let Some(existing) = inner.workers.workers.get(name) {
                if existing.remote.is_connected() {
                    return Err(Error::AlreadyConnected(name.to_string()));
                }
            }
            inner.workers.workers.insert(
                name.to_string(),
                WorkerAvatar {
                    session,
                    remote: remote.clone(),
                    attached: false,
                    feed_server_port: None,
                    ports: PortSet::default(),
                    creations: None,
                },
            );
        }

        let manager = self.weak.clone();
        let worker = name.to_string();
        remote.on_disconnect(move || {
            if let Some(manager) = manager.upgrade() {
                manager.worker_detached(&worker, session);
            }
        });
        Ok(())
    }

    /// Fetch the worker's ports and running jobs, then flush its creations
    pub(crate) async fn worker_attached(&self, name: &str, session: u64) {
        let remote = {
            let inner = self.lock();
            match inner.workers.get(name) {
                Some(worker) if worker.session == session => worker.remote.clone(),
                _ => return,
            }
        };

        let info = async {
            let feed_server_port: Option<u16> =
                remote.call_remote(&WorkerCall::GetFeedServerPort).await?;
            let (ports, random_allowed): (Vec<u16>, bool) =
                remote.call_remote(&WorkerCall::GetPorts).await?;
            let running: Vec<String> = remote.call_remote(&WorkerCall::GetComponents).await?;
            Ok::<_, Error>((feed_server_port, ports, random_allowed, running))
        };
        let (feed_server_port, ports, random_allowed, running) = match info.await {
            Ok(info) => info,
            Err(e) => {
                if !e.is_disconnect() {
                    tracing::warn!(worker = name, error = %e, "Worker attach failed, dropping it");
                    remote.disconnect();
                }
                return;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let pending = {
            let mut inner = self.lock();
            let inner = &mut *inner;
            let Some(worker) = inner
                .workers
                .workers
                .get_mut(name)
                .filter(|w| w.session == session)
            else {
                return;
            };
            worker.attached = true;
            worker.feed_server_port = feed_server_port;
            worker.ports = PortSet::new(ports.iter().copied(), random_allowed);
            worker.creations = Some(tx.clone());

            let info = WorkerInfo {
                name: name.to_string(),
                host: remote.host(),
                feed_server_port,
            };
            if let Err(e) = inner.planet.add_worker(&info) {
                tracing::warn!(worker = name, error = %e, "Failed to record worker");
            }
            inner.pending_creations(name, &running)
        };

        tokio::spawn(run_creations(
            self.weak.clone(),
            name.to_string(),
            remote.clone(),
            rx,
        ));

        tracing::info!(
            worker = name,
            host = %remote.host(),
            feed_server_port = ?feed_server_port,
            ports = ports.len(),
            pending = pending.len(),
            "Worker attached"
        );
        for creation in pending {
            let _ = tx.send(creation);
        }
    }

    pub(crate) fn worker_detached(&self, name: &str, session: u64) {
        let orphans = {
            let mut inner = self.lock();
            let inner = &mut *inner;
            match inner.workers.get(name) {
                Some(worker) if worker.session == session => {}
                _ => return,
            }

            let bound: Vec<(String, u64)> = inner
                .components
                .iter()
                .filter(|avatar| avatar.worker_name.as_deref() == Some(name))
                .map(|avatar| (avatar.avatar_id.clone(), avatar.session))
                .collect();
            let orphans: Vec<RemoteRef> = bound
                .iter()
                .filter_map(|(id, session)| inner.detach_component(id, *session))
                .collect();

            let was_attached = inner
                .workers
                .workers
                .remove(name)
                .is_some_and(|w| w.attached);
            if was_attached {
                if let Err(e) = inner.planet.remove_worker(name) {
                    tracing::debug!(worker = name, error = %e, "Worker was not in the planet");
                }
            }

            for node in inner.planet.all_components() {
                let on_worker = inner.planet.worker_name(node).as_deref() == Some(name)
                    || inner.planet.worker_requested(node).as_deref() == Some(name);
                if !on_worker || inner.planet.mood_pending(node).is_none() {
                    continue;
                }
                let has_avatar = inner
                    .planet
                    .avatar_id(node)
                    .is_some_and(|id| inner.components.contains(&id));
                if !has_avatar {
                    let _ = inner.planet.set_mood_pending(node, None);
                }
            }
            orphans
        };

        tracing::info!(worker = name, components = orphans.len(), "Worker detached");
        for remote in orphans {
            remote.disconnect();
        }
    }

    /// Record the outcome of a `create` call
    fn creation_done(&self, worker: &str, avatar_id: &str, result: Result<Value>) {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let Some(node) = inner.planet.find_component(avatar_id) else {
            return;
        };

        match result {
            Ok(_) => {
                if inner.components.contains(avatar_id) {
                    return;
                }
                let mood = inner.planet.mood(node).unwrap_or(Mood::Sleeping);
                if let Some(next) = transition(mood, MoodEvent::JobCreated) {
                    let _ = inner.planet.set_mood(node, next);
                    let _ = inner.planet.set_worker_name(node, Some(worker));
                }
                tracing::debug!(worker = worker, component = avatar_id, "Job created");
            }
            Err(e) if e.is_disconnect() => {
                tracing::debug!(worker = worker, component = avatar_id, "Worker went away during create");
            }
            Err(e) => {
                tracing::warn!(worker = worker, component = avatar_id, error = %e, "Failed to create component");
                let message = Message::error(
                    format!("create-{}", avatar_id),
                    format!("Worker '{}' failed to start component '{}'.", worker, avatar_id),
                )
                .with_debug(e.to_string());
                let _ = inner.planet.add_component_message(node, message);
                let _ = inner.planet.set_mood(node, Mood::Sad);
                let _ = inner.planet.set_mood_pending(node, None);
            }
        }
    }

    /// Take `n` ports from a worker's pool
    pub fn reserve_ports_on_worker(&self, worker: &str, n: usize) -> Result<Vec<u16>> {
        Ok(self.lock().workers.reserve(worker, n)?)
    }

    /// Return ports to a worker's pool
    pub fn release_ports_on_worker(&self, worker: &str, ports: &[u16]) {
        self.lock().workers.release(worker, ports);
    }

    /// Whether `name` is logged in and attached
    pub fn is_worker_logged_in(&self, name: &str) -> bool {
        self.lock().workers.is_logged_in(name)
    }
}

/// Issue queued creations on one worker, one at a time
async fn run_creations(
    manager: Weak<Manager>,
    worker: String,
    remote: RemoteRef,
    mut queue: mpsc::UnboundedReceiver<Creation>,
) {
    while let Some(creation) = queue.recv().await {
        tracing::debug!(worker = %worker, component = %creation.avatar_id, "Creating component");
        let call = WorkerCall::Create {
            avatar_id: creation.avatar_id.clone(),
            component_type: creation.kind.clone(),
            module: creation.kind.clone(),
            function: "create".to_string(),
            nice: creation.nice,
            config: creation.config,
        };
        let result = remote.call_remote::<_, Value>(&call).await;
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.creation_done(&worker, &creation.avatar_id, result);
        if !remote.is_connected() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use crate::config::document::ComponentConfig;
    use crate::config::ManagerConfig;
    use crate::manager::testing;
    use crate::rpc::message::{ComponentCall, InterfaceTag};
    use crate::rpc::{IncomingCall, LoopbackPeer};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn addr() -> SocketAddr {
        "10.0.0.1:40000".parse().unwrap()
    }

    async fn answer_login(peer: &mut LoopbackPeer, running: Vec<String>) {
        for _ in 0..3 {
            let call: IncomingCall = peer.next_call().await.unwrap();
            match call.method() {
                "getFeedServerPort" => call.respond(Some(8600u16)),
                "getPorts" => call.respond((vec![8610u16, 8611], false)),
                "getComponents" => call.respond(running.clone()),
                other => panic!("unexpected {}", other),
            }
        }
    }

    async fn wait_for_worker(manager: &Arc<Manager>, name: &str) {
        while !manager.is_worker_logged_in(name) {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_worker_attach_registers_ports() {
        let manager = Manager::new(ManagerConfig::default());
        let portal = manager.portal();
        let mut peer = LoopbackPeer::connect(
            &portal,
            addr(),
            Credentials::anonymous(),
            InterfaceTag::Worker,
            "w1",
        )
        .await
        .unwrap();
        answer_login(&mut peer, vec![]).await;
        wait_for_worker(&manager, "w1").await;

        let workers = manager.workers();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].host, "10.0.0.1");
        assert_eq!(workers[0].feed_server_port, Some(8600));

        assert_eq!(manager.reserve_ports_on_worker("w1", 1).unwrap(), vec![8610]);
        assert!(matches!(
            manager.reserve_ports_on_worker("w1", 2),
            Err(Error::Ports(PortError::Exhausted { .. }))
        ));
        manager.release_ports_on_worker("w1", &[8610]);
        assert_eq!(manager.reserve_ports_on_worker("w1", 2).unwrap(), vec![8610, 8611]);
    }

    #[tokio::test]
    async fn test_duplicate_worker_rejected_until_gone() {
        let manager = Manager::new(ManagerConfig::default());
        let portal = manager.portal();
        let first = LoopbackPeer::connect(
            &portal,
            addr(),
            Credentials::anonymous(),
            InterfaceTag::Worker,
            "w1",
        )
        .await
        .unwrap();

        let second = LoopbackPeer::connect(
            &portal,
            addr(),
            Credentials::anonymous(),
            InterfaceTag::Worker,
            "w1",
        )
        .await;
        assert!(matches!(second, Err(Error::AlreadyConnected(_))));

        first.close();
        let third = LoopbackPeer::connect(
            &portal,
            addr(),
            Credentials::anonymous(),
            InterfaceTag::Worker,
            "w1",
        )
        .await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_pending_creations_flushed_in_order() {
        let manager = Manager::new(ManagerConfig::default());
        manager
            .load_configuration_str(
                r#"
[[flow]]
name = "f"

[[flow.component]]
name = "a"
type = "producer"
worker = "w1"

[[flow.component]]
name = "b"
type = "encoder"
worker = "w1"

[[flow.component]]
name = "c"
type = "streamer"
worker = "w1"
"#,
            )
            .unwrap();
        assert_eq!(manager.component("/f/a").unwrap().mood_pending, Some(Mood::Happy));

        let portal = manager.portal();
        let mut peer = LoopbackPeer::connect(
            &portal,
            addr(),
            Credentials::anonymous(),
            InterfaceTag::Worker,
            "w1",
        )
        .await
        .unwrap();
        answer_login(&mut peer, vec!["/f/c".to_string()]).await;

        // First create fails, the chain carries on
        let call = peer.next_call().await.unwrap();
        assert_eq!(call.body()["args"]["avatarId"], json!("/f/a"));
        call.fail(crate::error::ErrorKind::RemoteRun, "no such plugin");

        let call = peer.next_call().await.unwrap();
        assert_eq!(call.body()["args"]["avatarId"], json!("/f/b"));
        assert_eq!(call.body()["args"]["type"], json!("encoder"));
        call.respond(Value::Null);

        // b acknowledged: waking on w1
        loop {
            if manager.component("/f/b").unwrap().mood == Mood::Waking {
                break;
            }
            tokio::task::yield_now().await;
        }
        let a = manager.component("/f/a").unwrap();
        assert_eq!(a.mood, Mood::Sad);
        assert_eq!(a.mood_pending, None);
        assert_eq!(a.messages[0].id, "create-/f/a");

        let b = manager.component("/f/b").unwrap();
        assert_eq!(b.worker_name.as_deref(), Some("w1"));

        // c was already running, so no create was issued for it
        let c = manager.component("/f/c").unwrap();
        assert_eq!(c.mood, Mood::Sleeping);
        assert_eq!(c.mood_pending, Some(Mood::Happy));
    }

    #[tokio::test]
    async fn test_detach_clears_pending_of_avatarless_components() {
        let manager = Manager::new(ManagerConfig::default());
        let portal = manager.portal();
        let mut peer = LoopbackPeer::connect(
            &portal,
            addr(),
            Credentials::anonymous(),
            InterfaceTag::Worker,
            "w1",
        )
        .await
        .unwrap();
        answer_login(&mut peer, vec![]).await;
        wait_for_worker(&manager, "w1").await;

        manager
            .load_configuration_str(
                "[[atmosphere]]\nname = \"porter\"\ntype = \"porter\"\nworker = \"w1\"\n",
            )
            .unwrap();
        // Create is issued but never answered
        let call = peer.next_call().await.unwrap();
        assert_eq!(call.method(), "create");

        drop(call);
        peer.close();
        while manager.is_worker_logged_in("w1") {
            tokio::task::yield_now().await;
        }

        assert!(manager.workers().is_empty());
        let porter = manager.component("/atmosphere/porter").unwrap();
        assert_eq!(porter.mood_pending, None);
        assert_eq!(porter.mood, Mood::Sleeping);
    }

    #[tokio::test]
    async fn test_worker_loss_drops_components_bound_to_it() {
        let manager = Manager::new(ManagerConfig::default());
        let w1 = testing::worker(&manager, "w1", "10.0.0.1", Some(8600), vec![]).await.unwrap();
        let _w2 = testing::worker(&manager, "w2", "10.0.0.2", Some(8601), vec![]).await.unwrap();
        let prod = testing::component(
            &manager,
            &ComponentConfig::new("f", "prod", "producer"),
            "10.0.0.1",
            testing::job(Mood::Happy, "w1"),
            None,
        )
        .await
        .unwrap();
        let mut enc = testing::component(
            &manager,
            &ComponentConfig::new("f", "enc", "encoder"),
            "10.0.0.1",
            testing::job(Mood::Happy, "w1"),
            None,
        )
        .await
        .unwrap();
        let mux = testing::component(
            &manager,
            &ComponentConfig::new("f", "mux", "muxer"),
            "10.0.0.2",
            testing::job(Mood::Happy, "w2"),
            None,
        )
        .await
        .unwrap();

        let stopper = Arc::clone(&manager);
        tokio::spawn(async move { stopper.component_stop("/f/enc").await });
        let stop_call = enc.next_call().await.unwrap();
        assert_eq!(stop_call.decode::<ComponentCall>().unwrap(), ComponentCall::Stop);

        w1.close();
        while manager.is_worker_logged_in("w1") {
            tokio::task::yield_now().await;
        }

        let prod_view = manager.component("/f/prod").unwrap();
        assert_eq!(prod_view.mood, Mood::Lost);
        assert_eq!(prod_view.pid, None);
        assert_eq!(manager.component("/f/enc").unwrap().mood, Mood::Sleeping);
        assert_eq!(manager.component("/f/mux").unwrap().mood, Mood::Happy);
        assert!(!prod.remote().is_connected());
        assert!(mux.remote().is_connected());
    }
}
