//! Component heaven
//!
//! Tracks component avatars, projects their job state into the planet and
//! drives the mood machine. Attaching a component runs feed wiring and
//! clock coordination once its login RPCs have completed.

use std::collections::HashMap;

use serde_json::{json, Value};

use super::mood::{check_delete, check_start, transition, MoodEvent};
use super::worker::Creation;
use super::{Manager, ManagerInner};
use crate::config::diff;
use crate::config::document::{parse_avatar_id, ComponentConfig};
use crate::error::{ComponentError, Error, Result};
use crate::rpc::message::{ClockInfo, ComponentCall, JobState};
use crate::rpc::RemoteRef;
use crate::state::{Message, Mood, NodeId};

pub(crate) struct ComponentAvatar {
    pub avatar_id: String,
    pub session: u64,
    pub remote: RemoteRef,
    /// Position in attach order, set once the login RPCs completed
    pub attach_order: Option<u64>,
    /// Configuration the running component reported
    pub config: Option<ComponentConfig>,
    pub worker_name: Option<String>,
    /// Master clock this component serves
    pub clocking: Option<ClockInfo>,
    /// Slave waiting for its master to provide a clock
    pub clock_waiting: bool,
    pub reserved_ports: Vec<u16>,
    /// Ids of messages the job added, dropped on disconnect
    pub job_messages: Vec<String>,
    pub stop_in_flight: bool,
    /// `(alias, feed)` pairs wired to the provider session that served them
    pub wired: HashMap<(String, String), u64>,
}

impl ComponentAvatar {
    pub fn is_attached(&self) -> bool {
        self.attach_order.is_some()
    }
}

#[derive(Default)]
pub(crate) struct ComponentHeaven {
    avatars: HashMap<String, ComponentAvatar>,
    by_node: HashMap<NodeId, String>,
    next_attach: u64,
}

impl ComponentHeaven {
    pub fn contains(&self, id: &str) -> bool {
        self.avatars.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&ComponentAvatar> {
        self.avatars.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ComponentAvatar> {
        self.avatars.get_mut(id)
    }

    /// The avatar logged in under `session`, if it is still the current one
    pub fn current(&self, id: &str, session: u64) -> Option<&ComponentAvatar> {
        self.avatars.get(id).filter(|a| a.session == session)
    }

    pub fn current_mut(&mut self, id: &str, session: u64) -> Option<&mut ComponentAvatar> {
        self.avatars.get_mut(id).filter(|a| a.session == session)
    }

    pub fn by_node(&self, node: NodeId) -> Option<&ComponentAvatar> {
        self.by_node.get(&node).and_then(|id| self.avatars.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComponentAvatar> {
        self.avatars.values()
    }

    /// Attached avatars, oldest attach first
    pub fn attached(&self) -> Vec<&ComponentAvatar> {
        let mut attached: Vec<&ComponentAvatar> =
            self.avatars.values().filter(|a| a.is_attached()).collect();
        attached.sort_by_key(|a| a.attach_order);
        attached
    }

    fn insert(&mut self, avatar: ComponentAvatar) {
        self.avatars.insert(avatar.avatar_id.clone(), avatar);
    }

    fn register(&mut self, id: &str, node: NodeId) {
        self.next_attach += 1;
        let order = self.next_attach;
        if let Some(avatar) = self.avatars.get_mut(id) {
            avatar.attach_order = Some(order);
            self.by_node.insert(node, id.to_string());
        }
    }

    fn remove(&mut self, id: &str, session: u64) -> Option<ComponentAvatar> {
        self.current(id, session)?;
        self.by_node.retain(|_, avatar_id| avatar_id != id);
        self.avatars.remove(id)
    }
}

impl Manager {
    pub(crate) fn component_login(&self, id: &str, session: u64, remote: RemoteRef) -> Result<()> {
        if parse_avatar_id(id).is_none() {
            return Err(Error::NoPerspective(format!("invalid component id {}", id)));
        }
        {
            let mut inner = self.lock();
            if let Some(existing) = inner.components.get(id) {
                if existing.remote.is_connected() {
                    return Err(Error::AlreadyConnected(id.to_string()));
                }
            }
            inner.components.insert(ComponentAvatar {
                avatar_id: id.to_string(),
                session,
                remote: remote.clone(),
                attach_order: None,
                config: None,
                worker_name: None,
                clocking: None,
                clock_waiting: false,
                reserved_ports: Vec::new(),
                job_messages: Vec::new(),
                stop_in_flight: false,
                wired: HashMap::new(),
            });
        }

        let manager = self.weak.clone();
        let component = id.to_string();
        remote.on_disconnect(move || {
            if let Some(manager) = manager.upgrade() {
                manager.component_detached(&component, session);
            }
        });
        Ok(())
    }

    /// Fetch the running component's view and project it into the planet
    pub(crate) async fn component_logged_in(&self, id: &str, session: u64) {
        let remote = {
            let inner = self.lock();
            match inner.components.current(id, session) {
                Some(avatar) => avatar.remote.clone(),
                None => return,
            }
        };

        let fetched = async {
            let config: ComponentConfig = remote.call_remote(&ComponentCall::GetConfig).await?;
            let job: JobState = remote.call_remote(&ComponentCall::GetState).await?;
            let clock: Option<ClockInfo> =
                remote.call_remote(&ComponentCall::GetMasterClockInfo).await?;
            Ok::<_, Error>((config, job, clock))
        };
        let (config, job, clock) = match fetched.await {
            Ok(fetched) => fetched,
            Err(e) => {
                if !e.is_disconnect() {
                    tracing::warn!(component = id, error = %e, "Component login failed, dropping it");
                    remote.disconnect();
                }
                return;
            }
        };

        {
            let mut inner = self.lock();
            let inner = &mut *inner;
            if inner.components.current(id, session).is_none() {
                return;
            }

            let node = match inner.planet.find_component(id) {
                Some(node) => {
                    let configured = inner.planet.component_config_value(node);
                    let deltas = diff::diff(&configured, &config.to_value());
                    if !deltas.is_empty() {
                        tracing::warn!(
                            component = id,
                            diff = %diff::format(&deltas),
                            "Running configuration differs from the planet"
                        );
                    }
                    node
                }
                None => match inner.planet.add_component(&config) {
                    Ok(node) => node,
                    Err(e) => {
                        tracing::warn!(component = id, error = %e, "Cannot add component to the planet");
                        return;
                    }
                },
            };

            let mood = inner.planet.mood(node).unwrap_or(Mood::Sleeping);
            let next = transition(mood, MoodEvent::LoggedIn(job.mood)).unwrap_or(Mood::Hungry);
            let _ = inner.planet.set_mood(node, next);
            if inner.planet.mood_pending(node) == Some(next) {
                let _ = inner.planet.set_mood_pending(node, None);
            }

            let worker_name = job
                .worker_name
                .clone()
                .or_else(|| inner.planet.worker_requested(node));
            let _ = inner.planet.set_worker_name(node, worker_name.as_deref());
            let _ = inner.planet.set_pid(node, job.pid);
            let _ = inner
                .planet
                .set_job_state(node, serde_json::to_value(&job).unwrap_or(Value::Null));

            let mut job_messages = Vec::with_capacity(job.messages.len());
            for message in &job.messages {
                job_messages.push(message.id.clone());
                let _ = inner.planet.add_component_message(node, message.clone());
            }

            let clocking = clock.filter(|_| config.is_clock_master());
            let claimed = match (&clocking, worker_name.as_deref()) {
                (Some(clock), Some(worker)) if inner.workers.claim(worker, clock.port) => {
                    tracing::debug!(component = id, worker = worker, port = clock.port, "Claimed running clock port");
                    Some(clock.port)
                }
                _ => None,
            };
            if let Some(avatar) = inner.components.current_mut(id, session) {
                avatar.clocking = clocking;
                avatar.reserved_ports.extend(claimed);
                avatar.config = Some(config);
                avatar.worker_name = worker_name;
                avatar.job_messages = job_messages;
            }
            inner.components.register(id, node);
            tracing::info!(component = id, mood = %next, "Component attached");
        }

        tokio::task::yield_now().await;
        self.component_attached(id, session).await;
    }

    async fn component_attached(&self, id: &str, session: u64) {
        self.wire_feeds(id, session).await;
        self.coordinate_clock(id, session).await;
    }

    pub(crate) fn component_detached(&self, id: &str, session: u64) {
        self.lock().detach_component(id, session);
    }

    /// Whether the component finished logging in and was wired up
    pub fn is_component_attached(&self, id: &str) -> bool {
        self.lock()
            .components
            .get(id)
            .is_some_and(ComponentAvatar::is_attached)
    }

    // ---- job state reported by the component

    pub(crate) fn job_set_mood(&self, id: &str, session: u64, mood: Mood) -> Result<()> {
        let mut inner = self.lock();
        let node = inner.job_node(id, session)?;
        let current = inner.planet.mood(node).unwrap_or(Mood::Sleeping);
        let Some(next) = transition(current, MoodEvent::Reported(mood)) else {
            tracing::warn!(component = id, from = %current, to = %mood, "Ignoring mood change");
            return Ok(());
        };
        inner.planet.set_mood(node, next)?;
        let pending = inner.planet.mood_pending(node);
        if pending == Some(next) || (next == Mood::Sad && pending == Some(Mood::Happy)) {
            inner.planet.set_mood_pending(node, None)?;
        }
        tracing::debug!(component = id, mood = %next, "Component mood");
        Ok(())
    }

    pub(crate) fn job_add_message(&self, id: &str, session: u64, message: Message) -> Result<()> {
        let mut inner = self.lock();
        let node = inner.job_node(id, session)?;
        let message_id = message.id.clone();
        inner.planet.add_component_message(node, message)?;
        if let Some(avatar) = inner.components.current_mut(id, session) {
            if !avatar.job_messages.contains(&message_id) {
                avatar.job_messages.push(message_id);
            }
        }
        Ok(())
    }

    pub(crate) fn job_remove_message(&self, id: &str, session: u64, message_id: &str) -> Result<()> {
        let mut inner = self.lock();
        let node = inner.job_node(id, session)?;
        if !inner.planet.remove_component_message(node, message_id)? {
            tracing::debug!(component = id, message = message_id, "No such message");
        }
        if let Some(avatar) = inner.components.current_mut(id, session) {
            avatar.job_messages.retain(|m| m != message_id);
        }
        Ok(())
    }

    /// The component is about to exit on its own
    pub(crate) fn clean_shutdown(&self, id: &str, session: u64) {
        if let Some(avatar) = self.lock().components.current_mut(id, session) {
            tracing::debug!(component = id, "Component shutting down cleanly");
            avatar.stop_in_flight = true;
        }
    }

    // ---- admin lifecycle

    /// Ask the requested worker to start a sleeping component
    pub fn component_start(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        let node = inner
            .planet
            .find_component(id)
            .ok_or_else(|| Error::UnknownComponent(id.to_string()))?;
        let mood = inner.planet.mood(node).unwrap_or(Mood::Sleeping);
        let pending = inner.planet.mood_pending(node);
        let worker = inner.planet.worker_requested(node);
        let logged_in = worker
            .as_deref()
            .is_some_and(|w| inner.workers.is_logged_in(w));
        check_start(
            id,
            mood,
            pending,
            inner.components.contains(id),
            worker.as_deref(),
            logged_in,
        )?;

        let creation = Creation::for_component(&inner.planet, node)
            .ok_or_else(|| Error::UnknownComponent(id.to_string()))?;
        inner.planet.set_mood_pending(node, Some(Mood::Happy))?;
        if let Some(worker) = worker.as_deref() {
            inner.enqueue_creation(worker, creation);
        }
        tracing::info!(component = id, worker = ?worker, "Starting component");
        Ok(())
    }

    /// Stop a component: through its avatar if it has one, else in the planet
    pub async fn component_stop(&self, id: &str) -> Result<()> {
        let remote = {
            let mut inner = self.lock();
            let inner = &mut *inner;
            let node = inner
                .planet
                .find_component(id)
                .ok_or_else(|| Error::UnknownComponent(id.to_string()))?;
            let mood = inner.planet.mood(node).unwrap_or(Mood::Sleeping);
            let pending = inner.planet.mood_pending(node);

            match inner.components.get_mut(id) {
                Some(avatar) => {
                    if avatar.stop_in_flight {
                        return Ok(());
                    }
                    avatar.stop_in_flight = true;
                    inner.planet.set_mood_pending(node, Some(Mood::Sleeping))?;
                    avatar.remote.clone()
                }
                None => {
                    if let Some(next) = transition(mood, MoodEvent::StopRequested) {
                        inner.planet.set_mood(node, next)?;
                        inner.planet.set_mood_pending(node, None)?;
                        tracing::info!(component = id, "Stopped component without avatar");
                        return Ok(());
                    }
                    if mood == Mood::Sleeping {
                        if pending.is_some() {
                            inner.planet.set_mood_pending(node, None)?;
                            tracing::info!(component = id, "Cancelled pending start");
                            return Ok(());
                        }
                        return Err(ComponentError::Sleeping(id.to_string()).into());
                    }
                    return Err(ComponentError::Mood {
                        id: id.to_string(),
                        mood,
                    }
                    .into());
                }
            }
        };

        tracing::info!(component = id, "Stopping component");
        match remote.call_remote::<_, Value>(&ComponentCall::Stop).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_disconnect() => Ok(()),
            Err(e) => {
                tracing::warn!(component = id, error = %e, "Stop failed");
                let mut inner = self.lock();
                if let Some(avatar) = inner.components.get_mut(id) {
                    avatar.stop_in_flight = false;
                }
                if let Some(node) = inner.planet.find_component(id) {
                    let _ = inner.planet.set_mood_pending(node, None);
                }
                Err(e)
            }
        }
    }

    /// Remove a sleeping component from the planet
    pub fn delete_component(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        let node = inner
            .planet
            .find_component(id)
            .ok_or_else(|| Error::UnknownComponent(id.to_string()))?;
        let mood = inner.planet.mood(node).unwrap_or(Mood::Sleeping);
        check_delete(id, mood, inner.planet.mood_pending(node))?;
        inner.planet.remove_component(node)?;
        tracing::info!(component = id, "Deleted component");
        Ok(())
    }

    /// Forward an arbitrary call to a connected component
    pub async fn call_component_remote(&self, id: &str, method: &str, args: Value) -> Result<Value> {
        let remote = self.component_remote(id)?;
        tracing::debug!(component = id, method = method, "Forwarding call to component");
        let body = json!({ "method": method, "args": args });
        remote.call_remote(&body).await.inspect_err(|e| {
            tracing::warn!(component = id, method = method, error = %e, "Forwarded call failed");
        })
    }

    /// Ask a connected component to reload its code
    pub async fn reload_component(&self, id: &str) -> Result<()> {
        let remote = self.component_remote(id)?;
        tracing::info!(component = id, "Reloading component code");
        remote
            .call_remote::<_, Value>(&ComponentCall::ReloadComponent)
            .await?;
        tracing::info!(component = id, "Reloaded component code");
        Ok(())
    }

    fn component_remote(&self, id: &str) -> Result<RemoteRef> {
        self.lock()
            .components
            .get(id)
            .map(|avatar| avatar.remote.clone())
            .ok_or_else(|| Error::UnknownComponent(id.to_string()))
    }

    /// Remove a flow whose components are all sleeping
    pub fn delete_flow(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        let flow = inner
            .planet
            .find_flow(name)
            .ok_or_else(|| Error::UnknownComponent(format!("flow {}", name)))?;
        let components = inner.planet.components_of(flow);
        for &node in &components {
            let id = inner.planet.avatar_id(node).unwrap_or_default();
            let mood = inner.planet.mood(node).unwrap_or(Mood::Sleeping);
            check_delete(&id, mood, inner.planet.mood_pending(node))?;
        }
        for node in components {
            inner.planet.remove_component(node)?;
        }
        inner.planet.remove_flow(flow)?;
        tracing::info!(flow = name, "Deleted flow");
        Ok(())
    }
}

impl ManagerInner {
    /// Node of a component whose avatar `session` is still current
    fn job_node(&self, id: &str, session: u64) -> Result<NodeId> {
        self.components
            .current(id, session)
            .ok_or(Error::NotConnected)?;
        self.planet
            .find_component(id)
            .ok_or_else(|| Error::UnknownComponent(id.to_string()))
    }

    /// Drop an avatar, return its ports and settle the component's mood
    ///
    /// Returns the avatar's transport, or `None` if `session` was stale.
    pub(super) fn detach_component(&mut self, id: &str, session: u64) -> Option<RemoteRef> {
        let avatar = self.components.remove(id, session)?;

        if let Some(worker) = avatar.worker_name.as_deref() {
            if !avatar.reserved_ports.is_empty() {
                self.workers.release(worker, &avatar.reserved_ports);
            }
        }

        let Some(node) = self.planet.find_component(id) else {
            return Some(avatar.remote);
        };
        let mood = self.planet.mood(node).unwrap_or(Mood::Lost);
        let stop_in_flight = avatar.stop_in_flight;
        let next = transition(mood, MoodEvent::Disconnected { stop_in_flight }).unwrap_or(Mood::Lost);
        let _ = self.planet.set_mood(node, next);
        let _ = self.planet.set_mood_pending(node, None);
        for message in &avatar.job_messages {
            let _ = self.planet.remove_component_message(node, message);
        }
        let _ = self.planet.set_job_state(node, Value::Null);
        let _ = self.planet.set_pid(node, None);
        let _ = self.planet.set_worker_name(node, None);
        tracing::info!(component = id, mood = %next, stop_in_flight = stop_in_flight, "Component detached");
        Some(avatar.remote)
    }
}
