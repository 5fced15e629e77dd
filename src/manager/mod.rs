//! Manager runtime
//!
//! [`Manager`] owns the planet and every heaven (workers, components,
//! admins). All mutable state sits behind one mutex that is never held
//! across an `.await`: a state change and the listener notifications it
//! triggers always complete before anything else touches the planet.
//!
//! Peers reach the manager through [`Realm::request_avatar`]; each login
//! gets a [`ManagerPerspective`] scoped to its interface.

pub mod admin;
pub mod bundle;
pub mod clock;
pub mod component;
pub mod feed;
pub mod merge;
pub mod mood;
pub mod ports;
#[doc(hidden)]
pub mod testing;
pub mod worker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};

use self::admin::AdminHeaven;
use self::component::ComponentHeaven;
use self::worker::WorkerHeaven;
use crate::auth::{Bouncer, CredentialChecker, Identity, Keycard, RemoteBouncer};
use crate::config::constants::ATMOSPHERE;
use crate::config::document::avatar_id;
use crate::config::{persist, ComponentEntry, FlowEntry, ManagerConfig, ManagerSection, PlanetDocument};
use crate::error::{Error, ErrorKind, RemoteError, Result};
use crate::rpc::message::{AdminCall, ComponentCall, InterfaceTag, ManagerRequest, WorkerCall};
use crate::rpc::{spawn_pinger, Perspective, Portal, Realm, RemoteRef, RpcServer};
use crate::state::{
    ComponentSnapshot, ListenerId, ListenerTarget, Message, NodeId, Planet, StateEvent, WorkerInfo,
};

pub use bundle::{Bundle, BundleRegistry};
pub use merge::MergeOutcome;
pub use mood::MoodEvent;
pub use ports::{PortError, PortSet};

/// Everything the manager mutates, guarded by one lock
pub(crate) struct ManagerInner {
    pub planet: Planet,
    pub workers: WorkerHeaven,
    pub components: ComponentHeaven,
    pub admins: AdminHeaven,
    /// System bouncer, used when a request names none
    pub bouncer: Option<Arc<dyn Bouncer>>,
    /// Bouncers registered by the embedder
    pub bouncers: HashMap<String, Arc<dyn Bouncer>>,
    /// The manager section that was applied, if any
    pub manager_section: Option<ManagerSection>,
    pub bundles: BundleRegistry,
}

pub struct Manager {
    config: ManagerConfig,
    inner: Mutex<ManagerInner>,
    next_session: AtomicU64,
    weak: Weak<Manager>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let planet = Planet::new(&config.name);
        Arc::new_cyclic(|weak| Self {
            config,
            inner: Mutex::new(ManagerInner {
                planet,
                workers: WorkerHeaven::default(),
                components: ComponentHeaven::default(),
                admins: AdminHeaven::default(),
                bouncer: None,
                bouncers: HashMap::new(),
                manager_section: None,
                bundles: BundleRegistry::new(),
            }),
            next_session: AtomicU64::new(1),
            weak: weak.clone(),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Login portal checking the configured users
    pub fn portal(self: &Arc<Self>) -> Portal<Manager> {
        Portal::new(
            Arc::clone(self),
            CredentialChecker::new(self.config.users.clone()),
        )
    }

    /// RPC server for this manager
    pub fn server(self: &Arc<Self>) -> Result<RpcServer<Manager>> {
        RpcServer::new(self.config.clone(), self.portal())
    }

    // ---- embedder setup

    /// Make `bouncer` available under `name`
    pub fn register_bouncer(&self, name: impl Into<String>, bouncer: Arc<dyn Bouncer>) {
        let name = name.into();
        tracing::debug!(bouncer = %name, "Registered bouncer");
        self.lock().bouncers.insert(name, bouncer);
    }

    /// Set the system bouncer directly
    pub fn set_bouncer(&self, bouncer: Arc<dyn Bouncer>) {
        self.lock().bouncer = Some(bouncer);
    }

    pub fn register_bundle(&self, bundle: Bundle) {
        self.lock().bundles.register(bundle);
    }

    // ---- planet views

    /// Serialisable snapshot of the whole planet
    pub fn planet_snapshot(&self) -> Value {
        self.lock().planet.snapshot()
    }

    /// Run `f` against the planet
    pub fn with_planet<T>(&self, f: impl FnOnce(&Planet) -> T) -> T {
        f(&self.lock().planet)
    }

    /// Observe planet changes; see [`StateTree::add_listener`](crate::state::StateTree::add_listener)
    pub fn add_state_listener<F>(
        &self,
        target: ListenerTarget,
        keys: Option<&[&str]>,
        callback: F,
    ) -> ListenerId
    where
        F: FnMut(&StateEvent) + Send + 'static,
    {
        self.lock()
            .planet
            .tree_mut()
            .add_listener(target, keys, callback)
    }

    pub fn remove_state_listener(&self, id: ListenerId) -> bool {
        self.lock().planet.tree_mut().remove_listener(id)
    }

    pub fn component(&self, id: &str) -> Option<ComponentSnapshot> {
        let inner = self.lock();
        let node = inner.planet.find_component(id)?;
        inner.planet.component_snapshot(node)
    }

    pub fn components(&self) -> Vec<ComponentSnapshot> {
        let inner = self.lock();
        inner
            .planet
            .all_components()
            .into_iter()
            .filter_map(|node| inner.planet.component_snapshot(node))
            .collect()
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        let inner = self.lock();
        inner
            .planet
            .worker_names()
            .iter()
            .filter_map(|name| inner.planet.worker(name))
            .collect()
    }

    pub fn planet_messages(&self) -> Vec<Message> {
        self.lock().planet.messages()
    }

    pub fn planet_message(&self, id: &str) -> Option<Message> {
        self.lock().planet.message(id)
    }

    /// Whether a component with this id has a live avatar
    pub fn is_component_connected(&self, id: &str) -> bool {
        self.lock().components.contains(id)
    }

    // ---- bouncers

    fn resolve_bouncer(&self, name: Option<&str>) -> Result<Option<Arc<dyn Bouncer>>> {
        let inner = self.lock();
        let Some(name) = name else {
            return Ok(inner.bouncer.clone());
        };
        let id = avatar_id(ATMOSPHERE, name);
        if let Some(avatar) = inner.components.get(&id) {
            return Ok(Some(Arc::new(RemoteBouncer::new(id, avatar.remote.clone()))));
        }
        if let Some(bouncer) = inner.bouncers.get(name) {
            return Ok(Some(Arc::clone(bouncer)));
        }
        Err(Error::UnknownComponent(id))
    }

    /// Check a keycard with the named bouncer, or the system bouncer
    pub async fn authenticate(
        &self,
        bouncer_name: Option<&str>,
        keycard: Keycard,
    ) -> Result<Option<Keycard>> {
        match self.resolve_bouncer(bouncer_name)? {
            Some(bouncer) => bouncer.authenticate(keycard).await,
            None => {
                tracing::warn!(keycard = %keycard, "No bouncer configured, refusing keycard");
                Ok(None)
            }
        }
    }

    pub async fn keep_alive(
        &self,
        bouncer_name: Option<&str>,
        issuer_name: &str,
        ttl: f64,
    ) -> Result<()> {
        match self.resolve_bouncer(bouncer_name)? {
            Some(bouncer) => bouncer.keep_alive(issuer_name, ttl).await,
            None => Ok(()),
        }
    }

    pub async fn keycard_classes(&self, bouncer_name: Option<&str>) -> Result<Vec<String>> {
        match self.resolve_bouncer(bouncer_name)? {
            Some(bouncer) => bouncer.keycard_classes().await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn remove_keycard_id(
        &self,
        bouncer_name: Option<&str>,
        keycard_id: &str,
    ) -> Result<()> {
        match self.resolve_bouncer(bouncer_name)? {
            Some(bouncer) => bouncer.remove_keycard_id(keycard_id).await,
            None => Ok(()),
        }
    }

    /// Tell `requester_id` to drop whoever holds `keycard_id`
    pub async fn expire_keycard(&self, requester_id: &str, keycard_id: &str) -> Result<()> {
        let remote = self
            .lock()
            .components
            .get(requester_id)
            .map(|avatar| avatar.remote.clone())
            .ok_or_else(|| Error::UnknownComponent(requester_id.to_string()))?;
        tracing::debug!(requester = requester_id, keycard_id = keycard_id, "Expiring keycard");
        remote
            .call_remote::<_, Value>(&ComponentCall::ExpireKeycard {
                keycard_id: keycard_id.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Revoke a keycard at its bouncer and expire it at its requester
    pub async fn revoke_keycard(&self, bouncer_name: Option<&str>, keycard_id: &str) -> Result<()> {
        let Some(bouncer) = self.resolve_bouncer(bouncer_name)? else {
            return Ok(());
        };
        if let Some(keycard) = bouncer.expire_keycard(keycard_id).await? {
            if let Some(requester) = keycard.requester_id.as_deref() {
                self.expire_keycard(requester, keycard_id).await?;
            }
        }
        Ok(())
    }

    /// A [`Bouncer`] that routes through this manager to `bouncer_name`
    ///
    /// Lets an in-process streamer use the same bouncers as remote components.
    pub fn bouncer(self: &Arc<Self>, bouncer_name: Option<&str>) -> ManagerBouncer {
        ManagerBouncer {
            manager: Arc::clone(self),
            name: bouncer_name.map(str::to_owned),
        }
    }

    // ---- misc

    pub fn bundle_sums(
        &self,
        bundle_name: Option<&str>,
        file_name: Option<&str>,
        module_name: Option<&str>,
    ) -> Result<Vec<(String, String)>> {
        self.lock().bundles.sums(bundle_name, file_name, module_name)
    }

    pub fn bundle_zips(&self, names: &[String]) -> Result<std::collections::BTreeMap<String, String>> {
        self.lock().bundles.zips(names)
    }

    /// Log a marker locally and on every worker and component
    pub fn write_debug_marker(&self, level: u8, marker: &str) {
        tracing::info!(level = level, marker = marker, "Debug marker");
        let inner = self.lock();
        for worker in inner.workers.iter() {
            let _ = worker.remote.notify(&WorkerCall::WriteFluDebugMarker {
                level,
                marker: marker.to_string(),
            });
        }
        for component in inner.components.iter() {
            let _ = component.remote.notify(&ComponentCall::WriteFluDebugMarker {
                level,
                marker: marker.to_string(),
            });
        }
    }

    /// The configured planet as a document
    pub fn planet_document(&self) -> PlanetDocument {
        let inner = self.lock();
        let planet = &inner.planet;
        let entries = |parent: NodeId| {
            planet
                .components_of(parent)
                .into_iter()
                .filter_map(|node| planet.component_config(node))
                .map(|config| ComponentEntry::from_config(&config))
                .collect::<Vec<_>>()
        };

        PlanetDocument {
            name: Some(planet.name()),
            manager: inner.manager_section.clone(),
            atmosphere: entries(planet.atmosphere()),
            flows: planet
                .flows()
                .into_iter()
                .map(|flow| FlowEntry {
                    name: planet.flow_name(flow).unwrap_or_default(),
                    components: entries(flow),
                })
                .collect(),
        }
    }

    /// Save the configured planet under the config directory
    pub fn save_planet(&self) -> Result<PathBuf> {
        let document = self.planet_document();
        Ok(persist::save_planet(
            &self.config.config_dir,
            &self.config.name,
            &document,
        )?)
    }

    fn next_session(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    fn start_pinging(&self, interface: InterfaceTag, remote: RemoteRef) {
        let interval = self.config.heartbeat_interval;
        let timeout = self.config.ping_timeout();
        match interface {
            InterfaceTag::Worker => spawn_pinger(remote, WorkerCall::Ping, interval, timeout),
            InterfaceTag::Component => {
                spawn_pinger(remote, ComponentCall::Ping, interval, timeout)
            }
            InterfaceTag::Admin => spawn_pinger(remote, AdminCall::Ping, interval, timeout),
        };
    }

    async fn perform(&self, avatar: &ManagerPerspective, request: ManagerRequest) -> Result<Value> {
        use ManagerRequest::*;
        let id = avatar.avatar_id.as_str();
        let session = avatar.session;

        Ok(match request {
            Ping => json!(true),
            GetBundleSums {
                bundle_name,
                file_name,
                module_name,
            } => serde_json::to_value(self.bundle_sums(
                bundle_name.as_deref(),
                file_name.as_deref(),
                module_name.as_deref(),
            )?)?,
            GetBundleZips { names } => serde_json::to_value(self.bundle_zips(&names)?)?,
            Authenticate {
                bouncer_name,
                keycard,
            } => serde_json::to_value(self.authenticate(bouncer_name.as_deref(), keycard).await?)?,
            KeepAlive {
                bouncer_name,
                issuer_name,
                ttl,
            } => {
                self.keep_alive(bouncer_name.as_deref(), &issuer_name, ttl)
                    .await?;
                Value::Null
            }
            GetKeycardClasses { bouncer_name } => {
                serde_json::to_value(self.keycard_classes(bouncer_name.as_deref()).await?)?
            }
            WriteFluDebugMarker { level, marker } => {
                self.write_debug_marker(level, &marker);
                Value::Null
            }
            CleanShutdown => {
                self.clean_shutdown(id, session);
                Value::Null
            }
            RemoveKeycardId {
                bouncer_name,
                keycard_id,
            } => {
                self.remove_keycard_id(bouncer_name.as_deref(), &keycard_id)
                    .await?;
                Value::Null
            }
            ExpireKeycard {
                requester_id,
                keycard_id,
            } => {
                self.expire_keycard(&requester_id, &keycard_id).await?;
                Value::Null
            }
            SetMood { mood } => {
                self.job_set_mood(id, session, mood)?;
                Value::Null
            }
            AddMessage { message } => {
                self.job_add_message(id, session, message)?;
                Value::Null
            }
            RemoveMessage { id: message_id } => {
                self.job_remove_message(id, session, &message_id)?;
                Value::Null
            }
            GetPlanetState => self.planet_snapshot(),
            LoadConfiguration { document } => {
                self.load_configuration_str(&document)?;
                Value::Null
            }
            LoadComponent {
                component_type,
                parent,
                name,
                worker,
                properties,
                eaters,
                needs_synchronisation,
            } => json!(self.load_component(
                &component_type,
                &parent,
                &name,
                worker,
                properties,
                eaters,
                needs_synchronisation,
            )?),
            ComponentStart { component_id } => {
                self.component_start(&component_id)?;
                Value::Null
            }
            ComponentStop { component_id } => {
                self.component_stop(&component_id).await?;
                Value::Null
            }
            DeleteComponent { component_id } => {
                self.delete_component(&component_id)?;
                Value::Null
            }
            DeleteFlow { name } => {
                self.delete_flow(&name)?;
                Value::Null
            }
            CallComponentRemote {
                component_id,
                method,
                args,
            } => self.call_component_remote(&component_id, &method, args).await?,
            ReloadComponent { component_id } => {
                self.reload_component(&component_id).await?;
                Value::Null
            }
        })
    }
}

#[async_trait]
impl Realm for Manager {
    async fn request_avatar(
        self: Arc<Self>,
        identity: Identity,
        interface: InterfaceTag,
        avatar_id: &str,
        remote: RemoteRef,
    ) -> Result<Arc<dyn Perspective>> {
        let session = self.next_session();
        match interface {
            InterfaceTag::Worker => self.worker_login(avatar_id, session, remote.clone())?,
            InterfaceTag::Component => self.component_login(avatar_id, session, remote.clone())?,
            InterfaceTag::Admin => self.admin_login(avatar_id, session, remote.clone())?,
        }
        self.start_pinging(interface, remote);

        tracing::info!(
            identity = %identity,
            interface = %interface,
            avatar_id = avatar_id,
            session = session,
            "Avatar logged in"
        );
        Ok(Arc::new(ManagerPerspective {
            manager: self,
            interface,
            avatar_id: avatar_id.to_string(),
            session,
        }))
    }
}

/// Bouncer handle resolved by the manager on every call
pub struct ManagerBouncer {
    manager: Arc<Manager>,
    name: Option<String>,
}

#[async_trait]
impl Bouncer for ManagerBouncer {
    async fn authenticate(&self, keycard: Keycard) -> Result<Option<Keycard>> {
        self.manager.authenticate(self.name.as_deref(), keycard).await
    }

    async fn keep_alive(&self, issuer_name: &str, ttl: f64) -> Result<()> {
        self.manager
            .keep_alive(self.name.as_deref(), issuer_name, ttl)
            .await
    }

    async fn remove_keycard_id(&self, keycard_id: &str) -> Result<()> {
        self.manager
            .remove_keycard_id(self.name.as_deref(), keycard_id)
            .await
    }

    async fn expire_keycard(&self, keycard_id: &str) -> Result<Option<Keycard>> {
        // The manager tells the requester itself
        self.manager
            .revoke_keycard(self.name.as_deref(), keycard_id)
            .await?;
        Ok(None)
    }

    async fn keycard_classes(&self) -> Result<Vec<String>> {
        self.manager.keycard_classes(self.name.as_deref()).await
    }
}

/// What a logged-in peer may do, scoped to its interface
pub struct ManagerPerspective {
    manager: Arc<Manager>,
    interface: InterfaceTag,
    avatar_id: String,
    session: u64,
}

impl ManagerPerspective {
    pub fn avatar_id(&self) -> &str {
        &self.avatar_id
    }

    pub fn interface(&self) -> InterfaceTag {
        self.interface
    }
}

#[async_trait]
impl Perspective for ManagerPerspective {
    async fn perform(&self, request: ManagerRequest) -> std::result::Result<Value, RemoteError> {
        if !request.allowed_for(self.interface) {
            return Err(RemoteError::new(
                ErrorKind::RemoteMethod,
                format!("{} is not available on {}", request.method(), self.interface),
            ));
        }
        let method = request.method();
        self.manager.perform(self, request).await.map_err(|e| {
            tracing::debug!(avatar_id = %self.avatar_id, method = method, error = %e, "Request failed");
            e.to_remote()
        })
    }

    async fn attached(&self) {
        match self.interface {
            InterfaceTag::Worker => {
                self.manager
                    .worker_attached(&self.avatar_id, self.session)
                    .await
            }
            InterfaceTag::Component => {
                self.manager
                    .component_logged_in(&self.avatar_id, self.session)
                    .await
            }
            InterfaceTag::Admin => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credentials, StaticBouncer};
    use crate::rpc::LoopbackPeer;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "10.0.0.9:5000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_interface_scoping() {
        let manager = Manager::new(ManagerConfig::named("lab"));
        let portal = manager.portal();
        let admin = LoopbackPeer::connect(
            &portal,
            addr(),
            Credentials::anonymous(),
            InterfaceTag::Admin,
            "admin",
        )
        .await
        .unwrap();

        let state: Value = admin.call(ManagerRequest::GetPlanetState).await.unwrap();
        assert_eq!(state["name"], json!("lab"));

        let err = admin
            .call::<Value>(ManagerRequest::CleanShutdown)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteMethod);
    }

    #[tokio::test]
    async fn test_duplicate_admin_rejected() {
        let manager = Manager::new(ManagerConfig::default());
        let portal = manager.portal();
        let _first = LoopbackPeer::connect(
            &portal,
            addr(),
            Credentials::anonymous(),
            InterfaceTag::Admin,
            "admin",
        )
        .await
        .unwrap();
        let second = LoopbackPeer::connect(
            &portal,
            addr(),
            Credentials::anonymous(),
            InterfaceTag::Admin,
            "admin",
        )
        .await;
        assert!(matches!(second, Err(Error::AlreadyConnected(_))));
    }

    #[tokio::test]
    async fn test_system_bouncer_from_manager_section() {
        let manager = Manager::new(ManagerConfig::default());
        manager.register_bouncer("static", Arc::new(StaticBouncer::new().user("user", "test")));

        // No bouncer yet
        let refused = manager
            .authenticate(None, Keycard::username_password("user", "test"))
            .await
            .unwrap();
        assert!(refused.is_none());

        manager
            .load_configuration_str("[manager]\nbouncer = \"static\"\n")
            .unwrap();
        let accepted = manager
            .authenticate(None, Keycard::username_password("user", "test"))
            .await
            .unwrap();
        assert!(accepted.unwrap().is_authenticated());
        assert_eq!(
            manager.keycard_classes(None).await.unwrap(),
            vec!["username-password".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unknown_named_bouncer() {
        let manager = Manager::new(ManagerConfig::default());
        let err = manager
            .authenticate(Some("porter"), Keycard::token("t"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownComponent);
    }

    #[tokio::test]
    async fn test_manager_bouncer_delegates() {
        let manager = Manager::new(ManagerConfig::default());
        let bouncer = Arc::new(StaticBouncer::new().user("user", "test"));
        manager.register_bouncer("static", bouncer.clone());

        let handle = manager.bouncer(Some("static"));
        let keycard = handle
            .authenticate(Keycard::username_password("user", "test"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bouncer.issued(), 1);

        handle.remove_keycard(&keycard).await.unwrap();
        assert_eq!(bouncer.issued(), 0);
    }

    #[test]
    fn test_save_planet_document() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(ManagerConfig::named("lab").dirs(dir.path(), dir.path()));
        manager
            .load_configuration_str(
                r#"
[[flow]]
name = "f"

[[flow.component]]
name = "prod"
type = "videotest-producer"
worker = "w1"
"#,
            )
            .unwrap();

        let path = manager.save_planet().unwrap();
        let saved = PlanetDocument::load(&path).unwrap();
        assert_eq!(saved.flows.len(), 1);
        assert_eq!(saved.flows[0].components[0].name, "prod");
    }
}
