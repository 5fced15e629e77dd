//! Typed remote calls
//!
//! One enum per call direction and peer kind. A call body on the wire is
//! `{"method": "eatFrom", "args": {...}}`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth::Keycard;
use crate::state::{Message, Mood, StateEvent};

/// Interface a peer asks for at login; selects the heaven it lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceTag {
    #[serde(rename = "worker-medium")]
    Worker,
    #[serde(rename = "component-medium")]
    Component,
    #[serde(rename = "admin-medium")]
    Admin,
}

impl fmt::Display for InterfaceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InterfaceTag::Worker => "worker-medium",
            InterfaceTag::Component => "component-medium",
            InterfaceTag::Admin => "admin-medium",
        })
    }
}

/// Calls the manager makes on a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "args",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum WorkerCall {
    /// Returns `Option<u16>`
    GetFeedServerPort,
    /// Returns `(Vec<u16>, bool)`: the port pool and whether random ports are allowed
    GetPorts,
    /// Spawn a component job; returns once the worker has started it
    Create {
        avatar_id: String,
        #[serde(rename = "type")]
        component_type: String,
        module: String,
        function: String,
        nice: i32,
        config: Value,
    },
    /// Returns the avatar ids of jobs already running
    GetComponents,
    Ping,
    WriteFluDebugMarker { level: u8, marker: String },
}

/// Calls the manager makes on a component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "args",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ComponentCall {
    /// Returns the running [`ComponentConfig`](crate::config::ComponentConfig)
    GetConfig,
    /// Returns a [`JobState`]
    GetState,
    /// Returns `Option<ClockInfo>`
    GetMasterClockInfo,
    /// Returns the [`ClockInfo`] the component now serves
    ProvideMasterClock { port: u16 },
    SetMasterClock {
        host: String,
        port: u16,
        base_time: u64,
    },
    EatFrom {
        eater_alias: String,
        full_feed_id: String,
        host: String,
        port: u16,
    },
    FeedTo {
        feeder_name: String,
        full_feed_id: String,
        host: String,
        port: u16,
    },
    Stop,
    Ping,
    /// Reload the component's code in place
    ReloadComponent,
    /// Bouncer and streamer components: drop the holder of a keycard
    ExpireKeycard { keycard_id: String },
    /// Bouncer components: returns `Option<Keycard>`
    Authenticate { keycard: Keycard },
    KeepAlive { issuer_name: String, ttl: f64 },
    RemoveKeycardId { keycard_id: String },
    /// Bouncer components: returns `Vec<String>`
    GetKeycardClasses,
    WriteFluDebugMarker { level: u8, marker: String },
}

/// Calls the manager makes on an admin client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "args",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum AdminCall {
    StateChanged { event: StateEvent },
    Ping,
}

/// Calls peers make on the manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "args",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ManagerRequest {
    // any peer
    Ping,
    GetBundleSums {
        #[serde(default)]
        bundle_name: Option<String>,
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default)]
        module_name: Option<String>,
    },
    GetBundleZips {
        names: Vec<String>,
    },
    Authenticate {
        #[serde(default)]
        bouncer_name: Option<String>,
        keycard: Keycard,
    },
    KeepAlive {
        #[serde(default)]
        bouncer_name: Option<String>,
        issuer_name: String,
        ttl: f64,
    },
    GetKeycardClasses {
        #[serde(default)]
        bouncer_name: Option<String>,
    },
    WriteFluDebugMarker {
        level: u8,
        marker: String,
    },

    // components
    CleanShutdown,
    RemoveKeycardId {
        #[serde(default)]
        bouncer_name: Option<String>,
        keycard_id: String,
    },
    ExpireKeycard {
        requester_id: String,
        keycard_id: String,
    },
    SetMood {
        mood: Mood,
    },
    AddMessage {
        message: Message,
    },
    RemoveMessage {
        id: String,
    },

    // admins
    GetPlanetState,
    LoadConfiguration {
        document: String,
    },
    LoadComponent {
        #[serde(rename = "type")]
        component_type: String,
        parent: String,
        name: String,
        #[serde(default)]
        worker: Option<String>,
        #[serde(default)]
        properties: Map<String, Value>,
        #[serde(default)]
        eaters: Vec<(String, String)>,
        #[serde(default)]
        needs_synchronisation: bool,
    },
    ComponentStart {
        component_id: String,
    },
    ComponentStop {
        component_id: String,
    },
    DeleteComponent {
        component_id: String,
    },
    DeleteFlow {
        name: String,
    },
    /// Forward a call to a running component and return its reply
    CallComponentRemote {
        component_id: String,
        method: String,
        #[serde(default)]
        args: Value,
    },
    ReloadComponent {
        component_id: String,
    },
}

impl ManagerRequest {
    /// Method name as it appears on the wire
    pub fn method(&self) -> &'static str {
        match self {
            ManagerRequest::Ping => "ping",
            ManagerRequest::GetBundleSums { .. } => "getBundleSums",
            ManagerRequest::GetBundleZips { .. } => "getBundleZips",
            ManagerRequest::Authenticate { .. } => "authenticate",
            ManagerRequest::KeepAlive { .. } => "keepAlive",
            ManagerRequest::GetKeycardClasses { .. } => "getKeycardClasses",
            ManagerRequest::WriteFluDebugMarker { .. } => "writeFluDebugMarker",
            ManagerRequest::CleanShutdown => "cleanShutdown",
            ManagerRequest::RemoveKeycardId { .. } => "removeKeycardId",
            ManagerRequest::ExpireKeycard { .. } => "expireKeycard",
            ManagerRequest::SetMood { .. } => "setMood",
            ManagerRequest::AddMessage { .. } => "addMessage",
            ManagerRequest::RemoveMessage { .. } => "removeMessage",
            ManagerRequest::GetPlanetState => "getPlanetState",
            ManagerRequest::LoadConfiguration { .. } => "loadConfiguration",
            ManagerRequest::LoadComponent { .. } => "loadComponent",
            ManagerRequest::ComponentStart { .. } => "componentStart",
            ManagerRequest::ComponentStop { .. } => "componentStop",
            ManagerRequest::DeleteComponent { .. } => "deleteComponent",
            ManagerRequest::DeleteFlow { .. } => "deleteFlow",
            ManagerRequest::CallComponentRemote { .. } => "callComponentRemote",
            ManagerRequest::ReloadComponent { .. } => "reloadComponent",
        }
    }

    /// Whether a peer logged in with `interface` may make this call
    pub fn allowed_for(&self, interface: InterfaceTag) -> bool {
        use ManagerRequest::*;
        match self {
            Ping
            | GetBundleSums { .. }
            | GetBundleZips { .. }
            | Authenticate { .. }
            | KeepAlive { .. }
            | GetKeycardClasses { .. }
            | WriteFluDebugMarker { .. } => true,
            CleanShutdown
            | RemoveKeycardId { .. }
            | ExpireKeycard { .. }
            | SetMood { .. }
            | AddMessage { .. }
            | RemoveMessage { .. } => interface == InterfaceTag::Component,
            GetPlanetState
            | LoadConfiguration { .. }
            | LoadComponent { .. }
            | ComponentStart { .. }
            | ComponentStop { .. }
            | DeleteComponent { .. }
            | DeleteFlow { .. }
            | CallComponentRemote { .. }
            | ReloadComponent { .. } => interface == InterfaceTag::Admin,
        }
    }
}

/// Master clock coordinates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockInfo {
    pub host: String,
    pub port: u16,
    pub base_time: u64,
}

/// A component's own view of its job, fetched on login
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub mood: Mood,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub worker_name: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Method name of an encoded call body, for logging
pub fn method_of(body: &Value) -> &str {
    body.get("method").and_then(Value::as_str).unwrap_or("?")
}
