//! Fake workers and components talking to a manager over loopback

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use super::Manager;
use crate::auth::Credentials;
use crate::config::document::ComponentConfig;
use crate::error::{Error, Result};
use crate::rpc::message::{ClockInfo, InterfaceTag, JobState};
use crate::rpc::LoopbackPeer;
use crate::state::Mood;

/// Peer address on `host`; unparsable hosts map to loopback
pub fn addr(host: &str) -> SocketAddr {
    let ip = host.parse().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    SocketAddr::new(ip, 40000)
}

pub fn job(mood: Mood, worker: &str) -> JobState {
    JobState {
        mood,
        pid: Some(4242),
        worker_name: Some(worker.to_string()),
        messages: vec![],
    }
}

/// Log a worker in from `host` and wait until it is attached
pub async fn worker(
    manager: &Arc<Manager>,
    name: &str,
    host: &str,
    feed_server_port: Option<u16>,
    ports: Vec<u16>,
) -> Result<LoopbackPeer> {
    let mut peer = LoopbackPeer::connect(
        &manager.portal(),
        addr(host),
        Credentials::anonymous(),
        InterfaceTag::Worker,
        name,
    )
    .await?;
    for _ in 0..3 {
        let call = peer.next_call().await.ok_or(Error::ConnectionLost)?;
        match call.method() {
            "getFeedServerPort" => call.respond(feed_server_port),
            "getPorts" => call.respond((ports.clone(), false)),
            "getComponents" => call.respond(Vec::<String>::new()),
            other => return Err(Error::Protocol(format!("unexpected worker call {}", other))),
        }
    }
    while !manager.is_worker_logged_in(name) {
        tokio::task::yield_now().await;
    }
    Ok(peer)
}

/// Log a component in from `host` and wait until it is attached
///
/// Feed and clock calls issued on attach are left for the caller.
pub async fn component(
    manager: &Arc<Manager>,
    config: &ComponentConfig,
    host: &str,
    job: JobState,
    clock: Option<ClockInfo>,
) -> Result<LoopbackPeer> {
    let mut peer = LoopbackPeer::connect(
        &manager.portal(),
        addr(host),
        Credentials::anonymous(),
        InterfaceTag::Component,
        &config.avatar_id,
    )
    .await?;
    for _ in 0..3 {
        let call = peer.next_call().await.ok_or(Error::ConnectionLost)?;
        match call.method() {
            "getConfig" => call.respond(config),
            "getState" => call.respond(&job),
            "getMasterClockInfo" => call.respond(&clock),
            other => return Err(Error::Protocol(format!("unexpected component call {}", other))),
        }
    }
    while !manager.is_component_attached(&config.avatar_id) {
        tokio::task::yield_now().await;
    }
    Ok(peer)
}

/// Answer every call with `true` until the peer is dropped
pub fn answer_all(mut peer: LoopbackPeer) {
    tokio::spawn(async move {
        while let Some(call) = peer.next_call().await {
            call.respond(true);
        }
    });
}

/// Swallow every call without answering
pub fn ignore_all(mut peer: LoopbackPeer) {
    tokio::spawn(async move { while peer.next_call().await.is_some() {} });
}
