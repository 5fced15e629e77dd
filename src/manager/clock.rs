//! Master clock coordination
//!
//! Components needing synchronisation name their flow's clock master in
//! their config. The master gets a port on its worker and serves the clock
//! there; slaves are pointed at it once it does.

use serde_json::Value;

use super::{Manager, ManagerInner};
use crate::rpc::message::{ClockInfo, ComponentCall};
use crate::rpc::RemoteRef;
use crate::state::Message;

enum ClockPlan {
    /// Ask the master to serve on `port`
    Provide { remote: RemoteRef, port: u16 },
    /// Point slaves at the master
    Distribute(Vec<(String, RemoteRef, ClockInfo)>),
    Nothing,
}

impl ManagerInner {
    /// Attached slaves of `master`, paired with its clock
    fn clock_slaves(&mut self, master: &str, clock: &ClockInfo) -> Vec<(String, RemoteRef, ClockInfo)> {
        let ids: Vec<String> = self
            .components
            .attached()
            .into_iter()
            .filter(|a| a.avatar_id != master)
            .filter(|a| {
                a.config
                    .as_ref()
                    .is_some_and(|c| c.clock_master.as_deref() == Some(master))
            })
            .map(|a| a.avatar_id.clone())
            .collect();

        ids.into_iter()
            .filter_map(|id| {
                let slave = self.components.get_mut(&id)?;
                slave.clock_waiting = false;
                Some((id, slave.remote.clone(), clock.clone()))
            })
            .collect()
    }

    fn plan_clock(&mut self, id: &str, session: u64) -> ClockPlan {
        let Some(avatar) = self.components.current(id, session).filter(|a| a.is_attached()) else {
            return ClockPlan::Nothing;
        };
        let Some(config) = avatar.config.as_ref() else {
            return ClockPlan::Nothing;
        };
        let Some(master) = config.clock_master.clone() else {
            return ClockPlan::Nothing;
        };

        if master != id {
            let clock = self
                .components
                .get(&master)
                .filter(|m| m.is_attached())
                .and_then(|m| m.clocking.clone());
            let remote = avatar.remote.clone();
            return match clock {
                Some(clock) => ClockPlan::Distribute(vec![(id.to_string(), remote, clock)]),
                None => {
                    tracing::debug!(component = id, master = %master, "Waiting for master clock");
                    if let Some(avatar) = self.components.current_mut(id, session) {
                        avatar.clock_waiting = true;
                    }
                    ClockPlan::Nothing
                }
            };
        }

        if let Some(clock) = avatar.clocking.clone() {
            return ClockPlan::Distribute(self.clock_slaves(id, &clock));
        }

        let remote = avatar.remote.clone();
        let Some(worker) = avatar.worker_name.clone() else {
            tracing::warn!(component = id, "Clock master has no worker, cannot reserve a port");
            return ClockPlan::Nothing;
        };
        match self.workers.reserve(&worker, 1) {
            Ok(ports) => {
                let port = ports.first().copied().unwrap_or(0);
                if let Some(avatar) = self.components.current_mut(id, session) {
                    avatar.reserved_ports.extend(ports.iter().copied().filter(|&p| p != 0));
                }
                ClockPlan::Provide { remote, port }
            }
            Err(e) => {
                tracing::warn!(component = id, worker = %worker, error = %e, "Cannot reserve clock port");
                if let Some(node) = self.planet.find_component(id) {
                    let message = Message::error(
                        "clock-port",
                        format!("No port left on worker {} for the master clock.", worker),
                    )
                    .with_debug(e.to_string());
                    let _ = self.planet.add_component_message(node, message);
                }
                ClockPlan::Nothing
            }
        }
    }

    /// Store the clock a master now serves; returns the slaves to point at it
    fn clock_provided(
        &mut self,
        id: &str,
        session: u64,
        clock: ClockInfo,
    ) -> Vec<(String, RemoteRef, ClockInfo)> {
        match self.components.current_mut(id, session) {
            Some(avatar) => avatar.clocking = Some(clock.clone()),
            None => return Vec::new(),
        }
        self.clock_slaves(id, &clock)
    }

    fn clock_failed(&mut self, id: &str, session: u64, port: u16) {
        let Some(avatar) = self.components.current_mut(id, session) else {
            return;
        };
        avatar.reserved_ports.retain(|&p| p != port);
        if let Some(worker) = avatar.worker_name.clone() {
            self.workers.release(&worker, &[port]);
        }
    }
}

impl Manager {
    /// Provide or hand out the master clock for a freshly attached component
    pub(crate) async fn coordinate_clock(&self, id: &str, session: u64) {
        let plan = self.lock().plan_clock(id, session);
        let slaves = match plan {
            ClockPlan::Nothing => return,
            ClockPlan::Distribute(slaves) => slaves,
            ClockPlan::Provide { remote, port } => {
                tracing::debug!(component = id, port = port, "Asking master to provide clock");
                let result = remote
                    .call_remote::<_, ClockInfo>(&ComponentCall::ProvideMasterClock { port })
                    .await;
                let clock = match result {
                    Ok(clock) => clock,
                    Err(e) => {
                        tracing::warn!(component = id, error = %e, "Master clock not provided");
                        self.lock().clock_failed(id, session, port);
                        return;
                    }
                };
                if port != 0 && clock.port != port {
                    tracing::warn!(
                        component = id,
                        reserved = port,
                        actual = clock.port,
                        "Master clock serves on a different port than reserved"
                    );
                }
                tracing::info!(component = id, host = %clock.host, port = clock.port, base_time = clock.base_time, "Master clock provided");
                let slaves = self.lock().clock_provided(id, session, clock);
                slaves
            }
        };
        self.distribute_clock(slaves).await;
    }

    async fn distribute_clock(&self, slaves: Vec<(String, RemoteRef, ClockInfo)>) {
        for (slave, remote, clock) in slaves {
            let call = ComponentCall::SetMasterClock {
                host: clock.host,
                port: clock.port,
                base_time: clock.base_time,
            };
            match remote.call_remote::<_, Value>(&call).await {
                Ok(_) => tracing::debug!(component = %slave, "Master clock set"),
                Err(e) if e.is_disconnect() => {}
                Err(e) => tracing::warn!(component = %slave, error = %e, "Failed to set master clock"),
            }
        }
    }
}
