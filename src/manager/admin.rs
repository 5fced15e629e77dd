//! Admin heaven
//!
//! Admin clients see every planet change as a `stateChanged` notification.

use std::collections::HashMap;

use super::Manager;
use crate::error::{Error, Result};
use crate::rpc::message::AdminCall;
use crate::rpc::RemoteRef;
use crate::state::{ListenerId, ListenerTarget};

pub(crate) struct AdminAvatar {
    pub session: u64,
    pub remote: RemoteRef,
    listener: ListenerId,
}

#[derive(Default)]
pub(crate) struct AdminHeaven {
    admins: HashMap<String, AdminAvatar>,
}

impl AdminHeaven {
    pub fn len(&self) -> usize {
        self.admins.len()
    }
}

impl Manager {
    pub(crate) fn admin_login(&self, name: &str, session: u64, remote: RemoteRef) -> Result<()> {
        {
            let mut inner = self.lock();
            let inner = &mut *inner;
            if let Some(existing) = inner.admins.admins.get(name) {
                if existing.remote.is_connected() {
                    return Err(Error::AlreadyConnected(name.to_string()));
                }
                inner.planet.tree_mut().remove_listener(existing.listener);
            }

            let forward = remote.clone();
            let listener = inner
                .planet
                .tree_mut()
                .add_listener(ListenerTarget::All, None, move |event| {
                    let call = AdminCall::StateChanged {
                        event: event.clone(),
                    };
                    if let Err(e) = forward.notify(&call) {
                        tracing::trace!(error = %e, "Admin gone, state change dropped");
                    }
                });
            inner.admins.admins.insert(
                name.to_string(),
                AdminAvatar {
                    session,
                    remote: remote.clone(),
                    listener,
                },
            );
        }

        let manager = self.weak.clone();
        let admin = name.to_string();
        remote.on_disconnect(move || {
            if let Some(manager) = manager.upgrade() {
                manager.admin_detached(&admin, session);
            }
        });
        Ok(())
    }

    fn admin_detached(&self, name: &str, session: u64) {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let Some(admin) = inner.admins.admins.get(name).filter(|a| a.session == session) else {
            return;
        };
        let listener = admin.listener;
        inner.admins.admins.remove(name);
        inner.planet.tree_mut().remove_listener(listener);
        tracing::info!(admin = name, "Admin detached");
    }

    /// Number of connected admin clients
    pub fn admin_count(&self) -> usize {
        self.lock().admins.len()
    }
}
