//! Worker port pools

use std::collections::BTreeSet;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("worker {0} is not logged in")]
    UnknownWorker(String),

    #[error("cannot reserve {wanted} ports, {available} free")]
    Exhausted { wanted: usize, available: usize },
}

/// Ports a worker lets components listen on
#[derive(Debug, Clone, Default)]
pub struct PortSet {
    free: BTreeSet<u16>,
    reserved: BTreeSet<u16>,
    random_allowed: bool,
}

impl PortSet {
    pub fn new(ports: impl IntoIterator<Item = u16>, random_allowed: bool) -> Self {
        Self {
            free: ports.into_iter().collect(),
            reserved: BTreeSet::new(),
            random_allowed,
        }
    }

    /// Take `n` ports out of the pool
    ///
    /// When the pool runs short and random ports are allowed the missing
    /// entries are `0`. Otherwise nothing is reserved.
    pub fn reserve(&mut self, n: usize) -> Result<Vec<u16>, PortError> {
        let available = self.free.len();
        if available < n && !self.random_allowed {
            return Err(PortError::Exhausted {
                wanted: n,
                available,
            });
        }

        let mut ports = Vec::with_capacity(n);
        while ports.len() < n {
            match self.free.pop_first() {
                Some(port) => {
                    self.reserved.insert(port);
                    ports.push(port);
                }
                None => ports.push(0),
            }
        }
        Ok(ports)
    }

    /// Return ports to the pool; unknown or already free ports are ignored
    pub fn release(&mut self, ports: &[u16]) {
        for &port in ports {
            if port == 0 {
                continue;
            }
            if self.reserved.remove(&port) {
                self.free.insert(port);
            } else {
                tracing::warn!(port = port, "Releasing port that was not reserved");
            }
        }
    }

    /// Mark a port a running component already listens on as reserved
    ///
    /// Returns false if the port is not free in this pool.
    pub fn claim(&mut self, port: u16) -> bool {
        if !self.free.remove(&port) {
            return false;
        }
        self.reserved.insert(port);
        true
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.contains(&port)
    }

    pub fn random_allowed(&self) -> bool {
        self.random_allowed
    }
}
