//! Machine directory: the named hosts a topology places nodes on.
//!
//! Host declarations populate the directory; data channels between
//! machines are dialed lazily on first use (or eagerly at activation for
//! machines local senders will reach) and announced with `data_host` so
//! the receiving side can associate the connection.

use {
    crate::{
        cluster::ClusterState,
        error::{CommError, Result},
        peer::{ChannelKind, Peer},
        wire::Message,
    },
    log::{debug, info},
    std::sync::{Arc, Mutex},
};

/// One declared host.
#[derive(Debug)]
pub struct Machine {
    pub name: String,
    pub addr: String,
    pub nb_threads: usize,
    pub is_local: bool,
    data_peer: Mutex<Option<Arc<Peer>>>,
}

impl Machine {
    /// The peer carrying node traffic to this machine, if established.
    pub fn data_peer(&self) -> Option<Arc<Peer>> {
        match self.data_peer.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_data_peer(&self, peer: Arc<Peer>) {
        let mut slot = match self.data_peer.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(peer);
    }

    /// Drop the data channel, e.g. when the peer disconnects.
    pub fn clear_data_peer(&self) {
        let mut slot = match self.data_peer.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = None;
    }
}

/// Name-unique collection of declared machines.
#[derive(Debug, Default)]
pub struct MachineDirectory {
    machines: Mutex<Vec<Arc<Machine>>>,
}

impl MachineDirectory {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Machine>>> {
        match self.machines.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Declare a machine. Names are unique for the lifetime of a
    /// topology.
    pub fn declare(
        &self,
        name: &str,
        addr: &str,
        nb_threads: usize,
        is_local: bool,
    ) -> Result<Arc<Machine>> {
        let mut machines = self.lock();
        if machines.iter().any(|m| m.name == name) {
            return Err(CommError::DuplicateMachine(name.to_string()));
        }
        let machine = Arc::new(Machine {
            name: name.to_string(),
            addr: addr.to_string(),
            nb_threads,
            is_local,
            data_peer: Mutex::new(None),
        });
        machines.push(Arc::clone(&machine));
        Ok(machine)
    }

    pub fn find(&self, name: &str) -> Result<Arc<Machine>> {
        self.lock()
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| CommError::UnknownMachine(name.to_string()))
    }

    pub fn all(&self) -> Vec<Arc<Machine>> {
        self.lock().clone()
    }

    /// Forget every declaration. Called when a topology is replaced.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Ensure the data channel to `name` is up, dialing and announcing
    /// ourselves if needed. No-op for the local machine.
    pub fn connect(&self, name: &str, cluster: &Arc<ClusterState>) -> Result<()> {
        let machine = self.find(name)?;
        if machine.is_local || machine.data_peer().is_some() {
            return Ok(());
        }
        let config = cluster.config();
        let peer = Peer::connect(
            &machine.addr,
            ChannelKind::Data,
            config.connect_attempts,
            config.connect_retry_ms,
        )?;
        let local_name = cluster
            .local_machine()
            .unwrap_or_else(|| "?".to_string());
        peer.send_command("data_host", local_name.as_bytes())?;
        peer.spawn_reader(Arc::clone(cluster))?;
        machine.set_data_peer(Arc::clone(&peer));
        cluster.add_peer(peer);
        info!("data channel to {name} ({}) up", machine.addr);
        Ok(())
    }

    /// Associate an inbound data connection announced via `data_host`.
    pub fn attach_data_peer(&self, name: &str, peer: Arc<Peer>) -> Result<()> {
        let machine = self.find(name)?;
        machine.set_data_peer(peer);
        debug!("inbound data channel from {name}");
        Ok(())
    }

    /// Route one node message to `name`'s data channel.
    pub fn send_data(&self, name: &str, msg: &Message) -> Result<()> {
        let machine = self.find(name)?;
        let peer = machine
            .data_peer()
            .ok_or_else(|| CommError::MachineNotConnected(name.to_string()))?;
        peer.send(msg)
    }

    /// Drop any data-channel association with `peer`.
    pub fn forget_peer(&self, peer: &Arc<Peer>) {
        for machine in self.lock().iter() {
            if let Some(p) = machine.data_peer() {
                if Arc::ptr_eq(&p, peer) {
                    machine.clear_data_peer();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_and_find() {
        let dir = MachineDirectory::default();
        dir.declare("m0", "127.0.0.1:10001", 2, true).unwrap();
        let m = dir.find("m0").unwrap();
        assert_eq!(m.nb_threads, 2);
        assert!(m.is_local);
        assert!(dir.find("m1").is_err());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let dir = MachineDirectory::default();
        dir.declare("m0", "a:1", 1, false).unwrap();
        let err = dir.declare("m0", "b:2", 1, false).unwrap_err();
        assert!(matches!(err, CommError::DuplicateMachine(_)));
    }

    #[test]
    fn test_send_without_channel() {
        let dir = MachineDirectory::default();
        dir.declare("m0", "10.0.0.2:10001", 1, false).unwrap();
        let msg = Message::new(0);
        let err = dir.send_data("m0", &msg).unwrap_err();
        assert!(matches!(err, CommError::MachineNotConnected(_)));
    }

    #[test]
    fn test_clear() {
        let dir = MachineDirectory::default();
        dir.declare("m0", "a:1", 1, false).unwrap();
        dir.clear();
        assert!(dir.all().is_empty());
    }
}
