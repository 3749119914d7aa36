// src/connection.rs

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which connections downloads may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[default]
    All,
    Unmetered,
    Metered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveConnection {
    pub metered: bool,
}

/// Reports the device's current network, `None` when offline.
pub trait NetworkConnectivity: Send + Sync {
    fn current(&self) -> Option<ActiveConnection>;
}

/// Connectivity probe for hosts without a platform network monitor.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysConnected;

impl NetworkConnectivity for AlwaysConnected {
    fn current(&self) -> Option<ActiveConnection> {
        Some(ActiveConnection { metered: false })
    }
}

/// Shared connection policy consulted before and between transfers.
pub struct ConnectionChecker {
    connectivity: Arc<dyn NetworkConnectivity>,
    allowed: RwLock<ConnectionType>,
}

impl ConnectionChecker {
    pub fn new(connectivity: Arc<dyn NetworkConnectivity>, allowed: ConnectionType) -> Self {
        Self {
            connectivity,
            allowed: RwLock::new(allowed),
        }
    }

    pub fn update_allowed_connection_type(&self, allowed: ConnectionType) {
        *self.allowed.write() = allowed;
    }

    pub fn allowed_connection_type(&self) -> ConnectionType {
        *self.allowed.read()
    }

    pub fn is_allowed_to_download(&self) -> bool {
        let Some(connection) = self.connectivity.current() else {
            return false;
        };
        match self.allowed_connection_type() {
            ConnectionType::All => true,
            ConnectionType::Unmetered => !connection.metered,
            ConnectionType::Metered => connection.metered,
        }
    }
}
