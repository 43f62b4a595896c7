//! Injected device tables: sessions by DevEUI and DevEUIs by DevAddr.
//!
//! Several devices may share a DevAddr (addresses are not unique across
//! NetIDs or after re-joins), so an address maps to a candidate list that the
//! dispatcher narrows down by MIC.

use super::DeviceSession;
use crate::error::LnsError;
use crate::lorawan::{DevAddr, DevEui};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Default)]
struct Tables {
    by_eui: HashMap<DevEui, Arc<DeviceSession>>,
    by_addr: HashMap<DevAddr, Vec<DevEui>>,
}

/// Concurrent device map owned by the server instance.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    tables: RwLock<Tables>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<DeviceSession>) -> Result<(), LnsError> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let dev_eui = session.dev_eui();
        if tables.by_eui.contains_key(&dev_eui) {
            return Err(LnsError::DuplicateDevice(dev_eui.to_string()));
        }
        if let Some(addr) = session.dev_addr() {
            tables.by_addr.entry(addr).or_default().push(dev_eui);
        }
        tables.by_eui.insert(dev_eui, session);
        Ok(())
    }

    pub fn by_dev_eui(&self, dev_eui: DevEui) -> Option<Arc<DeviceSession>> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_eui
            .get(&dev_eui)
            .cloned()
    }

    /// All sessions currently using `dev_addr`.
    pub fn by_dev_addr(&self, dev_addr: DevAddr) -> Vec<Arc<DeviceSession>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .by_addr
            .get(&dev_addr)
            .map(|euis| euis.iter().filter_map(|eui| tables.by_eui.get(eui).cloned()).collect())
            .unwrap_or_default()
    }

    /// Move `dev_eui` from its old address index to `new_addr` after a join.
    pub fn reassign_dev_addr(&self, dev_eui: DevEui, old_addr: Option<DevAddr>, new_addr: DevAddr) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = old_addr {
            if let Some(euis) = tables.by_addr.get_mut(&old) {
                euis.retain(|eui| *eui != dev_eui);
                if euis.is_empty() {
                    tables.by_addr.remove(&old);
                }
            }
        }
        let euis = tables.by_addr.entry(new_addr).or_default();
        if !euis.contains(&dev_eui) {
            euis.push(dev_eui);
        }
    }

    pub fn remove(&self, dev_eui: DevEui) -> Option<Arc<DeviceSession>> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let session = tables.by_eui.remove(&dev_eui)?;
        tables.by_addr.retain(|_, euis| {
            euis.retain(|eui| *eui != dev_eui);
            !euis.is_empty()
        });
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.tables.read().unwrap_or_else(PoisonError::into_inner).by_eui.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sessions(&self) -> Vec<Arc<DeviceSession>> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_eui
            .values()
            .cloned()
            .collect()
    }
}
