//! # Session Persistence
//!
//! A [`SessionStore`] receives partial [`SessionUpdate`]s carrying only the
//! fields that changed and merges them into a per-device [`SessionSnapshot`].
//! Saves are best effort: the pipeline logs failed saves and carries on.

use crate::error::StoreError;
use crate::lorawan::{AesKey, DataRate, DevAddr, DevEui, DevNonce, StationEui};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Last persisted state of a device session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub dev_eui: DevEui,
    pub dev_addr: Option<DevAddr>,
    pub nwk_s_key: Option<AesKey>,
    pub app_s_key: Option<AesKey>,
    pub fcnt_up: u32,
    pub fcnt_down: u32,
    pub last_dev_nonce: Option<DevNonce>,
    pub data_rate: Option<DataRate>,
    pub tx_power: Option<u8>,
    pub nb_rep: Option<u8>,
    pub preferred_station: Option<StationEui>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn empty(dev_eui: DevEui) -> Self {
        Self {
            dev_eui,
            dev_addr: None,
            nwk_s_key: None,
            app_s_key: None,
            fcnt_up: 0,
            fcnt_down: 0,
            last_dev_nonce: None,
            data_rate: None,
            tx_power: None,
            nb_rep: None,
            preferred_station: None,
            updated_at: Utc::now(),
        }
    }

    /// Apply the fields present in `update`.
    pub fn merge(&mut self, update: &SessionUpdate) {
        if let Some(addr) = update.dev_addr {
            self.dev_addr = Some(addr);
        }
        if let Some(key) = &update.nwk_s_key {
            self.nwk_s_key = Some(key.clone());
        }
        if let Some(key) = &update.app_s_key {
            self.app_s_key = Some(key.clone());
        }
        if let Some(fcnt) = update.fcnt_up {
            self.fcnt_up = fcnt;
        }
        if let Some(fcnt) = update.fcnt_down {
            self.fcnt_down = fcnt;
        }
        if let Some(nonce) = update.last_dev_nonce {
            self.last_dev_nonce = Some(nonce);
        }
        if let Some(dr) = update.data_rate {
            self.data_rate = Some(dr);
        }
        if let Some(tx) = update.tx_power {
            self.tx_power = Some(tx);
        }
        if let Some(nb) = update.nb_rep {
            self.nb_rep = Some(nb);
        }
        if let Some(station) = update.preferred_station {
            self.preferred_station = Some(station);
        }
        self.updated_at = Utc::now();
    }
}

/// Changed session fields; `None` means unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub dev_addr: Option<DevAddr>,
    pub nwk_s_key: Option<AesKey>,
    pub app_s_key: Option<AesKey>,
    pub fcnt_up: Option<u32>,
    pub fcnt_down: Option<u32>,
    pub last_dev_nonce: Option<DevNonce>,
    pub data_rate: Option<DataRate>,
    pub tx_power: Option<u8>,
    pub nb_rep: Option<u8>,
    pub preferred_station: Option<StationEui>,
}

impl SessionUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn has_counters(&self) -> bool {
        self.fcnt_up.is_some() || self.fcnt_down.is_some()
    }
}

/// Backing store for device sessions.
#[async_trait]
pub trait SessionStore: Send + Sync + fmt::Debug {
    /// Make sure a connection for `dev_eui` is usable, reconnecting if needed.
    async fn connect(&self, dev_eui: DevEui) -> Result<(), StoreError>;

    async fn save(&self, dev_eui: DevEui, update: &SessionUpdate) -> Result<(), StoreError>;

    async fn load(&self, dev_eui: DevEui) -> Result<Option<SessionSnapshot>, StoreError>;
}

/// Process-local store used by tests and the replay tool.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    records: Mutex<HashMap<DevEui, SessionSnapshot>>,
    unavailable: AtomicBool,
    saves: AtomicUsize,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `connect` fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn get(&self, dev_eui: DevEui) -> Option<SessionSnapshot> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&dev_eui)
            .cloned()
    }

    /// Seed a record, as if saved by an earlier run.
    pub fn insert(&self, snapshot: SessionSnapshot) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snapshot.dev_eui, snapshot);
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn connect(&self, dev_eui: DevEui) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionUnavailable(format!("store offline for {dev_eui}")));
        }
        Ok(())
    }

    async fn save(&self, dev_eui: DevEui, update: &SessionUpdate) -> Result<(), StoreError> {
        self.connect(dev_eui).await?;
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .entry(dev_eui)
            .or_insert_with(|| SessionSnapshot::empty(dev_eui))
            .merge(update);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, dev_eui: DevEui) -> Result<Option<SessionSnapshot>, StoreError> {
        Ok(self.get(dev_eui))
    }
}

/// One pretty-printed JSON document per device under a directory.
#[derive(Debug)]
pub struct JsonFileSessionStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileSessionStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn path_for(&self, dev_eui: DevEui) -> PathBuf {
        self.dir.join(format!("{dev_eui}.json"))
    }

    fn read(&self, dev_eui: DevEui) -> Result<Option<SessionSnapshot>, StoreError> {
        let path = self.path_for(dev_eui);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }
}

#[async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn connect(&self, _dev_eui: DevEui) -> Result<(), StoreError> {
        if self.dir.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)
            .map_err(|e| StoreError::ConnectionUnavailable(format!("{}: {e}", self.dir.display())))
    }

    async fn save(&self, dev_eui: DevEui, update: &SessionUpdate) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.read(dev_eui)?.unwrap_or_else(|| SessionSnapshot::empty(dev_eui));
        snapshot.merge(update);

        let json = serde_json::to_string_pretty(&snapshot)?;
        let path = self.path_for(dev_eui);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        debug!("{dev_eui}: session saved to {}", path.display());
        Ok(())
    }

    async fn load(&self, dev_eui: DevEui) -> Result<Option<SessionSnapshot>, StoreError> {
        self.read(dev_eui)
    }
}
