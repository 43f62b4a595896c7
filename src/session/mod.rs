//! # Device Sessions
//!
//! A [`DeviceSession`] owns everything the network server knows about one
//! device between two joins: address, session keys, the 32-bit frame
//! counters, ADR settings and the single-flight request queue that
//! serializes processing for the device.
//!
//! ## Counter discipline
//!
//! Both counters and their dirty flag live behind one mutex. Persisted
//! counters may lag the live ones by up to the persist delta; on restore the
//! downlink counter is advanced by that delta so a restarted server never
//! reuses a downlink counter the device has already seen.

pub mod queue;
pub mod registry;
pub mod store;

pub use queue::RequestQueue;
pub use registry::DeviceRegistry;
pub use store::{InMemorySessionStore, JsonFileSessionStore, SessionSnapshot, SessionStore, SessionUpdate};

use crate::adr::AdrSettings;
use crate::config::{Activation, DeviceClass, DeviceProvision};
use crate::decoder::PayloadDecoder;
use crate::error::StoreError;
use crate::fcnt::FrameCounterStrategy;
use crate::lorawan::{AesKey, DevAddr, DevEui, DevNonce, JoinEui, SessionKeys, StationEui};
use crate::processing::ProcessingResult;
use crate::region::Region;
use bitflags::bitflags;
use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::Semaphore;

bitflags! {
    /// Non-counter session fields changed since the last save.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct DirtyFields: u8 {
        const DEV_ADDR = 0x01;
        const KEYS = 0x02;
        const DEV_NONCE = 0x04;
        const ADR = 0x08;
        const STATION = 0x10;
    }
}

#[derive(Debug, Default)]
struct Counters {
    up: u32,
    down: u32,
    saved_up: u32,
    saved_down: u32,
    /// No uplink accepted since the last join or reset
    fresh: bool,
    dirty: bool,
    /// (counter value, resubmits seen)
    resubmit: Option<(u32, u32)>,
}

#[derive(Debug, Default)]
struct SessionState {
    dev_addr: Option<DevAddr>,
    keys: Option<SessionKeys>,
    last_dev_nonce: Option<DevNonce>,
    adr: Option<AdrSettings>,
    preferred_station: Option<StationEui>,
    dirty: DirtyFields,
}

/// Result of a successful join, applied by [`DeviceSession::commit_join`].
#[derive(Debug, Clone)]
pub struct JoinedSession {
    pub dev_addr: DevAddr,
    pub keys: SessionKeys,
    pub dev_nonce: DevNonce,
    pub station: StationEui,
}

pub struct DeviceSession {
    dev_eui: DevEui,
    provision: DeviceProvision,
    region: RwLock<Arc<dyn Region>>,
    strategy: FrameCounterStrategy,
    decoder: Option<Arc<dyn PayloadDecoder>>,
    persist_delta: u32,
    counters: Mutex<Counters>,
    state: RwLock<SessionState>,
    persist_lock: Semaphore,
    queue: Arc<RequestQueue<ProcessingResult>>,
    connection_owner: AtomicBool,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("dev_eui", &self.dev_eui)
            .field("dev_addr", &self.dev_addr())
            .field("fcnt_up", &self.fcnt_up())
            .field("fcnt_down", &self.fcnt_down())
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl DeviceSession {
    pub fn new(
        provision: DeviceProvision,
        region: Arc<dyn Region>,
        strategy: FrameCounterStrategy,
        decoder: Option<Arc<dyn PayloadDecoder>>,
        persist_delta: u32,
    ) -> Self {
        let mut state = SessionState::default();
        if let Activation::Abp {
            dev_addr,
            nwk_s_key,
            app_s_key,
            ..
        } = &provision.activation
        {
            state.dev_addr = Some(*dev_addr);
            state.keys = Some(SessionKeys {
                nwk_s_key: nwk_s_key.clone(),
                app_s_key: app_s_key.clone(),
            });
        }

        Self {
            dev_eui: provision.dev_eui,
            queue: Arc::new(RequestQueue::new(provision.dev_eui.to_string())),
            provision,
            region: RwLock::new(region),
            strategy,
            decoder,
            persist_delta,
            counters: Mutex::new(Counters {
                fresh: true,
                ..Default::default()
            }),
            state: RwLock::new(state),
            persist_lock: Semaphore::new(1),
            connection_owner: AtomicBool::new(false),
        }
    }

    pub fn dev_eui(&self) -> DevEui {
        self.dev_eui
    }

    pub fn provision(&self) -> &DeviceProvision {
        &self.provision
    }

    /// Region the device was last heard in.
    pub fn region(&self) -> Arc<dyn Region> {
        Arc::clone(&*self.region.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn set_region(&self, region: Arc<dyn Region>) {
        *self.region.write().unwrap_or_else(PoisonError::into_inner) = region;
    }

    pub fn strategy(&self) -> &FrameCounterStrategy {
        &self.strategy
    }

    pub fn decoder(&self) -> Option<&Arc<dyn PayloadDecoder>> {
        self.decoder.as_ref()
    }

    pub fn queue(&self) -> &Arc<RequestQueue<ProcessingResult>> {
        &self.queue
    }

    pub fn class(&self) -> DeviceClass {
        self.provision.class
    }

    pub fn is_abp_relaxed(&self) -> bool {
        matches!(self.provision.activation, Activation::Abp { relaxed_fcnt: true, .. })
    }

    /// AppKey and JoinEUI for OTAA devices.
    pub fn join_credentials(&self) -> Option<(&AesKey, JoinEui)> {
        match &self.provision.activation {
            Activation::Otaa { app_key, join_eui } => Some((app_key, *join_eui)),
            Activation::Abp { .. } => None,
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dev_addr(&self) -> Option<DevAddr> {
        self.read_state().dev_addr
    }

    pub fn keys(&self) -> Option<SessionKeys> {
        self.read_state().keys.clone()
    }

    pub fn is_joined(&self) -> bool {
        let state = self.read_state();
        state.dev_addr.is_some() && state.keys.is_some()
    }

    pub fn last_dev_nonce(&self) -> Option<DevNonce> {
        self.read_state().last_dev_nonce
    }

    pub fn adr_settings(&self) -> Option<AdrSettings> {
        self.read_state().adr
    }

    pub fn set_adr_settings(&self, settings: AdrSettings) {
        let mut state = self.write_state();
        if state.adr != Some(settings) {
            state.adr = Some(settings);
            state.dirty |= DirtyFields::ADR;
        }
    }

    pub fn preferred_station(&self) -> Option<StationEui> {
        self.read_state().preferred_station
    }

    /// Remember the station that processed the latest uplink.
    pub fn set_preferred_station(&self, station: StationEui) {
        let mut state = self.write_state();
        if state.preferred_station != Some(station) {
            state.preferred_station = Some(station);
            state.dirty |= DirtyFields::STATION;
        }
    }

    pub fn fcnt_up(&self) -> u32 {
        self.counters().up
    }

    pub fn fcnt_down(&self) -> u32 {
        self.counters().down
    }

    /// True until the first uplink after a join or counter reset is accepted.
    pub fn counters_fresh(&self) -> bool {
        self.counters().fresh
    }

    /// Advance the downlink counter by one and return the new value.
    pub fn increment_down(&self) -> u32 {
        let mut c = self.counters();
        c.down = c.down.wrapping_add(1).max(1);
        c.dirty = true;
        c.down
    }

    /// Raise the downlink counter to `fcnt`; never lowers it.
    pub fn set_down(&self, fcnt: u32) {
        let mut c = self.counters();
        if fcnt > c.down {
            c.down = fcnt;
            c.dirty = true;
        }
    }

    /// Record an accepted uplink counter.
    pub fn set_up(&self, fcnt: u32) {
        let mut c = self.counters();
        if c.up != fcnt || c.fresh {
            c.up = fcnt;
            c.fresh = false;
            c.dirty = true;
        }
        if matches!(c.resubmit, Some((value, _)) if value != fcnt) {
            c.resubmit = None;
        }
    }

    /// Clear both counters, as after a device restart.
    pub fn reset(&self) {
        let mut c = self.counters();
        c.up = 0;
        c.down = 0;
        c.fresh = true;
        c.dirty = true;
        c.resubmit = None;
    }

    /// Count a resubmission of the confirmed uplink `fcnt`; false once more
    /// than `max` resubmits of the same counter were seen.
    pub fn register_confirmation_resubmit(&self, fcnt: u32, max: u32) -> bool {
        let mut c = self.counters();
        let count = match c.resubmit {
            Some((value, count)) if value == fcnt => count + 1,
            _ => 1,
        };
        c.resubmit = Some((fcnt, count));
        count <= max
    }

    pub fn has_pending_changes(&self) -> bool {
        self.counters().dirty || !self.read_state().dirty.is_empty()
    }

    pub fn claim_connection(&self) {
        self.connection_owner.store(true, Ordering::SeqCst);
    }

    /// Give up the store connection to the instance that won this uplink.
    pub fn release_connection(&self) {
        self.connection_owner.store(false, Ordering::SeqCst);
    }

    pub fn owns_connection(&self) -> bool {
        self.connection_owner.load(Ordering::SeqCst)
    }

    fn pending_update(&self, force: bool) -> (SessionUpdate, DirtyFields) {
        let mut update = SessionUpdate::default();
        {
            let c = self.counters();
            let unsaved = c.up.wrapping_sub(c.saved_up).max(c.down.wrapping_sub(c.saved_down));
            if c.dirty && (force || unsaved > self.persist_delta) {
                update.fcnt_up = Some(c.up);
                update.fcnt_down = Some(c.down);
            }
        }

        let state = self.read_state();
        let dirty = state.dirty;
        if dirty.contains(DirtyFields::DEV_ADDR) {
            update.dev_addr = state.dev_addr;
        }
        if dirty.contains(DirtyFields::KEYS) {
            if let Some(keys) = &state.keys {
                update.nwk_s_key = Some(keys.nwk_s_key.clone());
                update.app_s_key = Some(keys.app_s_key.clone());
            }
        }
        if dirty.contains(DirtyFields::DEV_NONCE) {
            update.last_dev_nonce = state.last_dev_nonce;
        }
        if dirty.contains(DirtyFields::ADR) {
            if let Some(adr) = state.adr {
                update.data_rate = Some(adr.data_rate);
                update.tx_power = Some(adr.tx_power);
                update.nb_rep = Some(adr.nb_rep);
            }
        }
        if dirty.contains(DirtyFields::STATION) {
            update.preferred_station = state.preferred_station;
        }
        (update, dirty)
    }

    fn mark_saved(&self, update: &SessionUpdate, written: DirtyFields) {
        {
            let mut c = self.counters();
            if let (Some(up), Some(down)) = (update.fcnt_up, update.fcnt_down) {
                c.saved_up = up;
                c.saved_down = down;
                c.dirty = c.up != up || c.down != down;
            }
        }
        self.write_state().dirty.remove(written);
    }

    /// Save changed fields; counters only when forced or when the unsaved
    /// delta exceeds the persist delta. Returns false if the save failed.
    pub async fn persist(&self, store: &dyn SessionStore, force: bool) -> bool {
        let Ok(_permit) = self.persist_lock.acquire().await else {
            return false;
        };

        let (update, written) = self.pending_update(force);
        if update.is_empty() {
            return true;
        }

        if let Err(e) = store.connect(self.dev_eui).await {
            warn!("{}: could not reach session store, changes kept in memory: {e}", self.dev_eui);
            return false;
        }

        match store.save(self.dev_eui, &update).await {
            Ok(()) => {
                self.mark_saved(&update, written);
                debug!(
                    "{}: session saved (counters: {})",
                    self.dev_eui,
                    if update.has_counters() { "yes" } else { "no" }
                );
                true
            }
            Err(e) => {
                warn!("{}: failed to save session: {e}", self.dev_eui);
                false
            }
        }
    }

    /// Persist a new join, then apply it in memory. On failure the previous
    /// session stays active.
    pub async fn commit_join(&self, store: &dyn SessionStore, joined: JoinedSession) -> Result<(), StoreError> {
        let _permit = self
            .persist_lock
            .acquire()
            .await
            .map_err(|e| StoreError::ConnectionUnavailable(e.to_string()))?;

        let update = SessionUpdate {
            dev_addr: Some(joined.dev_addr),
            nwk_s_key: Some(joined.keys.nwk_s_key.clone()),
            app_s_key: Some(joined.keys.app_s_key.clone()),
            fcnt_up: Some(0),
            fcnt_down: Some(0),
            last_dev_nonce: Some(joined.dev_nonce),
            preferred_station: Some(joined.station),
            ..Default::default()
        };

        store.connect(self.dev_eui).await?;
        store.save(self.dev_eui, &update).await?;

        {
            let mut c = self.counters();
            *c = Counters {
                fresh: true,
                ..Default::default()
            };
        }
        let mut state = self.write_state();
        state.dev_addr = Some(joined.dev_addr);
        state.keys = Some(joined.keys);
        state.last_dev_nonce = Some(joined.dev_nonce);
        state.preferred_station = Some(joined.station);
        state.adr = None;
        state.dirty = DirtyFields::empty();
        info!("{}: joined with DevAddr {}", self.dev_eui, joined.dev_addr);
        Ok(())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (up, down) = {
            let c = self.counters();
            (c.up, c.down)
        };
        let state = self.read_state();
        SessionSnapshot {
            dev_eui: self.dev_eui,
            dev_addr: state.dev_addr,
            nwk_s_key: state.keys.as_ref().map(|k| k.nwk_s_key.clone()),
            app_s_key: state.keys.as_ref().map(|k| k.app_s_key.clone()),
            fcnt_up: up,
            fcnt_down: down,
            last_dev_nonce: state.last_dev_nonce,
            data_rate: state.adr.map(|a| a.data_rate),
            tx_power: state.adr.map(|a| a.tx_power),
            nb_rep: state.adr.map(|a| a.nb_rep),
            preferred_station: state.preferred_station,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Load persisted state. The downlink counter is advanced by the
    /// persist delta since saves may have lagged behind.
    pub fn restore(&self, snapshot: &SessionSnapshot) {
        {
            let mut c = self.counters();
            c.up = snapshot.fcnt_up;
            c.saved_up = snapshot.fcnt_up;
            c.saved_down = snapshot.fcnt_down;
            c.down = snapshot.fcnt_down.saturating_add(self.persist_delta);
            c.fresh = snapshot.fcnt_up == 0 && snapshot.fcnt_down == 0;
            c.dirty = c.down != c.saved_down;
            c.resubmit = None;
        }

        let mut state = self.write_state();
        if snapshot.dev_addr.is_some() {
            state.dev_addr = snapshot.dev_addr;
        }
        if let (Some(nwk_s_key), Some(app_s_key)) = (&snapshot.nwk_s_key, &snapshot.app_s_key) {
            state.keys = Some(SessionKeys {
                nwk_s_key: nwk_s_key.clone(),
                app_s_key: app_s_key.clone(),
            });
        }
        state.last_dev_nonce = snapshot.last_dev_nonce;
        if let (Some(data_rate), Some(tx_power), Some(nb_rep)) = (snapshot.data_rate, snapshot.tx_power, snapshot.nb_rep) {
            state.adr = Some(AdrSettings {
                data_rate,
                tx_power,
                nb_rep,
            });
        }
        state.preferred_station = snapshot.preferred_station;
        state.dirty = DirtyFields::empty();
    }
}
