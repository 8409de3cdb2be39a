//! Slot manager: owns the four slot engines, the persisted configuration
//! and the SAP announcer, and exposes the control surface the HTTP
//! collaborator consumes.
//!
//! All state changes serialize under one mutex. The manager has two modes:
//! edit (every slot Idle, writes accepted) and running (any slot not Idle,
//! writes rejected with `locked`).

use std::env;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::config::{SlotConfig, SystemConfig, SLOT_COUNT};
use crate::error::ConfigError;
use crate::net;
use crate::pipeline::{EngineTuning, SlotEngine, SlotState, SlotStatus};
use crate::sap::{self, PtpClock, SapAnnouncer, SapOptions, SdpFlavor};
use crate::source::SourceSystem;

/// Aggregate status of the bridge, shaped for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub running: bool,
    pub message: String,
}

/// Deployment knobs for the manager and its announcer.
#[derive(Debug, Clone, Default)]
pub struct BridgeOptions {
    pub sap: SapOptions,
    pub tuning: EngineTuning,
}

struct Inner {
    slots: Vec<SlotConfig>,
    /// Index is `slot_id - 1`; at most one engine per slot id.
    engines: Vec<Option<SlotEngine>>,
}

impl Inner {
    fn slot_index(&self, slot_id: u8) -> Result<usize, ConfigError> {
        if slot_id < 1 || slot_id > SLOT_COUNT {
            return Err(ConfigError::UnknownSlot(slot_id));
        }
        Ok(slot_id as usize - 1)
    }

    fn edit_mode(&self) -> bool {
        self.engines
            .iter()
            .all(|engine| engine.as_ref().map_or(true, SlotEngine::is_idle))
    }

    fn live_configs(&self) -> Vec<SlotConfig> {
        self.engines
            .iter()
            .enumerate()
            .filter_map(|(idx, engine)| {
                let engine = engine.as_ref()?;
                (engine.state() == SlotState::Live).then(|| self.slots[idx].clone())
            })
            .collect()
    }
}

/// The single owned control-state value of the process: configs, engines
/// and announcer, injected into collaborators by the entry point.
pub struct SlotManager {
    inner: Arc<Mutex<Inner>>,
    system: Arc<dyn SourceSystem>,
    config_path: PathBuf,
    options: BridgeOptions,
    _announcer: SapAnnouncer,
}

impl SlotManager {
    /// Load (or default) the persisted configuration and start the SAP
    /// announcer. No slot runs until `start_all`.
    pub fn new(
        config_path: impl Into<PathBuf>,
        system: Arc<dyn SourceSystem>,
        options: BridgeOptions,
    ) -> Result<Self, ConfigError> {
        let config_path = config_path.into();
        let config = SystemConfig::load_or_default(&config_path)?;
        let inner = Arc::new(Mutex::new(Inner {
            slots: config.slots,
            engines: (0..SLOT_COUNT).map(|_| None).collect(),
        }));

        let snapshot_inner = inner.clone();
        let announcer = SapAnnouncer::spawn(
            Box::new(move || snapshot_inner.lock().live_configs()),
            options.sap.clone(),
        );

        Ok(Self {
            inner,
            system,
            config_path,
            options,
            _announcer: announcer,
        })
    }

    /// Names of discoverable NDI sources.
    pub fn list_sources(&self) -> Vec<String> {
        self.system.list_sources()
    }

    /// Re-run discovery, then list.
    pub fn refresh_sources(&self) -> Vec<String> {
        self.system.refresh_sources()
    }

    pub fn list_configs(&self) -> Vec<SlotConfig> {
        self.inner.lock().slots.clone()
    }

    pub fn get_config(&self, slot_id: u8) -> Result<SlotConfig, ConfigError> {
        let inner = self.inner.lock();
        let idx = inner.slot_index(slot_id)?;
        Ok(inner.slots[idx].clone())
    }

    /// Replace one slot's configuration. Rejected with `Locked` in running
    /// mode; the slot's ssrc is server-assigned and preserved. Persists
    /// atomically before the new value becomes visible as accepted.
    pub fn set_config(&self, cfg: SlotConfig) -> Result<SlotConfig, ConfigError> {
        let mut inner = self.inner.lock();
        if !inner.edit_mode() {
            return Err(ConfigError::Locked);
        }
        let idx = inner.slot_index(cfg.slot_id)?;
        cfg.validate()?;

        let previous = inner.slots[idx].clone();
        let mut updated = cfg;
        updated.ssrc = previous.ssrc;
        inner.slots[idx] = updated.clone();

        let persisted = SystemConfig {
            slots: inner.slots.clone(),
        }
        .persist(&self.config_path);
        if let Err(e) = persisted {
            inner.slots[idx] = previous;
            return Err(e);
        }

        info!(slot = updated.slot_id, "slot config updated");
        Ok(updated)
    }

    /// Start every slot with an assigned source. Slots already running are
    /// left alone. Returns the aggregate control status.
    pub fn start_all(&self) -> BridgeStatus {
        let mut inner = self.inner.lock();

        // A configured-but-missing interface is a startup error for every
        // slot; nothing gets partially started on a mistyped NIC name.
        let iface_env = env::var(net::MCAST_IFACE_ENV)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let iface = net::pick_multicast_iface();
        let iface_missing = iface_env.is_some() && iface.is_none();
        let iface_ip = iface.map(|i| i.ip);

        let mut started = 0usize;
        for idx in 0..SLOT_COUNT as usize {
            let cfg = inner.slots[idx].clone();
            if cfg.ndi_source_name.is_none() {
                continue;
            }
            if let Some(engine) = &inner.engines[idx] {
                if !engine.is_idle() {
                    started += 1;
                    continue;
                }
            }
            let engine = if iface_missing {
                SlotEngine::failed(cfg.slot_id, "interface not found")
            } else {
                SlotEngine::start(&cfg, self.system.as_ref(), iface_ip, &self.options.tuning)
            };
            inner.engines[idx] = Some(engine);
            started += 1;
        }

        if started == 0 {
            return BridgeStatus {
                running: false,
                message: "no slots configured".into(),
            };
        }
        BridgeStatus {
            running: true,
            message: "Live".into(),
        }
    }

    /// Stop every non-Idle slot and drop its engine. Idempotent.
    pub fn stop_all(&self) -> BridgeStatus {
        let mut inner = self.inner.lock();
        for engine in inner.engines.iter_mut() {
            if let Some(mut engine) = engine.take() {
                engine.stop();
            }
        }
        BridgeStatus {
            running: false,
            message: "Offline".into(),
        }
    }

    /// The status pill: Live when any slot is Live, otherwise the first
    /// non-empty failure message, otherwise Offline.
    pub fn status(&self) -> BridgeStatus {
        let inner = self.inner.lock();
        let statuses: Vec<SlotStatus> = inner
            .engines
            .iter()
            .filter_map(|e| e.as_ref().map(SlotEngine::status))
            .collect();

        if statuses.iter().any(|s| s.state == SlotState::Live) {
            return BridgeStatus {
                running: true,
                message: "Live".into(),
            };
        }
        if let Some(message) = statuses
            .iter()
            .map(|s| s.message.as_str())
            .find(|m| !m.is_empty())
        {
            let running = statuses.iter().any(|s| s.state != SlotState::Idle);
            return BridgeStatus {
                running,
                message: message.to_string(),
            };
        }
        if statuses.iter().any(|s| s.state != SlotState::Idle) {
            return BridgeStatus {
                running: true,
                message: "Starting".into(),
            };
        }
        BridgeStatus {
            running: false,
            message: "Offline".into(),
        }
    }

    /// Slot ids currently Live, ascending.
    pub fn active_slots(&self) -> Vec<u8> {
        let inner = self.inner.lock();
        let mut ids: Vec<u8> = inner
            .engines
            .iter()
            .flatten()
            .filter(|e| e.state() == SlotState::Live)
            .map(SlotEngine::slot_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// SDP text for a Live slot, `None` otherwise (the collaborator maps
    /// that to 404).
    pub fn slot_sdp(&self, slot_id: u8, flavor: SdpFlavor) -> Option<String> {
        let inner = self.inner.lock();
        let idx = inner.slot_index(slot_id).ok()?;
        let live = inner.engines[idx]
            .as_ref()
            .is_some_and(|e| e.state() == SlotState::Live);
        if !live {
            return None;
        }
        let cfg = inner.slots[idx].clone();
        drop(inner);

        let origin = net::pick_multicast_iface()
            .map(|i| i.ip)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        Some(sap::build_sdp(&cfg, flavor, origin, &PtpClock::from_env()))
    }

    /// Full counter snapshot for one slot; Idle slots report zeros.
    pub fn debug_slot(&self, slot_id: u8) -> Result<SlotStatus, ConfigError> {
        let inner = self.inner.lock();
        let idx = inner.slot_index(slot_id)?;
        Ok(inner.engines[idx]
            .as_ref()
            .map(SlotEngine::status)
            .unwrap_or_else(SlotStatus::idle))
    }
}

impl Drop for SlotManager {
    fn drop(&mut self) {
        // Engines stop first so the announcer's shutdown pass withdraws
        // every session it announced.
        self.stop_all();
    }
}
