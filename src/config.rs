//! Per-slot configuration and its persisted form.
//!
//! One JSON file holds all four slots. Mutations go through the slot
//! manager, which validates, then replaces the file atomically (temp file +
//! rename) so a crash mid-write never leaves a torn config behind.

use std::fs;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Number of independent bridge slots.
pub const SLOT_COUNT: u8 = 4;

/// Default RTP port for every slot; the monitor flow uses port + 2.
pub const DEFAULT_RTP_PORT: u16 = 5004;

/// Port offset of the L16 monitor flow.
pub const MONITOR_PORT_OFFSET: u16 = 2;

/// Persistent configuration of one bridge slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub slot_id: u8,
    /// Discovered NDI source name; `None` means the slot is unassigned.
    pub ndi_source_name: Option<String>,
    /// Human label used in SDP `s=` and SAP announcements.
    pub aes67_stream_name: String,
    pub mcast_ip: Ipv4Addr,
    /// Even port; the monitor flow claims `mcast_port + 2`.
    pub mcast_port: u16,
    /// Assigned once per slot and persisted, so receivers see a stable
    /// stream identity across engine restarts.
    #[serde(default)]
    pub ssrc: u32,
}

impl SlotConfig {
    /// Factory defaults for a slot id in 1..=4.
    pub fn defaults(slot_id: u8) -> Self {
        Self {
            slot_id,
            ndi_source_name: None,
            aes67_stream_name: format!("AES67 Slot {slot_id}"),
            mcast_ip: Ipv4Addr::new(239, 69, 0, slot_id),
            mcast_port: DEFAULT_RTP_PORT,
            ssrc: rand::random(),
        }
    }

    /// Port of the L16 monitor flow.
    pub fn monitor_port(&self) -> u16 {
        self.mcast_port + MONITOR_PORT_OFFSET
    }

    /// Stream name announced on the wire. A blank label falls back to the
    /// NDI source name so the stream is never announced nameless.
    pub fn effective_stream_name(&self) -> &str {
        let label = self.aes67_stream_name.trim();
        if !label.is_empty() {
            return label;
        }
        self.ndi_source_name.as_deref().unwrap_or("")
    }

    /// Validate the fields a control client may set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_id < 1 || self.slot_id > SLOT_COUNT {
            return Err(ConfigError::UnknownSlot(self.slot_id));
        }
        if !self.mcast_ip.is_multicast() {
            return Err(ConfigError::InvalidMulticastAddr(self.mcast_ip));
        }
        // Even, non-reserved, and room for the monitor flow at +2.
        if self.mcast_port < 1024 || self.mcast_port > 65532 || self.mcast_port % 2 != 0 {
            return Err(ConfigError::PortOutOfRange(self.mcast_port));
        }
        Ok(())
    }
}

/// The persisted file: all four slot configs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub slots: Vec<SlotConfig>,
}

impl SystemConfig {
    /// Factory defaults: four unassigned slots on 239.69.0.1-4:5004.
    pub fn defaults() -> Self {
        Self {
            slots: (1..=SLOT_COUNT).map(SlotConfig::defaults).collect(),
        }
    }

    /// Load the config file, falling back to defaults when it does not
    /// exist yet. Unknown or missing slots are filled from defaults so the
    /// invariant of exactly four slots always holds.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::defaults()),
            Err(e) => return Err(e.into()),
        };
        let loaded: SystemConfig = serde_json::from_slice(&data)?;

        let mut config = Self::defaults();
        for slot in loaded.slots {
            if let Some(existing) = config
                .slots
                .iter_mut()
                .find(|s| s.slot_id == slot.slot_id)
            {
                *existing = slot;
            }
        }
        Ok(config)
    }

    /// Atomically replace the config file.
    pub fn persist(&self, path: &Path) -> Result<(), ConfigError> {
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(self)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
