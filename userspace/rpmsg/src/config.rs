// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Static per-SoC layout of the rpmsg region
//! INTENT: Physical addresses, ring geometry and handshake tunables, loaded from TOML
//! DEPS: serde, toml, std::fs
//! TESTS: Parsing defaults; validation of geometry; file loading (tempfile)
//!
//! Layouts are fixed at build/configuration time and never negotiated with
//! the firmware, so everything is validated once at load.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::channel::{ChannelSpec, DispatchMode, TASK_ID_RANGE};
use crate::link::{LinkParams, RemoteCore};

/// Smallest accepted fifo.
pub const MIN_RING_SIZE: u32 = 64;

/// Errors produced while loading a layout.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read rpmsg layout {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// I/O detail.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse rpmsg layout {path}: {source}")]
    Parse {
        /// File path, or `<inline>`.
        path: PathBuf,
        /// Parser detail.
        #[source]
        source: toml::de::Error,
    },
    /// The layout parsed but is unusable.
    #[error("invalid rpmsg layout: {0}")]
    Invalid(String),
}

/// Whole layout.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Shared DRAM region.
    pub region: RegionConfig,
    /// One entry per co-processor.
    #[serde(default, rename = "link")]
    pub links: Vec<LinkConfig>,
}

/// Shared DRAM region holding the IPC block and every ring.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RegionConfig {
    /// Physical base address.
    pub phys_base: u32,
    /// Size in bytes.
    pub size: u32,
    /// Offset of the IPC block (sync flags, notify words).
    #[serde(default)]
    pub ipc_offset: u32,
}

impl RegionConfig {
    /// Physical address of the IPC block.
    pub fn ipc_base(&self) -> u32 {
        self.phys_base.saturating_add(self.ipc_offset)
    }

    fn contains(&self, phys: u32, len: u32) -> bool {
        phys.checked_sub(self.phys_base)
            .is_some_and(|off| u64::from(off) + u64::from(len) <= u64::from(self.size))
    }
}

fn default_polls() -> u32 {
    LinkParams::default().handshake_polls
}

fn default_interval_ms() -> u64 {
    1
}

/// One co-processor.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    /// Which core.
    pub core: RemoteCore,
    /// Declare connected without waiting for firmware.
    #[serde(default)]
    pub skip_handshake: bool,
    /// Guard the notify word with the hardware lock.
    #[serde(default)]
    pub hwlock: bool,
    /// Sync-flag polls before giving up.
    #[serde(default = "default_polls")]
    pub handshake_polls: u32,
    /// Milliseconds between polls.
    #[serde(default = "default_interval_ms")]
    pub handshake_interval_ms: u64,
    /// Channels of this link.
    #[serde(default, rename = "channel")]
    pub channels: Vec<ChannelConfig>,
}

impl LinkConfig {
    /// Handshake tunables.
    pub fn params(&self) -> LinkParams {
        LinkParams {
            skip_handshake: self.skip_handshake,
            handshake_polls: self.handshake_polls,
            handshake_interval: Duration::from_millis(self.handshake_interval_ms),
        }
    }
}

/// One channel: a TX ring and an RX ring.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    /// Name, unique within the link.
    pub name: String,
    /// TX ring header address.
    pub tx_header: u32,
    /// RX ring header address.
    pub rx_header: u32,
    /// TX fifo address.
    pub tx_fifo: u32,
    /// RX fifo address.
    pub rx_fifo: u32,
    /// Fifo size in bytes (both directions).
    pub size: u32,
    /// Override of the name-derived dispatch mode.
    #[serde(default)]
    pub dispatch: Option<DispatchMode>,
}

impl ChannelConfig {
    /// Runtime description of the channel.
    pub fn spec(&self) -> ChannelSpec {
        ChannelSpec { name: self.name.clone(), mode: self.dispatch, task_ids: TASK_ID_RANGE }
    }
}

impl Config {
    /// Parses and validates TOML text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Self::parse_at(text, Path::new("<inline>"))
    }

    fn parse_at(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::parse_at(&text, path)
    }

    /// Link entry for `core`.
    pub fn link(&self, core: RemoteCore) -> Option<&LinkConfig> {
        self.links.iter().find(|l| l.core == core)
    }

    /// Checks geometry: word-aligned sizes, everything inside the region,
    /// no overlapping rings, unique names and cores.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let region = &self.region;
        if region.size == 0 || region.phys_base.checked_add(region.size).is_none() {
            return invalid(format!(
                "region {:#x}+{:#x} is empty or wraps",
                region.phys_base, region.size
            ));
        }
        if region.ipc_offset >= region.size {
            return invalid(format!("IPC offset {:#x} outside region", region.ipc_offset));
        }
        let mut cores = BTreeSet::new();
        let mut spans: Vec<(u32, u32, String)> = Vec::new();
        for link in &self.links {
            if !cores.insert(link.core) {
                return invalid(format!("core {} configured twice", link.core));
            }
            let profile = link.core.profile();
            let mut words = vec![profile.sync_flag];
            words.extend(profile.notify.map(|n| n.word));
            for word in words {
                let addr = region.ipc_base().checked_add(word);
                if !addr.is_some_and(|addr| region.contains(addr, 4)) {
                    return invalid(format!("{}: IPC word at +{word:#x} outside region", link.core));
                }
            }
            let stride = profile.layout.stride();
            let mut names = BTreeSet::new();
            for ch in &link.channels {
                if !names.insert(ch.name.as_str()) {
                    return invalid(format!("{}: duplicate channel {}", link.core, ch.name));
                }
                if ch.size < MIN_RING_SIZE || ch.size % 4 != 0 {
                    return invalid(format!(
                        "{}: size {:#x} must be a multiple of 4 and >= {MIN_RING_SIZE}",
                        ch.name, ch.size
                    ));
                }
                for (what, phys, len) in [
                    ("tx header", ch.tx_header, stride),
                    ("rx header", ch.rx_header, stride),
                    ("tx fifo", ch.tx_fifo, ch.size),
                    ("rx fifo", ch.rx_fifo, ch.size),
                ] {
                    if phys % 4 != 0 || !region.contains(phys, len) {
                        return invalid(format!(
                            "{}: {what} {phys:#x}+{len:#x} misaligned or outside region",
                            ch.name
                        ));
                    }
                    spans.push((phys, phys + len, format!("{}/{what}", ch.name)));
                }
            }
        }
        spans.sort();
        for pair in spans.windows(2) {
            if pair[1].0 < pair[0].1 {
                return invalid(format!("{} overlaps {}", pair[0].2, pair[1].2));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const LAYOUT: &str = r#"
        [region]
        phys_base = 0x040ff000
        size = 0x1000

        [[link]]
        core = "audio"
        hwlock = true

        [[link.channel]]
        name = "audio-kernel"
        tx_header = 0x040ff400
        rx_header = 0x040ff420
        tx_fifo = 0x040ff800
        rx_fifo = 0x040ffa00
        size = 0x200

        [[link]]
        core = "hifi"
        skip_handshake = true
        handshake_polls = 10

        [[link.channel]]
        name = "hifi-intr"
        tx_header = 0x040ffc00
        rx_header = 0x040ffd00
        tx_fifo = 0x040ffe00
        rx_fifo = 0x040fff00
        size = 0x100
        dispatch = "by-task-id"
    "#;

    #[test]
    fn parses_defaults_and_overrides() {
        let config = Config::parse(LAYOUT).unwrap();
        let audio = config.link(RemoteCore::Audio).unwrap();
        assert_eq!(audio.params(), LinkParams::default());
        assert!(audio.hwlock);
        assert_eq!(audio.channels[0].spec().mode, None);
        let hifi = config.link(RemoteCore::Hifi).unwrap();
        assert!(hifi.params().skip_handshake);
        assert_eq!(hifi.params().handshake_polls, 10);
        assert_eq!(hifi.channels[0].dispatch, Some(DispatchMode::ByTaskId));
    }

    #[test]
    fn rejects_overlapping_rings() {
        let text = LAYOUT.replace("rx_fifo = 0x040ffa00", "rx_fifo = 0x040ff900");
        let err = Config::parse(&text).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("overlaps")));
    }

    #[test]
    fn rejects_unaligned_size_and_duplicate_core() {
        let text = LAYOUT.replace("size = 0x200", "size = 0x1fe");
        assert!(matches!(Config::parse(&text), Err(ConfigError::Invalid(_))));
        let text = LAYOUT.replace("core = \"hifi\"", "core = \"audio\"");
        let err = Config::parse(&text).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("twice")));
    }

    #[test]
    fn rejects_ipc_words_past_address_space() {
        let text = r#"
            [region]
            phys_base = 0xfffff000
            size = 0xfff
            ipc_offset = 0xfd0

            [[link]]
            core = "audio"
        "#;
        let err = Config::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("IPC word at +0x40")));
    }

    #[test]
    fn rejects_unknown_keys() {
        let text = LAYOUT.replace("hwlock = true", "hwlock = true\nflavour = 1");
        assert!(matches!(Config::parse(&text), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(LAYOUT.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.links.len(), 2);
        let missing = Config::load(file.path().with_extension("missing")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
