/*!
    Engine configuration.
*/

use std::time::Duration;

use serde::{Deserialize, Serialize};

use media_types::{Error, Result};

/// Default size of the chunks the ingestion thread reads from the source.
pub const DEFAULT_CHUNK_SIZE: usize = 16384;

/**
    Topology of the demux graph behind the engine.

    The kind decides when stream discovery is considered complete, and which
    of the two connection paths it supports.
*/
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GraphKind {
    /// Autoplugging demuxer and decoder; streams appear dynamically.
    #[default]
    Decodebin,
    /// AVI demuxer; streams appear dynamically.
    Avi,
    /// MPEG audio parser with a single static output.
    MpegAudio,
    /// WAVE parser with a single static output.
    Wave,
    /// Raw audio or video converter; push mode with exactly one stream.
    RawConverter,
}

impl GraphKind {
    /**
        Returns true if outputs are announced dynamically and discovery ends
        with an explicit "no more pads" signal.
    */
    pub const fn has_dynamic_pads(self) -> bool {
        matches!(self, Self::Decodebin | Self::Avi)
    }

    /**
        Returns true if raw outputs get normalization stages before the sink.
    */
    pub const fn inserts_post_processing(self) -> bool {
        matches!(self, Self::Decodebin | Self::Avi)
    }

    /**
        Returns true if the kind can only run against an unseekable source.
    */
    pub const fn requires_unseekable(self) -> bool {
        matches!(self, Self::RawConverter)
    }
}

/**
    Queue limits of the graph's internal buffering.

    `None` leaves the graph's own default in place.
*/
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueLimits {
    /// Maximum number of queued buffers.
    pub max_buffers: Option<u32>,
    /// Maximum number of queued bytes.
    pub max_bytes: Option<u32>,
    /// Maximum amount of queued media time.
    pub max_time: Option<Duration>,
}

impl QueueLimits {
    /**
        Limits that never cause the graph to block on its own queues.
    */
    pub const fn unlimited() -> Self {
        Self {
            max_buffers: Some(u32::MAX),
            max_bytes: Some(u32::MAX),
            max_time: Some(Duration::MAX),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        *self == Self::unlimited()
    }
}

/**
    Configuration for a demux engine.

    # Example

    ```ignore
    let config = EngineConfig {
        kind: GraphKind::Avi,
        discovery_timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    };
    let engine = Engine::new(graph, config);
    ```
*/
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Graph topology behind the engine.
    pub kind: GraphKind,
    /// Initial read size of the ingestion thread.
    pub chunk_size: usize,
    /// Consecutive short reads tolerated by an exact pull before it fails.
    /// `None` retries for as long as the source keeps making progress.
    pub short_read_limit: Option<u32>,
    /// Upper bound on each wait performed by `connect`.
    pub discovery_timeout: Option<Duration>,
    /// Queue limits applied when the graph starts.
    pub queue_limits: QueueLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: GraphKind::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            short_read_limit: None,
            discovery_timeout: None,
            queue_limits: QueueLimits::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(kind: GraphKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /**
        Parses a configuration from JSON. Missing fields take their defaults.
    */
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /**
        Checks the values for consistency.
    */
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidArgument("chunk_size must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.kind, GraphKind::Decodebin);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.short_read_limit, None);
        assert_eq!(config.discovery_timeout, None);
        assert_eq!(config.queue_limits, QueueLimits::default());
    }

    #[test]
    fn parses_partial_json() {
        let config =
            EngineConfig::from_json(r#"{ "kind": "mpeg-audio", "short_read_limit": 8 }"#)
                .unwrap();
        assert_eq!(config.kind, GraphKind::MpegAudio);
        assert_eq!(config.short_read_limit, Some(8));
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn rejects_zero_chunk_size() {
        assert!(matches!(
            EngineConfig::from_json(r#"{ "chunk_size": 0 }"#),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(EngineConfig::from_json("{ kind").is_err());
    }

    #[test]
    fn kind_policies() {
        assert!(GraphKind::Avi.has_dynamic_pads());
        assert!(!GraphKind::Wave.has_dynamic_pads());
        assert!(GraphKind::Decodebin.inserts_post_processing());
        assert!(!GraphKind::MpegAudio.inserts_post_processing());
        assert!(GraphKind::RawConverter.requires_unseekable());
    }

    #[test]
    fn unlimited_queue_limits() {
        assert!(QueueLimits::unlimited().is_unlimited());
        assert!(!QueueLimits::default().is_unlimited());
    }
}
