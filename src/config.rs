//! The tunable geometry and the `Parset` configuration record it is derived
//! from.
//!
//! `Parset` models the correlator/AARTFAAC/ISBI variants as a tagged enum
//! of structs sharing one `CorrelatorCommon` record, behind a common
//! `ParsetFields` accessor trait. The variants only ever differ in which
//! extra options they carry, never in behavior of the shared ones.
//!
//! Loading a `Parset` from a file or parsing it from command-line options is
//! out of scope here (an external collaborator, per the purpose-and-scope
//! note); this module only derives `Serialize`/`Deserialize` so some other
//! crate can do that loading.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Fields common to every `Parset` variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrelatorCommon {
    pub subbands: u32,
    pub stations: u32,
    pub polarizations: u32,
    pub bytes_per_sample: u32,
    pub ring_buffer_samples_per_subband: u64,
    pub frame_samples: u64,
    pub taps: u32,
    pub channels_per_subband: u32,
    pub samples_per_subband: u64,
    pub max_in_flight_frames: u64,
    pub input_descriptors: Vec<String>,
    pub output_descriptors: Vec<String>,
    pub input_buffer_nodes: Vec<u32>,
    pub output_buffer_nodes: Vec<u32>,
}

/// AARTFAAC-specific extension fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AartfaacExtension {
    pub visibilities_integration: f64,
}

/// ISBI-specific extension fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IsbiExtension {
    pub channel_mapping: Vec<i32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Parset {
    Correlator {
        common: CorrelatorCommon,
    },
    Aartfaac {
        common: CorrelatorCommon,
        extension: AartfaacExtension,
    },
    Isbi {
        common: CorrelatorCommon,
        extension: IsbiExtension,
    },
}

/// Accessor trait so callers that don't care which variant they hold can
/// still reach the shared fields and the compile-time-macro export.
pub trait ParsetFields {
    fn common(&self) -> &CorrelatorCommon;

    /// `-D` style macros for the accelerator kernel build. Not a `build.rs`
    /// step: `R` is a runtime-configured value, unknown at crate-build time.
    fn compile_macros(&self) -> Vec<(String, String)> {
        vec![(
            "NR_RING_BUFFER_SAMPLES_PER_SUBBAND".to_string(),
            self.common().ring_buffer_samples_per_subband.to_string(),
        )]
    }
}

impl ParsetFields for Parset {
    fn common(&self) -> &CorrelatorCommon {
        match self {
            Parset::Correlator { common } => common,
            Parset::Aartfaac { common, .. } => common,
            Parset::Isbi { common, .. } => common,
        }
    }

    fn compile_macros(&self) -> Vec<(String, String)> {
        let mut macros = vec![(
            "NR_RING_BUFFER_SAMPLES_PER_SUBBAND".to_string(),
            self.common().ring_buffer_samples_per_subband.to_string(),
        )];
        if let Parset::Isbi { common, .. } = self {
            macros.push((
                "NR_CHANNELS_PER_SUBBAND".to_string(),
                common.channels_per_subband.to_string(),
            ));
        }
        macros
    }
}

/// The geometry table from which every other component's sizes are
/// computed. Built once, from a validated `Parset`, and never mutated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub subbands: u32,
    pub stations: u32,
    pub polarizations: u32,
    pub bytes_per_sample: u32,
    pub ring_length: u64,
    pub frame_samples: u64,
    pub descriptors: u32,
    pub taps: u32,
    pub channels_per_subband: u32,
    pub samples_per_subband: u64,
    pub max_in_flight_frames: u64,
}

impl Geometry {
    pub fn from_parset(parset: &Parset) -> Result<Self, ConfigError> {
        let common = parset.common();

        validate_node_list(
            "input",
            &common.input_buffer_nodes,
            common.input_descriptors.len(),
        )?;
        validate_node_list(
            "output",
            &common.output_buffer_nodes,
            common.output_descriptors.len(),
        )?;

        let geometry = Geometry {
            subbands: common.subbands,
            stations: common.stations,
            polarizations: common.polarizations,
            bytes_per_sample: common.bytes_per_sample,
            ring_length: common.ring_buffer_samples_per_subband,
            frame_samples: common.frame_samples,
            descriptors: common.input_descriptors.len() as u32,
            taps: common.taps,
            channels_per_subband: common.channels_per_subband,
            samples_per_subband: common.samples_per_subband,
            max_in_flight_frames: common.max_in_flight_frames,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// History samples: `(NR_TAPS - 1) * channels_per_subband`. Derived
    /// rather than stored, so it can never drift out of sync with `taps`.
    pub fn history(&self) -> u64 {
        (self.taps as u64 - 1) * self.channels_per_subband as u64
    }

    /// Block samples per read. Equal to `samples_per_subband` by
    /// definition; kept as a method so call sites read `geometry.block()`
    /// the same way they read `geometry.history()`.
    pub fn block(&self) -> u64 {
        self.samples_per_subband
    }

    pub fn bytes_per_time(&self) -> u64 {
        self.stations as u64 * self.polarizations as u64 * self.bytes_per_sample as u64
    }

    pub fn ring_buffer_bytes(&self) -> u64 {
        self.ring_length * self.bytes_per_time()
    }

    pub fn dipoles_per_station_set(&self) -> u32 {
        self.stations * self.polarizations / self.descriptors.max(1)
    }

    /// Enforces the ring-sizing discipline: `R` must be a configured
    /// multiple of `W + H + maxInFlightFrames`, so the producer's frontier
    /// and the consumer's trailing edge are always separated by more than
    /// one window.
    fn validate(&self) -> Result<(), ConfigError> {
        let unit = self.block() + self.history() + self.max_in_flight_frames;
        if unit == 0 || self.ring_length % unit != 0 {
            return Err(ConfigError::RingTooSmall {
                ring: self.ring_length,
                window: self.block(),
                history: self.history(),
                slack: self.max_in_flight_frames,
            });
        }
        Ok(())
    }
}

fn validate_node_list(which: &'static str, nodes: &[u32], descriptors: usize) -> Result<(), ConfigError> {
    if !nodes.is_empty() && nodes.len() != descriptors {
        return Err(ConfigError::NodeListLengthMismatch {
            which,
            nodes: nodes.len(),
            descriptors,
        });
    }
    Ok(())
}

/// Per-station-set layout: which stations and subbands one `InputBuffer`
/// services, and its incoming frame size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StationSetLayout {
    pub station_offset: u32,
    pub dipole_count: u32,
    pub subband_start: u32,
    pub subband_end: u32,
    pub frame_samples: u64,
    pub cpu_node: Option<u32>,
}

impl Geometry {
    /// Layouts for all `D` station-sets, each servicing the full subband
    /// range; `cpu_node` is `None` when `inputBufferNodes` was left empty
    /// (pinning disabled).
    pub fn station_set_layouts(&self, common: &CorrelatorCommon) -> Vec<StationSetLayout> {
        let dipoles = self.dipoles_per_station_set();
        (0..self.descriptors)
            .map(|d| StationSetLayout {
                station_offset: d * (dipoles / self.polarizations.max(1)),
                dipole_count: dipoles,
                subband_start: 0,
                subband_end: self.subbands,
                frame_samples: self.frame_samples,
                cpu_node: common.input_buffer_nodes.get(d as usize).copied(),
            })
            .collect()
    }
}

/// Gates the debug-only synthetic-signal injection path in `input_buffer`.
/// Defaults to off.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestDebugConfig {
    pub debug_signal_injection: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_common() -> CorrelatorCommon {
        CorrelatorCommon {
            subbands: 4,
            stations: 20,
            polarizations: 2,
            bytes_per_sample: 2,
            ring_buffer_samples_per_subband: 1040,
            frame_samples: 16,
            taps: 9,
            channels_per_subband: 1,
            samples_per_subband: 100,
            max_in_flight_frames: 100,
            input_descriptors: vec!["a".into(), "b".into()],
            output_descriptors: vec![],
            input_buffer_nodes: vec![],
            output_buffer_nodes: vec![],
        }
    }

    #[test]
    fn geometry_computes_history_and_block() {
        let common = sample_common();
        let parset = Parset::Correlator { common };
        let geometry = Geometry::from_parset(&parset).unwrap();
        assert_eq!(geometry.history(), 8);
        assert_eq!(geometry.block(), 100);
    }

    #[test]
    fn node_list_length_mismatch_is_fatal() {
        let mut common = sample_common();
        common.input_buffer_nodes = vec![0];
        let parset = Parset::Correlator { common };
        match Geometry::from_parset(&parset) {
            Err(ConfigError::NodeListLengthMismatch { which, nodes, descriptors }) => {
                assert_eq!(which, "input");
                assert_eq!(nodes, 1);
                assert_eq!(descriptors, 2);
            }
            other => panic!("expected NodeListLengthMismatch, got {:?}", other),
        }
    }

    #[test]
    fn ring_not_a_multiple_of_window_is_fatal() {
        let mut common = sample_common();
        common.ring_buffer_samples_per_subband = 999;
        let parset = Parset::Correlator { common };
        match Geometry::from_parset(&parset) {
            Err(ConfigError::RingTooSmall { ring, .. }) => assert_eq!(ring, 999),
            other => panic!("expected RingTooSmall, got {:?}", other),
        }
    }

    #[test]
    fn isbi_compile_macros_include_channel_count() {
        let common = sample_common();
        let parset = Parset::Isbi {
            common,
            extension: IsbiExtension {
                channel_mapping: vec![0, 1, 2],
            },
        };
        let macros = parset.compile_macros();
        assert!(macros.iter().any(|(k, _)| k == "NR_RING_BUFFER_SAMPLES_PER_SUBBAND"));
        assert!(macros.iter().any(|(k, _)| k == "NR_CHANNELS_PER_SUBBAND"));
    }

    #[test]
    fn station_set_layouts_cover_all_stations() {
        let common = sample_common();
        let parset = Parset::Correlator { common: common.clone() };
        let geometry = Geometry::from_parset(&parset).unwrap();
        let layouts = geometry.station_set_layouts(&common);
        assert_eq!(layouts.len(), 2);
        assert_eq!(layouts[0].dipole_count, geometry.dipoles_per_station_set());
    }
}
