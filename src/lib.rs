//! Input staging and ring-buffer subsystem for a radio-astronomy
//! correlator.
//!
//! Ingests high-rate digitized antenna samples from many concurrent
//! producers (one per station-set) into a shared, page-locked, per-subband
//! circular staging area; tracks which samples are valid; and serves a
//! read/write transaction model so an accelerator-side consumer can issue
//! bounded, asynchronous host-to-device copies.
//!
//! The four cooperating components, leaves first:
//!
//! - [`interval::SparseIntervalSet`]: sorted, disjoint, half-open interval
//!   sets, used pervasively to represent validity and missing-sample
//!   regions.
//! - [`ring_buffer::RingBufferSet`]: the page-locked circular staging
//!   storage and its wrap-around copy addressing.
//! - [`input_buffer::InputBuffer`]: one per station-set, the producer
//!   ingest loop and transactional read snapshots.
//! - [`stager::InputStager`]: the top-level facade an accelerator-side
//!   driver talks to.
//!
//! Accelerator kernels, the visibility writer, CLI parsing and config-file
//! loading, and wire-level sender protocol negotiation are external
//! collaborators and out of scope for this crate.

pub mod accel;
pub mod affinity;
pub mod config;
pub mod error;
pub mod input_buffer;
pub mod input_stream;
pub mod interval;
pub mod ring_buffer;
pub mod stager;

pub use config::{CorrelatorCommon, Geometry, Parset, ParsetFields, StationSetLayout};
pub use error::{ConfigError, DeviceCopyError, Error, Result};
pub use input_buffer::InputBuffer;
pub use interval::{SparseIntervalSet, TimeStamp};
pub use ring_buffer::RingBufferSet;
pub use stager::{InputStager, StreamFactory};
