//! `InputStager`: the top-level facade composing one `RingBufferSet` with
//! `D` `InputBuffer`s, exposed to the accelerator-side driver.
//!
//! The `RingBufferSet` is built first and outlives every `InputBuffer`.
//! Shutdown stops and joins every producer in parallel, via
//! `std::thread::scope`, before the `RingBufferSet` itself is released.

use std::sync::Arc;

use log::info;

use crate::accel::{DeviceMemory, PerformanceCounter, Stream};
use crate::config::{IngestDebugConfig, Parset, ParsetFields};
use crate::error::{Error, Result};
use crate::input_buffer::InputBuffer;
use crate::input_stream::InputStream;
use crate::interval::{SparseIntervalSet, TimeStamp};
use crate::ring_buffer::RingBufferSet;

/// Builds one `InputBuffer`'s input stream. Supplied by the caller of
/// `InputStager::new` because the concrete stream (file, socket, a test
/// double) is an external collaborator this crate does not choose.
pub type StreamFactory<'a> = dyn FnMut(usize) -> Box<dyn InputStream + Send> + 'a;

pub struct InputStager {
    ring: Arc<RingBufferSet>,
    buffers: Vec<InputBuffer>,
}

impl InputStager {
    /// Builds the `RingBufferSet` from `parset`'s geometry, then one
    /// `InputBuffer` per station-set, in order, pinning each one's setup
    /// allocations to its configured NUMA node.
    pub fn new(parset: &Parset, debug: IngestDebugConfig, mut streams: Box<StreamFactory<'_>>) -> Result<Self> {
        let geometry = crate::config::Geometry::from_parset(parset)?;
        info!(
            "building ring buffer set: {} subbands x {} bytes",
            geometry.subbands,
            geometry.ring_buffer_bytes()
        );
        let ring = Arc::new(RingBufferSet::new(geometry).map_err(Error::from)?);

        let layouts = geometry.station_set_layouts(parset.common());
        let mut buffers = Vec::with_capacity(layouts.len());
        for (d, layout) in layouts.into_iter().enumerate() {
            info!(
                "starting input buffer {} (stations {}..{}, cpu {:?})",
                d,
                layout.station_offset,
                layout.station_offset + layout.dipole_count,
                layout.cpu_node
            );
            let stream = streams(d);
            buffers.push(InputBuffer::new(Arc::clone(&ring), layout, debug, stream));
        }

        Ok(Self { ring, buffers })
    }

    /// `enqueueHostToDeviceCopy`: `earlyStart = startTime - H`, `end =
    /// startTime + W`, delegated to `RingBufferSet::enqueue_copy`.
    pub fn enqueue_host_to_device_copy(
        &self,
        stream: &mut dyn Stream,
        dst: &mut dyn DeviceMemory,
        perf_counter: &dyn PerformanceCounter,
        start_time: TimeStamp,
        subband: u32,
    ) -> Result<()> {
        let geometry = self.ring.geometry();
        let early_start = start_time.saturating_sub(geometry.history());
        let end = start_time + geometry.block();
        self.ring
            .enqueue_copy(stream, dst, subband, early_start, end, perf_counter)
            .map_err(Error::from)
    }

    /// Invokes `fillInMissingSamples` on each `InputBuffer` in order and
    /// returns the per-station-set validity snapshots for `subband`.
    pub fn fill_in_missing_samples(&self, subband: u32) -> Vec<SparseIntervalSet<TimeStamp>> {
        self.buffers.iter().map(|b| b.fill_in_missing_samples(subband)).collect()
    }

    pub fn start_read_transaction(&self, t: TimeStamp) {
        for buffer in &self.buffers {
            buffer.start_read_transaction(t);
        }
    }

    pub fn end_read_transaction(&self, t: TimeStamp) {
        for buffer in &self.buffers {
            buffer.end_read_transaction(t);
        }
    }

    pub fn dropped_frames(&self) -> Vec<u64> {
        self.buffers.iter().map(|b| b.dropped_frames()).collect()
    }

    /// Stops and joins every producer thread before returning, so the
    /// `RingBufferSet` can be safely dropped after this call. Shutdown
    /// signals are sent to all buffers up front (cheap: closing a
    /// channel), then every producer is joined concurrently inside a
    /// scoped-thread barrier.
    pub fn shutdown(&mut self) {
        for buffer in &mut self.buffers {
            buffer.signal_shutdown();
        }

        info!("joining {} producer threads", self.buffers.len());
        std::thread::scope(|scope| {
            for buffer in &mut self.buffers {
                scope.spawn(move || buffer.join());
            }
        });
    }
}

impl Drop for InputStager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
