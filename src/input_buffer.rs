//! Per-station-set producer: ingests sample frames, deposits them into the
//! shared `RingBufferSet`, maintains a per-subband `ValiditySet`, and serves
//! transactional read snapshots to the consumer.
//!
//! The producer thread is a shutdown channel plus a `JoinHandle`:
//! `crossbeam_channel` carries the stop signal since producers block on a
//! plain file/socket read, not a reactor, so there is no event loop to hook
//! the shutdown into.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::TryRecvError;
use log::{debug, warn};

use crate::accel::{DeviceMemory, PerformanceCounter, Stream};
use crate::affinity::ScopedAffinity;
use crate::config::{Geometry, IngestDebugConfig, StationSetLayout};
use crate::error::DeviceCopyError;
use crate::input_stream::InputStream;
use crate::interval::{SparseIntervalSet, TimeStamp};
use crate::ring_buffer::RingBufferSet;

struct Shared {
    ring: Arc<RingBufferSet>,
    geometry: Geometry,
    layout: StationSetLayout,
    validity: Vec<Mutex<SparseIntervalSet<TimeStamp>>>,
    current_valid: Vec<Mutex<SparseIntervalSet<TimeStamp>>>,
    /// The `t + W` of the most recently completed read transaction. A frame
    /// landing at or before this has already been consumed; one landing
    /// more than `R` past it would overwrite the window an in-flight device
    /// copy may still be reading. Both are drop conditions, never panics:
    /// they are expected under packet loss and reordering.
    window_floor: AtomicU64,
    dropped_frames: AtomicU64,
    debug: IngestDebugConfig,
}

impl Shared {
    fn deposit(&self, frame: crate::input_stream::Frame) {
        let subband = frame.subband;
        if subband as usize >= self.validity.len() {
            warn!("dropping frame: subband {} out of range (have {})", subband, self.validity.len());
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if subband < self.layout.subband_start || subband >= self.layout.subband_end {
            warn!(
                "dropping frame: subband {} is outside the serviced range {}..{}",
                subband, self.layout.subband_start, self.layout.subband_end
            );
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let f = self.layout.frame_samples;
        let start = frame.start_time;
        let end = start + f;

        let floor = self.window_floor.load(Ordering::Acquire);
        if end <= floor {
            debug!("dropping stale frame: subband {} start {} already consumed", subband, start);
            return;
        }
        if end - floor > self.geometry.ring_length {
            warn!(
                "dropping frame: subband {} start {} is {} samples ahead of the consumer, exceeding ring capacity {}",
                subband,
                start,
                end - floor,
                self.geometry.ring_length
            );
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let bytes_per_time = self.layout.dipole_count as u64 * self.geometry.bytes_per_sample as u64;
        let expected = (bytes_per_time * f) as usize;
        if frame.samples.len() != expected {
            warn!(
                "dropping malformed frame: subband {} expected {} bytes, got {}",
                subband,
                expected,
                frame.samples.len()
            );
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }

        for i in 0..f {
            let t = start + i;
            let offset = (i * bytes_per_time) as usize;
            let sample = &frame.samples[offset..offset + bytes_per_time as usize];
            unsafe {
                self.ring.write_sample(subband, t, self.layout.station_offset, sample);
            }
        }

        if self.debug.debug_signal_injection {
            self.inject_test_pattern(subband, start, f);
        }

        self.validity[subband as usize].lock().unwrap().include(start, end);
    }

    /// Debug-only: overwrites the frame this crate just deposited with a
    /// deterministic synthetic pattern, so the accelerator pipeline can be
    /// exercised without live antennas. Reachable only when
    /// `IngestDebugConfig::debug_signal_injection` is set.
    fn inject_test_pattern(&self, subband: u32, start: TimeStamp, f: u64) {
        let bytes_per_time = self.geometry.bytes_per_time();
        for i in 0..f {
            let origin = self.ring.slice_origin(subband, start + i);
            unsafe {
                for b in 0..bytes_per_time {
                    *origin.add(b as usize) = ((start + i + b) % 256) as u8;
                }
            }
        }
    }

    fn window(&self, t: TimeStamp) -> (TimeStamp, TimeStamp) {
        let lo = t.saturating_sub(self.geometry.history());
        (lo, t + self.geometry.block())
    }
}

fn ingest_loop(
    shared: Arc<Shared>,
    mut stream: Box<dyn InputStream + Send>,
    shutdown_rx: crossbeam_channel::Receiver<()>,
) {
    loop {
        match shutdown_rx.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => {
                debug!("ingest loop stopping on shutdown signal");
                break;
            }
        }

        match stream.next_frame() {
            Ok(Some(frame)) => shared.deposit(frame),
            Ok(None) => {
                debug!("input stream reached end of data");
                break;
            }
            Err(e) => {
                warn!("ingest read error: {}", e);
                shared.dropped_frames.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Consumes frames for one station-set, deposits them into the shared
/// `RingBufferSet`, and maintains one `ValiditySet` per subband.
pub struct InputBuffer {
    shared: Arc<Shared>,
    shutdown_tx: Option<crossbeam_channel::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl InputBuffer {
    /// Builds the validity bookkeeping and spawns the producer thread. If
    /// `layout.cpu_node` is set, the *calling* thread is pinned to that CPU
    /// set for the duration of this function, so the allocations made here
    /// (the `Shared` record, its validity sets) land NUMA-local; the
    /// producer thread that is then spawned runs unpinned, so the only
    /// lasting effect is that those allocations happened NUMA-locally.
    pub fn new(
        ring: Arc<RingBufferSet>,
        layout: StationSetLayout,
        debug: IngestDebugConfig,
        stream: Box<dyn InputStream + Send>,
    ) -> Self {
        let geometry = ring.geometry();
        let _guard = layout.cpu_node.map(|cpu| ScopedAffinity::pin(cpu as usize));

        let subbands = geometry.subbands as usize;
        let validity = (0..subbands).map(|_| Mutex::new(SparseIntervalSet::new())).collect();
        let current_valid = (0..subbands).map(|_| Mutex::new(SparseIntervalSet::new())).collect();

        let shared = Arc::new(Shared {
            ring,
            geometry,
            layout,
            validity,
            current_valid,
            window_floor: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            debug,
        });

        drop(_guard);

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);
        let worker_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || ingest_loop(worker_shared, stream, shutdown_rx));

        Self {
            shared,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// `startReadTransaction(t)`: marks `[t-H, t+W)` as the active window,
    /// zero-fills every subrange not covered by validity, and snapshots the
    /// resulting valid set for `fill_in_missing_samples` to return.
    pub fn start_read_transaction(&self, t: TimeStamp) {
        let (lo, hi) = self.shared.window(t);
        for s in 0..self.shared.validity.len() {
            let validity = self.shared.validity[s].lock().unwrap();
            let missing = validity.invert(lo, hi);
            for (a, b) in missing.ranges() {
                self.shared.ring.zero_fill(s as u32, a, b);
            }
            *self.shared.current_valid[s].lock().unwrap() = validity.subset(lo, hi);
        }
    }

    /// `fillInMissingSamples(t, subband, out)`: returns the validity
    /// snapshot `start_read_transaction` computed for this window.
    pub fn fill_in_missing_samples(&self, subband: u32) -> SparseIntervalSet<TimeStamp> {
        self.shared.current_valid[subband as usize].lock().unwrap().clone()
    }

    /// `endReadTransaction(t)`: truncates every subband's validity by
    /// excluding everything at or before the window end, and advances the
    /// write-window-exclusion floor so the ingest loop accepts the next
    /// window's frames.
    pub fn end_read_transaction(&self, t: TimeStamp) {
        let hi = t + self.shared.geometry.block();
        for s in 0..self.shared.validity.len() {
            self.shared.validity[s].lock().unwrap().exclude(0, hi);
        }
        self.shared.window_floor.store(hi, Ordering::Release);
    }

    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped_frames.load(Ordering::Relaxed)
    }

    /// Signals the producer thread to stop, without blocking for it to
    /// exit. `InputStager::shutdown` calls this on every `InputBuffer`
    /// before joining any of them, so all producers wind down concurrently.
    pub fn signal_shutdown(&mut self) {
        self.shutdown_tx.take();
    }

    /// Blocks until the producer thread exits. Call after
    /// `signal_shutdown`; safe to call more than once.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("producer thread panicked during shutdown");
            }
        }
    }
}

impl Drop for InputBuffer {
    fn drop(&mut self) {
        self.signal_shutdown();
        self.join();
    }
}

/// Delegates to the owning `RingBufferSet`; kept here so
/// `InputStager::enqueue_host_to_device_copy` has a single call site that
/// does not need to know about `RingBufferSet` directly.
pub fn enqueue_copy(
    ring: &RingBufferSet,
    stream: &mut dyn Stream,
    dst: &mut dyn DeviceMemory,
    subband: u32,
    early_start: TimeStamp,
    end: TimeStamp,
    perf_counter: &dyn PerformanceCounter,
) -> Result<(), DeviceCopyError> {
    ring.enqueue_copy(stream, dst, subband, early_start, end, perf_counter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CorrelatorCommon, Parset};
    use crate::config::ParsetFields as _;
    use crate::input_stream::Frame;
    use std::io;

    struct ScriptedStream {
        frames: Vec<Frame>,
    }

    impl InputStream for ScriptedStream {
        fn next_frame(&mut self) -> io::Result<Option<Frame>> {
            if self.frames.is_empty() {
                Ok(None)
            } else {
                Ok(Some(self.frames.remove(0)))
            }
        }
    }

    fn test_geometry(ring: u64, history: u64, block: u64) -> Geometry {
        Geometry {
            subbands: 1,
            stations: 2,
            polarizations: 1,
            bytes_per_sample: 1,
            ring_length: ring,
            frame_samples: 40,
            descriptors: 1,
            taps: (history + 1) as u32,
            channels_per_subband: 1,
            samples_per_subband: block,
            max_in_flight_frames: 0,
        }
    }

    fn make_layout(geometry: &Geometry) -> StationSetLayout {
        StationSetLayout {
            station_offset: 0,
            dipole_count: geometry.dipoles_per_station_set(),
            subband_start: 0,
            subband_end: geometry.subbands,
            frame_samples: 40,
            cpu_node: None,
        }
    }

    #[test]
    fn missing_samples_scenario() {
        // Scenario 7: deposit [500,540) U [560,600) on subband 0; with
        // t=500, H=0, W=100, startReadTransaction zero-fills [540,560) and
        // reports valid = {[500,540), [560,600)}.
        let geometry = test_geometry(1000, 0, 100);
        let ring = Arc::new(RingBufferSet::new(geometry).unwrap());
        let layout = make_layout(&geometry);

        let bytes_per_time = layout.dipole_count as u64 * geometry.bytes_per_sample as u64;
        let frame_a = Frame {
            start_time: 500,
            subband: 0,
            samples: vec![0xAAu8; (bytes_per_time * 40) as usize],
        };
        let frame_b = Frame {
            start_time: 560,
            subband: 0,
            samples: vec![0xBBu8; (bytes_per_time * 40) as usize],
        };

        let stream: Box<dyn InputStream + Send> = Box::new(ScriptedStream {
            frames: vec![frame_a, frame_b],
        });
        let mut buffer = InputBuffer::new(ring.clone(), layout, IngestDebugConfig::default(), stream);

        // The scripted stream is finite and returns `Ok(None)` once both
        // frames are drained, so the producer thread exits on its own;
        // `join` blocks until it does.
        buffer.join();

        buffer.start_read_transaction(500);
        let valid = buffer.fill_in_missing_samples(0);
        assert_eq!(valid.ranges().collect::<Vec<_>>(), vec![(500, 540), (560, 600)]);

        buffer.signal_shutdown();
        buffer.join();
    }

    #[test]
    fn frame_outside_serviced_subband_range_is_dropped() {
        let mut geometry = test_geometry(1000, 0, 100);
        geometry.subbands = 2;
        let ring = Arc::new(RingBufferSet::new(geometry).unwrap());
        let mut layout = make_layout(&geometry);
        layout.subband_start = 1;
        layout.subband_end = 2;

        let bytes_per_time = layout.dipole_count as u64 * geometry.bytes_per_sample as u64;
        let out_of_range = Frame {
            start_time: 500,
            subband: 0,
            samples: vec![0xAAu8; (bytes_per_time * 40) as usize],
        };
        let in_range = Frame {
            start_time: 500,
            subband: 1,
            samples: vec![0xBBu8; (bytes_per_time * 40) as usize],
        };

        let stream: Box<dyn InputStream + Send> = Box::new(ScriptedStream {
            frames: vec![out_of_range, in_range],
        });
        let mut buffer = InputBuffer::new(ring.clone(), layout, IngestDebugConfig::default(), stream);
        buffer.join();

        assert_eq!(buffer.dropped_frames(), 1);

        buffer.start_read_transaction(500);
        let valid = buffer.fill_in_missing_samples(1);
        assert_eq!(valid.ranges().collect::<Vec<_>>(), vec![(500, 540)]);

        buffer.signal_shutdown();
        buffer.join();
    }

    #[test]
    fn zero_fill_completeness_over_missing_range() {
        let geometry = test_geometry(1000, 0, 100);
        let ring = Arc::new(RingBufferSet::new(geometry).unwrap());
        let layout = make_layout(&geometry);
        let bytes_per_time = layout.dipole_count as u64 * geometry.bytes_per_sample as u64;

        let frame_a = Frame {
            start_time: 500,
            subband: 0,
            samples: vec![0xAAu8; (bytes_per_time * 40) as usize],
        };
        let frame_b = Frame {
            start_time: 560,
            subband: 0,
            samples: vec![0xBBu8; (bytes_per_time * 40) as usize],
        };

        let stream: Box<dyn InputStream + Send> = Box::new(ScriptedStream {
            frames: vec![frame_a, frame_b],
        });
        let mut buffer = InputBuffer::new(ring.clone(), layout, IngestDebugConfig::default(), stream);
        buffer.join();

        buffer.start_read_transaction(500);

        // [540, 560) was never deposited; every byte in that gap must now be zero.
        for t in 540..560 {
            unsafe {
                let origin = ring.slice_origin(0, t);
                let bytes = std::slice::from_raw_parts(origin, bytes_per_time as usize);
                assert!(bytes.iter().all(|&b| b == 0), "slot {} not zero-filled", t);
            }
        }
        // Deposited slots are untouched by the zero-fill.
        unsafe {
            let origin = ring.slice_origin(0, 500);
            let bytes = std::slice::from_raw_parts(origin, bytes_per_time as usize);
            assert!(bytes.iter().all(|&b| b == 0xAA));
        }

        buffer.signal_shutdown();
        buffer.join();
    }

    #[test]
    fn end_read_transaction_truncates_validity_up_to_window_end() {
        let geometry = test_geometry(1000, 0, 100);
        let ring = Arc::new(RingBufferSet::new(geometry).unwrap());
        let layout = make_layout(&geometry);
        let bytes_per_time = layout.dipole_count as u64 * geometry.bytes_per_sample as u64;

        let frame = Frame {
            start_time: 500,
            subband: 0,
            samples: vec![0xAAu8; (bytes_per_time * 40) as usize],
        };
        let stream: Box<dyn InputStream + Send> = Box::new(ScriptedStream { frames: vec![frame] });
        let mut buffer = InputBuffer::new(ring.clone(), layout, IngestDebugConfig::default(), stream);
        buffer.join();

        buffer.start_read_transaction(500);
        buffer.end_read_transaction(500);

        let hi = 500 + geometry.block();
        let remaining = buffer.shared.validity[0].lock().unwrap().clone();
        for (_, end) in remaining.ranges() {
            assert!(end > hi, "validity interval ending at {} should have been truncated below {}", end, hi);
        }
        for t in 0..hi {
            assert!(!remaining.test(t), "validity still covers {} after truncation to {}", t, hi);
        }

        buffer.signal_shutdown();
        buffer.join();
    }

    #[test]
    fn config_helper_builds_a_loadable_parset() {
        let common = CorrelatorCommon {
            subbands: 2,
            stations: 4,
            polarizations: 2,
            bytes_per_sample: 2,
            ring_buffer_samples_per_subband: 400,
            frame_samples: 40,
            taps: 1,
            channels_per_subband: 1,
            samples_per_subband: 100,
            max_in_flight_frames: 300,
            input_descriptors: vec!["a".into()],
            output_descriptors: vec![],
            input_buffer_nodes: vec![],
            output_buffer_nodes: vec![],
        };
        let parset = Parset::Correlator { common };
        let geometry = Geometry::from_parset(&parset).unwrap();
        assert_eq!(geometry.ring_length, 400);
        assert_eq!(parset.compile_macros()[0].0, "NR_RING_BUFFER_SAMPLES_PER_SUBBAND");
    }
}
