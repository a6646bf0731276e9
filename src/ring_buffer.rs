//! Page-locked, write-combined circular staging buffers, one per subband,
//! and the 1-or-2-segment wrap-around copy algorithm a device-copy consumer
//! needs.
//!
//! Host memory is mapped directly with `libc::mmap`/`mlock`. The copy
//! addressing issues one copy if the `(early_start, end)` window an
//! accelerator driver requests is contiguous, two if it straddles the
//! wrap point.

use bitflags::bitflags;
use failure::Fail;
use log::{debug, trace};
use nix::errno::Errno;

use crate::accel::{DeviceMemory, PerformanceCounter, Stream};
use crate::config::Geometry;
use crate::error::DeviceCopyError;
use crate::interval::TimeStamp;

bitflags! {
    /// Attributes the staging allocation was requested with. Recorded
    /// rather than enforced at the OS level beyond what `mmap`/`mlock`
    /// actually guarantee: "write-combined" is an accelerator-driver
    /// allocator concern this crate does not own.
    pub struct MemoryFlags: u32 {
        const HOST_PINNED    = 0b01;
        const WRITE_COMBINED = 0b10;
    }
}

#[derive(Debug, Fail)]
pub enum AllocError {
    #[fail(display = "mmap of {} bytes failed: {}", len, errno)]
    Mmap { len: usize, errno: Errno },

    #[fail(display = "mlock of {} bytes failed: {}", len, errno)]
    Mlock { len: usize, errno: Errno },
}

/// One page-locked circular staging block. Shared between exactly one
/// producer thread (writing future samples) and the consumer thread
/// (reading past samples); the ring-sizing discipline keeps their regions
/// disjoint, so no lock is needed here.
struct RingBuffer {
    ptr: *mut u8,
    mapped_len: usize,
}

// Safety: access is partitioned by time between the sole writer and the
// sole reader of each buffer, per the ring-sizing discipline; no two
// threads ever touch the same byte concurrently.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    fn allocate(len: usize) -> Result<Self, AllocError> {
        let page = page_size::get();
        let mapped_len = ((len + page - 1) / page) * page;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(AllocError::Mmap { len: mapped_len, errno: Errno::last() });
        }

        let rc = unsafe { libc::mlock(ptr, mapped_len) };
        if rc != 0 {
            unsafe {
                libc::munmap(ptr, mapped_len);
            }
            return Err(AllocError::Mlock { len: mapped_len, errno: Errno::last() });
        }

        #[cfg(target_os = "linux")]
        unsafe {
            libc::madvise(ptr, mapped_len, libc::MADV_DONTFORK);
        }

        Ok(Self { ptr: ptr as *mut u8, mapped_len })
    }

    /// # Safety
    /// Caller must ensure `offset + n_bytes <= mapped_len` and must not
    /// alias a region another thread is concurrently writing.
    unsafe fn byte_at(&self, offset: usize) -> *mut u8 {
        self.ptr.add(offset)
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munlock(self.ptr as *mut libc::c_void, self.mapped_len);
            libc::munmap(self.ptr as *mut libc::c_void, self.mapped_len);
        }
    }
}

/// `S` page-locked, write-combined staging buffers, one per subband, each
/// sized `R*K*P*B` bytes.
pub struct RingBufferSet {
    buffers: Vec<RingBuffer>,
    geometry: Geometry,
    flags: MemoryFlags,
}

impl RingBufferSet {
    pub fn new(geometry: Geometry) -> Result<Self, AllocError> {
        let len = geometry.ring_buffer_bytes() as usize;
        let mut buffers = Vec::with_capacity(geometry.subbands as usize);
        for s in 0..geometry.subbands {
            debug!("allocating ring buffer for subband {} ({} bytes)", s, len);
            buffers.push(RingBuffer::allocate(len)?);
        }
        Ok(Self {
            buffers,
            geometry,
            flags: MemoryFlags::HOST_PINNED | MemoryFlags::WRITE_COMBINED,
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn flags(&self) -> MemoryFlags {
        self.flags
    }

    /// Pointer to the first byte of time slot `t mod R` in subband `s`.
    /// Valid for `n*K*P*B` bytes only while `(t mod R) + n <= R`; the caller
    /// splits across the wrap point otherwise (see [`Self::enqueue_copy`]).
    pub fn slice_origin(&self, s: u32, t: TimeStamp) -> *mut u8 {
        let slot = t % self.geometry.ring_length;
        let offset = slot * self.geometry.bytes_per_time();
        unsafe { self.buffers[s as usize].byte_at(offset as usize) }
    }

    /// Enqueue the asynchronous host-to-device copy (or copies) covering
    /// `[early_start, end)` on subband `s`. Issues one copy when the window
    /// does not straddle the ring's wrap point, two otherwise.
    ///
    /// The caller guarantees `end - early_start <= R`; violating this is a
    /// programming error, caught here with a `debug_assert!` rather than a
    /// recoverable error.
    pub fn enqueue_copy(
        &self,
        stream: &mut dyn Stream,
        dst: &mut dyn DeviceMemory,
        s: u32,
        early_start: TimeStamp,
        end: TimeStamp,
        perf_counter: &dyn PerformanceCounter,
    ) -> Result<(), DeviceCopyError> {
        let r = self.geometry.ring_length;
        debug_assert!(
            end >= early_start && end - early_start <= r,
            "window [{}, {}) exceeds ring capacity {}",
            early_start,
            end,
            r
        );

        let bytes_per_time = self.geometry.bytes_per_time();
        let i0 = early_start % r;
        let i1 = end % r;
        let total_bytes = (end - early_start) * bytes_per_time;

        let _measurement = perf_counter.scoped(total_bytes);

        if i0 < i1 {
            let n = (i1 - i0) * bytes_per_time;
            trace!("subband {}: single copy of {} bytes from slot {}", s, n, i0);
            let src = self.slice_origin(s, early_start);
            unsafe {
                stream
                    .copy_async(src, dst, 0, n as usize)
                    .map_err(|reason| DeviceCopyError::StreamRejected { reason })?;
            }
        } else {
            let first_len = (r - i0) * bytes_per_time;
            trace!(
                "subband {}: wrap copy of {} bytes from slot {} then {} bytes from slot 0",
                s,
                first_len,
                i0,
                i1 * bytes_per_time
            );
            let src = self.slice_origin(s, early_start);
            unsafe {
                stream
                    .copy_async(src, dst, 0, first_len as usize)
                    .map_err(|reason| DeviceCopyError::StreamRejected { reason })?;
            }
            if i1 > 0 {
                let second_len = i1 * bytes_per_time;
                let src2 = self.slice_origin(s, 0);
                unsafe {
                    stream
                        .copy_async(src2, dst, first_len as usize, second_len as usize)
                        .map_err(|reason| DeviceCopyError::StreamRejected { reason })?;
                }
            }
        }

        Ok(())
    }

    /// Zero a half-open time range `[a, b)` in subband `s`, splitting at the
    /// wrap point exactly as `enqueue_copy` does. Used by `InputBuffer`'s
    /// zero-fill policy.
    pub fn zero_fill(&self, s: u32, a: TimeStamp, b: TimeStamp) {
        if a >= b {
            return;
        }
        let r = self.geometry.ring_length;
        debug_assert!(b - a <= r, "zero-fill window [{}, {}) exceeds ring capacity {}", a, b, r);

        let bytes_per_time = self.geometry.bytes_per_time();
        let i0 = a % r;
        let i1 = b % r;

        unsafe {
            if i0 < i1 {
                let n = (i1 - i0) * bytes_per_time;
                let ptr = self.slice_origin(s, a);
                std::ptr::write_bytes(ptr, 0, n as usize);
            } else {
                let first_len = (r - i0) * bytes_per_time;
                let ptr = self.slice_origin(s, a);
                std::ptr::write_bytes(ptr, 0, first_len as usize);
                if i1 > 0 {
                    let ptr2 = self.slice_origin(s, 0);
                    std::ptr::write_bytes(ptr2, 0, (i1 * bytes_per_time) as usize);
                }
            }
        }
    }

    /// Copy `K_local * P * B` bytes for one sample time into the slot at
    /// `(subband, t) + k0*P*B`, used by the ingest loop.
    ///
    /// # Safety
    /// Caller must ensure `src` holds at least `k_local*P*B` bytes and that
    /// `t` is outside any window an in-flight device copy is reading.
    pub unsafe fn write_sample(&self, s: u32, t: TimeStamp, k0: u32, src: &[u8]) {
        let station_bytes = (self.geometry.polarizations * self.geometry.bytes_per_sample) as u64;
        let origin = self.slice_origin(s, t);
        let dst = origin.add((k0 as u64 * station_bytes) as usize);
        debug_assert_eq!(src.len() as u64 % station_bytes, 0);
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{NullCounter, NullDeviceMemory, NullStream};

    // Built directly rather than through `Geometry::from_parset`: these
    // scenarios exercise the wrap-around copy arithmetic with the literal
    // R/H/W values from the design notes, independent of the ring-sizing
    // discipline `Geometry::validate` enforces (that invariant is tested in
    // `config`).
    fn geometry(ring: u64, history: u64, block: u64) -> Geometry {
        Geometry {
            subbands: 1,
            stations: 2,
            polarizations: 2,
            bytes_per_sample: 1,
            ring_length: ring,
            frame_samples: 16,
            descriptors: 1,
            taps: (history + 1) as u32,
            channels_per_subband: 1,
            samples_per_subband: block,
            max_in_flight_frames: 0,
        }
    }

    #[test]
    fn single_copy_when_window_does_not_wrap() {
        // Scenario 5 from the design notes: R=1000, H=64, W=128, startTime=500.
        let geometry = geometry(1000, 64, 128);
        let set = RingBufferSet::new(geometry).unwrap();
        let mut stream = NullStream::default();
        let mut dst = NullDeviceMemory { len: 4096 };
        let counter = NullCounter::default();

        set.enqueue_copy(&mut stream, &mut dst, 0, 436, 628, &counter).unwrap();

        assert_eq!(stream.copies.len(), 1);
        let bytes_per_time = geometry.bytes_per_time();
        assert_eq!(stream.copies[0].2 as u64, 192 * bytes_per_time);
    }

    #[test]
    fn two_copies_when_window_wraps() {
        // Scenario 6: R=1000, H=64, W=128, startTime=960.
        let geometry = geometry(1000, 64, 128);
        let set = RingBufferSet::new(geometry).unwrap();
        let mut stream = NullStream::default();
        let mut dst = NullDeviceMemory { len: 4096 };
        let counter = NullCounter::default();

        set.enqueue_copy(&mut stream, &mut dst, 0, 896, 1088, &counter).unwrap();

        let bytes_per_time = geometry.bytes_per_time();
        assert_eq!(stream.copies.len(), 2);
        assert_eq!(stream.copies[0].2 as u64, 104 * bytes_per_time);
        assert_eq!(stream.copies[1].2 as u64, 88 * bytes_per_time);
    }

    #[test]
    fn byte_sum_matches_window_width_for_arbitrary_offsets() {
        let geometry = geometry(500, 10, 40);
        let set = RingBufferSet::new(geometry).unwrap();
        let bytes_per_time = geometry.bytes_per_time();

        for start in (0u64..500).step_by(37) {
            let a = start;
            let b = start + 50;
            let mut stream = NullStream::default();
            let mut dst = NullDeviceMemory { len: 4096 };
            let counter = NullCounter::default();
            set.enqueue_copy(&mut stream, &mut dst, 0, a, b, &counter).unwrap();
            let total: usize = stream.copies.iter().map(|c| c.2).sum();
            assert_eq!(total as u64, (b - a) * bytes_per_time, "a={} b={}", a, b);
        }
    }

    #[test]
    fn write_sample_then_zero_fill_overwrites_it() {
        let geometry = geometry(100, 0, 10);
        let set = RingBufferSet::new(geometry).unwrap();
        let bytes_per_time = geometry.bytes_per_time() as usize;
        let sample = vec![0xABu8; bytes_per_time];

        unsafe {
            set.write_sample(0, 5, 0, &sample);
            let origin = set.slice_origin(0, 5);
            let read = std::slice::from_raw_parts(origin, bytes_per_time);
            assert_eq!(read, sample.as_slice());
        }

        set.zero_fill(0, 5, 6);

        unsafe {
            let origin = set.slice_origin(0, 5);
            let read = std::slice::from_raw_parts(origin, bytes_per_time);
            assert!(read.iter().all(|&b| b == 0));
        }
    }
}
