//! The accelerator driver's interface. This crate never talks to a real
//! device; `RingBufferSet::enqueue_copy` and
//! `InputStager::enqueue_host_to_device_copy` depend only on these traits,
//! dispatched as trait objects without knowing the concrete reactor. A
//! `Null*` family of test doubles backs the unit tests.

use std::fmt;

/// Device-side storage with byte-offset pointer arithmetic.
pub trait DeviceMemory {
    fn len(&self) -> usize;
}

/// A stream capable of enqueuing asynchronous host-to-device copies.
pub trait Stream {
    /// Enqueue a copy of `len` bytes from `src` to `dst_offset` bytes into
    /// `dst`. Returns a driver-specific rejection reason on failure.
    ///
    /// # Safety
    /// `src` must stay valid and must not be written to by any other thread
    /// until the driver reports the transfer complete; callers satisfy this
    /// via the ring-sizing discipline (the producer frontier never re-enters
    /// a window an in-flight copy is reading).
    unsafe fn copy_async(
        &mut self,
        src: *const u8,
        dst: &mut dyn DeviceMemory,
        dst_offset: usize,
        len: usize,
    ) -> Result<(), String>;
}

/// A scope guard that records its byte count when dropped. The concrete
/// type is driver-specific; this crate only needs to hold it until the
/// enqueue completes.
pub trait Measurement {}

/// A performance counter producing scoped `Measurement`s.
pub trait PerformanceCounter {
    fn scoped(&self, bytes: u64) -> Box<dyn Measurement>;
}

/// A `Stream` that accepts every copy and does nothing, for tests that only
/// care about which copies `enqueue_copy` attempted.
#[derive(Default)]
pub struct NullStream {
    pub copies: Vec<(usize, usize, usize)>,
}

impl fmt::Debug for NullStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NullStream").field("copies", &self.copies).finish()
    }
}

impl Stream for NullStream {
    unsafe fn copy_async(
        &mut self,
        _src: *const u8,
        dst: &mut dyn DeviceMemory,
        dst_offset: usize,
        len: usize,
    ) -> Result<(), String> {
        self.copies.push((dst.len(), dst_offset, len));
        Ok(())
    }
}

#[derive(Debug)]
pub struct NullDeviceMemory {
    pub len: usize,
}

impl DeviceMemory for NullDeviceMemory {
    fn len(&self) -> usize {
        self.len
    }
}

#[derive(Default)]
pub struct NullCounter;

struct NullMeasurement;
impl Measurement for NullMeasurement {}

impl PerformanceCounter for NullCounter {
    fn scoped(&self, _bytes: u64) -> Box<dyn Measurement> {
        Box::new(NullMeasurement)
    }
}
