//! The external blocking-bytestream interface: a per-station-set source
//! yielding a header carrying `(start_time, subband)` followed by a
//! fixed-size sample block.
//!
//! `VdifFileStream` is this crate's one concrete implementation, a stub
//! with its wire format left unimplemented. It tracks a single
//! `frame_index` and derives every file offset from it, rather than
//! advancing two counters that could drift out of sync with each other.

use std::convert::TryInto;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::interval::TimeStamp;

/// `(startTime, subband)` plus the frame's raw sample payload.
#[derive(Debug)]
pub struct Frame {
    pub start_time: TimeStamp,
    pub subband: u32,
    pub samples: Vec<u8>,
}

/// A blocking bytestream yielding frames, one per station-set. Exact wire
/// framing is source-specific; only the timestamp, subband, and payload
/// size are consumed by the ingest loop.
pub trait InputStream {
    /// Block until the next frame is available, or return `Ok(None)` at a
    /// clean end of stream. I/O errors are the caller's to log and treat as
    /// a dropped frame, per the ingest loop's failure semantics.
    fn next_frame(&mut self) -> io::Result<Option<Frame>>;
}

/// Fixed sizing this crate needs to walk a file of back-to-back frames;
/// the header's internal layout beyond the leading `(startTime, subband)`
/// fields is opaque.
#[derive(Clone, Copy, Debug)]
pub struct VdifLayout {
    pub header_size: usize,
    pub frame_payload_size: usize,
}

/// Reads fixed-size frames from a file, one station-set's worth.
pub struct VdifFileStream {
    file: File,
    layout: VdifLayout,
    frame_index: u64,
}

impl VdifFileStream {
    pub fn open(path: impl AsRef<Path>, layout: VdifLayout) -> io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
            layout,
            frame_index: 0,
        })
    }
}

impl InputStream for VdifFileStream {
    fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        let frame_stride = (self.layout.header_size + self.layout.frame_payload_size) as u64;
        let offset = self.frame_index * frame_stride;
        self.file.seek(SeekFrom::Start(offset))?;

        let mut header = vec![0u8; self.layout.header_size];
        match self.file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let start_time = u64::from_le_bytes(header[0..8].try_into().expect("header_size >= 12"));
        let subband = u32::from_le_bytes(header[8..12].try_into().expect("header_size >= 12"));

        let mut samples = vec![0u8; self.layout.frame_payload_size];
        self.file.read_exact(&mut samples)?;

        self.frame_index += 1;

        Ok(Some(Frame { start_time, subband, samples }))
    }
}
