use crate::message::Raster;
use std::convert::TryFrom;
use thiserror::Error;

pub const RASTER_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RasterError {
    #[error("raster chunk at offset {offset}, expected offset {expected}")]
    OutOfOrder { expected: u32, offset: u32 },
    #[error("raster chunk declares {length} bytes but carries {actual}")]
    LengthMismatch { length: u32, actual: usize },
    #[error("raster chunk ends at {end}, past total size {size}")]
    Overflow { end: u64, size: u32 },
    #[error("raster chunk size {size} differs from transfer size {expected}")]
    SizeChanged { expected: u32, size: u32 },
    #[error("raster of {size} bytes is too large to transfer")]
    TooLarge { size: usize },
}

/// Progress of a raster reception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterProgress {
    /// Percent of the transfer received so far, never 100.
    Partial(u8),
    Complete,
}

/// Receiving end of a raster transfer.
///
/// Chunks must arrive in order without gaps. A chunk at offset 0 always starts
/// the transfer over; any other misplaced chunk discards what was received and
/// leaves the buffer waiting for a restart.
#[derive(Debug, Default)]
pub struct RasterBuffer {
    data: Vec<u8>,
    size: u32,
    complete: bool,
}

impl RasterBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receive(&mut self, chunk: &Raster) -> Result<RasterProgress, RasterError> {
        if chunk.size == 0 {
            self.data.clear();
            self.size = 0;
            self.complete = true;
            return Ok(RasterProgress::Complete);
        }

        if chunk.offset == 0 {
            self.data.clear();
            self.size = chunk.size;
            self.complete = false;
        }

        if let Err(err) = self.validate(chunk) {
            log::warn!("Discarding partial raster: {}", err);
            self.reset();
            return Err(err);
        }

        self.data.extend_from_slice(&chunk.data);
        if chunk.is_last() {
            self.complete = true;
            Ok(RasterProgress::Complete)
        } else {
            let received = self.data.len() as u64;
            let percent = 99 * received / u64::from(self.size);
            Ok(RasterProgress::Partial(percent as u8))
        }
    }

    fn validate(&self, chunk: &Raster) -> Result<(), RasterError> {
        if self.complete || chunk.offset as usize != self.data.len() {
            let expected = if self.complete {
                0
            } else {
                u32::try_from(self.data.len()).unwrap_or(u32::MAX)
            };
            return Err(RasterError::OutOfOrder {
                expected,
                offset: chunk.offset,
            });
        }
        if chunk.size != self.size {
            return Err(RasterError::SizeChanged {
                expected: self.size,
                size: chunk.size,
            });
        }
        if chunk.data.len() != chunk.length as usize {
            return Err(RasterError::LengthMismatch {
                length: chunk.length,
                actual: chunk.data.len(),
            });
        }
        let end = u64::from(chunk.offset) + u64::from(chunk.length);
        if end > u64::from(chunk.size) {
            return Err(RasterError::Overflow {
                end,
                size: chunk.size,
            });
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.data.clear();
        self.size = 0;
        self.complete = false;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Received bytes, available once the transfer is complete.
    pub fn image(&self) -> Option<&[u8]> {
        if self.complete {
            Some(&self.data)
        } else {
            None
        }
    }
}

/// Sending end of a raster transfer. Produces one chunk per call; the caller
/// asks for the next chunk when the previous one was acknowledged.
#[derive(Debug)]
pub struct RasterTransfer {
    data: Vec<u8>,
    size: u32,
    offset: u32,
    chunk_size: u32,
    sent_sentinel: bool,
}

impl RasterTransfer {
    pub fn new(data: Vec<u8>) -> Result<Self, RasterError> {
        Self::with_chunk_size(data, RASTER_CHUNK_SIZE)
    }

    pub fn with_chunk_size(data: Vec<u8>, chunk_size: usize) -> Result<Self, RasterError> {
        let size = transfer_size(data.len())?;
        Ok(Self {
            data,
            size,
            offset: 0,
            chunk_size: u32::try_from(chunk_size).unwrap_or(u32::MAX).max(1),
            sent_sentinel: false,
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn next_chunk(&mut self) -> Option<Raster> {
        if self.size == 0 {
            if self.sent_sentinel {
                return None;
            }
            self.sent_sentinel = true;
            return Some(Raster::empty());
        }
        if self.offset >= self.size {
            return None;
        }
        let length = self.chunk_size.min(self.size - self.offset);
        let start = self.offset as usize;
        let chunk = Raster {
            offset: self.offset,
            length,
            size: self.size,
            data: self.data[start..start + length as usize].to_vec(),
        };
        self.offset += length;
        Some(chunk)
    }

    /// Percent of the raster handed out so far.
    pub fn progress(&self) -> u8 {
        if self.size == 0 {
            return if self.sent_sentinel { 100 } else { 0 };
        }
        (100 * u64::from(self.offset) / u64::from(self.size)) as u8
    }

    pub fn is_finished(&self) -> bool {
        if self.size == 0 {
            self.sent_sentinel
        } else {
            self.offset >= self.size
        }
    }
}

/// Chunk headers carry 32-bit sizes.
fn transfer_size(len: usize) -> Result<u32, RasterError> {
    u32::try_from(len).map_err(|_| RasterError::TooLarge { size: len })
}
