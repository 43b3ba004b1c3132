//! Offline replay of binary allocation traces.
//!
//! A trace starts with a 16-byte header carrying the recorded binary's text
//! mapping, followed by a stream of records. Each record opens with a
//! 32-bit code: [`ALLOC_CODE`] or [`FREE_CODE`]. All fields are
//! little-endian.

use super::*;

pub const ALLOC_CODE: u32 = 0xdead_beef;
pub const FREE_CODE: u32 = 0xcafe_babe;

// Records claiming deeper stacks than this are treated as corrupt.
const MAX_RECORD_DEPTH: u32 = 256;

#[derive(Debug)]
pub enum ReplayError {
  DepthTooLarge { depth: u32, offset: u64 },
  Io(io::Error),
  Truncated { offset: u64 },
  UnknownCode { code: u32, offset: u64 },
}

impl Display for ReplayError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::DepthTooLarge { depth, offset } => {
        write!(f, "implausible stack depth {depth} at offset {offset:#x}")
      }
      Self::Io(err) => write!(f, "i/o error during replay: {err}"),
      Self::Truncated { offset } => {
        write!(f, "trace truncated mid-record at offset {offset:#x}")
      }
      Self::UnknownCode { code, offset } => {
        write!(f, "unknown record code {code:#010x} at offset {offset:#x}")
      }
    }
  }
}

impl std::error::Error for ReplayError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io(err) => Some(err),
      _ => None,
    }
  }
}

impl From<io::Error> for ReplayError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceHeader {
  pub mapping_addr: u64,
  pub mapping_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceRecord {
  Alloc {
    frames: Vec<u64>,
    ptr: u64,
    size: u32,
  },
  Free {
    ptr: u64,
  },
}

/// Incremental reader over a raw trace stream.
pub struct TraceReader<R: Read> {
  offset: u64,
  reader: R,
}

impl<R: Read> TraceReader<R> {
  pub fn new(reader: R) -> Self {
    Self { offset: 0, reader }
  }

  /// Bytes consumed so far.
  #[must_use]
  pub fn bytes_read(&self) -> u64 {
    self.offset
  }

  /// # Errors
  ///
  /// Returns an error if the header cannot be read in full.
  pub fn read_header(&mut self) -> Result<TraceHeader, ReplayError> {
    Ok(TraceHeader {
      mapping_addr: self.read_u64()?,
      mapping_size: self.read_u64()?,
    })
  }

  /// Reads the next record, or `None` at a clean end of stream.
  ///
  /// # Errors
  ///
  /// Returns an error on i/o failure, an unknown record code, or a record
  /// cut off mid-way.
  pub fn next_record(&mut self) -> Result<Option<TraceRecord>, ReplayError> {
    let record_offset = self.offset;

    let mut code_bytes = [0u8; 4];
    if !self.fill_or_eof(&mut code_bytes)? {
      return Ok(None);
    }

    match u32::from_le_bytes(code_bytes) {
      ALLOC_CODE => {
        let ptr = self.read_u64()?;
        let size = self.read_u32()?;
        let depth = self.read_u32()?;
        if depth > MAX_RECORD_DEPTH {
          return Err(ReplayError::DepthTooLarge {
            depth,
            offset: record_offset,
          });
        }

        let mut frames = Vec::with_capacity(depth as usize);
        for _ in 0..depth {
          frames.push(self.read_u64()?);
        }

        Ok(Some(TraceRecord::Alloc { frames, ptr, size }))
      }
      FREE_CODE => Ok(Some(TraceRecord::Free {
        ptr: self.read_u64()?,
      })),
      code => Err(ReplayError::UnknownCode {
        code,
        offset: record_offset,
      }),
    }
  }

  // Reads the full buffer, or returns false if the stream ended exactly at
  // its start.
  fn fill_or_eof(&mut self, buffer: &mut [u8]) -> Result<bool, ReplayError> {
    let mut filled = 0;
    while filled < buffer.len() {
      let n = self.reader.read(&mut buffer[filled..])?;
      if n == 0 {
        if filled == 0 {
          return Ok(false);
        }
        return Err(ReplayError::Truncated {
          offset: self.offset,
        });
      }
      filled += n;
      self.offset += n as u64;
    }

    Ok(true)
  }

  fn fill(&mut self, buffer: &mut [u8]) -> Result<(), ReplayError> {
    if self.fill_or_eof(buffer)? {
      Ok(())
    } else {
      Err(ReplayError::Truncated {
        offset: self.offset,
      })
    }
  }

  fn read_u32(&mut self) -> Result<u32, ReplayError> {
    let mut bytes = [0u8; 4];
    self.fill(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
  }

  fn read_u64(&mut self) -> Result<u64, ReplayError> {
    let mut bytes = [0u8; 8];
    self.fill(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
  }
}

#[derive(Debug, Default)]
pub struct ReplaySummary {
  pub bytes_read: u64,
  pub num_alloc_records: u64,
  pub num_free_records: u64,
  pub reports: Vec<LeakReport>,
}

/// Replays a whole trace through a fresh detector session and returns the
/// accumulated reports.
///
/// The trace header's mapping overrides whatever mapping `config` carries.
///
/// # Errors
///
/// Returns an error if the trace is malformed or the session cannot be
/// created.
pub fn replay<R: Read>(
  reader: R,
  config: &DetectorConfig,
) -> Result<ReplaySummary, ReplayError> {
  let mut trace = TraceReader::new(reader);
  let header = trace.read_header()?;

  let config = config
    .clone()
    .with_mapping(header.mapping_addr, header.mapping_size);
  let mut session = DetectorSession::new(&config)?;

  let mut summary = ReplaySummary::default();
  while let Some(record) = trace.next_record()? {
    match record {
      TraceRecord::Alloc { frames, ptr, size } => {
        summary.num_alloc_records += 1;
        // Null or empty allocations are recorded in the trace but carry no
        // event.
        if ptr != 0 && size != 0 {
          session.on_alloc(ptr, size as usize, &frames);
        }
      }
      TraceRecord::Free { ptr } => {
        summary.num_free_records += 1;
        session.on_free(ptr);
      }
    }
  }

  summary.bytes_read = trace.bytes_read();
  summary.reports = session.take_reports();

  Ok(summary)
}
