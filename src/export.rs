use super::*;

/// Errors that can occur when exporting the report stream.
#[derive(Debug)]
pub enum ExportError {
  Io(io::Error),
  Json(serde_json::Error),
}

impl Display for ExportError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Io(err) => write!(f, "i/o error during export: {err}"),
      Self::Json(err) => write!(f, "failed to encode reports as json: {err}"),
    }
  }
}

impl std::error::Error for ExportError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io(err) => Some(err),
      Self::Json(err) => Some(err),
    }
  }
}

impl From<io::Error> for ExportError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

impl From<serde_json::Error> for ExportError {
  fn from(value: serde_json::Error) -> Self {
    Self::Json(value)
  }
}

/// Streaming interface for report consumers.
pub trait ReportStreamWriter {
  /// # Errors
  ///
  /// Returns an `ExportError` if the reports cannot be serialized or the
  /// underlying writer fails to persist them.
  fn write_reports(
    &mut self,
    reports: &[LeakReport],
    timestamp: Option<SystemTime>,
  ) -> Result<(), ExportError>;
}

/// JSON lines exporter that writes one JSON object per report batch.
pub struct JsonLinesWriter<W: Write> {
  writer: W,
}

impl<W: Write> ReportStreamWriter for JsonLinesWriter<W> {
  fn write_reports(
    &mut self,
    reports: &[LeakReport],
    timestamp: Option<SystemTime>,
  ) -> Result<(), ExportError> {
    let chunk = StreamChunk::new(reports, timestamp);
    serde_json::to_writer(&mut self.writer, &chunk)?;
    self.writer.write_all(b"\n")?;
    Ok(())
  }
}

impl<W: Write> JsonLinesWriter<W> {
  pub fn into_inner(self) -> W {
    self.writer
  }

  pub fn new(writer: W) -> Self {
    Self { writer }
  }
}

#[derive(Serialize)]
struct StreamChunk<'a> {
  reports: &'a [LeakReport],
  #[serde(skip_serializing_if = "Option::is_none")]
  timestamp_ns: Option<u128>,
}

impl<'a> StreamChunk<'a> {
  fn new(reports: &'a [LeakReport], timestamp: Option<SystemTime>) -> Self {
    Self {
      reports,
      timestamp_ns: timestamp.and_then(system_time_to_nanos),
    }
  }
}

fn system_time_to_nanos(ts: SystemTime) -> Option<u128> {
  ts.duration_since(SystemTime::UNIX_EPOCH)
    .ok()
    .map(|duration| duration.as_nanos())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_reports() -> Vec<LeakReport> {
    vec![
      LeakReport {
        alloc_size_bytes: 56,
        call_stack_offsets: vec![0x1000, 0xdeadbeef],
      },
      LeakReport {
        alloc_size_bytes: 68,
        call_stack_offsets: vec![0x2000],
      },
    ]
  }

  #[test]
  fn writes_one_line_per_batch() {
    let mut writer = JsonLinesWriter::new(Vec::new());

    writer
      .write_reports(&sample_reports(), None)
      .expect("write failed");
    writer.write_reports(&[], None).expect("write failed");

    let output = writer.into_inner();
    let lines: Vec<&[u8]> = output.split(|&b| b == b'\n').collect();
    // Two lines plus the trailing empty split.
    assert_eq!(3, lines.len());
    assert!(lines[2].is_empty());

    let parsed: serde_json::Value =
      serde_json::from_slice(lines[0]).expect("invalid json");
    assert_eq!(2, parsed["reports"].as_array().expect("no reports").len());
    assert_eq!(56, parsed["reports"][0]["alloc_size_bytes"]);
    assert!(parsed.get("timestamp_ns").is_none());
  }

  #[test]
  fn timestamps_are_nanoseconds_since_epoch() {
    let mut writer = JsonLinesWriter::new(Vec::new());

    writer
      .write_reports(&[], Some(SystemTime::UNIX_EPOCH))
      .expect("write failed");

    let parsed: serde_json::Value =
      serde_json::from_slice(&writer.into_inner()).expect("invalid json");
    assert_eq!(0, parsed["timestamp_ns"]);
  }
}
