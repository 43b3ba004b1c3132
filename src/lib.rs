//! In-process statistical memory leak detection.
//!
//! The detector observes a host program's allocation and free events at
//! sampled rates, keeps a compact model of the live heap, and periodically
//! runs a two-tier analysis: allocation sizes whose net counts keep growing
//! are flagged first, then the call stacks behind a flagged size. Suspects
//! surface as a stream of [`LeakReport`]s. Overhead is bounded by the number
//! of distinct allocation sites, not by the number of live allocations.

mod analyzer;
mod arena;
mod call_stack;
mod compact_map;
mod config;
mod detector;
mod export;
mod hash;
mod ranked_list;
mod replay;
mod session;
mod stack_capture;
mod stack_table;
mod state;

use {
  serde::{Serialize, Serializer, ser::SerializeStruct},
  smallvec::SmallVec,
  std::{
    cell::Cell,
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
    io::{self, Read, Write},
    mem,
    sync::{
      Arc, OnceLock,
      atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::SystemTime,
  },
};

pub use {
  analyzer::{LeakAnalyzer, LeakValue},
  arena::{Arena, ArenaStats},
  call_stack::{CallStack, CallStackManager},
  compact_map::{AddressMapStats, AllocRecord, CompactAddressMap},
  config::DetectorConfig,
  detector::{DetectorStats, LeakDetector, LeakReport, StackTraceFlags},
  export::{ExportError, JsonLinesWriter, ReportStreamWriter},
  ranked_list::{RankedEntry, RankedList},
  replay::{
    ALLOC_CODE, FREE_CODE, ReplayError, ReplaySummary, TraceHeader,
    TraceReader, TraceRecord, replay,
  },
  session::DetectorSession,
  stack_capture::capture_stack_frames,
  stack_table::CallStackTable,
  state::{
    initialize, is_initialized, on_alloc, on_free, shutdown, take_reports,
  },
};
