mod api;
mod archive;
mod cancel;
mod config;
mod error;
mod job;
mod retry;
mod stream;

mod materialize;
mod reconstruct;
mod schema;
mod sink;

mod mem;
mod pipeline;
mod progress;
mod util;

pub use crate::config::{validate_endpoints, EndpointSpec, ExtractOptions, OrphanPolicy, PollSchedule};
pub use crate::pipeline::{BulkExtractor, EndpointReport, TableSummary};

// remote boundary: export API trait, status model, replay of saved exports
pub use crate::api::{ExportApi, JobStatus, JobStatusReport, ReplayApi, ResultLocation};
pub use crate::cancel::{sleep_cancellable, CancelToken};
pub use crate::job::{ExportJob, JobHandle, JobOrchestrator};
pub use crate::retry::{retry_transient, RetryError, RetryPolicy};
pub use crate::stream::{open_result_stream, RecordLines};

// error taxonomy
pub use crate::error::{
    ApiError, EndpointError, JobError, KeyKind, MaterializeError, ReconstructError, StreamError, SubmissionError,
};

// table reconstruction and typing
pub use crate::materialize::{Column, FinalizedTable, ForeignKey, RowIter, SpillConfig, TableMaterializer};
pub use crate::reconstruct::{gid_type, RawRecord, Reconstructor, RecordLayout};
pub use crate::schema::{coerce, infer_value_type, is_timestamp_literal, literal_type, InferredType, TableSchema};

// sinks
pub use crate::sink::{JsonlSink, MemorySink, TableSink, TableSnapshot};

// raw archives written during extraction can be replayed with ReplayApi
pub use crate::archive::RawArchive;

// multiprogress and memory helpers for embedding applications
pub use crate::mem::{available_memory_fraction, is_low_memory};
pub use crate::progress::{set_global_multiprogress, RecordProgress};

pub use crate::util::{init_tracing_once, normalize_name};
