//! Chunked resumable transfer engine / 分片断点续传引擎
//!
//! Vendor-neutral core shared by every chunk-capable driver:
//! planning, rapid-upload negotiation, multipart upload and lazy chunked reads.

pub mod engine;
pub mod hash;
pub mod negotiate;
pub mod planner;
pub mod reader;
pub mod retry;
pub mod session;
pub mod source;
pub mod transport;
pub mod upload;

pub use engine::{PutOutcome, TransferEngine};
pub use hash::{HashAlgorithm, IntegrityState, PartDigest};
pub use negotiate::{HashNegotiator, Negotiation, RapidUploadProof};
pub use planner::{plan, Chunk, ChunkGrowth, PlanConstraints, TransferPlan};
pub use reader::{ChunkedRangeReader, DownloadCursor, RemoteObject};
pub use retry::{Backoff, RetryPolicy};
pub use session::{PartTarget, UploadSession};
pub use source::UploadSource;
pub use transport::{
    ChunkDescriptor, ChunkFetchTransport, CreateRequest, CreateResponse, FinalizeRequest,
    FinalizeResponse, NegotiationTransport, PartSpec, PartTransport,
};
pub use upload::{UploadCoordinator, UploadOptions, UploadedParts};
