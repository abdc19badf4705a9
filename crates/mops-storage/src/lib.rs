//! Persistence and I/O for the pipeline: the campaign sink, the outbound
//! provider HTTP client and the raw response archive.

pub mod archive;
pub mod http;
pub mod pg;
pub mod store;

pub use archive::{ArchiveError, ArchivedResponse, ResponseArchive};
pub use http::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, ProviderResponse};
pub use pg::PgCampaignStore;
pub use store::{CampaignStore, MemoryCampaignStore, StoreError};

pub const CRATE_NAME: &str = "mops-storage";
