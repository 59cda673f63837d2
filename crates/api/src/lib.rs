//! HTTP collaborators of the session engine.
//!
//! These never touch protocol state: their results are fed back into the engine by the driver.
pub mod client;
pub mod error;
pub mod model;
pub mod types;

pub use client::{ApiClient, ApiConfig};
pub use error::{ApiError, ApiResult};
pub use model::{
    DEFAULT_MODEL_ID, Model, ModelCache, ModelCatalog, ModelCatalogSource, ModelListing,
};
pub use types::{HistoryQuery, HistoryRecord, ShareSnapshot, ThreadSummary};
