pub mod config;
pub mod engine;
pub mod engines;
pub mod error;
pub mod index;
pub mod poller;
pub mod remote;
pub mod search;
pub mod signing;
pub mod types;

pub use config::SearchConfig;
pub use engine::MatcherEngine;
pub use engines::GridEngine;
pub use error::SearchError;
pub use index::{EngineCall, LocalIndex};
pub use poller::UpdatePoller;
pub use remote::{QueryOptions, RemoteClient, Submission, UploadOptions};
pub use search::ImageSearch;
pub use types::{ImageSource, MatchResult, SearchHandler, NO_MATCH_LABEL};
