use crate::error::SearchError;
use lazy_static::lazy_static;
use std::path::PathBuf;
use std::time::Instant;

/// An image handed to a search call, either on disk or already in memory.
#[derive(Debug, Clone)]
pub enum ImageSource {
    Path(PathBuf),
    Bytes { data: Vec<u8>, file_name: String },
}

impl ImageSource {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        ImageSource::Path(path.into())
    }

    pub fn file_name(&self) -> String {
        match self {
            ImageSource::Path(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            ImageSource::Bytes { file_name, .. } => file_name.clone(),
        }
    }

    pub async fn load(&self) -> Result<Vec<u8>, SearchError> {
        match self {
            ImageSource::Path(path) => {
                if !path.exists() {
                    return Err(SearchError::Protocol(format!(
                        "image file not found: {:?}",
                        path
                    )));
                }
                Ok(tokio::fs::read(path).await?)
            }
            ImageSource::Bytes { data, .. } => Ok(data.clone()),
        }
    }
}

/// Label delivered for a remote query the service resolved to nothing.
pub const NO_MATCH_LABEL: &str = "no match found";

/// Final outcome of one search, local or remote.
#[derive(Debug)]
pub struct MatchResult {
    pub query_id: Option<String>,
    pub object_id: Option<String>,
    pub object_name: Option<String>,
    pub object_meta: Option<String>,
    pub remote_match: bool,
    pub error: Option<SearchError>,
}

impl MatchResult {
    pub fn found(&self) -> bool {
        self.error.is_none()
            && self
                .object_name
                .as_deref()
                .map_or(false, |name| name != NO_MATCH_LABEL)
    }
}

/// Callbacks for one search call. `on_query_id_assigned` fires as soon as
/// the query has an identity, `on_result` exactly once with the outcome.
pub trait SearchHandler: Send + Sync {
    fn on_query_id_assigned(&self, query_id: &str, image: &ImageSource);
    fn on_result(&self, result: MatchResult);
}

lazy_static! {
    static ref PROCESS_EPOCH: Instant = Instant::now();
}

/// Query ids for locally resolved searches: milliseconds since first use.
pub fn local_query_id() -> String {
    PROCESS_EPOCH.elapsed().as_millis().to_string()
}
