use crate::config::SearchConfig;
use crate::engine::MatcherEngine;
use crate::engines::GridEngine;
use crate::error::SearchError;
use crate::index::LocalIndex;
use crate::poller::{PendingQueries, UpdatePoller};
use crate::remote::{QueryOptions, RemoteClient, UpdateSource, UploadOptions};
use crate::types::{local_query_id, ImageSource, MatchResult, SearchHandler};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};

struct LocalHit {
    object_id: String,
    object_name: Option<String>,
    object_meta: Option<String>,
}

/// Front door for visual search. Routes each query to the on-device index,
/// the remote service, or both, and drives the shared query lifecycle:
/// id assignment, pending registration, and exactly one result callback
/// per search.
pub struct ImageSearch {
    config: SearchConfig,
    device_id: String,
    local: Mutex<Option<Arc<LocalIndex>>>,
    remote: Mutex<Option<Arc<RemoteClient>>>,
    pending: Arc<PendingQueries>,
    poller: Option<UpdatePoller>,
}

impl ImageSearch {
    pub fn new(config: SearchConfig) -> Result<Self, SearchError> {
        Self::with_engine(config, Box::new(GridEngine::new()))
    }

    /// Builds the facade around a caller-supplied matching engine.
    pub fn with_engine(
        config: SearchConfig,
        engine: Box<dyn MatcherEngine>,
    ) -> Result<Self, SearchError> {
        if !config.local_enabled && !config.remote_enabled {
            return Err(SearchError::Config(
                "local and remote search are both disabled".into(),
            ));
        }

        let device_id = config
            .device_id
            .clone()
            .unwrap_or_else(fallback_device_id);
        log::debug!("Search device id: {}", device_id);

        let local = if config.local_enabled {
            let index = Arc::new(LocalIndex::new(engine, &config.data_directory));
            if let Some(bundle) = &config.bundle_directory {
                // Bootstrap runs behind the command queue; the constructor
                // does not wait for it.
                match index.request_init(bundle) {
                    Ok(_) => log::info!("Local index bootstrap queued from {}", bundle),
                    Err(e) => log::warn!("Could not queue index bootstrap: {}", e),
                }
            }
            Some(index)
        } else {
            None
        };

        let pending = Arc::new(PendingQueries::new());
        let (remote, poller) = if config.remote_enabled {
            let client = Arc::new(RemoteClient::new(
                &config.base_url,
                config.api_key.clone(),
                config.api_secret.clone(),
            )?);
            let source: Arc<dyn UpdateSource> = client.clone();
            let poller = UpdatePoller::new(source, pending.clone(), Some(device_id.clone()));
            (Some(client), Some(poller))
        } else {
            (None, None)
        };

        Ok(ImageSearch {
            config,
            device_id,
            local: Mutex::new(local),
            remote: Mutex::new(remote),
            pending,
            poller,
        })
    }

    /// Matches against the on-device index only.
    pub async fn search_local(
        &self,
        image: ImageSource,
        handler: Arc<dyn SearchHandler>,
    ) -> Result<(), SearchError> {
        if !self.config.local_enabled {
            return Err(SearchError::State("local search is disabled".into()));
        }
        let outcome = self.run_local_match(&image).await?;
        deliver_local(&image, handler, outcome);
        Ok(())
    }

    /// Submits to the remote service. Submission failures are delivered
    /// through the handler, not the return value; the eventual result for
    /// a successful submission arrives later via the update poller.
    pub async fn search_remote(
        &self,
        image: ImageSource,
        handler: Arc<dyn SearchHandler>,
    ) -> Result<(), SearchError> {
        let opts = QueryOptions {
            json: true,
            ..QueryOptions::default()
        };
        self.search_remote_with(image, handler, opts).await
    }

    pub async fn search_remote_with(
        &self,
        image: ImageSource,
        handler: Arc<dyn SearchHandler>,
        opts: QueryOptions,
    ) -> Result<(), SearchError> {
        let client = self.remote_client()?;

        match client.submit(&image, Some(&self.device_id), &opts).await {
            Ok(submission) => {
                self.pending.register(submission.qid.clone(), handler.clone());
                handler.on_query_id_assigned(&submission.qid, &image);
                if let Some(poller) = &self.poller {
                    poller.wake();
                }
                Ok(())
            }
            Err(e) => {
                log::warn!("Remote submit failed: {}", e);
                handler.on_result(MatchResult {
                    query_id: None,
                    object_id: None,
                    object_name: None,
                    object_meta: None,
                    remote_match: true,
                    error: Some(e),
                });
                Ok(())
            }
        }
    }

    /// Local first when enabled; a local hit short-circuits the remote
    /// path entirely. A local miss falls through to the remote service
    /// when that is enabled, otherwise resolves as not found.
    pub async fn search(
        &self,
        image: ImageSource,
        handler: Arc<dyn SearchHandler>,
    ) -> Result<(), SearchError> {
        if !self.config.local_enabled && !self.config.remote_enabled {
            return Err(SearchError::State("no search path is enabled".into()));
        }

        if self.config.local_enabled {
            let outcome = self.run_local_match(&image).await?;
            if outcome.is_some() || !self.config.remote_enabled {
                deliver_local(&image, handler, outcome);
                return Ok(());
            }
            log::debug!("No local match, falling through to remote search");
        }
        self.search_remote(image, handler).await
    }

    /// Starts the update poller. No-op when remote search is disabled or
    /// the poller is already running.
    pub fn resume(&self) {
        if let Some(poller) = &self.poller {
            poller.resume();
        }
    }

    /// Stops the update poller. Idempotent.
    pub fn pause(&self) {
        if let Some(poller) = &self.poller {
            poller.pause();
        }
    }

    /// Tears down the local worker and the remote client. Safe to call
    /// more than once; searches after this fail with a state error.
    pub fn destroy(&self) {
        log::info!("Shutting down image search");
        self.pause();
        // Dropping the index closes its command queue; the worker drains
        // whatever was already queued and exits.
        drop(self.local.lock().unwrap().take());
        drop(self.remote.lock().unwrap().take());
    }

    pub fn is_index_ready(&self) -> bool {
        self.local
            .lock()
            .unwrap()
            .as_ref()
            .map_or(false, |index| index.is_ready())
    }

    pub async fn wait_index_ready(&self) {
        let index = self.local.lock().unwrap().clone();
        if let Some(index) = index {
            index.wait_ready().await;
        }
    }

    /// The device identity sent with remote calls so update results come
    /// back to this client.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub async fn upload_object(
        &self,
        images: &[ImageSource],
        name: &str,
        opts: &UploadOptions,
    ) -> Result<String, SearchError> {
        self.remote_client()?.upload_object(images, name, opts).await
    }

    pub async fn fetch_result(&self, qid: &str) -> Result<String, SearchError> {
        self.remote_client()?.fetch_result(qid, true).await
    }

    async fn run_local_match(&self, image: &ImageSource) -> Result<Option<LocalHit>, SearchError> {
        let index = self
            .local
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SearchError::State("search instance destroyed".into()))?;

        let code = index.request_match(image.clone())?.wait().await;
        if code < 0 {
            log::debug!("Local index reported no match (code {})", code);
            return Ok(None);
        }

        let object_id = match index.object_id_at(code as usize) {
            Some(id) => id,
            None => {
                log::warn!("Match index {} not in the catalog, treating as miss", code);
                return Ok(None);
            }
        };
        log::debug!("Local match: {}", object_id);
        Ok(Some(LocalHit {
            object_name: index.object_name(&object_id),
            object_meta: index.object_meta(&object_id),
            object_id,
        }))
    }

    fn remote_client(&self) -> Result<Arc<RemoteClient>, SearchError> {
        if !self.config.remote_enabled {
            return Err(SearchError::State("remote search is disabled".into()));
        }
        self.remote
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SearchError::State("search instance destroyed".into()))
    }
}

impl std::fmt::Debug for ImageSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSearch")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

fn deliver_local(image: &ImageSource, handler: Arc<dyn SearchHandler>, hit: Option<LocalHit>) {
    let query_id = local_query_id();
    handler.on_query_id_assigned(&query_id, image);
    let result = match hit {
        Some(hit) => MatchResult {
            query_id: Some(query_id),
            object_id: Some(hit.object_id),
            object_name: hit.object_name,
            object_meta: hit.object_meta,
            remote_match: false,
            error: None,
        },
        None => MatchResult {
            query_id: Some(query_id),
            object_id: None,
            object_name: None,
            object_meta: None,
            remote_match: false,
            error: None,
        },
    };
    handler.on_result(result);
}

fn fallback_device_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".into());
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;
    use std::path::Path;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingHandler {
        ids: Mutex<Vec<String>>,
        results: Mutex<Vec<MatchResult>>,
    }

    impl RecordingHandler {
        fn result_count(&self) -> usize {
            self.results.lock().unwrap().len()
        }
    }

    impl SearchHandler for RecordingHandler {
        fn on_query_id_assigned(&self, query_id: &str, _image: &ImageSource) {
            self.ids.lock().unwrap().push(query_id.to_string());
        }

        fn on_result(&self, result: MatchResult) {
            self.results.lock().unwrap().push(result);
        }
    }

    /// Engine that always reports the same match code.
    struct FixedEngine {
        code: i32,
        ids: Vec<String>,
    }

    impl MatcherEngine for FixedEngine {
        fn load(&mut self, _index_path: &Path, _images_path: &Path) -> i32 {
            0
        }
        fn train(&mut self) -> i32 {
            0
        }
        fn match_image(&mut self, _img: &GrayImage) -> i32 {
            self.code
        }
        fn compute(&mut self, _img: &GrayImage, _obj_id: &str, _img_id: &str) -> i32 {
            0
        }
        fn object_ids(&self) -> Vec<String> {
            self.ids.clone()
        }
        fn object_name(&self, obj_id: &str) -> Option<String> {
            Some(format!("{}-name", obj_id))
        }
        fn object_meta(&self, _obj_id: &str) -> Option<String> {
            Some("meta".into())
        }
    }

    fn test_config(local: bool, remote: bool, data_dir: &Path) -> SearchConfig {
        SearchConfig {
            local_enabled: local,
            remote_enabled: remote,
            api_key: "key".into(),
            api_secret: "secret".into(),
            // Closed loopback port, so any remote attempt fails fast.
            base_url: "http://127.0.0.1:9/v1.2".into(),
            device_id: Some("test-device".into()),
            data_directory: data_dir.to_string_lossy().into_owned(),
            bundle_directory: None,
            log_level: "debug".into(),
        }
    }

    fn sample_image(dir: &Path) -> ImageSource {
        let path = dir.join("query.png");
        GrayImage::from_fn(64, 64, |x, _| image::Luma([(x * 4) as u8]))
            .save(&path)
            .unwrap();
        ImageSource::from_path(path)
    }

    #[test]
    fn both_paths_disabled_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ImageSearch::new(test_config(false, false, dir.path())).unwrap_err();
        assert!(matches!(err, SearchError::Config(_)));
    }

    #[tokio::test]
    async fn disabled_paths_fail_with_state_errors() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(RecordingHandler::default());

        let remote_only = ImageSearch::new(test_config(false, true, dir.path())).unwrap();
        let err = remote_only
            .search_local(sample_image(dir.path()), handler.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::State(_)));

        let local_only = ImageSearch::new(test_config(true, false, dir.path())).unwrap();
        let err = local_only
            .search_remote(sample_image(dir.path()), handler.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::State(_)));
        assert_eq!(handler.result_count(), 0);
    }

    #[tokio::test]
    async fn local_miss_with_remote_disabled_resolves_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let search = ImageSearch::new(test_config(true, false, dir.path())).unwrap();
        let handler = Arc::new(RecordingHandler::default());

        search
            .search(sample_image(dir.path()), handler.clone())
            .await
            .unwrap();

        // Resolved synchronously relative to the call.
        let results = handler.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].found());
        assert_eq!(results[0].object_id, None);
        assert!(!results[0].remote_match);
        assert!(results[0].error.is_none());
        assert_eq!(handler.ids.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn local_hit_short_circuits_remote() {
        let bundle = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let mut config = test_config(true, true, data.path());
        config.bundle_directory = Some(bundle.path().to_string_lossy().into_owned());

        let engine = FixedEngine {
            code: 0,
            ids: vec!["obj1".into()],
        };
        let search = ImageSearch::with_engine(config, Box::new(engine)).unwrap();
        tokio::time::timeout(Duration::from_secs(5), search.wait_index_ready())
            .await
            .unwrap();

        let handler = Arc::new(RecordingHandler::default());
        search
            .search(sample_image(data.path()), handler.clone())
            .await
            .unwrap();

        let results = handler.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].found());
        assert!(!results[0].remote_match);
        assert_eq!(results[0].object_id.as_deref(), Some("obj1"));
        assert_eq!(results[0].object_name.as_deref(), Some("obj1-name"));
        assert!(results[0].error.is_none());
    }

    #[tokio::test]
    async fn local_miss_falls_through_to_remote() {
        let dir = tempfile::tempdir().unwrap();
        let search = ImageSearch::new(test_config(true, true, dir.path())).unwrap();
        let handler = Arc::new(RecordingHandler::default());

        search
            .search(sample_image(dir.path()), handler.clone())
            .await
            .unwrap();

        // The untrained index misses; the remote submit then fails fast
        // and surfaces through the handler, exactly once.
        let results = handler.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].remote_match);
        assert!(matches!(results[0].error, Some(SearchError::Network(_))));
    }

    #[tokio::test]
    async fn remote_submit_failure_reaches_handler_not_caller() {
        let dir = tempfile::tempdir().unwrap();
        let search = ImageSearch::new(test_config(false, true, dir.path())).unwrap();
        let handler = Arc::new(RecordingHandler::default());

        search
            .search_remote(sample_image(dir.path()), handler.clone())
            .await
            .unwrap();

        assert_eq!(handler.ids.lock().unwrap().len(), 0);
        let results = handler.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].remote_match);
        assert!(results[0].error.is_some());
        assert_eq!(results[0].query_id, None);
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_blocks_later_searches() {
        let dir = tempfile::tempdir().unwrap();
        let search = ImageSearch::new(test_config(true, false, dir.path())).unwrap();

        search.destroy();
        search.destroy();

        let handler = Arc::new(RecordingHandler::default());
        let err = search
            .search_local(sample_image(dir.path()), handler)
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::State(_)));
    }

    #[tokio::test]
    async fn resume_and_pause_tolerate_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let search = ImageSearch::new(test_config(false, true, dir.path())).unwrap();
        search.resume();
        search.resume();
        search.pause();
        search.pause();

        let local_only = ImageSearch::new(test_config(true, false, dir.path())).unwrap();
        local_only.resume();
        local_only.pause();
    }

    #[test]
    fn fallback_device_id_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(false, true, dir.path());
        config.device_id = None;
        let a = ImageSearch::new(config.clone()).unwrap();
        let b = ImageSearch::new(config).unwrap();
        assert_eq!(a.device_id(), b.device_id());
        assert_eq!(a.device_id().len(), 16);
    }

    #[test]
    fn fallback_device_id_comes_from_the_os_not_the_environment() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(false, true, dir.path());
        config.device_id = None;

        std::env::set_var("HOSTNAME", "decoy-host-a");
        let a = ImageSearch::new(config.clone()).unwrap();
        std::env::set_var("HOSTNAME", "decoy-host-b");
        let b = ImageSearch::new(config).unwrap();
        std::env::remove_var("HOSTNAME");

        assert_eq!(a.device_id(), b.device_id());
    }
}
