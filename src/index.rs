use crate::engine::{MatcherEngine, ENGINE_CLOSED, ENGINE_ERR, ENGINE_OK};
use crate::error::SearchError;
use crate::types::ImageSource;
use image::imageops::FilterType;
use image::{GenericImageView, GrayImage};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{oneshot, Notify};
use walkdir::WalkDir;

/// Side length the engine sees for every query image.
pub const MATCH_IMAGE_SIZE: u32 = 150;

const UNPACK_DIR: &str = "matchdata";
const INDEX_FILE: &str = "objects.json";

pub enum IndexCommand {
    Init {
        bundle_dir: PathBuf,
        done: oneshot::Sender<i32>,
    },
    Load {
        index_path: PathBuf,
        images_path: PathBuf,
        done: oneshot::Sender<i32>,
    },
    Train {
        done: oneshot::Sender<i32>,
    },
    Match {
        image: ImageSource,
        done: oneshot::Sender<i32>,
    },
    Compute {
        image: ImageSource,
        obj_id: String,
        img_id: String,
        done: oneshot::Sender<i32>,
    },
}

/// Completion of one queued engine call.
pub struct EngineCall {
    receiver: oneshot::Receiver<i32>,
}

impl EngineCall {
    /// Resolves to the engine result code, `ENGINE_CLOSED` if the worker
    /// went away first.
    pub async fn wait(self) -> i32 {
        self.receiver.await.unwrap_or(ENGINE_CLOSED)
    }
}

/// Read-only snapshot of the trained objects, refreshed by the worker after
/// every load/train/compute. Lets any thread answer catalog queries without
/// touching the engine.
#[derive(Debug, Default)]
pub struct ObjectCatalog {
    ids: Vec<String>,
    names: HashMap<String, String>,
    metas: HashMap<String, String>,
}

/// Serialized access to a `MatcherEngine`. Commands are queued over a
/// channel and handled strictly in order by one dedicated worker thread;
/// the engine itself is never called from anywhere else. Dropping the
/// handle closes the queue and the worker drains and exits.
pub struct LocalIndex {
    commands: crossbeam_channel::Sender<IndexCommand>,
    catalog: Arc<RwLock<ObjectCatalog>>,
    ready: Arc<AtomicBool>,
    ready_notify: Arc<Notify>,
}

impl LocalIndex {
    pub fn new(engine: Box<dyn MatcherEngine>, data_dir: impl Into<PathBuf>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<IndexCommand>();
        let catalog = Arc::new(RwLock::new(ObjectCatalog::default()));
        let ready = Arc::new(AtomicBool::new(false));
        let ready_notify = Arc::new(Notify::new());

        let worker_catalog = catalog.clone();
        let worker_ready = ready.clone();
        let worker_notify = ready_notify.clone();
        let worker_data_dir = data_dir.into();
        std::thread::spawn(move || {
            run_worker(
                engine,
                rx,
                worker_catalog,
                worker_ready,
                worker_notify,
                worker_data_dir,
            );
        });

        LocalIndex {
            commands: tx,
            catalog,
            ready,
            ready_notify,
        }
    }

    pub fn request_init(&self, bundle_dir: impl Into<PathBuf>) -> Result<EngineCall, SearchError> {
        let (done, receiver) = oneshot::channel();
        self.commands.send(IndexCommand::Init {
            bundle_dir: bundle_dir.into(),
            done,
        })?;
        Ok(EngineCall { receiver })
    }

    pub fn request_load(
        &self,
        index_path: impl Into<PathBuf>,
        images_path: impl Into<PathBuf>,
    ) -> Result<EngineCall, SearchError> {
        let (done, receiver) = oneshot::channel();
        self.commands.send(IndexCommand::Load {
            index_path: index_path.into(),
            images_path: images_path.into(),
            done,
        })?;
        Ok(EngineCall { receiver })
    }

    pub fn request_train(&self) -> Result<EngineCall, SearchError> {
        let (done, receiver) = oneshot::channel();
        self.commands.send(IndexCommand::Train { done })?;
        Ok(EngineCall { receiver })
    }

    pub fn request_match(&self, image: ImageSource) -> Result<EngineCall, SearchError> {
        let (done, receiver) = oneshot::channel();
        self.commands.send(IndexCommand::Match { image, done })?;
        Ok(EngineCall { receiver })
    }

    pub fn request_compute(
        &self,
        image: ImageSource,
        obj_id: impl Into<String>,
        img_id: impl Into<String>,
    ) -> Result<EngineCall, SearchError> {
        let (done, receiver) = oneshot::channel();
        self.commands.send(IndexCommand::Compute {
            image,
            obj_id: obj_id.into(),
            img_id: img_id.into(),
            done,
        })?;
        Ok(EngineCall { receiver })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub async fn wait_ready(&self) {
        loop {
            // Create the notification future before checking the flag so a
            // wakeup between the check and the await is not lost.
            let notified = self.ready_notify.notified();
            if self.is_ready() {
                return;
            }
            notified.await;
        }
    }

    pub fn object_ids(&self) -> Vec<String> {
        self.catalog.read().unwrap().ids.clone()
    }

    pub fn object_id_at(&self, index: usize) -> Option<String> {
        self.catalog.read().unwrap().ids.get(index).cloned()
    }

    pub fn object_name(&self, obj_id: &str) -> Option<String> {
        self.catalog.read().unwrap().names.get(obj_id).cloned()
    }

    pub fn object_meta(&self, obj_id: &str) -> Option<String> {
        self.catalog.read().unwrap().metas.get(obj_id).cloned()
    }
}

fn run_worker(
    mut engine: Box<dyn MatcherEngine>,
    commands: crossbeam_channel::Receiver<IndexCommand>,
    catalog: Arc<RwLock<ObjectCatalog>>,
    ready: Arc<AtomicBool>,
    ready_notify: Arc<Notify>,
    data_dir: PathBuf,
) {
    log::debug!("Index worker started");

    while let Ok(command) = commands.recv() {
        match command {
            IndexCommand::Init { bundle_dir, done } => {
                log::info!("Initializing local index from bundle {:?}", bundle_dir);
                let code = run_init(&mut *engine, &bundle_dir, &data_dir);
                if code == ENGINE_OK {
                    refresh_catalog(&*engine, &catalog);
                    ready.store(true, Ordering::SeqCst);
                    ready_notify.notify_waiters();
                    log::info!("Local index ready");
                } else {
                    log::warn!("Local index initialization failed with code {}", code);
                }
                let _ = done.send(code);
            }
            IndexCommand::Load {
                index_path,
                images_path,
                done,
            } => {
                let code = engine.load(&index_path, &images_path);
                if code == ENGINE_OK {
                    refresh_catalog(&*engine, &catalog);
                }
                let _ = done.send(code);
            }
            IndexCommand::Train { done } => {
                let code = engine.train();
                if code == ENGINE_OK {
                    refresh_catalog(&*engine, &catalog);
                    ready.store(true, Ordering::SeqCst);
                    ready_notify.notify_waiters();
                }
                let _ = done.send(code);
            }
            IndexCommand::Match { image, done } => {
                let code = match prepare_match_image(&image) {
                    Ok(gray) => engine.match_image(&gray),
                    Err(e) => {
                        log::warn!("Could not decode query image: {}", e);
                        ENGINE_ERR
                    }
                };
                let _ = done.send(code);
            }
            IndexCommand::Compute {
                image,
                obj_id,
                img_id,
                done,
            } => {
                let code = match decode_gray(&image) {
                    Ok(gray) => engine.compute(&gray, &obj_id, &img_id),
                    Err(e) => {
                        log::warn!("Could not decode exemplar image: {}", e);
                        ENGINE_ERR
                    }
                };
                if code == ENGINE_OK {
                    refresh_catalog(&*engine, &catalog);
                }
                let _ = done.send(code);
            }
        }
    }

    log::debug!("Index worker exiting, command queue closed");
}

fn run_init(engine: &mut dyn MatcherEngine, bundle_dir: &Path, data_dir: &Path) -> i32 {
    let target = data_dir.join(UNPACK_DIR);
    if let Err(e) = unpack_bundle(bundle_dir, &target) {
        log::warn!("Bundle unpack from {:?} failed: {}", bundle_dir, e);
        return ENGINE_ERR;
    }

    let code = engine.load(&target.join(INDEX_FILE), &target);
    if code != ENGINE_OK {
        return code;
    }
    engine.train()
}

fn unpack_bundle(bundle_dir: &Path, target: &Path) -> Result<(), SearchError> {
    if target.exists() {
        log::debug!("Bundle already unpacked at {:?}", target);
        return Ok(());
    }

    // Copy into a staging sibling and rename into place at the end; a copy
    // that dies partway must never leave a half-populated target behind.
    let staging = target.with_extension("partial");
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;
    for entry in WalkDir::new(bundle_dir) {
        let entry = entry?;
        let rel = match entry.path().strip_prefix(bundle_dir) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = staging.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &dest)?;
            log::trace!("Unpacked bundle file {:?}", dest);
        }
    }
    std::fs::rename(&staging, target)?;
    Ok(())
}

fn refresh_catalog(engine: &dyn MatcherEngine, catalog: &RwLock<ObjectCatalog>) {
    let ids = engine.object_ids();
    let mut names = HashMap::new();
    let mut metas = HashMap::new();
    for id in &ids {
        if let Some(name) = engine.object_name(id) {
            names.insert(id.clone(), name);
        }
        if let Some(meta) = engine.object_meta(id) {
            metas.insert(id.clone(), meta);
        }
    }
    log::trace!("Catalog snapshot refreshed with {} objects", ids.len());
    *catalog.write().unwrap() = ObjectCatalog { ids, names, metas };
}

fn decode_gray(image: &ImageSource) -> Result<GrayImage, SearchError> {
    let img = match image {
        ImageSource::Path(path) => image::open(path)?,
        ImageSource::Bytes { data, .. } => image::load_from_memory(data)?,
    };
    Ok(img.to_luma8())
}

/// Center-crop to a square of half the shorter side, then scale to the
/// fixed engine input size and grayscale.
fn prepare_match_image(image: &ImageSource) -> Result<GrayImage, SearchError> {
    let img = match image {
        ImageSource::Path(path) => image::open(path)?,
        ImageSource::Bytes { data, .. } => image::load_from_memory(data)?,
    };
    let (width, height) = img.dimensions();
    let side = std::cmp::max(1, width.min(height) / 2);
    let x = (width - side) / 2;
    let y = (height - side) / 2;
    let cropped = img.crop_imm(x, y, side, side);
    let resized = cropped.resize_exact(MATCH_IMAGE_SIZE, MATCH_IMAGE_SIZE, FilterType::Triangle);
    Ok(resized.to_luma8())
}
