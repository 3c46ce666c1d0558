use crate::engine::{MatcherEngine, ENGINE_ERR, ENGINE_OK};
use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const GRID: u32 = 16;
const SIG_BYTES: usize = (GRID * GRID / 8) as usize;
// Maximum differing signature bits (of 256) still counted as a hit.
const MATCH_THRESHOLD: u32 = 48;

#[derive(Debug, Deserialize)]
struct ObjectRecord {
    obj_id: String,
    name: String,
    #[serde(default)]
    meta: Option<String>,
    #[serde(default)]
    images: Vec<String>,
}

#[derive(Debug)]
struct IndexedObject {
    id: String,
    name: String,
    meta: Option<String>,
    image_files: Vec<PathBuf>,
    signatures: Vec<[u8; SIG_BYTES]>,
}

/// Baseline matching engine: a mean-thresholded 16x16 luminance grid per
/// exemplar, nearest neighbour by Hamming distance. It keeps the crate
/// usable end to end without a vendored vision library; accuracy is what a
/// 256-bit signature buys and no more.
pub struct GridEngine {
    objects: Vec<IndexedObject>,
    trained: bool,
}

impl GridEngine {
    pub fn new() -> Self {
        GridEngine {
            objects: Vec::new(),
            trained: false,
        }
    }
}

impl Default for GridEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn signature(img: &GrayImage) -> [u8; SIG_BYTES] {
    let small = imageops::resize(img, GRID, GRID, FilterType::Triangle);
    let total: u32 = small.pixels().map(|p| p.0[0] as u32).sum();
    let mean = total / (GRID * GRID);

    let mut sig = [0u8; SIG_BYTES];
    for (i, p) in small.pixels().enumerate() {
        if p.0[0] as u32 >= mean {
            sig[i / 8] |= 1 << (i % 8);
        }
    }
    sig
}

fn hamming(a: &[u8; SIG_BYTES], b: &[u8; SIG_BYTES]) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

impl MatcherEngine for GridEngine {
    fn load(&mut self, index_path: &Path, images_path: &Path) -> i32 {
        log::debug!("Loading object index from {:?}", index_path);
        let raw = match fs::read_to_string(index_path) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Could not read object index {:?}: {}", index_path, e);
                return ENGINE_ERR;
            }
        };
        let records: Vec<ObjectRecord> = match serde_json::from_str(&raw) {
            Ok(records) => records,
            Err(e) => {
                log::warn!("Malformed object index {:?}: {}", index_path, e);
                return ENGINE_ERR;
            }
        };

        self.objects = records
            .into_iter()
            .map(|r| IndexedObject {
                image_files: r.images.iter().map(|rel| images_path.join(rel)).collect(),
                id: r.obj_id,
                name: r.name,
                meta: r.meta,
                signatures: Vec::new(),
            })
            .collect();
        self.trained = false;
        log::info!("Loaded {} objects from {:?}", self.objects.len(), index_path);
        ENGINE_OK
    }

    fn train(&mut self) -> i32 {
        let mut exemplars = 0usize;
        for object in &mut self.objects {
            object.signatures.clear();
            for file in &object.image_files {
                match image::open(file) {
                    Ok(img) => {
                        object.signatures.push(signature(&img.to_luma8()));
                        exemplars += 1;
                    }
                    Err(e) => {
                        log::warn!("Skipping unreadable exemplar {:?}: {}", file, e);
                    }
                }
            }
        }
        self.trained = true;
        log::info!(
            "Trained {} exemplar signatures across {} objects",
            exemplars,
            self.objects.len()
        );
        ENGINE_OK
    }

    fn match_image(&mut self, img: &GrayImage) -> i32 {
        if !self.trained {
            log::warn!("Match requested before the index was trained");
            return ENGINE_ERR;
        }

        let query = signature(img);
        let mut best: Option<(usize, u32)> = None;
        for (idx, object) in self.objects.iter().enumerate() {
            for sig in &object.signatures {
                let dist = hamming(&query, sig);
                if best.map_or(true, |(_, d)| dist < d) {
                    best = Some((idx, dist));
                }
            }
        }

        match best {
            Some((idx, dist)) if dist <= MATCH_THRESHOLD => {
                log::debug!(
                    "Matched object index {} at distance {} of {}",
                    idx,
                    dist,
                    GRID * GRID
                );
                idx as i32
            }
            Some((_, dist)) => {
                log::trace!("Best candidate too far: distance {}", dist);
                ENGINE_ERR
            }
            None => ENGINE_ERR,
        }
    }

    fn compute(&mut self, img: &GrayImage, obj_id: &str, img_id: &str) -> i32 {
        let sig = signature(img);
        if let Some(object) = self.objects.iter_mut().find(|o| o.id == obj_id) {
            object.signatures.push(sig);
        } else {
            self.objects.push(IndexedObject {
                id: obj_id.to_string(),
                name: obj_id.to_string(),
                meta: None,
                image_files: Vec::new(),
                signatures: vec![sig],
            });
        }
        log::debug!("Computed signature for object {} image {}", obj_id, img_id);
        self.trained = true;
        ENGINE_OK
    }

    fn object_ids(&self) -> Vec<String> {
        self.objects.iter().map(|o| o.id.clone()).collect()
    }

    fn object_name(&self, obj_id: &str) -> Option<String> {
        self.objects
            .iter()
            .find(|o| o.id == obj_id)
            .map(|o| o.name.clone())
    }

    fn object_meta(&self, obj_id: &str) -> Option<String> {
        self.objects
            .iter()
            .find(|o| o.id == obj_id)
            .and_then(|o| o.meta.clone())
    }
}
