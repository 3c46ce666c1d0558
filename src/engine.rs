use image::GrayImage;
use std::path::Path;

pub const ENGINE_OK: i32 = 0;
pub const ENGINE_ERR: i32 = -1;
/// Completion code observed when the engine worker went away before replying.
pub const ENGINE_CLOSED: i32 = -2;

/// Contract of the local matching engine. Implementations return plain
/// result codes: 0 for success, negative for failure. `match_image` returns
/// the matched object's position in `object_ids` order, negative on a miss.
///
/// Engines are not required to be thread safe. All calls are made from the
/// single index worker thread, in the order commands were queued.
pub trait MatcherEngine: Send {
    fn load(&mut self, index_path: &Path, images_path: &Path) -> i32;
    fn train(&mut self) -> i32;
    fn match_image(&mut self, img: &GrayImage) -> i32;
    fn compute(&mut self, img: &GrayImage, obj_id: &str, img_id: &str) -> i32;

    fn object_ids(&self) -> Vec<String>;
    fn object_name(&self, obj_id: &str) -> Option<String>;
    fn object_meta(&self, obj_id: &str) -> Option<String>;
}
