//! Helpers shared by unit tests

use crate::engine::{BufferUsage, DisplayEngine, HeadlessEngine};
use crate::image::Image;
use crate::types::{ClientId, DriverCollectionId, ImageId, ImageMetadata, ImageTiling, PixelFormat};
use std::rc::Rc;
use std::sync::Arc;

pub const COLLECTION: DriverCollectionId = DriverCollectionId(1000);

/// Import a 64x64 ARGB image straight through the engine
pub fn image(engine: &Arc<HeadlessEngine>, id: u64) -> Rc<Image> {
    let metadata = ImageMetadata::new(64, 64, PixelFormat::Argb8888);
    if engine.import_buffer_collection(COLLECTION).is_ok() {
        let usage = BufferUsage { tiling: ImageTiling::Linear, min_buffer_count: 1 };
        engine
            .set_buffer_collection_constraints(&usage, COLLECTION)
            .unwrap();
    }
    let handle = engine.import_image(&metadata, COLLECTION, 0).unwrap();
    let engine: Arc<dyn DisplayEngine> = engine.clone();
    Rc::new(Image::new(ImageId(id), ClientId(1), metadata, handle, engine))
}
