//! Quality gate applied to every fetched record before any bytes move.

use crate::harvester::api_client::PhotoRecord;
use crate::harvester::config_loader::QualityConfig;

/// Pure predicate over declared dimensions and popularity. Thresholds come
/// from configuration, not constants.
#[derive(Debug, Clone, Copy)]
pub struct QualityFilter {
    min_width: u32,
    min_height: u32,
    min_likes: u32,
}

impl QualityFilter {
    pub fn new(config: &QualityConfig) -> Self {
        Self {
            min_width: config.min_width,
            min_height: config.min_height,
            min_likes: config.min_likes,
        }
    }

    pub fn accept(&self, photo: &PhotoRecord) -> bool {
        photo.width >= self.min_width
            && photo.height >= self.min_height
            && photo.likes >= self.min_likes
    }
}
