use crate::db::ImageRecord;

/// Fire-and-forget hook into whatever search backend the host runs.
pub trait SearchIndexer: Send + Sync {
    fn reindex(&self, image: &ImageRecord);

    fn remove(&self, _image_id: i64) {}
}

pub struct NullIndexer;

impl SearchIndexer for NullIndexer {
    fn reindex(&self, _image: &ImageRecord) {}
}

/// Writes index notifications to the log. Used when no backend is wired up.
pub struct LogIndexer;

impl SearchIndexer for LogIndexer {
    fn reindex(&self, image: &ImageRecord) {
        log::debug!("Reindex image {} ({})", image.id, image.file);
    }

    fn remove(&self, image_id: i64) {
        log::debug!("Drop image {} from index", image_id);
    }
}
