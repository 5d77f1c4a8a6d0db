#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use media_folders::db::{Catalog, Database, FolderDeletion, FolderRecord, ImageRecord, NewImage};
use media_folders::permissions::AllowAll;
use media_folders::{LibraryConfig, LibraryError, PermissionPolicy, Reconciler, Result, SearchIndexer, User};
use media_folders::storage::LocalFileStore;

pub const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01";
pub const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

#[derive(Default)]
pub struct RecordingIndexer {
    pub reindexed: Mutex<Vec<i64>>,
    pub removed: Mutex<Vec<i64>>,
}

impl RecordingIndexer {
    pub fn reindexed(&self) -> Vec<i64> {
        self.reindexed.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<i64> {
        self.removed.lock().unwrap().clone()
    }
}

impl SearchIndexer for RecordingIndexer {
    fn reindex(&self, image: &ImageRecord) {
        self.reindexed.lock().unwrap().push(image.id);
    }

    fn remove(&self, image_id: i64) {
        self.removed.lock().unwrap().push(image_id);
    }
}

/// Delegates to a real catalog but can be told to fail writes.
pub struct FlakyCatalog {
    pub inner: Arc<Database>,
    pub fail_writes: AtomicBool,
}

impl FlakyCatalog {
    fn check(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(LibraryError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "catalog unavailable",
            )))
        } else {
            Ok(())
        }
    }
}

impl Catalog for FlakyCatalog {
    fn folder(&self, id: i64) -> Result<Option<FolderRecord>> {
        self.inner.folder(id)
    }
    fn folder_by_title(&self, parent: Option<i64>, title: &str) -> Result<Option<FolderRecord>> {
        self.inner.folder_by_title(parent, title)
    }
    fn child_folders(&self, parent: Option<i64>) -> Result<Vec<FolderRecord>> {
        self.inner.child_folders(parent)
    }
    fn insert_folder(&self, parent: Option<i64>, title: &str) -> Result<FolderRecord> {
        self.check()?;
        self.inner.insert_folder(parent, title)
    }
    fn relocate_folder(
        &self,
        id: i64,
        parent: Option<i64>,
        title: &str,
        old_prefix: &str,
        new_prefix: &str,
    ) -> Result<Vec<ImageRecord>> {
        self.check()?;
        self.inner.relocate_folder(id, parent, title, old_prefix, new_prefix)
    }
    fn delete_folder(&self, id: i64) -> Result<FolderDeletion> {
        self.check()?;
        self.inner.delete_folder(id)
    }
    fn image(&self, id: i64) -> Result<Option<ImageRecord>> {
        self.inner.image(id)
    }
    fn image_by_file(&self, file: &str) -> Result<Option<ImageRecord>> {
        self.inner.image_by_file(file)
    }
    fn images_in(&self, folder: Option<i64>) -> Result<Vec<ImageRecord>> {
        self.inner.images_in(folder)
    }
    fn insert_image(&self, image: &NewImage) -> Result<ImageRecord> {
        self.check()?;
        self.inner.insert_image(image)
    }
    fn update_image(&self, image: &ImageRecord) -> Result<()> {
        self.check()?;
        self.inner.update_image(image)
    }
    fn delete_image(&self, id: i64) -> Result<()> {
        self.check()?;
        self.inner.delete_image(id)
    }
    fn search_images(&self, query: &str, folder: Option<i64>) -> Result<Vec<ImageRecord>> {
        self.inner.search_images(query, folder)
    }
}

pub struct Library {
    pub dir: tempfile::TempDir,
    pub db: Arc<Database>,
    pub flaky: Arc<FlakyCatalog>,
    pub indexer: Arc<RecordingIndexer>,
    pub engine: Reconciler,
}

pub fn library() -> Library {
    build(|_| {}, Arc::new(AllowAll))
}

pub fn library_with_config(tweak: impl FnOnce(&mut LibraryConfig)) -> Library {
    build(tweak, Arc::new(AllowAll))
}

pub fn library_with_policy(policy: Arc<dyn PermissionPolicy>) -> Library {
    build(|_| {}, policy)
}

fn build(tweak: impl FnOnce(&mut LibraryConfig), policy: Arc<dyn PermissionPolicy>) -> Library {
    let dir = tempfile::tempdir().unwrap();
    let mut config = LibraryConfig::with_media_root(dir.path());
    tweak(&mut config);

    let db = Arc::new(Database::in_memory().unwrap());
    let flaky = Arc::new(FlakyCatalog {
        inner: Arc::clone(&db),
        fail_writes: AtomicBool::new(false),
    });
    let indexer = Arc::new(RecordingIndexer::default());
    let engine = Reconciler::new(
        &config,
        flaky.clone(),
        Arc::new(LocalFileStore),
        policy,
        indexer.clone(),
    );
    fs::create_dir_all(engine.resolver().root().absolute).unwrap();
    Library {
        dir,
        db,
        flaky,
        indexer,
        engine,
    }
}

impl Library {
    pub fn images_root(&self) -> PathBuf {
        self.engine.resolver().root().absolute
    }

    /// Writes a file below the images root, creating directories on the way.
    pub fn write(&self, relative: &str, bytes: &[u8]) {
        let path = self.images_root().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.images_root().join(relative).exists()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.flaky.fail_writes.store(fail, Ordering::SeqCst);
    }
}

pub fn admin() -> User {
    User::superuser("admin")
}
