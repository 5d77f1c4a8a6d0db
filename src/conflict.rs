use serde::Serialize;
use std::path::Path;

use crate::db::Catalog;
use crate::error::Result;
use crate::paths::{PathResolver, Target};
use crate::storage::FileStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Folder,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Conflict {
    NoConflict,
    /// Another record already claims the name under this parent.
    DatabaseConflict,
    /// Something exists on disk at the resolved path with no record behind it.
    FilesystemConflict,
}

pub struct ConflictDetector<'a> {
    catalog: &'a dyn Catalog,
    files: &'a dyn FileStore,
    resolver: &'a PathResolver,
}

impl<'a> ConflictDetector<'a> {
    pub fn new(catalog: &'a dyn Catalog, files: &'a dyn FileStore, resolver: &'a PathResolver) -> Self {
        Self {
            catalog,
            files,
            resolver,
        }
    }

    /// Checks `name` under `parent`, database first. `ignore` is the id of the
    /// record being renamed or moved, which never conflicts with itself.
    pub fn detect(&self, kind: EntryKind, parent: &Target, name: &str, ignore: Option<i64>) -> Result<Conflict> {
        let claimed = match kind {
            EntryKind::Folder => self
                .catalog
                .folder_by_title(parent.folder, name)?
                .map(|folder| folder.id),
            EntryKind::Image => {
                let stored = self.resolver.stored_file(&parent.path, name);
                self.catalog.image_by_file(&stored)?.map(|image| image.id)
            }
        };
        match claimed {
            Some(id) if Some(id) != ignore => return Ok(Conflict::DatabaseConflict),
            Some(_) => return Ok(Conflict::NoConflict),
            None => {}
        }

        let on_disk = self.resolver.child(&parent.path, name).absolute;
        if self.files.exists(&on_disk) {
            return Ok(Conflict::FilesystemConflict);
        }
        Ok(Conflict::NoConflict)
    }
}

/// `title` for attempt 0, `title1`, `title2`, ... afterwards.
pub fn suffixed_title(title: &str, counter: u32) -> String {
    if counter == 0 {
        title.to_string()
    } else {
        format!("{}{}", title, counter)
    }
}

/// Inserts the counter between stem and extension: `photo.jpg` -> `photo1.jpg`.
pub fn suffixed_filename(filename: &str, counter: u32) -> String {
    if counter == 0 {
        return filename.to_string();
    }
    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.to_string());
    match path.extension() {
        Some(ext) => format!("{}{}.{}", stem, counter, ext.to_string_lossy()),
        None => format!("{}{}", stem, counter),
    }
}
