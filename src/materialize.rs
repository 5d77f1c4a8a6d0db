//! Imports a directory tree that exists on disk but not in the catalog.
//!
//! Every subdirectory becomes a folder and every file with a permitted
//! extension and a recognisable image signature becomes an image. Each
//! insertion is preceded by a lookup, so running the walk again over the same
//! tree only finds existing records.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::db::{Catalog, FolderRecord, ImageRecord, NewImage};
use crate::error::{LibraryError, Result};
use crate::imagefile::{title_of, ExtensionPolicy, Rejection};
use crate::paths::{FolderPath, PathResolver, Target};
use crate::permissions::User;
use crate::search::SearchIndexer;
use crate::storage::{compute_hash, FileStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    /// Path below the images root.
    pub path: String,
    pub reason: Rejection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaterializeReport {
    pub root: FolderRecord,
    pub created_folders: Vec<FolderRecord>,
    pub created_images: Vec<ImageRecord>,
    pub existing_folders: usize,
    pub existing_images: usize,
    pub skipped: Vec<SkippedEntry>,
}

impl MaterializeReport {
    fn new(root: FolderRecord) -> Self {
        Self {
            root,
            created_folders: Vec::new(),
            created_images: Vec::new(),
            existing_folders: 0,
            existing_images: 0,
            skipped: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.created_folders.is_empty() && self.created_images.is_empty()
    }
}

pub struct Materializer<'a> {
    catalog: &'a dyn Catalog,
    files: &'a dyn FileStore,
    resolver: &'a PathResolver,
    extensions: &'a ExtensionPolicy,
    indexer: &'a dyn SearchIndexer,
}

impl<'a> Materializer<'a> {
    pub fn new(
        catalog: &'a dyn Catalog,
        files: &'a dyn FileStore,
        resolver: &'a PathResolver,
        extensions: &'a ExtensionPolicy,
        indexer: &'a dyn SearchIndexer,
    ) -> Self {
        Self {
            catalog,
            files,
            resolver,
            extensions,
            indexer,
        }
    }

    /// Walks `<parent>/<dir_name>` and records everything below it.
    pub fn materialize(&self, parent: &Target, dir_name: &str, user: &User) -> Result<MaterializeReport> {
        let root_path = self.resolver.child(&parent.path, dir_name);
        if !self.files.is_dir(&root_path.absolute) {
            return Err(LibraryError::validation(format!(
                "{} is not a directory",
                root_path.relative
            )));
        }
        log::info!("Materializing {:?} from disk", root_path.absolute);

        let (root, created) = self.ensure_folder(parent.folder, dir_name)?;
        let mut report = MaterializeReport::new(root.clone());
        if created {
            report.created_folders.push(root.clone());
        } else {
            report.existing_folders += 1;
        }

        let images_root = self.resolver.root().absolute;
        let mut dirs: HashMap<PathBuf, (i64, FolderPath)> = HashMap::new();
        dirs.insert(root_path.absolute.clone(), (root.id, root_path.clone()));

        for entry in WalkDir::new(&root_path.absolute)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e))
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    log::warn!("Skipping unreadable entry {:?}: {}", path, e);
                    report.skipped.push(SkippedEntry {
                        path: display_below(&images_root, &path),
                        reason: Rejection::Unreadable(e.to_string()),
                    });
                    continue;
                }
            };
            let path = entry.path();
            let Some((parent_id, parent_path)) = path.parent().and_then(|p| dirs.get(p)).cloned() else {
                // parent directory was itself skipped
                continue;
            };
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                report.skipped.push(SkippedEntry {
                    path: display_below(&images_root, path),
                    reason: Rejection::Unreadable("file name is not valid UTF-8".to_string()),
                });
                continue;
            };

            if entry.file_type().is_dir() {
                let (folder, created) = self.ensure_folder(Some(parent_id), &name)?;
                if created {
                    report.created_folders.push(folder.clone());
                } else {
                    report.existing_folders += 1;
                }
                dirs.insert(
                    path.to_path_buf(),
                    (folder.id, self.resolver.child(&parent_path, &name)),
                );
            } else if entry.file_type().is_file() {
                self.import_file(parent_id, &parent_path, &name, path, user, &mut report)?;
            } else {
                report.skipped.push(SkippedEntry {
                    path: display_below(&images_root, path),
                    reason: Rejection::Unreadable("not a regular file".to_string()),
                });
            }
        }

        log::info!(
            "Materialized {}: {} folders and {} images created, {} entries skipped",
            root_path.relative,
            report.created_folders.len(),
            report.created_images.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    fn ensure_folder(&self, parent: Option<i64>, title: &str) -> Result<(FolderRecord, bool)> {
        if let Some(existing) = self.catalog.folder_by_title(parent, title)? {
            return Ok((existing, false));
        }
        match self.catalog.insert_folder(parent, title) {
            Ok(folder) => Ok((folder, true)),
            Err(LibraryError::DatabaseConflict { .. }) => {
                let existing = self
                    .catalog
                    .folder_by_title(parent, title)?
                    .ok_or_else(|| LibraryError::DatabaseConflict {
                        name: title.to_string(),
                    })?;
                Ok((existing, false))
            }
            Err(e) => Err(e),
        }
    }

    fn import_file(
        &self,
        folder_id: i64,
        dir: &FolderPath,
        name: &str,
        path: &Path,
        user: &User,
        report: &mut MaterializeReport,
    ) -> Result<()> {
        let shown = self.resolver.child(dir, name).relative;
        if let Err(reason) = self.extensions.check_name(name) {
            log::debug!("Skipping {}: {}", shown, reason);
            report.skipped.push(SkippedEntry { path: shown, reason });
            return Ok(());
        }

        let stored = self.resolver.stored_file(dir, name);
        if self.catalog.image_by_file(&stored)?.is_some() {
            report.existing_images += 1;
            return Ok(());
        }

        let bytes = match self.files.read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Skipping {}: {}", shown, e);
                report.skipped.push(SkippedEntry {
                    path: shown,
                    reason: Rejection::Unreadable(e.to_string()),
                });
                return Ok(());
            }
        };
        if let Err(reason) = self.extensions.validate(name, &bytes) {
            log::warn!("Skipping {}: {}", shown, reason);
            report.skipped.push(SkippedEntry { path: shown, reason });
            return Ok(());
        }

        let new_image = NewImage {
            title: title_of(name),
            folder_id: Some(folder_id),
            file: stored,
            file_size: bytes.len() as i64,
            file_hash: compute_hash(&bytes),
            uploaded_by: Some(user.username.clone()),
        };
        match self.catalog.insert_image(&new_image) {
            Ok(image) => {
                self.indexer.reindex(&image);
                report.created_images.push(image);
            }
            Err(LibraryError::DatabaseConflict { .. }) => report.existing_images += 1,
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

/// Dotfiles, `.git` and our own delete stashes are never imported.
fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

fn display_below(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
