//! Image side of the reconciliation engine, plus the read-only views the
//! HTTP layer renders (folder tree and search).

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};

use crate::conflict::{suffixed_filename, suffixed_title, Conflict, EntryKind};
use crate::db::{FolderRecord, ImageRecord, NewImage};
use crate::engine::{stash_path, Outcome, Reconciler};
use crate::error::{LibraryError, Result};
use crate::imagefile::title_of;
use crate::paths::file_name;
use crate::permissions::{Action, Instance, User};
use crate::storage::compute_hash;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageSummary {
    pub id: i64,
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderNode {
    pub id: i64,
    pub title: String,
    pub images: Vec<ImageSummary>,
    pub sub_folders: Vec<FolderNode>,
}

impl Reconciler {
    fn load_image(&self, id: i64) -> Result<ImageRecord> {
        self.catalog
            .image(id)?
            .ok_or(LibraryError::NotFound { kind: "image", id })
    }

    /// Directory the image's file currently lives in.
    fn parent_dir(&self, image: &ImageRecord) -> PathBuf {
        self.resolver
            .absolute_file(&image.file)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.resolver.root().absolute)
    }

    fn require_any(&self, user: &User) -> Result<()> {
        if self.policy.has_any_permission(user, &Action::ALL) {
            Ok(())
        } else {
            Err(LibraryError::PermissionDenied {
                action: Action::Change,
            })
        }
    }

    /// Moves an image's file into `target` (root when `None`). A same-named
    /// file at the destination pushes the incoming one to `name1.ext`,
    /// `name2.ext`, ... and the title gets the same counter.
    pub fn move_image(&self, user: &User, image_id: i64, target: Option<i64>) -> Result<Outcome<ImageRecord>> {
        self.require(user, Action::Change)?;
        let (_guard, (image, target)) = self.lock_resolved(|| {
            let image = self.load_image(image_id)?;
            self.require_for(user, Action::Change, Instance::Image(&image))?;
            let target = self.target(target)?;
            let keys = vec![self.parent_dir(&image), target.path.absolute.clone()];
            Ok(((image, target), keys))
        })?;
        if image.folder_id == target.folder {
            return Ok(Outcome::Success { value: image });
        }

        let source = self.resolver.absolute_file(&image.file);

        if !self.files.exists(&source) {
            return Err(LibraryError::validation(format!(
                "File for image {} is missing: {}",
                image.id, image.file
            )));
        }
        self.files.create_dir_all(&target.path.absolute)?;

        let filename = file_name(&image.file).to_string();
        for suffix in 0..self.max_attempts {
            let candidate = suffixed_filename(&filename, suffix);
            match self
                .detector()
                .detect(EntryKind::Image, &target, &candidate, Some(image.id))?
            {
                Conflict::NoConflict => {}
                Conflict::DatabaseConflict | Conflict::FilesystemConflict => continue,
            }

            let destination = self.resolver.child(&target.path, &candidate).absolute;
            self.files.rename(&source, &destination)?;

            let moved = ImageRecord {
                title: suffixed_title(&image.title, suffix),
                folder_id: target.folder,
                file: self.resolver.stored_file(&target.path, &candidate),
                ..image.clone()
            };
            match self.catalog.update_image(&moved) {
                Ok(()) => {
                    log::info!("Moved image {}: {} -> {}", image.id, image.file, moved.file);
                    self.indexer.reindex(&moved);
                    return Ok(Outcome::placed(moved, suffix));
                }
                Err(e) => {
                    if let Err(undo_err) = self.files.rename(&destination, &source) {
                        log::error!(
                            "Could not roll back image move {:?} -> {:?}: {}",
                            source,
                            destination,
                            undo_err
                        );
                        return Err(LibraryError::PartialMoveFailure {
                            from: source,
                            to: destination,
                            reason: format!("{}; rollback failed: {}", e, undo_err),
                        });
                    }
                    if matches!(e, LibraryError::DatabaseConflict { .. }) {
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        Err(LibraryError::TooManyConflicts {
            name: filename,
            attempts: self.max_attempts,
        })
    }

    /// Stores an uploaded file in `folder` and records it.
    pub fn add_image(
        &self,
        user: &User,
        folder: Option<i64>,
        filename: &str,
        bytes: &[u8],
    ) -> Result<Outcome<ImageRecord>> {
        self.require(user, Action::Add)?;
        let name = Path::new(filename.trim())
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| LibraryError::validation("Title or file missing"))?;
        if bytes.is_empty() {
            return Err(LibraryError::validation("Title or file missing"));
        }
        self.target(folder)?;
        self.extensions
            .validate(&name, bytes)
            .map_err(|rejection| LibraryError::validation(rejection.to_string()))?;
        let title = title_of(&name);
        let file_hash = compute_hash(bytes);

        let (_guard, target) = self.lock_resolved(|| {
            let target = self.target(folder)?;
            let keys = vec![target.path.absolute.clone()];
            Ok((target, keys))
        })?;
        self.files.create_dir_all(&target.path.absolute)?;

        for suffix in 0..self.max_attempts {
            let candidate = suffixed_filename(&name, suffix);
            if self
                .detector()
                .detect(EntryKind::Image, &target, &candidate, None)?
                != Conflict::NoConflict
            {
                continue;
            }

            let destination = self.resolver.child(&target.path, &candidate).absolute;
            match self.files.write_new(&destination, bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }

            let new_image = NewImage {
                title: suffixed_title(&title, suffix),
                folder_id: target.folder,
                file: self.resolver.stored_file(&target.path, &candidate),
                file_size: bytes.len() as i64,
                file_hash: file_hash.clone(),
                uploaded_by: Some(user.username.clone()),
            };
            match self.catalog.insert_image(&new_image) {
                Ok(image) => {
                    log::info!("Added image {} ({})", image.file, image.id);
                    self.indexer.reindex(&image);
                    return Ok(Outcome::placed(image, suffix));
                }
                Err(e) => {
                    if let Err(undo_err) = self.files.remove_file(&destination) {
                        return Err(LibraryError::PartialMoveFailure {
                            from: destination.clone(),
                            to: destination,
                            reason: format!("{}; cleanup failed: {}", e, undo_err),
                        });
                    }
                    if matches!(e, LibraryError::DatabaseConflict { .. }) {
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        Err(LibraryError::TooManyConflicts {
            name,
            attempts: self.max_attempts,
        })
    }

    /// Changes the display title only; the file keeps its name.
    pub fn rename_image(&self, user: &User, id: i64, title: &str) -> Result<Outcome<ImageRecord>> {
        self.require(user, Action::Change)?;
        let image = self.load_image(id)?;
        self.require_for(user, Action::Change, Instance::Image(&image))?;
        let title = title.trim();
        if title.is_empty() {
            return Err(LibraryError::validation("Title not passed"));
        }

        let renamed = ImageRecord {
            title: title.to_string(),
            ..image
        };
        self.catalog.update_image(&renamed)?;
        self.indexer.reindex(&renamed);
        Ok(Outcome::Success { value: renamed })
    }

    pub fn delete_image(&self, user: &User, id: i64) -> Result<Outcome<ImageRecord>> {
        self.require(user, Action::Delete)?;
        let (_guard, image) = self.lock_resolved(|| {
            let image = self.load_image(id)?;
            self.require_for(user, Action::Delete, Instance::Image(&image))?;
            let keys = vec![self.parent_dir(&image)];
            Ok((image, keys))
        })?;

        let path = self.resolver.absolute_file(&image.file);

        let stash = if self.files.exists(&path) {
            let stash = stash_path(&path, id);
            self.files.rename(&path, &stash)?;
            Some(stash)
        } else {
            log::warn!("Image {} has no file at {:?}", id, path);
            None
        };

        if let Err(e) = self.catalog.delete_image(id) {
            if let Some(stash) = &stash {
                if let Err(undo_err) = self.files.rename(stash, &path) {
                    return Err(LibraryError::PartialMoveFailure {
                        from: stash.clone(),
                        to: path,
                        reason: format!("{}; restore failed: {}", e, undo_err),
                    });
                }
            }
            return Err(e);
        }
        if let Some(stash) = &stash {
            if let Err(e) = self.files.remove_file(stash) {
                log::warn!("Image {} deleted but {:?} was left behind: {}", id, stash, e);
            }
        }
        self.indexer.remove(id);
        log::info!("Deleted image {} ({})", id, image.file);
        Ok(Outcome::Success { value: image })
    }

    /// Title search, newest first, limited to images the user may edit.
    pub fn search_images(&self, user: &User, query: &str, folder: Option<i64>) -> Result<Vec<ImageRecord>> {
        self.require_any(user)?;
        let query = query.trim();
        if query.is_empty() {
            return Err(LibraryError::validation("No query string passed"));
        }
        if let Some(id) = folder {
            self.load_folder(id)?;
        }
        let hits = self.catalog.search_images(query, folder)?;
        Ok(hits
            .into_iter()
            .filter(|image| {
                [Action::Change, Action::Delete].iter().any(|action| {
                    self.policy
                        .has_permission_for_instance(user, *action, Instance::Image(image))
                })
            })
            .collect())
    }

    /// Nested view of one folder, or of every root folder when `folder` is `None`.
    pub fn list_folders(&self, user: &User, folder: Option<i64>) -> Result<Vec<FolderNode>> {
        self.require_any(user)?;
        let folders = match folder {
            Some(id) => vec![self.load_folder(id)?],
            None => self.catalog.child_folders(None)?,
        };
        folders
            .into_iter()
            .map(|folder| self.folder_node(folder))
            .collect()
    }

    fn folder_node(&self, folder: FolderRecord) -> Result<FolderNode> {
        let images = self
            .catalog
            .images_in(Some(folder.id))?
            .into_iter()
            .map(|image| ImageSummary {
                url: self.url_for(&image.file),
                id: image.id,
                title: image.title,
            })
            .collect();
        let sub_folders = self
            .catalog
            .child_folders(Some(folder.id))?
            .into_iter()
            .map(|child| self.folder_node(child))
            .collect::<Result<Vec<_>>>()?;
        Ok(FolderNode {
            id: folder.id,
            title: folder.title,
            images,
            sub_folders,
        })
    }

    pub fn url_for(&self, stored: &str) -> String {
        format!("{}/{}", self.media_url.trim_end_matches('/'), stored)
    }
}
