//! Folder side of the reconciliation engine.
//!
//! Every mutating operation follows the same shape: permission check, load
//! and validate inputs, take the path lock for the affected directories, then
//! loop over candidate names (database conflicts get a numeric suffix, a
//! foreign directory on disk gets materialized instead) and finally apply the
//! disk change and the catalog change as one unit.

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::LibraryConfig;
use crate::conflict::{suffixed_title, Conflict, ConflictDetector, EntryKind};
use crate::db::{Catalog, FolderDeletion, FolderRecord};
use crate::error::{LibraryError, Result};
use crate::imagefile::ExtensionPolicy;
use crate::locks::{PathGuard, PathLocks};
use crate::materialize::{MaterializeReport, Materializer};
use crate::paths::{ancestry, FolderPath, PathResolver, Target};
use crate::permissions::{Action, Instance, PermissionPolicy, User};
use crate::search::SearchIndexer;
use crate::storage::FileStore;

const MAX_TITLE_LEN: usize = 255;

/// How an operation that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome<T> {
    Success { value: T },
    /// Placed under `<name><suffix>` to avoid a collision.
    Renamed { value: T, suffix: u32 },
    /// The requested name was taken by an unrecorded directory on disk. That
    /// directory was imported instead and the original request was not applied.
    Recovered { report: MaterializeReport },
}

impl<T> Outcome<T> {
    pub(crate) fn placed(value: T, suffix: u32) -> Self {
        if suffix == 0 {
            Outcome::Success { value }
        } else {
            Outcome::Renamed { value, suffix }
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Success { value } | Outcome::Renamed { value, .. } => Some(value),
            Outcome::Recovered { .. } => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Outcome::Success { value } | Outcome::Renamed { value, .. } => Some(value),
            Outcome::Recovered { .. } => None,
        }
    }

    pub fn is_renamed(&self) -> bool {
        matches!(self, Outcome::Renamed { .. })
    }

    pub fn is_recovered(&self) -> bool {
        matches!(self, Outcome::Recovered { .. })
    }
}

/// Where a folder should end up after `rename_or_move_folder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Unchanged,
    Root,
    Under(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletedFolder {
    pub folder: FolderRecord,
    pub removed: FolderDeletion,
}

#[derive(Debug, PartialEq)]
struct FolderMove {
    folder: FolderRecord,
    new_parent: Option<i64>,
    title: String,
    source: FolderPath,
    target: Target,
}

pub struct Reconciler {
    pub(crate) catalog: Arc<dyn Catalog>,
    pub(crate) files: Arc<dyn FileStore>,
    pub(crate) policy: Arc<dyn PermissionPolicy>,
    pub(crate) indexer: Arc<dyn SearchIndexer>,
    pub(crate) resolver: PathResolver,
    pub(crate) extensions: ExtensionPolicy,
    pub(crate) media_url: String,
    pub(crate) max_attempts: u32,
    pub(crate) locks: PathLocks,
}

impl Reconciler {
    pub fn new(
        config: &LibraryConfig,
        catalog: Arc<dyn Catalog>,
        files: Arc<dyn FileStore>,
        policy: Arc<dyn PermissionPolicy>,
        indexer: Arc<dyn SearchIndexer>,
    ) -> Self {
        Self {
            catalog,
            files,
            policy,
            indexer,
            resolver: PathResolver::new(&config.media_root, config.images_dir.clone()),
            extensions: ExtensionPolicy::new(&config.allowed_extensions),
            media_url: config.media_url.clone(),
            max_attempts: config.max_conflict_attempts.max(1),
            locks: PathLocks::new(),
        }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    pub(crate) fn detector(&self) -> ConflictDetector<'_> {
        ConflictDetector::new(self.catalog.as_ref(), self.files.as_ref(), &self.resolver)
    }

    pub(crate) fn materializer(&self) -> Materializer<'_> {
        Materializer::new(
            self.catalog.as_ref(),
            self.files.as_ref(),
            &self.resolver,
            &self.extensions,
            self.indexer.as_ref(),
        )
    }

    pub(crate) fn require(&self, user: &User, action: Action) -> Result<()> {
        if self.policy.has_permission(user, action) {
            Ok(())
        } else {
            log::warn!("{} denied {}", user.username, action);
            Err(LibraryError::PermissionDenied { action })
        }
    }

    pub(crate) fn require_for(&self, user: &User, action: Action, instance: Instance<'_>) -> Result<()> {
        if self.policy.has_permission_for_instance(user, action, instance) {
            Ok(())
        } else {
            log::warn!("{} denied {} on {:?}", user.username, action, instance);
            Err(LibraryError::PermissionDenied { action })
        }
    }

    pub(crate) fn load_folder(&self, id: i64) -> Result<FolderRecord> {
        self.catalog
            .folder(id)?
            .ok_or(LibraryError::NotFound { kind: "folder", id })
    }

    pub(crate) fn target(&self, folder: Option<i64>) -> Result<Target> {
        if let Some(id) = folder {
            self.load_folder(id)?;
        }
        self.resolver.target(self.catalog.as_ref(), folder)
    }

    /// Resolves `plan`, locks the paths it names, then resolves again. If a
    /// concurrent rename or move changed the answer while we waited, the
    /// locks are released and the whole thing starts over.
    pub(crate) fn lock_resolved<P, F>(&self, mut plan: F) -> Result<(PathGuard<'_>, P)>
    where
        P: PartialEq,
        F: FnMut() -> Result<(P, Vec<PathBuf>)>,
    {
        loop {
            let (expected, keys) = plan()?;
            let guard = self.locks.acquire(&keys)?;
            let (current, _) = plan()?;
            if current == expected {
                return Ok((guard, current));
            }
            log::debug!("Paths moved while waiting for {:?}, resolving again", keys);
        }
    }

    pub fn create_folder(&self, user: &User, parent: Option<i64>, title: &str) -> Result<Outcome<FolderRecord>> {
        self.require(user, Action::Add)?;
        let title = clean_title(title)?;
        let (_guard, parent) = self.lock_resolved(|| {
            let target = self.target(parent)?;
            let keys = vec![target.path.absolute.clone()];
            Ok((target, keys))
        })?;
        self.files.create_dir_all(&parent.path.absolute)?;

        for suffix in 0..self.max_attempts {
            let candidate = suffixed_title(&title, suffix);
            match self.detector().detect(EntryKind::Folder, &parent, &candidate, None)? {
                Conflict::DatabaseConflict => continue,
                Conflict::FilesystemConflict => {
                    let on_disk = self.resolver.child(&parent.path, &candidate);
                    if !self.files.is_dir(&on_disk.absolute) {
                        // a plain file can't become a folder, pick another name
                        continue;
                    }
                    return self.recover(user, &parent, &candidate);
                }
                Conflict::NoConflict => {}
            }

            let path = self.resolver.child(&parent.path, &candidate);
            match self.files.create_dir(&path.absolute) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    // appeared between the probe and the create
                    return self.recover(user, &parent, &candidate);
                }
                Err(e) => return Err(e.into()),
            }
            match self.catalog.insert_folder(parent.folder, &candidate) {
                Ok(folder) => {
                    log::info!("Created folder {} ({})", path.relative, folder.id);
                    return Ok(Outcome::placed(folder, suffix));
                }
                Err(LibraryError::DatabaseConflict { .. }) => {
                    self.undo_create_dir(&path.absolute)?;
                    continue;
                }
                Err(e) => {
                    self.undo_create_dir(&path.absolute)?;
                    return Err(e);
                }
            }
        }
        Err(LibraryError::TooManyConflicts {
            name: title,
            attempts: self.max_attempts,
        })
    }

    pub fn rename_or_move_folder(
        &self,
        user: &User,
        id: i64,
        title: Option<&str>,
        placement: Placement,
    ) -> Result<Outcome<FolderRecord>> {
        self.require(user, Action::Change)?;
        let requested = title.map(clean_title).transpose()?;
        let (_guard, plan) =
            self.lock_resolved(|| self.plan_folder_move(user, id, requested.as_deref(), placement))?;
        let FolderMove {
            folder,
            new_parent,
            title,
            source,
            target,
        } = plan;
        if new_parent == folder.parent_id && title == folder.title {
            return Ok(Outcome::Success { value: folder });
        }
        self.files.create_dir_all(&target.path.absolute)?;

        for suffix in 0..self.max_attempts {
            let candidate = suffixed_title(&title, suffix);
            let destination = self.resolver.child(&target.path, &candidate);
            match self
                .detector()
                .detect(EntryKind::Folder, &target, &candidate, Some(folder.id))?
            {
                Conflict::DatabaseConflict => continue,
                Conflict::FilesystemConflict => {
                    if !self.files.is_dir(&destination.absolute) {
                        continue;
                    }
                    return self.recover(user, &target, &candidate);
                }
                Conflict::NoConflict => {}
            }

            match self.apply_folder_move(&folder, new_parent, &candidate, &source, &destination) {
                Ok(moved) => return Ok(Outcome::placed(moved, suffix)),
                Err(LibraryError::DatabaseConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(LibraryError::TooManyConflicts {
            name: title,
            attempts: self.max_attempts,
        })
    }

    /// Everything a folder rename or move acts on, resolved from the catalog.
    /// Locks the source parent and the target parent, which between them
    /// cover the folder's whole subtree before and after the move.
    fn plan_folder_move(
        &self,
        user: &User,
        id: i64,
        title: Option<&str>,
        placement: Placement,
    ) -> Result<(FolderMove, Vec<PathBuf>)> {
        let folder = self.load_folder(id)?;
        self.require_for(user, Action::Change, Instance::Folder(&folder))?;

        let new_parent = match placement {
            Placement::Unchanged => folder.parent_id,
            Placement::Root => None,
            Placement::Under(parent_id) => {
                self.load_folder(parent_id)?;
                if ancestry(self.catalog.as_ref(), parent_id)?
                    .iter()
                    .any(|f| f.id == folder.id)
                {
                    return Err(LibraryError::validation(
                        "Cannot move a folder into itself or one of its sub folders",
                    ));
                }
                Some(parent_id)
            }
        };
        let title = title.map(str::to_string).unwrap_or_else(|| folder.title.clone());

        let source_parent = self.resolver.resolve(self.catalog.as_ref(), folder.parent_id)?;
        let source = self.resolver.child(&source_parent, &folder.title);
        let target = self.target(new_parent)?;
        let keys = vec![source_parent.absolute, target.path.absolute.clone()];
        Ok((
            FolderMove {
                folder,
                new_parent,
                title,
                source,
                target,
            },
            keys,
        ))
    }

    /// Renames the directory, then updates the catalog. A failed catalog update
    /// puts the directory back.
    fn apply_folder_move(
        &self,
        folder: &FolderRecord,
        new_parent: Option<i64>,
        title: &str,
        source: &FolderPath,
        destination: &FolderPath,
    ) -> Result<FolderRecord> {
        let moved_on_disk = if self.files.exists(&source.absolute) {
            self.files.rename(&source.absolute, &destination.absolute)?;
            true
        } else {
            log::warn!(
                "Folder {} missing on disk at {:?}, recreating",
                folder.id,
                source.absolute
            );
            self.files.create_dir(&destination.absolute)?;
            false
        };

        let relocated = self.catalog.relocate_folder(
            folder.id,
            new_parent,
            title,
            &self.resolver.stored_dir(source),
            &self.resolver.stored_dir(destination),
        );
        let relocated = match relocated {
            Ok(relocated) => relocated,
            Err(e) => {
                let undo = if moved_on_disk {
                    self.files.rename(&destination.absolute, &source.absolute)
                } else {
                    self.files.remove_dir(&destination.absolute)
                };
                if let Err(undo_err) = undo {
                    log::error!(
                        "Could not roll back folder move {:?} -> {:?}: {}",
                        source.absolute,
                        destination.absolute,
                        undo_err
                    );
                    return Err(LibraryError::PartialMoveFailure {
                        from: source.absolute.clone(),
                        to: destination.absolute.clone(),
                        reason: format!("{}; rollback failed: {}", e, undo_err),
                    });
                }
                return Err(e);
            }
        };

        for image in &relocated {
            self.indexer.reindex(image);
        }
        log::info!(
            "Moved folder {} -> {} ({} images relocated)",
            source.relative,
            destination.relative,
            relocated.len()
        );
        Ok(FolderRecord {
            id: folder.id,
            title: title.to_string(),
            parent_id: new_parent,
            created_at: folder.created_at,
        })
    }

    pub fn delete_folder(&self, user: &User, id: i64) -> Result<Outcome<DeletedFolder>> {
        self.require(user, Action::Delete)?;
        let (_guard, (folder, path)) = self.lock_resolved(|| {
            let folder = self.load_folder(id)?;
            self.require_for(user, Action::Delete, Instance::Folder(&folder))?;
            let path = self.resolver.resolve(self.catalog.as_ref(), Some(id))?;
            let parent_dir = path
                .absolute
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.resolver.root().absolute);
            Ok(((folder, path), vec![parent_dir]))
        })?;

        let stash = if self.files.exists(&path.absolute) {
            let stash = stash_path(&path.absolute, id);
            self.files.rename(&path.absolute, &stash)?;
            Some(stash)
        } else {
            None
        };

        let removed = match self.catalog.delete_folder(id) {
            Ok(removed) => removed,
            Err(e) => {
                if let Some(stash) = &stash {
                    if let Err(undo_err) = self.files.rename(stash, &path.absolute) {
                        return Err(LibraryError::PartialMoveFailure {
                            from: stash.clone(),
                            to: path.absolute.clone(),
                            reason: format!("{}; restore failed: {}", e, undo_err),
                        });
                    }
                }
                return Err(e);
            }
        };

        if let Some(stash) = &stash {
            if let Err(e) = self.files.remove_dir_all(stash) {
                log::warn!("Folder {} deleted but {:?} was left behind: {}", id, stash, e);
            }
        }
        for image_id in &removed.image_ids {
            self.indexer.remove(*image_id);
        }
        log::info!(
            "Deleted folder {} ({} folders, {} images)",
            path.relative,
            removed.folders,
            removed.image_ids.len()
        );
        Ok(Outcome::Success {
            value: DeletedFolder { folder, removed },
        })
    }

    /// Imports `<parent>/<dir_name>` from disk.
    pub fn materialize_from_disk(
        &self,
        user: &User,
        parent: Option<i64>,
        dir_name: &str,
    ) -> Result<Outcome<MaterializeReport>> {
        self.require(user, Action::Add)?;
        let dir_name = clean_title(dir_name)?;
        let (_guard, parent) = self.lock_resolved(|| {
            let target = self.target(parent)?;
            let keys = vec![target.path.absolute.clone()];
            Ok((target, keys))
        })?;
        let report = self.materializer().materialize(&parent, &dir_name, user)?;
        Ok(Outcome::Success { value: report })
    }

    fn recover<T>(&self, user: &User, parent: &Target, name: &str) -> Result<Outcome<T>> {
        log::warn!(
            "{:?} exists on disk without a catalog entry, importing it",
            self.resolver.child(&parent.path, name).absolute
        );
        let report = self.materializer().materialize(parent, name, user)?;
        Ok(Outcome::Recovered { report })
    }

    fn undo_create_dir(&self, path: &Path) -> Result<()> {
        self.files.remove_dir(path).map_err(|e| {
            log::error!("Could not remove {:?} after failed insert: {}", path, e);
            LibraryError::PartialMoveFailure {
                from: path.to_path_buf(),
                to: path.to_path_buf(),
                reason: format!("directory created but catalog insert failed and cleanup failed: {}", e),
            }
        })
    }
}

/// Hidden sibling a directory or file is parked under while its records are removed.
pub(crate) fn stash_path(path: &Path, id: i64) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.deleting-{}", name, id))
}

/// Trims and checks a folder title the way it will be used as a path component.
pub(crate) fn clean_title(title: &str) -> Result<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(LibraryError::validation("Title missing"));
    }
    if title == "." || title == ".." || title.contains(['/', '\\', '\0']) {
        return Err(LibraryError::validation(format!("Invalid title: {}", title)));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(LibraryError::validation(format!(
            "Title longer than {} characters",
            MAX_TITLE_LEN
        )));
    }
    Ok(title.to_string())
}
