//! Canonical locations of folders and images on disk.
//!
//! A folder's directory is the images root joined with every ancestor title,
//! root to leaf. Stored image references are relative to the media root and
//! always use `/` so they compare equal across platforms.

use std::path::{Path, PathBuf};

use crate::db::{Catalog, FolderRecord};
use crate::error::{LibraryError, Result};

/// Deeper chains than this are treated as a corrupt (cyclic) parent graph.
const MAX_FOLDER_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderPath {
    /// `/`-joined titles below the images root, empty for the root itself.
    pub relative: String,
    pub absolute: PathBuf,
}

/// A folder id (or root) together with its resolved path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub folder: Option<i64>,
    pub path: FolderPath,
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    media_root: PathBuf,
    images_dir: String,
}

impl PathResolver {
    pub fn new(media_root: impl Into<PathBuf>, images_dir: impl Into<String>) -> Self {
        Self {
            media_root: media_root.into(),
            images_dir: images_dir.into(),
        }
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    /// The sentinel directory images without a folder live in.
    pub fn root(&self) -> FolderPath {
        FolderPath {
            relative: String::new(),
            absolute: self.media_root.join(&self.images_dir),
        }
    }

    /// Path for an ancestry chain ordered root to leaf.
    pub fn for_chain(&self, chain: &[FolderRecord]) -> FolderPath {
        chain
            .iter()
            .fold(self.root(), |path, folder| self.child(&path, &folder.title))
    }

    pub fn child(&self, parent: &FolderPath, name: &str) -> FolderPath {
        let relative = if parent.relative.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent.relative, name)
        };
        FolderPath {
            relative,
            absolute: parent.absolute.join(name),
        }
    }

    pub fn resolve(&self, catalog: &dyn Catalog, folder: Option<i64>) -> Result<FolderPath> {
        match folder {
            None => Ok(self.root()),
            Some(id) => Ok(self.for_chain(&ancestry(catalog, id)?)),
        }
    }

    pub fn target(&self, catalog: &dyn Catalog, folder: Option<i64>) -> Result<Target> {
        Ok(Target {
            folder,
            path: self.resolve(catalog, folder)?,
        })
    }

    /// Stored reference for `filename` inside `dir`.
    pub fn stored_file(&self, dir: &FolderPath, filename: &str) -> String {
        format!("{}/{}", self.stored_dir(dir), filename)
    }

    /// Stored prefix shared by every image below `dir`.
    pub fn stored_dir(&self, dir: &FolderPath) -> String {
        if dir.relative.is_empty() {
            self.images_dir.clone()
        } else {
            format!("{}/{}", self.images_dir, dir.relative)
        }
    }

    pub fn absolute_file(&self, stored: &str) -> PathBuf {
        stored
            .split('/')
            .fold(self.media_root.clone(), |path, part| path.join(part))
    }
}

/// Loads `id` and its ancestors, ordered root to leaf.
pub fn ancestry(catalog: &dyn Catalog, id: i64) -> Result<Vec<FolderRecord>> {
    let mut chain = Vec::new();
    let mut next = Some(id);
    while let Some(current) = next {
        if chain.len() >= MAX_FOLDER_DEPTH {
            return Err(LibraryError::validation(format!(
                "Folder {} has a cyclic or too deep ancestry",
                id
            )));
        }
        let folder = catalog.folder(current)?.ok_or(LibraryError::NotFound {
            kind: "folder",
            id: current,
        })?;
        next = folder.parent_id;
        chain.push(folder);
    }
    chain.reverse();
    Ok(chain)
}

/// Filename component of a stored reference.
pub fn file_name(stored: &str) -> &str {
    stored.rsplit('/').next().unwrap_or(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn folder(id: i64, title: &str, parent_id: Option<i64>) -> FolderRecord {
        FolderRecord {
            id,
            title: title.to_string(),
            parent_id,
            created_at: 0,
        }
    }

    #[test]
    fn root_is_images_dir() {
        let resolver = PathResolver::new("/srv/media", "original_images");
        let root = resolver.root();
        assert_eq!(root.relative, "");
        assert_eq!(root.absolute, PathBuf::from("/srv/media/original_images"));
        assert_eq!(resolver.stored_file(&root, "a.png"), "original_images/a.png");
    }

    #[test]
    fn chain_concatenates_titles() {
        let resolver = PathResolver::new("/srv/media", "original_images");
        let path = resolver.for_chain(&[folder(1, "A", None), folder(2, "B", Some(1))]);
        assert_eq!(path.relative, "A/B");
        assert_eq!(path.absolute, PathBuf::from("/srv/media/original_images/A/B"));
        assert_eq!(resolver.stored_file(&path, "x.jpg"), "original_images/A/B/x.jpg");
        assert_eq!(
            resolver.absolute_file("original_images/A/B/x.jpg"),
            PathBuf::from("/srv/media/original_images/A/B/x.jpg")
        );
    }

    #[test]
    fn resolve_matches_chain_from_catalog() {
        let db = Database::in_memory().unwrap();
        let a = db.insert_folder(None, "A").unwrap();
        let b = db.insert_folder(Some(a.id), "B").unwrap();
        let resolver = PathResolver::new("/m", "original_images");

        let resolved = resolver.resolve(&db, Some(b.id)).unwrap();
        assert_eq!(resolved, resolver.for_chain(&[a, b]));
        assert!(matches!(
            resolver.resolve(&db, Some(99)),
            Err(LibraryError::NotFound { id: 99, .. })
        ));
    }

    #[test]
    fn file_name_takes_last_component() {
        assert_eq!(file_name("original_images/A/photo.jpg"), "photo.jpg");
        assert_eq!(file_name("photo.jpg"), "photo.jpg");
    }
}
