use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{LibraryError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRecord {
    pub id: i64,
    pub title: String,
    pub parent_id: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: i64,
    pub title: String,
    pub folder_id: Option<i64>,
    /// Path relative to the media root, always `/`-separated.
    pub file: String,
    pub file_size: i64,
    pub file_hash: String,
    pub uploaded_by: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewImage {
    pub title: String,
    pub folder_id: Option<i64>,
    pub file: String,
    pub file_size: i64,
    pub file_hash: String,
    pub uploaded_by: Option<String>,
}

/// What a cascading folder delete removed from the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FolderDeletion {
    pub folders: usize,
    pub image_ids: Vec<i64>,
}

/// Persistent store for folders and images.
///
/// Writes that would break sibling title uniqueness (or file uniqueness for
/// images) fail with [`LibraryError::DatabaseConflict`].
pub trait Catalog: Send + Sync {
    fn folder(&self, id: i64) -> Result<Option<FolderRecord>>;

    fn folder_by_title(&self, parent: Option<i64>, title: &str) -> Result<Option<FolderRecord>>;

    fn child_folders(&self, parent: Option<i64>) -> Result<Vec<FolderRecord>>;

    fn insert_folder(&self, parent: Option<i64>, title: &str) -> Result<FolderRecord>;

    /// Re-parents and/or retitles a folder and rewrites the stored path of every
    /// image below it from `old_prefix` to `new_prefix`, in one transaction.
    /// Returns the images whose path changed.
    fn relocate_folder(
        &self,
        id: i64,
        parent: Option<i64>,
        title: &str,
        old_prefix: &str,
        new_prefix: &str,
    ) -> Result<Vec<ImageRecord>>;

    fn delete_folder(&self, id: i64) -> Result<FolderDeletion>;

    fn image(&self, id: i64) -> Result<Option<ImageRecord>>;

    fn image_by_file(&self, file: &str) -> Result<Option<ImageRecord>>;

    fn images_in(&self, folder: Option<i64>) -> Result<Vec<ImageRecord>>;

    fn insert_image(&self, image: &NewImage) -> Result<ImageRecord>;

    fn update_image(&self, image: &ImageRecord) -> Result<()>;

    fn delete_image(&self, id: i64) -> Result<()>;

    fn search_images(&self, query: &str, folder: Option<i64>) -> Result<Vec<ImageRecord>>;
}

pub struct Database {
    conn: Mutex<Connection>,
}

const FOLDER_COLUMNS: &str = "id, title, parent_id, created_at";
const IMAGE_COLUMNS: &str =
    "id, title, folder_id, file, file_size, file_hash, uploaded_by, created_at";

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        log::info!("Opening catalog at: {:?}", db_path);
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS folders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                parent_id INTEGER REFERENCES folders(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        // NULL parents are distinct in a plain UNIQUE index, so fold root into 0
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_folders_sibling_title
             ON folders(COALESCE(parent_id, 0), title)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS images (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                folder_id INTEGER REFERENCES folders(id) ON DELETE CASCADE,
                file TEXT NOT NULL UNIQUE,
                file_size INTEGER NOT NULL,
                file_hash TEXT NOT NULL DEFAULT '',
                uploaded_by TEXT,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        {
            let mut stmt = conn.prepare("PRAGMA table_info(images)")?;
            let mut rows = stmt.query([])?;
            let mut has_file_hash = false;
            while let Some(row) = rows.next()? {
                let col_name: String = row.get(1)?;
                if col_name == "file_hash" {
                    has_file_hash = true;
                }
            }
            if !has_file_hash {
                log::info!("Migrating catalog: adding images.file_hash");
                conn.execute(
                    "ALTER TABLE images ADD COLUMN file_hash TEXT NOT NULL DEFAULT ''",
                    [],
                )?;
            }
        }
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_images_folder ON images(folder_id)",
            [],
        )?;

        let instance = Self {
            conn: Mutex::new(conn),
        };
        let (folders, images) = instance.counts()?;
        log::info!(
            "Catalog initialized. {} folders, {} images.",
            folders,
            images
        );
        Ok(instance)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| LibraryError::LockPoisoned)
    }

    pub fn counts(&self) -> Result<(i64, i64)> {
        let conn = self.conn()?;
        let folders = conn.query_row("SELECT COUNT(*) FROM folders", [], |row| row.get(0))?;
        let images = conn.query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok((folders, images))
    }
}

fn folder_from_row(row: &Row<'_>) -> rusqlite::Result<FolderRecord> {
    Ok(FolderRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        parent_id: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn image_from_row(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    Ok(ImageRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        folder_id: row.get(2)?,
        file: row.get(3)?,
        file_size: row.get(4)?,
        file_hash: row.get(5)?,
        uploaded_by: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn unique_violation(err: rusqlite::Error, name: &str) -> LibraryError {
    match err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            LibraryError::DatabaseConflict {
                name: name.to_string(),
            }
        }
        other => other.into(),
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Catalog for Database {
    fn folder(&self, id: i64) -> Result<Option<FolderRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM folders WHERE id = ?1", FOLDER_COLUMNS);
        Ok(conn
            .query_row(&sql, params![id], folder_from_row)
            .optional()?)
    }

    fn folder_by_title(&self, parent: Option<i64>, title: &str) -> Result<Option<FolderRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM folders WHERE parent_id IS ?1 AND title = ?2",
            FOLDER_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![parent, title], folder_from_row)
            .optional()?)
    }

    fn child_folders(&self, parent: Option<i64>) -> Result<Vec<FolderRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM folders WHERE parent_id IS ?1 ORDER BY title",
            FOLDER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let folders = stmt
            .query_map(params![parent], folder_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(folders)
    }

    fn insert_folder(&self, parent: Option<i64>, title: &str) -> Result<FolderRecord> {
        let conn = self.conn()?;
        let created_at = now();
        conn.execute(
            "INSERT INTO folders (title, parent_id, created_at) VALUES (?1, ?2, ?3)",
            params![title, parent, created_at],
        )
        .map_err(|e| unique_violation(e, title))?;
        Ok(FolderRecord {
            id: conn.last_insert_rowid(),
            title: title.to_string(),
            parent_id: parent,
            created_at,
        })
    }

    fn relocate_folder(
        &self,
        id: i64,
        parent: Option<i64>,
        title: &str,
        old_prefix: &str,
        new_prefix: &str,
    ) -> Result<Vec<ImageRecord>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx
            .execute(
                "UPDATE folders SET parent_id = ?1, title = ?2 WHERE id = ?3",
                params![parent, title, id],
            )
            .map_err(|e| unique_violation(e, title))?;
        if changed == 0 {
            return Err(LibraryError::NotFound { kind: "folder", id });
        }

        let mut moved = Vec::new();
        if old_prefix != new_prefix {
            // substr comparison, not LIKE: titles are case-sensitive
            let old_dir = format!("{}/", old_prefix);
            let tail_start = old_dir.chars().count() as i64;
            tx.execute(
                "UPDATE images SET file = ?1 || substr(file, ?2)
                 WHERE substr(file, 1, length(?3)) = ?3",
                params![new_prefix, tail_start, old_dir],
            )
            .map_err(|e| unique_violation(e, new_prefix))?;

            let new_dir = format!("{}/", new_prefix);
            let sql = format!(
                "SELECT {} FROM images WHERE substr(file, 1, length(?1)) = ?1 ORDER BY id",
                IMAGE_COLUMNS
            );
            let mut stmt = tx.prepare(&sql)?;
            moved = stmt
                .query_map(params![new_dir], image_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
        }
        tx.commit()?;
        Ok(moved)
    }

    fn delete_folder(&self, id: i64) -> Result<FolderDeletion> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let deletion = {
            let subtree = "WITH RECURSIVE subtree(id) AS (
                    SELECT id FROM folders WHERE id = ?1
                    UNION ALL
                    SELECT f.id FROM folders f JOIN subtree s ON f.parent_id = s.id
                )";
            let folders: i64 = tx.query_row(
                &format!("{} SELECT COUNT(*) FROM subtree", subtree),
                params![id],
                |row| row.get(0),
            )?;
            let mut stmt = tx.prepare(&format!(
                "{} SELECT id FROM images WHERE folder_id IN (SELECT id FROM subtree) ORDER BY id",
                subtree
            ))?;
            let image_ids = stmt
                .query_map(params![id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            FolderDeletion {
                folders: folders as usize,
                image_ids,
            }
        };
        if deletion.folders == 0 {
            return Err(LibraryError::NotFound { kind: "folder", id });
        }
        tx.execute("DELETE FROM folders WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(deletion)
    }

    fn image(&self, id: i64) -> Result<Option<ImageRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM images WHERE id = ?1", IMAGE_COLUMNS);
        Ok(conn.query_row(&sql, params![id], image_from_row).optional()?)
    }

    fn image_by_file(&self, file: &str) -> Result<Option<ImageRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM images WHERE file = ?1", IMAGE_COLUMNS);
        Ok(conn
            .query_row(&sql, params![file], image_from_row)
            .optional()?)
    }

    fn images_in(&self, folder: Option<i64>) -> Result<Vec<ImageRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM images WHERE folder_id IS ?1 ORDER BY title, id",
            IMAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let images = stmt
            .query_map(params![folder], image_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(images)
    }

    fn insert_image(&self, image: &NewImage) -> Result<ImageRecord> {
        let conn = self.conn()?;
        let created_at = now();
        conn.execute(
            "INSERT INTO images (title, folder_id, file, file_size, file_hash, uploaded_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                image.title,
                image.folder_id,
                image.file,
                image.file_size,
                image.file_hash,
                image.uploaded_by,
                created_at
            ],
        )
        .map_err(|e| unique_violation(e, &image.file))?;
        Ok(ImageRecord {
            id: conn.last_insert_rowid(),
            title: image.title.clone(),
            folder_id: image.folder_id,
            file: image.file.clone(),
            file_size: image.file_size,
            file_hash: image.file_hash.clone(),
            uploaded_by: image.uploaded_by.clone(),
            created_at,
        })
    }

    fn update_image(&self, image: &ImageRecord) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE images SET title = ?1, folder_id = ?2, file = ?3, file_size = ?4, file_hash = ?5
                 WHERE id = ?6",
                params![
                    image.title,
                    image.folder_id,
                    image.file,
                    image.file_size,
                    image.file_hash,
                    image.id
                ],
            )
            .map_err(|e| unique_violation(e, &image.file))?;
        if changed == 0 {
            return Err(LibraryError::NotFound {
                kind: "image",
                id: image.id,
            });
        }
        Ok(())
    }

    fn delete_image(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM images WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn search_images(&self, query: &str, folder: Option<i64>) -> Result<Vec<ImageRecord>> {
        let conn = self.conn()?;
        let pattern = format!("%{}%", escape_like(query));
        let sql = format!(
            "SELECT {} FROM images
             WHERE title LIKE ?1 ESCAPE '\\' AND (?2 IS NULL OR folder_id = ?2)
             ORDER BY created_at DESC, id DESC",
            IMAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let images = stmt
            .query_map(params![pattern, folder], image_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(images)
    }
}
