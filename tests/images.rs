mod common;

use std::sync::Arc;

use common::*;
use media_folders::db::Catalog;
use media_folders::permissions::RolePolicy;
use media_folders::{Action, ApiResponse, LibraryError, Outcome, User};

#[test]
fn upload_stores_file_and_record() {
    let lib = library();
    let user = admin();
    let image = lib
        .engine
        .add_image(&user, None, "photo.jpg", JPEG)
        .unwrap()
        .into_value()
        .unwrap();

    assert_eq!(image.title, "photo");
    assert_eq!(image.file, "original_images/photo.jpg");
    assert_eq!(image.file_size, JPEG.len() as i64);
    assert_eq!(image.uploaded_by.as_deref(), Some("admin"));
    assert!(lib.exists("photo.jpg"));
    assert_eq!(lib.indexer.reindexed(), vec![image.id]);
}

#[test]
fn second_upload_with_same_name_is_suffixed() {
    let lib = library();
    let user = admin();
    lib.engine.add_image(&user, None, "photo.jpg", JPEG).unwrap();
    let outcome = lib.engine.add_image(&user, None, "photo.jpg", JPEG).unwrap();

    match outcome {
        Outcome::Renamed { value, suffix } => {
            assert_eq!(suffix, 1);
            assert_eq!(value.title, "photo1");
            assert_eq!(value.file, "original_images/photo1.jpg");
        }
        other => panic!("expected rename, got {:?}", other),
    }
    assert!(lib.exists("photo.jpg") && lib.exists("photo1.jpg"));
}

#[test]
fn upload_rejects_disallowed_extension() {
    let lib = library();
    let err = lib
        .engine
        .add_image(&admin(), None, "notes.txt", b"hello")
        .unwrap_err();
    assert_eq!(err.to_string(), "Invalid file type: .txt");
    assert_eq!(err.status_code(), 400);
    assert!(!lib.exists("notes.txt"));
}

#[test]
fn upload_rejects_bytes_that_are_not_an_image() {
    let lib = library();
    let err = lib
        .engine
        .add_image(&admin(), None, "fake.png", b"plain text")
        .unwrap_err();
    assert!(matches!(err, LibraryError::ValidationFailed(_)));
    assert_eq!(lib.db.counts().unwrap(), (0, 0));
}

#[test]
fn upload_without_content_is_rejected() {
    let lib = library();
    let err = lib.engine.add_image(&admin(), None, "empty.png", b"").unwrap_err();
    assert_eq!(err.to_string(), "Title or file missing");
}

#[test]
fn failed_insert_removes_uploaded_file() {
    let lib = library();
    lib.fail_writes(true);
    assert!(lib.engine.add_image(&admin(), None, "photo.jpg", JPEG).is_err());
    assert!(!lib.exists("photo.jpg"));
}

#[test]
fn move_into_folder_with_same_filename_gets_suffix() {
    let lib = library();
    let user = admin();
    let a = lib.engine.create_folder(&user, None, "A").unwrap().into_value().unwrap();
    lib.engine.add_image(&user, Some(a.id), "photo.jpg", JPEG).unwrap();
    let root_photo = lib
        .engine
        .add_image(&user, None, "photo.jpg", JPEG)
        .unwrap()
        .into_value()
        .unwrap();

    let outcome = lib.engine.move_image(&user, root_photo.id, Some(a.id)).unwrap();
    match outcome {
        Outcome::Renamed { value, suffix } => {
            assert_eq!(suffix, 1);
            assert_eq!(value.file, "original_images/A/photo1.jpg");
            assert_eq!(value.title, "photo1");
            assert_eq!(value.folder_id, Some(a.id));
        }
        other => panic!("expected rename, got {:?}", other),
    }
    assert!(lib.exists("A/photo.jpg"));
    assert!(lib.exists("A/photo1.jpg"));
    assert!(!lib.exists("photo.jpg"));
}

#[test]
fn plain_move_reindexes_once() {
    let lib = library();
    let user = admin();
    let a = lib.engine.create_folder(&user, None, "A").unwrap().into_value().unwrap();
    let image = lib
        .engine
        .add_image(&user, None, "cat.png", PNG)
        .unwrap()
        .into_value()
        .unwrap();

    let outcome = lib.engine.move_image(&user, image.id, Some(a.id)).unwrap();
    assert!(!outcome.is_renamed());
    let stored = lib.db.image(image.id).unwrap().unwrap();
    assert_eq!(stored.file, "original_images/A/cat.png");
    assert_eq!(stored.title, "cat");
    assert_eq!(lib.indexer.reindexed(), vec![image.id, image.id]);
}

#[test]
fn move_to_current_folder_is_a_no_op() {
    let lib = library();
    let user = admin();
    let image = lib
        .engine
        .add_image(&user, None, "cat.png", PNG)
        .unwrap()
        .into_value()
        .unwrap();
    let outcome = lib.engine.move_image(&user, image.id, None).unwrap();
    assert_eq!(outcome, Outcome::Success { value: image });
    assert_eq!(lib.indexer.reindexed().len(), 1);
}

#[test]
fn failed_catalog_update_moves_file_back() {
    let lib = library();
    let user = admin();
    let a = lib.engine.create_folder(&user, None, "A").unwrap().into_value().unwrap();
    let image = lib
        .engine
        .add_image(&user, None, "cat.png", PNG)
        .unwrap()
        .into_value()
        .unwrap();
    lib.fail_writes(true);

    let err = lib.engine.move_image(&user, image.id, Some(a.id)).unwrap_err();
    assert!(matches!(err, LibraryError::Io(_)));
    assert!(lib.exists("cat.png"));
    assert!(!lib.exists("A/cat.png"));
    assert_eq!(lib.db.image(image.id).unwrap().unwrap(), image);
    assert_eq!(lib.indexer.reindexed(), vec![image.id]);
}

#[test]
fn move_with_missing_source_file_fails_validation() {
    let lib = library();
    let user = admin();
    let a = lib.engine.create_folder(&user, None, "A").unwrap().into_value().unwrap();
    let image = lib
        .engine
        .add_image(&user, None, "cat.png", PNG)
        .unwrap()
        .into_value()
        .unwrap();
    std::fs::remove_file(lib.images_root().join("cat.png")).unwrap();

    let err = lib.engine.move_image(&user, image.id, Some(a.id)).unwrap_err();
    assert!(matches!(err, LibraryError::ValidationFailed(_)));
    assert_eq!(lib.db.image(image.id).unwrap().unwrap().folder_id, None);
}

#[test]
fn move_unknown_image_or_folder_is_not_found() {
    let lib = library();
    let user = admin();
    let err = lib.engine.move_image(&user, 7, None).unwrap_err();
    assert!(matches!(err, LibraryError::NotFound { kind: "image", id: 7 }));

    let image = lib
        .engine
        .add_image(&user, None, "cat.png", PNG)
        .unwrap()
        .into_value()
        .unwrap();
    let err = lib.engine.move_image(&user, image.id, Some(99)).unwrap_err();
    assert!(matches!(err, LibraryError::NotFound { kind: "folder", id: 99 }));
}

#[test]
fn rename_needs_change_permission() {
    let policy = RolePolicy::new()
        .grant("alice", &[Action::Add, Action::Change])
        .grant("bob", &[Action::Add]);
    let lib = library_with_policy(Arc::new(policy));
    let alice = User::new("alice");
    let bob = User::new("bob");

    let image = lib
        .engine
        .add_image(&bob, None, "cat.png", PNG)
        .unwrap()
        .into_value()
        .unwrap();
    let err = lib.engine.rename_image(&bob, image.id, "Mine").unwrap_err();
    assert_eq!(err.status_code(), 403);

    assert!(lib.engine.rename_image(&alice, image.id, "Kitty").is_ok());
    assert_eq!(lib.db.image(image.id).unwrap().unwrap().title, "Kitty");
}

#[test]
fn rename_changes_title_but_not_file() {
    let lib = library();
    let user = admin();
    let image = lib
        .engine
        .add_image(&user, None, "cat.png", PNG)
        .unwrap()
        .into_value()
        .unwrap();

    let renamed = lib
        .engine
        .rename_image(&user, image.id, " Sleepy cat ")
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(renamed.title, "Sleepy cat");
    assert_eq!(renamed.file, image.file);

    let err = lib.engine.rename_image(&user, image.id, "  ").unwrap_err();
    assert_eq!(err.to_string(), "Title not passed");
}

#[test]
fn delete_image_removes_file_record_and_index_entry() {
    let lib = library();
    let user = admin();
    let image = lib
        .engine
        .add_image(&user, None, "cat.png", PNG)
        .unwrap()
        .into_value()
        .unwrap();

    lib.engine.delete_image(&user, image.id).unwrap();
    assert!(!lib.exists("cat.png"));
    assert!(lib.db.image(image.id).unwrap().is_none());
    assert_eq!(lib.indexer.removed(), vec![image.id]);
    assert_eq!(std::fs::read_dir(lib.images_root()).unwrap().count(), 0);
}

#[test]
fn failed_image_delete_restores_file() {
    let lib = library();
    let user = admin();
    let image = lib
        .engine
        .add_image(&user, None, "cat.png", PNG)
        .unwrap()
        .into_value()
        .unwrap();
    lib.fail_writes(true);

    assert!(lib.engine.delete_image(&user, image.id).is_err());
    assert!(lib.exists("cat.png"));
    assert!(lib.indexer.removed().is_empty());
}

#[test]
fn search_matches_titles_within_folder() {
    let lib = library();
    let user = admin();
    let a = lib.engine.create_folder(&user, None, "A").unwrap().into_value().unwrap();
    lib.engine.add_image(&user, None, "beach.png", PNG).unwrap();
    lib.engine.add_image(&user, Some(a.id), "beach_day.png", PNG).unwrap();
    lib.engine.add_image(&user, Some(a.id), "mountain.png", PNG).unwrap();

    let everywhere = lib.engine.search_images(&user, "beach", None).unwrap();
    assert_eq!(everywhere.len(), 2);

    let in_a = lib.engine.search_images(&user, "beach", Some(a.id)).unwrap();
    assert_eq!(in_a.len(), 1);
    assert_eq!(in_a[0].title, "beach_day");

    let err = lib.engine.search_images(&user, " ", None).unwrap_err();
    assert_eq!(err.to_string(), "No query string passed");
}

#[test]
fn search_only_returns_own_uploads_without_change_grant() {
    let policy = RolePolicy::new()
        .grant("alice", &[Action::Add])
        .grant("bob", &[Action::Add]);
    let lib = library_with_policy(Arc::new(policy));
    let alice = User::new("alice");
    lib.engine.add_image(&alice, None, "shared_a.png", PNG).unwrap();
    lib.engine.add_image(&User::new("bob"), None, "shared_b.png", PNG).unwrap();

    let hits = lib.engine.search_images(&alice, "shared", None).unwrap();
    let titles: Vec<_> = hits.iter().map(|i| i.title.as_str()).collect();
    assert_eq!(titles, vec!["shared_a"]);

    let err = lib
        .engine
        .search_images(&User::new("mallory"), "shared", None)
        .unwrap_err();
    assert_eq!(err.status_code(), 403);
}

#[test]
fn responses_carry_status_and_suffix() {
    let lib = library();
    let user = admin();
    lib.engine.add_image(&user, None, "photo.jpg", JPEG).unwrap();

    let response = ApiResponse::from_outcome(lib.engine.add_image(&user, None, "photo.jpg", JPEG));
    assert_eq!(response.status, 200);
    assert_eq!(response.outcome, "renamed");
    let data = response.data.clone().unwrap();
    assert_eq!(data["suffix"], 1);
    assert_eq!(data["file"], "original_images/photo1.jpg");

    lib.write("Found/x.png", PNG);
    let response = ApiResponse::from_outcome(lib.engine.create_folder(&user, None, "Found"));
    assert_eq!(response.status, 202);
    assert_eq!(response.outcome, "recovered");
    assert!(response.to_json().contains("\"created_images\""));

    let response = ApiResponse::from_outcome(lib.engine.delete_image(&user, 1234));
    assert_eq!(response.status, 404);
}
