//! Unit tests for ignore file loading.

use std::fs;

use tether::sync::{FileIgnoreProvider, IgnoreList, IgnoreProvider, NoIgnore};
use tether::AppError;

#[test]
fn comments_blank_lines_and_slashes_are_handled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path();
    fs::create_dir_all(root.join("target/debug")).expect("mkdir");
    fs::create_dir_all(root.join("node_modules")).expect("mkdir");
    fs::write(root.join("notes.log"), "").expect("write");
    fs::write(
        root.join(".tetherignore"),
        "# build output\n\n/target/\nnode_modules\n*.log\n",
    )
    .expect("write");

    let list = FileIgnoreProvider::new(".tetherignore")
        .load(root)
        .expect("load");
    assert_eq!(list.len(), 3);
    assert!(list.contains(&root.join("target")));
    assert!(list.contains(&root.join("node_modules")));
    assert!(list.contains(&root.join("notes.log")));
    assert!(!list.contains(&root.join("target/debug")));
}

#[test]
fn patterns_matching_nothing_are_fine() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join(".tetherignore"), "dist\n").expect("write");
    let list = FileIgnoreProvider::new(".tetherignore")
        .load(dir.path())
        .expect("load");
    assert!(list.is_empty());
}

#[test]
fn invalid_pattern_is_watch_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join(".tetherignore"), "[broken\n").expect("write");
    let err = FileIgnoreProvider::new(".tetherignore")
        .load(dir.path())
        .expect_err("bad pattern");
    assert!(matches!(err, AppError::Watch(ref msg) if msg.contains("[broken")));
}

#[test]
fn no_ignore_provider_is_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(NoIgnore.load(dir.path()).expect("load").is_empty());
}

#[test]
fn list_from_paths_matches_exact_paths_only() {
    let list = IgnoreList::from_paths(["/w/target"]);
    assert!(list.contains(std::path::Path::new("/w/target")));
    assert!(!list.contains(std::path::Path::new("/w/target/debug")));
}
