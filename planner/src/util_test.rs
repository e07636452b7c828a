use crate::util::next_available_dir;
use std::fs;

#[test]
pub fn free_directory_is_returned_unchanged() {
    let root = tempfile::tempdir().unwrap();
    let target = root.path().join("out");

    assert_eq!(next_available_dir(&target), target);
}

#[test]
pub fn occupied_directory_steps_to_numbered_sibling() {
    let root = tempfile::tempdir().unwrap();
    let target = root.path().join("out");
    fs::create_dir(&target).unwrap();

    assert_eq!(next_available_dir(&target), root.path().join("out_1"));

    fs::create_dir(root.path().join("out_1")).unwrap();
    assert_eq!(next_available_dir(&target), root.path().join("out_2"));
}
