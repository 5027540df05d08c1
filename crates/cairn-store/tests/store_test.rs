//! Integration tests for the filesystem store: staging, locking, and the
//! atomic commit protocol.

use cairn_store::{FsStore, Store, StoreError};
use cairn_stream::{Handle, HandleInfo, Header, Msg, MsgData, Setid};
use serde_json::json;

const NODE: &str = "scans-00112233aabbccdd";

fn setid() -> Setid {
  Setid::from_u128(0x0123_4567_89ab_cdef)
}

fn handle(name: &str) -> Handle {
  Handle::new(setid(), NODE, name)
}

fn announcement(name: &str) -> Msg {
  let handle = handle(name);
  Msg {
    idx: -1,
    handle: handle.clone(),
    data: MsgData::Handle(HandleInfo {
      handle,
      group: false,
      header: Header::new().with("topic", json!("/scan")),
    }),
  }
}

fn payload(name: &str, idx: i64, value: i64) -> Msg {
  Msg {
    idx,
    handle: handle(name),
    data: MsgData::Payload(json!(value)),
  }
}

fn end(name: &str, idx: i64) -> Msg {
  Msg {
    idx,
    handle: handle(name),
    data: MsgData::End,
  }
}

/// Write a complete stream into a fresh staging and commit it.
fn commit_stream(store: &FsStore, name: &str, values: &[i64]) -> u64 {
  let mut staging = store.create_staging(setid(), NODE, Some("1")).unwrap();
  {
    let mut stream = staging.create_stream(name).unwrap();
    stream.append(&announcement(name)).unwrap();
    for (idx, value) in values.iter().enumerate() {
      stream.append(&payload(name, idx as i64, *value)).unwrap();
    }
    stream.append(&end(name, values.len() as i64)).unwrap();
    stream.seal().unwrap();
  }
  staging.commit().unwrap()
}

#[test]
fn test_commit_then_load_roundtrip() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsStore::new(dir.path()).unwrap();

  let generation = commit_stream(&store, "scans", &[10, 20]);
  assert_eq!(generation, 1);

  let stored = store.load(setid(), NODE, Some("1")).unwrap();
  let msgs = &stored.streams["scans"];
  assert_eq!(msgs.len(), 4);
  assert!(msgs[0].is_announcement());
  assert_eq!(msgs[1].payload(), Some(&json!(10)));
  assert_eq!(msgs[2].payload(), Some(&json!(20)));
  assert!(msgs[3].is_end());
}

#[test]
fn test_version_mismatch_reads_as_not_found() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsStore::new(dir.path()).unwrap();
  commit_stream(&store, "scans", &[1]);

  assert!(matches!(
    store.load(setid(), NODE, Some("2")),
    Err(StoreError::NotFound { .. })
  ));
  assert!(matches!(
    store.load(setid(), NODE, None),
    Err(StoreError::NotFound { .. })
  ));
}

#[test]
fn test_load_missing_node_is_not_found() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsStore::new(dir.path()).unwrap();
  assert!(matches!(
    store.load(setid(), "never-committed", None),
    Err(StoreError::NotFound { .. })
  ));
}

#[test]
fn test_concurrent_staging_is_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsStore::new(dir.path()).unwrap();

  let first = store.create_staging(setid(), NODE, None).unwrap();
  let second = store.create_staging(setid(), NODE, None);
  assert!(matches!(
    second,
    Err(StoreError::DirectoryAlreadyExists { .. })
  ));

  // Releasing the first lock makes the node stageable again.
  drop(first);
  assert!(store.create_staging(setid(), NODE, None).is_ok());
}

#[test]
fn test_uncommitted_staging_leaves_previous_generation_intact() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsStore::new(dir.path()).unwrap();
  commit_stream(&store, "scans", &[10, 20]);

  // Simulate a run that dies after writing but before commit.
  {
    let mut staging = store.create_staging(setid(), NODE, Some("1")).unwrap();
    let mut stream = staging.create_stream("scans").unwrap();
    stream.append(&announcement("scans")).unwrap();
    stream.append(&payload("scans", 0, 999)).unwrap();
    // No seal, no commit.
  }

  let stored = store.load(setid(), NODE, Some("1")).unwrap();
  assert_eq!(stored.streams["scans"][1].payload(), Some(&json!(10)));

  // The stale staging is cleared and a fresh generation commits cleanly.
  let generation = commit_stream(&store, "scans", &[30]);
  assert_eq!(generation, 2);
  let stored = store.load(setid(), NODE, Some("1")).unwrap();
  assert_eq!(stored.streams["scans"][1].payload(), Some(&json!(30)));
}

#[test]
fn test_generations_increment_and_current_tracks_latest() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsStore::new(dir.path()).unwrap();
  assert_eq!(commit_stream(&store, "scans", &[1]), 1);
  assert_eq!(commit_stream(&store, "scans", &[2]), 2);
  assert_eq!(commit_stream(&store, "scans", &[3]), 3);

  let stored = store.load(setid(), NODE, Some("1")).unwrap();
  assert_eq!(stored.streams["scans"][1].payload(), Some(&json!(3)));
}

#[test]
fn test_make_file_allocates_once() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsStore::new(dir.path()).unwrap();

  let mut staging = store.create_staging(setid(), NODE, None).unwrap();
  let mut stream = staging.create_stream("video").unwrap();
  let path = stream.make_file("clip.webm").unwrap();
  assert!(path.exists());

  let again = stream.make_file("clip.webm");
  assert_eq!(
    again.unwrap_err().kind(),
    std::io::ErrorKind::AlreadyExists
  );
}

#[test]
fn test_duplicate_stream_name_is_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsStore::new(dir.path()).unwrap();

  let mut staging = store.create_staging(setid(), NODE, None).unwrap();
  staging.create_stream("scans").unwrap();
  assert!(matches!(
    staging.create_stream("scans"),
    Err(StoreError::NameTaken { .. })
  ));
}

#[test]
fn test_staging_reset_discards_streams() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsStore::new(dir.path()).unwrap();

  let mut staging = store.create_staging(setid(), NODE, None).unwrap();
  {
    let mut stream = staging.create_stream("a").unwrap();
    stream.append(&announcement("a")).unwrap();
  }
  staging.reset().unwrap();

  // Same names can be staged again after a reset.
  let mut stream = staging.create_stream("a").unwrap();
  stream.append(&announcement("a")).unwrap();
  stream.append(&end("a", 0)).unwrap();
  stream.seal().unwrap();
  let generation = staging.commit().unwrap();
  assert_eq!(generation, 1);

  let stored = store.load(setid(), NODE, None).unwrap();
  assert_eq!(stored.streams["a"].len(), 2);
}
