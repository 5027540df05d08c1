//! Filesystem-backed store.
//!
//! Layout per node instance:
//!
//! ```text
//! <root>/<setid>/<node-key>/
//!   .lock                   advisory lock, held for the run's duration
//!   .staging/               in-progress generation
//!     manifest.json
//!     <stream>.jsonl        one message per line, announcement first
//!     files/<stream>/       artifacts allocated via make_file
//!   gen-000001/             committed generations
//!   current -> gen-000001   flipped atomically on commit
//! ```

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cairn_stream::{Msg, Persistence, Setid};

use crate::{Staging, Store, StoreError, StoredNode};

const LOCK_FILE: &str = ".lock";
const STAGING_DIR: &str = ".staging";
const CURRENT_LINK: &str = "current";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
  node: String,
  version: Option<String>,
  streams: Vec<String>,
}

/// Store rooted at a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsStore {
  root: PathBuf,
}

impl FsStore {
  /// Open (creating if necessary) a store rooted at `root`.
  pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
    let root = root.into();
    fs::create_dir_all(&root)?;
    Ok(Self { root })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn node_dir(&self, setid: Setid, node_key: &str) -> PathBuf {
    self.root.join(setid.to_string()).join(node_key)
  }
}

impl Store for FsStore {
  fn load(
    &self,
    setid: Setid,
    node_key: &str,
    version: Option<&str>,
  ) -> Result<StoredNode, StoreError> {
    let node_dir = self.node_dir(setid, node_key);
    let not_found = || StoreError::NotFound {
      setid,
      node: node_key.to_string(),
    };

    let generation = read_current(&node_dir).map_err(|_| not_found())?;
    let gen_dir = node_dir.join(&generation);
    let manifest_path = gen_dir.join(MANIFEST_FILE);
    let manifest: Manifest = serde_json::from_reader(
      File::open(&manifest_path).map_err(|_| not_found())?,
    )
    .map_err(|e| StoreError::Corrupt {
      path: manifest_path.clone(),
      message: e.to_string(),
    })?;

    if manifest.version.as_deref() != version {
      return Err(not_found());
    }

    let mut streams = HashMap::new();
    for name in &manifest.streams {
      let path = gen_dir.join(format!("{name}.jsonl"));
      let reader = BufReader::new(File::open(&path)?);
      let mut msgs = Vec::new();
      for line in reader.lines() {
        let line = line?;
        let msg: Msg = serde_json::from_str(&line).map_err(|e| StoreError::Corrupt {
          path: path.clone(),
          message: e.to_string(),
        })?;
        msgs.push(msg);
      }
      streams.insert(name.clone(), msgs);
    }

    Ok(StoredNode {
      version: manifest.version,
      streams,
    })
  }

  fn create_staging(
    &self,
    setid: Setid,
    node_key: &str,
    version: Option<&str>,
  ) -> Result<Box<dyn Staging>, StoreError> {
    let node_dir = self.node_dir(setid, node_key);
    fs::create_dir_all(&node_dir)?;

    let staging_dir = node_dir.join(STAGING_DIR);
    let lock = match LockGuard::acquire(node_dir.join(LOCK_FILE)) {
      Ok(lock) => lock,
      Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
        return Err(StoreError::DirectoryAlreadyExists {
          node: node_key.to_string(),
          path: staging_dir,
        });
      }
      Err(e) => return Err(e.into()),
    };

    if staging_dir.exists() {
      // Leftover from a crashed run that no longer holds the lock.
      warn!(node = %node_key, path = %staging_dir.display(), "clearing stale staging directory");
      fs::remove_dir_all(&staging_dir)?;
    }
    fs::create_dir_all(&staging_dir)?;

    Ok(Box::new(NodeStaging {
      node_key: node_key.to_string(),
      version: version.map(str::to_string),
      node_dir,
      staging_dir,
      streams: Vec::new(),
      _lock: lock,
    }))
  }
}

/// In-progress generation for one node, holding the advisory lock.
struct NodeStaging {
  node_key: String,
  version: Option<String>,
  node_dir: PathBuf,
  staging_dir: PathBuf,
  streams: Vec<String>,
  _lock: LockGuard,
}

impl Staging for NodeStaging {
  fn create_stream(&mut self, name: &str) -> Result<Box<dyn Persistence>, StoreError> {
    if self.streams.iter().any(|s| s == name) {
      return Err(StoreError::NameTaken {
        name: name.to_string(),
      });
    }
    let path = self.staging_dir.join(format!("{name}.jsonl"));
    let file = OpenOptions::new()
      .write(true)
      .create_new(true)
      .open(&path)?;
    self.streams.push(name.to_string());
    Ok(Box::new(StagedStream {
      file: BufWriter::new(file),
      files_dir: self.staging_dir.join("files").join(name),
    }))
  }

  fn reset(&mut self) -> Result<(), StoreError> {
    fs::remove_dir_all(&self.staging_dir)?;
    fs::create_dir_all(&self.staging_dir)?;
    self.streams.clear();
    Ok(())
  }

  fn commit(&mut self) -> Result<u64, StoreError> {
    let manifest = Manifest {
      node: self.node_key.clone(),
      version: self.version.clone(),
      streams: self.streams.clone(),
    };
    let manifest_path = self.staging_dir.join(MANIFEST_FILE);
    let file = File::create(&manifest_path)?;
    serde_json::to_writer_pretty(&file, &manifest).map_err(io::Error::other)?;
    file.sync_all()?;

    let generation = next_generation(&self.node_dir)?;
    let gen_name = format!("gen-{generation:06}");
    fs::rename(&self.staging_dir, self.node_dir.join(&gen_name))?;
    sync_dir(&self.node_dir)?;
    point_current(&self.node_dir, &gen_name)?;
    sync_dir(&self.node_dir)?;

    info!(
      node = %self.node_key,
      generation,
      "generation_committed"
    );
    Ok(generation)
  }
}

/// Message log writer for one staged stream.
struct StagedStream {
  file: BufWriter<File>,
  files_dir: PathBuf,
}

impl Persistence for StagedStream {
  fn append(&mut self, msg: &Msg) -> io::Result<()> {
    serde_json::to_writer(&mut self.file, msg).map_err(io::Error::other)?;
    self.file.write_all(b"\n")
  }

  fn make_file(&mut self, name: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(&self.files_dir)?;
    let path = self.files_dir.join(name);
    OpenOptions::new().write(true).create_new(true).open(&path)?;
    Ok(path)
  }

  fn seal(&mut self) -> io::Result<()> {
    self.file.flush()?;
    self.file.get_ref().sync_all()
  }
}

/// Advisory lock file, removed on drop.
struct LockGuard {
  path: PathBuf,
}

impl LockGuard {
  fn acquire(path: PathBuf) -> io::Result<Self> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(Self { path })
  }
}

impl Drop for LockGuard {
  fn drop(&mut self) {
    let _ = fs::remove_file(&self.path);
  }
}

fn next_generation(node_dir: &Path) -> io::Result<u64> {
  let mut latest = 0;
  for entry in fs::read_dir(node_dir)? {
    let name = entry?.file_name();
    if let Some(number) = name
      .to_str()
      .and_then(|n| n.strip_prefix("gen-"))
      .and_then(|n| n.parse::<u64>().ok())
    {
      latest = latest.max(number);
    }
  }
  Ok(latest + 1)
}

fn sync_dir(path: &Path) -> io::Result<()> {
  File::open(path)?.sync_all()
}

#[cfg(unix)]
fn point_current(node_dir: &Path, gen_name: &str) -> io::Result<()> {
  let tmp = node_dir.join(".current.tmp");
  let _ = fs::remove_file(&tmp);
  std::os::unix::fs::symlink(gen_name, &tmp)?;
  fs::rename(tmp, node_dir.join(CURRENT_LINK))
}

#[cfg(not(unix))]
fn point_current(node_dir: &Path, gen_name: &str) -> io::Result<()> {
  let tmp = node_dir.join(".current.tmp");
  fs::write(&tmp, gen_name)?;
  fs::rename(tmp, node_dir.join(CURRENT_LINK))
}

#[cfg(unix)]
fn read_current(node_dir: &Path) -> io::Result<String> {
  let target = fs::read_link(node_dir.join(CURRENT_LINK))?;
  target
    .to_str()
    .map(str::to_string)
    .ok_or_else(|| io::Error::other("non-utf8 generation link"))
}

#[cfg(not(unix))]
fn read_current(node_dir: &Path) -> io::Result<String> {
  fs::read_to_string(node_dir.join(CURRENT_LINK))
}
