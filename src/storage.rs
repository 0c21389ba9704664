//! # State Storage
//!
//! Persistence contract for the state of stateful units, addressed by a
//! scope (usually the topology name) and a state name.
//!
//! Writes are transactional: [`StateStorage::save`] hands out a
//! [`StateWriter`] whose bytes become visible only on
//! [`StateWriter::commit`]. [`StateWriter::abort`], or dropping the writer
//! without committing, leaves the previously saved state untouched.
//!
//! Two backends are provided:
//!
//! - [`InMemoryStateStorage`]: process-local maps, for tests
//! - [`FileStateStorage`]: one file per state under
//!   `<base>/<scope>/<name>.state`, committed by an atomic rename

use crate::config::validate_name;
use crate::error::{Result, TopologyError};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tempfile::NamedTempFile;

/// Scope name to the set of state names saved under it.
pub type StateListing = BTreeMap<String, BTreeSet<String>>;

/// Pending write of one state.
pub trait StateWriter: Write + Send {
  /// Publishes everything written so far. Later writes fail.
  fn commit(&mut self) -> Result<()>;

  /// Discards everything written so far. Later writes fail.
  fn abort(&mut self) -> Result<()>;
}

/// Storage backend for unit state.
pub trait StateStorage: Send + Sync {
  /// Starts writing state `name` in `scope`, replacing any previous value on
  /// commit.
  fn save(&self, scope: &str, name: &str) -> Result<Box<dyn StateWriter>>;

  /// Opens the committed value of state `name` in `scope`.
  ///
  /// # Errors
  ///
  /// Returns [`TopologyError::NotExist`] if nothing was committed under that
  /// key.
  fn load(&self, scope: &str, name: &str) -> Result<Box<dyn Read + Send>>;

  /// Lists every committed state.
  fn list(&self) -> Result<StateListing>;
}

fn finished_writer() -> io::Error {
  io::Error::other("the state writer was already committed or aborted")
}

fn finished_state() -> TopologyError {
  TopologyError::IllegalState("the state writer was already committed or aborted".to_string())
}

type MemoryMap = BTreeMap<String, BTreeMap<String, Arc<Vec<u8>>>>;

/// [`StateStorage`] keeping every state in memory.
#[derive(Clone, Default)]
pub struct InMemoryStateStorage {
  states: Arc<RwLock<MemoryMap>>,
}

impl InMemoryStateStorage {
  /// Creates an empty storage.
  pub fn new() -> Self {
    Self::default()
  }
}

impl StateStorage for InMemoryStateStorage {
  fn save(&self, scope: &str, name: &str) -> Result<Box<dyn StateWriter>> {
    validate_name(scope)?;
    validate_name(name)?;
    Ok(Box::new(MemoryStateWriter {
      states: Arc::clone(&self.states),
      scope: scope.to_string(),
      name: name.to_string(),
      buf: Some(Vec::new()),
    }))
  }

  fn load(&self, scope: &str, name: &str) -> Result<Box<dyn Read + Send>> {
    let states = self.states.read().unwrap_or_else(|e| e.into_inner());
    let data = states
      .get(scope)
      .and_then(|s| s.get(name))
      .ok_or_else(|| TopologyError::not_exist("state", format!("{scope}/{name}")))?;
    Ok(Box::new(Cursor::new(data.as_ref().clone())))
  }

  fn list(&self) -> Result<StateListing> {
    let states = self.states.read().unwrap_or_else(|e| e.into_inner());
    Ok(
      states
        .iter()
        .filter(|(_, names)| !names.is_empty())
        .map(|(scope, names)| (scope.clone(), names.keys().cloned().collect()))
        .collect(),
    )
  }
}

struct MemoryStateWriter {
  states: Arc<RwLock<MemoryMap>>,
  scope: String,
  name: String,
  /// `None` once committed or aborted.
  buf: Option<Vec<u8>>,
}

impl Write for MemoryStateWriter {
  fn write(&mut self, data: &[u8]) -> io::Result<usize> {
    self.buf.as_mut().ok_or_else(finished_writer)?.write(data)
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

impl StateWriter for MemoryStateWriter {
  fn commit(&mut self) -> Result<()> {
    let data = self.buf.take().ok_or_else(finished_state)?;
    let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
    states
      .entry(self.scope.clone())
      .or_default()
      .insert(self.name.clone(), Arc::new(data));
    Ok(())
  }

  fn abort(&mut self) -> Result<()> {
    self.buf.take().ok_or_else(finished_state)?;
    Ok(())
  }
}

/// [`StateStorage`] writing each state to its own file.
///
/// A save streams into a temporary file in the target directory and renames
/// it over `<base>/<scope>/<name>.state` on commit, so readers never observe
/// a partially written state.
#[derive(Clone, Debug)]
pub struct FileStateStorage {
  base_path: PathBuf,
}

const STATE_EXTENSION: &str = "state";

impl FileStateStorage {
  /// Creates a storage rooted at `base_path`. The directory is created on
  /// the first save.
  pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
    Self {
      base_path: base_path.as_ref().to_path_buf(),
    }
  }

  fn scope_dir(&self, scope: &str) -> PathBuf {
    self.base_path.join(scope)
  }

  fn state_path(&self, scope: &str, name: &str) -> PathBuf {
    self
      .scope_dir(scope)
      .join(format!("{name}.{STATE_EXTENSION}"))
  }
}

impl StateStorage for FileStateStorage {
  fn save(&self, scope: &str, name: &str) -> Result<Box<dyn StateWriter>> {
    // Names double as path components.
    validate_name(scope)?;
    validate_name(name)?;
    let dir = self.scope_dir(scope);
    std::fs::create_dir_all(&dir)?;
    let tmp = NamedTempFile::new_in(&dir)?;
    Ok(Box::new(FileStateWriter {
      target: self.state_path(scope, name),
      tmp: Some(tmp),
    }))
  }

  fn load(&self, scope: &str, name: &str) -> Result<Box<dyn Read + Send>> {
    if validate_name(scope).is_err() || validate_name(name).is_err() {
      return Err(TopologyError::not_exist("state", format!("{scope}/{name}")));
    }
    match File::open(self.state_path(scope, name)) {
      Ok(file) => Ok(Box::new(file)),
      Err(err) if err.kind() == io::ErrorKind::NotFound => {
        Err(TopologyError::not_exist("state", format!("{scope}/{name}")))
      }
      Err(err) => Err(err.into()),
    }
  }

  fn list(&self) -> Result<StateListing> {
    let mut listing = StateListing::new();
    if !self.base_path.exists() {
      return Ok(listing);
    }
    for scope in std::fs::read_dir(&self.base_path)? {
      let scope = scope?;
      if !scope.file_type()?.is_dir() {
        continue;
      }
      let Some(scope_name) = scope.file_name().to_str().map(str::to_string) else {
        continue;
      };
      let mut names = BTreeSet::new();
      for entry in std::fs::read_dir(scope.path())? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == STATE_EXTENSION) {
          if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.insert(stem.to_string());
          }
        }
      }
      if !names.is_empty() {
        listing.insert(scope_name, names);
      }
    }
    Ok(listing)
  }
}

struct FileStateWriter {
  target: PathBuf,
  /// `None` once committed or aborted. Dropping it deletes the file.
  tmp: Option<NamedTempFile>,
}

impl Write for FileStateWriter {
  fn write(&mut self, data: &[u8]) -> io::Result<usize> {
    self.tmp.as_mut().ok_or_else(finished_writer)?.write(data)
  }

  fn flush(&mut self) -> io::Result<()> {
    match self.tmp.as_mut() {
      Some(tmp) => tmp.flush(),
      None => Ok(()),
    }
  }
}

impl StateWriter for FileStateWriter {
  fn commit(&mut self) -> Result<()> {
    let mut tmp = self.tmp.take().ok_or_else(finished_state)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(&self.target).map_err(|e| e.error)?;
    Ok(())
  }

  fn abort(&mut self) -> Result<()> {
    let tmp = self.tmp.take().ok_or_else(finished_state)?;
    tmp.close()?;
    Ok(())
  }
}
