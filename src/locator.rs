//! Where hook class files come from.
//!
//! A hook is woven into classes of arbitrary loaders, but its own bytes
//! are read from the place it ships in: the agent jar, a directory, or
//! memory in tests. Names are internal (`co/elastic/apm/FooAdvice`).

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
#[cfg(feature = "agent-jar")]
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum LocatorError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[cfg(feature = "agent-jar")]
    #[error("cannot read archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
}

/// Source of class file bytes by internal name.
pub trait ClassFileLocator: Send + Sync {
    /// `Ok(None)` when the class is simply not there.
    fn locate(&self, internal_name: &str) -> Result<Option<Vec<u8>>, LocatorError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

impl fmt::Debug for dyn ClassFileLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Class files held in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLocator {
    classes: HashMap<String, Vec<u8>>,
}

impl InMemoryLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(mut self, internal_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.classes.insert(internal_name.into(), bytes);
        self
    }

    pub fn insert(&mut self, internal_name: impl Into<String>, bytes: Vec<u8>) {
        self.classes.insert(internal_name.into(), bytes);
    }
}

impl ClassFileLocator for InMemoryLocator {
    fn locate(&self, internal_name: &str) -> Result<Option<Vec<u8>>, LocatorError> {
        Ok(self.classes.get(internal_name).cloned())
    }

    fn describe(&self) -> String {
        format!("memory ({} classes)", self.classes.len())
    }
}

/// A class path directory laid out by package.
#[derive(Debug, Clone)]
pub struct DirectoryLocator {
    root: PathBuf,
}

impl DirectoryLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryLocator { root: root.into() }
    }
}

impl ClassFileLocator for DirectoryLocator {
    fn locate(&self, internal_name: &str) -> Result<Option<Vec<u8>>, LocatorError> {
        let path = self.root.join(format!("{internal_name}.class"));
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LocatorError::Io { path, source }),
        }
    }

    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }
}

/// Class files inside a jar. The archive is opened once and read under a
/// lock, since entries are read through a shared file cursor.
#[cfg(feature = "agent-jar")]
pub struct JarLocator {
    path: PathBuf,
    archive: parking_lot::Mutex<zip::ZipArchive<fs::File>>,
}

#[cfg(feature = "agent-jar")]
impl JarLocator {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LocatorError> {
        let path = path.as_ref().to_path_buf();
        let file = fs::File::open(&path).map_err(|source| LocatorError::Io { path: path.clone(), source })?;
        let archive = zip::ZipArchive::new(file).map_err(|source| LocatorError::Archive { path: path.clone(), source })?;
        Ok(JarLocator { path, archive: parking_lot::Mutex::new(archive) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(feature = "agent-jar")]
impl ClassFileLocator for JarLocator {
    fn locate(&self, internal_name: &str) -> Result<Option<Vec<u8>>, LocatorError> {
        use std::io::Read;

        let mut archive = self.archive.lock();
        let mut entry = match archive.by_name(&format!("{internal_name}.class")) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => return Ok(None),
            Err(source) => return Err(LocatorError::Archive { path: self.path.clone(), source }),
        };
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .map_err(|source| LocatorError::Io { path: self.path.clone(), source })?;
        Ok(Some(bytes))
    }

    fn describe(&self) -> String {
        format!("jar {}", self.path.display())
    }
}

/// Asks each locator in turn; the first hit wins.
#[derive(Default)]
pub struct CompoundLocator {
    locators: Vec<std::sync::Arc<dyn ClassFileLocator>>,
}

impl CompoundLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, locator: std::sync::Arc<dyn ClassFileLocator>) -> Self {
        self.locators.push(locator);
        self
    }
}

impl ClassFileLocator for CompoundLocator {
    fn locate(&self, internal_name: &str) -> Result<Option<Vec<u8>>, LocatorError> {
        for locator in &self.locators {
            if let Some(bytes) = locator.locate(internal_name)? {
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.locators.iter().map(|l| l.describe()).collect();
        format!("[{}]", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn compound_prefers_earlier_locators() {
        let first = InMemoryLocator::new().with_class("a/Hook", vec![1]);
        let second = InMemoryLocator::new().with_class("a/Hook", vec![2]).with_class("b/Other", vec![3]);
        let compound = CompoundLocator::new().with(Arc::new(first)).with(Arc::new(second));

        assert_eq!(compound.locate("a/Hook").unwrap(), Some(vec![1]));
        assert_eq!(compound.locate("b/Other").unwrap(), Some(vec![3]));
        assert_eq!(compound.locate("c/Missing").unwrap(), None);
    }

    #[test]
    fn directory_maps_packages_to_paths() {
        let root = std::env::temp_dir().join(format!("apm-bci-locator-{}", std::process::id()));
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/Hook.class"), [0xCA, 0xFE]).unwrap();

        let locator = DirectoryLocator::new(&root);
        assert_eq!(locator.locate("a/b/Hook").unwrap(), Some(vec![0xCA, 0xFE]));
        assert_eq!(locator.locate("a/b/Missing").unwrap(), None);

        fs::remove_dir_all(&root).unwrap();
    }

    #[cfg(feature = "agent-jar")]
    #[test]
    fn jar_entries_are_read_by_internal_name() {
        use std::io::Write;

        let jar = std::env::temp_dir().join(format!("apm-bci-hooks-{}.jar", std::process::id()));
        let mut writer = zip::ZipWriter::new(fs::File::create(&jar).unwrap());
        writer.start_file("co/elastic/apm/Hook.class", zip::write::FileOptions::default()).unwrap();
        writer.write_all(&[0xCA, 0xFE, 0xBA, 0xBE]).unwrap();
        writer.finish().unwrap();

        let locator = JarLocator::open(&jar).unwrap();
        assert_eq!(locator.path(), jar.as_path());
        assert_eq!(locator.locate("co/elastic/apm/Hook").unwrap(), Some(vec![0xCA, 0xFE, 0xBA, 0xBE]));
        assert_eq!(locator.locate("co/elastic/apm/Missing").unwrap(), None);

        fs::remove_file(&jar).unwrap();
    }
}
