use std::{
    fs::{self, File, OpenOptions},
    io::{BufReader, BufWriter, ErrorKind, Read, Write},
    path::{Component, Path, PathBuf},
};
use chrono::{DateTime, Utc};
use model_plugin::{plugin::PARAM_PROPERTIES, FileStat, FileStorage, FileType, PluginClass, PluginError};
use tracing::trace;

/// Property naming the directory the storage is rooted at.
pub const PROP_ROOT_PATH: &str = "rootPath";

/// File storage rooted at a local directory. Paths are storage-relative and
/// may not climb out of the root.
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, PluginError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(PluginError::Config(format!("storage root `{}` is not a directory", root.display())));
        }
        Ok(Self { root })
    }

    pub fn plugin_class() -> PluginClass<dyn FileStorage> {
        PluginClass::new("LocalFileStorage", &[PARAM_PROPERTIES], |args| {
            let storage = LocalFileStorage::new(args.require_property(PROP_ROOT_PATH)?)?;
            Ok(Box::new(storage) as Box<dyn FileStorage>)
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, PluginError> {
        let relative = Path::new(path);
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(PluginError::Config(format!("storage path `{path}` is outside the storage root"))),
            }
        }
        Ok(resolved)
    }

    fn storage_path(&self, full: &Path) -> String {
        full.strip_prefix(&self.root)
            .unwrap_or(full)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn stat_path(&self, full: &Path) -> Result<FileStat, PluginError> {
        let meta = fs::metadata(full).map_err(|e| not_found(e, &self.storage_path(full)))?;
        let name = full.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        Ok(FileStat {
            path: self.storage_path(full),
            name,
            file_type: if meta.is_dir() { FileType::Directory } else { FileType::File },
            size: if meta.is_dir() { 0 } else { meta.len() },
            mtime: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    fn list_into(&self, dir: &Path, recursive: bool, out: &mut Vec<FileStat>) -> Result<(), PluginError> {
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?.map(|e| e.map(|e| e.path())).collect::<Result<_, _>>()?;
        entries.sort();
        for entry in entries {
            let stat = self.stat_path(&entry)?;
            let is_dir = stat.file_type == FileType::Directory;
            out.push(stat);
            if recursive && is_dir {
                self.list_into(&entry, true, out)?;
            }
        }
        Ok(())
    }
}

fn not_found(err: std::io::Error, path: &str) -> PluginError {
    match err.kind() {
        ErrorKind::NotFound => PluginError::NotFound(format!("`{path}`")),
        _ => PluginError::Io(err),
    }
}

impl FileStorage for LocalFileStorage {
    fn exists(&self, path: &str) -> Result<bool, PluginError> {
        Ok(self.resolve(path)?.exists())
    }

    fn size(&self, path: &str) -> Result<u64, PluginError> {
        let stat = self.stat(path)?;
        if stat.file_type == FileType::Directory {
            return Err(PluginError::Other(format!("`{path}` is a directory")));
        }
        Ok(stat.size)
    }

    fn stat(&self, path: &str) -> Result<FileStat, PluginError> {
        self.stat_path(&self.resolve(path)?)
    }

    fn ls(&self, path: &str, recursive: bool) -> Result<Vec<FileStat>, PluginError> {
        let full = self.resolve(path)?;
        let stat = self.stat_path(&full)?;
        if stat.file_type == FileType::File {
            return Ok(vec![stat]);
        }
        let mut out = Vec::new();
        self.list_into(&full, recursive, &mut out)?;
        Ok(out)
    }

    fn mkdir(&self, path: &str, recursive: bool) -> Result<(), PluginError> {
        let full = self.resolve(path)?;
        if recursive {
            fs::create_dir_all(&full)?;
            return Ok(());
        }
        fs::create_dir(&full).map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => PluginError::AlreadyExists(format!("`{path}`")),
            _ => not_found(e, path),
        })
    }

    fn rm(&self, path: &str) -> Result<(), PluginError> {
        let full = self.resolve(path)?;
        if full.is_dir() {
            return Err(PluginError::Other(format!("`{path}` is a directory, use rmdir")));
        }
        fs::remove_file(&full).map_err(|e| not_found(e, path))
    }

    fn rmdir(&self, path: &str) -> Result<(), PluginError> {
        let full = self.resolve(path)?;
        if full == self.root {
            return Err(PluginError::Config("cannot remove the storage root".into()));
        }
        if full.is_file() {
            return Err(PluginError::Other(format!("`{path}` is a file, use rm")));
        }
        fs::remove_dir_all(&full).map_err(|e| not_found(e, path))
    }

    fn read_byte_stream(&self, path: &str) -> Result<Box<dyn Read + Send>, PluginError> {
        let full = self.resolve(path)?;
        let file = File::open(&full).map_err(|e| not_found(e, path))?;
        trace!(path, "read stream opened");
        Ok(Box::new(BufReader::new(file)))
    }

    fn write_byte_stream(&self, path: &str, overwrite: bool) -> Result<Box<dyn Write + Send>, PluginError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let file = options.open(&full).map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => PluginError::AlreadyExists(format!("`{path}`")),
            _ => PluginError::Io(e),
        })?;
        trace!(path, overwrite, "write stream opened");
        Ok(Box::new(BufWriter::new(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, LocalFileStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFileStorage::new(dir.path()).unwrap();
        (dir, storage)
    }

    fn write(storage: &LocalFileStorage, path: &str, body: &str, overwrite: bool) -> Result<(), PluginError> {
        let mut w = storage.write_byte_stream(path, overwrite)?;
        w.write_all(body.as_bytes())?;
        w.flush()?;
        Ok(())
    }

    #[test]
    fn files_round_trip_and_do_not_overwrite_by_default() {
        let (_dir, storage) = storage();
        write(&storage, "data/a.txt", "hello", false).unwrap();

        assert!(storage.exists("data/a.txt").unwrap());
        assert_eq!(storage.size("data/a.txt").unwrap(), 5);
        assert!(matches!(write(&storage, "data/a.txt", "again", false), Err(PluginError::AlreadyExists(_))));
        write(&storage, "data/a.txt", "bye", true).unwrap();

        let mut body = String::new();
        storage.read_byte_stream("data/a.txt").unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "bye");

        let stat = storage.stat("data/a.txt").unwrap();
        assert_eq!(stat.path, "data/a.txt");
        assert_eq!(stat.name, "a.txt");
        assert_eq!(stat.file_type, FileType::File);
        assert!(stat.mtime.is_some());
    }

    #[test]
    fn directories_list_and_remove() {
        let (_dir, storage) = storage();
        storage.mkdir("x/y", true).unwrap();
        assert!(matches!(storage.mkdir("x", false), Err(PluginError::AlreadyExists(_))));
        write(&storage, "x/y/z.txt", "1", false).unwrap();
        write(&storage, "x/top.txt", "2", false).unwrap();

        let shallow: Vec<String> = storage.ls("x", false).unwrap().into_iter().map(|s| s.path).collect();
        assert_eq!(shallow, vec!["x/top.txt", "x/y"]);
        let deep = storage.ls("x", true).unwrap();
        assert_eq!(deep.len(), 3);

        assert!(storage.rm("x/y").is_err());
        storage.rm("x/top.txt").unwrap();
        storage.rmdir("x").unwrap();
        assert!(!storage.exists("x").unwrap());
        assert!(matches!(storage.rm("x/top.txt"), Err(PluginError::NotFound(_))));
    }

    #[test]
    fn paths_cannot_escape_the_root() {
        let (_dir, storage) = storage();
        assert!(storage.exists("../etc/passwd").is_err());
        assert!(storage.write_byte_stream("/tmp/x", true).is_err());
        assert!(storage.rmdir("").is_err());
    }
}
