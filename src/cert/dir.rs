// Copyright 2022 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Implementation of the directory-backed [`DirCache`].

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::{Cache, Error};

/// A [`Cache`] that keeps each entry in its own file within a
/// directory.
///
/// The directory is created (with owner-only permissions on Unix) the
/// first time something is stored. Entries are written to a temporary
/// file which is then renamed into place, so readers never observe a
/// partially written entry, and a failed write leaves any previous
/// entry intact.
///
/// Keys become file names, so they may not be empty, may not start
/// with `.` (which is reserved for temporary files), and may not
/// contain path separators.
#[derive(Debug)]
pub struct DirCache {
    dir: PathBuf,
    next_temp_id: AtomicU64,
}

impl DirCache {
    /// Creates a `DirCache` storing entries in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            next_temp_id: AtomicU64::new(0),
        }
    }

    /// Creates a `DirCache` storing entries in `dir`, creating the
    /// directory now rather than at the first put.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let cache = Self::new(dir);
        cache.create_dir()?;
        Ok(cache)
    }

    /// Returns the directory in which entries are stored.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, Error> {
        if key.is_empty() || key.starts_with('.') || key.contains(['/', '\\', '\0']) {
            Err(Error::InvalidKey(key.to_owned()))
        } else {
            Ok(self.dir.join(key))
        }
    }

    fn create_dir(&self) -> io::Result<()> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&self.dir)
    }

    fn create_temp_file(&self) -> io::Result<(PathBuf, File)> {
        let id = self.next_temp_id.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!(".tmp-{}-{}", process::id(), id));
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&path)?;
        Ok((path, file))
    }

    /// Writes `data` under `key`. The entry is only renamed into place
    /// if `deadline` (when given) has not passed by then.
    fn store(&self, key: &str, data: &[u8], deadline: Option<Instant>) -> Result<(), Error> {
        let path = self.path_for(key)?;
        self.create_dir()?;
        let (temp_path, mut file) = self.create_temp_file()?;
        let result = file
            .write_all(data)
            .and_then(|()| file.sync_all())
            .map_err(Error::from)
            .and_then(|()| match deadline {
                Some(deadline) if Instant::now() >= deadline => Err(Error::TimedOut),
                _ => fs::rename(&temp_path, &path).map_err(Error::from),
            });
        if result.is_err() {
            // Best effort; the original error is the one worth
            // reporting.
            let _ = fs::remove_file(&temp_path);
        }
        result
    }
}

impl Cache for DirCache {
    fn get(&self, key: &str) -> Result<Vec<u8>, Error> {
        match fs::read(self.path_for(key)?) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::CacheMiss),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), Error> {
        self.store(key, data, None)
    }

    fn put_with_deadline(&self, key: &str, data: &[u8], deadline: Instant) -> Result<(), Error> {
        if Instant::now() >= deadline {
            return Err(Error::TimedOut);
        }
        self.store(key, data, Some(deadline))
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        match fs::remove_file(self.path_for(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_returns_data() {
        let temp = tempfile::tempdir().unwrap();
        let cache = DirCache::new(temp.path().join("certs"));
        cache.put("example.com", b"cert").unwrap();
        assert_eq!(cache.get("example.com").unwrap(), b"cert");
        cache.put("example.com", b"renewed").unwrap();
        assert_eq!(cache.get("example.com").unwrap(), b"renewed");
    }

    #[test]
    fn open_creates_the_directory() {
        let temp = tempfile::tempdir().unwrap();
        let cache = DirCache::open(temp.path().join("a").join("certs")).unwrap();
        assert!(cache.dir().is_dir());
        assert!(matches!(cache.get("example.com"), Err(Error::CacheMiss)));

        let file = temp.path().join("file");
        fs::write(&file, b"").unwrap();
        assert!(DirCache::open(file.join("certs")).is_err());
    }

    #[test]
    fn missing_entries_are_cache_misses() {
        let temp = tempfile::tempdir().unwrap();
        let cache = DirCache::new(temp.path());
        assert!(matches!(cache.get("example.com"), Err(Error::CacheMiss)));
    }

    #[test]
    fn delete_removes_entries_and_tolerates_missing_ones() {
        let temp = tempfile::tempdir().unwrap();
        let cache = DirCache::new(temp.path());
        cache.put("acme_account+key", b"key").unwrap();
        cache.delete("acme_account+key").unwrap();
        assert!(matches!(cache.get("acme_account+key"), Err(Error::CacheMiss)));
        cache.delete("acme_account+key").unwrap();
    }

    #[test]
    fn put_leaves_no_temporary_files() {
        let temp = tempfile::tempdir().unwrap();
        let cache = DirCache::new(temp.path());
        cache.put("a.example.com", b"1").unwrap();
        cache.put("b.example.com", b"2").unwrap();
        let mut names: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, ["a.example.com", "b.example.com"]);
    }

    #[test]
    fn timed_out_puts_leave_previous_entries_in_place() {
        let temp = tempfile::tempdir().unwrap();
        let cache = DirCache::new(temp.path());
        cache.put("example.com", b"old").unwrap();
        assert!(matches!(
            cache.put_with_deadline("example.com", b"new", Instant::now()),
            Err(Error::TimedOut)
        ));
        assert_eq!(cache.get("example.com").unwrap(), b"old");
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn keys_cannot_escape_the_directory() {
        let temp = tempfile::tempdir().unwrap();
        let cache = DirCache::new(temp.path());
        for key in ["", "../x", "a/b", ".hidden", "..", "a\\b"] {
            assert!(
                matches!(cache.put(key, b"x"), Err(Error::InvalidKey(_))),
                "{:?}",
                key
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn entries_are_private_to_the_owner() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        let cache = DirCache::new(temp.path().join("certs"));
        cache.put("example.com", b"secret").unwrap();
        let dir_mode = fs::metadata(cache.dir()).unwrap().permissions().mode();
        let file_mode = fs::metadata(cache.dir().join("example.com"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        assert_eq!(file_mode & 0o777, 0o600);
    }
}
