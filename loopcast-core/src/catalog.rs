use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read clip directory {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipKind {
    Bumper,
    Main,
}

impl ClipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClipKind::Bumper => "bumper",
            ClipKind::Main => "main",
        }
    }
}

impl fmt::Display for ClipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A playable file. Two clips are the same clip when their paths match.
#[derive(Debug, Clone, Serialize)]
pub struct Clip {
    pub path: PathBuf,
    pub kind: ClipKind,
}

impl Clip {
    pub fn main(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: ClipKind::Main,
        }
    }

    pub fn bumper(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: ClipKind::Bumper,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

impl PartialEq for Clip {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Clip {}

/// Lists the main clips of a flat directory.
///
/// The directory is read again on every call; nothing is cached between passes.
#[derive(Debug, Clone)]
pub struct ClipCatalog {
    directory: PathBuf,
    bumper_file: String,
    extensions: Vec<String>,
}

impl ClipCatalog {
    pub fn new(
        directory: impl Into<PathBuf>,
        bumper_file: impl Into<String>,
        extensions: &[String],
    ) -> Self {
        Self {
            directory: directory.into(),
            bumper_file: bumper_file.into(),
            extensions: extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn bumper_path(&self) -> PathBuf {
        self.directory.join(&self.bumper_file)
    }

    pub fn bumper(&self) -> Option<Clip> {
        let path = self.bumper_path();
        path.is_file().then(|| Clip::bumper(path))
    }

    /// Main clips sorted by file name, bumper excluded.
    ///
    /// Names are compared and joined as raw OS strings, so a file whose name
    /// is not valid UTF-8 still resolves to itself. A directory that does not
    /// exist yet is treated as empty.
    pub fn list(&self) -> Result<Vec<Clip>, CatalogError> {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(source) if source.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CatalogError::Io {
                    source,
                    path: self.directory.clone(),
                })
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CatalogError::Io {
                source,
                path: self.directory.clone(),
            })?;
            let name = entry.file_name();
            if name == OsStr::new(&self.bumper_file) || !self.is_playable(&name) {
                continue;
            }
            if entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false) {
                continue;
            }
            names.push(name);
        }
        names.sort();

        Ok(names
            .into_iter()
            .map(|name| Clip::main(self.directory.join(name)))
            .collect())
    }

    fn is_playable(&self, name: &OsStr) -> bool {
        let lower = name.as_encoded_bytes().to_ascii_lowercase();
        self.extensions.iter().any(|ext| {
            let suffix = format!(".{ext}");
            lower.ends_with(suffix.as_bytes())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn catalog(dir: &Path) -> ClipCatalog {
        ClipCatalog::new(dir, "bumper.mp4", &["mp4".to_string(), "flv".to_string()])
    }

    #[test]
    fn lists_sorted_main_clips_without_bumper() {
        let temp = TempDir::new().unwrap();
        for name in ["c.flv", "a.mp4", "bumper.mp4", "B.MP4", "notes.txt"] {
            fs::write(temp.path().join(name), b"x").unwrap();
        }

        let names: Vec<String> = catalog(temp.path())
            .list()
            .unwrap()
            .iter()
            .map(Clip::file_name)
            .collect();
        assert_eq!(names, vec!["B.MP4", "a.mp4", "c.flv"]);
    }

    #[test]
    fn empty_or_missing_directory_yields_nothing() {
        let temp = TempDir::new().unwrap();
        assert!(catalog(temp.path()).list().unwrap().is_empty());
        assert!(catalog(&temp.path().join("absent")).list().unwrap().is_empty());
    }

    #[test]
    fn bumper_is_reported_only_when_present() {
        let temp = TempDir::new().unwrap();
        let catalog = catalog(temp.path());
        assert!(catalog.bumper().is_none());

        fs::write(temp.path().join("bumper.mp4"), b"x").unwrap();
        let bumper = catalog.bumper().expect("bumper present");
        assert_eq!(bumper.kind, ClipKind::Bumper);
        assert!(catalog.list().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_names_resolve_to_files_on_disk() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp = TempDir::new().unwrap();
        let name = OsStr::from_bytes(b"caf\xe9.mp4");
        fs::write(temp.path().join(name), b"x").unwrap();
        fs::write(temp.path().join("b.mp4"), b"x").unwrap();

        let clips = catalog(temp.path()).list().unwrap();

        assert_eq!(clips.len(), 2);
        assert!(clips.iter().all(|clip| clip.path.exists()));
        assert_eq!(clips[0].file_name(), "b.mp4");
        assert_eq!(clips[1].path, temp.path().join(name));
        assert_eq!(clips[1].file_name(), "caf\u{fffd}.mp4");
    }

    #[test]
    fn subdirectories_with_video_names_are_skipped() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("folder.mp4")).unwrap();
        fs::write(temp.path().join("real.mp4"), b"x").unwrap();
        let clips = catalog(temp.path()).list().unwrap();
        assert_eq!(clips, vec![Clip::main(temp.path().join("real.mp4"))]);
    }
}
