//! Local filesystem access for descriptor directories, inventories, and
//! downloaded artifacts on the coordinating host.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// Errors raised while touching local files.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WorkspaceError {
    /// Reading or writing failed.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// The path has no final component.
    #[error("{path} does not name a file")]
    MissingFileName {
        /// Offending path.
        path: Utf8PathBuf,
    },
}

fn io_error(path: &Utf8Path, err: &io::Error) -> WorkspaceError {
    WorkspaceError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn split(path: &Utf8Path) -> Result<(&Utf8Path, &str), WorkspaceError> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| WorkspaceError::MissingFileName {
            path: path.to_path_buf(),
        })?;
    Ok((parent, file_name))
}

/// Writes `contents` to `path`, creating parent directories.
///
/// # Errors
///
/// Returns [`WorkspaceError`] when the directory or file cannot be written.
pub fn write_file(path: &Utf8Path, contents: &str) -> Result<(), WorkspaceError> {
    let (parent, file_name) = split(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(parent, &err))?;
    dir.write(file_name, contents)
        .map_err(|err| io_error(path, &err))
}

/// Reads `path` into a string.
///
/// # Errors
///
/// Returns [`WorkspaceError`] when the file cannot be read.
pub fn read_file(path: &Utf8Path) -> Result<String, WorkspaceError> {
    let (parent, file_name) = split(path)?;
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(parent, &err))?;
    dir.read_to_string(file_name)
        .map_err(|err| io_error(path, &err))
}

/// Reports whether `path` exists.
///
/// # Errors
///
/// Returns [`WorkspaceError`] when the parent exists but cannot be inspected.
pub fn exists(path: &Utf8Path) -> Result<bool, WorkspaceError> {
    let (parent, file_name) = split(path)?;
    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir
            .try_exists(file_name)
            .map_err(|err| io_error(path, &err)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_error(parent, &err)),
    }
}

/// Creates `path` and any missing parents.
///
/// # Errors
///
/// Returns [`WorkspaceError`] when creation fails.
pub fn create_dir_all(path: &Utf8Path) -> Result<(), WorkspaceError> {
    Dir::create_ambient_dir_all(path, ambient_authority()).map_err(|err| io_error(path, &err))
}

/// Recursively copies the directory `from` into a new directory `to`.
///
/// # Errors
///
/// Returns [`WorkspaceError`] when `to` already exists or any entry cannot be
/// copied.
pub fn copy_dir_all(from: &Utf8Path, to: &Utf8Path) -> Result<(), WorkspaceError> {
    let source =
        Dir::open_ambient_dir(from, ambient_authority()).map_err(|err| io_error(from, &err))?;
    let (parent, name) = split(to)?;
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    let parent_dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(parent, &err))?;
    parent_dir
        .create_dir(name)
        .map_err(|err| io_error(to, &err))?;
    let destination = parent_dir.open_dir(name).map_err(|err| io_error(to, &err))?;
    copy_entries(&source, &destination, from)
}

fn copy_entries(source: &Dir, destination: &Dir, origin: &Utf8Path) -> Result<(), WorkspaceError> {
    for listed in source.entries().map_err(|err| io_error(origin, &err))? {
        let entry = listed.map_err(|err| io_error(origin, &err))?;
        let name = entry.file_name().map_err(|err| io_error(origin, &err))?;
        let file_type = entry.file_type().map_err(|err| io_error(origin, &err))?;
        let path = origin.join(&name);
        if file_type.is_dir() {
            destination
                .create_dir(&name)
                .map_err(|err| io_error(&path, &err))?;
            let child_source = source.open_dir(&name).map_err(|err| io_error(&path, &err))?;
            let child_destination = destination
                .open_dir(&name)
                .map_err(|err| io_error(&path, &err))?;
            copy_entries(&child_source, &child_destination, &path)?;
        } else if file_type.is_file() {
            source
                .copy(&name, destination, &name)
                .map_err(|err| io_error(&path, &err))?;
        }
    }
    Ok(())
}

/// Removes the directory `path` and everything below it. A missing
/// directory is not an error.
///
/// # Errors
///
/// Returns [`WorkspaceError`] when removal fails.
pub fn remove_dir_all(path: &Utf8Path) -> Result<(), WorkspaceError> {
    let (parent, name) = split(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(io_error(parent, &err)),
    };
    match dir.remove_dir_all(name) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_error(path, &err)),
    }
}
