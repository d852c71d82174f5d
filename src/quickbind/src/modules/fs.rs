//! The `fs` builtin namespace. Registered through the reflection registry
//! like any user binding, so it exercises the whole bridge: an enum, a
//! trivial struct, a non-trivial class, arrays and promise-returning
//! asynchronous functions that run on the worker pool.

use std::fs;
use std::mem::offset_of;
use std::path::Path;
use std::time::UNIX_EPOCH;

use quickbind_reflect::{
    describe, wrap1, wrap2, HostArray, Registry, TypeRef,
};
use tracing::warn;

use crate::bridge::marshal::DataBuffer;

pub const FILE_TYPE_NOT_FOUND: u32 = 0;
pub const FILE_TYPE_REGULAR: u32 = 1;
pub const FILE_TYPE_DIRECTORY: u32 = 2;
pub const FILE_TYPE_SYMLINK: u32 = 3;
pub const FILE_TYPE_OTHER: u32 = 4;

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct FileStatus {
    pub file_type: u32,
    pub permissions: u32,
    pub modified_on: u64,
    pub size: u64,
}

#[repr(C)]
#[derive(Clone, Default)]
pub struct DirEntry {
    pub status: FileStatus,
    pub name: String,
    pub path: String,
    pub ext: String,
}

fn status_of(path: &Path) -> FileStatus {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return FileStatus { file_type: FILE_TYPE_NOT_FOUND, ..FileStatus::default() };
    };
    let file_type = if meta.file_type().is_symlink() {
        FILE_TYPE_SYMLINK
    } else if meta.is_dir() {
        FILE_TYPE_DIRECTORY
    } else if meta.is_file() {
        FILE_TYPE_REGULAR
    } else {
        FILE_TYPE_OTHER
    };
    let modified_on = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    #[cfg(unix)]
    let permissions = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o7777
    };
    #[cfg(not(unix))]
    let permissions = if meta.permissions().readonly() { 0o444 } else { 0o666 };

    FileStatus { file_type, permissions, modified_on, size: meta.len() }
}

fn read_dir(path: &str) -> Vec<DirEntry> {
    let mut entries = Vec::new();
    let iter = match fs::read_dir(path) {
        Ok(iter) => iter,
        Err(err) => {
            warn!(path, %err, "readDir failed");
            return entries;
        }
    };
    for entry in iter.flatten() {
        let entry_path = entry.path();
        entries.push(DirEntry {
            status: status_of(&entry_path),
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry_path.display().to_string(),
            ext: entry_path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default(),
        });
    }
    entries
}

/// Registers the `fs` namespace. `buffer_ty` is the bound `DataBuffer`
/// type used by the binary read/write functions.
pub fn register(registry: &Registry, buffer_ty: &TypeRef) {
    let string = registry.string_type();
    let boolean = registry.bool_type();
    let u32_ty = registry.u32_type();
    let u64_ty = registry.u64_type();

    let file_type = registry
        .enum_type("FileType")
        .unsigned()
        .variant("NotFound", i64::from(FILE_TYPE_NOT_FOUND))
        .variant("Regular", i64::from(FILE_TYPE_REGULAR))
        .variant("Directory", i64::from(FILE_TYPE_DIRECTORY))
        .variant("Symlink", i64::from(FILE_TYPE_SYMLINK))
        .variant("Other", i64::from(FILE_TYPE_OTHER))
        .finish()
        .expect("FileType registered twice");

    let file_status = {
        let mut b = registry
            .struct_of::<FileStatus>("FileStatus")
            .expect("FileStatus registered twice");
        b.field("type", &file_type, offset_of!(FileStatus, file_type))
            .field("permissions", &u32_ty, offset_of!(FileStatus, permissions))
            .field("modifiedOn", &u64_ty, offset_of!(FileStatus, modified_on))
            .field("size", &u64_ty, offset_of!(FileStatus, size));
        b.finish()
    };

    let dir_entry = {
        let mut b = registry
            .class_of::<DirEntry>("DirEntry")
            .expect("DirEntry registered twice");
        b.readonly_field("status", &file_status, offset_of!(DirEntry, status))
            .readonly_field("name", &string, offset_of!(DirEntry, name))
            .readonly_field("path", &string, offset_of!(DirEntry, path))
            .readonly_field("ext", &string, offset_of!(DirEntry, ext))
            .cloneable::<DirEntry>()
            .destructible::<DirEntry>();
        b.finish()
    };
    let dir_entries = registry.array_of(&dir_entry);

    let ns = registry.namespace("fs");
    ns.data_type(&file_type);
    ns.data_type(&file_status);
    ns.data_type(&dir_entry);

    let f = ns.function(
        "exists",
        boolean.clone(),
        &[("path", string.clone())],
        wrap1(|path: &String| Path::new(path).exists()),
    );
    describe(&f)
        .desc("Checks whether a path exists")
        .param(0, "path", "The path to check")
        .returns("True if the path exists");

    let f = ns.function(
        "stat",
        file_status,
        &[("path", string.clone())],
        wrap1(|path: &String| status_of(Path::new(path))),
    );
    describe(&f)
        .desc("Reads the status of a file or directory")
        .param(0, "path", "The path to inspect")
        .returns("The file status; type is NotFound when the path is missing");

    let f = ns.function(
        "readDir",
        dir_entries,
        &[("path", string.clone())],
        wrap1(|path: &String| HostArray::from_vec(read_dir(path))),
    );
    describe(&f)
        .desc("Lists the entries of a directory")
        .param(0, "path", "The directory to list")
        .returns("The directory entries; empty when the path cannot be read");

    let f = ns.function(
        "mkdir",
        boolean.clone(),
        &[("path", string.clone())],
        wrap1(|path: &String| fs::create_dir_all(path).is_ok()),
    );
    describe(&f)
        .desc("Creates a directory, parents included")
        .param(0, "path", "The directory to create")
        .returns("True on success");

    let f = ns.function(
        "remove",
        boolean.clone(),
        &[("path", string.clone())],
        wrap1(|path: &String| {
            let p = Path::new(path);
            if p.is_dir() { fs::remove_dir_all(p).is_ok() } else { fs::remove_file(p).is_ok() }
        }),
    );
    describe(&f)
        .desc("Removes a file or directory tree")
        .param(0, "path", "The path to remove")
        .returns("True on success");

    // Synchronous text IO for the compiler host.
    let f = ns.function(
        "readTextFileSync",
        string.clone(),
        &[("path", string.clone())],
        wrap1(|path: &String| fs::read_to_string(path).unwrap_or_default()),
    );
    describe(&f)
        .desc("Reads a text file synchronously")
        .param(0, "path", "The file to read")
        .returns("The file contents, or an empty string on failure");

    let f = ns.function(
        "writeTextFileSync",
        boolean.clone(),
        &[("path", string.clone()), ("text", string.clone())],
        wrap2(|path: &String, text: &String| {
            if let Some(parent) = Path::new(path).parent() {
                let _ = fs::create_dir_all(parent);
            }
            fs::write(path, text).is_ok()
        }),
    );
    describe(&f)
        .desc("Writes a text file synchronously, creating parent directories")
        .param(0, "path", "The file to write")
        .param(1, "text", "The contents")
        .returns("True on success");

    // Asynchronous IO runs on the worker pool; failures reject the promise.
    let f = ns.function(
        "readFile",
        buffer_ty.clone(),
        &[("path", string.clone())],
        wrap1(|path: &String| match fs::read(path) {
            Ok(bytes) => DataBuffer::from_bytes(bytes),
            Err(err) => panic!("failed to read '{path}': {err}"),
        }),
    );
    describe(&f)
        .desc("Reads a file's bytes")
        .param(0, "path", "The file to read")
        .returns("The file contents")
        .asynchronous();

    let f = ns.function(
        "readTextFile",
        string.clone(),
        &[("path", string.clone())],
        wrap1(|path: &String| match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => panic!("failed to read '{path}': {err}"),
        }),
    );
    describe(&f)
        .desc("Reads a file as UTF-8 text")
        .param(0, "path", "The file to read")
        .returns("The file contents")
        .asynchronous();

    let f = ns.function(
        "writeFile",
        boolean.clone(),
        &[("path", string.clone()), ("data", buffer_ty.clone())],
        wrap2(|path: &String, data: &DataBuffer| {
            if let Err(err) = fs::write(path, data.data()) {
                panic!("failed to write '{path}': {err}");
            }
            true
        }),
    );
    describe(&f)
        .desc("Writes bytes to a file")
        .param(0, "path", "The file to write")
        .param(1, "data", "The bytes to write")
        .returns("True on success")
        .asynchronous();

    let f = ns.function(
        "writeTextFile",
        boolean,
        &[("path", string.clone()), ("text", string)],
        wrap2(|path: &String, text: &String| {
            if let Err(err) = fs::write(path, text) {
                panic!("failed to write '{path}': {err}");
            }
            true
        }),
    );
    describe(&f)
        .desc("Writes UTF-8 text to a file")
        .param(0, "path", "The file to write")
        .param(1, "text", "The contents")
        .returns("True on success")
        .asynchronous();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reports_missing_paths() {
        let status = status_of(Path::new("/definitely/not/a/real/path"));
        assert_eq!(status.file_type, FILE_TYPE_NOT_FOUND);
        assert_eq!(status.size, 0);
    }

    #[test]
    fn read_dir_lists_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let mut entries = read_dir(&dir.path().display().to_string());
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].ext, ".txt");
        assert_eq!(entries[0].status.file_type, FILE_TYPE_REGULAR);
        assert_eq!(entries[1].status.file_type, FILE_TYPE_DIRECTORY);
    }
}
