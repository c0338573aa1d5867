//! Directory index: a compact read-only trie mapping virtual paths to
//! per-file tags.
//!
//! The serialized form is a flat array of directory entries and file
//! entries plus a shared string table and a mount-point string. Handles
//! are 32-bit indices into the respective arrays; `u32::MAX` is the
//! invalid sentinel and the root directory is entry 0. Iteration order is
//! stable and reflects write-time insertion.
//!
//! The blob may be AES encrypted inside the TOC; [`DirectoryIndexReader`]
//! decrypts it in place at initialization.

use crate::crypto::{self, AesKey};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use iostore_core::{ContainerId, Error, Result};
use std::io::{Cursor, Read, Write};

/// Invalid handle sentinel for directory, file, and name indices.
pub const INDEX_HANDLE_INVALID: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DirectoryEntry {
    name: u32,
    first_child: u32,
    next_sibling: u32,
    first_file: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileEntry {
    name: u32,
    next_file: u32,
    user_data: u32,
}

/// Deserialized directory index payload.
#[derive(Debug, Clone, Default)]
struct DirectoryIndexResource {
    mount_point: String,
    directories: Vec<DirectoryEntry>,
    files: Vec<FileEntry>,
    strings: Vec<String>,
}

impl DirectoryIndexResource {
    fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        write_string(&mut out, &self.mount_point)?;
        out.write_u32::<LittleEndian>(self.directories.len() as u32)?;
        for dir in &self.directories {
            out.write_u32::<LittleEndian>(dir.name)?;
            out.write_u32::<LittleEndian>(dir.first_child)?;
            out.write_u32::<LittleEndian>(dir.next_sibling)?;
            out.write_u32::<LittleEndian>(dir.first_file)?;
        }
        out.write_u32::<LittleEndian>(self.files.len() as u32)?;
        for file in &self.files {
            out.write_u32::<LittleEndian>(file.name)?;
            out.write_u32::<LittleEndian>(file.next_file)?;
            out.write_u32::<LittleEndian>(file.user_data)?;
        }
        out.write_u32::<LittleEndian>(self.strings.len() as u32)?;
        for string in &self.strings {
            write_string(&mut out, string)?;
        }
        Ok(out)
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let mount_point = read_string(&mut cursor)?;

        let dir_count = read_count(&mut cursor)?;
        let mut directories = Vec::with_capacity(dir_count);
        for _ in 0..dir_count {
            directories.push(DirectoryEntry {
                name: read_handle(&mut cursor)?,
                first_child: read_handle(&mut cursor)?,
                next_sibling: read_handle(&mut cursor)?,
                first_file: read_handle(&mut cursor)?,
            });
        }

        let file_count = read_count(&mut cursor)?;
        let mut files = Vec::with_capacity(file_count);
        for _ in 0..file_count {
            files.push(FileEntry {
                name: read_handle(&mut cursor)?,
                next_file: read_handle(&mut cursor)?,
                user_data: read_handle(&mut cursor)?,
            });
        }

        let string_count = read_count(&mut cursor)?;
        let mut strings = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            strings.push(read_string(&mut cursor)?);
        }

        // Trailing zero bytes are AES padding from an encrypted blob
        let mut rest = Vec::new();
        cursor
            .read_to_end(&mut rest)
            .map_err(|_| Error::CorruptToc("truncated directory index".to_string()))?;
        if rest.iter().any(|&b| b != 0) {
            return Err(Error::CorruptToc(
                "trailing bytes after directory index strings".to_string(),
            ));
        }

        if directories.is_empty() {
            return Err(Error::CorruptToc(
                "directory index has no root".to_string(),
            ));
        }
        let resource = DirectoryIndexResource {
            mount_point,
            directories,
            files,
            strings,
        };
        resource.validate()?;
        Ok(resource)
    }

    fn validate(&self) -> Result<()> {
        let dir_bound = self.directories.len() as u32;
        let file_bound = self.files.len() as u32;
        let name_bound = self.strings.len() as u32;
        let check = |handle: u32, bound: u32, what: &str| -> Result<()> {
            if handle != INDEX_HANDLE_INVALID && handle >= bound {
                return Err(Error::CorruptToc(format!(
                    "directory index {} handle {} out of range",
                    what, handle
                )));
            }
            Ok(())
        };
        for dir in &self.directories {
            check(dir.name, name_bound, "name")?;
            check(dir.first_child, dir_bound, "child")?;
            check(dir.next_sibling, dir_bound, "sibling")?;
            check(dir.first_file, file_bound, "file")?;
        }
        for file in &self.files {
            if file.name == INDEX_HANDLE_INVALID || file.name >= name_bound {
                return Err(Error::CorruptToc(format!(
                    "directory index file name handle {} out of range",
                    file.name
                )));
            }
            check(file.next_file, file_bound, "file link")?;
        }
        Ok(())
    }
}

fn write_string(out: &mut Vec<u8>, value: &str) -> Result<()> {
    out.write_u32::<LittleEndian>(value.len() as u32)?;
    out.write_all(value.as_bytes())?;
    Ok(())
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = read_count(cursor)?;
    let mut bytes = vec![0u8; len];
    cursor
        .read_exact(&mut bytes)
        .map_err(|_| Error::CorruptToc("truncated directory index string".to_string()))?;
    String::from_utf8(bytes)
        .map_err(|_| Error::CorruptToc("directory index string is not UTF-8".to_string()))
}

fn read_count(cursor: &mut Cursor<&[u8]>) -> Result<usize> {
    let value = read_handle(cursor)?;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if value as usize > remaining {
        return Err(Error::CorruptToc(format!(
            "directory index count {} exceeds remaining {} bytes",
            value, remaining
        )));
    }
    Ok(value as usize)
}

fn read_handle(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::CorruptToc("truncated directory index".to_string()))
}

/// Builds a directory index at write time.
///
/// Paths are `/`-separated, relative to the mount point. Insertion order
/// is preserved: children and files are appended to the tail of their
/// sibling chains, so iteration replays insertion.
pub struct DirectoryIndexBuilder {
    resource: DirectoryIndexResource,
}

impl DirectoryIndexBuilder {
    /// Start an index with the given mount point. The root directory
    /// always exists as entry 0.
    pub fn new(mount_point: &str) -> Self {
        DirectoryIndexBuilder {
            resource: DirectoryIndexResource {
                mount_point: mount_point.to_string(),
                directories: vec![DirectoryEntry {
                    name: INDEX_HANDLE_INVALID,
                    first_child: INDEX_HANDLE_INVALID,
                    next_sibling: INDEX_HANDLE_INVALID,
                    first_file: INDEX_HANDLE_INVALID,
                }],
                files: Vec::new(),
                strings: Vec::new(),
            },
        }
    }

    /// Add a file with its 32-bit user tag. Intermediate directories are
    /// created on demand.
    pub fn add_file(&mut self, path: &str, user_data: u32) -> Result<()> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Err(Error::InvalidParameter("empty index path".to_string()));
        }
        let mut components: Vec<&str> = trimmed.split('/').collect();
        let file_name = components.pop().unwrap();
        if components.iter().any(|c| c.is_empty()) || file_name.is_empty() {
            return Err(Error::InvalidParameter(format!(
                "index path '{}' has empty components",
                path
            )));
        }

        let mut dir = 0u32;
        for component in components {
            dir = self.child_or_insert(dir, component);
        }
        self.append_file(dir, file_name, user_data);
        Ok(())
    }

    /// Freeze and serialize the index payload.
    pub fn build(self) -> Result<Vec<u8>> {
        self.resource.serialize()
    }

    fn intern(&mut self, name: &str) -> u32 {
        // Linear scan keeps output deterministic without a map; index
        // string tables are small
        if let Some(pos) = self.resource.strings.iter().position(|s| s == name) {
            return pos as u32;
        }
        self.resource.strings.push(name.to_string());
        (self.resource.strings.len() - 1) as u32
    }

    fn child_or_insert(&mut self, parent: u32, name: &str) -> u32 {
        let name_handle = self.intern(name);
        let mut cursor = self.resource.directories[parent as usize].first_child;
        let mut tail = INDEX_HANDLE_INVALID;
        while cursor != INDEX_HANDLE_INVALID {
            if self.resource.directories[cursor as usize].name == name_handle {
                return cursor;
            }
            tail = cursor;
            cursor = self.resource.directories[cursor as usize].next_sibling;
        }

        let new_handle = self.resource.directories.len() as u32;
        self.resource.directories.push(DirectoryEntry {
            name: name_handle,
            first_child: INDEX_HANDLE_INVALID,
            next_sibling: INDEX_HANDLE_INVALID,
            first_file: INDEX_HANDLE_INVALID,
        });
        if tail == INDEX_HANDLE_INVALID {
            self.resource.directories[parent as usize].first_child = new_handle;
        } else {
            self.resource.directories[tail as usize].next_sibling = new_handle;
        }
        new_handle
    }

    fn append_file(&mut self, dir: u32, name: &str, user_data: u32) {
        let name_handle = self.intern(name);
        let new_handle = self.resource.files.len() as u32;
        self.resource.files.push(FileEntry {
            name: name_handle,
            next_file: INDEX_HANDLE_INVALID,
            user_data,
        });

        let mut cursor = self.resource.directories[dir as usize].first_file;
        if cursor == INDEX_HANDLE_INVALID {
            self.resource.directories[dir as usize].first_file = new_handle;
            return;
        }
        while self.resource.files[cursor as usize].next_file != INDEX_HANDLE_INVALID {
            cursor = self.resource.files[cursor as usize].next_file;
        }
        self.resource.files[cursor as usize].next_file = new_handle;
    }
}

/// Read-only view over a directory index blob.
pub struct DirectoryIndexReader {
    resource: DirectoryIndexResource,
}

impl DirectoryIndexReader {
    /// Parse a plaintext blob.
    pub fn new(bytes: &[u8]) -> Result<Self> {
        Ok(DirectoryIndexReader {
            resource: DirectoryIndexResource::parse(bytes)?,
        })
    }

    /// Decrypt an encrypted blob in place, then parse it.
    pub fn new_encrypted(
        mut bytes: Vec<u8>,
        container_id: ContainerId,
        key: &AesKey,
    ) -> Result<Self> {
        let iv = crypto::derive_block_iv(container_id, crypto::DIRECTORY_INDEX_PARTITION, 0);
        crypto::decrypt_in_place(key, &iv, &mut bytes)?;
        Self::new(&bytes)
    }

    /// The mount point recorded at write time.
    pub fn mount_point(&self) -> &str {
        &self.resource.mount_point
    }

    /// Handle of the root directory.
    pub fn root(&self) -> u32 {
        0
    }

    /// First child directory of `dir`, or `INDEX_HANDLE_INVALID`.
    pub fn first_child(&self, dir: u32) -> u32 {
        self.resource.directories[dir as usize].first_child
    }

    /// Next sibling directory, or `INDEX_HANDLE_INVALID`.
    pub fn next_sibling(&self, dir: u32) -> u32 {
        self.resource.directories[dir as usize].next_sibling
    }

    /// First file in `dir`, or `INDEX_HANDLE_INVALID`.
    pub fn first_file(&self, dir: u32) -> u32 {
        self.resource.directories[dir as usize].first_file
    }

    /// Next file in the same directory, or `INDEX_HANDLE_INVALID`.
    pub fn next_file(&self, file: u32) -> u32 {
        self.resource.files[file as usize].next_file
    }

    /// Name of a directory. The root has no name.
    pub fn directory_name(&self, dir: u32) -> Option<&str> {
        let handle = self.resource.directories[dir as usize].name;
        (handle != INDEX_HANDLE_INVALID).then(|| self.resource.strings[handle as usize].as_str())
    }

    /// Name of a file.
    pub fn file_name(&self, file: u32) -> &str {
        &self.resource.strings[self.resource.files[file as usize].name as usize]
    }

    /// User tag of a file.
    pub fn file_user_data(&self, file: u32) -> u32 {
        self.resource.files[file as usize].user_data
    }

    /// Look up a file by its full `/`-separated path.
    pub fn find(&self, path: &str) -> Option<u32> {
        let trimmed = path.trim_matches('/');
        let mut components: Vec<&str> = trimmed.split('/').collect();
        let file_name = components.pop()?;

        let mut dir = self.root();
        for component in components {
            dir = self.find_child(dir, component)?;
        }
        let mut file = self.first_file(dir);
        while file != INDEX_HANDLE_INVALID {
            if self.file_name(file) == file_name {
                return Some(self.file_user_data(file));
            }
            file = self.next_file(file);
        }
        None
    }

    /// Visit every `(full path, user tag)` pair in insertion order.
    pub fn visit_files<F: FnMut(&str, u32)>(&self, mut visitor: F) {
        let mut prefix = String::new();
        self.visit_dir(self.root(), &mut prefix, &mut visitor);
    }

    /// All `(full path, user tag)` pairs in insertion order.
    pub fn files(&self) -> Vec<(String, u32)> {
        let mut out = Vec::new();
        self.visit_files(|path, tag| out.push((path.to_string(), tag)));
        out
    }

    fn find_child(&self, dir: u32, name: &str) -> Option<u32> {
        let mut cursor = self.first_child(dir);
        while cursor != INDEX_HANDLE_INVALID {
            if self.directory_name(cursor) == Some(name) {
                return Some(cursor);
            }
            cursor = self.next_sibling(cursor);
        }
        None
    }

    fn visit_dir<F: FnMut(&str, u32)>(&self, dir: u32, prefix: &mut String, visitor: &mut F) {
        let saved = prefix.len();
        if let Some(name) = self.directory_name(dir) {
            prefix.push_str(name);
            prefix.push('/');
        }

        let mut file = self.first_file(dir);
        while file != INDEX_HANDLE_INVALID {
            let full = format!("{}{}", prefix, self.file_name(file));
            visitor(&full, self.file_user_data(file));
            file = self.next_file(file);
        }

        let mut child = self.first_child(dir);
        while child != INDEX_HANDLE_INVALID {
            self.visit_dir(child, prefix, visitor);
            child = self.next_sibling(child);
        }
        prefix.truncate(saved);
    }
}
