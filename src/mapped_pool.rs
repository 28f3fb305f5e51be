//! File-backed page pool.
//!
//! A [`MappedPool`] serves fixed-size blocks out of an `mmap`ed regular
//! file. In persistent mode writes go back to the file; copy-on-write mode
//! keeps them private to the process; read-only mode maps the file for
//! reading only. The free list starts out pointing at the base of the
//! mapping and walks the untouched region lazily, so no initialization pass
//! over the file is needed (see
//! [`SegregatedStorage::allocate_from_region`]).
//!
//! The free-list head itself lives in process memory and is not persisted:
//! every open starts from a fully free pool.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use thiserror::Error;
use tracing::debug;

use crate::provider::{memory_page_size, BlockProvider};
use crate::storage::SegregatedStorage;
use crate::tagged::FreeNode;

/// How the file contents relate to the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapMode {
    /// Writes go back to the file (`MAP_SHARED`).
    #[default]
    Persistent,
    /// Writes stay private to this process (`MAP_PRIVATE`).
    CopyOnWrite,
    /// The mapping is read-only.
    ReadOnly,
}

/// Options for opening a [`MappedPool`].
#[derive(Debug, Clone, Default)]
pub struct MapOptions {
    /// Size of the mapping in bytes. Zero means "use the existing file's
    /// size"; nonzero must match it when the file already exists, and must
    /// be a multiple of the page size.
    pub file_size: usize,
    /// Relation between the file and the mapping.
    pub mode: MapMode,
    /// Zero existing contents before use. Only meaningful for writable
    /// modes; applied to the file itself in persistent mode.
    pub zero_init: bool,
}

impl MapOptions {
    /// Set the mapping size in bytes.
    pub fn file_size(mut self, file_size: usize) -> Self {
        self.file_size = file_size;
        self
    }

    /// Set the mapping mode.
    pub fn mode(mut self, mode: MapMode) -> Self {
        self.mode = mode;
        self
    }

    /// Request zeroing of existing contents.
    pub fn zero_init(mut self, zero_init: bool) -> Self {
        self.zero_init = zero_init;
        self
    }
}

/// Error opening a mapped pool.
///
/// Construction performs all parameter validation before mapping anything;
/// each failure names the offending file.
#[derive(Debug, Error)]
pub enum MapError {
    /// The path exists but is not a regular file.
    #[error("file exists but is not a regular file: {}", .path.display())]
    NotRegular { path: PathBuf },
    /// The file exists but is not readable.
    #[error("file exists but is not readable: {}", .path.display())]
    NotReadable { path: PathBuf },
    /// The file does not exist and no size was provided to create it with.
    #[error("the file {} does not exist, and no size was provided", .path.display())]
    SizeRequired { path: PathBuf },
    /// Read-only mode was requested for a file that does not exist.
    #[error("no such file: {}", .path.display())]
    NoSuchFile { path: PathBuf },
    /// Copy-on-write mode was requested for a file that does not exist.
    #[error("copy-on-write was requested, but the file {} does not exist", .path.display())]
    CopyOnWriteMissing { path: PathBuf },
    /// Persistent mode was requested for a file this process cannot write.
    #[error("persistent mode requested, but file {} is not writable", .path.display())]
    NotWritable { path: PathBuf },
    /// Zero-initialization was requested for a file this process cannot
    /// write.
    #[error("zero initialization requested for read-only file {}", .path.display())]
    ZeroInitReadOnly { path: PathBuf },
    /// An existing file's size is not page-granular.
    #[error(
        "the size of existing file {} ({}) is not a multiple of the memory page size ({})",
        .path.display(), .actual, .page_size
    )]
    UnalignedFileSize {
        path: PathBuf,
        actual: u64,
        page_size: usize,
    },
    /// A provided nonzero size disagrees with the existing file's size.
    #[error(
        "provided file size ({}) does not match the size of existing file {} ({} bytes)",
        .requested, .path.display(), .actual
    )]
    FileSizeMismatch {
        path: PathBuf,
        requested: usize,
        actual: u64,
    },
    /// A system call failed.
    #[error("failed to {} {}: {}", .op, .path.display(), .source)]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Page-granular provider of fixed-size blocks backed by a mapped file.
#[derive(Debug)]
pub struct MappedPool {
    mapped_base: NonNull<u8>,
    mapped_size: usize,
    block_size: usize,
    storage: SegregatedStorage,
}

// Safety: the mapping is owned by the pool for its whole lifetime and all
// mutation goes through the storage's synchronized protocol.
unsafe impl Send for MappedPool {}
unsafe impl Sync for MappedPool {}

impl MappedPool {
    /// Open a persistent pool with default options on `path`.
    ///
    /// The file must already exist; pass a nonzero
    /// [`MapOptions::file_size`] through [`with_options`](Self::with_options)
    /// to create one.
    pub fn new(path: impl AsRef<Path>, block_size: usize) -> Result<Self, MapError> {
        Self::with_options(path, block_size, MapOptions::default())
    }

    /// Open (or create) a pool on `path` with explicit options.
    ///
    /// `block_size` must be a nonzero multiple of the system page size and
    /// large enough to hold a free link. On success the whole mapping is one
    /// free list starting at its base.
    pub fn with_options(
        path: impl AsRef<Path>,
        block_size: usize,
        options: MapOptions,
    ) -> Result<Self, MapError> {
        let MapOptions {
            file_size,
            mode,
            zero_init,
        } = options;
        let page_size = memory_page_size();

        assert!(block_size >= std::mem::size_of::<FreeNode>());
        assert!(
            block_size != 0 && block_size % page_size == 0,
            "block_size must be a nonzero multiple of the page size"
        );
        assert!(
            file_size % page_size == 0,
            "file_size must be a multiple of the page size"
        );
        // Zeroing read-only data makes no sense.
        assert!(mode != MapMode::ReadOnly || !zero_init);

        let path = std::path::absolute(path.as_ref()).map_err(|source| MapError::Io {
            op: "resolve",
            path: path.as_ref().to_path_buf(),
            source,
        })?;

        let metadata = match fs::metadata(&path) {
            Ok(metadata) => Some(metadata),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(MapError::Io {
                    op: "stat",
                    path,
                    source,
                })
            }
        };

        if let Some(metadata) = &metadata {
            if !metadata.is_file() {
                return Err(MapError::NotRegular { path });
            }
            if metadata.permissions().mode() & 0o444 == 0 {
                return Err(MapError::NotReadable { path });
            }
            let writable = metadata.permissions().mode() & 0o222 != 0;
            if !writable {
                if mode == MapMode::Persistent {
                    return Err(MapError::NotWritable { path });
                }
                if zero_init {
                    return Err(MapError::ZeroInitReadOnly { path });
                }
            }
        } else {
            if file_size == 0 {
                return Err(MapError::SizeRequired { path });
            }
            match mode {
                MapMode::ReadOnly => return Err(MapError::NoSuchFile { path }),
                MapMode::CopyOnWrite => return Err(MapError::CopyOnWriteMissing { path }),
                MapMode::Persistent => {}
            }
        }

        // The descriptor is scoped to this constructor; it is closed once
        // the mapping is in place (or on any error path).
        let (file, mapped_size) = match &metadata {
            None => {
                let file = fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .map_err(|source| MapError::Io {
                        op: "create",
                        path: path.clone(),
                        source,
                    })?;
                // Reserve the disk space up front; the fresh extent reads
                // back as zeros.
                if unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, file_size as libc::off_t) }
                    == -1
                {
                    return Err(MapError::Io {
                        op: "preallocate",
                        path,
                        source: io::Error::last_os_error(),
                    });
                }
                (file, file_size)
            }
            Some(metadata) => {
                let mut open_options = fs::OpenOptions::new();
                open_options.read(true);
                if mode == MapMode::Persistent {
                    open_options.write(true);
                }
                let file = open_options.open(&path).map_err(|source| MapError::Io {
                    op: "open",
                    path: path.clone(),
                    source,
                })?;

                let actual = metadata.len();
                let mapped_size = if file_size == 0 {
                    if actual as usize % page_size != 0 {
                        return Err(MapError::UnalignedFileSize {
                            path,
                            actual,
                            page_size,
                        });
                    }
                    actual as usize
                } else if actual != file_size as u64 {
                    return Err(MapError::FileSizeMismatch {
                        path,
                        requested: file_size,
                        actual,
                    });
                } else {
                    file_size
                };

                if mode == MapMode::Persistent && zero_init {
                    // Zeroing happens inside the filesystem, preferably by
                    // converting the range into unwritten extents.
                    if unsafe {
                        libc::fallocate(
                            file.as_raw_fd(),
                            libc::FALLOC_FL_ZERO_RANGE,
                            0,
                            mapped_size as libc::off_t,
                        )
                    } == -1
                    {
                        return Err(MapError::Io {
                            op: "zero",
                            path,
                            source: io::Error::last_os_error(),
                        });
                    }
                }
                (file, mapped_size)
            }
        };

        let mut prot = libc::PROT_READ | libc::PROT_WRITE;
        let mut flags = libc::MAP_PRIVATE;
        match mode {
            MapMode::Persistent => flags = libc::MAP_SHARED,
            MapMode::ReadOnly => prot = libc::PROT_READ,
            MapMode::CopyOnWrite => {}
        }

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_size,
                prot,
                flags,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MapError::Io {
                op: "map",
                path,
                source: io::Error::last_os_error(),
            });
        }

        debug!(
            path = %path.display(),
            mapped_size,
            block_size,
            ?mode,
            "mapped pool file"
        );

        let mapped_base = NonNull::new(base as *mut u8).expect("mmap returned null");
        let storage = SegregatedStorage::new();
        storage.initialize(mapped_base);

        Ok(Self {
            mapped_base,
            mapped_size,
            block_size,
            storage,
        })
    }

    /// Hand out one block, or `None` when the mapping is exhausted.
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        self.storage
            .allocate_from_region(self.mapped_base, self.mapped_size, self.block_size)
    }

    /// Return a block to the pool.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// pool and must not be in use.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        self.storage.deallocate(ptr);
    }

    /// The fixed size of every block this pool hands out.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total size of the mapping in bytes.
    pub fn mapped_size(&self) -> usize {
        self.mapped_size
    }

    /// Number of blocks the mapping is divided into.
    pub fn pool_blocks(&self) -> usize {
        self.mapped_size / self.block_size
    }
}

impl Drop for MappedPool {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mapped_base.as_ptr() as *mut libc::c_void, self.mapped_size);
        }
    }
}

impl BlockProvider for MappedPool {
    fn allocate_block(&self) -> Option<NonNull<u8>> {
        self.allocate()
    }

    fn block_size(&self) -> usize {
        self.block_size
    }
}
