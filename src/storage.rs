//! The model of a torrent's on-disk layout: which files exist, how long they
//! are, and which files a given piece's bytes land in.

use std::{ops::Range, path::PathBuf};

use crate::{error::*, metainfo::Metainfo, FileIndex, PieceIndex};

/// Information about a torrent's file.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The file's relative path from the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in
    /// torrent are viewed as a single contiguous byte array. This is always
    /// 0 for a single file torrent.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// Returns a range that represents the file's first and one past the last
    /// bytes' offsets in the torrent.
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_end_offset()
    }

    /// Returns the file's one past the last byte's offset in the torrent.
    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Returns the part of this file that overlaps with the byte range
    /// starting at `torrent_offset`, as a (file offset, length) slice.
    ///
    /// The range's length may exceed the file, in which case the returned
    /// slice is clipped at the end of the file.
    ///
    /// # Panics
    ///
    /// Panics if `torrent_offset` falls before the file's first or after its
    /// last byte, as that is an engine logic error.
    pub(crate) fn slice_at(&self, torrent_offset: u64, len: u64) -> FileSlice {
        assert!(
            torrent_offset >= self.torrent_offset,
            "byte range starts before file"
        );
        let torrent_end_offset = self.torrent_end_offset();
        assert!(
            torrent_offset < torrent_end_offset,
            "byte range starts past file end"
        );

        FileSlice {
            offset: torrent_offset - self.torrent_offset,
            len: len.min(torrent_end_offset - torrent_offset),
        }
    }
}

/// The location of a contiguous range of bytes within one file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    /// The byte offset in file, relative to the file's start.
    pub offset: u64,
    /// The length of the slice, in bytes.
    pub len: u64,
}

/// Information about a torrent's storage details, such as the piece count and
/// length, download length, etc.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may be shorter than the
    /// nominal length if the download size is not an exact multiple of the
    /// piece length.
    pub last_piece_len: u32,
    /// The sum of the lengths of all files in the torrent.
    pub total_len: u64,
    /// The download destination directory of the torrent.
    ///
    /// Single file torrents are placed directly in here. Archives get their
    /// own subdirectory named after the torrent, so a multi-entry torrent
    /// doesn't scatter its contents across the download directory.
    pub download_dir: PathBuf,
    /// The paths and lengths of the torrent files.
    pub layout: FsLayout,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let total_len = metainfo.layout.total_len();
        let piece_len = metainfo.piece_len;
        let last_piece_len =
            total_len - piece_len as u64 * (piece_count - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        let download_dir = if metainfo.layout.is_archive() {
            download_dir.join(&metainfo.name)
        } else {
            download_dir
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            total_len,
            download_dir,
            layout: metainfo.layout.clone(),
        }
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::error!("piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex)
        }
    }

    /// Returns the offset of the piece's first byte in the torrent.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }

    /// Returns the zero-based indices of the files of torrent that intersect
    /// with the piece.
    pub fn files_intersecting_piece(
        &self,
        index: PieceIndex,
    ) -> Result<Range<FileIndex>> {
        let piece_offset = self.piece_offset(index);
        let piece_end = piece_offset + self.piece_len(index)? as u64;
        Ok(self.layout.files_intersecting_bytes(piece_offset..piece_end))
    }
}

/// Defines the file system structure of the download.
#[derive(Clone, Debug)]
pub(crate) enum FsLayout {
    /// This is a single file download.
    File(FileInfo),
    /// The download is for multiple files, possibly with nested directories.
    Archive {
        /// A flattened list of all files in the archive, ordered by their
        /// offset in the torrent.
        files: Vec<FileInfo>,
    },
}

impl FsLayout {
    /// Returns true if the download is for an archive.
    pub fn is_archive(&self) -> bool {
        matches!(self, Self::Archive { .. })
    }

    /// Returns the total download size in bytes.
    ///
    /// Note that this is an O(n) operation for archive downloads, where n is
    /// the number of files, so the return value should ideally be cached.
    pub fn total_len(&self) -> u64 {
        match self {
            Self::File(file) => file.len,
            Self::Archive { files } => files.iter().map(|f| f.len).sum(),
        }
    }

    /// Returns the files that overlap with the given left-inclusive range of
    /// bytes, where `byte_range.start` is the offset and `byte_range.end` is
    /// one past the last byte offset.
    pub fn files_intersecting_bytes(
        &self,
        byte_range: Range<u64>,
    ) -> Range<FileIndex> {
        match self {
            // a single file torrent maps every valid byte range to that file
            Self::File(_) => 0..1,
            Self::Archive { files } => {
                // find the file holding the first byte of the range
                let first = match files
                    .iter()
                    .position(|file| {
                        file.byte_range().contains(&byte_range.start)
                    }) {
                    Some(index) => index,
                    None => return 0..0,
                };

                let mut file_range = first..first + 1;

                // extend over every subsequent file whose first byte still
                // falls inside the range (files are ordered by offset)
                for (index, file) in files.iter().enumerate().skip(first + 1) {
                    if !byte_range.contains(&file.torrent_offset) {
                        break;
                    }
                    file_range.end = index + 1;
                }

                file_range
            }
        }
    }
}
