//! Disk IO: the backing files of the torrent, piece verification, and the
//! optional resume state.
//!
//! All functions here perform synchronous IO and hashing and are expected to
//! be called on the blocking thread pool (`task::spawn_blocking`), never on
//! the async executor itself.

use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::Path,
    sync::Mutex,
};

use sha1::{Digest, Sha1};

use crate::{
    error::*,
    peer::encode_bitfield,
    storage::{FileInfo, FsLayout, StorageInfo},
    Bitfield, PieceIndex, Sha1Hash,
};

/// Computes the SHA-1 hash of a fully assembled piece and compares it to the
/// expected hash from the torrent metainfo.
pub(crate) fn verify(data: &[u8], expected: &Sha1Hash) -> bool {
    let digest = Sha1::digest(data);
    digest.as_slice() == expected
}

/// The torrent's backing files, opened up front, with piece granular
/// positioned reads and writes that split across file boundaries as needed.
pub(crate) struct TorrentFiles {
    info: StorageInfo,
    /// Each writer gets exclusive access to the file handle it needs,
    /// referring to it directly in the vector.
    files: Vec<Mutex<TorrentFile>>,
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

impl TorrentFiles {
    /// Creates the file system structure of the torrent and opens all file
    /// handles.
    ///
    /// For an archive, any subdirectories in the torrent are created first.
    /// Files are created (or grown) to their final length so that resume
    /// verification can read unwritten regions as zeros.
    pub fn open(info: StorageInfo) -> Result<Self> {
        let open_file = |file_info: FileInfo| -> Result<Mutex<TorrentFile>> {
            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&file_info.path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", file_info.path);
                    Error::Io(e)
                })?;
            if handle.metadata().map_err(Error::Io)?.len() < file_info.len {
                handle.set_len(file_info.len).map_err(Error::Io)?;
            }
            Ok(Mutex::new(TorrentFile {
                info: file_info,
                handle,
            }))
        };

        fs::create_dir_all(&info.download_dir).map_err(Error::Io)?;

        let files = match &info.layout {
            FsLayout::File(file) => {
                log::debug!(
                    "Torrent is a single {} byte file {:?}",
                    file.len,
                    file.path
                );
                vec![open_file(FileInfo {
                    path: info.download_dir.join(&file.path),
                    torrent_offset: file.torrent_offset,
                    len: file.len,
                })?]
            }
            FsLayout::Archive { files } => {
                debug_assert!(!files.is_empty());
                log::debug!("Torrent is an archive of {} files", files.len());
                let mut handles = Vec::with_capacity(files.len());
                for file in files.iter() {
                    let path = info.download_dir.join(&file.path);
                    if let Some(subdir) = path.parent() {
                        if !subdir.exists() {
                            log::info!("Creating torrent subdir {:?}", subdir);
                            fs::create_dir_all(subdir).map_err(Error::Io)?;
                        }
                    }
                    handles.push(open_file(FileInfo {
                        path,
                        torrent_offset: file.torrent_offset,
                        len: file.len,
                    })?);
                }
                handles
            }
        };

        Ok(Self { info, files })
    }

    /// Writes a fully assembled, verified piece to the file(s) it intersects.
    pub fn write_piece(
        &self,
        index: PieceIndex,
        data: &[u8],
    ) -> io::Result<()> {
        debug_assert_eq!(
            data.len() as u32,
            self.info.piece_len(index).unwrap_or(0)
        );

        let mut torrent_offset = self.info.piece_offset(index);
        let mut data = data;
        let file_range = self
            .info
            .files_intersecting_piece(index)
            .map_err(|_| invalid_index(index))?;

        for file in &self.files[file_range] {
            let file = file.lock().expect("file mutex poisoned");
            let slice =
                file.info.slice_at(torrent_offset, data.len() as u64);
            debug_assert!(slice.len > 0);
            let (head, tail) = data.split_at(slice.len as usize);
            file.handle.write_all_at(head, slice.offset)?;
            torrent_offset += slice.len;
            data = tail;
        }
        // the file range must cover the whole piece
        debug_assert!(data.is_empty());

        Ok(())
    }

    /// Reads back the piece at the given index.
    pub fn read_piece(&self, index: PieceIndex) -> io::Result<Vec<u8>> {
        let piece_len = self
            .info
            .piece_len(index)
            .map_err(|_| invalid_index(index))? as usize;
        let mut buf = vec![0; piece_len];

        let mut torrent_offset = self.info.piece_offset(index);
        let mut filled = 0;
        let file_range = self
            .info
            .files_intersecting_piece(index)
            .map_err(|_| invalid_index(index))?;

        for file in &self.files[file_range] {
            let file = file.lock().expect("file mutex poisoned");
            let slice = file
                .info
                .slice_at(torrent_offset, (piece_len - filled) as u64);
            file.handle.read_exact_at(
                &mut buf[filled..filled + slice.len as usize],
                slice.offset,
            )?;
            torrent_offset += slice.len;
            filled += slice.len as usize;
        }
        debug_assert_eq!(filled, piece_len);

        Ok(buf)
    }
}

fn invalid_index(index: PieceIndex) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("piece {} out of range", index),
    )
}

/// The resume file layout is the torrent's info hash followed by the
/// canonical wire bytes of the verified-piece bitfield. The bitfield is
/// never trusted as is: each claimed piece is re-hashed against disk before
/// its `have` flag is restored.
pub(crate) fn save_resume(
    path: &Path,
    info_hash: &Sha1Hash,
    own_pieces: &Bitfield,
) -> io::Result<()> {
    let mut buf = Vec::with_capacity(20 + own_pieces.len() / 8 + 1);
    buf.extend_from_slice(info_hash);
    buf.extend_from_slice(&encode_bitfield(own_pieces));
    fs::write(path, buf)
}

/// Loads the claimed verified-piece bitfield from a resume file. Returns
/// `None` if the file doesn't exist or belongs to a different torrent.
pub(crate) fn load_resume(
    path: &Path,
    info_hash: &Sha1Hash,
    piece_count: usize,
) -> io::Result<Option<Bitfield>> {
    let buf = match fs::read(path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if buf.len() != 20 + (piece_count + 7) / 8 || &buf[..20] != info_hash {
        log::warn!("Resume file {:?} does not match torrent, ignoring", path);
        return Ok(None);
    }
    let mut bitfield = Bitfield::from_slice(&buf[20..]);
    bitfield.truncate(piece_count);
    Ok(Some(bitfield))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::{bitvec, Msb0};
    use std::path::PathBuf;

    fn single_file_info(dir: PathBuf, piece_len: u32, total: u64) -> StorageInfo {
        let piece_count = ((total + piece_len as u64 - 1) / piece_len as u64)
            as usize;
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len: (total
                - piece_len as u64 * (piece_count as u64 - 1))
                as u32,
            total_len: total,
            download_dir: dir,
            layout: FsLayout::File(FileInfo {
                path: PathBuf::from("payload.bin"),
                len: total,
                torrent_offset: 0,
            }),
        }
    }

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(seed)).collect()
    }

    #[test]
    fn test_verify() {
        let data = patterned(1000, 3);
        let digest = Sha1::digest(&data);
        let mut hash = [0; 20];
        hash.copy_from_slice(&digest);
        assert!(verify(&data, &hash));
        assert!(!verify(&data[1..], &hash));
    }

    #[test]
    fn test_single_file_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let info = single_file_info(dir.path().to_path_buf(), 64, 64 * 2 + 10);
        let files = TorrentFiles::open(info).unwrap();

        let piece0 = patterned(64, 7);
        let piece2 = patterned(10, 11);
        files.write_piece(0, &piece0).unwrap();
        files.write_piece(2, &piece2).unwrap();

        assert_eq!(files.read_piece(0).unwrap(), piece0);
        assert_eq!(files.read_piece(2).unwrap(), piece2);
        // the unwritten piece reads back as zeros
        assert_eq!(files.read_piece(1).unwrap(), vec![0; 64]);
        assert!(files.read_piece(3).is_err());

        // and the bytes are really on disk where they should be
        let on_disk =
            fs::read(dir.path().join("payload.bin")).unwrap();
        assert_eq!(&on_disk[..64], &piece0[..]);
        assert_eq!(&on_disk[128..], &piece2[..]);
    }

    #[test]
    fn test_piece_straddling_files() {
        // 3 files of 10, 7 and 15 bytes; 16 byte pieces: piece 0 spans all
        // three files, piece 1 spans only the last
        let dir = tempfile::tempdir().unwrap();
        let files_info = vec![
            FileInfo {
                path: PathBuf::from("a"),
                len: 10,
                torrent_offset: 0,
            },
            FileInfo {
                path: PathBuf::from("sub/b"),
                len: 7,
                torrent_offset: 10,
            },
            FileInfo {
                path: PathBuf::from("c"),
                len: 15,
                torrent_offset: 17,
            },
        ];
        let info = StorageInfo {
            piece_count: 2,
            piece_len: 16,
            last_piece_len: 16,
            total_len: 32,
            download_dir: dir.path().to_path_buf(),
            layout: FsLayout::Archive { files: files_info },
        };
        let files = TorrentFiles::open(info).unwrap();

        let piece0 = patterned(16, 5);
        let piece1 = patterned(16, 9);
        files.write_piece(0, &piece0).unwrap();
        files.write_piece(1, &piece1).unwrap();

        assert_eq!(files.read_piece(0).unwrap(), piece0);
        assert_eq!(files.read_piece(1).unwrap(), piece1);

        // check the split against the raw files
        let a = fs::read(dir.path().join("a")).unwrap();
        let b = fs::read(dir.path().join("sub/b")).unwrap();
        let c = fs::read(dir.path().join("c")).unwrap();
        assert_eq!(a, &piece0[..10]);
        assert_eq!(b, &piece0[10..16]
            .iter()
            .chain(&piece1[..1])
            .copied()
            .collect::<Vec<_>>()[..]);
        assert_eq!(c, &piece1[1..]);
    }

    #[test]
    fn test_resume_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume");
        let info_hash = [0x5a; 20];

        let mut own = bitvec![u8, Msb0; 0; 11];
        own.set(0, true);
        own.set(7, true);
        own.set(10, true);

        save_resume(&path, &info_hash, &own).unwrap();
        let loaded = load_resume(&path, &info_hash, 11).unwrap().unwrap();
        assert_eq!(loaded, own);

        // a different torrent's resume data is ignored
        assert!(load_resume(&path, &[0x11; 20], 11).unwrap().is_none());
        // as is a piece count mismatch
        assert!(load_resume(&path, &info_hash, 64).unwrap().is_none());
        // a missing file is not an error
        assert!(load_resume(&dir.path().join("nope"), &info_hash, 11)
            .unwrap()
            .is_none());
    }
}
