//! Parsing of `.torrent` files into the subset of metadata the engine
//! consumes: the info hash, piece hashes and lengths, the file layout, and
//! the announce URL.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::{
    error::*,
    storage::{FileInfo, FsLayout},
    PieceIndex, Sha1Hash,
};

/// The torrent metadata, in the cooked form used by the rest of the engine.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The name of the torrent: the file name for single file torrents, the
    /// root directory name for archives.
    pub name: String,
    /// The SHA-1 of the bencoded info dictionary, identifying the torrent on
    /// the wire.
    pub info_hash: Sha1Hash,
    /// The concatenation of all 20-byte piece hashes.
    pub piece_hashes: Vec<u8>,
    /// The nominal piece length. The last piece may be shorter.
    pub piece_len: u32,
    /// The HTTP announce URL of the torrent's tracker, if any.
    pub announce: Option<String>,
    /// The file layout of the download.
    pub(crate) layout: FsLayout,
}

impl Metainfo {
    /// Parses a bencoded `.torrent` file.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: raw::Metainfo = serde_bencode::from_bytes(buf)?;

        if raw.info.pieces.len() % 20 != 0 {
            log::warn!("torrent piece hashes not a multiple of 20 bytes");
            return Err(Error::InvalidMetainfo);
        }
        if raw.info.piece_length == 0
            || raw.info.piece_length > u32::MAX as u64
        {
            return Err(Error::InvalidMetainfo);
        }

        // the info hash is the digest of the info dict exactly as bencoded
        let info_bytes = serde_bencode::to_bytes(&raw.info)?;
        let digest = Sha1::digest(&info_bytes);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);

        let layout = match (&raw.info.length, &raw.info.files) {
            (Some(len), None) => FsLayout::File(FileInfo {
                path: PathBuf::from(&raw.info.name),
                len: *len,
                torrent_offset: 0,
            }),
            (None, Some(files)) if !files.is_empty() => {
                let mut torrent_offset = 0;
                let mut file_infos = Vec::with_capacity(files.len());
                for file in files {
                    let mut path = PathBuf::new();
                    for component in &file.path {
                        // a path component that climbs out of the download
                        // directory is hostile input
                        if component == ".."
                            || component.contains(std::path::MAIN_SEPARATOR)
                        {
                            log::warn!(
                                "torrent file path escapes download dir: {:?}",
                                file.path
                            );
                            return Err(Error::InvalidMetainfo);
                        }
                        path.push(component);
                    }
                    file_infos.push(FileInfo {
                        path,
                        len: file.length,
                        torrent_offset,
                    });
                    torrent_offset += file.length;
                }
                FsLayout::Archive { files: file_infos }
            }
            // exactly one of `length` and `files` must be present
            _ => return Err(Error::InvalidMetainfo),
        };

        let metainfo = Self {
            name: raw.info.name,
            info_hash,
            piece_hashes: raw.info.pieces.into_vec(),
            piece_len: raw.info.piece_length as u32,
            announce: raw.announce,
            layout,
        };

        if metainfo.total_len() == 0 {
            return Err(Error::InvalidMetainfo);
        }
        // the hash count must agree with the length derived piece count
        if metainfo.piece_hashes.len() / 20 != metainfo.piece_count() {
            log::warn!(
                "torrent has {} piece hashes but {} pieces",
                metainfo.piece_hashes.len() / 20,
                metainfo.piece_count()
            );
            return Err(Error::InvalidMetainfo);
        }

        Ok(metainfo)
    }

    /// Creates the metainfo of a single file torrent from its parts. Useful
    /// for tests and for torrents obtained out of band.
    pub fn new_single_file(
        name: impl Into<String>,
        piece_len: u32,
        piece_hashes: Vec<u8>,
        total_len: u64,
        announce: Option<String>,
    ) -> Result<Self> {
        let name = name.into();
        if piece_len == 0 || total_len == 0 || piece_hashes.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo);
        }
        let metainfo = Self {
            layout: FsLayout::File(FileInfo {
                path: PathBuf::from(&name),
                len: total_len,
                torrent_offset: 0,
            }),
            name,
            // computed over a synthetic info dict so that out of band
            // torrents still get a stable identity
            info_hash: {
                let mut hasher = Sha1::new();
                hasher.update(&piece_hashes);
                hasher.update(piece_len.to_be_bytes());
                hasher.update(total_len.to_be_bytes());
                let mut hash = [0; 20];
                hash.copy_from_slice(&hasher.finalize());
                hash
            },
            piece_hashes,
            piece_len,
            announce,
        };
        if metainfo.piece_hashes.len() / 20 != metainfo.piece_count() {
            return Err(Error::InvalidMetainfo);
        }
        Ok(metainfo)
    }

    /// The total length of the download, in bytes.
    pub fn total_len(&self) -> u64 {
        self.layout.total_len()
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        let total = self.total_len();
        let piece_len = self.piece_len as u64;
        ((total + piece_len - 1) / piece_len) as usize
    }

    /// The expected SHA-1 hash of the piece at the given index.
    pub fn piece_hash(&self, index: PieceIndex) -> Result<Sha1Hash> {
        let pos = index * 20;
        if pos + 20 > self.piece_hashes.len() {
            return Err(Error::InvalidPieceIndex);
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.piece_hashes[pos..pos + 20]);
        Ok(hash)
    }
}

/// The serde facing types, mirroring the bencode structure of a `.torrent`
/// file. Field order follows the bencode dictionary key order so that
/// re-serializing the info dict reproduces the hashed bytes.
mod raw {
    use serde_bytes::ByteBuf;

    #[derive(Debug, Deserialize)]
    pub(super) struct Metainfo {
        pub announce: Option<String>,
        pub info: Info,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub(super) struct Info {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub files: Option<Vec<File>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub length: Option<u64>,
        pub name: String,
        #[serde(rename = "piece length")]
        pub piece_length: u64,
        pub pieces: ByteBuf,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub private: Option<u8>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub(super) struct File {
        pub length: u64,
        pub path: Vec<String>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A tiny but complete single file torrent: two 16 KiB pieces worth of
    // hashes and an announce URL.
    fn single_file_bytes() -> Vec<u8> {
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&[0xaa; 20]);
        pieces.extend_from_slice(&[0xbb; 20]);
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce24:http://tracker.test:8080");
        buf.extend_from_slice(b"4:infod6:lengthi32768e4:name8:test.bin");
        buf.extend_from_slice(b"12:piece lengthi16384e6:pieces40:");
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn test_parse_single_file() {
        let metainfo = Metainfo::from_bytes(&single_file_bytes()).unwrap();
        assert_eq!(metainfo.name, "test.bin");
        assert_eq!(metainfo.piece_len, 16384);
        assert_eq!(metainfo.total_len(), 32768);
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.piece_hash(0).unwrap(), [0xaa; 20]);
        assert_eq!(metainfo.piece_hash(1).unwrap(), [0xbb; 20]);
        assert!(metainfo.piece_hash(2).is_err());
        assert_eq!(
            metainfo.announce.as_deref(),
            Some("http://tracker.test:8080")
        );
        assert!(!metainfo.layout.is_archive());
    }

    #[test]
    fn test_parse_multi_file() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod");
        buf.extend_from_slice(
            b"5:filesl\
              d6:lengthi10e4:pathl1:a1:bee\
              d6:lengthi6e4:pathl1:cee\
              e",
        );
        buf.extend_from_slice(b"4:name4:arch12:piece lengthi16e6:pieces20:");
        buf.extend_from_slice(&[0xcc; 20]);
        buf.extend_from_slice(b"ee");

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.name, "arch");
        assert_eq!(metainfo.total_len(), 16);
        assert_eq!(metainfo.piece_count(), 1);
        assert!(metainfo.layout.is_archive());
        assert!(metainfo.announce.is_none());
    }

    #[test]
    fn test_info_hash_is_stable() {
        let a = Metainfo::from_bytes(&single_file_bytes()).unwrap();
        let b = Metainfo::from_bytes(&single_file_bytes()).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
        assert_ne!(a.info_hash, [0; 20]);
    }

    #[test]
    fn test_rejects_inconsistent_hash_count() {
        // one piece hash but 32 KiB of data at 16 KiB piece length
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod6:lengthi32768e4:name1:x");
        buf.extend_from_slice(b"12:piece lengthi16384e6:pieces20:");
        buf.extend_from_slice(&[0xdd; 20]);
        buf.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo)
        ));
    }

    #[test]
    fn test_rejects_path_escape() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod");
        buf.extend_from_slice(b"5:filesld6:lengthi4e4:pathl2:..1:aeee");
        buf.extend_from_slice(b"4:name1:x12:piece lengthi16e6:pieces20:");
        buf.extend_from_slice(&[0xee; 20]);
        buf.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo)
        ));
    }
}
