use crate::bencode::{decode_with_span, BencodeValue};
use crate::error::{BittorrentError, Result};
use crate::peer::InfoHash;
use sha1::{Digest, Sha1};

fn invalid(msg: &str) -> BittorrentError {
    BittorrentError::InvalidTorrent(msg.to_string())
}

/// A file inside a multi-file torrent. Only used for display: pieces are
/// addressed over one flat byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: Vec<String>,
    pub length: u64,
}

/// The part of the metainfo the download engine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    pub name: String,
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub length: u64,
    pub files: Vec<FileInfo>,
}

impl TorrentInfo {
    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte range `[begin, end)` of a piece in the flat file.
    pub fn piece_bounds(&self, index: u32) -> (u64, u64) {
        let begin = index as u64 * self.piece_length;
        let end = (begin + self.piece_length).min(self.length);
        (begin, end)
    }

    pub fn piece_size(&self, index: u32) -> usize {
        let (begin, end) = self.piece_bounds(index);
        end.saturating_sub(begin) as usize
    }

    fn from_bencode(value: &BencodeValue) -> Result<Self> {
        let name = value
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| invalid("missing 'name'"))?
            .to_string();

        let piece_length = value
            .get("piece length")
            .and_then(|v| v.as_integer())
            .filter(|&l| l > 0)
            .ok_or_else(|| invalid("missing or non-positive 'piece length'"))? as u64;

        let pieces = value
            .get("pieces")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| invalid("missing 'pieces'"))?;
        if pieces.len() % 20 != 0 {
            return Err(invalid("'pieces' length must be a multiple of 20"));
        }
        let piece_hashes = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect::<Vec<_>>();

        let files = match (value.get("length"), value.get("files")) {
            (Some(length), _) => vec![FileInfo {
                path: vec![name.clone()],
                length: length
                    .as_integer()
                    .filter(|&l| l >= 0)
                    .ok_or_else(|| invalid("invalid 'length'"))? as u64,
            }],
            (None, Some(files)) => files
                .as_list()
                .ok_or_else(|| invalid("'files' must be a list"))?
                .iter()
                .map(FileInfo::from_bencode)
                .collect::<Result<Vec<_>>>()?,
            (None, None) => return Err(invalid("missing 'length' or 'files'")),
        };
        let length = files.iter().map(|f| f.length).sum::<u64>();

        let expected = length.div_ceil(piece_length) as usize;
        if expected != piece_hashes.len() {
            return Err(BittorrentError::InvalidTorrent(format!(
                "{} bytes need {} pieces, torrent lists {}",
                length,
                expected,
                piece_hashes.len()
            )));
        }

        Ok(Self {
            name,
            piece_length,
            piece_hashes,
            length,
            files,
        })
    }
}

impl FileInfo {
    fn from_bencode(value: &BencodeValue) -> Result<Self> {
        let length = value
            .get("length")
            .and_then(|v| v.as_integer())
            .filter(|&l| l >= 0)
            .ok_or_else(|| invalid("missing file 'length'"))? as u64;
        let path = value
            .get("path")
            .and_then(|v| v.as_list())
            .ok_or_else(|| invalid("missing file 'path'"))?
            .iter()
            .map(|part| {
                part.as_str()
                    .map(String::from)
                    .ok_or_else(|| invalid("invalid path component"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { path, length })
    }
}

/// Top-level metainfo structure from a .torrent file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub announce: Option<String>,
    pub info: TorrentInfo,
    /// SHA1 hash of the bencoded info dictionary
    pub info_hash: InfoHash,
}

impl Metainfo {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (root, info_span) = decode_with_span(data, &["info"])?;
        let info_span = info_span.ok_or_else(|| invalid("missing 'info'"))?;
        let info_value = root.get("info").ok_or_else(|| invalid("missing 'info'"))?;
        if info_value.as_dict().is_none() {
            return Err(invalid("'info' must be a dictionary"));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&Sha1::digest(&data[info_span]));

        Ok(Self {
            announce: root.get("announce").and_then(|v| v.as_str()).map(String::from),
            info: TorrentInfo::from_bencode(info_value)?,
            info_hash,
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Bencode a single-file torrent for `content`.
    pub(crate) fn torrent_bytes(name: &str, content: &[u8], piece_length: usize) -> Vec<u8> {
        let mut pieces = Vec::new();
        for chunk in content.chunks(piece_length) {
            pieces.extend_from_slice(&Sha1::digest(chunk));
        }

        let mut info = Vec::new();
        info.extend_from_slice(format!("d6:lengthi{}e", content.len()).as_bytes());
        info.extend_from_slice(format!("4:name{}:{}", name.len(), name).as_bytes());
        info.extend_from_slice(format!("12:piece lengthi{}e", piece_length).as_bytes());
        info.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        info.extend_from_slice(&pieces);
        info.push(b'e');

        let mut torrent = b"d8:announce15:http://tracker/4:info".to_vec();
        torrent.extend_from_slice(&info);
        torrent.push(b'e');
        torrent
    }

    #[test]
    fn test_single_file_torrent() {
        let content: Vec<u8> = (0..100u8).collect();
        let raw = torrent_bytes("movie.mkv", &content, 32);
        let meta = Metainfo::from_bytes(&raw).unwrap();

        assert_eq!(meta.announce.as_deref(), Some("http://tracker/"));
        assert_eq!(meta.info.name, "movie.mkv");
        assert_eq!(meta.info.length, 100);
        assert_eq!(meta.info.num_pieces(), 4);
        assert_eq!(meta.info.piece_bounds(3), (96, 100));
        assert_eq!(meta.info.piece_size(3), 4);
        assert_eq!(meta.info.piece_size(1), 32);

        let start = raw.windows(6).position(|w| w == b"4:info").unwrap() + 6;
        let expected = Sha1::digest(&raw[start..raw.len() - 1]);
        assert_eq!(meta.info_hash.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_multi_file_torrent_is_flattened() {
        let raw = b"d4:infod5:filesld6:lengthi5e4:pathl1:aeed6:lengthi7e4:pathl3:dir1:beee4:name3:top12:piece lengthi8e6:pieces40:\
0123456789012345678901234567890123456789ee";
        let meta = Metainfo::from_bytes(raw).unwrap();
        assert_eq!(meta.info.length, 12);
        assert_eq!(meta.info.files.len(), 2);
        assert_eq!(meta.info.files[1].path, vec!["dir".to_string(), "b".to_string()]);
        assert_eq!(meta.info.piece_bounds(1), (8, 12));
    }

    #[test]
    fn test_piece_count_must_match_length() {
        let raw = b"d4:infod6:lengthi100e4:name1:a12:piece lengthi32e6:pieces20:01234567890123456789ee";
        assert!(matches!(
            Metainfo::from_bytes(raw),
            Err(BittorrentError::InvalidTorrent(_))
        ));
    }
}
