use std::{fmt, fs, path::Path};

use thiserror::Error;

use crate::{hash::calculate_sha1_hash, types::Sha1Hash};

pub(crate) type Result<T> = std::result::Result<T, MetaInfoError>;

const HASH_LEN: usize = 20;

#[derive(Error, Debug)]
pub enum MetaInfoError {
    #[error("Failed to parse .torrent file: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("Received invalid pieces string of length {0}")]
    InvalidPieces(usize),

    #[error("Failed to read .torrent file")]
    Io(#[from] std::io::Error),
}

/// Identity and shape of the content described by a `.torrent` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    announce: String,
    info_hash: Sha1Hash,
    info: Info,
    comment: Option<String>,
    created_by: Option<String>,
    creation_date: Option<i64>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Info {
    // Total size of the content, in bytes.
    pub length: u64,
    pub name: String,
    // How many bytes each piece is, the last one may be shorter.
    pub piece_length: u64,
    // SHA-1 of every piece in piece index order.
    pub pieces: Vec<Sha1Hash>,
}

impl TorrentFile {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let metainfo: raw::MetaInfo = serde_bencode::from_bytes(bytes)?;

        // The info hash must cover the info dictionary as it was decoded,
        // including keys we never interpret, so hash the generic value and
        // read the typed fields back out of the same canonical bytes.
        let info_bytes = serde_bencode::to_bytes(&metainfo.info)?;
        let info_hash = calculate_sha1_hash(&info_bytes);
        let info: raw::Info = serde_bencode::from_bytes(&info_bytes)?;
        let pieces = info.split_piece_hashes()?;

        let torrent = Self {
            announce: metainfo.announce,
            info_hash,
            info: Info {
                length: info.length,
                name: info.name,
                piece_length: info.piece_length,
                pieces,
            },
            comment: metainfo.comment,
            created_by: metainfo.created_by,
            creation_date: metainfo.creation_date,
        };
        log::debug!(
            "parsed torrent {} ({}, {} pieces)",
            torrent.info_hash_hex(),
            torrent.info.name,
            torrent.num_pieces()
        );
        Ok(torrent)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn announce(&self) -> &str {
        &self.announce
    }

    pub fn info_hash(&self) -> &Sha1Hash {
        &self.info_hash
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn info(&self) -> &Info {
        &self.info
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn created_by(&self) -> Option<&str> {
        self.created_by.as_deref()
    }

    /// Seconds since the Unix epoch.
    pub fn creation_date(&self) -> Option<i64> {
        self.creation_date
    }

    pub fn num_pieces(&self) -> usize {
        self.info.pieces.len()
    }

    /// Size in bytes of the piece at `index`, `None` when there is no such piece.
    pub fn piece_len(&self, index: usize) -> Option<u64> {
        if index >= self.num_pieces() {
            return None;
        }
        let begin = (index as u64).checked_mul(self.info.piece_length)?;
        let end = begin
            .saturating_add(self.info.piece_length)
            .min(self.info.length);
        Some(end.saturating_sub(begin))
    }
}

impl fmt::Debug for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Info")
            .field("length", &self.length)
            .field("name", &self.name)
            .field("piece_length", &self.piece_length)
            .field("pieces", &format_args!("<{} hashes>", self.pieces.len()))
            .finish()
    }
}

mod raw {
    use serde::Deserialize;
    use serde_bencode::value::Value;
    use serde_bytes::ByteBuf;

    use super::*;

    // implementation of https://bittorrent.org/beps/bep_0003.html#metainfo-files
    #[derive(Debug, Deserialize)]
    pub struct MetaInfo {
        pub announce: String,
        // Kept generic so re-encoding reproduces every key of the original.
        pub info: Value,
        pub comment: Option<String>,
        #[serde(rename = "created by")]
        pub created_by: Option<String>,
        #[serde(rename = "creation date")]
        pub creation_date: Option<i64>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Info {
        pub length: u64,
        pub name: String,
        #[serde(rename = "piece length")]
        pub piece_length: u64,
        // The SHA1 hash of each piece, concatenated together.
        pub pieces: ByteBuf,
    }

    impl Info {
        pub fn split_piece_hashes(&self) -> Result<Vec<Sha1Hash>> {
            if self.pieces.len() % HASH_LEN != 0 {
                return Err(MetaInfoError::InvalidPieces(self.pieces.len()));
            }
            Ok(self
                .pieces
                .chunks_exact(HASH_LEN)
                .map(|chunk| {
                    let mut hash = [0u8; HASH_LEN];
                    hash.copy_from_slice(chunk);
                    hash
                })
                .collect())
        }
    }
}
