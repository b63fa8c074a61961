//! Descriptor parser
//!
//! Decodes bencoded torrent metainfo and magnet URIs into a
//! [`TransferDescriptor`]. Stateless; every call stands on its own.

use serde::Deserialize;
use serde_bencode::value::Value;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::types::{ContentId, FileEntry, TransferDescriptor};

/// Length of one SHA-1 piece hash inside the `pieces` string
const PIECE_HASH_LEN: usize = 20;

#[derive(Debug, Deserialize)]
struct MetaInfo {
    info: Info,
    #[serde(default)]
    announce: Option<String>,
    #[serde(default, rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
}

#[derive(Debug, Deserialize)]
struct Info {
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u64,
    #[serde(default)]
    length: Option<u64>,
    #[serde(default)]
    files: Option<Vec<InfoFile>>,
}

#[derive(Debug, Deserialize)]
struct InfoFile {
    length: u64,
    path: Vec<String>,
}

/// Parse torrent metainfo bytes
pub fn parse(bytes: &[u8]) -> Result<TransferDescriptor> {
    let root: Value = serde_bencode::from_bytes(bytes)
        .map_err(|e| Error::Parse(format!("malformed bencode: {}", e)))?;

    let root = match root {
        Value::Dict(dict) => dict,
        _ => return Err(Error::Parse("metainfo is not a dictionary".to_string())),
    };
    let info_value = root
        .get(b"info".as_slice())
        .ok_or_else(|| Error::Parse("missing info dictionary".to_string()))?;
    let info_dict = match info_value {
        Value::Dict(dict) => dict,
        _ => return Err(Error::Parse("info is not a dictionary".to_string())),
    };

    match info_dict.get(b"pieces".as_slice()) {
        Some(Value::Bytes(pieces)) if !pieces.is_empty() && pieces.len() % PIECE_HASH_LEN == 0 => {}
        Some(_) => {
            return Err(Error::Parse(format!(
                "pieces must be a non-empty multiple of {} bytes",
                PIECE_HASH_LEN
            )))
        }
        None => return Err(Error::Parse("missing pieces".to_string())),
    }

    // Dictionaries re-encode with sorted keys, so this is the canonical form.
    let canonical_info = serde_bencode::to_bytes(info_value)
        .map_err(|e| Error::Parse(format!("failed to encode info dictionary: {}", e)))?;
    let content_id = ContentId::from_slice(&Sha1::digest(&canonical_info))?;

    let meta: MetaInfo = serde_bencode::from_bytes(bytes)
        .map_err(|e| Error::Parse(format!("invalid metainfo: {}", e)))?;

    let name = meta.info.name.trim().to_string();
    if name.is_empty() {
        return Err(Error::Parse("name must not be empty".to_string()));
    }
    if meta.info.piece_length == 0 {
        return Err(Error::Parse("piece length must be positive".to_string()));
    }

    let files = match (meta.info.length, meta.info.files) {
        (Some(length), None) => vec![FileEntry {
            path: vec![name.clone()],
            length,
        }],
        (None, Some(files)) if !files.is_empty() => files
            .into_iter()
            .map(|f| {
                validate_path(&f.path)?;
                Ok(FileEntry {
                    path: f.path,
                    length: f.length,
                })
            })
            .collect::<Result<Vec<_>>>()?,
        (None, Some(_)) => return Err(Error::Parse("file list is empty".to_string())),
        (Some(_), Some(_)) => {
            return Err(Error::Parse(
                "metainfo has both length and files".to_string(),
            ))
        }
        (None, None) => {
            return Err(Error::Parse(
                "metainfo has neither length nor files".to_string(),
            ))
        }
    };

    // Lengths are stored as SQLite integers, so the total must fit an i64.
    let total_length = files
        .iter()
        .try_fold(0u64, |total, f| total.checked_add(f.length))
        .filter(|total| *total <= i64::MAX as u64)
        .ok_or_else(|| Error::Parse("total length overflows".to_string()))?;

    let mut trackers = Vec::new();
    let tiers = meta.announce_list.unwrap_or_default();
    for url in meta.announce.into_iter().chain(tiers.into_iter().flatten()) {
        let url = url.trim().to_string();
        if !url.is_empty() && !trackers.contains(&url) {
            trackers.push(url);
        }
    }

    Ok(TransferDescriptor {
        name,
        content_id,
        total_length,
        piece_length: meta.info.piece_length,
        trackers,
        files,
    })
}

fn validate_path(segments: &[String]) -> Result<()> {
    if segments.is_empty() {
        return Err(Error::Parse("file path is empty".to_string()));
    }
    for segment in segments {
        if segment.is_empty() || segment == "." || segment == ".." || segment.contains('/') {
            return Err(Error::Parse(format!(
                "invalid file path segment: {:?}",
                segment
            )));
        }
    }
    Ok(())
}

/// Parse a magnet URI
///
/// Only the content id is authoritative; the name and length are advisory
/// until the engine resolves the full metadata.
pub fn parse_magnet(uri: &str) -> Result<TransferDescriptor> {
    let url = url::Url::parse(uri.trim())
        .map_err(|e| Error::InvalidInput(format!("invalid magnet URI: {}", e)))?;
    if url.scheme() != "magnet" {
        return Err(Error::InvalidInput(format!(
            "expected magnet scheme, got {}",
            url.scheme()
        )));
    }

    let mut content_id = None;
    let mut name = None;
    let mut total_length: u64 = 0;
    let mut trackers: Vec<String> = Vec::new();

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "xt" if content_id.is_none() => {
                if let Some(hash) = value.strip_prefix("urn:btih:") {
                    content_id = Some(hash.parse::<ContentId>()?);
                }
            }
            "dn" => {
                let dn = value.trim();
                if !dn.is_empty() {
                    name = Some(dn.to_string());
                }
            }
            "xl" => {
                total_length = value
                    .parse()
                    .map_err(|_| Error::InvalidInput(format!("invalid xl value: {}", value)))?;
            }
            "tr" => {
                let tracker = value.trim().to_string();
                if !tracker.is_empty() && !trackers.contains(&tracker) {
                    trackers.push(tracker);
                }
            }
            _ => {}
        }
    }

    let content_id = content_id
        .ok_or_else(|| Error::InvalidInput("magnet URI has no urn:btih topic".to_string()))?;

    Ok(TransferDescriptor {
        name: name.unwrap_or_else(|| content_id.to_hex()),
        content_id,
        total_length,
        piece_length: 0,
        trackers,
        files: Vec::new(),
    })
}
