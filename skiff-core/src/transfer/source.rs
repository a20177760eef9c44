//! Download source URIs: validation, normalization and magnet parsing.

use std::fmt;
use std::path::PathBuf;

use data_encoding::BASE32;
use serde::{Serialize, Serializer};
use url::Url;

use super::InfoHash;
use super::state::RejectionReason;

/// URI schemes a torrent source may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceScheme {
    Http,
    Https,
    Magnet,
    File,
}

impl SourceScheme {
    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(SourceScheme::Http),
            "https" => Some(SourceScheme::Https),
            "magnet" => Some(SourceScheme::Magnet),
            "file" => Some(SourceScheme::File),
            _ => None,
        }
    }

    pub fn is_http(self) -> bool {
        matches!(self, SourceScheme::Http | SourceScheme::Https)
    }
}

/// A validated source URI in canonical form.
///
/// Two spellings of the same source compare equal: scheme and host are
/// lowercased, fragments are dropped and magnets are reduced to their
/// info-hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceUri {
    normalized: String,
    scheme: SourceScheme,
    info_hash: Option<InfoHash>,
}

impl SourceUri {
    /// Validates and normalizes a raw URI.
    ///
    /// # Errors
    /// - `RejectionReason::MalformedUri` - Not a URI, or a magnet without a usable hash
    /// - `RejectionReason::UnsupportedScheme` - Scheme other than http, https, magnet or file
    pub fn parse(raw: &str) -> Result<Self, RejectionReason> {
        let repaired = repair_over_encoded(raw.trim());
        let mut url = Url::parse(&repaired).map_err(|_| RejectionReason::MalformedUri)?;
        let scheme =
            SourceScheme::from_scheme(url.scheme()).ok_or(RejectionReason::UnsupportedScheme)?;

        match scheme {
            SourceScheme::Magnet => {
                let magnet = MagnetLink::parse(&repaired).ok_or(RejectionReason::MalformedUri)?;
                Ok(Self {
                    normalized: format!("magnet:?xt=urn:btih:{}", magnet.info_hash),
                    scheme,
                    info_hash: Some(magnet.info_hash),
                })
            }
            SourceScheme::Http | SourceScheme::Https => {
                if url.host_str().is_none() {
                    return Err(RejectionReason::MalformedUri);
                }
                url.set_fragment(None);
                Ok(Self {
                    normalized: url.to_string(),
                    scheme,
                    info_hash: None,
                })
            }
            SourceScheme::File => {
                url.set_fragment(None);
                url.set_query(None);
                Ok(Self {
                    normalized: url.to_string(),
                    scheme,
                    info_hash: None,
                })
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    pub fn scheme(&self) -> SourceScheme {
        self.scheme
    }

    /// Info-hash named by a magnet source.
    pub fn info_hash(&self) -> Option<InfoHash> {
        self.info_hash
    }

    /// Local path of a `file:` source.
    pub fn file_path(&self) -> Option<PathBuf> {
        if self.scheme != SourceScheme::File {
            return None;
        }
        Url::parse(&self.normalized).ok()?.to_file_path().ok()
    }

    /// Last path segment, percent-decoded, for naming a transfer before its
    /// metadata is known.
    pub fn file_name(&self) -> Option<String> {
        let url = Url::parse(&self.normalized).ok()?;
        let segment = url.path_segments()?.next_back()?;
        if segment.is_empty() {
            return None;
        }
        urlencoding::decode(segment).ok().map(|name| name.into_owned())
    }
}

impl fmt::Display for SourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}

impl Serialize for SourceUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.normalized)
    }
}

/// Rewrites the over-encoded `urn%3Abtih%3A` some launchers produce.
pub fn repair_over_encoded(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    match lower.find("urn%3abtih%3a") {
        Some(start) => {
            let end = start + "urn%3abtih%3a".len();
            format!("{}urn:btih:{}", &raw[..start], &raw[end..])
        }
        None => raw.to_string(),
    }
}

/// Parsed magnet link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

impl MagnetLink {
    /// Parses a magnet URI, accepting hex and base32 v1 hashes and hex v2
    /// multihashes.
    pub fn parse(uri: &str) -> Option<Self> {
        let repaired = repair_over_encoded(uri.trim());
        let url = Url::parse(&repaired).ok()?;
        if url.scheme() != "magnet" {
            return None;
        }

        let info_hash = url
            .query_pairs()
            .filter(|(key, _)| key == "xt")
            .find_map(|(_, value)| parse_exact_topic(&value))?;

        let (display_name, trackers) = match magnet_url::Magnet::new(&repaired) {
            Ok(magnet) => (
                magnet.display_name().map(|name| name.to_string()),
                magnet.trackers().to_vec(),
            ),
            Err(_) => (
                url.query_pairs()
                    .find(|(key, _)| key == "dn")
                    .map(|(_, value)| value.into_owned()),
                url.query_pairs()
                    .filter(|(key, _)| key == "tr")
                    .map(|(_, value)| value.into_owned())
                    .collect(),
            ),
        };

        Some(Self {
            info_hash,
            display_name,
            trackers,
        })
    }
}

fn parse_exact_topic(value: &str) -> Option<InfoHash> {
    let lower = value.to_ascii_lowercase();
    if let Some(hash) = lower.strip_prefix("urn:btih:") {
        return match hash.len() {
            40 => InfoHash::from_hex(hash),
            32 => {
                let bytes = BASE32.decode(hash.to_ascii_uppercase().as_bytes()).ok()?;
                InfoHash::from_slice(&bytes)
            }
            _ => None,
        };
    }
    // v2 multihash: 0x12 (sha2-256) 0x20 (32 bytes) followed by the digest
    if let Some(multihash) = lower.strip_prefix("urn:btmh:") {
        let digest = multihash.strip_prefix("1220")?;
        if digest.len() == 64 {
            return InfoHash::from_hex(digest);
        }
    }
    None
}
