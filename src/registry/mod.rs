//! Descriptor identities and the manifest codec
//!
//! Every inheritable resource is named by a [`FileName`] so both generations
//! agree on which descriptor is which, independent of process-local numbering.
//! The manifest is the ordered list of names sent ahead of the descriptors.

mod fds;

pub use fds::Fds;

use crate::error::{HandoverError, Phase, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Network kind used for TCP listeners
pub const NETWORK_TCP: &str = "tcp";

/// Network kind used for Unix stream listeners
pub const NETWORK_UNIX: &str = "unix";

/// Stable name of one inheritable resource
///
/// Serialized as a three-element array `[network, address, label]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileName {
    /// Network kind (`tcp`, `unix`, ...)
    pub network: String,

    /// Bound address or socket path
    pub address: String,

    /// Free-form label distinguishing listeners on the same address
    pub label: String,
}

impl FileName {
    /// Create a new descriptor identity
    pub fn new(
        network: impl Into<String>,
        address: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
            label: label.into(),
        }
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.network, self.address, self.label)
    }
}

impl Serialize for FileName {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (&self.network, &self.address, &self.label).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FileName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (network, address, label) = <(String, String, String)>::deserialize(deserializer)?;
        Ok(Self {
            network,
            address,
            label,
        })
    }
}

/// Encode an ordered manifest
pub fn encode_manifest(names: &[FileName]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(names)?)
}

/// Decode a manifest, rejecting malformed entries and duplicate names
pub fn decode_manifest(bytes: &[u8]) -> Result<Vec<FileName>> {
    let names: Vec<FileName> = serde_json::from_slice(bytes).map_err(|e| {
        HandoverError::protocol(
            Phase::Manifest,
            format!("can't decode names from predecessor: {}", e),
        )
    })?;

    let mut seen = HashSet::with_capacity(names.len());
    for name in &names {
        if !seen.insert(name) {
            return Err(HandoverError::protocol(
                Phase::Manifest,
                format!("duplicate name in manifest: {}", name),
            ));
        }
    }

    Ok(names)
}

/// A descriptor received from the predecessor
///
/// Owned exclusively by this process; closed on drop unless the caller takes
/// the file out with [`InheritedFile::into_file`].
#[derive(Debug)]
pub struct InheritedFile {
    file: File,
    fd: RawFd,
    label: String,
}

impl InheritedFile {
    /// Wrap a freshly received descriptor
    pub fn new(fd: OwnedFd, label: impl Into<String>) -> Self {
        let raw = fd.as_raw_fd();
        Self {
            file: File::from(fd),
            fd: raw,
            label: label.into(),
        }
    }

    /// Descriptor number at the moment of receipt
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Diagnostic label (the rendered [`FileName`])
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Take ownership of the underlying file
    pub fn into_file(self) -> File {
        self.file
    }

    /// Take ownership of the underlying descriptor
    pub fn into_owned_fd(self) -> OwnedFd {
        OwnedFd::from(self.file)
    }
}

impl AsFd for InheritedFile {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_names() -> Vec<FileName> {
        vec![
            FileName::new("tcp", "0.0.0.0:8080", "main"),
            FileName::new("unix", "/run/app.sock", "admin"),
        ]
    }

    #[test]
    fn test_encode_is_array_of_arrays() {
        let bytes = encode_manifest(&sample_names()).unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"[["tcp","0.0.0.0:8080","main"],["unix","/run/app.sock","admin"]]"#
        );
    }

    #[test]
    fn test_decode_known_manifest() {
        let names =
            decode_manifest(br#"[["tcp","0.0.0.0:8080","main"],["unix","/run/app.sock","admin"]]"#)
                .unwrap();
        assert_eq!(names, sample_names());
    }

    #[test]
    fn test_decode_empty_manifest() {
        assert!(decode_manifest(b"[]").unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_wrong_arity() {
        let err = decode_manifest(br#"[["tcp","0.0.0.0:8080"]]"#).unwrap_err();
        assert!(matches!(
            err,
            HandoverError::Protocol {
                phase: Phase::Manifest,
                ..
            }
        ));

        assert!(decode_manifest(br#"[["tcp","a","b","c"]]"#).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_json() {
        assert!(decode_manifest(br#"[["tcp","0.0.0.0:8080","ma"#).is_err());
        assert!(decode_manifest(b"").is_err());
    }

    #[test]
    fn test_decode_rejects_duplicates() {
        let err =
            decode_manifest(br#"[["tcp","0.0.0.0:80","a"],["tcp","0.0.0.0:80","a"]]"#).unwrap_err();
        assert!(err.to_string().contains("duplicate name"));
    }

    #[test]
    fn test_file_name_display() {
        let name = FileName::new("tcp", "127.0.0.1:9000", "api");
        assert_eq!(name.to_string(), "tcp:127.0.0.1:9000:api");
    }

    proptest! {
        #[test]
        fn prop_manifest_round_trip(
            entries in proptest::collection::hash_set(
                (".{0,12}", ".{0,24}", ".{0,12}"),
                0..16,
            )
        ) {
            let names: Vec<FileName> = entries
                .into_iter()
                .map(|(n, a, l)| FileName::new(n, a, l))
                .collect();
            let decoded = decode_manifest(&encode_manifest(&names).unwrap()).unwrap();
            prop_assert_eq!(decoded, names);
        }
    }
}
