//! Base-58 identifiers used throughout the mesh: node IDs, message IDs,
//! and rendezvous request IDs. Kept as distinct newtypes (mirroring the
//! `PeerId`/`MessageId` split elsewhere in this crate family) so a
//! `RequestId` can never be passed where a `NodeId` is expected.

use sha2::{Digest, Sha256, Sha384};
use std::fmt;
use uuid::Uuid;

fn base58_encode(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

fn base58_decode(s: &str) -> Result<Vec<u8>, bs58::decode::Error> {
    bs58::decode(s).into_vec()
}

macro_rules! base58_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn from_base58(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn from_bytes(bytes: &[u8]) -> Self {
                Self(base58_encode(bytes))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn to_bytes(&self) -> Result<Vec<u8>, bs58::decode::Error> {
                base58_decode(&self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

base58_id!(NodeId);
base58_id!(MessageId);
base58_id!(RequestId);

impl NodeId {
    /// Derive a node ID from this process's outward address, the protocol
    /// identity both peers must agree on, and a fresh random salt so two
    /// processes bound to the same address never collide.
    ///
    /// The salt is generated once per [`crate::socket`]-equivalent
    /// construction, never at module scope — see `SPEC_FULL.md` §3.
    pub fn derive(outward_addr: &str, protocol_id: &str, salt: Option<Uuid>) -> Self {
        let salt = salt.unwrap_or_else(Uuid::new_v4);
        let mut hasher = Sha384::new();
        hasher.update(outward_addr.as_bytes());
        hasher.update(protocol_id.as_bytes());
        hasher.update(salt.as_bytes());
        Self::from_bytes(&hasher.finalize())
    }
}

impl MessageId {
    /// `id = base58(sha384(concat(payload) || time_58))`.
    pub fn derive(payload: &[Vec<u8>], time_58: &str) -> Self {
        let mut hasher = Sha384::new();
        for part in payload {
            hasher.update(part);
        }
        hasher.update(time_58.as_bytes());
        Self::from_bytes(&hasher.finalize())
    }
}

impl RequestId {
    /// `request_id = base58(sha384(sender_id || base58(now)))`.
    pub fn derive(sender_id: &NodeId, now_58: &str) -> Self {
        let mut hasher = Sha384::new();
        hasher.update(sender_id.as_str().as_bytes());
        hasher.update(now_58.as_bytes());
        Self::from_bytes(&hasher.finalize())
    }
}

/// Encode a UTC timestamp (seconds) as base-58, used for `time_58`.
pub fn time_to_base58(unix_secs: i64) -> String {
    base58_encode(&unix_secs.to_be_bytes())
}

/// Inverse of [`time_to_base58`], used when parsing an incoming frame.
pub fn base58_to_time(time_58: &str) -> Option<i64> {
    let bytes = base58_decode(time_58).ok()?;
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(i64::from_be_bytes(arr))
}

/// The protocol identifier: base58(sha256(subnet || encryption || version)).
pub fn protocol_id(subnet: &str, encryption: &str, version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(subnet.as_bytes());
    hasher.update(encryption.as_bytes());
    hasher.update(version.as_bytes());
    base58_encode(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_differs_by_salt() {
        let a = NodeId::derive("127.0.0.1:1", "proto", Some(Uuid::new_v4()));
        let b = NodeId::derive("127.0.0.1:1", "proto", Some(Uuid::new_v4()));
        assert_ne!(a, b);
    }

    #[test]
    fn node_id_deterministic_for_fixed_salt() {
        let salt = Uuid::new_v4();
        let a = NodeId::derive("127.0.0.1:1", "proto", Some(salt));
        let b = NodeId::derive("127.0.0.1:1", "proto", Some(salt));
        assert_eq!(a, b);
    }

    #[test]
    fn message_id_depends_only_on_payload_and_time() {
        let payload = vec![b"hello".to_vec()];
        let a = MessageId::derive(&payload, "abc");
        let b = MessageId::derive(&payload, "abc");
        assert_eq!(a, b);
        let c = MessageId::derive(&payload, "xyz");
        assert_ne!(a, c);
    }

    #[test]
    fn protocol_id_matches_for_same_inputs() {
        assert_eq!(
            protocol_id("mesh", "Plaintext", "0.5"),
            protocol_id("mesh", "Plaintext", "0.5")
        );
        assert_ne!(
            protocol_id("mesh", "Plaintext", "0.5"),
            protocol_id("other", "Plaintext", "0.5")
        );
    }

    #[test]
    fn base58_roundtrip() {
        let id = NodeId::from_bytes(b"some bytes to hash around");
        let bytes = id.to_bytes().unwrap();
        assert_eq!(NodeId::from_bytes(&bytes).as_str(), id.as_str());
    }
}
