//! Tags qualifying every content-addressed identifier in a repository.

use serde::{Deserialize, Serialize};

/// The class of a blob stored in a repository.
///
/// Every MAC is qualified by a kind, and the kind participates in the MAC
/// preimage, so the same bytes stored under two kinds yield two different
/// identifiers.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum ResourceKind {
    Config,
    Packfile,
    State,
    Snapshot,
    VfsBtreeRoot,
    VfsNode,
    VfsEntry,
    XattrBtreeRoot,
    XattrNode,
    XattrEntry,
    ErrorBtreeRoot,
    ErrorNode,
    Object,
    Chunk,
    Lock,
}

impl ResourceKind {
    /// The stable wire value of this kind, used in packfile footers and MAC
    /// preimages. These values are append-only.
    pub fn as_u32(self) -> u32 {
        match self {
            ResourceKind::Config => 0,
            ResourceKind::Packfile => 1,
            ResourceKind::State => 2,
            ResourceKind::Snapshot => 3,
            ResourceKind::VfsBtreeRoot => 4,
            ResourceKind::VfsNode => 5,
            ResourceKind::VfsEntry => 6,
            ResourceKind::XattrBtreeRoot => 7,
            ResourceKind::XattrNode => 8,
            ResourceKind::XattrEntry => 9,
            ResourceKind::ErrorBtreeRoot => 10,
            ResourceKind::ErrorNode => 11,
            ResourceKind::Object => 12,
            ResourceKind::Chunk => 13,
            ResourceKind::Lock => 14,
        }
    }

    /// Decodes a wire value back into a kind.
    pub fn from_u32(value: u32) -> Option<ResourceKind> {
        let kind = match value {
            0 => ResourceKind::Config,
            1 => ResourceKind::Packfile,
            2 => ResourceKind::State,
            3 => ResourceKind::Snapshot,
            4 => ResourceKind::VfsBtreeRoot,
            5 => ResourceKind::VfsNode,
            6 => ResourceKind::VfsEntry,
            7 => ResourceKind::XattrBtreeRoot,
            8 => ResourceKind::XattrNode,
            9 => ResourceKind::XattrEntry,
            10 => ResourceKind::ErrorBtreeRoot,
            11 => ResourceKind::ErrorNode,
            12 => ResourceKind::Object,
            13 => ResourceKind::Chunk,
            14 => ResourceKind::Lock,
            _ => return None,
        };
        Some(kind)
    }

    /// Human readable name, used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::Config => "config",
            ResourceKind::Packfile => "packfile",
            ResourceKind::State => "state",
            ResourceKind::Snapshot => "snapshot",
            ResourceKind::VfsBtreeRoot => "vfs-root",
            ResourceKind::VfsNode => "vfs-node",
            ResourceKind::VfsEntry => "vfs-entry",
            ResourceKind::XattrBtreeRoot => "xattr-root",
            ResourceKind::XattrNode => "xattr-node",
            ResourceKind::XattrEntry => "xattr-entry",
            ResourceKind::ErrorBtreeRoot => "error-root",
            ResourceKind::ErrorNode => "error-node",
            ResourceKind::Object => "object",
            ResourceKind::Chunk => "chunk",
            ResourceKind::Lock => "lock",
        }
    }

    /// All kinds, in wire-value order.
    pub fn all() -> &'static [ResourceKind] {
        &[
            ResourceKind::Config,
            ResourceKind::Packfile,
            ResourceKind::State,
            ResourceKind::Snapshot,
            ResourceKind::VfsBtreeRoot,
            ResourceKind::VfsNode,
            ResourceKind::VfsEntry,
            ResourceKind::XattrBtreeRoot,
            ResourceKind::XattrNode,
            ResourceKind::XattrEntry,
            ResourceKind::ErrorBtreeRoot,
            ResourceKind::ErrorNode,
            ResourceKind::Object,
            ResourceKind::Chunk,
            ResourceKind::Lock,
        ]
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_round_trip() {
        for kind in ResourceKind::all() {
            assert_eq!(ResourceKind::from_u32(kind.as_u32()), Some(*kind));
        }
        assert_eq!(ResourceKind::from_u32(255), None);
    }
}
