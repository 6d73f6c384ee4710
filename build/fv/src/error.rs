// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

/// Failures raised while assembling a single firmware volume.
///
/// Most of these abort the volume being built; sibling volumes keep going.
/// `UnresolvedBlockSize` and `OffsetWraparound` are degraded conditions:
/// the assembler logs them and carries on with a default or wrapped value.
#[derive(Debug, thiserror::Error)]
pub enum FvError {
    #[error("malformed GUID '{0}'")]
    MalformedGuid(String),

    #[error(
        "FV {volume}: extension entry file {} does not exist",
        .path.display()
    )]
    MissingExtensionFile { volume: String, path: PathBuf },

    #[error(
        "FV {volume}: extension entry {what} is {size:#x} bytes, \
         which does not fit in a 16-bit entry size"
    )]
    ExtensionEntryTooLarge {
        volume: String,
        what: String,
        size: usize,
    },

    #[error("FV {volume}: bad extension data byte '{item}'")]
    MalformedExtensionData { volume: String, item: String },

    #[error(
        "FV {volume}: extension header entries declared with no name GUID"
    )]
    MissingNameGuid { volume: String },

    #[error(
        "FV {volume}: no block size declared and none inherited from a \
         flash region; defaulting to a 1-byte block"
    )]
    UnresolvedBlockSize { volume: String },

    #[error(
        "capsule {capsule} can't contain FV {volume}, which is also placed \
         in a flash region of FD {fd}"
    )]
    RegionConflict {
        capsule: String,
        volume: String,
        fd: String,
    },

    #[error("FV {volume}: packer failed: {reason}")]
    PackerInvocationFailed { volume: String, reason: String },

    #[error(
        "FV {volume}: patched offset {base:#x} + {load:#x} wrapped past \
         2^64 to {wrapped:#x}"
    )]
    OffsetWraparound {
        volume: String,
        base: u64,
        load: u64,
        wrapped: u64,
    },

    #[error("FV {volume}: apriori entry '{entry}' names no module in the FV")]
    UnknownAprioriModule { volume: String, entry: String },

    #[error("FV image {}: {reason}", .path.display())]
    MalformedImage { path: PathBuf, reason: String },

    #[error("map file {}, line {line}: {reason}", .path.display())]
    MalformedMap {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}
