// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware volume assembly.
//!
//! Turns a [`descriptor::VolumeDescriptor`] into a packed PI firmware volume
//! by writing a control file and extension header, driving an external
//! packer (usually `GenFv`) through at most two passes, and emitting an
//! as-built INF describing what ended up in the image.

pub mod asbuilt;
pub mod assemble;
pub mod blocks;
pub mod context;
pub mod control;
pub mod descriptor;
mod error;
pub mod ext_header;
pub mod file;
pub mod guid;
pub mod image;
pub mod order;
pub mod packer;
pub mod tools;

pub use error::FvError;
pub use guid::Guid;
