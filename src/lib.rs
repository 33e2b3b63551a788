//! Read-only access to VMware Virtual Disk (VMDK) images as a single flat
//! byte-addressable medium.
//!
//! An image is opened from its primary file — either a standalone textual
//! descriptor (`*.vmdk`) or a monolithic sparse file with an embedded
//! descriptor — and exposed through [`image::ImageHandle`], which
//! implements [`std::io::Read`] and [`std::io::Seek`] over the logical
//! concatenation of the image's extents.

pub mod codec;
pub mod descriptor;
pub mod error;
pub mod extent;
pub mod image;
pub mod io;
pub mod sparse;

pub use descriptor::{DiskType, ExtentAccessMode, ExtentKind, ExtentSpec, ImageModel};
pub use error::{Error, Result};
pub use image::{ImageHandle, OpenFlags};
