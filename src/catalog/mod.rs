// SPDX-License-Identifier: MIT

//! From a decoded catalog tree to flat records and their on-disk artifacts.

pub mod normalize;
pub mod records;
pub mod writer;

pub use normalize::{normalize, CatalogSource};
pub use records::{
    BundleRecord, ComponentRecord, DeviceRecord, NormalizeReport, NormalizedCatalog,
    SupportedSystem, SystemRecord,
};
pub use writer::{parse_artifact_name, ArtifactKind, CatalogWriter};
