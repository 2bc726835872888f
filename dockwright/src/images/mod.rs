//! Image storage: layer archives, content-addressed blobs, the layer cache,
//! the image index and base image fetching.

pub mod archive;
pub mod cache;
pub mod config;
pub mod export;
pub mod fetch;
pub mod index;
pub mod manifest;
pub mod storage;

pub use cache::{LayerCache, LayerRecord};
pub use config::ImageRuntimeConfig;
pub use export::export_oci_layout;
pub use fetch::{BaseFetcher, BaseImage, BaseLayer, RegistryFetcher};
pub use index::{BaseRecord, BuiltImage, ImageIndex};
pub use storage::BlobStorage;
