//! Home directory management: layout, locking and options.

pub mod layout;
pub mod lock;
pub mod options;

pub use layout::{BlobLayout, HomeLayout};
pub use lock::HomeLock;
pub use options::DockwrightOptions;
