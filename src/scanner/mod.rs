pub mod discovery;

pub use discovery::{discover_images, has_extension, label_for};
