//! Small helpers shared by the storage, feed and CLI layers.

mod fs;
mod text;
mod url_validator;

pub use fs::write_atomic;
pub use text::{strip_control_chars, truncate_chars};
pub use url_validator::{validate_url, UrlValidationError};
