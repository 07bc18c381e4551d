//! S3驱动 / S3 driver
//!
//! [`crate::storage::ObjectBackend`] over `rust-s3`. Signing, presigning and the XML
//! payloads all come from the crate; this driver only maps requests and errors.

mod driver;
mod error;

pub use driver::S3Driver;
pub use error::map_s3_error;
