//! Object store abstraction and the S3 implementation behind it.

pub mod s3;
pub mod traits;

pub use s3::S3Store;
pub use traits::{
    ByteReader, CompletedObject, ObjectEntry, ObjectStat, ObjectStore, PartRecord, StoreError,
};
