//! Backend implementations of [`ObjectStore`](crate::traits::ObjectStore).

pub mod memory;
pub mod s3;
