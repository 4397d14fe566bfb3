//! Building blocks of the upload/commit pipeline

pub mod backend;
pub mod desync;
pub mod digest;
pub mod fanout;
pub mod listing;
pub mod metadata;
pub mod staging;
