//! HTTP plumbing: request model, shared client and the chunked downloader

pub mod client;
pub mod downloader;
pub mod request;
