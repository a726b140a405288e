//! Coffer is an object-storage control plane. Clients never stream bytes
//! through it: uploads and downloads happen directly against the blob store
//! with pre-signed URLs, while this service owns the metadata, the bucket
//! lifecycle and the background reconciliation that keeps the two sides
//! consistent.
//!
//! The crate is organized as a set of gateways and one coordinator:
//!
//! - [`metadata_store`]: PostgreSQL gateway for buckets, objects and jobs
//! - [`blob_store`]: S3 gateway for pre-signing, HEAD probes and deletes
//! - [`job_queue`]: durable job table plus the polling runner
//! - [`service`]: the commands the API exposes, one transaction each
//! - [`workers`]: idempotent handlers behind the job queue
//! - [`api`]: axum routes, authentication and the error envelope

pub mod api;
pub mod blob_store;
pub mod config;
pub mod error;
pub mod job_queue;
pub mod metadata_store;
pub mod model;
pub mod service;
pub mod validate;
pub mod workers;
