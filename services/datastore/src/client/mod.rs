//! Typed clients for a remote datastore.

#[cfg(feature = "grpc")]
pub mod grpc;
pub mod http;

#[cfg(feature = "grpc")]
pub use grpc::GrpcClient;
pub use http::HttpClient;
