//! HTTP API Module
//!
//! Operator REST API for replication status and repair.

mod http;

pub use http::{
    AppState, CleanupRequest, CleanupResponse, EntriesQuery, ErrorResponse, HealthResponse, HttpServer,
    MappingRequest, RemoveMappingResponse, ResetResponse, StatusResponse,
};
