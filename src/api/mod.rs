//! Control-Plane API
//!
//! HTTP front of the server: registration plus operator endpoints.

mod http;

pub use http::{
    AppState, ErrorResponse, HealthResponse, HttpServer, PeerDetail, PeerEntry, PeersResponse,
    RegisterRequest, RegisterResponse, StatusResponse,
};
