// Shared world state and mutation notification
pub mod state;

// WebSocket subscribers and fan-out
pub mod subscription;

// HTTP and WebSocket APIs
pub mod api;

// Configuration
pub mod config;
