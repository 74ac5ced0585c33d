// handlers/elevated/mod.rs - Elevated handlers
//
// Route Prefix: /api/root/*
// Middleware: root_auth_middleware (bearer token whose role is the root role)
pub mod root;
