// handlers/protected/auth/mod.rs - session introspection

pub mod whoami; // GET /api/auth/whoami

pub use whoami::whoami_get;
