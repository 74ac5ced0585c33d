// handlers/mod.rs - handlers grouped by security tier
//
// Public (no auth) → Protected (tenant resolved from the bearer token)
// → Elevated (bearer token carrying the root role)
pub mod elevated; // /api/root/*
pub mod protected; // /api/*
pub mod public; // /, /health
