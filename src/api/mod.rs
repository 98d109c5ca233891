// =============================================================================
// Operational HTTP surface — health, readiness, status, admin control, ws push
// =============================================================================
//
// Narrow on purpose: this is ops tooling for an operator to see whether the
// engine is alive, healthy, and trading, and to flip it between Live/Paused/
// Killed. It is not a dashboard backend — no market data, no charts, no
// per-candle streaming.
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;
