// =============================================================================
// Exit Management Module
// =============================================================================
//
// Background exit monitor loop that evaluates all open positions on a fixed
// tick, closing out stop-loss, target, and trailing-stop breaches.

pub mod monitor;
