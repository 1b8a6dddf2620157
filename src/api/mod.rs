// =============================================================================
// Operator API — engine state and manual actions, not the user-facing surface
// =============================================================================

pub mod rest;
