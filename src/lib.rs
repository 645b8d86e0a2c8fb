//! castforge -- Chromecast trust-substitution tooling.
//!
//! A certificate factory for issuing a root->intermediate->leaf chain (and
//! for length-targeting a replacement root so it DER-encodes to an exact
//! byte count), a binary patcher that splices a substituted root into a
//! shared library in place, and a Cast v2 receiver that authenticates to a
//! patched client using certificates chained to that substituted root.

pub mod cast;
pub mod cert;
pub mod config;
pub mod error;
pub mod patch;
