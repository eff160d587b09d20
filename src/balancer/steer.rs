//! Backend choice for new flows.

use super::state::LiveEntry;
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SteerError {
    #[error("no live backends")]
    NoBackends,
    #[error("no live backend in the target generation")]
    NoEligibleBackend,
}

/// Uniform pick over the live backends that belong to `pool`. The
/// intersection is materialized up front so an empty one fails immediately
/// instead of rejection-sampling forever.
pub(crate) fn pick_backend(
    live: &HashMap<Ipv4Addr, LiveEntry>,
    pool: &HashSet<Ipv4Addr>,
    rng: &mut StdRng,
) -> Result<Ipv4Addr, SteerError> {
    if live.is_empty() {
        return Err(SteerError::NoBackends);
    }
    let eligible: Vec<Ipv4Addr> = live.keys().copied().filter(|ip| pool.contains(ip)).collect();
    if eligible.is_empty() {
        return Err(SteerError::NoEligibleBackend);
    }
    Ok(eligible[rng.gen_range(0..eligible.len())])
}
