//! Per-vbucket master guesses
//!
//! After a NOT_MY_VBUCKET the configured master is known to be wrong, but a
//! new map may take a while to arrive. Guesses override the map for routing
//! until the next configuration replaces them.

use super::topology::ClusterConfig;

#[derive(Debug, Clone, Default)]
pub struct VbGuess {
    guesses: Vec<Option<usize>>,
}

impl VbGuess {
    pub fn new(num_vbuckets: usize) -> Self {
        Self {
            guesses: vec![None; num_vbuckets],
        }
    }

    /// Drop every guess, e.g. when a new configuration is installed
    pub fn reset(&mut self, num_vbuckets: usize) {
        self.guesses.clear();
        self.guesses.resize(num_vbuckets, None);
    }

    pub fn get(&self, vbucket: u16) -> Option<usize> {
        self.guesses.get(vbucket as usize).copied().flatten()
    }

    /// Pick a new master for `vbucket` after server `bad` rejected it
    ///
    /// The forward map is preferred. Without one, and when `heuristic` is
    /// set, the next server in the list is tried. Returns the new index, or
    /// `None` when no better candidate exists.
    pub fn remap(
        &mut self,
        config: &ClusterConfig,
        vbucket: u16,
        bad: usize,
        heuristic: bool,
    ) -> Option<usize> {
        let slot = vbucket as usize;
        if slot >= config.num_vbuckets() {
            return None;
        }
        if self.guesses.len() != config.num_vbuckets() {
            self.reset(config.num_vbuckets());
        }

        // Another request already moved this vbucket off the bad server
        if let Some(current) = self.get(vbucket) {
            if current != bad {
                return Some(current);
            }
        }

        let nservers = config.num_data_servers();
        let candidate = match config.forward_master(vbucket) {
            Some(ix) if ix != bad => Some(ix),
            _ if heuristic && nservers > 1 => Some((bad + 1) % nservers),
            _ => None,
        }?;

        self.guesses[slot] = Some(candidate);
        Some(candidate)
    }
}
