// ---------------------------------------------------------------------------
// Params — tunables for the beta-weighted statistics
// ---------------------------------------------------------------------------

/// Search-side knobs consumed by the tree core. Immutable and shareable
/// across worker threads; the search driver owns one and passes the
/// individual values into the node operations.
#[derive(Clone, Copy, Debug)]
pub struct Params {
    /// Weight of effective visits when deriving the Beta posterior.
    pub beta_trust: f32,
    /// Pseudo-visit count added to every posterior.
    pub beta_prior: f32,
    /// Iteration ceiling for `stabilize_score_betamcts`.
    pub stabilize_max_steps: u32,
    /// Convergence threshold on the beta score delta.
    pub stabilize_threshold: f32,
    /// Lower-tail quantile used for move ordering at the root.
    pub lcb_percentile: f32,
    /// Boltzmann temperature of the RENTS blend.
    pub rents_temp: f32,
    /// Mixing weight between the Boltzmann term and the raw prior.
    pub rents_lambda: f32,
    /// Prior cutoff factor below which children get zero policy.
    pub rents_cutoff: f32,
    /// First-play urgency value for unvisited children.
    pub rents_fpu: f32,
    /// Give proven terminals inflated effective visit mass.
    pub inflate_terminals: bool,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            beta_trust: 1.0,
            beta_prior: 1.0,
            stabilize_max_steps: 100,
            stabilize_threshold: 1e-3,
            lcb_percentile: 0.1,
            rents_temp: 1.0,
            rents_lambda: 0.5,
            rents_cutoff: 0.2,
            rents_fpu: -1.0,
            inflate_terminals: true,
        }
    }
}
