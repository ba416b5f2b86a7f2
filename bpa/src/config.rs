/// Sizing parameters for an agent instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of fixed-size blocks in the memory pool.
    pub pool_blocks: usize,
    /// Route table capacity.
    pub max_routes: usize,
    /// Interface registry capacity.
    pub max_intfs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_blocks: 1024,
            max_routes: 32,
            max_intfs: 16,
        }
    }
}
