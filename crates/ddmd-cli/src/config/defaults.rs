pub struct DefaultsConfig {
    pub grid: [usize; 3],
    pub cell_length: f64,
    pub atom_capacity: usize,
    pub ghost_capacity: usize,
    pub group_capacity: usize,
    pub skin: f64,
    pub mask_policy: &'static str,
    pub steps: u64,
    pub max_displacement: f64,
    pub seed: u64,
    pub chains: usize,
    pub chain_length: usize,
    pub bond_length: f64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            grid: [1, 1, 1],
            cell_length: 20.0,
            atom_capacity: 10_000,
            ghost_capacity: 20_000,
            group_capacity: 20_000,
            skin: 0.3,
            mask_policy: "none",
            steps: 100,
            max_displacement: 0.05,
            seed: 0,
            chains: 10,
            chain_length: 10,
            bond_length: 1.0,
        }
    }
}
