use super::error::CommError;
use crate::core::boundary::{DIMENSION, wrap_unit};
use nalgebra::Vector3;

/// One rank's place in a regular grid of domains.
///
/// The unit cell of scaled coordinates is cut into `grid[i]` equal slabs
/// along each axis. Ranks are assigned to grid coordinates in row-major
/// order, so `rank = (ix * Py + iy) * Pz + iz`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    grid: [usize; DIMENSION],
    coordinate: [usize; DIMENSION],
    rank: usize,
}

impl Domain {
    /// Creates the domain description for `rank`.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::Configuration`] if a grid dimension is zero, if the
    /// grid does not have exactly `n_procs` cells, or if `rank` is not below `n_procs`.
    pub fn new(grid: [usize; DIMENSION], rank: usize, n_procs: usize) -> Result<Self, CommError> {
        if grid.contains(&0) {
            return Err(CommError::Configuration(format!(
                "grid dimensions must be positive, got {:?}",
                grid
            )));
        }
        let cells: usize = grid.iter().product();
        if cells != n_procs {
            return Err(CommError::Configuration(format!(
                "grid {:?} has {} domains but {} processes are available",
                grid, cells, n_procs
            )));
        }
        if rank >= n_procs {
            return Err(CommError::Configuration(format!(
                "rank {} is out of range for {} processes",
                rank, n_procs
            )));
        }
        let mut domain = Self {
            grid,
            coordinate: [0; DIMENSION],
            rank,
        };
        domain.coordinate = domain.coordinate_of(rank);
        Ok(domain)
    }

    pub fn grid(&self) -> [usize; DIMENSION] {
        self.grid
    }

    pub fn coordinate(&self) -> [usize; DIMENSION] {
        self.coordinate
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn n_procs(&self) -> usize {
        self.grid.iter().product()
    }

    pub fn is_master(&self) -> bool {
        self.rank == 0
    }

    /// Number of domains along `axis`.
    pub fn grid_dimension(&self, axis: usize) -> usize {
        self.grid[axis]
    }

    /// Width of one domain along `axis`, in scaled units.
    pub fn domain_width(&self, axis: usize) -> f64 {
        1.0 / self.grid[axis] as f64
    }

    /// Slab index of a scaled coordinate in [0, 1) along `axis`.
    ///
    /// Values that round up to `grid[axis]` land in slab 0, the periodic image
    /// of the upper edge.
    pub fn axis_cell(&self, axis: usize, s: f64) -> usize {
        let p = self.grid[axis];
        let cell = (s * p as f64).floor();
        if cell < 0.0 {
            return 0;
        }
        let cell = cell as usize;
        if cell >= p { 0 } else { cell }
    }

    /// Grid coordinate of the domain containing a scaled position.
    ///
    /// The position is wrapped into the primary cell first.
    ///
    /// # Return
    ///
    /// `None` if any component is not finite.
    pub fn grid_coordinate(&self, s: &Vector3<f64>) -> Option<[usize; DIMENSION]> {
        if !s.iter().all(|v| v.is_finite()) {
            return None;
        }
        let mut coordinate = [0; DIMENSION];
        for (axis, c) in coordinate.iter_mut().enumerate() {
            *c = self.axis_cell(axis, wrap_unit(s[axis]));
        }
        Some(coordinate)
    }

    pub fn rank_of(&self, coordinate: [usize; DIMENSION]) -> usize {
        (coordinate[0] * self.grid[1] + coordinate[1]) * self.grid[2] + coordinate[2]
    }

    pub fn coordinate_of(&self, rank: usize) -> [usize; DIMENSION] {
        let iz = rank % self.grid[2];
        let iy = (rank / self.grid[2]) % self.grid[1];
        let ix = rank / (self.grid[1] * self.grid[2]);
        [ix, iy, iz]
    }

    /// Rank of the domain that owns a scaled position, or `None` if the
    /// position is not finite.
    pub fn owner_rank(&self, s: &Vector3<f64>) -> Option<usize> {
        self.grid_coordinate(s).map(|c| self.rank_of(c))
    }

    /// Returns `true` if this domain owns the scaled position.
    pub fn is_in_domain(&self, s: &Vector3<f64>) -> bool {
        self.grid_coordinate(s) == Some(self.coordinate)
    }

    /// Returns `true` if the scaled position lies in this domain or at most
    /// `tolerance` outside it along each axis.
    ///
    /// Distances are periodic, so a position just below 1.0 is near a domain
    /// that starts at 0.0.
    pub fn is_near_domain(&self, s: &Vector3<f64>, tolerance: f64) -> bool {
        if self.is_in_domain(s) {
            return true;
        }
        if !s.iter().all(|v| v.is_finite()) {
            return false;
        }
        (0..DIMENSION).all(|axis| {
            let x = wrap_unit(s[axis]);
            let lo = self.domain_bound(axis, 0);
            let hi = self.domain_bound(axis, 1);
            (lo..hi).contains(&x)
                || (lo - x).rem_euclid(1.0) <= tolerance
                || (x - hi).rem_euclid(1.0) <= tolerance
        })
    }

    /// Scaled coordinate of one face of this domain.
    ///
    /// `side` 0 is the lower bound `i / P`, side 1 the upper bound `(i + 1) / P`.
    pub fn domain_bound(&self, axis: usize, side: usize) -> f64 {
        (self.coordinate[axis] + side) as f64 / self.grid[axis] as f64
    }

    /// Rank of the face neighbour along `axis`, with periodic wrap.
    ///
    /// `direction` 0 is the minus side, 1 the plus side. With a single domain
    /// on `axis` the neighbour is this rank.
    pub fn neighbor_rank(&self, axis: usize, direction: usize) -> usize {
        let p = self.grid[axis];
        let mut coordinate = self.coordinate;
        coordinate[axis] = if direction == 0 {
            (coordinate[axis] + p - 1) % p
        } else {
            (coordinate[axis] + 1) % p
        };
        self.rank_of(coordinate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_validates_grid_and_rank() {
        assert!(Domain::new([2, 0, 1], 0, 0).is_err());
        assert!(Domain::new([2, 2, 1], 0, 3).is_err());
        assert!(Domain::new([2, 2, 1], 4, 4).is_err());
        let domain = Domain::new([2, 2, 1], 3, 4).unwrap();
        assert_eq!(domain.coordinate(), [1, 1, 0]);
        assert!(!domain.is_master());
    }

    #[test]
    fn ranks_and_coordinates_are_inverse() {
        let domain = Domain::new([3, 2, 2], 0, 12).unwrap();
        for rank in 0..12 {
            assert_eq!(domain.rank_of(domain.coordinate_of(rank)), rank);
        }
        assert_eq!(domain.rank_of([1, 0, 1]), 5);
    }

    #[test]
    fn boundary_positions_map_deterministically() {
        let domain = Domain::new([4, 1, 1], 0, 4).unwrap();
        let eps = 1e-12;
        assert_eq!(domain.grid_coordinate(&Vector3::new(0.0, 0.5, 0.5)), Some([0, 0, 0]));
        assert_eq!(
            domain.grid_coordinate(&Vector3::new(1.0 - eps, 0.5, 0.5)),
            Some([3, 0, 0])
        );
        assert_eq!(domain.grid_coordinate(&Vector3::new(1.0, 0.5, 0.5)), Some([0, 0, 0]));
        assert_eq!(domain.grid_coordinate(&Vector3::new(0.25, 0.5, 0.5)), Some([1, 0, 0]));
        assert_eq!(domain.grid_coordinate(&Vector3::new(-0.1, 0.5, 0.5)), Some([3, 0, 0]));
        assert_eq!(domain.grid_coordinate(&Vector3::new(f64::NAN, 0.5, 0.5)), None);
    }

    #[test]
    fn two_domains_split_at_one_half() {
        let domain = Domain::new([2, 1, 1], 0, 2).unwrap();
        let owner = |x: f64| domain.owner_rank(&Vector3::new(x, 0.5, 0.5));
        let below_one = 1.0 - f64::EPSILON / 2.0;
        assert!(below_one < 1.0);
        assert_eq!(owner(0.0), Some(0));
        assert_eq!(owner(-0.0), Some(0));
        assert_eq!(owner(0.5 - f64::EPSILON / 4.0), Some(0));
        assert_eq!(owner(0.5), Some(1));
        assert_eq!(owner(below_one), Some(1));
        assert_eq!(owner(1.0), Some(0));
        // Round-off below zero wraps onto the origin, not onto 1.0.
        assert_eq!(owner(-f64::EPSILON / 4.0), Some(0));
        assert_eq!(owner(-0.25), Some(1));
    }

    #[test]
    fn near_domain_allows_round_off_across_faces() {
        let domain = Domain::new([4, 1, 1], 2, 4).unwrap();
        let at = |x: f64| Vector3::new(x, 0.5, 0.5);
        assert!(domain.is_near_domain(&at(0.6), 0.0));
        assert!(!domain.is_in_domain(&at(0.75)));
        assert!(domain.is_near_domain(&at(0.75), 1e-12));
        assert!(domain.is_near_domain(&at(0.5 - 1e-13), 1e-12));
        assert!(!domain.is_near_domain(&at(0.75 + 1e-9), 1e-12));
        assert!(!domain.is_near_domain(&at(f64::NAN), 1e-12));

        let last = Domain::new([4, 1, 1], 3, 4).unwrap();
        assert!(last.is_near_domain(&at(1.0), 1e-12));
        assert!(!last.is_near_domain(&at(0.1), 1e-12));
    }

    #[test]
    fn bounds_and_membership() {
        let domain = Domain::new([2, 2, 1], 1, 4).unwrap();
        assert_eq!(domain.coordinate(), [0, 1, 0]);
        assert_eq!(domain.domain_bound(0, 0), 0.0);
        assert_eq!(domain.domain_bound(0, 1), 0.5);
        assert_eq!(domain.domain_bound(1, 0), 0.5);
        assert_eq!(domain.domain_bound(1, 1), 1.0);
        assert!(domain.is_in_domain(&Vector3::new(0.1, 0.7, 0.3)));
        assert!(!domain.is_in_domain(&Vector3::new(0.6, 0.7, 0.3)));
        assert_eq!(domain.owner_rank(&Vector3::new(0.6, 0.7, 0.3)), Some(3));
    }

    #[test]
    fn neighbors_wrap_periodically() {
        let domain = Domain::new([3, 1, 2], 0, 6).unwrap();
        assert_eq!(domain.neighbor_rank(0, 0), domain.rank_of([2, 0, 0]));
        assert_eq!(domain.neighbor_rank(0, 1), domain.rank_of([1, 0, 0]));
        assert_eq!(domain.neighbor_rank(1, 0), 0);
        assert_eq!(domain.neighbor_rank(1, 1), 0);
        assert_eq!(domain.neighbor_rank(2, 0), 1);
        assert_eq!(domain.neighbor_rank(2, 1), 1);
    }
}
