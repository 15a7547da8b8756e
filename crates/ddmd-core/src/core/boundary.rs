use nalgebra::Vector3;
use thiserror::Error;

/// Number of spatial dimensions handled by the decomposition.
pub const DIMENSION: usize = 3;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BoundaryError {
    #[error("Invalid cell length {length} along axis {axis}: lengths must be positive and finite")]
    InvalidLength { axis: usize, length: f64 },
}

/// Wraps a scaled coordinate into the half-open interval [0, 1).
///
/// Whole periods are added or removed. A value that lands on exactly 1.0 after
/// wrapping (possible through round-off for tiny negative inputs) is mapped to 0.0,
/// so every finite input has exactly one image in the primary cell.
#[inline]
pub fn wrap_unit(x: f64) -> f64 {
    let wrapped = x - x.floor();
    if wrapped >= 1.0 { 0.0 } else { wrapped }
}

/// An orthorhombic periodic simulation cell.
///
/// The cell converts between Cartesian coordinates and scaled (generalized)
/// coordinates, in which the primary cell is the unit cube [0, 1)^3. Scaled
/// coordinates are unaffected when the cell deforms, which is why atom storages
/// keep positions in scaled form whenever atoms are exchanged between domains.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Boundary {
    lengths: Vector3<f64>,
}

impl Default for Boundary {
    /// Returns the unit cube.
    fn default() -> Self {
        Self {
            lengths: Vector3::new(1.0, 1.0, 1.0),
        }
    }
}

impl Boundary {
    /// Creates a cell with the given edge lengths.
    ///
    /// # Arguments
    ///
    /// * `lengths` - Edge lengths along x, y and z.
    ///
    /// # Errors
    ///
    /// Returns [`BoundaryError::InvalidLength`] if any length is not strictly positive
    /// and finite.
    pub fn new(lengths: Vector3<f64>) -> Result<Self, BoundaryError> {
        Self::check_lengths(&lengths)?;
        Ok(Self { lengths })
    }

    /// Creates a cubic cell of edge length `length`.
    pub fn cubic(length: f64) -> Result<Self, BoundaryError> {
        Self::new(Vector3::new(length, length, length))
    }

    fn check_lengths(lengths: &Vector3<f64>) -> Result<(), BoundaryError> {
        for axis in 0..DIMENSION {
            let length = lengths[axis];
            if !(length.is_finite() && length > 0.0) {
                return Err(BoundaryError::InvalidLength { axis, length });
            }
        }
        Ok(())
    }

    /// Deforms the cell. Positions held in scaled form keep their meaning.
    pub fn set_lengths(&mut self, lengths: Vector3<f64>) -> Result<(), BoundaryError> {
        Self::check_lengths(&lengths)?;
        self.lengths = lengths;
        Ok(())
    }

    pub fn lengths(&self) -> &Vector3<f64> {
        &self.lengths
    }

    pub fn length(&self, axis: usize) -> f64 {
        self.lengths[axis]
    }

    pub fn volume(&self) -> f64 {
        self.lengths.x * self.lengths.y * self.lengths.z
    }

    /// Converts a Cartesian position into scaled coordinates.
    #[inline]
    pub fn transform_cart_to_gen(&self, r: &Vector3<f64>) -> Vector3<f64> {
        r.component_div(&self.lengths)
    }

    /// Converts a scaled position into Cartesian coordinates.
    #[inline]
    pub fn transform_gen_to_cart(&self, s: &Vector3<f64>) -> Vector3<f64> {
        s.component_mul(&self.lengths)
    }

    /// Returns the image of a scaled position inside the primary cell.
    pub fn shift_gen(&self, s: &Vector3<f64>) -> Vector3<f64> {
        s.map(wrap_unit)
    }

    /// Converts a Cartesian distance along `axis` into a scaled width.
    pub fn scaled_width(&self, axis: usize, distance: f64) -> f64 {
        distance / self.lengths[axis]
    }

    /// Minimum-image separation `a - b` of two Cartesian positions.
    pub fn min_image_vector(&self, a: &Vector3<f64>, b: &Vector3<f64>) -> Vector3<f64> {
        let mut dr = a - b;
        for axis in 0..DIMENSION {
            let length = self.lengths[axis];
            dr[axis] -= length * (dr[axis] / length).round();
        }
        dr
    }

    /// Squared minimum-image distance between two Cartesian positions.
    pub fn min_image_distance_sq(&self, a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
        self.min_image_vector(a, b).norm_squared()
    }
}
