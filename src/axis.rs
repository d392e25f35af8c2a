//! Conversion between N5 (F order, fastest axis first) and container
//! (C order, fastest axis last) coordinate vectors.
//!
//! Every shape, block size, offset and grid position crosses the boundary
//! through these functions so that no vector is left in the wrong order.

/// Reverse the axis order of a vector.
///
/// The operation is its own inverse.
pub fn reorder<T: Copy>(values: &[T]) -> Vec<T> {
    values.iter().rev().copied().collect()
}

/// Reverse the axis order of a vector, widening each element to `u64`.
pub fn reorder_to_u64<T: Copy + Into<u64>>(values: &[T]) -> Vec<u64> {
    values.iter().rev().map(|&v| v.into()).collect()
}

/// Multiply grid position and block size element-wise and reverse the result.
///
/// This is the container-order offset of a block on the nominal grid.
pub fn reorder_multiply(grid_position: &[u64], block_size: &[u32]) -> Vec<u64> {
    grid_position
        .iter()
        .zip(block_size)
        .rev()
        .map(|(&p, &b)| p * u64::from(b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorder_is_involution() {
        let v = vec![1u64, 2, 3, 4, 5];
        assert_eq!(reorder(&v), vec![5, 4, 3, 2, 1]);
        assert_eq!(reorder(&reorder(&v)), v);

        let even = vec![7u32, 8];
        assert_eq!(reorder(&reorder(&even)), even);

        let empty: Vec<u64> = vec![];
        assert!(reorder(&empty).is_empty());
    }

    #[test]
    fn reorder_multiply_uses_nominal_block() {
        assert_eq!(reorder_multiply(&[1, 2, 3], &[10, 20, 30]), vec![90, 40, 10]);
    }

    #[test]
    fn reorder_widens() {
        assert_eq!(reorder_to_u64(&[1u32, 2, 3]), vec![3u64, 2, 1]);
    }
}
