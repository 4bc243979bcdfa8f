//! Grid Topology Module
//!
//! Maps linear ranks onto the logical P x Q grid of nodes and provides the
//! number theory (gcd, lcm, positive modulo) the exchange schedule is built on.
//!
//! P is the number of grid columns, Q the number of grid rows:
//! `row = rank / P`, `col = rank % P`.

use crate::error::{Result, TransposeError};

/// Position of one rank inside a P x Q grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct GridTopology {
    pub rank: usize,
    pub world_size: usize,
    /// Grid width (P, number of columns)
    pub width: usize,
    /// Grid height (Q, number of rows)
    pub height: usize,
    pub row: usize,
    pub col: usize,
    pub gcd: usize,
    pub lcm: usize,
}

impl GridTopology {
    /// Build the topology for `rank`; Q is derived as `world_size / p`
    pub fn new(rank: usize, world_size: usize, p: usize) -> Result<Self> {
        if p == 0 {
            return Err(TransposeError::config("grid width P must be at least 1"));
        }
        if world_size % p != 0 {
            return Err(TransposeError::config(format!(
                "world size {} is not divisible by grid width P={}; \
                 the number of ranks must be a multiple of P",
                world_size, p
            )));
        }
        if rank >= world_size {
            return Err(TransposeError::config(format!(
                "rank {} must be smaller than the world size {}",
                rank, world_size
            )));
        }
        let q = world_size / p;
        let divisor = gcd(p, q);
        Ok(GridTopology {
            rank,
            world_size,
            width: p,
            height: q,
            row: rank / p,
            col: rank % p,
            gcd: divisor,
            lcm: p * q / divisor,
        })
    }

    pub fn row_of(&self, rank: usize) -> usize {
        rank / self.width
    }

    pub fn col_of(&self, rank: usize) -> usize {
        rank % self.width
    }

    /// Rank at grid position (row, col), both taken modulo the grid size
    pub fn rank_at(&self, row: i64, col: i64) -> usize {
        positive_mod(col, self.width) + positive_mod(row, self.height) * self.width
    }

    /// P == Q grids use one direct pairwise exchange per rank
    pub fn is_square(&self) -> bool {
        self.width == self.height
    }

    /// Rows of the LCM tile held by one rank (`lcm / Q`)
    pub fn tile_rows(&self) -> usize {
        self.lcm / self.height
    }

    /// Columns of the LCM tile held by one rank (`lcm / P`)
    pub fn tile_cols(&self) -> usize {
        self.lcm / self.width
    }

    /// Number of block rows this rank holds of an n x n block matrix
    pub fn height_per_rank(&self, width_in_blocks: usize) -> usize {
        share(width_in_blocks, self.height, self.row)
    }

    /// Number of block columns this rank holds of an n x n block matrix
    pub fn width_per_rank(&self, width_in_blocks: usize) -> usize {
        share(width_in_blocks, self.width, self.col)
    }
}

/// Split `total` items over `parts`, the first `total % parts` get one extra
pub fn share(total: usize, parts: usize, index: usize) -> usize {
    total / parts + usize::from(index < total % parts)
}

/// Greatest common divisor (Euclid)
pub fn gcd(a: usize, b: usize) -> usize {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Least common multiple, `lcm(0, x) == 0`
pub fn lcm(a: usize, b: usize) -> usize {
    if a == 0 || b == 0 {
        return 0;
    }
    a / gcd(a, b) * b
}

/// Modulo that always lands in `[0, m)`, also for negative `x`
pub fn positive_mod(x: i64, m: usize) -> usize {
    let m = m as i64;
    (((x % m) + m) % m) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gcd_lcm() {
        assert_eq!(gcd(2, 3), 1);
        assert_eq!(gcd(4, 6), 2);
        assert_eq!(gcd(6, 9), 3);
        assert_eq!(gcd(5, 0), 5);
        assert_eq!(lcm(2, 3), 6);
        assert_eq!(lcm(4, 6), 12);
        assert_eq!(lcm(1, 4), 4);
        assert_eq!(lcm(0, 4), 0);
    }

    #[test]
    fn test_positive_mod() {
        assert_eq!(positive_mod(-1, 4), 3);
        assert_eq!(positive_mod(-8, 4), 0);
        assert_eq!(positive_mod(-9, 4), 3);
        assert_eq!(positive_mod(7, 4), 3);
        assert_eq!(positive_mod(0, 1), 0);
        // native remainder keeps the sign
        assert_eq!(-1i64 % 4, -1);
    }

    #[test]
    fn test_rank_coordinates() {
        // P=2 columns, Q=3 rows
        let topo = GridTopology::new(5, 6, 2).unwrap();
        assert_eq!(topo.height, 3);
        assert_eq!((topo.row, topo.col), (2, 1));
        assert_eq!((topo.gcd, topo.lcm), (1, 6));
        assert_eq!(topo.tile_rows(), 2);
        assert_eq!(topo.tile_cols(), 3);
        for rank in 0..6 {
            let (r, c) = (topo.row_of(rank), topo.col_of(rank));
            assert_eq!(topo.rank_at(r as i64, c as i64), rank);
        }
        assert_eq!(topo.rank_at(-1, -1), 5);
    }

    #[test]
    fn test_invalid_geometry() {
        let err = GridTopology::new(0, 6, 4).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("P=4"));
        assert!(GridTopology::new(0, 6, 0).is_err());
        assert!(GridTopology::new(6, 6, 2).is_err());
    }

    #[test]
    fn test_remainder_distribution() {
        // 5 block rows over Q=2 rows: 3 + 2
        let top = GridTopology::new(0, 4, 2).unwrap();
        let bottom = GridTopology::new(2, 4, 2).unwrap();
        assert_eq!(top.height_per_rank(5), 3);
        assert_eq!(bottom.height_per_rank(5), 2);

        let total: usize = (0..4)
            .map(|r| {
                let t = GridTopology::new(r, 4, 2).unwrap();
                t.height_per_rank(5) * t.width_per_rank(5)
            })
            .sum();
        assert_eq!(total, 25);
    }
}
