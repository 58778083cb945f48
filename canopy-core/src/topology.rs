//! k-ary tree arithmetic over ranks `[0, size)`.
//!
//! Pure functions of `(size, fanout)`; no I/O, no state beyond the two
//! parameters. Rank 0 is the root; rank r's children are
//! `fanout*r + 1 ..= fanout*r + fanout`, clipped to `size`.

use crate::error::{Error, Result};

/// A k-ary labeled tree over ranks `[0, size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    size: u32,
    fanout: u32,
}

impl Topology {
    /// Create a topology. `size` and `fanout` must both be nonzero.
    pub fn new(size: u32, fanout: u32) -> Result<Self> {
        if size == 0 {
            return Err(Error::invalid("topology size must be nonzero"));
        }
        if fanout == 0 {
            return Err(Error::invalid("topology fanout must be nonzero"));
        }
        Ok(Self { size, fanout })
    }

    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub const fn fanout(&self) -> u32 {
        self.fanout
    }

    fn check_rank(&self, rank: u32) -> Result<()> {
        if rank >= self.size {
            return Err(Error::invalid(format!(
                "rank {rank} out of range for size {}",
                self.size
            )));
        }
        Ok(())
    }

    /// Parent of `rank`, or `None` for the root.
    pub fn parent(&self, rank: u32) -> Result<Option<u32>> {
        self.check_rank(rank)?;
        if rank == 0 {
            Ok(None)
        } else {
            Ok(Some((rank - 1) / self.fanout))
        }
    }

    /// The i-th child of `rank`, if it exists.
    pub fn child(&self, rank: u32, i: u32) -> Result<Option<u32>> {
        self.check_rank(rank)?;
        if i >= self.fanout {
            return Ok(None);
        }
        let child = u64::from(self.fanout) * u64::from(rank) + u64::from(i) + 1;
        if child < u64::from(self.size) {
            Ok(Some(child as u32))
        } else {
            Ok(None)
        }
    }

    /// Number of direct children of `rank`.
    pub fn children_count(&self, rank: u32) -> Result<u32> {
        self.check_rank(rank)?;
        let first = u64::from(self.fanout) * u64::from(rank) + 1;
        if first >= u64::from(self.size) {
            return Ok(0);
        }
        let last = (first + u64::from(self.fanout)).min(u64::from(self.size));
        Ok((last - first) as u32)
    }

    /// Iterate the direct children of `rank`.
    pub fn children(&self, rank: u32) -> Result<impl Iterator<Item = u32>> {
        let count = self.children_count(rank)?;
        let first = self.fanout * rank + 1;
        Ok((0..count).map(move |i| first + i))
    }

    /// The child of `rank` whose subtree contains `dst`, or `None` when
    /// `dst` is not below `rank`.
    pub fn child_route(&self, rank: u32, dst: u32) -> Result<Option<u32>> {
        self.check_rank(rank)?;
        self.check_rank(dst)?;
        // Climb dst's ancestry; it is in rank's subtree iff the walk passes
        // through rank before reaching or crossing it.
        let mut hop = dst;
        while hop > rank {
            let parent = (hop - 1) / self.fanout;
            if parent == rank {
                return Ok(Some(hop));
            }
            hop = parent;
        }
        Ok(None)
    }

    /// Depth of `rank` below the root (root is level 0).
    pub fn level(&self, rank: u32) -> Result<u32> {
        self.check_rank(rank)?;
        let mut level = 0;
        let mut hop = rank;
        while hop > 0 {
            hop = (hop - 1) / self.fanout;
            level += 1;
        }
        Ok(level)
    }

    /// Size of `rank`'s subtree, including `rank` itself.
    pub fn descendants(&self, rank: u32) -> Result<u32> {
        self.check_rank(rank)?;
        let mut total = 1u32;
        for child in self.children(rank)? {
            total += self.descendants(child)?;
        }
        Ok(total)
    }

    /// Ranks with at least one child, in ascending order.
    #[must_use]
    pub fn internal_ranks(&self) -> Vec<u32> {
        (0..self.size)
            .filter(|&r| self.children_count(r).unwrap_or(0) > 0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_degenerate_parameters() {
        assert!(Topology::new(0, 2).is_err());
        assert!(Topology::new(4, 0).is_err());
        assert!(Topology::new(1, 1).is_ok());
    }

    #[test]
    fn binary_seven_shape() {
        let t = Topology::new(7, 2).unwrap();
        assert_eq!(t.parent(0).unwrap(), None);
        assert_eq!(t.parent(1).unwrap(), Some(0));
        assert_eq!(t.parent(2).unwrap(), Some(0));
        assert_eq!(t.parent(5).unwrap(), Some(2));
        assert_eq!(t.parent(6).unwrap(), Some(2));

        assert_eq!(t.child(0, 0).unwrap(), Some(1));
        assert_eq!(t.child(0, 1).unwrap(), Some(2));
        assert_eq!(t.child(2, 0).unwrap(), Some(5));
        assert_eq!(t.child(2, 1).unwrap(), Some(6));
        assert_eq!(t.child(3, 0).unwrap(), None);
        assert_eq!(t.child(0, 2).unwrap(), None);
    }

    #[test]
    fn parent_inverts_child_everywhere() {
        for (size, fanout) in [(1, 1), (7, 2), (16, 2), (13, 3), (100, 7), (5, 16)] {
            let t = Topology::new(size, fanout).unwrap();
            for r in 0..size {
                for i in 0..fanout {
                    if let Some(c) = t.child(r, i).unwrap() {
                        assert_eq!(t.parent(c).unwrap(), Some(r), "size={size} k={fanout} r={r} i={i}");
                    }
                }
            }
        }
    }

    #[test]
    fn child_route_defined_iff_in_subtree() {
        for (size, fanout) in [(7, 2), (13, 3), (31, 2), (9, 8)] {
            let t = Topology::new(size, fanout).unwrap();
            for r in 0..size {
                for dst in 0..size {
                    let route = t.child_route(r, dst).unwrap();
                    // Reference check: climb from dst and see if we pass r.
                    let mut hop = dst;
                    let mut in_subtree = false;
                    let mut via = None;
                    while hop != 0 {
                        let p = (hop - 1) / fanout;
                        if p == r {
                            in_subtree = true;
                            via = Some(hop);
                            break;
                        }
                        hop = p;
                    }
                    if dst == r {
                        assert_eq!(route, None);
                    } else if in_subtree {
                        assert_eq!(route, via, "size={size} k={fanout} r={r} dst={dst}");
                    } else {
                        assert_eq!(route, None, "size={size} k={fanout} r={r} dst={dst}");
                    }
                }
            }
        }
    }

    #[test]
    fn routing_scenario_binary_seven() {
        let t = Topology::new(7, 2).unwrap();
        // Rank 0 sends toward 5: hop through 2, then 5.
        assert_eq!(t.child_route(0, 5).unwrap(), Some(2));
        assert_eq!(t.child_route(2, 5).unwrap(), Some(5));
        assert_eq!(t.child_route(5, 5).unwrap(), None);
        assert_eq!(t.child_route(1, 5).unwrap(), None);
    }

    #[test]
    fn levels_and_descendants() {
        let t = Topology::new(7, 2).unwrap();
        assert_eq!(t.level(0).unwrap(), 0);
        assert_eq!(t.level(2).unwrap(), 1);
        assert_eq!(t.level(6).unwrap(), 2);
        assert_eq!(t.descendants(0).unwrap(), 7);
        assert_eq!(t.descendants(2).unwrap(), 3);
        assert_eq!(t.descendants(5).unwrap(), 1);

        let flat = Topology::new(5, 16).unwrap();
        assert_eq!(flat.level(4).unwrap(), 1);
        assert_eq!(flat.descendants(0).unwrap(), 5);
        assert_eq!(flat.children_count(0).unwrap(), 4);
        assert_eq!(flat.internal_ranks(), vec![0]);
    }

    #[test]
    fn descendants_partition_the_tree() {
        for (size, fanout) in [(7, 2), (13, 3), (40, 4)] {
            let t = Topology::new(size, fanout).unwrap();
            for r in 0..size {
                let children_sum: u32 = t
                    .children(r)
                    .unwrap()
                    .map(|c| t.descendants(c).unwrap())
                    .sum();
                assert_eq!(t.descendants(r).unwrap(), children_sum + 1);
            }
        }
    }
}
