//! Placement policy: turning a write size into a schema.
//!
//! A schema is an ordered list of `(target, size)` entries summing to the
//! write's size. The policy greedily fills from the highest-scoring target
//! down, holding back a configurable headroom fraction of each target's
//! capacity so one large write cannot starve concurrent writers. Ties
//! between equally-scored targets break by ascending target id, so the same
//! inputs always produce the same schema.

use snafu::Snafu;

use crate::id::TargetId;

#[derive(Debug, Snafu)]
pub enum PlacementError {
    #[snafu(display(
        "no placement covers {} bytes ({} usable across {} targets)",
        size,
        usable,
        targets
    ))]
    InsufficientCapacity {
        size: u64,
        usable: u64,
        targets: usize,
    },
}

/// Point-in-time view of one target, taken under its allocator lock.
#[derive(Clone, Copy, Debug)]
pub struct TargetSnapshot {
    pub id: TargetId,
    pub capacity: u64,
    pub remaining: u64,
    pub alignment: u64,
    /// Effective score: bandwidth/latency rank discounted by occupancy.
    pub score: f64,
}

impl TargetSnapshot {
    /// Bytes a single placement may take from this target: the remaining
    /// space minus the headroom reserve, rounded down to whole allocation
    /// units so the reservation cannot fail on alignment.
    fn usable(&self, headroom: f64) -> u64 {
        let reserve = (self.capacity as f64 * headroom) as u64;
        let usable = self.remaining.saturating_sub(reserve);
        usable - usable % self.alignment
    }
}

/// One entry of a placement schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchemaEntry {
    pub target: TargetId,
    pub size: u64,
}

/// An ordered list of `(target, size)` entries summing to a write's size.
#[derive(Clone, Debug, Default)]
pub struct PlacementSchema {
    pub entries: Vec<SchemaEntry>,
}

impl PlacementSchema {
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// Computes a schema placing `size` bytes across `targets`.
///
/// Targets are considered from highest score to lowest; each contributes
/// as much usable space as it has until the size is covered. Returns
/// [`PlacementError::InsufficientCapacity`] when the targets cannot cover
/// the request.
pub fn compute_schema(
    size: u64,
    targets: &[TargetSnapshot],
    headroom: f64,
) -> Result<PlacementSchema, PlacementError> {
    let mut schema = PlacementSchema::default();
    if size == 0 {
        return Ok(schema);
    }

    let mut ordered: Vec<&TargetSnapshot> = targets.iter().collect();
    ordered.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut outstanding = size;
    for target in ordered {
        let usable = target.usable(headroom);
        if usable == 0 {
            continue;
        }
        let take = outstanding.min(usable);
        schema.entries.push(SchemaEntry {
            target: target.id,
            size: take,
        });
        outstanding -= take;
        if outstanding == 0 {
            return Ok(schema);
        }
    }

    Err(PlacementError::InsufficientCapacity {
        size,
        usable: size - outstanding,
        targets: targets.len(),
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn target(device: u16, capacity: u64, remaining: u64, score: f64) -> TargetSnapshot {
        TargetSnapshot {
            id: TargetId {
                node: 0,
                device,
                slab: device,
            },
            capacity,
            remaining,
            alignment: 4096,
            score,
        }
    }

    #[test]
    fn fills_highest_score_first() {
        let targets = [
            target(1, 4 << 20, 4 << 20, 0.4),
            target(0, 512 * 1024, 512 * 1024, 0.9),
        ];
        let schema = compute_schema(1 << 20, &targets, 0.0).unwrap();
        assert_eq!(schema.entries.len(), 2);
        assert_eq!(schema.entries[0].target.device, 0);
        assert_eq!(schema.entries[0].size, 512 * 1024);
        assert_eq!(schema.entries[1].target.device, 1);
        assert_eq!(schema.entries[1].size, 512 * 1024);
    }

    #[test]
    fn equal_scores_break_ties_by_ascending_id() {
        let targets = [
            target(2, 1 << 20, 1 << 20, 0.5),
            target(1, 1 << 20, 1 << 20, 0.5),
        ];
        let schema = compute_schema(4096, &targets, 0.0).unwrap();
        assert_eq!(schema.entries[0].target.device, 1);
    }

    #[test]
    fn insufficient_capacity_is_an_error() {
        let targets = [target(0, 1 << 20, 64 * 1024, 0.9)];
        let err = compute_schema(1 << 20, &targets, 0.0).unwrap_err();
        assert!(matches!(err, PlacementError::InsufficientCapacity { .. }));
    }

    #[test]
    fn headroom_holds_back_a_capacity_fraction() {
        let targets = [
            target(0, 1 << 20, 1 << 20, 0.9),
            target(1, 8 << 20, 8 << 20, 0.4),
        ];
        let schema = compute_schema(1 << 20, &targets, 0.10).unwrap();
        // 10% of 1MiB held back, rounded to whole 4k units.
        let reserve = (1u64 << 20) / 10;
        let expected = (1u64 << 20) - reserve;
        let expected = expected - expected % 4096;
        assert_eq!(schema.entries[0].size, expected);
        assert_eq!(schema.total_size(), 1 << 20);
    }

    #[test]
    fn zero_sized_write_yields_empty_schema() {
        let targets = [target(0, 1 << 20, 1 << 20, 0.9)];
        let schema = compute_schema(0, &targets, 0.0).unwrap();
        assert!(schema.entries.is_empty());
    }

    proptest! {
        #[test]
        fn schema_always_sums_to_request_and_respects_remaining(
            size in 1u64..32_000_000,
            caps in proptest::collection::vec(4096u64..16_000_000, 1..6),
        ) {
            let targets: Vec<TargetSnapshot> = caps
                .iter()
                .enumerate()
                .map(|(i, cap)| {
                    let cap = cap - cap % 4096;
                    let device = u16::try_from(i).unwrap();
                    target(device, cap, cap, 1.0 / (i as f64 + 1.0))
                })
                .collect();

            match compute_schema(size, &targets, 0.0) {
                Ok(schema) => {
                    prop_assert_eq!(schema.total_size(), size);
                    for entry in &schema.entries {
                        let snapshot = targets.iter().find(|t| t.id == entry.target).unwrap();
                        prop_assert!(entry.size <= snapshot.remaining);
                    }
                }
                Err(PlacementError::InsufficientCapacity { .. }) => {
                    let total: u64 = targets.iter().map(|t| t.remaining).sum();
                    prop_assert!(total < size);
                }
            }
        }
    }
}
