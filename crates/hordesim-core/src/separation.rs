//! Two-pass local separation.
//!
//! Pass one computes a repulsion force per agent from the previous tick's
//! spatial index without touching any shared state; the world then applies
//! the collected forces to velocities at the join. Splitting compute and
//! apply keeps one agent's movement from being read half-updated by a
//! concurrent force computation.

use hordesim_index::{GridIndex, NeighborhoodIndex};
use rayon::prelude::*;

/// Pairwise repulsion per agent: inverse-distance weighted push vectors,
/// capped at `max_push`. Returns one force per dense agent row.
pub(crate) fn compute_forces(
    index: &GridIndex,
    positions: &[(f32, f32)],
    radius: f32,
    strength: f32,
    max_push: f32,
) -> Vec<(f32, f32)> {
    if radius <= 0.0 || strength <= 0.0 || max_push <= 0.0 {
        return vec![(0.0, 0.0); positions.len()];
    }
    let radius_sq = radius * radius;
    (0..positions.len())
        .into_par_iter()
        .map(|idx| {
            let origin = positions[idx];
            let mut fx = 0.0f32;
            let mut fy = 0.0f32;
            index.neighbors_within(positions, origin, radius_sq, &mut |other, dist_sq| {
                if other == idx {
                    return;
                }
                let dist_sq = dist_sq.into_inner();
                if dist_sq <= 1e-6 {
                    // Coincident agents get a deterministic axis push keyed
                    // on index order so the pair splits instead of jittering.
                    let sign = if idx < other { -1.0 } else { 1.0 };
                    fx += sign * max_push;
                    return;
                }
                let dist = dist_sq.sqrt();
                let weight = strength / dist;
                fx += (origin.0 - positions[other].0) / dist * weight;
                fy += (origin.1 - positions[other].1) / dist * weight;
            });
            let magnitude = (fx * fx + fy * fy).sqrt();
            if magnitude > max_push {
                let scale = max_push / magnitude;
                (fx * scale, fy * scale)
            } else {
                (fx, fy)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built_index(positions: &[(f32, f32)]) -> GridIndex {
        let mut index = GridIndex::new(5.0, 0.0).expect("index");
        index.rebuild(positions);
        index.swap();
        index
    }

    #[test]
    fn close_pair_pushes_apart_symmetrically() {
        let positions = [(0.0, 0.0), (2.0, 0.0)];
        let index = built_index(&positions);
        let forces = compute_forces(&index, &positions, 4.0, 3.0, 10.0);
        assert!(forces[0].0 < 0.0, "left agent pushed further left");
        assert!(forces[1].0 > 0.0, "right agent pushed further right");
        assert!((forces[0].0 + forces[1].0).abs() < 1e-5);
        assert!((forces[0].1).abs() < 1e-5 && (forces[1].1).abs() < 1e-5);
    }

    #[test]
    fn force_magnitude_is_capped() {
        let positions = [(0.0, 0.0), (0.01, 0.0), (0.0, 0.01), (-0.01, 0.0)];
        let index = built_index(&positions);
        let forces = compute_forces(&index, &positions, 4.0, 50.0, 2.5);
        for (fx, fy) in forces {
            assert!((fx * fx + fy * fy).sqrt() <= 2.5 + 1e-4);
        }
    }

    #[test]
    fn agents_outside_the_radius_feel_nothing() {
        let positions = [(0.0, 0.0), (40.0, 40.0)];
        let index = built_index(&positions);
        let forces = compute_forces(&index, &positions, 4.0, 3.0, 10.0);
        assert_eq!(forces, vec![(0.0, 0.0); 2]);
    }

    #[test]
    fn unbuilt_index_yields_zero_forces() {
        let positions = [(0.0, 0.0), (0.5, 0.0)];
        let index = GridIndex::new(5.0, 0.0).expect("index");
        let forces = compute_forces(&index, &positions, 4.0, 3.0, 10.0);
        assert_eq!(forces, vec![(0.0, 0.0); 2]);
    }

    #[test]
    fn coincident_agents_split_deterministically() {
        let positions = [(1.0, 1.0), (1.0, 1.0)];
        let index = built_index(&positions);
        let first = compute_forces(&index, &positions, 4.0, 3.0, 10.0);
        let second = compute_forces(&index, &positions, 4.0, 3.0, 10.0);
        assert_eq!(first, second);
        assert!(first[0].0 < 0.0 && first[1].0 > 0.0);
    }
}
