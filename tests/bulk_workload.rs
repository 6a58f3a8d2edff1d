use cowtree::{RTree, Rect};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

// A long interleaving of inserts, deletes, and window searches, verified
// against a flat model after every batch.
#[test]
fn mixed_workload_matches_model() {
    let mut rng = SmallRng::seed_from_u64(0xC0FFEE);
    let mut tree: RTree<2, f64, u64> = RTree::new();
    let mut model: Vec<([f64; 2], [f64; 2], u64)> = Vec::new();
    let mut next_id = 0u64;

    for round in 0..50 {
        // grow
        for _ in 0..100 {
            let min = [rng.gen_range(-500.0..500.0), rng.gen_range(-500.0..500.0)];
            let max = [min[0] + rng.gen_range(0.0..20.0), min[1] + rng.gen_range(0.0..20.0)];
            tree.insert(min, max, next_id).unwrap();
            model.push((min, max, next_id));
            next_id += 1;
        }
        // shrink
        for _ in 0..40 {
            if model.is_empty() {
                break;
            }
            let at = rng.gen_range(0..model.len());
            let (min, max, id) = model.swap_remove(at);
            assert!(tree.delete(min, max, &id).unwrap(), "live item must delete");
        }

        assert_eq!(tree.len(), model.len());
        tree.check_invariants();

        // probe
        let wmin = [rng.gen_range(-600.0..500.0), rng.gen_range(-600.0..500.0)];
        let wmax = [wmin[0] + rng.gen_range(0.0..300.0), wmin[1] + rng.gen_range(0.0..300.0)];
        let window = Rect::new(wmin, wmax);
        let mut found: Vec<u64> = Vec::new();
        tree.search(wmin, wmax, |_, _, item| {
            found.push(*item);
            true
        });
        found.sort_unstable();
        let mut expected: Vec<u64> = model
            .iter()
            .filter(|(min, max, _)| window.intersects(&Rect::new(*min, *max)))
            .map(|(_, _, id)| *id)
            .collect();
        expected.sort_unstable();
        assert_eq!(found, expected, "round {round}: search disagrees with model");

        // the nearest item must match a brute-force pass over the model
        if !model.is_empty() {
            let q = [rng.gen_range(-500.0..500.0), rng.gen_range(-500.0..500.0)];
            let mut first = None;
            tree.nearest(q, |item, dist| {
                first = Some((*item, dist));
                false
            })
            .unwrap();
            let (_, got) = first.unwrap();
            let best = model
                .iter()
                .map(|(min, max, _)| Rect::new(*min, *max).squared_distance(&q))
                .fold(f64::INFINITY, f64::min);
            assert!((got - best).abs() < 1e-9, "round {round}: nearest disagrees");
        }
    }

    // drain whatever is left
    while let Some((min, max, id)) = model.pop() {
        assert!(tree.delete(min, max, &id).unwrap());
    }
    assert!(tree.is_empty());
    tree.check_invariants();
}
