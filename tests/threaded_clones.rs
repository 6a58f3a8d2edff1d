use cowtree::RTree;
use std::thread;

fn grid_point(i: u64) -> [f64; 2] {
    [(i % 40) as f64, (i / 40) as f64]
}

// Clones are independent handles: each thread takes one and mutates it
// freely while the original stays behind, untouched.
#[test]
fn clones_mutate_concurrently() {
    let mut tree: RTree<2, f64, u64> = RTree::new();
    for i in 0..1000 {
        tree.insert_point(grid_point(i), i).unwrap();
    }

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let mut clone = tree.clone();
            thread::spawn(move || {
                for i in (t * 250)..(t * 250 + 250) {
                    assert!(clone.delete_point(grid_point(i), &i).unwrap());
                }
                for i in 0..100 {
                    clone
                        .insert_point([5000.0 + i as f64, t as f64], 10_000 + t * 100 + i)
                        .unwrap();
                }
                clone.check_invariants();
                clone.len()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 1000 - 250 + 100);
    }

    assert_eq!(tree.len(), 1000);
    tree.check_invariants();
}

#[test]
fn readers_share_a_snapshot_across_threads() {
    let mut tree: RTree<2, f64, u64> = RTree::new();
    for i in 0..2000 {
        tree.insert_point(grid_point(i), i).unwrap();
    }

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let snapshot = tree.clone();
            thread::spawn(move || {
                let mut hits = 0usize;
                snapshot.search([0.0, 0.0], [39.0, 9.0], |_, _, _| {
                    hits += 1;
                    true
                });
                hits
            })
        })
        .collect();

    // The original keeps mutating while the snapshots are being read.
    for i in 0..500 {
        assert!(tree.delete_point(grid_point(i), &i).unwrap());
    }

    for reader in readers {
        assert_eq!(reader.join().unwrap(), 400);
    }
    tree.check_invariants();
}
