use cowtree::RTree;

fn grid_point(i: u64) -> [f64; 2] {
    [(i % 25) as f64, (i / 25) as f64]
}

#[test]
fn original_unaffected_by_clone_deletes() {
    let mut tree: RTree<2, f64, u64> = RTree::new();
    for i in 0..500 {
        tree.insert_point(grid_point(i), i).unwrap();
    }
    let mut clone = tree.clone();
    for i in 0..100 {
        assert!(clone.delete_point(grid_point(i), &i).unwrap());
    }
    assert_eq!(clone.len(), 400);
    assert_eq!(tree.len(), 500);

    // Every original item is still visible through the original handle.
    let mut seen = vec![false; 500];
    tree.scan(|_, _, item| {
        seen[*item as usize] = true;
        true
    });
    assert!(seen.iter().all(|s| *s));
    tree.check_invariants();
    clone.check_invariants();
}

#[test]
fn original_unaffected_by_clone_inserts_and_drop() {
    let mut tree: RTree<2, f64, u64> = RTree::new();
    for i in 0..100 {
        tree.insert_point(grid_point(i), i).unwrap();
    }
    let mut clone = tree.clone();
    for i in 100..200 {
        clone.insert_point(grid_point(i), i).unwrap();
    }
    assert_eq!(clone.len(), 200);
    drop(clone);

    assert_eq!(tree.len(), 100);
    let mut count = 0;
    tree.scan(|_, _, _| {
        count += 1;
        true
    });
    assert_eq!(count, 100);
    tree.check_invariants();
}

#[test]
fn chained_clones_release_in_any_order() {
    let mut a: RTree<2, f64, u64> = RTree::new();
    for i in 0..300 {
        a.insert_point(grid_point(i), i).unwrap();
    }
    let b = a.clone();
    let mut c = b.clone();
    for i in 0..150 {
        assert!(c.delete_point(grid_point(i), &i).unwrap());
    }

    // Dropping the middle handle first must not disturb the outer two.
    drop(b);
    assert_eq!(a.len(), 300);
    assert_eq!(c.len(), 150);
    a.check_invariants();
    c.check_invariants();

    drop(a);
    assert_eq!(c.len(), 150);
    c.check_invariants();
}

#[test]
fn each_clone_searches_with_its_own_queue() {
    let mut a: RTree<2, f64, u64> = RTree::new();
    for i in 0..200 {
        a.insert_point(grid_point(i), i).unwrap();
    }
    let mut b = a.clone();

    let mut from_a = Vec::new();
    a.nearest([12.0, 4.0], |item, dist| {
        from_a.push((*item, dist));
        from_a.len() < 50
    })
    .unwrap();
    let mut from_b = Vec::new();
    b.nearest([12.0, 4.0], |item, dist| {
        from_b.push((*item, dist));
        from_b.len() < 50
    })
    .unwrap();
    assert_eq!(from_a, from_b);
}
