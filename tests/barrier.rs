use rb_sor::algs::communicator::LocalFabric;
use rb_sor::algs::reduction::{BARRIER_SENTINEL, ReducerStrategy};
use rb_sor::topology::rank::Topology;
use rb_sor::topology::registry::PeerId;
use std::thread;
use std::time::{Duration, Instant};

const DELAY: Duration = Duration::from_millis(100);

/// Rank `late` enters the reduce `DELAY` after the others; nobody may leave
/// before it has entered.
fn nobody_leaves_early(strategy: ReducerStrategy, size: usize, late: usize) {
    let fabric = LocalFabric::new(size);
    let peers: Vec<PeerId> = (0..size)
        .map(|r| PeerId::new(format!("p{r}"), if r < size / 2 { "a" } else { "b" }))
        .collect();

    let (entered, left) = thread::scope(|s| {
        let handles: Vec<_> = (0..size)
            .map(|r| {
                let comm = fabric.endpoint(r);
                let topo = Topology::from_peers(r, peers.clone()).unwrap();
                s.spawn(move || {
                    let mut reducer = strategy.build(comm, &topo).unwrap();
                    if r == late {
                        thread::sleep(DELAY);
                    }
                    let entered = Instant::now();
                    let v = reducer.reduce(BARRIER_SENTINEL).unwrap();
                    let left = Instant::now();
                    assert_eq!(v, BARRIER_SENTINEL);
                    reducer.end().unwrap();
                    (entered, left)
                })
            })
            .collect();
        let times: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        (times[late].0, times.iter().map(|t| t.1).collect::<Vec<_>>())
    });

    for (r, t) in left.iter().enumerate() {
        assert!(*t >= entered, "{strategy:?}: rank {r} left before rank {late} arrived");
    }
}

#[test]
fn reduce_is_a_barrier_for_every_strategy() {
    for strategy in [ReducerStrategy::Linear, ReducerStrategy::Tree, ReducerStrategy::Cluster] {
        nobody_leaves_early(strategy, 5, 4);
        nobody_leaves_early(strategy, 4, 0);
    }
}
