use criterion::Criterion;
use criterion::{criterion_group, criterion_main};

use labrpc::tokio::{runtime::Builder, time::Instant};

use std::time::Duration;

use paxos::tests::{fast_config, random_string, Cluster};

fn bench_propose(c: &mut Criterion) {
    const N: u32 = 5;
    const NPROPOSALS: usize = 200;

    c.bench_function(
        &format!("{} proposals to a group of {}", NPROPOSALS, N),
        |b| {
            b.iter_custom(|iters| {
                let rt = Builder::new_multi_thread()
                    .worker_threads(8)
                    .enable_all()
                    .build()
                    .unwrap();

                rt.block_on(async {
                    let cluster = Cluster::new(N, fast_config()).await.unwrap();
                    let members: Vec<u32> = (0..N).collect();
                    assert!(cluster.create_group("bench-1", &members, ""));

                    let start = Instant::now();
                    let mut expected = 0;
                    for _ in 0..iters {
                        for i in 0..NPROPOSALS {
                            // Spread proposals so that followers forward too.
                            cluster.propose(i as u32 % N, "bench-1", &random_string(16));
                        }
                        expected += NPROPOSALS;
                        let done = cluster
                            .wait_until(Duration::from_secs(60), |c| {
                                c.values(N - 1, "bench-1").len() >= expected
                            })
                            .await;
                        assert!(done, "proposals were not decided in time");
                    }
                    start.elapsed()
                })
            });
        },
    );
}

criterion_group!(
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_propose,
);
criterion_main!(benches);
