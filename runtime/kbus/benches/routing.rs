use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kbus::{Bus, BusFlags, Connection, Credentials, Destination, Mode, Subsystem};

fn setup(peers: usize) -> (std::sync::Arc<Subsystem>, Vec<std::sync::Arc<Connection>>) {
    let subsystem = Subsystem::new();
    let bus = Bus::create(subsystem.root(), "bench", Mode::WORLD, BusFlags::empty(), 0, 0)
        .expect("bus");
    let ep = bus.default_endpoint().expect("endpoint");
    let conns = (0..peers)
        .map(|_| {
            let conn = Connection::attach(&ep, Credentials::ROOT).expect("attach");
            conn.hello().expect("hello");
            conn
        })
        .collect();
    (subsystem, conns)
}

fn bench_unicast(c: &mut Criterion) {
    let mut group = c.benchmark_group("unicast");

    for size in [16usize, 1024, 65536] {
        let (_subsystem, conns) = setup(2);
        let payload = vec![0x5au8; size];
        let target = conns[1].id();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("send_receive", size), &payload, |b, p| {
            b.iter(|| {
                conns[0]
                    .send(Destination::Id(target), black_box(p.clone()))
                    .expect("send");
                black_box(conns[1].try_receive().expect("receive"));
            })
        });
    }

    group.finish();
}

fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");

    for peers in [2usize, 8, 32] {
        let (_subsystem, conns) = setup(peers + 1);

        group.bench_with_input(BenchmarkId::new("fan_out", peers), &peers, |b, _| {
            b.iter(|| {
                conns[0]
                    .send(Destination::Broadcast, black_box(vec![1, 2, 3, 4]))
                    .expect("broadcast");
                for conn in &conns[1..] {
                    black_box(conn.try_receive().expect("receive"));
                }
            })
        });
    }

    group.finish();
}

fn bench_name_lookup(c: &mut Criterion) {
    let (_subsystem, conns) = setup(2);
    conns[1].set_name("org.example.Bench").expect("set_name");
    let dest = Destination::Name("org.example.Bench".to_string());

    c.bench_function("send_by_name", |b| {
        b.iter(|| {
            conns[0].send(dest.clone(), vec![0; 8]).expect("send");
            black_box(conns[1].try_receive().expect("receive"));
        })
    });
}

criterion_group!(benches, bench_unicast, bench_broadcast, bench_name_lookup);
criterion_main!(benches);
