use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ib_echo::{
    config::DeviceConfig,
    descriptor::ConnectionDescriptor,
    qp::QpStateMachine,
    ring::{BufferRing, RingCursor},
    verbs::{mock::MockVerbs, QpCaps, RecvWr, SendWr, VerbsOps, WorkCompletion},
};

const MESSAGE_SIZE: usize = 64;
const SLOTS: usize = 16;

fn descriptor(verbs: &MockVerbs) -> ConnectionDescriptor {
    ConnectionDescriptor {
        lid: verbs.port_attr().lid,
        qp_num: verbs.qp_num(),
        gid: verbs.gid(),
    }
}

fn connected_pair() -> (MockVerbs, MockVerbs) {
    let (mut a, mut b) = MockVerbs::pair(QpCaps::for_concurrency(SLOTS));
    let (da, db) = (descriptor(&a), descriptor(&b));
    let cfg = DeviceConfig::default();
    QpStateMachine::new().connect(&mut a, &db, &cfg).unwrap();
    QpStateMachine::new().connect(&mut b, &da, &cfg).unwrap();
    (a, b)
}

fn benchmark_cursor_advance(c: &mut Criterion) {
    let mut cursor = RingCursor::new(MESSAGE_SIZE, MESSAGE_SIZE * SLOTS).unwrap();
    c.bench_function("cursor advance", |b| b.iter(|| black_box(cursor.advance())));
}

fn benchmark_mock_echo(c: &mut Criterion) {
    let (mut a, mut b) = connected_pair();
    let mut ring_a = BufferRing::new(&mut a, MESSAGE_SIZE, SLOTS).unwrap();
    let mut ring_b = BufferRing::new(&mut b, MESSAGE_SIZE, SLOTS).unwrap();
    let mut wc = [WorkCompletion::default(); 4];
    c.bench_function("mock send and receive", |bench| {
        bench.iter(|| {
            let recv_slot = ring_b.next_recv_slot();
            b.post_recv(&RecvWr {
                wr_id: recv_slot as u64,
                sge: ring_b.sge(recv_slot),
            })
            .unwrap();
            let send_slot = ring_a.next_send_slot();
            a.post_send(&SendWr {
                wr_id: send_slot as u64,
                sge: ring_a.sge(send_slot),
                imm_data: 2u32.to_be(),
            })
            .unwrap();
            black_box(a.poll_cq(&mut wc).unwrap());
            black_box(b.poll_cq(&mut wc).unwrap());
        })
    });
}

criterion_group!(benches, benchmark_cursor_advance, benchmark_mock_echo);
criterion_main!(benches);
