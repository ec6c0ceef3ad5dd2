//! Benchmarks for the per-answer forwarding decision.

use criterion::{black_box, BenchmarkId, Criterion};
use std::rc::Rc;

use gdns::dns::{DnsQuery, TYPE_A};
use gdns::proxy::{Proxy, Transport, Trust};
use gdns::session::Session;
use gdns::subnet::SubnetTable;

fn build_dns_response(query: &[u8], ip: [u8; 4]) -> Vec<u8> {
    let mut response = query.to_vec();
    response[2] = 0x81; // Response flag
    response[3] = 0x80; // Recursion available
    response[6] = 0x00; // Answer count
    response[7] = 0x01;
    response.extend_from_slice(&[0xc0, 0x0c]); // Name pointer
    response.extend_from_slice(&TYPE_A.to_be_bytes());
    response.extend_from_slice(&[0x00, 0x01]); // Class: IN
    response.extend_from_slice(&[0x00, 0x00, 0x01, 0x2c]); // TTL: 300
    response.extend_from_slice(&[0x00, 0x04]); // Data length: 4
    response.extend_from_slice(&ip);
    response
}

fn bench_forward_action(c: &mut Criterion) {
    let query = DnsQuery::a("example.com", 0x1234).to_bytes();
    let subnets = Rc::new(SubnetTable::build(["114.212.0.0/15", "10.0.0.0/8"]).unwrap());
    let mut session = Session::new("127.0.0.1:40000".parse().unwrap(), &query, subnets);

    let external = Proxy::new("8.8.8.8:53".parse().unwrap(), Transport::Udp, Trust::External);
    let internal_answer = build_dns_response(&query, [114, 212, 80, 233]);
    let external_answer = build_dns_response(&query, [93, 184, 216, 34]);

    let mut group = c.benchmark_group("decision");

    group.bench_function(BenchmarkId::new("forward_action", "internal_address"), |b| {
        b.iter(|| session.forward_action(&external, black_box(&internal_answer), black_box(40)))
    });

    group.bench_function(BenchmarkId::new("forward_action", "scored"), |b| {
        b.iter(|| session.forward_action(&external, black_box(&external_answer), black_box(40)))
    });

    group.finish();
}

fn main() {
    let mut criterion = Criterion::default().configure_from_args();
    bench_forward_action(&mut criterion);
    criterion.final_summary();
}
