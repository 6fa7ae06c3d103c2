#[path = "../tests/common.rs"]
mod common;

use common::TestNode;
use criterion::{criterion_group, criterion_main, Criterion};
use fleet::std::Client;
use fleetd_api::{FailureReason, JobAssignment, JobReport, LeaseRef, NewJob};

fn criterion_benchmark(c: &mut Criterion) {
    let server = TestNode::new().unwrap();
    let mut client = server.new_client().unwrap();

    c.bench_function("upload", |b| {
        b.iter(|| client.upload_jobs(&[NewJob::new("https://bench", 1, 600)]).unwrap())
    });

    c.bench_function("get finish", |b| {
        b.iter(|| {
            client
                .upload_jobs(&[NewJob::new("https://bench", 1, 600)])
                .unwrap();
            let JobAssignment::Spider {
                job_id, lease_time, ..
            } = client.get_job().unwrap()
            else {
                panic!("expected a job");
            };
            client
                .finish_job(&JobReport {
                    lease: LeaseRef { job_id, lease_time },
                    reason: FailureReason::Success,
                    reason_data: String::new(),
                })
                .unwrap();
        })
    });

    c.bench_function("get ips", |b| b.iter(|| client.get_ips().unwrap()));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
