//! Template resolution and proxy checkout throughput
//!
//! Both sit on the per-step hot path of every worker.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bulkcheck_lib::domain::proxy::ProxyEndpoint;
use bulkcheck_lib::domain::variables::{Variable, VariableScope};
use bulkcheck_lib::runner::template::{resolve, resolve_expanding, Bindings};
use bulkcheck_lib::runner::ProxyPool;

fn scope() -> VariableScope {
    let mut scope = VariableScope::new();
    scope.set(Variable::scalar("USER", "alice@example.com"));
    scope.set(Variable::scalar("PASS", "hunter2"));
    scope.set(Variable::list("IDS", (0..50).map(|i| format!("id{i}"))));
    scope.set_hidden(Variable::map(
        "HEADERS",
        [("Content-Type", "text/html"), ("Server", "nginx"), ("X-Id", "42")],
    ));
    scope
}

fn benchmark_resolve(c: &mut Criterion) {
    let scope = scope();
    let bindings = Bindings::new(&scope).with_reserved("BOTNUM", "7");
    let body = "login=<USER>&password=<PASS>&bot=<BOTNUM>&first=<IDS[0]>&server=<HEADERS(Server)>";

    c.bench_function("resolve_form_body", |b| {
        b.iter(|| resolve(black_box(body), &bindings));
    });
    c.bench_function("resolve_plain_text", |b| {
        b.iter(|| resolve(black_box("no tokens in this line at all"), &bindings));
    });
    c.bench_function("resolve_expanding_list", |b| {
        b.iter(|| resolve_expanding(black_box("https://example.com/item/<IDS[*]>"), &bindings));
    });
}

fn benchmark_checkout(c: &mut Criterion) {
    let pool = ProxyPool::from_endpoints((1..=200).filter_map(|i| {
        format!("10.0.{}.{}:8080", i / 250, i % 250)
            .parse::<ProxyEndpoint>()
            .ok()
    }));

    c.bench_function("proxy_checkout_return", |b| {
        b.iter(|| {
            if let Some(handle) = pool.get_proxy(false, 0, false) {
                pool.return_proxy(handle);
            }
        });
    });
}

criterion_group!(benches, benchmark_resolve, benchmark_checkout);
criterion_main!(benches);
