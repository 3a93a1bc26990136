//! TLS Socket Benchmarks
//!
//! This benchmark suite measures:
//! - Context store initialization from certificate files
//! - Full loopback handshake (accept + connect) through the socket engine
//! - Encrypted echo of payloads of various sizes over an established session
//!
//! Run with: cargo bench --bench handshake

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use socket2::{Domain, SockAddr};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use tlsio::config::TlsSettings;
use tlsio::socket::{Socket, SocketEngine, SocketHandler};
use tlsio::tls::{TlsContextStore, TlsModule};

const SERVER_PEM: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/server.pem");

struct Echo;

impl SocketHandler for Echo {
    fn on_incoming(&mut self, _peer: &SockAddr) -> Box<dyn SocketHandler> {
        Box::new(Echo)
    }

    fn on_read(&mut self, data: &[u8], out: &mut BytesMut) {
        out.extend_from_slice(data);
    }
}

struct Client {
    connected: Rc<Cell<bool>>,
    received: Rc<RefCell<usize>>,
}

impl SocketHandler for Client {
    fn on_connect(&mut self) {
        self.connected.set(true);
    }

    fn on_read(&mut self, data: &[u8], _out: &mut BytesMut) {
        *self.received.borrow_mut() += data.len();
    }
}

fn settings() -> TlsSettings {
    TlsSettings::with_files(SERVER_PEM, SERVER_PEM)
}

/// Engine with an echoing TLS listener; returns the listener port
fn echo_engine(module: &TlsModule) -> (SocketEngine, u16) {
    let mut engine = SocketEngine::new();
    let listener =
        Socket::listen("127.0.0.1:0".parse().unwrap(), module.tls_io(), Box::new(Echo)).unwrap();
    let port = listener.local_addr().unwrap().port();
    engine.add(listener);
    (engine, port)
}

fn run_until(engine: &mut SocketEngine, done: impl Fn() -> bool) {
    while !done() {
        engine.run_once(Some(Duration::from_millis(10))).unwrap();
    }
}

// ========== Context Benchmarks ==========

fn bench_context_initialize(c: &mut Criterion) {
    let settings = settings();

    c.bench_function("context_initialize", |b| {
        b.iter(|| {
            let store = TlsContextStore::initialize(black_box(&settings.ssl)).unwrap();
            black_box(store.has_identity());
        });
    });
}

// ========== Handshake Benchmarks ==========

fn bench_loopback_handshake(c: &mut Criterion) {
    let module = TlsModule::load(settings()).unwrap();
    let (mut engine, port) = echo_engine(&module);

    c.bench_function("loopback_handshake", |b| {
        b.iter(|| {
            let connected = Rc::new(Cell::new(false));
            let handler = Client {
                connected: connected.clone(),
                received: Rc::new(RefCell::new(0)),
            };
            let mut client =
                Socket::outbound(Domain::IPV4, module.tls_io(), Box::new(handler)).unwrap();
            client.connect("127.0.0.1", port).unwrap();
            let fd = engine.add(client);

            run_until(&mut engine, || connected.get());

            // Closing the client lets the server side see EOF and get reaped
            engine.remove(fd);
            engine.run_once(Some(Duration::from_millis(1))).unwrap();
        });
    });
}

// ========== Record I/O Benchmarks ==========

fn bench_echo(c: &mut Criterion) {
    let module = TlsModule::load(settings()).unwrap();
    let (mut engine, port) = echo_engine(&module);

    let connected = Rc::new(Cell::new(false));
    let received = Rc::new(RefCell::new(0usize));
    let handler = Client {
        connected: connected.clone(),
        received: received.clone(),
    };
    let mut client = Socket::outbound(Domain::IPV4, module.tls_io(), Box::new(handler)).unwrap();
    client.connect("127.0.0.1", port).unwrap();
    let fd = engine.add(client);
    run_until(&mut engine, || connected.get());

    let mut group = c.benchmark_group("tls_echo");
    for size in [64usize, 4 * 1024, 64 * 1024] {
        let payload = vec![0x5a; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| {
                *received.borrow_mut() = 0;
                if let Some(socket) = engine.get_mut(fd) {
                    socket.write(black_box(payload));
                }
                run_until(&mut engine, || *received.borrow() >= payload.len());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_context_initialize, bench_loopback_handshake, bench_echo);
criterion_main!(benches);
