//! End-to-end poller behavior over a scripted link.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use acqsrv::poller::{Poller, PollerConfig, Target, ValueKind};
use acqsrv::point::{Point, Value};
use async_trait::async_trait;
use fieldbus::{
    ByteOrder, ExceptionCode, LinkConfig, LinkError, Parity, RegisterKind, RegisterLink,
    SerialParams, WordOrder,
};
use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Default)]
struct MockState {
    open_calls: usize,
    close_calls: usize,
    fail_opens_remaining: usize,
    read_addresses: Vec<u16>,
    regs16: HashMap<u16, u16>,
    floats: HashMap<u16, f32>,
    failures: HashMap<u16, LinkError>,
}

struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    fn begin_read(&self, addr: u16) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.read_addresses.push(addr);
        match state.failures.get(&addr) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RegisterLink for MockLink {
    async fn open(&mut self) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.open_calls += 1;
        if state.fail_opens_remaining > 0 {
            state.fail_opens_remaining -= 1;
            return Err(LinkError::io("connection refused"));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        self.state.lock().close_calls += 1;
        Ok(())
    }

    fn set_unit(&mut self, _unit: u8) {}

    async fn read_register16(&mut self, addr: u16, _kind: RegisterKind) -> Result<u16, LinkError> {
        self.begin_read(addr)?;
        self.state
            .lock()
            .regs16
            .get(&addr)
            .copied()
            .ok_or_else(|| LinkError::io("no such register"))
    }

    async fn read_register32(&mut self, addr: u16, _kind: RegisterKind) -> Result<u32, LinkError> {
        self.begin_read(addr)?;
        Err(LinkError::io("no such register"))
    }

    async fn read_float32(&mut self, addr: u16, _kind: RegisterKind) -> Result<f32, LinkError> {
        self.begin_read(addr)?;
        self.state
            .lock()
            .floats
            .get(&addr)
            .copied()
            .ok_or_else(|| LinkError::io("no such register"))
    }
}

fn target(addr: u16, value_kind: ValueKind, label: &str) -> Target {
    Target {
        unit_id: 1,
        register_kind: RegisterKind::Holding,
        address: addr,
        value_kind,
        label: label.to_string(),
        scale_factor: 0.0,
        offset: 0.0,
        decimal_places: 0,
    }
}

fn poller_config(targets: Vec<Target>) -> PollerConfig {
    PollerConfig {
        link: LinkConfig {
            url: "tcp://127.0.0.1:502".to_string(),
            timeout: Duration::from_secs(1),
            byte_order: ByteOrder::Big,
            word_order: WordOrder::HighFirst,
            serial: SerialParams {
                baud_rate: 9600,
                data_bits: 8,
                stop_bits: 1,
                parity: Parity::None,
            },
        },
        poll_interval: Duration::from_millis(20),
        targets,
    }
}

async fn drain_at_least(poller: &Poller, count: usize) -> Vec<Point> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut collected = Vec::new();
    while collected.len() < count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "collected only {} of {count} points in time",
            collected.len()
        );
        collected.extend(poller.drain());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    collected
}

#[tokio::test]
async fn reads_decode_and_transform_in_configured_order() {
    let state = Arc::new(Mutex::new(MockState::default()));
    {
        let mut s = state.lock();
        s.floats.insert(0, 18.7);
        s.regs16.insert(10, 105);
    }

    let mut temperature = target(0, ValueKind::Float32, "site.sensor0.temperature");
    temperature.unit_id = 2;
    let mut humidity = target(10, ValueKind::Uint16, "site.sensor0.humidity");
    humidity.scale_factor = 0.1;
    humidity.decimal_places = 1;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = Poller::spawn_with_link(
        poller_config(vec![temperature, humidity]),
        Box::new(MockLink {
            state: Arc::clone(&state),
        }),
        shutdown_rx,
    );

    let points = drain_at_least(&poller, 2).await;

    // configured order within the tick, untouched f32 on the raw path,
    // f64 promotion on the transformed path
    assert_eq!(points[0].label, "site.sensor0.temperature");
    assert_eq!(points[0].value, Value::F32(18.7));
    assert_eq!(points[1].label, "site.sensor0.humidity");
    assert_eq!(points[1].value, Value::F64(10.5));
}

#[tokio::test]
async fn recoverable_read_failure_skips_only_that_target() {
    let state = Arc::new(Mutex::new(MockState::default()));
    {
        let mut s = state.lock();
        s.regs16.insert(1, 11);
        s.regs16.insert(3, 33);
        s.failures.insert(
            2,
            LinkError::Exception(ExceptionCode::IllegalDataAddress),
        );
    }

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = Poller::spawn_with_link(
        poller_config(vec![
            target(1, ValueKind::Uint16, "site.a"),
            target(2, ValueKind::Uint16, "site.b"),
            target(3, ValueKind::Uint16, "site.c"),
        ]),
        Box::new(MockLink {
            state: Arc::clone(&state),
        }),
        shutdown_rx,
    );

    let points = drain_at_least(&poller, 4).await;
    assert!(points.iter().all(|p| p.label != "site.b"));
    assert_eq!(points[0].label, "site.a");
    assert_eq!(points[1].label, "site.c");

    // the link never went down
    let s = state.lock();
    assert_eq!(s.open_calls, 1);
    assert_eq!(s.close_calls, 0);
}

#[tokio::test]
async fn unrecoverable_failure_closes_link_and_abandons_the_tick() {
    let state = Arc::new(Mutex::new(MockState::default()));
    {
        let mut s = state.lock();
        s.regs16.insert(1, 11);
        s.regs16.insert(3, 33);
        s.failures
            .insert(2, LinkError::io("connection reset by peer"));
    }

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = Poller::spawn_with_link(
        poller_config(vec![
            target(1, ValueKind::Uint16, "site.a"),
            target(2, ValueKind::Uint16, "site.b"),
            target(3, ValueKind::Uint16, "site.c"),
        ]),
        Box::new(MockLink {
            state: Arc::clone(&state),
        }),
        shutdown_rx,
    );

    let points = drain_at_least(&poller, 2).await;
    assert!(points.iter().all(|p| p.label == "site.a"));

    let s = state.lock();
    // the target after the failure is never reached
    assert!(!s.read_addresses.contains(&3));
    // each failing tick closes the link and the next one reopens it
    assert!(s.close_calls >= 1);
    assert!(s.open_calls >= 2);
}

#[tokio::test]
async fn link_open_is_retried_and_targets_skipped_meanwhile() {
    let state = Arc::new(Mutex::new(MockState::default()));
    {
        let mut s = state.lock();
        s.fail_opens_remaining = 1;
        s.regs16.insert(1, 7);
    }

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = Poller::spawn_with_link(
        poller_config(vec![target(1, ValueKind::Uint16, "site.a")]),
        Box::new(MockLink {
            state: Arc::clone(&state),
        }),
        shutdown_rx,
    );

    let points = drain_at_least(&poller, 1).await;
    assert_eq!(points[0].value, Value::U16(7));

    let s = state.lock();
    // the failed open is retried and only then do reads start
    assert_eq!(s.open_calls, 2);
    assert!(!s.read_addresses.is_empty());
}
