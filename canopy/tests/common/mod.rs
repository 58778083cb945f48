//! Multi-rank test harness: one broker per thread over loopback TCP, with
//! generated CURVE certificates and a remote handle per rank for driving
//! scenarios from the test thread.

// Each test binary uses its own subset of the harness.
#![allow(dead_code)]

use canopy::canopy_core::error::Result;
use canopy::canopy_core::topology::Topology;
use canopy::canopy_fabric::cert::{Certificate, PublicKey};
use canopy::{Broker, BrokerBuilder, Remote};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);
const DRIVER_TIMEOUT: Duration = Duration::from_secs(60);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Fast liveness intervals so idle transitions happen within test patience:
/// sync tick min/max, keepalive threshold, child idle threshold.
const LIVENESS: (&str, &str, &str, &str) = ("50ms", "250ms", "100ms", "30s");

pub struct Instance {
    remotes: Vec<Remote>,
    threads: Vec<JoinHandle<()>>,
    topo: Topology,
}

/// Launch a size/fanout instance and wait for every link to come up.
pub fn launch(size: u32, fanout: u32) -> Instance {
    Lazy::force(&TRACING);

    let certs: Vec<Certificate> = (0..size)
        .map(|r| Certificate::generate(format!("rank{r}")).expect("curve keygen"))
        .collect();
    let pubkeys: Vec<PublicKey> = certs.iter().map(|c| *c.public_key()).collect();

    let topo = Topology::new(size, fanout).expect("valid topology");
    let mut ports: HashMap<u32, u16> = HashMap::new();
    for rank in topo.internal_ranks() {
        ports.insert(rank, portpicker::pick_unused_port().expect("free port"));
    }

    let mut remotes = Vec::new();
    let mut threads = Vec::new();
    for (rank, cert) in certs.into_iter().enumerate() {
        let rank = rank as u32;
        let mut builder = BrokerBuilder::new(rank, size)
            .fanout(fanout)
            .certificate(cert)
            .liveness_fsd(LIVENESS.0, LIVENESS.1, LIVENESS.2, LIVENESS.3)
            .expect("liveness intervals parse");
        if let Some(port) = ports.get(&rank) {
            builder = builder.bind_uri(format!("tcp://127.0.0.1:{port}"));
            for child in topo.children(rank).expect("valid rank") {
                builder = builder.authorize(format!("rank{child}"), pubkeys[child as usize]);
            }
        }
        if let Some(parent) = topo.parent(rank).expect("valid rank") {
            let port = ports[&parent];
            builder = builder.parent(
                format!("tcp://127.0.0.1:{port}"),
                pubkeys[parent as usize],
            );
        }

        let (tx, rx) = flume::bounded(1);
        threads.push(std::thread::spawn(move || {
            let broker = builder.build().expect("broker build");
            tx.send(broker.remote()).expect("harness alive");
            broker.run().expect("reactor run");
        }));
        remotes.push(
            rx.recv_timeout(STEP_TIMEOUT)
                .expect("broker thread came up"),
        );
    }

    let instance = Instance {
        remotes,
        threads,
        topo,
    };
    instance.wait_connected();
    instance
}

impl Instance {
    pub fn remote(&self, rank: u32) -> Remote {
        self.remotes[rank as usize].clone()
    }

    /// Run a closure on `rank`'s broker thread and wait for its result. The
    /// closure may drive the reactor with `wait_within`, so the outer
    /// deadline is generous.
    pub fn on_rank<R, F>(&self, rank: u32, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&Broker) -> R + Send + 'static,
    {
        let (tx, rx) = flume::bounded(1);
        self.remote(rank).call(move |broker| {
            let _ = tx.send(f(broker));
        });
        rx.recv_timeout(DRIVER_TIMEOUT).expect("rank responded")
    }

    /// Poll until `pred` holds on `rank`, or panic at the deadline.
    pub fn poll_rank<F>(&self, rank: u32, what: &str, mut pred: F)
    where
        F: FnMut(&Broker) -> bool + Send + Clone + 'static,
    {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        loop {
            let ok = self.on_rank(rank, {
                let mut pred = pred.clone();
                move |b| pred(b)
            });
            if ok {
                return;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Wait until every internal rank reports all children connected.
    pub fn wait_connected(&self) {
        for rank in self.topo.internal_ranks() {
            let expected = self.topo.children_count(rank).unwrap() as usize;
            self.poll_rank(rank, "children to connect", move |b| {
                let status = b.overlay().children_status();
                status.len() == expected && status.iter().all(|p| p.connected)
            });
        }
    }

    /// Shut one rank down without waiting for the rest.
    pub fn shutdown_rank(&self, rank: u32) {
        self.remote(rank).call(|broker| broker.shutdown());
    }

    pub fn shutdown(self) {
        for remote in &self.remotes {
            remote.call(|broker| broker.shutdown());
        }
        for thread in self.threads {
            thread.join().expect("broker thread exits cleanly");
        }
    }
}

/// RPC-and-wait helper for driver closures running on a broker thread.
pub fn rpc_wait(
    broker: &Broker,
    topic: &str,
    payload: serde_json::Value,
    nodeid: canopy::Nodeid,
) -> Result<serde_json::Value> {
    let rsp = broker
        .rpc(topic, Some(&payload), nodeid)?
        .wait_within(STEP_TIMEOUT)?;
    if rsp.has_payload() {
        Ok(rsp.payload_json()?.clone())
    } else {
        Ok(serde_json::Value::Null)
    }
}
