use crate::socket::DatagramSocket;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// How a [SimulatedNetwork] mistreats datagrams. Probabilities are in `[0, 1]` and apply to
///  each datagram independently.
#[derive(Debug, Clone)]
pub struct NetworkConditions {
    pub latency: Duration,
    pub loss: f64,
    pub duplication: f64,
    /// probability that a datagram is held back by `reorder_delay`, letting datagrams sent
    ///  after it overtake it
    pub reordering: f64,
    pub reorder_delay: Duration,
}

impl Default for NetworkConditions {
    fn default() -> Self {
        NetworkConditions {
            latency: Duration::ZERO,
            loss: 0.0,
            duplication: 0.0,
            reordering: 0.0,
            reorder_delay: Duration::from_millis(20),
        }
    }
}

/// Counters of what happened to datagrams on a [SimulatedNetwork]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStatistics {
    pub sent: u64,
    pub lost: u64,
    pub duplicated: u64,
    pub reordered: u64,
    /// datagrams sent to an address without a socket
    pub undeliverable: u64,
}

struct InFlight {
    deliver_at: Instant,
    from: SocketAddr,
    datagram: Vec<u8>,
}

#[derive(Default)]
struct Mailbox {
    /// ordered by delivery time
    queue: Mutex<VecDeque<InFlight>>,
    notify: Notify,
}

impl Mailbox {
    fn put(&self, in_flight: InFlight) {
        {
            let mut queue = self.queue.lock().unwrap();
            let pos = queue.partition_point(|d| d.deliver_at <= in_flight.deliver_at);
            queue.insert(pos, in_flight);
        }
        self.notify.notify_one();
    }

    fn next_delivery(&self) -> Option<Instant> {
        self.queue.lock().unwrap()
            .front()
            .map(|d| d.deliver_at)
    }
}

struct NetworkState {
    rng: StdRng,
    conditions: NetworkConditions,
    mailboxes: FxHashMap<SocketAddr, Arc<Mailbox>>,
    statistics: NetworkStatistics,
}

/// An in-memory datagram network connecting [SimulatedSocket]s, for testing hosts without
///  real I/O. Loss, duplication and reordering are driven by a seeded random generator, so
///  a test sees the same behavior in every run as long as it sends the same datagrams.
///
/// Delivery times are based on the tokio clock, so this works with paused time.
pub struct SimulatedNetwork {
    state: Mutex<NetworkState>,
}

impl SimulatedNetwork {
    pub fn new(seed: u64, conditions: NetworkConditions) -> Arc<SimulatedNetwork> {
        Arc::new(SimulatedNetwork {
            state: Mutex::new(NetworkState {
                rng: StdRng::seed_from_u64(seed),
                conditions,
                mailboxes: FxHashMap::default(),
                statistics: NetworkStatistics::default(),
            }),
        })
    }

    /// Creates a socket bound to `addr`. A previous socket bound to the same address stops
    ///  receiving.
    pub fn socket(self: &Arc<Self>, addr: SocketAddr) -> Arc<SimulatedSocket> {
        let mailbox = Arc::new(Mailbox::default());
        self.state.lock().unwrap()
            .mailboxes.insert(addr, mailbox.clone());

        Arc::new(SimulatedSocket {
            network: self.clone(),
            addr,
            mailbox,
        })
    }

    pub fn set_conditions(&self, conditions: NetworkConditions) {
        self.state.lock().unwrap().conditions = conditions;
    }

    pub fn statistics(&self) -> NetworkStatistics {
        self.state.lock().unwrap().statistics
    }

    fn transmit(&self, from: SocketAddr, to: SocketAddr, datagram: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        state.statistics.sent += 1;

        let Some(mailbox) = state.mailboxes.get(&to).cloned() else {
            trace!("simulated network: no socket at {:?} - dropping", to);
            state.statistics.undeliverable += 1;
            return;
        };

        if state.rng.gen::<f64>() < state.conditions.loss {
            trace!("simulated network: losing datagram from {:?} to {:?}", from, to);
            state.statistics.lost += 1;
            return;
        }

        let copies = if state.rng.gen::<f64>() < state.conditions.duplication {
            state.statistics.duplicated += 1;
            2
        }
        else {
            1
        };

        for _ in 0..copies {
            let mut deliver_at = Instant::now() + state.conditions.latency;
            if state.rng.gen::<f64>() < state.conditions.reordering {
                state.statistics.reordered += 1;
                deliver_at += state.conditions.reorder_delay;
            }

            mailbox.put(InFlight {
                deliver_at,
                from,
                datagram: datagram.to_vec(),
            });
        }
    }
}

/// One endpoint on a [SimulatedNetwork]
pub struct SimulatedSocket {
    network: Arc<SimulatedNetwork>,
    addr: SocketAddr,
    mailbox: Arc<Mailbox>,
}

#[async_trait]
impl DatagramSocket for SimulatedSocket {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<usize> {
        self.network.transmit(self.addr, to, datagram);
        Ok(datagram.len())
    }

    fn try_receive_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut queue = self.mailbox.queue.lock().unwrap();
        match queue.front() {
            Some(d) if d.deliver_at <= Instant::now() => {}
            _ => return Err(io::ErrorKind::WouldBlock.into()),
        }

        let Some(in_flight) = queue.pop_front() else {
            return Err(io::ErrorKind::WouldBlock.into());
        };

        // like UDP, excess bytes are discarded
        let len = in_flight.datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&in_flight.datagram[..len]);
        Ok((len, in_flight.from))
    }

    async fn wait_readable(&self) -> io::Result<()> {
        loop {
            match self.mailbox.next_delivery() {
                Some(deliver_at) if deliver_at <= Instant::now() => return Ok(()),
                Some(deliver_at) => {
                    tokio::select! {
                        _ = self.mailbox.notify.notified() => {}
                        _ = tokio::time::sleep_until(deliver_at) => {}
                    }
                }
                None => self.mailbox.notify.notified().await,
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}
