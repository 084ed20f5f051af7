//! In-process software NIC.
//!
//! `MemoryPort` implements [`NicDevice`] on plain memory so provisioning,
//! flow steering and the NIC transport can run without hardware. It backs the
//! test suite and the binary's `driver = "memory"` dry-run mode.
//!
//! Frames are injected per queue (or steered by the installed flow rules) and
//! transmitted frames are captured per queue. With loopback enabled, a frame
//! transmitted on queue `q` is also delivered to the RX side of queue `q`.

use super::flow::FlowRule;
use super::frame::{parse_udp_frame, MacAddr};
use super::pool::{PacketBuf, PacketPool};
use super::{DescLimits, DeviceInfo, DriverError, NicDevice, PortConf};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Failure switches for exercising error paths.
#[derive(Debug, Clone, Default)]
struct Failures {
    info: bool,
    configure: bool,
    descriptors: bool,
    pool: bool,
    rx_queue: Option<u16>,
    tx_queue: Option<u16>,
    start: bool,
    validate_queue: Option<u16>,
    create_queue: Option<u16>,
}

#[derive(Debug, Default)]
struct PortState {
    conf: Option<PortConf>,
    descriptors: Option<(u16, u16)>,
    started: bool,
    rx_pools: HashMap<u16, Arc<PacketPool>>,
    tx_ready: HashSet<u16>,
    rx_frames: HashMap<u16, VecDeque<Vec<u8>>>,
    tx_frames: HashMap<u16, Vec<Vec<u8>>>,
    flows: Vec<FlowRule>,
    rx_dropped: u64,
}

pub struct MemoryPort {
    port_id: u16,
    mac: MacAddr,
    info: DeviceInfo,
    loopback: bool,
    tx_limit: Option<usize>,
    failures: Failures,
    state: Mutex<PortState>,
}

impl std::fmt::Debug for MemoryPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPort")
            .field("port_id", &self.port_id)
            .field("loopback", &self.loopback)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct MemoryPortBuilder {
    port_id: u16,
    mac: Option<MacAddr>,
    max_queues: u16,
    fast_free_tx: bool,
    desc: DescLimits,
    loopback: bool,
    tx_limit: Option<usize>,
    failures: Failures,
}

impl MemoryPortBuilder {
    pub fn port_id(mut self, port_id: u16) -> Self {
        self.port_id = port_id;
        self
    }

    pub fn mac(mut self, mac: MacAddr) -> Self {
        self.mac = Some(mac);
        self
    }

    pub fn max_queues(mut self, max_queues: u16) -> Self {
        self.max_queues = max_queues;
        self
    }

    pub fn fast_free_tx(mut self, supported: bool) -> Self {
        self.fast_free_tx = supported;
        self
    }

    pub fn descriptor_limits(mut self, desc: DescLimits) -> Self {
        self.desc = desc;
        self
    }

    /// Deliver transmitted frames back to the RX side of the same queue.
    pub fn loopback(mut self, enabled: bool) -> Self {
        self.loopback = enabled;
        self
    }

    /// Accept at most `limit` frames per tx_burst call.
    pub fn tx_limit(mut self, limit: usize) -> Self {
        self.tx_limit = Some(limit);
        self
    }

    pub fn fail_info(mut self) -> Self {
        self.failures.info = true;
        self
    }

    pub fn fail_configure(mut self) -> Self {
        self.failures.configure = true;
        self
    }

    pub fn fail_descriptors(mut self) -> Self {
        self.failures.descriptors = true;
        self
    }

    pub fn fail_pool(mut self) -> Self {
        self.failures.pool = true;
        self
    }

    pub fn fail_rx_queue(mut self, queue: u16) -> Self {
        self.failures.rx_queue = Some(queue);
        self
    }

    pub fn fail_tx_queue(mut self, queue: u16) -> Self {
        self.failures.tx_queue = Some(queue);
        self
    }

    pub fn fail_start(mut self) -> Self {
        self.failures.start = true;
        self
    }

    /// Reject validation of the flow rule targeting `queue`.
    pub fn reject_flow(mut self, queue: u16) -> Self {
        self.failures.validate_queue = Some(queue);
        self
    }

    /// Fail creation of the flow rule targeting `queue` after it validated.
    pub fn fail_flow_creation(mut self, queue: u16) -> Self {
        self.failures.create_queue = Some(queue);
        self
    }

    pub fn build(self) -> MemoryPort {
        let mac = self
            .mac
            .unwrap_or([0x02, 0x00, 0x00, 0x00, (self.port_id >> 8) as u8, self.port_id as u8]);
        MemoryPort {
            port_id: self.port_id,
            mac,
            info: DeviceInfo {
                driver: "memory".to_string(),
                max_rx_queues: self.max_queues,
                max_tx_queues: self.max_queues,
                rx_desc: self.desc,
                tx_desc: self.desc,
                fast_free_tx: self.fast_free_tx,
            },
            loopback: self.loopback,
            tx_limit: self.tx_limit,
            failures: self.failures,
            state: Mutex::new(PortState::default()),
        }
    }
}

impl MemoryPort {
    pub fn builder() -> MemoryPortBuilder {
        MemoryPortBuilder {
            port_id: 0,
            mac: None,
            max_queues: 16,
            fast_free_tx: true,
            desc: DescLimits::default(),
            loopback: false,
            tx_limit: None,
            failures: Failures::default(),
        }
    }

    /// Queue a raw frame on the RX side of `queue`.
    pub fn inject(&self, queue: u16, frame: Vec<u8>) {
        self.state
            .lock()
            .rx_frames
            .entry(queue)
            .or_default()
            .push_back(frame);
    }

    /// Queue a raw frame on the queue selected by the installed flow rules,
    /// falling back to queue 0 when no rule matches.
    pub fn inject_steered(&self, frame: Vec<u8>) -> u16 {
        let mut state = self.state.lock();
        let queue = parse_udp_frame(&frame)
            .and_then(|parsed| {
                state
                    .flows
                    .iter()
                    .find(|rule| rule.matches(parsed.dst.ip()))
                    .map(|rule| rule.queue)
            })
            .unwrap_or(0);
        state.rx_frames.entry(queue).or_default().push_back(frame);
        queue
    }

    /// Frames transmitted on `queue` so far.
    pub fn transmitted(&self, queue: u16) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .tx_frames
            .get(&queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove and return the frames transmitted on `queue`.
    pub fn take_transmitted(&self, queue: u16) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .tx_frames
            .remove(&queue)
            .unwrap_or_default()
    }

    pub fn pending_rx(&self, queue: u16) -> usize {
        self.state
            .lock()
            .rx_frames
            .get(&queue)
            .map_or(0, VecDeque::len)
    }

    pub fn flows(&self) -> Vec<FlowRule> {
        self.state.lock().flows.clone()
    }

    pub fn port_conf(&self) -> Option<PortConf> {
        self.state.lock().conf
    }

    pub fn descriptors(&self) -> Option<(u16, u16)> {
        self.state.lock().descriptors
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Frames dropped on receive because no pool buffer was available or
    /// the frame exceeded the buffer size.
    pub fn rx_dropped(&self) -> u64 {
        self.state.lock().rx_dropped
    }
}

impl NicDevice for MemoryPort {
    fn port_id(&self) -> u16 {
        self.port_id
    }

    fn info(&self) -> Result<DeviceInfo, DriverError> {
        if self.failures.info {
            return Err(DriverError::new("device info unavailable"));
        }
        Ok(self.info.clone())
    }

    fn configure(&self, conf: &PortConf) -> Result<(), DriverError> {
        if self.failures.configure {
            return Err(DriverError::new("configure rejected"));
        }
        if conf.rx_queues > self.info.max_rx_queues || conf.tx_queues > self.info.max_tx_queues {
            return Err(DriverError::new(format!(
                "device supports at most {} queues",
                self.info.max_rx_queues
            )));
        }
        self.state.lock().conf = Some(*conf);
        Ok(())
    }

    fn adjust_descriptors(&self, rx: u16, tx: u16) -> Result<(u16, u16), DriverError> {
        if self.failures.descriptors {
            return Err(DriverError::new("descriptor adjustment rejected"));
        }
        let adjusted = (self.info.rx_desc.clamp(rx), self.info.tx_desc.clamp(tx));
        self.state.lock().descriptors = Some(adjusted);
        Ok(adjusted)
    }

    fn create_pool(
        &self,
        name: &str,
        buffers: usize,
        buf_size: usize,
    ) -> Result<Arc<PacketPool>, DriverError> {
        if self.failures.pool {
            return Err(DriverError::new("out of hugepage memory"));
        }
        PacketPool::new(name, buffers, buf_size)
            .ok_or_else(|| DriverError::new("pool must hold at least one buffer"))
    }

    fn setup_rx_queue(
        &self,
        queue: u16,
        _descriptors: u16,
        pool: &Arc<PacketPool>,
    ) -> Result<(), DriverError> {
        if self.failures.rx_queue == Some(queue) {
            return Err(DriverError::new("rx queue setup rejected"));
        }
        let mut state = self.state.lock();
        match state.conf {
            Some(conf) if queue < conf.rx_queues => {
                state.rx_pools.insert(queue, Arc::clone(pool));
                Ok(())
            }
            _ => Err(DriverError::new(format!("rx queue {} not configured", queue))),
        }
    }

    fn setup_tx_queue(&self, queue: u16, _descriptors: u16) -> Result<(), DriverError> {
        if self.failures.tx_queue == Some(queue) {
            return Err(DriverError::new("tx queue setup rejected"));
        }
        let mut state = self.state.lock();
        if let Some(conf) = state.conf {
            if queue >= conf.tx_queues {
                return Err(DriverError::new(format!("tx queue {} not configured", queue)));
            }
        }
        state.tx_ready.insert(queue);
        Ok(())
    }

    fn start(&self) -> Result<(), DriverError> {
        if self.failures.start {
            return Err(DriverError::new("link down"));
        }
        self.state.lock().started = true;
        Ok(())
    }

    fn mac_addr(&self) -> MacAddr {
        self.mac
    }

    fn rx_burst(&self, queue: u16, out: &mut Vec<PacketBuf>, max: usize) -> usize {
        let mut state = self.state.lock();
        if !state.started {
            return 0;
        }
        let Some(pool) = state.rx_pools.get(&queue).cloned() else {
            return 0;
        };

        let mut received = 0;
        let mut dropped = 0;
        if let Some(frames) = state.rx_frames.get_mut(&queue) {
            while received < max {
                let Some(frame) = frames.front() else { break };
                let Some(mut buf) = pool.acquire() else {
                    // Pool empty: leave the frame for the next burst.
                    break;
                };
                if buf.fill_from(frame) {
                    out.push(buf);
                    received += 1;
                } else {
                    dropped += 1;
                }
                frames.pop_front();
            }
        }
        state.rx_dropped += dropped;
        received
    }

    fn tx_burst(&self, queue: u16, frames: &mut Vec<PacketBuf>) -> usize {
        let mut state = self.state.lock();
        if !state.tx_ready.contains(&queue) {
            return 0;
        }
        let count = self.tx_limit.map_or(frames.len(), |l| l.min(frames.len()));
        for buf in frames.drain(..count) {
            let bytes = buf.to_vec();
            if self.loopback {
                state
                    .rx_frames
                    .entry(queue)
                    .or_default()
                    .push_back(bytes.clone());
            }
            state.tx_frames.entry(queue).or_default().push(bytes);
        }
        count
    }

    fn validate_flow(&self, rule: &FlowRule) -> Result<(), DriverError> {
        if self.failures.validate_queue == Some(rule.queue) {
            return Err(DriverError::new("flow pattern not supported"));
        }
        match self.state.lock().conf {
            Some(conf) if rule.queue < conf.rx_queues => Ok(()),
            _ => Err(DriverError::new(format!(
                "flow targets unconfigured queue {}",
                rule.queue
            ))),
        }
    }

    fn create_flow(&self, rule: &FlowRule) -> Result<(), DriverError> {
        if self.failures.create_queue == Some(rule.queue) {
            return Err(DriverError::new("flow table full"));
        }
        self.state.lock().flows.push(rule.clone());
        Ok(())
    }
}
