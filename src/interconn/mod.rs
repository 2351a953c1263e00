pub mod topology;

pub use topology::Topology;

use crate::mem_fetch;
use std::collections::{HashMap, VecDeque};

/// A payload travelling between two components, stamped with its send time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet<T> {
    pub fetch: T,
    pub time: u64,
}

/// A one-directional connection between two components.
pub trait Connection<P> {
    /// Whether packets of the given sizes can be sent this cycle.
    #[must_use]
    fn can_send(&self, packet_sizes: &[u32]) -> bool;

    fn send(&mut self, packet: P);
}

impl<P> Connection<P> for VecDeque<P> {
    fn can_send(&self, _packet_sizes: &[u32]) -> bool {
        true
    }

    fn send(&mut self, packet: P) {
        self.push_back(packet);
    }
}

/// The four virtual channel classes, assigned by message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum VirtualChannel {
    ReadRequest = 0,
    WriteRequest = 1,
    ReadReply = 2,
    WriteAck = 3,
}

pub const NUM_VIRTUAL_CHANNELS: usize = 4;

/// Payloads choose their virtual channel class.
pub trait PacketClass {
    fn virtual_channel(&self) -> VirtualChannel;
}

impl PacketClass for mem_fetch::MemFetch {
    fn virtual_channel(&self) -> VirtualChannel {
        match self.kind {
            mem_fetch::Kind::READ_REQUEST => VirtualChannel::ReadRequest,
            mem_fetch::Kind::WRITE_REQUEST => VirtualChannel::WriteRequest,
            mem_fetch::Kind::READ_REPLY => VirtualChannel::ReadReply,
            mem_fetch::Kind::WRITE_ACK => VirtualChannel::WriteAck,
        }
    }
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Bytes carried per flit.
    pub flit_size: u32,
    /// Flits buffered per virtual channel at each router input.
    pub vc_buffer_size: usize,
    /// Flits buffered in each node's injection queue.
    pub injection_buffer_size: usize,
    /// Completed packets buffered at each node's ejection side.
    pub ejection_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flit_size: 32,
            vc_buffer_size: 8,
            injection_buffer_size: 64,
            ejection_buffer_size: 64,
        }
    }
}

#[derive(Debug, Clone)]
struct Flit {
    packet_id: u64,
    is_tail: bool,
    dest_node: usize,
    vc: usize,
}

#[derive(Debug)]
struct InTransit {
    arrival: u64,
    flit: Flit,
}

/// A pipelined link between two routers.
#[derive(Debug)]
struct Channel {
    latency: u64,
    in_transit: VecDeque<InTransit>,
    /// Destination router and input slot the channel feeds.
    dest: (usize, usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputPort {
    Channel(usize),
    Ejection(usize),
}

#[derive(Debug)]
struct InputBuffer {
    vcs: Vec<VecDeque<Flit>>,
    /// Channel to return a credit to when a flit leaves this input.
    upstream_channel: Option<usize>,
}

impl InputBuffer {
    fn new(upstream_channel: Option<usize>) -> Self {
        Self {
            vcs: (0..NUM_VIRTUAL_CHANNELS).map(|_| VecDeque::new()).collect(),
            upstream_channel,
        }
    }

    fn occupancy(&self) -> usize {
        self.vcs.iter().map(VecDeque::len).sum()
    }
}

#[derive(Debug)]
struct Router {
    inputs: Vec<InputBuffer>,
    outputs: Vec<OutputPort>,
    /// Round-robin start for input arbitration.
    input_priority: usize,
    /// Round-robin start for virtual channel arbitration.
    vc_priority: usize,
}

struct PendingPacket<P> {
    payload: P,
    remaining_flits: u32,
}

/// A cycle-driven network of routers and channels.
///
/// Packets are segmented into flits at injection, routed per a static
/// routing table built with Dijkstra over channel latencies, buffered in
/// per-virtual-channel input queues with credit flow control, and
/// reassembled at the destination node.
pub struct Interconnect<P> {
    config: Config,
    topology: Topology,
    /// `(router, dest node) -> output port`.
    routing_table: Vec<Vec<usize>>,
    routers: Vec<Router>,
    channels: Vec<Channel>,
    /// Per-channel, per-vc credits: free downstream buffer slots.
    credits: Vec<Vec<usize>>,
    /// `node -> (router, input slot)` for injection.
    node_input: Vec<(usize, usize)>,
    injection: Vec<VecDeque<Flit>>,
    /// Completed packets per node.
    completed: Vec<VecDeque<P>>,
    pending: HashMap<u64, PendingPacket<P>>,
    next_packet_id: u64,
    in_flight: u64,
    cycle: u64,
}

impl<P> std::fmt::Debug for Interconnect<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Interconnect")
            .field("num_nodes", &self.topology.num_nodes())
            .field("num_routers", &self.routers.len())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl<P: PacketClass> Interconnect<P> {
    #[must_use]
    pub fn new(topology: Topology, config: Config) -> Self {
        let num_routers = topology.num_routers();
        let num_nodes = topology.num_nodes();

        let mut routers: Vec<Router> = (0..num_routers)
            .map(|_| Router {
                inputs: Vec::new(),
                outputs: Vec::new(),
                input_priority: 0,
                vc_priority: 0,
            })
            .collect();
        let mut channels = Vec::new();
        let mut node_input = vec![(0, 0); num_nodes];

        // injection/ejection first: one input and one output port per node
        for router_id in 0..num_routers {
            for (&node, _latency) in &topology.router_nodes[router_id] {
                let input_slot = routers[router_id].inputs.len();
                routers[router_id].inputs.push(InputBuffer::new(None));
                routers[router_id].outputs.push(OutputPort::Ejection(node));
                node_input[node] = (router_id, input_slot);
            }
        }

        // then the inter-router channels; the port assignment order matches
        // the routing table construction below
        let mut link_port: HashMap<(usize, usize), usize> = HashMap::new();
        for router_id in 0..num_routers {
            let neighbors: Vec<(usize, u64)> = topology.router_links[router_id]
                .iter()
                .map(|(neighbor, latency)| (*neighbor, *latency))
                .collect();
            for (neighbor, latency) in neighbors {
                let channel_id = channels.len();
                let input_slot = routers[neighbor].inputs.len();
                routers[neighbor]
                    .inputs
                    .push(InputBuffer::new(Some(channel_id)));
                let port = routers[router_id].outputs.len();
                routers[router_id].outputs.push(OutputPort::Channel(channel_id));
                link_port.insert((router_id, neighbor), port);
                channels.push(Channel {
                    latency,
                    in_transit: VecDeque::new(),
                    dest: (neighbor, input_slot),
                });
            }
        }

        // static routing table: Dijkstra from every source router
        let mut routing_table = vec![vec![0; num_nodes]; num_routers];
        for router_id in 0..num_routers {
            let next_hop = topology.shortest_path_next_hop(router_id);
            for node in 0..num_nodes {
                let dest_router = topology.node_to_router[node];
                let port = if dest_router == router_id {
                    routers[router_id]
                        .outputs
                        .iter()
                        .position(|port| *port == OutputPort::Ejection(node))
                        .expect("ejection port for attached node")
                } else {
                    let hop = next_hop[dest_router]
                        .unwrap_or_else(|| panic!("router {router_id} cannot reach node {node}"));
                    link_port[&(router_id, hop)]
                };
                routing_table[router_id][node] = port;
            }
        }

        let credits = channels
            .iter()
            .map(|_| vec![config.vc_buffer_size; NUM_VIRTUAL_CHANNELS])
            .collect();

        Self {
            routers,
            channels,
            credits,
            node_input,
            injection: (0..num_nodes).map(|_| VecDeque::new()).collect(),
            completed: (0..num_nodes).map(|_| VecDeque::new()).collect(),
            pending: HashMap::new(),
            routing_table,
            topology,
            config,
            next_packet_id: 0,
            in_flight: 0,
            cycle: 0,
        }
    }

    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.topology.num_nodes()
    }

    #[must_use]
    fn num_flits(&self, size: u32) -> u32 {
        size.div_ceil(self.config.flit_size).max(1)
    }

    /// Can a packet of `size` bytes be injected at `node` this cycle?
    #[must_use]
    pub fn has_buffer(&self, node: usize, size: u32) -> bool {
        self.injection[node].len() + self.num_flits(size) as usize
            <= self.config.injection_buffer_size
    }

    /// Segment a packet into flits and append them to the source node's
    /// injection queue. Callers must check `has_buffer` first.
    pub fn push(&mut self, src_node: usize, dest_node: usize, payload: P, size: u32) {
        assert!(self.has_buffer(src_node, size));
        debug_assert!(dest_node < self.num_nodes());

        let vc = payload.virtual_channel() as usize;
        let num_flits = self.num_flits(size);
        let packet_id = self.next_packet_id;
        self.next_packet_id += 1;

        log::debug!(
            "interconn::push(src={src_node}, dest={dest_node}, size={size}, flits={num_flits}, vc={vc})"
        );

        self.pending.insert(
            packet_id,
            PendingPacket {
                payload,
                remaining_flits: num_flits,
            },
        );
        self.in_flight += 1;

        for flit_idx in 0..num_flits {
            self.injection[src_node].push_back(Flit {
                packet_id,
                is_tail: flit_idx + 1 == num_flits,
                dest_node,
                vc,
            });
        }
    }

    /// Take the next fully arrived packet at `node`.
    pub fn pop(&mut self, node: usize) -> Option<P> {
        let payload = self.completed[node].pop_front()?;
        self.in_flight -= 1;
        Some(payload)
    }

    /// Any flits or packets still travelling?
    #[must_use]
    pub fn busy(&self) -> bool {
        self.in_flight != 0
    }

    /// Advance the network by one cycle.
    pub fn advance(&mut self) {
        self.cycle += 1;

        // deliver flits that finished traversing their channel
        for channel_id in 0..self.channels.len() {
            let (dest_router, input_slot) = self.channels[channel_id].dest;
            while let Some(head) = self.channels[channel_id].in_transit.front() {
                if head.arrival > self.cycle {
                    break;
                }
                let flit = self.channels[channel_id].in_transit.pop_front().unwrap().flit;
                // buffer space was reserved by a credit at send time
                self.routers[dest_router].inputs[input_slot].vcs[flit.vc].push_back(flit);
            }
        }

        // switch allocation: every router forwards at most one flit per
        // output port and one per input per cycle
        for router_id in 0..self.routers.len() {
            self.router_cycle(router_id);
        }

        // injection: one flit per node per cycle enters the attached router
        for node in 0..self.injection.len() {
            let (router_id, input_slot) = self.node_input[node];
            let Some(flit) = self.injection[node].front() else {
                continue;
            };
            let input = &self.routers[router_id].inputs[input_slot];
            if input.vcs[flit.vc].len() < self.config.vc_buffer_size {
                let flit = self.injection[node].pop_front().unwrap();
                self.routers[router_id].inputs[input_slot].vcs[flit.vc].push_back(flit);
            }
        }
    }

    fn router_cycle(&mut self, router_id: usize) {
        let num_inputs = self.routers[router_id].inputs.len();
        let num_outputs = self.routers[router_id].outputs.len();
        if num_inputs == 0 {
            return;
        }
        let mut used_outputs = vec![false; num_outputs];

        let input_priority = self.routers[router_id].input_priority;
        let vc_priority = self.routers[router_id].vc_priority;

        for i in 0..num_inputs {
            let input_idx = (input_priority + i) % num_inputs;
            // pick the first non-empty vc in round-robin order
            let mut candidate = None;
            for v in 0..NUM_VIRTUAL_CHANNELS {
                let vc = (vc_priority + v) % NUM_VIRTUAL_CHANNELS;
                if let Some(flit) = self.routers[router_id].inputs[input_idx].vcs[vc].front() {
                    candidate = Some((vc, flit.dest_node));
                    break;
                }
            }
            let Some((vc, dest_node)) = candidate else {
                continue;
            };

            let port = self.routing_table[router_id][dest_node];
            if used_outputs[port] {
                continue;
            }

            match self.routers[router_id].outputs[port] {
                OutputPort::Ejection(node) => {
                    debug_assert_eq!(node, dest_node);
                    // hold the tail flit when the ejection side is full
                    let is_tail = self.routers[router_id].inputs[input_idx].vcs[vc]
                        .front()
                        .unwrap()
                        .is_tail;
                    if is_tail
                        && self.completed[node].len() >= self.config.ejection_buffer_size
                    {
                        continue;
                    }
                    let flit = self.routers[router_id].inputs[input_idx].vcs[vc]
                        .pop_front()
                        .unwrap();
                    self.return_credit(router_id, input_idx, vc);
                    used_outputs[port] = true;
                    self.eject(node, flit);
                }
                OutputPort::Channel(channel_id) => {
                    if self.credits[channel_id][vc] == 0 {
                        continue;
                    }
                    let flit = self.routers[router_id].inputs[input_idx].vcs[vc]
                        .pop_front()
                        .unwrap();
                    self.return_credit(router_id, input_idx, vc);
                    self.credits[channel_id][vc] -= 1;
                    used_outputs[port] = true;
                    let arrival = self.cycle + self.channels[channel_id].latency;
                    self.channels[channel_id]
                        .in_transit
                        .push_back(InTransit { arrival, flit });
                }
            }
        }

        self.routers[router_id].input_priority = (input_priority + 1) % num_inputs;
        self.routers[router_id].vc_priority = (vc_priority + 1) % NUM_VIRTUAL_CHANNELS;
    }

    /// A flit left an input buffer: free the slot upstream.
    fn return_credit(&mut self, router_id: usize, input_idx: usize, vc: usize) {
        if let Some(channel_id) = self.routers[router_id].inputs[input_idx].upstream_channel {
            self.credits[channel_id][vc] += 1;
            debug_assert!(self.credits[channel_id][vc] <= self.config.vc_buffer_size);
        }
    }

    fn eject(&mut self, node: usize, flit: Flit) {
        let pending = self
            .pending
            .get_mut(&flit.packet_id)
            .expect("flit of unknown packet");
        pending.remaining_flits -= 1;
        if pending.remaining_flits == 0 {
            debug_assert!(flit.is_tail);
            let pending = self.pending.remove(&flit.packet_id).unwrap();
            self.completed[node].push_back(pending.payload);
        }
    }

    /// Total flits buffered in the virtual channels of a router.
    #[must_use]
    pub fn router_occupancy(&self, router_id: usize) -> usize {
        self.routers[router_id]
            .inputs
            .iter()
            .map(InputBuffer::occupancy)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, Interconnect, PacketClass, Topology, VirtualChannel};
    use color_eyre::eyre;
    use std::io::Cursor;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct TestPacket(u64);

    impl PacketClass for TestPacket {
        fn virtual_channel(&self) -> VirtualChannel {
            VirtualChannel::ReadRequest
        }
    }

    fn drain<P: PacketClass>(
        icnt: &mut Interconnect<P>,
        node: usize,
        max_cycles: u64,
    ) -> Option<P> {
        for _ in 0..max_cycles {
            icnt.advance();
            if let Some(payload) = icnt.pop(node) {
                return Some(payload);
            }
        }
        None
    }

    #[test]
    fn star_roundtrip() {
        let mut icnt = Interconnect::new(Topology::star(4), Config::default());
        icnt.push(0, 3, TestPacket(42), 8);
        let received = drain(&mut icnt, 3, 10).unwrap();
        assert_eq!(received, TestPacket(42));
        assert!(!icnt.busy());
    }

    #[test]
    fn packets_of_same_class_stay_ordered() {
        let mut icnt = Interconnect::new(Topology::star(4), Config::default());
        icnt.push(0, 3, TestPacket(1), 8);
        icnt.push(0, 3, TestPacket(2), 8);
        icnt.push(0, 3, TestPacket(3), 8);
        assert_eq!(drain(&mut icnt, 3, 10), Some(TestPacket(1)));
        assert_eq!(drain(&mut icnt, 3, 10), Some(TestPacket(2)));
        assert_eq!(drain(&mut icnt, 3, 10), Some(TestPacket(3)));
    }

    #[test]
    fn channel_latency_delays_delivery() -> eyre::Result<()> {
        let file = "router 0 node 0 router 1 5\nrouter 1 node 1\n";
        let topology = Topology::parse(Cursor::new(file))?;
        let mut icnt = Interconnect::new(topology, Config::default());
        icnt.push(0, 1, TestPacket(7), 8);

        let mut cycles = 0;
        loop {
            icnt.advance();
            cycles += 1;
            if let Some(packet) = icnt.pop(1) {
                assert_eq!(packet, TestPacket(7));
                break;
            }
            assert!(cycles < 50, "packet never arrived");
        }
        // at least the 5-cycle channel plus injection and ejection hops
        assert!(cycles >= 6, "arrived after only {cycles} cycles");
        Ok(())
    }

    #[test]
    fn multi_flit_packets_reassemble() {
        let config = Config {
            flit_size: 32,
            ..Config::default()
        };
        let mut icnt = Interconnect::new(Topology::star(2), config);
        // 136 bytes => 5 flits
        icnt.push(0, 1, TestPacket(9), 136);
        let received = drain(&mut icnt, 1, 20).unwrap();
        assert_eq!(received, TestPacket(9));
    }

    #[test]
    fn injection_queue_is_bounded() {
        let config = Config {
            flit_size: 32,
            injection_buffer_size: 4,
            ..Config::default()
        };
        let mut icnt = Interconnect::new(Topology::star(2), config);
        assert!(icnt.has_buffer(0, 128));
        icnt.push(0, 1, TestPacket(1), 128);
        assert!(!icnt.has_buffer(0, 32));
    }

    #[test]
    fn blocked_ejection_backpressures() {
        let config = Config {
            flit_size: 32,
            ejection_buffer_size: 1,
            ..Config::default()
        };
        let mut icnt = Interconnect::new(Topology::star(2), config);
        icnt.push(0, 1, TestPacket(1), 8);
        icnt.push(0, 1, TestPacket(2), 8);
        icnt.push(0, 1, TestPacket(3), 8);
        for _ in 0..20 {
            icnt.advance();
        }
        // only one packet fits the ejection side until it is popped
        assert_eq!(icnt.pop(1), Some(TestPacket(1)));
        for _ in 0..20 {
            icnt.advance();
        }
        assert_eq!(icnt.pop(1), Some(TestPacket(2)));
    }
}
