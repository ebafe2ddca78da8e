//! Source rewriting of queued UDP packets.

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use ipnetwork::IpNetwork;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::RangeInclusive;
use tracing::trace;

/// Ephemeral range random source ports are drawn from.
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=65535;

const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;
const IPPROTO_UDP: u8 = 17;

/// Round-robin over the host addresses of a subnet.
#[derive(Debug, Clone)]
pub struct AddressPool {
    network: IpNetwork,
    first: u128,
    count: u128,
    next: u128,
}

impl AddressPool {
    /// IPv4 prefixes shorter than /31 skip the network and broadcast
    /// addresses; IPv6 prefixes shorter than /128 skip the subnet-router
    /// anycast address.
    pub fn new(network: IpNetwork) -> Self {
        let (first, count) = match network {
            IpNetwork::V4(net) => {
                let base = u128::from(u32::from(net.network()));
                let size = 1u128 << (32 - u32::from(net.prefix()));
                if net.prefix() >= 31 {
                    (base, size)
                } else {
                    (base + 1, size - 2)
                }
            }
            IpNetwork::V6(net) => {
                let base = u128::from(net.network());
                let size = 1u128
                    .checked_shl(128 - u32::from(net.prefix()))
                    .unwrap_or(u128::MAX);
                if net.prefix() == 128 {
                    (base, 1)
                } else {
                    (base + 1, size - 1)
                }
            }
        };

        Self {
            network,
            first,
            count,
            next: 0,
        }
    }

    pub fn network(&self) -> IpNetwork {
        self.network
    }

    pub fn is_ipv4(&self) -> bool {
        self.network.is_ipv4()
    }

    /// Number of distinct addresses handed out before wrapping.
    pub fn len(&self) -> u128 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn next_addr(&mut self) -> IpAddr {
        let raw = self.first + self.next;
        self.next = (self.next + 1) % self.count;
        match self.network {
            IpNetwork::V4(_) => IpAddr::V4(Ipv4Addr::from(raw as u32)),
            IpNetwork::V6(_) => IpAddr::V6(Ipv6Addr::from(raw)),
        }
    }
}

/// Why a packet was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    Unparseable,
    NotUdp,
    PortNotTargeted,
    FamilyMismatch,
    Truncated,
    /// Spoofer not in its running state.
    Inactive,
}

/// What to hand back to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Rewritten { packet: Vec<u8>, source: SocketAddr },
    /// Accept the packet unmodified.
    PassThrough(PassReason),
}

/// Rewrites source address, optionally source port, and checksums of UDP
/// packets aimed at the attack ports. Never drops anything.
pub struct PacketRewriter {
    pool: AddressPool,
    ports: BTreeSet<u16>,
    randomize_source_port: bool,
    rng: StdRng,
}

impl PacketRewriter {
    /// An empty `ports` set targets all UDP traffic.
    pub fn new(
        pool: AddressPool,
        ports: impl IntoIterator<Item = u16>,
        randomize_source_port: bool,
    ) -> Self {
        Self {
            pool,
            ports: ports.into_iter().collect(),
            randomize_source_port,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn process(&mut self, packet: &[u8]) -> Disposition {
        let sliced = match SlicedPacket::from_ip(packet) {
            Ok(sliced) => sliced,
            Err(e) => {
                trace!("Unparseable packet: {}", e);
                return Disposition::PassThrough(PassReason::Unparseable);
            }
        };

        let Some(TransportSlice::Udp(udp)) = &sliced.transport else {
            return Disposition::PassThrough(PassReason::NotUdp);
        };
        if !self.ports.is_empty() && !self.ports.contains(&udp.destination_port()) {
            return Disposition::PassThrough(PassReason::PortNotTargeted);
        }

        let (is_v4, udp_offset) = match &sliced.net {
            Some(NetSlice::Ipv4(_)) => (true, usize::from(packet[0] & 0x0f) * 4),
            // extension headers would move the UDP header
            Some(NetSlice::Ipv6(_)) if packet.get(6) == Some(&IPPROTO_UDP) => {
                (false, IPV6_HEADER_LEN)
            }
            _ => return Disposition::PassThrough(PassReason::NotUdp),
        };
        if is_v4 != self.pool.is_ipv4() {
            return Disposition::PassThrough(PassReason::FamilyMismatch);
        }

        let Some(len_bytes) = packet.get(udp_offset + 4..udp_offset + 6) else {
            return Disposition::PassThrough(PassReason::Truncated);
        };
        let udp_len = usize::from(u16::from_be_bytes([len_bytes[0], len_bytes[1]]));
        if udp_len < UDP_HEADER_LEN || udp_offset + udp_len > packet.len() {
            return Disposition::PassThrough(PassReason::Truncated);
        }

        let mut out = packet.to_vec();
        let src_ip = self.pool.next_addr();
        match src_ip {
            IpAddr::V4(addr) => out[12..16].copy_from_slice(&addr.octets()),
            IpAddr::V6(addr) => out[8..24].copy_from_slice(&addr.octets()),
        }

        let src_port = if self.randomize_source_port {
            let port = self.rng.gen_range(EPHEMERAL_PORTS);
            out[udp_offset..udp_offset + 2].copy_from_slice(&port.to_be_bytes());
            port
        } else {
            udp.source_port()
        };

        if is_v4 {
            out[10..12].fill(0);
            let checksum = internet_checksum(&out[..udp_offset]);
            out[10..12].copy_from_slice(&checksum.to_be_bytes());
        }

        let segment = udp_offset..udp_offset + udp_len;
        out[udp_offset + 6..udp_offset + 8].fill(0);
        let checksum = if is_v4 {
            let src: [u8; 4] = [out[12], out[13], out[14], out[15]];
            let dst: [u8; 4] = [out[16], out[17], out[18], out[19]];
            udp_checksum_v4(src, dst, &out[segment])
        } else {
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&out[8..24]);
            dst.copy_from_slice(&out[24..40]);
            udp_checksum_v6(src, dst, &out[segment])
        };
        out[udp_offset + 6..udp_offset + 8].copy_from_slice(&checksum.to_be_bytes());

        Disposition::Rewritten {
            packet: out,
            source: SocketAddr::new(src_ip, src_port),
        }
    }
}

fn sum_words(data: &[u8], mut sum: u64) -> u64 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u64::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u64::from(u16::from_be_bytes([*last, 0]));
    }
    sum
}

fn fold(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// RFC 1071 checksum. Over a header that already holds its checksum the
/// result is zero.
pub fn internet_checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// UDP checksum over the IPv4 pseudo-header. `segment` is header plus
/// payload with the checksum field zeroed.
pub fn udp_checksum_v4(src: [u8; 4], dst: [u8; 4], segment: &[u8]) -> u16 {
    let mut sum = sum_words(&src, 0);
    sum = sum_words(&dst, sum);
    sum += u64::from(IPPROTO_UDP);
    sum += segment.len() as u64;
    sum = sum_words(segment, sum);
    match fold(sum) {
        0 => 0xffff,
        checksum => checksum,
    }
}

pub fn udp_checksum_v6(src: [u8; 16], dst: [u8; 16], segment: &[u8]) -> u16 {
    let mut sum = sum_words(&src, 0);
    sum = sum_words(&dst, sum);
    sum += segment.len() as u64;
    sum += u64::from(IPPROTO_UDP);
    sum = sum_words(segment, sum);
    match fold(sum) {
        0 => 0xffff,
        checksum => checksum,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn udp_v4(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ipv4(src, dst, 64).udp(sport, dport);
        let mut packet = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut packet, payload).unwrap();
        packet
    }

    fn udp_v6(src: [u8; 16], dst: [u8; 16], sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ipv6(src, dst, 64).udp(sport, dport);
        let mut packet = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut packet, payload).unwrap();
        packet
    }

    fn rewriter(subnet: &str, ports: &[u16], randomize: bool) -> PacketRewriter {
        PacketRewriter::new(
            AddressPool::new(subnet.parse().unwrap()),
            ports.iter().copied(),
            randomize,
        )
    }

    fn stored_udp_checksum_v4(packet: &[u8]) -> (u16, u16) {
        let ihl = usize::from(packet[0] & 0x0f) * 4;
        let stored = u16::from_be_bytes([packet[ihl + 6], packet[ihl + 7]]);
        let mut segment = packet[ihl..].to_vec();
        segment[6..8].fill(0);
        let src = [packet[12], packet[13], packet[14], packet[15]];
        let dst = [packet[16], packet[17], packet[18], packet[19]];
        (stored, udp_checksum_v4(src, dst, &segment))
    }

    #[test]
    fn test_pool_ipv4_excludes_network_and_broadcast() {
        let mut pool = AddressPool::new("10.10.0.0/30".parse().unwrap());
        assert_eq!(pool.len(), 2);
        let seen: Vec<IpAddr> = (0..4).map(|_| pool.next_addr()).collect();
        assert_eq!(
            seen,
            ["10.10.0.1", "10.10.0.2", "10.10.0.1", "10.10.0.2"]
                .map(|a| a.parse::<IpAddr>().unwrap())
        );
    }

    #[test]
    fn test_pool_small_prefixes() {
        assert_eq!(AddressPool::new("10.0.0.4/31".parse().unwrap()).len(), 2);
        let mut single = AddressPool::new("10.0.0.9/32".parse().unwrap());
        assert_eq!(single.next_addr(), "10.0.0.9".parse::<IpAddr>().unwrap());
        assert_eq!(single.next_addr(), "10.0.0.9".parse::<IpAddr>().unwrap());

        let mut v6 = AddressPool::new("fd00::/126".parse().unwrap());
        assert_eq!(v6.len(), 3);
        assert_eq!(v6.next_addr(), "fd00::1".parse::<IpAddr>().unwrap());
        assert!(!AddressPool::new("::/0".parse().unwrap()).is_empty());
    }

    #[test]
    fn test_checksum_matches_etherparse() {
        let packet = udp_v4([192, 168, 1, 1], [192, 168, 1, 2], 5060, 5060, b"OPTIONS sip:x");
        // the builder computed both checksums; ours must agree
        assert_eq!(internet_checksum(&packet[..20]), 0);
        let (stored, computed) = stored_udp_checksum_v4(&packet);
        assert_eq!(stored, computed);
    }

    #[test]
    fn test_rewrite_ipv4() {
        let packet = udp_v4([192, 168, 1, 1], [192, 168, 1, 2], 5060, 5060, b"INVITE sip:200");
        let mut rw = rewriter("10.10.0.0/24", &[5060], true);

        let Disposition::Rewritten { packet: out, source } = rw.process(&packet) else {
            panic!("expected rewrite");
        };
        assert_eq!(source.ip(), "10.10.0.1".parse::<IpAddr>().unwrap());
        assert!(EPHEMERAL_PORTS.contains(&source.port()));
        assert_eq!(&out[12..16], &[10, 10, 0, 1]);
        assert_eq!(&out[16..20], &packet[16..20]);
        assert_eq!(u16::from_be_bytes([out[20], out[21]]), source.port());
        assert_eq!(&out[28..], &packet[28..]);

        assert_eq!(internet_checksum(&out[..20]), 0);
        let (stored, computed) = stored_udp_checksum_v4(&out);
        assert_eq!(stored, computed);

        let parsed = SlicedPacket::from_ip(&out).unwrap();
        assert!(matches!(parsed.transport, Some(TransportSlice::Udp(_))));
    }

    #[test]
    fn test_round_robin_across_packets() {
        let packet = udp_v4([192, 168, 1, 1], [192, 168, 1, 2], 5060, 5060, b"x");
        let mut rw = rewriter("10.10.0.0/30", &[], false);
        let sources: Vec<SocketAddr> = (0..3)
            .map(|_| match rw.process(&packet) {
                Disposition::Rewritten { source, .. } => source,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            sources,
            ["10.10.0.1:5060", "10.10.0.2:5060", "10.10.0.1:5060"]
                .map(|a| a.parse::<SocketAddr>().unwrap())
        );
    }

    #[test]
    fn test_rewrite_ipv6() {
        let src = "fd00::10".parse::<Ipv6Addr>().unwrap().octets();
        let dst = "fd00::20".parse::<Ipv6Addr>().unwrap().octets();
        let packet = udp_v6(src, dst, 5060, 5060, b"REGISTER");
        let mut rw = rewriter("fd00:10::/64", &[5060], false);

        let Disposition::Rewritten { packet: out, source } = rw.process(&packet) else {
            panic!("expected rewrite");
        };
        assert_eq!(source, "[fd00:10::1]:5060".parse().unwrap());

        let stored = u16::from_be_bytes([out[46], out[47]]);
        let mut segment = out[40..].to_vec();
        segment[6..8].fill(0);
        let mut s = [0u8; 16];
        s.copy_from_slice(&out[8..24]);
        assert_eq!(stored, udp_checksum_v6(s, dst, &segment));
    }

    #[test]
    fn test_pass_through_cases() {
        let mut rw = rewriter("10.10.0.0/24", &[5060], true);

        assert_eq!(
            rw.process(&[0xde, 0xad, 0xbe, 0xef]),
            Disposition::PassThrough(PassReason::Unparseable)
        );
        assert_eq!(rw.process(&[]), Disposition::PassThrough(PassReason::Unparseable));

        let other_port = udp_v4([1, 1, 1, 1], [2, 2, 2, 2], 5060, 5070, b"x");
        assert_eq!(
            rw.process(&other_port),
            Disposition::PassThrough(PassReason::PortNotTargeted)
        );

        let builder = PacketBuilder::ipv4([1, 1, 1, 1], [2, 2, 2, 2], 64).tcp(40000, 5060, 1, 1024);
        let mut tcp = Vec::new();
        builder.write(&mut tcp, b"x").unwrap();
        assert_eq!(rw.process(&tcp), Disposition::PassThrough(PassReason::NotUdp));

        let v6 = udp_v6([0; 16], [1; 16], 5060, 5060, b"x");
        assert_eq!(
            rw.process(&v6),
            Disposition::PassThrough(PassReason::FamilyMismatch)
        );
    }

    #[test]
    fn test_truncated_packet_passes() {
        let mut packet = udp_v4([1, 1, 1, 1], [2, 2, 2, 2], 5060, 5060, b"hello");
        packet.truncate(packet.len() - 3);
        let mut rw = rewriter("10.10.0.0/24", &[], true);
        assert!(matches!(rw.process(&packet), Disposition::PassThrough(_)));
    }
}
