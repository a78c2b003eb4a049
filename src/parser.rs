use pnet_packet::Packet;
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::{TcpFlags, TcpPacket};
use pnet_packet::udp::UdpPacket;
use std::net::{IpAddr, SocketAddr};

use crate::connection::Transport;

/// The parts of a frame the connection tracker needs.
#[derive(Debug, PartialEq, Clone)]
pub struct PacketInfo {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub transport: Transport,
    /// Raw TCP flag bits, zero for UDP.
    pub tcp_flags: u8,
    pub payload: Vec<u8>,
}

impl PacketInfo {
    pub fn has_flag(&self, flag: u8) -> bool {
        self.tcp_flags & flag != 0
    }

    pub fn is_syn(&self) -> bool {
        self.has_flag(TcpFlags::SYN)
    }

    pub fn is_fin(&self) -> bool {
        self.has_flag(TcpFlags::FIN)
    }

    pub fn is_rst(&self) -> bool {
        self.has_flag(TcpFlags::RST)
    }
}

/// Parses an Ethernet frame carrying TCP or UDP over IPv4/IPv6. Anything else
/// (ARP, ICMP, truncated headers) yields `None`.
pub fn parse_frame(frame: &[u8]) -> Option<PacketInfo> {
    let ethernet = EthernetPacket::new(frame)?;
    match ethernet.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ip = Ipv4Packet::new(ethernet.payload())?;
            parse_transport(
                IpAddr::V4(ip.get_source()),
                IpAddr::V4(ip.get_destination()),
                ip.get_next_level_protocol(),
                ip.payload(),
            )
        }
        EtherTypes::Ipv6 => {
            let ip = Ipv6Packet::new(ethernet.payload())?;
            parse_transport(
                IpAddr::V6(ip.get_source()),
                IpAddr::V6(ip.get_destination()),
                ip.get_next_header(),
                ip.payload(),
            )
        }
        _ => None,
    }
}

fn parse_transport(
    source_ip: IpAddr,
    dest_ip: IpAddr,
    protocol: IpNextHeaderProtocol,
    segment: &[u8],
) -> Option<PacketInfo> {
    match protocol {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(segment)?;
            Some(PacketInfo {
                source: SocketAddr::new(source_ip, tcp.get_source()),
                destination: SocketAddr::new(dest_ip, tcp.get_destination()),
                transport: Transport::Tcp,
                tcp_flags: tcp.get_flags(),
                payload: tcp.payload().to_vec(),
            })
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(segment)?;
            Some(PacketInfo {
                source: SocketAddr::new(source_ip, udp.get_source()),
                destination: SocketAddr::new(dest_ip, udp.get_destination()),
                transport: Transport::Udp,
                tcp_flags: 0,
                payload: udp.payload().to_vec(),
            })
        }
        _ => None,
    }
}

/// Helpers for building frames in tests across the crate.
#[cfg(test)]
pub(crate) mod testing {
    use pnet_packet::MutablePacket;
    use pnet_packet::ethernet::{EtherTypes, MutableEthernetPacket};
    use pnet_packet::ip::IpNextHeaderProtocols;
    use pnet_packet::ipv4::MutableIpv4Packet;
    use pnet_packet::tcp::MutableTcpPacket;
    use pnet_packet::udp::MutableUdpPacket;
    use std::net::SocketAddrV4;

    const ETH_LEN: usize = 14;
    const IPV4_LEN: usize = 20;
    const TCP_LEN: usize = 20;
    const UDP_LEN: usize = 8;

    fn frame(src: SocketAddrV4, dst: SocketAddrV4, transport_len: usize, proto: u8) -> Vec<u8> {
        let mut buffer = vec![0u8; ETH_LEN + IPV4_LEN + transport_len];
        {
            let mut eth = MutableEthernetPacket::new(&mut buffer).unwrap();
            eth.set_ethertype(EtherTypes::Ipv4);
            let mut ip = MutableIpv4Packet::new(eth.payload_mut()).unwrap();
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length((IPV4_LEN + transport_len) as u16);
            ip.set_ttl(64);
            ip.set_next_level_protocol(pnet_packet::ip::IpNextHeaderProtocol(proto));
            ip.set_source(*src.ip());
            ip.set_destination(*dst.ip());
        }
        buffer
    }

    pub fn tcp_frame(src: &str, dst: &str, flags: u8, payload: &[u8]) -> Vec<u8> {
        let src: SocketAddrV4 = src.parse().unwrap();
        let dst: SocketAddrV4 = dst.parse().unwrap();
        let mut buffer = frame(src, dst, TCP_LEN + payload.len(), IpNextHeaderProtocols::Tcp.0);
        let mut tcp = MutableTcpPacket::new(&mut buffer[ETH_LEN + IPV4_LEN..]).unwrap();
        tcp.set_source(src.port());
        tcp.set_destination(dst.port());
        tcp.set_data_offset(5);
        tcp.set_flags(flags);
        tcp.set_payload(payload);
        buffer
    }

    pub fn udp_frame(src: &str, dst: &str, payload: &[u8]) -> Vec<u8> {
        let src: SocketAddrV4 = src.parse().unwrap();
        let dst: SocketAddrV4 = dst.parse().unwrap();
        let mut buffer = frame(src, dst, UDP_LEN + payload.len(), IpNextHeaderProtocols::Udp.0);
        let mut udp = MutableUdpPacket::new(&mut buffer[ETH_LEN + IPV4_LEN..]).unwrap();
        udp.set_source(src.port());
        udp.set_destination(dst.port());
        udp.set_length((UDP_LEN + payload.len()) as u16);
        udp.set_payload(payload);
        buffer
    }
}
