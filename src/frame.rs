// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Link/network/transport header parsing (§4.4 steps 1-2): turns one raw
//! captured Ethernet frame into either an ISIS frame marker or an IP
//! 5-tuple plus the L4 payload. Grounded in `nids.c`'s "parse link-layer,
//! then branch on ethertype" structure; parsed by hand the same way the
//! iSCSI PDU headers are, since no packet-parsing crate appears anywhere
//! in the reference pack.

use std::net::IpAddr;

use crate::ingress::FiveTuple;

const ETHERTYPE_ISIS: u16 = 0x0083;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERNET_HEADER_LEN: usize = 14;

const IP_PROTO_ICMP: u8 = 1;
const IP_PROTO_TCP: u8 = 6;
const IP_PROTO_UDP: u8 = 17;
const IP_PROTO_ICMPV6: u8 = 58;

/// What ingress does with one decoded frame, per §4.4 step 1's "if
/// ethertype is ISIS, invoke the ISIS enqueuer" branch.
pub enum DecodedFrame<'a> {
    Isis { payload: &'a [u8] },
    Ip { tuple: FiveTuple, payload: &'a [u8] },
    /// Ethertype not handled (802.1Q tags beyond one level, ARP, etc).
    Unhandled,
}

/// Decode one Ethernet frame's link/network/transport headers far enough
/// to produce the ingress-facing `FiveTuple` plus the remaining L4
/// payload. A single 802.1Q VLAN tag is skipped transparently; anything
/// more exotic is `Unhandled`.
pub fn decode(frame: &[u8]) -> DecodedFrame<'_> {
    if frame.len() < ETHERNET_HEADER_LEN {
        return DecodedFrame::Unhandled;
    }
    let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let mut offset = ETHERNET_HEADER_LEN;

    if ethertype == 0x8100 {
        if frame.len() < offset + 4 {
            return DecodedFrame::Unhandled;
        }
        ethertype = u16::from_be_bytes([frame[offset + 2], frame[offset + 3]]);
        offset += 4;
    }

    match ethertype {
        ETHERTYPE_ISIS => DecodedFrame::Isis {
            payload: &frame[offset..],
        },
        ETHERTYPE_IPV4 => decode_ipv4(&frame[offset..]),
        ETHERTYPE_IPV6 => decode_ipv6(&frame[offset..]),
        _ => DecodedFrame::Unhandled,
    }
}

fn decode_ipv4(buf: &[u8]) -> DecodedFrame<'_> {
    if buf.len() < 20 {
        return DecodedFrame::Unhandled;
    }
    let version = buf[0] >> 4;
    if version != 4 {
        return DecodedFrame::Unhandled;
    }
    let ihl = usize::from(buf[0] & 0x0f) * 4;
    if ihl < 20 || buf.len() < ihl {
        return DecodedFrame::Unhandled;
    }
    let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let proto = buf[9];
    let src = IpAddr::from([buf[12], buf[13], buf[14], buf[15]]);
    let dst = IpAddr::from([buf[16], buf[17], buf[18], buf[19]]);

    let l4 = &buf[ihl..buf.len().min(total_len.max(ihl))];
    decode_l4(proto, src, dst, l4)
}

fn decode_ipv6(buf: &[u8]) -> DecodedFrame<'_> {
    if buf.len() < 40 {
        return DecodedFrame::Unhandled;
    }
    let version = buf[0] >> 4;
    if version != 6 {
        return DecodedFrame::Unhandled;
    }
    let payload_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let next_header = buf[6];
    let mut src_octets = [0u8; 16];
    src_octets.copy_from_slice(&buf[8..24]);
    let mut dst_octets = [0u8; 16];
    dst_octets.copy_from_slice(&buf[24..40]);
    let src = IpAddr::from(src_octets);
    let dst = IpAddr::from(dst_octets);

    let l4_start = 40;
    let l4_end = buf.len().min(l4_start + payload_len.max(0)).max(l4_start);
    let l4 = &buf[l4_start..l4_end.min(buf.len())];
    decode_l4(next_header, src, dst, l4)
}

fn decode_l4(proto: u8, src: IpAddr, dst: IpAddr, l4: &[u8]) -> DecodedFrame<'_> {
    match proto {
        IP_PROTO_TCP => {
            if l4.len() < 20 {
                return DecodedFrame::Unhandled;
            }
            let src_port = u16::from_be_bytes([l4[0], l4[1]]);
            let dst_port = u16::from_be_bytes([l4[2], l4[3]]);
            let data_offset = usize::from(l4[12] >> 4) * 4;
            if data_offset < 20 || l4.len() < data_offset {
                return DecodedFrame::Unhandled;
            }
            DecodedFrame::Ip {
                tuple: FiveTuple {
                    ip_protocol: proto,
                    src_addr: src,
                    src_port,
                    dst_addr: dst,
                    dst_port,
                },
                payload: &l4[data_offset..],
            }
        }
        IP_PROTO_UDP => {
            if l4.len() < 8 {
                return DecodedFrame::Unhandled;
            }
            let src_port = u16::from_be_bytes([l4[0], l4[1]]);
            let dst_port = u16::from_be_bytes([l4[2], l4[3]]);
            DecodedFrame::Ip {
                tuple: FiveTuple {
                    ip_protocol: proto,
                    src_addr: src,
                    src_port,
                    dst_addr: dst,
                    dst_port,
                },
                payload: &l4[8..],
            }
        }
        IP_PROTO_ICMP | IP_PROTO_ICMPV6 => DecodedFrame::Ip {
            tuple: FiveTuple {
                ip_protocol: proto,
                src_addr: src,
                src_port: 0,
                dst_addr: dst,
                dst_port: 0,
            },
            payload: l4,
        },
        _ => DecodedFrame::Unhandled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth_ipv4_tcp(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; ETHERNET_HEADER_LEN];
        frame[12] = 0x08;
        frame[13] = 0x00;

        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        let total_len = (20 + 20 + payload.len()) as u16;
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip[9] = 6;
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);

        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&5000u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&80u16.to_be_bytes());
        tcp[12] = 5 << 4;

        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&tcp);
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn decodes_tcp_five_tuple_and_payload() {
        let frame = eth_ipv4_tcp(b"GET / HTTP/1.1\r\n");
        match decode(&frame) {
            DecodedFrame::Ip { tuple, payload } => {
                assert_eq!(tuple.ip_protocol, 6);
                assert_eq!(tuple.src_port, 5000);
                assert_eq!(tuple.dst_port, 80);
                assert_eq!(payload, b"GET / HTTP/1.1\r\n");
            }
            _ => panic!("expected Ip"),
        }
    }

    #[test]
    fn isis_ethertype_routes_to_isis_variant() {
        let mut frame = vec![0u8; ETHERNET_HEADER_LEN + 30];
        frame[12] = 0x00;
        frame[13] = 0x83;
        match decode(&frame) {
            DecodedFrame::Isis { payload } => assert_eq!(payload.len(), 30),
            _ => panic!("expected Isis"),
        }
    }

    #[test]
    fn truncated_frame_is_unhandled() {
        match decode(&[0u8; 4]) {
            DecodedFrame::Unhandled => {}
            _ => panic!("expected Unhandled"),
        }
    }
}
