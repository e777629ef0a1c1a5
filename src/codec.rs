use std::net::{Ipv4Addr, SocketAddrV4};

use anyhow::{anyhow, Result};
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_DATAGRAM_BYTES;
use crate::message::{BroadcastFrame, MemberRecord, Message, Verb};
use crate::state::WireStatus;

/// Fixed-format framing for a single UDP datagram:
///
/// ```text
/// verb(1) | sender ip(4) | sender port(2) | sender heartbeat(4)
/// | member count(1) | members: { ip(4) port(2) status(1) heartbeat(4) }*
/// | broadcast flag(1) | broadcast: origin ip(4) port(2) index(4) len(2) payload
/// ```
///
/// All integers are big-endian. The encoder rejects messages that would
/// exceed 512 bytes; the decoder rejects anything that does not parse to
/// exactly the datagram length.
///
/// When constructed with a source IP, the decoder substitutes it for the
/// sender IP claimed in the payload: identity follows the UDP source address,
/// not the bytes a peer chose to write. The port is kept from the payload
/// because outbound datagrams leave through ephemeral sockets.
pub(crate) struct MessageCodec {
    source_ip: Option<Ipv4Addr>,
}

impl MessageCodec {
    pub(crate) fn new() -> Self {
        Self { source_ip: None }
    }

    pub(crate) fn with_source_ip(source_ip: Ipv4Addr) -> Self {
        Self {
            source_ip: Some(source_ip),
        }
    }

    fn ensure(src: &BytesMut, size: usize) -> Result<()> {
        if src.remaining() < size {
            return Err(anyhow!("buffer underflow: not enough data"));
        }
        Ok(())
    }

    fn get_ipv4(src: &mut BytesMut) -> Result<Ipv4Addr> {
        Self::ensure(src, 4)?;
        let octets = [src.get_u8(), src.get_u8(), src.get_u8(), src.get_u8()];
        Ok(Ipv4Addr::from(octets))
    }

    fn put_socket_addr(addr: &SocketAddrV4, dst: &mut BytesMut) {
        dst.extend_from_slice(&addr.ip().octets());
        dst.put_u16(addr.port());
    }

    fn get_socket_addr(src: &mut BytesMut) -> Result<SocketAddrV4> {
        let ip = Self::get_ipv4(src)?;
        Self::ensure(src, 2)?;
        let port = src.get_u16();
        Ok(SocketAddrV4::new(ip, port))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();

        dst.put_u8(item.verb.as_u8());
        Self::put_socket_addr(&item.sender, dst);
        dst.put_u32(item.sender_heartbeat);

        dst.put_u8(item.members.len() as u8);
        for member in &item.members {
            dst.extend_from_slice(&member.ip.octets());
            dst.put_u16(member.port);
            dst.put_u8(member.status.as_u8());
            dst.put_u32(member.heartbeat);
        }

        match &item.broadcast {
            Some(broadcast) => {
                dst.put_u8(1);
                Self::put_socket_addr(&broadcast.origin, dst);
                dst.put_u32(broadcast.index);
                dst.put_u16(broadcast.payload.len() as u16);
                dst.extend_from_slice(&broadcast.payload);
            }
            None => dst.put_u8(0),
        }

        let written = dst.len() - start;
        if written > MAX_DATAGRAM_BYTES {
            return Err(anyhow!(
                "message too large for a datagram, allowed {} bytes but got {} bytes",
                MAX_DATAGRAM_BYTES,
                written
            ));
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        if src.remaining() > MAX_DATAGRAM_BYTES {
            return Err(anyhow!("datagram exceeds {} bytes", MAX_DATAGRAM_BYTES));
        }

        Self::ensure(src, 1)?;
        let verb = Verb::from_u8(src.get_u8())?;

        let mut sender = Self::get_socket_addr(src)?;
        if let Some(source_ip) = self.source_ip {
            sender = SocketAddrV4::new(source_ip, sender.port());
        }

        Self::ensure(src, 4)?;
        let sender_heartbeat = src.get_u32();

        Self::ensure(src, 1)?;
        let member_count = src.get_u8();
        let mut members = Vec::with_capacity(usize::from(member_count));
        for _ in 0..member_count {
            let ip = Self::get_ipv4(src)?;
            Self::ensure(src, 7)?;
            let port = src.get_u16();
            let status = WireStatus::from_u8(src.get_u8())?;
            let heartbeat = src.get_u32();
            members.push(MemberRecord {
                ip,
                port,
                status,
                heartbeat,
            });
        }

        Self::ensure(src, 1)?;
        let broadcast = match src.get_u8() {
            0 => None,
            1 => {
                let origin = Self::get_socket_addr(src)?;
                Self::ensure(src, 6)?;
                let index = src.get_u32();
                let len = usize::from(src.get_u16());
                Self::ensure(src, len)?;
                let payload = src.split_to(len).to_vec();
                Some(BroadcastFrame {
                    origin,
                    index,
                    payload,
                })
            }
            other => return Err(anyhow!("invalid broadcast flag: {}", other)),
        };

        if !src.is_empty() {
            return Err(anyhow!("trailing bytes after message"));
        }

        Ok(Some(Message {
            verb,
            sender,
            sender_heartbeat,
            members,
            broadcast,
        }))
    }
}
