use std::{pin::Pin, task::Poll};

use async_trait::async_trait;
use futures::Stream;
use netlink_packet_core::{NetlinkBuffer, NetlinkMessage, NetlinkPayload};
use netlink_packet_utils::DecodeError;
use netlink_sys::{protocols::NETLINK_NETFILTER, AsyncSocket, AsyncSocketExt, TokioSocket};
use tracing::trace;

use crate::{
    error::{Error, NetlinkError},
    message::CtNetlinkMessage,
    AF_INET, AF_INET6,
};

#[async_trait]
pub trait ConntrackSocket: Stream {
    async fn send(&mut self, msg: NetlinkMessage<CtNetlinkMessage>) -> Result<(), Error>;
}

/// The frames carried by one received datagram.
#[derive(Debug, Default)]
struct FrameBatch {
    msgs: Vec<CtNetlinkMessage>,
    done: bool,
}

/// Walks the netlink frames of one datagram, keyed on the (sequence,
/// port-id) of the outstanding dump. `Done` terminates the dump, error
/// frames terminate the sweep, and an entry that fails attribute
/// validation is skipped without poisoning its neighbours.
fn split_frames(buf: &[u8], seq: u32, portid: u32) -> Result<FrameBatch, Error> {
    let mut batch = FrameBatch::default();
    let mut offset = 0;
    while offset < buf.len() {
        let data = &buf[offset..];
        let frame = NetlinkBuffer::new_checked(&data).map_err(Error::Decode)?;
        let len = frame.length() as usize;
        if len < 16 || len > data.len() {
            return Err(Error::Decode(DecodeError::from(format!(
                "invalid netlink frame length: {len}"
            ))));
        }
        let (got_seq, got_portid) = (frame.sequence_number(), frame.port_number());
        if got_seq != seq || got_portid != portid {
            return Err(Error::DumpMismatch {
                seq,
                portid,
                got_seq,
                got_portid,
            });
        }
        match NetlinkMessage::<CtNetlinkMessage>::deserialize(&data[..len]) {
            Ok(msg) => match msg.payload {
                NetlinkPayload::Done(_) => {
                    batch.done = true;
                    break;
                }
                NetlinkPayload::Error(e) => {
                    return Err(Error::NetlinkMessage(NetlinkError::from(e.raw_code())))
                }
                NetlinkPayload::InnerMessage(msg) => batch.msgs.push(msg),
                _ => {}
            },
            Err(e) => trace!(error = %e, "skipping undecodable conntrack message"),
        }
        offset += (len + 3) & !3;
    }
    Ok(batch)
}

pub struct NfConntrackSocket {
    inner: TokioSocket,
    portid: u32,
    seq: u32,
}

impl NfConntrackSocket {
    pub(super) fn new() -> Result<NfConntrackSocket, Error> {
        let mut socket = TokioSocket::new(NETLINK_NETFILTER).map_err(Error::Socket)?;
        let addr = socket.socket_mut().bind_auto().map_err(Error::Socket)?;
        Ok(NfConntrackSocket {
            inner: socket,
            portid: addr.port_number(),
            seq: 0,
        })
    }
}

#[async_trait]
impl ConntrackSocket for NfConntrackSocket {
    async fn send(&mut self, msg: NetlinkMessage<CtNetlinkMessage>) -> Result<(), Error> {
        self.seq = msg.header.sequence_number;
        let mut buf = vec![0u8; msg.header.length as usize];
        msg.serialize(&mut buf[..]);
        self.inner.send(&buf).await.map_err(Error::Send)?;
        Ok(())
    }
}

impl Stream for NfConntrackSocket {
    type Item = Result<Vec<CtNetlinkMessage>, Error>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        match self.inner.poll_recv_from_full(cx) {
            Poll::Ready(Ok((buf, _))) => {
                let (seq, portid) = (self.seq, self.portid);
                match split_frames(&buf, seq, portid) {
                    Ok(batch) => {
                        if batch.done {
                            // The dump terminator carries no entries.
                            Poll::Ready(None)
                        } else {
                            Poll::Ready(Some(Ok(batch.msgs)))
                        }
                    }
                    Err(e) => Poll::Ready(Some(Err(e))),
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(Error::Poll(e)))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug, Default)]
pub(super) struct MockConntrackSocket {
    family: Option<u8>,
    ipv4_data: Vec<CtNetlinkMessage>,
    ipv6_data: Vec<CtNetlinkMessage>,
    index: usize,
}

impl MockConntrackSocket {
    #[allow(dead_code)]
    pub(super) fn with_msg(
        ipv4_data: Vec<CtNetlinkMessage>,
        ipv6_data: Vec<CtNetlinkMessage>,
    ) -> MockConntrackSocket {
        MockConntrackSocket {
            family: None,
            ipv4_data,
            ipv6_data,
            index: 0,
        }
    }
}

#[async_trait]
impl ConntrackSocket for MockConntrackSocket {
    async fn send(&mut self, msg: NetlinkMessage<CtNetlinkMessage>) -> Result<(), Error> {
        if let NetlinkPayload::InnerMessage(req) = msg.payload {
            self.family = Some(req.header.family);
            self.index = 0;
            Ok(())
        } else {
            Err(Error::Send(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "ctnetlink request is expected",
            )))
        }
    }
}

impl Stream for MockConntrackSocket {
    type Item = Result<Vec<CtNetlinkMessage>, Error>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let Some(family) = self.family else {
            return Poll::Ready(Some(Err(Error::Recv(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "request is not received yet",
            )))));
        };
        let data = match family {
            AF_INET => &self.ipv4_data,
            AF_INET6 => &self.ipv6_data,
            _ => {
                self.family = None;
                return Poll::Ready(None);
            }
        };
        if self.index < data.len() {
            let msg = data[self.index].clone();
            self.index += 1;
            Poll::Ready(Some(Ok(vec![msg])))
        } else {
            self.family = None;
            Poll::Ready(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;
    use netlink_packet_core::{DoneMessage, NetlinkHeader};

    use super::*;
    use crate::{
        message::{CtOp, NetfilterHeader},
        nlas::{ConnNla, IpNla, TupleNla, CTA_ZONE},
        Family,
    };

    fn entry_msg(zone: u16) -> CtNetlinkMessage {
        CtNetlinkMessage::new(
            NetfilterHeader::new(Family::Ipv4.into()),
            CtOp::New(vec![
                ConnNla::OrigTuple(vec![TupleNla::Ip(vec![
                    IpNla::V4Src("10.0.0.1".parse().unwrap()),
                    IpNla::V4Dst("8.8.8.8".parse().unwrap()),
                ])]),
                ConnNla::Zone(zone),
            ]),
        )
    }

    fn serialize_entry(msg: CtNetlinkMessage, seq: u32, portid: u32) -> Vec<u8> {
        let mut hdr = NetlinkHeader::default();
        hdr.sequence_number = seq;
        hdr.port_number = portid;
        let mut msg = NetlinkMessage::new(hdr, NetlinkPayload::InnerMessage(msg));
        msg.finalize();
        let mut buf = vec![0u8; msg.header.length as usize];
        msg.serialize(&mut buf);
        buf
    }

    fn serialize_done(seq: u32, portid: u32) -> Vec<u8> {
        let mut hdr = NetlinkHeader::default();
        hdr.sequence_number = seq;
        hdr.port_number = portid;
        let mut msg: NetlinkMessage<CtNetlinkMessage> =
            NetlinkMessage::new(hdr, NetlinkPayload::Done(DoneMessage::default()));
        msg.finalize();
        let mut buf = vec![0u8; msg.header.length as usize];
        msg.serialize(&mut buf);
        buf
    }

    #[test]
    fn test_split_frames_yields_entries_until_done() {
        let mut buf = serialize_entry(entry_msg(0), 7, 100);
        buf.extend(serialize_entry(entry_msg(1), 7, 100));
        let batch = split_frames(&buf, 7, 100).unwrap();
        assert_eq!(batch.msgs.len(), 2);
        assert!(!batch.done);

        let done = serialize_done(7, 100);
        let batch = split_frames(&done, 7, 100).unwrap();
        assert!(batch.msgs.is_empty());
        assert!(batch.done);
    }

    #[test]
    fn test_split_frames_rejects_wrong_sequence() {
        let buf = serialize_entry(entry_msg(0), 7, 100);
        assert!(matches!(
            split_frames(&buf, 8, 100),
            Err(Error::DumpMismatch { .. })
        ));
        assert!(matches!(
            split_frames(&buf, 7, 99),
            Err(Error::DumpMismatch { .. })
        ));
    }

    #[test]
    fn test_split_frames_skips_malformed_entry() {
        // First frame carries a CTA_ZONE with a 4-byte payload: a shape
        // error scoped to that message only.
        let mut bad = serialize_entry(entry_msg(0), 7, 100);
        let zone_attr = bad.len() - 8;
        bad[zone_attr..zone_attr + 2].copy_from_slice(&8u16.to_ne_bytes());
        bad[zone_attr + 2..zone_attr + 4].copy_from_slice(&CTA_ZONE.to_ne_bytes());
        let frame_len = bad.len() as u32;
        bad[0..4].copy_from_slice(&frame_len.to_ne_bytes());

        let mut buf = bad;
        buf.extend(serialize_entry(entry_msg(0), 7, 100));
        let batch = split_frames(&buf, 7, 100).unwrap();
        assert_eq!(batch.msgs.len(), 1);
    }

    #[test]
    fn test_split_frames_truncated_buffer_is_an_error() {
        let buf = serialize_entry(entry_msg(0), 7, 100);
        assert!(matches!(
            split_frames(&buf[..10], 7, 100),
            Err(Error::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_mock_socket_replays_per_family() {
        let ipv4 = vec![entry_msg(0), entry_msg(0), entry_msg(0)];
        let ipv6 = vec![entry_msg(0)];
        let mut socket = MockConntrackSocket::with_msg(ipv4, ipv6);
        socket
            .send(crate::message::DumpRequest::new(Family::Ipv4).message())
            .await
            .unwrap();
        let mut read = 0;
        while let Some(msgs) = socket.try_next().await.unwrap() {
            read += msgs.len();
        }
        assert_eq!(read, 3);

        socket
            .send(crate::message::DumpRequest::new(Family::Ipv6).message())
            .await
            .unwrap();
        let mut read = 0;
        while let Some(msgs) = socket.try_next().await.unwrap() {
            read += msgs.len();
        }
        assert_eq!(read, 1);
    }
}
