use std::task::Poll;

use error::Error;
use flow::{flows_from_entry, CtFlow};
use futures::Stream;
use message::{CtOp, DumpRequest};
use pin_project_lite::pin_project;
use serde::Serialize;
use socket::{ConntrackSocket, NfConntrackSocket};

pub mod error;
pub mod flow;
pub mod message;
pub mod nlas;
pub mod socket;

pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 10;

pin_project! {
    /// One sweep over the kernel's connection-tracking table: request a
    /// dump per family, then stream the flow samples built from each
    /// received batch. The zone filter is fixed for the lifetime of the
    /// sweep.
    pub struct Conntrack<S> {
        #[pin]
        socket: S,
        ct_zone: u16,
    }
}

impl Conntrack<NfConntrackSocket> {
    pub fn new(ct_zone: u16) -> Result<Conntrack<NfConntrackSocket>, Error> {
        let socket = NfConntrackSocket::new()?;
        Ok(Conntrack { socket, ct_zone })
    }
}

impl<S> Conntrack<S>
where
    S: ConntrackSocket,
{
    pub fn with_socket(socket: S, ct_zone: u16) -> Conntrack<S> {
        Conntrack { socket, ct_zone }
    }

    pub async fn request(&mut self, family: Family) -> Result<(), Error> {
        let msg = DumpRequest::new(family).message();
        self.socket.send(msg).await?;
        Ok(())
    }
}

impl<S> Stream for Conntrack<S>
where
    S: ConntrackSocket + Stream<Item = Result<Vec<message::CtNetlinkMessage>, Error>>,
{
    type Item = Result<Vec<CtFlow>, Error>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let ct_zone = self.ct_zone;
        match self.project().socket.poll_next(cx) {
            Poll::Ready(Some(Ok(msgs))) => {
                let flows = msgs
                    .iter()
                    .flat_map(|msg| match &msg.op {
                        CtOp::New(nlas) => flows_from_entry(nlas, ct_zone),
                        _ => Vec::new(),
                    })
                    .collect();
                Poll::Ready(Some(Ok(flows)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Family {
    #[default]
    Ipv4,
    Ipv6,
}

impl Family {
    pub fn ip_version(&self) -> u8 {
        match self {
            Family::Ipv4 => 4,
            Family::Ipv6 => 6,
        }
    }
}

impl From<Family> for u8 {
    fn from(family: Family) -> Self {
        match family {
            Family::Ipv4 => AF_INET,
            Family::Ipv6 => AF_INET6,
        }
    }
}

impl TryFrom<u8> for Family {
    type Error = Error;

    fn try_from(family: u8) -> Result<Self, Self::Error> {
        match family {
            AF_INET => Ok(Family::Ipv4),
            AF_INET6 => Ok(Family::Ipv6),
            _ => Err(Error::InvalidFamily(family)),
        }
    }
}
