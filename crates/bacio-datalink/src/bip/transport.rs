use crate::bip::bvlc::{BvlcFunction, BvlcHeader};
use crate::{DataLink, DataLinkAddress, DataLinkError};
use bacio_core::encoding::{reader::Reader, writer::Writer};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration, Instant};

/// Largest BACnet/IP datagram this transport will build or accept.
const MAX_BIP_FRAME_LEN: usize = 1600;

/// How long to wait for the BBMD to answer a registration.
const BBMD_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// BACnet/IP transport over a shared UDP socket.
///
/// The socket is broadcast-enabled at bind time. When the transport is
/// bound as a foreign device, broadcasts are re-routed to the BBMD as
/// `Distribute-Broadcast-To-Network` instead of the limited broadcast
/// address.
#[derive(Debug, Clone)]
pub struct BacnetIpTransport {
    socket: Arc<UdpSocket>,
    bbmd: Option<SocketAddr>,
}

impl BacnetIpTransport {
    /// Binds a UDP4 socket on `bind_addr` (port 0 for OS-chosen ephemeral).
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self, DataLinkError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket: Arc::new(socket),
            bbmd: None,
        })
    }

    /// Binds like [`bind`](Self::bind) and remembers the BBMD address for
    /// foreign-device operation. Registration itself is a separate call.
    pub async fn bind_foreign(
        bind_addr: SocketAddr,
        bbmd_addr: SocketAddr,
    ) -> Result<Self, DataLinkError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket: Arc::new(socket),
            bbmd: Some(bbmd_addr),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DataLinkError> {
        self.socket.local_addr().map_err(DataLinkError::Io)
    }

    pub fn bbmd_addr(&self) -> Option<SocketAddr> {
        self.bbmd
    }

    fn parse_bvlc_result(payload: &[u8]) -> Result<(), DataLinkError> {
        if payload.len() < 2 {
            return Err(DataLinkError::InvalidFrame);
        }
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        if code == 0 {
            Ok(())
        } else {
            Err(DataLinkError::BvlcResult(code))
        }
    }

    async fn send_bvlc_to_bbmd(
        &self,
        function: BvlcFunction,
        payload: &[u8],
    ) -> Result<(), DataLinkError> {
        let bbmd = self.bbmd.ok_or(DataLinkError::BbmdNotConfigured)?;
        let total_len = BvlcHeader::SIZE + payload.len();
        if total_len > MAX_BIP_FRAME_LEN {
            return Err(DataLinkError::FrameTooLarge);
        }

        let mut frame = [0u8; MAX_BIP_FRAME_LEN];
        let mut w = Writer::new(&mut frame);
        BvlcHeader {
            function,
            length: total_len as u16,
        }
        .encode(&mut w)
        .map_err(|_| DataLinkError::InvalidFrame)?;
        w.write_all(payload)
            .map_err(|_| DataLinkError::FrameTooLarge)?;

        self.socket.send_to(w.as_written(), bbmd).await?;
        Ok(())
    }

    async fn recv_bvlc_result(&self, wait: Duration) -> Result<(), DataLinkError> {
        let bbmd = self.bbmd.ok_or(DataLinkError::BbmdNotConfigured)?;
        let deadline = Instant::now() + wait;
        let mut rx = [0u8; MAX_BIP_FRAME_LEN];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DataLinkError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "bbmd response timeout",
                )));
            }

            let (n, src) = timeout(remaining, self.socket.recv_from(&mut rx))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "bbmd response timeout"))?
                .map_err(DataLinkError::Io)?;
            if src != bbmd {
                continue;
            }

            let mut r = Reader::new(&rx[..n]);
            let hdr = BvlcHeader::decode(&mut r).map_err(|_| DataLinkError::InvalidFrame)?;
            if hdr.function != BvlcFunction::Result {
                continue;
            }
            let payload = r
                .read_exact(hdr.length as usize - BvlcHeader::SIZE)
                .map_err(|_| DataLinkError::InvalidFrame)?;
            return Self::parse_bvlc_result(payload);
        }
    }

    /// Sends `Register-Foreign-Device` with the given TTL without waiting
    /// for the BVLC-Result. Used for periodic re-registration where the
    /// receive path is already owned by a reader loop.
    pub async fn register_foreign_device_no_wait(
        &self,
        ttl_seconds: u16,
    ) -> Result<(), DataLinkError> {
        self.send_bvlc_to_bbmd(BvlcFunction::RegisterForeignDevice, &ttl_seconds.to_be_bytes())
            .await
    }

    /// Sends `Register-Foreign-Device` and waits for a successful
    /// BVLC-Result from the BBMD.
    pub async fn register_foreign_device(&self, ttl_seconds: u16) -> Result<(), DataLinkError> {
        self.send_bvlc_to_bbmd(BvlcFunction::RegisterForeignDevice, &ttl_seconds.to_be_bytes())
            .await?;
        self.recv_bvlc_result(BBMD_REPLY_TIMEOUT).await
    }
}

impl DataLink for BacnetIpTransport {
    async fn send(&self, address: DataLinkAddress, payload: &[u8]) -> Result<(), DataLinkError> {
        let addr = address.as_socket_addr();
        let is_broadcast = matches!(addr.ip(), IpAddr::V4(v4) if v4.is_broadcast());

        let (function, target_addr) = if is_broadcast {
            if let Some(bbmd) = self.bbmd {
                (BvlcFunction::DistributeBroadcastToNetwork, bbmd)
            } else {
                (BvlcFunction::OriginalBroadcastNpdu, addr)
            }
        } else {
            (BvlcFunction::OriginalUnicastNpdu, addr)
        };

        let total_len = BvlcHeader::SIZE + payload.len();
        if total_len > MAX_BIP_FRAME_LEN {
            return Err(DataLinkError::FrameTooLarge);
        }

        let mut frame = [0u8; MAX_BIP_FRAME_LEN];
        let mut w = Writer::new(&mut frame);
        BvlcHeader {
            function,
            length: total_len as u16,
        }
        .encode(&mut w)
        .map_err(|_| DataLinkError::InvalidFrame)?;
        w.write_all(payload)
            .map_err(|_| DataLinkError::FrameTooLarge)?;

        let sent = self.socket.send_to(w.as_written(), target_addr).await?;
        if sent != total_len {
            return Err(DataLinkError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "partial datagram send",
            )));
        }
        Ok(())
    }

    async fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> Result<(usize, DataLinkAddress), DataLinkError> {
        let mut frame = [0u8; MAX_BIP_FRAME_LEN];
        let (n, src) = self.socket.recv_from(&mut frame).await?;
        let mut r = Reader::new(&frame[..n]);
        let hdr = BvlcHeader::decode(&mut r).map_err(|_| DataLinkError::InvalidFrame)?;
        // The advertised length must account for exactly the bytes received.
        if hdr.length as usize != n {
            return Err(DataLinkError::InvalidFrame);
        }

        match hdr.function {
            BvlcFunction::OriginalUnicastNpdu
            | BvlcFunction::OriginalBroadcastNpdu
            | BvlcFunction::DistributeBroadcastToNetwork => {
                let payload = r.read_rest();
                if payload.len() > buf.len() {
                    return Err(DataLinkError::FrameTooLarge);
                }
                buf[..payload.len()].copy_from_slice(payload);
                Ok((payload.len(), DataLinkAddress::Ip(src)))
            }
            BvlcFunction::ForwardedNpdu => {
                // Six bytes of originating IPv4 address + port precede the
                // NPDU; that origin supersedes the datagram source.
                let forwarded = r.read_rest();
                if forwarded.len() < 6 {
                    return Err(DataLinkError::InvalidFrame);
                }
                let origin_ip =
                    Ipv4Addr::new(forwarded[0], forwarded[1], forwarded[2], forwarded[3]);
                let origin_port = u16::from_be_bytes([forwarded[4], forwarded[5]]);
                let payload = &forwarded[6..];
                if payload.len() > buf.len() {
                    return Err(DataLinkError::FrameTooLarge);
                }
                buf[..payload.len()].copy_from_slice(payload);
                Ok((
                    payload.len(),
                    DataLinkAddress::Ip(SocketAddr::new(IpAddr::V4(origin_ip), origin_port)),
                ))
            }
            BvlcFunction::Unknown(v) => Err(DataLinkError::UnsupportedBvlcFunction(v)),
            _ => Err(DataLinkError::InvalidFrame),
        }
    }
}
