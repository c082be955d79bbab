use bacio_core::types::Segmentation;
use std::net::SocketAddr;
use std::time::Duration;

/// BBMD to register with as a foreign device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BbmdConfig {
    /// BBMD address, port included.
    pub address: SocketAddr,
    /// Registration time-to-live. The client re-registers at half this
    /// interval while connected.
    pub ttl: Duration,
}

/// Client configuration. `Default` matches typical field deployments; the
/// `with_*` methods adjust individual knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local UDP bind address; `None` lets the OS pick an ephemeral port.
    pub local_bind: Option<SocketAddr>,
    /// Per-attempt wait for a confirmed-service response.
    pub request_timeout: Duration,
    /// Retransmissions after the first timed-out attempt.
    pub retries: u32,
    /// Pause between retransmissions.
    pub retry_delay: Duration,
    /// Maximum APDU length advertised in confirmed requests.
    pub max_apdu: u16,
    /// Segmentation capability advertised in confirmed requests.
    pub segmentation: Segmentation,
    /// Register as a foreign device at this BBMD after the transport opens.
    pub bbmd: Option<BbmdConfig>,
    /// Default wait for `Who-Is` answers.
    pub discover_timeout: Duration,
    /// Age past which a cached device binding is re-verified with a
    /// targeted `Who-Is` before use. `None` keeps bindings forever.
    pub binding_ttl: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_bind: None,
            request_timeout: Duration::from_secs(3),
            retries: 3,
            retry_delay: Duration::from_millis(500),
            max_apdu: 1476,
            segmentation: Segmentation::NoSegmentation,
            bbmd: None,
            discover_timeout: Duration::from_secs(5),
            binding_ttl: None,
        }
    }
}

impl ClientConfig {
    pub fn with_local_bind(mut self, addr: SocketAddr) -> Self {
        self.local_bind = Some(addr);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_max_apdu(mut self, octets: u16) -> Self {
        self.max_apdu = octets;
        self
    }

    pub fn with_segmentation(mut self, segmentation: Segmentation) -> Self {
        self.segmentation = segmentation;
        self
    }

    pub fn with_bbmd(mut self, address: SocketAddr, ttl: Duration) -> Self {
        self.bbmd = Some(BbmdConfig { address, ttl });
        self
    }

    pub fn with_discover_timeout(mut self, timeout: Duration) -> Self {
        self.discover_timeout = timeout;
        self
    }

    pub fn with_binding_ttl(mut self, ttl: Duration) -> Self {
        self.binding_ttl = Some(ttl);
        self
    }
}
