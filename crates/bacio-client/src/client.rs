//! The client facade: connection lifecycle, confirmed-request engine,
//! discovery, property access, and COV subscription management.

use crate::config::ClientConfig;
use crate::cov::{CovHandler, CovNotification, CovSubscriptions};
use crate::error::ClientError;
use crate::metrics::Metrics;
use crate::registry::{DeviceInfo, DeviceRegistry};
use crate::transactions::{Reply, TransactionTable};
use crate::value::Value;
use bacio_core::apdu::{
    AbortPdu, ApduType, ComplexAckHeader, ConfirmedRequestHeader, ErrorPdu, RejectPdu, SegmentAck,
    SimpleAck, UnconfirmedRequestHeader,
};
use bacio_core::encoding::{reader::Reader, writer::Writer};
use bacio_core::npdu::Npdu;
use bacio_core::services::cov_notification::{
    CovNotificationPayload, SERVICE_CONFIRMED_COV_NOTIFICATION,
    SERVICE_UNCONFIRMED_COV_NOTIFICATION,
};
use bacio_core::services::i_am::{IAmPayload, SERVICE_I_AM};
use bacio_core::services::read_property::{
    ReadPropertyAck, ReadPropertyRequest, SERVICE_READ_PROPERTY,
};
use bacio_core::services::read_property_multiple::{
    PropertyOutcome, PropertyReference, ReadAccessSpecification, ReadPropertyMultipleAck,
    ReadPropertyMultipleRequest, SERVICE_READ_PROPERTY_MULTIPLE,
};
use bacio_core::services::subscribe_cov::{SubscribeCovRequest, SERVICE_SUBSCRIBE_COV};
use bacio_core::services::who_is::WhoIsRequest;
use bacio_core::services::write_property::{WritePropertyRequest, SERVICE_WRITE_PROPERTY};
use bacio_core::types::{AbortReason, MaxApdu, ObjectId, ObjectType, PropertyId};
use bacio_core::EncodeError;
use bacio_datalink::{BacnetIpTransport, DataLink, DataLinkAddress, DataLinkError};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const MAX_FRAME_LEN: usize = 1600;

/// Wait applied to the targeted `Who-Is` a cache miss triggers.
const REDISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection lifecycle. Terminal from every state is `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// One property to fetch in a [`BacnetClient::read_property_multiple`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertySpec {
    pub object_id: ObjectId,
    pub property_id: PropertyId,
    pub array_index: Option<u32>,
}

/// A per-property access error reported inside an RPM acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyError {
    pub class: u32,
    pub code: u32,
}

/// One flattened RPM result row.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyReadResult {
    pub object_id: ObjectId,
    pub property_id: PropertyId,
    pub array_index: Option<u32>,
    pub outcome: Result<Value, PropertyError>,
}

struct Shared {
    state: AtomicU8,
    transactions: TransactionTable,
    registry: DeviceRegistry,
    subscriptions: CovSubscriptions,
    process_ids: AtomicU32,
    metrics: Arc<Metrics>,
}

/// A BACnet/IP client multiplexing confirmed requests, discovery, and COV
/// notifications over one datagram endpoint.
///
/// All operations take `&self`; callers may issue requests concurrently.
/// One spawned receive loop reads the socket and routes decoded PDUs to the
/// waiting transaction, the device registry, or a COV handler.
pub struct BacnetClient<D: DataLink + 'static> {
    config: ClientConfig,
    shared: Arc<Shared>,
    link: Mutex<Option<Arc<D>>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    renewal: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<D: DataLink + 'static> BacnetClient<D> {
    /// Creates a disconnected client. Call [`connect`](BacnetClient::connect)
    /// (or [`connect_with`](BacnetClient::connect_with) in tests and custom
    /// transports) before issuing requests.
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                transactions: TransactionTable::default(),
                registry: DeviceRegistry::default(),
                subscriptions: CovSubscriptions::default(),
                process_ids: AtomicU32::new(1),
                metrics: Arc::new(Metrics::default()),
            }),
            link: Mutex::new(None),
            receiver: Mutex::new(None),
            renewal: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.shared.metrics.clone()
    }

    /// A discovered device, if known.
    pub fn device(&self, device_id: u32) -> Option<DeviceInfo> {
        self.shared.registry.get(device_id)
    }

    /// Every device the registry currently knows.
    pub fn known_devices(&self) -> Vec<DeviceInfo> {
        self.shared.registry.snapshot(None)
    }

    /// Forgets every learned device binding.
    pub fn reset_registry(&self) {
        self.shared.registry.reset();
    }

    /// Attaches an already-open data link and starts the receive loop.
    /// Fails with `AlreadyConnected` if a connect already happened.
    pub async fn connect_with(&self, datalink: D) -> Result<(), ClientError> {
        self.begin_connect()?;
        self.finish_connect(Arc::new(datalink));
        Ok(())
    }

    fn begin_connect(&self) -> Result<(), ClientError> {
        self.shared.metrics.connect_attempts.inc();
        self.shared
            .state
            .compare_exchange(
                ConnectionState::Disconnected as u8,
                ConnectionState::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| ClientError::AlreadyConnected)?;
        Ok(())
    }

    fn abort_connect(&self) {
        self.shared
            .state
            .store(ConnectionState::Disconnected as u8, Ordering::Release);
    }

    fn finish_connect(&self, link: Arc<D>) {
        *lock(&self.link) = Some(link.clone());
        let shared = self.shared.clone();
        *lock(&self.receiver) = Some(tokio::spawn(run_receiver(link, shared)));
        self.shared
            .state
            .store(ConnectionState::Connected as u8, Ordering::Release);
    }

    /// Tears the connection down: stops the receive loop, fails every
    /// outstanding transaction with `ConnectionClosed`, and releases the
    /// socket. Idempotent.
    pub async fn close(&self) {
        let prev = self
            .shared
            .state
            .swap(ConnectionState::Disconnected as u8, Ordering::AcqRel);
        if prev == ConnectionState::Disconnected as u8 {
            return;
        }

        if let Some(handle) = lock(&self.renewal).take() {
            handle.abort();
        }
        if let Some(handle) = lock(&self.receiver).take() {
            handle.abort();
            let _ = handle.await;
        }
        self.shared.transactions.fail_all();
        *lock(&self.link) = None;
        self.shared.metrics.disconnects.inc();
        log::debug!("client disconnected");
    }

    fn link(&self) -> Result<Arc<D>, ClientError> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        lock(&self.link).clone().ok_or(ClientError::NotConnected)
    }

    /// Broadcasts `Who-Is`, waits [`ClientConfig::discover_timeout`], and
    /// returns the registry snapshot for the optional instance range.
    pub async fn who_is(&self, range: Option<(u32, u32)>) -> Result<Vec<DeviceInfo>, ClientError> {
        self.who_is_for(range, self.config.discover_timeout).await
    }

    /// [`who_is`](BacnetClient::who_is) with an explicit wait. Callers that
    /// read the registry during the wait may observe a partial set.
    pub async fn who_is_for(
        &self,
        range: Option<(u32, u32)>,
        wait: Duration,
    ) -> Result<Vec<DeviceInfo>, ClientError> {
        let link = self.link()?;
        let request = match range {
            Some((low, high)) => WhoIsRequest::range(low, high),
            None => WhoIsRequest::global(),
        };

        let mut tx = [0u8; 64];
        let mut w = Writer::new(&mut tx);
        Npdu::application(false).encode(&mut w)?;
        request.encode(&mut w)?;

        link.send(
            DataLinkAddress::local_broadcast(DataLinkAddress::BACNET_IP_DEFAULT_PORT),
            w.as_written(),
        )
        .await?;
        self.shared.metrics.who_is_sent.inc();
        self.shared
            .metrics
            .bytes_sent
            .add(w.as_written().len() as u64);

        sleep(wait).await;
        Ok(self.shared.registry.snapshot(range))
    }

    /// Resolves a device instance to its transport address, running a
    /// targeted `Who-Is` on a miss (or when the cached binding outlived
    /// [`ClientConfig::binding_ttl`]).
    async fn resolve_device(&self, device_id: u32) -> Result<DataLinkAddress, ClientError> {
        if let Some(addr) = self
            .shared
            .registry
            .resolve(device_id, self.config.binding_ttl)
        {
            return Ok(DataLinkAddress::Ip(addr));
        }

        self.who_is_for(Some((device_id, device_id)), REDISCOVERY_TIMEOUT)
            .await?;

        self.shared
            .registry
            .resolve(device_id, None)
            .map(DataLinkAddress::Ip)
            .ok_or(ClientError::DeviceNotFound { device_id })
    }

    /// Reads one property. A value frame carrying several primitives comes
    /// back as [`Value::Constructed`].
    pub async fn read_property(
        &self,
        device_id: u32,
        object_id: ObjectId,
        property_id: PropertyId,
        array_index: Option<u32>,
    ) -> Result<Value, ClientError> {
        let address = self.resolve_device(device_id).await?;
        let request = ReadPropertyRequest {
            object_id,
            property_id,
            array_index,
        };
        let payload = self
            .request_complex_ack(address, SERVICE_READ_PROPERTY, |w| request.encode_payload(w))
            .await?;

        let mut r = Reader::new(&payload);
        let ack = ReadPropertyAck::decode_after_header(&mut r)?;
        Ok(Value::from_wire(&ack.value))
    }

    /// Writes one property. `priority` must be 1-16 when given; anything
    /// else fails with `InvalidPriority` before a datagram goes out.
    pub async fn write_property(
        &self,
        device_id: u32,
        object_id: ObjectId,
        property_id: PropertyId,
        value: Value,
        array_index: Option<u32>,
        priority: Option<u8>,
    ) -> Result<(), ClientError> {
        if let Some(priority) = priority {
            if !(1..=16).contains(&priority) {
                return Err(ClientError::InvalidPriority { priority });
            }
        }

        let address = self.resolve_device(device_id).await?;
        let request = WritePropertyRequest {
            object_id,
            property_id,
            value: value.to_wire(),
            array_index,
            priority,
        };
        self.request_simple_ack(address, SERVICE_WRITE_PROPERTY, |w| request.encode_payload(w))
            .await
    }

    /// Reads several properties in one request, grouped per object, and
    /// flattens the acknowledgement. Per-property access errors come back
    /// inline in each row's `outcome`.
    pub async fn read_property_multiple(
        &self,
        device_id: u32,
        specs: &[PropertySpec],
    ) -> Result<Vec<PropertyReadResult>, ClientError> {
        let address = self.resolve_device(device_id).await?;

        let mut groups: Vec<(ObjectId, Vec<PropertyReference>)> = Vec::new();
        for spec in specs {
            let reference = PropertyReference {
                property_id: spec.property_id,
                array_index: spec.array_index,
            };
            match groups.iter_mut().find(|(oid, _)| *oid == spec.object_id) {
                Some((_, props)) => props.push(reference),
                None => groups.push((spec.object_id, vec![reference])),
            }
        }
        let wire_specs: Vec<ReadAccessSpecification<'_>> = groups
            .iter()
            .map(|(object_id, properties)| ReadAccessSpecification {
                object_id: *object_id,
                properties,
            })
            .collect();
        let request = ReadPropertyMultipleRequest { specs: &wire_specs };

        let payload = self
            .request_complex_ack(address, SERVICE_READ_PROPERTY_MULTIPLE, |w| {
                request.encode_payload(w)
            })
            .await?;

        let mut r = Reader::new(&payload);
        let ack = ReadPropertyMultipleAck::decode_after_header(&mut r)?;
        let mut rows = Vec::new();
        for result in &ack.results {
            for element in &result.results {
                rows.push(PropertyReadResult {
                    object_id: result.object_id,
                    property_id: element.property_id,
                    array_index: element.array_index,
                    outcome: match &element.outcome {
                        PropertyOutcome::Value(value) => Ok(Value::from_wire(value)),
                        PropertyOutcome::Error { class, code } => Err(PropertyError {
                            class: *class,
                            code: *code,
                        }),
                    },
                });
            }
        }
        Ok(rows)
    }

    /// Subscribes to change-of-value notifications for an object. Returns
    /// the subscriber process id, which also keys the handler; pass it to
    /// [`unsubscribe_cov`](BacnetClient::unsubscribe_cov) to cancel.
    pub async fn subscribe_cov(
        &self,
        device_id: u32,
        object_id: ObjectId,
        handler: CovHandler,
        lifetime_seconds: Option<u32>,
        confirmed: bool,
    ) -> Result<u32, ClientError> {
        let address = self.resolve_device(device_id).await?;
        let process_id = self.shared.process_ids.fetch_add(1, Ordering::Relaxed);
        let request = SubscribeCovRequest {
            subscriber_process_id: process_id,
            monitored_object_id: object_id,
            issue_confirmed_notifications: Some(confirmed),
            lifetime_seconds,
        };
        self.request_simple_ack(address, SERVICE_SUBSCRIBE_COV, |w| request.encode_payload(w))
            .await?;

        self.shared
            .subscriptions
            .insert(process_id, device_id, object_id, handler);
        Ok(process_id)
    }

    /// Cancels a COV subscription and removes its handler.
    pub async fn unsubscribe_cov(
        &self,
        device_id: u32,
        object_id: ObjectId,
        subscriber_id: u32,
    ) -> Result<(), ClientError> {
        let address = self.resolve_device(device_id).await?;
        let request = SubscribeCovRequest::cancellation(subscriber_id, object_id);
        self.request_simple_ack(address, SERVICE_SUBSCRIBE_COV, |w| request.encode_payload(w))
            .await?;
        self.shared.subscriptions.remove(subscriber_id);
        Ok(())
    }

    /// Reads the device object's name (and vendor name, where supported)
    /// and records them on the registry entry.
    pub async fn read_device_metadata(&self, device_id: u32) -> Result<DeviceInfo, ClientError> {
        let device_object = ObjectId::new(ObjectType::Device, device_id);

        let object_name = match self
            .read_property(device_id, device_object, PropertyId::ObjectName, None)
            .await?
        {
            Value::CharacterString(name) => Some(name),
            _ => None,
        };

        let vendor_name = match self
            .read_property(device_id, device_object, PropertyId::VendorName, None)
            .await
        {
            Ok(Value::CharacterString(name)) => Some(name),
            Ok(_) => None,
            Err(err) if err.is_property_not_found() => None,
            Err(err) => return Err(err),
        };

        self.shared
            .registry
            .set_metadata(device_id, object_name, vendor_name);
        self.shared
            .registry
            .get(device_id)
            .ok_or(ClientError::DeviceNotFound { device_id })
    }

    /// Sends one confirmed request and waits for its reply, retrying on
    /// timeout with the same invoke id. The transaction slot is removed on
    /// every exit path, including caller-side cancellation by drop.
    async fn send_confirmed<F>(
        &self,
        address: DataLinkAddress,
        service_choice: u8,
        encode_payload: F,
    ) -> Result<Reply, ClientError>
    where
        F: Fn(&mut Writer<'_>) -> Result<(), EncodeError>,
    {
        let link = self.link()?;
        let (slot, mut rx) = self.shared.transactions.begin()?;

        let mut tx = [0u8; MAX_FRAME_LEN];
        let mut w = Writer::new(&mut tx);
        Npdu::application(true).encode(&mut w)?;
        ConfirmedRequestHeader {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: self.config.segmentation.accepts_segmented_responses(),
            max_segments: 0,
            max_apdu: MaxApdu::fitting(self.config.max_apdu).code(),
            invoke_id: slot.invoke_id(),
            sequence_number: None,
            proposed_window_size: None,
            service_choice,
        }
        .encode(&mut w)?;
        encode_payload(&mut w)?;
        let frame = w.as_written();

        let mut attempt: u32 = 0;
        loop {
            link.send(address, frame).await?;
            self.shared.metrics.requests_sent.inc();
            self.shared.metrics.bytes_sent.add(frame.len() as u64);

            match timeout(self.config.request_timeout, &mut rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                // The slot vanished without a reply; close() reports that
                // through Reply::Closed, so this is a cancellation race.
                Ok(Err(_)) => {
                    return Err(if self.state() == ConnectionState::Connected {
                        ClientError::Cancelled
                    } else {
                        ClientError::ConnectionClosed
                    });
                }
                Err(_) => {
                    if attempt >= self.config.retries {
                        self.shared.metrics.requests_timed_out.inc();
                        return Err(ClientError::Timeout);
                    }
                    attempt += 1;
                    self.shared.metrics.retransmissions.inc();
                    sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    async fn request_simple_ack<F>(
        &self,
        address: DataLinkAddress,
        service_choice: u8,
        encode_payload: F,
    ) -> Result<(), ClientError>
    where
        F: Fn(&mut Writer<'_>) -> Result<(), EncodeError>,
    {
        match self
            .send_confirmed(address, service_choice, encode_payload)
            .await?
        {
            Reply::SimpleAck {
                service_choice: ack_service,
            } if ack_service == service_choice => {
                self.shared.metrics.requests_succeeded.inc();
                Ok(())
            }
            reply => Err(self.reply_to_error(reply)),
        }
    }

    async fn request_complex_ack<F>(
        &self,
        address: DataLinkAddress,
        service_choice: u8,
        encode_payload: F,
    ) -> Result<Vec<u8>, ClientError>
    where
        F: Fn(&mut Writer<'_>) -> Result<(), EncodeError>,
    {
        match self
            .send_confirmed(address, service_choice, encode_payload)
            .await?
        {
            Reply::ComplexAck {
                service_choice: ack_service,
                payload,
            } if ack_service == service_choice => {
                self.shared.metrics.requests_succeeded.inc();
                Ok(payload)
            }
            reply => Err(self.reply_to_error(reply)),
        }
    }

    fn reply_to_error(&self, reply: Reply) -> ClientError {
        self.shared.metrics.requests_failed.inc();
        match reply {
            Reply::ServiceError { class, code, .. } => ClientError::Remote {
                class: class.unwrap_or(0),
                code: code.unwrap_or(0),
            },
            Reply::Reject { reason } => ClientError::Reject { reason },
            Reply::Abort { server, reason } => ClientError::Abort { server, reason },
            Reply::Closed => ClientError::ConnectionClosed,
            Reply::SimpleAck { .. } | Reply::ComplexAck { .. } => ClientError::UnexpectedResponse,
        }
    }
}

impl BacnetClient<BacnetIpTransport> {
    /// Creates a disconnected BACnet/IP client.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_config(config)
    }

    /// Opens the UDP transport per the configuration, registers at the
    /// BBMD when one is configured, and starts the receive loop.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.begin_connect()?;

        let bind_addr = self
            .config
            .local_bind
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        let bind_result = match &self.config.bbmd {
            Some(bbmd) => BacnetIpTransport::bind_foreign(bind_addr, bbmd.address).await,
            None => BacnetIpTransport::bind(bind_addr).await,
        };
        let transport = match bind_result {
            Ok(transport) => transport,
            Err(err) => {
                self.abort_connect();
                return Err(err.into());
            }
        };

        if let Some(bbmd) = &self.config.bbmd {
            let ttl = ttl_seconds(bbmd.ttl);
            if let Err(err) = transport.register_foreign_device(ttl).await {
                log::warn!("foreign device registration at {} failed: {err}", bbmd.address);
            }

            // Re-register at half the TTL so the BBMD entry never lapses.
            let renewal_link = transport.clone();
            let interval = Duration::from_secs(u64::from(ttl / 2).max(1));
            *lock(&self.renewal) = Some(tokio::spawn(async move {
                loop {
                    sleep(interval).await;
                    if let Err(err) = renewal_link.register_foreign_device_no_wait(ttl).await {
                        log::warn!("foreign device re-registration failed: {err}");
                    }
                }
            }));
        }

        self.finish_connect(Arc::new(transport));
        log::debug!("client connected");
        Ok(())
    }
}

fn ttl_seconds(ttl: Duration) -> u16 {
    ttl.as_secs().clamp(1, u64::from(u16::MAX)) as u16
}

async fn run_receiver<D: DataLink>(link: Arc<D>, shared: Arc<Shared>) {
    let mut buf = [0u8; MAX_FRAME_LEN];
    loop {
        match link.recv(&mut buf).await {
            Ok((n, source)) => {
                shared.metrics.bytes_received.add(n as u64);
                handle_frame(&link, &shared, &buf[..n], source).await;
            }
            Err(err) if err.is_transient() => {
                log::debug!("dropping undecodable datagram: {err}");
            }
            Err(DataLinkError::Io(err))
                if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) =>
            {
                continue;
            }
            Err(err) => {
                log::debug!("receive loop terminating: {err}");
                shared
                    .state
                    .store(ConnectionState::Disconnected as u8, Ordering::Release);
                shared.transactions.fail_all();
                return;
            }
        }
    }
}

async fn handle_frame<D: DataLink>(
    link: &Arc<D>,
    shared: &Arc<Shared>,
    frame: &[u8],
    source: DataLinkAddress,
) {
    let mut r = Reader::new(frame);
    let npdu = match Npdu::decode(&mut r) {
        Ok(npdu) => npdu,
        Err(err) => {
            log::debug!("invalid NPDU from {source}: {err}");
            return;
        }
    };
    // Network-layer traffic is never a reply to an application transaction.
    if npdu.is_network_message() {
        return;
    }

    let apdu = r.read_rest();
    let Some(apdu_type) = ApduType::of_frame(apdu) else {
        log::debug!("empty APDU from {source}");
        return;
    };
    let mut ar = Reader::new(apdu);

    match apdu_type {
        ApduType::UnconfirmedRequest => {
            let Ok(header) = UnconfirmedRequestHeader::decode(&mut ar) else {
                return;
            };
            match header.service_choice {
                SERVICE_I_AM => handle_i_am(shared, &mut ar, &npdu, source),
                SERVICE_UNCONFIRMED_COV_NOTIFICATION => {
                    dispatch_cov(shared, &mut ar, source, false);
                }
                _ => {}
            }
        }
        ApduType::ConfirmedRequest => {
            let Ok(header) = ConfirmedRequestHeader::decode(&mut ar) else {
                return;
            };
            if header.service_choice == SERVICE_CONFIRMED_COV_NOTIFICATION && !header.segmented {
                let mut ack = [0u8; 16];
                let mut w = Writer::new(&mut ack);
                let encoded = Npdu::application(false).encode(&mut w).and_then(|()| {
                    SimpleAck {
                        invoke_id: header.invoke_id,
                        service_choice: header.service_choice,
                    }
                    .encode(&mut w)
                });
                if encoded.is_ok() {
                    if let Err(err) = link.send(source, w.as_written()).await {
                        log::debug!("failed to acknowledge COV notification: {err}");
                    }
                }
                dispatch_cov(shared, &mut ar, source, true);
            }
        }
        ApduType::SimpleAck => {
            if let Ok(ack) = SimpleAck::decode(&mut ar) {
                deliver(
                    shared,
                    ack.invoke_id,
                    Reply::SimpleAck {
                        service_choice: ack.service_choice,
                    },
                );
            }
        }
        ApduType::ComplexAck => {
            if let Ok(header) = ComplexAckHeader::decode(&mut ar) {
                if header.segmented {
                    // Reassembly is unsupported; fail the transaction the
                    // way the peer would report it.
                    deliver(
                        shared,
                        header.invoke_id,
                        Reply::Abort {
                            server: true,
                            reason: AbortReason::SegmentationNotSupported.to_u8(),
                        },
                    );
                } else {
                    deliver(
                        shared,
                        header.invoke_id,
                        Reply::ComplexAck {
                            service_choice: header.service_choice,
                            payload: ar.read_rest().to_vec(),
                        },
                    );
                }
            }
        }
        ApduType::Error => {
            if let Ok(err) = ErrorPdu::decode(&mut ar) {
                deliver(
                    shared,
                    err.invoke_id,
                    Reply::ServiceError {
                        service_choice: err.service_choice,
                        class: err.error_class,
                        code: err.error_code,
                    },
                );
            }
        }
        ApduType::Reject => {
            if let Ok(reject) = RejectPdu::decode(&mut ar) {
                deliver(
                    shared,
                    reject.invoke_id,
                    Reply::Reject {
                        reason: reject.reason,
                    },
                );
            }
        }
        ApduType::Abort => {
            if let Ok(abort) = AbortPdu::decode(&mut ar) {
                deliver(
                    shared,
                    abort.invoke_id,
                    Reply::Abort {
                        server: abort.server,
                        reason: abort.reason,
                    },
                );
            }
        }
        ApduType::SegmentAck => {
            if let Ok(ack) = SegmentAck::decode(&mut ar) {
                log::debug!("ignoring segment ack for invoke id {}", ack.invoke_id);
            }
        }
    }
}

fn deliver(shared: &Shared, invoke_id: u8, reply: Reply) {
    if !shared.transactions.deliver(invoke_id, reply) {
        log::debug!("response for unknown invoke id {invoke_id} dropped");
    }
}

fn handle_i_am(shared: &Shared, r: &mut Reader<'_>, npdu: &Npdu, source: DataLinkAddress) {
    let i_am = match IAmPayload::decode_after_header(r) {
        Ok(i_am) => i_am,
        Err(err) => {
            log::debug!("undecodable I-Am from {source}: {err}");
            return;
        }
    };
    shared.metrics.i_am_received.inc();
    if shared.registry.observe_i_am(&i_am, npdu, source) {
        shared.metrics.devices_discovered.inc();
        log::debug!(
            "discovered device {} at {source} (vendor {})",
            i_am.device_id.instance(),
            i_am.vendor_id
        );
    }
}

fn dispatch_cov(shared: &Shared, r: &mut Reader<'_>, source: DataLinkAddress, confirmed: bool) {
    let payload = match CovNotificationPayload::decode_after_header(r) {
        Ok(payload) => payload,
        Err(err) => {
            log::debug!("undecodable COV notification from {source}: {err}");
            return;
        }
    };
    shared.metrics.cov_notifications.inc();

    let notification = CovNotification::from_payload(&payload, source, confirmed);
    // The handler is cloned out under the lock and run after release, so a
    // handler calling back into the client cannot deadlock.
    match shared.subscriptions.match_handler(&notification) {
        Some(handler) => handler(notification),
        None => log::debug!("COV notification without matching subscription from {source}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cov::CovHandler;
    use bacio_core::encoding::primitives::{
        decode_unsigned, encode_app_real, encode_ctx_object_id, encode_ctx_unsigned,
    };
    use bacio_core::encoding::tag::Tag;
    use bacio_core::types::Segmentation;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use tokio::sync::Mutex as AsyncMutex;
    use tokio::time::Instant;

    #[derive(Clone)]
    struct ChannelDataLink {
        local_addr: DataLinkAddress,
        tx: mpsc::UnboundedSender<(Vec<u8>, DataLinkAddress)>,
        rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<(Vec<u8>, DataLinkAddress)>>>,
        sent: Arc<AtomicUsize>,
    }

    impl DataLink for ChannelDataLink {
        async fn send(
            &self,
            _address: DataLinkAddress,
            payload: &[u8],
        ) -> Result<(), DataLinkError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            self.tx
                .send((payload.to_vec(), self.local_addr))
                .map_err(|_| DataLinkError::NotOpen)
        }

        async fn recv<'a>(
            &'a self,
            buf: &'a mut [u8],
        ) -> Result<(usize, DataLinkAddress), DataLinkError> {
            let mut rx = self.rx.lock().await;
            let Some((payload, source)) = rx.recv().await else {
                return Err(DataLinkError::NotOpen);
            };
            if payload.len() > buf.len() {
                return Err(DataLinkError::FrameTooLarge);
            }
            buf[..payload.len()].copy_from_slice(&payload);
            Ok((payload.len(), source))
        }
    }

    /// Returns (client link, device link, device address). Whatever one
    /// side sends, the other receives, tagged with the sender's address.
    fn datalink_pair() -> (ChannelDataLink, ChannelDataLink, DataLinkAddress) {
        let client_addr =
            DataLinkAddress::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 47820));
        let device_addr =
            DataLinkAddress::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 47821));
        let (client_tx, device_rx) = mpsc::unbounded_channel();
        let (device_tx, client_rx) = mpsc::unbounded_channel();

        (
            ChannelDataLink {
                local_addr: client_addr,
                tx: client_tx,
                rx: Arc::new(AsyncMutex::new(client_rx)),
                sent: Arc::new(AtomicUsize::new(0)),
            },
            ChannelDataLink {
                local_addr: device_addr,
                tx: device_tx,
                rx: Arc::new(AsyncMutex::new(device_rx)),
                sent: Arc::new(AtomicUsize::new(0)),
            },
            device_addr,
        )
    }

    const DEVICE_INSTANCE: u32 = 1234;

    fn i_am_frame() -> Vec<u8> {
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        Npdu::application(false).encode(&mut w).unwrap();
        IAmPayload {
            device_id: ObjectId::new(ObjectType::Device, DEVICE_INSTANCE),
            max_apdu: 1476,
            segmentation: 0,
            vendor_id: 25,
        }
        .encode(&mut w)
        .unwrap();
        w.as_written().to_vec()
    }

    /// Splits an outgoing client frame into its confirmed-request header
    /// and service payload, or None for unconfirmed traffic.
    fn parse_confirmed(frame: &[u8]) -> Option<(ConfirmedRequestHeader, Vec<u8>)> {
        let mut r = Reader::new(frame);
        Npdu::decode(&mut r).ok()?;
        let apdu = r.read_rest();
        if ApduType::of_frame(apdu)? != ApduType::ConfirmedRequest {
            return None;
        }
        let mut ar = Reader::new(apdu);
        let header = ConfirmedRequestHeader::decode(&mut ar).ok()?;
        Some((header, ar.read_rest().to_vec()))
    }

    fn simple_ack_frame(invoke_id: u8, service_choice: u8) -> Vec<u8> {
        let mut buf = [0u8; 16];
        let mut w = Writer::new(&mut buf);
        Npdu::application(false).encode(&mut w).unwrap();
        SimpleAck {
            invoke_id,
            service_choice,
        }
        .encode(&mut w)
        .unwrap();
        w.as_written().to_vec()
    }

    fn complex_ack_frame(invoke_id: u8, service_choice: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let mut w = Writer::new(&mut buf);
        Npdu::application(false).encode(&mut w).unwrap();
        ComplexAckHeader {
            segmented: false,
            more_follows: false,
            invoke_id,
            sequence_number: None,
            proposed_window_size: None,
            service_choice,
        }
        .encode(&mut w)
        .unwrap();
        w.write_all(payload).unwrap();
        w.as_written().to_vec()
    }

    async fn recv_frame(link: &ChannelDataLink) -> Vec<u8> {
        let mut buf = [0u8; 1600];
        let (n, _) = link.recv(&mut buf).await.unwrap();
        buf[..n].to_vec()
    }

    fn quick_config() -> ClientConfig {
        ClientConfig::default()
            .with_discover_timeout(Duration::from_millis(100))
            .with_request_timeout(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn who_is_discovers_each_device_once() {
        let (client_dl, device_dl, _) = datalink_pair();
        let client = BacnetClient::with_config(quick_config());
        client.connect_with(client_dl).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        let device = tokio::spawn(async move {
            let frame = recv_frame(&device_dl).await;
            // A global Who-Is has no limits after the two-byte header.
            assert_eq!(&frame, &[0x01, 0x00, 0x10, 0x08]);
            // Answer twice; the repeat must not count as a new discovery.
            for _ in 0..2 {
                device_dl
                    .send(DataLinkAddress::local_broadcast(47808), &i_am_frame())
                    .await
                    .unwrap();
            }
            device_dl
        });

        let devices = client.who_is(None).await.unwrap();
        assert_eq!(devices.len(), 1);
        let info = &devices[0];
        assert_eq!(info.instance(), DEVICE_INSTANCE);
        assert_eq!(info.max_apdu, 1476);
        assert_eq!(info.segmentation(), Some(Segmentation::SegmentedBoth));
        assert_eq!(info.vendor_id, 25);

        let metrics = client.metrics();
        assert_eq!(metrics.i_am_received.value(), 2);
        assert_eq!(metrics.devices_discovered.value(), 1);

        let _device_dl = device.await.unwrap();
        client.close().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn read_property_decodes_the_ack_value() {
        let (client_dl, device_dl, _) = datalink_pair();
        let client = BacnetClient::with_config(quick_config());
        client.connect_with(client_dl).await.unwrap();

        let device = tokio::spawn(async move {
            // Targeted Who-Is from address resolution.
            let frame = recv_frame(&device_dl).await;
            assert_eq!(
                &frame,
                &[0x01, 0x00, 0x10, 0x08, 0x0A, 0x04, 0xD2, 0x1A, 0x04, 0xD2]
            );
            device_dl
                .send(DataLinkAddress::local_broadcast(47808), &i_am_frame())
                .await
                .unwrap();

            let frame = recv_frame(&device_dl).await;
            let (header, payload) = parse_confirmed(&frame).unwrap();
            assert_eq!(header.service_choice, SERVICE_READ_PROPERTY);
            assert_eq!(header.max_apdu, 5);
            assert!(!header.segmented);
            assert_eq!(
                payload,
                vec![0x0C, 0x00, 0x00, 0x00, 0x01, 0x19, 0x55]
            );

            let ack_payload = [
                0x0C, 0x00, 0x00, 0x00, 0x01, 0x19, 0x55, 0x3E, 0x44, 0x42, 0x2A, 0x00, 0x00,
                0x3F,
            ];
            let reply = complex_ack_frame(header.invoke_id, SERVICE_READ_PROPERTY, &ack_payload);
            device_dl
                .send(DataLinkAddress::local_broadcast(47808), &reply)
                .await
                .unwrap();
            device_dl
        });

        let value = client
            .read_property(
                DEVICE_INSTANCE,
                ObjectId::new(ObjectType::AnalogInput, 1),
                PropertyId::PresentValue,
                None,
            )
            .await
            .unwrap();
        assert_eq!(value, Value::Real(42.5));
        assert_eq!(client.metrics().requests_succeeded.value(), 1);

        let _device_dl = device.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn write_property_sends_priority_and_accepts_simple_ack() {
        let (client_dl, device_dl, _) = datalink_pair();
        let client = BacnetClient::with_config(quick_config());
        client.connect_with(client_dl).await.unwrap();

        let device = tokio::spawn(async move {
            recv_frame(&device_dl).await; // Who-Is
            device_dl
                .send(DataLinkAddress::local_broadcast(47808), &i_am_frame())
                .await
                .unwrap();

            let frame = recv_frame(&device_dl).await;
            let (header, payload) = parse_confirmed(&frame).unwrap();
            assert_eq!(header.service_choice, SERVICE_WRITE_PROPERTY);
            // Value frame with an application real, then [4] priority 8.
            assert_eq!(
                payload,
                vec![
                    0x0C, 0x00, 0x40, 0x00, 0x01, 0x19, 0x55, 0x3E, 0x44, 0x42, 0x97, 0x00,
                    0x00, 0x3F, 0x49, 0x08,
                ]
            );
            device_dl
                .send(
                    DataLinkAddress::local_broadcast(47808),
                    &simple_ack_frame(header.invoke_id, SERVICE_WRITE_PROPERTY),
                )
                .await
                .unwrap();
            device_dl
        });

        client
            .who_is_for(None, Duration::from_millis(100))
            .await
            .unwrap();
        client
            .write_property(
                DEVICE_INSTANCE,
                ObjectId::new(ObjectType::AnalogOutput, 1),
                PropertyId::PresentValue,
                Value::Real(75.5),
                None,
                Some(8),
            )
            .await
            .unwrap();

        let _device_dl = device.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn out_of_range_priority_fails_without_sending() {
        let (client_dl, _device_dl, _) = datalink_pair();
        let sent = client_dl.sent.clone();
        let client = BacnetClient::with_config(quick_config());
        client.connect_with(client_dl).await.unwrap();

        for priority in [0u8, 17, 255] {
            let err = client
                .write_property(
                    DEVICE_INSTANCE,
                    ObjectId::new(ObjectType::AnalogOutput, 1),
                    PropertyId::PresentValue,
                    Value::Real(1.0),
                    None,
                    Some(priority),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, ClientError::InvalidPriority { priority: p } if p == priority));
        }
        assert_eq!(sent.load(Ordering::SeqCst), 0);
        client.close().await;
    }

    #[tokio::test]
    async fn timeout_retries_reuse_the_invoke_id() {
        let (client_dl, device_dl, _) = datalink_pair();
        let sent = client_dl.sent.clone();
        let config = ClientConfig::default()
            .with_discover_timeout(Duration::from_millis(50))
            .with_request_timeout(Duration::from_millis(80))
            .with_retries(3)
            .with_retry_delay(Duration::from_millis(20));
        let client = BacnetClient::with_config(config);
        client.connect_with(client_dl).await.unwrap();

        let seen_invoke_ids = Arc::new(Mutex::new(Vec::new()));
        let seen = seen_invoke_ids.clone();
        let device = tokio::spawn(async move {
            recv_frame(&device_dl).await; // Who-Is
            device_dl
                .send(DataLinkAddress::local_broadcast(47808), &i_am_frame())
                .await
                .unwrap();

            // Drop the first two requests, answer the third.
            for attempt in 0..3 {
                let frame = recv_frame(&device_dl).await;
                let (header, _) = parse_confirmed(&frame).unwrap();
                lock(&seen).push(header.invoke_id);
                if attempt == 2 {
                    let ack_payload = [
                        0x0C, 0x00, 0x00, 0x00, 0x01, 0x19, 0x55, 0x3E, 0x44, 0x42, 0x2A, 0x00,
                        0x00, 0x3F,
                    ];
                    device_dl
                        .send(
                            DataLinkAddress::local_broadcast(47808),
                            &complex_ack_frame(header.invoke_id, SERVICE_READ_PROPERTY, &ack_payload),
                        )
                        .await
                        .unwrap();
                }
            }
            device_dl
        });

        client
            .who_is_for(None, Duration::from_millis(50))
            .await
            .unwrap();

        let started = Instant::now();
        let value = client
            .read_property(
                DEVICE_INSTANCE,
                ObjectId::new(ObjectType::AnalogInput, 1),
                PropertyId::PresentValue,
                None,
            )
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(value, Value::Real(42.5));
        // Two full per-attempt timeouts plus two retry delays went by.
        assert!(elapsed >= Duration::from_millis(190), "elapsed {elapsed:?}");

        let ids = lock(&seen_invoke_ids).clone();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
        // Who-Is plus exactly three transmissions of the request.
        assert_eq!(sent.load(Ordering::SeqCst), 4);
        assert_eq!(client.metrics().retransmissions.value(), 2);

        let _device_dl = device.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn remote_error_is_classified() {
        let (client_dl, device_dl, _) = datalink_pair();
        let client = BacnetClient::with_config(quick_config());
        client.connect_with(client_dl).await.unwrap();

        let device = tokio::spawn(async move {
            recv_frame(&device_dl).await; // Who-Is
            device_dl
                .send(DataLinkAddress::local_broadcast(47808), &i_am_frame())
                .await
                .unwrap();

            let frame = recv_frame(&device_dl).await;
            let (header, _) = parse_confirmed(&frame).unwrap();
            // Error: class property(2), code unknown-property(32).
            let reply = [
                0x01, 0x00, 0x50, header.invoke_id, 0x0C, 0x91, 0x02, 0x91, 0x20,
            ];
            device_dl
                .send(DataLinkAddress::local_broadcast(47808), &reply)
                .await
                .unwrap();
            device_dl
        });

        client
            .who_is_for(None, Duration::from_millis(100))
            .await
            .unwrap();
        let err = client
            .read_property(
                DEVICE_INSTANCE,
                ObjectId::new(ObjectType::AnalogInput, 1),
                PropertyId::Proprietary(999),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Remote { class: 2, code: 32 }));
        assert!(err.is_property_not_found());
        assert!(!err.is_device_not_found());

        let _device_dl = device.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn segmented_complex_ack_aborts_the_transaction() {
        let (client_dl, device_dl, _) = datalink_pair();
        let client = BacnetClient::with_config(quick_config());
        client.connect_with(client_dl).await.unwrap();

        let device = tokio::spawn(async move {
            recv_frame(&device_dl).await; // Who-Is
            device_dl
                .send(DataLinkAddress::local_broadcast(47808), &i_am_frame())
                .await
                .unwrap();

            let frame = recv_frame(&device_dl).await;
            let (header, _) = parse_confirmed(&frame).unwrap();

            let mut buf = [0u8; 64];
            let mut w = Writer::new(&mut buf);
            Npdu::application(false).encode(&mut w).unwrap();
            ComplexAckHeader {
                segmented: true,
                more_follows: true,
                invoke_id: header.invoke_id,
                sequence_number: Some(0),
                proposed_window_size: Some(4),
                service_choice: SERVICE_READ_PROPERTY,
            }
            .encode(&mut w)
            .unwrap();
            device_dl
                .send(DataLinkAddress::local_broadcast(47808), w.as_written())
                .await
                .unwrap();
            device_dl
        });

        client
            .who_is_for(None, Duration::from_millis(100))
            .await
            .unwrap();
        let err = client
            .read_property(
                DEVICE_INSTANCE,
                ObjectId::new(ObjectType::AnalogInput, 1),
                PropertyId::PresentValue,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::SegmentationNotSupported));

        let _device_dl = device.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn cov_subscription_receives_notifications() {
        let (client_dl, device_dl, _) = datalink_pair();
        let client = BacnetClient::with_config(quick_config());
        client.connect_with(client_dl).await.unwrap();

        let device = tokio::spawn(async move {
            recv_frame(&device_dl).await; // Who-Is
            device_dl
                .send(DataLinkAddress::local_broadcast(47808), &i_am_frame())
                .await
                .unwrap();

            let frame = recv_frame(&device_dl).await;
            let (header, payload) = parse_confirmed(&frame).unwrap();
            assert_eq!(header.service_choice, SERVICE_SUBSCRIBE_COV);

            // [0] subscriber process id opens the payload.
            let mut pr = Reader::new(&payload);
            let process_id = match Tag::decode(&mut pr).unwrap() {
                Tag::Context { tag_num: 0, len } => {
                    decode_unsigned(&mut pr, len as usize).unwrap()
                }
                other => panic!("unexpected tag {other:?}"),
            };

            device_dl
                .send(
                    DataLinkAddress::local_broadcast(47808),
                    &simple_ack_frame(header.invoke_id, SERVICE_SUBSCRIBE_COV),
                )
                .await
                .unwrap();

            // Push an unconfirmed notification for that subscription.
            let mut buf = [0u8; 128];
            let mut w = Writer::new(&mut buf);
            Npdu::application(false).encode(&mut w).unwrap();
            UnconfirmedRequestHeader {
                service_choice: SERVICE_UNCONFIRMED_COV_NOTIFICATION,
            }
            .encode(&mut w)
            .unwrap();
            encode_ctx_unsigned(&mut w, 0, process_id).unwrap();
            encode_ctx_object_id(
                &mut w,
                1,
                ObjectId::new(ObjectType::Device, DEVICE_INSTANCE).raw(),
            )
            .unwrap();
            encode_ctx_object_id(&mut w, 2, ObjectId::new(ObjectType::AnalogInput, 1).raw())
                .unwrap();
            encode_ctx_unsigned(&mut w, 3, 60).unwrap();
            Tag::Opening { tag_num: 4 }.encode(&mut w).unwrap();
            encode_ctx_unsigned(&mut w, 0, PropertyId::PresentValue.to_u32()).unwrap();
            Tag::Opening { tag_num: 2 }.encode(&mut w).unwrap();
            encode_app_real(&mut w, 21.5).unwrap();
            Tag::Closing { tag_num: 2 }.encode(&mut w).unwrap();
            Tag::Closing { tag_num: 4 }.encode(&mut w).unwrap();
            device_dl
                .send(DataLinkAddress::local_broadcast(47808), w.as_written())
                .await
                .unwrap();
            device_dl
        });

        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let handler: CovHandler = Arc::new(move |notification| {
            let _ = notify_tx.send(notification);
        });

        client
            .who_is_for(None, Duration::from_millis(100))
            .await
            .unwrap();
        let subscriber_id = client
            .subscribe_cov(
                DEVICE_INSTANCE,
                ObjectId::new(ObjectType::AnalogInput, 1),
                handler,
                Some(600),
                false,
            )
            .await
            .unwrap();

        let notification = timeout(Duration::from_secs(1), notify_rx.recv())
            .await
            .expect("notification timed out")
            .expect("notification channel closed");
        assert_eq!(notification.subscriber_process_id, subscriber_id);
        assert_eq!(
            notification.monitored_object_id,
            ObjectId::new(ObjectType::AnalogInput, 1)
        );
        assert_eq!(notification.time_remaining_seconds, 60);
        assert_eq!(notification.values.len(), 1);
        assert_eq!(notification.values[0].value, Value::Real(21.5));
        assert!(!notification.confirmed);
        assert_eq!(client.metrics().cov_notifications.value(), 1);

        let _device_dl = device.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn read_property_multiple_flattens_values_and_errors() {
        let (client_dl, device_dl, _) = datalink_pair();
        let client = BacnetClient::with_config(quick_config());
        client.connect_with(client_dl).await.unwrap();

        let device = tokio::spawn(async move {
            recv_frame(&device_dl).await; // Who-Is
            device_dl
                .send(DataLinkAddress::local_broadcast(47808), &i_am_frame())
                .await
                .unwrap();

            let frame = recv_frame(&device_dl).await;
            let (header, _) = parse_confirmed(&frame).unwrap();
            assert_eq!(header.service_choice, SERVICE_READ_PROPERTY_MULTIPLE);

            let mut buf = [0u8; 128];
            let mut w = Writer::new(&mut buf);
            encode_ctx_unsigned(&mut w, 0, ObjectId::new(ObjectType::AnalogInput, 1).raw())
                .unwrap();
            Tag::Opening { tag_num: 1 }.encode(&mut w).unwrap();
            encode_ctx_unsigned(&mut w, 2, PropertyId::PresentValue.to_u32()).unwrap();
            Tag::Opening { tag_num: 4 }.encode(&mut w).unwrap();
            encode_app_real(&mut w, 42.0).unwrap();
            Tag::Closing { tag_num: 4 }.encode(&mut w).unwrap();
            encode_ctx_unsigned(&mut w, 2, PropertyId::Units.to_u32()).unwrap();
            Tag::Opening { tag_num: 5 }.encode(&mut w).unwrap();
            encode_ctx_unsigned(&mut w, 0, 2).unwrap();
            encode_ctx_unsigned(&mut w, 1, 32).unwrap();
            Tag::Closing { tag_num: 5 }.encode(&mut w).unwrap();
            Tag::Closing { tag_num: 1 }.encode(&mut w).unwrap();
            let ack_payload = w.as_written().to_vec();

            device_dl
                .send(
                    DataLinkAddress::local_broadcast(47808),
                    &complex_ack_frame(
                        header.invoke_id,
                        SERVICE_READ_PROPERTY_MULTIPLE,
                        &ack_payload,
                    ),
                )
                .await
                .unwrap();
            device_dl
        });

        client
            .who_is_for(None, Duration::from_millis(100))
            .await
            .unwrap();
        let object = ObjectId::new(ObjectType::AnalogInput, 1);
        let rows = client
            .read_property_multiple(
                DEVICE_INSTANCE,
                &[
                    PropertySpec {
                        object_id: object,
                        property_id: PropertyId::PresentValue,
                        array_index: None,
                    },
                    PropertySpec {
                        object_id: object,
                        property_id: PropertyId::Units,
                        array_index: None,
                    },
                ],
            )
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].outcome, Ok(Value::Real(42.0)));
        assert_eq!(
            rows[1].outcome,
            Err(PropertyError { class: 2, code: 32 })
        );

        let _device_dl = device.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn close_fails_outstanding_requests() {
        let (client_dl, device_dl, _) = datalink_pair();
        let client = Arc::new(BacnetClient::with_config(
            quick_config().with_request_timeout(Duration::from_secs(5)),
        ));
        client.connect_with(client_dl).await.unwrap();

        // A device that answers discovery but swallows everything else.
        let device = tokio::spawn(async move {
            recv_frame(&device_dl).await;
            device_dl
                .send(DataLinkAddress::local_broadcast(47808), &i_am_frame())
                .await
                .unwrap();
            loop {
                recv_frame(&device_dl).await;
            }
        });

        client
            .who_is_for(None, Duration::from_millis(100))
            .await
            .unwrap();

        let caller = client.clone();
        let pending = tokio::spawn(async move {
            caller
                .read_property(
                    DEVICE_INSTANCE,
                    ObjectId::new(ObjectType::AnalogInput, 1),
                    PropertyId::PresentValue,
                    None,
                )
                .await
        });

        sleep(Duration::from_millis(150)).await;
        client.close().await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
        device.abort();
    }

    #[tokio::test]
    async fn second_connect_is_rejected() {
        let (client_dl, _device_dl, _) = datalink_pair();
        let (client_dl2, _device_dl2, _) = datalink_pair();
        let client = BacnetClient::with_config(quick_config());
        client.connect_with(client_dl).await.unwrap();
        let err = client.connect_with(client_dl2).await.unwrap_err();
        assert!(matches!(err, ClientError::AlreadyConnected));
        client.close().await;

        // Closed is terminal for the old loop but not for the client.
        let (client_dl3, _device_dl3, _) = datalink_pair();
        client.connect_with(client_dl3).await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn forwarded_i_am_rebinds_the_device_address() {
        use bacio_datalink::{BvlcFunction, BvlcHeader};

        let transport = BacnetIpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let client_addr = transport.local_addr().unwrap();
        let client = BacnetClient::with_config(quick_config());
        client.connect_with(transport).await.unwrap();

        let bbmd = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_port = device.local_addr().unwrap().port();

        // An I-Am relayed by a BBMD: the 6-byte originator in the
        // Forwarded-NPDU names the device socket, not the BBMD.
        let mut inner = [0u8; 64];
        let mut w = Writer::new(&mut inner);
        Npdu::application(false).encode(&mut w).unwrap();
        IAmPayload {
            device_id: ObjectId::new(ObjectType::Device, 777),
            max_apdu: 1476,
            segmentation: 3,
            vendor_id: 9,
        }
        .encode(&mut w)
        .unwrap();
        let npdu_frame = w.as_written().to_vec();

        let mut frame = [0u8; 96];
        let mut fw = Writer::new(&mut frame);
        BvlcHeader {
            function: BvlcFunction::ForwardedNpdu,
            length: (4 + 6 + npdu_frame.len()) as u16,
        }
        .encode(&mut fw)
        .unwrap();
        fw.write_all(&[127, 0, 0, 1]).unwrap();
        fw.write_be_u16(device_port).unwrap();
        fw.write_all(&npdu_frame).unwrap();
        bbmd.send_to(fw.as_written(), client_addr).await.unwrap();

        let mut info = None;
        for _ in 0..100 {
            if let Some(found) = client.device(777) {
                info = Some(found);
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let info = info.expect("forwarded I-Am never reached the registry");
        assert_eq!(info.address.mac.len(), 6);
        assert_eq!(info.address.socket_addr().unwrap().port(), device_port);

        // A directed request must go to the forwarded origin.
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let (n, src) = device.recv_from(&mut buf).await.unwrap();
            assert_eq!(buf[0], 0x81);
            assert_eq!(buf[1], BvlcFunction::OriginalUnicastNpdu.to_u8());
            let (header, _) = parse_confirmed(&buf[4..n]).unwrap();
            assert_eq!(header.service_choice, SERVICE_READ_PROPERTY);

            let ack_payload = [
                0x0C, 0x00, 0x00, 0x00, 0x01, 0x19, 0x55, 0x3E, 0x44, 0x42, 0x2A, 0x00, 0x00,
                0x3F,
            ];
            let reply = complex_ack_frame(header.invoke_id, SERVICE_READ_PROPERTY, &ack_payload);
            let mut out = [0u8; 256];
            let mut ow = Writer::new(&mut out);
            BvlcHeader {
                function: BvlcFunction::OriginalUnicastNpdu,
                length: (4 + reply.len()) as u16,
            }
            .encode(&mut ow)
            .unwrap();
            ow.write_all(&reply).unwrap();
            device.send_to(ow.as_written(), src).await.unwrap();
        });

        let value = client
            .read_property(
                777,
                ObjectId::new(ObjectType::AnalogInput, 1),
                PropertyId::PresentValue,
                None,
            )
            .await
            .unwrap();
        assert_eq!(value, Value::Real(42.5));

        responder.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn connect_registers_at_the_bbmd() {
        let bbmd = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bbmd_addr = bbmd.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, src) = bbmd.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[0x81, 0x05, 0x00, 0x06, 0x00, 0x3C]);
            bbmd.send_to(&[0x81, 0x00, 0x00, 0x06, 0x00, 0x00], src)
                .await
                .unwrap();
        });

        let config = ClientConfig::default()
            .with_local_bind("127.0.0.1:0".parse().unwrap())
            .with_bbmd(bbmd_addr, Duration::from_secs(60));
        let client = BacnetClient::new(config);
        client.connect().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        responder.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn requests_require_a_connection() {
        let client: BacnetClient<ChannelDataLink> = BacnetClient::with_config(quick_config());
        let err = client
            .read_property(
                DEVICE_INSTANCE,
                ObjectId::new(ObjectType::AnalogInput, 1),
                PropertyId::PresentValue,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn unknown_device_resolution_fails() {
        let (client_dl, device_dl, _) = datalink_pair();
        let client = BacnetClient::with_config(quick_config());
        client.connect_with(client_dl).await.unwrap();

        // Nobody answers the targeted Who-Is.
        let device = tokio::spawn(async move {
            loop {
                recv_frame(&device_dl).await;
            }
        });

        let err = client
            .read_property(
                99,
                ObjectId::new(ObjectType::AnalogInput, 1),
                PropertyId::PresentValue,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::DeviceNotFound { device_id: 99 }));
        assert!(err.is_device_not_found());
        device.abort();
        client.close().await;
    }
}
