//! Device address bindings learned from `I-Am` broadcasts.

use bacio_core::npdu::Npdu;
use bacio_core::services::i_am::IAmPayload;
use bacio_core::types::{ObjectId, ObjectType, Segmentation};
use bacio_datalink::DataLinkAddress;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Where a device can be reached: its BACnet network number plus a MAC
/// address whose length encodes the form. A 4-byte MAC is an IPv4 address
/// on the default port; a 6-byte MAC (as delivered via `Forwarded-NPDU`)
/// carries IPv4 plus port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    pub network: u16,
    pub mac: Vec<u8>,
}

impl DeviceAddress {
    /// Builds a local-network address from the datagram source, keeping the
    /// short 4-byte form when the device answers on the default port.
    pub fn from_link(source: DataLinkAddress) -> Self {
        let addr = source.as_socket_addr();
        let mac = match addr.ip() {
            IpAddr::V4(ip) => {
                let mut mac = ip.octets().to_vec();
                if addr.port() != DataLinkAddress::BACNET_IP_DEFAULT_PORT {
                    mac.extend_from_slice(&addr.port().to_be_bytes());
                }
                mac
            }
            // BACnet/IP Annex J is IPv4; anything else cannot be bound.
            IpAddr::V6(_) => Vec::new(),
        };
        Self { network: 0, mac }
    }

    /// The UDP destination for this binding, when the MAC has an IP form.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.mac.as_slice() {
            &[a, b, c, d] => Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
                DataLinkAddress::BACNET_IP_DEFAULT_PORT,
            )),
            &[a, b, c, d, p1, p2] => Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
                u16::from_be_bytes([p1, p2]),
            )),
            _ => None,
        }
    }
}

/// Everything the client knows about one device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub device_id: ObjectId,
    pub address: DeviceAddress,
    pub max_apdu: u16,
    /// Raw segmentation enumeration from the `I-Am`.
    pub segmentation_raw: u32,
    pub vendor_id: u16,
    /// Populated only by an explicit metadata read.
    pub object_name: Option<String>,
    /// Populated only by an explicit metadata read.
    pub vendor_name: Option<String>,
    /// When the last `I-Am` for this device arrived.
    pub last_seen: Instant,
}

impl DeviceInfo {
    pub fn instance(&self) -> u32 {
        self.device_id.instance()
    }

    pub fn segmentation(&self) -> Option<Segmentation> {
        Segmentation::from_u32(self.segmentation_raw)
    }
}

/// Instance-number-keyed registry of discovered devices. Entries are
/// created or replaced by `I-Am` observations and removed only by
/// [`reset`](Self::reset).
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<u32, DeviceInfo>>,
}

impl DeviceRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<u32, DeviceInfo>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records an `I-Am`, preferring the NPDU source specifier over the
    /// datagram source when present. Returns true for a previously unknown
    /// instance.
    pub(crate) fn observe_i_am(
        &self,
        i_am: &IAmPayload,
        npdu: &Npdu,
        source: DataLinkAddress,
    ) -> bool {
        if i_am.device_id.object_type() != ObjectType::Device {
            return false;
        }

        let address = match npdu.source {
            Some(src) => DeviceAddress {
                network: src.network,
                mac: src.mac_bytes().to_vec(),
            },
            None => DeviceAddress::from_link(source),
        };
        let max_apdu = i_am.max_apdu.min(u32::from(u16::MAX)) as u16;
        let vendor_id = i_am.vendor_id.min(u32::from(u16::MAX)) as u16;
        let now = Instant::now();

        let mut devices = self.lock();
        match devices.get_mut(&i_am.device_id.instance()) {
            Some(existing) => {
                existing.address = address;
                existing.max_apdu = max_apdu;
                existing.segmentation_raw = i_am.segmentation;
                existing.vendor_id = vendor_id;
                existing.last_seen = now;
                false
            }
            None => {
                devices.insert(
                    i_am.device_id.instance(),
                    DeviceInfo {
                        device_id: i_am.device_id,
                        address,
                        max_apdu,
                        segmentation_raw: i_am.segmentation,
                        vendor_id,
                        object_name: None,
                        vendor_name: None,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, device_id: u32) -> Option<DeviceInfo> {
        self.lock().get(&device_id).cloned()
    }

    /// All known devices whose instance falls in the optional range,
    /// ordered by instance number.
    pub fn snapshot(&self, range: Option<(u32, u32)>) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self
            .lock()
            .values()
            .filter(|info| match range {
                Some((low, high)) => (low..=high).contains(&info.instance()),
                None => true,
            })
            .cloned()
            .collect();
        devices.sort_by_key(DeviceInfo::instance);
        devices
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops every binding.
    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Resolves an instance to a UDP destination. A binding older than
    /// `max_age` is treated as a miss so the caller re-verifies it.
    pub(crate) fn resolve(&self, device_id: u32, max_age: Option<Duration>) -> Option<SocketAddr> {
        let devices = self.lock();
        let info = devices.get(&device_id)?;
        if let Some(ttl) = max_age {
            if info.last_seen.elapsed() > ttl {
                return None;
            }
        }
        info.address.socket_addr()
    }

    pub(crate) fn set_metadata(
        &self,
        device_id: u32,
        object_name: Option<String>,
        vendor_name: Option<String>,
    ) {
        if let Some(info) = self.lock().get_mut(&device_id) {
            if object_name.is_some() {
                info.object_name = object_name;
            }
            if vendor_name.is_some() {
                info.vendor_name = vendor_name;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DeviceAddress, DeviceRegistry};
    use bacio_core::npdu::{Npdu, NpduAddress};
    use bacio_core::services::i_am::IAmPayload;
    use bacio_core::types::{ObjectId, ObjectType};
    use bacio_datalink::DataLinkAddress;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn i_am(instance: u32) -> IAmPayload {
        IAmPayload {
            device_id: ObjectId::new(ObjectType::Device, instance),
            max_apdu: 1476,
            segmentation: 3,
            vendor_id: 25,
        }
    }

    fn source(port: u16) -> DataLinkAddress {
        DataLinkAddress::Ip(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)),
            port,
        ))
    }

    #[test]
    fn first_i_am_is_new_repeat_is_not() {
        let registry = DeviceRegistry::default();
        let npdu = Npdu::application(false);
        assert!(registry.observe_i_am(&i_am(1234), &npdu, source(47808)));
        assert!(!registry.observe_i_am(&i_am(1234), &npdu, source(47808)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn non_device_object_is_ignored() {
        let registry = DeviceRegistry::default();
        let npdu = Npdu::application(false);
        let bogus = IAmPayload {
            device_id: ObjectId::new(ObjectType::AnalogInput, 7),
            max_apdu: 480,
            segmentation: 3,
            vendor_id: 1,
        };
        assert!(!registry.observe_i_am(&bogus, &npdu, source(47808)));
        assert!(registry.is_empty());
    }

    #[test]
    fn default_port_yields_four_byte_mac() {
        let addr = DeviceAddress::from_link(source(47808));
        assert_eq!(addr.mac.len(), 4);
        assert_eq!(
            addr.socket_addr().unwrap(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)), 47808)
        );
    }

    #[test]
    fn forwarded_port_yields_six_byte_mac() {
        let addr = DeviceAddress::from_link(source(50012));
        assert_eq!(addr.mac.len(), 6);
        assert_eq!(
            addr.socket_addr().unwrap(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)), 50012)
        );
    }

    #[test]
    fn npdu_source_specifier_wins_over_datagram_source() {
        let registry = DeviceRegistry::default();
        let mut npdu = Npdu::application(false);
        npdu.source = Some(NpduAddress {
            network: 17,
            mac: [0x63, 0, 0, 0, 0, 0],
            mac_len: 1,
        });
        registry.observe_i_am(&i_am(9), &npdu, source(47808));
        let info = registry.get(9).unwrap();
        assert_eq!(info.address.network, 17);
        assert_eq!(info.address.mac, vec![0x63]);
        // A one-byte MAC has no IP form to resolve to.
        assert!(registry.resolve(9, None).is_none());
    }

    #[test]
    fn snapshot_filters_by_range() {
        let registry = DeviceRegistry::default();
        let npdu = Npdu::application(false);
        for instance in [5, 10, 15] {
            registry.observe_i_am(&i_am(instance), &npdu, source(47808));
        }
        let all = registry.snapshot(None);
        assert_eq!(all.len(), 3);
        let windowed = registry.snapshot(Some((6, 14)));
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].instance(), 10);
        registry.reset();
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_binding_resolves_as_miss() {
        let registry = DeviceRegistry::default();
        let npdu = Npdu::application(false);
        registry.observe_i_am(&i_am(3), &npdu, source(47808));
        assert!(registry.resolve(3, None).is_some());
        assert!(registry
            .resolve(3, Some(std::time::Duration::ZERO))
            .is_none());
    }
}
