// standard
use std::collections::BTreeMap;

// internal crates
use crate::error::Error;
use crate::tor_crypto::*;

/// Where the key of a hidden service came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyOrigin {
    Supplied,
    Generated,
}

/// A hidden service registered with the running tor engine
#[derive(Clone, Debug)]
pub struct HiddenService {
    pub service_id: V3OnionServiceId,
    pub virt_port: u16,
    pub target_port: u16,
    pub private_key: Ed25519PrivateKey,
    pub key_origin: KeyOrigin,
    /// Set once the engine reports the descriptor uploaded
    pub published: bool,
}

impl HiddenService {
    pub fn onion_address(&self) -> String {
        self.service_id.to_onion_address()
    }
}

/// Parse `<service id>` or `<service id>.onion`
pub fn parse_onion_address(address: &str) -> Result<V3OnionServiceId, Error> {
    let address = address.trim();
    V3OnionServiceId::from_onion_address(address)
        .map_err(|_| Error::UnknownAddress(address.to_string()))
}

// Onion services of the running engine keyed by service id; at most one entry
// per id.
#[derive(Default)]
pub(crate) struct HiddenServiceRegistry {
    services: BTreeMap<V3OnionServiceId, HiddenService>,
}

impl HiddenServiceRegistry {
    pub fn contains(&self, service_id: &V3OnionServiceId) -> bool {
        self.services.contains_key(service_id)
    }

    pub fn get(&self, service_id: &V3OnionServiceId) -> Option<&HiddenService> {
        self.services.get(service_id)
    }

    pub fn insert(&mut self, service: HiddenService) -> Result<(), Error> {
        if self.services.contains_key(&service.service_id) {
            return Err(Error::DuplicateAddress(service.onion_address()));
        }
        self.services.insert(service.service_id.clone(), service);
        Ok(())
    }

    pub fn remove(&mut self, service_id: &V3OnionServiceId) -> Option<HiddenService> {
        self.services.remove(service_id)
    }

    /// Returns whether the service was registered
    pub fn mark_published(&mut self, service_id: &V3OnionServiceId) -> bool {
        match self.services.get_mut(service_id) {
            Some(service) => {
                service.published = true;
                true
            }
            None => false,
        }
    }

    pub fn service_ids(&self) -> Vec<V3OnionServiceId> {
        self.services.keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<HiddenService> {
        self.services.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.services.clear();
    }
}

#[cfg(test)]
fn test_service(virt_port: u16) -> HiddenService {
    let private_key = Ed25519PrivateKey::generate();
    HiddenService {
        service_id: V3OnionServiceId::from_private_key(&private_key),
        virt_port,
        target_port: 8080,
        private_key,
        key_origin: KeyOrigin::Generated,
        published: false,
    }
}

#[test]
fn test_parse_onion_address() -> anyhow::Result<()> {
    let service_id = "6l62fw7tqctlu5fesdqukvpoxezkaxbzllrafa2ve6ewuhzphxczsjyd";

    assert_eq!(parse_onion_address(service_id)?.as_str(), service_id);
    assert_eq!(
        parse_onion_address(&format!("{}.onion", service_id))?.as_str(),
        service_id
    );

    for malformed in ["", "example.com", "abc.onion", &service_id[1..]] {
        assert!(matches!(
            parse_onion_address(malformed),
            Err(Error::UnknownAddress(_))
        ));
    }
    Ok(())
}

#[test]
fn test_hidden_service_registry() -> anyhow::Result<()> {
    let mut registry: HiddenServiceRegistry = Default::default();
    let service = test_service(80);
    let service_id = service.service_id.clone();

    registry.insert(service.clone())?;
    assert!(registry.contains(&service_id));
    assert!(matches!(
        registry.insert(service),
        Err(Error::DuplicateAddress(_))
    ));
    assert_eq!(registry.list().len(), 1);

    registry.insert(test_service(81))?;
    assert_eq!(registry.list().len(), 2);

    assert!(registry.mark_published(&service_id));
    assert!(registry.get(&service_id).map_or(false, |s| s.published));

    assert!(registry.remove(&service_id).is_some());
    assert!(registry.remove(&service_id).is_none());
    assert!(!registry.mark_published(&service_id));
    assert_eq!(registry.service_ids().len(), 1);

    registry.clear();
    assert!(registry.list().is_empty());
    Ok(())
}
