//! Device enumeration and exclusive output ownership.
//!
//! The output device has exactly one of three owners at any instant: nobody,
//! the playback controller, or the live pipeline. Ownership is taken with a
//! single compare-and-swap and represented by an [`OwnershipToken`]; dropping
//! the token gives the device back, so every exit path of an audio thread
//! (including unwinding) releases it.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::AudioBackend;
use crate::error::ChatterError;

/// Device name that defers routing to the sound server.
pub const DEFAULT_DEVICE: &str = "default";

/// One enumerated endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Stable node name used to target the device.
    pub id: String,
    /// Human-readable description.
    pub name: String,
    pub input: bool,
    pub output: bool,
}

/// Who holds the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Owner {
    Playback = 1,
    Live = 2,
}

impl Owner {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Owner::Playback),
            2 => Some(Owner::Live),
            _ => None,
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Playback => f.write_str("playback"),
            Owner::Live => f.write_str("live"),
        }
    }
}

const UNOWNED: u8 = 0;

/// Exclusive right to write to the output device.
///
/// Not `Clone`; moved into the audio thread that uses the device.
#[derive(Debug)]
pub struct OwnershipToken {
    owner: Owner,
    slot: Arc<AtomicU8>,
    released: bool,
}

impl OwnershipToken {
    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Give the device back now rather than at drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let freed = self
            .slot
            .compare_exchange(self.owner as u8, UNOWNED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        debug!(owner = %self.owner, freed, "output device released");
    }
}

impl Drop for OwnershipToken {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Enumerates devices on demand and arbitrates output ownership.
pub struct DeviceRegistry {
    backend: Arc<dyn AudioBackend>,
    owner: Arc<AtomicU8>,
    selected: RwLock<String>,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn AudioBackend>, selected: impl Into<String>) -> Self {
        Self {
            backend,
            owner: Arc::new(AtomicU8::new(UNOWNED)),
            selected: RwLock::new(selected.into()),
        }
    }

    /// Current device list, freshly enumerated.
    pub fn devices(&self) -> Result<Vec<DeviceDescriptor>, ChatterError> {
        self.backend.devices()
    }

    /// Resolve an id or display name against the current enumeration.
    pub fn validate(&self, requested: &str) -> Result<DeviceDescriptor, ChatterError> {
        if requested == DEFAULT_DEVICE {
            return Ok(DeviceDescriptor {
                id: DEFAULT_DEVICE.to_string(),
                name: "System default".to_string(),
                input: true,
                output: true,
            });
        }

        self.devices()?
            .into_iter()
            .find(|d| d.id == requested || d.name == requested)
            .ok_or_else(|| ChatterError::DeviceUnavailable(format!("no device named '{requested}'")))
    }

    /// Resolve `requested` and check that it can play audio.
    pub fn validate_output(&self, requested: &str) -> Result<DeviceDescriptor, ChatterError> {
        let device = self.validate(requested)?;
        if !device.output {
            return Err(ChatterError::DeviceUnavailable(format!(
                "'{}' has no output ports",
                device.id
            )));
        }
        Ok(device)
    }

    /// Make an already validated device the output selection.
    ///
    /// Takes effect on the next acquisition; a running stream keeps its device.
    pub fn select(&self, device: &DeviceDescriptor) {
        *self.selected.write().unwrap_or_else(std::sync::PoisonError::into_inner) = device.id.clone();
        info!(device = %device.id, "output device selected");
    }

    pub fn selected(&self) -> String {
        self.selected
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Take the output device, failing immediately if someone holds it.
    pub fn acquire(&self, owner: Owner) -> Result<OwnershipToken, ChatterError> {
        match self
            .owner
            .compare_exchange(UNOWNED, owner as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!(%owner, "output device acquired");
                Ok(OwnershipToken {
                    owner,
                    slot: Arc::clone(&self.owner),
                    released: false,
                })
            }
            Err(current) => Err(ChatterError::DeviceBusy {
                // A concurrent release between the CAS and here reads as the requester
                holder: Owner::from_code(current).unwrap_or(owner),
            }),
        }
    }

    /// Release a token explicitly.
    pub fn release(&self, token: OwnershipToken) {
        token.release();
    }

    pub fn holder(&self) -> Option<Owner> {
        Owner::from_code(self.owner.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBackend;
    use std::thread;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(SimBackend::new()), DEFAULT_DEVICE)
    }

    #[test]
    fn test_acquire_then_busy() {
        let registry = registry();
        let token = registry.acquire(Owner::Playback).unwrap();

        let err = registry.acquire(Owner::Live).unwrap_err();
        assert_eq!(err, ChatterError::DeviceBusy { holder: Owner::Playback });
        // the failed request left ownership alone
        assert_eq!(registry.holder(), Some(Owner::Playback));

        registry.release(token);
        assert_eq!(registry.holder(), None);
        assert!(registry.acquire(Owner::Live).is_ok());
    }

    #[test]
    fn test_same_owner_cannot_double_acquire() {
        let registry = registry();
        let _token = registry.acquire(Owner::Live).unwrap();
        assert!(matches!(
            registry.acquire(Owner::Live),
            Err(ChatterError::DeviceBusy { holder: Owner::Live })
        ));
    }

    #[test]
    fn test_drop_releases() {
        let registry = registry();
        {
            let _token = registry.acquire(Owner::Live).unwrap();
            assert_eq!(registry.holder(), Some(Owner::Live));
        }
        assert_eq!(registry.holder(), None);
    }

    #[test]
    fn test_release_on_panic() {
        let registry = Arc::new(registry());
        let r = Arc::clone(&registry);
        let result = thread::spawn(move || {
            let _token = r.acquire(Owner::Playback).unwrap();
            panic!("audio thread died");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(registry.holder(), None);
    }

    #[test]
    fn test_racing_acquirers_get_one_winner() {
        let registry = Arc::new(registry());
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let owner = if i % 2 == 0 { Owner::Playback } else { Owner::Live };
                    barrier.wait();
                    // hold the token until every thread has tried
                    let token = registry.acquire(owner).ok();
                    barrier.wait();
                    token.is_some()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_validate_and_select() {
        let registry = registry();
        let device = registry.validate("USB Audio").unwrap();
        assert_eq!(device.id, "sim.usb");

        assert!(matches!(
            registry.validate("hdmi"),
            Err(ChatterError::DeviceUnavailable(_))
        ));

        let usb = registry.validate_output("sim.usb").unwrap();
        registry.select(&usb);
        assert_eq!(registry.selected(), "sim.usb");

        // capture-only endpoints cannot be the output
        assert!(matches!(
            registry.validate_output("sim.mic"),
            Err(ChatterError::DeviceUnavailable(_))
        ));
        assert_eq!(registry.selected(), "sim.usb");
    }
}
