//! `_googlecast._tcp.local.` service advertisement.
//!
//! The receiver only *uses* a publisher through this small trait; the
//! default implementation is backed by `mdns-sd`. Tests and embedders can
//! swap in a no-op or recording implementation.

use std::collections::HashMap;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{debug, warn};

use crate::error::{CastforgeError, Result};

const SERVICE_TYPE: &str = "_googlecast._tcp.local.";

/// Default TXT record keys the receiver advertises, before any operator
/// override is applied.
fn default_txt(device_id: &str) -> HashMap<String, String> {
    HashMap::from([
        ("id".to_string(), device_id.to_string()),
        ("ve".to_string(), "02".to_string()),
        ("md".to_string(), "Chromecast".to_string()),
        ("fn".to_string(), "Owncast".to_string()),
        ("ca".to_string(), "5".to_string()),
        ("st".to_string(), "0".to_string()),
        ("rs".to_string(), "".to_string()),
        ("ic".to_string(), "/setup/icon.png".to_string()),
    ])
}

/// Merge operator overrides into the default TXT map. An empty override
/// value deletes that key.
fn apply_overrides(mut txt: HashMap<String, String>, overrides: &HashMap<String, String>) -> HashMap<String, String> {
    for (key, value) in overrides {
        if value.is_empty() {
            txt.remove(key);
        } else {
            txt.insert(key.clone(), value.clone());
        }
    }
    txt
}

/// Something that can register and unregister a `_googlecast._tcp.local.`
/// advertisement. Registration is a server-owned resource; whether `Close`
/// tears it down is tracked by the caller (see `cast::mod`'s
/// "only close what we created" rule).
pub trait ServiceAdvertiser: Send + Sync {
    fn advertise(&self, device_id: &str, port: u16, txt_overrides: &HashMap<String, String>) -> Result<()>;
    fn withdraw(&self) -> Result<()>;
}

/// `mdns-sd`-backed advertiser.
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    fullname: std::sync::Mutex<Option<String>>,
}

impl MdnsAdvertiser {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| CastforgeError::Configuration(format!("failed to start mDNS daemon: {e}")))?;
        Ok(Self { daemon, fullname: std::sync::Mutex::new(None) })
    }
}

impl ServiceAdvertiser for MdnsAdvertiser {
    fn advertise(&self, device_id: &str, port: u16, txt_overrides: &HashMap<String, String>) -> Result<()> {
        let txt = apply_overrides(default_txt(device_id), txt_overrides);
        let host_name = format!("{device_id}.local.");
        let instance_name = device_id.to_string();

        let service = ServiceInfo::new(SERVICE_TYPE, &instance_name, &host_name, "", port, txt)
            .map_err(|e| CastforgeError::Configuration(format!("failed to build mDNS service info: {e}")))?
            .enable_addr_auto();

        let fullname = service.get_fullname().to_string();
        self.daemon
            .register(service)
            .map_err(|e| CastforgeError::Configuration(format!("failed to register mDNS service: {e}")))?;

        debug!(fullname, port, "advertised cast receiver on mDNS");
        *self.fullname.lock().expect("mutex poisoned") = Some(fullname);
        Ok(())
    }

    fn withdraw(&self) -> Result<()> {
        let fullname = self.fullname.lock().expect("mutex poisoned").take();
        let Some(fullname) = fullname else {
            return Ok(());
        };

        if let Err(e) = self.daemon.unregister(&fullname) {
            warn!(error = %e, fullname, "failed to unregister mDNS service");
            return Err(CastforgeError::Configuration(format!(
                "failed to unregister mDNS service: {e}"
            )));
        }
        Ok(())
    }
}

/// No-op advertiser for tests and embedders that don't want mDNS traffic.
pub struct NullAdvertiser;

impl ServiceAdvertiser for NullAdvertiser {
    fn advertise(&self, _device_id: &str, _port: u16, _txt_overrides: &HashMap<String, String>) -> Result<()> {
        Ok(())
    }

    fn withdraw(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_with_value_replaces_default() {
        let txt = apply_overrides(default_txt("abc123"), &HashMap::from([("fn".to_string(), "MyCast".to_string())]));
        assert_eq!(txt.get("fn"), Some(&"MyCast".to_string()));
        assert_eq!(txt.get("md"), Some(&"Chromecast".to_string()));
    }

    #[test]
    fn empty_override_value_deletes_key() {
        let txt = apply_overrides(default_txt("abc123"), &HashMap::from([("rs".to_string(), "".to_string())]));
        assert!(!txt.contains_key("rs"));
    }

    #[test]
    fn null_advertiser_is_always_ok() {
        let adv = NullAdvertiser;
        assert!(adv.advertise("dev", 8009, &HashMap::new()).is_ok());
        assert!(adv.withdraw().is_ok());
    }
}
