// Hearth
//
// Copyright 2023 Tim Hughey
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Service-discovery advertisement.
//!
//! Thin wrapper over the multicast-DNS daemon: publishes the accessory's
//! `_hap._tcp` record and re-publishes whenever the discoverable flag or
//! the configuration revision changes.

use crate::{Config, HostInfo, Registry};
use bitflags::bitflags;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::sync::Mutex;
use tracing::info;

const SERVICE_TYPE: &str = "_hap._tcp.local.";

bitflags! {
    /// The `sf` TXT field: bit 0 set means unpaired and discoverable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u8 {
        const NOT_PAIRED = 0b0000_0001;
    }
}

#[derive(Debug)]
struct Props {
    label: String,
    device_id: String,
    port: u16,
    configuration_index: u32,
    discoverable: bool,
    registered_fullname: Option<String>,
}

#[derive(Debug)]
pub struct Advert {
    props: Mutex<Props>,
}

impl Advert {
    #[must_use]
    pub fn build(config: &Config, registry: &dyn Registry) -> Self {
        Self {
            props: Mutex::new(Props {
                label: config.name.clone(),
                device_id: registry.device_id(),
                port: config.port,
                configuration_index: config.configuration_index,
                discoverable: !registry.is_paired(),
                registered_fullname: None,
            }),
        }
    }

    pub fn register(&self, mdns: &ServiceDaemon) -> crate::Result<()> {
        let mut props = self.props.lock().unwrap();

        Self::register_locked(&mut props, mdns)
    }

    pub fn unregister(&self, mdns: &ServiceDaemon) -> crate::Result<()> {
        let mut props = self.props.lock().unwrap();

        if let Some(fullname) = props.registered_fullname.take() {
            mdns.unregister(&fullname)?;
        }

        Ok(())
    }

    /// Flip the advertised discoverable/paired flag, re-publishing the
    /// record if it is currently registered.
    pub fn set_discoverable(&self, mdns: &ServiceDaemon, discoverable: bool) -> crate::Result<()> {
        let mut props = self.props.lock().unwrap();

        if props.discoverable != discoverable {
            info!("re-publishing: discoverable now {discoverable}");
            props.discoverable = discoverable;

            Self::republish_locked(&mut props, mdns)?;
        }

        Ok(())
    }

    /// Bump the advertised configuration revision (`c#`), re-publishing
    /// the record if it is currently registered.
    pub fn set_configuration_index(
        &self,
        mdns: &ServiceDaemon,
        revision: u32,
    ) -> crate::Result<()> {
        let mut props = self.props.lock().unwrap();

        if props.configuration_index != revision {
            info!("re-publishing: configuration index now {revision}");
            props.configuration_index = revision;

            Self::republish_locked(&mut props, mdns)?;
        }

        Ok(())
    }

    fn republish_locked(props: &mut Props, mdns: &ServiceDaemon) -> crate::Result<()> {
        if let Some(fullname) = props.registered_fullname.take() {
            mdns.unregister(&fullname)?;

            return Self::register_locked(props, mdns);
        }

        Ok(())
    }

    fn register_locked(props: &mut Props, mdns: &ServiceDaemon) -> crate::Result<()> {
        let status = if props.discoverable {
            StatusFlags::NOT_PAIRED
        } else {
            StatusFlags::empty()
        };

        let sf = status.bits().to_string();
        let c_rev = props.configuration_index.to_string();

        let txt = [
            ("sf", sf.as_str()),
            ("id", props.device_id.as_str()),
            ("md", props.label.as_str()),
            ("c#", c_rev.as_str()),
            ("s#", "1"),
            ("ff", "0"),
            ("ci", "1"),
        ];

        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            props.label.as_str(),
            HostInfo::name_as_str(),
            HostInfo::ip_as_str(),
            props.port,
            &txt[..],
        )?;

        info!(
            "registering {SERVICE_TYPE} port {} c#={}",
            props.port, c_rev
        );

        props.registered_fullname = Some(service_info.get_fullname().to_string());
        mdns.register(service_info)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Advert, StatusFlags};
    use crate::{registry::Memory, Config};

    #[test]
    fn status_flags_track_pairing() {
        assert_eq!(StatusFlags::NOT_PAIRED.bits(), 1);
        assert_eq!(StatusFlags::empty().bits(), 0);
    }

    #[test]
    fn advert_tracks_registry_pairing_state() {
        let registry = Memory::new("AA:BB:CC:DD:EE:FF");
        let advert = Advert::build(&Config::default(), registry.as_ref());

        let props = advert.props.lock().unwrap();
        assert!(props.discoverable);
        assert_eq!(props.device_id, "AA:BB:CC:DD:EE:FF");
        assert!(props.registered_fullname.is_none());
    }
}
