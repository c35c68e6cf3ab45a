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

use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use once_cell::sync::Lazy;
use tracing::error;

/// Host facts: name, address and the MAC-derived device id used as the
/// accessory's stable pairing identifier.
#[derive(Debug)]
pub struct Info {
    pub name: String,
    pub ip: String,
    pub mac: String,
    pub id: String,
}

static INFO: Lazy<Info> = Lazy::new(|| {
    use gethostname::gethostname;

    let ifaces = NetworkInterface::show();
    let hostname = gethostname();

    match (ifaces, hostname.to_str()) {
        (Ok(ifaces), Some(name)) => {
            if let Some(ni) = ifaces.into_iter().find(Info::useable_iff) {
                let mac = ni.mac_addr.unwrap().to_ascii_uppercase();

                if let Some(addr) = ni.addr.into_iter().find(|a| a.ip().is_ipv4()) {
                    let id = mac.replace(':', "");

                    return Info {
                        name: format!("{name}.local"),
                        ip: addr.ip().to_string(),
                        id,
                        mac,
                    };
                }
            }
        }

        (Err(e), _) => {
            error!("unable to find viable network interface: {e}");
        }

        (Ok(_), None) => {
            error!("unable to determine host name");
        }
    }

    panic!("unable to determine host runtime information");
});

impl Info {
    #[inline]
    #[must_use]
    pub fn bind_address(port: u16) -> String {
        format!("{}:{port}", INFO.ip.as_str())
    }

    #[inline]
    #[must_use]
    pub fn ip_as_str() -> &'static str {
        INFO.ip.as_str()
    }

    #[must_use]
    pub fn id_as_str() -> &'static str {
        INFO.id.as_str()
    }

    #[inline]
    #[must_use]
    pub fn id_as_slice() -> &'static [u8] {
        INFO.id.as_bytes()
    }

    #[must_use]
    pub fn name_as_str() -> &'static str {
        INFO.name.as_str()
    }

    #[must_use]
    pub fn mac_as_str() -> &'static str {
        INFO.mac.as_str()
    }

    #[must_use]
    pub fn useable_iff(ni: &NetworkInterface) -> bool {
        // no loopback
        !ni.name.starts_with("lo") &&
        // has a mac addr
        ni.mac_addr.is_some() &&
        // has assigned IP addrs
        !ni.addr.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::INFO;
    use crate::HostInfo;

    #[test]
    fn can_lazy_create_host_info() {
        let name = HostInfo::name_as_str();

        println!("{:#?}", *INFO);

        assert!(name.is_ascii());
        assert!(!HostInfo::id_as_str().contains(':'));
    }
}
