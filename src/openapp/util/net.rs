/*
 * Copyright (C) 2024 The OpenAPP Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::openapp::util::error::{new_error, with_context, BoxError};
use std::net::{Ipv4Addr, SocketAddrV4};

/// Interface name prefixes considered when discovering the node address.
/// A prefix must be followed by at least one digit (`eth0`, `enps1`).
const INTERFACE_PREFIXES: &[&str] = &["eth", "enps"];

/// Source of the node-local address used to build local service URLs.
pub trait LocalAddressResolver: Send + Sync {
    fn local_address(&self) -> Result<String, BoxError>;
}

/// Resolver returning a fixed address; used for overrides and tests.
#[derive(Clone, Debug)]
pub struct StaticAddressResolver {
    address: String,
}

impl StaticAddressResolver {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl LocalAddressResolver for StaticAddressResolver {
    fn local_address(&self) -> Result<String, BoxError> {
        Ok(self.address.clone())
    }
}

/// Picks the first IPv4 address bound to an `eth*`/`enps*` interface.
#[derive(Clone, Debug, Default)]
pub struct InterfaceAddressResolver;

impl LocalAddressResolver for InterfaceAddressResolver {
    fn local_address(&self) -> Result<String, BoxError> {
        let addresses = nix::ifaddrs::getifaddrs()
            .map_err(|err| with_context(err, "failed to enumerate network interfaces"))?;

        let candidates = addresses.filter_map(|ifaddr| {
            let ipv4 = ifaddr
                .address
                .as_ref()
                .and_then(|address| address.as_sockaddr_in())
                .map(|sin| *SocketAddrV4::from(*sin).ip())?;
            Some((ifaddr.interface_name, ipv4))
        });

        select_interface_address(candidates)
            .map(|ip| ip.to_string())
            .ok_or_else(|| new_error("failed to find local server IP address"))
    }
}

fn interface_matches(name: &str) -> bool {
    INTERFACE_PREFIXES.iter().any(|prefix| {
        name.strip_prefix(prefix)
            .and_then(|rest| rest.chars().next())
            .is_some_and(|ch| ch.is_ascii_digit())
    })
}

/// Returns the first address whose interface name matches, preserving the
/// enumeration order reported by the kernel.
fn select_interface_address<I>(candidates: I) -> Option<Ipv4Addr>
where
    I: IntoIterator<Item = (String, Ipv4Addr)>,
{
    candidates
        .into_iter()
        .find(|(name, _)| interface_matches(name))
        .map(|(_, ip)| ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_expected_interface_names() {
        assert!(interface_matches("eth0"));
        assert!(interface_matches("eth12"));
        assert!(interface_matches("enps3"));
        assert!(!interface_matches("eth"));
        assert!(!interface_matches("lo"));
        assert!(!interface_matches("docker0"));
        assert!(!interface_matches("enp0s3"));
    }

    #[test]
    fn selects_first_matching_interface() {
        let candidates = vec![
            ("lo".to_string(), Ipv4Addr::new(127, 0, 0, 1)),
            ("docker0".to_string(), Ipv4Addr::new(172, 17, 0, 1)),
            ("eth1".to_string(), Ipv4Addr::new(192, 168, 1, 20)),
            ("eth0".to_string(), Ipv4Addr::new(10, 0, 0, 5)),
        ];
        assert_eq!(
            select_interface_address(candidates),
            Some(Ipv4Addr::new(192, 168, 1, 20))
        );
    }

    #[test]
    fn static_resolver_returns_configured_address() {
        let resolver = StaticAddressResolver::new("10.1.2.3");
        assert_eq!(resolver.local_address().unwrap(), "10.1.2.3");
    }
}
