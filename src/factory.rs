//! Factory/plugin surface: builds a grpclb policy from channel args.
//!
//! Mirrors the shape of a gRPC LB-policy plugin registry: one named factory
//! ([`POLICY_NAME`]) that validates a bag of untyped channel args and either
//! returns a usable, immutable [`GrpclbConfig`] or declines (`Ok(None)`/an
//! error), rather than panicking deep inside the session loop on a
//! malformed config.

use crate::config::GrpclbConfig;
use crate::error::{Error, Result};

/// The name this policy registers itself under in a channel's LB-policy
/// selection (the distilled spec's `"grpclb"` factory name, §6.3).
pub const POLICY_NAME: &str = "grpclb";

/// One balancer-address channel-arg entry.
///
/// Mirrors the upstream `is_balancer` tag used to distinguish balancer
/// addresses from ordinary backend addresses in a resolver result; only
/// entries with `is_balancer: true` are eligible to seed the LB channel.
#[derive(Debug, Clone)]
pub struct BalancerAddress {
    /// URI-formatted address of a balancer endpoint.
    pub address: String,
    /// Whether the resolver classified this address as a balancer address.
    pub is_balancer: bool,
}

/// The subset of channel args this factory inspects.
///
/// A real channel implementation would hand the factory an opaque,
/// much larger args bundle; this crate's concern stops at the two entries
/// the distilled spec calls out explicitly (§6.3), so only those are
/// modeled.
#[derive(Debug, Clone, Default)]
pub struct ChannelArgs {
    /// The target service name, if the args carried one.
    pub server_name: Option<String>,
    /// Every address entry present in the args' LB-addresses list.
    pub addresses: Vec<BalancerAddress>,
}

/// Construct a [`GrpclbConfig`] from channel args, per the factory
/// precondition in §6.3: the args must include a non-empty server-name arg
/// and at least one `is_balancer: true` address.
///
/// Returns `Ok(None)` (not an error) when the precondition is simply
/// unmet — i.e. this factory does not apply to this channel at all, the
/// same "no policy" outcome the distilled spec describes for a plugin
/// registry probe. Returns `Err` only once past that gate, when a present
/// but malformed value (e.g. an empty server name) fails validation.
pub fn build_config(args: &ChannelArgs) -> Result<Option<GrpclbConfig>> {
    let Some(server_name) = args.server_name.as_deref() else {
        return Ok(None);
    };

    let balancer_addresses: Vec<String> = args
        .addresses
        .iter()
        .filter(|entry| entry.is_balancer)
        .map(|entry| entry.address.clone())
        .collect();

    if balancer_addresses.is_empty() {
        return Ok(None);
    }

    GrpclbConfig::new(server_name, balancer_addresses).map(Some)
}

/// Like [`build_config`], but a present-and-empty server name is treated as
/// a caller error rather than "factory does not apply" — useful for config
/// surfaces (e.g. a parsed service-config JSON blob) where the field was
/// explicitly supplied.
pub fn build_config_strict(args: &ChannelArgs) -> Result<GrpclbConfig> {
    match &args.server_name {
        None => Err(Error::InvalidConfig(
            "grpclb factory requires a server_name arg".into(),
        )),
        Some(name) if name.is_empty() => Err(Error::InvalidConfig(
            "server_name arg must not be empty".into(),
        )),
        Some(_) => build_config(args)?.ok_or_else(|| {
            Error::InvalidConfig(
                "grpclb factory requires at least one is_balancer address".into(),
            )
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer(addr: &str) -> BalancerAddress {
        BalancerAddress {
            address: addr.to_string(),
            is_balancer: true,
        }
    }

    fn backend(addr: &str) -> BalancerAddress {
        BalancerAddress {
            address: addr.to_string(),
            is_balancer: false,
        }
    }

    #[test]
    fn declines_without_server_name() {
        let args = ChannelArgs {
            server_name: None,
            addresses: vec![balancer("http://lb:443")],
        };
        assert!(build_config(&args).unwrap().is_none());
    }

    #[test]
    fn declines_without_any_balancer_address() {
        let args = ChannelArgs {
            server_name: Some("my-service".into()),
            addresses: vec![backend("http://backend:8080")],
        };
        assert!(build_config(&args).unwrap().is_none());
    }

    #[test]
    fn builds_config_from_balancer_addresses_only() {
        let args = ChannelArgs {
            server_name: Some("my-service".into()),
            addresses: vec![backend("http://backend:8080"), balancer("http://lb:443")],
        };
        let config = build_config(&args).unwrap().unwrap();
        assert_eq!(config.service_name, "my-service");
        assert_eq!(config.balancer_addresses, vec!["http://lb:443".to_string()]);
    }

    #[test]
    fn strict_rejects_empty_server_name() {
        let args = ChannelArgs {
            server_name: Some(String::new()),
            addresses: vec![balancer("http://lb:443")],
        };
        assert!(build_config_strict(&args).is_err());
    }
}
