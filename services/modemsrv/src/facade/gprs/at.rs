//! 3GPP TS 27.007 packet domain commands

use modem_protocols::at::{AtCommand, AtLine, AtProtocol, AtResponse, AtValue, CommandBuilder};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::{ActiveContext, ContextDriver, ContextSettings, DataContextRequest};

/// URC announcing packet domain events
const CGEV_PREFIX: &str = "+CGEV:";
const CGCONTRDP_PREFIX: &str = "+CGCONTRDP:";

/// Data contexts over `+CGDCONT` / `+CGACT` / `+CGCONTRDP`
#[derive(Debug, Clone, Default)]
pub struct AtContextDriver;

impl AtContextDriver {
    pub fn new() -> Self {
        Self
    }
}

impl ContextDriver for AtContextDriver {
    type Protocol = AtProtocol;

    fn define(&self, request: &DataContextRequest) -> AtCommand {
        CommandBuilder::set("+CGDCONT")
            .int(i64::from(request.cid))
            .string(request.pdp_type.as_str())
            .string(&request.apn)
            .build()
    }

    fn undefine(&self, request: &DataContextRequest) -> AtCommand {
        CommandBuilder::set("+CGDCONT").int(i64::from(request.cid)).build()
    }

    fn activate(&self, request: &DataContextRequest) -> AtCommand {
        CommandBuilder::set("+CGACT")
            .int(1)
            .int(i64::from(request.cid))
            .build()
    }

    fn fetch_settings(&self, request: &DataContextRequest) -> AtCommand {
        CommandBuilder::set("+CGCONTRDP")
            .int(i64::from(request.cid))
            .expect_own()
            .build()
    }

    /// `+CGCONTRDP: <cid>,<bearer_id>,<apn>,<local_addr and subnet_mask>,<gw_addr>,<DNS_prim_addr>,<DNS_sec_addr>`
    ///
    /// Dual-stack contexts report one line per address family.
    fn parse_settings(&self, request: &DataContextRequest, response: &AtResponse) -> Result<ContextSettings, String> {
        let mut settings = ContextSettings::default();
        let mut found = false;

        for line in response.lines_with(CGCONTRDP_PREFIX) {
            let Some(values) = line.params_after(CGCONTRDP_PREFIX) else {
                continue;
            };
            let values: Vec<AtValue> = values.collect();
            if values.first().and_then(AtValue::as_int) != Some(i64::from(request.cid)) {
                continue;
            }
            found = true;

            let text = |index: usize| values.get(index).and_then(AtValue::as_str).filter(|s| !s.is_empty());
            if let Some(local) = text(3) {
                let (address, netmask) = parse_address_and_mask(local)?;
                if settings.address.is_none() {
                    settings.address = Some(address);
                    settings.netmask = netmask;
                }
            }
            if let Some(gateway) = text(4) {
                if settings.gateway.is_none() {
                    settings.gateway = Some(parse_address_and_mask(gateway)?.0);
                }
            }
            for dns in [text(5), text(6)].into_iter().flatten() {
                settings.dns.push(parse_address_and_mask(dns)?.0);
            }
        }

        if !found {
            return Err(format!("no {} line for cid {}", CGCONTRDP_PREFIX, request.cid));
        }
        if settings.address.is_none() {
            return Err(format!("cid {} has no local address", request.cid));
        }
        Ok(settings)
    }

    fn deactivate(&self, context: &ActiveContext) -> Option<AtCommand> {
        Some(
            CommandBuilder::set("+CGACT")
                .int(0)
                .int(i64::from(context.cid))
                .build(),
        )
    }

    fn revocation_pattern(&self) -> String {
        CGEV_PREFIX.to_string()
    }

    fn is_revocation(&self, line: &AtLine, context: &ActiveContext) -> bool {
        let cid = i64::from(context.cid);

        // +CGEV: NW PDN DEACT <cid>[,<WLAN_Offload>]
        for prefix in ["+CGEV: NW PDN DEACT", "+CGEV: ME PDN DEACT"] {
            if let Some(mut params) = line.params_after(prefix) {
                return params.next_int() == Some(cid);
            }
        }

        for prefix in ["+CGEV: NW DEACT", "+CGEV: ME DEACT"] {
            if let Some(params) = line.params_after(prefix) {
                let values: Vec<AtValue> = params.collect();
                return match values.first() {
                    // <p_cid>,<cid>,<event_type>
                    Some(AtValue::Int(p_cid)) => {
                        *p_cid == cid || values.get(1).and_then(AtValue::as_int) == Some(cid)
                    },
                    // <PDP_type>,<PDP_addr>[,<cid>]; without a cid it concerns every context
                    _ => values
                        .get(2)
                        .and_then(AtValue::as_int)
                        .map_or(true, |reported| reported == cid),
                };
            }
        }

        // Detach drops every context
        line.starts_with("+CGEV: NW DETACH") || line.starts_with("+CGEV: ME DETACH")
    }
}

/// Parse an address as reported by `+CGCONTRDP`
///
/// Accepts the usual textual forms as well as the dotted-decimal octet form
/// of 27.007 where address and subnet mask are concatenated:
/// `a1.a2.a3.a4.m1.m2.m3.m4` for IPv4, 16 or 32 octets for IPv6.
pub(crate) fn parse_address_and_mask(text: &str) -> Result<(IpAddr, Option<IpAddr>), String> {
    let text = text.trim();
    if let Ok(address) = text.parse::<IpAddr>() {
        return Ok((address, None));
    }
    if let Some((address, mask)) = text.split_once(' ') {
        let address = address.parse::<IpAddr>().map_err(|e| format!("bad address '{}': {}", address, e))?;
        let mask = mask.trim().parse::<IpAddr>().map_err(|e| format!("bad subnet mask '{}': {}", mask, e))?;
        return Ok((address, Some(mask)));
    }

    let octets = text
        .split('.')
        .map(str::parse::<u8>)
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| format!("bad address '{}'", text))?;
    match octets.len() {
        8 => Ok((ipv4(&octets[..4]), Some(ipv4(&octets[4..])))),
        16 => Ok((ipv6(&octets), None)),
        32 => Ok((ipv6(&octets[..16]), Some(ipv6(&octets[16..])))),
        n => Err(format!("bad address '{}': {} octets", text, n)),
    }
}

fn ipv4(octets: &[u8]) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
}

fn ipv6(octets: &[u8]) -> IpAddr {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&octets[..16]);
    IpAddr::V6(Ipv6Addr::from(bytes))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::config::PdpType;

    fn context(cid: u8) -> ActiveContext {
        ActiveContext {
            cid,
            apn: "internet".to_string(),
            pdp_type: PdpType::Ip,
            packet_data_handle: None,
            settings: ContextSettings::default(),
        }
    }

    fn response(lines: &[&str]) -> AtResponse {
        AtResponse {
            lines: lines.iter().map(|l| AtLine::new(*l)).collect(),
            final_line: "OK".to_string(),
        }
    }

    // ========================================================================
    // Command Tests
    // ========================================================================

    #[test]
    fn test_command_texts() {
        let driver = AtContextDriver::new();
        let request = DataContextRequest::new(3, "iot.example").with_pdp_type(PdpType::Ipv4v6);

        assert_eq!(driver.define(&request).text(), "AT+CGDCONT=3,\"IPV4V6\",\"iot.example\"");
        assert_eq!(driver.undefine(&request).text(), "AT+CGDCONT=3");
        assert_eq!(driver.activate(&request).text(), "AT+CGACT=1,3");
        assert_eq!(driver.deactivate(&context(3)).unwrap().text(), "AT+CGACT=0,3");

        let fetch = driver.fetch_settings(&request);
        assert_eq!(fetch.text(), "AT+CGCONTRDP=3");
        assert!(fetch.accepts("+CGCONTRDP: 3,5"));
    }

    // ========================================================================
    // Settings Tests
    // ========================================================================

    #[test]
    fn test_parse_settings_dual_stack() {
        let driver = AtContextDriver::new();
        let request = DataContextRequest::new(1, "internet");
        let settings = driver
            .parse_settings(
                &request,
                &response(&[
                    "+CGCONTRDP: 1,5,\"internet\",\"10.1.2.3.255.255.255.252\",\"10.1.2.1\",\"1.1.1.1\"",
                    "+CGCONTRDP: 1,5,\"internet\",\"32.1.13.184.0.0.0.0.0.0.0.0.0.0.0.1\",,\"2001:db8::53\"",
                ]),
            )
            .unwrap();

        assert_eq!(settings.address, Some("10.1.2.3".parse().unwrap()));
        assert_eq!(settings.netmask, Some("255.255.255.252".parse().unwrap()));
        assert_eq!(settings.gateway, Some("10.1.2.1".parse().unwrap()));
        assert_eq!(
            settings.dns,
            vec!["1.1.1.1".parse::<IpAddr>().unwrap(), "2001:db8::53".parse().unwrap()]
        );
    }

    #[test]
    fn test_parse_settings_other_cid_only() {
        let driver = AtContextDriver::new();
        let err = driver
            .parse_settings(
                &DataContextRequest::new(1, "internet"),
                &response(&["+CGCONTRDP: 2,5,\"ims\",\"10.0.0.9\""]),
            )
            .unwrap_err();
        assert!(err.contains("no +CGCONTRDP: line for cid 1"));
    }

    #[test]
    fn test_parse_address_forms() {
        assert_eq!(
            parse_address_and_mask("192.168.0.2 255.255.0.0").unwrap(),
            (
                "192.168.0.2".parse().unwrap(),
                Some("255.255.0.0".parse().unwrap())
            )
        );
        assert_eq!(
            parse_address_and_mask("fe80::1").unwrap(),
            ("fe80::1".parse().unwrap(), None)
        );
        assert!(parse_address_and_mask("10.0.0").is_err());
        assert!(parse_address_and_mask("10.0.0.300").is_err());
    }

    // ========================================================================
    // Revocation Tests
    // ========================================================================

    #[test]
    fn test_pdn_deactivation_events() {
        let driver = AtContextDriver::new();
        let ctx = context(1);
        assert!(driver.is_revocation(&AtLine::new("+CGEV: NW PDN DEACT 1"), &ctx));
        assert!(driver.is_revocation(&AtLine::new("+CGEV: ME PDN DEACT 1,0"), &ctx));
        assert!(!driver.is_revocation(&AtLine::new("+CGEV: NW PDN DEACT 2"), &ctx));
        assert!(!driver.is_revocation(&AtLine::new("+CGEV: NW PDN ACT 1"), &ctx));
    }

    #[test]
    fn test_legacy_deactivation_events() {
        let driver = AtContextDriver::new();
        let ctx = context(1);
        assert!(driver.is_revocation(&AtLine::new("+CGEV: NW DEACT \"IP\",\"10.0.0.2\""), &ctx));
        assert!(driver.is_revocation(&AtLine::new("+CGEV: NW DEACT \"IP\",\"10.0.0.2\",1"), &ctx));
        assert!(!driver.is_revocation(&AtLine::new("+CGEV: NW DEACT \"IP\",\"10.0.0.2\",4"), &ctx));
        assert!(driver.is_revocation(&AtLine::new("+CGEV: NW DEACT 1,2,0"), &ctx));
        assert!(driver.is_revocation(&AtLine::new("+CGEV: NW DETACH"), &ctx));
    }
}
