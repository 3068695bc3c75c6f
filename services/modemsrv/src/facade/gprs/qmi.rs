//! QMI Wireless Data Service sessions

use modem_protocols::qmi::{service, wds, QmiFrame, QmiPattern, QmiProtocol, QmiRequest, QmiResponse, Tlv};
use std::net::{IpAddr, Ipv4Addr};

use super::{ActiveContext, ContextDriver, ContextSettings, DataContextRequest};
use crate::core::config::PdpType;

/// Data contexts over a WDS client
///
/// The context id doubles as the 3GPP profile index.
#[derive(Debug, Clone)]
pub struct QmiContextDriver {
    client_id: u8,
}

impl QmiContextDriver {
    pub fn new(client_id: u8) -> Self {
        Self { client_id }
    }

    pub fn client_id(&self) -> u8 {
        self.client_id
    }

    fn request(&self, message_id: u16) -> QmiRequest {
        QmiRequest::new(service::WDS, self.client_id, message_id)
    }

    fn profile_identifier(cid: u8) -> Tlv {
        Tlv::new(wds::TLV_PROFILE_IDENTIFIER, vec![wds::PROFILE_TYPE_3GPP, cid])
    }
}

/// WDS PDP type values
fn pdp_type_code(pdp_type: PdpType) -> u8 {
    match pdp_type {
        PdpType::Ip => 0,
        PdpType::Ipv6 => 2,
        PdpType::Ipv4v6 => 3,
    }
}

fn ipv4(response: &QmiResponse, tlv_type: u8) -> Option<IpAddr> {
    response.u32(tlv_type).map(|raw| IpAddr::V4(Ipv4Addr::from(raw)))
}

impl ContextDriver for QmiContextDriver {
    type Protocol = QmiProtocol;

    fn define(&self, request: &DataContextRequest) -> QmiRequest {
        self.request(wds::MODIFY_PROFILE)
            .tlv(Self::profile_identifier(request.cid))
            .tlv(Tlv::u8(wds::TLV_PDP_TYPE, pdp_type_code(request.pdp_type)))
            .tlv(Tlv::string(wds::TLV_APN_NAME, &request.apn))
    }

    fn undefine(&self, request: &DataContextRequest) -> QmiRequest {
        self.request(wds::DELETE_PROFILE)
            .tlv(Self::profile_identifier(request.cid))
    }

    fn activate(&self, request: &DataContextRequest) -> QmiRequest {
        self.request(wds::START_NETWORK_INTERFACE)
            .tlv(Tlv::u8(wds::TLV_PROFILE_INDEX_3GPP, request.cid))
    }

    fn packet_data_handle(&self, response: &QmiResponse) -> Result<Option<u32>, String> {
        response
            .u32(wds::TLV_PACKET_DATA_HANDLE)
            .map(Some)
            .ok_or_else(|| "Start Network Interface response without packet data handle".to_string())
    }

    fn fetch_settings(&self, _request: &DataContextRequest) -> QmiRequest {
        self.request(wds::GET_CURRENT_SETTINGS)
            .tlv(Tlv::u32(wds::TLV_REQUESTED_SETTINGS, wds::SETTINGS_MASK_IPV4))
    }

    fn parse_settings(&self, _request: &DataContextRequest, response: &QmiResponse) -> Result<ContextSettings, String> {
        let address = ipv4(response, wds::TLV_IPV4_ADDRESS)
            .ok_or_else(|| "current settings carry no IPv4 address".to_string())?;
        Ok(ContextSettings {
            address: Some(address),
            netmask: ipv4(response, wds::TLV_IPV4_SUBNET_MASK),
            gateway: ipv4(response, wds::TLV_IPV4_GATEWAY),
            dns: [wds::TLV_PRIMARY_DNS_V4, wds::TLV_SECONDARY_DNS_V4]
                .into_iter()
                .filter_map(|tlv| ipv4(response, tlv))
                .collect(),
        })
    }

    fn deactivate(&self, context: &ActiveContext) -> Option<QmiRequest> {
        let handle = context.packet_data_handle?;
        Some(
            self.request(wds::STOP_NETWORK_INTERFACE)
                .tlv(Tlv::u32(wds::TLV_PACKET_DATA_HANDLE, handle)),
        )
    }

    fn revocation_pattern(&self) -> QmiPattern {
        QmiPattern::indication(service::WDS, wds::PACKET_SERVICE_STATUS_IND).for_client(self.client_id)
    }

    /// One session per WDS client, so any disconnect concerns the active context
    fn is_revocation(&self, frame: &QmiFrame, _context: &ActiveContext) -> bool {
        let Ok(tlvs) = frame.tlvs() else {
            return false;
        };
        tlvs.iter()
            .find(|tlv| tlv.tlv_type == wds::TLV_CONNECTION_STATUS)
            .and_then(Tlv::as_u8)
            == Some(wds::STATUS_DISCONNECTED)
    }
}
