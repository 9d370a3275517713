//! Requests arriving from child tiers on `nodes/{client}/net/{kind}`.

use serde::{Deserialize, Serialize};
use tiernet_state::NetworkConfig;

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::resolution::Selector;

/// A worker finished setting up an instance's network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployedReport {
    pub appname: String,
    pub instance_number: u32,
    #[serde(default)]
    pub nsip: Option<String>,
    #[serde(default)]
    pub nsipv6: Option<String>,
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(default)]
    pub host_port: Option<u16>,
}

impl DeployedReport {
    pub fn network(&self) -> NetworkConfig {
        NetworkConfig {
            namespace_ip: self.nsip.clone(),
            namespace_ip_v6: self.nsipv6.clone(),
            host_ip: self.host_ip.clone(),
            host_port: self.host_port,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UndeployedReport {
    pub appname: String,
    pub instance_number: u32,
}

/// Lookup by service name (`sname`) or by address (`sip`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TableQuery {
    #[serde(default)]
    pub sname: Option<String>,
    #[serde(default)]
    pub sip: Option<String>,
}

impl TableQuery {
    pub fn selector(&self) -> Option<Selector> {
        Selector::from_parts(self.sname.as_deref(), self.sip.as_deref())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubnetMethod {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "DELETE")]
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubnetRequest {
    #[serde(rename = "METHOD")]
    pub method: SubnetMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterestRemove {
    pub appname: String,
}

/// A typed child request; `kind` is the topic suffix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload")]
pub enum ChildRequest {
    #[serde(rename = "service/deployed")]
    Deployed(DeployedReport),
    #[serde(rename = "service/undeployed")]
    Undeployed(UndeployedReport),
    #[serde(rename = "tablequery/request")]
    TableQuery(TableQuery),
    #[serde(rename = "subnet")]
    Subnet(SubnetRequest),
    #[serde(rename = "interest/remove")]
    InterestRemove(InterestRemove),
}

/// Split a child topic into the client id and its typed request.
pub fn parse_topic(
    topic: &str,
    payload: serde_json::Value,
) -> DiscoveryResult<(String, ChildRequest)> {
    let malformed = || DiscoveryError::InvalidArguments(format!("unexpected topic {topic}"));
    let rest = topic.strip_prefix("nodes/").ok_or_else(malformed)?;
    let (client, kind) = rest.split_once("/net/").ok_or_else(malformed)?;
    if client.is_empty() || client.contains('/') || kind.is_empty() {
        return Err(malformed());
    }
    let request = parse_request(kind, payload)?;
    Ok((client.to_string(), request))
}

/// Build the request of the given topic suffix from its JSON payload.
pub fn parse_request(kind: &str, payload: serde_json::Value) -> DiscoveryResult<ChildRequest> {
    serde_json::from_value(serde_json::json!({ "kind": kind, "payload": payload }))
        .map_err(|e| DiscoveryError::InvalidArguments(format!("bad {kind} request: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_table_query_topic() {
        let (client, request) =
            parse_topic("nodes/w1/net/tablequery/request", json!({"sname": "svc1"})).unwrap();
        assert_eq!(client, "w1");
        let ChildRequest::TableQuery(query) = request else {
            panic!("expected a table query");
        };
        assert_eq!(query.selector(), Some(Selector::Name("svc1".to_string())));
    }

    #[test]
    fn parses_deployed_report() {
        let (_, request) = parse_topic(
            "nodes/w1/net/service/deployed",
            json!({
                "appname": "svc1",
                "instance_number": 0,
                "nsip": "10.18.0.5",
                "host_ip": "192.168.1.10",
                "host_port": 50100
            }),
        )
        .unwrap();
        let ChildRequest::Deployed(report) = request else {
            panic!("expected a deployed report");
        };
        let network = report.network();
        assert_eq!(network.namespace_ip.as_deref(), Some("10.18.0.5"));
        assert_eq!(network.namespace_ip_v6, None);
        assert_eq!(network.host_port, Some(50100));
    }

    #[test]
    fn parses_subnet_method() {
        let (_, request) = parse_topic("nodes/w2/net/subnet", json!({"METHOD": "DELETE"})).unwrap();
        assert_eq!(
            request,
            ChildRequest::Subnet(SubnetRequest {
                method: SubnetMethod::Delete
            })
        );
    }

    #[test]
    fn rejects_foreign_topics_and_payloads() {
        assert!(parse_topic("jobs/w1/net/subnet", json!({"METHOD": "GET"})).is_err());
        assert!(parse_topic("nodes//net/subnet", json!({"METHOD": "GET"})).is_err());
        assert!(parse_topic("nodes/w1/net/reboot", json!({})).is_err());
        assert!(parse_topic("nodes/w1/net/service/undeployed", json!({"appname": 3})).is_err());
    }
}
