//! Service-catalog endpoint resolution.

use serde::Deserialize;

use updraft_domain::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogService {
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEndpoint {
    pub region: String,
    #[serde(rename = "publicURL")]
    pub public_url: String,
}

/// The first public URL for a service in a region. Failing to resolve
/// is a hard error: without an endpoint no job can run.
pub fn public_endpoint_url(
    catalog: &[CatalogService],
    service_name: &str,
    region: &str,
) -> Result<String> {
    catalog
        .iter()
        .filter(|service| service.name == service_name)
        .flat_map(|service| service.endpoints.iter())
        .find(|endpoint| endpoint.region == region)
        .map(|endpoint| endpoint.public_url.clone())
        .ok_or_else(|| Error::NoSuchEndpoint {
            service: service_name.to_owned(),
            region: region.to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<CatalogService> {
        serde_json::from_value(serde_json::json!([
            {
                "name": "cloudServersOpenStack",
                "endpoints": [
                    {"region": "DFW", "publicURL": "https://dfw.servers.example"},
                    {"region": "ORD", "publicURL": "https://ord.servers.example"}
                ]
            },
            {
                "name": "cloudLoadBalancers",
                "endpoints": [
                    {"region": "ORD", "publicURL": "https://ord.lb.example"}
                ]
            }
        ]))
        .unwrap()
    }

    #[test]
    fn resolves_by_service_and_region() {
        let url = public_endpoint_url(&catalog(), "cloudServersOpenStack", "ORD").unwrap();
        assert_eq!(url, "https://ord.servers.example");
    }

    #[test]
    fn missing_region_is_an_error() {
        let err = public_endpoint_url(&catalog(), "cloudLoadBalancers", "DFW").unwrap_err();
        assert!(matches!(err, Error::NoSuchEndpoint { .. }));
    }

    #[test]
    fn missing_service_is_an_error() {
        assert!(public_endpoint_url(&catalog(), "cloudDatabases", "ORD").is_err());
    }
}
