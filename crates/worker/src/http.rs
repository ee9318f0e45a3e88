//! reqwest-backed implementations of the upstream client traits.
//!
//! Every request carries the auth token and `Accept: application/json`;
//! responses outside the expected status list become
//! `UnexpectedResponse`, transport failures become `Transport` or
//! `Timeout` so the polling loops can classify them.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::Deserialize;

use updraft_domain::{Error, Result, ServerTemplate};

use crate::traits::{ComputeClient, LoadBalancerClient, ServerDetails};

const AUTH_HEADER: &str = "X-Auth-Token";

fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Transport(e.to_string())
    }
}

fn check_success(url: &str, status: StatusCode, expected: &[u16]) -> Result<()> {
    if expected.contains(&status.as_u16()) {
        Ok(())
    } else {
        Err(Error::UnexpectedResponse {
            url: url.to_owned(),
            status: status.as_u16(),
        })
    }
}

fn join(endpoint: &str, path: &str) -> String {
    format!("{}/{}", endpoint.trim_end_matches('/'), path)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compute
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpComputeClient {
    client: reqwest::Client,
    endpoint: String,
    auth_token: String,
}

impl HttpComputeClient {
    pub fn new(client: reqwest::Client, endpoint: String, auth_token: String) -> Self {
        Self {
            client,
            endpoint,
            auth_token,
        }
    }
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: ServerDetails,
}

#[derive(Deserialize)]
struct CreatedEnvelope {
    server: CreatedServer,
}

#[derive(Deserialize)]
struct CreatedServer {
    id: String,
}

#[async_trait]
impl ComputeClient for HttpComputeClient {
    async fn create_server(&self, template: &ServerTemplate) -> Result<String> {
        let url = join(&self.endpoint, "servers");
        let response = self
            .client
            .post(&url)
            .header(AUTH_HEADER, &self.auth_token)
            .header(ACCEPT, "application/json")
            .json(&serde_json::json!({ "server": template }))
            .send()
            .await
            .map_err(from_reqwest)?;
        check_success(&url, response.status(), &[202])?;
        let body: CreatedEnvelope = response.json().await.map_err(from_reqwest)?;
        Ok(body.server.id)
    }

    async fn server_details(&self, server_id: &str) -> Result<Option<ServerDetails>> {
        let url = join(&self.endpoint, &format!("servers/{server_id}"));
        let response = self
            .client
            .get(&url)
            .header(AUTH_HEADER, &self.auth_token)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(from_reqwest)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_success(&url, response.status(), &[200, 203])?;
        let body: ServerEnvelope = response.json().await.map_err(from_reqwest)?;
        Ok(Some(body.server))
    }

    async fn delete_server(&self, server_id: &str) -> Result<()> {
        let url = join(&self.endpoint, &format!("servers/{server_id}"));
        let response = self
            .client
            .delete(&url)
            .header(AUTH_HEADER, &self.auth_token)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(from_reqwest)?;
        check_success(&url, response.status(), &[204, 404])
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Load balancers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpLoadBalancerClient {
    client: reqwest::Client,
    endpoint: String,
    auth_token: String,
}

impl HttpLoadBalancerClient {
    pub fn new(client: reqwest::Client, endpoint: String, auth_token: String) -> Self {
        Self {
            client,
            endpoint,
            auth_token,
        }
    }
}

#[derive(Deserialize)]
struct NodesEnvelope {
    nodes: Vec<CreatedNode>,
}

#[derive(Deserialize)]
struct CreatedNode {
    id: u64,
}

#[async_trait]
impl LoadBalancerClient for HttpLoadBalancerClient {
    async fn add_node(&self, lb_id: u64, address: &str, port: u16) -> Result<u64> {
        let url = join(&self.endpoint, &format!("loadbalancers/{lb_id}/nodes"));
        let response = self
            .client
            .post(&url)
            .header(AUTH_HEADER, &self.auth_token)
            .header(ACCEPT, "application/json")
            .json(&serde_json::json!({
                "nodes": [{
                    "address": address,
                    "port": port,
                    "condition": "ENABLED",
                    "type": "PRIMARY"
                }]
            }))
            .send()
            .await
            .map_err(from_reqwest)?;
        let status = response.status();
        check_success(&url, status, &[200, 202])?;
        let body: NodesEnvelope = response.json().await.map_err(from_reqwest)?;
        body.nodes
            .first()
            .map(|node| node.id)
            .ok_or_else(|| Error::UnexpectedResponse {
                url,
                status: status.as_u16(),
            })
    }

    async fn remove_node(&self, lb_id: u64, node_id: u64) -> Result<()> {
        let url = join(
            &self.endpoint,
            &format!("loadbalancers/{lb_id}/nodes/{node_id}"),
        );
        let response = self
            .client
            .delete(&url)
            .header(AUTH_HEADER, &self.auth_token)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(from_reqwest)?;
        // 404: the node is already gone, which is the outcome we wanted.
        check_success(&url, response.status(), &[200, 202, 404])
    }
}
