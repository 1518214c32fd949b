//! AsgClient — thin HTTP JSON client for the ASG management service.
//!
//! Carries conservative timeouts (connect 5 s, request 15 s) and keeps
//! redirects disabled: the service signals acceptance of a mutating POST
//! with `302 Found` and a `Location` header, which the operation helpers
//! turn into either a captured ASG name or a pollable task URL.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::error::{RemoteError, RemoteResult};

/// Per-environment client configuration.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Environment name → service base URL (no trailing slash).
    pub environments: HashMap<String, String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            environments: HashMap::new(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Result of a raw POST: status, redirect target, body.
#[derive(Debug, Clone)]
pub struct PostResponse {
    pub status: u16,
    pub location: Option<String>,
    pub body: String,
}

/// Cluster-level actions submitted to `cluster/index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterAction {
    Delete,
    Resize,
    Activate,
    Deactivate,
}

impl ClusterAction {
    /// The form field naming this action on the wire.
    pub fn form_field(&self) -> &'static str {
        match self {
            ClusterAction::Delete => "_action_delete",
            ClusterAction::Resize => "_action_resize",
            ClusterAction::Activate => "_action_activate",
            ClusterAction::Deactivate => "_action_deactivate",
        }
    }
}

impl std::fmt::Display for ClusterAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClusterAction::Delete => "delete",
            ClusterAction::Resize => "resize",
            ClusterAction::Activate => "activate",
            ClusterAction::Deactivate => "deactivate",
        };
        f.write_str(name)
    }
}

// ── Remote JSON shapes ─────────────────────────────────────────────
//
// Listings are modeled with only the fields the pipeline reads.

/// A remote task document fetched from a task URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTask {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub log: Vec<String>,
    #[serde(default)]
    pub update_time: Option<String>,
}

impl RemoteTask {
    /// Whether the remote considers this task finished.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_deref(),
            Some("completed") | Some("failed") | Some("terminated")
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroup {
    pub group_id: String,
    pub group_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroup {
    pub auto_scaling_group_name: String,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInstance {
    pub instance_id: String,
    #[serde(default)]
    pub private_ip_address: Option<String>,
    #[serde(default)]
    pub lifecycle_state: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDetails {
    #[serde(default)]
    pub instances: Vec<GroupInstance>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerInstanceState {
    pub instance_id: String,
    pub state: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerDetails {
    #[serde(default)]
    pub instance_states: Vec<LoadBalancerInstanceState>,
}

// ── Client ─────────────────────────────────────────────────────────

/// HTTP client addressing the ASG service per environment.
#[derive(Debug, Clone)]
pub struct AsgClient {
    http: reqwest::Client,
    environments: HashMap<String, String>,
}

impl AsgClient {
    pub fn new(config: RemoteConfig) -> RemoteResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            environments: config.environments,
        })
    }

    fn base_url(&self, environment: &str) -> RemoteResult<&str> {
        self.environments
            .get(environment)
            .map(String::as_str)
            .ok_or_else(|| RemoteError::UnknownEnvironment(environment.to_string()))
    }

    // ── Raw operations ─────────────────────────────────────────────

    /// GET returning status and body, non-throwing for non-2xx.
    pub async fn get_text(&self, url: &str) -> RemoteResult<(u16, String)> {
        let response = self.http.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok((status, body))
    }

    /// GET expecting a 200 JSON body of the given shape.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> RemoteResult<T> {
        let (status, body) = self.get_text(url).await?;
        if status != 200 {
            return Err(RemoteError::UnexpectedResponse {
                status,
                url: url.to_string(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| RemoteError::UnexpectedResponse {
            status,
            url: url.to_string(),
            body: format!("unparseable JSON body: {e}"),
        })
    }

    /// Form POST returning status, `Location` header, and body.
    /// Multi-valued fields are repeated, not joined.
    pub async fn post_form(
        &self,
        environment: &str,
        region: &str,
        path: &str,
        fields: &[(String, String)],
    ) -> RemoteResult<PostResponse> {
        let url = format!("{}/{region}/{path}", self.base_url(environment)?);
        debug!(%url, fields = fields.len(), "posting form");
        let response = self.http.post(&url).form(fields).send().await?;
        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;
        Ok(PostResponse {
            status,
            location,
            body,
        })
    }

    fn redirect_location(&self, url: &str, response: PostResponse) -> RemoteResult<String> {
        match (response.status, response.location) {
            (302, Some(location)) if !location.is_empty() => Ok(location),
            (status, _) => Err(RemoteError::UnexpectedResponse {
                status,
                url: url.to_string(),
                body: response.body,
            }),
        }
    }

    // ── ASG operations ─────────────────────────────────────────────

    /// Create the first ASG of a cluster. The service answers 302 with
    /// `Location: {base}/{region}/autoScaling/show/{name}`; returns the
    /// extracted name.
    pub async fn create_asg(
        &self,
        environment: &str,
        region: &str,
        fields: &[(String, String)],
    ) -> RemoteResult<String> {
        let url = format!("{}/{region}/autoScaling/save", self.base_url(environment)?);
        let response = self
            .post_form(environment, region, "autoScaling/save", fields)
            .await?;
        let status = response.status;
        let location = self.redirect_location(&url, response)?;
        match location.split_once("/autoScaling/show/") {
            Some((_, name)) => {
                let name = name.trim_end_matches(".json").trim_matches('/');
                if name.is_empty() || name.contains('/') {
                    Err(RemoteError::UnexpectedResponse {
                        status,
                        url,
                        body: format!("no ASG name extractable from Location {location}"),
                    })
                } else {
                    Ok(name.to_string())
                }
            }
            None => Err(RemoteError::UnexpectedResponse {
                status,
                url,
                body: format!("no ASG name extractable from Location {location}"),
            }),
        }
    }

    /// Create the next ASG generation for an existing cluster. Returns
    /// the task URL to poll.
    pub async fn create_next_asg(
        &self,
        environment: &str,
        region: &str,
        fields: &[(String, String)],
    ) -> RemoteResult<String> {
        let url = format!(
            "{}/{region}/cluster/createNextGroup",
            self.base_url(environment)?
        );
        let response = self
            .post_form(environment, region, "cluster/createNextGroup", fields)
            .await?;
        let location = self.redirect_location(&url, response)?;
        Ok(format!("{location}.json"))
    }

    /// Submit a cluster action (activate/deactivate/resize/delete)
    /// against a named ASG. Returns the task URL to poll.
    pub async fn cluster_action(
        &self,
        environment: &str,
        region: &str,
        action: ClusterAction,
        asg_name: &str,
        ticket: &str,
    ) -> RemoteResult<String> {
        let url = format!("{}/{region}/cluster/index", self.base_url(environment)?);
        let fields = vec![
            (action.form_field().to_string(), String::new()),
            ("name".to_string(), asg_name.to_string()),
            ("ticket".to_string(), ticket.to_string()),
        ];
        let response = self
            .post_form(environment, region, "cluster/index", &fields)
            .await?;
        let location = self.redirect_location(&url, response)?;
        debug!(%action, asg_name, "cluster action accepted");
        Ok(format!("{location}.json"))
    }

    /// Fetch a task document from its task URL.
    pub async fn fetch_task(&self, url: &str) -> RemoteResult<RemoteTask> {
        self.get_json(url).await
    }

    // ── Listings ───────────────────────────────────────────────────

    /// Security groups visible in this environment/region.
    pub async fn security_groups(
        &self,
        environment: &str,
        region: &str,
    ) -> RemoteResult<Vec<SecurityGroup>> {
        let url = format!("{}/{region}/security/list.json", self.base_url(environment)?);
        self.get_json(&url).await
    }

    /// ASG generations of a cluster, oldest first. A cluster the service
    /// has never seen yields an empty list.
    pub async fn cluster_groups(
        &self,
        environment: &str,
        region: &str,
        cluster: &str,
    ) -> RemoteResult<Vec<ClusterGroup>> {
        let url = format!(
            "{}/{region}/cluster/show/{cluster}.json",
            self.base_url(environment)?
        );
        let (status, body) = self.get_text(&url).await?;
        match status {
            200 => serde_json::from_str(&body).map_err(|e| RemoteError::UnexpectedResponse {
                status,
                url,
                body: format!("unparseable JSON body: {e}"),
            }),
            404 => Ok(Vec::new()),
            _ => Err(RemoteError::UnexpectedResponse { status, url, body }),
        }
    }

    /// Details of one ASG, including its instances.
    pub async fn group_details(
        &self,
        environment: &str,
        region: &str,
        asg_name: &str,
    ) -> RemoteResult<GroupDetails> {
        let url = format!(
            "{}/{region}/autoScaling/show/{asg_name}.json",
            self.base_url(environment)?
        );
        self.get_json(&url).await
    }

    /// Whether the named ASG exists in this environment/region.
    pub async fn asg_exists(
        &self,
        environment: &str,
        region: &str,
        asg_name: &str,
    ) -> RemoteResult<bool> {
        let url = format!(
            "{}/{region}/autoScaling/show/{asg_name}.json",
            self.base_url(environment)?
        );
        let (status, _) = self.get_text(&url).await?;
        Ok(status == 200)
    }

    /// Instance states reported by a load balancer.
    pub async fn load_balancer(
        &self,
        environment: &str,
        region: &str,
        load_balancer: &str,
    ) -> RemoteResult<LoadBalancerDetails> {
        let url = format!(
            "{}/{region}/loadBalancer/show/{load_balancer}.json",
            self.base_url(environment)?
        );
        self.get_json(&url).await
    }
}

/// Extract the ASG name announced in a next-group task log.
pub fn created_group_name(log_messages: &[String]) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"Creating auto scaling group '([^']+)'").expect("valid regex"));
    log_messages
        .iter()
        .find_map(|line| pattern.captures(line))
        .map(|captures| captures[1].to_string())
}
